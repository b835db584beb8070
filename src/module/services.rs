//! 服务注册表
//!
//! 以接口名为键的能力目录。同一接口有多个提供者时，先比较显式排名
//! （`service.ranking` 属性，默认 0），再比较注册序号，序号大者优先，
//! 即默认后注册者优先。
//!
//! 注册表本身不检查所有者状态；所有者必须处于 `Starting` / `Active`
//! 的规则由编排循环在写入前执行。编排循环按接口把变更写入共享视图，
//! 读取方不会阻塞写入。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::module::metadata::ModuleIdentity;

/// 显式排名属性名
pub const SERVICE_RANKING: &str = "service.ranking";

/// 服务属性
pub type ServiceProperties = HashMap<String, serde_json::Value>;

/// 服务注册句柄（即注册序号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceHandle(pub u64);

impl ServiceHandle {
    /// 注册序号
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc#{}", self.0)
    }
}

/// 服务注册
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// 注册句柄
    pub handle: ServiceHandle,
    /// 接口名
    pub interface: String,
    /// 属性
    pub properties: ServiceProperties,
    /// 所有者模块
    pub owner: ModuleIdentity,
    /// 显式排名
    pub ranking: i64,
    /// 注册时间
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    /// 注册序号
    pub fn sequence(&self) -> u64 {
        self.handle.0
    }

    /// 读取属性
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// 排序键：排名高者在前，同排名时序号大者在前
    fn precedes(&self, other: &ServiceRegistration) -> bool {
        (self.ranking, self.handle) > (other.ranking, other.handle)
    }
}

/// 服务注册表
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    /// 接口名 -> 按优先级降序排列的注册
    by_interface: HashMap<String, Vec<ServiceRegistration>>,
    /// 句柄 -> 接口名
    by_handle: BTreeMap<ServiceHandle, String>,
    /// 所有者 -> 句柄
    by_owner: HashMap<ModuleIdentity, BTreeSet<ServiceHandle>>,
    /// 下一个序号
    next_sequence: u64,
}

impl ServiceRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            ..Self::default()
        }
    }

    /// 注册服务，返回新句柄
    pub fn register(
        &mut self,
        owner: ModuleIdentity,
        interface: impl Into<String>,
        properties: ServiceProperties,
    ) -> ServiceRegistration {
        let interface = interface.into();
        let handle = ServiceHandle(self.next_sequence.max(1));
        self.next_sequence = handle.0 + 1;

        let ranking = properties
            .get(SERVICE_RANKING)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);

        let registration = ServiceRegistration {
            handle,
            interface: interface.clone(),
            properties,
            owner,
            ranking,
            registered_at: Utc::now(),
        };

        let list = self.by_interface.entry(interface.clone()).or_default();
        let position = list
            .iter()
            .position(|existing| registration.precedes(existing))
            .unwrap_or(list.len());
        list.insert(position, registration.clone());
        self.by_handle.insert(handle, interface);
        self.by_owner
            .entry(registration.owner.clone())
            .or_default()
            .insert(handle);

        registration
    }

    /// 注销服务
    pub fn unregister(&mut self, handle: ServiceHandle) -> Option<ServiceRegistration> {
        let interface = self.by_handle.remove(&handle)?;
        let list = self.by_interface.get_mut(&interface)?;
        let position = list.iter().position(|r| r.handle == handle)?;
        let removed = list.remove(position);
        if list.is_empty() {
            self.by_interface.remove(&interface);
        }
        if let Some(handles) = self.by_owner.get_mut(&removed.owner) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.by_owner.remove(&removed.owner);
            }
        }
        Some(removed)
    }

    /// 注销某个模块的全部服务，按注册顺序返回
    pub fn unregister_all(&mut self, owner: &ModuleIdentity) -> Vec<ServiceRegistration> {
        self.services_of(owner)
            .into_iter()
            .filter_map(|r| self.unregister(r.handle))
            .collect()
    }

    /// 查找最佳匹配
    pub fn lookup(&self, interface: &str) -> Option<&ServiceRegistration> {
        self.by_interface.get(interface).and_then(|list| list.first())
    }

    /// 查找全部匹配，按优先级降序
    pub fn lookup_all(&self, interface: &str) -> &[ServiceRegistration] {
        self.by_interface
            .get(interface)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 按句柄查找
    pub fn get(&self, handle: ServiceHandle) -> Option<&ServiceRegistration> {
        let interface = self.by_handle.get(&handle)?;
        self.by_interface
            .get(interface)?
            .iter()
            .find(|r| r.handle == handle)
    }

    /// 某个模块持有的服务，按注册顺序
    pub fn services_of(&self, owner: &ModuleIdentity) -> Vec<ServiceRegistration> {
        self.by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|handle| self.get(*handle))
            .cloned()
            .collect()
    }

    /// 某个模块持有的服务数量
    pub fn count_of(&self, owner: &ModuleIdentity) -> usize {
        self.by_owner.get(owner).map_or(0, BTreeSet::len)
    }

    /// 所有已注册的接口名（排序）
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_interface.keys().cloned().collect();
        names.sort();
        names
    }

    /// 注册总数
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}
