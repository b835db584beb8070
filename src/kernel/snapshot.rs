//! 只读视图与快照
//!
//! 编排循环只把一次变更涉及的条目写入共享视图：模块信息按标识整条替换，
//! 服务和扩展按目标整条替换。读取方逐条读取，永远不会阻塞编排循环，
//! 也不会看到半完成的模块或接口。启动顺序只在拓扑变化后作废，下次需要时重算。
//!
//! 需要一份整体副本时用 [`RuntimeView::snapshot`] 现取。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::module::extensions::Extension;
use crate::module::metadata::{LifecycleState, ModuleIdentity, ModuleInfo};
use crate::module::services::ServiceRegistration;

/// 共享视图
pub type SharedView = Arc<RuntimeView>;

/// 运行时视图
#[derive(Debug, Default)]
pub struct RuntimeView {
    modules: DashMap<ModuleIdentity, Arc<ModuleInfo>>,
    /// 接口名 -> 按优先级降序排列的注册
    services: DashMap<String, Arc<[ServiceRegistration]>>,
    /// 尚未安装的标识 -> 等待它的模块
    pending: DashMap<ModuleIdentity, Vec<ModuleIdentity>>,
    /// 目标 -> 已登记的贡献
    extensions: DashMap<ModuleIdentity, Arc<[Extension]>>,
    /// 目标 -> 等待中的贡献
    pending_extensions: DashMap<ModuleIdentity, Arc<[Extension]>>,
    start_order: ArcSwapOption<Vec<ModuleIdentity>>,
    generation: AtomicU64,
}

impl RuntimeView {
    pub fn shared() -> SharedView {
        Arc::new(Self::default())
    }

    // ==================== 读取 ====================

    /// 版本号，每次发布递增
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn module(&self, id: &ModuleIdentity) -> Option<Arc<ModuleInfo>> {
        self.modules.get(id).map(|entry| entry.value().clone())
    }

    pub fn state_of(&self, id: &ModuleIdentity) -> Option<LifecycleState> {
        self.modules.get(id).map(|entry| entry.state)
    }

    /// 所有已安装模块，按标识排序
    pub fn modules(&self) -> Vec<Arc<ModuleInfo>> {
        let mut modules: Vec<Arc<ModuleInfo>> =
            self.modules.iter().map(|entry| entry.value().clone()).collect();
        modules.sort_by(|a, b| a.identity.cmp(&b.identity));
        modules
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// 查找最佳匹配
    pub fn lookup_service(&self, interface: &str) -> Option<ServiceRegistration> {
        self.services
            .get(interface)
            .and_then(|entry| entry.value().first().cloned())
    }

    /// 查找全部匹配，按优先级降序
    pub fn lookup_services(&self, interface: &str) -> Vec<ServiceRegistration> {
        self.services
            .get(interface)
            .map(|entry| entry.value().to_vec())
            .unwrap_or_default()
    }

    /// 已注册服务总数
    pub fn service_count(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn pending(&self) -> BTreeMap<ModuleIdentity, Vec<ModuleIdentity>> {
        self.pending
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 目标扩展点上已登记的贡献，按提交顺序
    pub fn extensions(&self, target: &ModuleIdentity, point: &str) -> Vec<Extension> {
        self.extensions
            .get(target)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|e| e.point == point)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 等待目标解析的贡献：目标 -> 贡献
    pub fn pending_extensions(&self) -> BTreeMap<ModuleIdentity, Vec<Extension>> {
        self.pending_extensions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_vec()))
            .collect()
    }

    /// 已计算的启动顺序，拓扑变化后为空
    pub fn cached_start_order(&self) -> Option<Arc<Vec<ModuleIdentity>>> {
        self.start_order.load_full()
    }

    /// 现取一份整体副本
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let generation = self.generation();
        RuntimeSnapshot {
            generation,
            modules: self
                .modules
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().as_ref().clone()))
                .collect(),
            services: self
                .services
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().to_vec()))
                .collect(),
            pending: self.pending(),
            pending_extensions: self.pending_extensions(),
            captured_at: Utc::now(),
        }
    }

    // ==================== 写入（仅编排循环） ====================

    /// 替换或移除一个模块条目
    pub(crate) fn put_module(&self, id: &ModuleIdentity, info: Option<ModuleInfo>) {
        match info {
            Some(info) => {
                self.modules.insert(id.clone(), Arc::new(info));
            }
            None => {
                self.modules.remove(id);
            }
        }
    }

    /// 替换一个接口的注册列表
    pub(crate) fn put_services(&self, interface: &str, registrations: &[ServiceRegistration]) {
        if registrations.is_empty() {
            self.services.remove(interface);
        } else {
            self.services
                .insert(interface.to_string(), Arc::from(registrations));
        }
    }

    /// 替换一个等待索引条目
    pub(crate) fn put_pending(&self, id: &ModuleIdentity, waiters: Option<&BTreeSet<ModuleIdentity>>) {
        match waiters {
            Some(waiters) if !waiters.is_empty() => {
                self.pending
                    .insert(id.clone(), waiters.iter().cloned().collect());
            }
            _ => {
                self.pending.remove(id);
            }
        }
    }

    /// 替换一个目标的贡献
    pub(crate) fn put_extensions(
        &self,
        target: &ModuleIdentity,
        registered: &[Extension],
        pending: &[Extension],
    ) {
        for (map, list) in [
            (&self.extensions, registered),
            (&self.pending_extensions, pending),
        ] {
            if list.is_empty() {
                map.remove(target);
            } else {
                map.insert(target.clone(), Arc::from(list));
            }
        }
    }

    pub(crate) fn set_start_order(&self, order: Option<Arc<Vec<ModuleIdentity>>>) {
        self.start_order.store(order);
    }

    /// 一批条目写完后递增版本号
    pub(crate) fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// 运行时快照
///
/// 由 [`RuntimeView::snapshot`] 生成的独立副本，之后的变更不会影响它。
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    /// 生成时视图的版本号
    pub generation: u64,
    /// 所有已安装模块
    pub modules: BTreeMap<ModuleIdentity, ModuleInfo>,
    /// 接口名 -> 按优先级降序排列的注册
    pub services: BTreeMap<String, Vec<ServiceRegistration>>,
    /// 等待索引：尚未安装的标识 -> 等待它的模块
    pub pending: BTreeMap<ModuleIdentity, Vec<ModuleIdentity>>,
    /// 等待目标解析的贡献
    pub pending_extensions: BTreeMap<ModuleIdentity, Vec<Extension>>,
    /// 生成时间
    pub captured_at: DateTime<Utc>,
}

impl RuntimeSnapshot {
    pub fn module(&self, id: &ModuleIdentity) -> Option<&ModuleInfo> {
        self.modules.get(id)
    }

    pub fn state_of(&self, id: &ModuleIdentity) -> Option<LifecycleState> {
        self.modules.get(id).map(|info| info.state)
    }

    /// 处于指定状态的模块
    pub fn modules_in(&self, state: LifecycleState) -> Vec<ModuleIdentity> {
        self.modules
            .values()
            .filter(|info| info.state == state)
            .map(|info| info.identity.clone())
            .collect()
    }

    /// 最近一次启动失败或超时的模块
    pub fn start_failures(&self) -> Vec<ModuleInfo> {
        self.modules
            .values()
            .filter(|info| info.start_failed)
            .cloned()
            .collect()
    }

    pub fn lookup_service(&self, interface: &str) -> Option<&ServiceRegistration> {
        self.services.get(interface).and_then(|list| list.first())
    }

    pub fn lookup_services(&self, interface: &str) -> &[ServiceRegistration] {
        self.services
            .get(interface)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 已注册服务总数
    pub fn service_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::services::{ServiceProperties, ServiceRegistry};

    fn id(name: &str) -> ModuleIdentity {
        ModuleIdentity::new(name, "1.0.0").unwrap()
    }

    fn info(name: &str, state: LifecycleState) -> ModuleInfo {
        let now = Utc::now();
        ModuleInfo {
            identity: id(name),
            state,
            requires: Vec::new(),
            missing: Vec::new(),
            dependents: Vec::new(),
            fragment_host: None,
            attached_to: None,
            hosted_fragments: Vec::new(),
            auto_start: true,
            location: None,
            last_error: None,
            start_failed: false,
            service_count: 0,
            installed_at: now,
            state_changed_at: now,
        }
    }

    #[test]
    fn test_entries_replaced_individually() {
        let view = RuntimeView::default();
        view.put_module(&id("b"), Some(info("b", LifecycleState::Installed)));
        view.put_module(&id("a"), Some(info("a", LifecycleState::Resolved)));
        assert_eq!(view.bump(), 1);

        let before = view.module(&id("a")).unwrap();
        view.put_module(&id("b"), Some(info("b", LifecycleState::Resolved)));
        view.bump();

        // 未涉及的条目保持同一份
        assert!(Arc::ptr_eq(&before, &view.module(&id("a")).unwrap()));
        assert_eq!(view.state_of(&id("b")), Some(LifecycleState::Resolved));
        let names: Vec<_> = view.modules().iter().map(|m| m.identity.clone()).collect();
        assert_eq!(names, vec![id("a"), id("b")]);

        view.put_module(&id("a"), None);
        assert_eq!(view.module_count(), 1);
        assert_eq!(view.generation(), 2);
    }

    #[test]
    fn test_services_and_pending() {
        let view = RuntimeView::default();
        let mut registry = ServiceRegistry::new();
        registry.register(id("a"), "storage", ServiceProperties::new());
        registry.register(id("b"), "storage", ServiceProperties::new());
        view.put_services("storage", registry.lookup_all("storage"));

        assert_eq!(view.lookup_service("storage").unwrap().owner, id("b"));
        assert_eq!(view.lookup_services("storage").len(), 2);
        assert_eq!(view.service_count(), 2);

        view.put_services("storage", &[]);
        assert!(view.lookup_service("storage").is_none());

        let waiters: BTreeSet<ModuleIdentity> = [id("b")].into_iter().collect();
        view.put_pending(&id("a"), Some(&waiters));
        assert_eq!(view.pending()[&id("a")], vec![id("b")]);
        view.put_pending(&id("a"), None);
        assert_eq!(view.pending_count(), 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let view = RuntimeView::default();
        view.put_module(&id("a"), Some(info("a", LifecycleState::Active)));
        view.bump();
        let snapshot = view.snapshot();

        view.put_module(&id("a"), Some(info("a", LifecycleState::Resolved)));
        view.bump();
        assert_eq!(snapshot.state_of(&id("a")), Some(LifecycleState::Active));
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.modules_in(LifecycleState::Active), vec![id("a")]);
    }
}
