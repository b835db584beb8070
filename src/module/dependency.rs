//! 模块依赖图
//!
//! 只负责边的记录，不包含任何策略：
//!
//! - `requires` / `required_by`：依赖边及其反向边，始终对称
//! - `unresolved`：尚未安装的依赖，是 `requires` 的子集
//! - `fragment_host` / `fragments_of`：片段与宿主之间的声明关系
//! - `pending`：等待索引，键为尚未安装的标识，值为等待它的模块
//!
//! 卸载模块时保留依赖者指向它的边，重新安装同一标识时这些依赖者会被重新连接；
//! 当边的两端都已移除时，所有条目随之清除。
//!
//! # 示例
//!
//! ```rust
//! use chips_runtime::module::{DependencyGraph, ModuleDescriptor, ModuleIdentity};
//!
//! let core = ModuleIdentity::parse("core@1.0.0").unwrap();
//! let editor = ModuleIdentity::parse("editor@1.0.0").unwrap();
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_module(&ModuleDescriptor::new(editor.clone()).requires(core.clone()));
//! assert!(graph.unresolved(&editor).contains(&core));
//!
//! graph.add_module(&ModuleDescriptor::new(core.clone()));
//! assert_eq!(graph.on_installed(&core), vec![editor.clone()]);
//! assert!(graph.unresolved(&editor).is_empty());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::module::metadata::{ModuleDescriptor, ModuleIdentity};

type IdSet = BTreeSet<ModuleIdentity>;

static EMPTY: IdSet = BTreeSet::new();

/// 模块依赖图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 已安装的模块
    installed: IdSet,
    /// 正向边：模块 -> 它依赖的模块
    requires: HashMap<ModuleIdentity, IdSet>,
    /// 反向边：模块 -> 依赖它的模块
    required_by: HashMap<ModuleIdentity, IdSet>,
    /// 尚未安装的依赖
    unresolved: HashMap<ModuleIdentity, IdSet>,
    /// 片段 -> 声明的宿主
    fragment_host: HashMap<ModuleIdentity, ModuleIdentity>,
    /// 宿主 -> 声明它为宿主的片段
    fragments_of: HashMap<ModuleIdentity, IdSet>,
    /// 等待索引：尚未安装的标识 -> 等待它的模块
    pending: BTreeMap<ModuleIdentity, IdSet>,
}

impl DependencyGraph {
    /// 创建一个空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模块并记录它声明的边
    ///
    /// 每个尚未安装的依赖（以及尚未安装的片段宿主）都会在等待索引中登记。
    /// 返回初始的未满足依赖集合。调用方负责拒绝重复标识。
    pub fn add_module(&mut self, descriptor: &ModuleDescriptor) -> IdSet {
        let id = descriptor.identity.clone();

        let requires: IdSet = descriptor.requires.iter().cloned().collect();
        let mut unresolved = IdSet::new();
        for dep in &requires {
            self.required_by
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
            if !self.installed.contains(dep) {
                unresolved.insert(dep.clone());
                self.pending
                    .entry(dep.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }

        if let Some(ref host) = descriptor.fragment_host {
            self.fragment_host.insert(id.clone(), host.clone());
            self.fragments_of
                .entry(host.clone())
                .or_default()
                .insert(id.clone());
            if !self.installed.contains(host) {
                self.pending
                    .entry(host.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }

        self.installed.insert(id.clone());
        self.requires.insert(id.clone(), requires);
        if unresolved.is_empty() {
            self.unresolved.remove(&id);
        } else {
            self.unresolved.insert(id, unresolved.clone());
        }
        unresolved
    }

    /// 模块安装完成
    ///
    /// 清空等待索引中该标识的条目，返回因此满足了全部依赖的模块。
    /// 等待宿主的片段在宿主安装后也会作为候选返回。
    pub fn on_installed(&mut self, id: &ModuleIdentity) -> Vec<ModuleIdentity> {
        let waiters = match self.pending.remove(id) {
            Some(waiters) => waiters,
            None => return Vec::new(),
        };

        let mut candidates = Vec::new();
        for waiter in waiters {
            let satisfied = match self.unresolved.get_mut(&waiter) {
                Some(set) => {
                    set.remove(id);
                    set.is_empty()
                }
                None => true,
            };
            if satisfied {
                self.unresolved.remove(&waiter);
                candidates.push(waiter);
            }
        }
        candidates
    }

    /// 移除模块
    ///
    /// 删除它声明的边；每个依赖者重新把它记为未满足依赖并进入等待索引，
    /// 声明它为宿主的片段同样进入等待索引。返回受影响的依赖者和片段。
    pub fn remove_module(&mut self, id: &ModuleIdentity) -> Vec<ModuleIdentity> {
        if !self.installed.remove(id) {
            return Vec::new();
        }

        for dep in self.requires.remove(id).unwrap_or_default() {
            Self::detach(&mut self.required_by, &dep, id);
            Self::detach_pending(&mut self.pending, &dep, id);
        }
        self.unresolved.remove(id);

        if let Some(host) = self.fragment_host.remove(id) {
            Self::detach(&mut self.fragments_of, &host, id);
            Self::detach_pending(&mut self.pending, &host, id);
        }

        let mut affected = Vec::new();
        for dependent in self.required_by.get(id).cloned().unwrap_or_default() {
            self.unresolved
                .entry(dependent.clone())
                .or_default()
                .insert(id.clone());
            self.pending
                .entry(id.clone())
                .or_default()
                .insert(dependent.clone());
            affected.push(dependent);
        }
        for fragment in self.fragments_of.get(id).cloned().unwrap_or_default() {
            self.pending
                .entry(id.clone())
                .or_default()
                .insert(fragment.clone());
            if !affected.contains(&fragment) {
                affected.push(fragment);
            }
        }
        affected
    }

    fn detach(map: &mut HashMap<ModuleIdentity, IdSet>, key: &ModuleIdentity, id: &ModuleIdentity) {
        if let Some(set) = map.get_mut(key) {
            set.remove(id);
            if set.is_empty() {
                map.remove(key);
            }
        }
    }

    fn detach_pending(
        pending: &mut BTreeMap<ModuleIdentity, IdSet>,
        key: &ModuleIdentity,
        id: &ModuleIdentity,
    ) {
        if let Some(set) = pending.get_mut(key) {
            set.remove(id);
            if set.is_empty() {
                pending.remove(key);
            }
        }
    }

    // ==================== 查询 ====================

    /// 模块是否已安装
    pub fn contains(&self, id: &ModuleIdentity) -> bool {
        self.installed.contains(id)
    }

    /// 已安装模块数量
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    /// 是否没有任何模块
    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    /// 所有已安装模块
    pub fn modules(&self) -> impl Iterator<Item = &ModuleIdentity> {
        self.installed.iter()
    }

    /// 模块声明的依赖
    pub fn requires(&self, id: &ModuleIdentity) -> &IdSet {
        self.requires.get(id).unwrap_or(&EMPTY)
    }

    /// 直接依赖该模块的已安装模块
    pub fn dependents(&self, id: &ModuleIdentity) -> &IdSet {
        self.required_by.get(id).unwrap_or(&EMPTY)
    }

    /// 尚未安装的依赖
    pub fn unresolved(&self, id: &ModuleIdentity) -> &IdSet {
        self.unresolved.get(id).unwrap_or(&EMPTY)
    }

    /// 声明的片段宿主
    pub fn fragment_host(&self, id: &ModuleIdentity) -> Option<&ModuleIdentity> {
        self.fragment_host.get(id)
    }

    /// 声明该模块为宿主的已安装片段
    pub fn fragments_of(&self, id: &ModuleIdentity) -> &IdSet {
        self.fragments_of.get(id).unwrap_or(&EMPTY)
    }

    /// 等待索引
    pub fn pending(&self) -> &BTreeMap<ModuleIdentity, IdSet> {
        &self.pending
    }

    /// 所有传递依赖者（广度优先，不含自身）
    pub fn transitive_dependents(&self, id: &ModuleIdentity) -> Vec<ModuleIdentity> {
        let mut visited = IdSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&ModuleIdentity> = self.dependents(id).iter().collect();

        while let Some(current) = queue.pop_front() {
            if current == id || !visited.insert(current.clone()) {
                continue;
            }
            order.push(current.clone());
            queue.extend(self.dependents(current).iter());
        }
        order
    }

    /// 检查图的不变式
    ///
    /// 依赖边与反向边对称，未满足依赖是声明依赖的子集，
    /// 等待索引的键都尚未安装。
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for (id, deps) in &self.requires {
            for dep in deps {
                if !self.dependents(dep).contains(id) {
                    return Err(format!("缺少反向边 {} <- {}", dep, id));
                }
            }
        }
        for (id, dependents) in &self.required_by {
            for dependent in dependents {
                if !self.requires(dependent).contains(id) {
                    return Err(format!("多余的反向边 {} <- {}", id, dependent));
                }
            }
        }
        for (id, missing) in &self.unresolved {
            if !missing.is_subset(self.requires(id)) {
                return Err(format!("{} 的未满足依赖不是声明依赖的子集", id));
            }
            if let Some(dep) = missing.iter().find(|d| self.installed.contains(*d)) {
                return Err(format!("{} 的依赖 {} 已安装但仍未满足", id, dep));
            }
        }
        if let Some(key) = self.pending.keys().find(|k| self.installed.contains(*k)) {
            return Err(format!("等待索引保留了已安装的标识 {}", key));
        }
        Ok(())
    }
}
