//! 生命周期控制器
//!
//! 持有每个模块的状态机，并在依赖图上编排启动与停止顺序：
//!
//! ```text
//! INSTALLED → RESOLVED → STARTING → ACTIVE → STOPPING → RESOLVED → UNINSTALLED
//!                            │                   │
//!                            └──── 超时 ────────→ FAILED
//! ```
//!
//! 控制器本身不执行钩子，也不写共享视图，这些动作通过 [`HookDriver`] 交给编排循环。
//! 控制器记录每次变更涉及的模块，[`LifecycleController::flush`] 只把这些模块交给驱动发布。
//! 所有方法都只在编排循环中调用，因此不需要任何锁。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::kernel::event::EventKind;
use crate::module::activator::{ModuleActivator, NoopActivator};
use crate::module::dependency::DependencyGraph;
use crate::module::metadata::{LifecycleState, ModuleDescriptor, ModuleIdentity, ModuleInfo};
use crate::module::services::ServiceRegistry;
use crate::module::source::ModuleSource;
use crate::utils::{Result, RuntimeError};

/// 模块表
pub type ModuleTable = BTreeMap<ModuleIdentity, Module>;

/// 已安装的模块
pub struct Module {
    descriptor: ModuleDescriptor,
    state: LifecycleState,
    source: Box<dyn ModuleSource>,
    activator: Arc<dyn ModuleActivator>,
    hosted_fragments: BTreeSet<ModuleIdentity>,
    host: Option<ModuleIdentity>,
    location: Option<String>,
    last_error: Option<String>,
    start_failed: bool,
    /// 每次调用钩子递增，旧钩子上下文据此失效
    hook_epoch: u64,
    installed_at: DateTime<Utc>,
    state_changed_at: DateTime<Utc>,
}

impl Module {
    /// 从来源创建模块，初始状态为 `Installed`
    pub fn new(source: Box<dyn ModuleSource>) -> Self {
        let now = Utc::now();
        let activator = source
            .activator()
            .unwrap_or_else(|| Arc::new(NoopActivator));
        Self {
            descriptor: source.descriptor().clone(),
            state: LifecycleState::Installed,
            location: source.location(),
            source,
            activator,
            hosted_fragments: BTreeSet::new(),
            host: None,
            last_error: None,
            start_failed: false,
            hook_epoch: 0,
            installed_at: now,
            state_changed_at: now,
        }
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.descriptor.identity
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn source(&self) -> &dyn ModuleSource {
        self.source.as_ref()
    }

    pub fn is_fragment(&self) -> bool {
        self.descriptor.is_fragment()
    }

    /// 已附着的宿主
    pub fn host(&self) -> Option<&ModuleIdentity> {
        self.host.as_ref()
    }

    /// 已附着到本模块的片段
    pub fn hosted_fragments(&self) -> &BTreeSet<ModuleIdentity> {
        &self.hosted_fragments
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 最近一次启动是否失败或超时
    pub fn start_failed(&self) -> bool {
        self.start_failed
    }

    /// 最近一次钩子调用的序号
    pub fn hook_epoch(&self) -> u64 {
        self.hook_epoch
    }

    /// 生成查询结果
    pub fn info(&self, graph: &DependencyGraph, services: &ServiceRegistry) -> ModuleInfo {
        let id = self.identity();
        ModuleInfo {
            identity: id.clone(),
            state: self.state,
            requires: self.descriptor.requires.clone(),
            missing: graph.unresolved(id).iter().cloned().collect(),
            dependents: graph.dependents(id).iter().cloned().collect(),
            fragment_host: self.descriptor.fragment_host.clone(),
            attached_to: self.host.clone(),
            hosted_fragments: self.hosted_fragments.iter().cloned().collect(),
            auto_start: self.descriptor.auto_start,
            location: self.location.clone(),
            last_error: self.last_error.clone(),
            start_failed: self.start_failed,
            service_count: services.count_of(id),
            installed_at: self.installed_at,
            state_changed_at: self.state_changed_at,
        }
    }

    fn set_state(&mut self, state: LifecycleState) {
        debug!(module_id = %self.identity(), from = %self.state, to = %state, "状态变化");
        self.state = state;
        self.state_changed_at = Utc::now();
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("identity", &self.identity().to_string())
            .field("state", &self.state)
            .field("host", &self.host)
            .field("hosted_fragments", &self.hosted_fragments)
            .finish()
    }
}

// ============================================================================
// 钩子驱动
// ============================================================================

/// 钩子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Start,
    Stop,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Start => "start",
            HookKind::Stop => "stop",
        }
    }
}

/// 一次钩子调用
#[derive(Clone)]
pub struct HookInvocation {
    pub module: ModuleIdentity,
    pub kind: HookKind,
    pub activator: Arc<dyn ModuleActivator>,
    pub timeout: Duration,
    /// 本次调用的序号，与模块当前序号不同的上下文不能再注册服务
    pub epoch: u64,
}

/// 钩子执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// 正常返回
    Completed,
    /// 返回错误或 panic
    Failed(String),
    /// 超时，附带实际生效的超时时间
    TimedOut(Duration),
}

/// 钩子驱动
///
/// 编排循环实现该接口：在独立任务中执行钩子，在等待期间继续处理服务注册，
/// 并负责服务撤销、视图发布和事件发送。
#[async_trait]
pub trait HookDriver: Send {
    /// 执行钩子并等待结果
    async fn run_hook(
        &mut self,
        invocation: HookInvocation,
        modules: &ModuleTable,
        graph: &DependencyGraph,
    ) -> HookOutcome;

    /// 同步撤销模块持有的全部服务，返回撤销数量
    fn revoke_services(&mut self, owner: &ModuleIdentity) -> usize;

    /// 把涉及的模块写入只读视图
    ///
    /// `changed` 可以包含尚未安装或已移除的标识，它们的条目被删除。
    fn publish(
        &mut self,
        changed: &BTreeSet<ModuleIdentity>,
        modules: &ModuleTable,
        graph: &DependencyGraph,
    );

    /// 发送事件
    fn emit(&self, event: EventKind);
}

// ============================================================================
// 批量操作报告
// ============================================================================

/// 批量启动 / 停止的结果
///
/// 单个模块的失败不会中断批次，而是按模块收集在 `failures` 中。
#[derive(Debug, Default)]
pub struct BatchReport {
    /// 成功启动或停止的模块，按执行顺序
    pub completed: Vec<ModuleIdentity>,
    /// 因依赖未就绪、处于 FAILED 或仍有活跃依赖者而跳过的模块
    pub skipped: Vec<ModuleIdentity>,
    /// 失败的模块及原因
    pub failures: BTreeMap<ModuleIdentity, RuntimeError>,
}

impl BatchReport {
    /// 是否全部成功
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// 失败的模块
    pub fn failed(&self) -> Vec<&ModuleIdentity> {
        self.failures.keys().collect()
    }
}

// ============================================================================
// 生命周期控制器
// ============================================================================

/// 启动记录：按启动先后排列，按标识删除
#[derive(Debug, Default)]
struct StartLog {
    next: u64,
    by_sequence: BTreeMap<u64, ModuleIdentity>,
    sequence_of: HashMap<ModuleIdentity, u64>,
}

impl StartLog {
    fn push(&mut self, id: &ModuleIdentity) {
        self.remove(id);
        self.next += 1;
        self.by_sequence.insert(self.next, id.clone());
        self.sequence_of.insert(id.clone(), self.next);
    }

    fn remove(&mut self, id: &ModuleIdentity) {
        if let Some(sequence) = self.sequence_of.remove(id) {
            self.by_sequence.remove(&sequence);
        }
    }

    fn sequence(&self, id: &ModuleIdentity) -> Option<u64> {
        self.sequence_of.get(id).copied()
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = &ModuleIdentity> {
        self.by_sequence.values()
    }
}

/// 生命周期控制器
#[derive(Debug)]
pub struct LifecycleController {
    modules: ModuleTable,
    /// 成功启动的顺序，停止时逆序执行
    start_log: StartLog,
    /// 上次发布之后变化过的模块
    changed: BTreeSet<ModuleIdentity>,
    default_timeout: Duration,
}

impl LifecycleController {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            modules: ModuleTable::new(),
            start_log: StartLog::default(),
            changed: BTreeSet::new(),
            default_timeout,
        }
    }

    // ==================== 查询 ====================

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    pub fn get(&self, id: &ModuleIdentity) -> Option<&Module> {
        self.modules.get(id)
    }

    pub fn contains(&self, id: &ModuleIdentity) -> bool {
        self.modules.contains_key(id)
    }

    pub fn state_of(&self, id: &ModuleIdentity) -> Option<LifecycleState> {
        self.modules.get(id).map(Module::state)
    }

    /// 最近一次成功启动的顺序
    pub fn start_log(&self) -> Vec<ModuleIdentity> {
        self.start_log.iter().cloned().collect()
    }

    /// 当前处于 ACTIVE 的模块，按启动顺序
    pub fn active_modules(&self) -> Vec<ModuleIdentity> {
        self.start_log
            .iter()
            .filter(|id| self.state_of(id) == Some(LifecycleState::Active))
            .cloned()
            .collect()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 上次发布之后变化过的模块
    pub fn pending_changes(&self) -> &BTreeSet<ModuleIdentity> {
        &self.changed
    }

    /// 依赖是否可用：处于 ACTIVE，或是一个宿主处于 ACTIVE 的片段
    pub fn is_available(&self, id: &ModuleIdentity) -> bool {
        match self.modules.get(id) {
            Some(m) if m.state == LifecycleState::Active => true,
            Some(m) if m.is_fragment() && m.state.is_resolved() => m
                .host
                .as_ref()
                .map_or(false, |h| self.state_of(h) == Some(LifecycleState::Active)),
            _ => false,
        }
    }

    // ==================== 变更记录 ====================

    /// 记录一个需要重新发布的标识
    pub fn touch(&mut self, id: &ModuleIdentity) {
        if !self.changed.contains(id) {
            self.changed.insert(id.clone());
        }
    }

    /// 记录模块及其在依赖图上的直接邻居
    ///
    /// 安装和卸载会改变邻居的依赖者列表、缺失依赖和等待索引条目。
    pub fn touch_neighbourhood(&mut self, id: &ModuleIdentity, graph: &DependencyGraph) {
        self.touch(id);
        let neighbours: Vec<ModuleIdentity> = graph
            .requires(id)
            .iter()
            .chain(graph.dependents(id))
            .chain(graph.fragments_of(id))
            .chain(graph.fragment_host(id))
            .cloned()
            .collect();
        for neighbour in &neighbours {
            self.touch(neighbour);
        }
    }

    /// 把记录的变更交给驱动发布
    pub fn flush<D: HookDriver>(&mut self, graph: &DependencyGraph, driver: &mut D) {
        let changed = std::mem::take(&mut self.changed);
        driver.publish(&changed, &self.modules, graph);
    }

    fn module_mut(&mut self, id: &ModuleIdentity) -> Option<&mut Module> {
        let module = self.modules.get_mut(id)?;
        if !self.changed.contains(id) {
            self.changed.insert(id.clone());
        }
        Some(module)
    }

    /// 递增钩子序号并返回新值
    fn next_epoch(&mut self, id: &ModuleIdentity) -> u64 {
        match self.module_mut(id) {
            Some(module) => {
                module.hook_epoch += 1;
                module.hook_epoch
            }
            None => 0,
        }
    }

    // ==================== 安装与解析 ====================

    /// 加入新安装的模块
    pub fn insert(&mut self, module: Module) {
        let id = module.identity().clone();
        self.touch(&id);
        self.modules.insert(id, module);
    }

    /// `Installed → Resolved`
    pub fn mark_resolved(&mut self, id: &ModuleIdentity) -> bool {
        if self.state_of(id) != Some(LifecycleState::Installed) {
            return false;
        }
        if let Some(module) = self.module_mut(id) {
            module.set_state(LifecycleState::Resolved);
        }
        true
    }

    /// 把片段附着到宿主
    pub fn attach_fragment(&mut self, fragment: &ModuleIdentity, host: &ModuleIdentity) {
        if let Some(module) = self.module_mut(fragment) {
            module.host = Some(host.clone());
        }
        if let Some(module) = self.module_mut(host) {
            module.hosted_fragments.insert(fragment.clone());
        }
        debug!(fragment = %fragment, host = %host, "片段已附着");
    }

    // ==================== 启动 ====================

    /// 启动模块
    ///
    /// 只允许从 `Resolved`（或手动重试时的 `Failed`）启动，所有依赖必须处于 ACTIVE。
    pub async fn start<D: HookDriver>(
        &mut self,
        id: &ModuleIdentity,
        graph: &DependencyGraph,
        driver: &mut D,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let module = self
            .modules
            .get(id)
            .ok_or_else(|| RuntimeError::ModuleNotFound(id.to_string()))?;

        if module.is_fragment() {
            return Err(RuntimeError::FragmentNotStartable(id.clone()));
        }
        if !matches!(
            module.state,
            LifecycleState::Resolved | LifecycleState::Failed
        ) {
            return Err(RuntimeError::InvalidState {
                module: id.clone(),
                state: module.state,
                operation: "start",
            });
        }
        if let Some(dep) = graph.requires(id).iter().find(|d| !self.is_available(d)) {
            return Err(RuntimeError::DependencyNotActive {
                module: id.clone(),
                dependency: dep.clone(),
            });
        }

        let activator = module.activator.clone();
        let invocation = HookInvocation {
            module: id.clone(),
            kind: HookKind::Start,
            activator,
            timeout: timeout.unwrap_or(self.default_timeout),
            epoch: self.next_epoch(id),
        };

        info!(module_id = %id, epoch = invocation.epoch, "启动模块");
        self.set_state(id, LifecycleState::Starting);
        self.flush(graph, driver);

        let outcome = driver.run_hook(invocation, &self.modules, graph).await;
        let result = match outcome {
            HookOutcome::Completed => {
                if let Some(module) = self.module_mut(id) {
                    module.set_state(LifecycleState::Active);
                    module.last_error = None;
                    module.start_failed = false;
                }
                self.start_log.push(id);
                info!(module_id = %id, "模块启动成功");
                driver.emit(EventKind::ModuleStarted { module: id.clone() });
                Ok(())
            }
            HookOutcome::Failed(reason) => {
                driver.revoke_services(id);
                self.record_failure(id, LifecycleState::Resolved, &reason, true);
                error!(module_id = %id, error = %reason, "启动钩子失败");
                driver.emit(EventKind::ModuleStartFailed {
                    module: id.clone(),
                    reason: reason.clone(),
                });
                Err(RuntimeError::StartFailure {
                    module: id.clone(),
                    reason,
                })
            }
            HookOutcome::TimedOut(limit) => {
                driver.revoke_services(id);
                Err(self.mark_timed_out(id, HookKind::Start, limit, driver))
            }
        };

        self.flush(graph, driver);
        result
    }

    /// 按给定顺序批量启动自动启动模块
    ///
    /// 已激活的模块直接跳过；FAILED 模块和依赖未就绪的模块记入 `skipped`；
    /// 手动启动模块保持 RESOLVED。
    pub async fn cascade_start_all<D: HookDriver>(
        &mut self,
        ordered: &[ModuleIdentity],
        graph: &DependencyGraph,
        driver: &mut D,
    ) -> BatchReport {
        self.cascade_start(ordered, graph, driver, false).await
    }

    /// 按给定顺序启动列出的模块，包括手动启动模块
    pub async fn cascade_start_listed<D: HookDriver>(
        &mut self,
        ordered: &[ModuleIdentity],
        graph: &DependencyGraph,
        driver: &mut D,
    ) -> BatchReport {
        self.cascade_start(ordered, graph, driver, true).await
    }

    async fn cascade_start<D: HookDriver>(
        &mut self,
        ordered: &[ModuleIdentity],
        graph: &DependencyGraph,
        driver: &mut D,
        include_manual: bool,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for id in ordered {
            let Some(module) = self.modules.get(id) else {
                continue;
            };
            if module.is_fragment() {
                continue;
            }
            match module.state {
                LifecycleState::Resolved => {}
                LifecycleState::Failed => {
                    debug!(module_id = %id, "模块处于 FAILED，跳过自动启动");
                    report.skipped.push(id.clone());
                    continue;
                }
                _ => continue,
            }
            if !include_manual && !module.descriptor.auto_start {
                continue;
            }
            if let Some(dep) = graph.requires(id).iter().find(|d| !self.is_available(d)) {
                debug!(module_id = %id, dependency = %dep, "依赖未激活，跳过");
                report.skipped.push(id.clone());
                continue;
            }

            match self.start(id, graph, driver, None).await {
                Ok(()) => report.completed.push(id.clone()),
                Err(e) => {
                    report.failures.insert(id.clone(), e);
                }
            }
        }

        report
    }

    // ==================== 停止 ====================

    /// 停止模块
    ///
    /// 先按启动逆序停止仍处于 ACTIVE 的传递依赖者；任何一个依赖者停止失败时，
    /// 本模块保持 ACTIVE 并返回 `StopFailure`。
    pub async fn stop<D: HookDriver>(
        &mut self,
        id: &ModuleIdentity,
        graph: &DependencyGraph,
        driver: &mut D,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let state = self
            .state_of(id)
            .ok_or_else(|| RuntimeError::ModuleNotFound(id.to_string()))?;
        if state != LifecycleState::Active {
            return Err(RuntimeError::InvalidState {
                module: id.clone(),
                state,
                operation: "stop",
            });
        }

        let dependents = Self::dependent_closure(id, graph);
        for dependent in self.reverse_active(&dependents) {
            if let Err(e) = self.stop_module(&dependent, graph, driver, timeout, false).await {
                warn!(module_id = %dependent, error = %e, "依赖者停止失败");
            }
        }

        if let Some(still_active) = dependents
            .iter()
            .find(|d| self.state_of(d) == Some(LifecycleState::Active))
        {
            return Err(RuntimeError::StopFailure {
                module: id.clone(),
                reason: format!("依赖者 '{}' 仍处于激活状态", still_active),
            });
        }

        self.stop_module(id, graph, driver, timeout, false).await
    }

    /// 按启动逆序停止所有 ACTIVE 模块
    ///
    /// 仍有 ACTIVE 依赖者的模块（依赖者停止失败时）会被跳过，
    /// 经由附着片段依赖它的模块同样算作依赖者。
    pub async fn cascade_stop_all<D: HookDriver>(
        &mut self,
        graph: &DependencyGraph,
        driver: &mut D,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let order: Vec<ModuleIdentity> = self.start_log.iter().rev().cloned().collect();

        for id in order {
            if self.state_of(&id) != Some(LifecycleState::Active) {
                continue;
            }
            if let Some(dependent) = self.active_dependent(&id, graph) {
                debug!(module_id = %id, dependent = %dependent, "仍有激活的依赖者，跳过停止");
                report.skipped.push(id.clone());
                continue;
            }

            match self.stop_module(&id, graph, driver, None, false).await {
                Ok(()) => report.completed.push(id),
                Err(e) => {
                    report.failures.insert(id, e);
                }
            }
        }

        report
    }

    /// 停止单个模块，不处理依赖者
    ///
    /// 进入 STOPPING 时先撤销服务并发布快照，再调用停止钩子。
    /// `force` 为真时停止钩子失败也会回到 RESOLVED。
    async fn stop_module<D: HookDriver>(
        &mut self,
        id: &ModuleIdentity,
        graph: &DependencyGraph,
        driver: &mut D,
        timeout: Option<Duration>,
        force: bool,
    ) -> Result<()> {
        let module = self
            .modules
            .get(id)
            .ok_or_else(|| RuntimeError::ModuleNotFound(id.to_string()))?;
        if module.state != LifecycleState::Active {
            return Err(RuntimeError::InvalidState {
                module: id.clone(),
                state: module.state,
                operation: "stop",
            });
        }

        let activator = module.activator.clone();
        let invocation = HookInvocation {
            module: id.clone(),
            kind: HookKind::Stop,
            activator,
            timeout: timeout.unwrap_or(self.default_timeout),
            epoch: self.next_epoch(id),
        };

        info!(module_id = %id, force, "停止模块");
        self.set_state(id, LifecycleState::Stopping);
        let revoked = driver.revoke_services(id);
        if revoked > 0 {
            debug!(module_id = %id, count = revoked, "已撤销服务");
        }
        self.flush(graph, driver);

        let outcome = driver.run_hook(invocation, &self.modules, graph).await;
        let result = match outcome {
            HookOutcome::Completed => {
                self.set_state(id, LifecycleState::Resolved);
                self.start_log.remove(id);
                info!(module_id = %id, "模块已停止");
                driver.emit(EventKind::ModuleStopped { module: id.clone() });
                Ok(())
            }
            HookOutcome::Failed(reason) if force => {
                self.record_failure(id, LifecycleState::Resolved, &reason, false);
                self.start_log.remove(id);
                warn!(module_id = %id, error = %reason, "停止钩子失败，强制停止");
                driver.emit(EventKind::ModuleStopFailed {
                    module: id.clone(),
                    reason,
                });
                driver.emit(EventKind::ModuleStopped { module: id.clone() });
                Ok(())
            }
            HookOutcome::Failed(reason) => {
                self.record_failure(id, LifecycleState::Active, &reason, false);
                error!(module_id = %id, error = %reason, "停止钩子失败，模块保持激活");
                driver.emit(EventKind::ModuleStopFailed {
                    module: id.clone(),
                    reason: reason.clone(),
                });
                Err(RuntimeError::StopFailure {
                    module: id.clone(),
                    reason,
                })
            }
            HookOutcome::TimedOut(limit) => {
                self.start_log.remove(id);
                Err(self.mark_timed_out(id, HookKind::Stop, limit, driver))
            }
        };

        self.flush(graph, driver);
        result
    }

    // ==================== 回退与卸载 ====================

    /// 把模块的传递依赖者和附着片段回退到 INSTALLED
    ///
    /// 先按启动逆序强制停止其中处于 ACTIVE 的模块。返回回退的模块。
    pub async fn regress_dependents<D: HookDriver>(
        &mut self,
        root: &ModuleIdentity,
        graph: &DependencyGraph,
        driver: &mut D,
    ) -> Vec<ModuleIdentity> {
        let closure = Self::dependent_closure(root, graph);

        for id in self.reverse_active(&closure) {
            if let Err(e) = self.stop_module(&id, graph, driver, None, true).await {
                warn!(module_id = %id, error = %e, "回退前停止模块失败");
            }
        }

        let mut regressed = Vec::new();
        for id in &closure {
            if matches!(self.state_of(id), None | Some(LifecycleState::Installed)) {
                continue;
            }
            let host = match self.module_mut(id) {
                Some(module) => {
                    module.set_state(LifecycleState::Installed);
                    module.host.take()
                }
                None => continue,
            };
            if let Some(host) = host {
                if let Some(host_module) = self.module_mut(&host) {
                    host_module.hosted_fragments.remove(id);
                }
            }
            self.start_log.remove(id);
            driver.revoke_services(id);
            info!(module_id = %id, "模块回退为未解析");
            driver.emit(EventKind::ModuleUnresolved { module: id.clone() });
            regressed.push(id.clone());
        }

        if !regressed.is_empty() {
            self.flush(graph, driver);
        }
        regressed
    }

    /// 卸载模块
    ///
    /// 依赖者和附着的片段先回退到 INSTALLED，本模块若处于 ACTIVE 则强制停止，
    /// 然后从依赖图和模块表中移除。返回回退的模块。
    pub async fn uninstall<D: HookDriver>(
        &mut self,
        id: &ModuleIdentity,
        graph: &mut DependencyGraph,
        driver: &mut D,
    ) -> Result<Vec<ModuleIdentity>> {
        if !self.modules.contains_key(id) {
            return Err(RuntimeError::ModuleNotFound(id.to_string()));
        }

        info!(module_id = %id, "卸载模块");
        let regressed = self.regress_dependents(id, graph, driver).await;

        if self.state_of(id) == Some(LifecycleState::Active) {
            if let Err(e) = self.stop_module(id, graph, driver, None, true).await {
                warn!(module_id = %id, error = %e, "卸载前停止模块失败");
            }
        }

        self.touch_neighbourhood(id, graph);
        let Some(mut module) = self.modules.remove(id) else {
            return Err(RuntimeError::ModuleNotFound(id.to_string()));
        };
        if let Some(ref host) = module.host {
            if let Some(host_module) = self.module_mut(host) {
                host_module.hosted_fragments.remove(id);
            }
        }
        for fragment in &module.hosted_fragments {
            if let Some(fragment_module) = self.module_mut(fragment) {
                fragment_module.host = None;
            }
        }

        graph.remove_module(id);
        self.start_log.remove(id);
        driver.revoke_services(id);
        module.set_state(LifecycleState::Uninstalled);

        info!(module_id = %id, "模块已卸载");
        driver.emit(EventKind::ModuleUninstalled { module: id.clone() });
        self.flush(graph, driver);
        Ok(regressed)
    }

    /// 强制把 STARTING / STOPPING 以外仍然 ACTIVE 的模块全部标为 FAILED
    ///
    /// 关闭截止时间已过时使用。
    pub fn fail_remaining<D: HookDriver>(
        &mut self,
        graph: &DependencyGraph,
        driver: &mut D,
        reason: &str,
    ) -> Vec<ModuleIdentity> {
        let active = self.active_modules();
        for id in active.iter().rev() {
            driver.revoke_services(id);
            self.record_failure(id, LifecycleState::Failed, reason, false);
            self.start_log.remove(id);
            warn!(module_id = %id, "关闭超时，模块标记为 FAILED");
            driver.emit(EventKind::ModuleFailed {
                module: id.clone(),
                hook: HookKind::Stop.as_str().to_string(),
                reason: reason.to_string(),
            });
        }
        if !active.is_empty() {
            self.flush(graph, driver);
        }
        active
    }

    // ==================== 内部工具 ====================

    fn set_state(&mut self, id: &ModuleIdentity, state: LifecycleState) {
        if let Some(module) = self.module_mut(id) {
            module.set_state(state);
        }
    }

    fn record_failure(
        &mut self,
        id: &ModuleIdentity,
        state: LifecycleState,
        reason: &str,
        start_failed: bool,
    ) {
        if let Some(module) = self.module_mut(id) {
            module.set_state(state);
            module.last_error = Some(reason.to_string());
            if start_failed {
                module.start_failed = true;
            }
        }
    }

    fn mark_timed_out<D: HookDriver>(
        &mut self,
        id: &ModuleIdentity,
        hook: HookKind,
        limit: Duration,
        driver: &mut D,
    ) -> RuntimeError {
        let err = RuntimeError::HookTimeout {
            module: id.clone(),
            hook: hook.as_str(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        };
        self.record_failure(
            id,
            LifecycleState::Failed,
            &err.to_string(),
            hook == HookKind::Start,
        );
        error!(module_id = %id, hook = hook.as_str(), timeout_ms = limit.as_millis() as u64, "钩子执行超时");
        driver.emit(EventKind::ModuleFailed {
            module: id.clone(),
            hook: hook.as_str().to_string(),
            reason: err.to_string(),
        });
        err
    }

    /// 集合中处于 ACTIVE 的模块，按启动逆序
    fn reverse_active(&self, set: &BTreeSet<ModuleIdentity>) -> Vec<ModuleIdentity> {
        let mut active: Vec<(u64, &ModuleIdentity)> = set
            .iter()
            .filter(|id| self.state_of(id) == Some(LifecycleState::Active))
            .filter_map(|id| self.start_log.sequence(id).map(|sequence| (sequence, id)))
            .collect();
        active.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        active.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// 仍处于 ACTIVE 的直接依赖者，包括依赖本模块某个片段的模块
    fn active_dependent(&self, id: &ModuleIdentity, graph: &DependencyGraph) -> Option<ModuleIdentity> {
        std::iter::once(id)
            .chain(graph.fragments_of(id))
            .flat_map(|member| graph.dependents(member))
            .find(|dependent| self.state_of(dependent) == Some(LifecycleState::Active))
            .cloned()
    }

    /// 沿依赖者和片段边可达的模块（不含自身）
    fn dependent_closure(root: &ModuleIdentity, graph: &DependencyGraph) -> BTreeSet<ModuleIdentity> {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<ModuleIdentity> = VecDeque::new();
        queue.extend(graph.dependents(root).iter().cloned());
        queue.extend(graph.fragments_of(root).iter().cloned());

        while let Some(current) = queue.pop_front() {
            if &current == root || !visited.insert(current.clone()) {
                continue;
            }
            queue.extend(graph.dependents(&current).iter().cloned());
            queue.extend(graph.fragments_of(&current).iter().cloned());
        }
        visited
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::module::source::InMemorySource;
    use std::collections::{HashMap, HashSet};

    /// 脚本化的钩子驱动，记录调用顺序和事件
    #[derive(Default)]
    pub(crate) struct ScriptedDriver {
        pub outcomes: HashMap<(ModuleIdentity, &'static str), HookOutcome>,
        pub calls: Vec<(ModuleIdentity, &'static str)>,
        pub events: std::sync::Mutex<Vec<EventKind>>,
        pub revoked: Vec<ModuleIdentity>,
        pub published: Vec<BTreeSet<ModuleIdentity>>,
        pub states_during_hook: Vec<(ModuleIdentity, LifecycleState)>,
    }

    impl ScriptedDriver {
        pub fn fail(mut self, id: &ModuleIdentity, hook: &'static str, reason: &str) -> Self {
            self.outcomes
                .insert((id.clone(), hook), HookOutcome::Failed(reason.to_string()));
            self
        }

        pub fn time_out(mut self, id: &ModuleIdentity, hook: &'static str) -> Self {
            self.outcomes.insert(
                (id.clone(), hook),
                HookOutcome::TimedOut(Duration::from_millis(10)),
            );
            self
        }

        pub fn event_names(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(EventKind::name)
                .collect()
        }
    }

    #[async_trait]
    impl HookDriver for ScriptedDriver {
        async fn run_hook(
            &mut self,
            invocation: HookInvocation,
            modules: &ModuleTable,
            _graph: &DependencyGraph,
        ) -> HookOutcome {
            let hook = invocation.kind.as_str();
            if let Some(module) = modules.get(&invocation.module) {
                self.states_during_hook
                    .push((invocation.module.clone(), module.state()));
            }
            self.calls.push((invocation.module.clone(), hook));
            self.outcomes
                .get(&(invocation.module, hook))
                .cloned()
                .unwrap_or(HookOutcome::Completed)
        }

        fn revoke_services(&mut self, owner: &ModuleIdentity) -> usize {
            self.revoked.push(owner.clone());
            0
        }

        fn publish(
            &mut self,
            changed: &BTreeSet<ModuleIdentity>,
            _modules: &ModuleTable,
            _graph: &DependencyGraph,
        ) {
            self.published.push(changed.clone());
        }

        fn emit(&self, event: EventKind) {
            self.events.lock().unwrap().push(event);
        }
    }

    pub(crate) fn id(name: &str) -> ModuleIdentity {
        ModuleIdentity::new(name, "1.0.0").unwrap()
    }

    pub(crate) fn desc(name: &str, deps: &[&str]) -> ModuleDescriptor {
        deps.iter()
            .fold(ModuleDescriptor::new(id(name)), |d, dep| d.requires(id(dep)))
    }

    /// 安装并直接解析（测试中按依赖顺序安装）
    fn setup(descriptors: Vec<ModuleDescriptor>) -> (LifecycleController, DependencyGraph) {
        let mut graph = DependencyGraph::new();
        let mut lifecycle = LifecycleController::new(Duration::from_secs(1));
        for descriptor in descriptors {
            let identity = descriptor.identity.clone();
            let host = descriptor.fragment_host.clone();
            graph.add_module(&descriptor);
            graph.on_installed(&identity);
            lifecycle.insert(Module::new(Box::new(InMemorySource::new(descriptor))));
            lifecycle.mark_resolved(&identity);
            if let Some(host) = host {
                lifecycle.attach_fragment(&identity, &host);
            }
        }
        (lifecycle, graph)
    }

    fn ids(names: &[&str]) -> Vec<ModuleIdentity> {
        names.iter().map(|n| id(n)).collect()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (mut lc, graph) = setup(vec![desc("a", &[])]);
        let mut driver = ScriptedDriver::default();

        lc.start(&id("a"), &graph, &mut driver, None).await.unwrap();
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Active));
        assert_eq!(driver.states_during_hook, vec![(id("a"), LifecycleState::Starting)]);
        assert_eq!(lc.start_log(), ids(&["a"]));

        lc.stop(&id("a"), &graph, &mut driver, None).await.unwrap();
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Resolved));
        assert_eq!(driver.states_during_hook[1], (id("a"), LifecycleState::Stopping));
        assert_eq!(driver.revoked, ids(&["a"]));
        assert!(lc.start_log().is_empty());
    }

    #[tokio::test]
    async fn test_start_requires_resolved() {
        let mut graph = DependencyGraph::new();
        let mut lc = LifecycleController::new(Duration::from_secs(1));
        let d = desc("a", &[]);
        graph.add_module(&d);
        lc.insert(Module::new(Box::new(InMemorySource::new(d))));
        let mut driver = ScriptedDriver::default();

        let err = lc.start(&id("a"), &graph, &mut driver, None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidState {
                state: LifecycleState::Installed,
                ..
            }
        ));
        assert!(driver.calls.is_empty());
    }

    #[tokio::test]
    async fn test_start_requires_active_dependencies() {
        let (mut lc, graph) = setup(vec![desc("a", &[]), desc("b", &["a"])]);
        let mut driver = ScriptedDriver::default();

        let err = lc.start(&id("b"), &graph, &mut driver, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::DependencyNotActive { .. }));
        assert_eq!(lc.state_of(&id("b")), Some(LifecycleState::Resolved));
    }

    #[tokio::test]
    async fn test_start_failure_reverts_to_resolved() {
        let (mut lc, graph) = setup(vec![desc("a", &[])]);
        let mut driver = ScriptedDriver::default().fail(&id("a"), "start", "boom");

        let err = lc.start(&id("a"), &graph, &mut driver, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailure { .. }));
        let module = lc.get(&id("a")).unwrap();
        assert_eq!(module.state(), LifecycleState::Resolved);
        assert_eq!(module.last_error(), Some("boom"));
        assert!(module.start_failed());
        assert_eq!(driver.revoked, ids(&["a"]));
        assert_eq!(driver.event_names(), vec!["module.start_failed"]);
    }

    #[tokio::test]
    async fn test_start_timeout_marks_failed_and_retry() {
        let (mut lc, graph) = setup(vec![desc("a", &[])]);
        let mut driver = ScriptedDriver::default().time_out(&id("a"), "start");

        let err = lc.start(&id("a"), &graph, &mut driver, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::HookTimeout { hook: "start", .. }));
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Failed));

        // 手动重试
        driver.outcomes.clear();
        lc.start(&id("a"), &graph, &mut driver, None).await.unwrap();
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Active));
        assert!(!lc.get(&id("a")).unwrap().start_failed());
    }

    #[tokio::test]
    async fn test_fragment_not_startable() {
        let (mut lc, graph) = setup(vec![
            desc("h", &[]),
            ModuleDescriptor::new(id("f")).fragment_of(id("h")),
        ]);
        let mut driver = ScriptedDriver::default();

        let err = lc.start(&id("f"), &graph, &mut driver, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::FragmentNotStartable(_)));
        assert!(lc.get(&id("h")).unwrap().hosted_fragments().contains(&id("f")));
    }

    #[tokio::test]
    async fn test_cascade_start_isolates_failures() {
        let (mut lc, graph) = setup(vec![
            desc("a", &[]),
            desc("b", &["a"]),
            desc("c", &["a"]),
            desc("d", &["b"]),
        ]);
        let mut driver = ScriptedDriver::default().fail(&id("b"), "start", "boom");

        let report = lc
            .cascade_start_all(&ids(&["a", "b", "c", "d"]), &graph, &mut driver)
            .await;

        assert_eq!(report.completed, ids(&["a", "c"]));
        assert_eq!(report.skipped, ids(&["d"]));
        assert_eq!(report.failed(), vec![&id("b")]);
        assert!(matches!(
            report.failures[&id("b")],
            RuntimeError::StartFailure { .. }
        ));
        assert_eq!(lc.state_of(&id("b")), Some(LifecycleState::Resolved));
        assert_eq!(lc.state_of(&id("d")), Some(LifecycleState::Resolved));
    }

    #[tokio::test]
    async fn test_cascade_start_skips_manual_and_failed() {
        let (mut lc, graph) = setup(vec![desc("a", &[]).manual_start(), desc("b", &[])]);
        let mut driver = ScriptedDriver::default().time_out(&id("b"), "start");
        lc.start(&id("b"), &graph, &mut driver, None).await.unwrap_err();
        driver.outcomes.clear();

        let report = lc
            .cascade_start_all(&ids(&["a", "b"]), &graph, &mut driver)
            .await;
        assert!(report.completed.is_empty());
        assert_eq!(report.skipped, ids(&["b"]));
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Resolved));

        let report = lc
            .cascade_start_listed(&ids(&["a"]), &graph, &mut driver)
            .await;
        assert_eq!(report.completed, ids(&["a"]));
    }

    #[tokio::test]
    async fn test_cascade_stop_reverse_order() {
        let (mut lc, graph) = setup(vec![desc("a", &[]), desc("b", &["a"]), desc("c", &["b"])]);
        let mut driver = ScriptedDriver::default();
        lc.cascade_start_all(&ids(&["a", "b", "c"]), &graph, &mut driver)
            .await;
        driver.calls.clear();

        let report = lc.cascade_stop_all(&graph, &mut driver).await;
        assert_eq!(report.completed, ids(&["c", "b", "a"]));
        let stops: Vec<_> = driver.calls.iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(stops, ids(&["c", "b", "a"]));
    }

    #[tokio::test]
    async fn test_stop_cascades_to_dependents() {
        let (mut lc, graph) = setup(vec![desc("a", &[]), desc("b", &["a"]), desc("c", &["b"])]);
        let mut driver = ScriptedDriver::default();
        lc.cascade_start_all(&ids(&["a", "b", "c"]), &graph, &mut driver)
            .await;

        lc.stop(&id("a"), &graph, &mut driver, None).await.unwrap();
        for name in ["a", "b", "c"] {
            assert_eq!(lc.state_of(&id(name)), Some(LifecycleState::Resolved));
        }
    }

    #[tokio::test]
    async fn test_stop_failure_reverts_to_active() {
        let (mut lc, graph) = setup(vec![desc("a", &[]), desc("b", &["a"])]);
        let mut driver = ScriptedDriver::default().fail(&id("b"), "stop", "stuck");
        lc.cascade_start_all(&ids(&["a", "b"]), &graph, &mut driver)
            .await;

        let err = lc.stop(&id("a"), &graph, &mut driver, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StopFailure { .. }));
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Active));
        assert_eq!(lc.state_of(&id("b")), Some(LifecycleState::Active));

        let report = lc.cascade_stop_all(&graph, &mut driver).await;
        assert_eq!(report.failed(), vec![&id("b")]);
        assert_eq!(report.skipped, ids(&["a"]));
    }

    #[tokio::test]
    async fn test_cascade_stop_keeps_host_of_fragment_dependency() {
        // b 经由片段 f 依赖 h
        let (mut lc, graph) = setup(vec![
            desc("h", &[]),
            ModuleDescriptor::new(id("f")).fragment_of(id("h")),
            desc("b", &["f"]),
        ]);
        let mut driver = ScriptedDriver::default().fail(&id("b"), "stop", "stuck");
        let started = lc
            .cascade_start_all(&ids(&["h", "b"]), &graph, &mut driver)
            .await;
        assert_eq!(started.completed, ids(&["h", "b"]));
        driver.calls.clear();

        let report = lc.cascade_stop_all(&graph, &mut driver).await;
        assert_eq!(report.failed(), vec![&id("b")]);
        assert_eq!(report.skipped, ids(&["h"]));
        assert_eq!(lc.state_of(&id("b")), Some(LifecycleState::Active));
        assert_eq!(lc.state_of(&id("h")), Some(LifecycleState::Active));
        // h 的停止钩子没有被调用
        assert_eq!(driver.calls, vec![(id("b"), "stop")]);
    }

    #[tokio::test]
    async fn test_publish_carries_only_changed_modules() {
        let (mut lc, graph) = setup(vec![desc("a", &[]), desc("b", &[]), desc("c", &["a"])]);
        let mut driver = ScriptedDriver::default();
        lc.flush(&graph, &mut driver);
        assert_eq!(
            driver.published[0],
            ids(&["a", "b", "c"]).into_iter().collect::<BTreeSet<_>>()
        );
        driver.published.clear();

        lc.start(&id("a"), &graph, &mut driver, None).await.unwrap();
        assert_eq!(driver.published.len(), 2);
        for changed in &driver.published {
            assert_eq!(changed, &ids(&["a"]).into_iter().collect::<BTreeSet<_>>());
        }
        assert!(lc.pending_changes().is_empty());

        lc.touch_neighbourhood(&id("a"), &graph);
        assert_eq!(
            lc.pending_changes(),
            &ids(&["a", "c"]).into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn test_hook_epoch_increases_per_invocation() {
        let (mut lc, graph) = setup(vec![desc("a", &[])]);
        let mut driver = ScriptedDriver::default().time_out(&id("a"), "start");
        assert_eq!(lc.get(&id("a")).unwrap().hook_epoch(), 0);

        let _ = lc.start(&id("a"), &graph, &mut driver, None).await;
        assert_eq!(lc.get(&id("a")).unwrap().hook_epoch(), 1);

        driver.outcomes.clear();
        lc.start(&id("a"), &graph, &mut driver, None).await.unwrap();
        lc.stop(&id("a"), &graph, &mut driver, None).await.unwrap();
        assert_eq!(lc.get(&id("a")).unwrap().hook_epoch(), 3);
    }

    #[tokio::test]
    async fn test_uninstall_regresses_dependents_and_fragments() {
        let (mut lc, mut graph) = setup(vec![
            desc("a", &[]),
            desc("b", &["a"]),
            desc("c", &["b"]),
            ModuleDescriptor::new(id("f")).fragment_of(id("a")),
        ]);
        let mut driver = ScriptedDriver::default();
        lc.cascade_start_all(&ids(&["a", "b", "c"]), &graph, &mut driver)
            .await;
        driver.calls.clear();

        let regressed = lc.uninstall(&id("a"), &mut graph, &mut driver).await.unwrap();
        let regressed: HashSet<_> = regressed.into_iter().collect();
        assert_eq!(regressed, ids(&["b", "c", "f"]).into_iter().collect());

        // 依赖者先于被依赖者停止
        let stops: Vec<_> = driver.calls.iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(stops, ids(&["c", "b", "a"]));

        assert!(!lc.contains(&id("a")));
        assert!(!graph.contains(&id("a")));
        let names = driver.event_names();
        assert_eq!(names.last(), Some(&"module.uninstalled"));
        assert_eq!(names.iter().filter(|n| **n == "module.unresolved").count(), 3);
        for name in ["b", "c", "f"] {
            assert_eq!(lc.state_of(&id(name)), Some(LifecycleState::Installed));
        }
        assert_eq!(lc.get(&id("f")).unwrap().host(), None);
        assert!(graph.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_uninstall_missing_module() {
        let (mut lc, mut graph) = setup(vec![desc("a", &[])]);
        let mut driver = ScriptedDriver::default();

        lc.uninstall(&id("a"), &mut graph, &mut driver).await.unwrap();
        let err = lc
            .uninstall(&id("a"), &mut graph, &mut driver)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleNotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_remaining() {
        let (mut lc, graph) = setup(vec![desc("a", &[]), desc("b", &["a"])]);
        let mut driver = ScriptedDriver::default();
        lc.cascade_start_all(&ids(&["a", "b"]), &graph, &mut driver)
            .await;

        let failed = lc.fail_remaining(&graph, &mut driver, "deadline");
        assert_eq!(failed, ids(&["a", "b"]));
        assert_eq!(lc.state_of(&id("a")), Some(LifecycleState::Failed));
        assert!(lc.active_modules().is_empty());
    }
}
