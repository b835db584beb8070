//! 编排循环
//!
//! 单个 tokio 任务独占依赖图、解析器、生命周期控制器、服务注册表和扩展登记表，
//! 按到达顺序逐条处理命令。每次变更之后只把涉及的条目写入共享视图，读取方无需加锁。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::core::RuntimeConfig;
use crate::kernel::command::{Command, ServiceOp};
use crate::kernel::context::{ModuleContext, ServiceClient};
use crate::kernel::event::EventKind;
use crate::kernel::event_bus::EventBus;
use crate::kernel::snapshot::{RuntimeView, SharedView};
use crate::module::dependency::DependencyGraph;
use crate::module::extensions::{ExtensionChange, ExtensionRegistry};
use crate::module::lifecycle::{
    BatchReport, HookDriver, HookInvocation, HookKind, HookOutcome, LifecycleController, Module,
    ModuleTable,
};
use crate::module::metadata::{LifecycleState, ModuleIdentity};
use crate::module::resolver::{self, ResolutionReport, Resolver};
use crate::module::services::{ServiceHandle, ServiceProperties, ServiceRegistration, ServiceRegistry};
use crate::module::source::ModuleSource;
use crate::utils::{Result, RuntimeError};

// ============================================================================
// 钩子环境
// ============================================================================

/// 生产环境的钩子驱动
///
/// 持有服务注册表和扩展登记表，在等待钩子期间继续处理服务写入。
pub(crate) struct HookEnvironment {
    registry: ServiceRegistry,
    extensions: ExtensionRegistry,
    service_ops: mpsc::UnboundedReceiver<ServiceOp>,
    ops_sender: mpsc::UnboundedSender<ServiceOp>,
    view: SharedView,
    /// 服务数变化、需要重写信息的模块
    touched_owners: BTreeSet<ModuleIdentity>,
    /// 注册列表变化的接口
    touched_interfaces: BTreeSet<String>,
    /// 贡献变化的目标
    touched_targets: BTreeSet<ModuleIdentity>,
    events: Arc<EventBus>,
    /// 关闭截止时间，设置后每个钩子的超时不超过剩余时间
    deadline: Option<Instant>,
}

impl HookEnvironment {
    fn new(view: SharedView, events: Arc<EventBus>) -> Self {
        let (ops_sender, service_ops) = mpsc::unbounded_channel();
        Self {
            registry: ServiceRegistry::new(),
            extensions: ExtensionRegistry::new(),
            service_ops,
            ops_sender,
            view,
            touched_owners: BTreeSet::new(),
            touched_interfaces: BTreeSet::new(),
            touched_targets: BTreeSet::new(),
            events,
            deadline: None,
        }
    }

    fn client(&self) -> ServiceClient {
        ServiceClient::new(self.ops_sender.clone(), self.view.clone())
    }

    fn touch_service(&mut self, registration: &ServiceRegistration) {
        self.touched_owners.insert(registration.owner.clone());
        if !self.touched_interfaces.contains(&registration.interface) {
            self.touched_interfaces
                .insert(registration.interface.clone());
        }
    }

    /// 记录扩展登记变化并发送事件
    fn apply_extension_changes(&mut self, changes: Vec<ExtensionChange>) {
        for change in changes {
            let extension = change.extension();
            let (contributor, target, point) = (
                extension.contributor.clone(),
                extension.target.clone(),
                extension.point.clone(),
            );
            debug!(contributor = %contributor, target = %target, point = %point, sequence = extension.sequence, "扩展登记变化");
            self.touched_targets.insert(target.clone());
            self.emit(match change {
                ExtensionChange::Registered(_) => EventKind::ExtensionRegistered {
                    contributor,
                    target,
                    point,
                },
                ExtensionChange::Pending(_) => EventKind::ExtensionPending {
                    contributor,
                    target,
                    point,
                },
                ExtensionChange::Unregistered(_) => EventKind::ExtensionUnregistered {
                    contributor,
                    target,
                    point,
                },
            });
        }
    }

    /// 处理一次服务写入
    fn apply_service_op(&mut self, op: ServiceOp, modules: &ModuleTable, graph: &DependencyGraph) {
        match op {
            ServiceOp::Register {
                owner,
                interface,
                properties,
                epoch,
                respond_to,
            } => {
                let result =
                    self.register_service(owner, interface, properties, epoch, modules, graph);
                let _ = respond_to.send(result);
            }
            ServiceOp::Unregister {
                handle,
                owner,
                respond_to,
            } => {
                let result = self.unregister_service(handle, owner.as_ref(), modules, graph);
                let _ = respond_to.send(result);
            }
        }
    }

    fn register_service(
        &mut self,
        owner: ModuleIdentity,
        interface: String,
        properties: ServiceProperties,
        epoch: Option<u64>,
        modules: &ModuleTable,
        graph: &DependencyGraph,
    ) -> Result<ServiceRegistration> {
        let module = modules
            .get(&owner)
            .ok_or_else(|| RuntimeError::ModuleNotFound(owner.to_string()))?;
        let state = module.state();
        if !state.can_publish_services() {
            warn!(module_id = %owner, interface = %interface, state = %state, "拒绝服务注册");
            return Err(RuntimeError::ServiceOwnerNotActive { owner, state });
        }
        if let Some(epoch) = epoch {
            if epoch != module.hook_epoch() {
                warn!(module_id = %owner, interface = %interface, epoch, current = module.hook_epoch(), "拒绝过期上下文的服务注册");
                return Err(RuntimeError::StaleContext {
                    module: owner,
                    epoch,
                });
            }
        }

        let registration = self.registry.register(owner, interface, properties);
        self.touch_service(&registration);
        info!(
            module_id = %registration.owner,
            interface = %registration.interface,
            handle = %registration.handle,
            ranking = registration.ranking,
            "服务已注册"
        );
        self.emit(EventKind::ServiceRegistered {
            handle: registration.handle,
            interface: registration.interface.clone(),
            owner: registration.owner.clone(),
        });
        self.publish(&BTreeSet::new(), modules, graph);
        Ok(registration)
    }

    fn unregister_service(
        &mut self,
        handle: ServiceHandle,
        owner: Option<&ModuleIdentity>,
        modules: &ModuleTable,
        graph: &DependencyGraph,
    ) -> Result<ServiceRegistration> {
        match (self.registry.get(handle), owner) {
            (None, _) => return Err(RuntimeError::ServiceNotFound(handle.sequence())),
            (Some(existing), Some(owner)) if &existing.owner != owner => {
                return Err(RuntimeError::ServiceNotFound(handle.sequence()));
            }
            _ => {}
        }

        let registration = self
            .registry
            .unregister(handle)
            .ok_or(RuntimeError::ServiceNotFound(handle.sequence()))?;
        self.touch_service(&registration);
        info!(
            module_id = %registration.owner,
            interface = %registration.interface,
            handle = %registration.handle,
            "服务已注销"
        );
        self.emit(EventKind::ServiceUnregistered {
            handle: registration.handle,
            interface: registration.interface.clone(),
            owner: registration.owner.clone(),
        });
        self.publish(&BTreeSet::new(), modules, graph);
        Ok(registration)
    }

    /// 本次钩子实际可用的时间，截止时间已过时返回 `None`
    fn effective_timeout(&self, requested: Duration) -> Option<Duration> {
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    None
                } else {
                    Some(requested.min(remaining))
                }
            }
            None => Some(requested),
        }
    }
}

#[async_trait]
impl HookDriver for HookEnvironment {
    async fn run_hook(
        &mut self,
        invocation: HookInvocation,
        modules: &ModuleTable,
        graph: &DependencyGraph,
    ) -> HookOutcome {
        let Some(limit) = self.effective_timeout(invocation.timeout) else {
            warn!(module_id = %invocation.module, hook = invocation.kind.as_str(), "关闭截止时间已过，不再调用钩子");
            return HookOutcome::TimedOut(Duration::ZERO);
        };

        let ctx = ModuleContext::new(invocation.module.clone(), invocation.epoch, self.client());
        let activator = invocation.activator.clone();
        let kind = invocation.kind;
        let mut task: JoinHandle<anyhow::Result<()>> = tokio::spawn(async move {
            match kind {
                HookKind::Start => activator.start(ctx).await,
                HookKind::Stop => activator.stop(ctx).await,
            }
        });

        let sleep = tokio::time::sleep(limit);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                Some(op) = self.service_ops.recv() => {
                    self.apply_service_op(op, modules, graph);
                }
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(())) => HookOutcome::Completed,
                        Ok(Err(e)) => HookOutcome::Failed(format!("{:#}", e)),
                        Err(e) => HookOutcome::Failed(join_error_message(e)),
                    };
                }
                _ = &mut sleep => {
                    // 任务继续在后台运行，模块已不在 STARTING / ACTIVE，迟到的注册会被拒绝
                    return HookOutcome::TimedOut(limit);
                }
            }
        }
    }

    fn revoke_services(&mut self, owner: &ModuleIdentity) -> usize {
        let revoked = self.registry.unregister_all(owner);
        for registration in &revoked {
            self.touch_service(registration);
            debug!(
                module_id = %owner,
                interface = %registration.interface,
                handle = %registration.handle,
                "撤销服务"
            );
            self.emit(EventKind::ServiceUnregistered {
                handle: registration.handle,
                interface: registration.interface.clone(),
                owner: registration.owner.clone(),
            });
        }
        revoked.len()
    }

    fn publish(
        &mut self,
        changed: &BTreeSet<ModuleIdentity>,
        modules: &ModuleTable,
        graph: &DependencyGraph,
    ) {
        let mut ids = std::mem::take(&mut self.touched_owners);
        let interfaces = std::mem::take(&mut self.touched_interfaces);
        let targets = std::mem::take(&mut self.touched_targets);
        if changed.is_empty() && ids.is_empty() && interfaces.is_empty() && targets.is_empty() {
            return;
        }
        ids.extend(changed.iter().cloned());

        for id in &ids {
            self.view
                .put_module(id, modules.get(id).map(|m| m.info(graph, &self.registry)));
            self.view.put_pending(id, graph.pending().get(id));
        }
        for interface in &interfaces {
            self.view
                .put_services(interface, self.registry.lookup_all(interface));
        }
        for target in &targets {
            self.view.put_extensions(
                target,
                self.extensions.registered_for(target),
                self.extensions.pending_for(target),
            );
        }
        let generation = self.view.bump();
        trace!(
            generation,
            modules = ids.len(),
            interfaces = interfaces.len(),
            targets = targets.len(),
            "视图已更新"
        );
    }

    fn emit(&self, event: EventKind) {
        self.events.publish(event);
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("钩子任务被取消: {}", err);
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("钩子 panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("钩子 panic: {}", message)
    } else {
        "钩子 panic".to_string()
    }
}

// ============================================================================
// 编排循环
// ============================================================================

/// 编排循环句柄
pub(crate) struct KernelHandle {
    pub commands: mpsc::Sender<Command>,
    pub services: ServiceClient,
    pub view: SharedView,
    pub events: Arc<EventBus>,
    pub task: JoinHandle<()>,
}

/// 启动编排循环，必须在 tokio 运行时中调用
pub(crate) fn spawn(config: RuntimeConfig) -> KernelHandle {
    let (commands_tx, commands_rx) = mpsc::channel(config.kernel.command_queue_size.max(1));
    let view = RuntimeView::shared();
    let events = Arc::new(EventBus::new(
        config.events.listener_queue_size,
        Duration::from_millis(config.events.handler_timeout_ms),
    ));

    let env = HookEnvironment::new(view.clone(), events.clone());
    let services = env.client();
    let orchestrator = Orchestrator::new(commands_rx, env, config);
    let task = tokio::spawn(orchestrator.run());

    KernelHandle {
        commands: commands_tx,
        services,
        view,
        events,
        task,
    }
}

enum Next {
    Service(ServiceOp),
    Command(Option<Command>),
}

pub(crate) struct Orchestrator {
    commands: mpsc::Receiver<Command>,
    graph: DependencyGraph,
    resolver: Resolver,
    lifecycle: LifecycleController,
    env: HookEnvironment,
    config: RuntimeConfig,
    /// 来源位置 -> 模块
    locations: HashMap<String, ModuleIdentity>,
    /// 批量启动之后为真，新解析的自动启动模块会立即启动
    framework_active: bool,
    /// 待机前处于 ACTIVE 的模块
    standby: Option<Vec<ModuleIdentity>>,
}

impl Orchestrator {
    fn new(commands: mpsc::Receiver<Command>, env: HookEnvironment, config: RuntimeConfig) -> Self {
        Self {
            commands,
            graph: DependencyGraph::new(),
            resolver: Resolver::new(),
            lifecycle: LifecycleController::new(config.lifecycle.hook_timeout()),
            env,
            config,
            locations: HashMap::new(),
            framework_active: false,
            standby: None,
        }
    }

    async fn run(mut self) {
        info!("编排循环已启动");

        loop {
            let next = tokio::select! {
                biased;
                Some(op) = self.env.service_ops.recv() => Next::Service(op),
                command = self.commands.recv() => Next::Command(command),
            };

            match next {
                Next::Service(op) => {
                    self.env
                        .apply_service_op(op, self.lifecycle.modules(), &self.graph);
                }
                Next::Command(Some(Command::Shutdown { respond_to })) => {
                    let report = self.shutdown().await;
                    let _ = respond_to.send(Ok(report));
                    break;
                }
                Next::Command(Some(command)) => self.handle(command).await,
                Next::Command(None) => {
                    info!("所有运行时句柄已释放，开始关闭");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("编排循环已退出");
    }

    async fn handle(&mut self, command: Command) {
        debug!(command = ?command, "处理命令");
        match command {
            Command::Install { source, respond_to } => {
                let _ = respond_to.send(self.install(source).await);
            }
            Command::Uninstall { id, respond_to } => {
                let _ = respond_to.send(self.uninstall(&id).await);
            }
            Command::UninstallLocation {
                location,
                respond_to,
            } => {
                let result = match self.locations.get(&location).cloned() {
                    Some(id) => self.uninstall(&id).await.map(|()| id),
                    None => Err(RuntimeError::ModuleNotFound(location)),
                };
                let _ = respond_to.send(result);
            }
            Command::Start {
                id,
                timeout,
                respond_to,
            } => {
                let _ = respond_to.send(self.start(&id, timeout).await);
            }
            Command::Stop {
                id,
                timeout,
                respond_to,
            } => {
                let result = self
                    .lifecycle
                    .stop(&id, &self.graph, &mut self.env, timeout)
                    .await;
                let _ = respond_to.send(result);
            }
            Command::StartAll { respond_to } => {
                let _ = respond_to.send(Ok(self.start_all().await));
            }
            Command::StopAll { respond_to } => {
                let _ = respond_to.send(Ok(self.stop_all().await));
            }
            Command::Resolve { respond_to } => {
                let _ = respond_to.send(Ok(self.resolve_all().await));
            }
            Command::Standby { respond_to } => {
                let _ = respond_to.send(Ok(self.standby().await));
            }
            Command::Resume { respond_to } => {
                let _ = respond_to.send(Ok(self.resume().await));
            }
            Command::Shutdown { respond_to } => {
                // run() 已单独处理
                let _ = respond_to.send(Ok(self.shutdown().await));
            }
            Command::StartOrder { respond_to } => {
                let _ = respond_to.send(Ok(self.start_order().to_vec()));
            }
        }
        self.flush();
    }

    /// 把本条命令留下的变更写入视图
    fn flush(&mut self) {
        self.lifecycle.flush(&self.graph, &mut self.env);
    }

    /// 当前启动顺序，视图中没有缓存时重算
    fn start_order(&mut self) -> Arc<Vec<ModuleIdentity>> {
        if let Some(order) = self.env.view.cached_start_order() {
            return order;
        }
        let order = Arc::new(resolver::start_order(&self.graph, self.lifecycle.modules()));
        debug!(count = order.len(), "启动顺序已重算");
        self.env.view.set_start_order(Some(order.clone()));
        order
    }

    /// 已解析集合或依赖图变化后作废缓存的启动顺序
    fn invalidate_start_order(&self) {
        self.env.view.set_start_order(None);
    }

    // ==================== 安装与卸载 ====================

    async fn install(&mut self, source: Box<dyn ModuleSource>) -> Result<ModuleIdentity> {
        let id = source.identity().clone();

        if self.config.modules.is_blacklisted(id.name()) {
            debug!(module_id = %id, "模块在黑名单中，拒绝安装");
            return Err(RuntimeError::Blacklisted(id.name().to_string()));
        }
        if self.lifecycle.contains(&id) {
            return Err(RuntimeError::DuplicateIdentity(id));
        }
        let descriptor = source.descriptor();
        descriptor.validate()?;
        if descriptor.identity != id {
            return Err(RuntimeError::InvalidDescriptor(format!(
                "来源标识 '{}' 与描述标识 '{}' 不一致",
                id, descriptor.identity
            )));
        }

        let location = source.location();
        let module = Module::new(source);
        self.graph.add_module(module.descriptor());
        self.lifecycle.insert(module);
        self.lifecycle.touch_neighbourhood(&id, &self.graph);
        self.invalidate_start_order();
        if let Some(location) = location {
            if let Some(previous) = self.locations.insert(location.clone(), id.clone()) {
                warn!(location = %location, previous = %previous, module_id = %id, "来源位置被覆盖");
            }
        }

        info!(module_id = %id, "模块已安装");
        self.env.emit(EventKind::ModuleInstalled { module: id.clone() });

        let mut candidates = self.graph.on_installed(&id);
        candidates.push(id.clone());
        self.resolver.topology_changed([&id]);
        self.flush();

        let report = self
            .resolver
            .try_resolve(candidates, &self.graph, &mut self.lifecycle);
        self.after_resolution(report).await;
        Ok(id)
    }

    async fn uninstall(&mut self, id: &ModuleIdentity) -> Result<()> {
        let location = self
            .lifecycle
            .get(id)
            .and_then(|m| m.location())
            .map(str::to_string);
        let regressed = self
            .lifecycle
            .uninstall(id, &mut self.graph, &mut self.env)
            .await?;
        if let Some(location) = location {
            if self.locations.get(&location) == Some(id) {
                self.locations.remove(&location);
            }
        }
        self.invalidate_start_order();
        self.resolver
            .topology_changed(std::iter::once(id).chain(regressed.iter()));

        for gone in std::iter::once(id).chain(regressed.iter()) {
            let mut changes = self.env.extensions.withdraw(gone);
            changes.extend(self.env.extensions.target_unavailable(gone));
            self.env.apply_extension_changes(changes);
        }
        self.flush();

        let report = self
            .resolver
            .try_resolve(regressed, &self.graph, &mut self.lifecycle);
        self.after_resolution(report).await;
        Ok(())
    }

    // ==================== 解析 ====================

    async fn resolve_all(&mut self) -> Vec<ModuleIdentity> {
        let candidates: Vec<ModuleIdentity> = self
            .lifecycle
            .modules()
            .values()
            .filter(|m| m.state() == LifecycleState::Installed)
            .map(|m| m.identity().clone())
            .collect();
        let report = self
            .resolver
            .try_resolve(candidates, &self.graph, &mut self.lifecycle);
        let resolved = report.resolved.clone();
        self.after_resolution(report).await;
        resolved
    }

    /// 发送解析事件、提交贡献并发布，运行时激活时自动启动新解析的模块
    async fn after_resolution(&mut self, report: ResolutionReport) {
        if report.is_empty() {
            return;
        }
        for id in &report.resolved {
            self.env.emit(EventKind::ModuleResolved { module: id.clone() });
        }
        for cycle in &report.cycles {
            self.env.emit(EventKind::CycleDetected {
                cycle: cycle.clone(),
            });
        }
        if !report.resolved.is_empty() {
            self.invalidate_start_order();
            self.offer_extensions(&report.resolved);
        }
        self.flush();

        if !self.framework_active || !self.config.modules.auto_start || report.resolved.is_empty()
        {
            return;
        }
        let fresh: BTreeSet<ModuleIdentity> = report.resolved.iter().cloned().collect();
        let order = resolver::start_order_among(&self.graph, self.lifecycle.modules(), &fresh);
        let batch = self
            .lifecycle
            .cascade_start_all(&order, &self.graph, &mut self.env)
            .await;
        if !batch.is_success() {
            warn!(failed = ?batch.failed(), "新解析模块自动启动失败");
        }
    }

    /// 新解析的模块：先登记等待它们的贡献，再提交它们自己声明的贡献
    fn offer_extensions(&mut self, resolved: &[ModuleIdentity]) {
        for id in resolved {
            let changes = self.env.extensions.target_ready(id);
            self.env.apply_extension_changes(changes);
        }
        for id in resolved {
            let Some(module) = self.lifecycle.get(id) else {
                continue;
            };
            let lifecycle = &self.lifecycle;
            let changes = self.env.extensions.offer(
                id,
                &module.descriptor().contributions,
                |target| lifecycle.state_of(target).map_or(false, |s| s.is_resolved()),
            );
            self.env.apply_extension_changes(changes);
        }
    }

    // ==================== 启动与停止 ====================

    async fn start(&mut self, id: &ModuleIdentity, timeout: Option<Duration>) -> Result<()> {
        if self.lifecycle.state_of(id) == Some(LifecycleState::Installed) {
            if let Some(reason) = self.resolver.explain(id, &self.graph, &self.lifecycle) {
                return Err(reason);
            }
        }
        self.lifecycle
            .start(id, &self.graph, &mut self.env, timeout)
            .await
    }

    async fn start_all(&mut self) -> BatchReport {
        info!("批量启动模块");
        self.env.emit(EventKind::RuntimeStarting);
        let order = self.start_order();
        let report = self
            .lifecycle
            .cascade_start_all(&order, &self.graph, &mut self.env)
            .await;
        self.framework_active = true;
        self.standby = None;
        info!(
            started = report.completed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "批量启动完成"
        );
        self.env.emit(EventKind::RuntimeStarted);
        report
    }

    async fn stop_all(&mut self) -> BatchReport {
        info!("批量停止模块");
        self.env.emit(EventKind::RuntimeStopping);
        self.framework_active = false;
        let report = self
            .lifecycle
            .cascade_stop_all(&self.graph, &mut self.env)
            .await;
        info!(
            stopped = report.completed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "批量停止完成"
        );
        self.env.emit(EventKind::RuntimeStopped);
        report
    }

    async fn standby(&mut self) -> BatchReport {
        if self.standby.is_some() {
            debug!("已处于待机状态");
            return BatchReport::default();
        }
        let active = self.lifecycle.active_modules();
        info!(count = active.len(), "进入待机");
        let report = self.stop_all().await;
        self.standby = Some(active);
        report
    }

    async fn resume(&mut self) -> BatchReport {
        let Some(remembered) = self.standby.take() else {
            debug!("未处于待机状态");
            return BatchReport::default();
        };
        info!(count = remembered.len(), "从待机恢复");

        let remembered: BTreeSet<ModuleIdentity> = remembered.into_iter().collect();
        let order: Vec<ModuleIdentity> = self
            .start_order()
            .iter()
            .filter(|id| remembered.contains(*id))
            .cloned()
            .collect();

        self.env.emit(EventKind::RuntimeStarting);
        let report = self
            .lifecycle
            .cascade_start_listed(&order, &self.graph, &mut self.env)
            .await;
        self.framework_active = true;
        self.env.emit(EventKind::RuntimeStarted);
        report
    }

    async fn shutdown(&mut self) -> BatchReport {
        let timeout = self.config.lifecycle.shutdown_timeout();
        info!(timeout_ms = timeout.as_millis() as u64, "关闭运行时");
        self.env.deadline = Some(Instant::now() + timeout);

        let mut report = self.stop_all().await;
        let reason = "关闭截止时间内未能停止";
        for id in self
            .lifecycle
            .fail_remaining(&self.graph, &mut self.env, reason)
        {
            report
                .failures
                .entry(id.clone())
                .or_insert_with(|| RuntimeError::StopFailure {
                    module: id,
                    reason: reason.to_string(),
                });
        }

        self.standby = None;
        self.env.deadline = None;
        report
    }
}
