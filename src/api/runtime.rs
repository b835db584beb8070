//! 运行时门面
//!
//! [`ModuleRuntime`] 是嵌入应用访问模块运行时的唯一入口：
//!
//! - 变更操作（安装、卸载、启动、停止）发往编排循环，按到达顺序执行
//! - 查询操作读取共享视图，不阻塞编排循环
//! - 事件订阅交给事件总线，回调异步执行
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::{InMemorySource, ModuleDescriptor, ModuleIdentity, ModuleRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ModuleRuntime::new(RuntimeConfig::default())?;
//!
//!     let core = ModuleIdentity::new("core", "1.0.0")?;
//!     let editor = ModuleIdentity::new("editor", "1.0.0")?;
//!     runtime
//!         .install(InMemorySource::new(ModuleDescriptor::new(editor.clone()).requires(core.clone())))
//!         .await?;
//!     runtime.install(InMemorySource::new(ModuleDescriptor::new(core))).await?;
//!
//!     let report = runtime.start_all().await?;
//!     assert!(report.is_success());
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::RuntimeConfig;
use crate::kernel::command::{Command, Response};
use crate::kernel::event::RuntimeEvent;
use crate::kernel::event_bus::{EventBus, SubscriptionInfo};
use crate::kernel::orchestrator;
use crate::kernel::snapshot::{RuntimeSnapshot, RuntimeView, SharedView};
use crate::kernel::context::ServiceClient;
use crate::module::extensions::Extension;
use crate::module::lifecycle::BatchReport;
use crate::module::metadata::{LifecycleState, ModuleIdentity, ModuleInfo};
use crate::module::services::{ServiceHandle, ServiceProperties, ServiceRegistration};
use crate::module::source::{DirectorySource, ModuleSource};
use crate::utils::{Result, RuntimeError};

/// 模块运行时
pub struct ModuleRuntime {
    config: RuntimeConfig,
    commands: mpsc::Sender<Command>,
    services: ServiceClient,
    view: SharedView,
    events: Arc<EventBus>,
    kernel: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl ModuleRuntime {
    /// 创建运行时并启动编排循环
    ///
    /// 必须在 tokio 运行时中调用。
    ///
    /// # Errors
    ///
    /// 配置无效或不在 tokio 运行时中时返回错误
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(RuntimeError::InitFailed(
                "ModuleRuntime 必须在 tokio 运行时中创建".to_string(),
            ));
        }

        info!("初始化模块运行时 v{}", crate::VERSION);
        let handle = orchestrator::spawn(config.clone());
        debug!(
            command_queue_size = config.kernel.command_queue_size,
            listener_queue_size = config.events.listener_queue_size,
            "编排循环已创建"
        );

        Ok(Self {
            config,
            commands: handle.commands,
            services: handle.services,
            view: handle.view,
            events: handle.events,
            kernel: Mutex::new(Some(handle.task)),
            started_at: Instant::now(),
        })
    }

    async fn request<T>(&self, make: impl FnOnce(Response<T>) -> Command) -> Result<T> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(make(respond_to))
            .await
            .map_err(|_| RuntimeError::RuntimeClosed)?;
        response.await.map_err(|_| RuntimeError::RuntimeClosed)?
    }

    fn live_view(&self) -> Result<&RuntimeView> {
        if self.commands.is_closed() {
            return Err(RuntimeError::RuntimeClosed);
        }
        Ok(&self.view)
    }

    // ========================================================================
    // 安装与卸载
    // ========================================================================

    /// 安装模块
    ///
    /// 安装后立即尝试解析该模块以及等待它的模块。依赖缺失不是错误，
    /// 模块停留在 INSTALLED 直到依赖出现。
    ///
    /// # Errors
    ///
    /// 标识重复、描述无效或名称在黑名单中时返回错误，已有状态不变
    pub async fn install(&self, source: impl ModuleSource + 'static) -> Result<ModuleIdentity> {
        self.install_boxed(Box::new(source)).await
    }

    /// 安装已装箱的来源
    pub async fn install_boxed(&self, source: Box<dyn ModuleSource>) -> Result<ModuleIdentity> {
        self.request(|respond_to| Command::Install { source, respond_to })
            .await
    }

    /// 扫描目录并安装其中的全部模块
    ///
    /// 单个模块安装失败只记录警告，返回成功安装的模块。
    pub async fn install_dir(&self, dir: &Path) -> Result<Vec<ModuleIdentity>> {
        let mut installed = Vec::new();
        for source in DirectorySource::scan(dir).await? {
            let location = source.root().display().to_string();
            match self.install(source).await {
                Ok(id) => installed.push(id),
                Err(RuntimeError::RuntimeClosed) => return Err(RuntimeError::RuntimeClosed),
                Err(e) => warn!(location = %location, error = %e, "模块安装失败"),
            }
        }
        Ok(installed)
    }

    /// 安装配置中所有模块目录下的模块
    pub async fn install_configured_dirs(&self) -> Result<Vec<ModuleIdentity>> {
        let mut installed = Vec::new();
        for dir in &self.config.modules.module_dirs {
            installed.extend(self.install_dir(dir).await?);
        }
        info!(count = installed.len(), "模块目录扫描完成");
        Ok(installed)
    }

    /// 卸载模块
    ///
    /// 依赖者和附着的片段回退到 INSTALLED。
    ///
    /// # Errors
    ///
    /// 模块不存在时返回 `ModuleNotFound`，不做任何变更
    pub async fn uninstall(&self, id: &ModuleIdentity) -> Result<()> {
        let id = id.clone();
        self.request(|respond_to| Command::Uninstall { id, respond_to })
            .await
    }

    /// 按来源位置卸载模块，返回被卸载的模块
    pub async fn uninstall_location(&self, location: impl Into<String>) -> Result<ModuleIdentity> {
        let location = location.into();
        self.request(|respond_to| Command::UninstallLocation {
            location,
            respond_to,
        })
        .await
    }

    /// 对所有 INSTALLED 模块再尝试一次解析，返回新解析的模块
    pub async fn resolve(&self) -> Result<Vec<ModuleIdentity>> {
        self.request(|respond_to| Command::Resolve { respond_to })
            .await
    }

    // ========================================================================
    // 启动与停止
    // ========================================================================

    /// 启动模块，使用默认钩子超时
    pub async fn start(&self, id: &ModuleIdentity) -> Result<()> {
        self.start_inner(id, None).await
    }

    /// 启动模块，使用指定的钩子超时
    pub async fn start_with_timeout(&self, id: &ModuleIdentity, timeout: Duration) -> Result<()> {
        self.start_inner(id, Some(timeout)).await
    }

    async fn start_inner(&self, id: &ModuleIdentity, timeout: Option<Duration>) -> Result<()> {
        let id = id.clone();
        self.request(|respond_to| Command::Start {
            id,
            timeout,
            respond_to,
        })
        .await
    }

    /// 停止模块，先停止仍处于 ACTIVE 的依赖者
    pub async fn stop(&self, id: &ModuleIdentity) -> Result<()> {
        self.stop_inner(id, None).await
    }

    /// 停止模块，使用指定的钩子超时
    pub async fn stop_with_timeout(&self, id: &ModuleIdentity, timeout: Duration) -> Result<()> {
        self.stop_inner(id, Some(timeout)).await
    }

    async fn stop_inner(&self, id: &ModuleIdentity, timeout: Option<Duration>) -> Result<()> {
        let id = id.clone();
        self.request(|respond_to| Command::Stop {
            id,
            timeout,
            respond_to,
        })
        .await
    }

    /// 按解析顺序启动所有自动启动模块
    ///
    /// 单个模块的失败记录在报告中，不会中断批次。之后新解析的自动启动模块会立即启动。
    pub async fn start_all(&self) -> Result<BatchReport> {
        self.request(|respond_to| Command::StartAll { respond_to })
            .await
    }

    /// 按启动逆序停止所有模块
    pub async fn stop_all(&self) -> Result<BatchReport> {
        self.request(|respond_to| Command::StopAll { respond_to })
            .await
    }

    /// 进入待机：停止全部模块并记住哪些处于 ACTIVE
    pub async fn standby(&self) -> Result<BatchReport> {
        self.request(|respond_to| Command::Standby { respond_to })
            .await
    }

    /// 从待机恢复：重新启动待机前处于 ACTIVE 的模块
    pub async fn resume(&self) -> Result<BatchReport> {
        self.request(|respond_to| Command::Resume { respond_to })
            .await
    }

    /// 关闭运行时
    ///
    /// 在关闭截止时间内停止所有模块，未能停止的模块标记为 FAILED。
    /// 之后所有操作返回 `RuntimeClosed`。
    pub async fn shutdown(&self) -> Result<BatchReport> {
        let report = self
            .request(|respond_to| Command::Shutdown { respond_to })
            .await?;

        if let Some(task) = self.kernel.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "编排循环异常退出");
            }
        }
        self.events.clear().await;

        info!(
            stopped = report.completed.len(),
            failed = report.failures.len(),
            "模块运行时已关闭"
        );
        Ok(report)
    }

    /// 编排循环是否已退出
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 查询模块信息
    pub fn query(&self, id: &ModuleIdentity) -> Result<ModuleInfo> {
        self.live_view()?
            .module(id)
            .map(|info| info.as_ref().clone())
            .ok_or_else(|| RuntimeError::ModuleNotFound(id.to_string()))
    }

    /// 查询模块状态
    pub fn state(&self, id: &ModuleIdentity) -> Result<LifecycleState> {
        self.live_view()?
            .state_of(id)
            .ok_or_else(|| RuntimeError::ModuleNotFound(id.to_string()))
    }

    /// 所有已安装模块，按标识排序
    pub fn modules(&self) -> Result<Vec<ModuleInfo>> {
        Ok(self
            .live_view()?
            .modules()
            .into_iter()
            .map(|info| info.as_ref().clone())
            .collect())
    }

    /// 尚未安装的标识 -> 等待它的模块
    pub fn pending_requirements(&self) -> Result<BTreeMap<ModuleIdentity, Vec<ModuleIdentity>>> {
        Ok(self.live_view()?.pending())
    }

    /// 最近一次启动失败或超时的模块
    pub fn start_failures(&self) -> Result<Vec<ModuleInfo>> {
        Ok(self
            .live_view()?
            .modules()
            .into_iter()
            .filter(|info| info.start_failed)
            .map(|info| info.as_ref().clone())
            .collect())
    }

    /// 现取一份整体快照
    pub fn snapshot(&self) -> Result<RuntimeSnapshot> {
        Ok(self.live_view()?.snapshot())
    }

    /// 已解析非片段模块的启动顺序
    ///
    /// 拓扑未变化时直接读取缓存，否则由编排循环重算。
    pub async fn start_order(&self) -> Result<Vec<ModuleIdentity>> {
        if let Some(order) = self.live_view()?.cached_start_order() {
            return Ok(order.to_vec());
        }
        self.request(|respond_to| Command::StartOrder { respond_to })
            .await
    }

    // ========================================================================
    // 扩展
    // ========================================================================

    /// 目标模块扩展点 `point` 上已登记的贡献，按提交顺序
    pub fn extensions(&self, target: &ModuleIdentity, point: &str) -> Result<Vec<Extension>> {
        Ok(self.live_view()?.extensions(target, point))
    }

    /// 等待目标解析的贡献：目标 -> 贡献
    pub fn pending_contributions(&self) -> Result<BTreeMap<ModuleIdentity, Vec<Extension>>> {
        Ok(self.live_view()?.pending_extensions())
    }

    // ========================================================================
    // 服务
    // ========================================================================

    /// 查找接口的最佳服务
    pub fn lookup_service(&self, interface: &str) -> Result<Option<ServiceRegistration>> {
        Ok(self.live_view()?.lookup_service(interface))
    }

    /// 查找接口的全部服务，按优先级降序
    pub fn lookup_services(&self, interface: &str) -> Result<Vec<ServiceRegistration>> {
        Ok(self.live_view()?.lookup_services(interface))
    }

    /// 以 `owner` 的名义注册服务，`owner` 必须处于 STARTING 或 ACTIVE
    pub async fn register_service(
        &self,
        owner: &ModuleIdentity,
        interface: impl Into<String>,
        properties: ServiceProperties,
    ) -> Result<ServiceRegistration> {
        if self.is_closed() {
            return Err(RuntimeError::RuntimeClosed);
        }
        self.services
            .register(owner.clone(), interface, properties)
            .await
    }

    /// 注销服务
    pub async fn unregister_service(&self, handle: ServiceHandle) -> Result<ServiceRegistration> {
        if self.is_closed() {
            return Err(RuntimeError::RuntimeClosed);
        }
        self.services.unregister(handle, None).await
    }

    // ========================================================================
    // 事件
    // ========================================================================

    /// 订阅事件
    ///
    /// 支持 `*`、精确名称（如 `module.started`）以及 `module.*`。
    /// 回调在独立任务中按发布顺序执行，慢回调不会阻塞运行时。
    pub async fn subscribe<F>(&self, pattern: impl Into<String>, listener: F) -> Result<String>
    where
        F: Fn(RuntimeEvent) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(RuntimeError::RuntimeClosed);
        }
        self.events.subscribe(pattern, Arc::new(listener)).await
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if self.is_closed() {
            return Err(RuntimeError::RuntimeClosed);
        }
        self.events.unsubscribe(subscription_id).await
    }

    /// 当前订阅
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.events.subscriptions().await
    }

    /// 原始事件流
    pub fn events(&self) -> Result<broadcast::Receiver<RuntimeEvent>> {
        if self.is_closed() {
            return Err(RuntimeError::RuntimeClosed);
        }
        Ok(self.events.receiver())
    }

    // ========================================================================
    // 状态
    // ========================================================================

    /// 运行时配置
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 运行时间
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 健康状态
    pub async fn health(&self) -> RuntimeHealth {
        let view = &self.view;
        let modules = view.modules();
        let mut states = BTreeMap::new();
        for info in &modules {
            *states.entry(info.state.as_str()).or_insert(0) += 1;
        }

        RuntimeHealth {
            closed: self.is_closed(),
            uptime_secs: self.uptime().as_secs(),
            generation: view.generation(),
            modules: modules.len(),
            states,
            services: view.service_count(),
            pending_requirements: view.pending_count(),
            pending_contributions: view
                .pending_extensions()
                .values()
                .map(Vec::len)
                .sum(),
            event_subscriptions: self.events.subscription_count().await,
            events_published: self.events.published(),
        }
    }
}

impl Drop for ModuleRuntime {
    fn drop(&mut self) {
        debug!("模块运行时句柄被释放");
    }
}

impl std::fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("closed", &self.is_closed())
            .field("generation", &self.view.generation())
            .finish()
    }
}

// ============================================================================
// 健康信息
// ============================================================================

/// 健康状态信息
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// 编排循环是否已退出
    pub closed: bool,
    /// 运行时间（秒）
    pub uptime_secs: u64,
    /// 视图版本
    pub generation: u64,
    /// 已安装模块数
    pub modules: usize,
    /// 各状态的模块数
    pub states: BTreeMap<&'static str, usize>,
    /// 已注册服务数
    pub services: usize,
    /// 仍被等待的标识数
    pub pending_requirements: usize,
    /// 等待目标解析的贡献数
    pub pending_contributions: usize,
    /// 事件订阅数
    pub event_subscriptions: usize,
    /// 已发布事件数
    pub events_published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::ModuleDescriptor;
    use crate::module::source::InMemorySource;

    fn id(name: &str) -> ModuleIdentity {
        ModuleIdentity::new(name, "1.0.0").unwrap()
    }

    #[tokio::test]
    async fn test_runtime_creation() {
        let runtime = ModuleRuntime::new(RuntimeConfig::default()).unwrap();
        assert!(!runtime.is_closed());
        assert!(runtime.modules().unwrap().is_empty());
    }

    #[test]
    fn test_creation_outside_tokio() {
        let err = ModuleRuntime::new(RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::InitFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RuntimeConfig::builder()
            .hook_timeout(Duration::ZERO)
            .build();
        assert!(ModuleRuntime::new(config).is_err());
    }

    #[tokio::test]
    async fn test_query_and_health() {
        let runtime = ModuleRuntime::new(RuntimeConfig::default()).unwrap();
        runtime
            .install(InMemorySource::new(ModuleDescriptor::new(id("b")).requires(id("a"))))
            .await
            .unwrap();

        let info = runtime.query(&id("b")).unwrap();
        assert_eq!(info.state, LifecycleState::Installed);
        assert_eq!(info.missing, vec![id("a")]);
        assert_eq!(
            runtime.pending_requirements().unwrap().get(&id("a")),
            Some(&vec![id("b")])
        );
        assert!(matches!(
            runtime.query(&id("zzz")),
            Err(RuntimeError::ModuleNotFound(_))
        ));

        let health = runtime.health().await;
        assert_eq!(health.modules, 1);
        assert_eq!(health.states.get("INSTALLED"), Some(&1));
        assert_eq!(health.pending_requirements, 1);
        assert!(health.events_published >= 1);
    }

    #[tokio::test]
    async fn test_start_order_and_contributions() {
        let runtime = ModuleRuntime::new(RuntimeConfig::default()).unwrap();
        runtime
            .install(InMemorySource::new(
                ModuleDescriptor::new(id("b"))
                    .requires(id("a"))
                    .contributes(id("a"), "menus", serde_json::json!("open")),
            ))
            .await
            .unwrap();
        // b 尚未解析，贡献还没有提交
        assert!(runtime.pending_contributions().unwrap().is_empty());
        runtime
            .install(InMemorySource::new(
                ModuleDescriptor::new(id("c")).contributes(id("z"), "menus", serde_json::json!(1)),
            ))
            .await
            .unwrap();
        assert_eq!(runtime.pending_contributions().unwrap()[&id("z")].len(), 1);
        assert_eq!(runtime.health().await.pending_contributions, 1);

        runtime
            .install(InMemorySource::new(ModuleDescriptor::new(id("a"))))
            .await
            .unwrap();
        assert_eq!(
            runtime.start_order().await.unwrap(),
            vec![id("a"), id("b"), id("c")]
        );
        let menus = runtime.extensions(&id("a"), "menus").unwrap();
        assert_eq!(menus.len(), 1);
        assert_eq!(menus[0].payload, serde_json::json!("open"));
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let runtime = ModuleRuntime::new(RuntimeConfig::default()).unwrap();
        runtime.shutdown().await.unwrap();

        assert!(runtime.is_closed());
        assert!(matches!(
            runtime.start_all().await,
            Err(RuntimeError::RuntimeClosed)
        ));
        assert!(matches!(
            runtime.modules(),
            Err(RuntimeError::RuntimeClosed)
        ));
        assert!(matches!(
            runtime.lookup_service("x"),
            Err(RuntimeError::RuntimeClosed)
        ));
        assert!(matches!(
            runtime.subscribe("*", |_| {}).await,
            Err(RuntimeError::RuntimeClosed)
        ));
        assert!(matches!(
            runtime.shutdown().await,
            Err(RuntimeError::RuntimeClosed)
        ));
    }
}
