//! 模块上下文
//!
//! 钩子通过 [`ModuleContext`] 注册和查找服务。注册请求发往编排循环，
//! 查找直接读取共享视图。

use tokio::sync::{mpsc, oneshot};

use crate::kernel::command::ServiceOp;
use crate::kernel::snapshot::{RuntimeSnapshot, SharedView};
use crate::module::extensions::Extension;
use crate::module::metadata::{LifecycleState, ModuleIdentity};
use crate::module::services::{ServiceHandle, ServiceProperties, ServiceRegistration};
use crate::utils::{Result, RuntimeError};

/// 服务客户端
///
/// 写入经由编排循环串行化，读取走共享视图，永不阻塞。
#[derive(Clone)]
pub struct ServiceClient {
    ops: mpsc::UnboundedSender<ServiceOp>,
    view: SharedView,
}

impl ServiceClient {
    pub(crate) fn new(ops: mpsc::UnboundedSender<ServiceOp>, view: SharedView) -> Self {
        Self { ops, view }
    }

    /// 以 `owner` 的名义注册服务
    ///
    /// 返回时新注册已出现在视图中。
    pub async fn register(
        &self,
        owner: ModuleIdentity,
        interface: impl Into<String>,
        properties: ServiceProperties,
    ) -> Result<ServiceRegistration> {
        self.send_register(owner, interface.into(), properties, None)
            .await
    }

    pub(crate) async fn send_register(
        &self,
        owner: ModuleIdentity,
        interface: String,
        properties: ServiceProperties,
        epoch: Option<u64>,
    ) -> Result<ServiceRegistration> {
        let (respond_to, response) = oneshot::channel();
        self.ops
            .send(ServiceOp::Register {
                owner,
                interface,
                properties,
                epoch,
                respond_to,
            })
            .map_err(|_| RuntimeError::RuntimeClosed)?;
        response.await.map_err(|_| RuntimeError::RuntimeClosed)?
    }

    /// 注销服务，`owner` 非空时只能注销该模块自己的服务
    pub async fn unregister(
        &self,
        handle: ServiceHandle,
        owner: Option<ModuleIdentity>,
    ) -> Result<ServiceRegistration> {
        let (respond_to, response) = oneshot::channel();
        self.ops
            .send(ServiceOp::Unregister {
                handle,
                owner,
                respond_to,
            })
            .map_err(|_| RuntimeError::RuntimeClosed)?;
        response.await.map_err(|_| RuntimeError::RuntimeClosed)?
    }

    /// 查找最佳匹配
    pub fn lookup(&self, interface: &str) -> Option<ServiceRegistration> {
        self.view.lookup_service(interface)
    }

    /// 查找全部匹配，按优先级降序
    pub fn lookup_all(&self, interface: &str) -> Vec<ServiceRegistration> {
        self.view.lookup_services(interface)
    }

    /// 现取一份快照
    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.view.snapshot()
    }
}

/// 模块上下文，传给启动 / 停止钩子
///
/// 每个上下文绑定一次钩子调用。模块之后再次调用钩子，旧上下文的服务注册会被拒绝。
#[derive(Clone)]
pub struct ModuleContext {
    identity: ModuleIdentity,
    epoch: u64,
    services: ServiceClient,
}

impl ModuleContext {
    pub(crate) fn new(identity: ModuleIdentity, epoch: u64, services: ServiceClient) -> Self {
        Self {
            identity,
            epoch,
            services,
        }
    }

    /// 当前模块标识
    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    /// 本上下文所属的钩子调用序号
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 注册服务
    ///
    /// 只有处于 STARTING / ACTIVE 的模块可以注册，否则返回 `ServiceOwnerNotActive`；
    /// 模块已开始新的钩子调用时返回 `StaleContext`。
    pub async fn register_service(
        &self,
        interface: impl Into<String>,
        properties: ServiceProperties,
    ) -> Result<ServiceHandle> {
        self.services
            .send_register(
                self.identity.clone(),
                interface.into(),
                properties,
                Some(self.epoch),
            )
            .await
            .map(|registration| registration.handle)
    }

    /// 注销本模块注册的服务
    pub async fn unregister_service(&self, handle: ServiceHandle) -> Result<()> {
        self.services
            .unregister(handle, Some(self.identity.clone()))
            .await
            .map(|_| ())
    }

    /// 查找服务
    pub fn lookup_service(&self, interface: &str) -> Option<ServiceRegistration> {
        self.services.lookup(interface)
    }

    /// 查找全部服务
    pub fn lookup_services(&self, interface: &str) -> Vec<ServiceRegistration> {
        self.services.lookup_all(interface)
    }

    /// 其他模块对本模块扩展点 `point` 的已登记贡献，按提交顺序
    pub fn extensions(&self, point: &str) -> Vec<Extension> {
        self.services.view.extensions(&self.identity, point)
    }

    /// 查询模块状态
    pub fn state_of(&self, id: &ModuleIdentity) -> Option<LifecycleState> {
        self.services.view.state_of(id)
    }

    /// 当前模块状态
    pub fn state(&self) -> Option<LifecycleState> {
        self.state_of(&self.identity)
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("identity", &self.identity.to_string())
            .field("epoch", &self.epoch)
            .finish()
    }
}
