//! 编排循环消息
//!
//! 所有变更请求都以消息形式进入编排循环，每条消息携带一个 `oneshot` 回复通道。
//! 服务写入走单独的无界通道，钩子执行期间编排循环也能处理它们。

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::module::lifecycle::BatchReport;
use crate::module::metadata::ModuleIdentity;
use crate::module::services::{ServiceHandle, ServiceProperties, ServiceRegistration};
use crate::module::source::ModuleSource;
use crate::utils::Result;

/// 回复通道
pub(crate) type Response<T> = oneshot::Sender<Result<T>>;

/// 变更命令
pub(crate) enum Command {
    Install {
        source: Box<dyn ModuleSource>,
        respond_to: Response<ModuleIdentity>,
    },
    Uninstall {
        id: ModuleIdentity,
        respond_to: Response<()>,
    },
    UninstallLocation {
        location: String,
        respond_to: Response<ModuleIdentity>,
    },
    Start {
        id: ModuleIdentity,
        timeout: Option<Duration>,
        respond_to: Response<()>,
    },
    Stop {
        id: ModuleIdentity,
        timeout: Option<Duration>,
        respond_to: Response<()>,
    },
    StartAll {
        respond_to: Response<BatchReport>,
    },
    StopAll {
        respond_to: Response<BatchReport>,
    },
    Resolve {
        respond_to: Response<Vec<ModuleIdentity>>,
    },
    Standby {
        respond_to: Response<BatchReport>,
    },
    Resume {
        respond_to: Response<BatchReport>,
    },
    Shutdown {
        respond_to: Response<BatchReport>,
    },
    /// 视图中没有缓存的启动顺序时由编排循环计算
    StartOrder {
        respond_to: Response<Vec<ModuleIdentity>>,
    },
}

impl Command {
    /// 命令名，用于日志
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Install { .. } => "install",
            Command::Uninstall { .. } => "uninstall",
            Command::UninstallLocation { .. } => "uninstall_location",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::StartAll { .. } => "start_all",
            Command::StopAll { .. } => "stop_all",
            Command::Resolve { .. } => "resolve",
            Command::Standby { .. } => "standby",
            Command::Resume { .. } => "resume",
            Command::Shutdown { .. } => "shutdown",
            Command::StartOrder { .. } => "start_order",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Install { source, .. } => {
                write!(f, "Install({})", source.identity())
            }
            Command::Uninstall { id, .. }
            | Command::Start { id, .. }
            | Command::Stop { id, .. } => write!(f, "{}({})", self.name(), id),
            Command::UninstallLocation { location, .. } => {
                write!(f, "UninstallLocation({})", location)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// 服务写入
#[derive(Debug)]
pub(crate) enum ServiceOp {
    Register {
        owner: ModuleIdentity,
        interface: String,
        properties: ServiceProperties,
        /// 来自钩子上下文时为该次调用的序号
        epoch: Option<u64>,
        respond_to: Response<ServiceRegistration>,
    },
    Unregister {
        handle: ServiceHandle,
        /// 通过模块上下文注销时只允许注销自己的服务
        owner: Option<ModuleIdentity>,
        respond_to: Response<ServiceRegistration>,
    },
}
