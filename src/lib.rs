//! # Chips Runtime - 薯片模块运行时
//!
//! 可插拔模块的运行时核心，提供以下功能：
//!
//! - **依赖图**: 维护模块之间的依赖边和片段宿主关系，支持任意安装顺序
//! - **解析器**: 判定模块何时可解析，检测循环依赖，给出确定的启动顺序
//! - **生命周期**: 驱动每个模块的状态机，级联启动和停止，隔离单个模块的失败
//! - **服务注册表**: 模块在运行期间发布和查找服务
//! - **事件**: 生命周期和服务变化以事件形式异步通知订阅者
//!
//! 所有变更都经由单个编排循环串行执行，查询读取无锁快照。
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_runtime::{FnActivator, InMemorySource, ModuleDescriptor, ModuleIdentity, ModuleRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ModuleRuntime::new(RuntimeConfig::default())?;
//!
//!     let activator = FnActivator::new().on_start(|ctx| async move {
//!         ctx.register_service("greeter", Default::default()).await?;
//!         anyhow::Ok(())
//!     });
//!     let id = ModuleIdentity::new("greeter", "1.0.0")?;
//!     runtime
//!         .install(InMemorySource::new(ModuleDescriptor::new(id)).with_activator(activator))
//!         .await?;
//!
//!     runtime.start_all().await?;
//!     assert!(runtime.lookup_service("greeter")?.is_some());
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块模型、依赖图、解析器、生命周期、服务注册表
//! - `kernel` - 编排循环、事件总线、快照
//! - `api` - 运行时门面
//! - `core` - 运行时配置
//! - `utils` - 错误类型、标识生成和日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod kernel;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{ModuleRuntime, RuntimeHealth};

pub use kernel::{
    EventKind, ModuleContext, RuntimeEvent, RuntimeSnapshot, RuntimeView, SubscriptionInfo,
};

pub use module::{
    BatchReport, ContentHandle, Contribution, DirectorySource, Extension, FnActivator,
    InMemorySource, LifecycleState, ModuleActivator, ModuleDescriptor, ModuleIdentity, ModuleInfo,
    ModuleSource, NoopActivator, ServiceHandle, ServiceProperties, ServiceRegistration,
    SERVICE_RANKING,
};

pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, generate_id, Result, RuntimeError};

pub use crate::core::config::{
    EventConfig, KernelConfig, LifecycleConfig, LogConfig, ModuleConfig, RuntimeConfig,
    RuntimeConfigBuilder,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
