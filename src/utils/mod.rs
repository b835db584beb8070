//! 工具模块
//!
//! 包含错误类型、标识生成和日志系统。

pub mod error;
pub mod id;
pub mod logger;

// 重导出常用类型
pub use error::{error_code, Result, RuntimeError};
pub use id::{generate_id, generate_subscription_id, is_valid_id};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
