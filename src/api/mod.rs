//! API 模块
//!
//! 嵌入应用通过 [`ModuleRuntime`] 使用模块运行时。
//!
//! ```rust,no_run
//! use chips_runtime::{ModuleRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder()
//!         .module_dir("./modules")
//!         .log_level("info")
//!         .build();
//!
//!     let runtime = ModuleRuntime::new(config)?;
//!     runtime.install_configured_dirs().await?;
//!     runtime.start_all().await?;
//!     Ok(())
//! }
//! ```

pub mod runtime;

pub use runtime::{ModuleRuntime, RuntimeHealth};
