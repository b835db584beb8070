//! 模块管理
//!
//! - `metadata`: 标识、描述、生命周期状态
//! - `source` / `parser` / `activator`: 模块来源、描述解析与启动停止钩子
//! - `dependency`: 依赖图与等待索引
//! - `resolver`: 解析、循环检测、启动顺序
//! - `lifecycle`: 状态机与级联启动停止
//! - `services`: 服务注册表
//! - `extensions`: 扩展点贡献的登记与等待

pub mod activator;
pub mod dependency;
pub mod extensions;
pub mod lifecycle;
pub mod metadata;
pub mod parser;
pub mod resolver;
pub mod services;
pub mod source;

// 重导出常用类型
pub use activator::{FnActivator, ModuleActivator, NoopActivator};
pub use dependency::DependencyGraph;
pub use extensions::{Extension, ExtensionChange, ExtensionRegistry};
pub use lifecycle::{BatchReport, LifecycleController, Module};
pub use metadata::{Contribution, LifecycleState, ModuleDescriptor, ModuleIdentity, ModuleInfo};
pub use parser::{ModuleParser, DESCRIPTOR_FILENAME};
pub use resolver::{ResolutionReport, Resolver};
pub use services::{
    ServiceHandle, ServiceProperties, ServiceRegistration, ServiceRegistry, SERVICE_RANKING,
};
pub use source::{ContentHandle, DirectorySource, InMemorySource, ModuleSource};
