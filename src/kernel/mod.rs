//! 运行时内核
//!
//! 编排循环、事件总线和只读视图。所有变更都经由编排循环串行执行。

pub(crate) mod command;
pub mod context;
pub mod event;
pub mod event_bus;
pub(crate) mod orchestrator;
pub mod snapshot;

pub use context::{ModuleContext, ServiceClient};
pub use event::{matches_pattern, EventKind, RuntimeEvent};
pub use event_bus::{EventBus, EventListener, SubscriptionInfo};
pub use snapshot::{RuntimeSnapshot, RuntimeView, SharedView};
