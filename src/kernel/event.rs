//! 运行时事件
//!
//! 生命周期变化和服务变化都以事件形式通知订阅者。事件名采用
//! `category.name` 形式（如 `module.started`），可用 `module.*` 订阅一类事件。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::module::metadata::ModuleIdentity;
use crate::module::services::ServiceHandle;

/// 事件内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// 模块已安装
    ModuleInstalled { module: ModuleIdentity },
    /// 模块已解析
    ModuleResolved { module: ModuleIdentity },
    /// 模块回退到已安装状态
    ModuleUnresolved { module: ModuleIdentity },
    /// 模块已启动
    ModuleStarted { module: ModuleIdentity },
    /// 启动钩子失败
    ModuleStartFailed { module: ModuleIdentity, reason: String },
    /// 模块已停止
    ModuleStopped { module: ModuleIdentity },
    /// 停止钩子失败
    ModuleStopFailed { module: ModuleIdentity, reason: String },
    /// 钩子超时，模块进入 FAILED
    ModuleFailed {
        module: ModuleIdentity,
        hook: String,
        reason: String,
    },
    /// 模块已卸载
    ModuleUninstalled { module: ModuleIdentity },
    /// 检测到循环依赖
    CycleDetected { cycle: Vec<ModuleIdentity> },
    /// 服务已注册
    ServiceRegistered {
        handle: ServiceHandle,
        interface: String,
        owner: ModuleIdentity,
    },
    /// 服务已注销
    ServiceUnregistered {
        handle: ServiceHandle,
        interface: String,
        owner: ModuleIdentity,
    },
    /// 贡献已登记到目标扩展点
    ExtensionRegistered {
        contributor: ModuleIdentity,
        target: ModuleIdentity,
        point: String,
    },
    /// 目标未解析，贡献进入等待队列
    ExtensionPending {
        contributor: ModuleIdentity,
        target: ModuleIdentity,
        point: String,
    },
    /// 贡献已撤回
    ExtensionUnregistered {
        contributor: ModuleIdentity,
        target: ModuleIdentity,
        point: String,
    },
    /// 批量启动开始
    RuntimeStarting,
    /// 批量启动完成
    RuntimeStarted,
    /// 批量停止开始
    RuntimeStopping,
    /// 批量停止完成
    RuntimeStopped,
}

impl EventKind {
    /// 事件名
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ModuleInstalled { .. } => "module.installed",
            EventKind::ModuleResolved { .. } => "module.resolved",
            EventKind::ModuleUnresolved { .. } => "module.unresolved",
            EventKind::ModuleStarted { .. } => "module.started",
            EventKind::ModuleStartFailed { .. } => "module.start_failed",
            EventKind::ModuleStopped { .. } => "module.stopped",
            EventKind::ModuleStopFailed { .. } => "module.stop_failed",
            EventKind::ModuleFailed { .. } => "module.failed",
            EventKind::ModuleUninstalled { .. } => "module.uninstalled",
            EventKind::CycleDetected { .. } => "module.cycle_detected",
            EventKind::ServiceRegistered { .. } => "service.registered",
            EventKind::ServiceUnregistered { .. } => "service.unregistered",
            EventKind::ExtensionRegistered { .. } => "extension.registered",
            EventKind::ExtensionPending { .. } => "extension.pending",
            EventKind::ExtensionUnregistered { .. } => "extension.unregistered",
            EventKind::RuntimeStarting => "runtime.starting",
            EventKind::RuntimeStarted => "runtime.started",
            EventKind::RuntimeStopping => "runtime.stopping",
            EventKind::RuntimeStopped => "runtime.stopped",
        }
    }

    /// 事件涉及的模块
    pub fn module(&self) -> Option<&ModuleIdentity> {
        match self {
            EventKind::ModuleInstalled { module }
            | EventKind::ModuleResolved { module }
            | EventKind::ModuleUnresolved { module }
            | EventKind::ModuleStarted { module }
            | EventKind::ModuleStartFailed { module, .. }
            | EventKind::ModuleStopped { module }
            | EventKind::ModuleStopFailed { module, .. }
            | EventKind::ModuleFailed { module, .. }
            | EventKind::ModuleUninstalled { module } => Some(module),
            EventKind::ServiceRegistered { owner, .. }
            | EventKind::ServiceUnregistered { owner, .. } => Some(owner),
            EventKind::ExtensionRegistered { contributor, .. }
            | EventKind::ExtensionPending { contributor, .. }
            | EventKind::ExtensionUnregistered { contributor, .. } => Some(contributor),
            _ => None,
        }
    }
}

/// 运行时事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// 发布序号，单调递增
    pub sequence: u64,
    /// 发布时间
    pub timestamp: DateTime<Utc>,
    /// 事件内容
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RuntimeEvent {
    /// 创建事件
    pub fn new(sequence: u64, kind: EventKind) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// 事件名
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// 是否匹配订阅模式
    ///
    /// 支持 `*`、精确名称以及 `prefix.*`。
    pub fn matches(&self, pattern: &str) -> bool {
        matches_pattern(pattern, self.name())
    }
}

/// 匹配模式（支持 * 通配符）
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value.len() > prefix.len() + 1
            && value.starts_with(prefix)
            && value.as_bytes()[prefix.len()] == b'.';
    }

    pattern == value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ModuleIdentity {
        ModuleIdentity::new(name, "1.0.0").unwrap()
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            EventKind::ModuleStarted { module: id("a") }.name(),
            "module.started"
        );
        assert_eq!(
            EventKind::CycleDetected { cycle: vec![id("a")] }.name(),
            "module.cycle_detected"
        );
        assert_eq!(EventKind::RuntimeStopped.name(), "runtime.stopped");
        let pending = EventKind::ExtensionPending {
            contributor: id("spell"),
            target: id("editor"),
            point: "commands".into(),
        };
        assert_eq!(pending.name(), "extension.pending");
        assert_eq!(pending.module(), Some(&id("spell")));
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("*", "module.started"));
        assert!(matches_pattern("module.*", "module.started"));
        assert!(matches_pattern("module.started", "module.started"));
        assert!(!matches_pattern("module.*", "service.registered"));
        assert!(!matches_pattern("module.*", "module"));
        assert!(!matches_pattern("mod.*", "module.started"));
        assert!(!matches_pattern("module.start", "module.started"));
    }

    #[test]
    fn test_event_module() {
        let event = RuntimeEvent::new(
            1,
            EventKind::ServiceRegistered {
                handle: ServiceHandle(3),
                interface: "storage".into(),
                owner: id("a"),
            },
        );
        assert_eq!(event.kind.module(), Some(&id("a")));
        assert!(event.matches("service.*"));
        assert_eq!(RuntimeEvent::new(2, EventKind::RuntimeStarting).kind.module(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = RuntimeEvent::new(7, EventKind::ModuleResolved { module: id("a") });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "module_resolved");
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["module"]["name"], "a");
    }
}
