//! 薯片模块运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。错误分为两类：
//!
//! - **结构性错误**：请求本身无效（重复标识、卸载不存在的模块等），同步返回给调用方，
//!   不产生任何状态变更
//! - **模块级错误**：只影响单个模块（启动失败、钩子超时、依赖缺失等），
//!   批量操作中按模块收集，不会中断整个批次

use thiserror::Error;

use crate::module::metadata::{LifecycleState, ModuleIdentity};

/// 运行时错误类型
#[derive(Error, Debug)]
pub enum RuntimeError {
    // ==================== 安装与解析错误 ====================
    /// 模块标识重复
    #[error("模块标识重复: '{0}' 已安装")]
    DuplicateIdentity(ModuleIdentity),

    /// 模块未安装
    #[error("模块未安装: '{0}'")]
    ModuleNotFound(String),

    /// 模块被列入黑名单
    #[error("模块已被列入黑名单: '{0}'")]
    Blacklisted(String),

    /// 依赖缺失
    #[error("模块 '{module}' 缺少依赖: {}", join_ids(.missing))]
    MissingDependency {
        module: ModuleIdentity,
        missing: Vec<ModuleIdentity>,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {}", join_cycle(.0))]
    CyclicDependency(Vec<ModuleIdentity>),

    /// 片段宿主不可用
    #[error("片段 '{fragment}' 的宿主 '{host}' 不可用")]
    FragmentHostUnavailable {
        fragment: ModuleIdentity,
        host: ModuleIdentity,
    },

    /// 模块尚未解析
    #[error("模块 '{module}' 尚未解析，等待依赖: {}", join_ids(.waiting_for))]
    NotResolved {
        module: ModuleIdentity,
        waiting_for: Vec<ModuleIdentity>,
    },

    /// 无效的模块标识
    #[error("无效的模块标识: {0}")]
    InvalidIdentity(String),

    /// 无效的模块描述
    #[error("无效的模块描述: {0}")]
    InvalidDescriptor(String),

    // ==================== 生命周期错误 ====================
    /// 当前状态不允许该操作
    #[error("模块 '{module}' 处于 {state} 状态，无法执行 {operation}")]
    InvalidState {
        module: ModuleIdentity,
        state: LifecycleState,
        operation: &'static str,
    },

    /// 片段不能独立启动
    #[error("片段 '{0}' 随宿主生命周期运行，不能独立启动")]
    FragmentNotStartable(ModuleIdentity),

    /// 依赖未激活
    #[error("模块 '{module}' 的依赖 '{dependency}' 未处于激活状态")]
    DependencyNotActive {
        module: ModuleIdentity,
        dependency: ModuleIdentity,
    },

    /// 启动钩子失败
    #[error("模块启动失败: '{module}' - {reason}")]
    StartFailure {
        module: ModuleIdentity,
        reason: String,
    },

    /// 停止钩子失败
    #[error("模块停止失败: '{module}' - {reason}")]
    StopFailure {
        module: ModuleIdentity,
        reason: String,
    },

    /// 钩子执行超时
    #[error("模块 '{module}' 的 {hook} 钩子执行超时 ({timeout_ms} ms)")]
    HookTimeout {
        module: ModuleIdentity,
        hook: &'static str,
        timeout_ms: u64,
    },

    // ==================== 服务注册错误 ====================
    /// 服务所有者未激活
    #[error("服务所有者 '{owner}' 处于 {state} 状态，不能注册服务")]
    ServiceOwnerNotActive {
        owner: ModuleIdentity,
        state: LifecycleState,
    },

    /// 上下文所属的钩子调用已结束，模块已开始新的调用
    #[error("模块 '{module}' 的上下文已过期 (调用序号 {epoch})，不能注册服务")]
    StaleContext { module: ModuleIdentity, epoch: u64 },

    /// 服务注册未找到
    #[error("服务注册未找到: handle {0}")]
    ServiceNotFound(u64),

    // ==================== 事件系统错误 ====================
    /// 订阅未找到
    #[error("订阅未找到: '{0}'")]
    SubscriptionNotFound(String),

    // ==================== 配置错误 ====================
    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue { key: String, reason: String },

    // ==================== IO 和序列化错误 ====================
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================
    /// 运行时已关闭
    #[error("运行时已关闭")]
    RuntimeClosed,

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, RuntimeError>;

fn join_ids(ids: &[ModuleIdentity]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_cycle(ids: &[ModuleIdentity]) -> String {
    let mut parts: Vec<String> = ids.iter().map(ToString::to_string).collect();
    if let Some(first) = parts.first().cloned() {
        parts.push(first);
    }
    parts.join(" -> ")
}

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_DUPLICATE: &str = "MODULE-002";
    pub const MODULE_MISSING_DEPENDENCY: &str = "MODULE-003";
    pub const MODULE_CIRCULAR_DEPENDENCY: &str = "MODULE-004";
    pub const MODULE_FRAGMENT_HOST_UNAVAILABLE: &str = "MODULE-005";
    pub const MODULE_NOT_RESOLVED: &str = "MODULE-006";
    pub const MODULE_INVALID_DESCRIPTOR: &str = "MODULE-007";
    pub const MODULE_BLACKLISTED: &str = "MODULE-008";

    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_INVALID_STATE: &str = "LIFECYCLE-001";
    pub const LIFECYCLE_START_FAILED: &str = "LIFECYCLE-002";
    pub const LIFECYCLE_STOP_FAILED: &str = "LIFECYCLE-003";
    pub const LIFECYCLE_DEPENDENCY_INACTIVE: &str = "LIFECYCLE-004";
    pub const LIFECYCLE_FRAGMENT: &str = "LIFECYCLE-005";

    // 服务错误 (SERVICE-xxx)
    pub const SERVICE_OWNER_INACTIVE: &str = "SERVICE-001";
    pub const SERVICE_NOT_FOUND: &str = "SERVICE-002";
    pub const SERVICE_STALE_CONTEXT: &str = "SERVICE-003";

    // 事件错误 (EVENT-xxx)
    pub const EVENT_SUBSCRIPTION_NOT_FOUND: &str = "EVENT-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 超时错误 (TIMEOUT-xxx)
    pub const TIMEOUT_HOOK: &str = "TIMEOUT-001";

    // 核心错误 (CORE-xxx)
    pub const CORE_CLOSED: &str = "CORE-001";
    pub const CORE_INTERNAL: &str = "CORE-002";
    pub const CORE_INIT_FAILED: &str = "CORE-003";
    pub const CORE_IO: &str = "CORE-004";
    pub const CORE_SERIALIZATION: &str = "CORE-005";
}

impl RuntimeError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::DuplicateIdentity(_) => error_code::MODULE_DUPLICATE,
            RuntimeError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            RuntimeError::Blacklisted(_) => error_code::MODULE_BLACKLISTED,
            RuntimeError::MissingDependency { .. } => error_code::MODULE_MISSING_DEPENDENCY,
            RuntimeError::CyclicDependency(_) => error_code::MODULE_CIRCULAR_DEPENDENCY,
            RuntimeError::FragmentHostUnavailable { .. } => {
                error_code::MODULE_FRAGMENT_HOST_UNAVAILABLE
            }
            RuntimeError::NotResolved { .. } => error_code::MODULE_NOT_RESOLVED,
            RuntimeError::InvalidIdentity(_) | RuntimeError::InvalidDescriptor(_) => {
                error_code::MODULE_INVALID_DESCRIPTOR
            }
            RuntimeError::InvalidState { .. } => error_code::LIFECYCLE_INVALID_STATE,
            RuntimeError::FragmentNotStartable(_) => error_code::LIFECYCLE_FRAGMENT,
            RuntimeError::DependencyNotActive { .. } => error_code::LIFECYCLE_DEPENDENCY_INACTIVE,
            RuntimeError::StartFailure { .. } => error_code::LIFECYCLE_START_FAILED,
            RuntimeError::StopFailure { .. } => error_code::LIFECYCLE_STOP_FAILED,
            RuntimeError::HookTimeout { .. } => error_code::TIMEOUT_HOOK,
            RuntimeError::ServiceOwnerNotActive { .. } => error_code::SERVICE_OWNER_INACTIVE,
            RuntimeError::ServiceNotFound(_) => error_code::SERVICE_NOT_FOUND,
            RuntimeError::StaleContext { .. } => error_code::SERVICE_STALE_CONTEXT,
            RuntimeError::SubscriptionNotFound(_) => error_code::EVENT_SUBSCRIPTION_NOT_FOUND,
            RuntimeError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            RuntimeError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            RuntimeError::Io(_) => error_code::CORE_IO,
            RuntimeError::Json(_) | RuntimeError::Yaml(_) | RuntimeError::VersionParse(_) => {
                error_code::CORE_SERIALIZATION
            }
            RuntimeError::RuntimeClosed => error_code::CORE_CLOSED,
            RuntimeError::Internal(_) | RuntimeError::Other(_) => error_code::CORE_INTERNAL,
            RuntimeError::InitFailed(_) => error_code::CORE_INIT_FAILED,
        }
    }

    /// 是否为结构性错误
    ///
    /// 结构性错误表示请求本身无效，调用方应修正请求；
    /// 其余错误只描述单个模块的状况。
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RuntimeError::DuplicateIdentity(_)
                | RuntimeError::ModuleNotFound(_)
                | RuntimeError::Blacklisted(_)
                | RuntimeError::InvalidIdentity(_)
                | RuntimeError::InvalidDescriptor(_)
                | RuntimeError::InvalidState { .. }
                | RuntimeError::FragmentNotStartable(_)
                | RuntimeError::ServiceNotFound(_)
                | RuntimeError::SubscriptionNotFound(_)
                | RuntimeError::RuntimeClosed
        )
    }

    /// 受影响的模块（如果错误与某个模块相关）
    pub fn module(&self) -> Option<&ModuleIdentity> {
        match self {
            RuntimeError::DuplicateIdentity(module)
            | RuntimeError::FragmentNotStartable(module) => Some(module),
            RuntimeError::MissingDependency { module, .. }
            | RuntimeError::NotResolved { module, .. }
            | RuntimeError::InvalidState { module, .. }
            | RuntimeError::DependencyNotActive { module, .. }
            | RuntimeError::StartFailure { module, .. }
            | RuntimeError::StopFailure { module, .. }
            | RuntimeError::HookTimeout { module, .. }
            | RuntimeError::StaleContext { module, .. } => Some(module),
            RuntimeError::FragmentHostUnavailable { fragment, .. } => Some(fragment),
            RuntimeError::ServiceOwnerNotActive { owner, .. } => Some(owner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ModuleIdentity {
        ModuleIdentity::new(name, "1.0.0").unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = RuntimeError::ModuleNotFound("editor@1.0.0".to_string());
        assert_eq!(err.to_string(), "模块未安装: 'editor@1.0.0'");

        let err = RuntimeError::CyclicDependency(vec![id("x"), id("y"), id("z")]);
        assert_eq!(
            err.to_string(),
            "检测到循环依赖: x@1.0.0 -> y@1.0.0 -> z@1.0.0 -> x@1.0.0"
        );

        let err = RuntimeError::MissingDependency {
            module: id("a"),
            missing: vec![id("b"), id("c")],
        };
        assert!(err.to_string().contains("b@1.0.0, c@1.0.0"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RuntimeError::DuplicateIdentity(id("a")).error_code(),
            error_code::MODULE_DUPLICATE
        );
        assert_eq!(
            RuntimeError::HookTimeout {
                module: id("a"),
                hook: "start",
                timeout_ms: 10
            }
            .error_code(),
            error_code::TIMEOUT_HOOK
        );
        assert_eq!(RuntimeError::RuntimeClosed.error_code(), error_code::CORE_CLOSED);
    }

    #[test]
    fn test_structural_classification() {
        assert!(RuntimeError::DuplicateIdentity(id("a")).is_structural());
        assert!(RuntimeError::ModuleNotFound("a".into()).is_structural());
        assert!(!RuntimeError::StartFailure {
            module: id("a"),
            reason: "boom".into()
        }
        .is_structural());
        assert!(!RuntimeError::CyclicDependency(vec![id("a")]).is_structural());
    }

    #[test]
    fn test_error_module() {
        let err = RuntimeError::StopFailure {
            module: id("b"),
            reason: "boom".into(),
        };
        assert_eq!(err.module(), Some(&id("b")));
        assert_eq!(RuntimeError::RuntimeClosed.module(), None);

        let stale = RuntimeError::StaleContext {
            module: id("c"),
            epoch: 1,
        };
        assert_eq!(stale.module(), Some(&id("c")));
        assert_eq!(stale.error_code(), error_code::SERVICE_STALE_CONTEXT);
    }

    #[test]
    fn test_from_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RuntimeError = io_err.into();
        assert!(matches!(err, RuntimeError::Io(_)));

        let err: RuntimeError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
    }
}
