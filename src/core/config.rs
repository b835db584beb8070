//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。配置可以从 YAML / JSON 文件加载，
//! 也可以通过 [`RuntimeConfigBuilder`] 在代码中构建。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::{Result, RuntimeError};

/// 生命周期配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// 单个启动 / 停止钩子的默认超时时间（毫秒）
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,

    /// 关闭运行时的全局截止时间（毫秒）
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_hook_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hook_timeout_ms: default_hook_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl LifecycleConfig {
    /// 钩子超时时间
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    /// 关闭截止时间
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// 事件分发配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    /// 每个监听器的事件队列容量，溢出时丢弃最旧的事件
    #[serde(default = "default_listener_queue_size")]
    pub listener_queue_size: usize,

    /// 单次监听器回调超时时间（毫秒）
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_listener_queue_size() -> usize {
    256
}

fn default_handler_timeout_ms() -> u64 {
    5_000
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            listener_queue_size: default_listener_queue_size(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

/// 编排循环配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// 命令队列容量
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,
}

fn default_command_queue_size() -> usize {
    1024
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            command_queue_size: default_command_queue_size(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 模块管理配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 模块目录列表（每个子目录包含一个 module.yaml）
    #[serde(default)]
    pub module_dirs: Vec<PathBuf>,

    /// 黑名单：这些名称的模块会被拒绝安装
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// 运行时激活后，新解析的自动启动模块是否立即启动
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            module_dirs: vec![],
            blacklist: vec![],
            auto_start: true,
        }
    }
}

impl ModuleConfig {
    /// 模块名称是否在黑名单中
    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.iter().any(|n| n == name)
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 生命周期配置
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// 事件配置
    #[serde(default)]
    pub events: EventConfig,

    /// 编排循环配置
    #[serde(default)]
    pub kernel: KernelConfig,

    /// 模块管理配置
    #[serde(default)]
    pub modules: ModuleConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// 扩展名为 `.json` 时按 JSON 解析，其余按 YAML 解析。
    ///
    /// # 错误
    ///
    /// 文件无法读取、格式错误或取值无效时返回错误
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            RuntimeError::ConfigLoadFailed(format!("无法读取 {}: {}", path.display(), e))
        })?;

        let mut config: RuntimeConfig =
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 5] = [
            ("lifecycle.hook_timeout_ms", self.lifecycle.hook_timeout_ms > 0),
            (
                "lifecycle.shutdown_timeout_ms",
                self.lifecycle.shutdown_timeout_ms > 0,
            ),
            (
                "events.listener_queue_size",
                self.events.listener_queue_size > 0,
            ),
            ("events.handler_timeout_ms", self.events.handler_timeout_ms > 0),
            (
                "kernel.command_queue_size",
                self.kernel.command_queue_size > 0,
            ),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((key, _)) => Err(RuntimeError::InvalidConfigValue {
                key: key.to_string(),
                reason: "必须大于 0".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// 合并另一个配置（用于覆盖）
    ///
    /// 只覆盖对方显式设置为非默认值的配置项，列表类配置追加。
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.lifecycle.hook_timeout_ms != default_hook_timeout_ms() {
            self.lifecycle.hook_timeout_ms = other.lifecycle.hook_timeout_ms;
        }
        if other.lifecycle.shutdown_timeout_ms != default_shutdown_timeout_ms() {
            self.lifecycle.shutdown_timeout_ms = other.lifecycle.shutdown_timeout_ms;
        }
        if other.events.listener_queue_size != default_listener_queue_size() {
            self.events.listener_queue_size = other.events.listener_queue_size;
        }
        if other.events.handler_timeout_ms != default_handler_timeout_ms() {
            self.events.handler_timeout_ms = other.events.handler_timeout_ms;
        }
        if other.kernel.command_queue_size != default_command_queue_size() {
            self.kernel.command_queue_size = other.kernel.command_queue_size;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if !other.modules.auto_start {
            self.modules.auto_start = false;
        }
        for dir in other.modules.module_dirs {
            if !self.modules.module_dirs.contains(&dir) {
                self.modules.module_dirs.push(dir);
            }
        }
        for name in other.modules.blacklist {
            if !self.modules.is_blacklisted(&name) {
                self.modules.blacklist.push(name);
            }
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置钩子超时时间
    pub fn hook_timeout(mut self, timeout: Duration) -> Self {
        self.config.lifecycle.hook_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置关闭截止时间
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.lifecycle.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置监听器队列容量
    pub fn listener_queue_size(mut self, size: usize) -> Self {
        self.config.events.listener_queue_size = size;
        self
    }

    /// 设置监听器回调超时时间
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.events.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置命令队列容量
    pub fn command_queue_size(mut self, size: usize) -> Self {
        self.config.kernel.command_queue_size = size;
        self
    }

    /// 添加模块目录
    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules.module_dirs.push(dir.into());
        self
    }

    /// 将模块名称加入黑名单
    pub fn blacklist(mut self, name: impl Into<String>) -> Self {
        self.config.modules.blacklist.push(name.into());
        self
    }

    /// 关闭运行时激活后的自动启动
    pub fn manual_start(mut self) -> Self {
        self.config.modules.auto_start = false;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
