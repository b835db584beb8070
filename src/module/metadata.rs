//! 模块元数据定义
//!
//! 定义模块标识、模块描述、生命周期状态以及对外查询使用的模块信息。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::utils::{Result, RuntimeError};

/// 模块标识
///
/// 由符号名和精确版本组成，全局唯一，创建后不可变。依赖匹配按标识精确相等进行，
/// 不做版本范围求解。
///
/// 反序列化同样经过名称校验，接受 `{"name": ..., "version": ...}` 和 `"name@version"` 两种形式。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "IdentityRepr")]
pub struct ModuleIdentity {
    name: String,
    version: Version,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdentityRepr {
    Text(String),
    Fields { name: String, version: Version },
}

impl TryFrom<IdentityRepr> for ModuleIdentity {
    type Error = RuntimeError;

    fn try_from(repr: IdentityRepr) -> Result<Self> {
        match repr {
            IdentityRepr::Text(text) => Self::parse(&text),
            IdentityRepr::Fields { name, version } => Self::with_version(name, version),
        }
    }
}

impl ModuleIdentity {
    /// 创建模块标识
    ///
    /// # 错误
    ///
    /// 名称格式无效时返回 `InvalidIdentity`，版本号不是 semver 格式时返回 `VersionParse`
    pub fn new(name: impl Into<String>, version: &str) -> Result<Self> {
        let name = name.into();
        Self::validate_name(&name)?;
        Ok(Self {
            name,
            version: Version::parse(version.trim())?,
        })
    }

    /// 使用已解析的版本创建模块标识
    pub fn with_version(name: impl Into<String>, version: Version) -> Result<Self> {
        let name = name.into();
        Self::validate_name(&name)?;
        Ok(Self { name, version })
    }

    /// 解析 `name@version` 形式的标识
    pub fn parse(text: &str) -> Result<Self> {
        let (name, version) = text
            .trim()
            .split_once('@')
            .ok_or_else(|| RuntimeError::InvalidIdentity(format!("缺少版本号: '{}'", text)))?;
        Self::new(name, version)
    }

    /// 符号名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 版本号
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// 名称规则：字母开头，只包含字母、数字、下划线、连字符和点
    fn validate_name(name: &str) -> Result<()> {
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            }
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(RuntimeError::InvalidIdentity(format!(
                "模块名称 '{}' 格式无效，须以字母开头，只允许字母、数字、'_'、'-'、'.'",
                name
            )))
        }
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for ModuleIdentity {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// 模块描述
///
/// 由外部解析器产生的不可变值，安装后归模块独占。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// 模块标识
    pub identity: ModuleIdentity,

    /// 按声明顺序排列的依赖
    #[serde(default)]
    pub requires: Vec<ModuleIdentity>,

    /// 片段宿主（该模块为片段时）
    #[serde(default)]
    pub fragment_host: Option<ModuleIdentity>,

    /// 运行时激活后是否自动启动
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    /// 对其他模块扩展点的贡献
    #[serde(default)]
    pub contributions: Vec<Contribution>,
}

/// 对目标模块命名扩展点的一项贡献
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// 目标模块
    pub target: ModuleIdentity,
    /// 扩展点名
    pub point: String,
    /// 贡献内容，由目标模块解释
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_auto_start() -> bool {
    true
}

impl ModuleDescriptor {
    /// 创建没有依赖的描述
    pub fn new(identity: ModuleIdentity) -> Self {
        Self {
            identity,
            requires: Vec::new(),
            fragment_host: None,
            auto_start: true,
            contributions: Vec::new(),
        }
    }

    /// 追加一个依赖
    pub fn requires(mut self, dependency: ModuleIdentity) -> Self {
        self.requires.push(dependency);
        self
    }

    /// 声明为某个宿主的片段
    pub fn fragment_of(mut self, host: ModuleIdentity) -> Self {
        self.fragment_host = Some(host);
        self
    }

    /// 标记为手动启动模块
    pub fn manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }

    /// 向目标模块的扩展点追加一项贡献
    pub fn contributes(
        mut self,
        target: ModuleIdentity,
        point: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        self.contributions.push(Contribution {
            target,
            point: point.into(),
            payload,
        });
        self
    }

    /// 是否为片段
    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    /// 校验描述
    ///
    /// 拒绝重复依赖、以自身为宿主的片段以及扩展点名为空的贡献。
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        for (index, dep) in self.requires.iter().enumerate() {
            if self.requires[..index].contains(dep) {
                errors.push(format!("依赖 '{}' 重复声明", dep));
            }
        }

        if self.fragment_host.as_ref() == Some(&self.identity) {
            errors.push("片段不能以自身为宿主".to_string());
        }

        for contribution in &self.contributions {
            if contribution.point.trim().is_empty() {
                errors.push(format!("对 '{}' 的贡献缺少扩展点名", contribution.target));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::InvalidDescriptor(format!(
                "'{}': {}",
                self.identity,
                errors.join("; ")
            )))
        }
    }
}

/// 模块生命周期状态
///
/// `Installed → Resolved → Starting → Active → Stopping → Resolved → Uninstalled`，
/// 钩子超时的模块进入 `Failed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// 已安装，依赖尚未满足
    Installed,
    /// 已解析，可启动
    Resolved,
    /// 启动钩子执行中
    Starting,
    /// 运行中
    Active,
    /// 停止钩子执行中
    Stopping,
    /// 钩子超时，需手动重试
    Failed,
    /// 已卸载（终止状态）
    Uninstalled,
}

impl LifecycleState {
    /// 是否处于已解析或更靠后的状态
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            LifecycleState::Resolved
                | LifecycleState::Starting
                | LifecycleState::Active
                | LifecycleState::Stopping
                | LifecycleState::Failed
        )
    }

    /// 是否为稳定状态（没有钩子在执行）
    pub fn is_stable(&self) -> bool {
        !matches!(self, LifecycleState::Starting | LifecycleState::Stopping)
    }

    /// 是否允许拥有服务注册
    pub fn can_publish_services(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Active)
    }

    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Installed => "INSTALLED",
            LifecycleState::Resolved => "RESOLVED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Failed => "FAILED",
            LifecycleState::Uninstalled => "UNINSTALLED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模块信息（查询结果）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// 模块标识
    pub identity: ModuleIdentity,
    /// 当前状态
    pub state: LifecycleState,
    /// 声明的依赖
    pub requires: Vec<ModuleIdentity>,
    /// 尚未安装的依赖
    pub missing: Vec<ModuleIdentity>,
    /// 直接依赖该模块的模块
    pub dependents: Vec<ModuleIdentity>,
    /// 声明的片段宿主
    pub fragment_host: Option<ModuleIdentity>,
    /// 已附着的宿主
    pub attached_to: Option<ModuleIdentity>,
    /// 已附着到本模块的片段
    pub hosted_fragments: Vec<ModuleIdentity>,
    /// 是否自动启动
    pub auto_start: bool,
    /// 来源位置
    pub location: Option<String>,
    /// 最近一次失败原因
    pub last_error: Option<String>,
    /// 最近一次启动是否失败或超时
    #[serde(default)]
    pub start_failed: bool,
    /// 当前持有的服务注册数量
    pub service_count: usize,
    /// 安装时间
    pub installed_at: DateTime<Utc>,
    /// 最近一次状态变化时间
    pub state_changed_at: DateTime<Utc>,
}

impl ModuleInfo {
    /// 是否为片段
    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }
}
