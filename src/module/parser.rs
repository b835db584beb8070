//! 模块描述解析器
//!
//! 从 `module.yaml` 解析模块描述。文件格式：
//!
//! ```yaml
//! name: editor
//! version: 1.0.0
//! requires:
//!   - core@1.0.0
//! fragment_host: shell@2.0.0   # 可选
//! auto_start: true             # 可选，默认 true
//! contributes:                 # 可选
//!   - target: shell@2.0.0
//!     point: menus
//!     payload: { label: 编辑 }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::module::metadata::{Contribution, ModuleDescriptor, ModuleIdentity};
use crate::utils::{Result, RuntimeError};

/// 模块描述文件名
pub const DESCRIPTOR_FILENAME: &str = "module.yaml";

/// `module.yaml` 的原始结构
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorFile {
    name: String,
    version: String,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    fragment_host: Option<String>,
    #[serde(default = "default_auto_start")]
    auto_start: bool,
    #[serde(default)]
    contributes: Vec<ContributionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContributionEntry {
    target: String,
    point: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn default_auto_start() -> bool {
    true
}

/// 模块描述解析器
#[derive(Debug, Clone, Default)]
pub struct ModuleParser;

impl ModuleParser {
    /// 从文件解析模块描述
    ///
    /// # 错误
    ///
    /// - 文件无法读取时返回 IO 错误
    /// - 内容不是合法 YAML 时返回 YAML 错误
    /// - 字段校验失败时返回 `InvalidDescriptor`
    pub async fn parse_file(path: &Path) -> Result<ModuleDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_string(&content)
    }

    /// 从文件同步解析模块描述
    pub fn parse_file_sync(path: &Path) -> Result<ModuleDescriptor> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_string(&content)
    }

    /// 从字符串解析模块描述
    pub fn parse_string(content: &str) -> Result<ModuleDescriptor> {
        let file: DescriptorFile = serde_yaml::from_str(content)?;
        Self::convert(file)
    }

    /// 转换并校验，所有错误一次性汇总
    fn convert(file: DescriptorFile) -> Result<ModuleDescriptor> {
        let mut errors: Vec<String> = Vec::new();

        let identity = match ModuleIdentity::new(file.name.as_str(), &file.version) {
            Ok(id) => Some(id),
            Err(e) => {
                errors.push(e.to_string());
                None
            }
        };

        let mut requires = Vec::with_capacity(file.requires.len());
        for (index, text) in file.requires.iter().enumerate() {
            match ModuleIdentity::parse(text) {
                Ok(id) => requires.push(id),
                Err(e) => errors.push(format!("第 {} 个依赖无效: {}", index + 1, e)),
            }
        }

        let fragment_host = match file.fragment_host.as_deref().map(ModuleIdentity::parse) {
            Some(Ok(host)) => Some(host),
            Some(Err(e)) => {
                errors.push(format!("片段宿主无效: {}", e));
                None
            }
            None => None,
        };

        let mut contributions = Vec::with_capacity(file.contributes.len());
        for (index, entry) in file.contributes.into_iter().enumerate() {
            match ModuleIdentity::parse(&entry.target) {
                Ok(target) => contributions.push(Contribution {
                    target,
                    point: entry.point,
                    payload: entry.payload,
                }),
                Err(e) => errors.push(format!("第 {} 项贡献的目标无效: {}", index + 1, e)),
            }
        }

        let identity = match identity {
            Some(identity) if errors.is_empty() => identity,
            _ => return Err(RuntimeError::InvalidDescriptor(errors.join("; "))),
        };

        let descriptor = ModuleDescriptor {
            identity,
            requires,
            fragment_host,
            auto_start: file.auto_start,
            contributions,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}
