//! 模块来源
//!
//! 运行时只从来源读取标识、描述和激活器，从不检查模块内容本身。
//! 内容句柄交给外部加载器使用。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::module::activator::ModuleActivator;
use crate::module::metadata::{ModuleDescriptor, ModuleIdentity};
use crate::module::parser::{ModuleParser, DESCRIPTOR_FILENAME};
use crate::utils::Result;

/// 不透明的内容句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentHandle {
    /// 内存中的内容
    Memory(Vec<u8>),
    /// 展开的目录
    Directory(PathBuf),
    /// 合成模块，没有内容
    Synthetic,
}

/// 模块来源接口
pub trait ModuleSource: Send + Sync {
    /// 模块标识
    fn identity(&self) -> &ModuleIdentity {
        &self.descriptor().identity
    }

    /// 模块描述
    fn descriptor(&self) -> &ModuleDescriptor;

    /// 打开模块内容
    fn open(&self) -> Result<ContentHandle>;

    /// 来源位置，用于按位置卸载
    fn location(&self) -> Option<String> {
        None
    }

    /// 模块激活器，`None` 表示没有钩子
    fn activator(&self) -> Option<Arc<dyn ModuleActivator>> {
        None
    }
}

impl fmt::Debug for dyn ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSource")
            .field("identity", &self.identity().to_string())
            .field("location", &self.location())
            .finish()
    }
}

// ============================================================================
// 内存来源
// ============================================================================

/// 内存中的模块来源
///
/// 用于嵌入应用直接提供的模块，以及代表嵌入应用自身的合成宿主模块。
#[derive(Clone)]
pub struct InMemorySource {
    descriptor: ModuleDescriptor,
    activator: Option<Arc<dyn ModuleActivator>>,
    location: Option<String>,
    content: Option<Vec<u8>>,
}

impl InMemorySource {
    /// 从描述创建来源
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor,
            activator: None,
            location: None,
            content: None,
        }
    }

    /// 代表嵌入应用的合成宿主模块
    pub fn host(identity: ModuleIdentity) -> Self {
        Self::new(ModuleDescriptor::new(identity)).with_location("synthetic:host")
    }

    /// 设置激活器
    pub fn with_activator(mut self, activator: impl ModuleActivator + 'static) -> Self {
        self.activator = Some(Arc::new(activator));
        self
    }

    /// 设置共享的激活器
    pub fn with_shared_activator(mut self, activator: Arc<dyn ModuleActivator>) -> Self {
        self.activator = Some(activator);
        self
    }

    /// 设置来源位置
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// 设置内容
    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }
}

impl ModuleSource for InMemorySource {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn open(&self) -> Result<ContentHandle> {
        Ok(match self.content {
            Some(ref bytes) => ContentHandle::Memory(bytes.clone()),
            None => ContentHandle::Synthetic,
        })
    }

    fn location(&self) -> Option<String> {
        self.location.clone()
    }

    fn activator(&self) -> Option<Arc<dyn ModuleActivator>> {
        self.activator.clone()
    }
}

// ============================================================================
// 目录来源
// ============================================================================

/// 展开目录形式的模块来源
///
/// 目录中必须包含 `module.yaml`。
#[derive(Clone)]
pub struct DirectorySource {
    root: PathBuf,
    descriptor: ModuleDescriptor,
    activator: Option<Arc<dyn ModuleActivator>>,
}

impl DirectorySource {
    /// 从目录加载来源
    pub async fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let descriptor = ModuleParser::parse_file(&root.join(DESCRIPTOR_FILENAME)).await?;
        Ok(Self {
            root,
            descriptor,
            activator: None,
        })
    }

    /// 设置激活器
    pub fn with_activator(mut self, activator: impl ModuleActivator + 'static) -> Self {
        self.activator = Some(Arc::new(activator));
        self
    }

    /// 模块根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 扫描目录，加载每个包含 `module.yaml` 的子目录
    ///
    /// 解析失败的子目录会被跳过并记录警告。目录不存在时返回空列表。
    pub async fn scan(dir: &Path) -> Result<Vec<DirectorySource>> {
        let mut sources = Vec::new();

        if !dir.exists() {
            debug!(dir = %dir.display(), "模块目录不存在，跳过");
            return Ok(sources);
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            if !path.join(DESCRIPTOR_FILENAME).exists() {
                trace!(dir = %path.display(), "未找到 module.yaml，跳过");
                continue;
            }

            match DirectorySource::load(&path).await {
                Ok(source) => sources.push(source),
                Err(e) => warn!(dir = %path.display(), error = %e, "模块描述解析失败"),
            }
        }

        // 目录遍历顺序不确定
        sources.sort_by(|a, b| a.root.cmp(&b.root));
        Ok(sources)
    }
}

impl ModuleSource for DirectorySource {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn open(&self) -> Result<ContentHandle> {
        Ok(ContentHandle::Directory(self.root.clone()))
    }

    fn location(&self) -> Option<String> {
        Some(self.root.display().to_string())
    }

    fn activator(&self) -> Option<Arc<dyn ModuleActivator>> {
        self.activator.clone()
    }
}
