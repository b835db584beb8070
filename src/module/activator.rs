//! 模块激活器
//!
//! 模块的启动 / 停止钩子由外部提供。运行时在独立任务中调用钩子，
//! 并施加超时限制。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::kernel::context::ModuleContext;

/// 模块激活器接口
///
/// 钩子可以通过 [`ModuleContext`] 注册和查找服务。启动钩子返回错误时模块回到
/// `Resolved`，停止钩子返回错误时模块回到 `Active`。
#[async_trait]
pub trait ModuleActivator: Send + Sync {
    /// 启动钩子
    async fn start(&self, _ctx: ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// 停止钩子
    async fn stop(&self, _ctx: ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 空激活器，没有声明钩子的模块使用它
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivator;

#[async_trait]
impl ModuleActivator for NoopActivator {}

type HookFn = Arc<dyn Fn(ModuleContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 基于闭包的激活器
///
/// ```
/// use chips_runtime::module::FnActivator;
///
/// let activator = FnActivator::new()
///     .on_start(|ctx| async move {
///         ctx.register_service("editor.api", Default::default()).await?;
///         Ok(())
///     })
///     .on_stop(|_ctx| async { Ok(()) });
/// ```
#[derive(Clone, Default)]
pub struct FnActivator {
    start: Option<HookFn>,
    stop: Option<HookFn>,
}

impl FnActivator {
    /// 创建空激活器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置启动钩子
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ModuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// 设置停止钩子
    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ModuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stop = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }
}

#[async_trait]
impl ModuleActivator for FnActivator {
    async fn start(&self, ctx: ModuleContext) -> anyhow::Result<()> {
        match self.start {
            Some(ref hook) => hook(ctx).await,
            None => Ok(()),
        }
    }

    async fn stop(&self, ctx: ModuleContext) -> anyhow::Result<()> {
        match self.stop {
            Some(ref hook) => hook(ctx).await,
            None => Ok(()),
        }
    }
}
