//! 事件总线
//!
//! 编排循环通过 [`EventBus::publish`] 同步发布事件，从不等待监听器。
//! 每个订阅持有独立的有界队列和分发任务：
//!
//! - 同一监听器按发布顺序收到事件
//! - 队列溢出时丢弃最旧的事件并记录警告
//! - 回调 panic 或超时只影响该次分发

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::kernel::event::{EventKind, RuntimeEvent};
use crate::utils::{generate_subscription_id, Result, RuntimeError};

/// 事件监听器
///
/// 回调是同步的，在阻塞线程池中执行。
pub type EventListener = Arc<dyn Fn(RuntimeEvent) + Send + Sync>;

struct SubscriptionEntry {
    pattern: String,
    subscribed_at: DateTime<Utc>,
    worker: JoinHandle<()>,
}

/// 订阅信息
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: String,
    pub pattern: String,
    pub subscribed_at: DateTime<Utc>,
}

/// 分发结果
#[derive(Debug, Clone)]
enum DispatchResult {
    Success,
    Failed(String),
    Timeout,
}

/// 事件总线
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
    sequence: AtomicU64,
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    handler_timeout: Duration,
}

impl EventBus {
    /// 创建事件总线
    ///
    /// `queue_size` 为每个监听器的队列容量。
    pub fn new(queue_size: usize, handler_timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(queue_size.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
            subscriptions: RwLock::new(HashMap::new()),
            handler_timeout,
        }
    }

    /// 发布事件，返回事件序号
    ///
    /// 没有监听器时事件直接丢弃。
    pub fn publish(&self, kind: EventKind) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RuntimeEvent::new(sequence, kind);
        trace!(sequence, event = event.name(), "发布事件");
        // 没有接收者时返回错误，可以忽略
        let _ = self.sender.send(event);
        sequence
    }

    /// 已发布的事件数
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// 订阅匹配 `pattern` 的事件
    ///
    /// 支持 `*`、精确名称以及 `module.*` 这样的前缀通配。返回订阅标识。
    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        listener: EventListener,
    ) -> Result<String> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(RuntimeError::InvalidConfigValue {
                key: "pattern".to_string(),
                reason: "订阅模式不能为空".to_string(),
            });
        }

        let subscription_id = generate_subscription_id();
        let worker = tokio::spawn(Self::dispatch_loop(
            subscription_id.clone(),
            pattern.clone(),
            self.sender.subscribe(),
            listener,
            self.handler_timeout,
        ));

        self.subscriptions.write().await.insert(
            subscription_id.clone(),
            SubscriptionEntry {
                pattern: pattern.clone(),
                subscribed_at: Utc::now(),
                worker,
            },
        );

        info!(subscription_id = %subscription_id, pattern = %pattern, "订阅成功");
        Ok(subscription_id)
    }

    /// 取消订阅
    ///
    /// 队列中尚未分发的事件会被丢弃。
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let entry = self
            .subscriptions
            .write()
            .await
            .remove(subscription_id)
            .ok_or_else(|| RuntimeError::SubscriptionNotFound(subscription_id.to_string()))?;
        entry.worker.abort();
        info!(subscription_id = %subscription_id, "取消订阅成功");
        Ok(())
    }

    /// 当前订阅数
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// 当前订阅列表
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut list: Vec<SubscriptionInfo> = self
            .subscriptions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: id.clone(),
                pattern: entry.pattern.clone(),
                subscribed_at: entry.subscribed_at,
            })
            .collect();
        list.sort_by_key(|info| info.subscribed_at);
        list
    }

    /// 原始事件流，供异步消费者使用
    ///
    /// 只能收到调用之后发布的事件。
    pub fn receiver(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// 取消全部订阅
    pub async fn clear(&self) {
        let mut subscriptions = self.subscriptions.write().await;
        for (_, entry) in subscriptions.drain() {
            entry.worker.abort();
        }
    }

    async fn dispatch_loop(
        subscription_id: String,
        pattern: String,
        mut receiver: broadcast::Receiver<RuntimeEvent>,
        listener: EventListener,
        handler_timeout: Duration,
    ) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if !event.matches(&pattern) {
                        continue;
                    }
                    let sequence = event.sequence;
                    match Self::invoke_listener_with_timeout(
                        listener.clone(),
                        event,
                        handler_timeout,
                    )
                    .await
                    {
                        DispatchResult::Success => {
                            trace!(subscription_id = %subscription_id, sequence, "事件处理成功");
                        }
                        DispatchResult::Failed(e) => {
                            warn!(
                                subscription_id = %subscription_id,
                                sequence,
                                error = %e,
                                "事件处理失败"
                            );
                        }
                        DispatchResult::Timeout => {
                            warn!(subscription_id = %subscription_id, sequence, "事件处理超时");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(
                        subscription_id = %subscription_id,
                        dropped,
                        "监听器队列溢出，已丢弃最旧的事件"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(subscription_id = %subscription_id, "事件总线已关闭");
                    break;
                }
            }
        }
    }

    /// 带超时的监听器调用
    ///
    /// 同步回调放到阻塞线程池执行并捕获 panic。超时后回调仍会在后台跑完。
    async fn invoke_listener_with_timeout(
        listener: EventListener,
        event: RuntimeEvent,
        timeout_duration: Duration,
    ) -> DispatchResult {
        let result = timeout(timeout_duration, async move {
            tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                    listener(event);
                }))
            })
            .await
        })
        .await;

        match result {
            Ok(Ok(Ok(()))) => DispatchResult::Success,
            Ok(Ok(Err(_))) => DispatchResult::Failed("监听器 panic".to_string()),
            Ok(Err(e)) => DispatchResult::Failed(format!("任务执行失败: {}", e)),
            Err(_) => DispatchResult::Timeout,
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for entry in self.subscriptions.get_mut().values() {
            entry.worker.abort();
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("published", &self.published())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}
