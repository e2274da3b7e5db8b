//! 进程内变更通知（Notifier）
//!
//! 订阅表（订阅者队列 → 历史 UUID 或通配）的所有变更与广播都串行经过
//! 同一条命令队列，由唯一的后台任务处理，因此订阅表无需加锁且对并发调用方线性一致。
//!
//! 广播是非阻塞的：订阅者入站队列已满时直接错过该次通知。通知只是活性提示，
//! 消费方始终应以 `Journal::find` 重新推导事实，必要时配合 `recv_or_poll` 定时兜底。
//!
use crate::error::{HistoryError, HistoryResult};
use bon::Builder;
use futures_core::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

/// 订阅主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    History(Uuid),
    Any,
}

impl Topic {
    fn covers(&self, history: Uuid) -> bool {
        match self {
            Topic::History(id) => *id == history,
            Topic::Any => true,
        }
    }
}

/// 通知器配置
#[derive(Debug, Clone, Copy, Builder)]
pub struct NotifierConfig {
    /// 每个订阅者入站队列容量
    #[builder(default = 16)]
    pub subscriber_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 16,
        }
    }
}

enum Command {
    Subscribe {
        id: u64,
        topic: Topic,
        tx: mpsc::Sender<Uuid>,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe {
        id: u64,
    },
    Post {
        history: Uuid,
    },
}

/// 通知器句柄，克隆廉价；全部句柄与订阅释放后后台任务退出
#[derive(Clone)]
pub struct Notifier {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    config: NotifierConfig,
}

impl Notifier {
    /// 启动后台任务，须在 tokio 运行时内调用
    pub fn spawn(config: NotifierConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// 订阅主题；返回时订阅已登记，其后的 `post` 必定可见
    pub async fn subscribe(&self, topic: Topic) -> HistoryResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                id,
                topic,
                tx,
                ack,
            })
            .map_err(|_| HistoryError::internal("notifier task is gone"))?;
        acked
            .await
            .map_err(|_| HistoryError::internal("notifier task is gone"))?;

        Ok(Subscription {
            id,
            rx,
            commands: self.commands.clone(),
        })
    }

    /// 尽力广播“历史已变更”，从不阻塞
    pub fn post(&self, history: Uuid) {
        let _ = self.commands.send(Command::Post { history });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<Uuid>,
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut registry: HashMap<u64, Subscriber> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Subscribe {
                id,
                topic,
                tx,
                ack,
            } => {
                registry.insert(id, Subscriber { topic, tx });
                let _ = ack.send(());
            }
            Command::Unsubscribe { id } => {
                registry.remove(&id);
            }
            Command::Post { history } => {
                let mut closed = Vec::new();
                for (id, sub) in registry.iter().filter(|(_, s)| s.topic.covers(history)) {
                    match sub.tx.try_send(history) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            trace!(
                                subscriber = id,
                                %history,
                                "subscriber queue full, notification dropped"
                            );
                        }
                        Err(TrySendError::Closed(_)) => closed.push(*id),
                    }
                }
                for id in closed {
                    debug!(subscriber = id, "pruning closed subscriber");
                    registry.remove(&id);
                }
            }
        }
    }
}

/// 唤醒原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Notified(Uuid),
    /// 兜底轮询间隔到期
    Poll,
    Closed,
}

/// 一个订阅；释放时自动退订
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Uuid>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Uuid> {
        self.rx.recv().await
    }

    /// 等待下一次通知，最多等待 `interval`
    pub async fn recv_or_poll(&mut self, interval: Duration) -> Wakeup {
        match tokio::time::timeout(interval, self.rx.recv()).await {
            Ok(Some(history)) => Wakeup::Notified(history),
            Ok(None) => Wakeup::Closed,
            Err(_) => Wakeup::Poll,
        }
    }

    /// 丢弃已排队的通知，返回丢弃条数
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

impl Stream for Subscription {
    type Item = Uuid;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe { id: self.id });
    }
}
