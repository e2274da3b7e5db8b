//! 周期维护（Maintenance）
//!
//! 按固定间隔依次运行一组维护任务（通常先 `Trimmer` 后 `GarbageCollector`）：
//! - 单次失败只记录日志，等待下一个周期重跑，不做内部重试；
//! - 关闭时取消令牌同时打断正在进行的扫描；
//! - 提供关闭与等待的 `MaintenanceHandle`。
//!
use crate::{
    error::{HistoryError, HistoryResult},
    gc::GarbageCollector,
    retention::RetentionPolicy,
    trimmer::Trimmer,
};
use async_trait::async_trait;
use bon::Builder;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[async_trait]
pub trait MaintenanceJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: &CancellationToken) -> HistoryResult<()>;
}

#[async_trait]
impl<P: RetentionPolicy> MaintenanceJob for Trimmer<P> {
    fn name(&self) -> &str {
        "trim"
    }

    async fn run(&self, cancel: &CancellationToken) -> HistoryResult<()> {
        self.trim(cancel).await.map(|_| ())
    }
}

#[async_trait]
impl MaintenanceJob for GarbageCollector {
    fn name(&self) -> &str {
        "gc"
    }

    async fn run(&self, cancel: &CancellationToken) -> HistoryResult<()> {
        self.gc(cancel).await.map(|_| ())
    }
}

/// 维护配置
#[derive(Clone, Copy, Debug, Builder)]
pub struct MaintenanceConfig {
    /// 两次运行之间的间隔；首轮在启动后立即执行
    #[builder(default = Duration::from_secs(24 * 60 * 60))]
    pub interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Builder)]
pub struct Maintenance {
    jobs: Vec<Arc<dyn MaintenanceJob>>,
    #[builder(default)]
    config: MaintenanceConfig,
}

impl Maintenance {
    /// 按顺序运行全部任务一次；某个任务失败不影响后续任务
    pub async fn run_once(&self, cancel: &CancellationToken) -> usize {
        let mut failed = 0;
        for job in &self.jobs {
            if cancel.is_cancelled() {
                break;
            }
            match job.run(cancel).await {
                Ok(()) => debug!(job = job.name(), "maintenance job finished"),
                Err(HistoryError::Cancelled) => {
                    debug!(job = job.name(), "maintenance job cancelled");
                    break;
                }
                Err(err) => {
                    error!(job = job.name(), error = %err, "maintenance job failed");
                    failed += 1;
                }
            }
        }
        failed
    }

    /// 启动周期任务，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> MaintenanceHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once(&child).await;
                    }
                }
            }
        });

        MaintenanceHandle {
            token,
            tasks: vec![task],
        }
    }
}

/// 维护运行句柄：用于优雅关闭与等待任务结束
pub struct MaintenanceHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
