//! 历史裁剪（Trimmer）
//!
//! 一次 `trim` 依次执行：
//! 1. `advance_tails`：沿纪元日志向后采纳策略认可的新尾部；
//! 2. `advance_epochs`：按节流间隔向前推进纪元，并把 `(纪元, 时间)` 追加到纪元日志。
//!
//! 先推进尾部，本轮新推进的纪元不会在同一轮就成为尾部。
//! 所有修改都是单条控制记录上的条件更新，中断后下次运行可安全续作。
//!
use crate::{
    clock::Clock,
    error::{HistoryResult as Result, bail_if_cancelled},
    id::EventId,
    journal::Journal,
    model::{EpochLogEntry, Phase, Refs},
    retention::{Retained, RetentionPolicy},
    store::{RefsFilter, RefsPages, RefsUpdate},
};
use bon::{Builder, bon};
use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 裁剪配置
#[derive(Debug, Clone, Copy, Builder)]
pub struct TrimConfig {
    /// 同一历史两次纪元推进的最小间隔
    #[builder(default = Duration::days(30))]
    pub epoch_interval: Duration,
    #[builder(default = 256)]
    pub scan_batch: usize,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            epoch_interval: Duration::days(30),
            scan_batch: 256,
        }
    }
}

/// 一次裁剪的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub histories_scanned: u64,
    pub tails_advanced: u64,
    pub epochs_advanced: u64,
    /// 条件更新落空（并发修改），留待下次
    pub conflicts: u64,
}

pub struct Trimmer<P: RetentionPolicy> {
    journal: Arc<Journal>,
    policy: P,
    config: TrimConfig,
}

#[bon]
impl<P: RetentionPolicy> Trimmer<P> {
    #[builder]
    pub fn new(
        journal: Arc<Journal>,
        policy: P,
        #[builder(default)] config: TrimConfig,
    ) -> Self {
        Self {
            journal,
            policy,
            config,
        }
    }
}

impl<P: RetentionPolicy> Trimmer<P> {
    pub fn policy(&self) -> &P {
        &self.policy
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.journal.clock()
    }

    pub async fn trim(&self, cancel: &CancellationToken) -> Result<TrimReport> {
        let mut report = TrimReport::default();
        self.advance_tails(cancel, &mut report).await?;
        self.advance_epochs(cancel, &mut report).await?;
        info!(
            scanned = report.histories_scanned,
            tails = report.tails_advanced,
            epochs = report.epochs_advanced,
            conflicts = report.conflicts,
            "trim finished"
        );
        Ok(report)
    }

    async fn advance_tails(
        &self,
        cancel: &CancellationToken,
        report: &mut TrimReport,
    ) -> Result<()> {
        let store = self.journal.store().as_ref();
        let mut pages = RefsPages::new(store, self.config.scan_batch);
        while let Some(page) = pages.next_page().await? {
            for refs in page.iter().filter(|r| r.is_active()) {
                bail_if_cancelled(cancel)?;
                report.histories_scanned += 1;

                let now = self.clock().now();
                let Some(tail) = self.next_tail(refs, now) else {
                    continue;
                };
                let filter = RefsFilter::builder()
                    .tail(refs.tail)
                    .phase(Phase::Active)
                    .build();
                let update = RefsUpdate::builder().tail(tail).build();
                if store.update_refs(refs.id, &filter, &update).await? {
                    info!(history = %refs.id, from = %refs.tail, to = %tail, "tail advanced");
                    report.tails_advanced += 1;
                } else {
                    report.conflicts += 1;
                }
            }
        }
        Ok(())
    }

    /// 纪元日志中位于当前尾部之后、策略连续认可的最后一个纪元
    fn next_tail(&self, refs: &Refs, now: DateTime<Utc>) -> Option<EventId> {
        let start = if refs.tail.is_nil() {
            0
        } else {
            match refs.epoch_log.iter().position(|e| e.epoch == refs.tail) {
                Some(pos) => pos + 1,
                None => {
                    debug!(history = %refs.id, tail = %refs.tail, "tail not in epoch log, skipped");
                    return None;
                }
            }
        };

        refs.epoch_log[start..]
            .iter()
            .take_while(|entry| self.policy.is_new_tail(entry.epoch, entry.time, now))
            .last()
            .map(|entry| entry.epoch)
    }

    async fn advance_epochs(
        &self,
        cancel: &CancellationToken,
        report: &mut TrimReport,
    ) -> Result<()> {
        let store = self.journal.store().as_ref();
        let mut pages = RefsPages::new(store, self.config.scan_batch);
        while let Some(page) = pages.next_page().await? {
            for refs in page.iter().filter(|r| r.is_active()) {
                bail_if_cancelled(cancel)?;

                let now = self.clock().now();
                if refs
                    .last_epoch_time()
                    .is_some_and(|last| last + self.config.epoch_interval > now)
                {
                    continue;
                }
                let Some(epoch) = self.next_epoch(refs, now, cancel).await? else {
                    continue;
                };

                let filter = RefsFilter::builder()
                    .epoch(refs.epoch)
                    .phase(Phase::Active)
                    .build();
                let update = RefsUpdate::builder()
                    .epoch(epoch)
                    .push_epoch(EpochLogEntry { epoch, time: now })
                    .build();
                if store.update_refs(refs.id, &filter, &update).await? {
                    info!(history = %refs.id, from = %refs.epoch, to = %epoch, "epoch advanced");
                    report.epochs_advanced += 1;
                } else {
                    report.conflicts += 1;
                }
            }
        }
        Ok(())
    }

    /// 从当前纪元向前检查相邻事件对，返回策略认可的最新候选
    async fn next_epoch(
        &self,
        refs: &Refs,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<EventId>> {
        let mut events = self.journal.find(refs.id, EventId::NIL).await?;
        let mut prev: Option<Retained<P::Event>> = None;
        let mut found = None;

        while let Some(event) = events.try_next().await? {
            bail_if_cancelled(cancel)?;
            let next = Retained {
                id: event.id,
                parent: event.parent,
                time: event.id.timestamp(),
                event: self.policy.decode_event(&event.payload)?,
            };
            if let Some(candidate) = &prev {
                if self.policy.is_new_epoch(candidate, &next, now) {
                    found = Some(candidate.id);
                }
            }
            prev = Some(next);
        }
        Ok(found)
    }
}
