//! 聚合命令引擎（Engine）
//!
//! 封装“重放日志 → 执行行为 → 提交事件 → 折叠进缓存状态”的标准流程：
//! - `find_id` / `find_from_state`：从缓存状态的 Vid 之后增量重放；
//! - `tell`：按期望版本模式执行命令并提交；
//! - `delete`：复用版本模式，要求行为不产生事件后软删除历史。
//!
//! 期望版本有三种模式：精确比较、跳过比较、跳过比较且冲突时带随机退避重试。
//!
use crate::{
    behavior::{Advancer, Behavior},
    error::{HistoryError, HistoryResult},
    id::{EventId, ExpectedVid},
    journal::Journal,
    model::Event,
};
use bon::{Builder, bon};
use futures_util::TryStreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// 物化状态：`vid` 为最后折叠事件的标识，即乐观并发令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized<S> {
    pub id: Uuid,
    pub vid: EventId,
    pub state: S,
}

/// 命令执行错误：行为拒绝与日志错误分开
#[derive(Debug, thiserror::Error)]
pub enum TellError<E: std::error::Error + Send + Sync + 'static> {
    #[error(transparent)]
    Behavior(E),
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl<E: std::error::Error + Send + Sync + 'static> TellError<E> {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, TellError::History(err) if err.is_version_conflict())
    }
}

/// 引擎配置
#[derive(Debug, Clone, Copy, Builder)]
pub struct EngineConfig {
    /// 状态缓存容量（最近最少使用淘汰），0 表示不缓存
    #[builder(default = 10_000)]
    pub cache_capacity: usize,
    /// 重试模式下的最大尝试次数
    #[builder(default = 5)]
    pub retry_attempts: usize,
    /// 每次重试前的随机退避上限
    #[builder(default = Duration::from_millis(5))]
    pub retry_jitter: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            retry_attempts: 5,
            retry_jitter: Duration::from_millis(5),
        }
    }
}

pub struct Engine<B: Behavior> {
    journal: Arc<Journal>,
    behavior: B,
    cache: Mutex<StateCache<B::State>>,
    config: EngineConfig,
}

#[bon]
impl<B: Behavior> Engine<B> {
    #[builder]
    pub fn new(
        journal: Arc<Journal>,
        behavior: B,
        #[builder(default)] config: EngineConfig,
    ) -> Self {
        Self {
            journal,
            behavior,
            cache: Mutex::new(StateCache::new(config.cache_capacity)),
            config,
        }
    }
}

impl<B: Behavior> Engine<B> {
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    /// 读取当前状态（缓存 + 增量重放）
    pub async fn find_id(&self, id: Uuid) -> HistoryResult<Materialized<B::State>> {
        let cached = self.cache()?.get(id);
        let mat = cached.unwrap_or_else(|| self.fresh(id));
        self.find_from_state(mat).await
    }

    /// 从给定状态的 Vid 之后继续重放；游标已不属于该历史时从空状态重建
    pub async fn find_from_state(
        &self,
        mat: Materialized<B::State>,
    ) -> HistoryResult<Materialized<B::State>> {
        let id = mat.id;
        let stale = !mat.vid.is_nil();
        match self.replay(mat).await {
            Err(HistoryError::CursorNotFound { .. }) if stale => {
                debug!(history = %id, "cached state is no longer replayable, rebuilding");
                self.cache()?.remove(id);
                self.replay(self.fresh(id)).await
            }
            other => other,
        }
    }

    fn fresh(&self, id: Uuid) -> Materialized<B::State> {
        Materialized {
            id,
            vid: EventId::NIL,
            state: self.behavior.new_state(id),
        }
    }

    async fn replay(
        &self,
        mut mat: Materialized<B::State>,
    ) -> HistoryResult<Materialized<B::State>> {
        let mut events = self.journal.find(mat.id, mat.vid).await?;
        let mut advancer = self.behavior.new_advancer();
        let mut folded = 0usize;
        while let Some(event) = events.try_next().await? {
            let decoded = self.behavior.decode_event(&event.payload)?;
            advancer.advance(&mut mat.state, event.id, decoded);
            mat.vid = event.id;
            folded += 1;
        }
        if folded > 0 {
            advancer.finish(&mut mat.state);
            self.cache()?.put(mat.clone());
        }
        Ok(mat)
    }

    /// 执行命令；返回折叠了新事件后的状态（无事件时为当前状态）
    pub async fn tell(
        &self,
        id: Uuid,
        expected: impl Into<ExpectedVid>,
        command: B::Command,
    ) -> Result<Materialized<B::State>, TellError<B::Error>> {
        match expected.into() {
            ExpectedVid::NoCheckRetry => {
                self.with_retry(|| self.tell_once(id, ExpectedVid::NoCheckRetry, command.clone()))
                    .await
            }
            expected => self.tell_once(id, expected, command).await,
        }
    }

    async fn tell_once(
        &self,
        id: Uuid,
        expected: ExpectedVid,
        command: B::Command,
    ) -> Result<Materialized<B::State>, TellError<B::Error>> {
        let mut mat = self.find_id(id).await?;
        check_version(expected, mat.vid)?;

        let events = self
            .behavior
            .tell(&mat.state, command)
            .map_err(TellError::Behavior)?;
        if events.is_empty() {
            return Ok(mat);
        }

        let mut chain = Vec::with_capacity(events.len());
        for event in &events {
            chain.push(Event::new(self.behavior.encode_event(event)?));
        }
        chain[0].parent = mat.vid;
        let committed = self.journal.commit(id, chain).await?;

        let mut advancer = self.behavior.new_advancer();
        for (record, event) in committed.iter().zip(events) {
            advancer.advance(&mut mat.state, record.id, event);
            mat.vid = record.id;
        }
        advancer.finish(&mut mat.state);
        self.cache()?.put(mat.clone());
        Ok(mat)
    }

    /// 软删除历史：行为可做最终校验，但不得产生事件
    pub async fn delete(
        &self,
        id: Uuid,
        expected: impl Into<ExpectedVid>,
        command: B::Command,
    ) -> Result<(), TellError<B::Error>> {
        match expected.into() {
            ExpectedVid::NoCheckRetry => {
                self.with_retry(|| self.delete_once(id, ExpectedVid::NoCheckRetry, command.clone()))
                    .await
            }
            expected => self.delete_once(id, expected, command).await,
        }
    }

    async fn delete_once(
        &self,
        id: Uuid,
        expected: ExpectedVid,
        command: B::Command,
    ) -> Result<(), TellError<B::Error>> {
        let mat = self.find_id(id).await?;
        check_version(expected, mat.vid)?;

        let events = self
            .behavior
            .tell(&mat.state, command)
            .map_err(TellError::Behavior)?;
        if !events.is_empty() {
            return Err(HistoryError::internal(format!(
                "delete command for history {id} produced {} events",
                events.len()
            ))
            .into());
        }

        self.journal.delete(id, mat.vid).await?;
        self.cache()?.remove(id);
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, TellError<B::Error>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TellError<B::Error>>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut last = None;
        for n in 1..=attempts {
            match attempt().await {
                Err(TellError::History(err)) if err.is_version_conflict() => {
                    warn!(attempt = n, error = %err, "version conflict, retrying");
                    last = Some(err);
                    if n < attempts {
                        tokio::time::sleep(jitter(self.config.retry_jitter)).await;
                    }
                }
                other => return other,
            }
        }
        let source = last.unwrap_or_else(|| HistoryError::internal("retry loop ran no attempt"));
        Err(HistoryError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
        .into())
    }

    /// 丢弃某历史的缓存状态
    pub fn forget(&self, id: Uuid) -> HistoryResult<()> {
        self.cache()?.remove(id);
        Ok(())
    }

    pub fn cached_len(&self) -> HistoryResult<usize> {
        Ok(self.cache()?.len())
    }

    fn cache(&self) -> HistoryResult<MutexGuard<'_, StateCache<B::State>>> {
        self.cache
            .lock()
            .map_err(|_| HistoryError::internal("state cache lock poisoned"))
    }
}

fn check_version(expected: ExpectedVid, vid: EventId) -> HistoryResult<()> {
    match expected {
        ExpectedVid::Exact(want) if want != vid => Err(HistoryError::VersionConflict {
            stored: vid,
            expected: want,
        }),
        _ => Ok(()),
    }
}

fn jitter(max: Duration) -> Duration {
    let max_us = max.as_micros() as u64;
    if max_us == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::thread_rng().gen_range(0..=max_us))
}

/// 有界状态缓存，超出容量时淘汰最近最少使用的条目
struct StateCache<S> {
    capacity: usize,
    tick: u64,
    slots: HashMap<Uuid, Slot<S>>,
}

struct Slot<S> {
    mat: Materialized<S>,
    used: u64,
}

impl<S: Clone> StateCache<S> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            slots: HashMap::new(),
        }
    }

    fn get(&mut self, id: Uuid) -> Option<Materialized<S>> {
        self.tick += 1;
        let slot = self.slots.get_mut(&id)?;
        slot.used = self.tick;
        Some(slot.mat.clone())
    }

    fn put(&mut self, mat: Materialized<S>) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        if !self.slots.contains_key(&mat.id) && self.slots.len() >= self.capacity {
            let victim = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.used)
                .map(|(id, _)| *id);
            if let Some(victim) = victim {
                self.slots.remove(&victim);
            }
        }
        self.slots.insert(
            mat.id,
            Slot {
                mat,
                used: self.tick,
            },
        );
    }

    fn remove(&mut self, id: Uuid) {
        self.slots.remove(&id);
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}
