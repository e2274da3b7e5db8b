//! 保留策略（RetentionPolicy）
//!
//! 由协作方按聚合类型提供，决定“多老算老”；`Trimmer` 只负责遍历与簿记。
//!
use crate::error::HistoryResult;
use crate::id::EventId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// 交给策略判断的已解码事件
#[derive(Debug, Clone, PartialEq)]
pub struct Retained<E> {
    pub id: EventId,
    pub parent: EventId,
    /// 取自事件标识内嵌的时间戳
    pub time: DateTime<Utc>,
    pub event: E,
}

pub trait RetentionPolicy: Send + Sync + 'static {
    type Event: DeserializeOwned + Send + Sync;

    fn decode_event(&self, payload: &[u8]) -> HistoryResult<Self::Event> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// `epoch` 能否成为新纪元；`next` 是紧随其后、纪元推进后仍可重放的第一个事件
    fn is_new_epoch(
        &self,
        epoch: &Retained<Self::Event>,
        next: &Retained<Self::Event>,
        now: DateTime<Utc>,
    ) -> bool;

    /// 在 `epoch_time` 被采纳为纪元的 `event` 能否成为新尾部
    fn is_new_tail(&self, event: EventId, epoch_time: DateTime<Utc>, now: DateTime<Utc>) -> bool;
}
