//! 存储边界（store）
//!
//! 定义三类记录集的最小操作协议：
//! - 原始事件：幂等插入、读取、删除、分页扫描；
//! - 控制记录：插入、条件更新（CAS）、条件删除、分页扫描；
//! - 索引条目：幂等插入、按序号区间扫描、按打包键区间删除。
//!
//! 所有变更都是单文档条件操作，协议不暴露任何全局锁。具体后端（文档数据库等）
//! 由上层提供实现并注入，本 crate 自带内存实现 `InMemoryStore`。
//!
mod memory;

pub use memory::InMemoryStore;

use crate::{
    error::HistoryResult as Result,
    id::EventId,
    model::{EpochLogEntry, Event, EventLink, IndexEntry, IndexKey, Phase, Refs, Serial},
};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use std::ops::RangeInclusive;
use std::sync::Arc;
use uuid::Uuid;

/// 幂等插入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted<T> {
    New,
    /// 同键记录已存在，携带已存储内容供调用方比对
    Existing(T),
}

/// 控制记录的条件：所有已设置字段都必须匹配
#[derive(Debug, Clone, Default, Builder)]
pub struct RefsFilter {
    head: Option<EventId>,
    epoch: Option<EventId>,
    tail: Option<EventId>,
    phase: Option<Phase>,
}

impl RefsFilter {
    pub fn matches(&self, refs: &Refs) -> bool {
        self.head.is_none_or(|head| refs.head == head)
            && self.epoch.is_none_or(|epoch| refs.epoch == epoch)
            && self.tail.is_none_or(|tail| refs.tail == tail)
            && self.phase.is_none_or(|phase| refs.phase == phase)
    }
}

/// 控制记录的更新：仅写入已设置字段
#[derive(Debug, Clone, Default, Builder)]
pub struct RefsUpdate {
    head: Option<EventId>,
    epoch: Option<EventId>,
    tail: Option<EventId>,
    serial: Option<Serial>,
    phase: Option<Phase>,
    dtime: Option<DateTime<Utc>>,
    /// 追加到 `epoch_log` 末尾
    push_epoch: Option<EpochLogEntry>,
}

impl RefsUpdate {
    pub fn apply(&self, refs: &mut Refs) {
        if let Some(head) = self.head {
            refs.head = head;
        }
        if let Some(epoch) = self.epoch {
            refs.epoch = epoch;
        }
        if let Some(tail) = self.tail {
            refs.tail = tail;
        }
        if let Some(serial) = self.serial {
            refs.serial = serial;
        }
        if let Some(phase) = self.phase {
            refs.phase = phase;
        }
        if let Some(dtime) = self.dtime {
            refs.dtime = Some(dtime);
        }
        if let Some(entry) = &self.push_epoch {
            refs.epoch_log.push(entry.clone());
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- 原始事件 ---

    /// 幂等插入；同标识已存在时返回已存储事件
    async fn insert_event(&self, event: &Event) -> Result<Inserted<Event>>;

    async fn get_event(&self, id: EventId) -> Result<Option<Event>>;

    /// 返回是否确实删除了记录
    async fn delete_event(&self, id: EventId) -> Result<bool>;

    /// 按标识升序扫描 `after` 之后的最多 `limit` 条边
    async fn scan_events(&self, after: EventId, limit: usize) -> Result<Vec<EventLink>>;

    // --- 控制记录 ---

    async fn get_refs(&self, id: Uuid) -> Result<Option<Refs>>;

    /// 仅当记录不存在时插入；返回是否插入成功
    async fn insert_refs(&self, refs: &Refs) -> Result<bool>;

    /// 条件更新；返回条件是否命中
    async fn update_refs(&self, id: Uuid, filter: &RefsFilter, update: &RefsUpdate)
    -> Result<bool>;

    /// 条件删除；返回条件是否命中
    async fn delete_refs(&self, id: Uuid, filter: &RefsFilter) -> Result<bool>;

    /// 按 UUID 升序扫描 `after` 之后的最多 `limit` 条控制记录
    async fn scan_refs(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<Refs>>;

    // --- 索引 ---

    /// 幂等插入；同键已存在时返回已存储条目
    async fn insert_index(&self, entry: &IndexEntry) -> Result<Inserted<IndexEntry>>;

    async fn get_index(&self, key: &IndexKey) -> Result<Option<IndexEntry>>;

    /// 按序号升序返回某历史在 `serials` 区间内的最多 `limit` 条条目
    async fn scan_index(
        &self,
        history: Uuid,
        serials: RangeInclusive<u64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>>;

    /// 删除某历史键区间内序号严格小于 `below` 的条目（`None` 表示全部）；返回删除数
    async fn delete_index(&self, history: Uuid, below: Option<u64>) -> Result<u64>;
}

/// 按 UUID 顺序分页遍历全部控制记录
pub(crate) struct RefsPages<'a> {
    store: &'a dyn Store,
    after: Option<Uuid>,
    batch: usize,
    done: bool,
}

impl<'a> RefsPages<'a> {
    pub(crate) fn new(store: &'a dyn Store, batch: usize) -> Self {
        Self {
            store,
            after: None,
            batch: batch.max(1),
            done: false,
        }
    }

    /// 下一页；遍历结束返回 `None`
    pub(crate) async fn next_page(&mut self) -> Result<Option<Vec<Refs>>> {
        if self.done {
            return Ok(None);
        }
        let page = self.store.scan_refs(self.after, self.batch).await?;
        self.done = page.len() < self.batch;
        match page.last() {
            Some(last) => {
                self.after = Some(last.id);
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<T> Store for Arc<T>
where
    T: Store + ?Sized,
{
    async fn insert_event(&self, event: &Event) -> Result<Inserted<Event>> {
        (**self).insert_event(event).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        (**self).get_event(id).await
    }

    async fn delete_event(&self, id: EventId) -> Result<bool> {
        (**self).delete_event(id).await
    }

    async fn scan_events(&self, after: EventId, limit: usize) -> Result<Vec<EventLink>> {
        (**self).scan_events(after, limit).await
    }

    async fn get_refs(&self, id: Uuid) -> Result<Option<Refs>> {
        (**self).get_refs(id).await
    }

    async fn insert_refs(&self, refs: &Refs) -> Result<bool> {
        (**self).insert_refs(refs).await
    }

    async fn update_refs(
        &self,
        id: Uuid,
        filter: &RefsFilter,
        update: &RefsUpdate,
    ) -> Result<bool> {
        (**self).update_refs(id, filter, update).await
    }

    async fn delete_refs(&self, id: Uuid, filter: &RefsFilter) -> Result<bool> {
        (**self).delete_refs(id, filter).await
    }

    async fn scan_refs(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<Refs>> {
        (**self).scan_refs(after, limit).await
    }

    async fn insert_index(&self, entry: &IndexEntry) -> Result<Inserted<IndexEntry>> {
        (**self).insert_index(entry).await
    }

    async fn get_index(&self, key: &IndexKey) -> Result<Option<IndexEntry>> {
        (**self).get_index(key).await
    }

    async fn scan_index(
        &self,
        history: Uuid,
        serials: RangeInclusive<u64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        (**self).scan_index(history, serials, limit).await
    }

    async fn delete_index(&self, history: Uuid, below: Option<u64>) -> Result<u64> {
        (**self).delete_index(history, below).await
    }
}
