//! 内存版存储（InMemoryStore）
//!
//! - 控制记录存放在 `DashMap` 中，分片锁保证单文档条件更新的原子性；
//! - 事件与索引存放在有序映射中，分页扫描与打包键区间扫描天然连续；
//! - 典型用途：测试环境、示例与单进程部署。
//!
use super::{Inserted, RefsFilter, RefsUpdate, Store};
use crate::{
    error::{HistoryError, HistoryResult as Result},
    id::EventId,
    model::{Event, EventLink, IndexEntry, IndexKey, Refs},
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;
use std::ops::{Bound, RangeInclusive};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryStore {
    events: RwLock<BTreeMap<EventId, Event>>,
    refs: DashMap<Uuid, Refs>,
    index: RwLock<BTreeMap<IndexKey, IndexEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().map(|m| m.len()).unwrap_or_default()
    }

    pub fn index_count(&self, history: Uuid) -> usize {
        self.index
            .read()
            .map(|m| {
                m.range(IndexKey::first(history)..=IndexKey::last(history))
                    .count()
            })
            .unwrap_or_default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| HistoryError::store("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| HistoryError::store("in-memory store lock poisoned"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<Inserted<Event>> {
        let mut events = write(&self.events)?;
        if let Some(stored) = events.get(&event.id) {
            return Ok(Inserted::Existing(stored.clone()));
        }
        events.insert(event.id, event.clone());
        Ok(Inserted::New)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(read(&self.events)?.get(&id).cloned())
    }

    async fn delete_event(&self, id: EventId) -> Result<bool> {
        Ok(write(&self.events)?.remove(&id).is_some())
    }

    async fn scan_events(&self, after: EventId, limit: usize) -> Result<Vec<EventLink>> {
        let events = read(&self.events)?;
        Ok(events
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.link())
            .collect())
    }

    async fn get_refs(&self, id: Uuid) -> Result<Option<Refs>> {
        Ok(self.refs.get(&id).map(|r| r.clone()))
    }

    async fn insert_refs(&self, refs: &Refs) -> Result<bool> {
        match self.refs.entry(refs.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(refs.clone());
                Ok(true)
            }
        }
    }

    async fn update_refs(
        &self,
        id: Uuid,
        filter: &RefsFilter,
        update: &RefsUpdate,
    ) -> Result<bool> {
        match self.refs.get_mut(&id) {
            Some(mut refs) if filter.matches(&refs) => {
                update.apply(&mut refs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_refs(&self, id: Uuid, filter: &RefsFilter) -> Result<bool> {
        Ok(self
            .refs
            .remove_if(&id, |_, refs| filter.matches(refs))
            .is_some())
    }

    async fn scan_refs(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<Refs>> {
        let mut ids: Vec<Uuid> = self
            .refs
            .iter()
            .map(|r| *r.key())
            .filter(|id| after.is_none_or(|after| *id > after))
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids
            .into_iter()
            .filter_map(|id| self.refs.get(&id).map(|r| r.clone()))
            .collect())
    }

    async fn insert_index(&self, entry: &IndexEntry) -> Result<Inserted<IndexEntry>> {
        let mut index = write(&self.index)?;
        if let Some(stored) = index.get(&entry.key) {
            return Ok(Inserted::Existing(stored.clone()));
        }
        index.insert(entry.key, entry.clone());
        Ok(Inserted::New)
    }

    async fn get_index(&self, key: &IndexKey) -> Result<Option<IndexEntry>> {
        Ok(read(&self.index)?.get(key).cloned())
    }

    async fn scan_index(
        &self,
        history: Uuid,
        serials: RangeInclusive<u64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        let index = read(&self.index)?;
        let mut rows: Vec<IndexEntry> = index
            .range(IndexKey::first(history)..=IndexKey::last(history))
            .map(|(_, e)| e)
            .filter(|e| serials.contains(&e.serial))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.serial);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn delete_index(&self, history: Uuid, below: Option<u64>) -> Result<u64> {
        let mut index = write(&self.index)?;
        let doomed: Vec<IndexKey> = index
            .range(IndexKey::first(history)..=IndexKey::last(history))
            .filter(|(_, e)| below.is_none_or(|below| e.serial < below))
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            index.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}
