//! 事件日志（Journal）
//!
//! 只追加的事件存储，面向单个历史（聚合流）提供：
//! - `head`：读取当前头指针；
//! - `commit`：幂等写入原始事件，再以条件更新把 head 换成新链尾（乐观并发）；
//! - `find`：惰性物化序号索引后，按区间分页重放事件；
//! - `delete`：软删除（进入 `Deleting` 阶段），由 GC 分两阶段完成清理。
//!
//! 不存在任何全局锁：跨进程协调全部依赖控制记录上的单文档 CAS。
//!
use crate::{
    clock::{Clock, SystemClock},
    error::{HistoryError, HistoryResult as Result},
    id::{EventId, IdGenerator},
    model::{Event, IndexEntry, IndexKey, Phase, Refs, Serial},
    notifier::Notifier,
    store::{Inserted, RefsFilter, RefsUpdate, Store},
};
use bon::{Builder, bon};
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// 按序重放的惰性事件流：有限、只进，链接断裂时立即以损坏错误结束
pub type EventStream = BoxStream<'static, Result<Event>>;

/// 日志配置
#[derive(Debug, Clone, Copy, Builder)]
pub struct JournalConfig {
    /// 重放时每次从索引读取的行数
    #[builder(default = 256)]
    pub scan_batch: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { scan_batch: 256 }
    }
}

pub struct Journal {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    notifier: Option<Notifier>,
    config: JournalConfig,
}

#[bon]
impl Journal {
    #[builder]
    pub fn new(
        store: Arc<dyn Store>,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        notifier: Option<Notifier>,
        #[builder(default)] config: JournalConfig,
    ) -> Self {
        Self {
            store,
            ids: IdGenerator::new(clock.clone()),
            clock,
            notifier,
            config,
        }
    }
}

impl Journal {
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    /// 生成一个新的事件标识
    pub fn next_id(&self) -> Result<EventId> {
        self.ids.generate()
    }

    /// 读取控制记录（任意阶段）
    pub async fn refs(&self, id: Uuid) -> Result<Option<Refs>> {
        self.store.get_refs(id).await
    }

    /// 当前头指针；历史未知或非 `Active` 时返回 `EventId::NIL`
    pub async fn head(&self, id: Uuid) -> Result<EventId> {
        Ok(match self.store.get_refs(id).await? {
            Some(refs) if refs.is_active() => refs.head,
            _ => EventId::NIL,
        })
    }

    /// 提交一条事件链：
    /// 1. 为缺失标识/父链接的事件补齐；
    /// 2. 幂等写入每个原始事件（同标识内容不一致即失败）；
    /// 3. 链首父事件为 NIL 时插入新控制记录，否则要求 `head == chain[0].parent` 后换头并重置序号；
    /// 4. 成功后尽力发出通知。
    pub async fn commit(&self, id: Uuid, mut events: Vec<Event>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(events);
        }
        self.link(&mut events)?;
        let parent = events[0].parent;
        let head = events[events.len() - 1].id;

        for event in &events {
            if let Inserted::Existing(stored) = self.store.insert_event(event).await? {
                if stored != *event {
                    return Err(HistoryError::DuplicateMismatch { id: event.id });
                }
            }
        }

        let swapped = if parent.is_nil() {
            self.store.insert_refs(&Refs::new(id, head)).await?
        } else {
            let filter = RefsFilter::builder()
                .head(parent)
                .phase(Phase::Active)
                .build();
            let update = RefsUpdate::builder()
                .head(head)
                .serial(Serial::Unspecified)
                .build();
            self.store.update_refs(id, &filter, &update).await?
        };
        if !swapped {
            return Err(self.commit_conflict(id, parent).await);
        }

        debug!(history = %id, %head, count = events.len(), "events committed");
        if let Some(notifier) = &self.notifier {
            notifier.post(id);
        }
        Ok(events)
    }

    fn link(&self, events: &mut [Event]) -> Result<()> {
        let mut prev: Option<EventId> = None;
        for event in events.iter_mut() {
            if event.id.is_nil() {
                event.id = self.ids.generate()?;
            }
            if event.id.is_reserved() {
                return Err(HistoryError::invalid_argument(format!(
                    "event id {} is a reserved version token",
                    event.id
                )));
            }
            if let Some(prev) = prev {
                if event.parent.is_nil() {
                    event.parent = prev;
                } else if event.parent != prev {
                    return Err(HistoryError::invalid_argument(format!(
                        "event {} links to {}, expected {}",
                        event.id, event.parent, prev
                    )));
                }
            }
            if event.parent == event.id {
                return Err(HistoryError::invalid_argument(format!(
                    "event {} links to itself",
                    event.id
                )));
            }
            prev = Some(event.id);
        }
        Ok(())
    }

    /// 区分“历史从未出现”、“历史已删除”与“版本冲突”
    async fn commit_conflict(&self, id: Uuid, expected: EventId) -> HistoryError {
        match self.store.get_refs(id).await {
            Err(err) => err,
            Ok(None) => HistoryError::UnknownHistory { id },
            Ok(Some(refs)) if !refs.is_active() => HistoryError::HistoryDeleted { id },
            Ok(Some(refs)) => HistoryError::VersionConflict {
                stored: refs.head,
                expected,
            },
        }
    }

    /// 返回 `after` 之后的事件流。
    ///
    /// `after` 为 `EventId::NIL` 时从已存储的 Epoch 开始，被裁剪的历史对调用方透明。
    /// 读取上限是调用时 head 的序号，并发提交不会让本次读取看到半物化的结果。
    /// `after` 不属于该历史（或历史已非 `Active`）时返回 `CursorNotFound`。
    pub async fn find(&self, id: Uuid, after: EventId) -> Result<EventStream> {
        let refs = match self.store.get_refs(id).await? {
            Some(refs) if refs.is_active() => refs,
            _ if after.is_nil() => return Ok(stream::empty().boxed()),
            _ => {
                return Err(HistoryError::CursorNotFound {
                    history: id,
                    event: after,
                });
            }
        };

        let upper = self.ensure_journal(&refs).await?;
        let after = if after.is_nil() { refs.epoch } else { after };
        let lower = if after.is_nil() {
            0
        } else {
            match self.store.get_index(&IndexKey::new(id, after)).await? {
                Some(entry) => entry.serial,
                None => {
                    return Err(HistoryError::CursorNotFound {
                        history: id,
                        event: after,
                    });
                }
            }
        };

        Ok(self.replay(id, after, lower, upper))
    }

    /// 惰性物化索引，返回 head 的序号。
    ///
    /// 序号未知时从 head 沿父链回溯，直到 NIL、已物化条目或 tail，
    /// 再按正序逐条幂等写入递增序号；仅当 head 未变时回写序号。
    async fn ensure_journal(&self, refs: &Refs) -> Result<u64> {
        if let Serial::At(serial) = refs.serial {
            return Ok(serial);
        }

        let mut pending = Vec::new();
        let mut cursor = refs.head;
        let base = loop {
            if cursor.is_nil() {
                break 0;
            }
            if let Some(entry) = self.store.get_index(&IndexKey::new(refs.id, cursor)).await? {
                break entry.serial;
            }
            let Some(event) = self.store.get_event(cursor).await? else {
                return Err(HistoryError::corrupted(format!(
                    "history {} is missing event {}",
                    refs.id, cursor
                )));
            };
            cursor = event.parent;
            let reached_tail = event.id == refs.tail;
            pending.push(event);
            if reached_tail {
                break 0;
            }
        };

        let mut serial = base;
        let materialized = pending.len();
        for event in pending.iter().rev() {
            serial += 1;
            let entry = IndexEntry::new(refs.id, event, serial);
            if let Inserted::Existing(stored) = self.store.insert_index(&entry).await? {
                if stored != entry {
                    return Err(HistoryError::DuplicateMismatch { id: event.id });
                }
            }
        }

        let filter = RefsFilter::builder()
            .head(refs.head)
            .phase(Phase::Active)
            .build();
        let update = RefsUpdate::builder().serial(Serial::At(serial)).build();
        self.store.update_refs(refs.id, &filter, &update).await?;

        debug!(history = %refs.id, materialized, serial, "index materialized");
        Ok(serial)
    }

    fn replay(&self, id: Uuid, after: EventId, lower: u64, upper: u64) -> EventStream {
        struct Cursor {
            next: u64,
            prev: EventId,
            buffer: VecDeque<IndexEntry>,
        }

        let store = self.store.clone();
        let batch = self.config.scan_batch.max(1);
        let cursor = Cursor {
            next: lower + 1,
            prev: after,
            buffer: VecDeque::new(),
        };

        stream::try_unfold(cursor, move |mut cursor| {
            let store = store.clone();
            async move {
                if cursor.buffer.is_empty() {
                    if cursor.next > upper {
                        return Ok(None);
                    }
                    let end = upper.min(cursor.next.saturating_add(batch as u64 - 1));
                    let rows = store.scan_index(id, cursor.next..=end, batch).await?;
                    if rows.is_empty() {
                        return Err(HistoryError::corrupted(format!(
                            "history {id} has no index rows from serial {}",
                            cursor.next
                        )));
                    }
                    cursor.buffer.extend(rows);
                }
                let Some(entry) = cursor.buffer.pop_front() else {
                    return Ok(None);
                };
                if entry.serial != cursor.next || entry.parent != cursor.prev {
                    return Err(HistoryError::corrupted(format!(
                        "history {id} breaks at serial {}: event {} links to {}, expected {}",
                        cursor.next,
                        entry.key.event(),
                        entry.parent,
                        cursor.prev
                    )));
                }
                cursor.next += 1;
                cursor.prev = entry.key.event();
                Ok(Some((entry.into_event(), cursor)))
            }
        })
        .boxed()
    }

    /// 软删除：要求 head 仍为 `head` 时置为 `Deleting`；已删除时幂等成功
    pub async fn delete(&self, id: Uuid, head: EventId) -> Result<()> {
        let filter = RefsFilter::builder()
            .head(head)
            .phase(Phase::Active)
            .build();
        let update = RefsUpdate::builder()
            .phase(Phase::Deleting)
            .dtime(self.clock.now())
            .build();
        if self.store.update_refs(id, &filter, &update).await? {
            debug!(history = %id, %head, "history marked for deletion");
            return Ok(());
        }

        match self.store.get_refs(id).await? {
            None => Err(HistoryError::UnknownHistory { id }),
            Some(refs) if !refs.is_active() => Ok(()),
            Some(refs) => Err(HistoryError::VersionConflict {
                stored: refs.head,
                expected: head,
            }),
        }
    }
}
