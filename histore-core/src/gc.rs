//! 垃圾回收（GarbageCollector）
//!
//! 严格按顺序执行四个阶段，前一阶段造成的状态变化不会在同一轮被后续阶段利用：
//! 1. 事件回收：对全部事件建图并着色，删除既不新近、又无法从任何 head 到达的事件；
//! 2. 索引裁尾：删除 `Active` 历史中序号低于 tail 的索引行；
//! 3. 终结删除：`Deleted` 阶段超过冷却期的控制记录被整体移除；
//! 4. 完成删除：`Deleting` 阶段超过冷却期的历史，先作废序号、清空索引，再置为 `Deleted`。
//!
//! 每一步都是幂等的单记录操作，任意时刻中断后由下一次调度续作。
//!
use crate::{
    clock::{Clock, SystemClock},
    error::{HistoryError, HistoryResult as Result, bail_if_cancelled},
    id::EventId,
    model::{IndexKey, Phase, Refs, Serial},
    store::{RefsFilter, RefsPages, RefsUpdate, Store},
};
use bon::{Builder, bon};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 回收配置
#[derive(Debug, Clone, Copy, Builder)]
pub struct GcConfig {
    /// 新近窗口内的事件无条件保留
    #[builder(default = Duration::days(30))]
    pub recency_window: Duration,
    /// `Deleted` 控制记录自 dtime 起的保留期
    #[builder(default = Duration::days(30))]
    pub deleted_retention: Duration,
    /// `Deleting` 历史自 dtime 起的保留期
    #[builder(default = Duration::days(15))]
    pub deleting_retention: Duration,
    #[builder(default = 256)]
    pub scan_batch: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            recency_window: Duration::days(30),
            deleted_retention: Duration::days(30),
            deleting_retention: Duration::days(15),
            scan_batch: 256,
        }
    }
}

/// 一次回收的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub events_scanned: u64,
    pub events_reclaimed: u64,
    pub index_rows_pruned: u64,
    pub histories_finalized: u64,
    pub deletions_completed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// 新近事件或某个历史的 head
    Protected,
    /// 可回收，除非被重新着色
    Candidate,
    /// 从 head 可达，或是某个历史的 tail
    Retained,
}

struct Node {
    parent: EventId,
    color: Color,
}

pub struct GarbageCollector {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: GcConfig,
}

#[bon]
impl GarbageCollector {
    #[builder]
    pub fn new(
        store: Arc<dyn Store>,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        #[builder(default)] config: GcConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }
}

impl GarbageCollector {
    pub async fn gc(&self, cancel: &CancellationToken) -> Result<GcReport> {
        let mut report = GcReport::default();
        self.reclaim_events(cancel, &mut report).await?;
        self.prune_index_tails(cancel, &mut report).await?;
        self.finalize_deleted(cancel, &mut report).await?;
        self.complete_deleting(cancel, &mut report).await?;
        info!(
            scanned = report.events_scanned,
            reclaimed = report.events_reclaimed,
            pruned = report.index_rows_pruned,
            finalized = report.histories_finalized,
            completed = report.deletions_completed,
            "gc finished"
        );
        Ok(report)
    }

    async fn reclaim_events(
        &self,
        cancel: &CancellationToken,
        report: &mut GcReport,
    ) -> Result<()> {
        let now = self.clock.now();
        let batch = self.config.scan_batch.max(1);
        let mut graph: HashMap<EventId, Node> = HashMap::new();

        let mut after = EventId::NIL;
        loop {
            bail_if_cancelled(cancel)?;
            let page = self.store.scan_events(after, batch).await?;
            for link in &page {
                let color = if now - link.id.timestamp() < self.config.recency_window {
                    Color::Protected
                } else {
                    Color::Candidate
                };
                graph.insert(
                    link.id,
                    Node {
                        parent: link.parent,
                        color,
                    },
                );
            }
            report.events_scanned += page.len() as u64;
            match page.last() {
                Some(last) if page.len() == batch => after = last.id,
                _ => break,
            }
        }

        let mut pages = RefsPages::new(self.store.as_ref(), batch);
        while let Some(page) = pages.next_page().await? {
            for refs in &page {
                bail_if_cancelled(cancel)?;
                if !refs.head.is_nil() {
                    self.color_root(&mut graph, refs, refs.head, Color::Protected)
                        .await?;
                }
                if !refs.tail.is_nil() {
                    self.color_root(&mut graph, refs, refs.tail, Color::Retained)
                        .await?;
                }
            }
        }

        let roots: Vec<EventId> = graph
            .iter()
            .filter(|(_, node)| node.color == Color::Protected)
            .map(|(id, _)| *id)
            .collect();
        for root in roots {
            let mut cursor = graph.get(&root).map_or(EventId::NIL, |n| n.parent);
            while let Some(node) = graph.get_mut(&cursor) {
                if node.color == Color::Retained {
                    break;
                }
                node.color = Color::Retained;
                cursor = node.parent;
            }
        }

        let mut doomed: Vec<EventId> = graph
            .into_iter()
            .filter(|(_, node)| node.color == Color::Candidate)
            .map(|(id, _)| id)
            .collect();
        doomed.sort_unstable();
        for id in doomed {
            bail_if_cancelled(cancel)?;
            if self.store.delete_event(id).await? {
                info!(event = %id, created = %id.timestamp(), "event reclaimed");
                report.events_reclaimed += 1;
            }
        }
        Ok(())
    }

    /// 给 head / tail 着色；扫描之后才提交的事件直接从存储读取。
    ///
    /// 未扫描到的 head 沿父链逐个补入图中，直到遇见图中节点、NIL 或该历史的 tail；
    /// 链上缺失的事件视为数据损坏。
    async fn color_root(
        &self,
        graph: &mut HashMap<EventId, Node>,
        refs: &Refs,
        id: EventId,
        color: Color,
    ) -> Result<()> {
        if let Some(node) = graph.get_mut(&id) {
            if node.color != Color::Retained {
                node.color = color;
            }
            return Ok(());
        }
        let mut cursor = self.fetch_node(graph, refs, id, color).await?;
        if color != Color::Protected {
            return Ok(());
        }
        while !cursor.is_nil() && cursor != refs.tail && !graph.contains_key(&cursor) {
            // 随后的根遍历会把这些节点改为 Retained
            cursor = self
                .fetch_node(graph, refs, cursor, Color::Candidate)
                .await?;
        }
        Ok(())
    }

    /// 读取单个事件放入图中，返回其父标识
    async fn fetch_node(
        &self,
        graph: &mut HashMap<EventId, Node>,
        refs: &Refs,
        id: EventId,
        color: Color,
    ) -> Result<EventId> {
        let Some(event) = self.store.get_event(id).await? else {
            return Err(HistoryError::corrupted(format!(
                "history {} references missing event {id}",
                refs.id
            )));
        };
        debug!(history = %refs.id, event = %id, "event committed after scan");
        graph.insert(
            id,
            Node {
                parent: event.parent,
                color,
            },
        );
        Ok(event.parent)
    }

    async fn prune_index_tails(
        &self,
        cancel: &CancellationToken,
        report: &mut GcReport,
    ) -> Result<()> {
        let mut pages = RefsPages::new(self.store.as_ref(), self.config.scan_batch);
        while let Some(page) = pages.next_page().await? {
            for refs in page.iter().filter(|r| r.is_active() && !r.tail.is_nil()) {
                bail_if_cancelled(cancel)?;
                let key = IndexKey::new(refs.id, refs.tail);
                let Some(row) = self.store.get_index(&key).await? else {
                    debug!(history = %refs.id, tail = %refs.tail, "tail not materialized yet");
                    continue;
                };
                let pruned = self.store.delete_index(refs.id, Some(row.serial)).await?;
                if pruned > 0 {
                    info!(history = %refs.id, below = row.serial, pruned, "index rows pruned");
                    report.index_rows_pruned += pruned;
                }
            }
        }
        Ok(())
    }

    async fn finalize_deleted(
        &self,
        cancel: &CancellationToken,
        report: &mut GcReport,
    ) -> Result<()> {
        let now = self.clock.now();
        let filter = RefsFilter::builder().phase(Phase::Deleted).build();
        let mut pages = RefsPages::new(self.store.as_ref(), self.config.scan_batch);
        while let Some(page) = pages.next_page().await? {
            for refs in page.iter().filter(|r| r.phase == Phase::Deleted) {
                bail_if_cancelled(cancel)?;
                if refs
                    .dtime
                    .is_some_and(|dtime| dtime + self.config.deleted_retention > now)
                {
                    continue;
                }
                if self.store.delete_refs(refs.id, &filter).await? {
                    info!(history = %refs.id, dtime = ?refs.dtime, "deleted history finalized");
                    report.histories_finalized += 1;
                }
            }
        }
        Ok(())
    }

    async fn complete_deleting(
        &self,
        cancel: &CancellationToken,
        report: &mut GcReport,
    ) -> Result<()> {
        let now = self.clock.now();
        let filter = RefsFilter::builder().phase(Phase::Deleting).build();
        let mut pages = RefsPages::new(self.store.as_ref(), self.config.scan_batch);
        while let Some(page) = pages.next_page().await? {
            for refs in page.iter().filter(|r| r.phase == Phase::Deleting) {
                bail_if_cancelled(cancel)?;
                if refs
                    .dtime
                    .is_some_and(|dtime| dtime + self.config.deleting_retention > now)
                {
                    continue;
                }

                // 先作废序号：中途崩溃时索引明显过期，而不是悄悄出错
                let stale = RefsUpdate::builder().serial(Serial::Unspecified).build();
                if !self.store.update_refs(refs.id, &filter, &stale).await? {
                    continue;
                }
                let removed = self.store.delete_index(refs.id, None).await?;
                let done = RefsUpdate::builder().phase(Phase::Deleted).build();
                if self.store.update_refs(refs.id, &filter, &done).await? {
                    info!(history = %refs.id, index_rows = removed, "deletion completed");
                    report.deletions_completed += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::journal::Journal;
    use crate::model::{Event, EventLink, IndexEntry};
    use crate::store::{InMemoryStore, Inserted};
    use async_trait::async_trait;
    use futures_util::TryStreamExt;
    use std::ops::RangeInclusive;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// 在首次扫描控制记录时插入一段并发提交，或取消本轮回收
    struct InterleavedStore {
        inner: Arc<InMemoryStore>,
        commit: Mutex<Option<(Uuid, EventId, Vec<Event>)>>,
        cancel: Mutex<Option<CancellationToken>>,
    }

    impl InterleavedStore {
        fn new(inner: Arc<InMemoryStore>) -> Self {
            Self {
                inner,
                commit: Mutex::new(None),
                cancel: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Store for InterleavedStore {
        async fn insert_event(&self, event: &Event) -> Result<Inserted<Event>> {
            self.inner.insert_event(event).await
        }

        async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
            self.inner.get_event(id).await
        }

        async fn delete_event(&self, id: EventId) -> Result<bool> {
            self.inner.delete_event(id).await
        }

        async fn scan_events(&self, after: EventId, limit: usize) -> Result<Vec<EventLink>> {
            self.inner.scan_events(after, limit).await
        }

        async fn get_refs(&self, id: Uuid) -> Result<Option<Refs>> {
            self.inner.get_refs(id).await
        }

        async fn insert_refs(&self, refs: &Refs) -> Result<bool> {
            self.inner.insert_refs(refs).await
        }

        async fn update_refs(
            &self,
            id: Uuid,
            filter: &RefsFilter,
            update: &RefsUpdate,
        ) -> Result<bool> {
            self.inner.update_refs(id, filter, update).await
        }

        async fn delete_refs(&self, id: Uuid, filter: &RefsFilter) -> Result<bool> {
            self.inner.delete_refs(id, filter).await
        }

        async fn scan_refs(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<Refs>> {
            let commit = self.commit.lock().unwrap().take();
            if let Some((history, head, events)) = commit {
                for event in &events {
                    self.inner.insert_event(event).await?;
                }
                let filter = RefsFilter::builder()
                    .head(head)
                    .phase(Phase::Active)
                    .build();
                let update = RefsUpdate::builder()
                    .head(events[events.len() - 1].id)
                    .serial(Serial::Unspecified)
                    .build();
                assert!(self.inner.update_refs(history, &filter, &update).await?);
            }
            let cancel = self.cancel.lock().unwrap().take();
            if let Some(token) = cancel {
                token.cancel();
            }
            self.inner.scan_refs(after, limit).await
        }

        async fn insert_index(&self, entry: &IndexEntry) -> Result<Inserted<IndexEntry>> {
            self.inner.insert_index(entry).await
        }

        async fn get_index(&self, key: &IndexKey) -> Result<Option<IndexEntry>> {
            self.inner.get_index(key).await
        }

        async fn scan_index(
            &self,
            history: Uuid,
            serials: RangeInclusive<u64>,
            limit: usize,
        ) -> Result<Vec<IndexEntry>> {
            self.inner.scan_index(history, serials, limit).await
        }

        async fn delete_index(&self, history: Uuid, below: Option<u64>) -> Result<u64> {
            self.inner.delete_index(history, below).await
        }
    }

    struct Fixture {
        clock: ManualClock,
        store: Arc<InMemoryStore>,
        journal: Journal,
        gc: GarbageCollector,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStore::new());
        let journal = Journal::builder()
            .store(store.clone())
            .clock(Arc::new(clock.clone()))
            .build();
        let gc = GarbageCollector::builder()
            .store(store.clone())
            .clock(Arc::new(clock.clone()))
            .build();
        Fixture {
            clock,
            store,
            journal,
            gc,
        }
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n).map(|i| Event::new(vec![i as u8])).collect()
    }

    #[tokio::test]
    async fn reclaims_only_old_unreachable_events() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(4)).await.unwrap();
        // 孤立事件：写入成功但控制记录从未指向它
        let orphan = Event {
            id: f.journal.next_id().unwrap(),
            parent: chain[3].id,
            payload: b"lost".to_vec(),
        };
        f.store.insert_event(&orphan).await.unwrap();

        let cancel = CancellationToken::new();
        let report = f.gc.gc(&cancel).await.unwrap();
        assert_eq!(report.events_reclaimed, 0, "everything is recent");

        f.clock.advance(Duration::days(31));
        let report = f.gc.gc(&cancel).await.unwrap();
        assert_eq!(report.events_scanned, 5);
        assert_eq!(report.events_reclaimed, 1);
        assert!(f.store.get_event(orphan.id).await.unwrap().is_none());
        for event in &chain {
            assert!(f.store.get_event(event.id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn events_behind_tail_are_reclaimed_and_index_pruned() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(5)).await.unwrap();
        let replayed: Vec<Event> = f
            .journal
            .find(id, EventId::NIL)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(replayed.len(), 5);

        let update = RefsUpdate::builder()
            .epoch(chain[2].id)
            .tail(chain[2].id)
            .build();
        f.store
            .update_refs(id, &RefsFilter::default(), &update)
            .await
            .unwrap();

        f.clock.advance(Duration::days(31));
        let report = f.gc.gc(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.events_reclaimed, 2);
        assert_eq!(report.index_rows_pruned, 2);
        assert!(f.store.get_event(chain[0].id).await.unwrap().is_none());
        assert!(f.store.get_event(chain[1].id).await.unwrap().is_none());
        assert!(f.store.get_event(chain[2].id).await.unwrap().is_some());
        assert_eq!(f.store.index_count(id), 3);

        let replayed: Vec<Event> = f
            .journal
            .find(id, EventId::NIL)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(replayed, chain[3..].to_vec());
    }

    #[tokio::test]
    async fn missing_head_is_corruption() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(1)).await.unwrap();
        f.store.delete_event(chain[0].id).await.unwrap();

        let err = f.gc.gc(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HistoryError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn deletion_completes_then_finalizes() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(2)).await.unwrap();
        f.journal
            .find(id, EventId::NIL)
            .await
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        f.journal.delete(id, chain[1].id).await.unwrap();
        let dtime = f.store.get_refs(id).await.unwrap().unwrap().dtime;
        let cancel = CancellationToken::new();

        f.clock.advance(Duration::days(14));
        let report = f.gc.gc(&cancel).await.unwrap();
        assert_eq!(report.deletions_completed, 0);
        assert_eq!(f.store.index_count(id), 2);

        f.clock.advance(Duration::days(2));
        let report = f.gc.gc(&cancel).await.unwrap();
        assert_eq!(report.deletions_completed, 1);
        assert_eq!(report.histories_finalized, 0);
        let refs = f.store.get_refs(id).await.unwrap().unwrap();
        assert_eq!(refs.phase, Phase::Deleted);
        assert_eq!(refs.serial, Serial::Unspecified);
        assert_eq!(refs.dtime, dtime);
        assert_eq!(f.store.index_count(id), 0);
        // 控制记录仍在，head 仍受保护
        assert!(f.store.get_event(chain[1].id).await.unwrap().is_some());

        f.clock.advance(Duration::days(15));
        let report = f.gc.gc(&cancel).await.unwrap();
        assert_eq!(report.histories_finalized, 1);
        assert!(f.store.get_refs(id).await.unwrap().is_none());

        let report = f.gc.gc(&cancel).await.unwrap();
        assert_eq!(report.events_reclaimed, 2);
        assert_eq!(f.store.event_count(), 0);
    }

    #[tokio::test]
    async fn commits_racing_the_scan_keep_old_head_reachable() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(3)).await.unwrap();
        f.clock.advance(Duration::days(40));

        // 事件扫描之后、控制记录扫描之前又提交了两个事件
        let first = Event {
            id: f.journal.next_id().unwrap(),
            parent: chain[2].id,
            payload: b"e1".to_vec(),
        };
        let second = Event {
            id: f.journal.next_id().unwrap(),
            parent: first.id,
            payload: b"e2".to_vec(),
        };
        let racing = Arc::new(InterleavedStore::new(f.store.clone()));
        *racing.commit.lock().unwrap() =
            Some((id, chain[2].id, vec![first.clone(), second.clone()]));
        let gc = GarbageCollector::builder()
            .store(racing.clone())
            .clock(Arc::new(f.clock.clone()))
            .build();

        let report = gc.gc(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.events_scanned, 3);
        assert_eq!(report.events_reclaimed, 0);
        for event in chain.iter().chain([&first, &second]) {
            assert!(f.store.get_event(event.id).await.unwrap().is_some());
        }
        assert_eq!(f.store.get_refs(id).await.unwrap().unwrap().head, second.id);

        let replayed: Vec<Event> = f
            .journal
            .find(id, EventId::NIL)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(replayed.len(), 5);
    }

    #[tokio::test]
    async fn unscanned_head_with_missing_ancestor_is_corruption() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(2)).await.unwrap();
        let next = Event {
            id: f.journal.next_id().unwrap(),
            parent: chain[1].id,
            payload: b"late".to_vec(),
        };
        let later = Event {
            id: f.journal.next_id().unwrap(),
            parent: next.id,
            payload: b"later".to_vec(),
        };
        // 只写入较新的那个，父事件缺失
        let racing = Arc::new(InterleavedStore::new(f.store.clone()));
        *racing.commit.lock().unwrap() = Some((id, chain[1].id, vec![later]));
        let gc = GarbageCollector::builder()
            .store(racing)
            .clock(Arc::new(f.clock.clone()))
            .build();

        let err = gc.gc(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HistoryError::Corrupted { .. }));
        assert_eq!(f.store.event_count(), 3);
    }

    #[tokio::test]
    async fn cancelled_between_records_deletes_nothing() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(2)).await.unwrap();
        let orphan = Event {
            id: f.journal.next_id().unwrap(),
            parent: chain[1].id,
            payload: b"lost".to_vec(),
        };
        f.store.insert_event(&orphan).await.unwrap();
        f.clock.advance(Duration::days(31));

        let cancel = CancellationToken::new();
        let racing = Arc::new(InterleavedStore::new(f.store.clone()));
        *racing.cancel.lock().unwrap() = Some(cancel.clone());
        let gc = GarbageCollector::builder()
            .store(racing)
            .clock(Arc::new(f.clock.clone()))
            .build();

        let err = gc.gc(&cancel).await.unwrap_err();
        assert!(matches!(err, HistoryError::Cancelled));
        assert_eq!(f.store.event_count(), 3);

        // 下一轮照常回收
        let report = f.gc.gc(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.events_reclaimed, 1);
        assert!(f.store.get_event(orphan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_deletion_is_finished_by_next_run() {
        let f = fixture();
        let id = Uuid::new_v4();
        let chain = f.journal.commit(id, events(3)).await.unwrap();
        f.journal
            .find(id, EventId::NIL)
            .await
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(f.store.index_count(id), 3);
        f.journal.delete(id, chain[2].id).await.unwrap();

        // 崩溃现场：序号已作废，索引只删了一部分，阶段仍是 Deleting
        let deleting = RefsFilter::builder().phase(Phase::Deleting).build();
        let stale = RefsUpdate::builder().serial(Serial::Unspecified).build();
        assert!(f.store.update_refs(id, &deleting, &stale).await.unwrap());
        assert_eq!(f.store.delete_index(id, Some(2)).await.unwrap(), 1);
        assert_eq!(f.store.index_count(id), 2);

        f.clock.advance(Duration::days(16));
        let report = f.gc.gc(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.deletions_completed, 1);
        let refs = f.store.get_refs(id).await.unwrap().unwrap();
        assert_eq!(refs.phase, Phase::Deleted);
        assert_eq!(refs.serial, Serial::Unspecified);
        assert_eq!(f.store.index_count(id), 0);
    }
}
