#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use histore_core::behavior::{Advancer, Behavior};
use histore_core::clock::ManualClock;
use histore_core::engine::Engine;
use histore_core::gc::GarbageCollector;
use histore_core::id::EventId;
use histore_core::journal::Journal;
use histore_core::notifier::{Notifier, NotifierConfig};
use histore_core::retention::{Retained, RetentionPolicy};
use histore_core::store::{InMemoryStore, Store};
use histore_core::trimmer::Trimmer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Credited { amount: i64 },
    Debited { amount: i64 },
    /// 余额快照：之前的事件对重放不再必要
    Snapshot { balance: i64 },
}

#[derive(Debug, Clone)]
pub enum LedgerCommand {
    Credit(i64),
    Debit(i64),
    Snapshot,
    Close,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub balance: i64,
    pub applied: Vec<EventId>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("ledger is not settled")]
    NotSettled,
}

pub struct LedgerAdvancer;

impl Advancer<Ledger, LedgerEvent> for LedgerAdvancer {
    fn advance(&mut self, state: &mut Ledger, id: EventId, event: LedgerEvent) {
        match event {
            LedgerEvent::Credited { amount } => state.balance += amount,
            LedgerEvent::Debited { amount } => state.balance -= amount,
            LedgerEvent::Snapshot { balance } => state.balance = balance,
        }
        state.applied.push(id);
    }
}

pub struct LedgerBehavior;

impl Behavior for LedgerBehavior {
    type State = Ledger;
    type Event = LedgerEvent;
    type Command = LedgerCommand;
    type Error = LedgerError;
    type Advancer = LedgerAdvancer;

    fn new_state(&self, _id: Uuid) -> Ledger {
        Ledger::default()
    }

    fn new_advancer(&self) -> LedgerAdvancer {
        LedgerAdvancer
    }

    fn tell(
        &self,
        state: &Ledger,
        command: LedgerCommand,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        match command {
            LedgerCommand::Credit(amount) => Ok(vec![LedgerEvent::Credited { amount }]),
            LedgerCommand::Debit(amount) if amount > state.balance => {
                Err(LedgerError::InsufficientFunds {
                    balance: state.balance,
                    requested: amount,
                })
            }
            LedgerCommand::Debit(amount) => Ok(vec![LedgerEvent::Debited { amount }]),
            LedgerCommand::Snapshot => Ok(vec![LedgerEvent::Snapshot {
                balance: state.balance,
            }]),
            LedgerCommand::Close if state.balance != 0 => Err(LedgerError::NotSettled),
            LedgerCommand::Close => Ok(vec![]),
        }
    }
}

/// 快照之前的事件可裁剪；纪元满 `tail_after` 后成为尾部
pub struct SnapshotPolicy {
    pub tail_after: Duration,
}

impl RetentionPolicy for SnapshotPolicy {
    type Event = LedgerEvent;

    fn is_new_epoch(
        &self,
        _epoch: &Retained<LedgerEvent>,
        next: &Retained<LedgerEvent>,
        _now: DateTime<Utc>,
    ) -> bool {
        matches!(next.event, LedgerEvent::Snapshot { .. })
    }

    fn is_new_tail(&self, _event: EventId, epoch_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - epoch_time >= self.tail_after
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<InMemoryStore>,
    pub notifier: Notifier,
    pub journal: Arc<Journal>,
    pub engine: Arc<Engine<LedgerBehavior>>,
    pub trimmer: Arc<Trimmer<SnapshotPolicy>>,
    pub gc: Arc<GarbageCollector>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStore::new());
        let notifier = Notifier::spawn(NotifierConfig::default());
        let journal = Arc::new(
            Journal::builder()
                .store(store.clone() as Arc<dyn Store>)
                .clock(Arc::new(clock.clone()))
                .notifier(notifier.clone())
                .build(),
        );
        let engine = Arc::new(
            Engine::builder()
                .journal(journal.clone())
                .behavior(LedgerBehavior)
                .build(),
        );
        let trimmer = Arc::new(
            Trimmer::builder()
                .journal(journal.clone())
                .policy(SnapshotPolicy {
                    tail_after: Duration::days(7),
                })
                .build(),
        );
        let gc = Arc::new(
            GarbageCollector::builder()
                .store(store.clone() as Arc<dyn Store>)
                .clock(Arc::new(clock.clone()))
                .build(),
        );
        Self {
            clock,
            store,
            notifier,
            journal,
            engine,
            trimmer,
            gc,
        }
    }

    /// 从 head 沿父链回溯到 tail（或起点）的事件标识，按时间正序
    pub async fn chain(&self, id: Uuid) -> Vec<EventId> {
        let refs = self.store.get_refs(id).await.unwrap().unwrap();
        let mut ids = Vec::new();
        let mut cursor = refs.head;
        while !cursor.is_nil() {
            let event = self.store.get_event(cursor).await.unwrap().unwrap_or_else(|| {
                panic!("history {id} is missing event {cursor}");
            });
            ids.push(event.id);
            if event.id == refs.tail {
                break;
            }
            cursor = event.parent;
        }
        ids.reverse();
        ids
    }
}
