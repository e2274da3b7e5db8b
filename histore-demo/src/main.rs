use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use histore_core::behavior::{Advancer, Behavior};
use histore_core::clock::ManualClock;
use histore_core::engine::{Engine, TellError};
use histore_core::gc::GarbageCollector;
use histore_core::id::EventId;
use histore_core::journal::Journal;
use histore_core::maintenance::{Maintenance, MaintenanceJob};
use histore_core::notifier::{Notifier, NotifierConfig, Topic, Wakeup};
use histore_core::retention::{Retained, RetentionPolicy};
use histore_core::store::{InMemoryStore, Store};
use histore_core::trimmer::Trimmer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// 一个存储节点上登记的根目录集合
#[derive(Debug, Clone, Default)]
struct RootRegistry {
    roots: BTreeSet<String>,
    version: u64,
}

#[derive(Debug, Clone)]
enum RegistryCommand {
    AddRoot { path: String },
    RemoveRoot { path: String },
    Checkpoint,
    Retire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RegistryEvent {
    RootAdded { path: String },
    RootRemoved { path: String },
    /// 完整快照，之前的事件不再参与重放
    Checkpointed { roots: Vec<String> },
}

#[derive(Debug, thiserror::Error)]
enum RegistryError {
    #[error("root {0} is already registered")]
    Duplicate(String),
    #[error("root {0} is not registered")]
    Missing(String),
    #[error("registry still has {0} roots")]
    NotEmpty(usize),
}

struct RegistryAdvancer;

impl Advancer<RootRegistry, RegistryEvent> for RegistryAdvancer {
    fn advance(&mut self, state: &mut RootRegistry, _id: EventId, event: RegistryEvent) {
        match event {
            RegistryEvent::RootAdded { path } => {
                state.roots.insert(path);
            }
            RegistryEvent::RootRemoved { path } => {
                state.roots.remove(&path);
            }
            RegistryEvent::Checkpointed { roots } => state.roots = roots.into_iter().collect(),
        }
        state.version += 1;
    }
}

struct Registry;

impl Behavior for Registry {
    type State = RootRegistry;
    type Event = RegistryEvent;
    type Command = RegistryCommand;
    type Error = RegistryError;
    type Advancer = RegistryAdvancer;

    fn new_state(&self, _id: Uuid) -> RootRegistry {
        RootRegistry::default()
    }

    fn new_advancer(&self) -> RegistryAdvancer {
        RegistryAdvancer
    }

    fn tell(
        &self,
        state: &RootRegistry,
        command: RegistryCommand,
    ) -> Result<Vec<RegistryEvent>, RegistryError> {
        match command {
            RegistryCommand::AddRoot { path } if state.roots.contains(&path) => {
                Err(RegistryError::Duplicate(path))
            }
            RegistryCommand::AddRoot { path } => Ok(vec![RegistryEvent::RootAdded { path }]),
            RegistryCommand::RemoveRoot { path } if !state.roots.contains(&path) => {
                Err(RegistryError::Missing(path))
            }
            RegistryCommand::RemoveRoot { path } => Ok(vec![RegistryEvent::RootRemoved { path }]),
            RegistryCommand::Checkpoint => Ok(vec![RegistryEvent::Checkpointed {
                roots: state.roots.iter().cloned().collect(),
            }]),
            RegistryCommand::Retire if !state.roots.is_empty() => {
                Err(RegistryError::NotEmpty(state.roots.len()))
            }
            RegistryCommand::Retire => Ok(vec![]),
        }
    }
}

/// 检查点之前的历史可裁剪，纪元满一周后交给 GC
struct CheckpointRetention;

impl RetentionPolicy for CheckpointRetention {
    type Event = RegistryEvent;

    fn is_new_epoch(
        &self,
        _epoch: &Retained<RegistryEvent>,
        next: &Retained<RegistryEvent>,
        _now: DateTime<Utc>,
    ) -> bool {
        matches!(next.event, RegistryEvent::Checkpointed { .. })
    }

    fn is_new_tail(&self, _event: EventId, epoch_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - epoch_time >= Duration::days(7)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

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
    let engine = Engine::builder()
        .journal(journal.clone())
        .behavior(Registry)
        .build();

    let node = Uuid::new_v4();
    let mut changes = notifier.subscribe(Topic::History(node)).await?;

    let mut vid = EventId::NIL;
    for path in ["/srv/a", "/srv/b", "/srv/c"] {
        let mat = engine
            .tell(node, vid, RegistryCommand::AddRoot { path: path.into() })
            .await?;
        vid = mat.vid;
    }
    let wait = std::time::Duration::from_millis(50);
    if let Wakeup::Notified(history) = changes.recv_or_poll(wait).await {
        info!(%history, pending = changes.drain(), "registry changed");
    }

    match engine
        .tell(node, vid, RegistryCommand::AddRoot { path: "/srv/a".into() })
        .await
    {
        Err(TellError::Behavior(err)) => info!(error = %err, "command rejected"),
        other => anyhow::bail!("expected a rejection, got {other:?}"),
    }

    let remove = RegistryCommand::RemoveRoot {
        path: "/srv/b".into(),
    };
    let mat = engine.tell(node, EventId::RETRY_NO_VC, remove).await?;
    let mat = engine.tell(node, mat.vid, RegistryCommand::Checkpoint).await?;
    let mat = engine
        .tell(node, mat.vid, RegistryCommand::AddRoot { path: "/srv/d".into() })
        .await?;
    info!(roots = ?mat.state.roots, version = mat.state.version, "registry state");

    let trimmer = Arc::new(
        Trimmer::builder()
            .journal(journal.clone())
            .policy(CheckpointRetention)
            .build(),
    );
    let gc = Arc::new(
        GarbageCollector::builder()
            .store(store.clone() as Arc<dyn Store>)
            .clock(Arc::new(clock.clone()))
            .build(),
    );
    let maintenance = Maintenance::builder()
        .jobs(vec![
            trimmer.clone() as Arc<dyn MaintenanceJob>,
            gc.clone() as Arc<dyn MaintenanceJob>,
        ])
        .build();
    let cancel = CancellationToken::new();

    maintenance.run_once(&cancel).await;
    clock.advance(Duration::days(8));
    maintenance.run_once(&cancel).await;
    clock.advance(Duration::days(30));
    maintenance.run_once(&cancel).await;

    let replay: Vec<_> = journal.find(node, EventId::NIL).await?.try_collect().await?;
    info!(
        stored = store.event_count(),
        replayable = replay.len(),
        "after maintenance"
    );

    let mat = engine.find_id(node).await?;
    let mut vid = mat.vid;
    for path in mat.state.roots.iter().cloned() {
        vid = engine
            .tell(node, vid, RegistryCommand::RemoveRoot { path })
            .await?
            .vid;
    }
    engine.delete(node, vid, RegistryCommand::Retire).await?;
    info!(head = %journal.head(node).await?, "registry retired");

    clock.advance(Duration::days(16));
    gc.gc(&cancel).await?;
    clock.advance(Duration::days(15));
    gc.gc(&cancel).await?;
    gc.gc(&cancel).await?;
    info!(
        stored = store.event_count(),
        refs = store.get_refs(node).await?.is_some(),
        "registry purged"
    );
    Ok(())
}
