mod common;

use anyhow::Result as AnyResult;
use common::{Harness, Ledger, LedgerBehavior, LedgerCommand, LedgerError};
use histore_core::engine::{Engine, TellError};
use histore_core::error::HistoryError;
use histore_core::id::{EventId, ExpectedVid};
use histore_core::model::Serial;
use histore_core::store::{RefsFilter, RefsUpdate, Store};
use uuid::Uuid;

#[tokio::test]
async fn warm_and_cold_replay_fold_identically() -> AnyResult<()> {
    let h = Harness::new();
    let id = Uuid::new_v4();
    let mut vid = EventId::NIL;
    for amount in [10, 20, 5] {
        vid = h.engine.tell(id, vid, LedgerCommand::Credit(amount)).await?.vid;
    }
    h.engine.tell(id, vid, LedgerCommand::Debit(7)).await?;
    let warm = h.engine.find_id(id).await?;

    // 全新引擎 + 清空索引：完全从原始事件重放
    h.store.delete_index(id, None).await?;
    h.store
        .update_refs(
            id,
            &RefsFilter::default(),
            &RefsUpdate::builder().serial(Serial::Unspecified).build(),
        )
        .await?;
    let cold_engine = Engine::builder()
        .journal(h.journal.clone())
        .behavior(LedgerBehavior)
        .build();
    let cold = cold_engine.find_id(id).await?;

    assert_eq!(warm, cold);
    assert_eq!(cold.state.balance, 28);
    assert_eq!(cold.state.applied, h.chain(id).await);
    Ok(())
}

#[tokio::test]
async fn stale_cache_catches_up_with_other_writers() -> AnyResult<()> {
    let h = Harness::new();
    let id = Uuid::new_v4();
    let other = Engine::builder()
        .journal(h.journal.clone())
        .behavior(LedgerBehavior)
        .build();

    let mine = h.engine.tell(id, EventId::NIL, LedgerCommand::Credit(5)).await?;
    let theirs = other.tell(id, mine.vid, LedgerCommand::Credit(6)).await?;

    // 缓存中的 vid 已过期，但增量重放会先追上再比较
    let err = h
        .engine
        .tell(id, mine.vid, LedgerCommand::Credit(1))
        .await
        .unwrap_err();
    match err {
        TellError::History(HistoryError::VersionConflict { stored, expected }) => {
            assert_eq!(stored, theirs.vid);
            assert_eq!(expected, mine.vid);
        }
        other => panic!("unexpected {other:?}"),
    }

    let after = h
        .engine
        .tell(id, ExpectedVid::NoCheck, LedgerCommand::Credit(1))
        .await?;
    assert_eq!(after.state.balance, 12);
    Ok(())
}

#[tokio::test]
async fn behavior_rejection_is_not_a_history_error() -> AnyResult<()> {
    let h = Harness::new();
    let id = Uuid::new_v4();
    h.engine.tell(id, EventId::NIL, LedgerCommand::Credit(3)).await?;

    let err = h
        .engine
        .tell(id, EventId::NO_VC, LedgerCommand::Debit(4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TellError::Behavior(LedgerError::InsufficientFunds {
            balance: 3,
            requested: 4
        })
    ));
    assert_eq!(h.chain(id).await.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_mode_serializes_parallel_writers() -> AnyResult<()> {
    let h = Harness::new();
    let id = Uuid::new_v4();
    h.engine.tell(id, EventId::NIL, LedgerCommand::Credit(1)).await?;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .tell(id, EventId::RETRY_NO_VC, LedgerCommand::Credit(1))
                .await
        }));
    }
    let mut succeeded = 0;
    for task in tasks {
        match task.await? {
            Ok(_) => succeeded += 1,
            Err(TellError::History(HistoryError::RetryExhausted { source, .. })) => {
                assert!(source.is_version_conflict())
            }
            Err(other) => panic!("unexpected {other:?}"),
        }
    }

    let state: Ledger = h.engine.find_id(id).await?.state;
    assert_eq!(state.balance, 1 + succeeded);
    assert_eq!(h.chain(id).await.len() as i64, 1 + succeeded);
    Ok(())
}

#[tokio::test]
async fn delete_empties_head_and_resets_state() -> AnyResult<()> {
    let h = Harness::new();
    let id = Uuid::new_v4();
    let mat = h.engine.tell(id, EventId::NIL, LedgerCommand::Credit(2)).await?;

    let err = h
        .engine
        .delete(id, mat.vid, LedgerCommand::Close)
        .await
        .unwrap_err();
    assert!(matches!(err, TellError::Behavior(LedgerError::NotSettled)));

    let mat = h.engine.tell(id, mat.vid, LedgerCommand::Debit(2)).await?;
    h.engine.delete(id, mat.vid, LedgerCommand::Close).await?;
    assert!(h.journal.head(id).await?.is_nil());
    // 重复删除幂等
    h.engine.delete(id, ExpectedVid::NoCheck, LedgerCommand::Close).await?;

    let fresh = h.engine.find_id(id).await?;
    assert!(fresh.vid.is_nil());
    assert_eq!(fresh.state, Ledger::default());
    Ok(())
}
