//! Snapshot isolation and all-or-nothing commit.

use std::future::Future;

use time::macros::datetime;

use super::{make_envelope, make_token, seed_envelope, seed_token, TestResult};
use crate::record::{TokenChange, TokenState};
use crate::{EnvelopeStore, StorageError};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_writes_invisible",
        uncommitted_writes_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_writes",
        abort_discards_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_reads_own_writes",
        snapshot_reads_own_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "commit_is_all_or_nothing",
        commit_is_all_or_nothing(factory).await,
    ));

    results
}

async fn uncommitted_writes_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_envelope(&mut snap, make_envelope("env-1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .insert_token(
            &mut snap,
            make_token("tok-1", "env-1", "ann@example.com", TokenState::Active),
        )
        .await
        .map_err(|e| format!("insert token: {e}"))?;

    if storage.get_envelope("env-1").await.is_ok() {
        return Err("uncommitted envelope visible".to_string());
    }
    if storage.get_token("tok-1").await.is_ok() {
        return Err("uncommitted token visible".to_string());
    }

    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    storage
        .get_envelope("env-1")
        .await
        .map_err(|e| format!("committed envelope missing: {e}"))?;
    storage
        .get_token("tok-1")
        .await
        .map_err(|e| format!("committed token missing: {e}"))?;
    Ok(())
}

async fn abort_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_envelope(&storage, make_envelope("env-1")).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let mut changed = make_envelope("env-1");
    changed.title = "never".to_string();
    storage
        .update_envelope(&mut snap, 0, changed)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let stored = storage
        .get_envelope("env-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 0 || stored.title == "never" {
        return Err("aborted update was applied".to_string());
    }
    Ok(())
}

/// A token inserted earlier in the same snapshot can be transitioned before
/// commit. Sending a sequential envelope reserves then activates this way.
async fn snapshot_reads_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_token(
            &mut snap,
            make_token("tok-own", "env-1", "ann@example.com", TokenState::Dormant),
        )
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .transition_token(
            &mut snap,
            "tok-own",
            TokenState::Dormant,
            TokenChange::Activate {
                at: datetime!(2026-01-01 09:05 UTC),
            },
        )
        .await
        .map_err(|e| format!("activate own write: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = storage
        .get_token("tok-own")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.state != TokenState::Active {
        return Err(format!("expected Active, got {:?}", stored.state));
    }
    Ok(())
}

/// Two snapshots stage conflicting work. The second to commit must fail
/// as a whole: neither its envelope update nor its token change applies.
async fn commit_is_all_or_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_envelope(&storage, make_envelope("env-1")).await?;
    seed_token(
        &storage,
        make_token("tok-ann", "env-1", "ann@example.com", TokenState::Active),
    )
    .await?;
    seed_token(
        &storage,
        make_token("tok-bob", "env-1", "bob@example.com", TokenState::Active),
    )
    .await?;
    let at = datetime!(2026-01-02 10:00 UTC);

    let mut first = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin first: {e}"))?;
    let mut second = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin second: {e}"))?;

    let mut by_ann = make_envelope("env-1");
    by_ann.title = "ann".to_string();
    storage
        .transition_token(&mut first, "tok-ann", TokenState::Active, TokenChange::Consume { at })
        .await
        .map_err(|e| format!("first consume: {e}"))?;
    storage
        .update_envelope(&mut first, 0, by_ann)
        .await
        .map_err(|e| format!("first update: {e}"))?;

    let mut by_bob = make_envelope("env-1");
    by_bob.title = "bob".to_string();
    storage
        .transition_token(&mut second, "tok-bob", TokenState::Active, TokenChange::Consume { at })
        .await
        .map_err(|e| format!("second consume: {e}"))?;
    storage
        .update_envelope(&mut second, 0, by_bob)
        .await
        .map_err(|e| format!("second update: {e}"))?;

    storage
        .commit_snapshot(first)
        .await
        .map_err(|e| format!("first commit: {e}"))?;
    match storage.commit_snapshot(second).await {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        other => return Err(format!("expected ConcurrentConflict, got {other:?}")),
    }

    let envelope = storage
        .get_envelope("env-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if envelope.title != "ann" || envelope.version != 1 {
        return Err(format!(
            "expected ann's write at version 1, got '{}' at {}",
            envelope.title, envelope.version
        ));
    }
    let bob = storage
        .get_token("tok-bob")
        .await
        .map_err(|e| format!("get token: {e}"))?;
    if bob.state != TokenState::Active {
        return Err(format!(
            "failed commit leaked a token change: {:?}",
            bob.state
        ));
    }
    Ok(())
}
