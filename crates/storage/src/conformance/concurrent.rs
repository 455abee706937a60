use std::future::Future;
use std::sync::Arc;

use time::macros::datetime;

use super::{make_envelope, make_token, seed_envelope, seed_token, TestResult};
use crate::record::{TokenChange, TokenState};
use crate::{EnvelopeStore, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_exactly_one_wins",
        concurrent_updates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_consume_exactly_one_wins",
        concurrent_consume_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_different_envelopes_all_succeed",
        concurrent_updates_different_envelopes_all_succeed(factory).await,
    ));

    results
}

/// Collect the outcome of racing tasks: `Ok(true)` for a winner.
async fn tally(
    handles: Vec<tokio::task::JoinHandle<Result<bool, StorageError>>>,
) -> Result<(usize, usize), String> {
    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }
    Ok((winners, losers))
}

// ── Concurrent envelope update: exactly one wins ────────────────────────────

/// N tasks each open a snapshot and attempt to update the same envelope from
/// version 0. Exactly one commit succeeds; the rest must get
/// ConcurrentConflict, either when staging or when committing.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_envelope(storage.as_ref(), make_envelope("env-race")).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut envelope = make_envelope("env-race");
            envelope.title = format!("writer-{i}");
            let mut snap = s.begin_snapshot().await?;
            match s.update_envelope(&mut snap, 0, envelope).await {
                Ok(_) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                    Err(e) => Err(e),
                },
                Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let (winners, losers) = tally(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }

    let stored = storage
        .get_envelope("env-race")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 1 {
        return Err(format!(
            "expected version 1 after single winning update, got {}",
            stored.version
        ));
    }
    Ok(())
}

// ── Concurrent token consume: exactly one wins ──────────────────────────────

/// N tasks race to consume the same ACTIVE token together with an envelope
/// update, the way a signature submission does. Exactly one succeeds.
async fn concurrent_consume_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_envelope(storage.as_ref(), make_envelope("env-sign")).await?;
    seed_token(
        storage.as_ref(),
        make_token("tok-shared", "env-sign", "ann@example.com", TokenState::Active),
    )
    .await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let at = datetime!(2026-01-02 10:00 UTC);
            let mut snap = s.begin_snapshot().await?;
            let consumed = s
                .transition_token(
                    &mut snap,
                    "tok-shared",
                    TokenState::Active,
                    TokenChange::Consume { at },
                )
                .await;
            let staged = match consumed {
                Ok(_) => {
                    let mut envelope = make_envelope("env-sign");
                    envelope.title = format!("signed-by-{i}");
                    s.update_envelope(&mut snap, 0, envelope).await.map(|_| ())
                }
                Err(e) => Err(e),
            };
            match staged {
                Ok(()) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(
                        StorageError::TokenStateConflict { .. }
                        | StorageError::ConcurrentConflict { .. },
                    ) => Ok(false),
                    Err(e) => Err(e),
                },
                Err(
                    StorageError::TokenStateConflict { .. }
                    | StorageError::ConcurrentConflict { .. },
                ) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let (winners, losers) = tally(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 consumer, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} rejected, got {losers}", N - 1));
    }

    let token = storage
        .get_token("tok-shared")
        .await
        .map_err(|e| format!("get token: {e}"))?;
    if token.state != TokenState::Consumed {
        return Err(format!("expected Consumed, got {:?}", token.state));
    }
    let envelope = storage
        .get_envelope("env-sign")
        .await
        .map_err(|e| format!("get envelope: {e}"))?;
    if envelope.version != 1 {
        return Err(format!("expected version 1, got {}", envelope.version));
    }
    Ok(())
}

// ── Concurrent updates to different envelopes: all succeed ──────────────────

/// N tasks each update a different envelope. All should succeed; there are
/// no false conflicts without contention.
async fn concurrent_updates_different_envelopes_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_envelope(storage.as_ref(), make_envelope(&format!("env-{i}"))).await?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut envelope = make_envelope(&format!("env-{i}"));
            envelope.title = "updated".to_string();
            let mut snap = s.begin_snapshot().await?;
            s.update_envelope(&mut snap, 0, envelope).await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    for i in 0..N {
        let stored = storage
            .get_envelope(&format!("env-{i}"))
            .await
            .map_err(|e| format!("get env-{i}: {e}"))?;
        if stored.title != "updated" || stored.version != 1 {
            return Err(format!(
                "env-{i}: expected 'updated' at version 1, got '{}' at {}",
                stored.title, stored.version
            ));
        }
    }
    Ok(())
}
