//! Token table: insertion, compare-and-set transitions and envelope-wide revoke.

use std::future::Future;

use time::macros::datetime;

use super::{make_envelope, make_token, seed_envelope, seed_token, TestResult};
use crate::record::{RevokeReason, TokenChange, TokenState};
use crate::{EnvelopeStore, StorageError};

pub(super) async fn run_token_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "token",
        "insert_and_get",
        insert_and_get(factory).await,
    ));
    results.push(TestResult::from_result(
        "token",
        "duplicate_token_rejected",
        duplicate_token_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "token",
        "consume_is_compare_and_set",
        consume_is_compare_and_set(factory).await,
    ));
    results.push(TestResult::from_result(
        "token",
        "dormant_activation",
        dormant_activation(factory).await,
    ));
    results.push(TestResult::from_result(
        "token",
        "transition_unknown_token_not_found",
        transition_unknown_token_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "token",
        "revoke_envelope_tokens_scoped",
        revoke_envelope_tokens_scoped(factory).await,
    ));
    results.push(TestResult::from_result(
        "token",
        "list_tokens_oldest_first",
        list_tokens_oldest_first(factory).await,
    ));

    results
}

async fn insert_and_get<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let record = make_token("tok-aaaaaaaa", "env-1", "ann@example.com", TokenState::Active);
    seed_token(&storage, record.clone()).await?;

    let stored = storage
        .get_token("tok-aaaaaaaa")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored != record {
        return Err(format!("round trip mismatch: {stored:?}"));
    }
    match storage.get_token("tok-missing").await {
        Err(StorageError::TokenNotFound { .. }) => Ok(()),
        other => Err(format!("expected TokenNotFound, got {other:?}")),
    }
}

async fn duplicate_token_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_token(
        &storage,
        make_token("tok-dup", "env-1", "ann@example.com", TokenState::Active),
    )
    .await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage
        .insert_token(
            &mut snap,
            make_token("tok-dup", "env-2", "bob@example.com", TokenState::Active),
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::TokenExists { .. }) => Ok(()),
        other => Err(format!("expected TokenExists, got {other:?}")),
    }
}

async fn consume_is_compare_and_set<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_token(
        &storage,
        make_token("tok-once", "env-1", "ann@example.com", TokenState::Active),
    )
    .await?;
    let at = datetime!(2026-01-02 10:00 UTC);

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let updated = storage
        .transition_token(
            &mut snap,
            "tok-once",
            TokenState::Active,
            TokenChange::Consume { at },
        )
        .await
        .map_err(|e| format!("first consume: {e}"))?;
    if updated.state != TokenState::Consumed || updated.consumed_at != Some(at) {
        return Err(format!("unexpected record after consume: {updated:?}"));
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let second = storage
        .transition_token(
            &mut snap,
            "tok-once",
            TokenState::Active,
            TokenChange::Consume { at },
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match second {
        Err(StorageError::TokenStateConflict {
            expected: TokenState::Active,
            actual: TokenState::Consumed,
            ..
        }) => Ok(()),
        other => Err(format!("expected TokenStateConflict, got {other:?}")),
    }
}

async fn dormant_activation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_token(
        &storage,
        make_token("tok-later", "env-1", "bob@example.com", TokenState::Dormant),
    )
    .await?;
    let at = datetime!(2026-01-03 08:30 UTC);

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .transition_token(
            &mut snap,
            "tok-later",
            TokenState::Dormant,
            TokenChange::Activate { at },
        )
        .await
        .map_err(|e| format!("activate: {e}"))?;

    // Staged but not yet visible to readers.
    let before = storage
        .get_token("tok-later")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if before.state != TokenState::Dormant {
        return Err(format!("staged activation leaked: {:?}", before.state));
    }

    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let after = storage
        .get_token("tok-later")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after.state != TokenState::Active || after.activated_at != Some(at) {
        return Err(format!("unexpected record after activation: {after:?}"));
    }
    Ok(())
}

async fn transition_unknown_token_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage
        .transition_token(
            &mut snap,
            "tok-ghost",
            TokenState::Active,
            TokenChange::Consume {
                at: datetime!(2026-01-02 10:00 UTC),
            },
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::TokenNotFound { .. }) => Ok(()),
        other => Err(format!("expected TokenNotFound, got {other:?}")),
    }
}

async fn revoke_envelope_tokens_scoped<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_envelope(&storage, make_envelope("env-1")).await?;
    for (token, envelope, state) in [
        ("tok-active", "env-1", TokenState::Active),
        ("tok-dormant", "env-1", TokenState::Dormant),
        ("tok-consumed", "env-1", TokenState::Consumed),
        ("tok-other", "env-2", TokenState::Active),
    ] {
        seed_token(
            &storage,
            make_token(token, envelope, "ann@example.com", state),
        )
        .await?;
    }
    let at = datetime!(2026-01-05 12:00 UTC);

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let revoked = storage
        .revoke_envelope_tokens(&mut snap, "env-1", at)
        .await
        .map_err(|e| format!("revoke: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    if revoked != 2 {
        return Err(format!("expected 2 revoked, got {revoked}"));
    }

    for (token, expected) in [
        ("tok-active", TokenState::Revoked),
        ("tok-dormant", TokenState::Revoked),
        ("tok-consumed", TokenState::Consumed),
        ("tok-other", TokenState::Active),
    ] {
        let record = storage
            .get_token(token)
            .await
            .map_err(|e| format!("get {token}: {e}"))?;
        if record.state != expected {
            return Err(format!(
                "{token}: expected {expected:?}, got {:?}",
                record.state
            ));
        }
        if expected == TokenState::Revoked
            && record.revoke_reason != Some(RevokeReason::EnvelopeClosed)
        {
            return Err(format!("{token}: wrong revoke reason"));
        }
    }
    Ok(())
}

async fn list_tokens_oldest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    for token in ["tok-c", "tok-a", "tok-b"] {
        seed_token(
            &storage,
            make_token(token, "env-1", "ann@example.com", TokenState::Active),
        )
        .await?;
    }
    seed_token(
        &storage,
        make_token("tok-x", "env-2", "ann@example.com", TokenState::Active),
    )
    .await?;

    let listed: Vec<String> = storage
        .list_tokens("env-1")
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .map(|t| t.token)
        .collect();
    if listed != ["tok-c", "tok-a", "tok-b"] {
        return Err(format!("unexpected order {listed:?}"));
    }
    Ok(())
}
