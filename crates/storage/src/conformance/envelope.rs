//! Envelope insertion, lookup, listing and OCC version checks.

use std::future::Future;

use quire_core::EnvelopeStatus;
use time::macros::datetime;
use time::Duration;

use super::{make_envelope, seed_envelope, TestResult};
use crate::record::EnvelopeFilter;
use crate::{EnvelopeStore, StorageError};

pub(super) async fn run_envelope_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "envelope",
        "insert_starts_at_version_zero",
        insert_starts_at_version_zero(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "duplicate_insert_rejected",
        duplicate_insert_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "get_missing_envelope_not_found",
        get_missing_envelope_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "update_increments_version",
        update_increments_version(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "stale_version_rejected",
        stale_version_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "update_missing_envelope_not_found",
        update_missing_envelope_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "list_filters_and_orders_newest_first",
        list_filters_and_orders_newest_first(factory).await,
    ));
    results.push(TestResult::from_result(
        "envelope",
        "list_respects_limit_and_offset",
        list_respects_limit_and_offset(factory).await,
    ));

    results
}

async fn insert_starts_at_version_zero<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut envelope = make_envelope("env-1");
    envelope.version = 41;
    seed_envelope(&storage, envelope).await?;

    let stored = storage
        .get_envelope("env-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 0 {
        return Err(format!("expected version 0, got {}", stored.version));
    }
    if stored.signers.len() != 2 || stored.fields.len() != 2 {
        return Err("signers/fields not round-tripped".to_string());
    }
    Ok(())
}

async fn duplicate_insert_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
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
    match storage.insert_envelope(&mut snap, make_envelope("env-1")).await {
        Err(StorageError::AlreadyExists { envelope_id }) if envelope_id == "env-1" => {
            let _ = storage.abort_snapshot(snap).await;
            Ok(())
        }
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
        Ok(()) => match storage.commit_snapshot(snap).await {
            Err(StorageError::AlreadyExists { .. }) => Ok(()),
            other => Err(format!("duplicate insert accepted: {other:?}")),
        },
    }
}

async fn get_missing_envelope_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_envelope("nope").await {
        Err(StorageError::EnvelopeNotFound { envelope_id }) if envelope_id == "nope" => Ok(()),
        other => Err(format!("expected EnvelopeNotFound, got {other:?}")),
    }
}

async fn update_increments_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_envelope(&storage, make_envelope("env-1")).await?;

    for expected in 0..3i64 {
        let mut envelope = storage
            .get_envelope("env-1")
            .await
            .map_err(|e| format!("get: {e}"))?;
        envelope.title = format!("rev {expected}");
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let new_version = storage
            .update_envelope(&mut snap, expected, envelope)
            .await
            .map_err(|e| format!("update at {expected}: {e}"))?;
        if new_version != expected + 1 {
            return Err(format!("expected {}, got {new_version}", expected + 1));
        }
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }

    let stored = storage
        .get_envelope("env-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 3 || stored.title != "rev 2" {
        return Err(format!(
            "expected version 3 / 'rev 2', got {} / '{}'",
            stored.version, stored.title
        ));
    }
    Ok(())
}

async fn stale_version_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage
        .update_envelope(&mut snap, 7, make_envelope("env-1"))
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict {
            envelope_id,
            expected_version: 7,
            actual_version: 0,
        }) if envelope_id == "env-1" => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
}

async fn update_missing_envelope_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .update_envelope(&mut snap, 0, make_envelope("ghost"))
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::EnvelopeNotFound { .. }) => Ok(()),
        other => Err(format!("expected EnvelopeNotFound, got {other:?}")),
    }
}

async fn list_filters_and_orders_newest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    for (i, (owner, status)) in [
        ("owner-1", EnvelopeStatus::Draft),
        ("owner-1", EnvelopeStatus::Sent),
        ("owner-2", EnvelopeStatus::Draft),
        ("owner-1", EnvelopeStatus::Completed),
    ]
    .into_iter()
    .enumerate()
    {
        let mut envelope = make_envelope(&format!("env-{i}"));
        envelope.owner_id = owner.to_string();
        envelope.status = status;
        envelope.created_at += Duration::hours(i as i64);
        envelope.expires_at = datetime!(2026-02-01 00:00 UTC) + Duration::days(i as i64);
        seed_envelope(&storage, envelope).await?;
    }

    let owner_filter = EnvelopeFilter {
        owner_id: Some("owner-1".to_string()),
        ..Default::default()
    };
    let ids: Vec<String> = storage
        .list_envelopes(&owner_filter, 0, 0)
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .map(|e| e.id)
        .collect();
    if ids != ["env-3", "env-1", "env-0"] {
        return Err(format!("unexpected owner listing {ids:?}"));
    }

    let open = EnvelopeFilter {
        open_only: true,
        expires_before: Some(datetime!(2026-02-02 12:00 UTC)),
        ..Default::default()
    };
    let count = storage
        .count_envelopes(&open)
        .await
        .map_err(|e| format!("count: {e}"))?;
    if count != 2 {
        return Err(format!("expected 2 open envelopes expiring soon, got {count}"));
    }

    let drafts = EnvelopeFilter {
        status: Some(EnvelopeStatus::Draft),
        ..Default::default()
    };
    let count = storage
        .count_envelopes(&drafts)
        .await
        .map_err(|e| format!("count: {e}"))?;
    if count != 2 {
        return Err(format!("expected 2 drafts, got {count}"));
    }
    Ok(())
}

async fn list_respects_limit_and_offset<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    for i in 0..5 {
        let mut envelope = make_envelope(&format!("env-{i}"));
        envelope.created_at += Duration::minutes(i);
        seed_envelope(&storage, envelope).await?;
    }
    let page: Vec<String> = storage
        .list_envelopes(&EnvelopeFilter::default(), 2, 1)
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .map(|e| e.id)
        .collect();
    if page != ["env-3", "env-2"] {
        return Err(format!("unexpected page {page:?}"));
    }
    Ok(())
}
