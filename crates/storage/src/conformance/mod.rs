//! Conformance test suite for `EnvelopeStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `EnvelopeStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Envelopes**: insertion, duplicate detection, listing and filtering
//! - **Version validation / OCC**: stale writes rejected, versions increment
//! - **Tokens**: insertion, compare-and-set transitions, envelope-wide revoke
//! - **Snapshot isolation**: uncommitted writes invisible, aborted writes
//!   discarded, multi-row commits all-or-nothing
//! - **Concurrency**: racing updates and racing token consumption have
//!   exactly one winner
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use quire_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_store().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod envelope;
mod snapshot;
mod token;

use std::fmt;
use std::future::Future;

use quire_core::{
    Envelope, EnvelopeStatus, FieldType, Position, SignatureField, Signer, SignerRole,
    SigningMode,
};
use time::macros::datetime;
use time::OffsetDateTime;

use crate::record::{TokenRecord, TokenState};
use crate::EnvelopeStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "envelope", "token", "snapshot").
    pub category: String,
    /// Test name (e.g. "stale_version_rejected").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation. The concurrency tests use
/// `tokio::spawn`, so run the suite on a multi-threaded runtime.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: EnvelopeStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(envelope::run_envelope_tests(&factory).await);
    results.extend(token::run_token_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

const CREATED: OffsetDateTime = datetime!(2026-01-01 09:00 UTC);

/// A draft envelope with two parallel signers, one required field each.
pub fn make_envelope(id: &str) -> Envelope {
    let signers = vec![
        Signer::new("ann@example.com", "Ann", SignerRole::Sender, 1),
        Signer::new("bob@example.com", "Bob", SignerRole::Signer, 2),
    ];
    let fields = signers
        .iter()
        .enumerate()
        .map(|(i, s)| SignatureField {
            id: format!("{id}-f{i}"),
            assignee_email: s.email.clone(),
            field_type: FieldType::Signature,
            page: 1,
            position: Position {
                x: 50.0,
                y: 100.0 + 60.0 * i as f64,
                width: 150.0,
                height: 40.0,
            },
            required: true,
            value: None,
            signed_at: None,
        })
        .collect();
    Envelope {
        id: id.to_string(),
        owner_id: "owner-1".to_string(),
        title: "Conformance".to_string(),
        message: String::new(),
        document_ref: "docs/conformance.pdf".to_string(),
        signing_mode: SigningMode::Parallel,
        status: EnvelopeStatus::Draft,
        signers,
        fields,
        created_at: CREATED,
        expires_at: datetime!(2026-01-15 09:00 UTC),
        completed_at: None,
        sealed: None,
        decline: None,
        audit: vec![],
        version: 0,
    }
}

pub fn make_token(token: &str, envelope_id: &str, email: &str, state: TokenState) -> TokenRecord {
    TokenRecord {
        token: token.to_string(),
        envelope_id: envelope_id.to_string(),
        signer_email: email.to_string(),
        state,
        created_at: CREATED,
        activated_at: (state == TokenState::Active).then_some(CREATED),
        expires_at: datetime!(2026-01-15 09:00 UTC),
        consumed_at: None,
        revoked_at: None,
        revoke_reason: None,
    }
}

/// Insert an envelope in its own committed snapshot.
async fn seed_envelope<S: EnvelopeStore>(storage: &S, envelope: Envelope) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_envelope(&mut snap, envelope)
        .await
        .map_err(|e| format!("insert envelope: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}

/// Insert a token in its own committed snapshot.
async fn seed_token<S: EnvelopeStore>(storage: &S, record: TokenRecord) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_token(&mut snap, record)
        .await
        .map_err(|e| format!("insert token: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}
