use async_trait::async_trait;
use quire_core::Envelope;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{EnvelopeFilter, TokenChange, TokenRecord, TokenState};

/// The storage trait for envelope workflow backends.
///
/// An `EnvelopeStore` holds envelope records (signers, fields and audit trail
/// embedded) and the token table keyed by token value.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` -- start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` -- commit and consume the transaction
///    OR `abort_snapshot(snapshot)` -- roll back and consume the transaction
///
/// Writes staged in a snapshot are invisible to the query methods until
/// commit. A dropped snapshot MUST behave like an aborted one.
///
/// ## OCC Conflict Detection
///
/// `update_envelope` is conditional on `version = expected_version` and
/// `transition_token` is conditional on the token's current state. Both
/// conditions are checked when the write is staged (fail fast) and again,
/// atomically with every other staged write, at commit. A commit that fails
/// either check applies nothing and returns the conflict.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait EnvelopeStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all staged writes durable together.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all staged writes.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Envelope writes (within snapshot) ────────────────────────────────────

    /// Insert a new envelope at version 0.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn insert_envelope(
        &self,
        snapshot: &mut Self::Snapshot,
        envelope: Envelope,
    ) -> Result<(), StorageError>;

    /// Replace an envelope if its stored version equals `expected_version`.
    ///
    /// The stored copy gets `version = expected_version + 1` regardless of
    /// the `version` field of `envelope`. Returns the new version.
    async fn update_envelope(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        envelope: Envelope,
    ) -> Result<i64, StorageError>;

    // ── Token writes (within snapshot) ────────────────────────────────────────

    /// Insert a new token row. `Err(StorageError::TokenExists)` on collision.
    async fn insert_token(
        &self,
        snapshot: &mut Self::Snapshot,
        record: TokenRecord,
    ) -> Result<(), StorageError>;

    /// Compare-and-set a token from `expected` to `change.target()`.
    ///
    /// Returns the updated record, or `Err(StorageError::TokenStateConflict)`
    /// carrying the state actually found.
    async fn transition_token(
        &self,
        snapshot: &mut Self::Snapshot,
        token: &str,
        expected: TokenState,
        change: TokenChange,
    ) -> Result<TokenRecord, StorageError>;

    /// Revoke every `DORMANT` or `ACTIVE` token of an envelope with reason
    /// `EnvelopeClosed`. Returns how many tokens were revoked.
    async fn revoke_envelope_tokens(
        &self,
        snapshot: &mut Self::Snapshot,
        envelope_id: &str,
        at: OffsetDateTime,
    ) -> Result<usize, StorageError>;

    // ── Queries (committed state only) ────────────────────────────────────────

    /// `Err(StorageError::EnvelopeNotFound)` if the envelope does not exist.
    async fn get_envelope(&self, envelope_id: &str) -> Result<Envelope, StorageError>;

    /// Envelopes matching `filter`, newest first.
    ///
    /// - `limit`: maximum number of results (0 = no limit)
    /// - `offset`: number of matching envelopes to skip
    async fn list_envelopes(
        &self,
        filter: &EnvelopeFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Envelope>, StorageError>;

    async fn count_envelopes(&self, filter: &EnvelopeFilter) -> Result<usize, StorageError>;

    /// `Err(StorageError::TokenNotFound)` if no such token was ever stored.
    async fn get_token(&self, token: &str) -> Result<TokenRecord, StorageError>;

    /// Every token ever minted for an envelope, oldest first.
    async fn list_tokens(&self, envelope_id: &str) -> Result<Vec<TokenRecord>, StorageError>;
}
