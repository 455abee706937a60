//! In-memory `EnvelopeStore` backend.
//!
//! Committed state lives behind a single `RwLock`. A snapshot records its
//! writes and keeps a private overlay so it can read its own staged rows;
//! commit replays the writes against the committed tables under the write
//! lock, so the version and token-state checks of every write in the
//! snapshot pass or fail together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use quire_core::Envelope;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{EnvelopeFilter, RevokeReason, TokenChange, TokenRecord, TokenState};
use crate::traits::EnvelopeStore;

#[derive(Debug, Default)]
struct Tables {
    envelopes: HashMap<String, Envelope>,
    tokens: HashMap<String, TokenRecord>,
    /// Token keys in insertion order.
    token_order: Vec<String>,
}

#[derive(Debug, Clone)]
enum StagedWrite {
    InsertEnvelope(Envelope),
    UpdateEnvelope {
        expected_version: i64,
        envelope: Envelope,
    },
    InsertToken(TokenRecord),
    TransitionToken {
        token: String,
        expected: TokenState,
        change: TokenChange,
    },
    RevokeEnvelopeTokens {
        envelope_id: String,
        at: OffsetDateTime,
    },
}

/// Rows written on top of the committed tables.
#[derive(Debug, Default)]
struct Overlay {
    envelopes: HashMap<String, Envelope>,
    tokens: HashMap<String, TokenRecord>,
    new_tokens: Vec<String>,
}

impl Overlay {
    fn envelope<'a>(&'a self, base: &'a Tables, id: &str) -> Option<&'a Envelope> {
        self.envelopes.get(id).or_else(|| base.envelopes.get(id))
    }

    fn token<'a>(&'a self, base: &'a Tables, token: &str) -> Option<&'a TokenRecord> {
        self.tokens.get(token).or_else(|| base.tokens.get(token))
    }

    /// Check and apply one write. Returns the number of rows affected.
    fn apply(&mut self, base: &Tables, write: &StagedWrite) -> Result<usize, StorageError> {
        match write {
            StagedWrite::InsertEnvelope(envelope) => {
                if self.envelope(base, &envelope.id).is_some() {
                    return Err(StorageError::AlreadyExists {
                        envelope_id: envelope.id.clone(),
                    });
                }
                let mut row = envelope.clone();
                row.version = 0;
                self.envelopes.insert(row.id.clone(), row);
                Ok(1)
            }
            StagedWrite::UpdateEnvelope {
                expected_version,
                envelope,
            } => {
                let current = self.envelope(base, &envelope.id).ok_or_else(|| {
                    StorageError::EnvelopeNotFound {
                        envelope_id: envelope.id.clone(),
                    }
                })?;
                if current.version != *expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        envelope_id: envelope.id.clone(),
                        expected_version: *expected_version,
                        actual_version: current.version,
                    });
                }
                let mut row = envelope.clone();
                row.version = expected_version + 1;
                self.envelopes.insert(row.id.clone(), row);
                Ok(1)
            }
            StagedWrite::InsertToken(record) => {
                if self.token(base, &record.token).is_some() {
                    return Err(StorageError::TokenExists {
                        token: record.token.clone(),
                    });
                }
                self.tokens.insert(record.token.clone(), record.clone());
                self.new_tokens.push(record.token.clone());
                Ok(1)
            }
            StagedWrite::TransitionToken {
                token,
                expected,
                change,
            } => {
                let current =
                    self.token(base, token)
                        .ok_or_else(|| StorageError::TokenNotFound {
                            token: token.clone(),
                        })?;
                if current.state != *expected {
                    return Err(StorageError::TokenStateConflict {
                        token: token.clone(),
                        expected: *expected,
                        actual: current.state,
                    });
                }
                let mut row = current.clone();
                change.apply(&mut row);
                self.tokens.insert(token.clone(), row);
                Ok(1)
            }
            StagedWrite::RevokeEnvelopeTokens { envelope_id, at } => {
                let open: Vec<String> = base
                    .token_order
                    .iter()
                    .chain(self.new_tokens.iter())
                    .filter_map(|key| self.token(base, key))
                    .filter(|t| {
                        &t.envelope_id == envelope_id
                            && matches!(t.state, TokenState::Dormant | TokenState::Active)
                    })
                    .map(|t| t.token.clone())
                    .collect();
                let change = TokenChange::Revoke {
                    at: *at,
                    reason: RevokeReason::EnvelopeClosed,
                };
                for key in &open {
                    let row = self.token(base, key).cloned();
                    if let Some(mut row) = row {
                        change.apply(&mut row);
                        self.tokens.insert(key.clone(), row);
                    }
                }
                Ok(open.len())
            }
        }
    }

    fn merge_into(self, tables: &mut Tables) {
        tables.envelopes.extend(self.envelopes);
        tables.tokens.extend(self.tokens);
        tables.token_order.extend(self.new_tokens);
    }
}

/// A transaction against [`MemoryStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    writes: Vec<StagedWrite>,
    overlay: Overlay,
}

/// Process-local store. Cloning shares the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    fn stage(&self, snapshot: &mut MemorySnapshot, write: StagedWrite) -> Result<usize, StorageError> {
        let tables = self.read()?;
        let affected = snapshot.overlay.apply(&tables, &write)?;
        snapshot.writes.push(write);
        Ok(affected)
    }
}

#[async_trait]
impl EnvelopeStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        let mut overlay = Overlay::default();
        for write in &snapshot.writes {
            overlay.apply(&tables, write)?;
        }
        overlay.merge_into(&mut tables);
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_envelope(
        &self,
        snapshot: &mut MemorySnapshot,
        envelope: Envelope,
    ) -> Result<(), StorageError> {
        self.stage(snapshot, StagedWrite::InsertEnvelope(envelope))?;
        Ok(())
    }

    async fn update_envelope(
        &self,
        snapshot: &mut MemorySnapshot,
        expected_version: i64,
        envelope: Envelope,
    ) -> Result<i64, StorageError> {
        self.stage(
            snapshot,
            StagedWrite::UpdateEnvelope {
                expected_version,
                envelope,
            },
        )?;
        Ok(expected_version + 1)
    }

    async fn insert_token(
        &self,
        snapshot: &mut MemorySnapshot,
        record: TokenRecord,
    ) -> Result<(), StorageError> {
        self.stage(snapshot, StagedWrite::InsertToken(record))?;
        Ok(())
    }

    async fn transition_token(
        &self,
        snapshot: &mut MemorySnapshot,
        token: &str,
        expected: TokenState,
        change: TokenChange,
    ) -> Result<TokenRecord, StorageError> {
        self.stage(
            snapshot,
            StagedWrite::TransitionToken {
                token: token.to_string(),
                expected,
                change,
            },
        )?;
        snapshot
            .overlay
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| StorageError::TokenNotFound {
                token: token.to_string(),
            })
    }

    async fn revoke_envelope_tokens(
        &self,
        snapshot: &mut MemorySnapshot,
        envelope_id: &str,
        at: OffsetDateTime,
    ) -> Result<usize, StorageError> {
        self.stage(
            snapshot,
            StagedWrite::RevokeEnvelopeTokens {
                envelope_id: envelope_id.to_string(),
                at,
            },
        )
    }

    async fn get_envelope(&self, envelope_id: &str) -> Result<Envelope, StorageError> {
        self.read()?
            .envelopes
            .get(envelope_id)
            .cloned()
            .ok_or_else(|| StorageError::EnvelopeNotFound {
                envelope_id: envelope_id.to_string(),
            })
    }

    async fn list_envelopes(
        &self,
        filter: &EnvelopeFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Envelope>, StorageError> {
        let tables = self.read()?;
        let mut matching: Vec<&Envelope> = tables
            .envelopes
            .values()
            .filter(|e| filter.matches(e))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(take)
            .cloned()
            .collect())
    }

    async fn count_envelopes(&self, filter: &EnvelopeFilter) -> Result<usize, StorageError> {
        Ok(self
            .read()?
            .envelopes
            .values()
            .filter(|e| filter.matches(e))
            .count())
    }

    async fn get_token(&self, token: &str) -> Result<TokenRecord, StorageError> {
        self.read()?
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| StorageError::TokenNotFound {
                token: token.to_string(),
            })
    }

    async fn list_tokens(&self, envelope_id: &str) -> Result<Vec<TokenRecord>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .token_order
            .iter()
            .filter_map(|key| tables.tokens.get(key))
            .filter(|t| t.envelope_id == envelope_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::run_conformance_suite;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memory_store_passes_conformance() {
        let report = run_conformance_suite(|| async { MemoryStore::new() }).await;
        assert!(report.failed == 0, "{report}");
        assert!(report.total > 0);
    }

    #[tokio::test]
    async fn dropped_snapshot_applies_nothing() {
        let store = MemoryStore::new();
        {
            let mut snap = store.begin_snapshot().await.unwrap();
            store
                .insert_envelope(&mut snap, crate::conformance::make_envelope("env-drop"))
                .await
                .unwrap();
        }
        assert!(matches!(
            store.get_envelope("env-drop").await,
            Err(StorageError::EnvelopeNotFound { .. })
        ));
    }
}
