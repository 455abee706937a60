//! Signer access tokens.
//!
//! A token is 32 random bytes from the OS RNG, hex encoded, stored keyed by
//! its value with the envelope, the signer and an expiry. Every mutation runs
//! inside the caller's storage snapshot so token changes commit together with
//! the envelope change they belong to.

use std::sync::Arc;

use quire_storage::{
    EnvelopeStore, RevokeReason, StorageError, TokenChange, TokenRecord, TokenState,
};
use rand::RngCore;
use time::OffsetDateTime;

use crate::error::TokenError;

/// Who a verified token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub envelope_id: String,
    pub signer_email: String,
}

pub struct TokenService<S: EnvelopeStore> {
    store: Arc<S>,
    token_bytes: usize,
}

impl<S: EnvelopeStore> TokenService<S> {
    pub fn new(store: Arc<S>, token_bytes: usize) -> Self {
        Self { store, token_bytes }
    }

    fn mint(&self) -> String {
        let mut bytes = vec![0u8; self.token_bytes];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    async fn insert(
        &self,
        snapshot: &mut S::Snapshot,
        envelope_id: &str,
        signer_email: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
        state: TokenState,
    ) -> Result<String, TokenError> {
        let token = self.mint();
        let record = TokenRecord {
            token: token.clone(),
            envelope_id: envelope_id.to_string(),
            signer_email: signer_email.to_string(),
            state,
            created_at: now,
            activated_at: (state == TokenState::Active).then_some(now),
            expires_at,
            consumed_at: None,
            revoked_at: None,
            revoke_reason: None,
        };
        self.store
            .insert_token(snapshot, record)
            .await
            .map_err(TokenError::Storage)?;
        Ok(token)
    }

    /// Mint an active token for a signer whose turn it is.
    pub async fn issue(
        &self,
        snapshot: &mut S::Snapshot,
        envelope_id: &str,
        signer_email: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        self.insert(
            snapshot,
            envelope_id,
            signer_email,
            expires_at,
            now,
            TokenState::Active,
        )
        .await
    }

    /// Mint a dormant token for a sequential signer further down the order.
    pub async fn reserve(
        &self,
        snapshot: &mut S::Snapshot,
        envelope_id: &str,
        signer_email: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        self.insert(
            snapshot,
            envelope_id,
            signer_email,
            expires_at,
            now,
            TokenState::Dormant,
        )
        .await
    }

    /// Give a signer whose turn has come an active token: the reserved one
    /// if it exists, otherwise a fresh one.
    pub async fn activate_or_issue(
        &self,
        snapshot: &mut S::Snapshot,
        envelope_id: &str,
        signer_email: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        match self.find_open(envelope_id, signer_email).await? {
            Some(record) if record.state == TokenState::Dormant => {
                self.store
                    .transition_token(
                        snapshot,
                        &record.token,
                        TokenState::Dormant,
                        TokenChange::Activate { at: now },
                    )
                    .await
                    .map_err(map_conflict)?;
                Ok(record.token)
            }
            Some(record) => Ok(record.token),
            None => {
                self.issue(snapshot, envelope_id, signer_email, expires_at, now)
                    .await
            }
        }
    }

    /// The signer's newest token that is still dormant or active.
    pub async fn find_open(
        &self,
        envelope_id: &str,
        signer_email: &str,
    ) -> Result<Option<TokenRecord>, TokenError> {
        let tokens = self
            .store
            .list_tokens(envelope_id)
            .await
            .map_err(TokenError::Storage)?;
        Ok(tokens.into_iter().rev().find(|t| {
            t.signer_email == signer_email
                && matches!(t.state, TokenState::Dormant | TokenState::Active)
        }))
    }

    /// Fetch the stored record. Unknown tokens are `Invalid`.
    pub async fn lookup(&self, token: &str) -> Result<TokenRecord, TokenError> {
        match self.store.get_token(token).await {
            Ok(record) => Ok(record),
            Err(StorageError::TokenNotFound { .. }) => Err(TokenError::Invalid),
            Err(e) => Err(TokenError::Storage(e)),
        }
    }

    /// Whether a record grants access at `now`.
    pub fn check(record: &TokenRecord, now: OffsetDateTime) -> Result<TokenGrant, TokenError> {
        match record.state {
            TokenState::Dormant => return Err(TokenError::NotYetActive),
            TokenState::Consumed => return Err(TokenError::AlreadyUsed),
            TokenState::Revoked => return Err(TokenError::Invalid),
            TokenState::Active => {}
        }
        if now > record.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(TokenGrant {
            envelope_id: record.envelope_id.clone(),
            signer_email: record.signer_email.clone(),
        })
    }

    /// Read-only verification.
    pub async fn verify(&self, token: &str, now: OffsetDateTime) -> Result<TokenGrant, TokenError> {
        let record = self.lookup(token).await?;
        Self::check(&record, now)
    }

    /// Mark a token used. Exactly one of any number of concurrent consumers
    /// succeeds once the snapshot commits; the rest see `AlreadyUsed`.
    pub async fn consume(
        &self,
        snapshot: &mut S::Snapshot,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<TokenRecord, TokenError> {
        self.store
            .transition_token(
                snapshot,
                token,
                TokenState::Active,
                TokenChange::Consume { at: now },
            )
            .await
            .map_err(map_conflict)
    }

    /// Revoke a signer's token because a newer one replaces it.
    pub async fn supersede(
        &self,
        snapshot: &mut S::Snapshot,
        record: &TokenRecord,
        now: OffsetDateTime,
    ) -> Result<(), TokenError> {
        self.store
            .transition_token(
                snapshot,
                &record.token,
                record.state,
                TokenChange::Revoke {
                    at: now,
                    reason: RevokeReason::Superseded,
                },
            )
            .await
            .map_err(map_conflict)?;
        Ok(())
    }

    /// Invalidate every outstanding token of an envelope.
    pub async fn revoke_all(
        &self,
        snapshot: &mut S::Snapshot,
        envelope_id: &str,
        now: OffsetDateTime,
    ) -> Result<usize, TokenError> {
        self.store
            .revoke_envelope_tokens(snapshot, envelope_id, now)
            .await
            .map_err(TokenError::Storage)
    }
}

/// Translate a failed compare-and-set into what the token holder sees.
fn map_conflict(err: StorageError) -> TokenError {
    match err {
        StorageError::TokenStateConflict { actual, .. } => match actual {
            TokenState::Consumed => TokenError::AlreadyUsed,
            TokenState::Dormant => TokenError::NotYetActive,
            TokenState::Revoked | TokenState::Active => TokenError::Invalid,
        },
        StorageError::TokenNotFound { .. } => TokenError::Invalid,
        other => TokenError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_storage::MemoryStore;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2026-04-01 10:00 UTC);

    fn service() -> (Arc<MemoryStore>, TokenService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), TokenService::new(store, 32))
    }

    async fn issue(
        store: &MemoryStore,
        tokens: &TokenService<MemoryStore>,
        email: &str,
        state: TokenState,
        expires_at: OffsetDateTime,
    ) -> String {
        let mut snap = store.begin_snapshot().await.unwrap();
        let token = match state {
            TokenState::Dormant => tokens.reserve(&mut snap, "env-1", email, expires_at, NOW).await,
            _ => tokens.issue(&mut snap, "env-1", email, expires_at, NOW).await,
        }
        .unwrap();
        store.commit_snapshot(snap).await.unwrap();
        token
    }

    async fn consume(store: &MemoryStore, tokens: &TokenService<MemoryStore>, token: &str) {
        let mut snap = store.begin_snapshot().await.unwrap();
        tokens.consume(&mut snap, token, NOW).await.unwrap();
        store.commit_snapshot(snap).await.unwrap();
    }

    #[tokio::test]
    async fn issued_token_is_64_hex_chars_and_verifies() {
        let (store, tokens) = service();
        let token = issue(
            &store,
            &tokens,
            "ann@example.com",
            TokenState::Active,
            NOW + Duration::days(14),
        )
        .await;
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let grant = tokens.verify(&token, NOW).await.unwrap();
        assert_eq!(grant.envelope_id, "env-1");
        assert_eq!(grant.signer_email, "ann@example.com");
    }

    #[tokio::test]
    async fn verify_reports_each_failure_state() {
        let (store, tokens) = service();
        let expires = NOW + Duration::days(1);
        let dormant = issue(&store, &tokens, "bob@example.com", TokenState::Dormant, expires).await;
        let active = issue(&store, &tokens, "ann@example.com", TokenState::Active, expires).await;

        assert!(matches!(
            tokens.verify(&dormant, NOW).await,
            Err(TokenError::NotYetActive)
        ));
        assert!(matches!(
            tokens.verify("not-a-token", NOW).await,
            Err(TokenError::Invalid)
        ));
        assert!(matches!(
            tokens.verify(&active, expires + Duration::seconds(1)).await,
            Err(TokenError::Expired)
        ));

        consume(&store, &tokens, &active).await;
        assert!(matches!(
            tokens.verify(&active, NOW).await,
            Err(TokenError::AlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn activation_reuses_the_reserved_value() {
        let (store, tokens) = service();
        let expires = NOW + Duration::days(14);
        let reserved = issue(&store, &tokens, "bob@example.com", TokenState::Dormant, expires).await;

        let mut snap = store.begin_snapshot().await.unwrap();
        let activated = tokens
            .activate_or_issue(&mut snap, "env-1", "bob@example.com", expires, NOW)
            .await
            .unwrap();
        store.commit_snapshot(snap).await.unwrap();

        assert_eq!(reserved, activated);
        assert!(tokens.verify(&reserved, NOW).await.is_ok());
    }

    #[tokio::test]
    async fn second_consume_is_already_used() {
        let (store, tokens) = service();
        let token = issue(
            &store,
            &tokens,
            "ann@example.com",
            TokenState::Active,
            NOW + Duration::days(1),
        )
        .await;
        consume(&store, &tokens, &token).await;

        let mut snap = store.begin_snapshot().await.unwrap();
        let again = tokens.consume(&mut snap, &token, NOW).await;
        assert!(matches!(again, Err(TokenError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn superseded_token_is_invalid() {
        let (store, tokens) = service();
        let old = issue(
            &store,
            &tokens,
            "ann@example.com",
            TokenState::Active,
            NOW + Duration::days(1),
        )
        .await;
        let record = tokens.lookup(&old).await.unwrap();

        let mut snap = store.begin_snapshot().await.unwrap();
        tokens.supersede(&mut snap, &record, NOW).await.unwrap();
        store.commit_snapshot(snap).await.unwrap();

        assert!(matches!(
            tokens.verify(&old, NOW).await,
            Err(TokenError::Invalid)
        ));
        assert!(tokens
            .find_open("env-1", "ann@example.com")
            .await
            .unwrap()
            .is_none());
    }
}
