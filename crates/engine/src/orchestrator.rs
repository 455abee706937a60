//! Envelope orchestrator: the operations the HTTP surface exposes.
//!
//! Every state change follows the same pattern: load the envelope, compute
//! the new state with the sequencer, then stage the envelope update (guarded
//! by the version that was read) and any token changes in one snapshot and
//! commit. A version conflict reruns the whole read-compute-commit cycle, up
//! to `max_commit_attempts` times.
//!
//! Sealing runs outside any snapshot; completion is its own commit.

use std::future::Future;
use std::sync::Arc;

use quire_core::{
    normalize_email, validate_fields, validate_signers, AuditKind, ClientInfo, DeclineActor,
    Envelope, EnvelopeStatus, SignatureField, SignerStatus,
};
use quire_storage::{redact, EnvelopeFilter, EnvelopeStore, StorageError, TokenRecord};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EnvelopeError, SealError, TokenError};
use crate::notify::Notifier;
use crate::request::{normalize_fields, CreateEnvelope, ListQuery};
use crate::pdf::PdfRenderer;
use crate::sealer::{DocumentRenderer, Sealer};
use crate::sequencer::{self, SignatureOutcome, TokenAction};
use crate::tokens::TokenService;
use crate::values::{validate_values, FieldValues};
use crate::view::{EnvelopePage, EnvelopeSummary, SigningSession};

pub struct Orchestrator<S: EnvelopeStore> {
    store: Arc<S>,
    tokens: TokenService<S>,
    blobs: Arc<dyn BlobStore>,
    sealer: Sealer,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

/// A committed signature plus the follow-up work it triggers.
struct Submitted {
    envelope: Envelope,
    signer_email: String,
    outcome: SignatureOutcome,
    next_invite: Option<(String, String)>,
}

impl<S: EnvelopeStore> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tokens: TokenService::new(store.clone(), config.token_bytes),
            sealer: Sealer::new(blobs.clone(), Arc::new(PdfRenderer)),
            store,
            blobs,
            notifier,
            clock,
            config,
        }
    }

    /// Replace the default [`PdfRenderer`].
    pub fn with_renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.sealer = Sealer::new(self.blobs.clone(), renderer);
        self
    }

    // ── Owner operations ─────────────────────────────────────────────────────

    pub async fn create_envelope(&self, request: CreateEnvelope) -> Result<Envelope, EnvelopeError> {
        let now = self.clock.now();
        let title = request.title.trim();
        if title.is_empty() {
            return Err(EnvelopeError::InvalidRequest {
                message: "title must not be empty".to_string(),
            });
        }
        let document_ref = request.document_ref.trim();
        if document_ref.is_empty() {
            return Err(EnvelopeError::InvalidRequest {
                message: "document_ref must not be empty".to_string(),
            });
        }
        let expiry = self.config.expiry(request.expires_in_days)?;

        let signers = request.signers();
        validate_signers(&signers, request.signing_mode).map_err(EnvelopeError::InvalidSigners)?;

        let fields = normalize_fields(request.fields);
        if !fields.is_empty() {
            validate_fields(&signers, &fields).map_err(EnvelopeError::ValidationFailed)?;
        }

        let mut envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            owner_id: request.owner_id.trim().to_string(),
            title: title.to_string(),
            message: request
                .message
                .map(|m| m.trim().to_string())
                .unwrap_or_default(),
            document_ref: document_ref.to_string(),
            signing_mode: request.signing_mode,
            status: EnvelopeStatus::Draft,
            signers,
            fields,
            created_at: now,
            expires_at: now + expiry,
            completed_at: None,
            sealed: None,
            decline: None,
            audit: Vec::new(),
            version: 0,
        };
        let detail = serde_json::json!({
            "signers": envelope.signers.len(),
            "fields": envelope.fields.len(),
        });
        envelope.record(AuditKind::Created, now, None, None, detail);

        let mut snap = self.store.begin_snapshot().await?;
        self.store.insert_envelope(&mut snap, envelope.clone()).await?;
        self.commit(snap, &envelope.id).await?;

        tracing::info!(
            envelope_id = %envelope.id,
            signers = envelope.signers.len(),
            mode = ?envelope.signing_mode,
            "envelope created"
        );
        Ok(envelope)
    }

    /// Replace the field set of a `DRAFT` envelope.
    pub async fn update_fields(
        &self,
        envelope_id: &str,
        fields: Vec<SignatureField>,
    ) -> Result<Envelope, EnvelopeError> {
        let fields = normalize_fields(fields);
        self.with_retry(envelope_id, || self.try_update_fields(envelope_id, &fields))
            .await
    }

    async fn try_update_fields(
        &self,
        envelope_id: &str,
        fields: &[SignatureField],
    ) -> Result<Envelope, EnvelopeError> {
        let mut envelope = self.load(envelope_id).await?;
        if envelope.status != EnvelopeStatus::Draft {
            return Err(EnvelopeError::EnvelopeLocked {
                status: envelope.status,
            });
        }
        validate_fields(&envelope.signers, fields).map_err(EnvelopeError::ValidationFailed)?;
        envelope.fields = fields.to_vec();
        envelope.record(
            AuditKind::FieldsUpdated,
            self.clock.now(),
            None,
            None,
            serde_json::json!({ "fields": fields.len() }),
        );
        self.commit_update(envelope).await
    }

    /// `DRAFT -> READY -> SENT`, issuing the first round of tokens.
    pub async fn send(&self, envelope_id: &str) -> Result<Envelope, EnvelopeError> {
        let (envelope, invites) = self
            .with_retry(envelope_id, || self.try_send(envelope_id))
            .await?;
        tracing::info!(
            envelope_id = %envelope.id,
            invited = invites.len(),
            "envelope sent"
        );
        for (email, token) in &invites {
            self.invite(&envelope, email, token).await;
        }
        Ok(envelope)
    }

    async fn try_send(
        &self,
        envelope_id: &str,
    ) -> Result<(Envelope, Vec<(String, String)>), EnvelopeError> {
        let mut envelope = self.load(envelope_id).await?;
        let now = self.clock.now();
        let expected = envelope.version;
        let actions = sequencer::send(&mut envelope, now)?;

        let mut snap = self.store.begin_snapshot().await?;
        let mut invites = Vec::new();
        for action in actions {
            match action {
                TokenAction::Issue { email } => {
                    let token = self
                        .tokens
                        .issue(&mut snap, &envelope.id, &email, envelope.expires_at, now)
                        .await?;
                    if let Some(signer) = envelope.signer_mut(&email) {
                        signer.token = Some(token.clone());
                    }
                    invites.push((email, token));
                }
                TokenAction::Reserve { email } => {
                    self.tokens
                        .reserve(&mut snap, &envelope.id, &email, envelope.expires_at, now)
                        .await?;
                }
            }
        }
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;
        Ok((envelope, invites))
    }

    /// The envelope, expired first if its deadline has passed.
    pub async fn get_envelope(&self, envelope_id: &str) -> Result<Envelope, EnvelopeError> {
        self.load(envelope_id).await
    }

    pub async fn get_envelope_status(
        &self,
        envelope_id: &str,
    ) -> Result<EnvelopeSummary, EnvelopeError> {
        let envelope = self.load(envelope_id).await?;
        Ok(EnvelopeSummary::of(&envelope))
    }

    /// A page of envelope summaries, newest first. Overdue envelopes the
    /// sweep has not reached yet are reported as `EXPIRED`.
    pub async fn list_envelopes(&self, query: &ListQuery) -> Result<EnvelopePage, EnvelopeError> {
        let filter = EnvelopeFilter {
            owner_id: query.owner_id.clone(),
            status: query.status,
            ..Default::default()
        };
        let limit = query.effective_limit();
        let now = self.clock.now();
        let envelopes = self
            .store
            .list_envelopes(&filter, limit, query.offset)
            .await?;
        let total = self.store.count_envelopes(&filter).await?;
        let items = envelopes
            .iter()
            .map(|envelope| {
                let mut summary = EnvelopeSummary::of(envelope);
                if !envelope.status.is_terminal()
                    && !envelope.all_signed()
                    && envelope.is_past_expiry(now)
                {
                    summary.status = EnvelopeStatus::Expired;
                }
                summary
            })
            .collect();
        Ok(EnvelopePage {
            items,
            total,
            limit,
            offset: query.offset,
        })
    }

    /// The owner withdraws the envelope. Recorded as `DECLINED` by the owner.
    pub async fn cancel(&self, envelope_id: &str, reason: &str) -> Result<Envelope, EnvelopeError> {
        let (envelope, was_sent) = self
            .with_retry(envelope_id, || self.try_cancel(envelope_id, reason))
            .await?;
        tracing::info!(envelope_id = %envelope.id, "envelope cancelled by owner");
        if was_sent {
            if let Err(e) = self.notifier.declined(&envelope).await {
                tracing::warn!(envelope_id = %envelope.id, error = %e, "cancellation notice not delivered");
            }
        }
        Ok(envelope)
    }

    async fn try_cancel(
        &self,
        envelope_id: &str,
        reason: &str,
    ) -> Result<(Envelope, bool), EnvelopeError> {
        let mut envelope = self.load(envelope_id).await?;
        let now = self.clock.now();
        let expected = envelope.version;
        let was_sent = envelope.status.is_in_flight();
        sequencer::apply_decline(&mut envelope, DeclineActor::Owner, reason, None, now)?;

        let mut snap = self.store.begin_snapshot().await?;
        self.tokens.revoke_all(&mut snap, &envelope.id, now).await?;
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;
        Ok((envelope, was_sent))
    }

    /// Re-notify every signer who can act right now. Returns how many
    /// reminders were handed to the notifier.
    pub async fn remind(&self, envelope_id: &str) -> Result<usize, EnvelopeError> {
        let envelope = self.load(envelope_id).await?;
        if !envelope.status.is_in_flight() {
            return Err(EnvelopeError::NotInFlight {
                status: envelope.status,
            });
        }
        let mut reminded = 0usize;
        for signer in envelope
            .signers
            .iter()
            .filter(|s| s.status == SignerStatus::Active)
        {
            let Some(token) = signer.token.as_deref() else {
                continue;
            };
            match self.notifier.remind(&envelope, signer, token).await {
                Ok(()) => reminded += 1,
                Err(e) => {
                    tracing::warn!(envelope_id, signer = %signer.email, error = %e, "reminder not delivered")
                }
            }
        }
        let detail = serde_json::json!({ "reminded": reminded });
        self.audit_best_effort(envelope_id, AuditKind::ReminderSent, None, None, detail)
            .await;
        Ok(reminded)
    }

    /// Issue a fresh link to an active signer; the previous one stops working.
    pub async fn reissue_link(&self, envelope_id: &str, email: &str) -> Result<String, EnvelopeError> {
        let email = normalize_email(email);
        let (envelope, token) = self
            .with_retry(envelope_id, || self.try_reissue(envelope_id, &email))
            .await?;
        tracing::info!(envelope_id, signer = %email, token = %redact(&token), "signing link reissued");
        self.invite(&envelope, &email, &token).await;
        Ok(token)
    }

    async fn try_reissue(
        &self,
        envelope_id: &str,
        email: &str,
    ) -> Result<(Envelope, String), EnvelopeError> {
        let mut envelope = self.load(envelope_id).await?;
        if !envelope.status.is_in_flight() {
            return Err(EnvelopeError::NotInFlight {
                status: envelope.status,
            });
        }
        let signer = envelope
            .signer(email)
            .ok_or_else(|| EnvelopeError::SignerNotFound {
                email: email.to_string(),
            })?;
        match signer.status {
            SignerStatus::Active => {}
            SignerStatus::Pending => return Err(EnvelopeError::NotYetActive),
            SignerStatus::Signed => return Err(EnvelopeError::AlreadyUsed),
            SignerStatus::Declined => return Err(EnvelopeError::EnvelopeDeclined),
        }
        let now = self.clock.now();
        let expected = envelope.version;

        let mut snap = self.store.begin_snapshot().await?;
        if let Some(previous) = self.tokens.find_open(&envelope.id, email).await? {
            self.tokens
                .supersede(&mut snap, &previous, now)
                .await
                .map_err(|e| raced(e, &envelope.id))?;
        }
        let token = self
            .tokens
            .issue(&mut snap, &envelope.id, email, envelope.expires_at, now)
            .await?;
        if let Some(signer) = envelope.signer_mut(email) {
            signer.token = Some(token.clone());
        }
        envelope.record(
            AuditKind::LinkReissued,
            now,
            None,
            None,
            serde_json::json!({ "signer": email }),
        );
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;
        Ok((envelope, token))
    }

    /// The signer's current link, active or dormant, for the owner to pass on
    /// by hand. A dormant link starts working when the signer's turn comes.
    pub async fn copy_link(&self, envelope_id: &str, email: &str) -> Result<String, EnvelopeError> {
        let email = normalize_email(email);
        let envelope = self.load(envelope_id).await?;
        if !envelope.status.is_in_flight() {
            return Err(EnvelopeError::NotInFlight {
                status: envelope.status,
            });
        }
        let signer = envelope
            .signer(&email)
            .ok_or_else(|| EnvelopeError::SignerNotFound {
                email: email.clone(),
            })?;
        match signer.status {
            SignerStatus::Active | SignerStatus::Pending => {}
            SignerStatus::Signed => return Err(EnvelopeError::AlreadyUsed),
            SignerStatus::Declined => return Err(EnvelopeError::EnvelopeDeclined),
        }
        let record = self
            .tokens
            .find_open(&envelope.id, &email)
            .await?
            .ok_or(EnvelopeError::InvalidToken)?;

        self.audit_best_effort(
            envelope_id,
            AuditKind::LinkCopied,
            None,
            None,
            serde_json::json!({ "signer": email, "state": record.state }),
        )
        .await;
        Ok(record.token)
    }

    /// Retry sealing of a fully signed envelope whose sealing failed.
    /// Completed envelopes are returned unchanged.
    pub async fn finalize(&self, envelope_id: &str) -> Result<Envelope, EnvelopeError> {
        let envelope = self.load(envelope_id).await?;
        if envelope.status == EnvelopeStatus::Completed {
            return Ok(envelope);
        }
        self.complete(envelope_id).await
    }

    /// Expire every open envelope past its deadline. Returns how many this
    /// call expired.
    pub async fn expire_overdue(&self) -> Result<usize, EnvelopeError> {
        let filter = EnvelopeFilter {
            expires_before: Some(self.clock.now()),
            open_only: true,
            ..Default::default()
        };
        let overdue = self.store.list_envelopes(&filter, 0, 0).await?;
        let mut expired = 0usize;
        for envelope in &overdue {
            match self
                .with_retry(&envelope.id, || self.try_expire(&envelope.id))
                .await
            {
                Ok((_, true)) => expired += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(envelope_id = %envelope.id, error = %e, "could not expire envelope")
                }
            }
        }
        if expired > 0 {
            tracing::info!(expired, candidates = overdue.len(), "expiry sweep");
        }
        Ok(expired)
    }

    // ── Signer operations ────────────────────────────────────────────────────

    /// Open a signing link: the signer's own fields and the document. Only
    /// the signer's first open is audited.
    pub async fn get_signing_session(
        &self,
        token: &str,
        client: Option<ClientInfo>,
    ) -> Result<SigningSession, EnvelopeError> {
        let (record, envelope) = self.resolve(token).await?;
        let session = SigningSession::for_signer(&envelope, &record.signer_email);
        if !has_opened(&envelope, &record.signer_email) {
            self.record_first_open(&envelope.id, &record.signer_email, client.as_ref())
                .await;
        }
        Ok(session)
    }

    async fn record_first_open(&self, envelope_id: &str, email: &str, client: Option<&ClientInfo>) {
        let result = self
            .with_retry(envelope_id, || async move {
                let mut envelope = self.store.get_envelope(envelope_id).await?;
                if has_opened(&envelope, email) {
                    return Ok(envelope);
                }
                envelope.record(
                    AuditKind::Opened,
                    self.clock.now(),
                    Some(email),
                    client,
                    serde_json::Value::Null,
                );
                self.commit_update(envelope).await
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(envelope_id, error = %e, "open not recorded");
        }
    }

    /// Capture a signer's values. Completes and seals the envelope when this
    /// was the last signature.
    pub async fn submit_signature(
        &self,
        token: &str,
        values: FieldValues,
        client: Option<ClientInfo>,
    ) -> Result<Envelope, EnvelopeError> {
        let label = redact(token);
        let submitted = self
            .with_retry(&label, || self.try_submit(token, &values, client.as_ref()))
            .await?;
        tracing::info!(
            envelope_id = %submitted.envelope.id,
            signer = %submitted.signer_email,
            all_signed = submitted.outcome.all_signed,
            "signature recorded"
        );
        if let Some((email, next_token)) = &submitted.next_invite {
            self.invite(&submitted.envelope, email, next_token).await;
        }
        if submitted.outcome.all_signed {
            return self.complete(&submitted.envelope.id).await;
        }
        Ok(submitted.envelope)
    }

    async fn try_submit(
        &self,
        token: &str,
        values: &FieldValues,
        client: Option<&ClientInfo>,
    ) -> Result<Submitted, EnvelopeError> {
        let (record, mut envelope) = self.resolve(token).await?;
        let email = record.signer_email;
        validate_values(&envelope, &email, values).map_err(EnvelopeError::IncompleteValues)?;

        let now = self.clock.now();
        let expected = envelope.version;
        let outcome = sequencer::apply_signature(&mut envelope, &email, values, client, now)?;

        let mut snap = self.store.begin_snapshot().await?;
        self.tokens
            .consume(&mut snap, token, now)
            .await
            .map_err(|e| raced(e, &envelope.id))?;
        let mut next_invite = None;
        if let Some(next) = &outcome.next_signer {
            let next_token = self
                .tokens
                .activate_or_issue(&mut snap, &envelope.id, next, envelope.expires_at, now)
                .await
                .map_err(|e| raced(e, &envelope.id))?;
            if let Some(signer) = envelope.signer_mut(next) {
                signer.token = Some(next_token.clone());
            }
            next_invite = Some((next.clone(), next_token));
        }
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;

        Ok(Submitted {
            envelope,
            signer_email: email,
            outcome,
            next_invite,
        })
    }

    /// The signer refuses. Terminal: every other link stops working.
    pub async fn decline(
        &self,
        token: &str,
        reason: &str,
        client: Option<ClientInfo>,
    ) -> Result<Envelope, EnvelopeError> {
        let label = redact(token);
        let envelope = self
            .with_retry(&label, || self.try_decline(token, reason, client.as_ref()))
            .await?;
        tracing::info!(envelope_id = %envelope.id, "envelope declined by signer");
        if let Err(e) = self.notifier.declined(&envelope).await {
            tracing::warn!(envelope_id = %envelope.id, error = %e, "decline notice not delivered");
        }
        Ok(envelope)
    }

    async fn try_decline(
        &self,
        token: &str,
        reason: &str,
        client: Option<&ClientInfo>,
    ) -> Result<Envelope, EnvelopeError> {
        let (record, mut envelope) = self.resolve(token).await?;
        let now = self.clock.now();
        let expected = envelope.version;
        let by = DeclineActor::Signer {
            email: record.signer_email,
        };
        sequencer::apply_decline(&mut envelope, by, reason, client, now)?;

        let mut snap = self.store.begin_snapshot().await?;
        self.tokens
            .consume(&mut snap, token, now)
            .await
            .map_err(|e| raced(e, &envelope.id))?;
        self.tokens.revoke_all(&mut snap, &envelope.id, now).await?;
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;
        Ok(envelope)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Run `attempt` until it succeeds, fails with something other than a
    /// version conflict, or the attempt budget runs out. `label` names the
    /// operation in logs; contention reports the envelope that conflicted.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T, EnvelopeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EnvelopeError>>,
    {
        let max = self.config.max_commit_attempts.max(1);
        let mut envelope_id = None;
        for n in 1..=max {
            match attempt().await {
                Err(e) => {
                    let Some(id) = e.conflicting_envelope().map(str::to_string) else {
                        return Err(e);
                    };
                    tracing::debug!(op = label, envelope_id = %id, attempt = n, "version conflict, retrying");
                    envelope_id = Some(id);
                }
                ok => return ok,
            }
        }
        let envelope_id = envelope_id.unwrap_or_else(|| label.to_string());
        tracing::warn!(op = label, %envelope_id, attempts = max, "gave up after repeated version conflicts");
        Err(EnvelopeError::Contention { envelope_id })
    }

    /// Load an envelope, committing its expiry first when overdue.
    async fn load(&self, envelope_id: &str) -> Result<Envelope, EnvelopeError> {
        let envelope = self.store.get_envelope(envelope_id).await?;
        let now = self.clock.now();
        if envelope.status.is_terminal() || envelope.all_signed() || !envelope.is_past_expiry(now) {
            return Ok(envelope);
        }
        let (envelope, _) = self
            .with_retry(envelope_id, || self.try_expire(envelope_id))
            .await?;
        Ok(envelope)
    }

    async fn try_expire(&self, envelope_id: &str) -> Result<(Envelope, bool), EnvelopeError> {
        let mut envelope = self.store.get_envelope(envelope_id).await?;
        let now = self.clock.now();
        let expected = envelope.version;
        if !sequencer::apply_expiry(&mut envelope, now)? {
            return Ok((envelope, false));
        }
        let mut snap = self.store.begin_snapshot().await?;
        let revoked = self.tokens.revoke_all(&mut snap, &envelope.id, now).await?;
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;
        tracing::info!(envelope_id, revoked, "envelope expired");
        Ok((envelope, true))
    }

    /// Resolve a token to its record and envelope. The envelope's terminal
    /// status takes precedence over the token's own state.
    async fn resolve(&self, token: &str) -> Result<(TokenRecord, Envelope), EnvelopeError> {
        let record = self.tokens.lookup(token).await?;
        let envelope = self.load(&record.envelope_id).await?;
        let now = self.clock.now();
        match envelope.status {
            EnvelopeStatus::Declined => return Err(EnvelopeError::EnvelopeDeclined),
            EnvelopeStatus::Expired => return Err(EnvelopeError::Expired),
            EnvelopeStatus::Completed => {
                TokenService::<S>::check(&record, now)?;
                return Err(EnvelopeError::EnvelopeCompleted);
            }
            _ => {}
        }
        TokenService::<S>::check(&record, now)?;
        Ok((record, envelope))
    }

    /// Seal a fully signed envelope and commit `COMPLETED`. A finisher that
    /// loses the race returns the winner's result.
    async fn complete(&self, envelope_id: &str) -> Result<Envelope, EnvelopeError> {
        let (envelope, newly) = self
            .with_retry(envelope_id, || self.try_complete(envelope_id))
            .await?;
        if newly {
            tracing::info!(
                envelope_id,
                sha256 = envelope.sealed.as_ref().map(|s| s.sha256.as_str()).unwrap_or(""),
                "envelope completed"
            );
            if let Err(e) = self.notifier.completed(&envelope).await {
                tracing::warn!(envelope_id, error = %e, "completion notice not delivered");
            }
        }
        Ok(envelope)
    }

    async fn try_complete(&self, envelope_id: &str) -> Result<(Envelope, bool), EnvelopeError> {
        let mut envelope = self.store.get_envelope(envelope_id).await?;
        if envelope.status == EnvelopeStatus::Completed {
            return Ok((envelope, false));
        }
        if envelope.status != EnvelopeStatus::InProgress || !envelope.all_signed() {
            return Err(EnvelopeError::NotReadyToSeal {
                status: envelope.status,
            });
        }
        let now = self.clock.now();
        let sealed = match self.sealer.seal(&envelope, now).await {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!(envelope_id, error = %e, "sealing failed");
                self.record_sealing_failure(envelope_id, &e).await;
                return Err(EnvelopeError::SealingFailed(e));
            }
        };
        sequencer::apply_completion(&mut envelope, sealed, now)?;
        self.commit_update(envelope).await.map(|e| (e, true))
    }

    async fn record_sealing_failure(&self, envelope_id: &str, err: &SealError) {
        let detail = serde_json::json!({ "error": err.to_string() });
        self.audit_best_effort(envelope_id, AuditKind::SealingFailed, None, None, detail)
            .await;
    }

    /// Commit a snapshot. A token conflict found only at commit time means
    /// another writer got there first; it is retried like a version conflict.
    async fn commit(&self, snap: S::Snapshot, envelope_id: &str) -> Result<(), EnvelopeError> {
        match self.store.commit_snapshot(snap).await {
            Ok(()) => Ok(()),
            Err(StorageError::TokenStateConflict { .. }) => Err(conflict(envelope_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit an envelope whose only change is to itself.
    async fn commit_update(&self, mut envelope: Envelope) -> Result<Envelope, EnvelopeError> {
        let expected = envelope.version;
        let mut snap = self.store.begin_snapshot().await?;
        envelope.version = self
            .store
            .update_envelope(&mut snap, expected, envelope.clone())
            .await?;
        self.commit(snap, &envelope.id).await?;
        Ok(envelope)
    }

    /// Append an audit event; failure is logged, never returned.
    async fn audit_best_effort(
        &self,
        envelope_id: &str,
        kind: AuditKind,
        actor: Option<&str>,
        client: Option<&ClientInfo>,
        detail: serde_json::Value,
    ) {
        let detail = &detail;
        let result = self
            .with_retry(envelope_id, || async move {
                let mut envelope = self.store.get_envelope(envelope_id).await?;
                envelope.record(kind, self.clock.now(), actor, client, detail.clone());
                self.commit_update(envelope).await
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(envelope_id, ?kind, error = %e, "audit event not recorded");
        }
    }

    async fn invite(&self, envelope: &Envelope, email: &str, token: &str) {
        let Some(signer) = envelope.signer(email) else {
            return;
        };
        if let Err(e) = self.notifier.invite(envelope, signer, token).await {
            tracing::warn!(envelope_id = %envelope.id, signer = %email, error = %e, "invitation not delivered");
        }
    }
}

/// A token compare-and-set lost to a concurrent writer. Rerun against fresh
/// state, which then reports what the caller should see.
fn has_opened(envelope: &Envelope, email: &str) -> bool {
    envelope
        .audit
        .iter()
        .any(|e| e.kind == AuditKind::Opened && e.actor.as_deref() == Some(email))
}

fn raced(err: TokenError, envelope_id: &str) -> EnvelopeError {
    match err {
        TokenError::Invalid | TokenError::AlreadyUsed | TokenError::NotYetActive => {
            conflict(envelope_id)
        }
        other => other.into(),
    }
}

fn conflict(envelope_id: &str) -> EnvelopeError {
    EnvelopeError::Storage(StorageError::ConcurrentConflict {
        envelope_id: envelope_id.to_string(),
        expected_version: -1,
        actual_version: -1,
    })
}
