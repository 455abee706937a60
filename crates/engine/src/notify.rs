//! Outbound notifications. Delivery is the caller's concern; the engine only
//! says who to tell what, and never fails a request because telling failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use quire_core::{Envelope, Signer};
use quire_storage::redact;

use crate::error::NotifyError;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// A signer's turn has come; `token` is their signing link.
    async fn invite(&self, envelope: &Envelope, signer: &Signer, token: &str)
        -> Result<(), NotifyError>;

    async fn remind(&self, envelope: &Envelope, signer: &Signer, token: &str)
        -> Result<(), NotifyError>;

    /// Sent to the owner and every signer once the sealed document exists.
    async fn completed(&self, envelope: &Envelope) -> Result<(), NotifyError>;

    async fn declined(&self, envelope: &Envelope) -> Result<(), NotifyError>;
}

/// Writes each notification to the log instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn invite(
        &self,
        envelope: &Envelope,
        signer: &Signer,
        token: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            envelope_id = %envelope.id,
            signer = %signer.email,
            token = %redact(token),
            "signing invitation"
        );
        Ok(())
    }

    async fn remind(
        &self,
        envelope: &Envelope,
        signer: &Signer,
        token: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            envelope_id = %envelope.id,
            signer = %signer.email,
            token = %redact(token),
            "signing reminder"
        );
        Ok(())
    }

    async fn completed(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        tracing::info!(
            envelope_id = %envelope.id,
            recipients = envelope.signers.len() + 1,
            "envelope completed notification"
        );
        Ok(())
    }

    async fn declined(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        tracing::info!(envelope_id = %envelope.id, "envelope declined notification");
        Ok(())
    }
}

/// What a [`RecordingNotifier`] was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Invite {
        envelope_id: String,
        email: String,
        token: String,
    },
    Remind {
        envelope_id: String,
        email: String,
        token: String,
    },
    Completed {
        envelope_id: String,
    },
    Declined {
        envelope_id: String,
    },
}

/// Records notifications in memory; can be told to fail every delivery.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Tokens sent to `email` by invitations, oldest first.
    pub fn invites_for(&self, email: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Invite {
                    email: to, token, ..
                } if to == email => Some(token),
                _ => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError("delivery disabled".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| NotifyError("recorder lock poisoned".to_string()))?
            .push(notification);
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn invite(
        &self,
        envelope: &Envelope,
        signer: &Signer,
        token: &str,
    ) -> Result<(), NotifyError> {
        self.push(Notification::Invite {
            envelope_id: envelope.id.clone(),
            email: signer.email.clone(),
            token: token.to_string(),
        })
    }

    async fn remind(
        &self,
        envelope: &Envelope,
        signer: &Signer,
        token: &str,
    ) -> Result<(), NotifyError> {
        self.push(Notification::Remind {
            envelope_id: envelope.id.clone(),
            email: signer.email.clone(),
            token: token.to_string(),
        })
    }

    async fn completed(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        self.push(Notification::Completed {
            envelope_id: envelope.id.clone(),
        })
    }

    async fn declined(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        self.push(Notification::Declined {
            envelope_id: envelope.id.clone(),
        })
    }
}
