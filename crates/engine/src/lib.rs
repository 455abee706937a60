//! quire-engine: the signing workflow on top of an [`quire_storage::EnvelopeStore`].
//!
//! # Public API
//!
//! - [`Orchestrator`] -- every owner and signer operation
//! - [`TokenService`] -- minting, verifying and consuming signing links
//! - [`Sealer`] / [`DocumentRenderer`] -- the flattened, content-addressed artifact
//! - [`PdfRenderer`] -- draws captured values onto PDF pages
//! - [`BlobStore`] -- where source and sealed documents live
//! - [`Notifier`] -- outbound invitations and notices
//! - [`EngineConfig`] -- tunables, loaded from the server's TOML config

pub mod blob;
pub mod clock;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod pdf;
pub mod request;
pub mod sealer;
pub mod sequencer;
pub mod tokens;
pub mod values;
pub mod view;

pub use blob::{sha256_hex, BlobStore, ContentAddress, FsBlobStore, MemoryBlobStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{BlobError, EnvelopeError, NotifyError, SealError, TokenError};
pub use notify::{LogNotifier, Notification, Notifier, RecordingNotifier};
pub use orchestrator::Orchestrator;
pub use pdf::PdfRenderer;
pub use request::{normalize_fields, CreateEnvelope, ListQuery, SignerInput};
pub use sealer::{DocumentRenderer, Placement, Sealer, StampRenderer};
pub use tokens::{TokenGrant, TokenService};
pub use values::{validate_values, FieldValues, ValueViolation};
pub use view::{EnvelopePage, EnvelopeSummary, SignerSummary, SigningSession};
