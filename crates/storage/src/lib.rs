pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStore};
pub use record::{redact, EnvelopeFilter, RevokeReason, TokenChange, TokenRecord, TokenState};
pub use traits::EnvelopeStore;
