//! Encrypted collection sync.
//!
//! Implements the client side of the record sync protocol:
//! - `meta` / `crypto` control collections and storage version check
//! - Per-collection pull → merge → push cycles with AES-256-CBC records
//! - Failure classification into auth / try-later / unrecoverable
//! - Enable/sync/disable lifecycle gating

pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod handle;
pub mod memory;
pub mod models;
pub mod remote;
pub mod state;
pub mod transformer;


pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::EngineConfig;
pub use conflict::ConflictPolicy;
pub use credentials::CredentialBundle;
pub use engine::{CollectionEngine, EngineState};
pub use error::SyncFailure;
pub use handle::CollectionHandle;
pub use memory::MemoryRemote;
pub use models::{CollectionStatus, CollectionSummary, DecodedConflict, RemoteRecord, SyncReport};
pub use remote::{
    RemoteClient, RemoteCollection, RemoteSession, SyncOutcome, TransportError, WireRecord,
};
pub use state::{SyncManager, SyncState, SyncStateMachine};
pub use transformer::{IdSchema, RemoteTransformer, SyncIdSchema, WebCryptoTransformer};
