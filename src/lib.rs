//! Multi-account mail synchronization and classification engine.
//!
//! Accounts are synced on a fixed scheduler cadence through
//! provider-specific adapters behind one capability trait, ingested into
//! a local sqlite store with thread grouping and dedup, and classified
//! by learned rules merged with an optional AI scorer. Credentials rest
//! encrypted in a local vault and never leave the process.

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod models;
pub mod providers;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod vault;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Retryability};
pub use storage::Storage;
pub use vault::Vault;
