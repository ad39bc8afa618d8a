//! Persistence layer: libSQL-backed storage for workflow checkpoints and
//! learned preferences.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CheckpointStore, PreferenceStore, ResolveOutcome, StoredMessage};
