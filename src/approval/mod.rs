//! Human approval: the durable draft checkpoint and the HTTP surface that
//! resolves it.

pub mod model;
pub mod routes;

pub use model::{CheckpointStatus, Decision, DraftCheckpoint, Resolution};
pub use routes::approval_routes;
