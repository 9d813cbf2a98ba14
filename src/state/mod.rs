//! Orchestration document and its repository.

pub mod halt;
mod model;
mod repository;
mod summary;
pub mod workflow;

pub use model::*;
pub use repository::{RecoveryReport, STATE_FILE, StateRepository, validate};
pub use summary::{CheckpointSummary, StatusReport, Usage, log_tokens, refresh_execution};
