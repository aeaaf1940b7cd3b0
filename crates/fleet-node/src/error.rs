use fleet_index_lib::FleetError;
use std::path::PathBuf;

/// Errors surfaced by the node binary
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Feed directory not found: {}", .0.display())]
    FeedDirMissing(PathBuf),
}

pub type Result<T> = std::result::Result<T, NodeError>;
