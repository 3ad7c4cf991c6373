use std::collections::BTreeMap;

use crate::agent::AgentStatus;

/// Errors surfaced by the control and query surfaces
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot {operation} agent {id} while {status}")]
    InvalidState {
        id: String,
        status: AgentStatus,
        operation: &'static str,
    },

    #[error("agent {id} subprocess failed: {message}")]
    SubprocessFailure { id: String, message: String },

    #[error("guidance for {id} could not be committed after {attempts} attempts: {source}")]
    ChannelFailure {
        id: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{} of the batch failed", failed.len())]
    PartialBatchFailure { failed: BTreeMap<String, String> },

    #[error("agent id space exhausted for prefix {0}")]
    IdSpaceExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn agent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.into(),
        }
    }

    pub fn cycle_not_found(cycle: u64) -> Self {
        Self::NotFound {
            kind: "cycle",
            id: cycle.to_string(),
        }
    }

    /// Short machine-readable name, used in batch outcome maps
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::InvalidState { .. } => "InvalidState",
            Self::SubprocessFailure { .. } => "SubprocessFailure",
            Self::ChannelFailure { .. } => "ChannelFailure",
            Self::PartialBatchFailure { .. } => "PartialBatchFailure",
            Self::IdSpaceExhausted(_) => "IdSpaceExhausted",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
