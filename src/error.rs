//! Pipeline error taxonomy.
//!
//! Each variant sits in one class: retryable (the queue backs off and tries
//! again) or fatal (a bug or corrupted data; dead-lettered without retry).

use std::fmt;

use thiserror::Error;

use crate::decoder::DecodeError;

/// A causal dependency that has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    Pool(String),
    OutcomeConfig(String),
    Trial(u64),
    GameInstance(u64),
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prerequisite::Pool(addr) => write!(f, "pool {}", addr),
            Prerequisite::OutcomeConfig(hash) => write!(f, "outcome config {}", hash),
            Prerequisite::Trial(id) => write!(f, "trial {}", id),
            Prerequisite::GameInstance(id) => write!(f, "game instance {}", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] DecodeError),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("waiting on {0}")]
    MissingPrerequisite(Prerequisite),

    #[error("raw event {0} not found")]
    RawEventNotFound(String),

    #[error("unknown trial {0}")]
    UnknownTrial(u64),

    #[error("result index {index} out of range for trial {trial_id} ({len} outcomes)")]
    ResultIndexOutOfRange { trial_id: u64, index: u32, len: usize },

    #[error("raw event {order_index} is a {actual}, expected {expected}")]
    KindMismatch {
        order_index: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("arithmetic overflow in {0}")]
    Arithmetic(&'static str),

    #[error("order index {0} does not match its provenance")]
    OrderIndexMismatch(String),

    #[error("corrupt stored value in {column}: {value}")]
    CorruptValue { column: &'static str, value: String },

    #[error("queue closed")]
    QueueClosed,
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Storage(_) | PipelineError::MissingPrerequisite(_)
        )
    }

    pub fn missing(prerequisite: Prerequisite) -> Self {
        PipelineError::MissingPrerequisite(prerequisite)
    }

    /// Short machine-readable class for logs.
    pub fn class(&self) -> &'static str {
        match self {
            PipelineError::MissingPrerequisite(_) => "waiting_on_dependency",
            PipelineError::Storage(_) => "storage",
            PipelineError::Malformed(_) => "malformed",
            PipelineError::QueueClosed => "queue",
            _ => "invariant",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
