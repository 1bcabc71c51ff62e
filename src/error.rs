//! Typed errors at module boundaries.
//!
//! Everything inside a step is ultimately folded into a `StepResult`, so these
//! mostly exist to give callers (and tests) something to match on before the
//! message is flattened into a string.

use std::time::Duration;
use thiserror::Error;

/// A deterministic step could not work out its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no URL found in step context or description: {0:?}")]
    MissingUrl(String),

    #[error("no network name found in step context or description: {0:?}")]
    MissingNetwork(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("ref {reference} is from snapshot {stale} but the current snapshot is {current}; capture a new snapshot and use its refs")]
    StaleRef {
        reference: String,
        stale: u64,
        current: u64,
    },

    #[error("ref {0} does not exist in the current snapshot")]
    UnknownRef(String),

    #[error("malformed snapshot payload: {0}")]
    Malformed(String),
}

/// The model picked a tool that does not exist or gave it unusable input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolInputError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid input for '{tool}': {reason}")]
    Malformed { tool: String, reason: String },
}

/// Errors from the LLM tool-calling service.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model response had no choices: {0}")]
    MissingChoice(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}
