//! Error types of the host runtime.
//!
//! Three layers, outermost first:
//!
//! - [`RunError`]: why a run was abandoned. Every variant means the artifact
//!   is not called again for that run.
//! - [`HandlerError`]: raised by a handler; surfaces as [`RunError::Handler`].
//! - [`ArtifactError`]: the embedding failed to call into the artifact
//!   (a trap, a missing export, an out-of-range memory access).

use tern_abi::{TableError, WireError};
use thiserror::Error;

/// Failure raised by the embedding of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("artifact has no export `{0}`")]
    MissingExport(String),

    #[error("artifact trapped: {0}")]
    Trap(String),

    #[error("memory access {offset}..{end} is outside linear memory of {len} bytes")]
    OutOfBounds { offset: usize, end: usize, len: usize },

    #[error("artifact has no effect table section")]
    MissingEffectTable,
}

/// Failure raised by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("request for `{op}` has no argument {index}")]
    MissingArgument { op: String, index: usize },

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Why a run did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// A handler broke the continuation contract for its operation.
    #[error("handler for `{op}` {message}")]
    Contract { op: String, message: String },

    #[error("no handler registered for `{op}` (op index {op_index})")]
    MissingHandler { op_index: u32, op: String },

    #[error("no operation matches handler key `{0}`")]
    UnknownOperation(String),

    #[error("handler key `{key}` matches {count} operations; register by op index instead")]
    AmbiguousOperation { key: String, count: usize },

    /// The request names an op index the table does not describe, or its
    /// identity does not match the table entry at that index.
    #[error("request does not match the effect table: {0}")]
    TableMismatch(String),

    #[error("run exceeded the limit of {limit} effect requests")]
    RequestLimit { limit: usize },

    /// The artifact reported that an outcome record did not fit the buffer.
    #[error("encoding overflow: outcome record does not fit the {capacity}-byte exchange buffer")]
    Overflow { capacity: usize },

    #[error("artifact reported malformed outcome data (code {0})")]
    Malformed(i32),

    #[error("effectful outcome carries no continuation")]
    MissingContinuation,

    #[error("resume value {0} cannot cross the host boundary")]
    UnsupportedResumeValue(tern_abi::Scalar),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("invalid effect table: {0}")]
    Table(#[from] TableError),
}

impl RunError {
    pub(crate) fn contract(op: &str, message: impl Into<String>) -> Self {
        RunError::Contract {
            op: op.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_message_names_operation() {
        let err = RunError::contract("Async.await", "cannot return tail");
        assert_eq!(err.to_string(), "handler for `Async.await` cannot return tail");
    }

    #[test]
    fn test_wire_overflow_is_reported() {
        let err = RunError::from(WireError::Overflow {
            needed: 40,
            capacity: 32,
        });
        assert!(err.to_string().contains("encoding overflow"));
    }
}
