//! # Continuation Actions
//!
//! A host handler receives the decoded request as an [`EffectCall`] and a
//! one-shot [`Continuations`] value. Consuming it produces the single
//! [`ContinuationAction`] the dispatch loop carries out:
//!
//! | Action | Legal for | Effect on the run |
//! |--------|-----------|-------------------|
//! | `resume(v)` | `Resume` ops | artifact continues with `v` |
//! | `tail(v)` | `Tail` ops | artifact continues with `v` |
//! | `end(v)` | both | run finishes with `v`; the artifact is not called again |
//!
//! The legality check happens in the dispatch loop, before any resumption,
//! so a handler that picks the wrong action fails the run without touching
//! the artifact.

use std::fmt;

use tern_abi::{ResumeKind, Scalar};

use crate::error::HandlerError;

/// What a handler asks the dispatch loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationAction {
    Resume(Scalar),
    Tail(Scalar),
    End(Scalar),
}

impl ContinuationAction {
    pub fn value(self) -> Scalar {
        match self {
            ContinuationAction::Resume(v) | ContinuationAction::Tail(v) | ContinuationAction::End(v) => v,
        }
    }

    /// Check this action against the resume kind of the request it answers.
    pub(crate) fn check(self, kind: ResumeKind) -> Result<(), &'static str> {
        match (kind, self) {
            (_, ContinuationAction::End(_)) => Ok(()),
            (ResumeKind::Resume, ContinuationAction::Resume(_)) => Ok(()),
            (ResumeKind::Tail, ContinuationAction::Tail(_)) => Ok(()),
            (ResumeKind::Resume, ContinuationAction::Tail(_)) => Err("cannot return tail"),
            (ResumeKind::Tail, ContinuationAction::Resume(_)) => Err("must return tail"),
        }
    }
}

/// The one-shot continuation handle given to a handler.
///
/// Every method consumes `self`, so a handler can produce at most one
/// action per request.
pub struct Continuations {
    kind: ResumeKind,
}

impl Continuations {
    pub(crate) fn new(kind: ResumeKind) -> Self {
        Self { kind }
    }

    /// Resume kind of the operation being handled.
    pub fn kind(&self) -> ResumeKind {
        self.kind
    }

    pub fn resume(self, value: impl Into<Scalar>) -> ContinuationAction {
        ContinuationAction::Resume(value.into())
    }

    pub fn tail(self, value: impl Into<Scalar>) -> ContinuationAction {
        ContinuationAction::Tail(value.into())
    }

    pub fn end(self, value: impl Into<Scalar>) -> ContinuationAction {
        ContinuationAction::End(value.into())
    }

    /// `resume` or `tail`, whichever the operation's kind requires.
    pub fn continue_with(self, value: impl Into<Scalar>) -> ContinuationAction {
        match self.kind {
            ResumeKind::Resume => self.resume(value),
            ResumeKind::Tail => self.tail(value),
        }
    }
}

impl fmt::Debug for Continuations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuations").field("kind", &self.kind).finish()
    }
}

/// A decoded effect request, as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectCall {
    pub op_index: u32,
    /// `Effect.op`, using the effect's short name.
    pub name: String,
    /// Full effect label from the table.
    pub effect_label: String,
    pub resume_kind: ResumeKind,
    /// Correlation token of the request (0 for host-bound requests).
    pub handle: u32,
    pub args: Vec<i32>,
}

impl EffectCall {
    /// Argument `index`, or a handler error naming the operation.
    pub fn arg(&self, index: usize) -> Result<i32, HandlerError> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| HandlerError::MissingArgument {
                op: self.name.clone(),
                index,
            })
    }
}
