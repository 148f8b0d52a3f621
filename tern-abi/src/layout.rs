//! # Runtime Record Layouts
//!
//! Every heap record the generated code manipulates has a fixed field order.
//! The compiler emits struct types in exactly this order and the helpers
//! that read them use these indices, so the constants here are the single
//! source of truth for the value ABI.
//!
//! ```text
//! Outcome       { tag, payload }
//! EffectRequest { effect_hi, effect_lo, op_id, op_index, resume_kind,
//!                 handle, target, args, cont, guard }
//! Continuation  { func, env, site }
//! HandlerFrame  { prev, effect_hi, effect_lo, op_id, resume_kind,
//!                 clause, clause_env, tail_expected, label, marker }
//! TailGuard     { expected, observed }
//! SiteEnv       { site, frame, inner, slots }
//! Closure       { func, env }
//! ```
//!
//! `TailGuard.observed` is the only mutable field in the whole runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How an effect operation's continuation is used by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ResumeKind {
    /// The clause may resume at most once, at any point.
    #[default]
    Resume,
    /// The clause must resume exactly once, as its final act.
    Tail,
}

impl ResumeKind {
    /// Encoded word value (`0 = Resume`, `1 = Tail`).
    pub fn as_u32(self) -> u32 {
        match self {
            ResumeKind::Resume => 0,
            ResumeKind::Tail => 1,
        }
    }

    /// Decode a word value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ResumeKind::Resume),
            1 => Some(ResumeKind::Tail),
            _ => None,
        }
    }

    pub fn is_tail(self) -> bool {
        self == ResumeKind::Tail
    }
}

impl fmt::Display for ResumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeKind::Resume => write!(f, "resume"),
            ResumeKind::Tail => write!(f, "tail"),
        }
    }
}

/// `Outcome { tag: i32, payload: anyref }`.
pub mod outcome {
    pub const TAG: u32 = 0;
    pub const PAYLOAD: u32 = 1;

    /// Tag of a final value.
    pub const VALUE: i32 = 0;
    /// Tag of a pending effect; the payload is an `EffectRequest`.
    pub const EFFECT: i32 = 1;
}

/// `EffectRequest`. Created once per suspension and never mutated.
pub mod request {
    pub const EFFECT_HI: u32 = 0;
    pub const EFFECT_LO: u32 = 1;
    pub const OP_ID: u32 = 2;
    pub const OP_INDEX: u32 = 3;
    pub const RESUME_KIND: u32 = 4;
    /// Correlation token: the label of the targeted handler construct, or
    /// zero when the request is bound for the host.
    pub const HANDLE: u32 = 5;
    /// The matched `HandlerFrame`, or null for host-bound requests.
    pub const TARGET: u32 = 6;
    pub const ARGS: u32 = 7;
    pub const CONT: u32 = 8;
    pub const GUARD: u32 = 9;

    pub const FIELD_COUNT: u32 = 10;
}

/// `Continuation { func: funcref, env: anyref, site: i32 }`.
///
/// A null `func` denotes "no resumption possible".
pub mod continuation {
    pub const FUNC: u32 = 0;
    pub const ENV: u32 = 1;
    pub const SITE: u32 = 2;
}

/// `HandlerFrame`, a node of the immutable handler chain.
pub mod frame {
    pub const PREV: u32 = 0;
    pub const EFFECT_HI: u32 = 1;
    pub const EFFECT_LO: u32 = 2;
    pub const OP_ID: u32 = 3;
    pub const RESUME_KIND: u32 = 4;
    pub const CLAUSE: u32 = 5;
    pub const CLAUSE_ENV: u32 = 6;
    pub const TAIL_EXPECTED: u32 = 7;
    pub const LABEL: u32 = 8;
    /// Identity object shared by every frame pushed by one installation.
    pub const MARKER: u32 = 9;

    pub const FIELD_COUNT: u32 = 10;
}

/// `TailGuard { expected: i32, observed: mut i32 }`.
pub mod guard {
    pub const EXPECTED: u32 = 0;
    pub const OBSERVED: u32 = 1;
}

/// `SiteEnv { site, frame, inner, slots }`, the environment base record every
/// continuation group shares.
pub mod site_env {
    /// Active site discriminator.
    pub const SITE: u32 = 0;
    /// Handler chain at capture time.
    pub const FRAME: u32 = 1;
    /// Nested continuation for call, handle and resume sites.
    pub const INNER: u32 = 2;
    /// Captured locals and temporaries, in the site's capture order.
    pub const SLOTS: u32 = 3;
}

/// `Closure { func: funcref, env: anyref }`.
pub mod closure {
    pub const FUNC: u32 = 0;
    pub const ENV: u32 = 1;
}

/// Host-visible `EffectResult` status codes.
pub mod status {
    /// The outcome is a final value; the exchange buffer holds a scalar.
    pub const VALUE: i32 = 0;
    /// The outcome is a pending effect; the exchange buffer holds a request.
    pub const EFFECT: i32 = 1;
}

/// Fixed names of the host/artifact handshake.
pub mod names {
    /// Import module for every host-provided function.
    pub const IMPORT_MODULE: &str = "tern";
    pub const WRITE_SCALAR: &str = "write_scalar";
    pub const WRITE_EFFECT_REQUEST: &str = "write_effect_request";
    pub const READ_SCALAR: &str = "read_scalar";

    pub const OUTCOME_STATUS: &str = "tern_outcome_status";
    pub const OUTCOME_CONTINUATION: &str = "tern_outcome_continuation";
    pub const RESUME: &str = "tern_resume";
    pub const EXCHANGE_LEN: &str = "tern_exchange_len";
    pub const MEMORY: &str = "memory";

    /// Custom section carrying the encoded effect table.
    pub const EFFECT_SECTION: &str = "tern.effects";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_kind_words() {
        assert_eq!(ResumeKind::Resume.as_u32(), 0);
        assert_eq!(ResumeKind::Tail.as_u32(), 1);
        assert_eq!(ResumeKind::from_u32(1), Some(ResumeKind::Tail));
        assert_eq!(ResumeKind::from_u32(2), None);
    }

    #[test]
    fn test_record_field_counts() {
        assert_eq!(request::GUARD + 1, request::FIELD_COUNT);
        assert_eq!(frame::MARKER + 1, frame::FIELD_COUNT);
    }
}
