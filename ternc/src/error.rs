//! Compile errors and internal-compiler-error reporting.
//!
//! Every failure in this crate is fatal: missing front-end facts and
//! handler misuse abort compilation of the whole program. Internal
//! compiler errors are logged through `tracing` with their key/value
//! context before they are returned, so the trace survives even when the
//! caller only prints the message.

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::span::Span;
use thiserror::Error;

/// A fatal compilation error.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub code: Option<ErrorCode>,
    /// Whether this is an internal compiler error (should not happen with valid input).
    pub is_ice: bool,
    /// Secondary locations, such as an earlier conflicting clause.
    pub notes: Vec<(Span, String)>,
}

impl CompileError {
    pub fn new(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            code: Some(code),
            is_ice: false,
            notes: Vec::new(),
        }
    }

    pub fn ice(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            code: None,
            is_ice: true,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.notes.push((span, message.into()));
        self
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let message = if self.is_ice {
            format!("internal compiler error: {}", self.message)
        } else {
            self.message.clone()
        };
        let diag = self
            .notes
            .iter()
            .fold(Diagnostic::error(message, self.span), |diag, (span, note)| {
                diag.with_note(*span, note.clone())
            });
        match self.code {
            Some(code) => diag.with_error_code(code),
            None => diag,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Log an internal compiler error with key/value context.
///
/// ```ignore
/// ice!("site without a temporary"; "expr" => expr, "owner" => owner);
/// ```
#[macro_export]
macro_rules! ice {
    ($msg:expr; $($key:literal => $val:expr),+ $(,)?) => {{
        let context: Vec<String> = vec![$(format!("{} = {:?}", $key, $val)),+];
        ::tracing::error!(
            target: "ternc::ice",
            context = %context.join(", "),
            "internal compiler error: {}",
            $msg
        );
    }};
    ($msg:expr) => {{
        ::tracing::error!(target: "ternc::ice", "internal compiler error: {}", $msg);
    }};
}

/// Log an internal compiler error and build the matching [`CompileError`].
#[macro_export]
macro_rules! ice_err {
    ($span:expr, $msg:expr; $($key:literal => $val:expr),+ $(,)?) => {{
        $crate::ice!($msg; $($key => $val),+);
        $crate::error::CompileError::ice($msg, $span)
    }};
    ($span:expr, $msg:expr) => {{
        $crate::ice!($msg);
        $crate::error::CompileError::ice($msg, $span)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_carries_code() {
        let err = CompileError::new(ErrorCode::ResumeInLoop, "resumed in loop", Span::dummy());
        assert_eq!(err.to_string(), "resumed in loop");
        assert_eq!(err.to_diagnostic().code.as_deref(), Some("E0406"));
    }

    #[test]
    fn test_ice_macro_builds_ice() {
        let err = ice_err!(Span::new(1, 2), "no block"; "block" => 3);
        assert!(err.is_ice);
        assert_eq!(err.to_string(), "no block");
        assert!(err.to_diagnostic().message.starts_with("internal compiler error"));
    }
}
