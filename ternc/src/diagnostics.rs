//! Diagnostic reporting infrastructure.
//!
//! This module provides error reporting with source locations,
//! suggestions, and pretty-printed output.
//!
//! # Error Codes
//!
//! Codes are organized by category:
//!
//! - **E0200-E0299**: Missing facts from the front end (nodes, types, call
//!   classifications, callees)
//! - **E0400-E0499**: Effect and handler errors
//! - **W0001-W0099**: Warnings

use crate::span::Span;
use ariadne::{Color, Label, Report, ReportKind, Source};

/// Compiler diagnostic codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // ============================================================
    // Missing front-end facts (E0200-E0299)
    // ============================================================
    /// An expression id has no node.
    MissingNode,
    /// A type id has no descriptor.
    MissingType,
    /// A call expression has no effect classification.
    MissingCallFact,
    /// A call target does not resolve to a function.
    UnresolvedCallee,
    /// A symbol is referenced but never declared.
    UnknownSymbol,
    /// A call's classification disagrees with its callee's effect row.
    ConventionMismatch,

    // ============================================================
    // Effect/handler errors (E0400-E0499)
    // ============================================================
    /// A performed or handled effect is not declared.
    UnresolvedEffect,
    /// An operation id is out of range for its effect.
    UnknownOperation,
    /// `resume`/`tail` used outside a handler clause.
    ResumeOutsideClause,
    /// `tail` used in a clause for a `Resume`-kind operation.
    TailInResumeClause,
    /// `resume` used in a clause for a `Tail`-kind operation.
    ResumeInTailClause,
    /// More than one resumption reachable on a single path.
    MultipleResumes,
    /// A resumption inside a loop body.
    ResumeInLoop,
    /// A resumption binding of another clause.
    ForeignResumeBinding,
    /// A handler clause handles the same operation twice.
    DuplicateClause,
    /// Control flow that would leave a handle body or clause.
    EscapingControlFlow,
    /// A function marked as exported has an unsupported signature.
    UnsupportedExport,
    /// Two effect declarations resolve to the same effect id.
    DuplicateEffectId,

    // ============================================================
    // Warnings (W0001-W0099)
    // ============================================================
    /// A package-visible effect without an explicit id.
    MissingEffectId,
}

impl ErrorCode {
    /// Get the formatted code string (e.g., "E0405").
    pub fn as_str(&self) -> String {
        let (prefix, number) = match self {
            ErrorCode::MissingNode => ('E', 200),
            ErrorCode::MissingType => ('E', 201),
            ErrorCode::MissingCallFact => ('E', 202),
            ErrorCode::UnresolvedCallee => ('E', 203),
            ErrorCode::UnknownSymbol => ('E', 204),
            ErrorCode::ConventionMismatch => ('E', 205),
            ErrorCode::UnresolvedEffect => ('E', 400),
            ErrorCode::UnknownOperation => ('E', 401),
            ErrorCode::ResumeOutsideClause => ('E', 402),
            ErrorCode::TailInResumeClause => ('E', 403),
            ErrorCode::ResumeInTailClause => ('E', 404),
            ErrorCode::MultipleResumes => ('E', 405),
            ErrorCode::ResumeInLoop => ('E', 406),
            ErrorCode::ForeignResumeBinding => ('E', 407),
            ErrorCode::DuplicateClause => ('E', 408),
            ErrorCode::EscapingControlFlow => ('E', 409),
            ErrorCode::UnsupportedExport => ('E', 410),
            ErrorCode::DuplicateEffectId => ('E', 411),
            ErrorCode::MissingEffectId => ('W', 1),
        };
        format!("{prefix}{number:04}")
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::MissingNode => "expression node is missing",
            ErrorCode::MissingType => "type descriptor is missing",
            ErrorCode::MissingCallFact => "call has no effect classification",
            ErrorCode::UnresolvedCallee => "call target does not resolve to a function",
            ErrorCode::UnknownSymbol => "unknown symbol",
            ErrorCode::ConventionMismatch => "call classification disagrees with the callee's effect row",
            ErrorCode::UnresolvedEffect => "effect is not declared",
            ErrorCode::UnknownOperation => "operation is not declared by its effect",
            ErrorCode::ResumeOutsideClause => "resumption outside of a handler clause",
            ErrorCode::TailInResumeClause => "cannot return tail from a resume-kind clause",
            ErrorCode::ResumeInTailClause => "tail-kind clause must return tail",
            ErrorCode::MultipleResumes => "continuation may be resumed more than once",
            ErrorCode::ResumeInLoop => "continuation resumed inside a loop",
            ErrorCode::ForeignResumeBinding => "resumption binding belongs to another clause",
            ErrorCode::DuplicateClause => "operation handled twice by one handler",
            ErrorCode::EscapingControlFlow => "control flow cannot leave a handler body or clause",
            ErrorCode::UnsupportedExport => "exported function has an unsupported signature",
            ErrorCode::DuplicateEffectId => "two effect declarations share one effect id",
            ErrorCode::MissingEffectId => "package-visible effect has no explicit id",
        }
    }

    /// Get a help message suggesting how to fix the problem.
    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::MultipleResumes | ErrorCode::ResumeInLoop => {
                Some("continuations are one-shot; resume on at most one path")
            }
            ErrorCode::TailInResumeClause => Some("use `resume` for resume-kind operations"),
            ErrorCode::ResumeInTailClause => Some("use `tail` for tail-kind operations"),
            ErrorCode::DuplicateEffectId => Some("give each effect declaration its own explicit id"),
            ErrorCode::MissingEffectId => Some(
                "add an explicit effect id so the identity survives renames and rebuilds",
            ),
            _ => None,
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// An error that prevents compilation.
    Error,
    /// A warning that doesn't prevent compilation.
    Warning,
    /// An informational note.
    Note,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// The code (e.g., "E0405").
    pub code: Option<String>,
    pub message: String,
    /// The primary span.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            ..Self::error(message, span)
        }
    }

    /// Set the code from an ErrorCode, adding its help message if any.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code.as_str());
        if let Some(help) = code.help() {
            self.suggestions.push(help.to_string());
        }
        self
    }

    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }
}

/// A secondary label in a diagnostic.
#[derive(Debug, Clone)]
pub struct DiagnosticLabel {
    pub span: Span,
    pub message: String,
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Renders diagnostics against one source file.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self { filename, source }
    }

    fn report(&self, diagnostic: &Diagnostic) -> Report<'a, (&'a str, std::ops::Range<usize>)> {
        let mut builder = Report::build(
            diagnostic.kind.to_report_kind(),
            self.filename,
            diagnostic.span.start,
        );

        let message = match &diagnostic.code {
            Some(code) => format!("[{}] {}", code, diagnostic.message),
            None => diagnostic.message.clone(),
        };
        builder = builder.with_message(message);

        builder = builder.with_label(
            Label::new((self.filename, diagnostic.span.start..diagnostic.span.end))
                .with_color(diagnostic.kind.color())
                .with_message(&diagnostic.message),
        );

        for label in &diagnostic.labels {
            let color = if label.primary {
                diagnostic.kind.color()
            } else {
                Color::Blue
            };
            builder = builder.with_label(
                Label::new((self.filename, label.span.start..label.span.end))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            builder = builder.with_help(diagnostic.suggestions.join("\n"));
        }

        builder.finish()
    }

    /// Print a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) -> std::io::Result<()> {
        self.report(diagnostic)
            .eprint((self.filename, Source::from(self.source)))
    }

    /// Render a diagnostic into a string, without colors.
    pub fn render(&self, diagnostic: &Diagnostic) -> std::io::Result<String> {
        let mut out = Vec::new();
        self.report(diagnostic)
            .write((self.filename, Source::from(self.source)), &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_formatting() {
        assert_eq!(ErrorCode::MultipleResumes.as_str(), "E0405");
        assert_eq!(ErrorCode::MissingCallFact.as_str(), "E0202");
        assert_eq!(ErrorCode::MissingEffectId.as_str(), "W0001");
    }

    #[test]
    fn test_error_code_adds_help() {
        let diag = Diagnostic::error("twice", Span::new(0, 4))
            .with_error_code(ErrorCode::MultipleResumes);
        assert_eq!(diag.code.as_deref(), Some("E0405"));
        assert_eq!(diag.suggestions.len(), 1);
        assert!(diag.is_error());
    }

    #[test]
    fn test_render_mentions_code_and_message() {
        let source = "handle { ask() } with { ask() => resume(1) + resume(2) }";
        let emitter = DiagnosticEmitter::new("main.tern", source);
        let diag = Diagnostic::error("continuation may be resumed more than once", Span::new(33, 42))
            .with_error_code(ErrorCode::MultipleResumes);
        let text = emitter.render(&diag).unwrap();
        assert!(text.contains("E0405"));
        assert!(text.contains("resumed more than once"));
    }
}
