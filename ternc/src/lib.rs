//! # Tern Compiler Library
//!
//! The effect-aware middle and back end of the Tern compiler.
//!
//! Tern programs perform algebraic effects: an operation is requested with
//! `perform`, handled by the nearest enclosing `handle` clause (or by the
//! host when none is installed), and resumed at most once. This crate takes
//! a resolved, type-checked program and produces one self-contained artifact
//! that suspends and resumes without any help from the host beyond the three
//! exchange imports.
//!
//! ## Compiler Pipeline
//!
//! ```text
//! HIR -> handler checks -> effect registry -> site analysis -> MIR -> codegen -> bytes
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use ternc::hir::build::ProgramBuilder;
//! use ternc::Compiler;
//!
//! let mut program = ProgramBuilder::new();
//! let mut m = program.module("app", "main");
//! let int = m.types().int();
//! let body = m.int(42);
//! m.export_function("answer", vec![], int, vec![], body);
//! m.finish();
//!
//! let artifact = Compiler::default().compile(&program.finish()).unwrap();
//! assert_eq!(artifact.exports.len(), 1);
//! assert!(artifact.table.is_empty());
//! ```
//!
//! ## Module Overview
//!
//! - [`hir`] - Resolved program input and a builder for constructing it
//! - [`effects`] - Effect identities, op indices, signature hashes and handler checks
//! - [`analysis`] - Owner discovery, suspension sites and liveness
//! - [`mir`] - Per-owner control-flow graphs with explicit suspension
//! - [`codegen`] - Owner bodies, continuations, runtime helpers and the host boundary
//! - [`target`] - The in-memory target module and its encoder
//! - [`driver`] - The whole-program [`Compiler`]
//! - [`config`] - Compiler settings
//! - [`diagnostics`] - Error codes and rendering
//! - [`span`] - Source location tracking

pub mod analysis;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod effects;
pub mod error;
pub mod hir;
pub mod mir;
pub mod span;
pub mod target;

// Re-export commonly used types
pub use config::{CompilerConfig, CompilerConfigBuilder, ConfigError};
pub use diagnostics::{Diagnostic, DiagnosticEmitter, DiagnosticKind, ErrorCode};
pub use driver::{CompiledArtifact, Compiler};
pub use error::{CompileError, CompileResult};
pub use span::Span;
