//! Code generation for Tern.
//!
//! This module turns lowered MIR owner bodies into a target module.
//!
//! # Architecture
//!
//! ```text
//! MirBody -> BodyEmitter -> target::Module -> encode -> bytes
//! ```
//!
//! Each owner produces up to three functions:
//!
//! | Function | Name | Role |
//! |----------|------|------|
//! | entry | `owner` | the calling convention callers see |
//! | body | `owner$body` | the state machine over blocks and site states |
//! | continuation | `owner$k` | re-enters the body at a recorded site |
//!
//! The runtime helpers and the host boundary are emitted once per artifact
//! when the [`CodegenContext`] is created.

pub mod abi;
pub mod body;
pub mod context;
pub mod exports;
pub mod runtime;

pub use abi::{AbiTypes, OwnerKind, OwnerSig};
pub use context::{sig_of, CodegenContext, ExportedEntry, OwnerFuncs, TrapMap, TrapSite};
pub use runtime::RuntimeFuncs;
