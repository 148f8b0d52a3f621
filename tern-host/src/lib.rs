//! # Tern Host Runtime
//!
//! The host side of a compiled Tern artifact:
//!
//! - **Exchange**: implementations of the three imports the artifact uses
//!   to write outcome records into, and read resume values out of, the
//!   shared exchange buffer
//! - **Handlers**: async handlers keyed by op index or `Effect.op` name
//! - **Dispatch loop**: calls an entry, serves each effect request with its
//!   handler, and resumes until the run completes, ends, or is cancelled
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        TERN HOST                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │  HostRuntime │  │   Handlers   │  │ Cancellation │    │
//! │  │ (runtime.rs) │  │(handlers.rs) │  │   (token)    │    │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘    │
//! │         │                                                 │
//! │  ┌──────▼───────┐  ┌──────────────┐                      │
//! │  │   Artifact   │◄─┤   Exchange   │  imports: write_*,   │
//! │  │ (embedding)  │  │(exchange.rs) │  read_scalar         │
//! │  └──────────────┘  └──────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The library never installs a `tracing` subscriber; embedders choose one,
//! typically at [`HostConfig::log_level`](config::HostConfig::log_level).

#![warn(rust_2018_idioms)]

pub mod artifact;
pub mod cancellation;
pub mod config;
pub mod continuation;
pub mod error;
pub mod exchange;
pub mod handlers;
pub mod runtime;

// Re-exports
pub use artifact::Artifact;
pub use cancellation::{CancellationSource, CancellationToken, Cancelled};
pub use config::{ConfigError, HostConfig, HostConfigBuilder, LogLevel};
pub use continuation::{ContinuationAction, Continuations, EffectCall};
pub use error::{ArtifactError, HandlerError, RunError};
pub use exchange::Exchange;
pub use handlers::{BoundHandlers, Handler, HandlerRegistry, HandlerResult};
pub use runtime::{HostRuntime, RunOutcome, RunStats};
pub use tern_abi::{ResumeKind, Scalar};

/// Host runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
