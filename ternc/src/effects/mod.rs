//! # Effects
//!
//! Compile-time effect bookkeeping shared by every module of a build.
//!
//! ## Module Structure
//!
//! - [`registry`] - effect identities and dense, order-independent op indices
//! - [`signature`] - structural signature hashing of op instantiations
//! - [`table`] - the effect table embedded in compiled artifacts
//! - [`handler`] - static checks on handle constructs and clauses
//!
//! ## Identity Scheme
//!
//! | Item | Identity |
//! |------|----------|
//! | effect | FNV-1a 64 of the explicit id, or of `package/module/Name` |
//! | op | declaration position within its effect |
//! | instantiation | `(effect id, op id, signature hash)` |
//! | op index | position of the instantiation in the sorted key set |

pub mod handler;
pub mod registry;
pub mod signature;
pub mod table;

pub use handler::{check_function, check_module};
pub use registry::{effect_identity, EffectInfo, EffectRegistry, FinalRegistry, OpKey, ResolvedOp};
pub use signature::SignatureHasher;
pub use table::{build_table, section_bytes};
