//! # Tern ABI
//!
//! The vocabulary shared by the compiler (`ternc`) and the host runtime
//! (`tern-host`). Nothing in this crate knows how code is generated or how
//! handlers run; it only fixes binary layouts so both sides agree.
//!
//! ## Modules
//!
//! - [`layout`]: field indices of the runtime heap records, outcome and
//!   status codes, resume kinds, and the fixed import/export names.
//! - [`hash`]: the FNV-1a accumulator used for effect identities and
//!   structural signature hashes.
//! - [`table`]: the effect table section codec (versions 1 and 2).
//! - [`wire`]: the exchange-buffer record codec used at the host boundary.

pub mod hash;
pub mod layout;
pub mod table;
pub mod wire;

pub use hash::{fnv1a64, EffectId, Fnv1a};
pub use layout::ResumeKind;
pub use table::{EffectEntry, EffectTable, OpEntry, TableError, TableVersion};
pub use wire::{EffectResult, RequestRecord, Scalar, WireError};
