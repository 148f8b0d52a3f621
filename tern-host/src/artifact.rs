//! The host's view of a compiled artifact.
//!
//! An embedding (a VM instance of the compiled module) implements
//! [`Artifact`]. The dispatch loop only ever calls the fixed boundary
//! exports plus one entry wrapper, and reads or writes the exchange buffer
//! through [`Artifact::memory`] and [`Artifact::memory_mut`]. Outcomes and
//! continuations stay opaque handles owned by the embedding.
//!
//! The three imports the artifact needs (`write_scalar`,
//! `write_effect_request`, `read_scalar`) are implemented by
//! [`Exchange`](crate::exchange::Exchange); the embedding wires them to its
//! instance's memory.

use crate::error::ArtifactError;

/// A compiled artifact instance.
pub trait Artifact {
    /// Handle to an `Outcome` record returned by the artifact.
    type Outcome;
    /// Handle to a `Continuation` record.
    type Continuation;

    /// Raw bytes of the `tern.effects` section.
    fn effect_table_bytes(&self) -> Result<Vec<u8>, ArtifactError>;

    /// Call an exported entry wrapper with i32 arguments.
    fn call_entry(&mut self, name: &str, args: &[i32]) -> Result<Self::Outcome, ArtifactError>;

    /// `tern_outcome_status`: encode the outcome into the exchange buffer
    /// and return its status word (0 value, 1 effect, negative on failure).
    fn outcome_status(&mut self, outcome: &Self::Outcome) -> Result<i32, ArtifactError>;

    /// `tern_outcome_continuation`: the continuation of an effect outcome.
    fn outcome_continuation(
        &mut self,
        outcome: &Self::Outcome,
    ) -> Result<Option<Self::Continuation>, ArtifactError>;

    /// `tern_resume`: resume with the scalar record at `ptr..ptr + len`.
    fn resume(
        &mut self,
        cont: Self::Continuation,
        ptr: u32,
        len: u32,
    ) -> Result<Self::Outcome, ArtifactError>;

    /// `tern_exchange_len`: length of the last record written.
    fn exchange_len(&mut self) -> Result<i32, ArtifactError>;

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];
}
