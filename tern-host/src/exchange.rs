//! # Exchange Buffer
//!
//! The region `[0, capacity)` of the artifact's linear memory. The artifact
//! fills it through three imports; the host reads outcome records from it
//! and writes resume values into it.
//!
//! ```text
//! artifact                         host
//! --------                         ----
//! tern_outcome_status(o)
//!   -> write_scalar / write_effect_request   (import, fills the buffer)
//! tern_exchange_len()              read_result(status, len)
//!                                  write_resume(value)
//! tern_resume(k, 0, len)
//!   -> read_scalar(0, len)         (import, validates the record)
//! ```
//!
//! The import functions never fault: failures become the negative codes
//! [`OVERFLOW`] and [`MALFORMED`], which the artifact propagates out of
//! `tern_outcome_status`.

use tern_abi::wire::{self, EffectResult, RequestRecord, Scalar, WireError, MALFORMED, OVERFLOW};
use tern_abi::{EffectId, ResumeKind};
use tracing::trace;

use crate::error::RunError;

/// Import implementations and host accessors for one buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    capacity: usize,
}

impl Exchange {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffer<'m>(&self, memory: &'m mut [u8]) -> &'m mut [u8] {
        let end = self.capacity.min(memory.len());
        &mut memory[..end]
    }

    // ========================================================================
    // Imports (module "tern")
    // ========================================================================

    /// `write_scalar(tag, payload) -> i32`
    pub fn write_scalar(&self, memory: &mut [u8], tag: u32, payload: i32) -> i32 {
        let result = Scalar::from_parts(tag, payload)
            .and_then(|value| wire::encode_scalar(self.buffer(memory), value));
        written(result)
    }

    /// `write_effect_request(effect_hi, effect_lo, op_id, op_index,
    /// resume_kind, handle, argc, args_ptr) -> i32`
    ///
    /// The `argc` arguments are read as little-endian i32 words at
    /// `args_ptr`, which lies outside the buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn write_effect_request(
        &self,
        memory: &mut [u8],
        effect_hi: u32,
        effect_lo: u32,
        op_id: u32,
        op_index: u32,
        resume_kind: u32,
        handle: u32,
        argc: i32,
        args_ptr: u32,
    ) -> i32 {
        let Ok(argc) = usize::try_from(argc) else {
            return MALFORMED;
        };
        let Some(resume_kind) = ResumeKind::from_u32(resume_kind) else {
            return MALFORMED;
        };
        let Some(args) = read_words(memory, args_ptr as usize, argc) else {
            return MALFORMED;
        };
        let request = RequestRecord {
            effect: EffectId::from_parts(effect_hi, effect_lo),
            op_id,
            op_index,
            resume_kind,
            handle,
            args,
        };
        trace!(op_index, argc, "write_effect_request");
        written(wire::encode_request(self.buffer(memory), &request))
    }

    /// `read_scalar(ptr, len) -> i32`: validate the scalar record at
    /// `ptr..ptr + len`, returning its length.
    pub fn read_scalar(&self, memory: &[u8], ptr: u32, len: u32) -> i32 {
        let start = ptr as usize;
        let end = start.saturating_add(len as usize);
        if end > self.capacity.min(memory.len()) {
            return MALFORMED;
        }
        match wire::decode_scalar(&memory[start..end]) {
            Ok(_) => wire::SCALAR_LEN as i32,
            Err(e) => e.code(),
        }
    }

    // ========================================================================
    // Host side
    // ========================================================================

    /// Decode the record the artifact just wrote for an outcome.
    pub fn read_result(&self, memory: &[u8], status: i32, len: i32) -> Result<EffectResult, RunError> {
        if status == OVERFLOW || len == OVERFLOW {
            return Err(RunError::Overflow {
                capacity: self.capacity,
            });
        }
        if status < 0 {
            return Err(RunError::Malformed(status));
        }
        let len = usize::try_from(len).map_err(|_| RunError::Malformed(len))?;
        if len > self.capacity.min(memory.len()) {
            return Err(RunError::Malformed(MALFORMED));
        }
        Ok(EffectResult::decode(status, &memory[..len])?)
    }

    /// Write a resume value at offset 0, returning its length.
    pub fn write_resume(&self, memory: &mut [u8], value: Scalar) -> Result<u32, WireError> {
        wire::encode_scalar(self.buffer(memory), value).map(|len| len as u32)
    }
}

fn written(result: Result<usize, WireError>) -> i32 {
    match result {
        Ok(len) => len as i32,
        Err(e) => e.code(),
    }
}

fn read_words(memory: &[u8], ptr: usize, count: usize) -> Option<Vec<i32>> {
    let end = ptr.checked_add(count.checked_mul(4)?)?;
    let bytes = memory.get(ptr..end)?;
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_abi::layout::status;
    use tern_abi::wire::tag;

    const CAPACITY: usize = 64;

    fn memory() -> Vec<u8> {
        vec![0u8; CAPACITY + 32]
    }

    fn put_args(memory: &mut [u8], args: &[i32]) -> u32 {
        for (i, a) in args.iter().enumerate() {
            let at = CAPACITY + 4 * i;
            memory[at..at + 4].copy_from_slice(&a.to_le_bytes());
        }
        CAPACITY as u32
    }

    #[test]
    fn test_scalar_round_trip_through_imports() {
        let ex = Exchange::new(CAPACITY);
        let mut mem = memory();
        let len = ex.write_scalar(&mut mem, tag::INT, 42);
        assert_eq!(len, 8);
        assert_eq!(ex.read_scalar(&mem, 0, len as u32), 8);
        assert_eq!(
            ex.read_result(&mem, status::VALUE, len).unwrap(),
            EffectResult::Value(Scalar::Int(42))
        );
    }

    #[test]
    fn test_request_reads_arguments_from_scratch() {
        let ex = Exchange::new(CAPACITY);
        let mut mem = memory();
        let ptr = put_args(&mut mem, &[5, -1]);
        let id = EffectId::from_identifier("app/io/Async");
        let len = ex.write_effect_request(&mut mem, id.hi(), id.lo(), 0, 3, 0, 0, 2, ptr);
        assert_eq!(len, 40);

        let EffectResult::Pending(request) = ex.read_result(&mem, status::EFFECT, len).unwrap() else {
            panic!("expected a pending request");
        };
        assert_eq!(request.effect, id);
        assert_eq!(request.op_index, 3);
        assert_eq!(request.resume_kind, ResumeKind::Resume);
        assert_eq!(request.args, vec![5, -1]);
    }

    #[test]
    fn test_overflow_is_a_code_not_a_fault() {
        let ex = Exchange::new(36);
        let mut mem = vec![0u8; 36 + 16];
        let ptr = 36;
        let code = ex.write_effect_request(&mut mem, 0, 1, 0, 0, 0, 0, 2, ptr);
        assert_eq!(code, OVERFLOW);
        assert!(matches!(
            ex.read_result(&mem, code, 0),
            Err(RunError::Overflow { capacity: 36 })
        ));
    }

    #[test]
    fn test_malformed_inputs() {
        let ex = Exchange::new(CAPACITY);
        let mut mem = memory();
        assert_eq!(ex.write_scalar(&mut mem, 9, 0), MALFORMED);
        assert_eq!(ex.write_effect_request(&mut mem, 0, 0, 0, 0, 7, 0, 0, 0), MALFORMED);
        assert_eq!(ex.write_effect_request(&mut mem, 0, 0, 0, 0, 0, 0, -1, 0), MALFORMED);
        // Arguments past the end of memory.
        assert_eq!(
            ex.write_effect_request(&mut mem, 0, 0, 0, 0, 0, 0, 16, CAPACITY as u32),
            MALFORMED
        );
        // A resume record outside the buffer.
        assert_eq!(ex.read_scalar(&mem, CAPACITY as u32, 8), MALFORMED);
        assert_eq!(ex.read_scalar(&mem, 0, 4), MALFORMED);
    }

    #[test]
    fn test_resume_value_lands_at_buffer_start() {
        let ex = Exchange::new(CAPACITY);
        let mut mem = memory();
        let len = ex.write_resume(&mut mem, Scalar::Bool(true)).unwrap();
        assert_eq!(len, 8);
        assert_eq!(&mem[..4], &tag::BOOL.to_le_bytes());
        assert_eq!(ex.read_scalar(&mem, 0, len), 8);

        let tiny = Exchange::new(4);
        assert!(tiny.write_resume(&mut mem, Scalar::Unit).is_err());
    }
}
