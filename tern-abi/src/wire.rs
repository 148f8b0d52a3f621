//! # Exchange Buffer Records
//!
//! The compiled artifact and the host exchange values through a fixed
//! region of linear memory. The artifact writes one record per outcome via
//! the imported writer functions; the host writes one scalar record before
//! each resume.
//!
//! ```text
//! scalar   tag(u32) value(i32)                                   8 bytes
//! request  magic(u32) effect_hi effect_lo op_id op_index
//!          resume_kind handle argc(u32) args[argc](i32)         32 + 4*argc
//! ```
//!
//! Writers never fault on a full buffer: they report [`OVERFLOW`] instead.

use crate::hash::EffectId;
use crate::layout::{status, ResumeKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Return code of a writer whose record does not fit the buffer.
pub const OVERFLOW: i32 = -1;
/// Return code of a reader or writer given malformed input.
pub const MALFORMED: i32 = -2;

/// Size of an encoded scalar record.
pub const SCALAR_LEN: usize = 8;
/// Size of an encoded request record without arguments.
pub const REQUEST_HEADER_LEN: usize = 32;
/// Leading word of a request record (`"REQR"` little-endian).
pub const REQUEST_MAGIC: u32 = 0x5251_4552;

pub mod tag {
    pub const UNIT: u32 = 0;
    pub const BOOL: u32 = 1;
    pub const INT: u32 = 2;
    /// A heap reference the host cannot inspect.
    pub const REF: u32 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("encoding overflow: record needs {needed} bytes, buffer holds {capacity}")]
    Overflow { needed: usize, capacity: usize },

    #[error("record is truncated: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    #[error("unknown scalar tag {0}")]
    UnknownTag(u32),

    #[error("bad request magic {0:#010x}")]
    BadMagic(u32),

    #[error("invalid resume kind {0}")]
    BadResumeKind(u32),

    #[error("unknown outcome status {0}")]
    BadStatus(i32),
}

impl WireError {
    /// The negative code an import function returns for this error.
    pub fn code(&self) -> i32 {
        match self {
            WireError::Overflow { .. } => OVERFLOW,
            _ => MALFORMED,
        }
    }
}

/// A value that can cross the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scalar {
    Unit,
    Bool(bool),
    Int(i32),
    /// An opaque heap value; only its presence crosses the boundary.
    Ref,
}

impl Scalar {
    pub fn tag(self) -> u32 {
        match self {
            Scalar::Unit => tag::UNIT,
            Scalar::Bool(_) => tag::BOOL,
            Scalar::Int(_) => tag::INT,
            Scalar::Ref => tag::REF,
        }
    }

    pub fn payload(self) -> i32 {
        match self {
            Scalar::Unit | Scalar::Ref => 0,
            Scalar::Bool(b) => i32::from(b),
            Scalar::Int(n) => n,
        }
    }

    pub fn from_parts(tag: u32, payload: i32) -> Result<Self, WireError> {
        match tag {
            tag::UNIT => Ok(Scalar::Unit),
            tag::BOOL => Ok(Scalar::Bool(payload != 0)),
            tag::INT => Ok(Scalar::Int(payload)),
            tag::REF => Ok(Scalar::Ref),
            other => Err(WireError::UnknownTag(other)),
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Scalar::Int(n) => Some(n),
            _ => None,
        }
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Unit => write!(f, "()"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(n) => write!(f, "{n}"),
            Scalar::Ref => write!(f, "<ref>"),
        }
    }
}

/// Host view of an `EffectRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub effect: EffectId,
    pub op_id: u32,
    pub op_index: u32,
    pub resume_kind: ResumeKind,
    pub handle: u32,
    pub args: Vec<i32>,
}

impl RequestRecord {
    pub fn encoded_len(&self) -> usize {
        REQUEST_HEADER_LEN + 4 * self.args.len()
    }
}

/// Decoded `EffectResult`: the status word plus the record it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectResult {
    Value(Scalar),
    Pending(RequestRecord),
}

impl EffectResult {
    /// Decode the exchange buffer according to an outcome status word.
    pub fn decode(status_word: i32, bytes: &[u8]) -> Result<Self, WireError> {
        match status_word {
            status::VALUE => decode_scalar(bytes).map(EffectResult::Value),
            status::EFFECT => decode_request(bytes).map(EffectResult::Pending),
            other => Err(WireError::BadStatus(other)),
        }
    }

    pub fn status(&self) -> i32 {
        match self {
            EffectResult::Value(_) => status::VALUE,
            EffectResult::Pending(_) => status::EFFECT,
        }
    }
}

/// Write a scalar record at the start of `buf`, returning its length.
pub fn encode_scalar(buf: &mut [u8], value: Scalar) -> Result<usize, WireError> {
    let mut writer = Writer::new(buf, SCALAR_LEN)?;
    writer.put(value.tag());
    writer.put(value.payload() as u32);
    Ok(SCALAR_LEN)
}

/// Write a request record at the start of `buf`, returning its length.
pub fn encode_request(buf: &mut [u8], request: &RequestRecord) -> Result<usize, WireError> {
    let len = request.encoded_len();
    let mut writer = Writer::new(buf, len)?;
    for word in [
        REQUEST_MAGIC,
        request.effect.hi(),
        request.effect.lo(),
        request.op_id,
        request.op_index,
        request.resume_kind.as_u32(),
        request.handle,
        request.args.len() as u32,
    ] {
        writer.put(word);
    }
    for &arg in &request.args {
        writer.put(arg as u32);
    }
    Ok(len)
}

pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar, WireError> {
    let reader = Reader::new(bytes);
    Scalar::from_parts(reader.word(0)?, reader.word(1)? as i32)
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestRecord, WireError> {
    let reader = Reader::new(bytes);
    let magic = reader.word(0)?;
    if magic != REQUEST_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let kind = reader.word(5)?;
    let resume_kind = ResumeKind::from_u32(kind).ok_or(WireError::BadResumeKind(kind))?;
    let argc = reader.word(7)? as usize;
    let args = (0..argc)
        .map(|i| reader.word(8 + i).map(|w| w as i32))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RequestRecord {
        effect: EffectId::from_parts(reader.word(1)?, reader.word(2)?),
        op_id: reader.word(3)?,
        op_index: reader.word(4)?,
        resume_kind,
        handle: reader.word(6)?,
        args,
    })
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8], needed: usize) -> Result<Self, WireError> {
        if needed > buf.len() {
            return Err(WireError::Overflow {
                needed,
                capacity: buf.len(),
            });
        }
        Ok(Self { buf, pos: 0 })
    }

    fn put(&mut self, word: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&word.to_le_bytes());
        self.pos += 4;
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn word(&self, index: usize) -> Result<u32, WireError> {
        let start = index * 4;
        self.bytes
            .get(start..start + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(WireError::Truncated {
                needed: start + 4,
                len: self.bytes.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn await_request(args: Vec<i32>) -> RequestRecord {
        RequestRecord {
            effect: EffectId::from_identifier("app/io/Async"),
            op_id: 0,
            op_index: 3,
            resume_kind: ResumeKind::Resume,
            handle: 0,
            args,
        }
    }

    #[test]
    fn test_scalar_record_layout() {
        let mut buf = [0u8; 16];
        assert_eq!(encode_scalar(&mut buf, Scalar::Int(-2)), Ok(8));
        assert_eq!(&buf[..4], &2u32.to_le_bytes());
        assert_eq!(&buf[4..8], &(-2i32).to_le_bytes());
        assert_eq!(decode_scalar(&buf), Ok(Scalar::Int(-2)));
    }

    #[test]
    fn test_request_record_layout() {
        let request = await_request(vec![3, -7]);
        let mut buf = [0u8; 64];
        let len = encode_request(&mut buf, &request).unwrap();
        assert_eq!(len, 40);
        assert_eq!(&buf[..4], b"REQR");
        assert_eq!(&buf[36..40], &(-7i32).to_le_bytes());
        assert_eq!(decode_request(&buf[..len]), Ok(request));
    }

    #[test]
    fn test_overflow_is_reported_not_faulted() {
        let mut small = [0u8; 35];
        let err = encode_request(&mut small, &await_request(vec![1])).unwrap_err();
        assert_eq!(err, WireError::Overflow { needed: 36, capacity: 35 });
        assert_eq!(err.code(), OVERFLOW);
        assert!(err.to_string().contains("overflow"));

        let mut tiny = [0u8; 4];
        assert_eq!(encode_scalar(&mut tiny, Scalar::Unit).unwrap_err().code(), OVERFLOW);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(decode_scalar(&buf), Err(WireError::UnknownTag(9)));
        assert_eq!(WireError::UnknownTag(9).code(), MALFORMED);
        assert!(matches!(decode_request(&buf), Err(WireError::BadMagic(9))));

        let mut buf = [0u8; 64];
        let len = encode_request(&mut buf, &await_request(vec![1, 2])).unwrap();
        assert!(matches!(
            decode_request(&buf[..len - 4]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_effect_result_by_status() {
        let mut buf = [0u8; 8];
        encode_scalar(&mut buf, Scalar::Bool(true)).unwrap();
        assert_eq!(
            EffectResult::decode(status::VALUE, &buf),
            Ok(EffectResult::Value(Scalar::Bool(true)))
        );
        assert_eq!(EffectResult::decode(5, &buf), Err(WireError::BadStatus(5)));
    }
}
