//! # Effect Table Section
//!
//! Binary encoding of the finalized effect registry, embedded in every
//! compiled artifact so that consumers which did not take part in
//! compilation can recover effect and operation identities.
//!
//! ## Layout
//!
//! All words are little-endian `u32`.
//!
//! ```text
//! header        version, effect_count, op_count                (12 bytes)
//! v1 effect     effect_id(lo), name_off, ops_off, op_count      (16 bytes)
//! v2 effect     id_hi, id_lo, name_off, ops_off, op_count, 0    (24 bytes)
//! v1 op         op_id, resume_kind, name_off                    (12 bytes)
//! v2 op         op_id, resume_kind, name_off, signature_hash    (16 bytes)
//! names         NUL-terminated UTF-8 strings
//! ```
//!
//! `ops_off` is a byte offset into the op array and must be a multiple of
//! the op entry size. `name_off` is a byte offset into the names blob.
//! Version 1 truncates effect ids to their low half and carries no
//! signature hash; version 2 round-trips every identity losslessly.
//!
//! An op's global index is its position in the op array.

use crate::hash::EffectId;
use crate::layout::ResumeKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

const HEADER_LEN: usize = 12;

/// Encoding version of the effect table section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TableVersion {
    /// 16-byte effect headers, 12-byte op entries, 32-bit effect ids.
    V1,
    /// 24-byte effect headers, 16-byte op entries with signature hashes.
    #[default]
    V2,
}

impl TableVersion {
    pub fn as_u32(self) -> u32 {
        match self {
            TableVersion::V1 => 1,
            TableVersion::V2 => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(TableVersion::V1),
            2 => Some(TableVersion::V2),
            _ => None,
        }
    }

    /// Size of one effect header in bytes.
    pub fn effect_entry_len(self) -> usize {
        match self {
            TableVersion::V1 => 16,
            TableVersion::V2 => 24,
        }
    }

    /// Size of one op entry in bytes.
    pub fn op_entry_len(self) -> usize {
        match self {
            TableVersion::V1 => 12,
            TableVersion::V2 => 16,
        }
    }
}

/// Errors from decoding an effect table section.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("effect table is truncated: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    #[error("unsupported effect table version {0}")]
    UnsupportedVersion(u32),

    #[error("effect table is misaligned: effect {effect} has ops offset {offset}")]
    Misaligned { effect: usize, offset: u32 },

    #[error("effect table is truncated: effect {effect} ops {start}..{end} exceed {op_count} entries")]
    OpRange {
        effect: usize,
        start: usize,
        end: usize,
        op_count: usize,
    },

    #[error("effect table is misaligned: op entry {op} is claimed by more than one effect")]
    OverlappingOps { op: usize },

    #[error("effect table is truncated: name offset {offset} is outside the names blob")]
    NameOutOfRange { offset: u32 },

    #[error("effect table is truncated: name at offset {offset} has no terminator")]
    UnterminatedName { offset: u32 },

    #[error("effect table name at offset {offset} is not valid UTF-8")]
    InvalidName { offset: u32 },

    #[error("effect table op {op} has invalid resume kind {kind}")]
    InvalidResumeKind { op: usize, kind: u32 },
}

/// One operation of an effect, at its global op index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpEntry {
    /// Global dense index, the position in the op array.
    pub op_index: u32,
    /// Declaration position of the op within its effect.
    pub op_id: u32,
    pub resume_kind: ResumeKind,
    /// Structural hash of the substituted parameter/return types.
    pub signature_hash: u32,
    pub label: String,
}

/// One effect and its operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectEntry {
    pub id: EffectId,
    /// Human-readable label (explicit id, or `package/module/Name`).
    pub label: String,
    pub ops: Vec<OpEntry>,
}

impl EffectEntry {
    /// The last path segment of the label (`Async` for `app/io/Async`).
    pub fn short_name(&self) -> &str {
        self.label.rsplit('/').next().unwrap_or(&self.label)
    }
}

/// A decoded or freshly built effect table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTable {
    effects: Vec<EffectEntry>,
}

impl EffectTable {
    /// Build a table from effects in their final order. Op indices are
    /// reassigned densely in iteration order.
    pub fn new(mut effects: Vec<EffectEntry>) -> Self {
        let mut next = 0u32;
        for effect in &mut effects {
            for op in &mut effect.ops {
                op.op_index = next;
                next += 1;
            }
        }
        Self { effects }
    }

    pub fn effects(&self) -> &[EffectEntry] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.effects.iter().all(|e| e.ops.is_empty())
    }

    /// Total number of op entries.
    pub fn op_count(&self) -> usize {
        self.effects.iter().map(|e| e.ops.len()).sum()
    }

    /// Iterate every op together with its effect, in op-index order.
    pub fn ops(&self) -> impl Iterator<Item = (&EffectEntry, &OpEntry)> {
        self.effects
            .iter()
            .flat_map(|effect| effect.ops.iter().map(move |op| (effect, op)))
    }

    /// Look up an op by its global index.
    pub fn op(&self, op_index: u32) -> Option<(&EffectEntry, &OpEntry)> {
        self.ops().find(|(_, op)| op.op_index == op_index)
    }

    /// Resolve the global index of an id triple.
    pub fn find(&self, effect: EffectId, op_id: u32, signature_hash: u32) -> Option<u32> {
        self.ops()
            .find(|(e, op)| e.id == effect && op.op_id == op_id && op.signature_hash == signature_hash)
            .map(|(_, op)| op.op_index)
    }

    /// Resolve every op index whose `Effect.op` name matches `suffix`.
    ///
    /// The effect part matches the whole label or its trailing path
    /// segments (`Async.await` matches `app/io/Async`).
    pub fn resolve_suffix(&self, suffix: &str) -> Vec<u32> {
        let Some((effect_part, op_part)) = suffix.rsplit_once('.') else {
            return Vec::new();
        };
        self.ops()
            .filter(|(effect, op)| {
                op.label == op_part
                    && (effect.label == effect_part
                        || effect.label.ends_with(&format!("/{effect_part}")))
            })
            .map(|(_, op)| op.op_index)
            .collect()
    }

    /// Serialize the table.
    pub fn encode(&self, version: TableVersion) -> Vec<u8> {
        let mut names = NameBlob::default();
        let op_len = version.op_entry_len();

        let mut effect_words = Vec::new();
        let mut op_words = Vec::new();
        let mut op_cursor = 0usize;
        for effect in &self.effects {
            let name_off = names.intern(&effect.label);
            let ops_off = (op_cursor * op_len) as u32;
            match version {
                TableVersion::V1 => {
                    effect_words.extend([effect.id.lo(), name_off, ops_off, effect.ops.len() as u32]);
                }
                TableVersion::V2 => effect_words.extend([
                    effect.id.hi(),
                    effect.id.lo(),
                    name_off,
                    ops_off,
                    effect.ops.len() as u32,
                    0,
                ]),
            }
            for op in &effect.ops {
                let name_off = names.intern(&op.label);
                op_words.extend([op.op_id, op.resume_kind.as_u32(), name_off]);
                if version == TableVersion::V2 {
                    op_words.push(op.signature_hash);
                }
            }
            op_cursor += effect.ops.len();
        }

        let mut out = Vec::with_capacity(
            HEADER_LEN + 4 * (effect_words.len() + op_words.len()) + names.bytes.len(),
        );
        for word in [version.as_u32(), self.effects.len() as u32, op_cursor as u32]
            .into_iter()
            .chain(effect_words)
            .chain(op_words)
        {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&names.bytes);
        out
    }

    /// Decode a table section, rejecting truncated or misaligned data.
    pub fn decode(bytes: &[u8]) -> Result<Self, TableError> {
        let reader = WordReader { bytes };
        let raw_version = reader.word(0)?;
        let version =
            TableVersion::from_u32(raw_version).ok_or(TableError::UnsupportedVersion(raw_version))?;
        let effect_count = reader.word(4)? as usize;
        let op_count = reader.word(8)? as usize;

        let effect_len = version.effect_entry_len();
        let op_len = version.op_entry_len();
        let ops_start = effect_count
            .checked_mul(effect_len)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or(TableError::Truncated { needed: usize::MAX, len: bytes.len() })?;
        let names_start = op_count
            .checked_mul(op_len)
            .and_then(|n| n.checked_add(ops_start))
            .ok_or(TableError::Truncated { needed: usize::MAX, len: bytes.len() })?;
        if bytes.len() < names_start {
            return Err(TableError::Truncated {
                needed: names_start,
                len: bytes.len(),
            });
        }
        let blob = &bytes[names_start..];

        let mut claimed = vec![false; op_count];
        let mut effects = Vec::with_capacity(effect_count);
        for index in 0..effect_count {
            let base = HEADER_LEN + index * effect_len;
            let (id, name_off, ops_off, count) = match version {
                TableVersion::V1 => (
                    EffectId::from_parts(0, reader.word(base)?),
                    reader.word(base + 4)?,
                    reader.word(base + 8)?,
                    reader.word(base + 12)? as usize,
                ),
                TableVersion::V2 => (
                    EffectId::from_parts(reader.word(base)?, reader.word(base + 4)?),
                    reader.word(base + 8)?,
                    reader.word(base + 12)?,
                    reader.word(base + 16)? as usize,
                ),
            };
            if ops_off as usize % op_len != 0 {
                return Err(TableError::Misaligned {
                    effect: index,
                    offset: ops_off,
                });
            }
            let start = ops_off as usize / op_len;
            let end = start.saturating_add(count);
            if end > op_count {
                return Err(TableError::OpRange {
                    effect: index,
                    start,
                    end,
                    op_count,
                });
            }

            let mut ops = Vec::with_capacity(count);
            for op in start..end {
                if std::mem::replace(&mut claimed[op], true) {
                    return Err(TableError::OverlappingOps { op });
                }
                let base = ops_start + op * op_len;
                let kind = reader.word(base + 4)?;
                let resume_kind =
                    ResumeKind::from_u32(kind).ok_or(TableError::InvalidResumeKind { op, kind })?;
                let signature_hash = match version {
                    TableVersion::V1 => 0,
                    TableVersion::V2 => reader.word(base + 12)?,
                };
                ops.push(OpEntry {
                    op_index: op as u32,
                    op_id: reader.word(base)?,
                    resume_kind,
                    signature_hash,
                    label: read_name(blob, reader.word(base + 8)?)?,
                });
            }
            effects.push(EffectEntry {
                id,
                label: read_name(blob, name_off)?,
                ops,
            });
        }

        Ok(Self { effects })
    }

    /// Stable human-readable listing, one line per effect and op.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for effect in &self.effects {
            let _ = writeln!(out, "effect {} {}", effect.id, effect.label);
            for op in &effect.ops {
                let _ = writeln!(
                    out,
                    "  [{}] {}#{} {} sig={:08x}",
                    op.op_index, op.label, op.op_id, op.resume_kind, op.signature_hash
                );
            }
        }
        out
    }
}

struct WordReader<'a> {
    bytes: &'a [u8],
}

impl WordReader<'_> {
    fn word(&self, offset: usize) -> Result<u32, TableError> {
        let end = offset + 4;
        let chunk = self.bytes.get(offset..end).ok_or(TableError::Truncated {
            needed: end,
            len: self.bytes.len(),
        })?;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

fn read_name(blob: &[u8], offset: u32) -> Result<String, TableError> {
    let tail = blob
        .get(offset as usize..)
        .filter(|tail| !tail.is_empty())
        .ok_or(TableError::NameOutOfRange { offset })?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(TableError::UnterminatedName { offset })?;
    std::str::from_utf8(&tail[..len])
        .map(str::to_owned)
        .map_err(|_| TableError::InvalidName { offset })
}

/// Deduplicating NUL-terminated string blob.
#[derive(Default)]
struct NameBlob {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl NameBlob {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_owned(), offset);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(op_id: u32, kind: ResumeKind, sig: u32, label: &str) -> OpEntry {
        OpEntry {
            op_index: 0,
            op_id,
            resume_kind: kind,
            signature_hash: sig,
            label: label.to_string(),
        }
    }

    fn sample() -> EffectTable {
        EffectTable::new(vec![
            EffectEntry {
                id: EffectId::from_raw(0x0000_0001_0000_0002),
                label: "app/io/Async".to_string(),
                ops: vec![op(0, ResumeKind::Resume, 0xaa, "await")],
            },
            EffectEntry {
                id: EffectId::from_raw(0x0000_0003_0000_0004),
                label: "app/core/State".to_string(),
                ops: vec![
                    op(0, ResumeKind::Tail, 0x10, "get"),
                    op(1, ResumeKind::Tail, 0x20, "put"),
                ],
            },
        ])
    }

    #[test]
    fn test_new_assigns_dense_indices() {
        let table = sample();
        let indices: Vec<u32> = table.ops().map(|(_, op)| op.op_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(table.op_count(), 3);
    }

    #[test]
    fn test_v1_layout_words() {
        let bytes = sample().encode(TableVersion::V1);
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), 1);
        assert_eq!(word(1), 2);
        assert_eq!(word(2), 3);
        // first effect header: id lo, name, ops_off, count
        assert_eq!(word(3), 2);
        assert_eq!(word(5), 0);
        assert_eq!(word(6), 1);
        // second effect header starts at op 1 -> byte offset 12
        assert_eq!(word(9), 12);
        assert_eq!(word(10), 2);
        // ops start at word 11; the second op's resume kind is Tail
        assert_eq!(word(15), 1);
        assert!(bytes.len() > 12 + 2 * 16 + 3 * 12);
    }

    #[test]
    fn test_v2_decode_preserves_identities() {
        let table = sample();
        let decoded = EffectTable::decode(&table.encode(TableVersion::V2)).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_v1_decode_truncates_ids() {
        let decoded = EffectTable::decode(&sample().encode(TableVersion::V1)).unwrap();
        assert_eq!(decoded.effects()[1].id, EffectId::from_parts(0, 4));
        assert_eq!(decoded.effects()[1].ops[1].label, "put");
        assert_eq!(decoded.effects()[1].ops[1].signature_hash, 0);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = sample().encode(TableVersion::V2);
        let err = EffectTable::decode(&bytes[..40]).unwrap_err();
        assert!(matches!(err, TableError::Truncated { .. }));
        assert!(err.to_string().contains("truncated"));
        assert!(matches!(
            EffectTable::decode(&[1, 0]),
            Err(TableError::Truncated { needed: 4, len: 2 })
        ));
    }

    #[test]
    fn test_decode_rejects_misaligned_ops_offset() {
        let mut bytes = sample().encode(TableVersion::V1);
        // ops_off of the second effect lives in word 9
        bytes[36..40].copy_from_slice(&5u32.to_le_bytes());
        let err = EffectTable::decode(&bytes).unwrap_err();
        assert_eq!(err, TableError::Misaligned { effect: 1, offset: 5 });
        assert!(err.to_string().contains("misaligned"));
    }

    #[test]
    fn test_decode_rejects_op_range_overflow() {
        let mut bytes = sample().encode(TableVersion::V1);
        // op count of the second effect: 2 -> 3
        bytes[40..44].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            EffectTable::decode(&bytes),
            Err(TableError::OpRange { effect: 1, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = sample().encode(TableVersion::V2);
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            EffectTable::decode(&bytes),
            Err(TableError::UnsupportedVersion(7))
        );
    }

    #[test]
    fn test_resolve_suffix() {
        let table = sample();
        assert_eq!(table.resolve_suffix("Async.await"), vec![0]);
        assert_eq!(table.resolve_suffix("core/State.put"), vec![2]);
        assert_eq!(table.resolve_suffix("State.missing"), Vec::<u32>::new());
        assert_eq!(table.resolve_suffix("nodot"), Vec::<u32>::new());
    }

    #[test]
    fn test_find_by_triple() {
        let table = sample();
        let state = EffectId::from_raw(0x0000_0003_0000_0004);
        assert_eq!(table.find(state, 1, 0x20), Some(2));
        assert_eq!(table.find(state, 1, 0x21), None);
    }

    #[test]
    fn test_render_listing() {
        insta::assert_snapshot!(sample().render(), @r###"
        effect 0000000100000002 app/io/Async
          [0] await#0 resume sig=000000aa
        effect 0000000300000004 app/core/State
          [1] get#0 tail sig=00000010
          [2] put#1 tail sig=00000020
        "###);
    }

    #[test]
    fn test_empty_table_round_trips() {
        let table = EffectTable::default();
        let bytes = table.encode(TableVersion::V2);
        assert_eq!(bytes.len(), 12);
        assert!(EffectTable::decode(&bytes).unwrap().is_empty());
    }
}
