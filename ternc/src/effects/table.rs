//! Effect table emission.
//!
//! Converts a [`FinalRegistry`] into the `tern_abi` table model and its
//! binary section. Entries are already sorted by `(effect id, op id,
//! signature hash)`, so consecutive entries with the same effect id form
//! one effect header and the table's op indices equal the registry's.

use std::collections::HashMap;

use tern_abi::{EffectEntry, EffectId, EffectTable, OpEntry, TableVersion};

use super::registry::FinalRegistry;

/// Build the table model of a finalized registry.
pub fn build_table(registry: &FinalRegistry) -> EffectTable {
    let mut labels: HashMap<EffectId, &str> = HashMap::new();
    for info in registry.effects() {
        labels.entry(info.id).or_insert(info.label.as_str());
    }

    let mut effects: Vec<EffectEntry> = Vec::new();
    for (op_index, key, resume_kind, name) in registry.entries() {
        let op = OpEntry {
            op_index,
            op_id: key.op_id,
            resume_kind,
            signature_hash: key.signature_hash,
            label: name.to_string(),
        };
        match effects.last_mut() {
            Some(last) if last.id == key.effect => last.ops.push(op),
            _ => effects.push(EffectEntry {
                id: key.effect,
                label: labels
                    .get(&key.effect)
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| key.effect.to_string()),
                ops: vec![op],
            }),
        }
    }
    EffectTable::new(effects)
}

/// The custom-section payload for a finalized registry.
pub fn section_bytes(registry: &FinalRegistry, version: TableVersion) -> Vec<u8> {
    build_table(registry).encode(version)
}
