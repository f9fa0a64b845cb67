//! Normalized per-function descriptors.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A normalized description of one analyzed function.
///
/// Descriptors are extracted once per function and immutable afterwards.
/// All address-dependent operand bits have been masked out of
/// `instruction_bytes`, and data references are stored relative to the
/// function's own address, so two structurally identical functions at
/// different load addresses produce identical descriptors (apart from
/// `address` itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Entry address; unique within one binary's descriptor collection.
    pub address: u64,

    /// Symbol name, if the host knows one. Populated on the trusted side
    /// so identifications can carry names to the annotation layer.
    pub name: Option<String>,

    /// Number of decoded instructions.
    pub instruction_count: usize,

    /// Ordered normalized opcode bytes (relocation bits cleared).
    pub instruction_bytes: Vec<u8>,

    /// Referenced data addresses as offsets relative to `address`.
    pub data_refs: BTreeSet<i64>,

    /// Referenced string literal contents (the bytes, not the addresses).
    pub string_refs: BTreeSet<String>,

    /// Qualifying immediate operand values (policy-filtered).
    pub immediate_refs: BTreeSet<u64>,

    /// Ordered sequence of call targets; duplicates allowed, order is the
    /// call position used by propagation.
    pub call_targets: Vec<u64>,

    /// Addresses that call this function. Derived by the signature-set
    /// builder, never supplied by the host.
    #[serde(default)]
    pub callers: BTreeSet<u64>,
}

impl FunctionDescriptor {
    /// Returns true if the function calls the given address at least once.
    pub fn calls(&self, target: u64) -> bool {
        self.call_targets.contains(&target)
    }

    /// Call positions (0-based) at which `target` is called.
    pub fn call_positions(&self, target: u64) -> Vec<usize> {
        self.call_targets
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == target)
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns true if the function references any string literal.
    pub fn has_string_refs(&self) -> bool {
        !self.string_refs.is_empty()
    }
}
