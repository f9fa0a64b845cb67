//! Call graph derived from descriptor call sequences.
//!
//! Outgoing edges keep the order of the call sites (the call *position*),
//! because propagation disambiguates callees positionally. Incoming edges
//! are derived by inverting every descriptor's call sequence.

use std::collections::{BTreeMap, BTreeSet};

use sigport_core::FunctionDescriptor;

/// Caller/callee relationships for one binary's functions.
///
/// Only addresses with a descriptor become nodes; calls to external or
/// unanalyzed code keep their position in the caller's sequence but grow
/// no edge.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    /// Ordered call sequence per caller (positions preserved).
    outgoing: BTreeMap<u64, Vec<u64>>,
    /// Callers per callee.
    incoming: BTreeMap<u64, BTreeSet<u64>>,
}

impl CallGraph {
    /// Build a call graph from a descriptor collection.
    pub fn from_descriptors<'a, I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = &'a FunctionDescriptor> + Clone,
    {
        let known: BTreeSet<u64> = descriptors
            .clone()
            .into_iter()
            .map(|d| d.address)
            .collect();

        let mut graph = Self::default();
        for desc in descriptors {
            graph
                .outgoing
                .insert(desc.address, desc.call_targets.clone());
            for &target in &desc.call_targets {
                if known.contains(&target) {
                    graph.incoming.entry(target).or_default().insert(desc.address);
                }
            }
        }
        graph
    }

    /// Ordered call targets of a function (empty if unknown).
    pub fn callees(&self, caller: u64) -> &[u64] {
        self.outgoing.get(&caller).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Callers of a function.
    pub fn callers(&self, callee: u64) -> impl Iterator<Item = u64> + '_ {
        self.incoming
            .get(&callee)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Positions (0-based) at which `caller` calls `callee`.
    pub fn call_positions(&self, caller: u64, callee: u64) -> Vec<usize> {
        self.callees(caller)
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == callee)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of functions with at least one recorded call sequence.
    pub fn node_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Total number of internal call edges.
    pub fn edge_count(&self) -> usize {
        self.incoming.values().map(BTreeSet::len).sum()
    }
}
