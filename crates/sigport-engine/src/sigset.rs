//! Signature set construction and indexing.
//!
//! A [`SignatureSet`] owns everything derived from one binary: the
//! descriptor collection, the four per-class key indices, and the call
//! graph. It is built once and read-only afterwards; the matcher takes
//! two sets and never mutates either.
//!
//! Collision policy: a Formal or Fuzzy key claimed by two different
//! functions in the same binary is ambiguous and is discarded from that
//! binary's index outright: bound to neither function, counted in the
//! set's statistics. String and Immediate keys may legitimately map to
//! several functions; their uniqueness is enforced at match time.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use sigport_core::{AnalysisSource, CancelToken, Error, FunctionDescriptor, Result};

use crate::callgraph::CallGraph;
use crate::classify::{Classifier, SignatureBundle, SignatureConfig};
use crate::extract::Extractor;

/// The collected, deduplicated signatures for every function in one
/// binary, indexed for O(1) lookup by key.
///
/// The serialized shape is the descriptor collection plus the policy it
/// was classified under; indices, bundles, and the call graph are derived
/// state, skipped during serialization and rebuilt on load (see
/// [`SignatureSet::from_json`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureSet {
    /// Policy the set was built under.
    config: SignatureConfig,

    /// Descriptor per function address.
    descriptors: BTreeMap<u64, FunctionDescriptor>,

    /// Functions the extractor had to skip.
    skipped: usize,

    /// Formal key value -> unique owning address.
    #[serde(skip)]
    pub(crate) formal: BTreeMap<u64, u64>,

    /// Fuzzy key value -> unique owning address.
    #[serde(skip)]
    pub(crate) fuzzy: BTreeMap<u64, u64>,

    /// String key value -> candidate addresses.
    #[serde(skip)]
    pub(crate) strings: BTreeMap<u64, BTreeSet<u64>>,

    /// Immediate key value -> candidate addresses.
    #[serde(skip)]
    pub(crate) immediates: BTreeMap<u64, BTreeSet<u64>>,

    /// Per-function key bundles.
    #[serde(skip)]
    pub(crate) bundles: BTreeMap<u64, SignatureBundle>,

    /// Formal keys discarded as in-binary duplicates.
    #[serde(skip)]
    ambiguous_formal: usize,

    /// Fuzzy keys discarded as in-binary duplicates.
    #[serde(skip)]
    ambiguous_fuzzy: usize,

    #[serde(skip)]
    call_graph: CallGraph,
}

impl SignatureSet {
    /// Build a signature set for one binary: extract every function the
    /// provider enumerates, classify, index, and derive the call graph.
    ///
    /// Extraction-level failures skip the function and continue; the skip
    /// count is retained for reporting. Fails with
    /// [`Error::DuplicateAddress`] if the provider hands back two
    /// functions at the same address, and with [`Error::Cancelled`] on
    /// cooperative abort (nothing partial is returned).
    pub fn build<S: AnalysisSource>(
        source: &S,
        config: SignatureConfig,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let start = Instant::now();
        let extractor = Extractor::new(source, &config);
        let (descriptors, skipped) = extractor.extract_all(cancel)?;
        let set = Self::from_descriptors(descriptors, config, skipped)?;
        info!(
            "generated {} formal and {} fuzzy signatures for {} functions in {:.2}s ({} skipped)",
            set.formal.len(),
            set.fuzzy.len(),
            set.descriptors.len(),
            start.elapsed().as_secs_f64(),
            set.skipped,
        );
        Ok(set)
    }

    /// Build a set from already-extracted descriptors.
    pub fn from_descriptors(
        descriptors: Vec<FunctionDescriptor>,
        config: SignatureConfig,
        skipped: usize,
    ) -> Result<Self> {
        let mut set = Self {
            config,
            skipped,
            ..Self::default()
        };
        for desc in descriptors {
            let address = desc.address;
            if set.descriptors.insert(address, desc).is_some() {
                return Err(Error::DuplicateAddress { address });
            }
        }
        set.rebuild()?;
        Ok(set)
    }

    /// Recompute all derived state (indices, bundles, callers, call
    /// graph) from the descriptor collection. Called after construction
    /// and after deserialization.
    pub fn rebuild(&mut self) -> Result<()> {
        self.formal.clear();
        self.fuzzy.clear();
        self.strings.clear();
        self.immediates.clear();
        self.bundles.clear();
        self.ambiguous_formal = 0;
        self.ambiguous_fuzzy = 0;

        // Derive callers by inverting every call sequence.
        let mut caller_edges: Vec<(u64, u64)> = Vec::new();
        for desc in self.descriptors.values() {
            for &target in &desc.call_targets {
                if self.descriptors.contains_key(&target) {
                    caller_edges.push((target, desc.address));
                }
            }
        }
        for desc in self.descriptors.values_mut() {
            desc.callers.clear();
        }
        for (callee, caller) in caller_edges {
            if let Some(desc) = self.descriptors.get_mut(&callee) {
                desc.callers.insert(caller);
            }
        }

        // Classify every descriptor; degenerate ones (possible in
        // deserialized input) are dropped and counted as skipped.
        let classifier = Classifier::new(&self.config);
        let classified: Vec<(u64, Result<SignatureBundle>)> = self
            .descriptors
            .par_iter()
            .map(|(&address, desc)| (address, classifier.classify(desc)))
            .collect();

        let mut degenerate = Vec::new();
        let mut formal_dups = BTreeSet::new();
        let mut fuzzy_dups = BTreeSet::new();
        for (address, result) in classified {
            let bundle = match result {
                Ok(bundle) => bundle,
                Err(Error::InvalidDescriptor { .. }) => {
                    degenerate.push(address);
                    continue;
                }
                Err(err) => return Err(err),
            };

            insert_unique(&mut self.formal, &mut formal_dups, bundle.formal.value, address);
            insert_unique(&mut self.fuzzy, &mut fuzzy_dups, bundle.fuzzy.value, address);
            for key in &bundle.strings {
                self.strings.entry(key.value).or_default().insert(address);
            }
            for key in &bundle.immediates {
                self.immediates.entry(key.value).or_default().insert(address);
            }
            self.bundles.insert(address, bundle);
        }
        self.ambiguous_formal = formal_dups.len();
        self.ambiguous_fuzzy = fuzzy_dups.len();

        for address in degenerate {
            self.descriptors.remove(&address);
            self.skipped += 1;
        }

        self.call_graph = CallGraph::from_descriptors(self.descriptors.values());
        Ok(())
    }

    /// Check cross-structure invariants: every index entry and call-graph
    /// edge must point at a live descriptor, and caller/callee links must
    /// be symmetric. A violation means the set was assembled or
    /// deserialized incorrectly and is unsound to match against.
    pub fn validate(&self) -> Result<()> {
        for (&key, &address) in self.formal.iter().chain(self.fuzzy.iter()) {
            if !self.descriptors.contains_key(&address) {
                return Err(Error::InvalidInput(format!(
                    "index key {key:#x} refers to missing function {address:#x}"
                )));
            }
        }
        for candidates in self.strings.values().chain(self.immediates.values()) {
            for &address in candidates {
                if !self.descriptors.contains_key(&address) {
                    return Err(Error::InvalidInput(format!(
                        "index candidate refers to missing function {address:#x}"
                    )));
                }
            }
        }
        for desc in self.descriptors.values() {
            for &caller in &desc.callers {
                let ok = self
                    .descriptors
                    .get(&caller)
                    .is_some_and(|c| c.calls(desc.address));
                if !ok {
                    return Err(Error::InvalidInput(format!(
                        "dangling caller {caller:#x} on function {:#x}",
                        desc.address
                    )));
                }
            }
            for &target in &desc.call_targets {
                if let Some(callee) = self.descriptors.get(&target) {
                    if !callee.callers.contains(&desc.address) {
                        return Err(Error::InvalidInput(format!(
                            "asymmetric call edge {:#x} -> {target:#x}",
                            desc.address
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of functions in the set.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the set contains no functions.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The policy the set was built under.
    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    /// Functions the extractor skipped.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Descriptor for one function.
    pub fn descriptor(&self, address: u64) -> Option<&FunctionDescriptor> {
        self.descriptors.get(&address)
    }

    /// All function addresses, ascending.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.descriptors.keys().copied()
    }

    /// The key bundle for one function.
    pub fn bundle(&self, address: u64) -> Option<&SignatureBundle> {
        self.bundles.get(&address)
    }

    /// The unique owner of a Formal key, if the key survived the
    /// collision policy.
    pub fn formal_lookup(&self, key_value: u64) -> Option<u64> {
        self.formal.get(&key_value).copied()
    }

    /// The unique owner of a Fuzzy key, if the key survived the collision
    /// policy.
    pub fn fuzzy_lookup(&self, key_value: u64) -> Option<u64> {
        self.fuzzy.get(&key_value).copied()
    }

    /// Candidate functions for a String key.
    pub fn string_lookup(&self, key_value: u64) -> Option<&BTreeSet<u64>> {
        self.strings.get(&key_value)
    }

    /// Candidate functions for an Immediate key.
    pub fn immediate_lookup(&self, key_value: u64) -> Option<&BTreeSet<u64>> {
        self.immediates.get(&key_value)
    }

    /// The derived call graph.
    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    /// Summary statistics for reporting.
    pub fn stats(&self) -> SetStats {
        SetStats {
            functions: self.descriptors.len(),
            skipped: self.skipped,
            formal_keys: self.formal.len(),
            fuzzy_keys: self.fuzzy.len(),
            string_keys: self.strings.len(),
            immediate_keys: self.immediates.len(),
            ambiguous_formal: self.ambiguous_formal,
            ambiguous_fuzzy: self.ambiguous_fuzzy,
        }
    }

    /// Serialize the set's persistent shape to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    /// Deserialize a set from JSON and rebuild its derived state.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut set: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidInput(e.to_string()))?;
        set.rebuild()?;
        Ok(set)
    }
}

fn insert_unique(
    index: &mut BTreeMap<u64, u64>,
    dups: &mut BTreeSet<u64>,
    key: u64,
    address: u64,
) {
    if dups.contains(&key) {
        return;
    }
    if index.remove(&key).is_some() {
        // A second claimant makes the key ambiguous; neither function
        // keeps it, and it never re-enters the index.
        dups.insert(key);
    } else {
        index.insert(key, address);
    }
}

/// Statistics about a signature set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStats {
    /// Functions with descriptors.
    pub functions: usize,
    /// Functions skipped during extraction.
    pub skipped: usize,
    /// Unique Formal keys.
    pub formal_keys: usize,
    /// Unique Fuzzy keys.
    pub fuzzy_keys: usize,
    /// Distinct String keys.
    pub string_keys: usize,
    /// Distinct Immediate keys.
    pub immediate_keys: usize,
    /// Formal keys discarded as ambiguous.
    pub ambiguous_formal: usize,
    /// Fuzzy keys discarded as ambiguous.
    pub ambiguous_fuzzy: usize,
}

impl std::fmt::Display for SetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Functions: {} ({} skipped)", self.functions, self.skipped)?;
        writeln!(
            f,
            "Formal keys: {} ({} ambiguous)",
            self.formal_keys, self.ambiguous_formal
        )?;
        writeln!(
            f,
            "Fuzzy keys: {} ({} ambiguous)",
            self.fuzzy_keys, self.ambiguous_fuzzy
        )?;
        writeln!(f, "String keys: {}", self.string_keys)?;
        writeln!(f, "Immediate keys: {}", self.immediate_keys)?;
        Ok(())
    }
}
