//! Cross-binary matching passes.
//!
//! Runs the four signature classes in strict precedence order (Formal,
//! String, Immediate, Fuzzy), each pass considering only functions not
//! matched by an earlier pass. Within a pass, a key that resolves to more
//! than one live candidate on either side contributes nothing: the engine
//! never picks arbitrarily among equally-plausible candidates.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use sigport_core::{CancelToken, Result};

use crate::classify::{SignatureBundle, SignatureKey};
use crate::sigset::SignatureSet;

/// Ordinal match confidence, used only for conflict resolution.
///
/// Variant order is the aggregation precedence: a later variant beats an
/// earlier one. Formal evidence is strongest; propagation through the
/// call graph is weakest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Identified through call-graph propagation.
    Propagated,
    /// Matched by structural resemblance only.
    Fuzzy,
    /// Matched through unique immediate-value references.
    Immediate,
    /// Matched through unique string references.
    String,
    /// Byte-exact match modulo relocations.
    Formal,
}

impl Confidence {
    /// Human-readable confidence name.
    pub fn name(&self) -> &'static str {
        match self {
            Confidence::Formal => "formal",
            Confidence::String => "string",
            Confidence::Immediate => "immediate",
            Confidence::Fuzzy => "fuzzy",
            Confidence::Propagated => "propagated",
        }
    }
}

/// One target-function identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Address in the target (unnamed) binary.
    pub target: u64,
    /// Corresponding address in the source (trusted) binary.
    pub source: u64,
    /// Evidence class that produced the record.
    pub confidence: Confidence,
}

/// Matches one trusted signature set against an unnamed one.
pub struct Matcher<'a> {
    source: &'a SignatureSet,
    target: &'a SignatureSet,
}

impl<'a> Matcher<'a> {
    /// Create a matcher over two sets, validating both up front.
    pub fn new(source: &'a SignatureSet, target: &'a SignatureSet) -> Result<Self> {
        source.validate()?;
        target.validate()?;
        Ok(Self { source, target })
    }

    /// Run all four passes and return the records found, in pass order.
    /// Neither input set is mutated.
    pub fn run(&self, cancel: &CancelToken) -> Result<Vec<MatchRecord>> {
        let start = Instant::now();
        let mut records = Vec::new();
        let mut matched_targets = BTreeSet::new();
        let mut matched_sources = BTreeSet::new();

        cancel.checkpoint()?;
        let formal = self.exact_pass(
            Confidence::Formal,
            &self.source.formal,
            &self.target.formal,
            &matched_targets,
            &matched_sources,
        );
        apply(formal, &mut records, &mut matched_targets, &mut matched_sources);

        cancel.checkpoint()?;
        let strings = self.reference_pass(
            Confidence::String,
            |bundle| bundle.strings.as_slice(),
            &self.source.strings,
            &self.target.strings,
            &matched_targets,
            &matched_sources,
        );
        apply(strings, &mut records, &mut matched_targets, &mut matched_sources);

        cancel.checkpoint()?;
        let immediates = self.reference_pass(
            Confidence::Immediate,
            |bundle| bundle.immediates.as_slice(),
            &self.source.immediates,
            &self.target.immediates,
            &matched_targets,
            &matched_sources,
        );
        apply(immediates, &mut records, &mut matched_targets, &mut matched_sources);

        cancel.checkpoint()?;
        let fuzzy = self.exact_pass(
            Confidence::Fuzzy,
            &self.source.fuzzy,
            &self.target.fuzzy,
            &matched_targets,
            &matched_sources,
        );
        apply(fuzzy, &mut records, &mut matched_targets, &mut matched_sources);

        info!(
            "found {} matches in {:.2}s",
            records.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(records)
    }

    /// Formal/Fuzzy pass: both indices already hold only in-binary-unique
    /// keys, so a key present on both sides is a one-to-one match.
    fn exact_pass(
        &self,
        confidence: Confidence,
        source_index: &BTreeMap<u64, u64>,
        target_index: &BTreeMap<u64, u64>,
        matched_targets: &BTreeSet<u64>,
        matched_sources: &BTreeSet<u64>,
    ) -> Vec<MatchRecord> {
        target_index
            .iter()
            .filter(|(_, taddr)| !matched_targets.contains(*taddr))
            .filter_map(|(key, &taddr)| {
                let &saddr = source_index.get(key)?;
                if matched_sources.contains(&saddr) {
                    return None;
                }
                Some(MatchRecord {
                    target: taddr,
                    source: saddr,
                    confidence,
                })
            })
            .collect()
    }

    /// String/Immediate pass: every shared key with exactly one live
    /// candidate nominates that candidate; all of a function's
    /// nominations must agree, and the nominated source must nominate
    /// this target right back. The candidate scan is read-only and runs
    /// in parallel; application is sequential.
    fn reference_pass<F>(
        &self,
        confidence: Confidence,
        keys_of: F,
        source_index: &BTreeMap<u64, BTreeSet<u64>>,
        target_index: &BTreeMap<u64, BTreeSet<u64>>,
        matched_targets: &BTreeSet<u64>,
        matched_sources: &BTreeSet<u64>,
    ) -> Vec<MatchRecord>
    where
        F: Fn(&SignatureBundle) -> &[SignatureKey] + Sync,
    {
        let unmatched: Vec<(u64, &SignatureBundle)> = self
            .target
            .bundles
            .iter()
            .filter(|(addr, _)| !matched_targets.contains(*addr))
            .map(|(&addr, bundle)| (addr, bundle))
            .collect();

        let mut found: Vec<MatchRecord> = unmatched
            .par_iter()
            .filter_map(|&(taddr, bundle)| {
                let nominee = nominate(keys_of(bundle), source_index, matched_sources)?;
                let source_bundle = self.source.bundle(nominee)?;
                let back = nominate(keys_of(source_bundle), target_index, matched_targets)?;
                (back == taddr).then_some(MatchRecord {
                    target: taddr,
                    source: nominee,
                    confidence,
                })
            })
            .collect();

        found.sort_by_key(|record| record.target);
        found
    }
}

/// Intersect a function's keys against the other side's index: keys with
/// several live candidates contribute nothing, singleton keys must all
/// nominate the same function, disagreement nominates nobody.
fn nominate(
    keys: &[SignatureKey],
    index: &BTreeMap<u64, BTreeSet<u64>>,
    excluded: &BTreeSet<u64>,
) -> Option<u64> {
    let mut nominee = None;
    for key in keys {
        let Some(candidates) = index.get(&key.value) else {
            continue;
        };
        let mut live = candidates.iter().filter(|addr| !excluded.contains(*addr));
        let first = match (live.next(), live.next()) {
            (Some(&first), None) => first,
            _ => continue,
        };
        match nominee {
            None => nominee = Some(first),
            Some(current) if current == first => {}
            Some(_) => return None,
        }
    }
    nominee
}

fn apply(
    found: Vec<MatchRecord>,
    records: &mut Vec<MatchRecord>,
    matched_targets: &mut BTreeSet<u64>,
    matched_sources: &mut BTreeSet<u64>,
) {
    for record in found {
        if matched_targets.contains(&record.target) || matched_sources.contains(&record.source) {
            continue;
        }
        matched_targets.insert(record.target);
        matched_sources.insert(record.source);
        records.push(record);
    }
}
