//! Result aggregation.
//!
//! Merges the records from all passes and from propagation into the final
//! target→identification table: at most one live record per target
//! address, higher confidence replacing lower, equal confidence keeping
//! the record from the earlier pass. The report also carries the
//! unmatched remainder and per-class counts, so a run over an ordinary
//! binary always completes with a best-effort result instead of failing.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::matcher::{Confidence, MatchRecord};
use crate::sigset::SignatureSet;

/// One entry of the final identification table, ready for an annotation
/// layer to apply: the target address, its source counterpart, the source
/// function's name if the trusted binary carried one, and the evidence
/// class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    /// Address in the target binary.
    pub target: u64,
    /// Corresponding address in the source binary.
    pub source: u64,
    /// Name of the source function, if known.
    pub name: Option<String>,
    /// Evidence class of the match.
    pub confidence: Confidence,
}

/// Per-confidence match counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCounts {
    pub formal: usize,
    pub string: usize,
    pub immediate: usize,
    pub fuzzy: usize,
    pub propagated: usize,
}

impl MatchCounts {
    /// Total matched functions.
    pub fn total(&self) -> usize {
        self.formal + self.string + self.immediate + self.fuzzy + self.propagated
    }
}

/// The immutable final output of a matching run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    table: BTreeMap<u64, MatchRecord>,
    source_names: BTreeMap<u64, String>,
    unmatched: Vec<u64>,
    counts: MatchCounts,
    skipped_source: usize,
    skipped_target: usize,
}

impl MatchReport {
    /// The record for one target address, if any.
    pub fn record(&self, target: u64) -> Option<&MatchRecord> {
        self.table.get(&target)
    }

    /// All records, ascending by target address.
    pub fn records(&self) -> impl Iterator<Item = &MatchRecord> {
        self.table.values()
    }

    /// Number of matched target functions.
    pub fn matched_count(&self) -> usize {
        self.table.len()
    }

    /// Target addresses with no identification, ascending.
    pub fn unmatched(&self) -> &[u64] {
        &self.unmatched
    }

    /// Per-confidence counts.
    pub fn counts(&self) -> MatchCounts {
        self.counts
    }

    /// Functions skipped while building the source set.
    pub fn skipped_source(&self) -> usize {
        self.skipped_source
    }

    /// Functions skipped while building the target set.
    pub fn skipped_target(&self) -> usize {
        self.skipped_target
    }

    /// The identification tuples an annotation layer consumes.
    pub fn identifications(&self) -> Vec<Identification> {
        self.table
            .values()
            .map(|record| Identification {
                target: record.target,
                source: record.source,
                name: self.source_names.get(&record.source).cloned(),
                confidence: record.confidence,
            })
            .collect()
    }
}

impl std::fmt::Display for MatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Matched {} functions, {} unmatched",
            self.matched_count(),
            self.unmatched.len()
        )?;
        writeln!(f, "  formal: {}", self.counts.formal)?;
        writeln!(f, "  string: {}", self.counts.string)?;
        writeln!(f, "  immediate: {}", self.counts.immediate)?;
        writeln!(f, "  fuzzy: {}", self.counts.fuzzy)?;
        writeln!(f, "  propagated: {}", self.counts.propagated)?;
        if self.skipped_source + self.skipped_target > 0 {
            writeln!(
                f,
                "Skipped {} source / {} target functions during extraction",
                self.skipped_source, self.skipped_target
            )?;
        }
        Ok(())
    }
}

/// Merge match records into the final table.
///
/// Records arrive in pass order, so on equal confidence the incumbent
/// (earlier pass) wins; a strictly higher confidence replaces a lower
/// one, never the reverse.
pub fn aggregate(
    records: Vec<MatchRecord>,
    source: &SignatureSet,
    target: &SignatureSet,
) -> MatchReport {
    let mut table: BTreeMap<u64, MatchRecord> = BTreeMap::new();
    for record in records {
        match table.entry(record.target) {
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
            Entry::Occupied(mut entry) => {
                if record.confidence > entry.get().confidence {
                    entry.insert(record);
                }
            }
        }
    }

    let mut counts = MatchCounts::default();
    let mut source_names = BTreeMap::new();
    for record in table.values() {
        match record.confidence {
            Confidence::Formal => counts.formal += 1,
            Confidence::String => counts.string += 1,
            Confidence::Immediate => counts.immediate += 1,
            Confidence::Fuzzy => counts.fuzzy += 1,
            Confidence::Propagated => counts.propagated += 1,
        }
        if let Some(name) = source
            .descriptor(record.source)
            .and_then(|desc| desc.name.clone())
        {
            source_names.insert(record.source, name);
        }
    }

    let unmatched = target
        .addresses()
        .filter(|address| !table.contains_key(address))
        .collect();

    MatchReport {
        table,
        source_names,
        unmatched,
        counts,
        skipped_source: source.skipped(),
        skipped_target: target.skipped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::SignatureConfig;
    use sigport_core::{CancelToken, FunctionDescriptor, InMemorySource, RawFunction, RawInstruction};

    fn record(target: u64, source: u64, confidence: Confidence) -> MatchRecord {
        MatchRecord {
            target,
            source,
            confidence,
        }
    }

    fn set_with(functions: &[(u64, &[u8])]) -> SignatureSet {
        let mut source = InMemorySource::new();
        for &(address, bytes) in functions {
            source.insert(RawFunction::new(
                address,
                vec![RawInstruction::plain(bytes.to_vec())],
            ));
        }
        SignatureSet::build(&source, SignatureConfig::default(), &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_higher_confidence_replaces_lower() {
        let source = set_with(&[(0x1000, &[0x55, 0x11])]);
        let target = set_with(&[(0x4000, &[0x55, 0x11])]);

        let report = aggregate(
            vec![
                record(0x4000, 0x1000, Confidence::Propagated),
                record(0x4000, 0x1000, Confidence::Formal),
            ],
            &source,
            &target,
        );
        assert_eq!(
            report.record(0x4000).unwrap().confidence,
            Confidence::Formal
        );
        assert_eq!(report.counts().formal, 1);
        assert_eq!(report.counts().total(), 1);
    }

    #[test]
    fn test_lower_confidence_never_replaces() {
        let source = set_with(&[(0x1000, &[0x55, 0x11])]);
        let target = set_with(&[(0x4000, &[0x55, 0x11])]);

        let report = aggregate(
            vec![
                record(0x4000, 0x1000, Confidence::String),
                record(0x4000, 0x1000, Confidence::Fuzzy),
            ],
            &source,
            &target,
        );
        assert_eq!(
            report.record(0x4000).unwrap().confidence,
            Confidence::String
        );
    }

    #[test]
    fn test_equal_confidence_keeps_earlier() {
        let source = set_with(&[(0x1000, &[0x55, 0x11]), (0x2000, &[0x55, 0x22])]);
        let target = set_with(&[(0x4000, &[0x55, 0x11])]);

        let report = aggregate(
            vec![
                record(0x4000, 0x1000, Confidence::Fuzzy),
                record(0x4000, 0x2000, Confidence::Fuzzy),
            ],
            &source,
            &target,
        );
        assert_eq!(report.record(0x4000).unwrap().source, 0x1000);
    }

    #[test]
    fn test_unmatched_reported() {
        let source = set_with(&[(0x1000, &[0x55, 0x11])]);
        let target = set_with(&[(0x4000, &[0x55, 0x11]), (0x5000, &[0x66, 0x22])]);

        let report = aggregate(
            vec![record(0x4000, 0x1000, Confidence::Formal)],
            &source,
            &target,
        );
        assert_eq!(report.unmatched(), &[0x5000]);
        assert_eq!(report.matched_count(), 1);
    }

    #[test]
    fn test_identifications_carry_names() {
        let mut raw = InMemorySource::new();
        raw.insert(
            RawFunction::new(0x1000, vec![RawInstruction::plain(vec![0x55, 0x11])])
                .with_name("checksum_update"),
        );
        let source =
            SignatureSet::build(&raw, SignatureConfig::default(), &CancelToken::new()).unwrap();
        let target = set_with(&[(0x4000, &[0x55, 0x11])]);

        let report = aggregate(
            vec![record(0x4000, 0x1000, Confidence::Formal)],
            &source,
            &target,
        );
        let idents = report.identifications();
        assert_eq!(idents.len(), 1);
        assert_eq!(idents[0].name.as_deref(), Some("checksum_update"));
    }

    #[test]
    fn test_skip_counts_surface() {
        let source = SignatureSet::from_descriptors(
            Vec::<FunctionDescriptor>::new(),
            SignatureConfig::default(),
            3,
        )
        .unwrap();
        let target = set_with(&[]);

        let report = aggregate(Vec::new(), &source, &target);
        assert_eq!(report.skipped_source(), 3);
        assert_eq!(report.skipped_target(), 0);
    }
}
