//! Call-graph propagation of confirmed matches.
//!
//! A function identified by strong evidence bootstraps identification of
//! its neighbors: if `foo` is matched and calls `bar` at the same call
//! position where its source counterpart calls `bar'`, and both ends are
//! otherwise unmatched, `bar` is identified by association. Runs to a
//! fixpoint as an explicit scan loop: each full scan may add matches,
//! and the process stops when a scan adds none. Matches are only ever
//! added, never retracted, so termination is bounded by the unmatched
//! function count.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use sigport_core::{CancelToken, Result};

use crate::matcher::{Confidence, MatchRecord};
use crate::sigset::SignatureSet;

/// Expand a match set through the two call graphs until no further
/// function can be identified. Returns a superset of `matches`; every
/// added record carries [`Confidence::Propagated`].
///
/// A candidate pairing is accepted only when it is the sole plausible
/// counterpart: proposed for exactly one source and exactly one target
/// this scan. Conflicting proposals are dropped and reconsidered on the
/// next scan, once other matches may have resolved the ambiguity.
pub fn propagate(
    matches: Vec<MatchRecord>,
    source: &SignatureSet,
    target: &SignatureSet,
    cancel: &CancelToken,
) -> Result<Vec<MatchRecord>> {
    let mut all = matches;
    let mut matched_targets: BTreeMap<u64, u64> =
        all.iter().map(|r| (r.target, r.source)).collect();
    let mut matched_sources: BTreeSet<u64> = all.iter().map(|r| r.source).collect();

    let mut scans = 0usize;
    let mut added_total = 0usize;
    loop {
        cancel.checkpoint()?;
        scans += 1;

        let mut proposals: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        let mut reverse: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();

        for (&taddr, &saddr) in &matched_targets {
            let (Some(dt), Some(ds)) = (target.descriptor(taddr), source.descriptor(saddr))
            else {
                continue;
            };

            // Callee direction: pair call sites positionally when the
            // matched functions have the same call count.
            if dt.call_targets.len() == ds.call_targets.len() {
                for (&tc, &sc) in dt.call_targets.iter().zip(&ds.call_targets) {
                    if matched_targets.contains_key(&tc) || matched_sources.contains(&sc) {
                        continue;
                    }
                    if target.descriptor(tc).is_none() || source.descriptor(sc).is_none() {
                        continue;
                    }
                    proposals.entry(tc).or_default().insert(sc);
                    reverse.entry(sc).or_default().insert(tc);
                }
            }

            // Caller direction: a single unmatched caller on each side,
            // calling at the same positions, is the only plausible pair.
            let t_callers: Vec<u64> = dt
                .callers
                .iter()
                .copied()
                .filter(|c| !matched_targets.contains_key(c))
                .collect();
            let s_callers: Vec<u64> = ds
                .callers
                .iter()
                .copied()
                .filter(|c| !matched_sources.contains(c))
                .collect();
            if let ([tc], [sc]) = (t_callers.as_slice(), s_callers.as_slice()) {
                let t_positions = target.call_graph().call_positions(*tc, taddr);
                let s_positions = source.call_graph().call_positions(*sc, saddr);
                if t_positions == s_positions {
                    proposals.entry(*tc).or_default().insert(*sc);
                    reverse.entry(*sc).or_default().insert(*tc);
                }
            }
        }

        let mut added = 0usize;
        for (&tc, sources) in &proposals {
            let Some(&sc) = sources.iter().next() else {
                continue;
            };
            if sources.len() != 1 {
                continue;
            }
            let unique_back = reverse.get(&sc).map(BTreeSet::len) == Some(1);
            if !unique_back
                || matched_targets.contains_key(&tc)
                || matched_sources.contains(&sc)
            {
                continue;
            }
            all.push(MatchRecord {
                target: tc,
                source: sc,
                confidence: Confidence::Propagated,
            });
            matched_targets.insert(tc, sc);
            matched_sources.insert(sc);
            added += 1;
        }

        added_total += added;
        if added == 0 {
            break;
        }
    }

    info!("propagated {added_total} matches in {scans} scans");
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::SignatureConfig;
    use crate::matcher::Matcher;
    use sigport_core::{InMemorySource, RawFunction, RawInstruction, RawOperand};

    fn leaf(address: u64, bytes: Vec<u8>) -> RawFunction {
        RawFunction::new(address, vec![RawInstruction::plain(bytes)])
    }

    fn caller(address: u64, bytes: Vec<u8>, targets: &[u64]) -> RawFunction {
        let mut insns = vec![RawInstruction::plain(bytes)];
        for &t in targets {
            insns.push(
                RawInstruction::plain(vec![0xE8, 0x00, 0x00, 0x00, 0x00])
                    .with_operand(RawOperand::Call { target: t }),
            );
        }
        RawFunction::new(address, insns)
    }

    fn build(source: &InMemorySource) -> SignatureSet {
        SignatureSet::build(source, SignatureConfig::default(), &CancelToken::new()).unwrap()
    }

    fn pipeline(source: &SignatureSet, target: &SignatureSet) -> Vec<MatchRecord> {
        let matches = Matcher::new(source, target)
            .unwrap()
            .run(&CancelToken::new())
            .unwrap();
        propagate(matches, source, target, &CancelToken::new()).unwrap()
    }

    /// `foo` matches formally; its callee `bar` has an in-binary twin
    /// (`baz`) that kills both Formal and Fuzzy keys, so only the call
    /// from `foo` can identify it.
    #[test]
    fn test_callee_identified_by_association() {
        let mut a = InMemorySource::new();
        a.insert(caller(0x1000, vec![0x55, 0xAA, 0xBB], &[0x2000]));
        a.insert(leaf(0x2000, vec![0x90, 0x01]));
        a.insert(leaf(0x3000, vec![0x90, 0x01]));

        let mut b = InMemorySource::new();
        b.insert(caller(0x8000, vec![0x55, 0xAA, 0xBB], &[0x9000]));
        b.insert(leaf(0x9000, vec![0x91, 0x02]));
        b.insert(leaf(0xA000, vec![0x91, 0x02]));

        let source = build(&a);
        let target = build(&b);
        let records = pipeline(&source, &target);

        let bar = records.iter().find(|r| r.target == 0x9000).unwrap();
        assert_eq!(bar.source, 0x2000);
        assert_eq!(bar.confidence, Confidence::Propagated);

        // The twin with no matched neighbor stays unmatched.
        assert!(!records.iter().any(|r| r.target == 0xA000));
    }

    #[test]
    fn test_caller_identified_by_association() {
        // The leaf matches formally; its single unmatched caller on each
        // side is identified through the incoming edge. The caller has an
        // in-binary structural twin so the Fuzzy class cannot claim it.
        let mut a = InMemorySource::new();
        a.insert(leaf(0x2000, vec![0x90, 0x01]));
        a.insert(caller(0x1000, vec![0x55, 0x11], &[0x2000]));
        a.insert(caller(0x3000, vec![0x55, 0x22], &[0x4000]));
        a.insert(leaf(0x4000, vec![0x92, 0x07, 0x08]));

        let mut b = InMemorySource::new();
        b.insert(leaf(0x9000, vec![0x90, 0x01]));
        b.insert(caller(0x8000, vec![0x66, 0x33], &[0x9000]));
        b.insert(caller(0xB000, vec![0x66, 0x44], &[0xC000]));
        b.insert(leaf(0xC000, vec![0x93, 0x0A, 0x0B]));

        let source = build(&a);
        let target = build(&b);
        let records = pipeline(&source, &target);

        let who = records.iter().find(|r| r.target == 0x8000).unwrap();
        assert_eq!(who.source, 0x1000);
        assert_eq!(who.confidence, Confidence::Propagated);
    }

    #[test]
    fn test_output_superset_of_input() {
        let mut a = InMemorySource::new();
        a.insert(caller(0x1000, vec![0x55, 0xAA], &[0x2000]));
        a.insert(leaf(0x2000, vec![0x90, 0x01]));
        let mut b = InMemorySource::new();
        b.insert(caller(0x8000, vec![0x55, 0xAA], &[0x9000]));
        b.insert(leaf(0x9000, vec![0x90, 0x01]));

        let source = build(&a);
        let target = build(&b);
        let matches = Matcher::new(&source, &target)
            .unwrap()
            .run(&CancelToken::new())
            .unwrap();
        let before = matches.clone();
        let after = propagate(matches, &source, &target, &CancelToken::new()).unwrap();

        for record in &before {
            assert!(after.contains(record));
        }
        assert!(after.len() >= before.len());
    }

    #[test]
    fn test_ambiguous_callees_not_propagated() {
        // The matched caller calls two unmatched twins; with conflicting
        // positional evidence absent, neither may be guessed... but here
        // positions are distinct, so both resolve. Shuffle the target's
        // call order instead so positions genuinely conflict.
        let mut a = InMemorySource::new();
        a.insert(caller(0x1000, vec![0x55, 0xAA], &[0x2000, 0x3000]));
        a.insert(leaf(0x2000, vec![0x90, 0x01]));
        a.insert(leaf(0x3000, vec![0x90, 0x01]));

        // Target caller calls only one twin twice: call counts match but
        // the pairing proposes one target for two sources.
        let mut b = InMemorySource::new();
        b.insert(caller(0x8000, vec![0x55, 0xAA], &[0x9000, 0x9000]));
        b.insert(leaf(0x9000, vec![0x91, 0x02]));
        b.insert(leaf(0xA000, vec![0x91, 0x02]));

        let source = build(&a);
        let target = build(&b);
        let records = pipeline(&source, &target);

        assert!(!records
            .iter()
            .any(|r| r.confidence == Confidence::Propagated));
    }

    #[test]
    fn test_propagation_chains_to_fixpoint() {
        // a -> b -> c: only `a` matches directly; two scans are needed to
        // reach `c`.
        let mut a = InMemorySource::new();
        a.insert(caller(0x1000, vec![0x55, 0xAA, 0xBB], &[0x2000]));
        a.insert(caller(0x2000, vec![0x90, 0x01], &[0x3000]));
        a.insert(caller(0x2800, vec![0x90, 0x02], &[0x3800]));
        a.insert(leaf(0x3000, vec![0x92, 0x05]));
        a.insert(leaf(0x3800, vec![0x92, 0x06]));

        let mut b = InMemorySource::new();
        b.insert(caller(0x8000, vec![0x55, 0xAA, 0xBB], &[0x9000]));
        b.insert(caller(0x9000, vec![0x93, 0x11], &[0xA000]));
        b.insert(caller(0x9800, vec![0x93, 0x12], &[0xA800]));
        b.insert(leaf(0xA000, vec![0x94, 0x15]));
        b.insert(leaf(0xA800, vec![0x94, 0x16]));

        let source = build(&a);
        let target = build(&b);
        let records = pipeline(&source, &target);

        let b_match = records.iter().find(|r| r.target == 0x9000).unwrap();
        assert_eq!(b_match.source, 0x2000);
        let c_match = records.iter().find(|r| r.target == 0xA000).unwrap();
        assert_eq!(c_match.source, 0x3000);
        assert_eq!(c_match.confidence, Confidence::Propagated);
    }

    #[test]
    fn test_propagate_cancelled() {
        let set = build(&InMemorySource::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(propagate(Vec::new(), &set, &set, &cancel).is_err());
    }
}
