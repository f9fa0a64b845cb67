//! # sigport-engine
//!
//! Fuzzy function-signature generation and matching for porting analysis
//! knowledge between binaries.
//!
//! Given two binaries that share code (same library, different compile,
//! patched version), the engine derives four independent signature classes
//! per function and matches them across the two populations:
//!
//! - **Formal**: functions must match exactly, modulo relocations
//! - **Fuzzy**: functions must only resemble each other structurally
//! - **String**: identification via unique string references
//! - **Immediate**: identification via unique immediate values
//!
//! Matches are applied in accuracy order (formal first, then string and
//! immediate, finally fuzzy), and confirmed matches are expanded through
//! the call graph: a function identified by strong evidence bootstraps
//! identification of its callees and callers that are otherwise ambiguous.
//!
//! # Example
//!
//! ```ignore
//! use sigport_engine::{match_sets, CancelToken, SignatureConfig, SignatureSet};
//!
//! let config = SignatureConfig::default();
//! let cancel = CancelToken::new();
//!
//! // Build one set per binary (`trusted` carries names, `fresh` does not).
//! let source = SignatureSet::build(&trusted, config.clone(), &cancel)?;
//! let target = SignatureSet::build(&fresh, config, &cancel)?;
//!
//! let report = match_sets(&source, &target, &cancel)?;
//! for ident in report.identifications() {
//!     println!("{:#x} -> {:?}", ident.target, ident.name);
//! }
//! ```

pub mod aggregate;
pub mod callgraph;
pub mod classify;
pub mod extract;
pub mod matcher;
pub mod propagate;
pub mod sigset;

pub use aggregate::{aggregate, Identification, MatchCounts, MatchReport};
pub use callgraph::CallGraph;
pub use classify::{Classifier, SignatureBundle, SignatureClass, SignatureConfig, SignatureKey};
pub use extract::Extractor;
pub use matcher::{Confidence, MatchRecord, Matcher};
pub use propagate::propagate;
pub use sigset::{SetStats, SignatureSet};

pub use sigport_core::{
    AnalysisSource, CancelToken, Error, FunctionDescriptor, InMemorySource, RawFunction,
    RawInstruction, RawOperand, Result,
};

/// Run the full matching pipeline: the four precedence-ordered passes,
/// call-graph propagation to a fixpoint, and aggregation into the final
/// identification table.
///
/// This is the entry point an embedding command surface calls after
/// building one [`SignatureSet`] per binary.
pub fn match_sets(
    source: &SignatureSet,
    target: &SignatureSet,
    cancel: &CancelToken,
) -> Result<MatchReport> {
    let matches = Matcher::new(source, target)?.run(cancel)?;
    let matches = propagate(matches, source, target, cancel)?;
    Ok(aggregate(matches, source, target))
}
