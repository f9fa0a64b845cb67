//! The analysis-provider seam.
//!
//! The engine never talks to a disassembler directly. A host implements
//! [`AnalysisSource`] (enumerate function entry points, resolve one entry
//! point to raw per-instruction data) and everything downstream is pure
//! computation over the returned records. The host also classifies
//! operands; the engine does not understand any particular instruction
//! encoding.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// One operand of a raw instruction, pre-classified by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOperand {
    /// Reference to a data address.
    Data { target: u64 },
    /// Reference to a recognized string literal; the content travels with
    /// the operand so the engine never needs to read host memory.
    StringRef { content: String },
    /// An immediate numeric value.
    Immediate { value: u64 },
    /// A call to another function.
    Call { target: u64 },
}

/// One decoded instruction as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstruction {
    /// Encoded instruction bytes.
    pub bytes: Vec<u8>,
    /// Bit mask over `bytes`, same length; set bits are address-dependent
    /// (relocated call/jump targets, frame-relative displacements) and are
    /// cleared during normalization.
    pub reloc_mask: Vec<u8>,
    /// Classified operands, in operand order.
    pub operands: Vec<RawOperand>,
}

impl RawInstruction {
    /// An instruction with no address-dependent bits and no operands of
    /// interest.
    pub fn plain(bytes: Vec<u8>) -> Self {
        let mask = vec![0; bytes.len()];
        Self {
            bytes,
            reloc_mask: mask,
            operands: Vec::new(),
        }
    }

    /// Attach a relocation mask.
    pub fn with_mask(mut self, mask: Vec<u8>) -> Self {
        self.reloc_mask = mask;
        self
    }

    /// Attach an operand.
    pub fn with_operand(mut self, operand: RawOperand) -> Self {
        self.operands.push(operand);
        self
    }
}

/// Raw analysis data for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFunction {
    /// Entry address.
    pub address: u64,
    /// Symbol name, if the host knows one.
    pub name: Option<String>,
    /// Decoded instructions in address order.
    pub instructions: Vec<RawInstruction>,
}

impl RawFunction {
    /// Create a raw function record.
    pub fn new(address: u64, instructions: Vec<RawInstruction>) -> Self {
        Self {
            address,
            name: None,
            instructions,
        }
    }

    /// Attach a symbol name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Capability interface a host analysis environment implements.
///
/// Calls are synchronous request/response and must not mutate analysis
/// state; the engine may issue them from multiple threads.
pub trait AnalysisSource: Sync {
    /// Enumerate all known function entry addresses.
    fn functions(&self) -> Vec<u64>;

    /// Resolve one entry address to its raw analysis data.
    ///
    /// Returns [`Error::AnalysisUnavailable`] if the address is not a
    /// known function.
    fn resolve(&self, address: u64) -> Result<RawFunction>;
}

/// A map-backed [`AnalysisSource`].
///
/// Used by the test suites throughout this workspace, and by embedders
/// that capture analysis data up front and replay it into the engine.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    functions: BTreeMap<u64, RawFunction>,
}

impl InMemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any previous record at the same address.
    pub fn insert(&mut self, function: RawFunction) {
        self.functions.insert(function.address, function);
    }

    /// Number of functions in the source.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the source is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl AnalysisSource for InMemorySource {
    fn functions(&self) -> Vec<u64> {
        self.functions.keys().copied().collect()
    }

    fn resolve(&self, address: u64) -> Result<RawFunction> {
        self.functions
            .get(&address)
            .cloned()
            .ok_or(Error::AnalysisUnavailable { address })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_source_resolve() {
        let mut source = InMemorySource::new();
        source.insert(
            RawFunction::new(0x1000, vec![RawInstruction::plain(vec![0xC3])])
                .with_name("noop"),
        );

        assert_eq!(source.len(), 1);
        let resolved = source.resolve(0x1000).unwrap();
        assert_eq!(resolved.name.as_deref(), Some("noop"));
        assert_eq!(resolved.instructions.len(), 1);
    }

    #[test]
    fn test_in_memory_source_missing_address() {
        let source = InMemorySource::new();
        assert!(matches!(
            source.resolve(0xDEAD),
            Err(Error::AnalysisUnavailable { address: 0xDEAD })
        ));
    }

    #[test]
    fn test_functions_sorted() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(0x3000, vec![]));
        source.insert(RawFunction::new(0x1000, vec![]));
        source.insert(RawFunction::new(0x2000, vec![]));
        assert_eq!(source.functions(), vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_raw_instruction_builders() {
        let insn = RawInstruction::plain(vec![0xE8, 0x00, 0x00, 0x00, 0x00])
            .with_mask(vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF])
            .with_operand(RawOperand::Call { target: 0x2000 });
        assert_eq!(insn.bytes.len(), insn.reloc_mask.len());
        assert_eq!(insn.operands.len(), 1);
    }
}
