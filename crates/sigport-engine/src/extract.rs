//! Descriptor extraction.
//!
//! Pulls raw per-instruction data out of an [`AnalysisSource`] and
//! normalizes it into [`FunctionDescriptor`]s: relocation bits are masked
//! out of the byte stream, data references become function-relative
//! offsets, and immediates are policy-filtered. Extraction is a pure read
//! of the host; it never mutates analysis state.

use log::debug;
use rayon::prelude::*;

use sigport_core::{
    AnalysisSource, CancelToken, Error, FunctionDescriptor, RawOperand, Result,
};

use crate::classify::SignatureConfig;

/// Extracts normalized descriptors from an analysis provider.
pub struct Extractor<'a, S> {
    source: &'a S,
    config: &'a SignatureConfig,
}

impl<'a, S: AnalysisSource> Extractor<'a, S> {
    /// Create an extractor over the given provider and policy.
    pub fn new(source: &'a S, config: &'a SignatureConfig) -> Self {
        Self { source, config }
    }

    /// Extract one function's descriptor.
    ///
    /// Fails with [`Error::AnalysisUnavailable`] if the provider cannot
    /// resolve the address or the function has zero instructions, and
    /// with [`Error::InvalidDescriptor`] if normalization leaves an empty
    /// byte stream.
    pub fn extract(&self, address: u64) -> Result<FunctionDescriptor> {
        let raw = self.source.resolve(address)?;
        if raw.instructions.is_empty() {
            return Err(Error::AnalysisUnavailable { address });
        }

        let mut desc = FunctionDescriptor {
            address: raw.address,
            name: raw.name,
            instruction_count: raw.instructions.len(),
            instruction_bytes: Vec::new(),
            data_refs: Default::default(),
            string_refs: Default::default(),
            immediate_refs: Default::default(),
            call_targets: Vec::new(),
            callers: Default::default(),
        };

        for insn in &raw.instructions {
            for (i, &byte) in insn.bytes.iter().enumerate() {
                let mask = insn.reloc_mask.get(i).copied().unwrap_or(0);
                desc.instruction_bytes.push(byte & !mask);
            }

            for operand in &insn.operands {
                match operand {
                    RawOperand::Data { target } => {
                        let offset = (*target as i64).wrapping_sub(raw.address as i64);
                        desc.data_refs.insert(offset);
                    }
                    RawOperand::StringRef { content } => {
                        desc.string_refs.insert(content.clone());
                    }
                    RawOperand::Immediate { value } => {
                        if self.config.immediate_qualifies(*value) {
                            desc.immediate_refs.insert(*value);
                        }
                    }
                    RawOperand::Call { target } => {
                        desc.call_targets.push(*target);
                    }
                }
            }
        }

        if desc.instruction_bytes.is_empty() {
            return Err(Error::InvalidDescriptor { address });
        }

        Ok(desc)
    }

    /// Extract descriptors for every function the provider enumerates.
    ///
    /// Per-function extraction runs in parallel with no shared mutable
    /// state. Extraction-level failures are contained: the function is
    /// skipped, logged, and counted, and the batch continues. Returns the
    /// descriptors plus the skipped-function count. Checks the cancel
    /// token and returns [`Error::Cancelled`] with no partial output.
    pub fn extract_all(&self, cancel: &CancelToken) -> Result<(Vec<FunctionDescriptor>, usize)> {
        let addresses = self.source.functions();

        let results: Vec<(u64, Result<FunctionDescriptor>)> = addresses
            .par_iter()
            .map(|&address| {
                if cancel.is_cancelled() {
                    return (address, Err(Error::Cancelled));
                }
                (address, self.extract(address))
            })
            .collect();

        cancel.checkpoint()?;

        let mut descriptors = Vec::with_capacity(results.len());
        let mut skipped = 0;
        for (address, result) in results {
            match result {
                Ok(desc) => descriptors.push(desc),
                Err(Error::AnalysisUnavailable { .. }) | Err(Error::InvalidDescriptor { .. }) => {
                    debug!("skipping function at {address:#x}: extraction failed");
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        Ok((descriptors, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigport_core::{InMemorySource, RawFunction, RawInstruction};

    fn call_insn(target: u64) -> RawInstruction {
        RawInstruction {
            bytes: vec![0xE8, 0x12, 0x34, 0x56, 0x78],
            reloc_mask: vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF],
            operands: vec![RawOperand::Call { target }],
        }
    }

    #[test]
    fn test_reloc_bits_masked_out() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(0x1000, vec![call_insn(0x2000)]));
        source.insert(RawFunction::new(0x5000, vec![call_insn(0x6000)]));

        let config = SignatureConfig::default();
        let extractor = Extractor::new(&source, &config);
        let a = extractor.extract(0x1000).unwrap();
        let b = extractor.extract(0x5000).unwrap();

        // The displacement bytes differ before masking but the normalized
        // streams must be identical.
        assert_eq!(a.instruction_bytes, vec![0xE8, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(a.instruction_bytes, b.instruction_bytes);
        assert_eq!(a.call_targets, vec![0x2000]);
    }

    #[test]
    fn test_data_refs_relative() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(
            0x1000,
            vec![RawInstruction::plain(vec![0x48, 0x8B, 0x05])
                .with_operand(RawOperand::Data { target: 0x3000 })
                .with_operand(RawOperand::Data { target: 0x0800 })],
        ));

        let config = SignatureConfig::default();
        let extractor = Extractor::new(&source, &config);
        let desc = extractor.extract(0x1000).unwrap();
        assert!(desc.data_refs.contains(&0x2000));
        assert!(desc.data_refs.contains(&-0x800));
    }

    #[test]
    fn test_immediates_policy_filtered() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(
            0x1000,
            vec![RawInstruction::plain(vec![0xB8])
                .with_operand(RawOperand::Immediate { value: 1 })
                .with_operand(RawOperand::Immediate { value: 0xCAFE_BABE })],
        ));

        let config = SignatureConfig::default();
        let extractor = Extractor::new(&source, &config);
        let desc = extractor.extract(0x1000).unwrap();
        assert_eq!(desc.immediate_refs.len(), 1);
        assert!(desc.immediate_refs.contains(&0xCAFE_BABE));
    }

    #[test]
    fn test_zero_instructions_unavailable() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(0x1000, vec![]));

        let config = SignatureConfig::default();
        let extractor = Extractor::new(&source, &config);
        assert!(matches!(
            extractor.extract(0x1000),
            Err(Error::AnalysisUnavailable { address: 0x1000 })
        ));
    }

    #[test]
    fn test_extract_all_skips_and_counts() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(0x1000, vec![call_insn(0x2000)]));
        source.insert(RawFunction::new(0x2000, vec![]));
        source.insert(RawFunction::new(0x3000, vec![call_insn(0x1000)]));

        let config = SignatureConfig::default();
        let extractor = Extractor::new(&source, &config);
        let (descs, skipped) = extractor.extract_all(&CancelToken::new()).unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_extract_all_cancelled() {
        let mut source = InMemorySource::new();
        source.insert(RawFunction::new(0x1000, vec![call_insn(0x2000)]));

        let config = SignatureConfig::default();
        let extractor = Extractor::new(&source, &config);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            extractor.extract_all(&cancel),
            Err(Error::Cancelled)
        ));
    }
}
