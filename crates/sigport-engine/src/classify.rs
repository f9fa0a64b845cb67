//! Signature classification.
//!
//! Derives the four signature classes from a [`FunctionDescriptor`]:
//!
//! - **Formal**: normalized instruction bytes plus reference counts;
//!   catches functions that are byte-identical modulo relocations.
//! - **Fuzzy**: call-sequence shape, coarse size bucket, and reference
//!   counts; tolerates instruction-level churn between compiler versions
//!   while preserving structural shape.
//! - **String**: one key per qualifying string reference.
//! - **Immediate**: one key per qualifying immediate value.
//!
//! Keys are class + content only; they never identify which binary they
//! came from. All policy thresholds live in [`SignatureConfig`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sigport_core::{Error, FunctionDescriptor, Result};

/// One of the four independent signature classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureClass {
    Formal,
    Fuzzy,
    String,
    Immediate,
}

impl SignatureClass {
    /// Human-readable class name.
    pub fn name(&self) -> &'static str {
        match self {
            SignatureClass::Formal => "formal",
            SignatureClass::Fuzzy => "fuzzy",
            SignatureClass::String => "string",
            SignatureClass::Immediate => "immediate",
        }
    }
}

/// A comparable signature key. Equality of two keys of the same class
/// from different binaries is the matching predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignatureKey {
    /// The class this key belongs to.
    pub class: SignatureClass,
    /// Hash of the class-specific content.
    pub value: u64,
}

/// Policy constants for classification.
///
/// The defaults are deliberately conservative: short or whitespace-only
/// strings and ubiquitous constants generate keys shared by unrelated
/// functions, which the collision policy would then throw away anyway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Minimum character count for a string reference to qualify.
    pub min_string_len: usize,

    /// Minimum magnitude for an immediate value to qualify.
    pub min_immediate: u64,

    /// Immediate values that never qualify regardless of magnitude.
    pub denied_immediates: BTreeSet<u64>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            min_string_len: 3,
            min_immediate: 0x1_0000,
            denied_immediates: default_denied_immediates(),
        }
    }
}

/// Common constants excluded from the Immediate class: 0, 1, -1 at both
/// widths, small powers of two, and stack-alignment masks.
fn default_denied_immediates() -> BTreeSet<u64> {
    let mut denied = BTreeSet::new();
    denied.insert(0);
    denied.insert(1);
    denied.insert(u64::MAX);
    denied.insert(u32::MAX as u64);
    for shift in 1..=20 {
        denied.insert(1u64 << shift);
    }
    for mask in [!0xFu64, !0x7, !0x3, 0xFFFF_FFF0, 0xFFFF_FFF8, 0xFFFF_FFFC] {
        denied.insert(mask);
    }
    denied
}

impl SignatureConfig {
    /// Set the minimum qualifying string length.
    pub fn with_min_string_len(mut self, len: usize) -> Self {
        self.min_string_len = len;
        self
    }

    /// Set the minimum qualifying immediate magnitude.
    pub fn with_min_immediate(mut self, min: u64) -> Self {
        self.min_immediate = min;
        self
    }

    /// Add a value to the immediate deny list.
    pub fn with_denied_immediate(mut self, value: u64) -> Self {
        self.denied_immediates.insert(value);
        self
    }

    /// Whether a string reference qualifies for the String class.
    pub fn string_qualifies(&self, content: &str) -> bool {
        content.chars().count() >= self.min_string_len
            && !content.chars().all(char::is_whitespace)
    }

    /// Whether an immediate value qualifies for the Immediate class.
    pub fn immediate_qualifies(&self, value: u64) -> bool {
        value >= self.min_immediate && !self.denied_immediates.contains(&value)
    }
}

/// The signature keys derived from one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBundle {
    /// Address of the classified function.
    pub address: u64,
    /// The function's Formal key.
    pub formal: SignatureKey,
    /// The function's Fuzzy key.
    pub fuzzy: SignatureKey,
    /// One key per qualifying string reference.
    pub strings: Vec<SignatureKey>,
    /// One key per qualifying immediate value.
    pub immediates: Vec<SignatureKey>,
}

/// Derives signature keys from descriptors under a fixed policy.
#[derive(Debug, Clone, Copy)]
pub struct Classifier<'a> {
    config: &'a SignatureConfig,
}

impl<'a> Classifier<'a> {
    /// Create a classifier for the given policy.
    pub fn new(config: &'a SignatureConfig) -> Self {
        Self { config }
    }

    /// Derive all four signature classes for one descriptor.
    ///
    /// Fails with [`Error::InvalidDescriptor`] if the descriptor has an
    /// empty normalized byte stream. Keys are computed purely from the
    /// descriptor's static structure, independent of any match state, so
    /// classification is deterministic and order-insensitive.
    pub fn classify(&self, desc: &FunctionDescriptor) -> Result<SignatureBundle> {
        if desc.instruction_bytes.is_empty() {
            return Err(Error::InvalidDescriptor {
                address: desc.address,
            });
        }

        Ok(SignatureBundle {
            address: desc.address,
            formal: self.formal_key(desc),
            fuzzy: self.fuzzy_key(desc),
            strings: self.string_keys(desc),
            immediates: self.immediate_keys(desc),
        })
    }

    /// Formal key: normalized instruction bytes concatenated with the
    /// *counts* (not values) of data, string, and call references.
    fn formal_key(&self, desc: &FunctionDescriptor) -> SignatureKey {
        let mut hasher = Sha256::new();
        hasher.update(b"formal\0");
        hasher.update(&desc.instruction_bytes);
        hasher.update((desc.data_refs.len() as u32).to_le_bytes());
        hasher.update((desc.string_refs.len() as u32).to_le_bytes());
        hasher.update((desc.call_targets.len() as u32).to_le_bytes());
        key(SignatureClass::Formal, hasher)
    }

    /// Fuzzy key: the ordered call-sequence shape, the instruction count
    /// bucketed into coarse size ranges, and per-class reference counts.
    /// Callee identity is deliberately absent, so the key survives the
    /// callees being at different addresses or unidentified.
    fn fuzzy_key(&self, desc: &FunctionDescriptor) -> SignatureKey {
        let mut hasher = Sha256::new();
        hasher.update(b"fuzzy\0");
        for _ in &desc.call_targets {
            hasher.update([b'C']);
        }
        hasher.update(size_bucket(desc.instruction_count).to_le_bytes());
        hasher.update((desc.data_refs.len() as u32).to_le_bytes());
        hasher.update((desc.string_refs.len() as u32).to_le_bytes());
        hasher.update(
            (desc
                .immediate_refs
                .iter()
                .filter(|&&v| self.config.immediate_qualifies(v))
                .count() as u32)
                .to_le_bytes(),
        );
        key(SignatureClass::Fuzzy, hasher)
    }

    /// One String key per qualifying referenced string.
    fn string_keys(&self, desc: &FunctionDescriptor) -> Vec<SignatureKey> {
        desc.string_refs
            .iter()
            .filter(|s| self.config.string_qualifies(s))
            .map(|s| {
                let mut hasher = Sha256::new();
                hasher.update(b"string\0");
                hasher.update(s.as_bytes());
                key(SignatureClass::String, hasher)
            })
            .collect()
    }

    /// One Immediate key per qualifying immediate value. Descriptors are
    /// filtered at extraction, but deserialized sets may carry values the
    /// current policy rejects, so the filter is applied here as well.
    fn immediate_keys(&self, desc: &FunctionDescriptor) -> Vec<SignatureKey> {
        desc.immediate_refs
            .iter()
            .filter(|&&v| self.config.immediate_qualifies(v))
            .map(|&v| {
                let mut hasher = Sha256::new();
                hasher.update(b"immediate\0");
                hasher.update(v.to_le_bytes());
                key(SignatureClass::Immediate, hasher)
            })
            .collect()
    }
}

/// Coarse size bucket: floor(log2(count + 1)), so nearby instruction
/// counts land in the same bucket and compiler-version drift does not
/// perturb the Fuzzy class.
fn size_bucket(count: usize) -> u32 {
    usize::BITS - (count + 1).leading_zeros() - 1
}

fn key(class: SignatureClass, hasher: Sha256) -> SignatureKey {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    SignatureKey {
        class,
        value: u64::from_le_bytes(bytes),
    }
}
