//! Error types for the signature engine.

use thiserror::Error;

/// Core error type.
///
/// Extraction-level errors (`AnalysisUnavailable`, `InvalidDescriptor`)
/// are contained per function during batch builds: the offending function
/// is skipped and counted, the build continues. Construction-level errors
/// (`DuplicateAddress`) abort the operation, since the downstream indices
/// would be unsound.
#[derive(Error, Debug)]
pub enum Error {
    /// The analysis provider cannot resolve the address, or the function
    /// decodes to zero instructions.
    #[error("analysis unavailable for function at {address:#x}")]
    AnalysisUnavailable { address: u64 },

    /// The function produced a degenerate descriptor (empty normalized
    /// byte stream).
    #[error("degenerate descriptor for function at {address:#x}")]
    InvalidDescriptor { address: u64 },

    /// Two descriptors share an address within one signature set.
    #[error("duplicate function address {address:#x}")]
    DuplicateAddress { address: u64 },

    /// Structurally inconsistent input handed to the matcher, e.g. an
    /// index entry or call-graph edge pointing at a missing descriptor.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation was cancelled via a [`crate::CancelToken`].
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for signature operations.
pub type Result<T> = std::result::Result<T, Error>;
