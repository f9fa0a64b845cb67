//! # sigport-core
//!
//! Core abstractions for the sigport signature engine. This crate defines
//! host-agnostic types for function descriptors, the analysis-provider
//! capability seam, error handling, and cooperative cancellation.
//!
//! The engine itself (classification, indexing, matching, propagation)
//! lives in `sigport-engine`; this crate carries only the data model and
//! the narrow interface an embedding disassembler must implement.

pub mod cancel;
pub mod descriptor;
pub mod error;
pub mod provider;

pub use cancel::CancelToken;
pub use descriptor::FunctionDescriptor;
pub use error::{Error, Result};
pub use provider::{AnalysisSource, InMemorySource, RawFunction, RawInstruction, RawOperand};
