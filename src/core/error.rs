// This module defines the error taxonomy of the emission pipelines using thiserror. Errors
// fall into three families: configuration errors raised while a pipeline is being assembled
// (bad triple, unsupported file type, unsupported relocation/code model combination, a pass
// that needs a data layout the target does not have), structural verification errors raised
// by the verifier passes after legalization or lowering, and run-time pass failures raised
// by legalization, lowering or emission. Every run-time variant names the target variant and
// the stage, and names the IR region (function) whenever one is known, so a failing unit can
// be reported without a debugger. PipelineResult<T> is the crate-wide Result alias.

//! Error types for the emission pipelines.

use thiserror::Error;

use super::options::FileType;
use super::pass::{PassKind, PipelineStage};
use super::target::TargetVariant;

/// Region name used when an error is not tied to a single function.
pub const MODULE_REGION: &str = "<module>";

/// Main error type for pipeline configuration and execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid target triple `{triple}`: {reason}")]
    InvalidTriple { triple: String, reason: String },

    #[error("{target}: file type `{file_type}` is not supported (supported: {supported})")]
    UnsupportedFileType {
        target: TargetVariant,
        file_type: FileType,
        supported: String,
    },

    #[error("{target}: unsupported configuration: {reason}")]
    UnsupportedConfiguration { target: TargetVariant, reason: String },

    #[error("{target}: pass `{pass}` needs a target data layout and has no layout-independent substitute")]
    MissingLayout {
        target: TargetVariant,
        pass: &'static str,
    },

    #[error("{target}: verification after {after} failed in region `{region}`: {reason}")]
    Verification {
        target: TargetVariant,
        after: PassKind,
        region: String,
        reason: String,
    },

    #[error("{target}: {kind} pass `{pass}` failed in region `{region}`: {reason}")]
    PassFailed {
        target: TargetVariant,
        kind: PassKind,
        pass: &'static str,
        region: String,
        reason: String,
    },

    #[error("{target}: emission of `{file_type}` failed: {reason}")]
    Emission {
        target: TargetVariant,
        file_type: FileType,
        reason: String,
    },

    #[error("pass `{pass}` cannot run once the pipeline is {stage}")]
    OutOfOrder {
        pass: &'static str,
        stage: PipelineStage,
    },

    #[error("pass manager has no passes configured")]
    EmptyPipeline,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether this error was raised before any pass ran.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidTriple { .. }
                | PipelineError::UnsupportedFileType { .. }
                | PipelineError::UnsupportedConfiguration { .. }
                | PipelineError::MissingLayout { .. }
        )
    }

    /// Whether a verifier pass rejected the unit.
    pub fn is_verification(&self) -> bool {
        matches!(self, PipelineError::Verification { .. })
    }

    /// The region the error points at, if any.
    pub fn region(&self) -> Option<&str> {
        match self {
            PipelineError::Verification { region, .. } | PipelineError::PassFailed { region, .. } => {
                Some(region)
            }
            _ => None,
        }
    }
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
