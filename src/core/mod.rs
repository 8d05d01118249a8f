// This module gathers the target-independent infrastructure of the two emission pipelines:
// the error taxonomy, the immutable TargetDescriptor with its explicit Layout/NoLayout data
// layout, per-invocation codegen options, the pass descriptor model and its stage machine,
// the caller-owned PassManager that runs a configured pipeline, arena-backed compilation
// sessions, and the output sinks artifacts are committed to. Nothing here knows about GEZEL
// text or x86-64 encoding; the target machines combine these pieces into pass lists.

//! Core pipeline infrastructure.
//!
//! # Key Components
//!
//! ## Targets (`target`)
//! - Triple parsing into a [`TargetDescriptor`]
//! - [`TargetData`] as an explicit `Layout | NoLayout` sum type
//!
//! ## Passes (`pass`, `pass_manager`)
//! - [`Pass`] descriptors grouped into a [`PassList`] value
//! - [`PipelineStage`] ordering enforced at run time
//!
//! ## Sessions and sinks (`session`, `sink`)
//! - Arena allocation using `bumpalo`
//! - Atomic artifact commits

pub mod error;
pub mod options;
pub mod pass;
pub mod pass_manager;
pub mod session;
pub mod sink;
pub mod target;

pub use error::{PipelineError, PipelineResult, MODULE_REGION};
pub use options::{CodegenOptions, FileType, OptLevel};
pub use pass::{ObjectConfig, Pass, PassKind, PassList, PipelineBuilder, PipelineStage, RegionScope};
pub use pass_manager::{PassManager, PipelineRun, RunReport};
pub use session::{CompilationSession, SessionStats};
pub use sink::OutputSink;
pub use target::{
    CodeModel, DataLayout, Endian, FeatureSet, RelocModel, TargetData, TargetDescriptor,
    TargetVariant,
};
