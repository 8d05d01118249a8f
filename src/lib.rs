//! HWSW - GEZEL and hybrid hardware/software backend targets.
//!
//! Two emission pipelines lower a common SSA IR. The GEZEL target turns every
//! region into a GEZEL datapath with an FSM controller. The HWSW target routes
//! each region by its partition tag, emitting hardware regions as GEZEL and
//! software regions as an x86-64 ELF relocatable, or both in one artifact.
//!
//! # Primary Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use hwsw::core::{FileType, OptLevel, OutputSink, PassManager, TargetDescriptor};
//! use hwsw::target_machine::{EmissionPipeline, TargetMachine};
//!
//! let descriptor = Arc::new(TargetDescriptor::from_triple("hwsw-x86_64")?);
//! let tm = TargetMachine::new(descriptor);
//!
//! // Configure the caller-owned pass manager, then run it into a sink.
//! let mut pm = PassManager::new();
//! tm.add_passes_to_emit_file(&mut pm, FileType::Combined, OptLevel::Default, false)?;
//! let mut sink = OutputSink::file("unit.o");
//! let report = pm.run(&module, &mut sink)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Descriptors, options, passes, pass manager, sessions, sinks
//! - [`ir`] - Flat SSA IR and its text format
//! - [`passes`] - Legalization, cleanups, frames and verifiers
//! - [`gezel`] - GEZEL target: datapath lowering and text emission
//! - [`hwsw`] - HWSW target: partition routing
//! - [`x64`] - x86-64 lowering, encoding, ELF objects and listings
//! - [`target_machine`] - The emission entry point shared by both targets
//! - [`driver`] - Unit and batch compilation, CLI, filetests

pub mod core;
pub mod driver;
pub mod gezel;
pub mod hwsw;
pub mod ir;
pub mod passes;
pub mod target_machine;
pub mod x64;

pub use crate::core::{
    FileType, OptLevel, OutputSink, PassManager, PipelineError, PipelineResult, TargetDescriptor,
};
pub use crate::target_machine::{EmissionPipeline, TargetMachine};
