// This module plays the role of the external backend driver. It turns IR text into a parsed
// module, builds the target machine from a shared descriptor, asks it to configure a fresh
// caller-owned pass manager for the requested file type, runs the pipeline and owns the sink
// the artifact is committed to. compile_unit is the library entry point for one unit;
// compile_batch runs independent units on scoped threads, each with its own pass manager,
// arena session and in-memory sink, so one failing unit never affects the others. run
// additionally renders the textual reports the hwswc binary prints (pipeline, IR, statistics)
// and is shared by the binary and the filetest runner in check.rs.

//! Backend driver.

use std::fmt::Write;
use std::panic;
use std::sync::Arc;
use std::thread;

use crate::core::{
    CodegenOptions, OutputSink, PassManager, PipelineError, PipelineResult, RunReport,
    TargetDescriptor,
};
use crate::ir::Module;
use crate::target_machine::{EmissionPipeline, TargetMachine};

pub mod check;
pub mod cli;

pub use cli::{Cli, Invocation};

/// Emitted bytes of one unit plus its run report.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub report: RunReport,
}

/// Parse IR text, mapping syntax errors into the pipeline error type.
pub fn parse_module(source: &str) -> PipelineResult<Module> {
    Module::parse(source).map_err(PipelineError::Parse)
}

/// Configure a fresh pass manager for `options`.
pub fn configure(tm: &TargetMachine, options: &CodegenOptions) -> PipelineResult<PassManager> {
    let mut pm = PassManager::new();
    tm.add_passes_to_emit_file(&mut pm, options.file_type, options.opt_level, options.disable_verify)?;
    Ok(pm)
}

/// Compile one unit into memory.
pub fn compile_unit(
    descriptor: Arc<TargetDescriptor>,
    options: &CodegenOptions,
    source: &str,
) -> PipelineResult<Artifact> {
    let module = parse_module(source)?;
    let tm = TargetMachine::new(descriptor);
    let pm = configure(&tm, options)?;

    let mut sink = OutputSink::memory();
    let report = pm.run(&module, &mut sink)?;
    Ok(Artifact {
        bytes: sink.into_bytes().unwrap_or_default(),
        report,
    })
}

/// Compile independent units concurrently. Results keep the input order.
pub fn compile_batch<'a>(
    descriptor: &Arc<TargetDescriptor>,
    options: &CodegenOptions,
    units: &[(&'a str, &'a str)],
) -> Vec<(&'a str, PipelineResult<Artifact>)> {
    log::info!("{}: compiling {} units", descriptor.variant(), units.len());
    thread::scope(|scope| {
        let handles: Vec<_> = units
            .iter()
            .map(|&(name, source)| {
                let descriptor = Arc::clone(descriptor);
                let handle = scope.spawn(move || compile_unit(descriptor, options, source));
                (name, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(name, handle)| {
                let result = handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload));
                if let Err(e) = &result {
                    log::debug!("unit `{name}` failed: {e}");
                }
                (name, result)
            })
            .collect()
    })
}

/// Textual side output of a driver run.
#[derive(Debug, Default)]
pub struct DriverOutput {
    /// Pipeline, IR and statistics dumps requested by the invocation.
    pub diagnostics: String,
    pub report: Option<RunReport>,
}

/// Run an invocation over `source`, committing the artifact to `sink`.
pub fn run(invocation: &Invocation, source: &str, sink: &mut OutputSink) -> PipelineResult<DriverOutput> {
    let mut out = DriverOutput::default();
    let module = parse_module(source)?;
    if invocation.print_ir {
        out.diagnostics.push_str(&module.print());
    }

    let tm = TargetMachine::new(Arc::clone(&invocation.descriptor));
    let pm = configure(&tm, &invocation.options)?;
    if invocation.print_passes {
        let _ = write!(out.diagnostics, "{pm}");
    }

    let report = pm.run(&module, sink)?;
    if invocation.stats {
        let _ = write!(out.diagnostics, "{}", report.stats);
    }
    out.report = Some(report);
    Ok(out)
}
