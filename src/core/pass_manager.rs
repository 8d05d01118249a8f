// This module implements the caller-owned pass manager. Target machines never run passes:
// they compute a PassList and the pass manager appends it, so configuration is a pure value
// step and a failed configuration leaves the manager untouched. Running the manager clones
// the input module into a per-run CodegenUnit, creates a fresh arena-backed
// CompilationSession, and executes the passes in order while enforcing the PipelineStage
// machine (a pass whose kind cannot follow the current stage is an OutOfOrder error).
// Emission passes only buffer their artifact in the unit; the bytes reach the caller's
// OutputSink after the last pass succeeded, so a failed run never leaves a partial artifact.

//! Pass manager.

use std::fmt;

use bumpalo::Bump;

use crate::ir::Module;
use crate::passes::{self, CodegenUnit};

use super::error::{PipelineError, PipelineResult};
use super::pass::{Pass, PassList, PipelineStage};
use super::session::{CompilationSession, SessionStats};
use super::sink::OutputSink;
use super::target::TargetVariant;

/// Ordered list of configured passes, owned and run by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassManager {
    target: Option<TargetVariant>,
    passes: Vec<Pass>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: TargetVariant,
    pub stage: PipelineStage,
    /// Bytes committed to the sink.
    pub artifact_size: usize,
    pub stats: SessionStats,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a configured pipeline.
    pub fn append(&mut self, target: TargetVariant, passes: PassList) {
        match self.target {
            Some(existing) if existing != target => {
                log::warn!("appending {target} passes to a {existing} pass manager");
            }
            Some(_) => {}
            None => self.target = Some(target),
        }
        self.passes.extend(passes);
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(Pass::name).collect()
    }

    pub fn target(&self) -> Option<TargetVariant> {
        self.target
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run every pass over a copy of `module`, committing the artifact to
    /// `sink` only if all of them succeed.
    pub fn run(&self, module: &Module, sink: &mut OutputSink) -> PipelineResult<RunReport> {
        self.execute(module, sink).result
    }

    /// Like [`PassManager::run`], also reporting the terminal stage and the
    /// last stage completed before it.
    pub fn execute(&self, module: &Module, sink: &mut OutputSink) -> PipelineRun {
        let mut reached = PipelineStage::Unconfigured;
        let result = self.run_stages(module, sink, &mut reached);
        let stage = match &result {
            Ok(report) => report.stage,
            Err(e) => {
                log::debug!("{}: pipeline {reached} -> {}: {e}", self.target_name(), PipelineStage::Failed);
                PipelineStage::Failed
            }
        };
        PipelineRun { stage, reached, result }
    }

    fn target_name(&self) -> String {
        self.target.map_or_else(|| "unconfigured".to_string(), |t| t.to_string())
    }

    fn run_stages(
        &self,
        module: &Module,
        sink: &mut OutputSink,
        stage: &mut PipelineStage,
    ) -> PipelineResult<RunReport> {
        let Some(target) = self.target.filter(|_| !self.passes.is_empty()) else {
            return Err(PipelineError::EmptyPipeline);
        };

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = CodegenUnit::new(target, module.clone());

        log::info!(
            "{target}: running {} passes over {} regions",
            self.passes.len(),
            module.functions.len()
        );

        for pass in &self.passes {
            let next = stage.advance(pass.kind()).ok_or(PipelineError::OutOfOrder {
                pass: pass.name(),
                stage: *stage,
            })?;

            log::debug!("{target}: {pass} ({})", pass.kind());
            passes::run_pass(pass, &mut unit, &session)?;
            session.record_pass(pass.name());
            *stage = next;
        }

        let artifact_size = match unit.artifact.take() {
            Some(bytes) => {
                sink.commit(&bytes)?;
                bytes.len()
            }
            None => 0,
        };
        session.record_artifact(artifact_size);

        log::info!("{target}: pipeline {stage}, {artifact_size} bytes written");
        Ok(RunReport {
            target,
            stage: *stage,
            artifact_size,
            stats: session.stats(),
        })
    }
}

/// Terminal state of one run.
#[derive(Debug)]
pub struct PipelineRun {
    /// `Failed` on error, otherwise the stage the last pass reached.
    pub stage: PipelineStage,
    /// Last stage completed before the run ended.
    pub reached: PipelineStage,
    pub result: PipelineResult<RunReport>,
}

impl fmt::Display for PassManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => writeln!(f, "Pass pipeline for {target}:")?,
            None => writeln!(f, "Pass pipeline (unconfigured):")?,
        }
        for (i, pass) in self.passes.iter().enumerate() {
            writeln!(f, "  {i:2}. {pass} ({})", pass.kind())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pass::{PassKind, RegionScope};

    const MODULE: &str = "f(%a) {\nentry:\n  ret %a\n}\n";

    fn manager(passes: Vec<Pass>) -> PassManager {
        let mut list = PassList::new();
        for pass in passes {
            list.push(pass);
        }
        let mut pm = PassManager::new();
        pm.append(TargetVariant::PureHardware, list);
        pm
    }

    #[test]
    fn empty_manager_refuses_to_run() {
        let module = Module::parse(MODULE).unwrap();
        let mut sink = OutputSink::memory();
        let err = PassManager::new().run(&module, &mut sink).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyPipeline));
    }

    #[test]
    fn out_of_order_pass_is_rejected() {
        let module = Module::parse(MODULE).unwrap();
        let pm = manager(vec![
            Pass::LowerHardware { scope: RegionScope::All },
            Pass::PromoteMemory { scope: RegionScope::All },
        ]);
        let mut sink = OutputSink::memory();
        let err = pm.run(&module, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OutOfOrder { pass: "promote-memory", stage: PipelineStage::Lowered }
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn emission_without_lowering_is_rejected() {
        let module = Module::parse(MODULE).unwrap();
        let pm = manager(vec![Pass::EmitHardwareDescription { system_block: false }]);
        let err = pm.run(&module, &mut OutputSink::memory()).unwrap_err();
        assert!(matches!(err, PipelineError::OutOfOrder { stage: PipelineStage::Unconfigured, .. }));
    }

    #[test]
    fn run_reports_stage_and_commits() {
        let module = Module::parse(MODULE).unwrap();
        let pm = manager(vec![
            Pass::PromoteMemory { scope: RegionScope::All },
            Pass::VerifyLegalized { hardware: Some(RegionScope::All) },
            Pass::LowerHardware { scope: RegionScope::All },
            Pass::VerifyLowered,
            Pass::EmitHardwareDescription { system_block: false },
        ]);
        let mut sink = OutputSink::memory();
        let report = pm.run(&module, &mut sink).unwrap();
        assert_eq!(report.stage, PipelineStage::Emitted);
        assert_eq!(report.stats.passes_run, 5);
        assert_eq!(report.artifact_size, sink.committed_len());
        assert!(!sink.is_empty());
    }

    #[test]
    fn display_lists_passes() {
        let pm = manager(vec![Pass::PromoteMemory { scope: RegionScope::All }]);
        let text = pm.to_string();
        assert!(text.contains("Pass pipeline for gezel"));
        assert!(text.contains("promote-memory [all] (legalization)"));
        assert_eq!(pm.passes()[0].kind(), PassKind::Legalize);
    }

    #[test]
    fn failure_ends_in_failed_stage() {
        let module = Module::parse("f(%a) {\nentry:\n  %r = call @f, %a\n  ret %r\n}\n").unwrap();
        let pm = manager(vec![
            Pass::PromoteMemory { scope: RegionScope::All },
            Pass::RejectCalls { scope: RegionScope::All },
            Pass::LowerHardware { scope: RegionScope::All },
            Pass::EmitHardwareDescription { system_block: false },
        ]);
        let mut sink = OutputSink::memory();
        let run = pm.execute(&module, &mut sink);
        assert_eq!(run.stage, PipelineStage::Failed);
        assert!(run.stage.is_terminal());
        assert_eq!(run.reached, PipelineStage::Legalized);
        assert!(matches!(run.result, Err(PipelineError::PassFailed { pass: "reject-calls", .. })));
        assert!(sink.is_empty());

        let run = PassManager::new().execute(&module, &mut sink);
        assert_eq!((run.stage, run.reached), (PipelineStage::Failed, PipelineStage::Unconfigured));

        let ok = Module::parse(MODULE).unwrap();
        let run = pm.execute(&ok, &mut sink);
        assert_eq!((run.stage, run.reached), (PipelineStage::Emitted, PipelineStage::Emitted));
        assert!(run.result.is_ok());
    }
}
