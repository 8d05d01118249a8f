// This module executes configured passes. A CodegenUnit is the mutable state of one pipeline
// run: the module being legalized in place, the frame tables built for software regions, the
// lowered hardware design and software program, and the buffered artifact that the pass
// manager commits once the run succeeds. run_pass dispatches a Pass descriptor to its
// implementation in the legalization, cleanup, frame and verifier submodules or in the
// target-specific lowering and emission code under gezel/ and x64/. Implementations report a
// RegionFailure (region name plus reason); run_pass turns that into the PipelineError variant
// matching the pass kind, tagged with the target variant, so every failure names the target,
// the stage and the region.

//! Pass execution.

use hashbrown::HashMap;

use crate::core::{
    CompilationSession, FileType, Pass, PassKind, PipelineError, PipelineResult, RegionScope,
    TargetVariant, MODULE_REGION,
};
use crate::gezel::emit as hdl_emit;
use crate::gezel::lower::{self as hdl_lower, HwDesign};
use crate::ir::Module;
use crate::x64::lower::{self as sw_lower, SwProgram};
use crate::x64::{listing, object};

pub mod cleanup;
pub mod frame;
pub mod legalize;
pub mod verify;

pub use frame::{Frame, FrameSlot, SlotKind};

/// Mutable state of one pipeline run.
pub struct CodegenUnit<'arena> {
    pub target: TargetVariant,
    pub module: Module,
    /// Frame per software region, keyed by function index.
    pub frames: HashMap<u32, Frame<'arena>>,
    pub hardware: HwDesign,
    pub software: SwProgram,
    /// Buffered output of the emission pass.
    pub artifact: Option<Vec<u8>>,
}

impl<'arena> CodegenUnit<'arena> {
    pub fn new(target: TargetVariant, module: Module) -> Self {
        Self {
            target,
            module,
            frames: HashMap::new(),
            hardware: HwDesign::default(),
            software: SwProgram::default(),
            artifact: None,
        }
    }
}

/// A pass failure inside one region, before it is attributed to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionFailure {
    pub region: String,
    pub reason: String,
}

impl RegionFailure {
    pub fn new(region: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            reason: reason.into(),
        }
    }

    /// Failure not tied to a single region.
    pub fn module(reason: impl Into<String>) -> Self {
        Self::new(MODULE_REGION, reason)
    }
}

pub type PassOutcome<T = ()> = Result<T, RegionFailure>;

/// Indices of the regions a scope selects, in module order.
pub fn regions(module: &Module, scope: RegionScope) -> Vec<u32> {
    module
        .functions
        .iter()
        .enumerate()
        .filter(|(_, f)| scope.includes(f))
        .map(|(i, _)| i as u32)
        .collect()
}

/// Run `f` over every region of `scope`, attributing errors to the region.
pub(crate) fn each_region<T>(
    module: &Module,
    scope: RegionScope,
    session: &CompilationSession<'_>,
    mut f: impl FnMut(u32) -> Result<T, String>,
) -> PassOutcome<Vec<T>> {
    let mut results = Vec::new();
    for func_idx in regions(module, scope) {
        let name = &module.functions[func_idx as usize].name;
        session.enter_region(name);
        let result = f(func_idx);
        session.leave_region();
        results.push(result.map_err(|reason| RegionFailure::new(name.clone(), reason))?);
    }
    Ok(results)
}

/// Execute one pass over the unit.
pub fn run_pass<'arena>(
    pass: &Pass,
    unit: &mut CodegenUnit<'arena>,
    session: &CompilationSession<'arena>,
) -> PipelineResult<()> {
    let outcome = match pass {
        Pass::PromoteMemory { scope } => legalize::promote_memory(&mut unit.module, *scope, session),
        Pass::RejectCalls { scope } => legalize::reject_calls(&unit.module, *scope, session),
        Pass::LegalizeCalls { scope } => legalize::legalize_calls(&unit.module, *scope, session),
        Pass::FoldConstants => cleanup::fold_constants(&mut unit.module, session),
        Pass::StrengthReduce => cleanup::strength_reduce(&mut unit.module, session),
        Pass::EliminateDeadValues => cleanup::eliminate_dead_values(&mut unit.module, session),
        Pass::FrameLayout { scope, layout } => frame::assign_frames(unit, *scope, Some(layout), session),
        Pass::AbstractFrame { scope } => frame::assign_frames(unit, *scope, None, session),
        Pass::VerifyLegalized { hardware } => verify::verify_module(&unit.module, *hardware),
        Pass::VerifyLowered => verify::verify_lowered(unit),
        Pass::LowerHardware { scope } => hdl_lower::lower_module(&unit.module, *scope, session)
            .map(|design| unit.hardware.datapaths.extend(design.datapaths)),
        Pass::LowerSoftware { scope } => {
            sw_lower::lower_module(&unit.module, &unit.frames, *scope, session)
                .map(|program| unit.software.functions.extend(program.functions))
        }
        Pass::EmitHardwareDescription { system_block } => {
            unit.artifact = Some(hdl_emit::render(&unit.hardware, *system_block).into_bytes());
            Ok(())
        }
        Pass::EmitSoftwareObject { config } => {
            object::write_object(&unit.software, &unit.frames, config, None, session)
                .map(|bytes| unit.artifact = Some(bytes))
        }
        Pass::EmitSoftwareAssembly { config } => {
            listing::gas_listing(&unit.software, &unit.frames, config, session)
                .map(|text| unit.artifact = Some(text.into_bytes()))
        }
        Pass::EmitMachineListing => {
            unit.artifact = Some(listing::machine_listing(&unit.software).into_bytes());
            Ok(())
        }
        Pass::EmitCombined { config, system_block } => {
            let hdl = hdl_emit::render(&unit.hardware, *system_block);
            object::write_object(&unit.software, &unit.frames, config, Some(&hdl), session)
                .map(|bytes| unit.artifact = Some(bytes))
        }
    };

    outcome.map_err(|failure| attribute(pass, unit.target, failure))
}

/// File type a terminal pass produces.
pub fn emitted_file_type(pass: &Pass) -> Option<FileType> {
    match pass {
        Pass::EmitHardwareDescription { .. } => Some(FileType::HardwareDescription),
        Pass::EmitSoftwareObject { .. } => Some(FileType::SoftwareObject),
        Pass::EmitSoftwareAssembly { .. } | Pass::EmitMachineListing => Some(FileType::SoftwareAssembly),
        Pass::EmitCombined { .. } => Some(FileType::Combined),
        _ => None,
    }
}

fn attribute(pass: &Pass, target: TargetVariant, failure: RegionFailure) -> PipelineError {
    let RegionFailure { region, reason } = failure;
    let after = match pass {
        Pass::VerifyLegalized { .. } => Some(PassKind::Legalize),
        Pass::VerifyLowered => Some(PassKind::Lower),
        _ => None,
    };
    if let Some(after) = after {
        return PipelineError::Verification {
            target,
            after,
            region,
            reason,
        };
    }
    if let Some(file_type) = emitted_file_type(pass) {
        return PipelineError::Emission {
            target,
            file_type,
            reason: if region == MODULE_REGION {
                reason
            } else {
                format!("region `{region}`: {reason}")
            },
        };
    }
    PipelineError::PassFailed {
        target,
        kind: pass.kind(),
        pass: pass.name(),
        region,
        reason,
    }
}
