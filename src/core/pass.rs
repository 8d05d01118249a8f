// This module defines the pass model shared by both emission pipelines. A Pass is a plain
// descriptor (an enum value carrying the configuration it needs, such as the region scope it
// applies to or the data layout it was built against), so a configured pipeline is an
// ordinary PassList value that can be compared, printed and appended to a PassManager. Each
// pass belongs to one PassKind (legalization, lowering, verification, emission), and the
// PipelineStage state machine decides which kinds may follow which. PipelineBuilder is the
// helper target machines use to assemble lists: it adds the optimisation-level dependent
// cleanups, skips verifiers when verification is disabled, and resolves layout-dependent
// passes against the descriptor's TargetData at construction time, substituting a
// layout-independent pass or failing with MissingLayout when the target has no layout.

//! Pass descriptors, pipeline stages and the pass-list builder.

use std::fmt;

use crate::ir::{Function, Partition};

use super::error::{PipelineError, PipelineResult};
use super::options::OptLevel;
use super::target::{CodeModel, DataLayout, RelocModel, TargetDescriptor};

/// Coarse classification of a pass, driving the stage machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Legalize,
    Lower,
    Verify,
    Emit,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassKind::Legalize => "legalization",
            PassKind::Lower => "lowering",
            PassKind::Verify => "verification",
            PassKind::Emit => "emission",
        })
    }
}

/// Per-run pipeline state: `Unconfigured → Legalized → Lowered → (Verified)* → Emitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Unconfigured,
    Legalized,
    Lowered,
    /// A verifier ran after the named phase.
    Verified { after: PassKind },
    Emitted,
    Failed,
}

impl PipelineStage {
    /// Stage reached by running a pass of `kind` from `self`, or `None` if that
    /// kind cannot run here. No stage is revisited.
    pub fn advance(self, kind: PassKind) -> Option<PipelineStage> {
        use PassKind as K;
        use PipelineStage as S;
        match (self, kind) {
            (S::Unconfigured | S::Legalized, K::Legalize) => Some(S::Legalized),
            (S::Legalized | S::Verified { after: K::Legalize } | S::Lowered, K::Lower) => {
                Some(S::Lowered)
            }
            (S::Legalized, K::Verify) => Some(S::Verified { after: K::Legalize }),
            (S::Lowered, K::Verify) => Some(S::Verified { after: K::Lower }),
            (S::Verified { after }, K::Verify) => Some(S::Verified { after }),
            (S::Lowered | S::Verified { after: K::Lower }, K::Emit) => Some(S::Emitted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Emitted | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Unconfigured => f.write_str("unconfigured"),
            PipelineStage::Legalized => f.write_str("legalized"),
            PipelineStage::Lowered => f.write_str("lowered"),
            PipelineStage::Verified { after } => write!(f, "verified after {after}"),
            PipelineStage::Emitted => f.write_str("emitted"),
            PipelineStage::Failed => f.write_str("failed"),
        }
    }
}

/// Which regions a pass touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionScope {
    /// Every defined region.
    All,
    /// Regions tagged `partition`, plus untagged ones when `untagged` is set.
    Tagged { partition: Partition, untagged: bool },
}

impl RegionScope {
    /// Scope of one partition on a hybrid target. `hw_default` routes
    /// untagged regions to hardware.
    pub fn partition(partition: Partition, hw_default: bool) -> Self {
        let untagged = match partition {
            Partition::Hardware => hw_default,
            Partition::Software => !hw_default,
        };
        RegionScope::Tagged { partition, untagged }
    }

    /// Declarations are never in scope.
    pub fn includes(&self, func: &Function) -> bool {
        if func.declaration {
            return false;
        }
        match *self {
            RegionScope::All => true,
            RegionScope::Tagged { partition, untagged } => match func.partition {
                Some(tag) => tag == partition,
                None => untagged,
            },
        }
    }
}

impl fmt::Display for RegionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionScope::All => f.write_str("all"),
            RegionScope::Tagged { partition, untagged } => {
                f.write_str(partition.keyword())?;
                if *untagged {
                    f.write_str("+untagged")?;
                }
                Ok(())
            }
        }
    }
}

/// Object-level settings captured by machine-code emission passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectConfig {
    pub reloc_model: RelocModel,
    pub code_model: CodeModel,
    pub layout: DataLayout,
}

/// One configured pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pass {
    PromoteMemory { scope: RegionScope },
    RejectCalls { scope: RegionScope },
    LegalizeCalls { scope: RegionScope },
    FoldConstants,
    StrengthReduce,
    EliminateDeadValues,
    /// Byte offsets for every frame slot.
    FrameLayout { scope: RegionScope, layout: DataLayout },
    /// Slot numbering only; substitute for `FrameLayout` without a layout.
    AbstractFrame { scope: RegionScope },
    /// `hardware` names the regions that must be free of memory and calls.
    VerifyLegalized { hardware: Option<RegionScope> },
    VerifyLowered,
    LowerHardware { scope: RegionScope },
    LowerSoftware { scope: RegionScope },
    EmitHardwareDescription { system_block: bool },
    EmitSoftwareObject { config: ObjectConfig },
    EmitSoftwareAssembly { config: ObjectConfig },
    /// Symbolic listing; substitute for `EmitSoftwareAssembly` without a layout.
    EmitMachineListing,
    EmitCombined { config: ObjectConfig, system_block: bool },
}

impl Pass {
    pub fn name(&self) -> &'static str {
        match self {
            Pass::PromoteMemory { .. } => "promote-memory",
            Pass::RejectCalls { .. } => "reject-calls",
            Pass::LegalizeCalls { .. } => "legalize-calls",
            Pass::FoldConstants => "fold-constants",
            Pass::StrengthReduce => "strength-reduce",
            Pass::EliminateDeadValues => "eliminate-dead-values",
            Pass::FrameLayout { .. } => "frame-layout",
            Pass::AbstractFrame { .. } => "abstract-frame",
            Pass::VerifyLegalized { .. } => "verify-legalized",
            Pass::VerifyLowered => "verify-lowered",
            Pass::LowerHardware { .. } => "lower-hardware",
            Pass::LowerSoftware { .. } => "lower-software",
            Pass::EmitHardwareDescription { .. } => "emit-hardware-description",
            Pass::EmitSoftwareObject { .. } => "emit-software-object",
            Pass::EmitSoftwareAssembly { .. } => "emit-software-assembly",
            Pass::EmitMachineListing => "emit-machine-listing",
            Pass::EmitCombined { .. } => "emit-combined",
        }
    }

    pub fn kind(&self) -> PassKind {
        match self {
            Pass::PromoteMemory { .. }
            | Pass::RejectCalls { .. }
            | Pass::LegalizeCalls { .. }
            | Pass::FoldConstants
            | Pass::StrengthReduce
            | Pass::EliminateDeadValues
            | Pass::FrameLayout { .. }
            | Pass::AbstractFrame { .. } => PassKind::Legalize,
            Pass::VerifyLegalized { .. } | Pass::VerifyLowered => PassKind::Verify,
            Pass::LowerHardware { .. } | Pass::LowerSoftware { .. } => PassKind::Lower,
            Pass::EmitHardwareDescription { .. }
            | Pass::EmitSoftwareObject { .. }
            | Pass::EmitSoftwareAssembly { .. }
            | Pass::EmitMachineListing
            | Pass::EmitCombined { .. } => PassKind::Emit,
        }
    }

    /// Whether the pass queries byte sizes or alignments.
    pub fn requires_layout(&self) -> bool {
        matches!(
            self,
            Pass::FrameLayout { .. }
                | Pass::EmitSoftwareObject { .. }
                | Pass::EmitSoftwareAssembly { .. }
                | Pass::EmitCombined { .. }
        )
    }

    pub fn scope(&self) -> Option<RegionScope> {
        match self {
            Pass::PromoteMemory { scope }
            | Pass::RejectCalls { scope }
            | Pass::LegalizeCalls { scope }
            | Pass::FrameLayout { scope, .. }
            | Pass::AbstractFrame { scope }
            | Pass::LowerHardware { scope }
            | Pass::LowerSoftware { scope } => Some(*scope),
            _ => None,
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        if let Some(scope) = self.scope() {
            write!(f, " [{scope}]")?;
        }
        Ok(())
    }
}

/// An ordered pipeline configuration, computed without touching any pass manager.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassList {
    passes: Vec<Pass>,
}

impl PassList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pass: Pass) {
        self.passes.push(pass);
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pass> {
        self.passes.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(Pass::name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.passes.iter().any(|p| p.name() == name)
    }
}

impl IntoIterator for PassList {
    type Item = Pass;
    type IntoIter = std::vec::IntoIter<Pass>;

    fn into_iter(self) -> Self::IntoIter {
        self.passes.into_iter()
    }
}

impl<'a> IntoIterator for &'a PassList {
    type Item = &'a Pass;
    type IntoIter = std::slice::Iter<'a, Pass>;

    fn into_iter(self) -> Self::IntoIter {
        self.passes.iter()
    }
}

/// Assembles a [`PassList`] for one target.
pub struct PipelineBuilder<'a> {
    target: &'a TargetDescriptor,
    passes: PassList,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(target: &'a TargetDescriptor) -> Self {
        Self {
            target,
            passes: PassList::new(),
        }
    }

    pub fn add(&mut self, pass: Pass) -> &mut Self {
        self.passes.push(pass);
        self
    }

    /// Optional cleanups selected by the optimisation level.
    pub fn add_cleanups(&mut self, opt_level: OptLevel) -> &mut Self {
        if opt_level >= OptLevel::Less {
            self.add(Pass::FoldConstants);
        }
        if opt_level >= OptLevel::Aggressive {
            self.add(Pass::StrengthReduce);
        }
        if opt_level >= OptLevel::Default {
            self.add(Pass::EliminateDeadValues);
        }
        self
    }

    pub fn add_verifier(&mut self, pass: Pass, disable_verify: bool) -> &mut Self {
        debug_assert_eq!(pass.kind(), PassKind::Verify);
        if !disable_verify {
            self.add(pass);
        }
        self
    }

    /// Add a pass that needs the target data layout. Without a layout the
    /// `fallback` is added instead; with no fallback the pipeline cannot be
    /// built.
    pub fn add_layout_pass(
        &mut self,
        name: &'static str,
        build: impl FnOnce(&DataLayout) -> Pass,
        fallback: Option<Pass>,
    ) -> PipelineResult<&mut Self> {
        match (self.target.target_data().layout(), fallback) {
            (Some(layout), _) => {
                let pass = build(layout);
                debug_assert_eq!(pass.name(), name);
                self.add(pass);
            }
            (None, Some(fallback)) => {
                debug_assert!(!fallback.requires_layout());
                log::debug!(
                    "{}: no data layout, `{name}` replaced by `{}`",
                    self.target.variant(),
                    fallback.name()
                );
                self.add(fallback);
            }
            (None, None) => {
                return Err(PipelineError::MissingLayout {
                    target: self.target.variant(),
                    pass: name,
                })
            }
        }
        Ok(self)
    }

    pub fn finish(self) -> PassList {
        self.passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(partition: Option<Partition>, declaration: bool) -> Function {
        Function {
            name: "f".to_string(),
            declaration,
            local_only: false,
            partition,
            block_begin_idx: 0,
            block_end_idx: 0,
            arg_begin_idx: 0,
            arg_end_idx: 0,
        }
    }

    #[test]
    fn stage_machine_order() {
        use PassKind::*;
        let mut stage = PipelineStage::Unconfigured;
        for kind in [Legalize, Legalize, Verify, Lower, Lower, Verify, Verify, Emit] {
            stage = stage.advance(kind).unwrap();
        }
        assert_eq!(stage, PipelineStage::Emitted);
        assert!(stage.is_terminal());
        assert_eq!(stage.advance(Emit), None);
    }

    #[test]
    fn stage_machine_rejects_backwards_moves() {
        use PassKind::*;
        assert_eq!(PipelineStage::Unconfigured.advance(Emit), None);
        assert_eq!(PipelineStage::Unconfigured.advance(Verify), None);
        assert_eq!(PipelineStage::Lowered.advance(Legalize), None);
        assert_eq!(PipelineStage::Verified { after: Lower }.advance(Lower), None);
        assert_eq!(PipelineStage::Legalized.advance(Emit), None);
        assert_eq!(PipelineStage::Failed.advance(Legalize), None);
        assert_eq!(
            PipelineStage::Verified { after: Lower }.to_string(),
            "verified after lowering"
        );
    }

    #[test]
    fn scope_routing() {
        let hw = RegionScope::partition(Partition::Hardware, false);
        let sw = RegionScope::partition(Partition::Software, false);
        let tagged_hw = func(Some(Partition::Hardware), false);
        let untagged = func(None, false);

        assert!(hw.includes(&tagged_hw));
        assert!(!sw.includes(&tagged_hw));
        assert!(sw.includes(&untagged));
        assert!(!hw.includes(&untagged));

        let hw_default = RegionScope::partition(Partition::Hardware, true);
        assert!(hw_default.includes(&untagged));
        assert!(!RegionScope::partition(Partition::Software, true).includes(&untagged));

        assert!(!RegionScope::All.includes(&func(None, true)));
    }

    #[test]
    fn layout_pass_substitution() {
        let scope = RegionScope::All;
        let no_layout = TargetDescriptor::from_triple("hwsw").unwrap();
        let mut builder = PipelineBuilder::new(&no_layout);
        builder
            .add_layout_pass(
                "frame-layout",
                |layout| Pass::FrameLayout { scope, layout: layout.clone() },
                Some(Pass::AbstractFrame { scope }),
            )
            .unwrap();
        let err = builder
            .add_layout_pass("emit-combined", |_| Pass::EmitMachineListing, None)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::MissingLayout { pass: "emit-combined", .. }));
        assert_eq!(builder.finish().names(), ["abstract-frame"]);

        let with_layout = TargetDescriptor::from_triple("hwsw-x86_64").unwrap();
        let mut builder = PipelineBuilder::new(&with_layout);
        builder
            .add_layout_pass(
                "frame-layout",
                |layout| Pass::FrameLayout { scope, layout: layout.clone() },
                Some(Pass::AbstractFrame { scope }),
            )
            .unwrap();
        let list = builder.finish();
        assert!(list.iter().all(Pass::requires_layout));
    }

    #[test]
    fn cleanups_follow_opt_level() {
        let target = TargetDescriptor::from_triple("gezel").unwrap();
        let names = |opt| {
            let mut builder = PipelineBuilder::new(&target);
            builder.add_cleanups(opt);
            builder.finish().names()
        };
        assert!(names(OptLevel::None).is_empty());
        assert_eq!(names(OptLevel::Less), ["fold-constants"]);
        assert_eq!(names(OptLevel::Default), ["fold-constants", "eliminate-dead-values"]);
        assert_eq!(
            names(OptLevel::Aggressive),
            ["fold-constants", "strength-reduce", "eliminate-dead-values"]
        );
    }
}
