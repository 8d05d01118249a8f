// This module is the seam between the two backend targets and their callers. EmissionPipeline
// is implemented once per variant (GezelTargetMachine for pure hardware, HwswTargetMachine for
// hybrid hardware/software) and supplies a descriptor, the set of file types the target can
// emit, and a pure pass-list builder. The provided add_passes_to_emit_file method is the single
// emission entry point: it rejects unsupported file types up front, asks the target for its
// pass list, and appends the list to the caller's PassManager only once the whole list was
// built, so a configuration error never leaves a half-configured pass manager behind.
// TargetMachine is the closed enum callers hold when the variant is only known at run time.

//! Target machines and the emission entry point.

use std::fmt;
use std::sync::Arc;

use crate::core::{
    FileType, OptLevel, PassList, PassManager, PipelineError, PipelineResult, TargetDescriptor,
    TargetVariant,
};
use crate::gezel::GezelTargetMachine;
use crate::hwsw::HwswTargetMachine;

/// One backend target's pipeline configuration.
pub trait EmissionPipeline {
    fn descriptor(&self) -> &TargetDescriptor;

    /// File types `add_passes_to_emit_file` accepts.
    fn supported_file_types(&self) -> &'static [FileType];

    /// Pass list for a supported file type. Must not have side effects.
    fn build_passes(
        &self,
        file_type: FileType,
        opt_level: OptLevel,
        disable_verify: bool,
    ) -> PipelineResult<PassList>;

    fn supports(&self, file_type: FileType) -> bool {
        self.supported_file_types().contains(&file_type)
    }

    /// Append the passes that emit `file_type` to `pm`.
    ///
    /// On error `pm` is left exactly as it was.
    fn add_passes_to_emit_file(
        &self,
        pm: &mut PassManager,
        file_type: FileType,
        opt_level: OptLevel,
        disable_verify: bool,
    ) -> PipelineResult<()> {
        let target = self.descriptor().variant();
        if !self.supports(file_type) {
            let supported: Vec<&str> = self.supported_file_types().iter().map(|ft| ft.name()).collect();
            return Err(PipelineError::UnsupportedFileType {
                target,
                file_type,
                supported: supported.join(", "),
            });
        }

        let passes = self.build_passes(file_type, opt_level, disable_verify)?;
        log::debug!(
            "{target}: {} passes for `{file_type}` at {opt_level:?}{}",
            passes.len(),
            if disable_verify { ", verification disabled" } else { "" }
        );
        pm.append(target, passes);
        Ok(())
    }
}

/// Either backend target, selected by the descriptor's variant.
#[derive(Debug, Clone)]
pub enum TargetMachine {
    Gezel(GezelTargetMachine),
    Hwsw(HwswTargetMachine),
}

impl TargetMachine {
    pub fn new(descriptor: Arc<TargetDescriptor>) -> Self {
        match descriptor.variant() {
            TargetVariant::PureHardware => TargetMachine::Gezel(GezelTargetMachine::new(descriptor)),
            TargetVariant::Hybrid => TargetMachine::Hwsw(HwswTargetMachine::new(descriptor)),
        }
    }

    /// Parse `triple` with default CPU, features and models.
    pub fn from_triple(triple: &str) -> PipelineResult<Self> {
        Ok(Self::new(Arc::new(TargetDescriptor::from_triple(triple)?)))
    }

    fn pipeline(&self) -> &dyn EmissionPipeline {
        match self {
            TargetMachine::Gezel(tm) => tm,
            TargetMachine::Hwsw(tm) => tm,
        }
    }
}

impl EmissionPipeline for TargetMachine {
    fn descriptor(&self) -> &TargetDescriptor {
        self.pipeline().descriptor()
    }

    fn supported_file_types(&self) -> &'static [FileType] {
        self.pipeline().supported_file_types()
    }

    fn build_passes(
        &self,
        file_type: FileType,
        opt_level: OptLevel,
        disable_verify: bool,
    ) -> PipelineResult<PassList> {
        self.pipeline().build_passes(file_type, opt_level, disable_verify)
    }
}

impl fmt::Display for TargetMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let descriptor = self.descriptor();
        write!(f, "{} ({}, cpu {})", descriptor.triple(), descriptor.variant(), descriptor.cpu())
    }
}
