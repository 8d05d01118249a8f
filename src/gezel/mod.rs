// This module is the pure-hardware backend target. Every defined IR region becomes one GEZEL
// datapath: stack memory is promoted to registers, calls are rejected, the optional cleanups
// run, the region is lowered to a datapath with an FSM controller and the design is rendered
// as GEZEL text. The GEZEL target has no data layout, so its pipeline never contains a
// layout-dependent pass and the hardware description is the only file type it emits.

//! GEZEL pure-hardware target.

use std::sync::Arc;

use crate::core::{
    FileType, OptLevel, Pass, PassList, PipelineBuilder, PipelineError, PipelineResult, RegionScope,
    TargetDescriptor, TargetVariant,
};
use crate::target_machine::EmissionPipeline;

pub mod emit;
pub mod lower;

pub use lower::HwDesign;

const SUPPORTED: &[FileType] = &[FileType::HardwareDescription];

#[derive(Debug, Clone)]
pub struct GezelTargetMachine {
    descriptor: Arc<TargetDescriptor>,
}

impl GezelTargetMachine {
    pub fn new(descriptor: Arc<TargetDescriptor>) -> Self {
        debug_assert_eq!(descriptor.variant(), TargetVariant::PureHardware);
        Self { descriptor }
    }
}

impl EmissionPipeline for GezelTargetMachine {
    fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    fn supported_file_types(&self) -> &'static [FileType] {
        SUPPORTED
    }

    fn build_passes(
        &self,
        file_type: FileType,
        opt_level: OptLevel,
        disable_verify: bool,
    ) -> PipelineResult<PassList> {
        if !self.supports(file_type) {
            return Err(PipelineError::UnsupportedFileType {
                target: TargetVariant::PureHardware,
                file_type,
                supported: FileType::HardwareDescription.name().to_string(),
            });
        }
        let scope = RegionScope::All;
        let mut builder = PipelineBuilder::new(&self.descriptor);
        builder
            .add(Pass::PromoteMemory { scope })
            .add(Pass::RejectCalls { scope })
            .add_cleanups(opt_level)
            .add_verifier(Pass::VerifyLegalized { hardware: Some(scope) }, disable_verify)
            .add(Pass::LowerHardware { scope })
            .add_verifier(Pass::VerifyLowered, disable_verify)
            .add(Pass::EmitHardwareDescription {
                system_block: self.descriptor.features().enabled("system"),
            });
        Ok(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(features: &str) -> GezelTargetMachine {
        let descriptor = TargetDescriptor::new("gezel", "", features, Default::default(), Default::default())
            .unwrap();
        GezelTargetMachine::new(Arc::new(descriptor))
    }

    #[test]
    fn pipeline_shape() {
        let passes = machine("").build_passes(FileType::HardwareDescription, OptLevel::None, false).unwrap();
        assert_eq!(
            passes.names(),
            [
                "promote-memory",
                "reject-calls",
                "verify-legalized",
                "lower-hardware",
                "verify-lowered",
                "emit-hardware-description"
            ]
        );
        assert!(passes.iter().all(|p| !p.requires_layout()));
    }

    #[test]
    fn system_feature_reaches_emitter() {
        let passes = machine("+system").build_passes(FileType::HardwareDescription, OptLevel::Aggressive, true).unwrap();
        assert!(passes.iter().any(|p| *p == Pass::EmitHardwareDescription { system_block: true }));
        assert!(!passes.contains("verify-legalized"));
        assert!(passes.contains("strength-reduce"));
    }

    #[test]
    fn build_passes_refuses_software_file_types() {
        let tm = machine("");
        for file_type in [FileType::SoftwareObject, FileType::SoftwareAssembly, FileType::Combined] {
            let err = tm.build_passes(file_type, OptLevel::Default, false).unwrap_err();
            assert!(
                matches!(err, PipelineError::UnsupportedFileType { file_type: ft, .. } if ft == file_type),
                "{err}"
            );
        }
    }
}
