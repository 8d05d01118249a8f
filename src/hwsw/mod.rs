// This module is the hybrid hardware/software backend target. Each IR region is routed by its
// partition tag: `hw` regions take the GEZEL path (memory promotion, call rejection, datapath
// lowering) and `sw` regions take the x86-64 path (call legalization, frame assignment,
// machine lowering). Untagged regions follow the `hw-default` feature and go to software
// without it. Only the half a file type needs is configured, so an `obj` pipeline never
// lowers hardware and an `hdl` pipeline never lays out frames. Frame layout, object emission
// and the GAS listing need the target data layout: on a layout-less HWSW triple the frame pass
// falls back to abstract slot numbering and the assembly listing to the symbolic machine
// listing, while object and combined emission cannot be configured at all.

//! HWSW hybrid hardware/software target.

use std::sync::Arc;

use crate::core::{
    CodeModel, DataLayout, FileType, ObjectConfig, OptLevel, Pass, PassList, PipelineBuilder, PipelineError,
    PipelineResult, RegionScope, RelocModel, TargetDescriptor, TargetVariant,
};
use crate::ir::Partition;
use crate::target_machine::EmissionPipeline;

const SUPPORTED: &[FileType] = &[
    FileType::HardwareDescription,
    FileType::SoftwareObject,
    FileType::SoftwareAssembly,
    FileType::Combined,
];

#[derive(Debug, Clone)]
pub struct HwswTargetMachine {
    descriptor: Arc<TargetDescriptor>,
}

impl HwswTargetMachine {
    pub fn new(descriptor: Arc<TargetDescriptor>) -> Self {
        debug_assert_eq!(descriptor.variant(), TargetVariant::Hybrid);
        Self { descriptor }
    }

    /// Region scopes of the hardware and software partitions.
    pub fn partitions(&self) -> (RegionScope, RegionScope) {
        let hw_default = self.descriptor.features().enabled("hw-default");
        (
            RegionScope::partition(Partition::Hardware, hw_default),
            RegionScope::partition(Partition::Software, hw_default),
        )
    }

    fn check_models(&self, file_type: FileType) -> PipelineResult<()> {
        let emits_code = matches!(
            file_type,
            FileType::SoftwareObject | FileType::SoftwareAssembly | FileType::Combined
        );
        let reloc_model = self.descriptor.reloc_model();
        let code_model = self.descriptor.code_model();
        if emits_code && reloc_model == RelocModel::Pic && code_model == CodeModel::Large {
            return Err(PipelineError::UnsupportedConfiguration {
                target: TargetVariant::Hybrid,
                reason: format!(
                    "relocation model {reloc_model:?} with code model {code_model:?} is not supported for `{file_type}`"
                ),
            });
        }
        Ok(())
    }

    fn object_config(&self, layout: &DataLayout) -> ObjectConfig {
        ObjectConfig {
            reloc_model: self.descriptor.reloc_model(),
            code_model: self.descriptor.code_model(),
            layout: layout.clone(),
        }
    }
}

impl EmissionPipeline for HwswTargetMachine {
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
        self.check_models(file_type)?;

        let (hw, sw) = self.partitions();
        let hardware = file_type.has_hardware();
        let software = file_type.has_software();
        let system_block = self.descriptor.features().enabled("system");

        let mut builder = PipelineBuilder::new(&self.descriptor);
        if hardware {
            builder.add(Pass::PromoteMemory { scope: hw }).add(Pass::RejectCalls { scope: hw });
        }
        if software {
            builder.add(Pass::LegalizeCalls { scope: sw });
        }
        builder.add_cleanups(opt_level);
        if software {
            builder.add_layout_pass(
                "frame-layout",
                |layout| Pass::FrameLayout { scope: sw, layout: layout.clone() },
                Some(Pass::AbstractFrame { scope: sw }),
            )?;
        }
        builder.add_verifier(
            Pass::VerifyLegalized { hardware: hardware.then_some(hw) },
            disable_verify,
        );
        if hardware {
            builder.add(Pass::LowerHardware { scope: hw });
        }
        if software {
            builder.add(Pass::LowerSoftware { scope: sw });
        }
        builder.add_verifier(Pass::VerifyLowered, disable_verify);

        match file_type {
            FileType::HardwareDescription => {
                builder.add(Pass::EmitHardwareDescription { system_block });
            }
            FileType::SoftwareObject => {
                builder.add_layout_pass(
                    "emit-software-object",
                    |layout| Pass::EmitSoftwareObject { config: self.object_config(layout) },
                    None,
                )?;
            }
            FileType::SoftwareAssembly => {
                builder.add_layout_pass(
                    "emit-software-assembly",
                    |layout| Pass::EmitSoftwareAssembly { config: self.object_config(layout) },
                    Some(Pass::EmitMachineListing),
                )?;
            }
            FileType::Combined => {
                builder.add_layout_pass(
                    "emit-combined",
                    |layout| Pass::EmitCombined {
                        config: self.object_config(layout),
                        system_block,
                    },
                    None,
                )?;
            }
        }
        Ok(builder.finish())
    }
}
