//! Command line of the `hwswc` driver.
//!
//! The argument struct lives in the library so the filetest runner can parse
//! `RUN:` lines with exactly the options the binary accepts.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::core::{
    CodeModel, CodegenOptions, FileType, OptLevel, PipelineError, PipelineResult, RelocModel,
    TargetDescriptor,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "hwswc", version, about = "GEZEL and HWSW backend driver")]
pub struct Cli {
    /// IR input file, `-` for stdin
    pub input: PathBuf,

    /// Target triple (`gezel`, `hwsw`, `hwsw-x86_64`)
    #[arg(long, default_value = "hwsw-x86_64")]
    pub target: String,

    /// Target CPU
    #[arg(long = "mcpu", default_value = "")]
    pub mcpu: String,

    /// Target features, e.g. `+system,+hw-default`
    #[arg(long = "mattr", default_value = "", allow_hyphen_values = true)]
    pub mattr: String,

    #[arg(long = "relocation-model", default_value = "static")]
    pub relocation_model: RelocModel,

    #[arg(long = "code-model", default_value = "small")]
    pub code_model: CodeModel,

    /// Optimisation level (0-3)
    #[arg(short = 'O', default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub opt_level: u8,

    /// Output kind: hdl, obj, asm or combined
    #[arg(long, default_value = "hdl")]
    pub filetype: FileType,

    #[arg(long = "disable-verify")]
    pub disable_verify: bool,

    /// Print the configured pass pipeline
    #[arg(long = "print-passes")]
    pub print_passes: bool,

    /// Print the parsed IR before running the pipeline
    #[arg(long = "print-ir")]
    pub print_ir: bool,

    /// Print pipeline statistics after the run
    #[arg(long)]
    pub stats: bool,

    /// Output file, stdout when omitted or `-`
    #[arg(short = 'o')]
    pub output: Option<PathBuf>,
}

/// Resolved driver configuration.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub descriptor: Arc<TargetDescriptor>,
    pub options: CodegenOptions,
    pub print_passes: bool,
    pub print_ir: bool,
    pub stats: bool,
}

impl Invocation {
    pub fn from_cli(cli: &Cli) -> PipelineResult<Self> {
        let descriptor = TargetDescriptor::new(
            &cli.target,
            &cli.mcpu,
            &cli.mattr,
            cli.relocation_model,
            cli.code_model,
        )?;
        let opt_level = OptLevel::from_level(cli.opt_level).ok_or_else(|| {
            PipelineError::Parse(format!("invalid optimisation level -O{}", cli.opt_level))
        })?;
        let options = CodegenOptions::new(cli.filetype)
            .with_opt_level(opt_level)
            .with_verify(!cli.disable_verify);

        Ok(Self {
            descriptor: Arc::new(descriptor),
            options,
            print_passes: cli.print_passes,
            print_ir: cli.print_ir,
            stats: cli.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["hwswc", "unit.hir"]).unwrap();
        let inv = Invocation::from_cli(&cli).unwrap();
        assert_eq!(inv.descriptor.triple(), "hwsw-x86_64");
        assert_eq!(inv.options.file_type, FileType::HardwareDescription);
        assert_eq!(inv.options.opt_level, OptLevel::Default);
        assert!(!inv.options.disable_verify);
        assert!(cli.output.is_none());
    }

    #[test]
    fn full_command_line() {
        let cli = Cli::try_parse_from([
            "hwswc",
            "--target=gezel",
            "--mattr=+system",
            "--relocation-model=pic",
            "--code-model=large",
            "-O3",
            "--filetype=asm",
            "--disable-verify",
            "--print-passes",
            "-o",
            "out.fdl",
            "unit.hir",
        ])
        .unwrap();
        let inv = Invocation::from_cli(&cli).unwrap();
        assert!(inv.descriptor.features().enabled("system"));
        assert_eq!(inv.descriptor.reloc_model(), RelocModel::Pic);
        assert_eq!(inv.descriptor.code_model(), CodeModel::Large);
        assert_eq!(inv.options.opt_level, OptLevel::Aggressive);
        assert_eq!(inv.options.file_type, FileType::SoftwareAssembly);
        assert!(inv.options.disable_verify);
        assert!(inv.print_passes);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cli::try_parse_from(["hwswc", "--filetype=exe", "x.hir"]).is_err());
        assert!(Cli::try_parse_from(["hwswc", "-O7", "x.hir"]).is_err());
        let cli = Cli::try_parse_from(["hwswc", "--target=arm", "x.hir"]).unwrap();
        assert!(matches!(Invocation::from_cli(&cli), Err(PipelineError::InvalidTriple { .. })));
    }
}
