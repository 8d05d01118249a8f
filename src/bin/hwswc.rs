//! `hwswc`: compile an IR unit for the GEZEL or HWSW target.
//!
//! ```text
//! hwswc --target=hwsw-x86_64 --filetype=obj -O2 -o unit.o unit.hir
//! hwswc --target=gezel --mattr=+system --print-passes unit.hir
//! ```

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use hwsw::core::{OutputSink, PipelineError, PipelineResult};
use hwsw::driver::{self, Cli, Invocation};

fn read_input(path: &Path) -> PipelineResult<String> {
    if path == Path::new("-") {
        let mut source = String::new();
        io::stdin().read_to_string(&mut source)?;
        Ok(source)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn compile(cli: &Cli) -> PipelineResult<()> {
    let invocation = Invocation::from_cli(cli)?;
    let source = read_input(&cli.input)?;

    let mut sink = match &cli.output {
        Some(path) if path != Path::new("-") => OutputSink::file(path),
        _ => OutputSink::stdout(),
    };
    log::debug!("{} -> {sink}", cli.input.display());

    let out = driver::run(&invocation, &source, &mut sink)?;
    if !out.diagnostics.is_empty() {
        let mut stderr = io::stderr().lock();
        stderr.write_all(out.diagnostics.as_bytes())?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match compile(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hwswc: {}: {e}", cli.input.display());
            if let PipelineError::Parse(_) = e {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
