//! FileCheck-style filetests for `.hir` units.
//!
//! A filetest is an IR unit whose `;` comment lines carry directives:
//!
//! ```text
//! ; RUN: hwswc --target=gezel --filetype=hdl %s
//! ; CHECK-LABEL: dp add2(
//! ; CHECK-NEXT: sig v_c : tc(64);
//! ; CHECK-NOT: fsm
//! ```
//!
//! Each `RUN:` line is parsed with the `hwswc` command line and executed in
//! process; the checks are then matched against the diagnostics followed by
//! the artifact text. `RUN: not hwswc ...` expects the run to fail and checks
//! the error message instead.

use clap::Parser;

use crate::core::OutputSink;

use super::{run, Cli, Invocation};

/// A check directive extracted from a filetest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// `CHECK:` pattern somewhere after the previous match
    Check(String),
    /// `CHECK-LABEL:` pattern, same matching as `CHECK:`
    CheckLabel(String),
    /// `CHECK-NEXT:` pattern on the line right after the previous match
    CheckNext(String),
    /// `CHECK-NOT:` pattern absent between the previous and the next match
    CheckNot(String),
    /// `CHECK-EMPTY:` next line is empty
    CheckEmpty,
    /// `COM:` ignored
    Comment(String),
}

/// A `RUN:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    /// Whether the command is prefixed with `not`.
    pub expect_failure: bool,
    pub command: String,
    pub args: Vec<String>,
}

/// Directives and IR of one filetest.
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(run_cmd) = trimmed.strip_prefix("; RUN:") {
                let mut parts = run_cmd.split_whitespace().peekable();
                let expect_failure = parts.next_if_eq(&"not").is_some();
                let Some(command) = parts.next() else {
                    return Err("empty RUN directive".to_string());
                };
                run_directives.push(RunDirective {
                    expect_failure,
                    command: command.to_string(),
                    args: parts.map(str::to_string).collect(),
                });
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(pattern.trim().to_string()));
            } else if trimmed.starts_with("; CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(comment) = trimmed.strip_prefix("; COM:") {
                check_directives.push(CheckDirective::Comment(comment.trim().to_string()));
            } else {
                ir_lines.push(line);
            }
        }

        if run_directives.is_empty() {
            return Err("filetest has no RUN directive".to_string());
        }

        Ok(TestSpec {
            run_directives,
            check_directives,
            ir_content: ir_lines.join("\n"),
        })
    }
}

/// Executes filetests in process.
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run every `RUN:` line of `spec` and validate its output.
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run_dir in &spec.run_directives {
            let output = self.execute_command(spec, run_dir)?;
            if self.verbose {
                println!("--- output of {} {}\n{output}", run_dir.command, run_dir.args.join(" "));
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    fn execute_command(&self, spec: &TestSpec, run_dir: &RunDirective) -> Result<String, String> {
        if run_dir.command != "hwswc" {
            return Err(format!("unknown RUN command `{}`", run_dir.command));
        }
        let args = std::iter::once("hwswc").chain(
            run_dir
                .args
                .iter()
                .map(|arg| if arg == "%s" { "<filetest>" } else { arg.as_str() }),
        );
        let cli = Cli::try_parse_from(args).map_err(|e| format!("bad RUN line: {e}"))?;

        let mut sink = OutputSink::memory();
        let result = Invocation::from_cli(&cli).and_then(|inv| run(&inv, &spec.ir_content, &mut sink));

        match (result, run_dir.expect_failure) {
            (Ok(out), false) => {
                let artifact = sink.into_bytes().unwrap_or_default();
                let artifact = String::from_utf8(artifact)
                    .map_err(|_| format!("`{}` output is binary and cannot be checked", cli.filetype))?;
                Ok(out.diagnostics + &artifact)
            }
            (Err(e), true) => Ok(e.to_string()),
            (Ok(_), true) => Err("RUN: not ... succeeded".to_string()),
            (Err(e), false) => Err(format!("RUN failed: {e}")),
        }
    }

    /// Validate output against check directives.
    pub fn validate_output(&self, output: &str, directives: &[CheckDirective]) -> Result<(), String> {
        let output_lines: Vec<&str> = output.lines().collect();
        let mut line_idx = 0;
        let mut pending_not: Vec<&str> = Vec::new();

        let find = |from: usize, pattern: &str| {
            output_lines
                .iter()
                .skip(from)
                .position(|line| line.contains(pattern))
                .map(|idx| from + idx)
        };
        let check_not = |pending: &mut Vec<&str>, from: usize, to: usize| -> Result<(), String> {
            for pattern in pending.drain(..) {
                if let Some(line) = output_lines[from..to].iter().find(|line| line.contains(pattern)) {
                    return Err(format!("CHECK-NOT: pattern '{pattern}' found in '{line}'"));
                }
            }
            Ok(())
        };

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => {}

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let kind = if matches!(directive, CheckDirective::CheckLabel(_)) {
                        "CHECK-LABEL"
                    } else {
                        "CHECK"
                    };
                    let Some(idx) = find(line_idx, pattern) else {
                        return Err(format!("{kind}: pattern '{pattern}' not found in output"));
                    };
                    check_not(&mut pending_not, line_idx, idx)?;
                    if self.verbose {
                        println!("{kind}: '{pattern}' found at line {idx}");
                    }
                    line_idx = idx + 1;
                }

                CheckDirective::CheckNext(pattern) => {
                    let Some(line) = output_lines.get(line_idx) else {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{pattern}'"));
                    };
                    if !line.contains(pattern.as_str()) {
                        return Err(format!("CHECK-NEXT: expected '{pattern}' but got '{line}'"));
                    }
                    check_not(&mut pending_not, line_idx, line_idx)?;
                    line_idx += 1;
                }

                CheckDirective::CheckNot(pattern) => pending_not.push(pattern),

                CheckDirective::CheckEmpty => {
                    if let Some(line) = output_lines.get(line_idx) {
                        if !line.trim().is_empty() {
                            return Err(format!("CHECK-EMPTY: expected empty line but got '{line}'"));
                        }
                        line_idx += 1;
                    }
                }
            }
        }

        check_not(&mut pending_not, line_idx.min(output_lines.len()), output_lines.len())
    }
}
