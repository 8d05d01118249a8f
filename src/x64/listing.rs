//! Assembly listings of the software fragment.
//!
//! [`gas_listing`] encodes every function exactly like the object writer
//! does and disassembles the result with iced-x86's GAS formatter, so the
//! listing shows the bytes an object would contain. Branch targets are named
//! with local labels and call sites with their callee. [`machine_listing`]
//! prints the lowered machine instructions over frame slots; it needs no
//! layout and is what `emit-machine-listing` writes.

use std::fmt::Write;

use hashbrown::HashMap;
use iced_x86::{
    Decoder, DecoderOptions, Formatter, GasFormatter, Instruction, SymbolResolver, SymbolResult,
};

use crate::core::{CompilationSession, ObjectConfig, RelocModel};
use crate::passes::{Frame, PassOutcome, RegionFailure};

use super::encoder::{encode_function, CallKind};
use super::lower::SwProgram;

/// Names for the addresses of one function.
struct ListingSymbols {
    /// Local labels by branch target offset.
    labels: HashMap<u64, String>,
    /// Callees by call instruction offset.
    calls: HashMap<u64, String>,
}

impl SymbolResolver for ListingSymbols {
    fn symbol(
        &mut self,
        instruction: &Instruction,
        _operand: u32,
        _instruction_operand: Option<u32>,
        address: u64,
        _address_size: u32,
    ) -> Option<SymbolResult<'_>> {
        if let Some(callee) = self.calls.get(&instruction.ip()) {
            return Some(SymbolResult::with_str(address, callee.as_str()));
        }
        if instruction.is_jmp_short_or_near() || instruction.is_jcc_short_or_near() {
            return self
                .labels
                .get(&address)
                .map(|label| SymbolResult::with_str(address, label.as_str()));
        }
        None
    }
}

/// GAS syntax listing of the encoded software fragment.
pub fn gas_listing(
    program: &SwProgram,
    frames: &HashMap<u32, Frame<'_>>,
    config: &ObjectConfig,
    session: &CompilationSession<'_>,
) -> PassOutcome<String> {
    let mut out = String::new();
    out.push_str("\t.text\n");

    for (index, function) in program.functions.iter().enumerate() {
        let frame = frames
            .get(&function.func_idx)
            .ok_or_else(|| RegionFailure::new(function.name.as_str(), "function has no frame"))?;
        session.enter_region(&function.name);
        let encoded = encode_function(function, frame, config.code_model);
        session.leave_region();
        let encoded = encoded.map_err(|e| RegionFailure::new(function.name.as_str(), e.to_string()))?;
        session.record_code_size(encoded.code.len());

        let mut instructions = Vec::new();
        let mut decoder = Decoder::with_ip(64, &encoded.code, 0, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            instructions.push(instr);
        }

        let mut labels = HashMap::new();
        for instr in &instructions {
            if instr.is_jmp_short_or_near() || instr.is_jcc_short_or_near() {
                let target = instr.near_branch64();
                let next = labels.len();
                labels
                    .entry(target)
                    .or_insert_with(|| format!(".L{index}_{next}"));
            }
        }
        let plt = config.reloc_model == RelocModel::Pic;
        let calls: HashMap<u64, String> = encoded
            .call_sites
            .iter()
            .map(|site| {
                let name = match site.kind {
                    CallKind::Rel32 if plt => format!("{}@PLT", site.symbol),
                    _ => site.symbol.clone(),
                };
                (site.inst_offset, name)
            })
            .collect();

        if !function.local {
            let _ = writeln!(out, "\t.globl\t{}", function.name);
        }
        let _ = writeln!(out, "\t.p2align\t4");
        let _ = writeln!(out, "\t.type\t{},@function", function.name);
        let _ = writeln!(out, "{}:", function.name);

        let mut formatter = GasFormatter::with_options(
            Some(Box::new(ListingSymbols {
                labels: labels.clone(),
                calls,
            })),
            None,
        );
        for instr in &instructions {
            if let Some(label) = labels.get(&instr.ip()) {
                let _ = writeln!(out, "{label}:");
            }
            let mut text = String::new();
            formatter.format(instr, &mut text);
            let _ = writeln!(out, "\t{text}");
        }
        let _ = writeln!(out, "\t.size\t{0}, .-{0}", function.name);
        out.push('\n');
    }

    Ok(out)
}

/// Symbolic listing of the lowered machine instructions.
pub fn machine_listing(program: &SwProgram) -> String {
    let mut out = String::new();
    for function in &program.functions {
        let visibility = if function.local { "local" } else { "global" };
        let _ = writeln!(out, "{}: ; {visibility}", function.name);
        for inst in &function.insts {
            match inst {
                super::lower::MInst::Label(_) => {
                    let _ = writeln!(out, "{inst}");
                }
                _ => {
                    let _ = writeln!(out, "    {inst}");
                }
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CodeModel, DataLayout, RegionScope};
    use crate::ir::Module;
    use crate::passes::frame::build_frame;
    use crate::x64::lower::lower_module;
    use bumpalo::Bump;

    const UNIT: &str = r#"
ext(%x)!
f(%a, %b) {
entry:
  %c = lt %a, %b
  condbr %c, ^x, ^y
x:
  %r = call @ext, %a
  br ^y
y:
  ret %b
}
"#;

    fn listing(laid_out: bool, reloc_model: RelocModel) -> Result<String, RegionFailure> {
        let module = Module::parse(UNIT).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let layout = DataLayout::x86_64();
        let mut frames = HashMap::new();
        for f in crate::passes::regions(&module, RegionScope::All) {
            frames.insert(f, build_frame(&module, f, laid_out.then_some(&layout), &arena).unwrap());
        }
        let program = lower_module(&module, &frames, RegionScope::All, &session).unwrap();
        if !laid_out {
            return Ok(machine_listing(&program));
        }
        let config = ObjectConfig { reloc_model, code_model: CodeModel::Small, layout };
        gas_listing(&program, &frames, &config, &session)
    }

    #[test]
    fn gas_listing_names_labels_and_callees() {
        let text = listing(true, RelocModel::Static).unwrap();
        assert!(text.starts_with("\t.text\n"));
        assert!(text.contains("\t.globl\tf\n"));
        assert!(text.contains("f:\n"));
        assert!(text.contains("\t.size\tf, .-f\n"));
        assert!(text.contains("push"));
        assert!(text.contains("%rbp"));
        assert!(text.contains("ext"));
        assert!(text.contains(".L0_"));
    }

    #[test]
    fn pic_calls_go_through_plt() {
        let text = listing(true, RelocModel::Pic).unwrap();
        assert!(text.contains("ext@PLT"));
    }

    #[test]
    fn machine_listing_is_symbolic() {
        let text = listing(false, RelocModel::Static).unwrap();
        assert!(text.starts_with("f: ; global\n"));
        assert!(text.contains("    prologue\n"));
        assert!(text.contains("    load.arg rdi, s0\n"));
        assert!(text.contains("    call s3, @ext\n"));
        assert!(text.contains(".L2:\n"));
        assert!(!text.contains("%rbp"));
    }
}
