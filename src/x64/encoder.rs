// This module encodes lowered software functions into x86-64 machine code using the
// iced-x86 code assembler. X64Encoder walks the MInst stream of one function, resolving frame
// slots to rbp-relative memory operands through the laid-out Frame and machine labels to
// CodeLabels, and assembles the function at address zero so its bytes are position
// independent apart from calls. Calls are emitted as raw bytes with a zero displacement (a
// rel32 `call` for the small, medium and kernel code models, a `movabs rax, imm64` followed
// by `call rax` for the large model) and the finished code is decoded again to find the
// exact byte offsets the object writer must relocate. Every operand is loaded through rax
// and rcx, so the encoder never needs a register allocator.

//! x86-64 instruction encoding using iced-x86.

use hashbrown::HashMap;
use iced_x86::code_asm::{registers::cl, *};
use iced_x86::{Code, Decoder, DecoderOptions, IcedError, Instruction, Register};
use thiserror::Error;

use crate::core::CodeModel;
use crate::passes::Frame;

use super::lower::{AluOp, Cond, Gpr, MInst, SwFunction};

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("slot {0} has no frame offset, the frame was not laid out")]
    UnplacedSlot(u32),
    #[error("frame of {0} bytes does not fit a 32-bit displacement")]
    FrameTooLarge(u32),
    #[error("found {found} call sites, expected {expected}")]
    CallSiteMismatch { found: usize, expected: usize },
    #[error("assembly error: {0}")]
    Assembly(String),
}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::Assembly(e.to_string())
}

/// How a call site's displacement must be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// 32-bit pc-relative displacement of a `call rel32`.
    Rel32,
    /// 64-bit absolute address loaded by `movabs`.
    Abs64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Offset of the field to patch, from the function start.
    pub offset: u64,
    /// Offset of the instruction containing the field.
    pub inst_offset: u64,
    pub symbol: String,
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFunction {
    pub code: Vec<u8>,
    pub call_sites: Vec<CallSite>,
}

/// x86-64 instruction encoder for one function.
pub struct X64Encoder<'f> {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    frame: &'f Frame<'f>,
    code_model: CodeModel,
    /// Labels by machine label number.
    labels: HashMap<u32, CodeLabel>,
    /// Callees in emission order.
    calls: Vec<String>,
}

impl<'f> X64Encoder<'f> {
    pub fn new(frame: &'f Frame<'f>, code_model: CodeModel) -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self {
            assembler,
            frame,
            code_model,
            labels: HashMap::new(),
            calls: Vec::new(),
        })
    }

    fn slot(&self, slot: u32) -> Result<AsmMemoryOperand, EncodingError> {
        let offset = self.frame.offset(slot).ok_or(EncodingError::UnplacedSlot(slot))?;
        Ok(qword_ptr(rbp + offset))
    }

    fn label(&mut self, label: u32) -> CodeLabel {
        if let Some(&existing) = self.labels.get(&label) {
            return existing;
        }
        let created = self.assembler.create_label();
        self.labels.insert(label, created);
        created
    }

    fn gpr(reg: Gpr) -> AsmRegister64 {
        match reg {
            Gpr::Rax => rax,
            Gpr::Rcx => rcx,
            Gpr::Rdx => rdx,
            Gpr::Rsi => rsi,
            Gpr::Rdi => rdi,
            Gpr::R8 => r8,
            Gpr::R9 => r9,
        }
    }

    /// mov rax, [slot]
    fn load_rax(&mut self, slot: u32) -> Result<(), EncodingError> {
        let mem = self.slot(slot)?;
        self.assembler.mov(rax, mem).map_err(asm_err)
    }

    /// mov [slot], rax
    fn store_rax(&mut self, slot: u32) -> Result<(), EncodingError> {
        let mem = self.slot(slot)?;
        self.assembler.mov(mem, rax).map_err(asm_err)
    }

    pub fn emit(&mut self, inst: &MInst) -> Result<(), EncodingError> {
        match *inst {
            MInst::Prologue => {
                let size = self.frame.size().unwrap_or(0);
                let size_imm = i32::try_from(size).map_err(|_| EncodingError::FrameTooLarge(size))?;
                self.assembler.push(rbp).map_err(asm_err)?;
                self.assembler.mov(rbp, rsp).map_err(asm_err)?;
                if size_imm > 0 {
                    self.assembler.sub(rsp, size_imm).map_err(asm_err)?;
                }
            }
            MInst::StoreArg { reg, slot } => {
                let mem = self.slot(slot)?;
                self.assembler.mov(mem, Self::gpr(reg)).map_err(asm_err)?;
            }
            MInst::LoadArg { reg, slot } => {
                let mem = self.slot(slot)?;
                self.assembler.mov(Self::gpr(reg), mem).map_err(asm_err)?;
            }
            MInst::MovImm { dst, imm } => {
                self.assembler.mov(rax, imm).map_err(asm_err)?;
                self.store_rax(dst)?;
            }
            MInst::Copy { dst, src } => {
                self.load_rax(src)?;
                self.store_rax(dst)?;
            }
            MInst::AddrOf { dst, storage } => {
                let mem = self.slot(storage)?;
                self.assembler.lea(rax, mem).map_err(asm_err)?;
                self.store_rax(dst)?;
            }
            MInst::LoadInd { dst, ptr } => {
                self.load_rax(ptr)?;
                self.assembler.mov(rax, qword_ptr(rax)).map_err(asm_err)?;
                self.store_rax(dst)?;
            }
            MInst::StoreInd { ptr, value } => {
                self.load_rax(ptr)?;
                let mem = self.slot(value)?;
                self.assembler.mov(rcx, mem).map_err(asm_err)?;
                self.assembler.mov(qword_ptr(rax), rcx).map_err(asm_err)?;
            }
            MInst::Alu { op, dst, lhs, rhs } => {
                self.load_rax(lhs)?;
                let mem = self.slot(rhs)?;
                self.assembler.mov(rcx, mem).map_err(asm_err)?;
                let result = match op {
                    AluOp::Add => self.assembler.add(rax, rcx),
                    AluOp::Sub => self.assembler.sub(rax, rcx),
                    AluOp::Imul => self.assembler.imul_2(rax, rcx),
                    AluOp::And => self.assembler.and(rax, rcx),
                    AluOp::Or => self.assembler.or(rax, rcx),
                    AluOp::Xor => self.assembler.xor(rax, rcx),
                    AluOp::Shl => self.assembler.shl(rax, cl),
                    AluOp::Shr => self.assembler.shr(rax, cl),
                };
                result.map_err(asm_err)?;
                self.store_rax(dst)?;
            }
            MInst::SetCc { cond, dst, lhs, rhs } => {
                self.load_rax(lhs)?;
                let mem = self.slot(rhs)?;
                self.assembler.cmp(rax, mem).map_err(asm_err)?;
                let result = match cond {
                    Cond::E => self.assembler.sete(al),
                    Cond::Ne => self.assembler.setne(al),
                    Cond::L => self.assembler.setl(al),
                };
                result.map_err(asm_err)?;
                self.assembler.movzx(eax, al).map_err(asm_err)?;
                self.store_rax(dst)?;
            }
            MInst::Select { dst, cond, if_true, if_false } => {
                self.load_rax(if_false)?;
                let cond_mem = self.slot(cond)?;
                self.assembler.mov(rcx, cond_mem).map_err(asm_err)?;
                self.assembler.test(rcx, rcx).map_err(asm_err)?;
                let true_mem = self.slot(if_true)?;
                self.assembler.cmovne(rax, true_mem).map_err(asm_err)?;
                self.store_rax(dst)?;
            }
            MInst::Call { ref symbol, result } => {
                match self.code_model {
                    CodeModel::Large => {
                        // movabs rax, 0 ; call rax
                        self.assembler
                            .db(&[0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0])
                            .map_err(asm_err)?;
                        self.assembler.call(rax).map_err(asm_err)?;
                    }
                    _ => {
                        self.assembler.db(&[0xE8, 0, 0, 0, 0]).map_err(asm_err)?;
                    }
                }
                self.calls.push(symbol.clone());
                if let Some(result) = result {
                    self.store_rax(result)?;
                }
            }
            MInst::Label(label) => {
                let mut code_label = self.label(label);
                self.assembler.set_label(&mut code_label).map_err(asm_err)?;
                self.labels.insert(label, code_label);
            }
            MInst::Jmp(label) => {
                let target = self.label(label);
                self.assembler.jmp(target).map_err(asm_err)?;
            }
            MInst::JumpIfZero { cond, target } => {
                self.load_rax(cond)?;
                self.assembler.test(rax, rax).map_err(asm_err)?;
                let target = self.label(target);
                self.assembler.je(target).map_err(asm_err)?;
            }
            MInst::Return { value } => {
                if let Some(value) = value {
                    self.load_rax(value)?;
                }
                self.assembler.mov(rsp, rbp).map_err(asm_err)?;
                self.assembler.pop(rbp).map_err(asm_err)?;
                self.assembler.ret().map_err(asm_err)?;
            }
        }
        Ok(())
    }

    /// Assemble the function at address zero and locate its call sites.
    pub fn finish(mut self) -> Result<EncodedFunction, EncodingError> {
        let code = self.assembler.assemble(0).map_err(asm_err)?;
        let sites = find_call_sites(&code);
        if sites.len() != self.calls.len() {
            return Err(EncodingError::CallSiteMismatch {
                found: sites.len(),
                expected: self.calls.len(),
            });
        }
        let call_sites = sites
            .into_iter()
            .zip(self.calls)
            .map(|((offset, inst_offset, kind), symbol)| CallSite {
                offset,
                inst_offset,
                symbol,
                kind,
            })
            .collect();
        Ok(EncodedFunction { code, call_sites })
    }
}

/// `(field offset, instruction offset, kind)` of every unresolved call.
fn find_call_sites(code: &[u8]) -> Vec<(u64, u64, CallKind)> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut sites = Vec::new();
    let mut prev: Option<Instruction> = None;
    let mut instr = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        match instr.code() {
            Code::Call_rel32_64 if instr.near_branch64() == instr.next_ip() => {
                sites.push((instr.ip() + 1, instr.ip(), CallKind::Rel32));
            }
            Code::Call_rm64 if instr.op0_register() == Register::RAX => {
                if let Some(mov) = prev.filter(|p| {
                    p.code() == Code::Mov_r64_imm64 && p.op0_register() == Register::RAX && p.immediate64() == 0
                }) {
                    sites.push((mov.ip() + 2, mov.ip(), CallKind::Abs64));
                }
            }
            _ => {}
        }
        prev = Some(instr);
    }
    sites
}

/// Encode one lowered function against its laid-out frame.
pub fn encode_function(
    function: &SwFunction,
    frame: &Frame<'_>,
    code_model: CodeModel,
) -> Result<EncodedFunction, EncodingError> {
    if !frame.is_laid_out() {
        return Err(EncodingError::UnplacedSlot(0));
    }
    let mut encoder = X64Encoder::new(frame, code_model)?;
    for inst in &function.insts {
        encoder.emit(inst)?;
    }
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompilationSession, DataLayout, RegionScope};
    use crate::ir::Module;
    use crate::passes::frame::build_frame;
    use crate::x64::lower::lower_module;
    use bumpalo::Bump;

    fn encode(text: &str, code_model: CodeModel, laid_out: bool) -> Result<EncodedFunction, EncodingError> {
        let module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let func_idx = crate::passes::regions(&module, RegionScope::All)[0];
        let layout = DataLayout::x86_64();
        let frame = build_frame(&module, func_idx, laid_out.then_some(&layout), &arena).unwrap();
        let mut frames = HashMap::new();
        frames.insert(func_idx, frame);
        let program = lower_module(&module, &frames, RegionScope::All, &session).unwrap();
        encode_function(&program.functions[0], &frames[&func_idx], code_model)
    }

    fn decode(code: &[u8]) -> Vec<Code> {
        let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        decoder.iter().map(|i| i.code()).collect()
    }

    #[test]
    fn prologue_body_epilogue() {
        let encoded = encode("add2(%a, %b) {\nentry:\n  %c = add %a, %b\n  ret %c\n}\n", CodeModel::Small, true).unwrap();
        // push rbp; mov rbp, rsp
        assert_eq!(&encoded.code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(*encoded.code.last().unwrap(), 0xC3);
        let codes = decode(&encoded.code);
        assert!(codes.contains(&Code::Add_r64_rm64) || codes.contains(&Code::Add_rm64_r64));
        assert_eq!(codes.last(), Some(&Code::Retnq));
        assert!(encoded.call_sites.is_empty());
    }

    #[test]
    fn rel32_call_sites() {
        let encoded = encode(
            "ext(%x)!\nf(%a) {\nentry:\n  %r = call @ext, %a\n  %s = call @ext, %r\n  ret %s\n}\n",
            CodeModel::Small,
            true,
        )
        .unwrap();
        assert_eq!(encoded.call_sites.len(), 2);
        for site in &encoded.call_sites {
            assert_eq!(site.symbol, "ext");
            assert_eq!(site.kind, CallKind::Rel32);
            assert_eq!(encoded.code[site.inst_offset as usize], 0xE8);
            assert_eq!(site.offset, site.inst_offset + 1);
        }
    }

    #[test]
    fn large_model_uses_absolute_calls() {
        let encoded = encode("ext()!\nf() {\nentry:\n  %r = call @ext\n  ret %r\n}\n", CodeModel::Large, true).unwrap();
        let site = &encoded.call_sites[0];
        assert_eq!(site.kind, CallKind::Abs64);
        assert_eq!(&encoded.code[site.inst_offset as usize..site.offset as usize], &[0x48, 0xB8]);
    }

    #[test]
    fn branches_and_phis_encode() {
        let encoded = encode(
            r#"
f(%a, %b) {
entry:
  %c = lt %a, %b
  condbr %c, ^x, ^y
x:
  br ^y
y:
  %p = phi [^entry, %a], [^x, %b]
  %q = select %c, %p, %b
  ret %q
}
"#,
            CodeModel::Small,
            true,
        )
        .unwrap();
        let codes = decode(&encoded.code);
        assert!(codes.contains(&Code::Setl_rm8));
        assert!(codes.contains(&Code::Cmovne_r64_rm64));
        assert!(codes.iter().any(|c| matches!(c, Code::Je_rel8_64 | Code::Je_rel32_64)));
    }

    #[test]
    fn abstract_frames_cannot_be_encoded() {
        let err = encode("f() {\nentry:\n  terminate\n}\n", CodeModel::Small, false).unwrap_err();
        assert!(matches!(err, EncodingError::UnplacedSlot(_)));
    }
}
