// This module lowers software regions into a small x86-64 machine IR. Code generation is
// deliberately frame-based: every SSA value lives in the frame slot the frame pass gave it,
// and each machine instruction loads its operands into rax/rcx, computes, and stores the
// result back, so no register allocation is needed and the lowering is independent of
// whether the frame has byte offsets yet. Arguments arrive in the SysV registers and are
// spilled by the prologue; calls load their arguments back into the same registers. Block
// labels are numbered relative to the region's first block; conditional branches get one
// extra label for their false edge. Phi operands are copied along each edge in two phases
// through per-phi scratch slots, which keeps the copies parallel.

//! IR to x86-64 machine instruction lowering.

use std::fmt;

use hashbrown::{HashMap, HashSet};

use crate::core::{CompilationSession, RegionScope};
use crate::ir::{Module, Operation};
use crate::passes::{each_region, Frame, PassOutcome, RegionFailure};

/// Registers used by the lowered code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    R8,
    R9,
}

impl Gpr {
    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
        }
    }
}

/// SysV integer argument registers, in order.
pub const ARG_REGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Imul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl AluOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Imul => "imul",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
}

impl Cond {
    pub const fn suffix(self) -> &'static str {
        match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
        }
    }
}

/// Machine instruction over frame slots. Slot operands are frame slot
/// indices, labels are function-local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MInst {
    /// Establish rbp and reserve the frame.
    Prologue,
    /// Spill an incoming argument register.
    StoreArg { reg: Gpr, slot: u32 },
    /// Load an outgoing call argument.
    LoadArg { reg: Gpr, slot: u32 },
    MovImm { dst: u32, imm: i64 },
    Copy { dst: u32, src: u32 },
    /// Address of a storage slot.
    AddrOf { dst: u32, storage: u32 },
    LoadInd { dst: u32, ptr: u32 },
    StoreInd { ptr: u32, value: u32 },
    Alu { op: AluOp, dst: u32, lhs: u32, rhs: u32 },
    SetCc { cond: Cond, dst: u32, lhs: u32, rhs: u32 },
    Select { dst: u32, cond: u32, if_true: u32, if_false: u32 },
    Call { symbol: String, result: Option<u32> },
    Label(u32),
    Jmp(u32),
    JumpIfZero { cond: u32, target: u32 },
    Return { value: Option<u32> },
}

impl MInst {
    /// Frame slots the instruction reads or writes.
    pub fn slots(&self) -> Vec<u32> {
        match *self {
            MInst::StoreArg { slot, .. } | MInst::LoadArg { slot, .. } => vec![slot],
            MInst::MovImm { dst, .. } => vec![dst],
            MInst::Copy { dst, src } => vec![dst, src],
            MInst::AddrOf { dst, storage } => vec![dst, storage],
            MInst::LoadInd { dst, ptr } => vec![dst, ptr],
            MInst::StoreInd { ptr, value } => vec![ptr, value],
            MInst::Alu { dst, lhs, rhs, .. } | MInst::SetCc { dst, lhs, rhs, .. } => vec![dst, lhs, rhs],
            MInst::Select { dst, cond, if_true, if_false } => vec![dst, cond, if_true, if_false],
            MInst::Call { result, .. } => result.into_iter().collect(),
            MInst::JumpIfZero { cond, .. } => vec![cond],
            MInst::Return { value } => value.into_iter().collect(),
            MInst::Prologue | MInst::Label(_) | MInst::Jmp(_) => Vec::new(),
        }
    }

    pub fn jump_target(&self) -> Option<u32> {
        match *self {
            MInst::Jmp(target) | MInst::JumpIfZero { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for MInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MInst::Prologue => write!(f, "prologue"),
            MInst::StoreArg { reg, slot } => write!(f, "store.arg s{slot}, {}", reg.name()),
            MInst::LoadArg { reg, slot } => write!(f, "load.arg {}, s{slot}", reg.name()),
            MInst::MovImm { dst, imm } => write!(f, "mov s{dst}, {imm}"),
            MInst::Copy { dst, src } => write!(f, "copy s{dst}, s{src}"),
            MInst::AddrOf { dst, storage } => write!(f, "addr s{dst}, &s{storage}"),
            MInst::LoadInd { dst, ptr } => write!(f, "load s{dst}, [s{ptr}]"),
            MInst::StoreInd { ptr, value } => write!(f, "store [s{ptr}], s{value}"),
            MInst::Alu { op, dst, lhs, rhs } => write!(f, "{} s{dst}, s{lhs}, s{rhs}", op.mnemonic()),
            MInst::SetCc { cond, dst, lhs, rhs } => write!(f, "set{} s{dst}, s{lhs}, s{rhs}", cond.suffix()),
            MInst::Select { dst, cond, if_true, if_false } => {
                write!(f, "select s{dst}, s{cond}, s{if_true}, s{if_false}")
            }
            MInst::Call { symbol, result: Some(result) } => write!(f, "call s{result}, @{symbol}"),
            MInst::Call { symbol, result: None } => write!(f, "call @{symbol}"),
            MInst::Label(label) => write!(f, ".L{label}:"),
            MInst::Jmp(label) => write!(f, "jmp .L{label}"),
            MInst::JumpIfZero { cond, target } => write!(f, "jz s{cond}, .L{target}"),
            MInst::Return { value: Some(value) } => write!(f, "ret s{value}"),
            MInst::Return { value: None } => write!(f, "ret"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwFunction {
    pub name: String,
    /// Index of the region in the module, which keys its frame.
    pub func_idx: u32,
    /// Not visible outside the object.
    pub local: bool,
    pub insts: Vec<MInst>,
    pub label_count: u32,
}

/// Lowered software fragment of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwProgram {
    pub functions: Vec<SwFunction>,
}

impl SwProgram {
    pub fn defines(&self, symbol: &str) -> bool {
        self.functions.iter().any(|f| f.name == symbol)
    }
}

/// `lower-software`
pub fn lower_module(
    module: &Module,
    frames: &HashMap<u32, Frame<'_>>,
    scope: RegionScope,
    session: &CompilationSession<'_>,
) -> PassOutcome<SwProgram> {
    let functions = each_region(module, scope, session, |func_idx| {
        let Some(frame) = frames.get(&func_idx) else {
            return Err("no frame assigned to software region".to_string());
        };
        let function = FunctionLowering::new(module, func_idx, frame).lower()?;
        log::debug!(
            "{}: {} machine instructions",
            function.name,
            function.insts.len()
        );
        session.record_software_region();
        Ok(function)
    })?;
    Ok(SwProgram { functions })
}

struct FunctionLowering<'m, 'f> {
    module: &'m Module,
    func_idx: u32,
    frame: &'f Frame<'f>,
    insts: Vec<MInst>,
    next_label: u32,
}

impl<'m, 'f> FunctionLowering<'m, 'f> {
    fn new(module: &'m Module, func_idx: u32, frame: &'f Frame<'f>) -> Self {
        let func = &module.functions[func_idx as usize];
        Self {
            module,
            func_idx,
            frame,
            insts: Vec::new(),
            next_label: func.blocks().len() as u32,
        }
    }

    fn block_label(&self, block: u32) -> Result<u32, String> {
        let func = &self.module.functions[self.func_idx as usize];
        if func.blocks().contains(&block) {
            Ok(block - func.block_begin_idx)
        } else {
            Err(format!("branch to block #{block} outside the region"))
        }
    }

    fn slot(&self, value: u32) -> Result<u32, String> {
        if !self.module.func_values(self.func_idx).contains(&value) {
            return Err(format!(
                "operand {} is not defined in this region",
                self.module.value_label(value)
            ));
        }
        self.frame
            .value_slot(value)
            .ok_or_else(|| format!("{} has no frame slot", self.module.value_label(value)))
    }

    fn operand_slots<const N: usize>(&self, v: u32) -> Result<[u32; N], String> {
        let operands = self.module.operands(v);
        if operands.len() != N {
            return Err(format!(
                "{} expects {N} operands, has {}",
                self.module.value_label(v),
                operands.len()
            ));
        }
        let mut slots = [0; N];
        for (slot, &op) in slots.iter_mut().zip(operands) {
            *slot = self.slot(op)?;
        }
        Ok(slots)
    }

    fn lower(mut self) -> Result<SwFunction, String> {
        let module = self.module;
        let func = &module.functions[self.func_idx as usize];
        if func.blocks().is_empty() {
            return Err("region has no blocks".to_string());
        }

        self.insts.push(MInst::Prologue);
        for (i, arg) in func.args().enumerate() {
            let reg = *ARG_REGS
                .get(i)
                .ok_or_else(|| format!("argument {} is not passed in a register", module.value_label(arg)))?;
            let slot = self.slot(arg)?;
            self.insts.push(MInst::StoreArg { reg, slot });
        }

        for b in func.blocks() {
            self.insts.push(MInst::Label(b - func.block_begin_idx));
            let block = &module.blocks[b as usize];
            for v in block.insts() {
                if module.values[v as usize].is_removed() {
                    continue;
                }
                self.lower_inst(b, v)?;
            }
        }

        Ok(SwFunction {
            name: func.name.clone(),
            func_idx: self.func_idx,
            local: func.local_only,
            insts: self.insts,
            label_count: self.next_label,
        })
    }

    fn lower_inst(&mut self, block: u32, v: u32) -> Result<(), String> {
        let module = self.module;
        let value = &module.values[v as usize];

        let inst = match value.op {
            Operation::Const => {
                let imm = module
                    .const_value(v)
                    .ok_or_else(|| format!("{} has no constant bits", module.value_label(v)))?;
                MInst::MovImm { dst: self.slot(v)?, imm }
            }
            op if op.is_binary() => {
                let [lhs, rhs] = self.operand_slots::<2>(v)?;
                let dst = self.slot(v)?;
                let alu = |op| MInst::Alu { op, dst, lhs, rhs };
                let setcc = |cond| MInst::SetCc { cond, dst, lhs, rhs };
                match op {
                    Operation::Add => alu(AluOp::Add),
                    Operation::Sub => alu(AluOp::Sub),
                    Operation::Mul => alu(AluOp::Imul),
                    Operation::And => alu(AluOp::And),
                    Operation::Or => alu(AluOp::Or),
                    Operation::Xor => alu(AluOp::Xor),
                    Operation::Shl => alu(AluOp::Shl),
                    Operation::Shr => alu(AluOp::Shr),
                    Operation::Eq => setcc(Cond::E),
                    Operation::Ne => setcc(Cond::Ne),
                    _ => setcc(Cond::L),
                }
            }
            Operation::Select => {
                let [cond, if_true, if_false] = self.operand_slots::<3>(v)?;
                MInst::Select { dst: self.slot(v)?, cond, if_true, if_false }
            }
            Operation::Alloca => {
                let storage = self
                    .frame
                    .storage_slot(v)
                    .ok_or_else(|| format!("{} has no storage slot", module.value_label(v)))?;
                MInst::AddrOf { dst: self.slot(v)?, storage }
            }
            Operation::Load => {
                let [ptr] = self.operand_slots::<1>(v)?;
                MInst::LoadInd { dst: self.slot(v)?, ptr }
            }
            Operation::Store => {
                let [value, ptr] = self.operand_slots::<2>(v)?;
                MInst::StoreInd { ptr, value }
            }
            // A promoted slot is its own storage.
            Operation::Slot => return Ok(()),
            Operation::SlotRead => {
                let [slot] = self.operand_slots::<1>(v)?;
                MInst::Copy { dst: self.slot(v)?, src: slot }
            }
            Operation::SlotWrite => {
                let [value, slot] = self.operand_slots::<2>(v)?;
                MInst::Copy { dst: slot, src: value }
            }
            Operation::Call => {
                let callee = module
                    .functions
                    .get(value.call_func_idx as usize)
                    .ok_or_else(|| format!("{} calls unknown function", module.value_label(v)))?;
                for (i, &arg) in module.operands(v).iter().enumerate() {
                    let reg = *ARG_REGS
                        .get(i)
                        .ok_or_else(|| format!("call to @{} passes too many arguments", callee.name))?;
                    let slot = self.slot(arg)?;
                    self.insts.push(MInst::LoadArg { reg, slot });
                }
                MInst::Call {
                    symbol: callee.name.clone(),
                    result: self.frame.value_slot(v),
                }
            }
            Operation::Ret => {
                let [value] = self.operand_slots::<1>(v)?;
                MInst::Return { value: Some(value) }
            }
            Operation::Terminate => MInst::Return { value: None },
            Operation::Br => {
                let &[target] = module.successors(v) else {
                    return Err("br without target".to_string());
                };
                self.edge_copies(block, target)?;
                MInst::Jmp(self.block_label(target)?)
            }
            Operation::CondBr => {
                let [cond] = self.operand_slots::<1>(v)?;
                let &[if_true, if_false] = module.successors(v) else {
                    return Err("condbr needs two targets".to_string());
                };
                let else_label = self.next_label;
                self.next_label += 1;

                self.insts.push(MInst::JumpIfZero { cond, target: else_label });
                self.edge_copies(block, if_true)?;
                self.insts.push(MInst::Jmp(self.block_label(if_true)?));
                self.insts.push(MInst::Label(else_label));
                self.edge_copies(block, if_false)?;
                MInst::Jmp(self.block_label(if_false)?)
            }
            Operation::None => return Ok(()),
            op => return Err(format!("unexpected {} in software region", op.info().name)),
        };
        self.insts.push(inst);
        Ok(())
    }

    /// Copy phi operands for the edge `from -> to`.
    fn edge_copies(&mut self, from: u32, to: u32) -> Result<(), String> {
        let module = self.module;
        let Some(target) = module.blocks.get(to as usize) else {
            return Err(format!("branch to unknown block #{to}"));
        };
        let mut copies = Vec::new();
        for phi in target.phis() {
            if !module.values[phi as usize].is_phi() {
                continue;
            }
            let Some((incoming, _)) = module.phi_incoming(phi).find(|&(_, pred)| pred == from) else {
                return Err(format!(
                    "phi {} has no incoming value for ^{}",
                    module.value_label(phi),
                    module.blocks[from as usize].name
                ));
            };
            let scratch = self
                .frame
                .scratch_slot(phi)
                .ok_or_else(|| format!("phi {} has no scratch slot", module.value_label(phi)))?;
            copies.push((self.slot(phi)?, scratch, self.slot(incoming)?));
        }
        for &(_, scratch, src) in &copies {
            self.insts.push(MInst::Copy { dst: scratch, src });
        }
        for &(dst, scratch, _) in &copies {
            self.insts.push(MInst::Copy { dst, src: scratch });
        }
        Ok(())
    }
}

/// `verify-lowered`, software half.
pub fn verify_program(program: &SwProgram, frames: &HashMap<u32, Frame<'_>>) -> PassOutcome {
    for function in &program.functions {
        verify_function(function, frames).map_err(|reason| RegionFailure::new(function.name.as_str(), reason))?;
    }
    Ok(())
}

fn verify_function(function: &SwFunction, frames: &HashMap<u32, Frame<'_>>) -> Result<(), String> {
    let Some(frame) = frames.get(&function.func_idx) else {
        return Err("function has no frame".to_string());
    };
    if function.insts.first() != Some(&MInst::Prologue) {
        return Err("function does not start with its prologue".to_string());
    }
    if !matches!(function.insts.last(), Some(MInst::Return { .. } | MInst::Jmp(_))) {
        return Err("function does not end in a return or jump".to_string());
    }

    let mut placed = HashSet::new();
    for inst in &function.insts {
        if let MInst::Label(label) = inst {
            if !placed.insert(*label) {
                return Err(format!("label .L{label} placed twice"));
            }
            if *label >= function.label_count {
                return Err(format!("label .L{label} out of range"));
            }
        }
        if let Some(slot) = inst.slots().into_iter().find(|&s| s >= frame.slot_count()) {
            return Err(format!("`{inst}` uses slot {slot}, frame has {}", frame.slot_count()));
        }
    }
    for inst in &function.insts {
        if let Some(target) = inst.jump_target() {
            if !placed.contains(&target) {
                return Err(format!("`{inst}` jumps to a label that is never placed"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::frame::build_frame;
    use bumpalo::Bump;

    fn lower(text: &str) -> (SwProgram, usize) {
        let module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut frames = HashMap::new();
        for f in crate::passes::regions(&module, RegionScope::All) {
            frames.insert(f, build_frame(&module, f, None, &arena).unwrap());
        }
        let program = lower_module(&module, &frames, RegionScope::All, &session).unwrap();
        verify_program(&program, &frames).unwrap();
        (program, session.stats().software_regions)
    }

    #[test]
    fn straight_line_code() {
        let (program, regions) = lower("add2(%a, %b) {\nentry:\n  %c = add %a, %b\n  ret %c\n}\n");
        assert_eq!(regions, 1);
        let f = &program.functions[0];
        assert_eq!(
            f.insts,
            [
                MInst::Prologue,
                MInst::StoreArg { reg: Gpr::Rdi, slot: 0 },
                MInst::StoreArg { reg: Gpr::Rsi, slot: 1 },
                MInst::Label(0),
                MInst::Alu { op: AluOp::Add, dst: 2, lhs: 0, rhs: 1 },
                MInst::Return { value: Some(2) },
            ]
        );
    }

    #[test]
    fn branches_copy_phis_through_scratch() {
        let (program, _) = lower(
            r#"
f(%a, %b) {
entry:
  condbr %a, ^x, ^y
x:
  br ^y
y:
  %p = phi [^entry, %a], [^x, %b]
  ret %p
}
"#,
        );
        let f = &program.functions[0];
        // three block labels, one else label
        assert_eq!(f.label_count, 4);
        let text: Vec<String> = f.insts.iter().map(ToString::to_string).collect();
        let jz = text.iter().position(|t| t == "jz s0, .L3").unwrap();
        // p is slot 2, its scratch slot 3
        assert_eq!(text[jz + 1..jz + 3], ["jmp .L1", ".L3:"]);
        assert_eq!(text[jz + 3..jz + 6], ["copy s3, s0", "copy s2, s3", "jmp .L2"]);
    }

    #[test]
    fn calls_load_register_arguments() {
        let (program, _) = lower("ext(%x)!\nf(%a) {\nentry:\n  %r = call @ext, %a\n  ret %r\n}\n");
        let f = &program.functions[0];
        assert!(f.insts.contains(&MInst::LoadArg { reg: Gpr::Rdi, slot: 0 }));
        assert!(f.insts.contains(&MInst::Call { symbol: "ext".to_string(), result: Some(1) }));
        assert!(!program.defines("ext"));
    }

    #[test]
    fn verifier_catches_unplaced_labels_and_bad_slots() {
        let (mut program, _) = lower("f() {\nentry:\n  terminate\n}\n");
        let module = Module::parse("f() {\nentry:\n  terminate\n}\n").unwrap();
        let arena = Bump::new();
        let mut frames = HashMap::new();
        frames.insert(0, build_frame(&module, 0, None, &arena).unwrap());

        program.functions[0].insts.insert(2, MInst::Jmp(7));
        let err = verify_program(&program, &frames).unwrap_err();
        assert!(err.reason.contains("never placed"), "{}", err.reason);

        program.functions[0].insts[2] = MInst::MovImm { dst: 9, imm: 1 };
        let err = verify_program(&program, &frames).unwrap_err();
        assert!(err.reason.contains("uses slot 9"), "{}", err.reason);
    }
}
