//! Flattened SSA IR consumed by both emission pipelines.
//!
//! Functions, blocks and values live in flat vectors and refer to each other
//! by index, the same shape the pipelines walk and the legalization passes
//! rewrite in place. A function is one *region*: the unit the HWSW target
//! routes to hardware or software lowering via its [`Partition`] tag.
//!
//! # Text format
//!
//! ```text
//! ; Comments start with semicolon
//! ext(%x)!                       ; declaration
//! add2(%a, %b) hw {              ; `hw` / `sw` partition tag, optional `local`
//! entry:
//!     %c = add %a, %b
//!     condbr %c, ^done, ^other
//! other:
//!     br ^done
//! done:
//!     %r = phi [^entry, %c], [^other, %a]
//!     ret %r
//! }
//! ```

use std::fmt;
use std::ops::Range;

use hashbrown::HashMap;

pub mod parser;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub blocks: Vec<Block>,
    pub values: Vec<Value>,
    pub value_operands: Vec<u32>,
}

/// Partition tag attached to a region by an external partitioning analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Hardware,
    Software,
}

impl Partition {
    pub const fn keyword(self) -> &'static str {
        match self {
            Partition::Hardware => "hw",
            Partition::Software => "sw",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub declaration: bool,
    pub local_only: bool,
    pub partition: Option<Partition>,
    pub block_begin_idx: u32,
    pub block_end_idx: u32,
    pub arg_begin_idx: u32,
    pub arg_end_idx: u32,
}

impl Function {
    pub fn arg_count(&self) -> u32 {
        self.arg_end_idx - self.arg_begin_idx
    }

    pub fn blocks(&self) -> Range<u32> {
        self.block_begin_idx..self.block_end_idx
    }

    pub fn args(&self) -> Range<u32> {
        self.arg_begin_idx..self.arg_end_idx
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub succ_begin_idx: u32,
    pub succ_end_idx: u32,
    pub inst_begin_idx: u32,
    pub phi_end_idx: u32,
    pub inst_end_idx: u32,
}

impl Block {
    pub fn phis(&self) -> Range<u32> {
        self.inst_begin_idx..self.phi_end_idx
    }

    /// Non-phi instructions, terminator included.
    pub fn insts(&self) -> Range<u32> {
        self.phi_end_idx..self.inst_end_idx
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub name: String,
    pub value_type: ValueType,
    pub op: Operation,
    /// For call only: called function index
    pub call_func_idx: u32,
    /// Number of value operands
    pub op_count: u32,
    /// Operand indices into value_operands array
    pub op_begin_idx: u32,
    pub op_end_idx: u32,
}

impl Value {
    /// Instructions deleted by a legalization pass keep their slot but lose
    /// their operation.
    pub fn is_removed(&self) -> bool {
        self.value_type == ValueType::Normal && self.op == Operation::None
    }

    pub fn is_phi(&self) -> bool {
        self.value_type == ValueType::Phi
    }

    pub fn is_arg(&self) -> bool {
        self.value_type == ValueType::Arg
    }

    /// Whether other instructions may use this value as an operand.
    pub fn defines_value(&self) -> bool {
        match self.value_type {
            ValueType::Arg | ValueType::Phi => true,
            ValueType::Normal => self.op.info().is_def,
            ValueType::Terminator => false,
        }
    }

    pub(crate) fn remove(&mut self) {
        self.op = Operation::None;
        self.op_count = 0;
        self.value_type = ValueType::Normal;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Normal,
    Arg,
    Phi,
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    None,
    Const,
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Select,
    Alloca,
    Load,
    Store,
    /// Stack slot promoted to register storage.
    Slot,
    SlotRead,
    SlotWrite,
    Call,
    Ret,
    Terminate,
    Br,
    CondBr,
}

impl Operation {
    pub const fn info(self) -> OpInfo {
        use Operation::*;
        const fn binary(name: &'static str) -> OpInfo {
            OpInfo { name, is_terminator: false, is_def: true, has_side_effects: false, op_count: 2, succ_count: 0, imm_count: 0 }
        }
        match self {
            None => OpInfo { name: "<none>", is_terminator: false, is_def: false, has_side_effects: false, op_count: 0, succ_count: 0, imm_count: 0 },
            Const => OpInfo { name: "const", is_terminator: false, is_def: true, has_side_effects: false, op_count: 0, succ_count: 0, imm_count: 2 },
            Add => binary("add"),
            Sub => binary("sub"),
            Mul => binary("mul"),
            And => binary("and"),
            Or => binary("or"),
            Xor => binary("xor"),
            Shl => binary("shl"),
            Shr => binary("shr"),
            Eq => binary("eq"),
            Ne => binary("ne"),
            Lt => binary("lt"),
            Select => OpInfo { name: "select", is_terminator: false, is_def: true, has_side_effects: false, op_count: 3, succ_count: 0, imm_count: 0 },
            Alloca => OpInfo { name: "alloca", is_terminator: false, is_def: true, has_side_effects: false, op_count: 0, succ_count: 0, imm_count: 2 },
            Load => OpInfo { name: "load", is_terminator: false, is_def: true, has_side_effects: false, op_count: 1, succ_count: 0, imm_count: 0 },
            Store => OpInfo { name: "store", is_terminator: false, is_def: false, has_side_effects: true, op_count: 2, succ_count: 0, imm_count: 0 },
            Slot => OpInfo { name: "slot", is_terminator: false, is_def: true, has_side_effects: false, op_count: 0, succ_count: 0, imm_count: 2 },
            SlotRead => OpInfo { name: "slotread", is_terminator: false, is_def: true, has_side_effects: false, op_count: 1, succ_count: 0, imm_count: 0 },
            SlotWrite => OpInfo { name: "slotwrite", is_terminator: false, is_def: false, has_side_effects: true, op_count: 2, succ_count: 0, imm_count: 0 },
            Call => OpInfo { name: "call", is_terminator: false, is_def: true, has_side_effects: true, op_count: !0, succ_count: 0, imm_count: 0 },
            Ret => OpInfo { name: "ret", is_terminator: true, is_def: false, has_side_effects: true, op_count: 1, succ_count: 0, imm_count: 0 },
            Terminate => OpInfo { name: "terminate", is_terminator: true, is_def: false, has_side_effects: true, op_count: 0, succ_count: 0, imm_count: 0 },
            Br => OpInfo { name: "br", is_terminator: true, is_def: false, has_side_effects: true, op_count: 0, succ_count: 1, imm_count: 0 },
            CondBr => OpInfo { name: "condbr", is_terminator: true, is_def: false, has_side_effects: true, op_count: 1, succ_count: 2, imm_count: 0 },
        }
    }

    /// Operations accepted in IR text. Slot operations only appear after
    /// legalization.
    pub fn parse(s: &str) -> Option<Self> {
        use Operation::*;
        let op = match s {
            "const" => Const,
            "add" => Add,
            "sub" => Sub,
            "mul" => Mul,
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "shl" => Shl,
            "shr" => Shr,
            "eq" => Eq,
            "ne" => Ne,
            "lt" => Lt,
            "select" => Select,
            "alloca" => Alloca,
            "load" => Load,
            "store" => Store,
            "call" => Call,
            "ret" => Ret,
            "terminate" => Terminate,
            "br" => Br,
            "condbr" => CondBr,
            _ => return Option::None,
        };
        Some(op)
    }

    pub fn is_binary(self) -> bool {
        use Operation::*;
        matches!(self, Add | Sub | Mul | And | Or | Xor | Shl | Shr | Eq | Ne | Lt)
    }

    /// Evaluate a binary operation on 64-bit two's complement words.
    pub fn eval_binary(self, a: i64, b: i64) -> Option<i64> {
        use Operation::*;
        let v = match self {
            Add => a.wrapping_add(b),
            Sub => a.wrapping_sub(b),
            Mul => a.wrapping_mul(b),
            And => a & b,
            Or => a | b,
            Xor => a ^ b,
            Shl => a.wrapping_shl((b & 63) as u32),
            Shr => ((a as u64) >> (b & 63)) as i64,
            Eq => (a == b) as i64,
            Ne => (a != b) as i64,
            Lt => (a < b) as i64,
            _ => return Option::None,
        };
        Some(v)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub is_terminator: bool,
    pub is_def: bool,
    pub has_side_effects: bool,
    pub op_count: u32,
    pub succ_count: u32,
    pub imm_count: u32,
}

pub(crate) fn split_imm(value: i64) -> [u32; 2] {
    let bits = value as u64;
    [bits as u32, (bits >> 32) as u32]
}

fn join_imm(lo: u32, hi: u32) -> i64 {
    ((hi as u64) << 32 | lo as u64) as i64
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        parser::parse_ir(text)
    }

    pub fn function_by_name(&self, name: &str) -> Option<u32> {
        self.functions.iter().position(|f| f.name == name).map(|i| i as u32)
    }

    /// Every value index owned by a function: arguments first, then the
    /// instructions of its blocks.
    pub fn func_values(&self, func_idx: u32) -> Range<u32> {
        let func = &self.functions[func_idx as usize];
        let end = match func.block_end_idx.checked_sub(1) {
            Some(last) if func.block_end_idx > func.block_begin_idx => self
                .blocks
                .get(last as usize)
                .map(|b| b.inst_end_idx)
                .unwrap_or(func.arg_end_idx),
            _ => func.arg_end_idx,
        };
        func.arg_begin_idx..end
    }

    /// Value operands of an instruction. Out-of-range operand lists read as
    /// empty so malformed input reaches the verifier instead of panicking.
    pub fn operands(&self, value_idx: u32) -> &[u32] {
        let Some(value) = self.values.get(value_idx as usize) else {
            return &[];
        };
        if value.is_phi() {
            return self.slice(value.op_begin_idx, value.op_count);
        }
        let count = if value.op.info().op_count == !0 { value.op_count } else { value.op.info().op_count.min(value.op_count) };
        self.slice(value.op_begin_idx, count)
    }

    /// Branch targets of a terminator.
    pub fn successors(&self, value_idx: u32) -> &[u32] {
        let Some(value) = self.values.get(value_idx as usize) else {
            return &[];
        };
        let info = value.op.info();
        self.slice(value.op_begin_idx + value.op_count, info.succ_count)
    }

    /// Immediate operands (constant bits, alloca size/align).
    pub fn immediates(&self, value_idx: u32) -> &[u32] {
        let Some(value) = self.values.get(value_idx as usize) else {
            return &[];
        };
        let info = value.op.info();
        self.slice(value.op_begin_idx + value.op_count + info.succ_count, info.imm_count)
    }

    /// `(incoming value, incoming block)` pairs of a phi.
    pub fn phi_incoming(&self, phi_idx: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        let (vals, blocks) = match self.values.get(phi_idx as usize) {
            Some(phi) if phi.is_phi() => (
                self.slice(phi.op_begin_idx, phi.op_count),
                self.slice(phi.op_begin_idx + phi.op_count, phi.op_count),
            ),
            _ => (&[][..], &[][..]),
        };
        vals.iter().copied().zip(blocks.iter().copied())
    }

    pub fn const_value(&self, value_idx: u32) -> Option<i64> {
        let value = self.values.get(value_idx as usize)?;
        if value.op != Operation::Const {
            return None;
        }
        match self.immediates(value_idx) {
            [lo, hi] => Some(join_imm(*lo, *hi)),
            _ => None,
        }
    }

    pub fn block_succs(&self, block_idx: u32) -> &[u32] {
        match self.blocks.get(block_idx as usize) {
            Some(b) => self
                .value_operands
                .get(b.succ_begin_idx as usize..b.succ_end_idx as usize)
                .unwrap_or(&[]),
            None => &[],
        }
    }

    /// Terminator of a block, if its last instruction is one.
    pub fn terminator(&self, block_idx: u32) -> Option<u32> {
        let block = self.blocks.get(block_idx as usize)?;
        let last = block.inst_end_idx.checked_sub(1)?;
        if last < block.phi_end_idx {
            return None;
        }
        let value = self.values.get(last as usize)?;
        value.op.info().is_terminator.then_some(last)
    }

    /// Block that defines a value of the given function.
    pub fn defining_block(&self, func_idx: u32, value_idx: u32) -> Option<u32> {
        let func = &self.functions[func_idx as usize];
        func.blocks().find(|&b| {
            let block = &self.blocks[b as usize];
            (block.inst_begin_idx..block.inst_end_idx).contains(&value_idx)
        })
    }

    /// Number of uses of every value of a function by live instructions.
    pub fn use_counts(&self, func_idx: u32) -> HashMap<u32, u32> {
        let mut counts = HashMap::new();
        for v in self.func_values(func_idx) {
            if self.values[v as usize].is_removed() {
                continue;
            }
            for &op in self.operands(v) {
                *counts.entry(op).or_insert(0) += 1;
            }
        }
        counts
    }

    /// `%name` of a value, or `#index` for unnamed and unknown values.
    pub fn value_label(&self, value_idx: u32) -> String {
        match self.values.get(value_idx as usize) {
            Some(v) if !v.name.is_empty() => format!("%{}", v.name),
            _ => format!("#{value_idx}"),
        }
    }

    /// Turn a two-operand instruction into a constant, reusing its operand
    /// storage for the immediate bits.
    pub(crate) fn set_const(&mut self, value_idx: u32, value: i64) -> bool {
        let Some(v) = self.values.get(value_idx as usize) else {
            return false;
        };
        let begin = v.op_begin_idx as usize;
        let capacity = v.op_count.max(v.op.info().imm_count) as usize;
        if capacity < 2 {
            return false;
        }
        let Some(slots) = self.value_operands.get_mut(begin..begin + 2) else {
            return false;
        };
        slots.copy_from_slice(&split_imm(value));
        let v = &mut self.values[value_idx as usize];
        v.op = Operation::Const;
        v.op_count = 0;
        true
    }

    /// Rewrite every use of `old` inside a function to `new`.
    pub fn replace_uses(&mut self, func_idx: u32, old: u32, new: u32) {
        for v in self.func_values(func_idx) {
            let value = &self.values[v as usize];
            let begin = value.op_begin_idx as usize;
            let count = self.operands(v).len();
            for slot in self.value_operands[begin..begin + count].iter_mut() {
                if *slot == old {
                    *slot = new;
                }
            }
        }
    }

    pub fn print(&self) -> String {
        let mut output = String::new();

        for func in &self.functions {
            if func.declaration {
                output.push_str(&format!("Extern function {}", func.name));
            } else if func.local_only {
                output.push_str(&format!("Local function {}", func.name));
            } else {
                output.push_str(&format!("Function {}", func.name));
            }
            if let Some(partition) = func.partition {
                output.push_str(&format!(" [{}]", partition.keyword()));
            }

            for arg_idx in func.args() {
                output.push_str(&format!("\nArgument {}", self.values[arg_idx as usize].name));
            }

            for block_idx in func.blocks() {
                let block = &self.blocks[block_idx as usize];
                output.push_str(&format!("\nBlock {}", block.name));

                for &succ in self.block_succs(block_idx) {
                    if let Some(succ_block) = self.blocks.get(succ as usize) {
                        output.push_str(&format!("\nSucc {}", succ_block.name));
                    }
                }

                for phi_idx in block.phis() {
                    output.push_str(&format!("\nPHI {}", self.values[phi_idx as usize].name));
                    for (val, from) in self.phi_incoming(phi_idx) {
                        if let (Some(val), Some(from)) = (self.values.get(val as usize), self.blocks.get(from as usize)) {
                            output.push_str(&format!("\n{} from {}", val.name, from.name));
                        }
                    }
                }

                for inst_idx in block.insts() {
                    let inst = &self.values[inst_idx as usize];
                    if inst.is_removed() {
                        continue;
                    }
                    let info = inst.op.info();
                    if !inst.name.is_empty() {
                        output.push_str(&format!("\nValue {} ({})", inst.name, info.name));
                    } else {
                        output.push_str(&format!("\nValue ({})", info.name));
                    }

                    if inst.op == Operation::Call {
                        if let Some(callee) = self.functions.get(inst.call_func_idx as usize) {
                            output.push_str(&format!("\nTarget {}", callee.name));
                        }
                    }
                    for &operand in self.operands(inst_idx) {
                        if let Some(operand) = self.values.get(operand as usize) {
                            output.push_str(&format!("\nOp {}", operand.name));
                        }
                    }
                    for &target in self.successors(inst_idx) {
                        if let Some(target) = self.blocks.get(target as usize) {
                            output.push_str(&format!("\nOp ^{}", target.name));
                        }
                    }
                    if let Some(c) = self.const_value(inst_idx) {
                        output.push_str(&format!("\nOp ${c}"));
                    } else {
                        for imm in self.immediates(inst_idx) {
                            output.push_str(&format!("\nOp ${imm}"));
                        }
                    }
                }
            }
            output.push('\n');
        }

        output
    }

    fn slice(&self, begin: u32, count: u32) -> &[u32] {
        let begin = begin as usize;
        self.value_operands.get(begin..begin + count as usize).unwrap_or(&[])
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.print())
    }
}
