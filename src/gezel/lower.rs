// This module lowers legalized IR regions into GEZEL datapaths. Every region becomes one `dp`
// whose input ports are the region arguments and whose outputs are the returned value and a
// `done` flag. A region with a single block and no phis or promoted slots is purely
// combinational and lowers to one `always` block. Any other region is scheduled one block
// per clock cycle: each block becomes an sfg, values that cross blocks are latched in `r_`
// registers, phis become `p_` registers written by per-edge sfgs (so all phi copies of an
// edge happen in parallel at the cycle boundary), promoted stack slots become `m_`
// registers, and an FSM controller sequences the block sfgs, ending in a `halted` state.
// Constants are inlined as literals. Operand lookups are checked, so malformed IR that was
// not verified fails here with a descriptive error instead of producing a broken design.

//! IR to GEZEL datapath lowering.

use std::fmt;

use hashbrown::{HashMap, HashSet};

use crate::core::{CompilationSession, RegionScope};
use crate::ir::{Module, Operation, ValueType};
use crate::passes::{each_region, PassOutcome, RegionFailure};

/// Word type of every IR value.
pub const WORD: HwType = HwType::Tc(64);

/// The same word read as unsigned, for logical right shifts.
pub const UNSIGNED_WORD: HwType = HwType::Ns(64);

/// Shift amounts wrap at the word width.
const SHIFT_MASK: i64 = 63;

/// Name of the controller state a finished region rests in.
pub const HALT_STATE: &str = "halted";

/// Name of the empty sfg executed while halted.
pub const HALT_SFG: &str = "halt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwType {
    /// Two's complement of the given width.
    Tc(u32),
    /// Unsigned of the given width.
    Ns(u32),
}

impl fmt::Display for HwType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwType::Tc(w) => write!(f, "tc({w})"),
            HwType::Ns(w) => write!(f, "ns({w})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub dir: PortDir,
    pub name: String,
    pub ty: HwType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub name: String,
    pub ty: HwType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Name(String),
    Literal(i64),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Name(name) => f.write_str(name),
            Operand::Literal(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Operand(Operand),
    Binary { op: &'static str, lhs: Operand, rhs: Operand },
    /// Shift by `amount & 63`. `logical` shifts the word as `ns(64)`.
    Shift { left: bool, logical: bool, value: Operand, amount: Operand },
    Mux { cond: Operand, if_true: Operand, if_false: Operand },
}

impl Expr {
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Expr::Operand(op) => vec![op],
            Expr::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Expr::Shift { value, amount, .. } => vec![value, amount],
            Expr::Mux { cond, if_true, if_false } => vec![cond, if_true, if_false],
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Operand(op) => write!(f, "{op}"),
            Expr::Binary { op, lhs, rhs } => write!(f, "{lhs} {op} {rhs}"),
            Expr::Shift { left, logical, value, amount } => {
                if *logical {
                    write!(f, "({UNSIGNED_WORD}) ")?;
                }
                write!(f, "{value} {} ", if *left { "<<" } else { ">>" })?;
                match amount {
                    Operand::Literal(n) => write!(f, "{n}"),
                    Operand::Name(name) => write!(f, "({name} & {SHIFT_MASK})"),
                }
            }
            Expr::Mux { cond, if_true, if_false } => write!(f, "{cond} ? {if_true} : {if_false}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assign {
    pub target: String,
    pub expr: Expr,
}

/// Signal flow graph: assignments active in one controller step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sfg {
    pub name: String,
    pub assigns: Vec<Assign>,
}

/// `(sfgs) -> state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub sfgs: Vec<String>,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: String,
    pub cond: Option<Operand>,
    pub then: Step,
    pub otherwise: Option<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    pub name: String,
    pub initial: String,
    pub states: Vec<String>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapath {
    /// Region the datapath was lowered from.
    pub region: String,
    pub name: String,
    pub ports: Vec<Port>,
    pub registers: Vec<Signal>,
    pub signals: Vec<Signal>,
    pub always: Vec<Assign>,
    pub sfgs: Vec<Sfg>,
    pub controller: Option<Controller>,
}

/// Lowered hardware fragment of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HwDesign {
    pub datapaths: Vec<Datapath>,
}

/// Identifier safe for GEZEL.
pub fn identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// `lower-hardware`
pub fn lower_module(module: &Module, scope: RegionScope, session: &CompilationSession<'_>) -> PassOutcome<HwDesign> {
    let datapaths = each_region(module, scope, session, |func_idx| {
        let dp = RegionLowering::new(module, func_idx).lower()?;
        log::debug!(
            "{}: datapath `{}` with {} sfgs",
            dp.region,
            dp.name,
            dp.sfgs.len()
        );
        session.record_hardware_region();
        Ok(dp)
    })?;
    Ok(HwDesign { datapaths })
}

struct RegionLowering<'m> {
    module: &'m Module,
    func_idx: u32,
    /// Defining block of every instruction and phi.
    block_of: HashMap<u32, u32>,
    /// Values read outside their defining block.
    crossing: HashSet<u32>,
    combinational: bool,
    returns_value: bool,
}

impl<'m> RegionLowering<'m> {
    fn new(module: &'m Module, func_idx: u32) -> Self {
        let func = &module.functions[func_idx as usize];
        let mut block_of = HashMap::new();
        let mut has_state = false;
        let mut returns_value = false;
        for b in func.blocks() {
            let block = &module.blocks[b as usize];
            for v in block.inst_begin_idx..block.inst_end_idx {
                let value = &module.values[v as usize];
                if value.is_removed() {
                    continue;
                }
                block_of.insert(v, b);
                has_state |= value.is_phi() || value.op == Operation::Slot;
                returns_value |= value.op == Operation::Ret;
            }
        }

        let combinational = func.blocks().len() == 1
            && !has_state
            && module
                .terminator(func.block_begin_idx)
                .is_some_and(|t| matches!(module.values[t as usize].op, Operation::Ret | Operation::Terminate));

        let mut lowering = Self {
            module,
            func_idx,
            block_of,
            crossing: HashSet::new(),
            combinational,
            returns_value,
        };
        lowering.find_crossing_values();
        lowering
    }

    fn find_crossing_values(&mut self) {
        let func = &self.module.functions[self.func_idx as usize];
        let mut crossing = HashSet::new();
        for b in func.blocks() {
            let block = &self.module.blocks[b as usize];
            for v in block.insts() {
                for &op in self.module.operands(v) {
                    if self.block_of.get(&op).is_some_and(|&def| def != b) {
                        crossing.insert(op);
                    }
                }
            }
            for phi in block.phis() {
                for (value, from) in self.module.phi_incoming(phi) {
                    if self.block_of.get(&value).is_some_and(|&def| def != from) {
                        crossing.insert(value);
                    }
                }
            }
        }
        self.crossing = crossing;
    }

    fn func_name(&self) -> &'m str {
        &self.module.functions[self.func_idx as usize].name
    }

    fn value_name(&self, v: u32) -> String {
        let name = &self.module.values[v as usize].name;
        if name.is_empty() {
            format!("t{v}")
        } else {
            identifier(name)
        }
    }

    fn block_name(&self, b: u32) -> String {
        identifier(&self.module.blocks[b as usize].name)
    }

    /// Operand `v` as seen by code running in block `at`.
    fn operand(&self, v: u32, at: u32) -> Result<Operand, String> {
        let func = &self.module.functions[self.func_idx as usize];
        if func.args().contains(&v) {
            return Ok(Operand::Name(format!("i_{}", self.value_name(v))));
        }
        let Some(&def_block) = self.block_of.get(&v) else {
            return Err(format!(
                "operand {} is not defined in this region",
                self.module.value_label(v)
            ));
        };
        if let Some(c) = self.module.const_value(v) {
            return Ok(Operand::Literal(c));
        }
        let value = &self.module.values[v as usize];
        let prefix = match value.value_type {
            ValueType::Phi => "p",
            _ if value.op == Operation::Slot => "m",
            _ if !value.op.info().is_def => {
                return Err(format!("{} does not produce a value", self.module.value_label(v)))
            }
            _ if self.combinational || def_block == at => "v",
            _ => "r",
        };
        Ok(Operand::Name(format!("{prefix}_{}", self.value_name(v))))
    }

    fn operands(&self, v: u32, at: u32) -> Result<Vec<Operand>, String> {
        self.module.operands(v).iter().map(|&op| self.operand(op, at)).collect()
    }

    fn slot_operand(&self, v: u32, pos: usize) -> Result<String, String> {
        let slot = self.module.operands(v).get(pos).copied();
        match slot.and_then(|s| self.module.values.get(s as usize).map(|val| (s, val))) {
            Some((s, val)) if val.op == Operation::Slot && self.block_of.contains_key(&s) => {
                Ok(format!("m_{}", self.value_name(s)))
            }
            _ => Err(format!("{} does not access a promoted slot", self.module.value_label(v))),
        }
    }

    fn lower(self) -> Result<Datapath, String> {
        let module = self.module;
        let func = &module.functions[self.func_idx as usize];
        if func.blocks().is_empty() {
            return Err("region has no blocks".to_string());
        }

        let mut dp = Datapath {
            region: func.name.clone(),
            name: identifier(self.func_name()),
            ports: Vec::new(),
            registers: Vec::new(),
            signals: Vec::new(),
            always: Vec::new(),
            sfgs: Vec::new(),
            controller: None,
        };

        for arg in func.args() {
            dp.ports.push(Port {
                dir: PortDir::In,
                name: format!("i_{}", self.value_name(arg)),
                ty: WORD,
            });
        }
        if self.returns_value {
            dp.ports.push(Port { dir: PortDir::Out, name: "result".to_string(), ty: WORD });
        }
        dp.ports.push(Port { dir: PortDir::Out, name: "done".to_string(), ty: HwType::Ns(1) });

        if self.combinational {
            let entry = func.block_begin_idx;
            dp.always = self.lower_block(entry, &mut dp)?;
            return Ok(dp);
        }

        if self.returns_value {
            dp.registers.push(Signal { name: "ret_r".to_string(), ty: WORD });
            dp.always.push(Assign {
                target: "result".to_string(),
                expr: Expr::Operand(Operand::Name("ret_r".to_string())),
            });
        }
        dp.registers.push(Signal { name: "done_r".to_string(), ty: HwType::Ns(1) });
        dp.always.push(Assign {
            target: "done".to_string(),
            expr: Expr::Operand(Operand::Name("done_r".to_string())),
        });

        let mut controller = Controller {
            name: format!("{}_ctl", dp.name),
            initial: format!("s_{}", self.block_name(func.block_begin_idx)),
            states: Vec::new(),
            transitions: Vec::new(),
        };

        for b in func.blocks() {
            let block = &module.blocks[b as usize];
            for phi in block.phis() {
                if module.values[phi as usize].is_phi() {
                    dp.registers.push(Signal { name: format!("p_{}", self.value_name(phi)), ty: WORD });
                }
            }
        }

        for b in func.blocks() {
            let sfg_name = format!("b_{}", self.block_name(b));
            let assigns = self.lower_block(b, &mut dp)?;
            dp.sfgs.push(Sfg { name: sfg_name.clone(), assigns });
            let state = format!("s_{}", self.block_name(b));
            controller.states.push(state.clone());

            let Some(term) = module.terminator(b) else {
                return Err(format!("block ^{} does not end in a terminator", module.blocks[b as usize].name));
            };
            let step = |dp: &mut Datapath, target: u32| -> Result<Step, String> {
                let mut sfgs = vec![sfg_name.clone()];
                if let Some(edge) = self.edge_sfg(b, target)? {
                    sfgs.push(edge.name.clone());
                    dp.sfgs.push(edge);
                }
                Ok(Step { sfgs, next: format!("s_{}", self.block_name(target)) })
            };

            let term_value = &module.values[term as usize];
            let transition = match (term_value.op, module.successors(term)) {
                (Operation::Br, &[target]) => Transition {
                    from: state,
                    cond: None,
                    then: step(&mut dp, self.target_in_region(target)?)?,
                    otherwise: None,
                },
                (Operation::CondBr, &[if_true, if_false]) => {
                    let cond = match module.operands(term).first() {
                        Some(&c) => self.operand(c, b)?,
                        None => return Err("condbr without condition".to_string()),
                    };
                    Transition {
                        from: state,
                        cond: Some(cond),
                        then: step(&mut dp, self.target_in_region(if_true)?)?,
                        otherwise: Some(step(&mut dp, self.target_in_region(if_false)?)?),
                    }
                }
                (Operation::Ret | Operation::Terminate, _) => Transition {
                    from: state,
                    cond: None,
                    then: Step { sfgs: vec![sfg_name.clone()], next: HALT_STATE.to_string() },
                    otherwise: None,
                },
                (op, _) => return Err(format!("malformed {} terminator", op.info().name)),
            };
            controller.transitions.push(transition);
        }

        dp.sfgs.push(Sfg { name: HALT_SFG.to_string(), assigns: Vec::new() });
        controller.states.push(HALT_STATE.to_string());
        controller.transitions.push(Transition {
            from: HALT_STATE.to_string(),
            cond: None,
            then: Step { sfgs: vec![HALT_SFG.to_string()], next: HALT_STATE.to_string() },
            otherwise: None,
        });
        dp.controller = Some(controller);
        Ok(dp)
    }

    fn target_in_region(&self, target: u32) -> Result<u32, String> {
        if self.module.functions[self.func_idx as usize].blocks().contains(&target) {
            Ok(target)
        } else {
            Err(format!("branch to block #{target} outside the region"))
        }
    }

    /// Assignments of one block's instructions.
    fn lower_block(&self, b: u32, dp: &mut Datapath) -> Result<Vec<Assign>, String> {
        let module = self.module;
        let block = &module.blocks[b as usize];
        let mut assigns = Vec::new();

        for v in block.insts() {
            let value = &module.values[v as usize];
            if value.is_removed() {
                continue;
            }
            let name = self.value_name(v);
            let define = |dp: &mut Datapath, assigns: &mut Vec<Assign>, expr: Expr| {
                dp.signals.push(Signal { name: format!("v_{name}"), ty: WORD });
                assigns.push(Assign { target: format!("v_{name}"), expr });
                if !self.combinational && self.crossing.contains(&v) {
                    dp.registers.push(Signal { name: format!("r_{name}"), ty: WORD });
                    assigns.push(Assign {
                        target: format!("r_{name}"),
                        expr: Expr::Operand(Operand::Name(format!("v_{name}"))),
                    });
                }
            };

            match value.op {
                Operation::Const => {}
                op if op.is_binary() => {
                    let [lhs, rhs]: [Operand; 2] = self
                        .operands(v, b)?
                        .try_into()
                        .map_err(|_| format!("{} needs two operands", module.value_label(v)))?;
                    let expr = match op {
                        Operation::Shl | Operation::Shr => shift(op, lhs, rhs),
                        _ => Expr::Binary { op: binary_symbol(op), lhs, rhs },
                    };
                    define(dp, &mut assigns, expr);
                }
                Operation::Select => {
                    let [cond, if_true, if_false]: [Operand; 3] = self
                        .operands(v, b)?
                        .try_into()
                        .map_err(|_| format!("{} needs three operands", module.value_label(v)))?;
                    define(dp, &mut assigns, Expr::Mux { cond, if_true, if_false });
                }
                Operation::Slot => {
                    dp.registers.push(Signal { name: format!("m_{name}"), ty: WORD });
                }
                Operation::SlotRead => {
                    let slot = self.slot_operand(v, 0)?;
                    define(dp, &mut assigns, Expr::Operand(Operand::Name(slot)));
                }
                Operation::SlotWrite => {
                    let slot = self.slot_operand(v, 1)?;
                    let stored = match module.operands(v).first() {
                        Some(&s) => self.operand(s, b)?,
                        None => return Err(format!("{} stores nothing", module.value_label(v))),
                    };
                    assigns.push(Assign { target: slot, expr: Expr::Operand(stored) });
                }
                Operation::Ret => {
                    let result = match module.operands(v).first() {
                        Some(&r) => self.operand(r, b)?,
                        None => return Err("ret without value".to_string()),
                    };
                    let (result_target, done_target) = if self.combinational {
                        ("result", "done")
                    } else {
                        ("ret_r", "done_r")
                    };
                    assigns.push(Assign { target: result_target.to_string(), expr: Expr::Operand(result) });
                    assigns.push(Assign { target: done_target.to_string(), expr: Expr::Operand(Operand::Literal(1)) });
                }
                Operation::Terminate => {
                    let done_target = if self.combinational { "done" } else { "done_r" };
                    assigns.push(Assign { target: done_target.to_string(), expr: Expr::Operand(Operand::Literal(1)) });
                }
                Operation::Br | Operation::CondBr => {}
                op => {
                    return Err(format!(
                        "{} cannot be lowered to hardware",
                        op.info().name
                    ))
                }
            }
        }

        Ok(assigns)
    }

    /// Phi copies on the edge `from -> to`, if `to` has phis.
    fn edge_sfg(&self, from: u32, to: u32) -> Result<Option<Sfg>, String> {
        let module = self.module;
        let mut assigns = Vec::new();
        for phi in module.blocks[to as usize].phis() {
            if !module.values[phi as usize].is_phi() {
                continue;
            }
            let Some((value, _)) = module.phi_incoming(phi).find(|&(_, pred)| pred == from) else {
                return Err(format!(
                    "phi {} has no incoming value for ^{}",
                    module.value_label(phi),
                    module.blocks[from as usize].name
                ));
            };
            assigns.push(Assign {
                target: format!("p_{}", self.value_name(phi)),
                expr: Expr::Operand(self.operand(value, from)?),
            });
        }
        if assigns.is_empty() {
            return Ok(None);
        }
        Ok(Some(Sfg {
            name: format!("e_{}_{}", self.block_name(from), self.block_name(to)),
            assigns,
        }))
    }
}

/// Shifts take their amount modulo the word width, and `shr` is logical, as in
/// constant folding and the x86-64 lowering.
fn shift(op: Operation, value: Operand, amount: Operand) -> Expr {
    let amount = match amount {
        Operand::Literal(n) => Operand::Literal(n & SHIFT_MASK),
        name => name,
    };
    Expr::Shift {
        left: op == Operation::Shl,
        logical: op == Operation::Shr,
        value,
        amount,
    }
}

fn binary_symbol(op: Operation) -> &'static str {
    match op {
        Operation::Add => "+",
        Operation::Sub => "-",
        Operation::Mul => "*",
        Operation::And => "&",
        Operation::Or => "|",
        Operation::Xor => "^",
        Operation::Eq => "==",
        Operation::Ne => "!=",
        _ => "<",
    }
}

/// `verify-lowered`, hardware half.
pub fn verify_design(design: &HwDesign) -> PassOutcome {
    let mut names_seen = HashSet::new();
    for dp in &design.datapaths {
        if !names_seen.insert(dp.name.as_str()) {
            return Err(RegionFailure::new(dp.region.as_str(), format!("datapath `{}` defined twice", dp.name)));
        }
        verify_datapath(dp).map_err(|reason| RegionFailure::new(dp.region.as_str(), reason))?;
    }
    Ok(())
}

fn verify_datapath(dp: &Datapath) -> Result<(), String> {
    let mut declared = HashSet::new();
    let storage = dp
        .ports
        .iter()
        .map(|p| p.name.as_str())
        .chain(dp.registers.iter().map(|r| r.name.as_str()))
        .chain(dp.signals.iter().map(|s| s.name.as_str()));
    for name in storage.chain(dp.sfgs.iter().map(|s| s.name.as_str())) {
        if !declared.insert(name) {
            return Err(format!("name `{name}` declared twice in datapath `{}`", dp.name));
        }
    }
    let sfg_names: HashSet<&str> = dp.sfgs.iter().map(|s| s.name.as_str()).collect();

    let check_ref = |name: &str| {
        if declared.contains(name) && !sfg_names.contains(name) {
            Ok(())
        } else {
            Err(format!("`{name}` is not declared in datapath `{}`", dp.name))
        }
    };
    let check_operand = |op: &Operand| match op {
        Operand::Name(name) => check_ref(name),
        Operand::Literal(_) => Ok(()),
    };

    for assign in dp.always.iter().chain(dp.sfgs.iter().flat_map(|s| s.assigns.iter())) {
        check_ref(&assign.target)?;
        for op in assign.expr.operands() {
            check_operand(op)?;
        }
    }
    if dp.ports.iter().any(|p| p.dir == PortDir::In && dp.always.iter().chain(dp.sfgs.iter().flat_map(|s| &s.assigns)).any(|a| a.target == p.name)) {
        return Err(format!("input port assigned in datapath `{}`", dp.name));
    }

    let Some(ctl) = &dp.controller else {
        if !dp.sfgs.is_empty() {
            return Err(format!("datapath `{}` has sfgs but no controller", dp.name));
        }
        return Ok(());
    };
    let states: HashSet<&str> = ctl.states.iter().map(String::as_str).collect();
    if !states.contains(ctl.initial.as_str()) {
        return Err(format!("initial state `{}` is not declared", ctl.initial));
    }
    for t in &ctl.transitions {
        if !states.contains(t.from.as_str()) {
            return Err(format!("transition from undeclared state `{}`", t.from));
        }
        if let Some(cond) = &t.cond {
            check_operand(cond)?;
        }
        for step in std::iter::once(&t.then).chain(t.otherwise.as_ref()) {
            if !states.contains(step.next.as_str()) {
                return Err(format!("transition to undeclared state `{}`", step.next));
            }
            if let Some(missing) = step.sfgs.iter().find(|s| !sfg_names.contains(s.as_str())) {
                return Err(format!("controller `{}` uses unknown sfg `{missing}`", ctl.name));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn lower(text: &str) -> HwDesign {
        let module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        lower_module(&module, RegionScope::All, &session).unwrap()
    }

    #[test]
    fn single_block_is_combinational() {
        let design = lower("add2(%a, %b) {\nentry:\n  %c = add %a, %b\n  %k = const 3\n  %d = mul %c, %k\n  ret %d\n}\n");
        assert_eq!(design.datapaths.len(), 1);
        let dp = &design.datapaths[0];
        assert!(dp.controller.is_none());
        assert!(dp.registers.is_empty());
        assert_eq!(dp.ports.len(), 4);
        assert_eq!(
            dp.always[1],
            Assign {
                target: "v_d".to_string(),
                expr: Expr::Binary {
                    op: "*",
                    lhs: Operand::Name("v_c".to_string()),
                    rhs: Operand::Literal(3)
                }
            }
        );
        assert_eq!(dp.always.last().unwrap().target, "done");
        verify_design(&design).unwrap();
    }

    #[test]
    fn shifts_wrap_and_shr_is_logical() {
        let design = lower(
            "sh(%a, %b) {\nentry:\n  %m = const -8\n  %one = const 65\n  %c = shr %m, %one\n  %d = shr %a, %b\n  %e = shl %c, %b\n  %f = xor %d, %e\n  ret %f\n}\n",
        );
        let dp = &design.datapaths[0];
        let rendered: Vec<String> = dp.always.iter().map(|a| format!("{} = {}", a.target, a.expr)).collect();
        assert_eq!(rendered[0], "v_c = (ns(64)) -8 >> 1");
        assert_eq!(rendered[1], "v_d = (ns(64)) i_a >> (i_b & 63)");
        assert_eq!(rendered[2], "v_e = v_c << (i_b & 63)");
        verify_design(&design).unwrap();
    }

    #[test]
    fn branches_become_states() {
        let design = lower(
            r#"
max(%a, %b) {
entry:
  %c = lt %a, %b
  %s = add %a, %b
  condbr %c, ^big, ^done
big:
  br ^done
done:
  %m = phi [^entry, %a], [^big, %b]
  %r = add %m, %s
  ret %r
}
"#,
        );
        let dp = &design.datapaths[0];
        let ctl = dp.controller.as_ref().unwrap();
        assert_eq!(ctl.initial, "s_entry");
        assert_eq!(ctl.states, ["s_entry", "s_big", "s_done", HALT_STATE]);
        assert!(dp.registers.iter().any(|r| r.name == "p_m"));
        // %s is read in ^done, so it is latched
        assert!(dp.registers.iter().any(|r| r.name == "r_s"));
        assert!(dp.sfgs.iter().any(|s| s.name == "e_entry_done"));
        assert!(dp.sfgs.iter().any(|s| s.name == "e_big_done"));
        let entry = &ctl.transitions[0];
        assert_eq!(entry.cond, Some(Operand::Name("v_c".to_string())));
        assert_eq!(entry.otherwise.as_ref().unwrap().sfgs, ["b_entry", "e_entry_done"]);
        verify_design(&design).unwrap();
    }

    #[test]
    fn slots_become_registers() {
        let mut module = Module::parse(
            "f(%x) {\nentry:\n  %s = alloca 8, 8\n  store %x, %s\n  br ^next\nnext:\n  %v = load %s\n  ret %v\n}\n",
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        crate::passes::legalize::promote_memory(&mut module, RegionScope::All, &session).unwrap();
        let design = lower_module(&module, RegionScope::All, &session).unwrap();
        let dp = &design.datapaths[0];
        assert!(dp.registers.iter().any(|r| r.name == "m_s"));
        let next = dp.sfgs.iter().find(|s| s.name == "b_next").unwrap();
        assert_eq!(next.assigns[0].expr, Expr::Operand(Operand::Name("m_s".to_string())));
        verify_design(&design).unwrap();
    }

    #[test]
    fn unlowerable_operations_fail() {
        let module = Module::parse("g()!\nf() {\nentry:\n  %r = call @g\n  ret %r\n}\n").unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let err = lower_module(&module, RegionScope::All, &session).unwrap_err();
        assert_eq!(err.region, "f");
        assert!(err.reason.contains("call cannot be lowered"));
    }

    #[test]
    fn verifier_catches_undeclared_names() {
        let mut design = lower("f(%a) {\nentry:\n  ret %a\n}\n");
        design.datapaths[0].always.push(Assign {
            target: "ghost".to_string(),
            expr: Expr::Operand(Operand::Literal(0)),
        });
        let err = verify_design(&design).unwrap_err();
        assert!(err.reason.contains("`ghost` is not declared"));
    }
}
