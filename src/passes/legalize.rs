//! Target legalization.
//!
//! Hardware regions have no linear memory and no call stack: stack slots are
//! promoted to register storage and calls are rejected. Software regions pass
//! every argument in a SysV register, so calls are checked against that limit.

use hashbrown::HashMap;

use crate::core::{CompilationSession, RegionScope};
use crate::ir::{Module, Operation};

use super::{each_region, regions, PassOutcome, RegionFailure};

/// SysV integer argument registers.
pub const MAX_REGISTER_ARGS: u32 = 6;

/// Rewrite `alloca`/`load`/`store` into `slot`/`slotread`/`slotwrite`.
pub fn promote_memory(
    module: &mut Module,
    scope: RegionScope,
    session: &CompilationSession<'_>,
) -> PassOutcome {
    for func_idx in regions(module, scope) {
        let name = module.functions[func_idx as usize].name.clone();
        session.enter_region(&name);
        let result = promote_region(module, func_idx);
        session.leave_region();

        let (promoted, dead_stores) = result.map_err(|reason| RegionFailure::new(name.as_str(), reason))?;
        if promoted > 0 {
            log::debug!("{name}: promoted {promoted} slots, dropped {dead_stores} dead stores");
        }
        session.record_promoted(promoted);
        session.record_eliminated(dead_stores);
    }
    Ok(())
}

fn promote_region(module: &mut Module, func_idx: u32) -> Result<(usize, usize), String> {
    let values = module.func_values(func_idx);
    let is_slot = |m: &Module, v: u32| m.values.get(v as usize).is_some_and(|v| v.op == Operation::Alloca);

    let mut slots = Vec::new();
    for v in values.clone() {
        let value = &module.values[v as usize];
        if value.is_removed() {
            continue;
        }
        match value.op {
            Operation::Alloca => {
                if let [size, _align] = *module.immediates(v) {
                    if size == 0 || size > 8 {
                        return Err(format!(
                            "alloca {} of {size} bytes does not fit a register",
                            module.value_label(v)
                        ));
                    }
                }
                slots.push(v);
            }
            Operation::Load | Operation::Store => {
                let ptr_pos = if value.op == Operation::Load { 0 } else { 1 };
                match module.operands(v).get(ptr_pos) {
                    Some(&ptr) if is_slot(module, ptr) => {}
                    Some(&ptr) => {
                        return Err(format!(
                            "{} through non-slot pointer {} has no hardware equivalent",
                            value.op.info().name,
                            module.value_label(ptr)
                        ))
                    }
                    None => return Err(format!("{} is missing its pointer", module.value_label(v))),
                }
            }
            _ => {}
        }

        for (pos, &op) in module.operands(v).iter().enumerate() {
            let as_pointer = matches!((value.op, pos), (Operation::Load, 0) | (Operation::Store, 1));
            if as_pointer {
                continue;
            }
            if is_slot(module, op) {
                return Err(format!(
                    "address of {} escapes into {}",
                    module.value_label(op),
                    module.value_label(v)
                ));
            }
        }
    }

    for &slot in &slots {
        module.values[slot as usize].op = Operation::Slot;
    }
    for v in values {
        let value = &mut module.values[v as usize];
        value.op = match value.op {
            Operation::Load => Operation::SlotRead,
            Operation::Store => Operation::SlotWrite,
            op => op,
        };
    }

    // Forward writes to later reads in the same block, drop overwritten writes.
    let mut dead_stores = 0;
    let func = module.functions[func_idx as usize].clone();
    for block_idx in func.blocks() {
        let insts = module.blocks[block_idx as usize].insts();
        let mut last_write: HashMap<u32, (u32, u32)> = HashMap::new();
        for v in insts {
            match module.values[v as usize].op {
                Operation::SlotWrite => {
                    let [value, slot] = match *module.operands(v) {
                        [value, slot] => [value, slot],
                        _ => continue,
                    };
                    if let Some((prev, _)) = last_write.insert(slot, (v, value)) {
                        module.values[prev as usize].remove();
                        dead_stores += 1;
                    }
                }
                Operation::SlotRead => {
                    let Some(&slot) = module.operands(v).first() else {
                        continue;
                    };
                    if let Some(&(_, value)) = last_write.get(&slot) {
                        module.replace_uses(func_idx, v, value);
                        module.values[v as usize].remove();
                    }
                }
                _ => {}
            }
        }
    }

    Ok((slots.len(), dead_stores))
}

/// Hardware regions cannot call.
pub fn reject_calls(module: &Module, scope: RegionScope, session: &CompilationSession<'_>) -> PassOutcome {
    each_region(module, scope, session, |func_idx| {
        for v in module.func_values(func_idx) {
            let value = &module.values[v as usize];
            if value.op == Operation::Call {
                let callee = module
                    .functions
                    .get(value.call_func_idx as usize)
                    .map(|f| f.name.as_str())
                    .unwrap_or("?");
                return Err(format!("call to @{callee} cannot be lowered to hardware"));
            }
        }
        Ok(())
    })
    .map(drop)
}

/// Every call must pass its arguments in registers and match the callee.
pub fn legalize_calls(module: &Module, scope: RegionScope, session: &CompilationSession<'_>) -> PassOutcome {
    each_region(module, scope, session, |func_idx| {
        let func = &module.functions[func_idx as usize];
        if func.arg_count() > MAX_REGISTER_ARGS {
            return Err(format!(
                "region takes {} arguments, at most {MAX_REGISTER_ARGS} are passed in registers",
                func.arg_count()
            ));
        }

        for v in module.func_values(func_idx) {
            let value = &module.values[v as usize];
            if value.op != Operation::Call {
                continue;
            }
            let Some(callee) = module.functions.get(value.call_func_idx as usize) else {
                return Err(format!("{} calls unknown function #{}", module.value_label(v), value.call_func_idx));
            };
            if value.op_count > MAX_REGISTER_ARGS {
                return Err(format!(
                    "call to @{} passes {} arguments, at most {MAX_REGISTER_ARGS} fit in registers",
                    callee.name, value.op_count
                ));
            }
            if value.op_count != callee.arg_count() {
                return Err(format!(
                    "call to @{} passes {} arguments, @{} takes {}",
                    callee.name,
                    value.op_count,
                    callee.name,
                    callee.arg_count()
                ));
            }
        }
        Ok(())
    })
    .map(drop)
}
