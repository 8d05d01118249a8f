//! Structural verifiers run after legalization and after lowering.

use hashbrown::HashMap;

use crate::core::RegionScope;
use crate::gezel::lower as hdl_lower;
use crate::ir::{Module, Operation};
use crate::x64::lower as sw_lower;

use super::{regions, CodegenUnit, PassOutcome, RegionFailure};

/// Check every defined region; `hardware` regions must additionally be free
/// of memory operations and calls.
pub fn verify_module(module: &Module, hardware: Option<RegionScope>) -> PassOutcome {
    for func_idx in regions(module, RegionScope::All) {
        let func = &module.functions[func_idx as usize];
        let is_hardware = hardware.is_some_and(|scope| scope.includes(func));
        verify_region(module, func_idx, is_hardware).map_err(|reason| RegionFailure::new(func.name.as_str(), reason))?;
    }
    Ok(())
}

fn verify_region(module: &Module, func_idx: u32, is_hardware: bool) -> Result<(), String> {
    let func = &module.functions[func_idx as usize];
    let blocks = func.blocks();
    if blocks.is_empty() {
        return Err("region has no blocks".to_string());
    }
    let values = module.func_values(func_idx);
    let block_name = |b: u32| {
        module
            .blocks
            .get(b as usize)
            .map(|b| format!("^{}", b.name))
            .unwrap_or_else(|| format!("^#{b}"))
    };

    let mut preds: HashMap<u32, Vec<u32>> = HashMap::new();
    for b in blocks.clone() {
        let Some(term) = module.terminator(b) else {
            return Err(format!("block {} does not end in a terminator", block_name(b)));
        };
        for &succ in module.successors(term) {
            if !blocks.contains(&succ) {
                return Err(format!(
                    "{} in {} branches outside the region",
                    module.values[term as usize].op.info().name,
                    block_name(b)
                ));
            }
            preds.entry(succ).or_default().push(b);
        }
    }

    for b in blocks.clone() {
        let block = &module.blocks[b as usize];
        let block_preds = preds.get(&b).map(Vec::as_slice).unwrap_or(&[]);

        for phi in block.phis() {
            if !module.values[phi as usize].is_phi() {
                continue;
            }
            let incoming: Vec<(u32, u32)> = module.phi_incoming(phi).collect();
            for &(value, from) in &incoming {
                check_operand(module, &values, phi, value)?;
                if !block_preds.contains(&from) {
                    return Err(format!(
                        "phi {} names {} which is not a predecessor of {}",
                        module.value_label(phi),
                        block_name(from),
                        block_name(b)
                    ));
                }
            }
            if let Some(&missing) = block_preds.iter().find(|p| !incoming.iter().any(|(_, from)| from == *p)) {
                return Err(format!(
                    "phi {} has no incoming value for predecessor {}",
                    module.value_label(phi),
                    block_name(missing)
                ));
            }
        }

        for v in block.insts() {
            let value = &module.values[v as usize];
            if value.is_removed() {
                continue;
            }
            let info = value.op.info();
            if info.is_terminator && v + 1 != block.inst_end_idx {
                return Err(format!("{} in the middle of {}", info.name, block_name(b)));
            }
            if value.is_phi() {
                return Err(format!("phi {} after the first instruction", module.value_label(v)));
            }

            for &op in module.operands(v) {
                check_operand(module, &values, v, op)?;
                if (block.phi_end_idx..block.inst_end_idx).contains(&op) && op >= v {
                    return Err(format!(
                        "{} uses {} before its definition",
                        module.value_label(v),
                        module.value_label(op)
                    ));
                }
            }

            match value.op {
                Operation::Call => {
                    let Some(callee) = module.functions.get(value.call_func_idx as usize) else {
                        return Err(format!("{} calls unknown function", module.value_label(v)));
                    };
                    if callee.arg_count() != value.op_count {
                        return Err(format!(
                            "call to @{} passes {} arguments, expected {}",
                            callee.name,
                            value.op_count,
                            callee.arg_count()
                        ));
                    }
                }
                Operation::SlotRead | Operation::SlotWrite => {
                    let slot = module.operands(v).last().copied();
                    let is_slot = slot
                        .and_then(|s| module.values.get(s as usize))
                        .is_some_and(|s| s.op == Operation::Slot);
                    if !is_slot {
                        return Err(format!("{} does not access a slot", module.value_label(v)));
                    }
                }
                _ => {}
            }

            if is_hardware
                && matches!(
                    value.op,
                    Operation::Alloca | Operation::Load | Operation::Store | Operation::Call
                )
            {
                return Err(format!(
                    "{} left in hardware region after legalization",
                    info.name
                ));
            }
        }
    }

    Ok(())
}

fn check_operand(module: &Module, values: &std::ops::Range<u32>, user: u32, op: u32) -> Result<(), String> {
    let defined = values.contains(&op)
        && module
            .values
            .get(op as usize)
            .is_some_and(|v| !v.is_removed() && v.defines_value());
    if !defined {
        return Err(format!(
            "{} uses undefined value {}",
            module.value_label(user),
            module.value_label(op)
        ));
    }
    Ok(())
}

/// Check the lowered hardware design and software program.
pub fn verify_lowered(unit: &CodegenUnit<'_>) -> PassOutcome {
    hdl_lower::verify_design(&unit.hardware)?;
    sw_lower::verify_program(&unit.software, &unit.frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify(text: &str) -> Result<(), String> {
        let module = Module::parse(text).unwrap();
        verify_module(&module, Some(RegionScope::All)).map_err(|f| f.reason)
    }

    #[test]
    fn accepts_well_formed_region() {
        verify(
            r#"
f(%a, %b) {
entry:
  %c = lt %a, %b
  condbr %c, ^x, ^y
x:
  br ^y
y:
  %p = phi [^entry, %a], [^x, %b]
  ret %p
}
"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_missing_terminator() {
        let err = verify("f(%a) {\nentry:\n  %b = add %a, %a\n}\n").unwrap_err();
        assert!(err.contains("does not end in a terminator"), "{err}");
    }

    #[test]
    fn rejects_bad_phi_predecessors() {
        let err = verify(
            r#"
f(%a) {
entry:
  br ^y
x:
  br ^y
y:
  %p = phi [^entry, %a]
  ret %p
}
"#,
        )
        .unwrap_err();
        assert!(err.contains("no incoming value for predecessor ^x"), "{err}");
    }

    #[test]
    fn rejects_use_before_def_and_dangling_operands() {
        let mut module = Module::parse(
            "f(%a) {\nentry:\n  %b = add %a, %a\n  %c = add %b, %b\n  ret %c\n}\n",
        )
        .unwrap();
        // make %b use %c
        let b_begin = module.values[1].op_begin_idx as usize;
        module.value_operands[b_begin] = 2;
        let err = verify_module(&module, None).unwrap_err();
        assert_eq!(err.region, "f");
        assert!(err.reason.contains("%b uses %c before its definition"), "{}", err.reason);

        module.value_operands[b_begin] = 999;
        let err = verify_module(&module, None).unwrap_err();
        assert!(err.reason.contains("undefined value #999"), "{}", err.reason);
    }

    #[test]
    fn hardware_regions_reject_memory() {
        let text = "f() {\nentry:\n  %s = alloca 8, 8\n  %v = load %s\n  ret %v\n}\n";
        let err = verify(text).unwrap_err();
        assert!(err.contains("alloca left in hardware region"), "{err}");

        let module = Module::parse(text).unwrap();
        assert!(verify_module(&module, None).is_ok());
    }
}
