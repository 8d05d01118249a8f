//! Optional cleanups enabled by the optimisation level.

use crate::core::{CompilationSession, RegionScope};
use crate::ir::{Module, Operation};

use super::{regions, PassOutcome};

/// Evaluate operations whose operands are all constants.
pub fn fold_constants(module: &mut Module, session: &CompilationSession<'_>) -> PassOutcome {
    let mut folded = 0;
    for func_idx in regions(module, RegionScope::All) {
        loop {
            let before = folded;
            for v in module.func_values(func_idx) {
                let op = module.values[v as usize].op;
                if op.is_binary() {
                    let [a, b] = match *module.operands(v) {
                        [a, b] => [a, b],
                        _ => continue,
                    };
                    let result = match (module.const_value(a), module.const_value(b)) {
                        (Some(x), Some(y)) => op.eval_binary(x, y),
                        _ => None,
                    };
                    if let Some(result) = result {
                        if module.set_const(v, result) {
                            folded += 1;
                        }
                    }
                } else if op == Operation::Select {
                    let [cond, if_true, if_false] = match *module.operands(v) {
                        [c, t, f] => [c, t, f],
                        _ => continue,
                    };
                    if let Some(c) = module.const_value(cond) {
                        let chosen = if c != 0 { if_true } else { if_false };
                        module.replace_uses(func_idx, v, chosen);
                        module.values[v as usize].remove();
                        folded += 1;
                    }
                }
            }
            if folded == before {
                break;
            }
        }
    }
    log::debug!("folded {folded} values");
    session.record_folded(folded);
    Ok(())
}

/// `mul %x, 2^k` with a single-use constant becomes `shl %x, k`.
pub fn strength_reduce(module: &mut Module, session: &CompilationSession<'_>) -> PassOutcome {
    let mut reduced = 0;
    for func_idx in regions(module, RegionScope::All) {
        let uses = module.use_counts(func_idx);
        for v in module.func_values(func_idx) {
            if module.values[v as usize].op != Operation::Mul {
                continue;
            }
            let [a, b] = match *module.operands(v) {
                [a, b] => [a, b],
                _ => continue,
            };
            let single_use_pow2 = |c: u32| {
                module
                    .const_value(c)
                    .filter(|&k| k > 1 && (k as u64).is_power_of_two())
                    .filter(|_| uses.get(&c) == Some(&1))
                    .map(|k| (k as u64).trailing_zeros() as i64)
            };

            let (value, shift_const, shift) = match (single_use_pow2(b), single_use_pow2(a)) {
                (Some(shift), _) => (a, b, shift),
                (None, Some(shift)) => (b, a, shift),
                (None, None) => continue,
            };
            if !module.set_const(shift_const, shift) {
                continue;
            }
            let begin = module.values[v as usize].op_begin_idx as usize;
            module.value_operands[begin] = value;
            module.value_operands[begin + 1] = shift_const;
            module.values[v as usize].op = Operation::Shl;
            reduced += 1;
        }
    }
    log::debug!("strength-reduced {reduced} multiplies");
    session.record_reduced(reduced);
    Ok(())
}

/// Remove side-effect free instructions without uses, until none remain.
pub fn eliminate_dead_values(module: &mut Module, session: &CompilationSession<'_>) -> PassOutcome {
    let mut eliminated = 0;
    for func_idx in regions(module, RegionScope::All) {
        loop {
            let uses = module.use_counts(func_idx);
            let dead: Vec<u32> = module
                .func_values(func_idx)
                .filter(|&v| {
                    let value = &module.values[v as usize];
                    let info = value.op.info();
                    !value.is_removed()
                        && !value.is_arg()
                        && !value.is_phi()
                        && info.is_def
                        && !info.has_side_effects
                        && !uses.contains_key(&v)
                })
                .collect();
            if dead.is_empty() {
                break;
            }
            for v in &dead {
                module.values[*v as usize].remove();
            }
            eliminated += dead.len();
        }
    }
    log::debug!("eliminated {eliminated} dead values");
    session.record_eliminated(eliminated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn run(text: &str, pass: fn(&mut Module, &CompilationSession<'_>) -> PassOutcome) -> (Module, crate::core::SessionStats) {
        let mut module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        pass(&mut module, &session).unwrap();
        (module, session.stats())
    }

    fn find(m: &Module, name: &str) -> u32 {
        m.values.iter().position(|v| v.name == name).unwrap() as u32
    }

    #[test]
    fn folds_chains_and_selects() {
        let (m, stats) = run(
            r#"
f(%x) {
entry:
  %a = const 6
  %b = const 7
  %c = mul %a, %b
  %d = sub %c, %a
  %one = const 1
  %s = select %one, %d, %x
  ret %s
}
"#,
            fold_constants,
        );
        assert_eq!(m.const_value(find(&m, "c")), Some(42));
        assert_eq!(m.const_value(find(&m, "d")), Some(36));
        assert!(m.values[find(&m, "s") as usize].is_removed());
        let ret = m.values.len() as u32 - 1;
        assert_eq!(m.operands(ret), &[find(&m, "d")]);
        assert_eq!(stats.values_folded, 3);
    }

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        let (m, stats) = run(
            r#"
f(%x) {
entry:
  %eight = const 8
  %y = mul %eight, %x
  ret %y
}
"#,
            strength_reduce,
        );
        let y = find(&m, "y");
        assert_eq!(m.values[y as usize].op, Operation::Shl);
        assert_eq!(m.operands(y), &[0, find(&m, "eight")]);
        assert_eq!(m.const_value(find(&m, "eight")), Some(3));
        assert_eq!(stats.values_reduced, 1);
    }

    #[test]
    fn shared_constant_is_not_rewritten() {
        let (m, _) = run(
            r#"
f(%x) {
entry:
  %four = const 4
  %y = mul %x, %four
  %z = add %y, %four
  ret %z
}
"#,
            strength_reduce,
        );
        assert_eq!(m.values[find(&m, "y") as usize].op, Operation::Mul);
    }

    #[test]
    fn dead_chains_are_removed() {
        let (m, stats) = run(
            r#"
g()!
f(%x) {
entry:
  %a = add %x, %x
  %b = mul %a, %a
  %r = call @g
  ret %x
}
"#,
            eliminate_dead_values,
        );
        assert!(m.values[find(&m, "a") as usize].is_removed());
        assert!(m.values[find(&m, "b") as usize].is_removed());
        assert!(!m.values[find(&m, "r") as usize].is_removed());
        assert_eq!(stats.values_eliminated, 2);
    }
}
