//! GEZEL text rendering of a lowered [`HwDesign`].

use std::fmt::Write;

use super::lower::{Assign, Controller, Datapath, HwDesign, PortDir, Step};

/// Name of the optional top-level system block.
pub const SYSTEM_NAME: &str = "S";

/// Render the design, one `dp` (plus its `fsm`) per region.
pub fn render(design: &HwDesign, system_block: bool) -> String {
    let mut out = String::new();
    out.push_str("// GEZEL hardware description generated by hwswc\n");
    for dp in &design.datapaths {
        out.push('\n');
        render_datapath(&mut out, dp);
        if let Some(ctl) = &dp.controller {
            out.push('\n');
            render_controller(&mut out, dp, ctl);
        }
    }
    if system_block {
        out.push('\n');
        let _ = writeln!(out, "system {SYSTEM_NAME} {{");
        for dp in &design.datapaths {
            let _ = writeln!(out, "  {};", dp.name);
        }
        out.push_str("}\n");
    }
    out
}

fn render_datapath(out: &mut String, dp: &Datapath) {
    let ports: Vec<String> = dp
        .ports
        .iter()
        .map(|p| {
            let dir = match p.dir {
                PortDir::In => "in",
                PortDir::Out => "out",
            };
            format!("{dir} {} : {}", p.name, p.ty)
        })
        .collect();
    let _ = writeln!(out, "dp {}({}) {{", dp.name, ports.join("; "));

    for reg in &dp.registers {
        let _ = writeln!(out, "  reg {} : {};", reg.name, reg.ty);
    }
    for sig in &dp.signals {
        let _ = writeln!(out, "  sig {} : {};", sig.name, sig.ty);
    }

    if !dp.always.is_empty() {
        render_body(out, "always", &dp.always);
    }
    for sfg in &dp.sfgs {
        render_body(out, &format!("sfg {}", sfg.name), &sfg.assigns);
    }
    out.push_str("}\n");
}

fn render_body(out: &mut String, header: &str, assigns: &[Assign]) {
    if assigns.is_empty() {
        let _ = writeln!(out, "  {header} {{ }}");
        return;
    }
    let _ = writeln!(out, "  {header} {{");
    for assign in assigns {
        let _ = writeln!(out, "    {} = {};", assign.target, assign.expr);
    }
    out.push_str("  }\n");
}

fn render_controller(out: &mut String, dp: &Datapath, ctl: &Controller) {
    let step = |step: &Step| format!("({}) -> {}", step.sfgs.join(", "), step.next);

    let _ = writeln!(out, "fsm {}({}) {{", ctl.name, dp.name);
    let _ = writeln!(out, "  initial {};", ctl.initial);
    let others: Vec<&str> = ctl
        .states
        .iter()
        .map(String::as_str)
        .filter(|s| *s != ctl.initial)
        .collect();
    if !others.is_empty() {
        let _ = writeln!(out, "  state {};", others.join(", "));
    }
    for t in &ctl.transitions {
        match (&t.cond, &t.otherwise) {
            (Some(cond), Some(otherwise)) => {
                let _ = writeln!(out, "  @{} if ({cond}) then {};", t.from, step(&t.then));
                let indent = " ".repeat(t.from.len() + 4);
                let _ = writeln!(out, "{indent}else {};", step(otherwise));
            }
            _ => {
                let _ = writeln!(out, "  @{} {};", t.from, step(&t.then));
            }
        }
    }
    out.push_str("}\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompilationSession, RegionScope};
    use crate::gezel::lower::lower_module;
    use crate::ir::Module;
    use bumpalo::Bump;

    fn render_text(text: &str, system_block: bool) -> String {
        let module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let design = lower_module(&module, RegionScope::All, &session).unwrap();
        render(&design, system_block)
    }

    #[test]
    fn combinational_datapath() {
        let out = render_text("add2(%a, %b) {\nentry:\n  %c = add %a, %b\n  ret %c\n}\n", false);
        assert!(out.contains("dp add2(in i_a : tc(64); in i_b : tc(64); out result : tc(64); out done : ns(1)) {"));
        assert!(out.contains("  sig v_c : tc(64);"));
        assert!(out.contains("    v_c = i_a + i_b;"));
        assert!(out.contains("    result = v_c;"));
        assert!(out.contains("    done = 1;"));
        assert!(!out.contains("fsm"));
        assert!(!out.contains("system"));
        assert_eq!(out.matches("\ndp ").count(), 1);
    }

    #[test]
    fn controller_and_system_block() {
        let out = render_text(
            r#"
pick(%a, %b) {
entry:
  %c = lt %a, %b
  condbr %c, ^l, ^r
l:
  ret %a
r:
  ret %b
}
"#,
            true,
        );
        assert!(out.contains("fsm pick_ctl(pick) {"));
        assert!(out.contains("  initial s_entry;"));
        assert!(out.contains("  state s_l, s_r, halted;"));
        assert!(out.contains("  @s_entry if (v_c) then (b_entry) -> s_l;"));
        assert!(out.contains("else (b_entry) -> s_r;"));
        assert!(out.contains("  @halted (halt) -> halted;"));
        assert!(out.contains("  sfg halt { }"));
        assert!(out.ends_with("system S {\n  pick;\n}\n"));
    }
}
