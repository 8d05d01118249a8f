//! End-to-end tests: IR text in, artifacts out.
//!
//! ELF artifacts are read back with the `object` crate.

use std::fs;
use std::sync::Arc;

use object::{Object, ObjectSection, ObjectSymbol};

use hwsw::core::{
    CodeModel, CodegenOptions, FileType, OptLevel, OutputSink, PassKind, PassManager, PipelineError,
    RelocModel, TargetDescriptor, TargetVariant,
};
use hwsw::driver::{compile_batch, compile_unit, parse_module};
use hwsw::target_machine::{EmissionPipeline, TargetMachine};
use hwsw::x64::object::HARDWARE_SECTION;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn descriptor(triple: &str, features: &str) -> Arc<TargetDescriptor> {
    Arc::new(TargetDescriptor::new(triple, "", features, RelocModel::Static, CodeModel::Small).unwrap())
}

const MINIMAL: &str = r#"
scale(%x) {
entry:
  %k = const 5
  %y = mul %x, %k
  ret %y
}
"#;

const MINIMAL_SW: &str = r#"
scale(%x) sw {
entry:
  %k = const 5
  %y = mul %x, %k
  ret %y
}
"#;

const PARTITIONED: &str = r#"
; multiply-accumulate in hardware
mac(%a, %b, %acc) hw {
entry:
  %p = mul %a, %b
  %s = add %p, %acc
  ret %s
}

; counter loop in hardware
count(%n) hw {
entry:
  %zero = const 0
  br ^loop
loop:
  %i = phi [^entry, %zero], [^loop, %next]
  %one = const 1
  %next = add %i, %one
  %more = lt %next, %n
  condbr %more, ^loop, ^exit
exit:
  ret %next
}

report(%v)!

clamp(%v, %hi) local sw {
entry:
  %big = lt %hi, %v
  %r = select %big, %hi, %v
  ret %r
}

main(%x, %y) sw {
entry:
  %m = call @mac, %x, %y, %x
  %c = call @clamp, %m, %y
  %ignored = call @report, %c
  ret %c
}
"#;

#[test]
fn gezel_minimal_module_has_one_datapath() {
    init();
    let artifact = compile_unit(
        descriptor("gezel", ""),
        &CodegenOptions::new(FileType::HardwareDescription),
        MINIMAL,
    )
    .unwrap();
    let text = String::from_utf8(artifact.bytes).unwrap();

    let top_level: Vec<&str> = text
        .lines()
        .filter(|line| line.starts_with("dp ") || line.starts_with("system "))
        .collect();
    assert_eq!(top_level.len(), 1, "{text}");
    assert!(top_level[0].starts_with("dp scale("));
    assert!(text.contains("in i_x : tc(64)"));
    assert!(text.contains("v_y = i_x * 5;"));
    assert!(!text.contains("fsm"));
}

#[test]
fn hwsw_software_object_has_no_hardware_fragment() {
    init();
    let artifact = compile_unit(
        descriptor("hwsw-x86_64", ""),
        &CodegenOptions::new(FileType::SoftwareObject),
        MINIMAL_SW,
    )
    .unwrap();
    assert_eq!(artifact.report.stats.hardware_regions, 0);
    assert_eq!(artifact.report.stats.software_regions, 1);
    assert!(artifact.report.stats.code_size > 0);

    let file = object::File::parse(&*artifact.bytes).unwrap();
    assert!(file.section_by_name(HARDWARE_SECTION).is_none());
    let scale = file.symbol_by_name("scale").unwrap();
    assert!(scale.is_definition());
    assert!(scale.is_global());

    let bytes = &artifact.bytes;
    assert!(!bytes.windows(3).any(|w| w == b"dp "));
    assert!(!bytes.windows(4).any(|w| w == b"fsm "));
}

#[test]
fn combined_artifact_carries_both_halves() {
    init();
    let artifact = compile_unit(
        descriptor("hwsw-x86_64", "+system"),
        &CodegenOptions::new(FileType::Combined),
        PARTITIONED,
    )
    .unwrap();
    assert_eq!(artifact.report.stats.hardware_regions, 2);
    assert_eq!(artifact.report.stats.software_regions, 2);

    let file = object::File::parse(&*artifact.bytes).unwrap();

    let main = file.symbol_by_name("main").unwrap();
    assert!(main.is_definition() && main.is_global());
    let clamp = file.symbol_by_name("clamp").unwrap();
    assert!(clamp.is_definition() && clamp.is_local());
    for callee in ["mac", "report"] {
        let symbol = file.symbol_by_name(callee).unwrap();
        assert!(symbol.is_undefined(), "{callee}");
    }
    assert!(file.symbol_by_name("count").is_none());

    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.relocations().count(), 3);

    let hdl = file.section_by_name(HARDWARE_SECTION).unwrap();
    let hdl = std::str::from_utf8(hdl.data().unwrap()).unwrap();
    assert!(hdl.contains("dp mac(in i_a : tc(64); in i_b : tc(64); in i_acc : tc(64);"));
    assert!(hdl.contains("dp count(in i_n : tc(64)"));
    assert!(hdl.contains("fsm count_ctl(count) {"));
    assert!(hdl.contains("  initial s_entry;"));
    assert!(hdl.contains("system S {\n  mac;\n  count;\n}\n"));
    assert!(!hdl.contains("dp main("));
    assert!(!hdl.contains("dp clamp("));
}

#[test]
fn hw_default_routes_untagged_regions_to_hardware() {
    init();
    let options = CodegenOptions::new(FileType::HardwareDescription);
    let software = compile_unit(descriptor("hwsw-x86_64", ""), &options, MINIMAL).unwrap();
    let hardware = compile_unit(descriptor("hwsw-x86_64", "+hw-default"), &options, MINIMAL).unwrap();

    let software = String::from_utf8(software.bytes).unwrap();
    let hardware = String::from_utf8(hardware.bytes).unwrap();
    assert!(!software.contains("dp scale("));
    assert!(hardware.contains("dp scale("));
}

#[test]
fn assembly_listing_names_callees() {
    init();
    let artifact = compile_unit(
        descriptor("hwsw-x86_64", ""),
        &CodegenOptions::new(FileType::SoftwareAssembly).with_opt_level(OptLevel::None),
        PARTITIONED,
    )
    .unwrap();
    let text = String::from_utf8(artifact.bytes).unwrap();
    assert!(text.contains("\t.globl\tmain\n"));
    assert!(!text.contains("\t.globl\tclamp\n"));
    assert!(text.contains("clamp:\n"));
    assert!(text.contains("mac"));
    assert!(text.contains("report"));
    assert!(!text.contains("count"));
}

fn malformed_module() -> hwsw::ir::Module {
    let mut module = parse_module(MINIMAL).unwrap();
    // Point the multiply at a value that does not exist.
    let y = module.values.iter().position(|v| v.name == "y").unwrap();
    let first_operand = module.values[y].op_begin_idx as usize;
    module.value_operands[first_operand] = 4096;
    module
}

#[test]
fn verifier_catches_malformed_region() {
    init();
    let module = malformed_module();
    for triple in ["gezel", "hwsw-x86_64"] {
        let tm = TargetMachine::new(descriptor(triple, "+hw-default"));
        let mut pm = PassManager::new();
        tm.add_passes_to_emit_file(&mut pm, FileType::HardwareDescription, OptLevel::None, false)
            .unwrap();
        let mut sink = OutputSink::memory();
        let err = pm.run(&module, &mut sink).unwrap_err();
        match err {
            PipelineError::Verification { after, ref region, .. } => {
                assert_eq!(after, PassKind::Legalize);
                assert_eq!(region, "scale");
            }
            other => panic!("{triple}: expected a verification failure, got {other}"),
        }
        assert!(sink.is_empty());
    }
}

#[test]
fn disabled_verification_fails_later() {
    init();
    let module = malformed_module();

    let tm = TargetMachine::new(descriptor("gezel", ""));
    let mut pm = PassManager::new();
    tm.add_passes_to_emit_file(&mut pm, FileType::HardwareDescription, OptLevel::None, true)
        .unwrap();
    let err = pm.run(&module, &mut OutputSink::memory()).unwrap_err();
    assert!(!err.is_verification(), "{err}");
    assert!(matches!(
        err,
        PipelineError::PassFailed { target: TargetVariant::PureHardware, kind: PassKind::Lower, .. }
    ));
    assert_eq!(err.region(), Some("scale"));

    let tm = TargetMachine::new(descriptor("hwsw-x86_64", ""));
    let mut pm = PassManager::new();
    tm.add_passes_to_emit_file(&mut pm, FileType::SoftwareObject, OptLevel::None, true)
        .unwrap();
    let err = pm.run(&module, &mut OutputSink::memory()).unwrap_err();
    assert!(!err.is_verification(), "{err}");
    assert!(err.to_string().starts_with("hwsw: "));
}

#[test]
fn failed_run_leaves_file_untouched() {
    init();
    let dir = std::env::temp_dir().join(format!("hwsw-e2e-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("unit.fdl");
    let _ = fs::remove_file(&path);

    let tm = TargetMachine::new(descriptor("gezel", ""));
    let mut pm = PassManager::new();
    tm.add_passes_to_emit_file(&mut pm, FileType::HardwareDescription, OptLevel::None, false)
        .unwrap();

    let mut sink = OutputSink::file(&path);
    assert!(pm.run(&malformed_module(), &mut sink).is_err());
    assert!(!path.exists());

    let module = parse_module(MINIMAL).unwrap();
    let report = pm.run(&module, &mut sink).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len() as usize, report.artifact_size);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn hardware_calls_are_rejected() {
    init();
    let err = compile_unit(
        descriptor("gezel", ""),
        &CodegenOptions::new(FileType::HardwareDescription),
        PARTITIONED,
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::PassFailed { pass: "reject-calls", .. }), "{err}");
    assert_eq!(err.region(), Some("main"));
}

#[test]
fn batch_compiles_units_independently() {
    init();
    let units = [
        ("minimal", MINIMAL_SW),
        ("partitioned", PARTITIONED),
        ("broken", "main(%a) sw {\nentry:\n  %r = call @nowhere, %a\n  ret %r\n}\n"),
    ];
    let results = compile_batch(
        &descriptor("hwsw-x86_64", ""),
        &CodegenOptions::new(FileType::SoftwareObject),
        &units,
    );
    assert_eq!(results.len(), 3);
    let names: Vec<&str> = results.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, ["minimal", "partitioned", "broken"]);

    for (name, result) in &results[..2] {
        let artifact = result.as_ref().unwrap_or_else(|e| panic!("{name}: {e}"));
        assert!(object::File::parse(&*artifact.bytes).is_ok());
    }
    assert!(matches!(results[2].1, Err(PipelineError::Parse(_))));
}

#[test]
fn oversized_frame_fails_only_its_unit() {
    init();
    let units = [
        ("huge", "f() sw {\nentry:\n  %s = alloca 4294967295, 8\n  terminate\n}\n"),
        ("minimal", MINIMAL_SW),
    ];
    let options = CodegenOptions::new(FileType::SoftwareObject).with_opt_level(OptLevel::None);
    let results = compile_batch(&descriptor("hwsw-x86_64", ""), &options, &units);

    let err = results[0].1.as_ref().unwrap_err();
    assert!(
        matches!(err, PipelineError::PassFailed { pass: "frame-layout", kind: PassKind::Legalize, .. }),
        "{err}"
    );
    assert_eq!(err.region(), Some("f"));
    assert!(err.to_string().ends_with("frame exceeds 2 GiB"), "{err}");
    assert!(results[1].1.is_ok());
}
