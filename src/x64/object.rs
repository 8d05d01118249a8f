// This module writes the software fragment of a unit as an x86-64 ELF relocatable using the
// object crate. Every lowered function is encoded against its laid-out frame, appended to
// .text at 16-byte alignment and given a defined function symbol (global, or local for
// `local` regions). Calls become relocations against the callee's symbol: callees that are
// not part of the software fragment are added once as undefined symbols, which is how a
// software region calls into code the linker or the hardware runtime provides. The
// relocation type follows the relocation and code models: PLT32 for PIC, PC32 for static
// and dynamic-no-pic code, and 64-bit absolute relocations for the large code model. The
// combined artifact also carries the GEZEL text of the hardware fragment in a `.gezel`
// section so one file describes both halves of a partitioned unit.

//! ELF relocatable emission.

use hashbrown::HashMap;
use object::write::{Object, Relocation, SectionId, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use crate::core::{CompilationSession, Endian, ObjectConfig, RelocModel};
use crate::passes::{Frame, PassOutcome, RegionFailure};

use super::encoder::{encode_function, CallKind, CallSite};
use super::lower::SwProgram;

/// Section carrying the hardware fragment in combined artifacts.
pub const HARDWARE_SECTION: &str = ".gezel";

/// Alignment of every function in `.text`.
pub const FUNCTION_ALIGN: u64 = 16;

/// Write the software program as an ELF relocatable, optionally embedding
/// the hardware description.
pub fn write_object(
    program: &SwProgram,
    frames: &HashMap<u32, Frame<'_>>,
    config: &ObjectConfig,
    hardware: Option<&str>,
    session: &CompilationSession<'_>,
) -> PassOutcome<Vec<u8>> {
    let endianness = match config.layout.endian {
        Endian::Little => Endianness::Little,
        Endian::Big => Endianness::Big,
    };
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, endianness);
    let text = obj.section_id(object::write::StandardSection::Text);

    let mut writer = ObjectWriter {
        obj,
        text,
        symbols: HashMap::new(),
    };

    // Define every function first so calls between them bind to the definition.
    let mut placed = Vec::with_capacity(program.functions.len());
    for function in &program.functions {
        let frame = frames
            .get(&function.func_idx)
            .ok_or_else(|| RegionFailure::new(function.name.as_str(), "function has no frame"))?;
        session.enter_region(&function.name);
        let encoded = encode_function(function, frame, config.code_model);
        session.leave_region();
        let encoded = encoded.map_err(|e| RegionFailure::new(function.name.as_str(), e.to_string()))?;

        session.record_code_size(encoded.code.len());
        let offset = writer.obj.append_section_data(writer.text, &encoded.code, FUNCTION_ALIGN);
        let scope = if function.local {
            SymbolScope::Compilation
        } else {
            SymbolScope::Linkage
        };
        let symbol = writer.obj.add_symbol(Symbol {
            name: function.name.as_bytes().to_vec(),
            value: offset,
            size: encoded.code.len() as u64,
            kind: SymbolKind::Text,
            scope,
            weak: false,
            section: SymbolSection::Section(writer.text),
            flags: SymbolFlags::None,
        });
        writer.symbols.insert(function.name.clone(), symbol);
        log::debug!(
            "{}: {} bytes at .text+{offset:#x}, {} call sites",
            function.name,
            encoded.code.len(),
            encoded.call_sites.len()
        );
        placed.push((function.name.as_str(), offset, encoded.call_sites));
    }

    for (name, offset, call_sites) in placed {
        for site in &call_sites {
            writer
                .relocate(offset, site, config.reloc_model)
                .map_err(|reason| RegionFailure::new(name, reason))?;
        }
    }

    if let Some(hdl) = hardware {
        let section = writer.obj.add_section(
            Vec::new(),
            HARDWARE_SECTION.as_bytes().to_vec(),
            SectionKind::Other,
        );
        writer.obj.append_section_data(section, hdl.as_bytes(), 1);
    }

    let bytes = writer
        .obj
        .write()
        .map_err(|e| RegionFailure::module(format!("ELF writer failed: {e}")))?;
    log::debug!("object: {} bytes, {} symbols", bytes.len(), writer.symbols.len());
    Ok(bytes)
}

struct ObjectWriter {
    obj: Object<'static>,
    text: SectionId,
    /// Defined and undefined function symbols by name.
    symbols: HashMap<String, SymbolId>,
}

impl ObjectWriter {
    fn symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.symbols.insert(name.to_string(), id);
        id
    }

    fn relocate(&mut self, function_offset: u64, site: &CallSite, reloc_model: RelocModel) -> Result<(), String> {
        let symbol = self.symbol(&site.symbol);
        let (kind, size, addend) = match (site.kind, reloc_model) {
            (CallKind::Rel32, RelocModel::Pic) => (RelocationKind::PltRelative, 32, -4),
            (CallKind::Rel32, RelocModel::Static | RelocModel::DynamicNoPic) => (RelocationKind::Relative, 32, -4),
            (CallKind::Abs64, RelocModel::Pic) => {
                return Err("absolute call sites cannot be position independent".to_string())
            }
            (CallKind::Abs64, _) => (RelocationKind::Absolute, 64, 0),
        };
        self.obj
            .add_relocation(
                self.text,
                Relocation {
                    offset: function_offset + site.offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Generic {
                        kind,
                        encoding: RelocationEncoding::Generic,
                        size,
                    },
                },
            )
            .map_err(|e| format!("call to `{}`: {e}", site.symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CodeModel, DataLayout, RegionScope};
    use crate::ir::Module;
    use crate::passes::frame::build_frame;
    use crate::x64::lower::lower_module;
    use bumpalo::Bump;
    use object::{Object as _, ObjectSection, ObjectSymbol, RelocationTarget};

    const UNIT: &str = r#"
ext(%x)!
helper(%a) local {
entry:
  %r = call @ext, %a
  ret %r
}
main(%a) {
entry:
  %r = call @helper, %a
  ret %r
}
"#;

    fn build(reloc_model: RelocModel, code_model: CodeModel, hardware: Option<&str>) -> PassOutcome<Vec<u8>> {
        let module = Module::parse(UNIT).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let layout = DataLayout::x86_64();
        let mut frames = HashMap::new();
        for f in crate::passes::regions(&module, RegionScope::All) {
            frames.insert(f, build_frame(&module, f, Some(&layout), &arena).unwrap());
        }
        let program = lower_module(&module, &frames, RegionScope::All, &session).unwrap();
        let config = ObjectConfig { reloc_model, code_model, layout };
        write_object(&program, &frames, &config, hardware, &session)
    }

    #[test]
    fn symbols_and_relocations() {
        let bytes = build(RelocModel::Static, CodeModel::Small, None).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::X86_64);

        let main = file.symbol_by_name("main").unwrap();
        assert!(main.is_definition());
        assert!(main.is_global());
        let helper = file.symbol_by_name("helper").unwrap();
        assert!(helper.is_definition());
        assert!(helper.is_local());
        let ext = file.symbol_by_name("ext").unwrap();
        assert!(ext.is_undefined());

        let text = file.section_by_name(".text").unwrap();
        let relocs: Vec<_> = text.relocations().collect();
        assert_eq!(relocs.len(), 2);
        for (_, reloc) in &relocs {
            assert_eq!(reloc.kind(), RelocationKind::Relative);
            assert_eq!(reloc.size(), 32);
            assert_eq!(reloc.addend(), -4);
            assert!(matches!(reloc.target(), RelocationTarget::Symbol(_)));
        }
        assert!(file.section_by_name(HARDWARE_SECTION).is_none());
    }

    #[test]
    fn relocation_kind_follows_models() {
        let bytes = build(RelocModel::Pic, CodeModel::Small, None).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        assert!(text.relocations().all(|(_, r)| r.kind() == RelocationKind::PltRelative));

        let bytes = build(RelocModel::Static, CodeModel::Large, None).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        assert!(text
            .relocations()
            .all(|(_, r)| r.kind() == RelocationKind::Absolute && r.size() == 64));

        let err = build(RelocModel::Pic, CodeModel::Large, None).unwrap_err();
        assert!(err.reason.contains("position independent"));
    }

    #[test]
    fn combined_output_embeds_hardware() {
        let hdl = "dp f(out done : ns(1)) {\n}\n";
        let bytes = build(RelocModel::Static, CodeModel::Small, Some(hdl)).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let section = file.section_by_name(HARDWARE_SECTION).unwrap();
        assert_eq!(section.data().unwrap(), hdl.as_bytes());
    }
}
