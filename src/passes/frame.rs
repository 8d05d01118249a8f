// This module assigns stack frames to software regions. Every value a region defines gets
// one word-sized slot, every phi gets an extra scratch slot used while copying phi operands
// along an edge (so parallel copies never clobber each other), and every alloca gets a
// storage slot of its own size and alignment. With a data layout the frame-layout pass turns
// slots into negative rbp-relative byte offsets and rounds the frame to the stack alignment;
// without one the abstract-frame pass only numbers the slots, which is enough for symbolic
// listings but not for machine code. Slot tables live in the run's bumpalo arena.

//! Stack frame assignment for software regions.

use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::HashMap;

use crate::core::{CompilationSession, DataLayout, RegionScope};
use crate::ir::{Module, Operation};

use super::{regions, CodegenUnit, PassOutcome, RegionFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Home of an SSA value.
    Value,
    /// Staging area for a phi during edge copies.
    PhiScratch,
    /// Memory an alloca points at.
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub value: u32,
    pub kind: SlotKind,
    pub size: u32,
    pub align: u32,
    /// rbp-relative offset, once laid out.
    pub offset: Option<i32>,
}

/// Frame of one software region.
#[derive(Debug)]
pub struct Frame<'arena> {
    slots: BumpVec<'arena, FrameSlot>,
    value_slots: HashMap<u32, u32>,
    scratch_slots: HashMap<u32, u32>,
    storage_slots: HashMap<u32, u32>,
    size: Option<u32>,
}

impl<'arena> Frame<'arena> {
    pub fn new_in(arena: &'arena Bump) -> Self {
        Self {
            slots: BumpVec::new_in(arena),
            value_slots: HashMap::new(),
            scratch_slots: HashMap::new(),
            storage_slots: HashMap::new(),
            size: None,
        }
    }

    fn push(&mut self, value: u32, kind: SlotKind, size: u32, align: u32) -> u32 {
        let idx = self.slots.len() as u32;
        self.slots.push(FrameSlot {
            value,
            kind,
            size,
            align,
            offset: None,
        });
        let map = match kind {
            SlotKind::Value => &mut self.value_slots,
            SlotKind::PhiScratch => &mut self.scratch_slots,
            SlotKind::Storage => &mut self.storage_slots,
        };
        map.insert(value, idx);
        idx
    }

    pub fn value_slot(&self, value: u32) -> Option<u32> {
        self.value_slots.get(&value).copied()
    }

    pub fn scratch_slot(&self, phi: u32) -> Option<u32> {
        self.scratch_slots.get(&phi).copied()
    }

    pub fn storage_slot(&self, alloca: u32) -> Option<u32> {
        self.storage_slots.get(&alloca).copied()
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn offset(&self, slot: u32) -> Option<i32> {
        self.slots.get(slot as usize).and_then(|s| s.offset)
    }

    /// Bytes reserved below the saved rbp.
    pub fn size(&self) -> Option<u32> {
        self.size
    }

    pub fn is_laid_out(&self) -> bool {
        self.size.is_some()
    }

    /// Assign byte offsets growing down from rbp.
    fn lay_out(&mut self, layout: &DataLayout) -> Result<(), String> {
        const TOO_LARGE: &str = "frame exceeds 2 GiB";
        let mut depth = 0u32;
        for slot in self.slots.iter_mut() {
            if slot.align > layout.stack_align {
                return Err(format!(
                    "slot alignment {} exceeds the stack alignment {}",
                    slot.align, layout.stack_align
                ));
            }
            depth = depth
                .checked_add(slot.size)
                .and_then(|end| DataLayout::align_to(end, slot.align))
                .ok_or(TOO_LARGE)?;
            let offset = i32::try_from(depth).map_err(|_| TOO_LARGE.to_string())?;
            slot.offset = Some(-offset);
        }
        self.size = Some(DataLayout::align_to(depth, layout.stack_align).ok_or(TOO_LARGE)?);
        Ok(())
    }
}

/// Number the slots of one region and, given a layout, place them.
pub fn build_frame<'arena>(
    module: &Module,
    func_idx: u32,
    layout: Option<&DataLayout>,
    arena: &'arena Bump,
) -> Result<Frame<'arena>, String> {
    let (word_size, word_align) = layout.map(DataLayout::word).unwrap_or((8, 8));
    let mut frame = Frame::new_in(arena);

    for v in module.func_values(func_idx) {
        let value = &module.values[v as usize];
        if value.is_removed() || !value.defines_value() {
            continue;
        }
        frame.push(v, SlotKind::Value, word_size, word_align);
        if value.is_phi() {
            frame.push(v, SlotKind::PhiScratch, word_size, word_align);
        }
        if value.op == Operation::Alloca {
            let [size, align] = match *module.immediates(v) {
                [size, align] => [size, align],
                _ => return Err(format!("alloca {} has no size", module.value_label(v))),
            };
            if size == 0 {
                return Err(format!("alloca {} has zero size", module.value_label(v)));
            }
            if !align.is_power_of_two() {
                return Err(format!(
                    "alloca {} alignment {align} is not a power of two",
                    module.value_label(v)
                ));
            }
            frame.push(v, SlotKind::Storage, size, align);
        }
    }

    if let Some(layout) = layout {
        frame.lay_out(layout)?;
    }
    Ok(frame)
}

/// `frame-layout` (with a layout) and `abstract-frame` (without).
pub fn assign_frames<'arena>(
    unit: &mut CodegenUnit<'arena>,
    scope: RegionScope,
    layout: Option<&DataLayout>,
    session: &CompilationSession<'arena>,
) -> PassOutcome {
    for func_idx in regions(&unit.module, scope) {
        let name = &unit.module.functions[func_idx as usize].name;
        let frame = build_frame(&unit.module, func_idx, layout, session.arena())
            .map_err(|reason| RegionFailure::new(name.as_str(), reason))?;
        log::debug!(
            "{name}: {} frame slots, {}",
            frame.slot_count(),
            frame
                .size()
                .map(|s| format!("{s} bytes"))
                .unwrap_or_else(|| "no layout".to_string())
        );
        unit.frames.insert(func_idx, frame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: &str = r#"
f(%a, %b) {
entry:
  %buf = alloca 24, 16
  condbr %a, ^l, ^r
l:
  br ^r
r:
  %p = phi [^entry, %a], [^l, %b]
  ret %p
}
"#;

    #[test]
    fn slots_cover_values_phis_and_storage() {
        let module = Module::parse(REGION).unwrap();
        let arena = Bump::new();
        let frame = build_frame(&module, 0, None, &arena).unwrap();

        // a, b, buf (+ storage), p (+ scratch)
        assert_eq!(frame.slot_count(), 6);
        assert!(frame.storage_slot(2).is_some());
        let p = module.values.iter().position(|v| v.name == "p").unwrap() as u32;
        assert!(frame.scratch_slot(p).is_some());
        assert_ne!(frame.scratch_slot(p), frame.value_slot(p));
        assert!(!frame.is_laid_out());
        assert_eq!(frame.offset(0), None);
    }

    #[test]
    fn layout_assigns_aligned_offsets() {
        let module = Module::parse(REGION).unwrap();
        let arena = Bump::new();
        let frame = build_frame(&module, 0, Some(&DataLayout::x86_64()), &arena).unwrap();

        assert_eq!(frame.offset(0), Some(-8));
        assert_eq!(frame.offset(1), Some(-16));
        assert_eq!(frame.offset(2), Some(-24));
        // 24 byte storage aligned to 16: 24 + 24 = 48
        assert_eq!(frame.offset(3), Some(-48));
        let size = frame.size().unwrap();
        assert_eq!(size % 16, 0);
        assert!(size >= 64);

        for slot in frame.slots() {
            let offset = slot.offset.unwrap();
            assert_eq!(offset.unsigned_abs() % slot.align, 0);
        }
    }

    #[test]
    fn over_aligned_alloca_is_rejected() {
        let module = Module::parse("f() {\nentry:\n  %s = alloca 8, 32\n  terminate\n}\n").unwrap();
        let arena = Bump::new();
        let err = build_frame(&module, 0, Some(&DataLayout::x86_64()), &arena).unwrap_err();
        assert!(err.contains("exceeds the stack alignment 16"), "{err}");

        // slot numbering alone does not care
        assert!(build_frame(&module, 0, None, &arena).is_ok());
    }

    #[test]
    fn oversized_alloca_fails_instead_of_wrapping() {
        let arena = Bump::new();
        for size in ["4294967295", "4294967288", "2147483648"] {
            let text = format!("f() sw {{\nentry:\n  %s = alloca {size}, 8\n  terminate\n}}\n");
            let module = Module::parse(&text).unwrap();
            let err = build_frame(&module, 0, Some(&DataLayout::x86_64()), &arena).unwrap_err();
            assert_eq!(err, "frame exceeds 2 GiB", "alloca {size}");
        }
    }
}
