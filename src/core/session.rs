// This module provides arena-based session management for one pipeline run. A
// CompilationSession owns a reference to a bumpalo arena that backs per-run scratch data
// (frame slot tables, interned region names) so everything allocated while a unit is being
// compiled shares one lifetime and is freed at once when the run ends. The session also
// tracks which region is currently being processed, for log context, and accumulates
// SessionStats: passes executed, regions lowered to hardware and software, values folded,
// reduced and eliminated by the cleanups, memory slots promoted, and the artifact size.
// Every unit gets its own session, which keeps concurrent batch runs independent.

//! Arena-based compilation session.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;
use hashbrown::HashMap;

/// Arena-backed state of one pipeline run.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,

    stats: RefCell<SessionStats>,

    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Region currently being processed.
    current_region: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_region: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    pub fn enter_region(&self, name: &str) {
        let name = self.intern_str(name);
        log::trace!("entering region `{name}`");
        *self.current_region.borrow_mut() = Some(name);
    }

    pub fn leave_region(&self) {
        *self.current_region.borrow_mut() = None;
    }

    pub fn current_region(&self) -> Option<&'arena str> {
        *self.current_region.borrow()
    }

    pub fn record_pass(&self, name: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_run += 1;
        *stats.pass_counts.entry(name).or_insert(0) += 1;
    }

    pub fn record_hardware_region(&self) {
        self.stats.borrow_mut().hardware_regions += 1;
    }

    pub fn record_software_region(&self) {
        self.stats.borrow_mut().software_regions += 1;
    }

    /// Encoded machine code bytes of one software function.
    pub fn record_code_size(&self, bytes: usize) {
        self.stats.borrow_mut().code_size += bytes;
    }

    pub fn record_folded(&self, count: usize) {
        self.stats.borrow_mut().values_folded += count;
    }

    pub fn record_reduced(&self, count: usize) {
        self.stats.borrow_mut().values_reduced += count;
    }

    pub fn record_eliminated(&self, count: usize) {
        self.stats.borrow_mut().values_eliminated += count;
    }

    pub fn record_promoted(&self, count: usize) {
        self.stats.borrow_mut().slots_promoted += count;
    }

    pub fn record_artifact(&self, size: usize) {
        self.stats.borrow_mut().artifact_size = size;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Counters collected over one pipeline run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionStats {
    pub passes_run: usize,

    /// Executions per pass name.
    pub pass_counts: HashMap<&'static str, usize>,

    pub hardware_regions: usize,

    pub software_regions: usize,

    /// Machine code bytes produced by the software fragment.
    pub code_size: usize,

    pub values_folded: usize,

    pub values_reduced: usize,

    pub values_eliminated: usize,

    pub slots_promoted: usize,

    pub artifact_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline Statistics:")?;
        writeln!(f, "  Passes run: {}", self.passes_run)?;
        writeln!(f, "  Hardware regions: {}", self.hardware_regions)?;
        writeln!(f, "  Software regions: {}", self.software_regions)?;
        writeln!(f, "  Machine code size: {} bytes", self.code_size)?;
        writeln!(f, "  Values folded: {}", self.values_folded)?;
        writeln!(f, "  Values strength-reduced: {}", self.values_reduced)?;
        writeln!(f, "  Values eliminated: {}", self.values_eliminated)?;
        writeln!(f, "  Slots promoted: {}", self.slots_promoted)?;
        writeln!(f, "  Artifact size: {} bytes", self.artifact_size)?;

        if !self.pass_counts.is_empty() {
            writeln!(f, "  Pass breakdown:")?;
            let mut sorted: Vec<_> = self.pass_counts.iter().collect();
            sorted.sort();
            for (name, count) in sorted {
                writeln!(f, "    {name}: {count}")?;
            }
        }

        Ok(())
    }
}
