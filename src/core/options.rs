//! Per-invocation codegen options: requested file type, optimisation level and
//! the verification toggle.

use std::fmt;
use std::str::FromStr;

/// Requested output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Textual GEZEL document.
    HardwareDescription,
    /// x86-64 ELF relocatable holding the software fragment.
    SoftwareObject,
    /// GAS-syntax listing of the software fragment.
    SoftwareAssembly,
    /// ELF relocatable that also carries the hardware fragment in `.gezel`.
    Combined,
}

impl FileType {
    pub const ALL: [FileType; 4] = [
        FileType::HardwareDescription,
        FileType::SoftwareObject,
        FileType::SoftwareAssembly,
        FileType::Combined,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            FileType::HardwareDescription => "hdl",
            FileType::SoftwareObject => "obj",
            FileType::SoftwareAssembly => "asm",
            FileType::Combined => "combined",
        }
    }

    /// Whether this file type needs software lowering.
    pub const fn has_software(self) -> bool {
        matches!(
            self,
            FileType::SoftwareObject | FileType::SoftwareAssembly | FileType::Combined
        )
    }

    /// Whether this file type needs hardware lowering.
    pub const fn has_hardware(self) -> bool {
        matches!(self, FileType::HardwareDescription | FileType::Combined)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::ALL
            .into_iter()
            .find(|ft| ft.name() == s)
            .ok_or_else(|| format!("unknown file type `{s}`"))
    }
}

/// Optimisation level; ordered so `level >= OptLevel::Less` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

impl OptLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(OptLevel::None),
            1 => Some(OptLevel::Less),
            2 => Some(OptLevel::Default),
            3 => Some(OptLevel::Aggressive),
            _ => None,
        }
    }
}

/// Everything `add_passes_to_emit_file` needs besides the pass manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    pub file_type: FileType,
    pub opt_level: OptLevel,
    pub disable_verify: bool,
}

impl CodegenOptions {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            opt_level: OptLevel::default(),
            disable_verify: false,
        }
    }

    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.disable_verify = !verify;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_names_round_trip() {
        for ft in FileType::ALL {
            assert_eq!(ft.name().parse::<FileType>(), Ok(ft));
        }
        assert!("elf".parse::<FileType>().is_err());
    }

    #[test]
    fn opt_levels_are_ordered() {
        assert!(OptLevel::None < OptLevel::Less);
        assert!(OptLevel::Less < OptLevel::Default);
        assert!(OptLevel::Default < OptLevel::Aggressive);
        assert_eq!(OptLevel::from_level(3), Some(OptLevel::Aggressive));
        assert_eq!(OptLevel::from_level(4), None);
    }
}
