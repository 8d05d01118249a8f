// This module defines TargetDescriptor, the immutable identity of one backend variant: the
// triple it was created from, the variant it selects (pure hardware GEZEL or hybrid HWSW),
// CPU and feature strings, relocation and code model, and the target data layout. The layout
// is an explicit sum type (TargetData::Layout / TargetData::NoLayout) so every consumer has
// to handle the hardware case, where there is no linear address space, at compile time.
// Descriptors are built once, never mutated, and shared through Arc by concurrent units.

//! Target identity and data layout.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::{PipelineError, PipelineResult};

/// The closed set of backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetVariant {
    /// GEZEL: every region becomes hardware.
    PureHardware,
    /// HWSW: regions are routed by their partition tag.
    Hybrid,
}

impl TargetVariant {
    /// Triple family naming this variant.
    pub const fn family(self) -> &'static str {
        match self {
            TargetVariant::PureHardware => "gezel",
            TargetVariant::Hybrid => "hwsw",
        }
    }
}

impl fmt::Display for TargetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family())
    }
}

/// Relocation model requested by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelocModel {
    #[default]
    Static,
    Pic,
    DynamicNoPic,
}

impl FromStr for RelocModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(RelocModel::Static),
            "pic" => Ok(RelocModel::Pic),
            "dynamic-no-pic" => Ok(RelocModel::DynamicNoPic),
            _ => Err(format!("unknown relocation model `{s}`")),
        }
    }
}

/// Code model requested by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodeModel {
    #[default]
    Small,
    Medium,
    Large,
    Kernel,
}

impl FromStr for CodeModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(CodeModel::Small),
            "medium" => Ok(CodeModel::Medium),
            "large" => Ok(CodeModel::Large),
            "kernel" => Ok(CodeModel::Kernel),
            _ => Err(format!("unknown code model `{s}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

/// Byte size and alignment information for a target memory model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataLayout {
    pub endian: Endian,
    /// Pointer size in bytes.
    pub pointer_size: u32,
    /// Pointer alignment in bytes.
    pub pointer_align: u32,
    /// Natural stack alignment in bytes.
    pub stack_align: u32,
    /// Native integer widths in bits.
    pub native_int_widths: Vec<u32>,
}

impl DataLayout {
    /// x86-64 System V layout.
    pub fn x86_64() -> Self {
        Self {
            endian: Endian::Little,
            pointer_size: 8,
            pointer_align: 8,
            stack_align: 16,
            native_int_widths: vec![8, 16, 32, 64],
        }
    }

    /// Size and alignment of one IR word (all IR values are 64-bit).
    pub fn word(&self) -> (u32, u32) {
        (self.pointer_size, self.pointer_align)
    }

    /// Round `offset` up to a multiple of `align` (a power of two), `None` on overflow.
    pub fn align_to(offset: u32, align: u32) -> Option<u32> {
        offset.checked_next_multiple_of(align.max(1))
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = match self.endian {
            Endian::Little => "e",
            Endian::Big => "E",
        };
        let widths: Vec<String> = self.native_int_widths.iter().map(|w| w.to_string()).collect();
        write!(
            f,
            "{e}-p:{}:{}-i64:64-n{}-S{}",
            self.pointer_size * 8,
            self.pointer_align * 8,
            widths.join(":"),
            self.stack_align * 8
        )
    }
}

/// Target data layout, or its explicit absence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetData {
    Layout(DataLayout),
    /// No linear address space (hardware targets).
    NoLayout,
}

impl TargetData {
    pub fn layout(&self) -> Option<&DataLayout> {
        match self {
            TargetData::Layout(layout) => Some(layout),
            TargetData::NoLayout => None,
        }
    }

    pub fn has_layout(&self) -> bool {
        matches!(self, TargetData::Layout(_))
    }
}

/// Parsed `+feat,-feat` string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureSet {
    flags: BTreeMap<String, bool>,
}

impl FeatureSet {
    /// Features with a meaning for these targets.
    pub const KNOWN: &'static [&'static str] = &["system", "hw-default"];

    pub fn parse(features: &str) -> PipelineResult<Self> {
        let mut flags = BTreeMap::new();
        for item in features.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (enabled, name) = if let Some(name) = item.strip_prefix('+') {
                (true, name)
            } else if let Some(name) = item.strip_prefix('-') {
                (false, name)
            } else {
                (true, item)
            };
            if name.is_empty() {
                return Err(PipelineError::Parse(format!("empty feature in `{features}`")));
            }
            if !Self::KNOWN.contains(&name) {
                log::warn!("ignoring unknown target feature `{name}`");
                continue;
            }
            flags.insert(name.to_string(), enabled);
        }
        Ok(Self { flags })
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .flags
            .iter()
            .map(|(name, on)| format!("{}{name}", if *on { '+' } else { '-' }))
            .collect();
        f.write_str(&items.join(","))
    }
}

/// Immutable description of one compilation target.
///
/// Built once per target from the driver's configuration surface. The
/// [`target_data`](Self::target_data) accessor reports
/// [`TargetData::NoLayout`] for GEZEL, and for HWSW triples that do not name a
/// software architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    triple: String,
    variant: TargetVariant,
    cpu: String,
    features: FeatureSet,
    reloc_model: RelocModel,
    code_model: CodeModel,
    target_data: TargetData,
}

impl TargetDescriptor {
    pub fn new(
        triple: &str,
        cpu: &str,
        features: &str,
        reloc_model: RelocModel,
        code_model: CodeModel,
    ) -> PipelineResult<Self> {
        let invalid = |reason: &str| PipelineError::InvalidTriple {
            triple: triple.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = triple.split('-');
        let variant = match parts.next().unwrap_or_default() {
            "gezel" => TargetVariant::PureHardware,
            "hwsw" => TargetVariant::Hybrid,
            "" => return Err(invalid("empty triple")),
            other => return Err(invalid(&format!("unknown target family `{other}`"))),
        };

        let target_data = match (variant, parts.next()) {
            (TargetVariant::PureHardware, _) => TargetData::NoLayout,
            (TargetVariant::Hybrid, None | Some("none")) => TargetData::NoLayout,
            (TargetVariant::Hybrid, Some("x86_64")) => TargetData::Layout(DataLayout::x86_64()),
            (TargetVariant::Hybrid, Some(arch)) => {
                return Err(invalid(&format!("unsupported software architecture `{arch}`")))
            }
        };

        let cpu = if cpu.is_empty() { "generic" } else { cpu };
        if !matches!(cpu, "generic" | "x86-64") {
            log::warn!("unknown CPU `{cpu}` for {variant}, keeping it as given");
        }

        let descriptor = Self {
            triple: triple.to_string(),
            variant,
            cpu: cpu.to_string(),
            features: FeatureSet::parse(features)?,
            reloc_model,
            code_model,
            target_data,
        };
        log::debug!(
            "target {} ({}), layout: {}",
            descriptor.triple,
            descriptor.variant,
            descriptor
                .target_data
                .layout()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(descriptor)
    }

    /// Descriptor with default CPU, features and models.
    pub fn from_triple(triple: &str) -> PipelineResult<Self> {
        Self::new(triple, "", "", RelocModel::default(), CodeModel::default())
    }

    pub fn triple(&self) -> &str {
        &self.triple
    }

    pub fn variant(&self) -> TargetVariant {
        self.variant
    }

    pub fn cpu(&self) -> &str {
        &self.cpu
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn reloc_model(&self) -> RelocModel {
        self.reloc_model
    }

    pub fn code_model(&self) -> CodeModel {
        self.code_model
    }

    pub fn target_data(&self) -> &TargetData {
        &self.target_data
    }
}
