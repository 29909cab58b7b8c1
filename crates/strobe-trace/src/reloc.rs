use crate::module::ContentKind;
use crate::table::ModuleId;

/// Where a relocation's new value comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelocSource {
    /// A specific module, by resolved handle.
    Module(ModuleId),
    /// The first module of a given content kind ("patch in the address of
    /// whatever semaphore surface this trace has").
    Kind(ContentKind),
    /// A literal constant carried by the trace itself.
    Literal(u64),
    /// The relocation only consumes the owning module's own state (size,
    /// branch targets within itself).
    SelfModule,
}

impl RelocSource {
    pub fn references(&self, id: ModuleId) -> bool {
        matches!(self, RelocSource::Module(m) if *m == id)
    }
}

/// How the masked new value combines with the masked old value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Combine {
    /// Bits under the mask are replaced.
    #[default]
    Overwrite,
    /// Bits under the mask become `masked(old) + masked(new)`.
    Add,
}

/// Bit-packed surface properties a relocation can patch in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceProperty {
    Width,
    Height,
    Pitch,
    /// Device format enumerant, answered by the resource manager.
    Format,
    /// Packed block-linear tiling parameters (width/height/depth log2 in
    /// three nibbles, pitch-linear surfaces pack 0).
    BlockLinear,
    AaSamples,
    /// Physical address of the surface's allocation, answered by the
    /// resource manager.
    PhysAddr,
}

/// The per-kind half of a relocation: what the resolved value is and which
/// word(s) it lands in. Everything else (mask, combine mode, peer routing,
/// frozen-offset handling, deferred writes) is shared across kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// Device context handle of the source surface.
    CtxDmaHandle,
    /// Low 32 bits of the source's device address.
    Addr32,
    /// 40-bit device address split as high byte + low word across two
    /// offsets.
    Addr40 { pair_offset: u64, swap: bool },
    /// Byte size of the source module, 32-bit.
    Size32,
    /// Byte size of the source module across two words.
    Size64 { pair_offset: u64, swap: bool },
    /// Logical active-region index from the resource manager.
    ActiveRegion,
    /// Type enumerant of the source surface. Compatibility quirk: writes the
    /// word *after* the declared offset (offset + 4), not the offset itself.
    TypeTag,
    /// A base value (a literal source, or the field's current masked value)
    /// scaled by a runtime factor such as the per-device core count.
    Scaled,
    /// Branch destination: source address plus a fixed byte displacement.
    BranchTarget { target_offset: u64 },
    /// Bit-packed surface property of the source surface.
    Property { property: SurfaceProperty },
    /// Literal 32-bit constant.
    Const32 { value: u32 },
    /// Z-cull storage descriptor: patches base address and size plus
    /// mirrored copies of both for overflow detection.
    ZcullStorage {
        size_offset: u64,
        base_mirror_offset: u64,
        size_mirror_offset: u64,
    },
    /// 64-bit virtual address with architecture sign extension: bit
    /// `sign_bit` is replicated upward before combining.
    Addr64Signed {
        pair_offset: u64,
        swap: bool,
        sign_bit: u8,
    },
}

impl RelocKind {
    /// Whether this kind patches a (low, high) pair of words instead of one.
    pub fn is_wide(&self) -> bool {
        matches!(
            self,
            RelocKind::Addr40 { .. } | RelocKind::Size64 { .. } | RelocKind::Addr64Signed { .. }
        )
    }

    /// The secondary word offset for wide kinds.
    ///
    /// Word order within the pair: the primary offset receives the high word
    /// and the pair offset the low word, unless `swap` is set, in which case
    /// the primary offset receives the low word.
    pub fn pair_offset(&self) -> Option<u64> {
        match self {
            RelocKind::Addr40 { pair_offset, .. }
            | RelocKind::Size64 { pair_offset, .. }
            | RelocKind::Addr64Signed { pair_offset, .. } => Some(*pair_offset),
            _ => None,
        }
    }

    /// Whether the low word lands at the primary offset for wide kinds.
    pub fn pair_swapped(&self) -> bool {
        matches!(
            self,
            RelocKind::Addr40 { swap: true, .. }
                | RelocKind::Size64 { swap: true, .. }
                | RelocKind::Addr64Signed { swap: true, .. }
        )
    }
}

/// One deferred patch instruction, attached to exactly one owning module.
///
/// Immutable once built: the relocation pass reads these and writes module
/// bytes (directly or through the deferred batch), never the other way
/// around.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    /// Primary target word offset in the owning module.
    pub offset: u64,
    pub kind: RelocKind,
    pub source: RelocSource,
    /// Bits to overwrite. 32-bit kinds use the low 32 bits; wide kinds use
    /// the full 64 bits across the (low, high) pair.
    pub mask: u64,
    pub combine: Combine,
    /// Route the source address through this device instance's peer mapping
    /// instead of resolving it locally.
    pub peer: Option<usize>,
}

impl Reloc {
    /// A relocation with a full mask for its width, overwrite mode, and no
    /// peer routing.
    pub fn new(offset: u64, kind: RelocKind, source: RelocSource) -> Self {
        let mask = if kind.is_wide() {
            u64::MAX
        } else {
            u64::from(u32::MAX)
        };
        Self {
            offset,
            kind,
            source,
            mask,
            combine: Combine::Overwrite,
            peer: None,
        }
    }

    pub fn with_mask(mut self, mask: u64) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.combine = combine;
        self
    }

    pub fn with_peer(mut self, peer: usize) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Every word offset this relocation may write.
    pub fn written_offsets(&self) -> Vec<u64> {
        match &self.kind {
            RelocKind::TypeTag => vec![self.offset.saturating_add(4)],
            RelocKind::ZcullStorage {
                size_offset,
                base_mirror_offset,
                size_mirror_offset,
            } => vec![
                self.offset,
                *size_offset,
                *base_mirror_offset,
                *size_mirror_offset,
            ],
            kind => match kind.pair_offset() {
                Some(pair) => vec![self.offset, pair],
                None => vec![self.offset],
            },
        }
    }
}
