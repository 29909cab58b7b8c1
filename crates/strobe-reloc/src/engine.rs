use strobe_mem::SurfaceError;
use strobe_trace::{
    Combine, ContentKind, ModuleError, ModuleId, ModuleTable, Reloc, RelocKind, RelocSource,
    SurfaceProperty,
};
use tracing::debug;

use crate::batch::RelocBatch;

pub type RelocResult<T> = Result<T, RelocError>;

/// Data-consistency and argument errors of the relocation pass.
///
/// Every variant is terminal for the pass: the orchestrator aborts the trace
/// load rather than replaying a partially patched command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocError {
    SourceReleased { module: usize },

    DeadSource { owner: String, offset: u64 },

    NoModuleOfKind {
        owner: String,
        offset: u64,
        kind: ContentKind,
    },

    NeedsSurfaceSource { owner: String, offset: u64 },

    AddressSpaceMismatch {
        owner: String,
        source: String,
        owner_space: u32,
        source_space: u32,
    },

    MissingSurfaceDesc { source: String },

    NoPeerMapping {
        source: String,
        instance: usize,
        peer: usize,
    },

    DuplicateDeferredWrite {
        module: usize,
        offset: u64,
        instance: usize,
    },

    Module(ModuleError),

    Surface(SurfaceError),
}

// NOTE: `Display`/`Error` are implemented by hand rather than via
// `#[derive(thiserror::Error)]` only because two variants carry a field named
// `source` that holds a *module name string*, not an error. thiserror
// unconditionally treats a field named `source` as the error source, which does
// not type-check for `String`. The messages and `source()` behaviour below are
// exactly what the equivalent `#[error(...)]`/`#[error(transparent)]`
// attributes would have produced.
impl std::fmt::Display for RelocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelocError::SourceReleased { module } => {
                write!(f, "module id {module} was released mid-pass")
            }
            RelocError::DeadSource { owner, offset } => write!(
                f,
                "relocation at 0x{offset:x} of '{owner}' references a released source module"
            ),
            RelocError::NoModuleOfKind {
                owner,
                offset,
                kind,
            } => write!(
                f,
                "relocation at 0x{offset:x} of '{owner}' needs a module of kind {kind:?}, but the trace has none"
            ),
            RelocError::NeedsSurfaceSource { owner, offset } => write!(
                f,
                "relocation at 0x{offset:x} of '{owner}' needs a surface source but was declared with a literal"
            ),
            RelocError::AddressSpaceMismatch {
                owner,
                source,
                owner_space,
                source_space,
            } => write!(
                f,
                "address space mismatch: '{owner}' lives in space {owner_space}, source '{source}' in space {source_space}"
            ),
            RelocError::MissingSurfaceDesc { source } => write!(
                f,
                "surface-property relocation reads '{source}', which carries no surface metadata"
            ),
            RelocError::NoPeerMapping {
                source,
                instance,
                peer,
            } => write!(
                f,
                "'{source}' has no peer mapping from device instance {instance} to peer {peer}"
            ),
            RelocError::DuplicateDeferredWrite {
                module,
                offset,
                instance,
            } => write!(
                f,
                "duplicate deferred write to module {module} offset 0x{offset:x} instance {instance}"
            ),
            RelocError::Module(e) => std::fmt::Display::fmt(e, f),
            RelocError::Surface(e) => std::fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for RelocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // The transparent variants forward to the inner error's own source,
        // matching `#[error(transparent)]`.
        match self {
            RelocError::Module(e) => e.source(),
            RelocError::Surface(e) => e.source(),
            _ => None,
        }
    }
}

impl From<ModuleError> for RelocError {
    fn from(e: ModuleError) -> Self {
        RelocError::Module(e)
    }
}

impl From<SurfaceError> for RelocError {
    fn from(e: SurfaceError) -> Self {
        RelocError::Surface(e)
    }
}

/// Synchronous property queries answered by the device's resource manager.
///
/// The relocation engine only ever asks; allocation and hardware access stay
/// behind this seam.
pub trait ResourceQuery {
    /// Context DMA handle of a surface on one device instance.
    fn ctx_dma_handle(&self, module: ModuleId, instance: usize) -> u32;
    /// Logical active-region index a surface was placed in.
    fn active_region(&self, module: ModuleId, instance: usize) -> u32;
    /// Device type enumerant for a surface.
    fn surface_type(&self, module: ModuleId) -> u32;
    /// Device format enumerant for a surface.
    fn format_enum(&self, module: ModuleId, instance: usize) -> u32;
    /// Physical address of a surface's allocation.
    fn phys_addr(&self, module: ModuleId, instance: usize) -> u64;
    /// Runtime scale factor (e.g. enabled core count) for one instance.
    fn scale_factor(&self, instance: usize) -> u64;
}

/// Canned [`ResourceQuery`] answers, for tests and self-contained replays.
#[derive(Clone, Debug)]
pub struct FixedQuery {
    pub ctx_dma_handle: u32,
    pub active_region: u32,
    pub surface_type: u32,
    pub format_enum: u32,
    pub phys_addr: u64,
    pub scale_factor: u64,
}

impl Default for FixedQuery {
    fn default() -> Self {
        Self {
            ctx_dma_handle: 0,
            active_region: 0,
            surface_type: 0,
            format_enum: 0,
            phys_addr: 0,
            scale_factor: 1,
        }
    }
}

impl ResourceQuery for FixedQuery {
    fn ctx_dma_handle(&self, _module: ModuleId, _instance: usize) -> u32 {
        self.ctx_dma_handle
    }

    fn active_region(&self, _module: ModuleId, _instance: usize) -> u32 {
        self.active_region
    }

    fn surface_type(&self, _module: ModuleId) -> u32 {
        self.surface_type
    }

    fn format_enum(&self, _module: ModuleId, _instance: usize) -> u32 {
        self.format_enum
    }

    fn phys_addr(&self, _module: ModuleId, _instance: usize) -> u64 {
        self.phys_addr
    }

    fn scale_factor(&self, _instance: usize) -> u64 {
        self.scale_factor
    }
}

/// What happened to one relocation application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied in place.
    Written,
    /// Routed through the deferred-write batch (shared stream, multiple
    /// instances).
    Deferred,
    /// The target offset is frozen; nothing was written.
    SkippedFrozen,
}

/// Counters for one full relocation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelocPassReport {
    /// Relocation applications (reloc × instance) that wrote in place.
    pub written: usize,
    /// Applications routed through the deferred batch.
    pub deferred: usize,
    /// Applications skipped because their offset is frozen.
    pub skipped_frozen: usize,
    /// Words applied by the consolidated batch commit.
    pub words_committed: usize,
}

/// Run every relocation of every live module for `instances` device
/// instances, then commit the deferred batch.
///
/// Modules are walked in table (trace declaration) order and each module's
/// relocations in their declaration order, so the pass is deterministic. The
/// first error aborts the pass with the batch uncommitted; there is no
/// partial application.
pub fn relocate_all(
    table: &mut ModuleTable,
    query: &dyn ResourceQuery,
    instances: usize,
) -> RelocResult<RelocPassReport> {
    let mut batch = RelocBatch::new();
    let mut report = RelocPassReport::default();

    let ids: Vec<ModuleId> = table.ids().collect();
    debug!(modules = ids.len(), instances, "relocation pass start");

    for id in ids {
        let relocs = match table.get(id) {
            Some(module) => module.relocs().to_vec(),
            None => continue,
        };
        for reloc in &relocs {
            for instance in 0..instances {
                match patch(table, id, reloc, instance, &mut batch, query)? {
                    WriteOutcome::Written => report.written += 1,
                    WriteOutcome::Deferred => report.deferred += 1,
                    WriteOutcome::SkippedFrozen => report.skipped_frozen += 1,
                }
            }
        }
    }

    report.words_committed = batch.commit(table)?;
    debug!(?report, "relocation pass done");
    Ok(report)
}

/// Apply one relocation for one device instance.
///
/// The shared skeleton: check the frozen set, read the raw bits, resolve the
/// kind-specific new value, mask-combine, then write in place (or record
/// into `batch` when the owning module is a shared command stream replayed on
/// more than one instance).
pub fn patch(
    table: &mut ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
    batch: &mut RelocBatch,
    query: &dyn ResourceQuery,
) -> RelocResult<WriteOutcome> {
    let owner_mod = table
        .get(owner)
        .ok_or(RelocError::SourceReleased { module: owner.index() })?;
    if owner_mod.is_frozen(reloc.offset) {
        return Ok(WriteOutcome::SkippedFrozen);
    }
    let deferred =
        owner_mod.kind().is_shared_stream() && owner_mod.cache().instance_count() > 1;

    match &reloc.kind {
        RelocKind::Addr40 { .. } | RelocKind::Size64 { .. } | RelocKind::Addr64Signed { .. } => {
            patch_wide(table, owner, reloc, instance, batch, deferred)
        }
        RelocKind::ZcullStorage { .. } => {
            patch_zcull(table, owner, reloc, instance, batch, deferred)
        }
        _ => patch_narrow(table, owner, reloc, instance, batch, query, deferred),
    }
}

fn patch_narrow(
    table: &mut ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
    batch: &mut RelocBatch,
    query: &dyn ResourceQuery,
    deferred: bool,
) -> RelocResult<WriteOutcome> {
    // The type-tag kind patches the word after its declared offset. This is
    // a preserved compatibility quirk; no other kind may adopt it.
    let write_offset = match reloc.kind {
        RelocKind::TypeTag => reloc.offset.saturating_add(4),
        _ => reloc.offset,
    };

    let old = table
        .get(owner)
        .ok_or(RelocError::SourceReleased { module: owner.index() })?
        .cache()
        .read_u32_le(instance, write_offset)?;

    let new = resolve_narrow(table, owner, reloc, instance, old, query)?;
    let combined = combine32(old, new as u32, reloc.mask as u32, reloc.combine);
    write_word(table, batch, owner, instance, write_offset, combined, deferred)
}

fn patch_wide(
    table: &mut ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
    batch: &mut RelocBatch,
    deferred: bool,
) -> RelocResult<WriteOutcome> {
    let pair = reloc
        .kind
        .pair_offset()
        .expect("wide kind carries a pair offset");
    let (lo_offset, hi_offset) = if reloc.kind.pair_swapped() {
        (reloc.offset, pair)
    } else {
        (pair, reloc.offset)
    };

    let cache = table
        .get(owner)
        .ok_or(RelocError::SourceReleased { module: owner.index() })?
        .cache();
    let lo = cache.read_u32_le(instance, lo_offset)?;
    let hi = cache.read_u32_le(instance, hi_offset)?;
    let old = u64::from(hi) << 32 | u64::from(lo);

    let new = match &reloc.kind {
        RelocKind::Addr40 { .. } => {
            source_addr(table, owner, reloc, instance)? & 0xFF_FFFF_FFFF
        }
        RelocKind::Size64 { .. } => {
            let src = source_module(table, owner, reloc)?;
            module(table, src)?.alloc(instance)?.size
        }
        RelocKind::Addr64Signed { sign_bit, .. } => {
            sign_extend(source_addr(table, owner, reloc, instance)?, *sign_bit)
        }
        _ => unreachable!("patch_wide only sees wide kinds"),
    };

    let combined = combine64(old, new, reloc.mask, reloc.combine);
    let lo_out = write_word(
        table,
        batch,
        owner,
        instance,
        lo_offset,
        combined as u32,
        deferred,
    )?;
    let hi_out = write_word(
        table,
        batch,
        owner,
        instance,
        hi_offset,
        (combined >> 32) as u32,
        deferred,
    )?;
    Ok(merge_outcomes(lo_out, hi_out))
}

fn patch_zcull(
    table: &mut ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
    batch: &mut RelocBatch,
    deferred: bool,
) -> RelocResult<WriteOutcome> {
    let RelocKind::ZcullStorage {
        size_offset,
        base_mirror_offset,
        size_mirror_offset,
    } = reloc.kind
    else {
        unreachable!("patch_zcull only sees the z-cull kind");
    };

    let base = source_addr(table, owner, reloc, instance)?;
    let src = source_module(table, owner, reloc)?;
    let size = module(table, src)?.alloc(instance)?.size;

    // Base/size plus mirrored copies; the consumer compares the pairs to
    // detect storage overflow.
    let fields = [
        (reloc.offset, base as u32),
        (size_offset, size as u32),
        (base_mirror_offset, base as u32),
        (size_mirror_offset, size as u32),
    ];

    let mask = reloc.mask as u32;
    let mut outcome = WriteOutcome::SkippedFrozen;
    for (offset, new) in fields {
        let old = module(table, owner)?.cache().read_u32_le(instance, offset)?;
        let combined = combine32(old, new, mask, reloc.combine);
        let word = write_word(table, batch, owner, instance, offset, combined, deferred)?;
        outcome = merge_outcomes(outcome, word);
    }
    Ok(outcome)
}

fn resolve_narrow(
    table: &ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
    old: u32,
    query: &dyn ResourceQuery,
) -> RelocResult<u64> {
    match &reloc.kind {
        RelocKind::CtxDmaHandle => {
            let src = source_module(table, owner, reloc)?;
            Ok(u64::from(query.ctx_dma_handle(src, instance)))
        }
        RelocKind::Addr32 => source_addr(table, owner, reloc, instance),
        RelocKind::Size32 => {
            let src = source_module(table, owner, reloc)?;
            Ok(module(table, src)?.alloc(instance)?.size)
        }
        RelocKind::ActiveRegion => {
            let src = source_module(table, owner, reloc)?;
            Ok(u64::from(query.active_region(src, instance)))
        }
        RelocKind::TypeTag => {
            let src = source_module(table, owner, reloc)?;
            Ok(u64::from(query.surface_type(src)))
        }
        RelocKind::Scaled => {
            let base = match reloc.source {
                RelocSource::Literal(value) => value,
                _ => u64::from(old) & reloc.mask,
            };
            Ok(base.wrapping_mul(query.scale_factor(instance)))
        }
        RelocKind::BranchTarget { target_offset } => {
            Ok(source_addr(table, owner, reloc, instance)?.wrapping_add(*target_offset))
        }
        RelocKind::Property { property } => {
            resolve_property(table, owner, reloc, instance, *property, query)
        }
        RelocKind::Const32 { value } => Ok(u64::from(*value)),
        RelocKind::Addr40 { .. }
        | RelocKind::Size64 { .. }
        | RelocKind::Addr64Signed { .. }
        | RelocKind::ZcullStorage { .. } => {
            unreachable!("wide and z-cull kinds are resolved by their own paths")
        }
    }
}

fn resolve_property(
    table: &ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
    property: SurfaceProperty,
    query: &dyn ResourceQuery,
) -> RelocResult<u64> {
    let src = source_module(table, owner, reloc)?;
    match property {
        SurfaceProperty::Format => return Ok(u64::from(query.format_enum(src, instance))),
        SurfaceProperty::PhysAddr => return Ok(query.phys_addr(src, instance)),
        _ => {}
    }

    let src_mod = module(table, src)?;
    let surface = src_mod
        .surface()
        .ok_or_else(|| RelocError::MissingSurfaceDesc {
            source: src_mod.name().to_string(),
        })?;
    Ok(match property {
        SurfaceProperty::Width => u64::from(surface.width),
        SurfaceProperty::Height => u64::from(surface.height),
        SurfaceProperty::Pitch => u64::from(surface.pitch),
        SurfaceProperty::AaSamples => u64::from(surface.aa_samples),
        SurfaceProperty::BlockLinear => match surface.block_linear {
            // Three nibbles: depth | height | width, each a log2 block size.
            Some(bl) => {
                u64::from(bl.block_depth_log2) << 8
                    | u64::from(bl.block_height_log2) << 4
                    | u64::from(bl.block_width_log2)
            }
            None => 0,
        },
        SurfaceProperty::Format | SurfaceProperty::PhysAddr => unreachable!(),
    })
}

/// Resolve which module supplies the relocation's value.
fn source_module(table: &ModuleTable, owner: ModuleId, reloc: &Reloc) -> RelocResult<ModuleId> {
    match &reloc.source {
        RelocSource::Module(id) => {
            if table.get(*id).is_some() {
                Ok(*id)
            } else {
                Err(RelocError::DeadSource {
                    owner: owner_name(table, owner),
                    offset: reloc.offset,
                })
            }
        }
        RelocSource::Kind(kind) => {
            table
                .first_of_kind(*kind)
                .ok_or_else(|| RelocError::NoModuleOfKind {
                    owner: owner_name(table, owner),
                    offset: reloc.offset,
                    kind: *kind,
                })
        }
        RelocSource::SelfModule => Ok(owner),
        RelocSource::Literal(_) => Err(RelocError::NeedsSurfaceSource {
            owner: owner_name(table, owner),
            offset: reloc.offset,
        }),
    }
}

/// Resolve the device address of the relocation's source surface as seen by
/// `instance`, optionally routed through a peer mapping.
///
/// Rejects a source living in a different logical address space than the
/// owning module: the patched stream would dereference a foreign VA.
fn source_addr(
    table: &ModuleTable,
    owner: ModuleId,
    reloc: &Reloc,
    instance: usize,
) -> RelocResult<u64> {
    let src = source_module(table, owner, reloc)?;
    let owner_mod = module(table, owner)?;
    let src_mod = module(table, src)?;

    if src_mod.address_space() != owner_mod.address_space() {
        return Err(RelocError::AddressSpaceMismatch {
            owner: owner_mod.name().to_string(),
            source: src_mod.name().to_string(),
            owner_space: owner_mod.address_space(),
            source_space: src_mod.address_space(),
        });
    }

    let base = match reloc.peer {
        // Peer routing: the address `instance` uses to reach the copy
        // resident on device `peer`.
        Some(peer) => {
            let alloc = src_mod.alloc(peer)?;
            *alloc
                .peer_addrs
                .get(instance)
                .ok_or_else(|| RelocError::NoPeerMapping {
                    source: src_mod.name().to_string(),
                    instance,
                    peer,
                })?
        }
        None => src_mod.alloc(instance)?.virt_addr,
    };
    Ok(base.wrapping_add(src_mod.base_offset()))
}

fn write_word(
    table: &mut ModuleTable,
    batch: &mut RelocBatch,
    owner: ModuleId,
    instance: usize,
    offset: u64,
    value: u32,
    deferred: bool,
) -> RelocResult<WriteOutcome> {
    let module = table
        .get_mut(owner)
        .ok_or(RelocError::SourceReleased { module: owner.index() })?;
    if module.is_frozen(offset) {
        return Ok(WriteOutcome::SkippedFrozen);
    }
    if deferred {
        batch.record(owner, offset, instance, value)?;
        Ok(WriteOutcome::Deferred)
    } else {
        module.cache_mut().write_u32_le(instance, offset, value)?;
        Ok(WriteOutcome::Written)
    }
}

fn merge_outcomes(a: WriteOutcome, b: WriteOutcome) -> WriteOutcome {
    match (a, b) {
        (WriteOutcome::Written, _) | (_, WriteOutcome::Written) => WriteOutcome::Written,
        (WriteOutcome::Deferred, _) | (_, WriteOutcome::Deferred) => WriteOutcome::Deferred,
        _ => WriteOutcome::SkippedFrozen,
    }
}

fn module(table: &ModuleTable, id: ModuleId) -> RelocResult<&strobe_trace::TraceModule> {
    table
        .get(id)
        .ok_or(RelocError::SourceReleased { module: id.index() })
}

fn owner_name(table: &ModuleTable, id: ModuleId) -> String {
    table
        .get(id)
        .map(|m| m.name().to_string())
        .unwrap_or_else(|| format!("#{}", id.index()))
}

fn combine32(old: u32, new: u32, mask: u32, combine: Combine) -> u32 {
    match combine {
        Combine::Overwrite => (old & !mask) | (new & mask),
        Combine::Add => (old & !mask) | ((old & mask).wrapping_add(new & mask) & mask),
    }
}

fn combine64(old: u64, new: u64, mask: u64, combine: Combine) -> u64 {
    match combine {
        Combine::Overwrite => (old & !mask) | (new & mask),
        Combine::Add => (old & !mask) | ((old & mask).wrapping_add(new & mask) & mask),
    }
}

/// Replicate `sign_bit` upward through bit 63.
fn sign_extend(value: u64, sign_bit: u8) -> u64 {
    debug_assert!(sign_bit < 64);
    let shift = 63 - u32::from(sign_bit);
    (((value << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine32_overwrite_and_add() {
        assert_eq!(
            combine32(0xDEAD_0000, 0x0000_1000, 0xFFFF_FFFF, Combine::Overwrite),
            0x0000_1000
        );
        assert_eq!(
            combine32(0xAABB_CCDD, 0x1111_1111, 0x0000_FFFF, Combine::Overwrite),
            0xAABB_1111
        );
        assert_eq!(
            combine32(0xAABB_0004, 0x0000_0008, 0x0000_00FF, Combine::Add),
            0xAABB_000C
        );
        // Add wraps within the mask and never disturbs bits outside it.
        assert_eq!(
            combine32(0xAABB_00FF, 0x0000_0001, 0x0000_00FF, Combine::Add),
            0xAABB_0000
        );
    }

    #[test]
    fn sign_extend_replicates_the_chosen_bit() {
        assert_eq!(sign_extend(0x0000_8000_0000_0000, 47), 0xFFFF_8000_0000_0000);
        assert_eq!(sign_extend(0x0000_7FFF_FFFF_FFFF, 47), 0x0000_7FFF_FFFF_FFFF);
        assert_eq!(sign_extend(0x0001_0000_0000_0000, 48), 0xFFFF_0000_0000_0000);
        assert_eq!(sign_extend(0x0000_0000_1234_5678, 47), 0x0000_0000_1234_5678);
        // A set bit below the sign bit does not leak upward.
        assert_eq!(sign_extend(0x0000_4000_0000_0000, 47), 0x0000_4000_0000_0000);
    }

    #[test]
    fn merge_prefers_writes_over_skips() {
        use WriteOutcome::*;
        assert_eq!(merge_outcomes(SkippedFrozen, Written), Written);
        assert_eq!(merge_outcomes(Deferred, SkippedFrozen), Deferred);
        assert_eq!(merge_outcomes(SkippedFrozen, SkippedFrozen), SkippedFrozen);
    }
}
