use std::collections::HashSet;

use bitflags::bitflags;
use strobe_mem::SurfaceCache;
use thiserror::Error;

use crate::reloc::Reloc;

/// What a module's bytes contain. Drives two behavioral splits: pushbuffer
/// modules are the shared command-stream buffers subject to deferred
/// multi-device patching, and texture modules may carry a [`SurfaceDesc`]
/// consulted by surface-property relocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Pushbuffer,
    Texture,
    VertexBuffer,
    IndexBuffer,
    Shader,
    Semaphore,
    Notifier,
    Data,
}

impl ContentKind {
    /// Shared command-stream buffers get the consolidated deferred-write
    /// treatment when more than one device instance is in play.
    pub fn is_shared_stream(self) -> bool {
        matches!(self, ContentKind::Pushbuffer)
    }
}

bitflags! {
    /// Device-side access protection for a module's allocation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Default for Protection {
    fn default() -> Self {
        Protection::READ | Protection::WRITE
    }
}

/// Which memory pool backs a module on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemLocation {
    #[default]
    Framebuffer,
    HostCoherent,
    HostNonCoherent,
}

/// Block-linear tiling parameters for a texture surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockLinear {
    pub block_width_log2: u8,
    pub block_height_log2: u8,
    pub block_depth_log2: u8,
}

/// Recorded surface metadata for texture-kind modules.
///
/// Surface-property relocations read their values from here; a relocation
/// that needs this on a module that has none is a data-consistency error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub block_linear: Option<BlockLinear>,
    pub aa_samples: u32,
}

/// One device instance's backing allocation for a module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Allocation {
    pub virt_addr: u64,
    pub size: u64,
    /// `peer_addrs[r]` is the address device instance `r` uses to reach this
    /// instance's copy over the peer interconnect. Empty when no peer
    /// mappings exist.
    pub peer_addrs: Vec<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module '{name}' is already allocated")]
    AlreadyAllocated { name: String },

    #[error("module '{name}' is not allocated")]
    NotAllocated { name: String },

    #[error("module '{name}' has no allocation for device instance {instance}")]
    NoSuchInstance { name: String, instance: usize },
}

/// One named sub-buffer of a recorded trace.
///
/// Owns the copy-on-write [`SurfaceCache`] holding its bytes, its
/// per-instance allocation state once assigned, the set of frozen offsets
/// that must never be patched, and the ordered relocations targeting it.
#[derive(Clone, Debug)]
pub struct TraceModule {
    name: String,
    kind: ContentKind,
    trace_size: u64,
    protection: Protection,
    location: MemLocation,
    /// Logical VA space this module lives in. Relocations may only patch in
    /// addresses from the same space.
    address_space: u32,
    /// Offset of this module within a larger backing allocation, when the
    /// allocator packs several modules into one region.
    base_offset: u64,
    surface: Option<SurfaceDesc>,
    cache: SurfaceCache,
    allocations: Option<Vec<Allocation>>,
    frozen: HashSet<u64>,
    relocs: Vec<Reloc>,
}

impl TraceModule {
    pub fn new(name: impl Into<String>, kind: ContentKind, size: u64, instances: usize) -> Self {
        let name = name.into();
        Self {
            cache: SurfaceCache::new(instances, size),
            name,
            kind,
            trace_size: size,
            protection: Protection::default(),
            location: MemLocation::default(),
            address_space: 0,
            base_offset: 0,
            surface: None,
            allocations: None,
            frozen: HashSet::new(),
            relocs: Vec::new(),
        }
    }

    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    pub fn with_location(mut self, location: MemLocation) -> Self {
        self.location = location;
        self
    }

    pub fn with_address_space(mut self, address_space: u32) -> Self {
        self.address_space = address_space;
        self
    }

    pub fn with_base_offset(mut self, base_offset: u64) -> Self {
        self.base_offset = base_offset;
        self
    }

    pub fn with_surface(mut self, surface: SurfaceDesc) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// The size the trace declared for this module.
    pub fn size(&self) -> u64 {
        self.trace_size
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn location(&self) -> MemLocation {
        self.location
    }

    pub fn address_space(&self) -> u32 {
        self.address_space
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn surface(&self) -> Option<&SurfaceDesc> {
        self.surface.as_ref()
    }

    pub fn cache(&self) -> &SurfaceCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut SurfaceCache {
        &mut self.cache
    }

    /// Assign one backing allocation per device instance.
    ///
    /// Size is immutable from here on. Calling this again without a release
    /// in between is an argument error, not a silent re-allocation.
    pub fn allocate(&mut self, allocations: Vec<Allocation>) -> Result<(), ModuleError> {
        if self.allocations.is_some() {
            return Err(ModuleError::AlreadyAllocated {
                name: self.name.clone(),
            });
        }
        self.allocations = Some(allocations);
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.allocations.is_some()
    }

    /// This module's allocation on `instance`.
    pub fn alloc(&self, instance: usize) -> Result<&Allocation, ModuleError> {
        let allocations = self
            .allocations
            .as_ref()
            .ok_or_else(|| ModuleError::NotAllocated {
                name: self.name.clone(),
            })?;
        allocations
            .get(instance)
            .ok_or_else(|| ModuleError::NoSuchInstance {
                name: self.name.clone(),
                instance,
            })
    }

    /// Drop allocation state, keeping content. The caller is responsible for
    /// freeing device memory through its allocator.
    pub fn release_allocations(&mut self) {
        self.allocations = None;
    }

    /// Exclude a word offset from all future relocation. Patches that land on
    /// a frozen offset succeed without writing.
    pub fn freeze(&mut self, offset: u64) {
        self.frozen.insert(offset);
    }

    pub fn is_frozen(&self, offset: u64) -> bool {
        self.frozen.contains(&offset)
    }

    pub fn push_reloc(&mut self, reloc: Reloc) {
        self.relocs.push(reloc);
    }

    /// Relocations targeting this module, in declaration order.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Drop every relocation whose value source references `ids`.
    ///
    /// Used when a source module is torn down: the remaining modules must not
    /// keep patch instructions that would read a dead module's state.
    pub fn retain_relocs_not_sourcing(&mut self, ids: &[crate::ModuleId]) {
        self.relocs
            .retain(|r| !ids.iter().any(|id| r.source.references(*id)));
    }
}
