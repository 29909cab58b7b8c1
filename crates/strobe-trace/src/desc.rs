use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::module::{ContentKind, MemLocation, Protection, SurfaceDesc, TraceModule};
use crate::reloc::{Combine, Reloc, RelocKind, RelocSource};
use crate::table::{ModuleTable, TableError};

/// One module declaration as produced by the external trace parser.
#[derive(Clone, Debug)]
pub struct ModuleDecl {
    pub name: String,
    pub kind: ContentKind,
    /// Declared byte size. The recorded content may legitimately be shorter
    /// or longer; the declared size bounds relocation offsets.
    pub size: u64,
    pub protection: Protection,
    pub location: MemLocation,
    pub address_space: u32,
    /// Offset of this module within a larger backing allocation, when the
    /// allocator packs several modules into one region.
    pub base_offset: u64,
    pub surface: Option<SurfaceDesc>,
    /// Recorded bytes. Empty means "all zeroes of the declared size".
    pub content: Vec<u8>,
}

impl ModuleDecl {
    pub fn new(name: impl Into<String>, kind: ContentKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            protection: Protection::default(),
            location: MemLocation::default(),
            address_space: 0,
            base_offset: 0,
            surface: None,
            content: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    pub fn with_surface(mut self, surface: SurfaceDesc) -> Self {
        self.surface = Some(surface);
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
}

/// One relocation declaration: patch `target` at `offset` with a value
/// resolved from `source`.
#[derive(Clone, Debug)]
pub struct RelocDecl {
    pub target: String,
    pub offset: u64,
    pub kind: RelocKind,
    pub source: SourceDecl,
    pub mask: u64,
    pub combine: Combine,
    pub peer: Option<usize>,
}

impl RelocDecl {
    /// A declaration with a full mask for its width, overwrite mode, and no
    /// peer routing.
    pub fn new(target: impl Into<String>, offset: u64, kind: RelocKind, source: SourceDecl) -> Self {
        let mask = if kind.is_wide() {
            u64::MAX
        } else {
            u64::from(u32::MAX)
        };
        Self {
            target: target.into(),
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
}

/// Declaration-time value source, by name rather than by handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDecl {
    Named(String),
    Kind(ContentKind),
    Literal(u64),
    SelfModule,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DescError {
    #[error("duplicate module name '{0}'")]
    DuplicateModuleName(String),

    #[error("relocation {reloc} targets unknown module '{name}'")]
    UnknownTargetModule { reloc: usize, name: String },

    #[error("relocation {reloc} sources unknown module '{name}'")]
    UnknownSourceModule { reloc: usize, name: String },

    #[error("relocation {reloc} sources surface kind {kind:?}, but the trace has no module of that kind")]
    NoModuleOfKind { reloc: usize, kind: ContentKind },

    #[error(
        "relocation {reloc} writes offset 0x{offset:x} outside module '{module}' (size 0x{size:x})"
    )]
    OffsetOutOfRange {
        reloc: usize,
        module: String,
        offset: u64,
        size: u64,
    },

    #[error("relocation {reloc} has an empty bit mask")]
    ZeroMask { reloc: usize },

    #[error("relocation {reloc} patches a single word but its mask 0x{mask:x} exceeds 32 bits")]
    MaskTooWide { reloc: usize, mask: u64 },

    #[error(
        "relocations {first} and {second} both write offset 0x{offset:x} of shared stream '{module}'"
    )]
    DuplicateStreamWriter {
        module: String,
        offset: u64,
        first: usize,
        second: usize,
    },
}

impl From<TableError> for DescError {
    fn from(value: TableError) -> Self {
        match value {
            TableError::DuplicateName(name) => DescError::DuplicateModuleName(name),
        }
    }
}

/// The parsed trace description: module and relocation declaration lists.
///
/// This is the boundary object between the (out-of-scope) trace parser and
/// the playback pipeline. [`TraceDesc::validate`] cross-checks the whole
/// graph before any device memory is allocated; [`TraceDesc::build`] turns it
/// into a live [`ModuleTable`].
#[derive(Clone, Debug, Default)]
pub struct TraceDesc {
    pub modules: Vec<ModuleDecl>,
    pub relocs: Vec<RelocDecl>,
}

impl TraceDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_module(&mut self, decl: ModuleDecl) -> &mut Self {
        self.modules.push(decl);
        self
    }

    pub fn push_reloc(&mut self, decl: RelocDecl) -> &mut Self {
        self.relocs.push(decl);
        self
    }

    /// Cross-validate the declaration graph.
    ///
    /// Rejects: duplicate module names, relocations naming unknown targets or
    /// sources, target offsets outside the declared module size, empty or
    /// over-wide masks, and two relocations claiming the same word of a
    /// shared command stream (those go through the deferred-write map, where
    /// a second writer is a programming error, so catch it before replay).
    pub fn validate(&self) -> Result<(), DescError> {
        let mut sizes: HashMap<&str, u64> = HashMap::new();
        let mut kinds: HashSet<ContentKind> = HashSet::new();
        let mut stream_names: HashSet<&str> = HashSet::new();
        for decl in &self.modules {
            if sizes.insert(decl.name.as_str(), decl.size).is_some() {
                return Err(DescError::DuplicateModuleName(decl.name.clone()));
            }
            kinds.insert(decl.kind);
            if decl.kind.is_shared_stream() {
                stream_names.insert(decl.name.as_str());
            }
        }

        // (module, offset, peer) -> first declaring reloc index
        let mut stream_writers: HashMap<(&str, u64, Option<usize>), usize> = HashMap::new();

        for (index, decl) in self.relocs.iter().enumerate() {
            let Some(&target_size) = sizes.get(decl.target.as_str()) else {
                return Err(DescError::UnknownTargetModule {
                    reloc: index,
                    name: decl.target.clone(),
                });
            };

            match &decl.source {
                SourceDecl::Named(name) => {
                    if !sizes.contains_key(name.as_str()) {
                        return Err(DescError::UnknownSourceModule {
                            reloc: index,
                            name: name.clone(),
                        });
                    }
                }
                SourceDecl::Kind(kind) => {
                    if !kinds.contains(kind) {
                        return Err(DescError::NoModuleOfKind {
                            reloc: index,
                            kind: *kind,
                        });
                    }
                }
                SourceDecl::Literal(_) | SourceDecl::SelfModule => {}
            }

            if decl.mask == 0 {
                return Err(DescError::ZeroMask { reloc: index });
            }

            let reloc = decl.as_reloc(RelocSource::SelfModule);
            if !reloc.kind.is_wide() && decl.mask > u64::from(u32::MAX) {
                return Err(DescError::MaskTooWide {
                    reloc: index,
                    mask: decl.mask,
                });
            }

            for offset in reloc.written_offsets() {
                let end = offset.checked_add(4);
                if end.is_none() || end.unwrap() > target_size {
                    return Err(DescError::OffsetOutOfRange {
                        reloc: index,
                        module: decl.target.clone(),
                        offset,
                        size: target_size,
                    });
                }

                if stream_names.contains(decl.target.as_str()) {
                    let key = (decl.target.as_str(), offset, decl.peer);
                    if let Some(&first) = stream_writers.get(&key) {
                        return Err(DescError::DuplicateStreamWriter {
                            module: decl.target.clone(),
                            offset,
                            first,
                            second: index,
                        });
                    }
                    stream_writers.insert(key, index);
                }
            }
        }

        Ok(())
    }

    /// Validate, then build the live module table for `instances` device
    /// instances: create each module, populate its surface cache from the
    /// recorded content, and attach relocations to their owning modules in
    /// declaration order.
    pub fn build(&self, instances: usize) -> Result<ModuleTable, DescError> {
        self.validate()?;

        let mut table = ModuleTable::new();
        for decl in &self.modules {
            let mut module = TraceModule::new(&decl.name, decl.kind, decl.size, instances)
                .with_protection(decl.protection)
                .with_location(decl.location)
                .with_address_space(decl.address_space)
                .with_base_offset(decl.base_offset);
            if let Some(surface) = decl.surface {
                module = module.with_surface(surface);
            }
            let content = if decl.content.is_empty() {
                vec![0u8; decl.size as usize]
            } else {
                decl.content.clone()
            };
            module.cache_mut().fill(content);
            table.insert(module)?;
        }

        for decl in &self.relocs {
            let source = match &decl.source {
                // Presence was checked by validate(); by_name cannot miss.
                SourceDecl::Named(name) => RelocSource::Module(
                    table
                        .by_name(name)
                        .expect("validated source module present"),
                ),
                SourceDecl::Kind(kind) => RelocSource::Kind(*kind),
                SourceDecl::Literal(value) => RelocSource::Literal(*value),
                SourceDecl::SelfModule => RelocSource::SelfModule,
            };
            let target = table
                .by_name(&decl.target)
                .expect("validated target module present");
            let reloc = decl.as_reloc(source);
            table.get_mut(target).expect("live module").push_reloc(reloc);
        }

        Ok(table)
    }
}

impl RelocDecl {
    fn as_reloc(&self, source: RelocSource) -> Reloc {
        Reloc {
            offset: self.offset,
            kind: self.kind.clone(),
            source,
            mask: self.mask,
            combine: self.combine,
            peer: self.peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_with_two_modules() -> TraceDesc {
        let mut desc = TraceDesc::new();
        desc.push_module(ModuleDecl::new("pb", ContentKind::Pushbuffer, 64));
        desc.push_module(ModuleDecl::new("tex", ContentKind::Texture, 256));
        desc
    }

    #[test]
    fn validates_clean_graph() {
        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("pb", 16, RelocKind::Addr32, SourceDecl::Named("tex".into()))
                .with_mask(0xFFFF_FFFF),
        );
        desc.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_target_and_source() {
        let mut desc = desc_with_two_modules();
        desc.push_reloc(RelocDecl::new(
            "nope",
            0,
            RelocKind::Addr32,
            SourceDecl::Named("tex".into()),
        ));
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::UnknownTargetModule { reloc: 0, .. }
        ));

        let mut desc = desc_with_two_modules();
        desc.push_reloc(RelocDecl::new(
            "pb",
            0,
            RelocKind::Addr32,
            SourceDecl::Named("ghost".into()),
        ));
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::UnknownSourceModule { reloc: 0, .. }
        ));

        let mut desc = desc_with_two_modules();
        desc.push_reloc(RelocDecl::new(
            "pb",
            0,
            RelocKind::Addr32,
            SourceDecl::Kind(ContentKind::Semaphore),
        ));
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::NoModuleOfKind { reloc: 0, .. }
        ));
    }

    #[test]
    fn rejects_out_of_range_offsets_including_wide_halves() {
        let mut desc = desc_with_two_modules();
        desc.push_reloc(RelocDecl::new(
            "pb",
            64,
            RelocKind::Addr32,
            SourceDecl::Named("tex".into()),
        ));
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::OffsetOutOfRange { offset: 64, .. }
        ));

        // Primary offset fits, high word does not.
        let mut desc = desc_with_two_modules();
        desc.push_reloc(RelocDecl::new(
            "pb",
            0,
            RelocKind::Addr64Signed {
                pair_offset: 62,
                swap: false,
                sign_bit: 47,
            },
            SourceDecl::Named("tex".into()),
        ));
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::OffsetOutOfRange { offset: 62, .. }
        ));

        // The type-tag quirk writes offset + 4; declaring it at the last
        // word must be rejected.
        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("pb", 60, RelocKind::TypeTag, SourceDecl::Named("tex".into()))
                .with_mask(0xFF),
        );
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::OffsetOutOfRange { offset: 64, .. }
        ));
    }

    #[test]
    fn rejects_bad_masks() {
        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("pb", 0, RelocKind::Addr32, SourceDecl::Named("tex".into()))
                .with_mask(0),
        );
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::ZeroMask { reloc: 0 }
        ));

        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("pb", 0, RelocKind::Addr32, SourceDecl::Named("tex".into()))
                .with_mask(0x1_0000_0000),
        );
        assert!(matches!(
            desc.validate().unwrap_err(),
            DescError::MaskTooWide { reloc: 0, .. }
        ));
    }

    #[test]
    fn rejects_two_writers_on_one_stream_word() {
        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("pb", 16, RelocKind::Addr32, SourceDecl::Named("tex".into()))
                .with_mask(0xFFFF),
        );
        desc.push_reloc(
            RelocDecl::new("pb", 16, RelocKind::Size32, SourceDecl::Named("tex".into()))
                .with_mask(0xFFFF_0000),
        );
        assert_eq!(
            desc.validate().unwrap_err(),
            DescError::DuplicateStreamWriter {
                module: "pb".to_string(),
                offset: 16,
                first: 0,
                second: 1,
            }
        );

        // Same offset on a non-stream module is fine (immediate writes).
        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("tex", 16, RelocKind::Addr32, SourceDecl::Named("pb".into()))
                .with_mask(0xFFFF),
        );
        desc.push_reloc(
            RelocDecl::new("tex", 16, RelocKind::Size32, SourceDecl::Named("pb".into()))
                .with_mask(0xFFFF_0000),
        );
        desc.validate().unwrap();

        // Distinct peer routes on a stream word are distinct writers.
        let mut desc = desc_with_two_modules();
        desc.push_reloc(
            RelocDecl::new("pb", 16, RelocKind::Addr32, SourceDecl::Named("tex".into()))
                .with_peer(0),
        );
        desc.push_reloc(
            RelocDecl::new("pb", 16, RelocKind::Addr32, SourceDecl::Named("tex".into()))
                .with_peer(1),
        );
        desc.validate().unwrap();
    }

    #[test]
    fn build_populates_and_attaches() {
        let mut desc = TraceDesc::new();
        desc.push_module(
            ModuleDecl::new("pb", ContentKind::Pushbuffer, 8).with_content(vec![1, 2, 3, 4]),
        );
        desc.push_module(ModuleDecl::new("sem", ContentKind::Semaphore, 16));
        desc.push_reloc(RelocDecl::new(
            "pb",
            0,
            RelocKind::Addr32,
            SourceDecl::Kind(ContentKind::Semaphore),
        ));

        let table = desc.build(2).unwrap();
        let pb = table.by_name("pb").unwrap();
        let module = table.get(pb).unwrap();
        assert_eq!(module.relocs().len(), 1);
        assert_eq!(
            module.relocs()[0].source,
            RelocSource::Kind(ContentKind::Semaphore)
        );
        // Recorded content went in as-is; its length may differ from the
        // declared size.
        assert_eq!(module.cache().len(0), Some(4));

        // Undeclared content defaults to zeroes of the declared size, shared
        // across instances.
        let sem = table.by_name("sem").unwrap();
        let sem_module = table.get(sem).unwrap();
        assert_eq!(sem_module.cache().len(1), Some(16));
        assert!(sem_module.cache().shares_storage(0, 1));
    }
}
