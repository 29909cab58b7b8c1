//! Trace data model: modules, the module table, and trace descriptions.
//!
//! A recorded trace is a set of named sub-buffers ("modules"): pushbuffer
//! segments, textures, semaphores, and the like, plus relocation instructions
//! that rewrite
//! module bytes once real device addresses are known. This crate holds the
//! in-memory object graph the external trace parser produces and the playback
//! pipeline consumes:
//!
//! - [`TraceModule`] / [`ModuleTable`]: one module per named sub-buffer,
//!   addressed by arena-style [`ModuleId`] handles so cross-module references
//!   cannot dangle across teardown.
//! - [`Reloc`] and friends: the declarative patch instructions each module
//!   carries. The patch *engine* lives in `strobe-reloc`; this crate only
//!   models the data.
//! - [`TraceDesc`]: the parsed declaration lists plus a cross-validation pass
//!   that rejects structurally broken traces before any memory is allocated.

mod desc;
mod module;
mod reloc;
mod table;

pub use desc::{DescError, ModuleDecl, RelocDecl, SourceDecl, TraceDesc};
pub use module::{
    Allocation, BlockLinear, ContentKind, MemLocation, ModuleError, Protection, SurfaceDesc,
    TraceModule,
};
pub use reloc::{Combine, Reloc, RelocKind, RelocSource, SurfaceProperty};
pub use table::{ModuleId, ModuleTable, TableError};
