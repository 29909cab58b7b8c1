use strobe_mem::SurfaceError;
use strobe_reloc::RelocError;
use strobe_trace::{DescError, ModuleError};
use thiserror::Error;

use crate::channel::ChannelError;
use crate::device::AllocError;
use crate::op::OpId;

pub type ReplayResult<T> = Result<T, ReplayError>;

/// Structural errors of the playback pipeline.
///
/// All of these stop the sequence: a trace that references ranges outside its
/// modules, depends on operations that do not exist, or fails relocation is
/// broken, and pressing on would submit garbage to the device. Wait timeouts
/// are deliberately *not* represented here; they are reported per operation
/// in the run report so independent operations keep running.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error(
        "operation {op} references byte range 0x{offset:x}+0x{len:x} outside module '{module}'"
    )]
    RangeOutsideModule {
        op: OpId,
        module: String,
        offset: u64,
        len: u64,
    },

    #[error("operation {op} references a released module")]
    DeadModule { op: OpId },

    #[error("operation {op} depends on unknown operation {dep}")]
    UnknownDependency { op: OpId, dep: OpId },

    #[error("operation {op} depends on operation {dep}, which is sequenced after it")]
    ForwardDependency { op: OpId, dep: OpId },

    #[error("operation {op}: module '{module}' has no relocation at index {index}")]
    NoSuchReloc {
        op: OpId,
        module: String,
        index: usize,
    },

    #[error(transparent)]
    Desc(#[from] DescError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Reloc(#[from] RelocError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Surface(#[from] SurfaceError),
}
