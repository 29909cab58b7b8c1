use strobe_trace::{Allocation, MemLocation, Protection};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("device allocation of 0x{size:x} bytes for '{name}' failed")]
    OutOfMemory { name: String, size: u64 },

    #[error(
        "allocator returned {returned} allocations for '{name}', expected one per device instance ({expected})"
    )]
    WrongInstanceCount {
        name: String,
        returned: usize,
        expected: usize,
    },
}

/// What the orchestrator asks the external allocator for, per module.
#[derive(Clone, Debug)]
pub struct AllocRequest<'a> {
    pub name: &'a str,
    pub size: u64,
    pub protection: Protection,
    pub location: MemLocation,
    /// Number of device instances that need a backing allocation.
    pub instances: usize,
}

/// External device-memory allocator.
///
/// Assigns every module a concrete address per device instance, including
/// peer-mapped addresses for multi-device configurations. The playback core
/// only ever consumes the resulting [`Allocation`] triples; it never carves
/// up device memory itself.
pub trait DeviceAllocator {
    fn allocate(&mut self, request: &AllocRequest<'_>) -> Result<Vec<Allocation>, AllocError>;

    /// Release a module's device memory. Failures during teardown are the
    /// allocator's to report; the playback core has nothing useful to do
    /// with them.
    fn free(&mut self, name: &str);
}
