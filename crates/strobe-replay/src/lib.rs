//! Operation sequencing and the trace playback orchestrator.
//!
//! Replay of a recorded trace is a fixed pipeline: build modules from the
//! trace description, allocate device memory for every module on every
//! participating device instance, run the relocation pass so recorded
//! addresses become live ones, download the patched bytes, then drive the
//! ordered operation sequence: send byte ranges, append queue entries, wait
//! for the channel, update content, apply late relocations.
//!
//! Device I/O stays behind collaborator traits ([`Channel`],
//! [`DeviceAllocator`], and `strobe_reloc::ResourceQuery`); this crate owns
//! the sequencing rules, not the hardware.

mod channel;
mod device;
mod error;
mod op;
mod player;
mod stats;

pub use channel::{Channel, ChannelError};
pub use device::{AllocError, AllocRequest, DeviceAllocator};
pub use error::{ReplayError, ReplayResult};
pub use op::{OpId, OpKind, OpOutcome, OpStatus, Operation, WaitParams};
pub use player::{PlaybackOptions, RunReport, TracePlayer};
pub use stats::{ReplayStats, ReplayStatsSnapshot};
