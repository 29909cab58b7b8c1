use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel for device instance {instance} is closed")]
    Closed { instance: usize },

    #[error("channel rejected submission on instance {instance}: {reason}")]
    Rejected { instance: usize, reason: String },

    #[error("channel-visible address 0x{addr:x} is not mapped on instance {instance}")]
    BadAddress { instance: usize, addr: u64 },
}

/// Per-device-instance submission path for trace playback.
///
/// One implementation fronts every participating device instance; each method
/// names the instance it acts on. All calls are synchronous; completion is
/// observed by polling [`Channel::is_idle`] or a channel-visible word via
/// [`Channel::read_u32`].
pub trait Channel {
    /// Submit a byte range of module content for execution.
    fn submit(&mut self, instance: usize, bytes: &[u8]) -> Result<(), ChannelError>;

    /// Append a queue entry referencing bytes already resident on the device,
    /// without resending them.
    fn queue_entry(&mut self, instance: usize, addr: u64, size: u64) -> Result<(), ChannelError>;

    /// Copy module content into device memory at `addr`.
    fn download(&mut self, instance: usize, addr: u64, bytes: &[u8]) -> Result<(), ChannelError>;

    /// Whether all previously submitted work on `instance` has completed.
    fn is_idle(&mut self, instance: usize) -> bool;

    /// Read one channel-visible 32-bit word (value-compare polls).
    fn read_u32(&mut self, instance: usize, addr: u64) -> Result<u32, ChannelError>;
}
