use std::time::Duration;

use strobe_trace::ModuleId;

/// Monotonically increasing operation identifier, assigned in sequence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of one operation. Transitions once:
/// `NotRun → Running → Done`, or `NotRun → Skipped` when a dependency did not
/// complete successfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpStatus {
    #[default]
    NotRun,
    Running,
    Done,
    Skipped,
}

/// How a completed operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpOutcome {
    Completed,
    /// A wait operation hit its timeout. Distinguished from structural
    /// failures: the hardware never reached the expected state, but the
    /// trace itself is sound and independent operations keep running.
    TimedOut,
}

/// Polling bounds for wait operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitParams {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl WaitParams {
    /// Single-shot check: the condition is sampled once and a miss reports a
    /// timeout immediately.
    pub fn immediate() -> Self {
        Self {
            timeout: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }
}

/// One step of trace replay.
#[derive(Clone, Debug)]
pub enum OpKind {
    /// Send a contiguous byte range of a module's current content to the
    /// channel, on every device instance. A recorded range may be replayed
    /// as several disjoint segments to interleave with other operations.
    SendBytes {
        module: ModuleId,
        offset: u64,
        len: u64,
    },
    /// Append a queue-entry reference (device address + size) to a range that
    /// was already sent, without resending the bytes.
    SendQueueEntry {
        module: ModuleId,
        offset: u64,
        len: u64,
    },
    /// Poll one instance's channel until it drains or the timeout elapses.
    WaitIdle { instance: usize, params: WaitParams },
    /// Poll a channel-visible word until `(value & mask) == expected`.
    WaitValue {
        instance: usize,
        addr: u64,
        mask: u32,
        expected: u32,
        params: WaitParams,
    },
    /// Overwrite a byte range of a module's content with new bytes and
    /// re-download the range on every instance.
    UpdateFile {
        module: ModuleId,
        offset: u64,
        bytes: Vec<u8>,
    },
    /// Apply one of a module's relocations for a single device instance.
    /// Used when the value cannot be known until a prior operation has run.
    ApplyReloc {
        module: ModuleId,
        index: usize,
        instance: usize,
    },
}

/// An operation plus its sequencing state.
#[derive(Clone, Debug)]
pub struct Operation {
    pub(crate) id: OpId,
    pub(crate) kind: OpKind,
    pub(crate) deps: Vec<OpId>,
    pub(crate) status: OpStatus,
    pub(crate) outcome: Option<OpOutcome>,
}

impl Operation {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn deps(&self) -> &[OpId] {
        &self.deps
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<OpOutcome> {
        self.outcome
    }
}
