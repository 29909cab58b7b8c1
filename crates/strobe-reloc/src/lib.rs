//! The relocation engine: rewrite recorded module bytes with live addresses.
//!
//! A trace records device addresses that were valid when it was captured.
//! Replay allocates fresh memory (possibly on a different number of GPUs with
//! a different VA layout), so every address, size, and surface property baked
//! into the recorded bytes must be patched before the bytes are sent anywhere.
//!
//! Every relocation kind runs the same five-step skeleton (frozen-offset
//! check, read raw bits, resolve the new value, mask-combine, write or defer)
//! and only the value resolution differs per kind. For shared command-stream
//! buffers replayed across several device instances, writes are not applied in
//! place: they collect in a [`RelocBatch`] and land in one consolidated,
//! deterministically ordered pass once every relocation has computed its
//! value against the unpatched original.
//!
//! Failure is terminal: any data-consistency error (unknown source surface,
//! cross-address-space patch, missing surface metadata, duplicate deferred
//! write) aborts the relocation pass. A partially patched command stream is
//! worse than no command stream.

mod batch;
mod engine;

pub use batch::RelocBatch;
pub use engine::{
    patch, relocate_all, FixedQuery, RelocError, RelocPassReport, RelocResult, ResourceQuery,
    WriteOutcome,
};
