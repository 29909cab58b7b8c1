//! Per-device-instance surface storage for trace playback.
//!
//! A recorded trace names each sub-buffer once, but playback may fan the same
//! content out to several device instances (multi-GPU peer-to-peer replays).
//! [`SurfaceCache`] keeps one logical buffer per instance while sharing
//! physical storage until an instance actually diverges: filling the cache
//! stores a single reference-counted copy, and the first instance-local write
//! clones storage for that instance only.

#![forbid(unsafe_code)]

mod surface;

pub use surface::{SurfaceCache, SurfaceError, SurfaceResult};
