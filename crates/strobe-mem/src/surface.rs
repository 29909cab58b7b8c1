use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// Errors returned by [`SurfaceCache`] accessors.
///
/// All of these are argument errors: the failed access is rejected whole (no
/// partial read or write takes place) and the error value carries enough
/// context to diagnose the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("instance {instance} out of range (cache has {count} instances)")]
    NoSuchInstance { instance: usize, count: usize },

    #[error("instance {instance} has no storage (not filled, imported, or broadcast)")]
    Unpopulated { instance: usize },

    #[error("access out of range: offset=0x{offset:x} len=0x{len:x} size=0x{size:x}")]
    OutOfRange { offset: u64, len: usize, size: u64 },
}

#[derive(Clone, Debug, Default)]
struct Slot {
    buf: Option<Arc<Vec<u8>>>,
    dirty: bool,
}

/// Copy-on-write byte storage for one trace module across N device instances.
///
/// Storage is reference counted: [`SurfaceCache::fill`] stores one physical
/// copy shared by every instance, and a write through instance `k` clones
/// storage for `k` alone, leaving the other instances aliasing the original
/// bytes. [`SurfaceCache::copy_all`] is the explicit exception and replicates
/// a buffer to every instance up front.
///
/// The declared trace size is advisory: an instance's actual length may
/// legitimately differ (an import can be larger or smaller than what the
/// trace header declared) and only consistency checks compare the two.
#[derive(Clone, Debug)]
pub struct SurfaceCache {
    trace_size: u64,
    slots: Vec<Slot>,
}

impl SurfaceCache {
    /// Create a cache with `instance_count` logical instances and no storage.
    pub fn new(instance_count: usize, trace_size: u64) -> Self {
        Self {
            trace_size,
            slots: vec![Slot::default(); instance_count.max(1)],
        }
    }

    pub fn instance_count(&self) -> usize {
        self.slots.len()
    }

    /// The size the trace declared for this surface. Advisory only.
    pub fn trace_size(&self) -> u64 {
        self.trace_size
    }

    /// Whether `instance` currently has backing storage.
    pub fn is_populated(&self, instance: usize) -> bool {
        self.slots
            .get(instance)
            .is_some_and(|s| s.buf.is_some())
    }

    /// Current length of `instance`'s storage, or `None` if unpopulated.
    pub fn len(&self, instance: usize) -> Option<u64> {
        self.slots
            .get(instance)?
            .buf
            .as_ref()
            .map(|b| b.len() as u64)
    }

    pub fn is_empty(&self, instance: usize) -> bool {
        self.len(instance).map_or(true, |l| l == 0)
    }

    /// Populate every instance with one shared physical copy of `bytes`.
    ///
    /// Instances keep aliasing this copy until their first instance-local
    /// write.
    pub fn fill(&mut self, bytes: Vec<u8>) {
        let shared = Arc::new(bytes);
        for slot in &mut self.slots {
            slot.buf = Some(Arc::clone(&shared));
            slot.dirty = false;
        }
    }

    /// Populate every instance with its own private copy of `bytes`.
    ///
    /// Used when content must diverge per instance from the start (per-GPU
    /// relocated addresses).
    pub fn copy_all(&mut self, bytes: &[u8]) {
        for slot in &mut self.slots {
            slot.buf = Some(Arc::new(bytes.to_vec()));
            slot.dirty = false;
        }
    }

    /// Take ownership of an externally provided buffer for one instance.
    pub fn import(&mut self, instance: usize, bytes: Vec<u8>) -> SurfaceResult<()> {
        let slot = self.slot_mut(instance)?;
        slot.buf = Some(Arc::new(bytes));
        slot.dirty = false;
        Ok(())
    }

    /// Detach `instance`'s storage and hand it back to the caller.
    ///
    /// If the storage is still shared with other instances it is cloned
    /// first, so the returned buffer is always uniquely owned and the other
    /// instances are unaffected. The instance is left unpopulated.
    pub fn export(&mut self, instance: usize) -> SurfaceResult<Vec<u8>> {
        let slot = self.slot_mut(instance)?;
        let buf = slot.buf.take().ok_or(SurfaceError::Unpopulated { instance })?;
        slot.dirty = false;
        Ok(Arc::try_unwrap(buf).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Read `dst.len()` bytes starting at `offset` from `instance`'s copy.
    pub fn read_into(&self, instance: usize, offset: u64, dst: &mut [u8]) -> SurfaceResult<()> {
        let buf = self.buf(instance)?;
        let range = check_range(buf.len() as u64, offset, dst.len())?;
        dst.copy_from_slice(&buf[range]);
        Ok(())
    }

    /// Write `src` into `instance`'s copy starting at `offset`.
    ///
    /// This is the copy-on-write point: if `instance` still shares storage
    /// with other instances, its storage is cloned before the write so the
    /// other instances keep observing the original bytes.
    pub fn write_from(&mut self, instance: usize, offset: u64, src: &[u8]) -> SurfaceResult<()> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(instance)
            .ok_or(SurfaceError::NoSuchInstance { instance, count })?;
        let buf = slot
            .buf
            .as_mut()
            .ok_or(SurfaceError::Unpopulated { instance })?;
        let range = check_range(buf.len() as u64, offset, src.len())?;
        Arc::make_mut(buf)[range].copy_from_slice(src);
        slot.dirty = true;
        Ok(())
    }

    pub fn read_u32_le(&self, instance: usize, offset: u64) -> SurfaceResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(instance, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32_le(&mut self, instance: usize, offset: u64, value: u32) -> SurfaceResult<()> {
        self.write_from(instance, offset, &value.to_le_bytes())
    }

    pub fn read_u64_le(&self, instance: usize, offset: u64) -> SurfaceResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(instance, offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64_le(&mut self, instance: usize, offset: u64, value: u64) -> SurfaceResult<()> {
        self.write_from(instance, offset, &value.to_le_bytes())
    }

    /// Borrow a byte range of `instance`'s copy.
    pub fn slice(&self, instance: usize, offset: u64, len: usize) -> SurfaceResult<&[u8]> {
        let buf = self.buf(instance)?;
        let range = check_range(buf.len() as u64, offset, len)?;
        Ok(&buf[range])
    }

    /// SHA-256 of `instance`'s current bytes.
    ///
    /// Replay verification compares digests across runs: a deterministic
    /// relocation pass must reproduce identical digests.
    pub fn digest(&self, instance: usize) -> SurfaceResult<[u8; 32]> {
        let buf = self.buf(instance)?;
        let mut hasher = Sha256::new();
        hasher.update(buf.as_slice());
        Ok(hasher.finalize().into())
    }

    /// Return and clear `instance`'s dirty bit.
    ///
    /// Set by every successful write; consumed by the download step to decide
    /// which instances need re-sending to the device.
    pub fn take_dirty(&mut self, instance: usize) -> SurfaceResult<bool> {
        let slot = self.slot_mut(instance)?;
        Ok(std::mem::take(&mut slot.dirty))
    }

    /// Whether two instances currently alias the same physical storage.
    pub fn shares_storage(&self, a: usize, b: usize) -> bool {
        match (self.slots.get(a), self.slots.get(b)) {
            (Some(sa), Some(sb)) => match (&sa.buf, &sb.buf) {
                (Some(ba), Some(bb)) => Arc::ptr_eq(ba, bb),
                _ => false,
            },
            _ => false,
        }
    }

    fn slot_mut(&mut self, instance: usize) -> SurfaceResult<&mut Slot> {
        let count = self.slots.len();
        self.slots
            .get_mut(instance)
            .ok_or(SurfaceError::NoSuchInstance { instance, count })
    }

    fn buf(&self, instance: usize) -> SurfaceResult<&Arc<Vec<u8>>> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get(instance)
            .ok_or(SurfaceError::NoSuchInstance { instance, count })?;
        slot.buf
            .as_ref()
            .ok_or(SurfaceError::Unpopulated { instance })
    }
}

fn check_range(size: u64, offset: u64, len: usize) -> SurfaceResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(SurfaceError::OutOfRange { offset, len, size })?;
    if end > size {
        return Err(SurfaceError::OutOfRange { offset, len, size });
    }
    // size came from a Vec length, so the narrowing casts cannot truncate.
    Ok(offset as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_shares_one_physical_copy() {
        let mut cache = SurfaceCache::new(4, 16);
        cache.fill(vec![0xAB; 16]);

        assert!(cache.shares_storage(0, 1));
        assert!(cache.shares_storage(1, 3));
        for i in 0..4 {
            assert_eq!(cache.read_u32_le(i, 0).unwrap(), 0xABAB_ABAB);
        }
    }

    #[test]
    fn write_clones_only_the_written_instance() {
        let mut cache = SurfaceCache::new(3, 16);
        cache.fill(vec![0u8; 16]);

        cache.write_u32_le(1, 8, 0xAAAA).unwrap();

        assert_eq!(cache.read_u32_le(1, 8).unwrap(), 0xAAAA);
        assert_eq!(cache.read_u32_le(0, 8).unwrap(), 0);
        assert_eq!(cache.read_u32_le(2, 8).unwrap(), 0);
        assert!(!cache.shares_storage(0, 1));
        assert!(cache.shares_storage(0, 2));
    }

    #[test]
    fn copy_all_gives_every_instance_private_storage() {
        let mut cache = SurfaceCache::new(2, 8);
        cache.copy_all(&[1, 2, 3, 4, 5, 6, 7, 8]);

        assert!(!cache.shares_storage(0, 1));

        cache.write_u32_le(0, 0, 0xDEAD_BEEF).unwrap();
        assert_eq!(cache.read_u32_le(1, 0).unwrap(), 0x0403_0201);
    }

    #[test]
    fn out_of_range_access_is_rejected_whole() {
        let mut cache = SurfaceCache::new(1, 8);
        cache.fill(vec![0u8; 8]);

        let err = cache.write_u32_le(0, 6, 1).unwrap_err();
        assert_eq!(
            err,
            SurfaceError::OutOfRange {
                offset: 6,
                len: 4,
                size: 8
            }
        );
        // The failed write must not have touched the tail bytes.
        assert_eq!(cache.read_u32_le(0, 4).unwrap(), 0);

        let err = cache.read_u32_le(0, u64::MAX).unwrap_err();
        assert!(matches!(err, SurfaceError::OutOfRange { .. }));
    }

    #[test]
    fn access_before_populate_fails() {
        let cache = SurfaceCache::new(2, 8);
        assert_eq!(
            cache.read_u32_le(0, 0).unwrap_err(),
            SurfaceError::Unpopulated { instance: 0 }
        );

        let mut cache = cache;
        assert_eq!(
            cache.write_u32_le(5, 0, 1).unwrap_err(),
            SurfaceError::NoSuchInstance { instance: 5, count: 2 }
        );
    }

    #[test]
    fn import_and_export_round_trip_ownership() {
        let mut cache = SurfaceCache::new(2, 4);
        cache.import(0, vec![9, 9, 9, 9]).unwrap();
        assert!(!cache.is_populated(1));

        // Instance length may differ from the declared trace size.
        cache.import(1, vec![1, 2]).unwrap();
        assert_eq!(cache.len(1), Some(2));
        assert_eq!(cache.trace_size(), 4);

        let bytes = cache.export(0).unwrap();
        assert_eq!(bytes, vec![9, 9, 9, 9]);
        assert!(!cache.is_populated(0));
        assert_eq!(
            cache.export(0).unwrap_err(),
            SurfaceError::Unpopulated { instance: 0 }
        );
    }

    #[test]
    fn export_of_shared_storage_leaves_other_instances_intact() {
        let mut cache = SurfaceCache::new(2, 4);
        cache.fill(vec![7u8; 4]);

        let bytes = cache.export(0).unwrap();
        assert_eq!(bytes, vec![7u8; 4]);
        assert_eq!(cache.read_u32_le(1, 0).unwrap(), 0x0707_0707);
    }

    #[test]
    fn dirty_bit_tracks_writes_per_instance() {
        let mut cache = SurfaceCache::new(2, 8);
        cache.fill(vec![0u8; 8]);

        assert!(!cache.take_dirty(0).unwrap());
        cache.write_u32_le(0, 0, 1).unwrap();
        assert!(cache.take_dirty(0).unwrap());
        assert!(!cache.take_dirty(0).unwrap());
        assert!(!cache.take_dirty(1).unwrap());
    }

    #[test]
    fn digest_is_stable_and_diverges_with_content() {
        let mut cache = SurfaceCache::new(2, 8);
        cache.fill(vec![0u8; 8]);

        let d0 = cache.digest(0).unwrap();
        assert_eq!(d0, cache.digest(1).unwrap());

        cache.write_u64_le(1, 0, 0x0123_4567_89AB_CDEF).unwrap();
        assert_ne!(d0, cache.digest(1).unwrap());
        assert_eq!(d0, cache.digest(0).unwrap());
        assert_eq!(cache.read_u64_le(1, 0).unwrap(), 0x0123_4567_89AB_CDEF);
    }
}
