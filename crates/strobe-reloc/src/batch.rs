use std::collections::BTreeMap;

use strobe_trace::{ModuleId, ModuleTable};

use crate::engine::{RelocError, RelocResult};

/// Deferred-write context for one relocation pass.
///
/// When a single physical buffer backs several logical device instances,
/// applying relocation writes in place as they are computed would let partial
/// patches interleave: a later relocation would read bytes some earlier
/// relocation already rewrote for a different instance. Instead, writes to
/// shared command streams collect here, keyed by `(module, offset,
/// instance)`, and [`RelocBatch::commit`] applies them once, after every
/// relocation in the pass has computed its value against the original bytes.
///
/// Two writes under one key never legally happen: each word of a shared
/// stream has exactly one patching relocation per instance, and a collision
/// means the trace (or the pass driver) is broken.
#[derive(Debug, Default)]
pub struct RelocBatch {
    pending: BTreeMap<(ModuleId, u64, usize), u32>,
}

impl RelocBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a deferred word write. Rejects a second write to the same
    /// `(module, offset, instance)` key as a programming error.
    pub fn record(
        &mut self,
        module: ModuleId,
        offset: u64,
        instance: usize,
        value: u32,
    ) -> RelocResult<()> {
        if self.pending.contains_key(&(module, offset, instance)) {
            return Err(RelocError::DuplicateDeferredWrite {
                module: module.index(),
                offset,
                instance,
            });
        }
        self.pending.insert((module, offset, instance), value);
        Ok(())
    }

    /// Apply every pending write and clear the batch.
    ///
    /// Writes land in key order (module, then offset, then instance), so the
    /// consolidated pass is deterministic regardless of the order relocations
    /// were computed in. Offsets frozen since the write was recorded are
    /// skipped, preserving the frozen-offset invariant.
    ///
    /// Returns the number of words written.
    pub fn commit(&mut self, table: &mut ModuleTable) -> RelocResult<usize> {
        let mut written = 0;
        for ((module_id, offset, instance), value) in std::mem::take(&mut self.pending) {
            let module = table
                .get_mut(module_id)
                .ok_or(RelocError::SourceReleased { module: module_id.index() })?;
            if module.is_frozen(offset) {
                continue;
            }
            module.cache_mut().write_u32_le(instance, offset, value)?;
            written += 1;
        }
        Ok(written)
    }
}
