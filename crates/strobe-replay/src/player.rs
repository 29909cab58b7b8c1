use std::time::Instant;

use strobe_reloc::{patch, relocate_all, RelocBatch, RelocPassReport, ResourceQuery};
use strobe_trace::{ModuleError, ModuleId, ModuleTable, TraceDesc, TraceModule};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::device::{AllocError, AllocRequest, DeviceAllocator};
use crate::error::{ReplayError, ReplayResult};
use crate::op::{OpId, OpKind, OpOutcome, OpStatus, Operation, WaitParams};
use crate::stats::ReplayStats;

#[derive(Clone, Copy, Debug)]
pub struct PlaybackOptions {
    /// Number of physical device instances participating in the replay.
    pub device_instances: usize,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            device_instances: 1,
        }
    }
}

/// Outcome of one [`TracePlayer::run`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: usize,
    pub skipped: usize,
    /// Wait operations that hit their timeout. These completed (the sequence
    /// moved on), but the hardware never reached the expected state.
    pub timed_out: Vec<OpId>,
}

/// Owns one trace's modules and operation sequence and drives the playback
/// pipeline: allocate → relocate → download → run.
pub struct TracePlayer {
    table: ModuleTable,
    ops: Vec<Operation>,
    stats: ReplayStats,
    options: PlaybackOptions,
}

impl TracePlayer {
    /// Build a player from a validated trace description.
    pub fn load(desc: &TraceDesc, options: PlaybackOptions) -> ReplayResult<Self> {
        let table = desc.build(options.device_instances)?;
        debug!(modules = table.len(), instances = options.device_instances, "trace loaded");
        Ok(Self::with_table(table, options))
    }

    /// Wrap an already-built module table.
    pub fn with_table(table: ModuleTable, options: PlaybackOptions) -> Self {
        Self {
            table,
            ops: Vec::new(),
            stats: ReplayStats::new(),
            options,
        }
    }

    pub fn table(&self) -> &ModuleTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ModuleTable {
        &mut self.table
    }

    pub fn options(&self) -> PlaybackOptions {
        self.options
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn op(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id.index())
    }

    /// Append an operation to the sequence. Declared order is execution
    /// order; `deps` must name earlier operations.
    pub fn push_op(&mut self, kind: OpKind, deps: Vec<OpId>) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(Operation {
            id,
            kind,
            deps,
            status: OpStatus::NotRun,
            outcome: None,
        });
        id
    }

    /// Check every dependency edge before running anything: unknown ids and
    /// edges pointing at later operations are structural errors.
    pub fn validate_sequence(&self) -> ReplayResult<()> {
        for op in &self.ops {
            for &dep in &op.deps {
                if dep.index() >= self.ops.len() {
                    return Err(ReplayError::UnknownDependency { op: op.id, dep });
                }
                if dep >= op.id {
                    return Err(ReplayError::ForwardDependency { op: op.id, dep });
                }
            }
        }
        Ok(())
    }

    /// Ask the external allocator for backing memory for every module, in
    /// table order. A module that is already allocated fails the call;
    /// allocation is single-shot per module.
    pub fn allocate_all(&mut self, allocator: &mut dyn DeviceAllocator) -> ReplayResult<()> {
        let instances = self.options.device_instances;
        let ids: Vec<ModuleId> = self.table.ids().collect();
        for id in ids {
            let module = self.table.get(id).expect("live module");
            if module.is_allocated() {
                return Err(ModuleError::AlreadyAllocated {
                    name: module.name().to_string(),
                }
                .into());
            }
            let request = AllocRequest {
                name: module.name(),
                size: module.size(),
                protection: module.protection(),
                location: module.location(),
                instances,
            };
            let allocations = allocator.allocate(&request)?;
            if allocations.len() != instances {
                return Err(AllocError::WrongInstanceCount {
                    name: module.name().to_string(),
                    returned: allocations.len(),
                    expected: instances,
                }
                .into());
            }
            self.table
                .get_mut(id)
                .expect("live module")
                .allocate(allocations)?;
        }
        debug!(instances, "all modules allocated");
        Ok(())
    }

    /// Run the full relocation pass over every module and commit the
    /// deferred writes.
    pub fn relocate(&mut self, query: &dyn ResourceQuery) -> ReplayResult<RelocPassReport> {
        let report = relocate_all(&mut self.table, query, self.options.device_instances)?;
        self.stats
            .add_relocs_applied((report.written + report.deferred) as u64);
        self.stats.add_words_committed(report.words_committed as u64);
        Ok(report)
    }

    /// Copy every populated module instance to its device address and clear
    /// the dirty bits.
    pub fn download_all(&mut self, channel: &mut dyn Channel) -> ReplayResult<()> {
        let instances = self.options.device_instances;
        let ids: Vec<ModuleId> = self.table.ids().collect();
        for id in ids {
            let module = self.table.get_mut(id).expect("live module");
            for instance in 0..instances {
                let Some(len) = module.cache().len(instance) else {
                    continue;
                };
                let addr = module.alloc(instance)?.virt_addr + module.base_offset();
                channel.download(instance, addr, module.cache().slice(instance, 0, len as usize)?)?;
                module.cache_mut().take_dirty(instance)?;
                self.stats.add_bytes_downloaded(len);
            }
        }
        Ok(())
    }

    /// Release one module: free its device memory and detach it from every
    /// module that referenced it as a relocation source.
    pub fn release_module(
        &mut self,
        id: ModuleId,
        allocator: &mut dyn DeviceAllocator,
    ) -> Option<TraceModule> {
        let mut module = self.table.release(id)?;
        allocator.free(module.name());
        module.release_allocations();
        Some(module)
    }

    /// Execute the operation sequence in declared order.
    ///
    /// An operation whose dependencies did not all complete successfully is
    /// skipped (and its dependents after it, transitively). Wait timeouts
    /// are recorded in the report without stopping the sequence; structural
    /// errors abort it.
    pub fn run(
        &mut self,
        channel: &mut dyn Channel,
        query: &dyn ResourceQuery,
    ) -> ReplayResult<RunReport> {
        self.validate_sequence()?;

        let mut report = RunReport::default();
        for index in 0..self.ops.len() {
            if self.ops[index].status != OpStatus::NotRun {
                continue;
            }
            let id = self.ops[index].id;

            let blocked = self.ops[index].deps.iter().any(|dep| {
                let dep = &self.ops[dep.index()];
                dep.status != OpStatus::Done || dep.outcome != Some(OpOutcome::Completed)
            });
            if blocked {
                self.ops[index].status = OpStatus::Skipped;
                self.stats.inc_ops_skipped();
                report.skipped += 1;
                debug!(op = %id, "skipped: dependency did not complete");
                continue;
            }

            self.ops[index].status = OpStatus::Running;
            let kind = self.ops[index].kind.clone();
            let outcome = self.exec(id, &kind, channel, query)?;
            self.ops[index].status = OpStatus::Done;
            self.ops[index].outcome = Some(outcome);
            match outcome {
                OpOutcome::Completed => {
                    self.stats.inc_ops_completed();
                    report.completed += 1;
                }
                OpOutcome::TimedOut => {
                    self.stats.inc_wait_timeouts();
                    report.timed_out.push(id);
                    warn!(op = %id, "wait timed out");
                }
            }
        }
        debug!(
            completed = report.completed,
            skipped = report.skipped,
            timed_out = report.timed_out.len(),
            "operation sequence done"
        );
        Ok(report)
    }

    fn exec(
        &mut self,
        id: OpId,
        kind: &OpKind,
        channel: &mut dyn Channel,
        query: &dyn ResourceQuery,
    ) -> ReplayResult<OpOutcome> {
        let instances = self.options.device_instances;
        match kind {
            OpKind::SendBytes {
                module,
                offset,
                len,
            } => {
                let m = self
                    .table
                    .get(*module)
                    .ok_or(ReplayError::DeadModule { op: id })?;
                for instance in 0..instances {
                    check_range(id, m, instance, *offset, *len)?;
                    channel.submit(instance, m.cache().slice(instance, *offset, *len as usize)?)?;
                    self.stats.add_bytes_submitted(*len);
                }
                Ok(OpOutcome::Completed)
            }
            OpKind::SendQueueEntry {
                module,
                offset,
                len,
            } => {
                let m = self
                    .table
                    .get(*module)
                    .ok_or(ReplayError::DeadModule { op: id })?;
                for instance in 0..instances {
                    let alloc = m.alloc(instance)?;
                    if offset.checked_add(*len).map_or(true, |end| end > alloc.size) {
                        return Err(ReplayError::RangeOutsideModule {
                            op: id,
                            module: m.name().to_string(),
                            offset: *offset,
                            len: *len,
                        });
                    }
                    let addr = alloc.virt_addr + m.base_offset() + offset;
                    channel.queue_entry(instance, addr, *len)?;
                    self.stats.inc_queue_entries();
                }
                Ok(OpOutcome::Completed)
            }
            OpKind::WaitIdle { instance, params } => {
                poll_until(*params, || Ok(channel.is_idle(*instance)))
            }
            OpKind::WaitValue {
                instance,
                addr,
                mask,
                expected,
                params,
            } => poll_until(*params, || {
                Ok((channel.read_u32(*instance, *addr)? & mask) == *expected)
            }),
            OpKind::UpdateFile {
                module,
                offset,
                bytes,
            } => {
                let m = self
                    .table
                    .get_mut(*module)
                    .ok_or(ReplayError::DeadModule { op: id })?;
                for instance in 0..instances {
                    check_range(id, m, instance, *offset, bytes.len() as u64)?;
                    m.cache_mut().write_from(instance, *offset, bytes)?;
                }
                // The content changed behind the device's back; push the
                // updated range to every instance immediately.
                for instance in 0..instances {
                    let addr = m.alloc(instance)?.virt_addr + m.base_offset() + offset;
                    channel.download(instance, addr, m.cache().slice(instance, *offset, bytes.len())?)?;
                    m.cache_mut().take_dirty(instance)?;
                    self.stats.add_bytes_downloaded(bytes.len() as u64);
                }
                Ok(OpOutcome::Completed)
            }
            OpKind::ApplyReloc {
                module,
                index,
                instance,
            } => {
                let m = self
                    .table
                    .get(*module)
                    .ok_or(ReplayError::DeadModule { op: id })?;
                let reloc = m
                    .relocs()
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| ReplayError::NoSuchReloc {
                        op: id,
                        module: m.name().to_string(),
                        index: *index,
                    })?;
                let mut batch = RelocBatch::new();
                patch(&mut self.table, *module, &reloc, *instance, &mut batch, query)?;
                let committed = batch.commit(&mut self.table)?;
                self.stats.add_relocs_applied(1);
                self.stats.add_words_committed(committed as u64);
                Ok(OpOutcome::Completed)
            }
        }
    }
}

fn check_range(
    id: OpId,
    module: &TraceModule,
    instance: usize,
    offset: u64,
    len: u64,
) -> ReplayResult<()> {
    let cache_len = module.cache().len(instance).unwrap_or(0);
    if offset.checked_add(len).map_or(true, |end| end > cache_len) {
        return Err(ReplayError::RangeOutsideModule {
            op: id,
            module: module.name().to_string(),
            offset,
            len,
        });
    }
    Ok(())
}

/// Poll `cond` until it holds or `params.timeout` elapses. A zero timeout is
/// a single-shot check. There is no cancellation: the wait either satisfies
/// its condition or times out.
fn poll_until(
    params: WaitParams,
    mut cond: impl FnMut() -> ReplayResult<bool>,
) -> ReplayResult<OpOutcome> {
    let start = Instant::now();
    loop {
        if cond()? {
            return Ok(OpOutcome::Completed);
        }
        if start.elapsed() >= params.timeout {
            return Ok(OpOutcome::TimedOut);
        }
        if !params.poll_interval.is_zero() {
            std::thread::sleep(params.poll_interval);
        }
    }
}
