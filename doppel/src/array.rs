// Copyright 2025 Oxide Computer Company
//! Array lifecycle: assembling member devices into a running mirror,
//! tracking member failures against the minimum-operational constraint,
//! persisting the membership superblock, and draining I/O at stop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use slog::{error, info, o, warn, Logger};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::channel::ArrayChannel;
use crate::job::{FanoutJob, JobIdAllocator};
use crate::slots::{SlotGeometry, SlotSet};
use crate::superblock::{
    SbSlotRecord, SbSlotState, Superblock, SB_MAX_LENGTH, SB_VERSION_MAJOR,
    SB_VERSION_MINOR,
};
use crate::{BlockDev, IoType};
use doppel_common::{
    doppel_bail, ArrayDefinition, ArrayOpts, Block, DoppelError, SlotId,
    MAX_SLOTS, MIN_BLOCK_SIZE, MIN_SLOTS,
};

/// Lifecycle states of an array.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArrayState {
    /// Members are being validated and the initial superblock written.
    Starting,

    /// Accepting I/O.
    Running,

    /// No new I/O; waiting for in-flight I/O to drain.
    Stopping,

    Stopped,

    /// Fewer than the required minimum of mirrors remain operational.
    /// Terminal: all subsequent submissions are rejected.
    Failed,
}

impl std::fmt::Display for ArrayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayState::Starting => write!(f, "starting"),
            ArrayState::Running => write!(f, "running"),
            ArrayState::Stopping => write!(f, "stopping"),
            ArrayState::Stopped => write!(f, "stopped"),
            ArrayState::Failed => write!(f, "failed"),
        }
    }
}

/// Redundancy summary, derived from slot flags and the array state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Health {
    /// Every mirror is operational.
    Online,

    /// This many mirrors are out, but the array is still serving I/O.
    Degraded(u8),

    Failed,
}

/// Point-in-time view of one slot, for callers and logs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotInfo {
    pub slot: SlotId,
    pub uuid: Uuid,
    pub failed: bool,
    pub attached: bool,
}

/**
 * A running mirror array.
 *
 * `start` assembles the member devices, optionally persists the initial
 * superblock, and hands back an `Arc<Array>`.  I/O goes through channels
 * (`open_channel`); failure marking, health, and stop live here.
 *
 * Locking: `state` is a std RwLock and is never held across an await.
 * Everything else that changes while the array runs is atomic.
 */
pub struct Array {
    def: ArrayDefinition,
    slots: SlotSet,

    /// Whether a metadata region was reserved and a superblock written.
    superblock: bool,

    state: RwLock<ArrayState>,
    seq_number: AtomicU64,
    jobs: JobIdAllocator,
    next_channel: AtomicU64,

    /// Logical submissions currently inside a channel, plus array-level
    /// superblock writes.  `stop` waits for this to reach zero.
    in_flight: AtomicU64,
    drained: Notify,

    log: Logger,
}

impl Array {
    /**
     * Validate the member devices against the options, compute the array
     * geometry, and bring the array to Running.  With `write_superblock`
     * set, the front of every member is reserved and the initial
     * membership record is persisted before any data I/O is possible; a
     * member that fails that write starts out failed, and if fewer than
     * `min_operational` members survive it, start fails.
     */
    pub async fn start(
        opts: &ArrayOpts,
        devices: Vec<Arc<dyn BlockDev>>,
        log: &Logger,
    ) -> Result<Arc<Array>> {
        opts.validate()?;

        if !(MIN_SLOTS..=MAX_SLOTS).contains(&devices.len()) {
            bail!(
                "a mirror takes {} to {} members, not {}",
                MIN_SLOTS,
                MAX_SLOTS,
                devices.len()
            );
        }

        let mut seen = HashSet::new();
        let mut geometry = Vec::with_capacity(devices.len());
        let mut block_count = u64::MAX;
        for (i, dev) in devices.iter().enumerate() {
            let dev_bs = dev.block_size();
            if dev_bs < MIN_BLOCK_SIZE as u64
                || opts.block_size % dev_bs != 0
            {
                bail!(
                    "device {} block size {} does not divide \
                     array block size {}",
                    i,
                    dev_bs,
                    opts.block_size
                );
            }
            if !seen.insert(dev.dev_uuid()) {
                bail!("device {} duplicates member uuid {}", i, dev.dev_uuid());
            }

            let block_scale = opts.block_size / dev_bs;
            let data_offset = if opts.write_superblock {
                (SB_MAX_LENGTH as u64).div_ceil(dev_bs)
            } else {
                0
            };
            if dev.block_count() <= data_offset {
                bail!(
                    "device {} ({} blocks) has no room past the \
                     metadata region",
                    i,
                    dev.block_count()
                );
            }
            let data_size = dev.block_count() - data_offset;

            block_count = block_count.min(data_size / block_scale);
            geometry.push(SlotGeometry { data_offset, data_size, block_scale });
        }

        let def = ArrayDefinition::from_options(
            opts,
            devices.len() as u8,
            block_count,
        )?;
        let log = log.new(o!("array" => def.name().to_string()));

        let array = Arc::new(Array {
            slots: SlotSet::new(devices, &geometry),
            superblock: opts.write_superblock,
            state: RwLock::new(ArrayState::Starting),
            seq_number: AtomicU64::new(0),
            jobs: JobIdAllocator::default(),
            next_channel: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            drained: Notify::new(),
            def,
            log,
        });

        if array.superblock {
            if let Err(e) = array.write_superblock_inner().await {
                bail!("initial superblock write failed: {}", e);
            }
            let operational = array.slots.count_operational();
            if operational < array.def.min_operational() {
                bail!(
                    "only {} of {} members survived the initial \
                     superblock write; {} required",
                    operational,
                    array.def.slot_count(),
                    array.def.min_operational()
                );
            }
        }

        *array.state.write().unwrap() = ArrayState::Running;
        info!(
            array.log,
            "array {} running: {} members, {} blocks of {} bytes",
            array.def.uuid(),
            array.def.slot_count(),
            array.def.block_count(),
            array.def.block_size()
        );

        Ok(array)
    }

    pub fn def(&self) -> &ArrayDefinition {
        &self.def
    }

    pub fn state(&self) -> ArrayState {
        *self.state.read().unwrap()
    }

    pub fn health(&self) -> Health {
        if self.state() == ArrayState::Failed {
            return Health::Failed;
        }
        let out = self.def.slot_count() - self.slots.count_operational();
        if out == 0 {
            Health::Online
        } else {
            Health::Degraded(out)
        }
    }

    pub fn slot_info(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .map(|s| SlotInfo {
                slot: s.id(),
                uuid: s.dev_uuid(),
                failed: s.failed(),
                attached: s.attached(),
            })
            .collect()
    }

    /// Logical submissions currently in flight.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /**
     * Open an I/O channel.  Cheap and purely local: no device I/O and no
     * blocking.  Each caller task gets its own channel; the channel keeps
     * the array alive.
     */
    pub fn open_channel(self: &Arc<Self>) -> ArrayChannel {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        ArrayChannel::new(Arc::clone(self), id)
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Read | IoType::Write => true,
            IoType::Unmap | IoType::Flush => self
                .slots
                .iter()
                .filter(|s| s.attached())
                .all(|s| s.dev().io_type_supported(io_type)),
        }
    }

    /**
     * Mark a slot failed on behalf of an external observer (an admin
     * action, or a device-removal notification).  A failed slot stops
     * taking new I/O; its device handle stays open until the array is
     * dropped.
     */
    pub fn fail_slot(&self, slot: SlotId) -> Result<(), DoppelError> {
        let s = self
            .slots
            .get(slot)
            .ok_or(DoppelError::InvalidSlot(slot.get()))?;
        if s.fail() {
            error!(
                self.log,
                "slot {} ({}) marked failed",
                slot,
                s.dev_uuid()
            );
            self.constraint_check();
        }
        Ok(())
    }

    /// Mark a slot detached (device pulled).  Implies failed.
    pub fn detach_slot(&self, slot: SlotId) -> Result<(), DoppelError> {
        let s = self
            .slots
            .get(slot)
            .ok_or(DoppelError::InvalidSlot(slot.get()))?;
        let newly_detached = s.detach();
        let newly_failed = s.fail();
        if newly_detached || newly_failed {
            warn!(
                self.log,
                "slot {} ({}) detached",
                slot,
                s.dev_uuid()
            );
            self.constraint_check();
        }
        Ok(())
    }

    /**
     * Stop the array: refuse new submissions, wait for in-flight I/O to
     * drain, then move to Stopped.  Idempotent; concurrent callers all
     * return once the drain completes.
     */
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                ArrayState::Stopped => return,
                ArrayState::Stopping => {
                    // another stop is already draining; wait with it
                }
                prev => {
                    info!(self.log, "array stopping from {}", prev);
                    *state = ArrayState::Stopping;
                }
            }
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let mut state = self.state.write().unwrap();
        if *state == ArrayState::Stopping {
            *state = ArrayState::Stopped;
            info!(self.log, "array stopped");
        }
    }

    /**
     * Persist the membership superblock to every operational member: one
     * serialization, padded per member to its device block size, written
     * at device LBA 0.  Succeeds when at least one member persisted it.
     * Members that fail the write are marked failed.
     */
    pub async fn write_superblock(&self) -> Result<(), DoppelError> {
        if !self.superblock {
            doppel_bail!(
                Unsupported,
                "array was started without a superblock region"
            );
        }
        // Gauge first: a concurrent stop must either see this write or
        // reject it, never drain past it.
        let _io = self.track_in_flight();
        self.check_accepting()?;
        self.write_superblock_inner().await
    }

    async fn write_superblock_inner(&self) -> Result<(), DoppelError> {
        let seq = self.seq_number.fetch_add(1, Ordering::SeqCst) + 1;
        let sb = self.build_superblock(seq);
        let serialized = sb.serialize();

        let targets: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|s| s.operational())
            .map(|s| s.id())
            .collect();
        if targets.is_empty() {
            return Err(DoppelError::ArrayFailed);
        }

        info!(
            self.log,
            "writing superblock seq {} to {} members",
            seq,
            targets.len()
        );

        let mut fan = FanoutJob::new(self.def.slot_count(), &targets);
        let mut subs: FuturesUnordered<
            BoxFuture<'static, (SlotId, Result<(), DoppelError>)>,
        > = FuturesUnordered::new();
        for &sid in &targets {
            let s = self.slots.slot(sid);
            let dev = Arc::clone(s.dev());
            let lba0 = Block::new(0, s.shift());

            // One serialization, padded out per member to whole blocks.
            let bs = dev.block_size();
            let mut buf = serialized.clone();
            buf.resize(
                ((buf.len() as u64).div_ceil(bs) * bs) as usize,
                0,
            );
            let buf = Bytes::from(buf);

            subs.push(Box::pin(async move {
                (sid, dev.write(lba0, buf).await)
            }));
        }

        let mut aggregate = Err(DoppelError::ArrayFailed);
        while let Some((sid, result)) = subs.next().await {
            if let Err(e) = &result {
                self.slot_io_error(sid, "superblock write", e);
            }
            if let Some(r) = fan.on_sub_completion(sid, result) {
                aggregate = r;
            }
        }
        aggregate
    }

    fn build_superblock(&self, seq_number: u64) -> Superblock {
        Superblock {
            version_major: SB_VERSION_MAJOR,
            version_minor: SB_VERSION_MINOR,
            flags: 0,
            uuid: self.def.uuid(),
            name: self.def.name().to_string(),
            array_block_count: self.def.block_count(),
            block_size: self.def.block_size() as u32,
            seq_number,
            slots: self
                .slots
                .iter()
                .map(|s| SbSlotRecord {
                    uuid: s.dev_uuid(),
                    data_offset: s.data_offset(),
                    data_size: s.data_size(),
                    state: if !s.attached() {
                        SbSlotState::Missing
                    } else if s.failed() {
                        SbSlotState::Failed
                    } else {
                        SbSlotState::Operational
                    },
                    slot: s.id(),
                })
                .collect(),
        }
    }

    /// Reject submissions unless the array is Running.
    pub(crate) fn check_accepting(&self) -> Result<(), DoppelError> {
        match self.state() {
            ArrayState::Running => Ok(()),
            ArrayState::Failed => Err(DoppelError::ArrayFailed),
            s => Err(DoppelError::ArrayInactive(s.to_string())),
        }
    }

    /**
     * Record a device error against a slot: mark it failed and, on the
     * first transition, re-evaluate the minimum-operational constraint.
     */
    pub(crate) fn slot_io_error(
        &self,
        slot: SlotId,
        what: &str,
        err: &DoppelError,
    ) {
        let s = self.slots.slot(slot);
        if s.fail() {
            error!(
                self.log,
                "slot {} ({}) failed on {}: {}",
                slot,
                s.dev_uuid(),
                what,
                err
            );
            self.constraint_check();
        }
    }

    /*
     * Evaluated after every individual failure event.  The Running to
     * Failed transition happens at most once; in-flight I/O runs to its
     * own completion, new submissions are rejected from here on.
     */
    fn constraint_check(&self) {
        let operational = self.slots.count_operational();
        if operational >= self.def.min_operational() {
            return;
        }

        let mut state = self.state.write().unwrap();
        if *state == ArrayState::Running {
            *state = ArrayState::Failed;
            error!(
                self.log,
                "array failed: {} of {} members operational, {} required",
                operational,
                self.def.slot_count(),
                self.def.min_operational()
            );
        }
    }

    pub(crate) fn slots(&self) -> &SlotSet {
        &self.slots
    }

    pub(crate) fn jobs(&self) -> &JobIdAllocator {
        &self.jobs
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn track_in_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { array: self }
    }
}

/// Holds one count of the array's in-flight gauge.
pub(crate) struct InFlightGuard<'a> {
    array: &'a Array,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.array.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.array.drained.notify_waiters();
        }
    }
}
