// Copyright 2025 Oxide Computer Company
//! The per-task I/O surface of an array.
//!
//! A channel is deliberately not Clone: each submitting task opens its
//! own, and the outstanding-read accounting below is therefore free of
//! cross-task contention.  Reads pick the least-loaded operational mirror
//! and walk the remaining mirrors on failure; writes (and unmaps and
//! flushes) fan out to every operational mirror and tolerate partial
//! failure per [`WRITE_SUCCESS_MIN`](crate::WRITE_SUCCESS_MIN).
//!
//! A channel implements [`BlockDev`] itself, so an array can serve as a
//! member of a larger array.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use slog::{debug, info, o, warn, Logger};
use uuid::Uuid;

use crate::array::Array;
use crate::job::{FanoutJob, JobId, ReadAction, ReadFlow};
use crate::{BlockDev, IoType};
use doppel_common::{doppel_bail, Block, DoppelError, SlotData, SlotId};

/// One logical I/O stream into an array.  Open with
/// [`Array::open_channel`]; drop to close.
pub struct ArrayChannel {
    array: Arc<Array>,

    /// Outstanding read blocks per slot, from this channel's balanced
    /// dispatches only.  Retry reads bypass the accounting: they have no
    /// choice of slot to make.
    outstanding: SlotData<AtomicU64>,

    log: Logger,
}

/// Holds a balanced dispatch's outstanding-block count; releases it on
/// drop so the accounting balances regardless of I/O outcome.
struct ReadSlotGuard<'a> {
    slot: SlotId,
    counter: &'a AtomicU64,
    blocks: u64,
}

impl ReadSlotGuard<'_> {
    fn slot(&self) -> SlotId {
        self.slot
    }
}

impl Drop for ReadSlotGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.blocks, Ordering::Relaxed);
    }
}

/// What a fan-out delivers to each member.
enum FanoutPayload {
    Write(Bytes),
    Unmap(u64),
    Flush(u64),
}

impl FanoutPayload {
    fn name(&self) -> &'static str {
        match self {
            FanoutPayload::Write(_) => "write",
            FanoutPayload::Unmap(_) => "unmap",
            FanoutPayload::Flush(_) => "flush",
        }
    }
}

impl ArrayChannel {
    pub(crate) fn new(array: Arc<Array>, id: u64) -> Self {
        let log = array.log().new(o!("channel" => id));
        let outstanding =
            SlotData::from_fn(array.def().slot_count(), |_| AtomicU64::new(0));
        ArrayChannel { array, outstanding, log }
    }

    pub fn array(&self) -> &Arc<Array> {
        &self.array
    }

    /// Outstanding read blocks this channel has dispatched to a slot.
    pub fn outstanding_read_blocks(&self, slot: SlotId) -> u64 {
        self.outstanding
            .get(slot)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /*
     * Pick the operational slot with the fewest outstanding read blocks,
     * lowest index winning ties, and charge it for this read.  None when
     * no slot is operational.
     */
    fn acquire_read_slot(&self, blocks: u64) -> Option<ReadSlotGuard<'_>> {
        let mut best: Option<SlotId> = None;
        let mut least = u64::MAX;
        for s in self.array.slots().iter() {
            if !s.operational() {
                continue;
            }
            let outstanding =
                self.outstanding[s.id()].load(Ordering::Relaxed);
            if outstanding < least {
                least = outstanding;
                best = Some(s.id());
            }
        }

        let slot = best?;
        let counter = &self.outstanding[slot];
        counter.fetch_add(blocks, Ordering::Relaxed);
        Some(ReadSlotGuard { slot, counter, blocks })
    }

    async fn slot_read(
        &self,
        slot: SlotId,
        offset: Block,
        data: &mut BytesMut,
    ) -> Result<(), DoppelError> {
        let s = self.array.slots().slot(slot);
        s.dev().read(s.map_offset(offset), data).await
    }

    async fn slot_write(
        &self,
        slot: SlotId,
        offset: Block,
        data: Bytes,
    ) -> Result<(), DoppelError> {
        let s = self.array.slots().slot(slot);
        s.dev().write(s.map_offset(offset), data).await
    }

    /**
     * Read `data.len()` bytes at `offset`, filling `data`.  One balanced
     * sub-read normally; on a sub-read failure the failing slot is marked
     * and the same range is tried on each remaining operational mirror in
     * index order, wrapping from the failed slot.  A retry that succeeds
     * triggers a best-effort write-back of the good data to the slot that
     * failed first.
     */
    pub async fn read(
        &self,
        offset: Block,
        data: &mut BytesMut,
    ) -> Result<(), DoppelError> {
        let _io = self.array.track_in_flight();
        self.array.check_accepting()?;
        let def = self.array.def();
        def.validate_io(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let job = self.array.jobs().next();
        let blocks = (data.len() as u64) >> def.shift();

        let Some(guard) = self.acquire_read_slot(blocks) else {
            return Err(DoppelError::ArrayFailed);
        };
        let target = guard.slot();
        debug!(
            self.log,
            "{} read {} blocks at {} -> slot {}",
            job,
            blocks,
            offset.value,
            target
        );

        let mut flow = ReadFlow::new(target, def.slot_count());
        let mut current = target;
        let mut result = self.slot_read(current, offset, data).await;
        // the balanced dispatch is complete; release its accounting
        drop(guard);

        loop {
            if let Err(e) = &result {
                self.array.slot_io_error(current, "read", e);
            }
            let action = flow.on_read_result(result, |s| {
                self.array.slots().slot_operational(s)
            });
            match action {
                ReadAction::Complete => return Ok(()),
                ReadAction::Fail(e) => {
                    warn!(
                        self.log,
                        "{} read failed on every eligible mirror: {}", job, e
                    );
                    return Err(e);
                }
                ReadAction::Retry(next) => {
                    warn!(
                        self.log,
                        "{} read retrying on slot {} (slot {} failed)",
                        job,
                        next,
                        current
                    );
                    current = next;
                    result = self.slot_read(current, offset, data).await;
                }
                ReadAction::Heal { original, source } => {
                    self.heal(&mut flow, job, original, source, offset, data)
                        .await;
                    return Ok(());
                }
            }
        }
    }

    /*
     * Write the just-read data back over the stale range on the slot
     * whose read failed.  Strictly best effort: the logical read has
     * already succeeded, so the outcome here affects the slot alone.
     */
    async fn heal(
        &self,
        flow: &mut ReadFlow,
        job: JobId,
        original: SlotId,
        source: SlotId,
        offset: Block,
        data: &BytesMut,
    ) {
        // The slot may have been pulled while the retry was in flight;
        // look again immediately before writing to it.
        let slot = self.array.slots().slot(original);
        if !slot.attached() {
            debug!(
                self.log,
                "{} heal of slot {} skipped: no longer attached",
                job,
                original
            );
            flow.on_heal_skipped();
            return;
        }

        let result =
            self.slot_write(original, offset, data.clone().freeze()).await;
        match &result {
            Ok(()) => info!(
                self.log,
                "{} healed slot {} from slot {}", job, original, source
            ),
            Err(e) => {
                warn!(
                    self.log,
                    "{} heal write to slot {} failed: {}", job, original, e
                );
                self.array.slot_io_error(original, "heal write", e);
            }
        }
        flow.on_heal_result(&result);
    }

    /**
     * Write `data` at `offset` on every operational mirror.  The target
     * set is snapshotted up front; the logical write succeeds while at
     * least one sub-write succeeds, and failing members are marked.
     */
    pub async fn write(
        &self,
        offset: Block,
        data: Bytes,
    ) -> Result<(), DoppelError> {
        let _io = self.array.track_in_flight();
        self.array.check_accepting()?;
        self.array.def().validate_io(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        self.fanout(offset, FanoutPayload::Write(data)).await
    }

    /// Unmap `num_blocks` array blocks at `offset` on every operational
    /// mirror.  Same fan-out and tolerance as `write`.
    pub async fn unmap(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        let _io = self.array.track_in_flight();
        self.array.check_accepting()?;
        if !self.array.io_type_supported(IoType::Unmap) {
            doppel_bail!(Unsupported, "not every member can unmap");
        }
        self.validate_block_range(offset, num_blocks)?;
        if num_blocks == 0 {
            return Ok(());
        }

        self.fanout(offset, FanoutPayload::Unmap(num_blocks)).await
    }

    /// Flush `num_blocks` array blocks at `offset` on every operational
    /// mirror.  Same fan-out and tolerance as `write`.
    pub async fn flush(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        let _io = self.array.track_in_flight();
        self.array.check_accepting()?;
        if !self.array.io_type_supported(IoType::Flush) {
            doppel_bail!(Unsupported, "not every member can flush");
        }
        self.validate_block_range(offset, num_blocks)?;
        if num_blocks == 0 {
            return Ok(());
        }

        self.fanout(offset, FanoutPayload::Flush(num_blocks)).await
    }

    fn validate_block_range(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        let def = self.array.def();
        let length = num_blocks
            .checked_mul(def.block_size())
            .ok_or(DoppelError::OffsetInvalid)?;
        def.validate_io(offset, length as usize)
    }

    async fn fanout(
        &self,
        offset: Block,
        payload: FanoutPayload,
    ) -> Result<(), DoppelError> {
        let job = self.array.jobs().next();
        let targets: Vec<SlotId> = self
            .array
            .slots()
            .iter()
            .filter(|s| s.operational())
            .map(|s| s.id())
            .collect();
        if targets.is_empty() {
            return Err(DoppelError::ArrayFailed);
        }

        debug!(
            self.log,
            "{} {} at {} -> {} slots",
            job,
            payload.name(),
            offset.value,
            targets.len()
        );

        /*
         * Build one sub-I/O per snapshotted target.  Each future owns its
         * device handle and payload, so late completions stay valid even
         * as slots fail underneath them.
         */
        let mut fan = FanoutJob::new(self.array.def().slot_count(), &targets);
        let mut subs: FuturesUnordered<
            BoxFuture<'static, (SlotId, Result<(), DoppelError>)>,
        > = FuturesUnordered::new();
        for &sid in &targets {
            let s = self.array.slots().slot(sid);
            let dev = Arc::clone(s.dev());
            let dev_off = s.map_offset(offset);
            let scale = s.block_scale();
            let sub: BoxFuture<'static, (SlotId, Result<(), DoppelError>)> =
                match &payload {
                    FanoutPayload::Write(data) => {
                        let data = data.clone();
                        Box::pin(async move {
                            (sid, dev.write(dev_off, data).await)
                        })
                    }
                    FanoutPayload::Unmap(nb) => {
                        let dev_blocks = nb * scale;
                        Box::pin(async move {
                            (sid, dev.unmap(dev_off, dev_blocks).await)
                        })
                    }
                    FanoutPayload::Flush(nb) => {
                        let dev_blocks = nb * scale;
                        Box::pin(async move {
                            (sid, dev.flush(dev_off, dev_blocks).await)
                        })
                    }
                };
            subs.push(sub);
        }

        /*
         * Drain every completion, even those that arrive after the
         * aggregate result is already known.
         */
        let mut aggregate = Err(DoppelError::ArrayFailed);
        while let Some((sid, result)) = subs.next().await {
            if let Err(e) = &result {
                self.array.slot_io_error(sid, payload.name(), e);
            }
            if let Some(r) = fan.on_sub_completion(sid, result) {
                aggregate = r;
            }
        }
        aggregate
    }
}

/*
 * A channel is itself a block device, so arrays can stack: the channel of
 * one array can serve as a member of another.
 */
#[async_trait]
impl BlockDev for ArrayChannel {
    fn dev_uuid(&self) -> Uuid {
        self.array.def().uuid()
    }

    fn block_size(&self) -> u64 {
        self.array.def().block_size()
    }

    fn block_count(&self) -> u64 {
        self.array.def().block_count()
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        self.array.io_type_supported(io_type)
    }

    async fn read(
        &self,
        offset: Block,
        data: &mut BytesMut,
    ) -> Result<(), DoppelError> {
        ArrayChannel::read(self, offset, data).await
    }

    async fn write(
        &self,
        offset: Block,
        data: Bytes,
    ) -> Result<(), DoppelError> {
        ArrayChannel::write(self, offset, data).await
    }

    async fn unmap(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        ArrayChannel::unmap(self, offset, num_blocks).await
    }

    async fn flush(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        ArrayChannel::flush(self, offset, num_blocks).await
    }
}
