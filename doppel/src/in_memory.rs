// Copyright 2025 Oxide Computer Company
//! In-memory implementation of [`BlockDev`].
//!
//! Backs an array member with a plain byte vector, which makes it the
//! workhorse of the test suite: it counts every operation it is asked to
//! perform and can inject failures (latched or one-shot) and hold reads
//! at a gate so tests can observe the array mid-flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::{BlockDev, IoType};
use doppel_common::{doppel_bail, Block, DoppelError};

/// How many of each operation a device has been asked to perform,
/// including ones that failed by injection.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpCounts {
    pub reads: u64,
    pub writes: u64,
    pub unmaps: u64,
    pub flushes: u64,
}

struct Inner {
    bytes: Vec<u8>,
}

pub struct InMemoryBlockDev {
    uuid: Uuid,
    block_size: u64,
    block_count: u64,
    support_unmap: bool,
    support_flush: bool,

    inner: Mutex<Inner>,

    reads: AtomicU64,
    writes: AtomicU64,
    unmaps: AtomicU64,
    flushes: AtomicU64,

    /*
     * Fault injection.  The latched toggles fail every matching operation
     * until cleared; fail_next_reads fails exactly that many and then
     * stops.  One-shot failures take precedence over the latch check only
     * in the sense that both produce the same error.
     */
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_next_reads: AtomicU64,

    /// While set, reads park at a gate after being counted; `release_reads`
    /// lets them all proceed.
    hold_reads: AtomicBool,
    gate: Notify,
}

impl InMemoryBlockDev {
    pub fn new(block_size: u64, block_count: u64) -> Self {
        assert!(block_size.is_power_of_two());
        InMemoryBlockDev {
            uuid: Uuid::new_v4(),
            block_size,
            block_count,
            support_unmap: true,
            support_flush: true,
            inner: Mutex::new(Inner {
                bytes: vec![0; (block_size * block_count) as usize],
            }),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_next_reads: AtomicU64::new(0),
            hold_reads: AtomicBool::new(false),
            gate: Notify::new(),
        }
    }

    pub fn without_unmap(mut self) -> Self {
        self.support_unmap = false;
        self
    }

    pub fn without_flush(mut self) -> Self {
        self.support_flush = false;
        self
    }

    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            unmaps: self.unmaps.load(Ordering::SeqCst),
            flushes: self.flushes.load(Ordering::SeqCst),
        }
    }

    /// Fail every read until cleared.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail every write until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail exactly the next `count` reads, then behave again.
    pub fn fail_next_reads(&self, count: u64) {
        self.fail_next_reads.store(count, Ordering::SeqCst);
    }

    /// Park subsequent reads at the gate (after they are counted).
    pub fn hold_reads(&self) {
        self.hold_reads.store(true, Ordering::SeqCst);
    }

    /// Open the gate and wake every parked read.
    pub fn release_reads(&self) {
        self.hold_reads.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Raw view of device contents, bypassing counters and injection.
    pub async fn peek(&self, offset: Block, len: usize) -> Bytes {
        let inner = self.inner.lock().await;
        let start = offset.bytes();
        Bytes::copy_from_slice(&inner.bytes[start..start + len])
    }

    fn check_io(&self, offset: Block, len: usize) -> Result<(), DoppelError> {
        if offset.block_size_in_bytes() as u64 != self.block_size {
            return Err(DoppelError::BlockSizeMismatch);
        }
        if len % self.block_size as usize != 0 {
            return Err(DoppelError::DataLenUnaligned);
        }
        if offset.byte_value() + len as u64
            > self.block_size * self.block_count
        {
            return Err(DoppelError::OffsetInvalid);
        }
        Ok(())
    }

    async fn gate_reads(&self) {
        while self.hold_reads.load(Ordering::SeqCst) {
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.hold_reads.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }

    fn take_injected_read_failure(&self) -> bool {
        if self
            .fail_next_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return true;
        }
        self.fail_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockDev for InMemoryBlockDev {
    fn dev_uuid(&self) -> Uuid {
        self.uuid
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Read | IoType::Write => true,
            IoType::Unmap => self.support_unmap,
            IoType::Flush => self.support_flush,
        }
    }

    async fn read(
        &self,
        offset: Block,
        data: &mut BytesMut,
    ) -> Result<(), DoppelError> {
        self.check_io(offset, data.len())?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.gate_reads().await;
        if self.take_injected_read_failure() {
            doppel_bail!(IoError, "injected read failure");
        }

        let len = data.len();
        let inner = self.inner.lock().await;
        let start = offset.bytes();
        data.copy_from_slice(&inner.bytes[start..start + len]);
        Ok(())
    }

    async fn write(
        &self,
        offset: Block,
        data: Bytes,
    ) -> Result<(), DoppelError> {
        self.check_io(offset, data.len())?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            doppel_bail!(IoError, "injected write failure");
        }

        let mut inner = self.inner.lock().await;
        let start = offset.bytes();
        inner.bytes[start..start + data.len()].copy_from_slice(&data);
        Ok(())
    }

    async fn unmap(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        if !self.support_unmap {
            doppel_bail!(Unsupported, "unmap is disabled on this device");
        }
        let len = (num_blocks * self.block_size) as usize;
        self.check_io(offset, len)?;
        self.unmaps.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock().await;
        let start = offset.bytes();
        inner.bytes[start..start + len].fill(0);
        Ok(())
    }

    async fn flush(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError> {
        if !self.support_flush {
            doppel_bail!(Unsupported, "flush is disabled on this device");
        }
        let len = (num_blocks * self.block_size) as usize;
        self.check_io(offset, len)?;
        self.flushes.fetch_add(1, Ordering::SeqCst);

        // nothing is volatile here; a flush only has to be observable
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn write_read_unmap_round_trip() {
        let dev = InMemoryBlockDev::new(512, 8);

        let payload = Bytes::from(vec![0xab; 1024]);
        dev.write(Block::new_512(2), payload.clone()).await.unwrap();

        let mut buf = BytesMut::zeroed(1024);
        dev.read(Block::new_512(2), &mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[..]);

        dev.unmap(Block::new_512(2), 1).await.unwrap();
        let mut buf = BytesMut::zeroed(1024);
        dev.read(Block::new_512(2), &mut buf).await.unwrap();
        assert_eq!(&buf[..512], &[0u8; 512]);
        assert_eq!(&buf[512..], &payload[512..]);

        dev.flush(Block::new_512(0), 8).await.unwrap();
        assert_eq!(
            dev.op_counts(),
            OpCounts { reads: 2, writes: 1, unmaps: 1, flushes: 1 }
        );
    }

    #[tokio::test]
    async fn bounds_are_enforced() {
        let dev = InMemoryBlockDev::new(512, 8);

        let mut buf = BytesMut::zeroed(512);
        assert_eq!(
            dev.read(Block::new_512(8), &mut buf).await.unwrap_err(),
            DoppelError::OffsetInvalid
        );
        assert_eq!(
            dev.read(Block::new_4096(0), &mut buf).await.unwrap_err(),
            DoppelError::BlockSizeMismatch
        );

        let mut buf = BytesMut::zeroed(100);
        assert_eq!(
            dev.read(Block::new_512(0), &mut buf).await.unwrap_err(),
            DoppelError::DataLenUnaligned
        );

        // rejected submissions are not counted
        assert_eq!(dev.op_counts(), OpCounts::default());
    }

    #[tokio::test]
    async fn injected_failures_latch_and_expire() {
        let dev = InMemoryBlockDev::new(512, 8);
        let mut buf = BytesMut::zeroed(512);

        dev.fail_next_reads(2);
        assert!(dev.read(Block::new_512(0), &mut buf).await.is_err());
        assert!(dev.read(Block::new_512(0), &mut buf).await.is_err());
        assert!(dev.read(Block::new_512(0), &mut buf).await.is_ok());

        dev.fail_reads(true);
        assert!(dev.read(Block::new_512(0), &mut buf).await.is_err());
        dev.fail_reads(false);
        assert!(dev.read(Block::new_512(0), &mut buf).await.is_ok());

        dev.fail_writes(true);
        let w = dev.write(Block::new_512(0), Bytes::from(vec![1; 512])).await;
        assert_eq!(
            w.unwrap_err(),
            DoppelError::IoError("injected write failure".to_string())
        );
        // the attempt was still counted
        assert_eq!(dev.op_counts().writes, 1);
    }

    #[tokio::test]
    async fn held_reads_park_until_released() {
        let dev = Arc::new(InMemoryBlockDev::new(512, 8));
        dev.hold_reads();

        let reader = {
            let dev = dev.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::zeroed(512);
                dev.read(Block::new_512(0), &mut buf).await
            })
        };

        // the read is counted on entry, then parks
        while dev.op_counts().reads == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!reader.is_finished());

        dev.release_reads();
        reader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn io_type_support_is_configurable() {
        let dev = InMemoryBlockDev::new(512, 8).without_unmap();
        assert!(dev.io_type_supported(IoType::Read));
        assert!(!dev.io_type_supported(IoType::Unmap));
        assert!(matches!(
            dev.unmap(Block::new_512(0), 1).await.unwrap_err(),
            DoppelError::Unsupported(_)
        ));

        let dev = InMemoryBlockDev::new(512, 8).without_flush();
        assert!(!dev.io_type_supported(IoType::Flush));
    }
}
