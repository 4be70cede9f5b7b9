// Copyright 2025 Oxide Computer Company
//! Transparent block-device mirroring.
//!
//! A [`Array`] replicates every write to all of its operational member
//! devices and serves every read from exactly one of them, chosen by load.
//! Member failures are absorbed until fewer than the configured minimum
//! remain.  Membership is persisted in a checksummed superblock at LBA 0
//! of every member.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

pub use doppel_common::{
    ArrayDefinition, ArrayOpts, Block, DoppelError, SlotId,
};

mod array;
mod channel;
mod in_memory;
mod job;
mod slots;
mod superblock;


pub use array::{Array, ArrayState, Health, SlotInfo};
pub use channel::ArrayChannel;
pub use in_memory::InMemoryBlockDev;
pub use job::WRITE_SUCCESS_MIN;
pub use superblock::{
    SbParse, SbSlotRecord, SbSlotState, Superblock, SuperblockError,
    SB_HEADER_SIZE, SB_MAX_LENGTH, SB_SIGNATURE, SB_SLOT_RECORD_SIZE,
    SB_VERSION_MAJOR, SB_VERSION_MINOR,
};

/// The I/O types a mirror array routes to its members.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoType {
    Read,
    Write,
    Unmap,
    Flush,
}

impl std::fmt::Display for IoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoType::Read => write!(f, "read"),
            IoType::Write => write!(f, "write"),
            IoType::Unmap => write!(f, "unmap"),
            IoType::Flush => write!(f, "flush"),
        }
    }
}

/**
 * A mirror member behaves like a physical disk: whole blocks at
 * block-aligned offsets, with no ordering contract between operations
 * that are in flight at the same time.
 *
 * Offsets at this interface are device-local and carry the device's own
 * block shift; buffer lengths determine the block count.  An
 * [`ArrayChannel`] implements this trait too, so a mirror can itself be a
 * member of a larger mirror.
 */
#[async_trait]
pub trait BlockDev: Send + Sync {
    fn dev_uuid(&self) -> Uuid;

    /// Block size in bytes.  Fixed for the life of the device.
    fn block_size(&self) -> u64;

    /// Capacity in blocks of `block_size()` bytes.
    fn block_count(&self) -> u64;

    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Fill `data` from the device, starting at `offset`.  The offset
    /// shift must match the device block size and the buffer must be a
    /// whole number of blocks.
    async fn read(
        &self,
        offset: Block,
        data: &mut BytesMut,
    ) -> Result<(), DoppelError>;

    /// Write all of `data` at `offset`, same alignment rules as `read`.
    async fn write(
        &self,
        offset: Block,
        data: Bytes,
    ) -> Result<(), DoppelError>;

    /// Deallocate a block range.  Reads of unmapped blocks return
    /// unspecified (but not stale) data.
    async fn unmap(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError>;

    /// Flush volatile state for a block range to stable storage.
    async fn flush(
        &self,
        offset: Block,
        num_blocks: u64,
    ) -> Result<(), DoppelError>;
}
