// Copyright 2025 Oxide Computer Company
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DoppelError;
use crate::slot::{MAX_SLOTS, MIN_SLOTS};

/*
 * Where the unit is blocks, not bytes, make sure to reflect that in the
 * types used.
 *
 * Blocks have a shift field so that the caller and the array agree on what
 * a block is.  It wouldn't make sense to pass Block { 2, 9 } when the array
 * expects Block { 2, 12 }.  Sub-I/O issued to a mirror member carries that
 * member's own shift.
 */
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct Block {
    // Value could mean a size or offset
    pub value: u64,

    // block size as a power of 2
    // shift  9 -> 512
    // shift 12 -> 4096
    pub shift: u32,
}

pub const MIN_SHIFT: u32 = 9;
pub const MAX_SHIFT: u32 = 15;

pub const MIN_BLOCK_SIZE: usize = (1 << MIN_SHIFT) as usize;
pub const MAX_BLOCK_SIZE: usize = (1 << MAX_SHIFT) as usize;

/// Longest array name that still fits the superblock's fixed name field
/// with a terminating NUL.
pub const MAX_NAME_LEN: usize = 31;

impl Block {
    pub fn new(value: u64, shift: u32) -> Block {
        // are you sure you need blocks that small?
        // are you sure you need blocks that big?
        assert!((MIN_SHIFT..=MAX_SHIFT).contains(&shift));

        Block { value, shift }
    }

    pub fn new_512(value: u64) -> Block {
        Block::new(value, 9)
    }

    pub fn new_4096(value: u64) -> Block {
        Block::new(value, 12)
    }

    pub fn new_with_def(value: u64, def: &ArrayDefinition) -> Block {
        Block {
            value,
            shift: def.block_size().trailing_zeros(),
        }
    }

    /**
     * Create a block count from a byte length using the array definition
     * to determine the block size.  This routine will panic if the byte
     * length is not a whole number of blocks.
     */
    pub fn from_bytes(bytelen: usize, def: &ArrayDefinition) -> Block {
        assert!(Self::is_valid_byte_size(bytelen, def));
        Block {
            value: (bytelen as u64) / def.block_size(),
            shift: def.block_size().trailing_zeros(),
        }
    }

    pub fn is_valid_byte_size(bytelen: usize, def: &ArrayDefinition) -> bool {
        bytelen % (def.block_size() as usize) == 0
    }

    pub fn block_size_in_bytes(&self) -> u32 {
        1 << self.shift
    }

    pub fn byte_value(&self) -> u64 {
        self.value * self.block_size_in_bytes() as u64
    }

    /**
     * The size of this block value in bytes, for use in indexing into
     * buffers.
     */
    pub fn bytes(&self) -> usize {
        (self.value as usize) * (self.block_size_in_bytes() as usize)
    }

    /**
     * If this block value is an offset, advance that offset by another
     * block value representing a length.  Both block values must have
     * the same block size or this routine will panic.
     */
    pub fn advance(&mut self, offset: Block) {
        assert_eq!(offset.shift, self.shift);
        self.value = self.value.checked_add(offset.value).unwrap();
    }
}

/**
 * Caller-provided configuration for a mirror array, validated before any
 * geometry is computed.
 */
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ArrayOpts {
    /**
     * Array name, recorded in the superblock.  Non-empty, at most
     * MAX_NAME_LEN bytes, no NUL.
     */
    pub name: String,

    /**
     * UUID for this array.
     */
    pub uuid: Uuid,

    /**
     * The size of each array block in bytes.  Must be a power of 2,
     * minimum 512.  Every member device's block size must divide this
     * evenly.
     */
    pub block_size: u64,

    /**
     * The array moves to its fatal failed state when fewer than this many
     * mirrors remain operational.
     */
    pub min_operational: u8,

    /**
     * Reserve a metadata region on every member and persist the
     * membership superblock there.
     */
    pub write_superblock: bool,
}

impl ArrayOpts {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("array name must not be empty");
        }

        if self.name.len() > MAX_NAME_LEN {
            bail!(
                "array name is {} bytes, maximum is {}",
                self.name.len(),
                MAX_NAME_LEN
            );
        }

        if self.name.contains('\0') {
            bail!("array name must not contain NUL");
        }

        if self.uuid.is_nil() {
            bail!("array uuid must be set");
        }

        if !self.block_size.is_power_of_two() {
            bail!("block size must be a power of two, not {}", self.block_size);
        }

        if self.block_size < (MIN_BLOCK_SIZE as u64) {
            bail!(
                "minimum block size is {} bytes, not {}",
                MIN_BLOCK_SIZE,
                self.block_size
            );
        }

        if self.block_size > (MAX_BLOCK_SIZE as u64) {
            bail!(
                "maximum block size is {} bytes, not {}",
                MAX_BLOCK_SIZE,
                self.block_size
            );
        }

        if self.min_operational < 1 {
            bail!("at least one mirror must be required operational");
        }

        Ok(())
    }
}

impl Default for ArrayOpts {
    fn default() -> Self {
        assert_eq!(MIN_BLOCK_SIZE, 512);
        ArrayOpts {
            name: "doppel".to_string(),
            uuid: Uuid::nil(),
            block_size: MIN_BLOCK_SIZE as u64,
            min_operational: 1,
            write_superblock: false,
        }
    }
}

/**
 * The computed geometry of a running array: what the options asked for
 * plus what the member devices could actually provide.
 */
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ArrayDefinition {
    /**
     * The size of each array block in bytes.
     */
    block_size: u64,

    /**
     * Usable array blocks: the smallest usable span across all members.
     */
    block_count: u64,

    /**
     * How many mirror slots this array was assembled with.
     */
    slot_count: u8,

    /**
     * Fatal-failure threshold, from the options.
     */
    min_operational: u8,

    /**
     * UUID for this array.
     */
    uuid: Uuid,

    /**
     * Array name, from the options.
     */
    name: String,
}

impl ArrayDefinition {
    pub fn from_options(
        opts: &ArrayOpts,
        slot_count: u8,
        block_count: u64,
    ) -> Result<Self> {
        opts.validate()?;

        if (slot_count as usize) < MIN_SLOTS {
            bail!("a mirror takes at least {} members", MIN_SLOTS);
        }
        if (slot_count as usize) > MAX_SLOTS {
            bail!(
                "{} members is more than the maximum of {}",
                slot_count,
                MAX_SLOTS
            );
        }
        if opts.min_operational > slot_count {
            bail!(
                "cannot require {} operational mirrors of {} members",
                opts.min_operational,
                slot_count
            );
        }
        if block_count == 0 {
            bail!("members leave no usable blocks");
        }

        Ok(ArrayDefinition {
            block_size: opts.block_size,
            block_count,
            slot_count,
            min_operational: opts.min_operational,
            uuid: opts.uuid,
            name: opts.name.clone(),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn shift(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn slot_count(&self) -> u8 {
        self.slot_count
    }

    pub fn min_operational(&self) -> u8 {
        self.min_operational
    }

    pub fn total_size(&self) -> u64 {
        self.block_size * self.block_count
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /*
     * Validate an IO would fit inside this array
     */
    pub fn validate_io(
        &self,
        offset: Block,
        length: usize,
    ) -> Result<(), DoppelError> {
        if offset.shift != self.shift() {
            return Err(DoppelError::BlockSizeMismatch);
        }

        if length % (self.block_size as usize) != 0 {
            return Err(DoppelError::DataLenUnaligned);
        }

        let final_offset = offset.byte_value() + length as u64;

        if final_offset > self.total_size() {
            return Err(DoppelError::OffsetInvalid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_opts() -> ArrayOpts {
        let mut opts = ArrayOpts::default();
        opts.name = "test".to_string();
        opts.uuid = Uuid::new_v4();
        opts
    }

    #[test]
    fn test_basic_definition() {
        let opts = test_opts();
        let def = ArrayDefinition::from_options(&opts, 3, 4).unwrap();

        assert_eq!(def.block_size(), 512);
        assert_eq!(def.shift(), 9);
        assert_eq!(def.block_count(), 4);
        assert_eq!(def.slot_count(), 3);
        assert_eq!(def.min_operational(), 1);
        assert_eq!(def.total_size(), 2048);
        assert_eq!(def.name(), "test");
    }

    #[test]
    fn test_opts_validate() {
        let mut opts = test_opts();
        opts.block_size = 513;
        assert!(opts.validate().is_err());

        let mut opts = test_opts();
        opts.block_size = 256;
        assert!(opts.validate().is_err());

        let mut opts = test_opts();
        opts.block_size = 65536;
        assert!(opts.validate().is_err());

        let mut opts = test_opts();
        opts.name = String::new();
        assert!(opts.validate().is_err());

        let mut opts = test_opts();
        opts.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(opts.validate().is_err());

        let mut opts = test_opts();
        opts.uuid = Uuid::nil();
        assert!(opts.validate().is_err());

        let mut opts = test_opts();
        opts.min_operational = 0;
        assert!(opts.validate().is_err());

        assert!(test_opts().validate().is_ok());
    }

    #[test]
    fn test_definition_bounds() {
        let opts = test_opts();

        // one member is not a mirror
        assert!(ArrayDefinition::from_options(&opts, 1, 4).is_err());

        // more members than slots exist
        assert!(ArrayDefinition::from_options(&opts, 17, 4).is_err());

        // cannot demand more operational members than exist
        let mut opts = test_opts();
        opts.min_operational = 4;
        assert!(ArrayDefinition::from_options(&opts, 3, 4).is_err());

        // members must leave usable space
        assert!(ArrayDefinition::from_options(&test_opts(), 2, 0).is_err());
    }

    #[test]
    fn test_validate_io() {
        /*
         * This is our array, 4 blocks:
         *   |---|---|---|---|
         * So, we test various IO sizes to verify how each pass/fail
         */
        let def = ArrayDefinition::from_options(&test_opts(), 2, 4).unwrap();

        /*
         *   Array  |---|---|---|---|
         *   IO     |---|
         */
        assert_eq!(def.validate_io(Block::new(0, 9), 512), Ok(()));

        /*
         *   Array  |---|---|---|---|
         *   IO                 |---|
         */
        assert_eq!(def.validate_io(Block::new(3, 9), 512), Ok(()));

        /*
         *   Array  |---|---|---|---|
         *   IO                     |---|
         */
        assert!(def.validate_io(Block::new(4, 9), 512).is_err());

        /*
         *   Array  |---|---|---|---|
         *   IO         |---|---|---|
         */
        assert_eq!(def.validate_io(Block::new(1, 9), 1536), Ok(()));

        /*
         *   Array  |---|---|---|---|
         *   IO             |---|---|---|
         */
        assert!(def.validate_io(Block::new(2, 9), 1536).is_err());

        /*
         *   Array  |---|---|---|---|
         *   IO     |---|---|---|---|
         */
        assert_eq!(def.validate_io(Block::new(0, 9), 2048), Ok(()));

        // wrong shift for this array
        assert_eq!(
            def.validate_io(Block::new(0, 12), 4096),
            Err(DoppelError::BlockSizeMismatch)
        );

        // ragged length
        assert_eq!(
            def.validate_io(Block::new(0, 9), 100),
            Err(DoppelError::DataLenUnaligned)
        );
    }

    #[test]
    fn test_block_helpers() {
        let def = ArrayDefinition::from_options(&test_opts(), 2, 100).unwrap();

        let b = Block::from_bytes(2048, &def);
        assert_eq!(b.value, 4);
        assert_eq!(b.block_size_in_bytes(), 512);
        assert_eq!(b.byte_value(), 2048);
        assert_eq!(b.bytes(), 2048);

        let mut off = Block::new_with_def(1, &def);
        off.advance(b);
        assert_eq!(off.value, 5);
    }
}
