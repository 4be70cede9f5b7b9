// Copyright 2025 Oxide Computer Company
//! On-disk membership record, written at LBA 0 of every member device.
//!
//! The record is little-endian throughout and carries its own length and a
//! CRC32C over exactly that many bytes (the crc field itself is zeroed for
//! the computation).  Layout:
//!
//! ```text
//! offset len  field
//! 0      8    signature, fixed ASCII "DOPPELSB"
//! 8      2    version.major        (supported: 1)
//! 10     2    version.minor        (informational)
//! 12     4    length               (total record bytes, incl. header)
//! 16     4    crc                  (CRC32C, crc field zeroed)
//! 20     4    flags
//! 24     16   array uuid
//! 40     32   name (NUL-padded UTF-8)
//! 72     8    array block count
//! 80     4    array block size (bytes)
//! 84     4    reserved
//! 88     8    sequence number
//! 96     1    member count
//! 97     31   reserved
//! 128    48*n member records
//! ```
//!
//! A record may span more than one device block.  [`Superblock::parse`]
//! reports that case as the distinguished (non-error) [`SbParse::NeedMoreData`]
//! so a caller holding a single block can re-read with the full length, and
//! [`Superblock::load`] does exactly that: never more than two physical reads.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::BlockDev;
use doppel_common::{
    Block, DoppelError, SlotId, MAX_NAME_LEN, MAX_SHIFT, MAX_SLOTS, MIN_SHIFT,
};

pub const SB_SIGNATURE: [u8; 8] = *b"DOPPELSB";
pub const SB_VERSION_MAJOR: u16 = 1;
pub const SB_VERSION_MINOR: u16 = 0;

/// Header bytes before the first member record.
pub const SB_HEADER_SIZE: usize = 128;

/// Bytes per member record.
pub const SB_SLOT_RECORD_SIZE: usize = 48;

/// Hard ceiling on the record, and the size of the region reserved for it
/// at the front of every member device.
pub const SB_MAX_LENGTH: usize = 4096;

const SB_CRC_OFFSET: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum SuperblockError {
    #[error("superblock signature does not match")]
    InvalidSignature,

    #[error("superblock version {major}.{minor} is not supported")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error(
        "superblock checksum mismatch: stored {stored:#010x}, \
         computed {computed:#010x}"
    )]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("superblock is corrupt: {0}")]
    Corrupt(String),

    #[error("superblock I/O failed: {0}")]
    Io(#[from] DoppelError),
}

/// On-disk state of one member, as recorded at the last superblock write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SbSlotState {
    Operational,
    Failed,
    Missing,
}

impl SbSlotState {
    fn to_wire(self) -> u32 {
        match self {
            SbSlotState::Operational => 0,
            SbSlotState::Failed => 1,
            SbSlotState::Missing => 2,
        }
    }

    fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(SbSlotState::Operational),
            1 => Some(SbSlotState::Failed),
            2 => Some(SbSlotState::Missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for SbSlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SbSlotState::Operational => write!(f, "operational"),
            SbSlotState::Failed => write!(f, "failed"),
            SbSlotState::Missing => write!(f, "missing"),
        }
    }
}

/// One member record of the superblock.
#[derive(Clone, Debug, PartialEq)]
pub struct SbSlotRecord {
    pub uuid: Uuid,

    /// First device block of the member's data region.
    pub data_offset: u64,

    /// Usable device blocks past `data_offset`.
    pub data_size: u64,

    pub state: SbSlotState,
    pub slot: SlotId,
}

/// The in-memory superblock; see the module docs for the byte layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Superblock {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub uuid: Uuid,
    pub name: String,
    pub array_block_count: u64,
    pub block_size: u32,
    pub seq_number: u64,
    pub slots: Vec<SbSlotRecord>,
}

/// Outcome of [`Superblock::parse`] on a buffer that passed validation.
#[derive(Debug, PartialEq)]
pub enum SbParse {
    Complete(Superblock),

    /// The buffer holds a valid header but the record continues past it.
    /// Not an error: re-read with at least `length` bytes and parse again.
    NeedMoreData { length: usize },
}

/**
 * Recompute the record's CRC32C in place.  `record` must be sliced to
 * exactly the record's declared length; the crc field is zeroed for the
 * computation and then overwritten with the result.
 */
pub fn update_crc(record: &mut [u8]) {
    record[SB_CRC_OFFSET..SB_CRC_OFFSET + 4].fill(0);
    let crc = crc32c::crc32c(record);
    record[SB_CRC_OFFSET..SB_CRC_OFFSET + 4]
        .copy_from_slice(&crc.to_le_bytes());
}

/// CRC32C over the full record with the stored crc treated as zero.
fn compute_crc(record: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&record[..SB_CRC_OFFSET]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &record[SB_CRC_OFFSET + 4..])
}

impl Superblock {
    /// Serialized size in bytes.
    pub fn length(&self) -> usize {
        SB_HEADER_SIZE + SB_SLOT_RECORD_SIZE * self.slots.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        assert!(self.name.len() <= MAX_NAME_LEN);
        assert!(self.slots.len() <= MAX_SLOTS);
        let length = self.length();
        assert!(length <= SB_MAX_LENGTH);

        let mut buf = vec![0u8; length];
        buf[0..8].copy_from_slice(&SB_SIGNATURE);
        buf[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        buf[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        buf[12..16].copy_from_slice(&(length as u32).to_le_bytes());
        // crc (16..20) is computed last, over the finished record
        buf[20..24].copy_from_slice(&self.flags.to_le_bytes());
        buf[24..40].copy_from_slice(self.uuid.as_bytes());
        buf[40..40 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[72..80].copy_from_slice(&self.array_block_count.to_le_bytes());
        buf[80..84].copy_from_slice(&self.block_size.to_le_bytes());
        buf[88..96].copy_from_slice(&self.seq_number.to_le_bytes());
        buf[96] = self.slots.len() as u8;

        for (i, rec) in self.slots.iter().enumerate() {
            let base = SB_HEADER_SIZE + i * SB_SLOT_RECORD_SIZE;
            buf[base..base + 16].copy_from_slice(rec.uuid.as_bytes());
            buf[base + 16..base + 24]
                .copy_from_slice(&rec.data_offset.to_le_bytes());
            buf[base + 24..base + 32]
                .copy_from_slice(&rec.data_size.to_le_bytes());
            buf[base + 32..base + 36]
                .copy_from_slice(&rec.state.to_wire().to_le_bytes());
            buf[base + 36] = rec.slot.get();
        }

        update_crc(&mut buf);
        buf
    }

    /// Serialize and zero-pad up to a whole number of device blocks, ready
    /// to be written at LBA 0.
    pub fn padded(&self, block_size: u64) -> Bytes {
        let mut buf = self.serialize();
        let padded = (buf.len() as u64).div_ceil(block_size) * block_size;
        buf.resize(padded as usize, 0);
        Bytes::from(buf)
    }

    /**
     * Validate and decode a record from `buf`, which may hold more bytes
     * than the record (device-block padding) or fewer (a record that spans
     * blocks; reported as `NeedMoreData`).
     */
    pub fn parse(buf: &[u8]) -> Result<SbParse, SuperblockError> {
        if buf.len() < 8 {
            return Err(SuperblockError::Corrupt(
                "buffer is shorter than the signature".to_string(),
            ));
        }
        if buf[0..8] != SB_SIGNATURE {
            return Err(SuperblockError::InvalidSignature);
        }
        if buf.len() < SB_CRC_OFFSET {
            return Err(SuperblockError::Corrupt(
                "header is truncated".to_string(),
            ));
        }

        let version_major = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let version_minor =
            u16::from_le_bytes(buf[10..12].try_into().unwrap());
        if version_major != SB_VERSION_MAJOR {
            return Err(SuperblockError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        let length =
            u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        if !(SB_HEADER_SIZE..=SB_MAX_LENGTH).contains(&length) {
            return Err(SuperblockError::Corrupt(format!(
                "implausible record length {}",
                length
            )));
        }
        if length > buf.len() {
            return Ok(SbParse::NeedMoreData { length });
        }

        let record = &buf[..length];
        let stored =
            u32::from_le_bytes(record[16..20].try_into().unwrap());
        let computed = compute_crc(record);
        if stored != computed {
            return Err(SuperblockError::ChecksumMismatch { stored, computed });
        }

        /*
         * The checksum held, so structural problems from here on mean the
         * record was written wrong, not damaged in flight.
         */
        let base_count = record[96] as usize;
        if base_count == 0 || base_count > MAX_SLOTS {
            return Err(SuperblockError::Corrupt(format!(
                "implausible member count {}",
                base_count
            )));
        }
        if SB_HEADER_SIZE + base_count * SB_SLOT_RECORD_SIZE > length {
            return Err(SuperblockError::Corrupt(format!(
                "length {} cannot hold {} member records",
                length, base_count
            )));
        }

        let name_field = &record[40..72];
        let nul = name_field.iter().position(|&b| b == 0).ok_or_else(|| {
            SuperblockError::Corrupt(
                "name field is not NUL-terminated".to_string(),
            )
        })?;
        let name = std::str::from_utf8(&name_field[..nul])
            .map_err(|_| {
                SuperblockError::Corrupt("name is not UTF-8".to_string())
            })?
            .to_string();

        let mut slots = Vec::with_capacity(base_count);
        let mut seen: u16 = 0;
        for i in 0..base_count {
            let base = SB_HEADER_SIZE + i * SB_SLOT_RECORD_SIZE;
            let rec = &record[base..base + SB_SLOT_RECORD_SIZE];

            let state_raw =
                u32::from_le_bytes(rec[32..36].try_into().unwrap());
            let state = SbSlotState::from_wire(state_raw).ok_or_else(|| {
                SuperblockError::Corrupt(format!(
                    "record {} has unknown state {}",
                    i, state_raw
                ))
            })?;
            let slot = rec[36];
            if slot as usize >= base_count {
                return Err(SuperblockError::Corrupt(format!(
                    "record {} names slot {} of {}",
                    i, slot, base_count
                )));
            }
            if seen & (1 << slot) != 0 {
                return Err(SuperblockError::Corrupt(format!(
                    "slot {} appears twice",
                    slot
                )));
            }
            seen |= 1 << slot;

            slots.push(SbSlotRecord {
                uuid: Uuid::from_bytes(rec[0..16].try_into().unwrap()),
                data_offset: u64::from_le_bytes(
                    rec[16..24].try_into().unwrap(),
                ),
                data_size: u64::from_le_bytes(rec[24..32].try_into().unwrap()),
                state,
                slot: SlotId::new(slot),
            });
        }

        Ok(SbParse::Complete(Superblock {
            version_major,
            version_minor,
            flags: u32::from_le_bytes(record[20..24].try_into().unwrap()),
            uuid: Uuid::from_bytes(record[24..40].try_into().unwrap()),
            name,
            array_block_count: u64::from_le_bytes(
                record[72..80].try_into().unwrap(),
            ),
            block_size: u32::from_le_bytes(record[80..84].try_into().unwrap()),
            seq_number: u64::from_le_bytes(record[88..96].try_into().unwrap()),
            slots,
        }))
    }

    /**
     * Read the superblock from a device: one block at LBA 0, then, only if
     * the record declares itself longer than that, a single follow-up read
     * of the full declared length.  Never more than two physical reads.
     */
    pub async fn load(dev: &dyn BlockDev) -> Result<Superblock, SuperblockError> {
        let bs = dev.block_size();
        let shift = bs.trailing_zeros();
        if !bs.is_power_of_two() || !(MIN_SHIFT..=MAX_SHIFT).contains(&shift)
        {
            return Err(SuperblockError::Io(DoppelError::BlockSizeMismatch));
        }

        let mut buf = BytesMut::zeroed(bs as usize);
        dev.read(Block::new(0, shift), &mut buf).await?;
        let length = match Superblock::parse(&buf)? {
            SbParse::Complete(sb) => return Ok(sb),
            SbParse::NeedMoreData { length } => length,
        };

        let blocks = (length as u64).div_ceil(bs);
        let mut buf = BytesMut::zeroed((blocks * bs) as usize);
        dev.read(Block::new(0, shift), &mut buf).await?;
        match Superblock::parse(&buf)? {
            SbParse::Complete(sb) => Ok(sb),
            SbParse::NeedMoreData { .. } => Err(SuperblockError::Corrupt(
                "record length changed between reads".to_string(),
            )),
        }
    }
}
