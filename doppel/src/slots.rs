// Copyright 2025 Oxide Computer Company
//! Runtime registry of the array's member devices.
//!
//! Each member occupies exactly one slot, assigned at assembly in device
//! order and never renumbered.  The `failed` and `attached` flags here are
//! the only mutable per-member state and both move in one direction while
//! the array runs: a slot can be marked failed or detached, never the
//! reverse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::BlockDev;
use doppel_common::{Block, SlotData, SlotId};

/// Placement of one member's data region, computed at assembly.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SlotGeometry {
    /// First device block of the data region.
    pub data_offset: u64,

    /// Usable device blocks past `data_offset`.
    pub data_size: u64,

    /// Device blocks per array block.
    pub block_scale: u64,
}

/// One mirror member and its live status flags.
pub(crate) struct BaseSlot {
    id: SlotId,
    dev: Arc<dyn BlockDev>,
    dev_uuid: Uuid,
    geometry: SlotGeometry,

    /// Device blocks are 1 << shift bytes.
    shift: u32,

    /*
     * Both flags are monotonic for the life of the array.  Marking a slot
     * failed keeps the device handle open; dropping the handle is the
     * lifecycle controller's job, not the I/O path's.
     */
    failed: AtomicBool,
    attached: AtomicBool,
}

impl BaseSlot {
    fn new(id: SlotId, dev: Arc<dyn BlockDev>, geometry: SlotGeometry) -> Self {
        let dev_uuid = dev.dev_uuid();
        let shift = dev.block_size().trailing_zeros();
        BaseSlot {
            id,
            dev,
            dev_uuid,
            geometry,
            shift,
            failed: AtomicBool::new(false),
            attached: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn dev(&self) -> &Arc<dyn BlockDev> {
        &self.dev
    }

    pub fn dev_uuid(&self) -> Uuid {
        self.dev_uuid
    }

    pub fn data_offset(&self) -> u64 {
        self.geometry.data_offset
    }

    pub fn data_size(&self) -> u64 {
        self.geometry.data_size
    }

    pub fn block_scale(&self) -> u64 {
        self.geometry.block_scale
    }

    /// Device block size as a shift.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// A slot takes new I/O only while attached and not failed.
    pub fn operational(&self) -> bool {
        self.attached() && !self.failed()
    }

    /// Mark the slot failed.  Returns true only for the call that actually
    /// performed the transition, so the caller can log and re-evaluate the
    /// array constraint exactly once.
    pub fn fail(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }

    /// Mark the slot detached (device pulled).  Implies failed; same
    /// first-transition return contract as `fail`.
    pub fn detach(&self) -> bool {
        self.attached.swap(false, Ordering::SeqCst)
    }

    /// Map an array-block offset onto this member's device blocks.  The
    /// byte count of any transfer is unchanged; only the address scales.
    pub fn map_offset(&self, offset: Block) -> Block {
        Block::new(
            self.geometry.data_offset
                + offset.value * self.geometry.block_scale,
            self.shift,
        )
    }
}

/// All slots of one array, fixed at assembly.
pub(crate) struct SlotSet(SlotData<BaseSlot>);

impl SlotSet {
    pub fn new(
        devices: Vec<Arc<dyn BlockDev>>,
        geometry: &[SlotGeometry],
    ) -> Self {
        assert_eq!(devices.len(), geometry.len());
        SlotSet(SlotData::from_fn(devices.len() as u8, |id| {
            let i = id.get() as usize;
            BaseSlot::new(id, Arc::clone(&devices[i]), geometry[i])
        }))
    }

    pub fn get(&self, id: SlotId) -> Option<&BaseSlot> {
        self.0.get(id)
    }

    /// Like `get`, for slot ids known to come from this set.
    pub fn slot(&self, id: SlotId) -> &BaseSlot {
        &self.0[id]
    }

    /// Members in slot-index order.
    pub fn iter(&self) -> impl Iterator<Item = &BaseSlot> {
        self.0.iter()
    }

    pub fn slot_count(&self) -> u8 {
        self.0.len() as u8
    }

    pub fn count_operational(&self) -> u8 {
        self.iter().filter(|s| s.operational()).count() as u8
    }

    pub fn slot_operational(&self, id: SlotId) -> bool {
        self.get(id).map(|s| s.operational()).unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::InMemoryBlockDev;

    fn test_set() -> SlotSet {
        let devices: Vec<Arc<dyn BlockDev>> = (0..3)
            .map(|_| {
                Arc::new(InMemoryBlockDev::new(512, 1024))
                    as Arc<dyn BlockDev>
            })
            .collect();
        let geometry = vec![
            SlotGeometry { data_offset: 8, data_size: 1016, block_scale: 1 };
            3
        ];
        SlotSet::new(devices, &geometry)
    }

    #[test]
    fn flags_are_monotonic() {
        let set = test_set();
        let s = set.slot(SlotId::new(1));

        assert!(s.operational());
        assert!(s.fail());
        assert!(!s.fail());
        assert!(s.failed());
        assert!(!s.operational());

        // detach is independent of failed and also one-way
        assert!(s.attached());
        assert!(s.detach());
        assert!(!s.detach());
        assert!(!s.attached());
    }

    #[test]
    fn operational_counting() {
        let set = test_set();
        assert_eq!(set.count_operational(), 3);

        set.slot(SlotId::new(0)).fail();
        assert_eq!(set.count_operational(), 2);
        assert!(!set.slot_operational(SlotId::new(0)));
        assert!(set.slot_operational(SlotId::new(2)));

        // ids past the set resolve to nothing
        assert!(set.get(SlotId::new(9)).is_none());
        assert!(!set.slot_operational(SlotId::new(9)));
    }

    #[test]
    fn offset_mapping_scales_and_shifts() {
        let dev_a = Arc::new(InMemoryBlockDev::new(512, 4096));
        let dev_b = Arc::new(InMemoryBlockDev::new(2048, 1024));
        let devices: Vec<Arc<dyn BlockDev>> = vec![dev_a, dev_b];
        // array block size 4096: scale 8 on the 512 member, 2 on the other
        let geometry = vec![
            SlotGeometry { data_offset: 8, data_size: 4088, block_scale: 8 },
            SlotGeometry { data_offset: 2, data_size: 1022, block_scale: 2 },
        ];
        let set = SlotSet::new(devices, &geometry);

        let mapped = set.slot(SlotId::new(0)).map_offset(Block::new(3, 12));
        assert_eq!(mapped.value, 8 + 3 * 8);
        assert_eq!(mapped.shift, 9);

        let mapped = set.slot(SlotId::new(1)).map_offset(Block::new(3, 12));
        assert_eq!(mapped.value, 2 + 3 * 2);
        assert_eq!(mapped.shift, 11);

        // the same byte address on both members
        assert_eq!(
            set.slot(SlotId::new(0)).map_offset(Block::new(3, 12)).byte_value(),
            set.slot(SlotId::new(1)).map_offset(Block::new(3, 12)).byte_value(),
        );
    }
}
