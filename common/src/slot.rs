// Copyright 2025 Oxide Computer Company
use serde::{Deserialize, Serialize};

/// Fewer members than this is not a mirror.
pub const MIN_SLOTS: usize = 2;

/// Upper bound on mirror width, and on how many membership records the
/// superblock can carry.
pub const MAX_SLOTS: usize = 16;

/**
 * A stable index for a member device within one array.
 *
 * Slot ids are assigned at array start, in the order the member devices
 * were given, and never move for the lifetime of the array.
 */
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct SlotId(u8);

impl SlotId {
    pub fn new(i: u8) -> SlotId {
        assert!((i as usize) < MAX_SLOTS);
        SlotId(i)
    }

    /// All slot ids of an array with `count` members, in index order.
    pub fn iter(count: u8) -> impl Iterator<Item = SlotId> {
        assert!((count as usize) <= MAX_SLOTS);
        (0..count).map(SlotId)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/**
 * Per-slot storage, one `T` for every member of an array.
 *
 * Sized when the array starts; indexed by `SlotId`.  Indexing past the
 * array's width is a programmer error and panics.
 */
#[derive(Clone, Debug)]
pub struct SlotData<T>(Vec<T>);

impl<T> SlotData<T> {
    pub fn from_fn<F: FnMut(SlotId) -> T>(count: u8, mut f: F) -> Self {
        Self(SlotId::iter(count).map(&mut f).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.0.iter_mut()
    }

    pub fn get(&self, i: SlotId) -> Option<&T> {
        self.0.get(i.0 as usize)
    }
}

impl<T: Clone> SlotData<T> {
    pub fn new(count: u8, t: T) -> Self {
        Self::from_fn(count, |_| t.clone())
    }
}

impl<T> std::ops::Index<SlotId> for SlotData<T> {
    type Output = T;
    fn index(&self, index: SlotId) -> &Self::Output {
        &self.0[index.0 as usize]
    }
}

impl<T> std::ops::IndexMut<SlotId> for SlotData<T> {
    fn index_mut(&mut self, index: SlotId) -> &mut Self::Output {
        &mut self.0[index.0 as usize]
    }
}
