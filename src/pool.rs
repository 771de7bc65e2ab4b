//! Fixed-capacity cache entry pools
//!
//! Both caches are arrays of slots tagged with an explicit lifecycle state
//! instead of intrusive linked lists: `Free` slots hold nothing, `Loading`
//! slots have a device transfer queued or in flight, `Loaded` slots hold
//! transferred but unverified bytes, and `Valid` slots hold verified data.
//! Replacement is least-recently-used among `Valid` entries via a monotonic
//! touch stamp; transitional entries are never reclaimed.

use crate::error::VerifyLevel;

/// Index value marking a slot that represents nothing.
pub(crate) const INVALID_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Loading,
    Loaded,
    Valid,
}

/// One block cache entry: the staging and post-verification storage for a
/// block's per-sector digest table.
#[derive(Debug)]
pub(crate) struct BlockSlot {
    pub index: u32,
    pub state: SlotState,
    pub stamp: u64,
    pub hashes: Vec<u8>,
}

/// One sector cache entry: a sector's raw image bytes.
#[derive(Debug)]
pub(crate) struct SectorSlot {
    pub index: u32,
    pub state: SlotState,
    pub stamp: u64,
    pub image: Vec<u8>,
}

/// Common slot view used by the generic pool operations.
pub(crate) trait CacheSlot {
    const LEVEL: VerifyLevel;

    fn index(&self) -> u32;
    fn state(&self) -> SlotState;
    fn stamp(&self) -> u64;
    fn reset(&mut self, index: u32, state: SlotState, stamp: u64);
}

impl BlockSlot {
    pub(crate) fn new(hashes: Vec<u8>) -> Self {
        BlockSlot {
            index: INVALID_INDEX,
            state: SlotState::Free,
            stamp: 0,
            hashes,
        }
    }
}

impl SectorSlot {
    pub(crate) fn new(image: Vec<u8>) -> Self {
        SectorSlot {
            index: INVALID_INDEX,
            state: SlotState::Free,
            stamp: 0,
            image,
        }
    }
}

impl CacheSlot for BlockSlot {
    const LEVEL: VerifyLevel = VerifyLevel::Block;

    fn index(&self) -> u32 {
        self.index
    }
    fn state(&self) -> SlotState {
        self.state
    }
    fn stamp(&self) -> u64 {
        self.stamp
    }
    fn reset(&mut self, index: u32, state: SlotState, stamp: u64) {
        self.index = index;
        self.state = state;
        self.stamp = stamp;
    }
}

impl CacheSlot for SectorSlot {
    const LEVEL: VerifyLevel = VerifyLevel::Sector;

    fn index(&self) -> u32 {
        self.index
    }
    fn state(&self) -> SlotState {
        self.state
    }
    fn stamp(&self) -> u64 {
        self.stamp
    }
    fn reset(&mut self, index: u32, state: SlotState, stamp: u64) {
        self.index = index;
        self.state = state;
        self.stamp = stamp;
    }
}

/// Finds the slot currently representing `index`, in any non-free state.
///
/// At most one slot may represent a given index at a time; the claim path
/// checks with this before taking a new slot.
pub(crate) fn find<S: CacheSlot>(slots: &[S], index: u32) -> Option<usize> {
    slots
        .iter()
        .position(|s| s.state() != SlotState::Free && s.index() == index)
}

pub(crate) fn find_in_state<S: CacheSlot>(
    slots: &[S],
    index: u32,
    state: SlotState,
) -> Option<usize> {
    slots
        .iter()
        .position(|s| s.state() == state && s.index() == index)
}

/// Outcome of claiming a slot for a new index.
pub(crate) struct Claim {
    pub slot: usize,
    pub evicted: bool,
}

/// Claims a slot for `index`, preferring free slots and otherwise evicting
/// the least-recently-touched valid entry. Returns `None` when every slot
/// is in a transitional state (the caller must let in-flight work drain).
///
/// The claimed slot is marked `Loading`; the caller fills in the transfer
/// bookkeeping.
pub(crate) fn claim<S: CacheSlot>(slots: &mut [S], index: u32, stamp: u64) -> Option<Claim> {
    debug_assert!(find(slots, index).is_none(), "duplicate claim for index");

    if let Some(slot) = slots.iter().position(|s| s.state() == SlotState::Free) {
        slots[slot].reset(index, SlotState::Loading, stamp);
        return Some(Claim {
            slot,
            evicted: false,
        });
    }
    let victim = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.state() == SlotState::Valid)
        .min_by_key(|(_, s)| s.stamp())
        .map(|(i, _)| i)?;
    tracing::debug!(
        level = %S::LEVEL,
        old_index = slots[victim].index(),
        new_index = index,
        "evicting cache entry"
    );
    slots[victim].reset(index, SlotState::Loading, stamp);
    Some(Claim {
        slot: victim,
        evicted: true,
    })
}

/// Claims a free slot only; used by the prefetch path, which must not evict
/// entries on behalf of sectors nobody has asked for yet.
pub(crate) fn claim_free<S: CacheSlot>(slots: &mut [S], index: u32, stamp: u64) -> Option<usize> {
    if find(slots, index).is_some() {
        return None;
    }
    let slot = slots.iter().position(|s| s.state() == SlotState::Free)?;
    slots[slot].reset(index, SlotState::Loading, stamp);
    Some(slot)
}
