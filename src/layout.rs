//! Layout planner
//!
//! Derives, from the image descriptor, the memory needed for all cache
//! bookkeeping: the resident master hash table, the sector image pool, the
//! block digest staging pool, and the slot bookkeeping for both pools. The
//! host hands the cache one flat buffer of at least
//! [`calc_buffer_length`] bytes; [`Layout::partition`] carves it into the
//! typed backing stores with the bounds checked exactly once.

use crate::descriptor::RomDescriptor;
use crate::digest::DIGEST_LEN;
use crate::error::{CacheError, Result};
use crate::pool::{BlockSlot, SectorSlot};

/// Block pool capacity. Concurrent accesses rarely span more than a couple
/// of blocks, so the working set is deliberately tiny.
pub const BLOCK_SLOTS: usize = 4;

/// Sector pool capacity: one block's worth of sectors on a typical card,
/// which keeps a sequential reader from thrashing, plus the implicit slack
/// of block boundaries rarely aligning with request boundaries.
pub const SECTOR_SLOTS: usize = 32;

/// Carving granularity for the flat buffer.
const ALIGN: usize = 32;

fn round_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Computed sizes of the five backing allocations.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Resident master hash table (one digest per block, both regions).
    pub master_len: usize,
    /// Raw sector byte storage, one sector per pool slot.
    pub images_len: usize,
    /// Per-slot staging unit for one block's sector digest table.
    pub hash_unit: usize,
    /// Digest staging storage across the whole block pool.
    pub hashes_len: usize,
    /// Slot bookkeeping overhead for both pools.
    pub meta_len: usize,
}

impl Layout {
    pub fn new(descriptor: &RomDescriptor) -> Self {
        let blocks = descriptor.block_count() as usize;
        let spb = descriptor.sectors_per_block as usize;
        let bps = descriptor.bytes_per_sector as usize;

        let master_len = round_up(blocks * DIGEST_LEN);
        let images_len = round_up(bps * SECTOR_SLOTS);
        let hash_unit = round_up(spb * DIGEST_LEN);
        let hashes_len = hash_unit * BLOCK_SLOTS;
        let meta_len = round_up(std::mem::size_of::<SectorSlot>() * SECTOR_SLOTS)
            + round_up(std::mem::size_of::<BlockSlot>() * BLOCK_SLOTS);

        Layout {
            master_len,
            images_len,
            hash_unit,
            hashes_len,
            meta_len,
        }
    }

    /// Total buffer length the host must provide.
    pub fn total(&self) -> usize {
        self.master_len + self.images_len + self.hashes_len + self.meta_len
    }

    /// Splits the host buffer into the three byte backing stores.
    ///
    /// An undersized buffer is a configuration error, not a runtime
    /// condition to recover from.
    pub fn partition(&self, buffer: Vec<u8>) -> Result<Backing> {
        if buffer.len() < self.total() {
            return Err(CacheError::BufferTooSmall {
                required: self.total(),
                provided: buffer.len(),
            });
        }
        let mut master_hash = buffer;
        let mut images = master_hash.split_off(self.master_len);
        let mut hashes = images.split_off(self.images_len);
        hashes.truncate(self.hashes_len);
        Ok(Backing {
            master_hash,
            images,
            hashes,
        })
    }
}

/// The byte backing stores carved out of the host buffer.
#[derive(Debug)]
pub struct Backing {
    pub master_hash: Vec<u8>,
    pub images: Vec<u8>,
    pub hashes: Vec<u8>,
}

/// Buffer size required to mount a card with the given descriptor.
pub fn calc_buffer_length(descriptor: &RomDescriptor) -> Result<usize> {
    descriptor.validate()?;
    Ok(Layout::new(descriptor).total())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::RomRegion;

    fn descriptor() -> RomDescriptor {
        RomDescriptor {
            area_normal: RomRegion::new(0x4000, 64 * 1024),
            area_extended: RomRegion::new(0, 0),
            sector_hash: RomRegion::new(0x1000, 64 * DIGEST_LEN as u32),
            block_hash: RomRegion::new(0x800, 2 * DIGEST_LEN as u32),
            bytes_per_sector: 1024,
            sectors_per_block: 32,
            master_digest: None,
        }
    }

    #[test]
    fn sizes_are_aligned_and_accounted() {
        let layout = Layout::new(&descriptor());
        assert_eq!(layout.master_len % ALIGN, 0);
        assert_eq!(layout.images_len, 32 * 1024);
        assert_eq!(layout.hash_unit, 32 * DIGEST_LEN);
        assert_eq!(layout.hashes_len, layout.hash_unit * BLOCK_SLOTS);
        assert_eq!(
            layout.total(),
            layout.master_len + layout.images_len + layout.hashes_len + layout.meta_len
        );
    }

    #[test]
    fn calc_buffer_length_validates_first() {
        let mut bad = descriptor();
        bad.sectors_per_block = 0;
        assert!(matches!(
            calc_buffer_length(&bad),
            Err(CacheError::InvalidDescriptor(_))
        ));
        assert!(calc_buffer_length(&descriptor()).unwrap() > 0);
    }

    #[test]
    fn partition_splits_exact_sizes() {
        let layout = Layout::new(&descriptor());
        let backing = layout.partition(vec![0u8; layout.total()]).unwrap();
        assert_eq!(backing.master_hash.len(), layout.master_len);
        assert_eq!(backing.images.len(), layout.images_len);
        assert_eq!(backing.hashes.len(), layout.hashes_len);
    }

    #[test]
    fn partition_rejects_undersized_buffer() {
        let layout = Layout::new(&descriptor());
        let err = layout.partition(vec![0u8; layout.total() - 1]).unwrap_err();
        assert!(matches!(err, CacheError::BufferTooSmall { .. }));
    }
}
