//! Root-of-trust image descriptor
//!
//! The descriptor is read out of the card's authenticated header at mount
//! time and fixes the geometry of the hash hierarchy: where the two data
//! regions live, where the on-card digest tables live, and how the image is
//! cut into sectors and blocks. The bit layout of the card header itself is
//! owned by the platform; hosts populate this struct from the documented
//! header fields (or from configuration, via serde).

use crate::digest::DIGEST_LEN;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};

/// A contiguous byte range within the card's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomRegion {
    pub offset: u32,
    pub length: u32,
}

impl RomRegion {
    pub fn new(offset: u32, length: u32) -> Self {
        RomRegion { offset, length }
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset - self.offset < self.length
    }

    fn overlaps(&self, other: &RomRegion) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset < other.end()
            && other.offset < self.end()
    }
}

/// Geometry of a hash-protected card image.
///
/// The two data regions are verified as one linear address space: the
/// extended region is appended directly after the normal region, with no
/// padding, when sector and block indices are assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RomDescriptor {
    /// First (always present) data region.
    pub area_normal: RomRegion,
    /// Second data region; may be empty on cards without one.
    pub area_extended: RomRegion,
    /// On-card per-sector digest tables, one table per block.
    pub sector_hash: RomRegion,
    /// On-card master hash table, one digest per block.
    pub block_hash: RomRegion,
    /// Size of one sector, in bytes.
    pub bytes_per_sector: u32,
    /// Number of consecutive sectors protected by one master-table digest.
    pub sectors_per_block: u32,
    /// Expected digest of the master hash table itself. `None` means the
    /// table is trusted transitively through the platform's boot-time
    /// authentication of the card and is not re-checked at mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_digest: Option<[u8; DIGEST_LEN]>,
}

impl RomDescriptor {
    /// Total verified image size: both data regions linked end to end.
    pub fn linear_size(&self) -> u32 {
        self.area_normal.length + self.area_extended.length
    }

    /// Number of sectors across both regions.
    pub fn sector_count(&self) -> u32 {
        self.linear_size() / self.bytes_per_sector
    }

    /// Number of blocks across both regions (last block may be partial).
    pub fn block_count(&self) -> u32 {
        self.sector_count().div_ceil(self.sectors_per_block)
    }

    /// Checks the descriptor for internal consistency.
    ///
    /// A failure here is a configuration error: the mount should be aborted
    /// rather than attempted in a degraded mode.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(CacheError::InvalidDescriptor(msg));

        if self.bytes_per_sector == 0 {
            return fail("bytes_per_sector is zero".into());
        }
        if self.sectors_per_block == 0 {
            return fail("sectors_per_block is zero".into());
        }
        for (name, region) in [
            ("normal", &self.area_normal),
            ("extended", &self.area_extended),
            ("sector-hash", &self.sector_hash),
            ("master-hash", &self.block_hash),
        ] {
            if region.offset.checked_add(region.length).is_none() {
                return fail(format!("{name} region overflows the address space"));
            }
        }
        for (name, region) in [
            ("normal", &self.area_normal),
            ("extended", &self.area_extended),
        ] {
            if region.length % self.bytes_per_sector != 0 {
                return fail(format!("{name} region is not sector-aligned"));
            }
        }
        if self.area_normal.is_empty() {
            return fail("normal region is empty".into());
        }
        if self.area_normal.overlaps(&self.area_extended) {
            return fail("normal and extended regions overlap".into());
        }

        let blocks = self.block_count() as usize;
        let table_bytes = blocks
            .checked_mul(self.sectors_per_block as usize)
            .and_then(|n| n.checked_mul(DIGEST_LEN));
        match table_bytes {
            Some(n) if n <= self.sector_hash.length as usize => {}
            _ => return fail("sector-hash region too small for derived block count".into()),
        }
        if blocks * DIGEST_LEN > self.block_hash.length as usize {
            return fail("master-hash region too small for derived block count".into());
        }
        Ok(())
    }

    /// Maps a card offset into the linear verified address space.
    ///
    /// The normal region maps to `[0, normal.length)` and the extended
    /// region directly after it. Offsets outside both regions cannot be
    /// served safely (there is no hash covering them).
    pub fn linear_offset(&self, offset: u32) -> Result<u32> {
        if self.area_normal.contains(offset) {
            return Ok(offset - self.area_normal.offset);
        }
        if self.area_extended.contains(offset) {
            return Ok(self.area_normal.length + (offset - self.area_extended.offset));
        }
        Err(CacheError::OutOfRange { offset, length: 1 })
    }

    /// Sector index owning the given card offset.
    pub fn sector_index(&self, offset: u32) -> Result<u32> {
        Ok(self.linear_offset(offset)? / self.bytes_per_sector)
    }

    /// Device byte offset of the start of a sector.
    pub fn sector_device_offset(&self, sector: u32) -> u32 {
        let linear = sector * self.bytes_per_sector;
        if linear < self.area_normal.length {
            self.area_normal.offset + linear
        } else {
            self.area_extended.offset + (linear - self.area_normal.length)
        }
    }

    /// Device byte range of one block's per-sector digest table.
    pub fn block_table_range(&self, block: u32) -> (u64, usize) {
        let table_len = self.sectors_per_block as usize * DIGEST_LEN;
        let offset = self.sector_hash.offset as u64 + block as u64 * table_len as u64;
        (offset, table_len)
    }
}
