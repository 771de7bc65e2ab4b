//! Hash-verified read-through cache
//!
//! [`RomHashCache`] serves byte-range reads of a card image, verifying every
//! byte against a two-level hash hierarchy before it reaches the caller:
//!
//! - the master hash table (one digest per block) is resident, loaded once
//!   at mount from the card's master-table region;
//! - per-block sector digest tables are fetched on demand and verified
//!   against the master table;
//! - raw sectors are fetched on demand and verified against their owning
//!   block's verified table.
//!
//! A sector is never promoted to valid before its owning block is, and data
//! is never copied out of a slot that has not been verified. Device
//! transfers are serialized (the device abstraction supports one
//! outstanding request); completions arrive through [`Completion`] from
//! whatever context finished the transfer, and the reading thread parks on
//! a condvar until the entry it needs has made progress.

use crate::descriptor::RomDescriptor;
use crate::device::BlockDevice;
use crate::digest::{DigestPrimitive, DIGEST_LEN};
use crate::error::{CacheError, Result, VerifyLevel};
use crate::layout::{Layout, BLOCK_SLOTS, SECTOR_SLOTS};
use crate::pool::{self, BlockSlot, CacheSlot, SectorSlot, SlotState, INVALID_INDEX};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;

/// Running counters, in the spirit of a buffer pool's hit/miss accounting.
///
/// `hits`/`misses` count sector lookups; `device_reads` counts issued
/// transfers (block tables, sectors, and direct-path runs alike).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub device_reads: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Block,
    Sector,
}

/// The one transfer currently on the device.
#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: Kind,
    slot: usize,
}

/// A device failure parked for the reader waiting on the failed entry.
struct Failure {
    kind: Kind,
    index: u32,
    error: io::Error,
}

struct CacheState {
    blocks: Vec<BlockSlot>,
    sectors: Vec<SectorSlot>,
    master_hash: Vec<u8>,
    in_flight: Option<Pending>,
    failure: Option<Failure>,
    clock: u64,
    stats: CacheStats,
}

impl CacheState {
    fn bump(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn anything_loading(&self) -> bool {
        self.blocks.iter().any(|b| b.state == SlotState::Loading)
            || self.sectors.iter().any(|s| s.state == SlotState::Loading)
    }
}

struct Inner {
    descriptor: RomDescriptor,
    device: Arc<dyn BlockDevice>,
    digest: Arc<dyn DigestPrimitive>,
    state: Mutex<CacheState>,
    progress: Condvar,
}

/// Completion handle for asynchronous device reads.
///
/// The cache hands a clone of this to [`BlockDevice::read_async`]; the
/// device (or the host's interrupt/callback glue) calls
/// [`Completion::complete`] when the transfer finishes. The call is cheap
/// and never blocks beyond a short critical section, so it is safe from a
/// completion callback context.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub fn complete(&self, result: io::Result<Vec<u8>>) {
        self.inner.notify(result);
    }
}

/// Hash-verified read-through cache over one mounted card.
pub struct RomHashCache {
    inner: Arc<Inner>,
}

impl RomHashCache {
    /// Mounts a card: partitions the management buffer, synchronously loads
    /// the master hash table, and prepares empty block/sector pools.
    ///
    /// `buffer` must be at least [`crate::layout::calc_buffer_length`]
    /// bytes; anything less is a configuration error and the mount fails.
    pub fn new(
        descriptor: RomDescriptor,
        buffer: Vec<u8>,
        device: Arc<dyn BlockDevice>,
        digest: Arc<dyn DigestPrimitive>,
    ) -> Result<Self> {
        descriptor.validate()?;
        let layout = Layout::new(&descriptor);
        let backing = layout.partition(buffer)?;

        let mut master_hash = backing.master_hash;
        master_hash.truncate(descriptor.block_count() as usize * DIGEST_LEN);
        device.read_sync(descriptor.block_hash.offset as u64, &mut master_hash)?;
        if let Some(expected) = descriptor.master_digest {
            if digest.compute(&master_hash) != expected {
                tracing::warn!("master hash table failed verification; rejecting card");
                return Err(CacheError::IntegrityFailure {
                    level: VerifyLevel::MasterTable,
                    index: 0,
                });
            }
        }

        let bps = descriptor.bytes_per_sector as usize;
        let table_len = descriptor.sectors_per_block as usize * DIGEST_LEN;

        let mut images = backing.images;
        let mut sectors = Vec::with_capacity(SECTOR_SLOTS);
        for _ in 0..SECTOR_SLOTS {
            let rest = images.split_off(bps);
            let image = std::mem::replace(&mut images, rest);
            sectors.push(SectorSlot::new(image));
        }

        let mut hashes = backing.hashes;
        let mut blocks = Vec::with_capacity(BLOCK_SLOTS);
        for _ in 0..BLOCK_SLOTS {
            let rest = hashes.split_off(layout.hash_unit);
            let mut table = std::mem::replace(&mut hashes, rest);
            table.truncate(table_len);
            blocks.push(BlockSlot::new(table));
        }

        tracing::debug!(
            sectors = descriptor.sector_count(),
            blocks = descriptor.block_count(),
            "mounted hash-verified image"
        );

        Ok(RomHashCache {
            inner: Arc::new(Inner {
                descriptor,
                device,
                digest,
                state: Mutex::new(CacheState {
                    blocks,
                    sectors,
                    master_hash,
                    in_flight: None,
                    failure: None,
                    clock: 0,
                    stats: CacheStats::default(),
                }),
                progress: Condvar::new(),
            }),
        })
    }

    pub fn descriptor(&self) -> &RomDescriptor {
        &self.inner.descriptor
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().stats
    }

    /// A completion handle for hosts that wire device callbacks themselves.
    pub fn completion(&self) -> Completion {
        Completion {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Device-completion entry point; equivalent to
    /// [`Completion::complete`].
    pub fn notify_read_async(&self, result: io::Result<Vec<u8>>) {
        self.inner.notify(result);
    }

    /// Reads `dst.len()` verified bytes starting at card offset `offset`.
    ///
    /// Blocks until every touched sector has been fetched and verified, or
    /// until a device or integrity failure aborts the call. On error the
    /// contents of `dst` are unspecified; the call is all-or-nothing.
    pub fn read(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let length = u32::try_from(dst.len())
            .ok()
            .and_then(|len| offset.checked_add(len).map(|_| len))
            .ok_or(CacheError::OutOfRange {
                offset,
                length: u32::MAX,
            })?;
        // Both ends must land in a verified region, and the range must be
        // contiguous in the linear address space (the gap between the data
        // regions carries no hashes), before any work starts.
        let lin_start = self.inner.descriptor.linear_offset(offset)?;
        let lin_end = self
            .inner
            .descriptor
            .linear_offset(offset + length - 1)
            .map_err(|_| CacheError::OutOfRange { offset, length })?;
        if lin_end.checked_sub(lin_start) != Some(length - 1) {
            return Err(CacheError::OutOfRange { offset, length });
        }

        // A failure parked by an earlier, already-reported read must not
        // poison this one; the failed entry was discarded, so it will be
        // fetched afresh if still wanted.
        self.inner.state.lock().failure = None;

        let bps = self.inner.descriptor.bytes_per_sector;
        // Large reads bypass the sector pool for their aligned body: one
        // bulk transfer straight into the caller's buffer, verified in
        // place, so a long sequential read cannot flush the whole cache.
        if dst.len() >= bps as usize * (SECTOR_SLOTS / 2) {
            // Sector boundaries live in the linear address space; the raw
            // card offset of a region need not be sector-aligned.
            let head = ((bps - lin_start % bps) % bps) as usize;
            let body = (dst.len() - head) / bps as usize * bps as usize;
            let (head_buf, rest) = dst.split_at_mut(head);
            let (body_buf, tail_buf) = rest.split_at_mut(body);
            if !head_buf.is_empty() {
                self.read_caching(offset, head_buf)?;
            }
            if !body_buf.is_empty() {
                self.read_direct(offset + head as u32, body_buf)?;
            }
            if !tail_buf.is_empty() {
                self.read_caching(offset + (head + body) as u32, tail_buf)?;
            }
            Ok(())
        } else {
            self.read_caching(offset, dst)
        }
    }

    /// Sector-pool read path: every touched sector is cached and served
    /// from its verified slot.
    fn read_caching(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
        let inner = &self.inner;
        let bps = inner.descriptor.bytes_per_sector;
        let last_sector = inner
            .descriptor
            .linear_offset(offset + (dst.len() - 1) as u32)?
            / bps;

        let mut pos = offset;
        let mut done = 0usize;
        while done < dst.len() {
            let linear = inner.descriptor.linear_offset(pos)?;
            let sector = linear / bps;
            let sub = (linear % bps) as usize;
            let n = std::cmp::min(dst.len() - done, bps as usize - sub);

            inner.ensure_sector_valid(sector, last_sector)?;

            let mut st = inner.state.lock();
            match pool::find_in_state(&st.sectors, sector, SlotState::Valid) {
                Some(i) => {
                    let stamp = st.bump();
                    st.sectors[i].stamp = stamp;
                    dst[done..done + n].copy_from_slice(&st.sectors[i].image[sub..sub + n]);
                }
                // Evicted by a concurrent reader between verification and
                // copy; fetch it again.
                None => continue,
            }
            pos += n as u32;
            done += n;
        }
        Ok(())
    }

    /// Direct path for large aligned reads: bulk-transfer each contiguous
    /// run into `dst` with `read_sync` and verify sector by sector against
    /// the cached block tables. The sector pool is not touched.
    fn read_direct(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
        let inner = &self.inner;
        let bps = inner.descriptor.bytes_per_sector as usize;
        let spb = inner.descriptor.sectors_per_block;
        let normal_len = inner.descriptor.area_normal.length;
        let total_len = inner.descriptor.linear_size();

        debug_assert_eq!(inner.descriptor.linear_offset(offset)? % bps as u32, 0);
        debug_assert_eq!(dst.len() % bps, 0);

        let mut pos = offset;
        let mut done = 0usize;
        while done < dst.len() {
            let linear = inner.descriptor.linear_offset(pos)?;
            // Runs stay inside one region: regions are contiguous on the
            // device, but not contiguous with each other.
            let region_end = if linear < normal_len {
                normal_len
            } else {
                total_len
            };
            let run = std::cmp::min(dst.len() - done, (region_end - linear) as usize);
            let dev_offset = inner.descriptor.sector_device_offset(linear / bps as u32) as u64;

            inner.state.lock().stats.device_reads += 1;
            inner
                .device
                .read_sync(dev_offset, &mut dst[done..done + run])?;

            let mut sector = linear / bps as u32;
            let mut verified = 0usize;
            while verified < run {
                let block = sector / spb;
                let sub = (sector % spb) as usize;
                let mut want = [0u8; DIGEST_LEN];
                loop {
                    inner.ensure_block_valid(block)?;
                    let mut st = inner.state.lock();
                    if let Some(bi) = pool::find_in_state(&st.blocks, block, SlotState::Valid) {
                        let stamp = st.bump();
                        st.blocks[bi].stamp = stamp;
                        want.copy_from_slice(
                            &st.blocks[bi].hashes[sub * DIGEST_LEN..(sub + 1) * DIGEST_LEN],
                        );
                        break;
                    }
                    // Evicted before we could snapshot the digest; reload.
                }
                let image = &dst[done + verified..done + verified + bps];
                if inner.digest.compute(image) != want {
                    tracing::warn!(sector, "sector image failed verification (direct path)");
                    return Err(CacheError::IntegrityFailure {
                        level: VerifyLevel::Sector,
                        index: sector,
                    });
                }
                verified += bps;
                sector += 1;
            }
            pos += run as u32;
            done += run;
        }
        Ok(())
    }
}

impl Inner {
    /// Drives the sector load path (and its owning block's) to completion.
    ///
    /// Verification runs on this thread; the completion handler only moves
    /// entries from loading to loaded. Blocks are always processed before
    /// any sector that depends on them.
    fn ensure_sector_valid(self: &Arc<Self>, sector: u32, last_sector: u32) -> Result<()> {
        let spb = self.descriptor.sectors_per_block;
        let mut first_attempt = true;
        loop {
            let mut st = self.state.lock();

            if let Some(i) = pool::find_in_state(&st.sectors, sector, SlotState::Valid) {
                let stamp = st.bump();
                st.sectors[i].stamp = stamp;
                if first_attempt {
                    st.stats.hits += 1;
                }
                return Ok(());
            }
            if first_attempt {
                st.stats.misses += 1;
                first_attempt = false;
            }

            if let Some(err) = take_failure(&mut st, |f| match f.kind {
                Kind::Sector => f.index == sector,
                Kind::Block => f.index == sector / spb,
            }) {
                return Err(err);
            }

            // Loaded blocks verify first: sectors depend on them.
            if let Some(bi) = st
                .blocks
                .iter()
                .position(|b| b.state == SlotState::Loaded)
            {
                self.verify_block(&mut st, bi)?;
                continue;
            }
            if let Some((si, bi)) = verifiable_sector(&st, spb) {
                self.verify_sector(&mut st, si, bi)?;
                continue;
            }
            // A loaded sector of this request whose block slot was evicted
            // under pool pressure cannot verify until the block is fetched
            // again. Orphans outside the request are left alone; driving
            // them here would hand this caller failures it never asked for.
            if let Some(orphan) = st.sectors.iter().find(|s| {
                s.state == SlotState::Loaded && s.index >= sector && s.index <= last_sector
            }) {
                let block = orphan.index / spb;
                if pool::find(&st.blocks, block).is_none() {
                    queue_block(&mut st, block);
                    drop(st);
                    self.issue_next();
                    continue;
                }
            }

            // Queue what this sector needs, then read ahead for the rest of
            // the request while free slots allow.
            let block = sector / spb;
            if pool::find(&st.blocks, block).is_none() {
                queue_block(&mut st, block);
            }
            if pool::find(&st.sectors, sector).is_none() {
                let stamp = st.bump();
                if let Some(claim) = pool::claim(&mut st.sectors, sector, stamp) {
                    if claim.evicted {
                        st.stats.evictions += 1;
                    }
                }
            }
            queue_prefetch(&mut st, sector, last_sector, spb);

            if st.in_flight.is_none() && st.anything_loading() {
                drop(st);
                self.issue_next();
                continue;
            }
            if st.in_flight.is_some() {
                self.progress.wait(&mut st);
            }
        }
    }

    /// Drives the block load path to completion (direct-path reads need
    /// only the block's digest table, never a sector slot).
    fn ensure_block_valid(self: &Arc<Self>, block: u32) -> Result<()> {
        loop {
            let mut st = self.state.lock();

            if let Some(bi) = pool::find_in_state(&st.blocks, block, SlotState::Valid) {
                let stamp = st.bump();
                st.blocks[bi].stamp = stamp;
                return Ok(());
            }
            if let Some(err) =
                take_failure(&mut st, |f| f.kind == Kind::Block && f.index == block)
            {
                return Err(err);
            }
            if let Some(bi) = st
                .blocks
                .iter()
                .position(|b| b.state == SlotState::Loaded)
            {
                self.verify_block(&mut st, bi)?;
                continue;
            }
            if pool::find(&st.blocks, block).is_none() {
                queue_block(&mut st, block);
            }
            if st.in_flight.is_none() && st.anything_loading() {
                drop(st);
                self.issue_next();
                continue;
            }
            if st.in_flight.is_some() {
                self.progress.wait(&mut st);
            }
        }
    }

    /// Verifies a loaded block table against the master hash table.
    fn verify_block(&self, st: &mut CacheState, bi: usize) -> Result<()> {
        let index = st.blocks[bi].index;
        let sum = self.digest.compute(&st.blocks[bi].hashes);
        let want = &st.master_hash[index as usize * DIGEST_LEN..(index as usize + 1) * DIGEST_LEN];
        if sum[..] == *want {
            let stamp = st.bump();
            st.blocks[bi].state = SlotState::Valid;
            st.blocks[bi].stamp = stamp;
            Ok(())
        } else {
            st.blocks[bi].reset(INVALID_INDEX, SlotState::Free, 0);
            // Sectors staged under this table can never verify; free them so
            // they do not strand as orphans that re-fetch the bad table. A
            // sector still on the device is left to finish its transfer.
            let spb = self.descriptor.sectors_per_block;
            let busy = st
                .in_flight
                .filter(|p| p.kind == Kind::Sector)
                .map(|p| p.slot);
            for (si, slot) in st.sectors.iter_mut().enumerate() {
                if Some(si) != busy
                    && matches!(slot.state, SlotState::Loading | SlotState::Loaded)
                    && slot.index / spb == index
                {
                    slot.reset(INVALID_INDEX, SlotState::Free, 0);
                }
            }
            tracing::warn!(block = index, "block digest table failed verification");
            Err(CacheError::IntegrityFailure {
                level: VerifyLevel::Block,
                index,
            })
        }
    }

    /// Verifies a loaded sector against its owning block's digest table.
    /// The block slot must already be valid.
    fn verify_sector(&self, st: &mut CacheState, si: usize, bi: usize) -> Result<()> {
        let index = st.sectors[si].index;
        let sub = (index % self.descriptor.sectors_per_block) as usize;
        let sum = self.digest.compute(&st.sectors[si].image);
        let want = &st.blocks[bi].hashes[sub * DIGEST_LEN..(sub + 1) * DIGEST_LEN];
        if sum[..] == *want {
            let stamp = st.bump();
            st.sectors[si].state = SlotState::Valid;
            st.sectors[si].stamp = stamp;
            Ok(())
        } else {
            st.sectors[si].reset(INVALID_INDEX, SlotState::Free, 0);
            tracing::warn!(sector = index, "sector image failed verification");
            Err(CacheError::IntegrityFailure {
                level: VerifyLevel::Sector,
                index,
            })
        }
    }

    /// Issues the next queued transfer if the device is idle. Blocks go
    /// first (sectors cannot verify without them), FIFO within each kind.
    fn issue_next(self: &Arc<Self>) {
        let (offset, len) = {
            let mut st = self.state.lock();
            if st.in_flight.is_some() {
                return;
            }
            let next = st
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.state == SlotState::Loading)
                .min_by_key(|(_, b)| b.stamp)
                .map(|(slot, _)| Pending {
                    kind: Kind::Block,
                    slot,
                })
                .or_else(|| {
                    st.sectors
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.state == SlotState::Loading)
                        .min_by_key(|(_, s)| s.stamp)
                        .map(|(slot, _)| Pending {
                            kind: Kind::Sector,
                            slot,
                        })
                });
            let Some(pending) = next else {
                return;
            };
            st.in_flight = Some(pending);
            st.stats.device_reads += 1;
            match pending.kind {
                Kind::Block => self.descriptor.block_table_range(st.blocks[pending.slot].index),
                Kind::Sector => (
                    self.descriptor
                        .sector_device_offset(st.sectors[pending.slot].index)
                        as u64,
                    self.descriptor.bytes_per_sector as usize,
                ),
            }
        };

        let done = Completion {
            inner: Arc::clone(self),
        };
        if !self.device.read_async(offset, len, done) {
            // Device declined the asynchronous request; transfer here and
            // drive the completion path ourselves.
            let mut buf = vec![0u8; len];
            let result = self.device.read_sync(offset, &mut buf).map(|_| buf);
            self.notify(result);
        }
    }

    /// Completion handler: moves the in-flight entry from loading to loaded
    /// (or discards it on device failure), wakes the waiting reader, and
    /// issues the next queued transfer. Runs in whatever context finished
    /// the transfer and never blocks.
    fn notify(self: &Arc<Self>, result: io::Result<Vec<u8>>) {
        {
            let mut st = self.state.lock();
            let Some(pending) = st.in_flight.take() else {
                tracing::warn!("device completion with no transfer in flight");
                return;
            };
            let expected = match pending.kind {
                Kind::Block => st.blocks[pending.slot].hashes.len(),
                Kind::Sector => st.sectors[pending.slot].image.len(),
            };
            let result = result.and_then(|data| {
                if data.len() < expected {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device transfer shorter than requested",
                    ))
                } else {
                    Ok(data)
                }
            });
            match result {
                Ok(data) => match pending.kind {
                    Kind::Block => {
                        let slot = &mut st.blocks[pending.slot];
                        let n = slot.hashes.len();
                        slot.hashes.copy_from_slice(&data[..n]);
                        slot.state = SlotState::Loaded;
                    }
                    Kind::Sector => {
                        let slot = &mut st.sectors[pending.slot];
                        let n = slot.image.len();
                        slot.image.copy_from_slice(&data[..n]);
                        slot.state = SlotState::Loaded;
                    }
                },
                Err(error) => {
                    let index = match pending.kind {
                        Kind::Block => {
                            let slot = &mut st.blocks[pending.slot];
                            let index = slot.index;
                            slot.reset(INVALID_INDEX, SlotState::Free, 0);
                            index
                        }
                        Kind::Sector => {
                            let slot = &mut st.sectors[pending.slot];
                            let index = slot.index;
                            slot.reset(INVALID_INDEX, SlotState::Free, 0);
                            index
                        }
                    };
                    tracing::warn!(kind = ?pending.kind, index, %error, "device read failed");
                    st.failure = Some(Failure {
                        kind: pending.kind,
                        index,
                        error,
                    });
                }
            }
            self.progress.notify_all();
        }
        self.issue_next();
    }
}

fn take_failure(st: &mut CacheState, matches: impl Fn(&Failure) -> bool) -> Option<CacheError> {
    if st.failure.as_ref().map(&matches).unwrap_or(false) {
        let failure = st.failure.take()?;
        Some(CacheError::Io(failure.error))
    } else {
        None
    }
}

/// First loaded sector whose owning block is valid, with the block's slot.
fn verifiable_sector(st: &CacheState, spb: u32) -> Option<(usize, usize)> {
    st.sectors.iter().enumerate().find_map(|(si, s)| {
        if s.state != SlotState::Loaded {
            return None;
        }
        pool::find_in_state(&st.blocks, s.index / spb, SlotState::Valid).map(|bi| (si, bi))
    })
}

fn queue_block(st: &mut CacheState, block: u32) {
    let stamp = st.bump();
    if let Some(claim) = pool::claim(&mut st.blocks, block, stamp) {
        if claim.evicted {
            st.stats.evictions += 1;
        }
    }
}

/// Queues upcoming sectors of the request into free slots only; prefetch
/// never evicts on behalf of data nobody has consumed yet.
fn queue_prefetch(st: &mut CacheState, sector: u32, last_sector: u32, spb: u32) {
    for index in sector + 1..=last_sector {
        if pool::find(&st.sectors, index).is_some() {
            continue;
        }
        let block = index / spb;
        if pool::find(&st.blocks, block).is_none() {
            let stamp = st.bump();
            if pool::claim_free(&mut st.blocks, block, stamp).is_none() {
                break;
            }
        }
        let stamp = st.bump();
        if pool::claim_free(&mut st.sectors, index, stamp).is_none() {
            break;
        }
    }
}
