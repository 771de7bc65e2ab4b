//! Shared fixtures: card image builder, instrumented devices, and an
//! instrumented digest primitive.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use romcache::{
    calc_buffer_length, BlockDevice, Completion, DigestPrimitive, RomDescriptor, RomHashCache,
    RomRegion, Sha256Digest, DIGEST_LEN,
};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A fully built card: device byte space plus the matching descriptor and
/// the reference data/tables used to assert against.
pub struct TestCard {
    pub descriptor: RomDescriptor,
    pub device_bytes: Vec<u8>,
    /// Reference image in linear (verified address space) order.
    pub data: Vec<u8>,
    /// One per-sector digest table per block, `spb * DIGEST_LEN` each.
    pub tables: Vec<Vec<u8>>,
}

impl TestCard {
    /// Lays out `[master | tables | normal data | gap | extended data]`.
    pub fn build(bps: u32, spb: u32, normal_sectors: u32, extended_sectors: u32) -> Self {
        let digest = Sha256Digest;
        let sectors = normal_sectors + extended_sectors;
        let mut rng = StdRng::seed_from_u64(u64::from(sectors) << 20 | u64::from(bps));
        let data: Vec<u8> = (0..(sectors * bps) as usize).map(|_| rng.gen()).collect();

        let blocks = sectors.div_ceil(spb);
        let table_len = spb as usize * DIGEST_LEN;
        let mut tables = vec![vec![0u8; table_len]; blocks as usize];
        for sector in 0..sectors as usize {
            let image = &data[sector * bps as usize..(sector + 1) * bps as usize];
            let sum = digest.compute(image);
            let slot = sector % spb as usize;
            tables[sector / spb as usize][slot * DIGEST_LEN..(slot + 1) * DIGEST_LEN]
                .copy_from_slice(&sum);
        }
        let mut master = Vec::with_capacity(blocks as usize * DIGEST_LEN);
        for table in &tables {
            master.extend_from_slice(&digest.compute(table));
        }

        let block_hash = RomRegion::new(0, master.len() as u32);
        let sector_hash = RomRegion::new(block_hash.end(), (blocks as usize * table_len) as u32);
        let area_normal = RomRegion::new(sector_hash.end(), normal_sectors * bps);
        // Leave an unverified gap before the extended region, like the real
        // card layout does.
        let gap = 4096;
        let area_extended = if extended_sectors > 0 {
            RomRegion::new(area_normal.end() + gap, extended_sectors * bps)
        } else {
            RomRegion::new(0, 0)
        };

        let mut device_bytes = Vec::new();
        device_bytes.extend_from_slice(&master);
        for table in &tables {
            device_bytes.extend_from_slice(table);
        }
        device_bytes.extend_from_slice(&data[..(normal_sectors * bps) as usize]);
        if extended_sectors > 0 {
            device_bytes.resize(area_extended.offset as usize, 0xEE);
            device_bytes.extend_from_slice(&data[(normal_sectors * bps) as usize..]);
        }

        TestCard {
            descriptor: RomDescriptor {
                area_normal,
                area_extended,
                sector_hash,
                block_hash,
                bytes_per_sector: bps,
                sectors_per_block: spb,
                master_digest: None,
            },
            device_bytes,
            data,
            tables,
        }
    }

    pub fn base(&self) -> u32 {
        self.descriptor.area_normal.offset
    }

    /// Reference bytes for a card-offset range inside the normal region.
    pub fn expect(&self, offset: u32, len: usize) -> &[u8] {
        let linear = (offset - self.base()) as usize;
        &self.data[linear..linear + len]
    }

    /// Flips one byte of a stored sector image on the device, after the
    /// digest tables were built.
    pub fn tamper_sector(&mut self, sector: u32) {
        let offset = self.descriptor.sector_device_offset(sector) as usize;
        self.device_bytes[offset + 11] ^= 0x40;
    }

    /// Corrupts one block's stored digest table on the device.
    pub fn tamper_block_table(&mut self, block: u32) {
        let (offset, _) = self.descriptor.block_table_range(block);
        self.device_bytes[offset as usize] ^= 0x01;
    }

    pub fn mount(&self) -> (RomHashCache, Arc<MemDevice>) {
        self.mount_with(Arc::new(Sha256Digest))
    }

    pub fn mount_with(
        &self,
        digest: Arc<dyn DigestPrimitive>,
    ) -> (RomHashCache, Arc<MemDevice>) {
        let device = Arc::new(MemDevice::new(self.device_bytes.clone()));
        let buffer = vec![0u8; calc_buffer_length(&self.descriptor).unwrap()];
        let cache = RomHashCache::new(
            self.descriptor.clone(),
            buffer,
            Arc::clone(&device) as Arc<dyn BlockDevice>,
            digest,
        )
        .unwrap();
        device.log.lock().clear();
        device.reads.store(0, Ordering::SeqCst);
        (cache, device)
    }
}

/// In-memory synchronous device recording every transfer.
pub struct MemDevice {
    pub data: Vec<u8>,
    pub reads: AtomicU64,
    /// (offset, length) of each read, in issue order.
    pub log: Mutex<Vec<(u64, usize)>>,
}

impl MemDevice {
    pub fn new(data: Vec<u8>) -> Self {
        MemDevice {
            data,
            reads: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push((offset, buf.len()));
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past device end",
            ));
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }
}

/// Asynchronous device: each transfer completes from a spawned thread,
/// exercising the completion handoff across a real context boundary.
pub struct ThreadedDevice {
    inner: Arc<MemDevice>,
    pub async_reads: AtomicU64,
}

impl ThreadedDevice {
    pub fn new(data: Vec<u8>) -> Self {
        ThreadedDevice {
            inner: Arc::new(MemDevice::new(data)),
            async_reads: AtomicU64::new(0),
        }
    }
}

impl BlockDevice for ThreadedDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_sync(offset, buf)
    }

    fn read_async(&self, offset: u64, len: usize, done: Completion) -> bool {
        self.async_reads.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(1));
            let mut buf = vec![0u8; len];
            let result = inner.read_sync(offset, &mut buf).map(|_| buf);
            done.complete(result);
        });
        true
    }
}

/// Digest primitive that records every input it was asked to hash, so
/// tests can assert verification order.
pub struct RecordingDigest {
    pub inputs: Mutex<Vec<Vec<u8>>>,
}

impl RecordingDigest {
    pub fn new() -> Self {
        RecordingDigest {
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Position of the first recorded input equal to `needle`.
    pub fn position_of(&self, needle: &[u8]) -> Option<usize> {
        self.inputs.lock().iter().position(|i| i == needle)
    }
}

impl DigestPrimitive for RecordingDigest {
    fn compute(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        self.inputs.lock().push(data.to_vec());
        Sha256Digest.compute(data)
    }
}
