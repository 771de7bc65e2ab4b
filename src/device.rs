//! Block device interface
//!
//! The cache never talks to hardware directly: it issues byte-range reads
//! through [`BlockDevice`] and receives asynchronous completions through the
//! [`Completion`] handle it passes along. At most one transfer is in flight
//! at a time; serialization is the cache's responsibility, not the device's.

use crate::cache::Completion;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A read-only block device holding the card image.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len()` bytes at `offset`, blocking until done.
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Begins an asynchronous read of `len` bytes at `offset`.
    ///
    /// On completion the device must call [`Completion::complete`] with the
    /// filled buffer (or the failure), from whatever thread finished the
    /// transfer. Returning `false` declines the request; the cache then
    /// falls back to [`BlockDevice::read_sync`] and drives the completion
    /// path itself. The default implementation declines.
    fn read_async(&self, offset: u64, len: usize, done: Completion) -> bool {
        let _ = (offset, len, done);
        false
    }
}

/// Synchronous [`BlockDevice`] over an ordinary file.
///
/// Suits hosts where the card image has been staged to a filesystem; the
/// interior mutex serializes seeks against concurrent readers.
pub struct FileDevice {
    file: Mutex<File>,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(FileDevice {
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}
