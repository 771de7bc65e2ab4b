//! Hash-Verified ROM Read-Through Cache
//!
//! Serves byte-range reads of a large read-only card image from a slow,
//! removable, unauthenticated block device, cryptographically verifying
//! every byte before it reaches the caller.
//!
//! ## Features
//!
//! - **Two-level hash hierarchy**: a resident master table (one digest per
//!   block) protects per-block sector digest tables, which protect raw
//!   sectors
//! - **Read-through caching**: verified block tables and sectors stay
//!   resident in small fixed pools and are recycled LRU
//! - **Sync or async devices**: asynchronous transfers complete through an
//!   explicit [`Completion`] handle; synchronous devices just work
//! - **Strict dependency order**: a sector is verified only against its
//!   owning block's already-verified digest table
//! - **Distinct failure taxonomy**: configuration, device I/O, and
//!   integrity failures are separate error variants
//!
//! ## Modules
//!
//! - [`descriptor`] - Root-of-trust image descriptor and geometry mapping
//! - [`device`] - Block device trait and the file-backed implementation
//! - [`digest`] - Digest primitive seam (SHA-256 stock implementation)
//! - [`layout`] - Buffer sizing and arena partitioning
//! - [`cache`] - The read orchestrator, cache pipelines, and completion
//!   handler
//! - [`error`] - Error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use romcache::{
//!     calc_buffer_length, FileDevice, RomDescriptor, RomHashCache, RomRegion, Sha256Digest,
//! };
//!
//! # fn main() -> romcache::Result<()> {
//! let descriptor = RomDescriptor {
//!     area_normal: RomRegion::new(0x8000, 4 * 1024 * 1024),
//!     area_extended: RomRegion::new(0, 0),
//!     sector_hash: RomRegion::new(0x1000, 4096 * 32),
//!     block_hash: RomRegion::new(0x0800, 4096),
//!     bytes_per_sector: 1024,
//!     sectors_per_block: 32,
//!     master_digest: None,
//! };
//!
//! let device = Arc::new(FileDevice::open("card.img")?);
//! let buffer = vec![0u8; calc_buffer_length(&descriptor)?];
//! let cache = RomHashCache::new(descriptor, buffer, device, Arc::new(Sha256Digest))?;
//!
//! let mut payload = vec![0u8; 512];
//! cache.read(0x8000 + 2050, &mut payload)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! read(offset, len)
//!   │  decompose into sectors
//!   ▼
//! ┌──────────────┐  block absent   ┌─────────────────────────────┐
//! │ sector valid?├────────────────▶│ block: claim → load → verify│
//! │  (hit: copy) │                 │   vs master hash table      │
//! └──────┬───────┘                 └──────────────┬──────────────┘
//!        │ miss                                   │ valid
//!        ▼                                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │ sector: claim → load → verify vs block's digest table → copy│
//! └─────────────────────────────────────────────────────────────┘
//!
//! device completions re-enter through Completion::complete, which moves
//! the in-flight entry from loading to loaded and wakes the reader.
//! ```

pub mod cache;
pub mod descriptor;
pub mod device;
pub mod digest;
pub mod error;
pub mod layout;
mod pool;

pub use cache::{CacheStats, Completion, RomHashCache};
pub use descriptor::{RomDescriptor, RomRegion};
pub use device::{BlockDevice, FileDevice};
pub use digest::{DigestPrimitive, Sha256Digest, DIGEST_LEN};
pub use error::{CacheError, Result, VerifyLevel};
pub use layout::{calc_buffer_length, BLOCK_SLOTS, SECTOR_SLOTS};
