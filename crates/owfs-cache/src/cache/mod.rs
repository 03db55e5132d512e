//! Page cache for paged 1-Wire memory.
//!
//! The cache is the single point of access to device pages for one device
//! group:
//!
//! - **Read caching**: a page read once is served from memory until it is
//!   invalidated
//! - **CRC framing**: every packet carries a CRC16 seeded with its page
//!   number
//! - **Write buffering**: writes go to a write log and reach the device only
//!   on `sync()`
//! - **Write-once support**: pages that cannot be rewritten in place are
//!   relocated and the old page redirected; the device bitmap is diffed and
//!   written back
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        PageCache                          │
//! │  ┌────────────────┐  ┌────────────────┐  ┌─────────────┐  │
//! │  │ PageDescriptor │  │    WriteLog    │  │DeviceBitmap │  │
//! │  │ arena, 1/page  │  │ newest..oldest │  │ (write-once)│  │
//! │  └────────────────┘  └────────────────┘  └─────────────┘  │
//! │                           │                               │
//! │                           ▼                               │
//! │        BankSlot[]: banks of every device, in order        │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod bitmap;
mod error;
mod page;
mod page_cache;
mod write_log;

pub use error::{CacheError, CacheResult};
pub use page::PageState;
pub use page_cache::PageCache;
