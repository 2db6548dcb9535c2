//! # Physical Page-Frame Allocator
//!
//! Hands out physical pages for a NUMA machine whose memory nodes may sit
//! anywhere in the physical address space, and whose devices may only reach
//! part of it.
//!
//! ## What you get
//! - A [`PageAllocator`] built once from the boot-time
//!   [`PlatformMemory`](kernel_info::boot::PlatformMemory).
//! - Single pages of any supported size ([`PageAllocator::alloc_page`]),
//!   a named frame ([`PageAllocator::alloc_specific`]) and owner-bound I/O
//!   pages honoring [`DmaAttr`] constraints ([`PageAllocator::create_io`]).
//! - Memory hot-add ([`PageAllocator::add_memory`]).
//!
//! ## Layout
//!
//! ```text
//!  PlatformMemory ─► RangeTable ──────┐  (node, band) entries, highest first
//!                    ColoringScheme ──┤  cache colors per page level
//!                    FrameTable ──────┤  one Frame per installed pfn
//!                                     ▼
//!                                 ListStore
//!                       free bins  (node, band, level, color)
//!                       cache bins (node, band, color)
//!                                     │
//!           alloc_page ◄──────────────┼──────────► find_any / get_contig
//!           alloc_specific                         create_io
//! ```
//!
//! Physical memory is cut into *bands* at 16 MiB, 2 GiB and 4 GiB. Each
//! node's extent is split at those boundaries into range entries, and every
//! entry owns its own set of bins. General allocations avoid the low bands
//! while they run short; DMA requests search only the entries their window
//! reaches.
//!
//! ## Locking
//!
//! Frames carry a shared/exclusive spin lock; bins are guarded by striped
//! spin locks. A thread holding a bin lock only ever try-locks frames, so
//! the order *frame, then bin* cannot deadlock. All searches that come back
//! with a frame return it exclusively locked.
//!
//! The allocator calls out to the rest of the kernel through the traits in
//! [`collab`]: the owner index, admission control, the reclaim daemon, NUMA
//! locality and a sleep primitive.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod allocator;
pub mod collab;
mod color;
mod config;
mod contig;
mod create;
mod dma;
mod error;
mod frame;
mod lists;
mod policy;
mod range;

pub use allocator::PageAllocator;
pub use collab::{Collaborators, OwnerId, OwnerKey, WaitPolicy};
pub use color::{ColorWalk, ColoringScheme, LevelGeometry};
pub use config::PmemConfig;
pub use contig::ContigCursor;
pub use create::{Contiguity, CreateRequest};
pub use dma::{DmaAttr, pages_for};
pub use error::{ConfigError, PmemError, Result};
pub use frame::{Frame, FrameInfo, FrameSegment, FrameState, FrameTable};
pub use lists::{BinKey, FreeCounters, ListEnd, ListKind, ListStore, Tables};
pub use policy::{RangePolicy, Urgency};
pub use range::{RangeEntry, RangeIter, RangeTable, first_band, ranges_for_node};
