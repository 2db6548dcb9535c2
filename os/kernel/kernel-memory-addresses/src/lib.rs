//! # Physical Memory Address Types
//!
//! Strongly typed wrappers for the physical quantities the page-frame
//! allocator works in.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A raw 64-bit physical byte address (RAM or DMA-visible). |
//! | [`Pfn`] | A physical frame number (address >> base page shift). |
//! | [`PageSize`] | Type-level page size marker ([`Size4K`], [`Size2M`], [`Size1G`]). |
//! | [`PageLevel`] | Runtime page level ("size class") used to index per-size tables. |
//!
//! ## Page Sizes
//!
//! Three standard x86-64 page sizes are supported via marker types that
//! implement [`PageSize`]. Each marker also knows its [`PageLevel`], which is
//! what the allocator's tables are indexed by:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! assert_eq!(Size2M::LEVEL.base_frames(), 512);
//! assert_eq!(Size2M::LEVEL.pfn_shift(), 9);
//! assert_eq!(PageLevel::BASE.size(), Size4K::SIZE);
//!
//! let pfn = Pfn::new(0x2345);
//! assert_eq!(pfn.align_down(Size2M::LEVEL), Pfn::new(0x2200));
//! assert_eq!(pfn.address().as_u64(), 0x234_5000);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`,
//!   and `Hash`, making them suitable as map keys.
//! - All alignment helpers are `const fn`.
//! - [`Pfn::NONE`] is the sentinel used by intrusive frame links.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod pfn;
mod physical_address;

pub use page_size::{MAX_PAGE_LEVELS, PageLevel, PageSize, Size1G, Size2M, Size4K};
pub use pfn::Pfn;
pub use physical_address::PhysicalAddress;
