//! # Kernel Platform Configuration
//!
//! This crate defines the boot-time description of physical memory and the
//! architectural constants that the physical page allocator is built from.
//! It is the single source of truth shared between the boot path, which
//! discovers the machine, and `kernel-pmem`, which manages its frames.
//!
//! ## Architecture
//!
//! ### Platform Description ([`boot`])
//! * **NUMA nodes**: per-node physical extents ([`MemNodeConfig`](boot::MemNodeConfig))
//! * **Cache geometry**: L2 size, associativity and line size for page coloring
//! * **Hot-add ceiling**: the highest frame memory DR may ever introduce
//!
//! ### Memory Layout ([`memory`])
//! * **Address bands**: the descending 4G / 2G / 16M / 0 table for legacy DMA
//! * **Tunable defaults**: minimum color count, lock stripes, low-memory reserves
//!
//! ```text
//! Physical Address Bands:
//! physmax    ┌─────────────────────────────────┐
//!            │        band 0 (>= 4G)           │
//! 4 GiB      ├─────────────────────────────────┤ PFN_4G
//!            │        band 1 (2G..4G)          │  32-bit DMA
//! 2 GiB      ├─────────────────────────────────┤ PFN_2G
//!            │        band 2 (16M..2G)         │
//! 16 MiB     ├─────────────────────────────────┤ PFN_16M
//!            │        band 3 (< 16M)           │  ISA DMA
//! 0          └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use kernel_info::boot::{CacheGeometry, NodeId, PlatformMemory};
//!
//! let platform = PlatformMemory::new(CacheGeometry::default())
//!     .with_node(NodeId::new(0), 0, 0x7_ffff)
//!     .with_node(NodeId::new(1), 0x8_0000, 0xf_ffff);
//! assert_eq!(platform.physmax(), 0xf_ffff);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
