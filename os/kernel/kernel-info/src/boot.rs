//! # Platform Memory Description
//!
//! What the boot path hands to the physical page allocator: where each NUMA
//! node's memory lives and what the CPU caches look like.

use crate::memory::MAX_MEM_NODES;
use core::fmt;

/// A NUMA memory locality domain ("mnode").
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u16);

impl NodeId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mnode{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical extent of one memory node, inclusive on both ends.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemNodeConfig {
    /// Lowest frame number owned by the node.
    pub base_pfn: u64,
    /// Highest frame number owned by the node (inclusive).
    pub max_pfn: u64,
    /// Whether the node has memory at all.
    pub exists: bool,
}

impl MemNodeConfig {
    pub const ABSENT: Self = Self {
        base_pfn: 0,
        max_pfn: 0,
        exists: false,
    };

    #[must_use]
    pub const fn new(base_pfn: u64, max_pfn: u64) -> Self {
        Self {
            base_pfn,
            max_pfn,
            exists: true,
        }
    }

    /// Number of frames spanned by the node.
    #[must_use]
    pub const fn frames(&self) -> u64 {
        if self.exists {
            self.max_pfn - self.base_pfn + 1
        } else {
            0
        }
    }
}

/// Second-level cache geometry as reported by `cpuid` (or firmware).
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CacheGeometry {
    /// Total L2 size in bytes.
    pub l2_size: u64,
    /// L2 line size in bytes (power of two).
    pub l2_line_size: u32,
    /// L2 associativity; `0` means fully associative.
    pub l2_assoc: u32,
}

impl Default for CacheGeometry {
    /// 1 MiB, 16-way, 64-byte lines.
    fn default() -> Self {
        Self {
            l2_size: 1 << 20,
            l2_line_size: 64,
            l2_assoc: 16,
        }
    }
}

/// Everything the allocator needs to know about the machine at boot.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PlatformMemory {
    /// Per-node physical extents, indexed by [`NodeId`].
    pub nodes: [MemNodeConfig; MAX_MEM_NODES],
    /// L2 cache description used for page coloring.
    pub cache: CacheGeometry,
    /// Size of the logical CPU set (power of two).
    pub cpuset_size: u32,
    /// Number of hardware page levels supported (1 = base pages only).
    pub page_levels: u32,
    /// Highest frame that memory hot-add may ever introduce (`0` = no hot-add).
    pub dr_max_pfn: u64,
}

impl PlatformMemory {
    #[must_use]
    pub const fn new(cache: CacheGeometry) -> Self {
        Self {
            nodes: [MemNodeConfig::ABSENT; MAX_MEM_NODES],
            cache,
            cpuset_size: 64,
            page_levels: 2,
            dr_max_pfn: 0,
        }
    }

    /// Declares node `node` to own frames `[base_pfn, max_pfn]`.
    ///
    /// # Panics
    /// If `node` is beyond [`MAX_MEM_NODES`].
    #[must_use]
    pub const fn with_node(mut self, node: NodeId, base_pfn: u64, max_pfn: u64) -> Self {
        self.nodes[node.index()] = MemNodeConfig::new(base_pfn, max_pfn);
        self
    }

    #[must_use]
    pub const fn with_page_levels(mut self, levels: u32) -> Self {
        self.page_levels = levels;
        self
    }

    #[must_use]
    pub const fn with_cpuset_size(mut self, size: u32) -> Self {
        self.cpuset_size = size;
        self
    }

    #[must_use]
    pub const fn with_dr_max_pfn(mut self, pfn: u64) -> Self {
        self.dr_max_pfn = pfn;
        self
    }

    /// Iterates the nodes that have memory.
    pub fn present_nodes(&self) -> impl Iterator<Item = (NodeId, &MemNodeConfig)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.exists)
            .map(|(i, n)| {
                #[allow(clippy::cast_possible_truncation)]
                (NodeId::new(i as u16), n)
            })
    }

    /// Highest installed frame number (`physmax`).
    #[must_use]
    pub fn physmax(&self) -> u64 {
        self.present_nodes().map(|(_, n)| n.max_pfn).max().unwrap_or(0)
    }
}
