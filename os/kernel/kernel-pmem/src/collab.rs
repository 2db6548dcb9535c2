//! Contracts with the subsystems around the allocator.
//!
//! The allocator never owns these; the kernel wires concrete implementations
//! in through [`Collaborators`] when the allocator is built.

use core::fmt;
use core::num::NonZeroU64;
use kernel_info::boot::NodeId;
use kernel_info::memory::MAX_MEM_NODES;
use kernel_memory_addresses::Pfn;

/// Identity of an object that owns frames (a file, an anonymous segment, the
/// kernel heap).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    #[must_use]
    pub const fn new(id: u64) -> Option<Self> {
        match NonZeroU64::new(id) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// `(owner, byte offset)`: the identity a frame is indexed under.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OwnerKey {
    pub owner: OwnerId,
    pub offset: u64,
}

impl OwnerKey {
    #[must_use]
    pub const fn new(owner: OwnerId, offset: u64) -> Self {
        Self { owner, offset }
    }
}

/// Whether a request may block until it can be satisfied.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WaitPolicy {
    #[default]
    NoWait,
    Wait,
}

/// Index of owned frames by `(owner, offset)`.
pub trait OwnerIndex: Sync {
    /// Inserts `pfn` under `key`. Returns `false` if `key` is already bound.
    fn bind(&self, key: OwnerKey, pfn: Pfn) -> bool;

    /// Removes the binding of `pfn` under `key`.
    fn unbind(&self, key: OwnerKey, pfn: Pfn);

    fn lookup(&self, key: OwnerKey) -> Option<Pfn>;
}

/// Free-memory reservation (backpressure).
pub trait Admission: Sync {
    /// Reserves `count` frames. With [`WaitPolicy::Wait`] the implementation
    /// may block until memory becomes available.
    fn reserve(&self, count: u64, wait: WaitPolicy) -> bool;

    /// Returns `count` reserved frames.
    fn release(&self, count: u64);
}

/// The page-reclaim daemon. Signals are advisory.
pub trait Reclaim: Sync {
    fn wake(&self);
}

/// NUMA topology.
pub trait Locality: Sync {
    /// Nodes to search, nearest to `preferred` first. `None` means the
    /// caller has no preference.
    fn nodes_in_order(&self, preferred: Option<NodeId>) -> NodeOrder;
}

/// Bounded sleep used between attempts of a waiting request.
pub trait Delay: Sync {
    fn pause(&self, ticks: u32);
}

/// Everything the allocator calls out to.
#[derive(Copy, Clone)]
pub struct Collaborators<'env> {
    pub owners: &'env dyn OwnerIndex,
    pub admission: &'env dyn Admission,
    pub reclaim: &'env dyn Reclaim,
    pub locality: &'env dyn Locality,
    pub delay: &'env dyn Delay,
}

/// A node search order without heap allocation.
#[derive(Clone, Debug)]
pub struct NodeOrder {
    nodes: [NodeId; MAX_MEM_NODES],
    len: usize,
    pos: usize,
}

impl Default for NodeOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeOrder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: [NodeId::new(0); MAX_MEM_NODES],
            len: 0,
            pos: 0,
        }
    }

    /// Appends `node` unless it is already listed or the order is full.
    pub fn push(&mut self, node: NodeId) {
        if self.len < MAX_MEM_NODES && !self.nodes[..self.len].contains(&node) {
            self.nodes[self.len] = node;
            self.len += 1;
        }
    }
}

impl Iterator for NodeOrder {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.pos < self.len {
            self.pos += 1;
            Some(self.nodes[self.pos - 1])
        } else {
            None
        }
    }
}

/// Orders nodes by distance of their ids from the preferred node.
///
/// Stand-in for platforms without a locality-group table; ids of adjacent
/// nodes are assumed to be close. Without a preference node 0 goes first.
#[derive(Debug, Default, Copy, Clone)]
pub struct NearestFirst;

impl Locality for NearestFirst {
    fn nodes_in_order(&self, preferred: Option<NodeId>) -> NodeOrder {
        let home = preferred.map_or(0, NodeId::index);
        let mut order = NodeOrder::new();
        for distance in 0..MAX_MEM_NODES {
            for candidate in [home.checked_sub(distance), home.checked_add(distance)] {
                if let Some(i) = candidate.filter(|&i| i < MAX_MEM_NODES) {
                    #[allow(clippy::cast_possible_truncation)]
                    order.push(NodeId::new(i as u16));
                }
            }
        }
        order
    }
}
