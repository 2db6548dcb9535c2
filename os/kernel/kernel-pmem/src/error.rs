use kernel_info::boot::NodeId;

/// Recoverable allocator failures.
///
/// Caller bugs (binding a frame twice, freeing a frame that is still listed,
/// removing a NUMA range) are not represented here; they panic.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmemError {
    /// No frame currently satisfies the request. Retrying later may succeed.
    #[error("no free frame satisfies the request")]
    Exhausted,
    /// The backpressure subsystem declined the reservation.
    #[error("admission denied for {count} frames")]
    AdmissionDenied { count: u64 },
    /// The DMA window is empty (`lo > hi`).
    #[error("invalid DMA window {lo:#x}..={hi:#x}")]
    InvalidDmaWindow { lo: u64, hi: u64 },
    /// Only page-granular alignment can be guaranteed.
    #[error("unsupported DMA alignment {align:#x}")]
    UnsupportedAlignment { align: u64 },
    /// A DMA attribute with a scatter/gather limit of zero.
    #[error("scatter/gather list length must be at least 1")]
    InvalidScatterGather,
    #[error("request for zero pages")]
    ZeroPageCount,
    #[error("unknown memory node {0:?}")]
    UnknownNode(NodeId),
    #[error("no free range table slot")]
    RangeTableFull,
    #[error("no free frame segment slot")]
    MemsegTableFull,
    /// A hot-added extent is empty, overlaps installed memory or another node.
    #[error("invalid memory extent")]
    InvalidExtent,
}

pub type Result<T> = core::result::Result<T, PmemError>;

/// Rejected allocator configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("minimum color count must be a non-zero power of two, got {0}")]
    MinColors(u32),
    #[error("color equivalence must be zero or a power of two, got {0}")]
    ColorEquiv(u32),
    #[error("lock stripe count must be a non-zero power of two, got {0}")]
    LockStripes(usize),
    #[error("L2 line size must be a power of two, got {0}")]
    LineSize(u32),
    #[error("L2 cache of {0} bytes is not larger than a page")]
    CacheSize(u64),
    #[error("CPU set size must be a non-zero power of two, got {0}")]
    CpuSetSize(u32),
    #[error("unsupported number of page levels: {0}")]
    PageLevels(u32),
    #[error("no memory node is present")]
    NoMemory,
    #[error("frame 0 is not covered by any memory node")]
    NoLowMemory,
    #[error("memory node {0:?} has an inverted extent")]
    InvertedExtent(NodeId),
    #[error("memory nodes {0:?} and {1:?} overlap")]
    OverlappingNodes(NodeId, NodeId),
    #[error("frame segment capacity {0} is below the number of present nodes")]
    MemsegCapacity(usize),
}
