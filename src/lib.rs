//! Heap management core for a conservative, non-moving, mark-and-sweep
//! collector: the pool-and-bin allocator that underpins a managed-memory
//! runtime.
//!
//! This crate owns the hard part of such a collector: the pool/page
//! table data structure, the coexistence of small (bin-packed) and large
//! (page-spanning) allocation regimes sharing one `Pool` abstraction, the
//! attribute bitmaps, and the sweep/finalize protocol for both regimes. It
//! does **not** own root scanning, marking, the collection driver's policy
//! (when to collect, which pool to allocate from), or finalizer dispatch
//! policy; those live on the other side of the [`runtime::Runtime`] trait
//! and are the embedding collector's responsibility.

pub mod attr;
pub mod bitvector;
pub mod debug;
pub mod error;
pub mod large;
pub mod pool;
pub mod runtime;
pub mod small;

pub use attr::{Attr, BlkInfo, Segment};
pub use bitvector::BitVector;
pub use debug::DebugOptions;
pub use error::PoolInitError;
pub use large::LargeObjectPool;
pub use pool::{PageTag, Pool, PAGE_SIZE, POOL_SIZE_MIN};
pub use runtime::Runtime;
pub use small::{bin_table, Buckets, FreeList, MoreMemory, SmallObjectPool, BIN_SIZES};
