//! Memory allocator contract used when a stage builds its descriptor pool
//! or a plugin asks for working memory.

use crate::error::{LinkError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Opaque memory pool tag resolved by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u32);

impl PoolId {
    /// Shared-region pool (IPC rings)
    pub const SHARED: PoolId = PoolId(0);
    /// Local frame buffer pool
    pub const FRAME: PoolId = PoolId(1);
    /// Plugin working memory
    pub const ALGORITHM: PoolId = PoolId(2);
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool{}", self.0)
    }
}

/// A block handed out by a [`MemAllocator`]
///
/// `addr` is an opaque address in the allocator's address space. It is what
/// crosses a processor boundary; `data` is the locally visible backing store.
#[derive(Debug)]
pub struct MemBlock {
    pool: PoolId,
    addr: u64,
    data: Box<[u8]>,
}

impl MemBlock {
    /// Pool this block came from
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Opaque address, aligned as requested
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Backing bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable backing bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Allocator contract: `alloc(pool, size, align)` / `free(block)`
pub trait MemAllocator: Send + Sync {
    /// Allocate `size` bytes from `pool` at an address aligned to `align`
    fn alloc(&self, pool: PoolId, size: usize, align: usize) -> Result<MemBlock>;

    /// Return a block to the pool it came from
    fn free(&self, block: MemBlock) -> Result<()>;
}

#[derive(Debug, Default)]
struct PoolUsage {
    limit: Option<usize>,
    used: usize,
    allocs: u64,
    frees: u64,
}

/// Heap-backed allocator with optional per-pool byte limits
#[derive(Debug)]
pub struct HeapAllocator {
    pools: Mutex<HashMap<PoolId, PoolUsage>>,
    next_addr: Mutex<u64>,
}

impl HeapAllocator {
    /// Create an allocator with no limits
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            // Keep address zero out of reach so it can mean "no payload"
            next_addr: Mutex::new(0x1000),
        }
    }

    /// Cap the number of live bytes in `pool`
    pub fn with_limit(self, pool: PoolId, bytes: usize) -> Self {
        self.pools.lock().entry(pool).or_default().limit = Some(bytes);
        self
    }

    /// Live bytes in `pool`
    pub fn used(&self, pool: PoolId) -> usize {
        self.pools.lock().get(&pool).map(|p| p.used).unwrap_or(0)
    }

    /// (allocations, frees) performed on `pool`
    pub fn counts(&self, pool: PoolId) -> (u64, u64) {
        self.pools
            .lock()
            .get(&pool)
            .map(|p| (p.allocs, p.frees))
            .unwrap_or((0, 0))
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemAllocator for HeapAllocator {
    fn alloc(&self, pool: PoolId, size: usize, align: usize) -> Result<MemBlock> {
        if size == 0 {
            return Err(LinkError::invalid("allocation size must be non-zero"));
        }
        if align == 0 || !align.is_power_of_two() {
            return Err(LinkError::invalid(format!(
                "alignment {align} is not a power of two"
            )));
        }

        {
            let mut pools = self.pools.lock();
            let usage = pools.entry(pool).or_default();
            if let Some(limit) = usage.limit {
                if usage.used + size > limit {
                    return Err(LinkError::exhausted(format!(
                        "{pool}: {} of {limit} bytes in use, cannot allocate {size}",
                        usage.used
                    )));
                }
            }
            usage.used += size;
            usage.allocs += 1;
        }

        let addr = {
            let mut next = self.next_addr.lock();
            let align = align as u64;
            let addr = (*next + align - 1) & !(align - 1);
            *next = addr + size as u64;
            addr
        };

        tracing::trace!(%pool, size, addr, "alloc");
        Ok(MemBlock {
            pool,
            addr,
            data: vec![0u8; size].into_boxed_slice(),
        })
    }

    fn free(&self, block: MemBlock) -> Result<()> {
        let mut pools = self.pools.lock();
        let usage = pools
            .get_mut(&block.pool)
            .ok_or_else(|| LinkError::invalid(format!("{} was never allocated from", block.pool)))?;
        if usage.used < block.size() {
            return Err(LinkError::violation(format!(
                "{}: freeing {} bytes but only {} are live",
                block.pool,
                block.size(),
                usage.used
            )));
        }
        usage.used -= block.size();
        usage.frees += 1;
        tracing::trace!(pool = %block.pool, size = block.size(), addr = block.addr, "free");
        Ok(())
    }
}
