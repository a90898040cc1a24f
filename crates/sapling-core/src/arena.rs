//! Node arena: the allocator collaborator behind every finger-tree node
//!
//! The rope layer never decides where node memory physically lives. It asks a
//! [`NodeAllocator`] for a block id of a given size, holds that id for as long
//! as the node is alive, and hands it back when the node is replaced.
//!
//! [`MemArena`] is the in-process implementation: a byte budget, live-block
//! accounting and deterministic fault injection. Block ids increase
//! monotonically and are never reused, so freeing a block that a transaction
//! abort already reclaimed is detected and ignored instead of corrupting the
//! accounting of an unrelated allocation.

use std::fmt;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{SapError, SapResult};
use crate::txn::TxnState;

/// Identifier of one allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    /// Raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata of a live block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub size: u32,
}

/// Allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Blocks currently allocated
    pub live_blocks: usize,
    /// Bytes currently allocated
    pub live_bytes: u64,
    /// Successful allocations since creation
    pub total_allocated: u64,
    /// Successful frees since creation
    pub total_freed: u64,
    /// Refused allocations since creation
    pub total_failed: u64,
}

/// Allocator collaborator for variable-size node blocks.
pub trait NodeAllocator: Send {
    /// Reserve a block of `size` bytes.
    fn allocate(&mut self, size: u32) -> SapResult<BlockId>;

    /// Release a block. Returns false when the block is not live.
    fn free(&mut self, id: BlockId, size: u32) -> bool;

    /// Look up a live block.
    fn resolve(&self, id: BlockId) -> Option<BlockInfo>;

    /// Current counters.
    fn stats(&self) -> ArenaStats;

    /// Refuse one allocation after `n` more succeed. Allocators without
    /// fault injection ignore this.
    fn fail_after(&mut self, _n: u64) {}

    /// Disarm fault injection.
    fn clear_fail(&mut self) {}
}

/// In-memory allocator with a byte budget and fault injection.
pub struct MemArena {
    /// Live blocks and their sizes
    live: HashMap<BlockId, u32>,
    /// Next id to hand out
    next_id: u64,
    /// Byte budget
    limit_bytes: u64,
    /// Remaining successful allocations before one is refused
    fail_after: Option<u64>,
    stats: ArenaStats,
}

impl MemArena {
    /// Create an arena that refuses allocations past `limit_bytes`.
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            live: HashMap::new(),
            next_id: 1,
            limit_bytes,
            fail_after: None,
            stats: ArenaStats::default(),
        }
    }

    fn refuse(&mut self, requested: u32) -> SapError {
        self.stats.total_failed += 1;
        SapError::OutOfMemory {
            requested,
            live_bytes: self.stats.live_bytes,
            limit_bytes: self.limit_bytes,
        }
    }
}

impl NodeAllocator for MemArena {
    fn allocate(&mut self, size: u32) -> SapResult<BlockId> {
        if size == 0 {
            return Err(SapError::invalid("zero-sized block"));
        }

        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                return Err(self.refuse(size));
            }
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }

        if self.stats.live_bytes + size as u64 > self.limit_bytes {
            return Err(self.refuse(size));
        }

        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.live.insert(id, size);
        self.stats.live_blocks = self.live.len();
        self.stats.live_bytes += size as u64;
        self.stats.total_allocated += 1;
        Ok(id)
    }

    fn free(&mut self, id: BlockId, size: u32) -> bool {
        match self.live.get(&id) {
            Some(&live_size) if live_size == size => {
                self.live.remove(&id);
                self.stats.live_blocks = self.live.len();
                self.stats.live_bytes -= size as u64;
                self.stats.total_freed += 1;
                true
            }
            Some(&live_size) => {
                log::warn!("free of block {} with size {} but {} was allocated", id, size, live_size);
                false
            }
            None => false,
        }
    }

    fn resolve(&self, id: BlockId) -> Option<BlockInfo> {
        self.live.get(&id).map(|&size| BlockInfo { id, size })
    }

    fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// `n == 0` fails the very next allocation. The trigger disarms after it
    /// fires once.
    fn fail_after(&mut self, n: u64) {
        self.fail_after = Some(n);
    }

    fn clear_fail(&mut self) {
        self.fail_after = None;
    }
}

/// Cloneable, thread-safe handle to one allocator.
#[derive(Clone)]
pub struct SharedArena {
    inner: Arc<Mutex<Box<dyn NodeAllocator>>>,
}

impl SharedArena {
    /// Wrap an allocator.
    pub fn new<A: NodeAllocator + 'static>(allocator: A) -> Self {
        Self { inner: Arc::new(Mutex::new(Box::new(allocator))) }
    }

    pub fn allocate(&self, size: u32) -> SapResult<BlockId> {
        self.inner.lock().allocate(size)
    }

    pub fn free(&self, id: BlockId, size: u32) -> bool {
        self.inner.lock().free(id, size)
    }

    /// Free a block by id alone. Returns false when it is not live.
    pub fn reclaim(&self, id: BlockId) -> bool {
        let mut arena = self.inner.lock();
        match arena.resolve(id) {
            Some(info) => arena.free(id, info.size),
            None => false,
        }
    }

    pub fn resolve(&self, id: BlockId) -> Option<BlockInfo> {
        self.inner.lock().resolve(id)
    }

    pub fn stats(&self) -> ArenaStats {
        self.inner.lock().stats()
    }

    pub fn fail_after(&self, n: u64) {
        self.inner.lock().fail_after(n);
    }

    pub fn clear_fail(&self) {
        self.inner.lock().clear_fail();
    }

    /// True when both handles point at the same allocator.
    pub fn ptr_eq(&self, other: &SharedArena) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// RAII guard for one allocated block.
///
/// Dropping the guard returns the block to its allocator. A block already
/// reclaimed by a transaction abort is ignored by the allocator. A block
/// allocated under a transaction leaves that transaction's ledger when it is
/// freed, so short-lived nodes never reach the abort path.
pub struct Block {
    id: BlockId,
    size: u32,
    arena: SharedArena,
    owner: Option<Weak<TxnState>>,
}

impl Block {
    /// Allocate a new block from `arena`.
    pub fn allocate(arena: &SharedArena, size: u32) -> SapResult<Self> {
        let id = arena.allocate(size)?;
        Ok(Self { id, size, arena: arena.clone(), owner: None })
    }

    pub(crate) fn owned_by(mut self, owner: &Arc<TxnState>) -> Self {
        self.owner = Some(Arc::downgrade(owner));
        self
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// True while the allocator still accounts for this block.
    pub fn is_live(&self) -> bool {
        self.arena.resolve(self.id).is_some()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.arena.free(self.id, self.size) {
            if let Some(owner) = self.owner.take().and_then(|owner| owner.upgrade()) {
                owner.forget(self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut arena = MemArena::new(1024);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.stats().live_blocks, 2);
        assert_eq!(arena.stats().live_bytes, 300);

        assert!(arena.free(a, 100));
        assert_eq!(arena.stats().live_bytes, 200);
        assert!(!arena.free(a, 100)); // already freed
        assert_eq!(arena.resolve(b), Some(BlockInfo { id: b, size: 200 }));
        assert_eq!(arena.resolve(a), None);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut arena = MemArena::new(256);
        arena.allocate(200).unwrap();
        let err = arena.allocate(100).unwrap_err();
        assert!(err.is_oom());
        assert_eq!(arena.stats().total_failed, 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut arena = MemArena::new(256);
        assert!(matches!(arena.allocate(0), Err(SapError::Invalid { .. })));
    }

    #[test]
    fn test_fault_injection_fires_once() {
        let mut arena = MemArena::new(1 << 20);
        arena.fail_after(2);
        assert!(arena.allocate(8).is_ok());
        assert!(arena.allocate(8).is_ok());
        assert!(arena.allocate(8).unwrap_err().is_oom());
        assert!(arena.allocate(8).is_ok());
    }

    #[test]
    fn test_ids_never_reused() {
        let mut arena = MemArena::new(1 << 20);
        let a = arena.allocate(8).unwrap();
        arena.free(a, 8);
        let b = arena.allocate(8).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_block_guard_frees_on_drop() {
        let arena = SharedArena::new(MemArena::new(1 << 20));
        {
            let block = Block::allocate(&arena, 48).unwrap();
            assert!(block.is_live());
            assert_eq!(arena.stats().live_bytes, 48);
        }
        assert_eq!(arena.stats().live_bytes, 0);
        assert_eq!(arena.stats().total_freed, 1);
    }

    #[test]
    fn test_reclaimed_block_drop_is_ignored() {
        let arena = SharedArena::new(MemArena::new(1 << 20));
        let block = Block::allocate(&arena, 16).unwrap();
        assert!(arena.reclaim(block.id()));
        assert!(!block.is_live());
        drop(block);
        assert_eq!(arena.stats().total_freed, 1);
    }
}
