//! Environment and transaction lifecycle
//!
//! An [`Env`] binds one allocator to one [`Config`]. Every mutating rope
//! operation runs under a [`Txn`] begun from that environment.
//!
//! **Ledger**: each transaction records the id of every block allocated
//! through it that is still live. A block freed before the transaction ends
//! leaves the ledger again. `commit` makes the remaining blocks permanent (or
//! hands them to the parent transaction when nested); `abort` reclaims them.
//!
//! **Shadows**: a structure about to change under a transaction parks its
//! current value with it through [`Txn::shadow`]. Once the transaction is
//! durable the parked values are dropped, releasing whatever only they still
//! referenced. After an abort they stay with their owners, which put them
//! back.
//!
//! **Tokens**: structures keep the [`TxnToken`] of each transaction they
//! changed under, and read the outcome from it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::arena::{ArenaStats, Block, BlockId, MemArena, NodeAllocator, SharedArena};
use crate::config::Config;
use crate::error::{SapError, SapResult};

/// Shared environment: one allocator plus configuration.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    arena: SharedArena,
    config: Config,
    next_txn_id: AtomicU64,
}

impl Env {
    /// Create an environment backed by a [`MemArena`] sized from `config`.
    pub fn new(config: Config) -> SapResult<Self> {
        config.validate().map_err(SapError::invalid)?;
        let arena = MemArena::new(config.arena_max_bytes);
        Ok(Self::with_allocator(config, arena))
    }

    /// Create an environment over a caller-supplied allocator.
    pub fn with_allocator<A: NodeAllocator + 'static>(config: Config, allocator: A) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                arena: SharedArena::new(allocator),
                config,
                next_txn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn arena(&self) -> &SharedArena {
        &self.inner.arena
    }

    /// Allocator counters.
    pub fn stats(&self) -> ArenaStats {
        self.inner.arena.stats()
    }

    /// Allocate a block outside any transaction. It is never reclaimed by an
    /// abort and lives until the guard is dropped.
    pub fn alloc_block(&self, size: u32) -> SapResult<Block> {
        Block::allocate(&self.inner.arena, size)
    }

    /// Begin a top-level transaction.
    pub fn begin(&self) -> Txn {
        Txn::start(self.clone(), None)
    }

    /// True when both handles refer to the same environment.
    pub fn same(&self, other: &Env) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Env {
    fn default() -> Self {
        let config = Config::default();
        let arena = MemArena::new(config.arena_max_bytes);
        Self::with_allocator(config, arena)
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("stats", &self.stats()).finish()
    }
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

impl TxnStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TxnStatus::Active,
            1 => TxnStatus::Committed,
            _ => TxnStatus::Aborted,
        }
    }
}

/// A parked value the transaction can drop once it is durable.
trait Retire: Send + Sync {
    fn retire(&self);
}

impl<T: Send> Retire for Mutex<Option<T>> {
    fn retire(&self) {
        let value = self.lock().take();
        drop(value);
    }
}

/// Value parked with a transaction until its outcome is known.
///
/// Dropped by the transaction when it becomes durable; kept for the owner
/// after an abort.
pub struct Shadow<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Clone> Shadow<T> {
    /// The parked value, or `None` once the transaction made it obsolete.
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Clone for Shadow<T> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

pub(crate) struct TxnState {
    id: u64,
    status: AtomicU8,
    parent: Option<Arc<TxnState>>,
    /// Live blocks allocated by this transaction and its committed children
    ledger: Mutex<HashSet<BlockId>>,
    /// Values to drop once the transaction is durable
    parked: Mutex<Vec<Arc<dyn Retire>>>,
}

impl TxnState {
    fn status(&self) -> TxnStatus {
        TxnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: TxnStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Drop a freed block from the ledger holding it: this transaction's, or
    /// an ancestor's after a nested commit.
    pub(crate) fn forget(&self, id: BlockId) {
        let mut cur = Some(self);
        while let Some(state) = cur {
            if state.status() == TxnStatus::Aborted || state.ledger.lock().remove(&id) {
                return;
            }
            cur = state.parent.as_deref();
        }
    }
}

/// Observer of one transaction's outcome.
#[derive(Clone)]
pub struct TxnToken {
    state: Arc<TxnState>,
}

impl TxnToken {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Status of this transaction alone.
    pub fn status(&self) -> TxnStatus {
        self.state.status()
    }

    /// True when this transaction or any ancestor aborted.
    pub fn is_aborted(&self) -> bool {
        let mut cur = Some(&self.state);
        while let Some(state) = cur {
            if state.status() == TxnStatus::Aborted {
                return true;
            }
            cur = state.parent.as_ref();
        }
        false
    }

    /// True when this transaction and every ancestor committed.
    pub fn is_durable(&self) -> bool {
        let mut cur = Some(&self.state);
        while let Some(state) = cur {
            if state.status() != TxnStatus::Committed {
                return false;
            }
            cur = state.parent.as_ref();
        }
        true
    }

    /// True when both tokens observe the same transaction.
    pub fn same(&self, other: &TxnToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for TxnToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnToken")
            .field("id", &self.state.id)
            .field("status", &self.status())
            .finish()
    }
}

/// A transaction: allocation ledger plus begin/commit/abort lifecycle.
///
/// Dropping an unfinished transaction aborts it.
pub struct Txn {
    env: Env,
    state: Arc<TxnState>,
    finished: bool,
}

impl Txn {
    fn start(env: Env, parent: Option<Arc<TxnState>>) -> Self {
        let id = env.inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "begin txn {}{}",
            id,
            parent.as_ref().map(|p| format!(" (nested in {})", p.id)).unwrap_or_default()
        );
        Self {
            env,
            state: Arc::new(TxnState {
                id,
                status: AtomicU8::new(TxnStatus::Active as u8),
                parent,
                ledger: Mutex::new(HashSet::new()),
                parked: Mutex::new(Vec::new()),
            }),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn status(&self) -> TxnStatus {
        self.state.status()
    }

    /// Token for structures that allocate under this transaction.
    pub fn token(&self) -> TxnToken {
        TxnToken { state: Arc::clone(&self.state) }
    }

    /// Begin a child transaction. Its ledger folds into this one on commit.
    pub fn nested(&self) -> Txn {
        Txn::start(self.env.clone(), Some(Arc::clone(&self.state)))
    }

    /// Allocate a block and record it in the ledger.
    pub fn alloc_block(&mut self, size: u32) -> SapResult<Block> {
        if self.state.status() != TxnStatus::Active {
            return Err(SapError::invalid("transaction is not active"));
        }
        let block = Block::allocate(self.env.arena(), size)?.owned_by(&self.state);
        self.state.ledger.lock().insert(block.id());
        Ok(block)
    }

    /// Ids of the blocks allocated under this transaction that are still
    /// live, in allocation order.
    pub fn allocated_blocks(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.state.ledger.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Park `value` until this transaction's outcome is known.
    pub fn shadow<T: Send + 'static>(&self, value: T) -> Shadow<T> {
        let slot = Arc::new(Mutex::new(Some(value)));
        let parked: Arc<dyn Retire> = slot.clone();
        self.state.parked.lock().push(parked);
        Shadow { slot }
    }

    /// Make this transaction's allocations permanent.
    ///
    /// A nested transaction hands its ledger and parked values to the
    /// parent, so the blocks stay reclaimable until the outermost transaction
    /// commits. Committing a child whose parent already finished aborts the
    /// child instead.
    pub fn commit(mut self) -> SapResult<()> {
        let retired = match self.state.parent.clone() {
            Some(parent) => {
                if parent.status() != TxnStatus::Active {
                    self.abort_in_place();
                    return Err(SapError::invalid("parent transaction already finished"));
                }
                let ledger = std::mem::take(&mut *self.state.ledger.lock());
                parent.ledger.lock().extend(ledger);
                let parked = std::mem::take(&mut *self.state.parked.lock());
                parent.parked.lock().extend(parked);
                Vec::new()
            }
            None => {
                self.state.ledger.lock().clear();
                std::mem::take(&mut *self.state.parked.lock())
            }
        };

        self.state.set_status(TxnStatus::Committed);
        self.finished = true;
        for parked in &retired {
            parked.retire();
        }
        log::debug!("commit txn {} ({} shadows retired)", self.state.id, retired.len());
        Ok(())
    }

    /// Discard this transaction, reclaiming every block it allocated.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.finished {
            return;
        }
        self.state.set_status(TxnStatus::Aborted);
        self.finished = true;

        let ledger = std::mem::take(&mut *self.state.ledger.lock());
        let arena = self.env.arena();
        let reclaimed = ledger.iter().filter(|&&id| arena.reclaim(id)).count();
        if reclaimed > 0 {
            log::warn!("abort txn {}: reclaimed {} of {} blocks", self.state.id, reclaimed, ledger.len());
        } else {
            log::debug!("abort txn {}", self.state.id);
        }

        // Owners still holding a shadow restore from it
        let parked = std::mem::take(&mut *self.state.parked.lock());
        drop(parked);
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.state.id)
            .field("status", &self.status())
            .finish()
    }
}
