//! Sapling Core: arena, transaction and error primitives
//!
//! Shared foundation for the Sapling storage subsystems (sequences, text,
//! and the key/value stores layered next to them).
//!
//! # Architecture
//!
//! - **Arena**: variable-size node blocks identified by ids, behind the
//!   [`NodeAllocator`] collaborator trait
//! - **Transactions**: every live block allocated under a [`Txn`] is
//!   recorded; abort reclaims them, commit makes them permanent. Structures
//!   park their pre-write value as a [`Shadow`] to restore after an abort
//! - **Errors**: one [`SapError`] enum with a coarse [`ErrorKind`] per variant
//!
//! Single-writer: a structure is mutated by one owner at a time. The
//! allocator sits behind a mutex so handles can be sent between threads.

pub mod arena;
pub mod config;
pub mod error;
pub mod txn;

// Re-export key types for convenience
pub use arena::{ArenaStats, Block, BlockId, BlockInfo, MemArena, NodeAllocator, SharedArena};
pub use config::Config;
pub use error::{ErrorKind, SapError, SapResult};
pub use txn::{Env, Shadow, Txn, TxnStatus, TxnToken};
