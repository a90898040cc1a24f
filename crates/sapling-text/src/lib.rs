//! Sapling Text: finger-tree sequences and copy-on-write Unicode text
//!
//! Built on the arena and transactions of `sapling-core`.
//!
//! # Architecture
//!
//! - [`Seq`]: finger tree of 32-bit items with amortised O(1) ends and
//!   O(log n) concat, split and indexing. Every node holds one arena block.
//! - [`Text`]: shares one `Seq` of tagged [`TextHandle`]s between clones and
//!   copies it on the first write through a shared handle
//! - [`RuntimeResolver`]: expands LITERAL handles from a [`LiteralTable`] and
//!   TREE handles from a [`TreeRegistry`], with depth, visit and cycle guards
//!
//! Mutating calls take `&mut Txn`. A failed allocation in the middle of a
//! mutation, or an abort of a transaction the structure allocated under,
//! leaves it poisoned until `reset`.

pub mod handle;
pub mod literal;
pub mod registry;
pub mod resolver;
pub mod seq;
pub mod text;

pub use handle::{HandleKind, TextHandle};
pub use literal::LiteralTable;
pub use registry::TreeRegistry;
pub use resolver::{HandleExpander, LiteralSource, RuntimeResolver, TreeSource};
pub use seq::Seq;
pub use text::{Handles, Text};
