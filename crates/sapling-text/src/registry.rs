//! Subtree registry: texts addressed by TREE handles
//!
//! `register` stores an O(1) clone of a text and hands out the next id,
//! starting at 0. Each entry carries an atomic reference count starting at 1;
//! `retain` and `release` may run concurrently with readers. When the count
//! drops to zero the stored text is released and the id stays dead: it is
//! never handed out again.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use sapling_core::{SapError, SapResult};

use crate::handle::MAX_PAYLOAD;
use crate::resolver::TreeSource;
use crate::text::Text;

struct Entry {
    text: RwLock<Option<Text>>,
    refs: AtomicU32,
}

/// Registry of shared subtrees.
#[derive(Default)]
pub struct TreeRegistry {
    entries: Vec<Entry>,
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a clone of `text` and return its id.
    pub fn register(&mut self, text: &Text) -> SapResult<u32> {
        let id = self.entries.len() as u32;
        if id > MAX_PAYLOAD {
            return Err(SapError::invalid("subtree id space exhausted"));
        }
        self.entries.push(Entry {
            text: RwLock::new(Some(text.clone())),
            refs: AtomicU32::new(1),
        });
        Ok(id)
    }

    fn entry(&self, id: u32) -> SapResult<&Entry> {
        self.entries.get(id as usize).ok_or(SapError::IndexOutOfRange {
            index: id as usize,
            len: self.entries.len(),
        })
    }

    /// O(1) clone of subtree `id`.
    pub fn get(&self, id: u32) -> SapResult<Text> {
        self.entry(id)?
            .text
            .read()
            .clone()
            .ok_or_else(|| SapError::invalid(format!("subtree {} was released", id)))
    }

    /// Add a reference. Returns the new count.
    pub fn retain(&self, id: u32) -> SapResult<u32> {
        let entry = self.entry(id)?;
        entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs == 0 {
                    None
                } else {
                    refs.checked_add(1)
                }
            })
            .map(|prev| prev + 1)
            .map_err(|refs| {
                if refs == 0 {
                    SapError::invalid(format!("retain of released subtree {}", id))
                } else {
                    SapError::invalid(format!("subtree {} reference count overflow", id))
                }
            })
    }

    /// Drop a reference; the last one releases the text. Returns the new count.
    pub fn release(&self, id: u32) -> SapResult<u32> {
        let entry = self.entry(id)?;
        let prev = entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .map_err(|_| SapError::invalid(format!("release of released subtree {}", id)))?;
        if prev == 1 {
            entry.text.write().take();
            log::debug!("subtree {} released", id);
        }
        Ok(prev - 1)
    }

    /// Current reference count of `id`.
    pub fn refs(&self, id: u32) -> SapResult<u32> {
        Ok(self.entry(id)?.refs.load(Ordering::Acquire))
    }

    /// Number of ids handed out, including released ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TreeSource for TreeRegistry {
    fn resolve_tree(&self, id: u32) -> SapResult<Text> {
        self.get(id)
    }
}

impl std::fmt::Debug for TreeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeRegistry").field("entries", &self.entries.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapling_core::{Config, Env};

    fn abc(env: &Env) -> Text {
        let mut txn = env.begin();
        let mut text = Text::new(env);
        text.from_utf8(&mut txn, b"abc").unwrap();
        txn.commit().unwrap();
        text
    }

    #[test]
    fn test_register_assigns_sequential_ids() {
        let env = Env::new(Config::budget()).unwrap();
        let mut registry = TreeRegistry::new();
        let text = abc(&env);
        assert_eq!(registry.register(&text).unwrap(), 0);
        assert_eq!(registry.register(&text).unwrap(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().to_utf8_full(None).unwrap(), b"abc");
    }

    #[test]
    fn test_unknown_id_is_range() {
        let registry = TreeRegistry::new();
        assert!(matches!(registry.get(0), Err(SapError::IndexOutOfRange { .. })));
        assert!(matches!(registry.retain(3), Err(SapError::IndexOutOfRange { .. })));
        assert!(matches!(registry.release(3), Err(SapError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_refcount_lifecycle() {
        let env = Env::new(Config::budget()).unwrap();
        let mut registry = TreeRegistry::new();
        let id = registry.register(&abc(&env)).unwrap();

        assert_eq!(registry.retain(id).unwrap(), 2);
        assert_eq!(registry.release(id).unwrap(), 1);
        assert!(registry.get(id).is_ok());
        assert_eq!(registry.release(id).unwrap(), 0);

        assert!(matches!(registry.get(id), Err(SapError::Invalid { .. })));
        assert!(matches!(registry.retain(id), Err(SapError::Invalid { .. })));
        assert!(matches!(registry.release(id), Err(SapError::Invalid { .. })));
        assert_eq!(registry.refs(id).unwrap(), 0);
    }

    #[test]
    fn test_release_frees_last_copy() {
        let env = Env::new(Config::budget()).unwrap();
        let mut registry = TreeRegistry::new();
        let id = registry.register(&abc(&env)).unwrap();
        assert!(env.stats().live_blocks > 0);
        registry.release(id).unwrap();
        assert_eq!(env.stats().live_blocks, 0);
    }

    #[test]
    fn test_concurrent_retain_release() {
        let env = Env::new(Config::budget()).unwrap();
        let mut registry = TreeRegistry::new();
        let id = registry.register(&abc(&env)).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        registry.retain(id).unwrap();
                        registry.get(id).unwrap();
                        registry.release(id).unwrap();
                    }
                });
            }
        });
        assert_eq!(registry.refs(id).unwrap(), 1);
    }
}
