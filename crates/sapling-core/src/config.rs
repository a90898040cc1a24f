//! Configuration management for Sapling
//!
//! Provides memory tier presets for different hardware classes. The same
//! struct carries the resolver guards, so one value configures an environment
//! end to end.

/// Sapling configuration with memory tier presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Byte budget of the node arena; allocations beyond it fail with OOM
    pub arena_max_bytes: u64,
    /// Maximum nesting of TREE handles followed by the runtime resolver
    pub max_tree_depth: u32,
    /// Maximum TREE expansions per top-level handle expansion
    pub max_tree_visits: u32,
    /// Size of the arena pages backing literal-table bytes
    pub literal_page_size: u32,
    /// Largest single literal accepted by a literal table
    pub max_literal_bytes: usize,
}

impl Config {
    /// Server-class: generous arena, deep subtree nesting
    pub fn server() -> Self {
        Self {
            arena_max_bytes: 8 * 1024 * 1024 * 1024,
            max_tree_depth: 64,
            max_tree_visits: 65_536,
            literal_page_size: 64 * 1024,
            max_literal_bytes: 16 * 1024 * 1024,
        }
    }

    /// Phone-class: 1.5GB arena
    pub fn phone() -> Self {
        Self {
            arena_max_bytes: 1536 * 1024 * 1024,
            max_tree_depth: 32,
            max_tree_visits: 16_384,
            literal_page_size: 16 * 1024,
            max_literal_bytes: 4 * 1024 * 1024,
        }
    }

    /// Budget-class: 256MB arena, shallow nesting
    pub fn budget() -> Self {
        Self {
            arena_max_bytes: 256 * 1024 * 1024,
            max_tree_depth: 16,
            max_tree_visits: 4096,
            literal_page_size: 4096,
            max_literal_bytes: 1024 * 1024,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.arena_max_bytes == 0 {
            return Err("arena_max_bytes must be > 0".into());
        }
        if self.max_tree_depth == 0 {
            return Err("max_tree_depth must be > 0".into());
        }
        if self.max_tree_visits == 0 {
            return Err("max_tree_visits must be > 0".into());
        }
        if self.literal_page_size < 256 || !self.literal_page_size.is_power_of_two() {
            return Err("literal_page_size must be a power of two >= 256".into());
        }
        if self.max_literal_bytes == 0 || self.max_literal_bytes > u32::MAX as usize {
            return Err("max_literal_bytes must be in [1, 4GB)".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
