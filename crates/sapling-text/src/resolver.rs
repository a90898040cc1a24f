//! Handle expansion
//!
//! Texts may hold handles that are not code points: LITERAL handles name a
//! byte run in a literal table, TREE handles name another registered text.
//! Anything that needs scalars out of such a text (the resolved length, the
//! resolved UTF-8 encoding) goes through a [`HandleExpander`].
//!
//! [`RuntimeResolver`] is the standard expander. It looks literals up in a
//! [`LiteralSource`] and subtrees in a [`TreeSource`], and walks subtrees
//! recursively under three guards, all reset per top-level expansion:
//!   - depth:  nesting of TREE handles beyond `max_tree_depth` is rejected
//!   - visits: more than `max_tree_visits` subtree visits is rejected
//!   - cycles: a TREE id already on the active path is rejected
//!
//! Every guard trip and every failed lookup surfaces as `Invalid`.

use sapling_core::{Config, SapError, SapResult};

use crate::handle::TextHandle;
use crate::text::Text;

/// Expands one non-codepoint handle into zero or more scalars.
pub trait HandleExpander {
    fn expand(&self, handle: TextHandle, emit: &mut dyn FnMut(char) -> SapResult<()>) -> SapResult<()>;
}

impl<F> HandleExpander for F
where
    F: Fn(TextHandle, &mut dyn FnMut(char) -> SapResult<()>) -> SapResult<()>,
{
    fn expand(&self, handle: TextHandle, emit: &mut dyn FnMut(char) -> SapResult<()>) -> SapResult<()> {
        self(handle, emit)
    }
}

/// Lookup of literal byte runs by id.
pub trait LiteralSource {
    fn resolve_literal(&self, id: u32) -> SapResult<&[u8]>;
}

/// Lookup of registered subtrees by id.
///
/// Returns an O(1) clone so the source can keep its own locking private.
pub trait TreeSource {
    fn resolve_tree(&self, id: u32) -> SapResult<Text>;
}

/// Expander backed by a literal table and a subtree registry.
#[derive(Clone, Copy)]
pub struct RuntimeResolver<'a> {
    literals: Option<&'a dyn LiteralSource>,
    trees: Option<&'a dyn TreeSource>,
    max_tree_depth: u32,
    max_tree_visits: u32,
}

/// Per-expansion walk state
struct Walk {
    /// TREE ids currently being expanded, outermost first
    path: Vec<u32>,
    visits: u32,
}

impl<'a> RuntimeResolver<'a> {
    /// Resolver with the guard limits of `config` and no sources.
    pub fn new(config: &Config) -> Self {
        Self {
            literals: None,
            trees: None,
            max_tree_depth: config.max_tree_depth,
            max_tree_visits: config.max_tree_visits,
        }
    }

    pub fn with_literals(mut self, literals: &'a dyn LiteralSource) -> Self {
        self.literals = Some(literals);
        self
    }

    pub fn with_trees(mut self, trees: &'a dyn TreeSource) -> Self {
        self.trees = Some(trees);
        self
    }

    /// Override the guard limits. A zero keeps the current limit.
    pub fn with_limits(mut self, max_tree_depth: u32, max_tree_visits: u32) -> Self {
        if max_tree_depth != 0 {
            self.max_tree_depth = max_tree_depth;
        }
        if max_tree_visits != 0 {
            self.max_tree_visits = max_tree_visits;
        }
        self
    }

    pub fn max_tree_depth(&self) -> u32 {
        self.max_tree_depth
    }

    pub fn max_tree_visits(&self) -> u32 {
        self.max_tree_visits
    }

    fn expand_in(
        &self,
        handle: TextHandle,
        walk: &mut Walk,
        emit: &mut dyn FnMut(char) -> SapResult<()>,
    ) -> SapResult<()> {
        match handle {
            TextHandle::Codepoint(c) => emit(c),
            TextHandle::Literal(id) => {
                let literals = self
                    .literals
                    .ok_or_else(|| SapError::invalid(format!("literal {} with no literal source", id)))?;
                let bytes = literals
                    .resolve_literal(id)
                    .map_err(|err| SapError::invalid(format!("literal {} unresolved: {}", id, err)))?;
                let text = simdutf8::basic::from_utf8(bytes)
                    .map_err(|_| SapError::invalid(format!("literal {} is not valid UTF-8", id)))?;
                text.chars().try_for_each(|c| emit(c))
            }
            TextHandle::Tree(id) => self.expand_tree(id, walk, emit),
            TextHandle::Reserved(payload) => {
                Err(SapError::invalid(format!("reserved handle {:#x} cannot be expanded", payload)))
            }
        }
    }

    fn expand_tree(
        &self,
        id: u32,
        walk: &mut Walk,
        emit: &mut dyn FnMut(char) -> SapResult<()>,
    ) -> SapResult<()> {
        let trees = self
            .trees
            .ok_or_else(|| SapError::invalid(format!("subtree {} with no tree source", id)))?;

        if walk.path.contains(&id) {
            log::trace!("subtree cycle through {} (path {:?})", id, walk.path);
            return Err(SapError::invalid(format!("subtree {} contains itself", id)));
        }
        if walk.path.len() >= self.max_tree_depth as usize {
            log::trace!("subtree depth limit {} hit at {}", self.max_tree_depth, id);
            return Err(SapError::invalid(format!(
                "subtree nesting exceeds depth {}",
                self.max_tree_depth
            )));
        }
        walk.visits += 1;
        if walk.visits > self.max_tree_visits {
            log::trace!("subtree visit limit {} hit at {}", self.max_tree_visits, id);
            return Err(SapError::invalid(format!(
                "expansion exceeds {} subtree visits",
                self.max_tree_visits
            )));
        }

        let text = trees
            .resolve_tree(id)
            .map_err(|err| SapError::invalid(format!("subtree {} unresolved: {}", id, err)))?;

        walk.path.push(id);
        let result = text
            .handles()
            .and_then(|mut handles| handles.try_for_each(|h| self.expand_in(h?, walk, emit)));
        walk.path.pop();
        result
    }
}

impl HandleExpander for RuntimeResolver<'_> {
    fn expand(&self, handle: TextHandle, emit: &mut dyn FnMut(char) -> SapResult<()>) -> SapResult<()> {
        let mut walk = Walk { path: Vec::new(), visits: 0 };
        self.expand_in(handle, &mut walk, emit)
    }
}

impl std::fmt::Debug for RuntimeResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeResolver")
            .field("literals", &self.literals.is_some())
            .field("trees", &self.trees.is_some())
            .field("max_tree_depth", &self.max_tree_depth)
            .field("max_tree_visits", &self.max_tree_visits)
            .finish()
    }
}
