//! Seq: finger-tree sequence of 32-bit items
//!
//! A finger tree measured by element count gives:
//!   - amortised O(1) push/pop at both ends
//!   - O(log n) concatenation
//!   - O(log n) split and random access by index
//!
//! Three tree shapes at each level:
//!   Empty:  no elements
//!   Single: exactly one item
//!   Deep:   prefix group (1-4 items), a middle tree whose items are
//!            2-3 ary nodes one level down, suffix group (1-4 items)
//!
//! Items at the top level are leaves (user values, size 1); items of a middle
//! tree are nodes whose size is the number of leaves beneath them.
//!
//! **Sharing**: every node and every Deep shell holds one arena block and
//! lives behind an `Arc`. Nodes never change once built. A shell is changed
//! in place only while nothing else refers to it; otherwise the write works
//! on a copy in a fresh block. Old versions therefore stay intact for as long
//! as someone holds them, which is what [`Seq::fork`] and abort rely on.
//!
//! **Transactions**: before its first write under a transaction a sequence
//! parks its current tree with that transaction as a
//! [`Shadow`](sapling_core::Shadow). Commit drops the shadow, releasing the
//! nodes the write replaced. After an abort the sequence reads the shadow
//! again and carries on from the value it had before the transaction.
//!
//! **Poisoning**: if an allocation fails halfway through a write, the
//! partially rebuilt tree is discarded and the sequence becomes poisoned:
//! everything except [`Seq::reset`] and [`Seq::is_valid`] fails until it is
//! reset or the transaction of that write aborts. Precondition failures
//! (empty pop, bad index) are detected before anything is touched and never
//! poison.

use std::mem;
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use sapling_core::{Block, Env, SapError, SapResult, Shadow, Txn, TxnToken};

/// A prefix or suffix group
type Digit = SmallVec<[Item; 4]>;

/// Children of an internal node
type Children = SmallVec<[Item; 3]>;

const NODE_BLOCK_SIZE: u32 = mem::size_of::<Node>() as u32;
const DEEP_BLOCK_SIZE: u32 = mem::size_of::<Deep>() as u32;

#[derive(Clone)]
enum Item {
    Leaf(u32),
    Node(Arc<Node>),
}

impl Item {
    fn size(&self) -> usize {
        match self {
            Item::Leaf(_) => 1,
            Item::Node(node) => node.size,
        }
    }
}

/// 2- or 3-ary internal node
struct Node {
    size: usize,
    children: Children,
    _block: Block,
}

/// Children of a node leaving the tree.
fn into_digit(node: Arc<Node>) -> Digit {
    match Arc::try_unwrap(node) {
        Ok(node) => node.children.into_iter().collect(),
        Err(shared) => shared.children.iter().cloned().collect(),
    }
}

#[derive(Clone, Default)]
enum Tree {
    #[default]
    Empty,
    Single(Item),
    Deep(Arc<Deep>),
}

struct Deep {
    size: usize,
    prefix: Digit,
    middle: Tree,
    suffix: Digit,
    _block: Block,
}

impl Tree {
    fn size(&self) -> usize {
        match self {
            Tree::Empty => 0,
            Tree::Single(item) => item.size(),
            Tree::Deep(deep) => deep.size,
        }
    }
}

/// Writable shell: `deep` itself when unshared, else a copy in a new block.
fn own_deep(deep: Arc<Deep>, txn: &mut Txn) -> SapResult<Deep> {
    match Arc::try_unwrap(deep) {
        Ok(deep) => Ok(deep),
        Err(shared) => Ok(Deep {
            size: shared.size,
            prefix: shared.prefix.clone(),
            middle: shared.middle.clone(),
            suffix: shared.suffix.clone(),
            _block: txn.alloc_block(DEEP_BLOCK_SIZE)?,
        }),
    }
}

/// Contents of a shell leaving the tree.
fn into_parts(deep: Arc<Deep>) -> (Digit, Tree, Digit) {
    match Arc::try_unwrap(deep) {
        Ok(Deep { prefix, middle, suffix, .. }) => (prefix, middle, suffix),
        Err(shared) => (shared.prefix.clone(), shared.middle.clone(), shared.suffix.clone()),
    }
}

fn digit_size(items: &[Item]) -> usize {
    items.iter().map(Item::size).sum()
}

fn new_node(children: Children, txn: &mut Txn) -> SapResult<Item> {
    let block = txn.alloc_block(NODE_BLOCK_SIZE)?;
    let size = digit_size(&children);
    Ok(Item::Node(Arc::new(Node { size, children, _block: block })))
}

fn new_deep(prefix: Digit, middle: Tree, suffix: Digit, txn: &mut Txn) -> SapResult<Tree> {
    let block = txn.alloc_block(DEEP_BLOCK_SIZE)?;
    let size = digit_size(&prefix) + middle.size() + digit_size(&suffix);
    Ok(Tree::Deep(Arc::new(Deep { size, prefix, middle, suffix, _block: block })))
}

// ---------------------------------------------------------------------------
// Ends
// ---------------------------------------------------------------------------

fn push_front(tree: Tree, item: Item, txn: &mut Txn) -> SapResult<Tree> {
    match tree {
        Tree::Empty => Ok(Tree::Single(item)),
        Tree::Single(only) => new_deep(smallvec![item], Tree::Empty, smallvec![only], txn),
        Tree::Deep(deep) => {
            let mut deep = own_deep(deep, txn)?;
            let added = item.size();
            if deep.prefix.len() == 4 {
                // Keep the head, push the other three down as one node
                let children: Children = deep.prefix.drain(1..).collect();
                let node = new_node(children, txn)?;
                deep.middle = push_front(mem::take(&mut deep.middle), node, txn)?;
            }
            deep.prefix.insert(0, item);
            deep.size += added;
            Ok(Tree::Deep(Arc::new(deep)))
        }
    }
}

fn push_back(tree: Tree, item: Item, txn: &mut Txn) -> SapResult<Tree> {
    match tree {
        Tree::Empty => Ok(Tree::Single(item)),
        Tree::Single(only) => new_deep(smallvec![only], Tree::Empty, smallvec![item], txn),
        Tree::Deep(deep) => {
            let mut deep = own_deep(deep, txn)?;
            let added = item.size();
            if deep.suffix.len() == 4 {
                let children: Children = deep.suffix.drain(..3).collect();
                let node = new_node(children, txn)?;
                deep.middle = push_back(mem::take(&mut deep.middle), node, txn)?;
            }
            deep.suffix.push(item);
            deep.size += added;
            Ok(Tree::Deep(Arc::new(deep)))
        }
    }
}

/// Remove the first item. Allocates only to copy shared shells.
fn pop_front(tree: Tree, txn: &mut Txn) -> SapResult<(Tree, Option<Item>)> {
    match tree {
        Tree::Empty => Ok((Tree::Empty, None)),
        Tree::Single(only) => Ok((Tree::Empty, Some(only))),
        Tree::Deep(deep) => {
            let mut deep = own_deep(deep, txn)?;
            let first = deep.prefix.remove(0);
            deep.size -= first.size();
            let rest = if deep.prefix.is_empty() {
                refill_prefix(deep, txn)?
            } else {
                Tree::Deep(Arc::new(deep))
            };
            Ok((rest, Some(first)))
        }
    }
}

fn pop_back(tree: Tree, txn: &mut Txn) -> SapResult<(Tree, Option<Item>)> {
    match tree {
        Tree::Empty => Ok((Tree::Empty, None)),
        Tree::Single(only) => Ok((Tree::Empty, Some(only))),
        Tree::Deep(deep) => {
            let mut deep = own_deep(deep, txn)?;
            let last = deep.suffix.pop();
            if let Some(item) = &last {
                deep.size -= item.size();
            }
            let rest = if deep.suffix.is_empty() {
                refill_suffix(deep, txn)?
            } else {
                Tree::Deep(Arc::new(deep))
            };
            Ok((rest, last))
        }
    }
}

/// Restore a non-empty prefix: unpack the first middle node, or borrow from
/// the suffix when the middle is empty.
fn refill_prefix(mut deep: Deep, txn: &mut Txn) -> SapResult<Tree> {
    let (middle, head) = pop_front(mem::take(&mut deep.middle), txn)?;
    deep.middle = middle;
    match head {
        Some(Item::Node(node)) => deep.prefix = into_digit(node),
        Some(leaf) => deep.prefix.push(leaf),
        None if deep.suffix.len() == 1 => {
            return Ok(deep.suffix.pop().map_or(Tree::Empty, Tree::Single));
        }
        None => {
            let first = deep.suffix.remove(0);
            deep.prefix.push(first);
        }
    }
    Ok(Tree::Deep(Arc::new(deep)))
}

fn refill_suffix(mut deep: Deep, txn: &mut Txn) -> SapResult<Tree> {
    let (middle, tail) = pop_back(mem::take(&mut deep.middle), txn)?;
    deep.middle = middle;
    match tail {
        Some(Item::Node(node)) => deep.suffix = into_digit(node),
        Some(leaf) => deep.suffix.push(leaf),
        None if deep.prefix.len() == 1 => {
            return Ok(deep.prefix.pop().map_or(Tree::Empty, Tree::Single));
        }
        None => {
            let last = deep.prefix.pop();
            deep.suffix.extend(last);
        }
    }
    Ok(Tree::Deep(Arc::new(deep)))
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

/// Find the item of `items` covering `idx` and the offset inside it.
fn locate(items: &[Item], mut idx: usize) -> Option<(&Item, usize)> {
    for item in items {
        let size = item.size();
        if idx < size {
            return Some((item, idx));
        }
        idx -= size;
    }
    None
}

fn item_get(mut item: &Item, mut idx: usize) -> Option<u32> {
    loop {
        match item {
            Item::Leaf(value) => return (idx == 0).then_some(*value),
            Item::Node(node) => {
                let (child, offset) = locate(&node.children, idx)?;
                item = child;
                idx = offset;
            }
        }
    }
}

fn tree_get(mut tree: &Tree, mut idx: usize) -> Option<u32> {
    loop {
        match tree {
            Tree::Empty => return None,
            Tree::Single(item) => return item_get(item, idx),
            Tree::Deep(deep) => {
                let prefix_size = digit_size(&deep.prefix);
                if idx < prefix_size {
                    let (item, offset) = locate(&deep.prefix, idx)?;
                    return item_get(item, offset);
                }
                idx -= prefix_size;

                let middle_size = deep.middle.size();
                if idx < middle_size {
                    tree = &deep.middle;
                    continue;
                }
                idx -= middle_size;

                let (item, offset) = locate(&deep.suffix, idx)?;
                return item_get(item, offset);
            }
        }
    }
}

fn checked_get(tree: &Tree, idx: usize) -> SapResult<u32> {
    let len = tree.size();
    if idx >= len {
        return Err(SapError::IndexOutOfRange { index: idx, len });
    }
    tree_get(tree, idx).ok_or_else(|| SapError::invalid("inconsistent tree sizes"))
}

// ---------------------------------------------------------------------------
// Concatenation
// ---------------------------------------------------------------------------

/// Repack 2..=12 boundary items into 2-3 ary nodes.
fn pack_nodes(items: Vec<Item>, txn: &mut Txn) -> SapResult<Vec<Item>> {
    let mut remaining = items.len();
    let mut iter = items.into_iter();
    let mut nodes = Vec::with_capacity(remaining / 2);
    while remaining > 0 {
        let take = match remaining {
            1 => return Err(SapError::invalid("cannot pack a single boundary item")),
            2 | 4 => 2,
            _ => 3,
        };
        let children: Children = iter.by_ref().take(take).collect();
        nodes.push(new_node(children, txn)?);
        remaining -= take;
    }
    Ok(nodes)
}

fn push_all_front(mut tree: Tree, items: Vec<Item>, txn: &mut Txn) -> SapResult<Tree> {
    for item in items.into_iter().rev() {
        tree = push_front(tree, item, txn)?;
    }
    Ok(tree)
}

fn push_all_back(mut tree: Tree, items: Vec<Item>, txn: &mut Txn) -> SapResult<Tree> {
    for item in items {
        tree = push_back(tree, item, txn)?;
    }
    Ok(tree)
}

/// Three-way merge: `left ++ spine ++ right`.
fn app3(left: Tree, spine: Vec<Item>, right: Tree, txn: &mut Txn) -> SapResult<Tree> {
    match (left, right) {
        (Tree::Empty, right) => push_all_front(right, spine, txn),
        (left, Tree::Empty) => push_all_back(left, spine, txn),
        (Tree::Single(only), right) => {
            let tree = push_all_front(right, spine, txn)?;
            push_front(tree, only, txn)
        }
        (left, Tree::Single(only)) => {
            let tree = push_all_back(left, spine, txn)?;
            push_back(tree, only, txn)
        }
        (Tree::Deep(a), Tree::Deep(b)) => {
            let size = a.size + digit_size(&spine) + b.size;
            let mut a = own_deep(a, txn)?;
            let (b_prefix, b_middle, b_suffix) = into_parts(b);

            let mut boundary = Vec::with_capacity(12);
            boundary.extend(mem::take(&mut a.suffix));
            boundary.extend(spine);
            boundary.extend(b_prefix);
            let nodes = pack_nodes(boundary, txn)?;

            a.middle = app3(mem::take(&mut a.middle), nodes, b_middle, txn)?;
            a.suffix = b_suffix;
            a.size = size;
            Ok(Tree::Deep(Arc::new(a)))
        }
    }
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

struct Split {
    left: Tree,
    item: Item,
    right: Tree,
}

/// Split a group around the item covering `idx`.
fn split_digit(items: Digit, mut idx: usize) -> SapResult<(Digit, Item, Digit)> {
    let mut before = Digit::new();
    let mut iter = items.into_iter();
    while let Some(item) = iter.next() {
        let size = item.size();
        if idx < size {
            return Ok((before, item, iter.collect()));
        }
        idx -= size;
        before.push(item);
    }
    Err(SapError::invalid("split index past end of group"))
}

/// Build a tree from at most four items.
fn digit_to_tree(mut items: Digit, txn: &mut Txn) -> SapResult<Tree> {
    match items.len() {
        0 => Ok(Tree::Empty),
        1 => Ok(items.pop().map_or(Tree::Empty, Tree::Single)),
        n => {
            let suffix: Digit = items.drain(n / 2..).collect();
            new_deep(items, Tree::Empty, suffix, txn)
        }
    }
}

/// Deep constructor tolerating an empty prefix.
fn deep_l(prefix: Digit, middle: Tree, suffix: Digit, txn: &mut Txn) -> SapResult<Tree> {
    if !prefix.is_empty() {
        return new_deep(prefix, middle, suffix, txn);
    }
    match pop_front(middle, txn)? {
        (middle, Some(Item::Node(node))) => new_deep(into_digit(node), middle, suffix, txn),
        (middle, Some(leaf)) => new_deep(smallvec![leaf], middle, suffix, txn),
        (_, None) => digit_to_tree(suffix, txn),
    }
}

/// Deep constructor tolerating an empty suffix.
fn deep_r(prefix: Digit, middle: Tree, suffix: Digit, txn: &mut Txn) -> SapResult<Tree> {
    if !suffix.is_empty() {
        return new_deep(prefix, middle, suffix, txn);
    }
    match pop_back(middle, txn)? {
        (middle, Some(Item::Node(node))) => new_deep(prefix, middle, into_digit(node), txn),
        (middle, Some(leaf)) => new_deep(prefix, middle, smallvec![leaf], txn),
        (_, None) => digit_to_tree(prefix, txn),
    }
}

/// Split around the item covering `idx`. Requires `idx < tree.size()`.
fn split_tree(tree: Tree, idx: usize, txn: &mut Txn) -> SapResult<Split> {
    let deep = match tree {
        Tree::Empty => return Err(SapError::invalid("split of empty tree")),
        Tree::Single(item) => {
            return Ok(Split { left: Tree::Empty, item, right: Tree::Empty });
        }
        Tree::Deep(deep) => deep,
    };
    let (prefix, middle, suffix) = into_parts(deep);

    let prefix_size = digit_size(&prefix);
    if idx < prefix_size {
        let (before, item, after) = split_digit(prefix, idx)?;
        let left = digit_to_tree(before, txn)?;
        let right = deep_l(after, middle, suffix, txn)?;
        return Ok(Split { left, item, right });
    }

    let idx = idx - prefix_size;
    let middle_size = middle.size();
    if idx < middle_size {
        let Split { left: mid_left, item: node, right: mid_right } = split_tree(middle, idx, txn)?;
        let offset = idx - mid_left.size();
        let children = match node {
            Item::Node(node) => into_digit(node),
            leaf => smallvec![leaf],
        };
        let (before, item, after) = split_digit(children, offset)?;
        let left = deep_r(prefix, mid_left, before, txn)?;
        let right = deep_l(after, mid_right, suffix, txn)?;
        return Ok(Split { left, item, right });
    }

    let (before, item, after) = split_digit(suffix, idx - middle_size)?;
    let left = deep_r(prefix, middle, before, txn)?;
    let right = digit_to_tree(after, txn)?;
    Ok(Split { left, item, right })
}

/// Split into `[0, idx)` and `[idx, len)`.
fn split_parts(tree: Tree, idx: usize, txn: &mut Txn) -> SapResult<(Tree, Tree)> {
    let len = tree.size();
    if idx == 0 {
        return Ok((Tree::Empty, tree));
    }
    if idx == len {
        return Ok((tree, Tree::Empty));
    }
    let Split { left, item, right } = split_tree(tree, idx, txn)?;
    let right = push_front(right, item, txn)?;
    Ok((left, right))
}

/// Remove and/or insert one element at `idx`, then reassemble.
fn splice_tree(
    tree: Tree,
    idx: usize,
    remove: bool,
    insert: Option<u32>,
    txn: &mut Txn,
) -> SapResult<(Tree, Option<u32>)> {
    let (mut left, right, removed) = if idx < tree.size() {
        let Split { left, item, right } = split_tree(tree, idx, txn)?;
        if remove {
            (left, right, Some(item))
        } else {
            (left, push_front(right, item, txn)?, None)
        }
    } else {
        (tree, Tree::Empty, None)
    };

    let removed = match removed {
        Some(Item::Leaf(value)) => Some(value),
        Some(Item::Node(_)) => return Err(SapError::invalid("internal node at leaf level")),
        None => None,
    };

    if let Some(value) = insert {
        left = push_back(left, Item::Leaf(value), txn)?;
    }
    Ok((app3(left, Vec::new(), right, txn)?, removed))
}

// ---------------------------------------------------------------------------
// Deep copy
// ---------------------------------------------------------------------------

fn clone_item(item: &Item, txn: &mut Txn) -> SapResult<Item> {
    match item {
        Item::Leaf(value) => Ok(Item::Leaf(*value)),
        Item::Node(node) => {
            let children = node
                .children
                .iter()
                .map(|child| clone_item(child, txn))
                .collect::<SapResult<Children>>()?;
            new_node(children, txn)
        }
    }
}

fn clone_digit(items: &[Item], txn: &mut Txn) -> SapResult<Digit> {
    items.iter().map(|item| clone_item(item, txn)).collect()
}

fn clone_tree(tree: &Tree, txn: &mut Txn) -> SapResult<Tree> {
    match tree {
        Tree::Empty => Ok(Tree::Empty),
        Tree::Single(item) => Ok(Tree::Single(clone_item(item, txn)?)),
        Tree::Deep(deep) => {
            let prefix = clone_digit(&deep.prefix, txn)?;
            let middle = clone_tree(&deep.middle, txn)?;
            let suffix = clone_digit(&deep.suffix, txn)?;
            new_deep(prefix, middle, suffix, txn)
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Root {
    Valid(Tree),
    Poisoned,
}

/// Tree of a sequence before its first write under one transaction
#[derive(Clone)]
struct Shadowed {
    token: TxnToken,
    before: Shadow<Tree>,
}

/// Finger-tree sequence of `u32` items bound to one environment.
pub struct Seq {
    root: Root,
    env: Env,
    /// Transactions this sequence was written under that are not yet durable,
    /// oldest first
    shadows: Vec<Shadowed>,
}

impl Seq {
    /// Create an empty sequence. Allocates nothing until the second element.
    pub fn new(env: &Env) -> Self {
        Self { root: Root::Valid(Tree::Empty), env: env.clone(), shadows: Vec::new() }
    }

    /// A sequence created by a write under `txn`; an abort of `txn` leaves
    /// it empty.
    fn derived(&self, tree: Tree, txn: &Txn) -> Seq {
        let shadow = Shadowed { token: txn.token(), before: txn.shadow(Tree::Empty) };
        Seq { root: Root::Valid(tree), env: self.env.clone(), shadows: vec![shadow] }
    }

    /// O(1) copy sharing every node with `self`. A later write to either
    /// side copies only the shells it touches.
    pub fn fork(&self) -> Seq {
        Seq { root: self.root.clone(), env: self.env.clone(), shadows: self.shadows.clone() }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Oldest shadow whose transaction aborted.
    fn aborted_at(&self) -> Option<usize> {
        self.shadows.iter().position(|shadow| shadow.token.is_aborted())
    }

    /// Run `f` on the current tree: the pre-transaction one when a
    /// transaction this sequence was written under aborted.
    fn with_current<R>(&self, f: impl FnOnce(&Tree) -> R) -> SapResult<R> {
        if let Some(at) = self.aborted_at() {
            let before = self.shadows[at].before.get().ok_or(SapError::Poisoned)?;
            return Ok(f(&before));
        }
        match &self.root {
            Root::Valid(tree) => Ok(f(tree)),
            Root::Poisoned => Err(SapError::Poisoned),
        }
    }

    /// Apply finished transactions: restore from an aborted one, drop the
    /// shadows of durable ones.
    fn settle(&mut self) {
        if let Some(at) = self.aborted_at() {
            let before = self.shadows[at].before.get();
            self.shadows.truncate(at);
            self.root = before.map_or(Root::Poisoned, Root::Valid);
            log::debug!("sequence restored after abort ({} elements)", self.len());
        }
        self.shadows.retain(|shadow| !shadow.token.is_durable());
    }

    /// True when the sequence can be used; false after an OOM mid-write
    /// until it is reset or that write's transaction aborts.
    pub fn is_valid(&self) -> bool {
        self.with_current(|_| ()).is_ok()
    }

    /// Discard all content and return to a valid empty state.
    pub fn reset(&mut self) {
        self.root = Root::Valid(Tree::Empty);
        self.shadows.clear();
    }

    /// Number of elements; 0 for a poisoned sequence.
    pub fn len(&self) -> usize {
        self.with_current(Tree::size).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a write under `txn` and park the current tree with it on the
    /// first write.
    fn begin_write(&mut self, txn: &Txn) -> SapResult<()> {
        if !self.env.same(txn.env()) {
            return Err(SapError::invalid("transaction belongs to a different environment"));
        }
        self.settle();
        let tree = match &self.root {
            Root::Valid(tree) => tree,
            Root::Poisoned => return Err(SapError::Poisoned),
        };

        let token = txn.token();
        if !self.shadows.iter().any(|shadow| shadow.token.same(&token)) {
            let before = txn.shadow(tree.clone());
            self.shadows.push(Shadowed { token, before });
        }
        Ok(())
    }

    fn take_tree(&mut self) -> Tree {
        match mem::replace(&mut self.root, Root::Poisoned) {
            Root::Valid(tree) => tree,
            Root::Poisoned => Tree::Empty,
        }
    }

    /// Store the outcome of a destructive operation, poisoning on failure.
    fn finish<T>(&mut self, result: SapResult<(Tree, T)>) -> SapResult<T> {
        match result {
            Ok((tree, value)) => {
                self.root = Root::Valid(tree);
                Ok(value)
            }
            Err(err) => {
                log::warn!("sequence poisoned: {}", err);
                self.root = Root::Poisoned;
                Err(err)
            }
        }
    }

    pub fn push_front(&mut self, txn: &mut Txn, value: u32) -> SapResult<()> {
        self.begin_write(txn)?;
        let tree = self.take_tree();
        let result = push_front(tree, Item::Leaf(value), txn).map(|t| (t, ()));
        self.finish(result)
    }

    pub fn push_back(&mut self, txn: &mut Txn, value: u32) -> SapResult<()> {
        self.begin_write(txn)?;
        let tree = self.take_tree();
        let result = push_back(tree, Item::Leaf(value), txn).map(|t| (t, ()));
        self.finish(result)
    }

    /// Append every value of `values`.
    pub fn extend<I: IntoIterator<Item = u32>>(&mut self, txn: &mut Txn, values: I) -> SapResult<()> {
        for value in values {
            self.push_back(txn, value)?;
        }
        Ok(())
    }

    pub fn pop_front(&mut self, txn: &mut Txn) -> SapResult<u32> {
        self.begin_write(txn)?;
        if self.is_empty() {
            return Err(SapError::Empty);
        }
        let tree = self.take_tree();
        let result = pop_front(tree, txn).and_then(|(tree, item)| leaf_of(item).map(|v| (tree, v)));
        self.finish(result)
    }

    pub fn pop_back(&mut self, txn: &mut Txn) -> SapResult<u32> {
        self.begin_write(txn)?;
        if self.is_empty() {
            return Err(SapError::Empty);
        }
        let tree = self.take_tree();
        let result = pop_back(tree, txn).and_then(|(tree, item)| leaf_of(item).map(|v| (tree, v)));
        self.finish(result)
    }

    /// Element at `idx`.
    pub fn get(&self, idx: usize) -> SapResult<u32> {
        self.with_current(|tree| checked_get(tree, idx))?
    }

    /// Move every element of `src` to the end of `self`. `src` is left empty.
    ///
    /// On OOM both sequences are poisoned.
    pub fn concat(&mut self, txn: &mut Txn, src: &mut Seq) -> SapResult<()> {
        if !self.env.same(&src.env) {
            return Err(SapError::invalid("cannot concatenate sequences from different environments"));
        }
        self.begin_write(txn)?;
        src.begin_write(txn)?;

        let right = src.take_tree();
        let left = self.take_tree();
        match app3(left, Vec::new(), right, txn) {
            Ok(tree) => {
                self.root = Root::Valid(tree);
                src.root = Root::Valid(Tree::Empty);
                Ok(())
            }
            Err(err) => {
                log::warn!("concat failed, both sequences poisoned: {}", err);
                Err(err)
            }
        }
    }

    /// Split into `[0, idx)` and `[idx, len)`, leaving `self` empty.
    pub fn split_at(&mut self, txn: &mut Txn, idx: usize) -> SapResult<(Seq, Seq)> {
        self.begin_write(txn)?;
        let len = self.len();
        if idx > len {
            return Err(SapError::IndexOutOfRange { index: idx, len });
        }

        let tree = self.take_tree();
        let (left, right) = self.finish(split_parts(tree, idx, txn).map(|parts| (Tree::Empty, parts)))?;
        Ok((self.derived(left, txn), self.derived(right, txn)))
    }

    /// Remove the element at `idx` (when `remove`) and/or insert `insert`
    /// there. Returns the removed element.
    ///
    /// With `remove` the index must be `< len`; an insert alone accepts
    /// `idx == len`.
    pub fn splice(
        &mut self,
        txn: &mut Txn,
        idx: usize,
        remove: bool,
        insert: Option<u32>,
    ) -> SapResult<Option<u32>> {
        self.begin_write(txn)?;
        let len = self.len();
        let limit = if remove { len } else { len + 1 };
        if idx >= limit {
            return Err(SapError::IndexOutOfRange { index: idx, len });
        }
        let tree = self.take_tree();
        let result = splice_tree(tree, idx, remove, insert, txn);
        self.finish(result)
    }

    /// Replace the content of `self` with that of `content`.
    pub fn replace(&mut self, txn: &mut Txn, mut content: Seq) -> SapResult<()> {
        if !self.env.same(&content.env) {
            return Err(SapError::invalid("cannot replace with a sequence from a different environment"));
        }
        content.settle();
        let tree = match content.root {
            Root::Valid(tree) => tree,
            Root::Poisoned => return Err(SapError::Poisoned),
        };
        self.begin_write(txn)?;
        self.root = Root::Valid(tree);
        Ok(())
    }

    /// Structurally identical copy with freshly allocated nodes.
    pub fn deep_clone(&self, txn: &mut Txn) -> SapResult<Seq> {
        if !self.env.same(txn.env()) {
            return Err(SapError::invalid("transaction belongs to a different environment"));
        }
        let tree = self.with_current(Tree::clone)?;
        let copy = clone_tree(&tree, txn)?;
        Ok(self.derived(copy, txn))
    }

    /// In-order iterator over the elements.
    pub fn iter(&self) -> SapResult<Iter> {
        let tree = self.with_current(Tree::clone)?;
        let remaining = tree.size();
        Ok(Iter { stack: vec![Frame::Tree(tree)], remaining })
    }

    /// Copy all elements out.
    pub fn to_vec(&self) -> SapResult<Vec<u32>> {
        Ok(self.iter()?.collect())
    }
}

fn leaf_of(item: Option<Item>) -> SapResult<u32> {
    match item {
        Some(Item::Leaf(value)) => Ok(value),
        Some(Item::Node(_)) => Err(SapError::invalid("internal node at leaf level")),
        None => Err(SapError::Empty),
    }
}

impl std::fmt::Debug for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seq")
            .field("len", &self.len())
            .field("valid", &self.is_valid())
            .field("shadows", &self.shadows.len())
            .finish()
    }
}

enum Frame {
    Tree(Tree),
    Items(smallvec::IntoIter<[Item; 4]>),
}

/// In-order iterator over a [`Seq`].
///
/// Holds its own references to the nodes, so it stays valid while the
/// sequence changes.
pub struct Iter {
    stack: Vec<Frame>,
    remaining: usize,
}

impl Iterator for Iter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            match self.stack.pop()? {
                Frame::Items(mut items) => {
                    if let Some(item) = items.next() {
                        self.stack.push(Frame::Items(items));
                        match item {
                            Item::Leaf(value) => {
                                self.remaining -= 1;
                                return Some(value);
                            }
                            Item::Node(node) => {
                                let children: Digit = node.children.iter().cloned().collect();
                                self.stack.push(Frame::Items(children.into_iter()));
                            }
                        }
                    }
                }
                Frame::Tree(tree) => match tree {
                    Tree::Empty => {}
                    Tree::Single(item) => {
                        let items: Digit = smallvec![item];
                        self.stack.push(Frame::Items(items.into_iter()));
                    }
                    Tree::Deep(deep) => {
                        self.stack.push(Frame::Items(deep.suffix.clone().into_iter()));
                        self.stack.push(Frame::Tree(deep.middle.clone()));
                        self.stack.push(Frame::Items(deep.prefix.clone().into_iter()));
                    }
                },
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter {}
