//! Text: copy-on-write Unicode text over a finger-tree sequence
//!
//! A [`Text`] is a handle to shared storage holding one [`Seq`] of packed
//! [`TextHandle`]s. Cloning a text is O(1): both handles point at the same
//! storage. Every mutating call first detaches for write: when the storage is
//! shared it is forked into a private sequence that shares the unchanged
//! nodes, so writes are never visible through other clones.
//!
//! Three families of operations:
//!   - handle ops (`*_handle`): store and return any handle kind
//!   - code point ops: only CODEPOINT handles; other kinds are `Invalid`
//!   - resolved ops (`*_resolved`): expand LITERAL/TREE handles through a
//!     [`HandleExpander`] and work on the resulting scalars
//!
//! UTF-8 input is validated strictly before anything is stored: overlong
//! forms, truncated sequences, encoded surrogates and values past U+10FFFF
//! are rejected and leave the target untouched.

use std::sync::Arc;

use sapling_core::{Env, SapError, SapResult, Txn};

use crate::handle::{TextHandle, MAX_PAYLOAD};
use crate::literal::LiteralTable;
use crate::resolver::HandleExpander;
use crate::seq::{self, Seq};

struct SharedText {
    seq: Seq,
}

/// Copy-on-write text.
#[derive(Clone)]
pub struct Text {
    shared: Arc<SharedText>,
}

impl Text {
    /// Create an empty text bound to `env`.
    pub fn new(env: &Env) -> Self {
        Self::from_seq(Seq::new(env))
    }

    fn from_seq(seq: Seq) -> Self {
        Self { shared: Arc::new(SharedText { seq }) }
    }

    fn seq(&self) -> &Seq {
        &self.shared.seq
    }

    /// Private storage for a write, forking it first if it is shared.
    fn seq_mut(&mut self) -> SapResult<&mut Seq> {
        if Arc::get_mut(&mut self.shared).is_none() {
            let fork = self.shared.seq.fork();
            log::debug!("text detached for write ({} handles)", fork.len());
            self.shared = Arc::new(SharedText { seq: fork });
        }
        Arc::get_mut(&mut self.shared)
            .map(|shared| &mut shared.seq)
            .ok_or_else(|| SapError::invalid("text storage is still shared"))
    }

    pub fn env(&self) -> &Env {
        self.seq().env()
    }

    /// Number of handles (not resolved scalars).
    pub fn len(&self) -> usize {
        self.seq().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid(&self) -> bool {
        self.seq().is_valid()
    }

    /// True when another clone shares this text's storage.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.shared) > 1
    }

    /// True when both texts currently share storage.
    pub fn same_storage(&self, other: &Text) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Discard the content and return to a valid empty state. Other clones
    /// keep their content.
    pub fn reset(&mut self) {
        let env = self.env().clone();
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.seq.reset(),
            None => self.shared = Arc::new(SharedText { seq: Seq::new(&env) }),
        }
    }

    // -----------------------------------------------------------------------
    // Handle ops
    // -----------------------------------------------------------------------

    pub fn push_front_handle(&mut self, txn: &mut Txn, handle: TextHandle) -> SapResult<()> {
        let raw = checked_raw(handle)?;
        self.seq_mut()?.push_front(txn, raw)
    }

    pub fn push_back_handle(&mut self, txn: &mut Txn, handle: TextHandle) -> SapResult<()> {
        let raw = checked_raw(handle)?;
        self.seq_mut()?.push_back(txn, raw)
    }

    pub fn pop_front_handle(&mut self, txn: &mut Txn) -> SapResult<TextHandle> {
        TextHandle::from_raw(self.seq_mut()?.pop_front(txn)?)
    }

    pub fn pop_back_handle(&mut self, txn: &mut Txn) -> SapResult<TextHandle> {
        TextHandle::from_raw(self.seq_mut()?.pop_back(txn)?)
    }

    pub fn get_handle(&self, idx: usize) -> SapResult<TextHandle> {
        TextHandle::from_raw(self.seq().get(idx)?)
    }

    /// Replace the handle at `idx`.
    pub fn set_handle(&mut self, txn: &mut Txn, idx: usize, handle: TextHandle) -> SapResult<()> {
        let raw = checked_raw(handle)?;
        self.check_index(idx, false)?;
        self.seq_mut()?.splice(txn, idx, true, Some(raw))?;
        Ok(())
    }

    /// Insert before `idx`; `idx == len` appends.
    pub fn insert_handle(&mut self, txn: &mut Txn, idx: usize, handle: TextHandle) -> SapResult<()> {
        let raw = checked_raw(handle)?;
        self.check_index(idx, true)?;
        self.seq_mut()?.splice(txn, idx, false, Some(raw))?;
        Ok(())
    }

    /// Remove and return the handle at `idx`.
    pub fn delete_handle(&mut self, txn: &mut Txn, idx: usize) -> SapResult<TextHandle> {
        self.check_index(idx, false)?;
        let removed = self.seq_mut()?.splice(txn, idx, true, None)?;
        removed
            .ok_or_else(|| SapError::invalid("splice removed nothing"))
            .and_then(TextHandle::from_raw)
    }

    /// Range-check before detaching so a bad index never copies storage.
    fn check_index(&self, idx: usize, allow_end: bool) -> SapResult<()> {
        if !self.is_valid() {
            return Err(SapError::Poisoned);
        }
        let len = self.len();
        let in_range = if allow_end { idx <= len } else { idx < len };
        if in_range {
            Ok(())
        } else {
            Err(SapError::IndexOutOfRange { index: idx, len })
        }
    }

    fn check_nonempty(&self) -> SapResult<()> {
        if !self.is_valid() {
            return Err(SapError::Poisoned);
        }
        if self.is_empty() {
            return Err(SapError::Empty);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Code point ops
    // -----------------------------------------------------------------------

    pub fn push_front(&mut self, txn: &mut Txn, c: char) -> SapResult<()> {
        self.push_front_handle(txn, TextHandle::Codepoint(c))
    }

    pub fn push_back(&mut self, txn: &mut Txn, c: char) -> SapResult<()> {
        self.push_back_handle(txn, TextHandle::Codepoint(c))
    }

    /// Remove the first code point. A non-codepoint handle at the front is
    /// `Invalid` and stays in place.
    pub fn pop_front(&mut self, txn: &mut Txn) -> SapResult<char> {
        self.check_nonempty()?;
        self.get(0)?;
        self.pop_front_handle(txn)?.to_codepoint()
    }

    pub fn pop_back(&mut self, txn: &mut Txn) -> SapResult<char> {
        self.check_nonempty()?;
        self.get(self.len() - 1)?;
        self.pop_back_handle(txn)?.to_codepoint()
    }

    pub fn get(&self, idx: usize) -> SapResult<char> {
        self.get_handle(idx)?.to_codepoint()
    }

    pub fn set(&mut self, txn: &mut Txn, idx: usize, c: char) -> SapResult<()> {
        self.set_handle(txn, idx, TextHandle::Codepoint(c))
    }

    pub fn insert(&mut self, txn: &mut Txn, idx: usize, c: char) -> SapResult<()> {
        self.insert_handle(txn, idx, TextHandle::Codepoint(c))
    }

    /// Remove the code point at `idx`. A non-codepoint handle there is
    /// `Invalid` and stays in place.
    pub fn delete(&mut self, txn: &mut Txn, idx: usize) -> SapResult<char> {
        self.get(idx)?;
        self.delete_handle(txn, idx)?.to_codepoint()
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Move the content of `src` to the end of `self`, leaving `src` empty.
    pub fn concat(&mut self, txn: &mut Txn, src: &mut Text) -> SapResult<()> {
        let dest = self.seq_mut()?;
        let src = src.seq_mut()?;
        dest.concat(txn, src)
    }

    /// Split into `[0, idx)` and `[idx, len)`, leaving `self` empty.
    pub fn split_at(&mut self, txn: &mut Txn, idx: usize) -> SapResult<(Text, Text)> {
        if self.is_valid() && idx > self.len() {
            return Err(SapError::IndexOutOfRange { index: idx, len: self.len() });
        }
        let (left, right) = self.seq_mut()?.split_at(txn, idx)?;
        Ok((Text::from_seq(left), Text::from_seq(right)))
    }

    /// Iterate over the decoded handles.
    pub fn handles(&self) -> SapResult<Handles> {
        Ok(Handles { inner: self.seq().iter()? })
    }

    // -----------------------------------------------------------------------
    // UTF-8 bridge
    // -----------------------------------------------------------------------

    /// Replace the content with the code points of `bytes`.
    ///
    /// The input is validated and built into a fresh sequence first; on any
    /// failure the text is unchanged.
    pub fn from_utf8(&mut self, txn: &mut Txn, bytes: &[u8]) -> SapResult<()> {
        if !self.is_valid() {
            return Err(SapError::Poisoned);
        }
        let decoded = decode_strict(bytes)?;
        let mut next = Seq::new(self.env());
        next.extend(txn, decoded.chars().map(|c| TextHandle::Codepoint(c).to_raw()))?;
        self.seq_mut()?.replace(txn, next)
    }

    /// Replace the content with a single LITERAL handle naming `bytes` in
    /// `table`. Empty input yields an empty text.
    pub fn from_utf8_bulk(&mut self, txn: &mut Txn, bytes: &[u8], table: &mut LiteralTable) -> SapResult<()> {
        if !self.is_valid() {
            return Err(SapError::Poisoned);
        }
        decode_strict(bytes)?;
        let mut next = Seq::new(self.env());
        if !bytes.is_empty() {
            let id = table.add(bytes)?;
            next.push_back(txn, checked_raw(TextHandle::Literal(id))?)?;
        }
        self.seq_mut()?.replace(txn, next)
    }

    /// Bytes needed to encode the text. Non-codepoint handles are `Invalid`.
    pub fn utf8_len(&self) -> SapResult<usize> {
        let mut total = 0;
        for handle in self.handles()? {
            total += handle?.to_codepoint()?.len_utf8();
        }
        Ok(total)
    }

    /// Encode into `out`, returning the number of bytes written.
    ///
    /// When `out` is too small nothing is written and the error carries the
    /// required size.
    pub fn to_utf8(&self, out: &mut [u8]) -> SapResult<usize> {
        let required = self.utf8_len()?;
        if out.len() < required {
            return Err(SapError::BufferTooSmall { required, capacity: out.len() });
        }
        let mut pos = 0;
        for handle in self.handles()? {
            let c = handle?.to_codepoint()?;
            pos += encode_into(out, pos, c)?;
        }
        Ok(pos)
    }

    // -----------------------------------------------------------------------
    // Resolved view
    // -----------------------------------------------------------------------

    /// Feed every resolved scalar to `emit`.
    fn for_each_resolved(
        &self,
        expander: Option<&dyn HandleExpander>,
        emit: &mut dyn FnMut(char) -> SapResult<()>,
    ) -> SapResult<()> {
        for handle in self.handles()? {
            match handle? {
                TextHandle::Codepoint(c) => emit(c)?,
                other => expander_for(expander, other)?.expand(other, emit)?,
            }
        }
        Ok(())
    }

    /// Number of scalars after expansion.
    pub fn codepoint_len_resolved(&self, expander: Option<&dyn HandleExpander>) -> SapResult<usize> {
        let mut count = 0;
        self.for_each_resolved(expander, &mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Scalar at resolved position `idx`. Expansion stops at the handle that
    /// contains it.
    ///
    /// Every call walks from the start of the text, so a lookup costs O(n)
    /// in the handles and expanded scalars before `idx`.
    pub fn get_codepoint_resolved(&self, idx: usize, expander: Option<&dyn HandleExpander>) -> SapResult<char> {
        let mut seen = 0usize;
        let mut found = None;
        for handle in self.handles()? {
            match handle? {
                TextHandle::Codepoint(c) => {
                    if seen == idx {
                        return Ok(c);
                    }
                    seen += 1;
                }
                other => {
                    expander_for(expander, other)?.expand(other, &mut |c| {
                        if seen == idx && found.is_none() {
                            found = Some(c);
                        }
                        seen += 1;
                        Ok(())
                    })?;
                    if let Some(c) = found {
                        return Ok(c);
                    }
                }
            }
        }
        Err(SapError::IndexOutOfRange { index: idx, len: seen })
    }

    /// Bytes needed to encode the resolved text.
    pub fn utf8_len_resolved(&self, expander: Option<&dyn HandleExpander>) -> SapResult<usize> {
        let mut total = 0;
        self.for_each_resolved(expander, &mut |c| {
            total += c.len_utf8();
            Ok(())
        })?;
        Ok(total)
    }

    /// Encode the resolved text into `out`. Same buffer contract as
    /// [`to_utf8`](Text::to_utf8).
    pub fn to_utf8_resolved(&self, out: &mut [u8], expander: Option<&dyn HandleExpander>) -> SapResult<usize> {
        let required = self.utf8_len_resolved(expander)?;
        if out.len() < required {
            return Err(SapError::BufferTooSmall { required, capacity: out.len() });
        }
        let mut pos = 0;
        self.for_each_resolved(expander, &mut |c| {
            let n = encode_into(out, pos, c)?;
            pos += n;
            Ok(())
        })?;
        Ok(pos)
    }

    /// Resolved content as an owned byte vector.
    pub fn to_utf8_full(&self, expander: Option<&dyn HandleExpander>) -> SapResult<Vec<u8>> {
        let mut out = String::new();
        self.for_each_resolved(expander, &mut |c| {
            out.push(c);
            Ok(())
        })?;
        Ok(out.into_bytes())
    }
}

impl std::fmt::Debug for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Text")
            .field("len", &self.len())
            .field("valid", &self.is_valid())
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Iterator over the handles of a [`Text`].
pub struct Handles {
    inner: seq::Iter,
}

impl Iterator for Handles {
    type Item = SapResult<TextHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(TextHandle::from_raw)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Packed form of a handle, rejecting ids that do not fit in 30 bits.
fn checked_raw(handle: TextHandle) -> SapResult<u32> {
    match handle {
        TextHandle::Literal(id) | TextHandle::Tree(id) | TextHandle::Reserved(id) if id > MAX_PAYLOAD => {
            Err(SapError::invalid(format!("{:?} id {:#x} exceeds 30 bits", handle.kind(), id)))
        }
        _ => Ok(handle.to_raw()),
    }
}

fn expander_for(expander: Option<&dyn HandleExpander>, handle: TextHandle) -> SapResult<&dyn HandleExpander> {
    expander.ok_or_else(|| SapError::invalid(format!("{:?} handle needs an expander", handle.kind())))
}

fn decode_strict(bytes: &[u8]) -> SapResult<&str> {
    simdutf8::compat::from_utf8(bytes)
        .map_err(|err| SapError::invalid(format!("malformed UTF-8 at byte {}", err.valid_up_to())))
}

fn encode_into(out: &mut [u8], pos: usize, c: char) -> SapResult<usize> {
    let n = c.len_utf8();
    let capacity = out.len();
    let slot = out
        .get_mut(pos..pos + n)
        .ok_or(SapError::BufferTooSmall { required: pos + n, capacity })?;
    c.encode_utf8(slot);
    Ok(n)
}
