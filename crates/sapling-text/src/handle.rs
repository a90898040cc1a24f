//! Tagged text handles
//!
//! A text leaf is a 32-bit value: the top 2 bits are the kind, the low 30 bits
//! the payload.
//!
//! Layout:
//!   [31..30] kind:    0 = CODEPOINT, 1 = LITERAL, 2 = TREE, 3 = RESERVED
//!   [29..0]  payload: Unicode scalar, literal-table id, or subtree id
//!
//! The packed form is what sequences store and what crosses subsystem
//! boundaries; [`TextHandle`] is the checked view handed to callers.

use sapling_core::{SapError, SapResult};

/// Bit position of the kind tag
pub const TAG_SHIFT: u32 = 30;

/// Mask selecting the kind tag
pub const TAG_MASK: u32 = 0xC000_0000;

/// Mask selecting the payload
pub const PAYLOAD_MASK: u32 = 0x3FFF_FFFF;

/// Largest id a LITERAL or TREE handle can carry
pub const MAX_PAYLOAD: u32 = PAYLOAD_MASK;

/// Handle kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    /// Payload is a Unicode scalar value
    Codepoint = 0,
    /// Payload is a literal-table id
    Literal = 1,
    /// Payload is a subtree-registry id
    Tree = 2,
    /// Not interpreted by this crate
    Reserved = 3,
}

impl HandleKind {
    fn from_tag(tag: u32) -> Self {
        match tag & 0b11 {
            0 => HandleKind::Codepoint,
            1 => HandleKind::Literal,
            2 => HandleKind::Tree,
            _ => HandleKind::Reserved,
        }
    }
}

/// One text leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextHandle {
    Codepoint(char),
    Literal(u32),
    Tree(u32),
    Reserved(u32),
}

impl TextHandle {
    /// Build a handle from a kind and payload.
    ///
    /// Fails with `Invalid` when the payload exceeds 30 bits or a CODEPOINT
    /// payload is not a Unicode scalar.
    pub fn make(kind: HandleKind, payload: u32) -> SapResult<Self> {
        if payload > MAX_PAYLOAD {
            return Err(SapError::invalid(format!("handle payload {:#x} exceeds 30 bits", payload)));
        }
        match kind {
            HandleKind::Codepoint => Self::from_codepoint(payload),
            HandleKind::Literal => Ok(TextHandle::Literal(payload)),
            HandleKind::Tree => Ok(TextHandle::Tree(payload)),
            HandleKind::Reserved => Ok(TextHandle::Reserved(payload)),
        }
    }

    /// Handle for a code point, rejecting surrogates and values past U+10FFFF.
    pub fn from_codepoint(codepoint: u32) -> SapResult<Self> {
        char::from_u32(codepoint)
            .map(TextHandle::Codepoint)
            .ok_or_else(|| SapError::invalid(format!("{:#x} is not a Unicode scalar value", codepoint)))
    }

    /// The code point of a CODEPOINT handle.
    pub fn to_codepoint(self) -> SapResult<char> {
        match self {
            TextHandle::Codepoint(c) => Ok(c),
            other => Err(SapError::invalid(format!("{:?} handle is not a code point", other.kind()))),
        }
    }

    pub fn is_codepoint(self) -> bool {
        matches!(self, TextHandle::Codepoint(_))
    }

    pub fn kind(self) -> HandleKind {
        match self {
            TextHandle::Codepoint(_) => HandleKind::Codepoint,
            TextHandle::Literal(_) => HandleKind::Literal,
            TextHandle::Tree(_) => HandleKind::Tree,
            TextHandle::Reserved(_) => HandleKind::Reserved,
        }
    }

    pub fn payload(self) -> u32 {
        match self {
            TextHandle::Codepoint(c) => c as u32,
            TextHandle::Literal(id) | TextHandle::Tree(id) | TextHandle::Reserved(id) => id & PAYLOAD_MASK,
        }
    }

    /// Packed 32-bit form.
    pub fn to_raw(self) -> u32 {
        ((self.kind() as u32) << TAG_SHIFT) | self.payload()
    }

    /// Decode a packed handle.
    pub fn from_raw(raw: u32) -> SapResult<Self> {
        Self::make(raw_kind(raw), raw & PAYLOAD_MASK)
    }
}

impl From<char> for TextHandle {
    fn from(c: char) -> Self {
        TextHandle::Codepoint(c)
    }
}

/// Kind of a packed handle.
pub fn raw_kind(raw: u32) -> HandleKind {
    HandleKind::from_tag((raw & TAG_MASK) >> TAG_SHIFT)
}

/// Payload of a packed handle.
pub fn raw_payload(raw: u32) -> u32 {
    raw & PAYLOAD_MASK
}
