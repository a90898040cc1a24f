//! Literal table: deduplicated UTF-8 byte runs addressed by LITERAL handles
//!
//! Append-only: ids are assigned densely from 0 and an entry never changes.
//! Bytes are packed into pages whose size comes from
//! [`Config::literal_page_size`](sapling_core::Config); each page holds one
//! arena block so the table counts against the environment's byte budget. A
//! literal larger than a page gets a dedicated page of its own size.
//!
//! Identical byte runs share one id (FNV-1a bucket, then byte comparison).
//!
//! Once [`seal`](LiteralTable::seal)ed the table is read-only and its
//! [`fingerprint`](LiteralTable::fingerprint) identifies the contents, so two
//! processes can confirm they agree before exchanging literal ids.

use hashbrown::HashMap;
use smallvec::SmallVec;

use sapling_core::{Block, Env, SapError, SapResult};

use crate::handle::MAX_PAYLOAD;
use crate::resolver::LiteralSource;

const FNV_OFFSET: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, &b| (h ^ b as u32).wrapping_mul(FNV_PRIME))
}

struct Page {
    data: Vec<u8>,
    _block: Block,
}

/// Location of one literal
#[derive(Clone, Copy)]
struct Entry {
    page: u32,
    offset: u32,
    len: u32,
}

/// Append-only literal table.
pub struct LiteralTable {
    env: Env,
    pages: Vec<Page>,
    /// Page currently filled by small literals
    open_page: Option<usize>,
    entries: Vec<Entry>,
    /// FNV-1a hash → ids with that hash
    dedup: HashMap<u32, SmallVec<[u32; 1]>>,
    sealed: bool,
}

impl LiteralTable {
    pub fn new(env: &Env) -> Self {
        Self {
            env: env.clone(),
            pages: Vec::new(),
            open_page: None,
            entries: Vec::new(),
            dedup: HashMap::new(),
            sealed: false,
        }
    }

    /// Add a byte run and return its id. Returns the existing id when the
    /// same bytes were added before.
    pub fn add(&mut self, bytes: &[u8]) -> SapResult<u32> {
        if self.sealed {
            return Err(SapError::invalid("literal table is sealed"));
        }
        let max = self.env.config().max_literal_bytes;
        if bytes.len() > max {
            return Err(SapError::invalid(format!(
                "literal of {} bytes exceeds limit of {}",
                bytes.len(),
                max
            )));
        }

        let hash = fnv1a(bytes);
        if let Some(ids) = self.dedup.get(&hash) {
            for &id in ids {
                if self.bytes_of(id) == Some(bytes) {
                    return Ok(id);
                }
            }
        }

        let id = self.entries.len() as u32;
        if id > MAX_PAYLOAD {
            return Err(SapError::invalid("literal id space exhausted"));
        }

        let entry = self.store(bytes)?;
        self.entries.push(entry);
        self.dedup.entry(hash).or_default().push(id);
        Ok(id)
    }

    /// Copy `bytes` into page storage.
    fn store(&mut self, bytes: &[u8]) -> SapResult<Entry> {
        let len = bytes.len() as u32;
        if bytes.is_empty() {
            return Ok(Entry { page: 0, offset: 0, len: 0 });
        }

        let page_size = self.env.config().literal_page_size;
        if len > page_size {
            let page = self.new_page(len)?;
            self.pages[page].data.extend_from_slice(bytes);
            return Ok(Entry { page: page as u32, offset: 0, len });
        }

        let reusable = self
            .open_page
            .filter(|&page| self.pages[page].data.len() + bytes.len() <= page_size as usize);
        let page = match reusable {
            Some(page) => page,
            None => {
                let page = self.new_page(page_size)?;
                self.open_page = Some(page);
                page
            }
        };
        let data = &mut self.pages[page].data;
        let offset = data.len() as u32;
        data.extend_from_slice(bytes);
        Ok(Entry { page: page as u32, offset, len })
    }

    fn new_page(&mut self, size: u32) -> SapResult<usize> {
        let block = self.env.alloc_block(size)?;
        self.pages.push(Page { data: Vec::with_capacity(size as usize), _block: block });
        log::debug!("literal table page {} allocated ({} bytes)", self.pages.len() - 1, size);
        Ok(self.pages.len() - 1)
    }

    fn bytes_of(&self, id: u32) -> Option<&[u8]> {
        let entry = self.entries.get(id as usize)?;
        if entry.len == 0 {
            return Some(&[]);
        }
        let start = entry.offset as usize;
        self.pages
            .get(entry.page as usize)?
            .data
            .get(start..start + entry.len as usize)
    }

    /// Bytes of literal `id`.
    pub fn get(&self, id: u32) -> SapResult<&[u8]> {
        self.bytes_of(id).ok_or(SapError::IndexOutOfRange {
            index: id as usize,
            len: self.entries.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make the table read-only.
    pub fn seal(&mut self) {
        if !self.sealed {
            log::debug!("literal table sealed with {} entries", self.entries.len());
        }
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// CRC32C over every entry (length then bytes, in id order).
    pub fn fingerprint(&self) -> SapResult<u32> {
        if !self.sealed {
            return Err(SapError::invalid("fingerprint requires a sealed table"));
        }
        let mut crc = 0;
        for id in 0..self.entries.len() as u32 {
            let bytes = self.get(id)?;
            crc = crc32c::crc32c_append(crc, &(bytes.len() as u32).to_le_bytes());
            crc = crc32c::crc32c_append(crc, bytes);
        }
        Ok(crc)
    }
}

impl LiteralSource for LiteralTable {
    fn resolve_literal(&self, id: u32) -> SapResult<&[u8]> {
        self.get(id)
    }
}

impl std::fmt::Debug for LiteralTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteralTable")
            .field("entries", &self.entries.len())
            .field("pages", &self.pages.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}
