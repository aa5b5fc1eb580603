//! The rule tree: a memory-mapped, offset-linked record arena.
//!
//! The session daemon builds the tree once per session; every sandboxed
//! process maps the same file and reads it for the session's lifetime.
//! All cross-references are 32-bit byte offsets from the file start;
//! offset 0 means "none". The file is append-only — the daemon may add
//! inode-stat records while processes are running, so readers
//! [`refresh`](RuleTree::refresh) before chasing those chains.
//!
//! File layout:
//!
//! ```text
//! 0x00  magic      u32   "VRT1"
//! 0x04  version    u32
//! 0x08  root       u32   offset of the root catalog
//! 0x0c  istat_tbl  u32   offset of the inode-stat bucket table
//! 0x10  file_size  u32   bytes in use
//! ```
//!
//! followed by records, each starting with one kind byte. Everything is
//! little-endian and decoded from byte slices, so record alignment never
//! matters.

pub mod builder;
pub mod exec;
pub mod fsrule;
pub mod inodestat;
pub mod net;

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::error::RuleTreeError;

pub use builder::RuleTreeBuilder;

/// File magic: "VRT1".
pub const MAGIC: u32 = u32::from_le_bytes(*b"VRT1");
pub const VERSION: u32 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 20;

/// Number of inode-stat hash chains.
pub const INODESTAT_BUCKETS: u32 = 64;

/// Record kind tags.
pub mod kind {
    pub const STRING: u8 = 0x01;
    pub const OBJECT_LIST: u8 = 0x02;
    pub const CATALOG: u8 = 0x03;
    pub const UINT32: u8 = 0x04;
    pub const BOOLEAN: u8 = 0x05;
    pub const FS_RULE: u8 = 0x06;
    pub const EXEC_SELECTION_RULE: u8 = 0x07;
    pub const EXEC_PREPROCESSING_RULE: u8 = 0x08;
    pub const NET_RULE: u8 = 0x09;
    pub const INODE_STAT: u8 = 0x0a;
}

/// A reference to a record inside the tree; 0 is "none".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

impl ObjRef {
    pub const NONE: ObjRef = ObjRef(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

/// Read-only view of a rule tree file.
///
/// Cheap accessors copy small values out of the mapping, so no borrows
/// escape the internal lock and a concurrent [`refresh`](Self::refresh)
/// (which may move the mapping) stays safe.
pub struct RuleTree {
    path: PathBuf,
    map: RwLock<Mmap>,
}

impl std::fmt::Debug for RuleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTree")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn rd_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

impl RuleTree {
    /// Map a rule tree file and validate its header.
    pub fn open(path: &Path) -> Result<Self, RuleTreeError> {
        let file = File::open(path).map_err(|source| RuleTreeError::Open {
            path: path.display().to_string(),
            source,
        })?;
        // Safety: the daemon only appends; existing bytes never change
        // underneath us except inode-stat fields, which are plain
        // integers read racily by design (§5 ordering guarantees).
        let map = unsafe { Mmap::map(&file) }.map_err(|source| RuleTreeError::Open {
            path: path.display().to_string(),
            source,
        })?;

        if map.len() < HEADER_SIZE
            || rd_u32(&map, 0) != Some(MAGIC)
            || rd_u32(&map, 4) != Some(VERSION)
        {
            return Err(RuleTreeError::BadHeader(path.display().to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            map: RwLock::new(map),
        })
    }

    /// Remap if the daemon has appended records since we mapped.
    pub fn refresh(&self) -> Result<(), RuleTreeError> {
        let file_len = std::fs::metadata(&self.path)
            .map_err(|source| RuleTreeError::Open {
                path: self.path.display().to_string(),
                source,
            })?
            .len() as usize;
        if file_len <= self.map.read().len() {
            return Ok(());
        }

        let file = File::open(&self.path).map_err(|source| RuleTreeError::Open {
            path: self.path.display().to_string(),
            source,
        })?;
        let new_map = unsafe { Mmap::map(&file) }.map_err(|source| RuleTreeError::Open {
            path: self.path.display().to_string(),
            source,
        })?;
        *self.map.write() = new_map;
        Ok(())
    }

    pub(crate) fn with_map<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.map.read())
    }

    /// Offset of the root catalog.
    pub fn root_catalog(&self) -> ObjRef {
        self.with_map(|m| ObjRef(rd_u32(m, 8).unwrap_or(0)))
    }

    fn kind_at(buf: &[u8], r: ObjRef) -> Option<u8> {
        buf.get(r.0 as usize).copied()
    }

    /// Payload offset of a record, after checking its kind byte.
    pub(crate) fn payload(buf: &[u8], r: ObjRef, expected_kind: u8) -> Option<usize> {
        if r.is_none() || Self::kind_at(buf, r)? != expected_kind {
            return None;
        }
        Some(r.0 as usize + 1)
    }

    /// Read a string record. Returns an owned copy.
    pub fn string_at(&self, r: ObjRef) -> Option<String> {
        self.with_map(|m| {
            let p = Self::payload(m, r, kind::STRING)?;
            let len = rd_u32(m, p)? as usize;
            let bytes = m.get(p + 4..p + 4 + len)?;
            String::from_utf8(bytes.to_vec()).ok()
        })
    }

    pub fn u32_at(&self, r: ObjRef) -> Option<u32> {
        self.with_map(|m| {
            let p = Self::payload(m, r, kind::UINT32)?;
            rd_u32(m, p)
        })
    }

    pub fn bool_at(&self, r: ObjRef) -> Option<bool> {
        self.with_map(|m| {
            let p = Self::payload(m, r, kind::BOOLEAN)?;
            Some(rd_u32(m, p)? != 0)
        })
    }

    /// Number of entries in an object list (0 for anything else).
    pub fn list_len(&self, r: ObjRef) -> u32 {
        self.with_map(|m| {
            Self::payload(m, r, kind::OBJECT_LIST)
                .and_then(|p| rd_u32(m, p))
                .unwrap_or(0)
        })
    }

    /// One entry of an object list.
    pub fn list_item(&self, r: ObjRef, idx: u32) -> ObjRef {
        self.with_map(|m| {
            let Some(p) = Self::payload(m, r, kind::OBJECT_LIST) else {
                return ObjRef::NONE;
            };
            let n = rd_u32(m, p).unwrap_or(0);
            if idx >= n {
                return ObjRef::NONE;
            }
            ObjRef(rd_u32(m, p + 4 + idx as usize * 4).unwrap_or(0))
        })
    }

    /// All entries of an object list.
    pub fn list_items(&self, r: ObjRef) -> Vec<ObjRef> {
        let n = self.list_len(r);
        (0..n).map(|i| self.list_item(r, i)).collect()
    }

    /// The strings of a list of string records (non-strings skipped).
    pub fn string_list(&self, r: ObjRef) -> Vec<String> {
        self.list_items(r)
            .into_iter()
            .filter_map(|item| self.string_at(item))
            .collect()
    }

    /// Look a key up in one catalog record.
    pub fn catalog_get(&self, cat: ObjRef, key: &str) -> ObjRef {
        let n = self.with_map(|m| {
            Self::payload(m, cat, kind::CATALOG)
                .and_then(|p| rd_u32(m, p))
                .unwrap_or(0)
        });
        for i in 0..n {
            let (key_ref, val) = self.with_map(|m| {
                let p = Self::payload(m, cat, kind::CATALOG).unwrap_or(0);
                let entry = p + 4 + i as usize * 8;
                (
                    ObjRef(rd_u32(m, entry).unwrap_or(0)),
                    ObjRef(rd_u32(m, entry + 4).unwrap_or(0)),
                )
            });
            if self.string_at(key_ref).as_deref() == Some(key) {
                return val;
            }
        }
        ObjRef::NONE
    }

    /// Multi-level catalog lookup from the root, e.g.
    /// `lookup(&["cputransparency", "target", "cmd"])`.
    pub fn lookup(&self, keys: &[&str]) -> ObjRef {
        let mut cur = self.root_catalog();
        for key in keys {
            if cur.is_none() {
                return ObjRef::NONE;
            }
            cur = self.catalog_get(cur, key);
        }
        cur
    }

    /// Convenience: multi-level lookup ending in a string record.
    pub fn lookup_string(&self, keys: &[&str]) -> Option<String> {
        self.string_at(self.lookup(keys))
    }

    /// Convenience: multi-level lookup ending in a boolean record.
    pub fn lookup_bool(&self, keys: &[&str]) -> bool {
        self.bool_at(self.lookup(keys)).unwrap_or(false)
    }

    /// Convenience: multi-level lookup ending in a uint32 record.
    pub fn lookup_u32(&self, keys: &[&str]) -> Option<u32> {
        self.u32_at(self.lookup(keys))
    }

    /// Read `count` consecutive u32 fields of a record payload.
    pub(crate) fn fields(&self, r: ObjRef, expected_kind: u8, count: usize) -> Option<Vec<u32>> {
        self.with_map(|m| {
            let p = Self::payload(m, r, expected_kind)?;
            (0..count).map(|i| rd_u32(m, p + i * 4)).collect()
        })
    }
}
