//! Inode-stat records: per-(dev, ino) virtualized ownership state.
//!
//! Records hang off a 64-entry bucket table written right after the file
//! header. The engine only reads them; mutations go through the session
//! daemon, whose writer side lives here too (`write_inodestat` etc. work
//! on the file, not on a mapping) so the daemon and the tests share one
//! implementation. Readers may observe a record for one RPC round-trip
//! after it changed; that staleness is part of the contract.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{INODESTAT_BUCKETS, ObjRef, RuleTree, kind};

/// Which fields of a record are active.
pub mod sim {
    pub const UID: u32 = 0x01;
    pub const GID: u32 = 0x02;
    /// Permission bits other than SUID/SGID.
    pub const MODE: u32 = 0x04;
    pub const SUIDSGID: u32 = 0x08;
    /// The inode simulates a device node: `devmode` and `rdev` apply.
    pub const DEVNODE: u32 = 0x10;
}

/// Payload size of an inode-stat record (without the kind byte).
const PAYLOAD: usize = 52;

/// One virtualized inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeStat {
    pub dev: u64,
    pub ino: u64,
    pub active_fields: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub suidsgid: u32,
    /// Full st_mode (file type + permissions) of the simulated device.
    pub devmode: u32,
    pub rdev: u64,
}

impl InodeStat {
    pub fn key(dev: u64, ino: u64) -> Self {
        Self {
            dev,
            ino,
            ..Self::default()
        }
    }
}

fn bucket_of(dev: u64, ino: u64) -> u32 {
    ((dev ^ ino) % INODESTAT_BUCKETS as u64) as u32
}

fn rd_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(off..off + 4)?.try_into().unwrap()))
}

fn rd_u64(buf: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(off..off + 8)?.try_into().unwrap()))
}

fn decode(buf: &[u8], r: ObjRef) -> Option<(InodeStat, ObjRef)> {
    let off = r.0 as usize;
    if *buf.get(off)? != kind::INODE_STAT {
        return None;
    }
    let p = off + 1;
    let rec = InodeStat {
        dev: rd_u64(buf, p)?,
        ino: rd_u64(buf, p + 8)?,
        active_fields: rd_u32(buf, p + 16)?,
        uid: rd_u32(buf, p + 20)?,
        gid: rd_u32(buf, p + 24)?,
        mode: rd_u32(buf, p + 28)?,
        suidsgid: rd_u32(buf, p + 32)?,
        devmode: rd_u32(buf, p + 36)?,
        rdev: rd_u64(buf, p + 40)?,
    };
    let next = ObjRef(rd_u32(buf, p + 48)?);
    Some((rec, next))
}

fn encode_payload(rec: &InodeStat, next: ObjRef) -> [u8; PAYLOAD] {
    let mut out = [0u8; PAYLOAD];
    out[0..8].copy_from_slice(&rec.dev.to_le_bytes());
    out[8..16].copy_from_slice(&rec.ino.to_le_bytes());
    out[16..20].copy_from_slice(&rec.active_fields.to_le_bytes());
    out[20..24].copy_from_slice(&rec.uid.to_le_bytes());
    out[24..28].copy_from_slice(&rec.gid.to_le_bytes());
    out[28..32].copy_from_slice(&rec.mode.to_le_bytes());
    out[32..36].copy_from_slice(&rec.suidsgid.to_le_bytes());
    out[36..40].copy_from_slice(&rec.devmode.to_le_bytes());
    out[40..48].copy_from_slice(&rec.rdev.to_le_bytes());
    out[48..52].copy_from_slice(&next.0.to_le_bytes());
    out
}

/// Byte offset of a bucket's chain-head slot inside the bucket table.
fn chain_head_slot(buf: &[u8], bucket: u32) -> Option<usize> {
    let tbl = ObjRef(rd_u32(buf, 12)?);
    if tbl.is_none() || *buf.get(tbl.0 as usize)? != kind::OBJECT_LIST {
        return None;
    }
    let p = tbl.0 as usize + 1;
    let n = rd_u32(buf, p)?;
    if bucket >= n {
        return None;
    }
    Some(p + 4 + bucket as usize * 4)
}

/// Find a record (and its offset) in raw file bytes.
fn find_in_bytes(buf: &[u8], dev: u64, ino: u64) -> Option<(ObjRef, InodeStat)> {
    let slot = chain_head_slot(buf, bucket_of(dev, ino))?;
    let mut cur = ObjRef(rd_u32(buf, slot)?);
    while cur.is_some() {
        let (rec, next) = decode(buf, cur)?;
        if rec.dev == dev && rec.ino == ino {
            return Some((cur, rec));
        }
        cur = next;
    }
    None
}

impl RuleTree {
    /// Look up the virtualized state of an inode. Remaps first so records
    /// the daemon appended after our last lookup are visible.
    pub fn find_inodestat(&self, dev: u64, ino: u64) -> Option<InodeStat> {
        let _ = self.refresh();
        self.with_map(|m| find_in_bytes(m, dev, ino).map(|(_, rec)| rec))
            .filter(|rec| rec.active_fields != 0)
    }
}

/// Write (insert or replace) a record. Daemon-side: operates on the file.
pub fn write_inodestat(path: &Path, rec: &InodeStat) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if let Some((at, old)) = find_in_bytes(&buf, rec.dev, rec.ino) {
        // update in place, keeping the chain link
        let next = decode(&buf, at).map(|(_, n)| n).unwrap_or(ObjRef::NONE);
        let mut merged = *rec;
        merged.dev = old.dev;
        merged.ino = old.ino;
        file.seek(SeekFrom::Start(at.0 as u64 + 1))?;
        file.write_all(&encode_payload(&merged, next))?;
        return Ok(());
    }

    let slot = chain_head_slot(&buf, bucket_of(rec.dev, rec.ino))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no inode-stat table"))?;
    let old_head = ObjRef(rd_u32(&buf, slot).unwrap_or(0));

    // append the new record at the end of the file
    let new_off = buf.len() as u32;
    file.seek(SeekFrom::End(0))?;
    file.write_all(&[kind::INODE_STAT])?;
    file.write_all(&encode_payload(rec, old_head))?;

    // link it as the new chain head and grow the recorded file size
    file.seek(SeekFrom::Start(slot as u64))?;
    file.write_all(&new_off.to_le_bytes())?;
    file.seek(SeekFrom::Start(16))?;
    file.write_all(&(new_off + 1 + PAYLOAD as u32).to_le_bytes())?;
    Ok(())
}

/// Deactivate some fields of a record; clears it entirely when the mask
/// removes the last active field. No-op if there is no record.
pub fn release_inodestat_fields(path: &Path, dev: u64, ino: u64, mask: u32) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if let Some((at, mut rec)) = find_in_bytes(&buf, dev, ino) {
        rec.active_fields &= !mask;
        file.seek(SeekFrom::Start(at.0 as u64 + 1 + 16))?;
        file.write_all(&rec.active_fields.to_le_bytes())?;
    }
    Ok(())
}

/// Clear the whole record for an inode (used when the last link is gone).
pub fn clear_inodestat(path: &Path, dev: u64, ino: u64) -> io::Result<()> {
    release_inodestat_fields(path, dev, ino, u32::MAX)
}
