//! Inode-stat mutation RPC.
//!
//! Readers consume inode-stat records straight from the mapped rule
//! tree; mutations are serialized by the session daemon, reached over a
//! unix socket in the session directory. The protocol is one text line
//! per request, one line per reply (`ok` or `err <errno>`); requests
//! block until the daemon answers and there is no timeout — a daemon
//! that disappeared is fatal for callers that need it.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::errno::Errno;

use crate::error::VpermError;
use crate::ruletree::inodestat::{self, InodeStat};
use crate::session::Session;

/// One mutation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpermRequest {
    /// Insert or replace the whole record for `(dev, ino)`.
    Set(InodeStat),
    /// Deactivate the fields in `mask`.
    Release { dev: u64, ino: u64, mask: u32 },
    /// Forget the inode entirely.
    Clear { dev: u64, ino: u64 },
}

impl VpermRequest {
    /// Wire encoding (no trailing newline).
    pub fn to_line(&self) -> String {
        match self {
            Self::Set(r) => format!(
                "set {} {} {} {} {} {} {} {} {}",
                r.dev,
                r.ino,
                r.active_fields,
                r.uid,
                r.gid,
                r.mode,
                r.suidsgid,
                r.devmode,
                r.rdev
            ),
            Self::Release { dev, ino, mask } => format!("release {dev} {ino} {mask}"),
            Self::Clear { dev, ino } => format!("clear {dev} {ino}"),
        }
    }

    /// Parse the wire encoding; the daemon side of `to_line`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut words = line.split_ascii_whitespace();
        let verb = words.next()?;
        let mut num = || words.next().and_then(|w| w.parse::<u64>().ok());
        let req = match verb {
            "set" => Self::Set(InodeStat {
                dev: num()?,
                ino: num()?,
                active_fields: num()? as u32,
                uid: num()? as u32,
                gid: num()? as u32,
                mode: num()? as u32,
                suidsgid: num()? as u32,
                devmode: num()? as u32,
                rdev: num()?,
            }),
            "release" => Self::Release {
                dev: num()?,
                ino: num()?,
                mask: num()? as u32,
            },
            "clear" => Self::Clear {
                dev: num()?,
                ino: num()?,
            },
            _ => return None,
        };
        Some(req)
    }

    /// Apply the request to a rule tree file. This is the daemon side;
    /// the daemon holds its own lock around it.
    pub fn apply(&self, tree_path: &Path) -> io::Result<()> {
        match self {
            Self::Set(rec) => inodestat::write_inodestat(tree_path, rec),
            Self::Release { dev, ino, mask } => {
                inodestat::release_inodestat_fields(tree_path, *dev, *ino, *mask)
            }
            Self::Clear { dev, ino } => inodestat::clear_inodestat(tree_path, *dev, *ino),
        }
    }
}

/// Send one request to the session daemon and wait for its reply.
pub fn send(session: &Session, request: &VpermRequest) -> Result<(), VpermError> {
    let socket = session.layout().vperm_socket();
    let mut stream = UnixStream::connect(&socket).map_err(VpermError::DaemonUnavailable)?;
    stream
        .write_all(format!("{}\n", request.to_line()).as_bytes())
        .map_err(VpermError::DaemonUnavailable)?;

    let mut reply = String::new();
    BufReader::new(&mut stream)
        .read_line(&mut reply)
        .map_err(VpermError::DaemonUnavailable)?;

    let reply = reply.trim_end();
    if reply == "ok" {
        tracing::debug!("vperm rpc ok: {}", request.to_line());
        return Ok(());
    }
    let errno = reply
        .strip_prefix("err ")
        .and_then(|e| e.parse::<i32>().ok())
        .map(Errno::from_raw)
        .unwrap_or(Errno::EIO);
    tracing::debug!("vperm rpc refused ({errno}): {}", request.to_line());
    Err(VpermError::DaemonRefused(errno))
}
