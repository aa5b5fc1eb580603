//! Error types, one enum per subsystem.
//!
//! Failures that a sandboxed program would see as a failing libc call
//! carry an [`Errno`]; configuration problems carry context strings.
//! Nothing here panics and nothing is ever raised across the
//! interposition boundary — callers turn these into `errno` + `-1`.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Session startup failures. These are fatal: without a session there is
/// no rule tree and no mapping.
#[derive(Debug, Error)]
pub enum SessionError {
    /// SBOX_SESSION_DIR is not set.
    #[error("no session: SBOX_SESSION_DIR is not set")]
    NoSessionDir,

    /// The session directory exists but the rule tree can't be used.
    #[error("rule tree: {0}")]
    RuleTree(#[from] RuleTreeError),

    /// SBOX_VPERM_IDS was present but unparseable.
    #[error("invalid SBOX_VPERM_IDS value '{0}'")]
    InvalidVpermIds(String),
}

/// Rule tree open/decode failures.
#[derive(Debug, Error)]
pub enum RuleTreeError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Wrong magic or version.
    #[error("{0} is not a rule tree file")]
    BadHeader(String),

    /// An offset pointed outside the file or at the wrong record kind.
    #[error("corrupt rule tree: {0}")]
    Corrupt(&'static str),

    /// A rule used an action this engine refuses to run
    /// (e.g. the old-engine fallback).
    #[error("unsupported rule action: {0}")]
    UnsupportedAction(&'static str),
}

/// Path mapping failures; the common case ("no rule matched") is not an
/// error, the path simply passes through unmapped.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Resolution failed with a real errno (ELOOP, EIO on readlink, ...).
    #[error("path resolution failed: {0}")]
    Resolution(Errno),

    /// The rule file is broken (exhausted conditional list, bad selector).
    #[error("rule configuration error: {0}")]
    Config(&'static str),
}

impl MappingError {
    /// The errno a libc caller should observe.
    pub fn errno(&self) -> Errno {
        match self {
            Self::Resolution(e) => *e,
            Self::Config(_) => Errno::EIO,
        }
    }
}

/// Exec pipeline failures.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The file can't be executed; carries the errno for the caller
    /// (ENOENT, EACCES, ENOEXEC, EINVAL, ...).
    #[error("exec denied: {0}")]
    Denied(Errno),

    /// A rule (script_deny_exec, missing exec policy) refused the exec.
    #[error("exec refused by policy: {reason}")]
    Refused { reason: &'static str, errno: Errno },

    #[error("mapping: {0}")]
    Mapping(#[from] MappingError),

    #[error("rule tree: {0}")]
    RuleTree(#[from] RuleTreeError),
}

impl ExecError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::Denied(e) => *e,
            Self::Refused { errno, .. } => *errno,
            Self::Mapping(m) => m.errno(),
            Self::RuleTree(_) => Errno::ENOEXEC,
        }
    }
}

/// Virtual-permission failures.
#[derive(Debug, Error)]
pub enum VpermError {
    /// The session daemon is gone; callers that need it treat this as fatal.
    #[error("vperm daemon unavailable: {0}")]
    DaemonUnavailable(#[source] io::Error),

    #[error("vperm daemon refused: {0}")]
    DaemonRefused(Errno),

    /// The underlying real syscall failed with something other than EPERM,
    /// so there is nothing to simulate.
    #[error("real operation failed: {0}")]
    Real(Errno),
}

impl VpermError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::DaemonUnavailable(_) => Errno::EIO,
            Self::DaemonRefused(e) | Self::Real(e) => *e,
        }
    }
}
