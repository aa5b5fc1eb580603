//! File descriptor → virtual path registry.
//!
//! The *at() family resolves relative paths against a directory fd, but
//! the kernel would resolve them against *host* directories, not
//! virtual ones. So the open-family postprocessors record the absolute
//! virtual path behind every fd they produce; the at-family gates later
//! combine `(dirfd, relpath)` into an absolute virtual path and run it
//! through the ordinary mapper.
//!
//! The table is per-process and fd-indexed. Fds are process-global, so
//! this is one of the few process-global structures in the engine.

use parking_lot::Mutex;
use std::os::fd::RawFd;

use crate::mapping::MappingResult;

static FD_PATHS: Mutex<Vec<Option<String>>> = Mutex::new(Vec::new());

/// Record the absolute virtual path behind an fd (None clears the slot).
pub fn register(fd: RawFd, abs_virtual_path: Option<&str>) {
    if fd < 0 {
        return;
    }
    let path = match abs_virtual_path {
        Some(p) if p.starts_with('/') => Some(p.to_string()),
        Some(p) => {
            tracing::error!("fdpath needs absolute paths (fd {fd}, got '{p}')");
            None
        }
        None => None,
    };

    let mut table = FD_PATHS.lock();
    let idx = fd as usize;
    if table.len() <= idx {
        table.resize(idx + 1, None);
    }
    table[idx] = path;
}

/// Register an open result: combines the original (virtual) pathname
/// with the mapping result's CWD snapshot when the open was relative.
pub fn register_mapping_result(fd: RawFd, res: &MappingResult, virtual_path: &str) {
    if fd < 0 {
        return;
    }
    if virtual_path.starts_with('/') {
        register(fd, Some(virtual_path));
        return;
    }
    match &res.virtual_cwd {
        Some(cwd) => {
            let abs = format!("{}/{}", cwd.trim_end_matches('/'), virtual_path);
            register(fd, Some(&abs));
        }
        None => {
            // no virtual CWD to anchor on: fall back to the mapped path
            register(fd, res.host_path.as_deref());
        }
    }
}

/// The absolute virtual path behind an fd, if known.
pub fn find(fd: RawFd) -> Option<String> {
    if fd < 0 {
        return None;
    }
    FD_PATHS.lock().get(fd as usize).cloned().flatten()
}

/// dup()/dup2()/dup3()/fcntl(F_DUPFD) propagation.
pub fn dup(old_fd: RawFd, new_fd: RawFd) {
    if old_fd == new_fd || new_fd < 0 {
        return;
    }
    let path = find(old_fd);
    register(new_fd, path.as_deref());
}

/// close() clears the slot.
pub fn close(fd: RawFd) {
    register(fd, None);
}

/// Synthesize the absolute virtual path for an at-family call. For an
/// unknown dirfd the relative path is returned as-is with a warning —
/// the call then behaves like the plain (non-at) variant.
pub fn at_family_path(dirfd: RawFd, relpath: &str) -> String {
    if relpath.starts_with('/') {
        return relpath.to_string();
    }
    match find(dirfd) {
        Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), relpath),
        None => {
            tracing::warn!("no path registered for dirfd {dirfd}; using '{relpath}' as-is");
            relpath.to_string()
        }
    }
}
