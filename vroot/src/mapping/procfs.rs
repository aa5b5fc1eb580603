//! /proc/self/exe simulation.
//!
//! When a program was started through ld.so or an emulator, the kernel's
//! `/proc/self/exe` points at the wrong binary. A rule with the PROCFS
//! action routes reads of `/proc/self/exe` (and `/proc/<own pid>/exe`)
//! here; the handler stages, under the session directory, a symlink to
//! the *logical* executable and returns that synthetic path. Staged
//! links live in per-depth trees (`proc/X.<depth>/<logical path>`) so a
//! readlink of the result returns exactly the logical path.

use std::path::PathBuf;

use crate::session::Session;

/// Decide whether `abs_path` needs procfs mapping. `None` means the
/// real path can be used directly.
pub(crate) fn mapping_request(session: &Session, abs_path: &str) -> Option<String> {
    let base = abs_path.strip_prefix("/proc/self/").or_else(|| {
        let own = format!("/proc/{}/", std::process::id());
        abs_path.strip_prefix(own.as_str())
    })?;

    if base != "exe" {
        return None;
    }

    // Prefer the unmapped (original) name, fall back to the mapped one.
    let config = session.config();
    let exe_path = config
        .orig_binary_name
        .as_deref()
        .or(config.real_binary_name.as_deref())?;
    if !exe_path.starts_with('/') {
        return None;
    }

    // if the real link already points at the right place, leave it alone
    if let Ok(dest) = std::fs::read_link(abs_path) {
        if dest.to_str() == Some(exe_path) {
            tracing::debug!("procfs: real link is ok ({abs_path} -> {exe_path})");
            return None;
        }
    }

    stage_exe_symlink(session, exe_path).map(|p| p.to_string_lossy().into_owned())
}

/// Create (if needed) the staged replacement symlink for `exe_path`.
///
/// Several threads or processes may race here; the resulting link is
/// always the same, so losing the race is harmless.
fn stage_exe_symlink(session: &Session, exe_path: &str) -> Option<PathBuf> {
    let depth = crate::paths::PathList::split(exe_path).len();
    let staged = session
        .layout()
        .proc_depth_dir(depth)
        .join(exe_path.trim_start_matches('/'));

    let parent = staged.parent()?;
    if std::fs::create_dir_all(parent).is_err() {
        tracing::error!("procfs: can't stage replacement for /proc/self/exe under the session dir");
        return None;
    }
    match std::os::unix::fs::symlink(exe_path, &staged) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            tracing::error!("procfs: staging symlink failed: {e}");
            return None;
        }
    }
    tracing::debug!(
        "procfs: '/proc/self/exe' staged at '{}' -> '{exe_path}'",
        staged.display()
    );
    Some(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruletree::RuleTreeBuilder;
    use crate::session::SessionConfig;
    use tempfile::TempDir;

    fn session_with_exe(dir: &TempDir, exe: &str) -> Session {
        let config = SessionConfig::new(dir.path()).with_orig_binary_name(exe);
        config.layout().prepare().unwrap();
        RuleTreeBuilder::new()
            .write_to(&config.layout().rule_tree_file())
            .unwrap();
        Session::open(config).unwrap()
    }

    #[test]
    fn test_non_exe_paths_pass() {
        let dir = TempDir::new().unwrap();
        let session = session_with_exe(&dir, "/usr/bin/foo");
        assert_eq!(mapping_request(&session, "/proc/self/maps"), None);
        assert_eq!(mapping_request(&session, "/proc/1/exe"), None);
        assert_eq!(mapping_request(&session, "/etc/passwd"), None);
    }

    #[test]
    fn test_exe_staged_with_correct_target() {
        let dir = TempDir::new().unwrap();
        let session = session_with_exe(&dir, "/usr/bin/foo");

        let staged = mapping_request(&session, "/proc/self/exe").unwrap();
        assert!(staged.starts_with(dir.path().to_str().unwrap()));
        assert!(staged.ends_with("/proc/X.3/usr/bin/foo"));

        let dest = std::fs::read_link(&staged).unwrap();
        assert_eq!(dest.to_str(), Some("/usr/bin/foo"));

        // staging twice is idempotent
        let again = mapping_request(&session, "/proc/self/exe").unwrap();
        assert_eq!(staged, again);
    }
}
