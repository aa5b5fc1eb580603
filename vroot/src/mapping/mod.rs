//! Path mapping entry points.
//!
//! Everything a gate needs to translate pathnames: forward mapping
//! (virtual → host) with full symlink resolution, reverse mapping
//! (host → virtual) for getcwd/readlink-style results, and the
//! absolute-virtual-path helper used by the chroot gate.
//!
//! Data flow for one forward mapping:
//!
//! ```text
//! virtual path ─► make absolute (cached virtual CWD / chroot prefix)
//!              ─► clean (dots; dotdots may recurse through the mapper)
//!              ─► resolver (readlink prefixes, splice symlink targets)
//!              ─► rule engine (selector match, action, flags, policy)
//!              ─► clean host path + stable "mapped:"/"pass:" log line
//! ```

pub(crate) mod engine;
pub(crate) mod procfs;
pub(crate) mod resolution;
pub(crate) mod reverse;
pub(crate) mod uniondir;

use nix::errno::Errno;
use vroot_shared::LogLevel;

use crate::logging;
use crate::paths::{Cleanliness, PathList};
use crate::ruletree::fsrule::flags;
use crate::session::{MappingGuard, Session, mapping_disabled_level, with_thread_context};

/// Function-class bits, used to narrow rule applicability to families
/// of intercepted calls. A rule with a class mask matches only callers
/// whose class intersects it.
pub mod fnclass {
    pub const ANY: u32 = 0;
    pub const OPEN: u32 = 1 << 0;
    pub const STAT: u32 = 1 << 1;
    pub const EXEC: u32 = 1 << 2;
    pub const SOCKADDR: u32 = 1 << 3;
    pub const L10N: u32 = 1 << 4;
    pub const CHROOT: u32 = 1 << 5;
    pub const GETCWD: u32 = 1 << 6;
    pub const REALPATH: u32 = 1 << 7;
    pub const MKNOD: u32 = 1 << 8;
    pub const RENAME: u32 = 1 << 9;
    pub const SYMLINK: u32 = 1 << 10;
    pub const REMOVE: u32 = 1 << 11;
    pub const CREAT: u32 = 1 << 12;
}

/// Parameters of one mapping call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappingContext<'a> {
    pub binary_name: &'a str,
    pub func_name: &'a str,
    pub fn_class: u32,
    /// lstat()-style: leave the final component unresolved.
    pub dont_resolve_final_symlink: bool,
}

/// Result of one path mapping call.
#[derive(Debug, Clone, Default)]
pub struct MappingResult {
    /// The mapped host path; `None` only on hard failure.
    pub host_path: Option<String>,
    /// Virtual CWD snapshot, filled when the input path was relative
    /// (needed e.g. to register the path in the fd-path DB).
    pub virtual_cwd: Option<String>,
    /// Exec policy chosen by the matched rule, if any.
    pub exec_policy_name: Option<String>,
    /// Writes through this path should fail with EROFS.
    pub readonly: bool,
    /// Resolution failure (ELOOP, ...), to be surfaced as the call's errno.
    pub errno: Option<Errno>,
    /// Human-readable cause on configuration failures.
    pub error: Option<&'static str>,
}

impl MappingResult {
    fn passthrough(path: &str) -> Self {
        Self {
            host_path: Some(path.to_string()),
            ..Self::default()
        }
    }

    /// The mapped path, or the original when mapping declined.
    pub fn path(&self) -> Option<&str> {
        self.host_path.as_deref()
    }
}

impl Session {
    /// Map one virtual path to its host location.
    ///
    /// `binary_name` is the basename of the calling program (rule
    /// binary filters match against it), `func_name` the intercepted
    /// function (logs + net/fs func filters), `fn_class` its class
    /// bitmask. `dont_resolve_final_symlink` requests lstat()-like
    /// treatment of the last component.
    pub fn map_path(
        &self,
        binary_name: &str,
        func_name: &str,
        fn_class: u32,
        virtual_path: &str,
        dont_resolve_final_symlink: bool,
    ) -> MappingResult {
        let ctx = MappingContext {
            binary_name,
            func_name,
            fn_class,
            dont_resolve_final_symlink,
        };
        map_path_internal(self, &ctx, virtual_path)
    }

    /// Map the file given to an exec-family call. Same as [`map_path`]
    /// with the exec function class; the result carries the exec policy
    /// selected by the matched rule.
    ///
    /// [`map_path`]: Self::map_path
    pub fn map_path_for_exec(&self, binary_name: &str, virtual_path: &str) -> MappingResult {
        let ctx = MappingContext {
            binary_name,
            func_name: "do_exec",
            fn_class: fnclass::EXEC,
            dont_resolve_final_symlink: false,
        };
        map_path_internal(self, &ctx, virtual_path)
    }

    /// Map an absolute host path back to the virtual path it would have
    /// come from. Reversal is best-effort: if no reverse rule covers the
    /// path it is returned unchanged, and callers must tolerate that.
    pub fn reverse_map_path(
        &self,
        binary_name: &str,
        func_name: &str,
        fn_class: u32,
        abs_host_path: &str,
    ) -> String {
        let ctx = MappingContext {
            binary_name,
            func_name,
            fn_class,
            dont_resolve_final_symlink: false,
        };
        reverse::reverse_map_path(self, &ctx, abs_host_path)
    }

    /// Turn a (possibly relative, possibly dirty) virtual path into a
    /// clean absolute virtual path without mapping it. The chroot gate
    /// uses this to normalize its argument.
    pub fn virtual_path_to_abs_virtual_path(
        &self,
        binary_name: &str,
        func_name: &str,
        fn_class: u32,
        virtual_path: &str,
    ) -> Result<String, Errno> {
        let ctx = MappingContext {
            binary_name,
            func_name,
            fn_class,
            dont_resolve_final_symlink: false,
        };

        let mut list = PathList::split(virtual_path);
        if !list.absolute {
            let cwd = reversed_cwd(self, &ctx).ok_or(Errno::ENAMETOOLONG)?;
            list = prepend_prefix(&cwd, list, true);
        }
        let _guard = MappingGuard::new();
        match list.cleanliness() {
            Cleanliness::Clean => {}
            Cleanliness::HasDots => list.remove_dots(),
            Cleanliness::HasDotDots => {
                list.remove_dots();
                resolution::clean_dotdots(self, &ctx, &mut list)?;
            }
        }
        Ok(list.to_string())
    }
}

/// Splice `prefix`'s components in front of `list`.
fn prepend_prefix(prefix: &str, list: PathList, mark_not_symlink: bool) -> PathList {
    let mut base = PathList::split(prefix);
    if mark_not_symlink {
        base.mark_all_not_symlink();
    }
    let trailing = if list.is_empty() {
        base.trailing_slash || list.trailing_slash
    } else {
        list.trailing_slash
    };
    base.append(list);
    base.trailing_slash = trailing;
    base
}

/// The one-slot per-thread CWD reversal cache: reversing is expensive,
/// and most calls arrive in bursts from the same directory.
fn reversed_cwd(session: &Session, ctx: &MappingContext<'_>) -> Option<String> {
    let host_cwd = std::env::current_dir().ok()?.to_str()?.to_string();

    let cached = with_thread_context(|tc| {
        tc.cwd_cache
            .as_ref()
            .filter(|(host, _)| *host == host_cwd)
            .map(|(_, virt)| virt.clone())
    });
    if let Some(virt) = cached {
        tracing::debug!("using cached reversed cwd '{virt}'");
        return Some(virt);
    }

    let virt = if host_cwd == "/" {
        // reversed "/" is always "/"
        "/".to_string()
    } else {
        reverse::reverse_map_path(session, ctx, &host_cwd)
    };
    with_thread_context(|tc| tc.cwd_cache = Some((host_cwd, virt.clone())));
    Some(virt)
}

fn map_path_internal(
    session: &Session,
    ctx: &MappingContext<'_>,
    virtual_orig_path: &str,
) -> MappingResult {
    // an empty path shall always remain empty
    if virtual_orig_path.is_empty() {
        return MappingResult::passthrough("");
    }

    if session.config().disable_mapping {
        logging::log_mapping_disabled("E", ctx.func_name, virtual_orig_path);
        return MappingResult::passthrough(virtual_orig_path);
    }
    let disabled = mapping_disabled_level();
    if disabled > 0 {
        logging::log_mapping_disabled(&disabled.to_string(), ctx.func_name, virtual_orig_path);
        return MappingResult::passthrough(virtual_orig_path);
    }

    let mut result = MappingResult::default();
    let mut list = PathList::split(virtual_orig_path);

    if !list.absolute {
        let Some(cwd) = reversed_cwd(session, ctx) else {
            result.host_path = Some(virtual_orig_path.to_string());
            result.error = Some("mapping failed; failed to make absolute path");
            return result;
        };
        result.virtual_cwd = Some(cwd.clone());
        list = prepend_prefix(&cwd, list, true);
    } else if let Some(chroot) = session.chroot_path() {
        // the virtual chroot prefix applies to absolute paths before
        // any resolution
        if chroot != "/" {
            list = prepend_prefix(&chroot, list, false);
        }
    }

    let _guard = MappingGuard::new();

    match list.cleanliness() {
        Cleanliness::Clean => {}
        Cleanliness::HasDots => list.remove_dots(),
        Cleanliness::HasDotDots => {
            list.remove_dots();
            if let Err(errno) = resolution::clean_dotdots(session, ctx, &mut list) {
                result.errno = Some(errno);
                return result;
            }
        }
    }

    if !list.absolute {
        result.host_path = Some(virtual_orig_path.to_string());
        result.error = Some("mapping failed; failed to make absolute path");
        return result;
    }

    let resolved = match resolution::resolve_virtual_path(session, ctx, list, 0) {
        Ok(resolved) => resolved,
        Err(errno) => {
            result.errno = Some(errno);
            return result;
        }
    };
    let resolved_str = resolved.to_string();

    match engine::translate(
        session,
        ctx,
        session.fwd_rules(),
        &resolved_str,
        LogLevel::Info,
    ) {
        Ok(out) => {
            result.readonly = out.flags & (flags::READONLY | flags::READONLY_FS_ALWAYS) != 0
                || (out.flags & flags::READONLY_FS_IF_NOT_ROOT != 0
                    && !session.vperm_ids().is_virtual_root());
            result.exec_policy_name = out.exec_policy_name;
            result.host_path = Some(out.host_path);
        }
        Err(crate::error::MappingError::Resolution(errno)) => {
            result.errno = Some(errno);
        }
        Err(crate::error::MappingError::Config(msg)) => {
            // configuration errors leave the path unchanged
            tracing::error!("mapping configuration error: {msg} ('{resolved_str}')");
            result.host_path = Some(virtual_orig_path.to_string());
            result.error = Some(msg);
        }
    }
    result
}
