//! Virtual path resolution: the symlink-following walk.
//!
//! The kernel can't resolve symlinks for us — a link under the virtual
//! view must itself be mapped before it is followed. So the resolver
//! walks a clean absolute virtual path one component at a time, maps
//! each prefix to its host location, readlink()s there, and on a symlink
//! splices the target into the virtual path and recurses. The output is
//! a *virtual* path again, whose non-final components are known not to
//! be symlinks; rule translation of that path happens afterwards.
//!
//! `..` cleanup lives here too: removing `x/..` is only sound when `x`
//! is known not to be a symlink, which in general requires resolving the
//! prefix.

use nix::errno::Errno;
use vroot_shared::LogLevel;

use crate::paths::{Cleanliness, LinkState, PathList};
use crate::ruletree::fsrule::flags;
use crate::session::Session;

use super::{MappingContext, engine};

/// Symlink expansions allowed before the walk reports ELOOP.
pub const MAX_SYMLINK_NESTING: u32 = 16;

/// Name reported as the "binary" for prefix mappings done on behalf of
/// the resolver (visible in rule binary-name filters and in logs).
const RESOLVER_BINARY_NAME: &str = "PATH_RESOLUTION";

fn force_orig_path_active(session: &Session, path_flags: u32) -> bool {
    if path_flags & flags::FORCE_ORIG_PATH != 0 {
        return true;
    }
    path_flags & flags::FORCE_ORIG_PATH_UNLESS_CHROOT != 0 && session.chroot_path().is_none()
}

fn clean(session: &Session, ctx: &MappingContext<'_>, list: &mut PathList) -> Result<(), Errno> {
    match list.cleanliness() {
        Cleanliness::Clean => Ok(()),
        Cleanliness::HasDots => {
            list.remove_dots();
            Ok(())
        }
        Cleanliness::HasDotDots => {
            list.remove_dots();
            clean_dotdots(session, ctx, list)
        }
    }
}

/// Walk a clean absolute virtual path and resolve every symlink in it
/// (optionally sparing the final component). Returns the resolved
/// virtual path.
pub(crate) fn resolve_virtual_path(
    session: &Session,
    ctx: &MappingContext<'_>,
    mut list: PathList,
    nest: u32,
) -> Result<PathList, Errno> {
    if nest > MAX_SYMLINK_NESTING {
        tracing::error!(
            "too many levels of symbolic links (path='{list}')"
        );
        return Err(Errno::ELOOP);
    }
    if !list.absolute {
        tracing::error!("path resolution needs an absolute path ('{list}')");
        return Err(Errno::EINVAL);
    }
    clean(session, ctx, &mut list)?;

    let path_str = list.to_string();
    let res_ctx = MappingContext {
        binary_name: RESOLVER_BINARY_NAME,
        func_name: ctx.func_name,
        fn_class: ctx.fn_class,
        dont_resolve_final_symlink: false,
    };
    let (min_path_len, translate_all) =
        engine::mapping_requirements(session, &res_ctx, session.fwd_rules(), &path_str);

    // Skip components the rule needs intact: resolving them could change
    // the prefix the rule was selected on.
    let mut idx = 0;
    let mut skipped_len = 1; // the leading '/'
    while idx < list.len() && skipped_len < min_path_len {
        skipped_len += list.components()[idx].name.len() + 1;
        idx += 1;
    }
    tracing::trace!("path resolution starts at component {idx} of '{path_str}'");

    if idx >= list.len() {
        return Ok(list);
    }

    let translate_prefix = |prefix: &str| -> Result<(String, u32), Errno> {
        engine::translate(session, &res_ctx, session.fwd_rules(), prefix, LogLevel::Noise)
            .map(|out| (out.host_path, out.flags))
            .map_err(|e| e.errno())
    };

    let (mut prefix_host, mut prefix_flags) = translate_prefix(&list.prefix_string(idx))?;

    while idx < list.len() {
        if force_orig_path_active(session, prefix_flags) {
            // symlinks must not be followed under this rule
            break;
        }

        // A trailing slash means even the last component names a
        // directory and must be resolved; otherwise honor the caller's
        // lstat()-style request to leave the final symlink alone.
        if !list.trailing_slash && ctx.dont_resolve_final_symlink && idx + 1 == list.len() {
            break;
        }

        if list.components()[idx].link == LinkState::Unknown {
            list.components_mut()[idx].link = match std::fs::read_link(&prefix_host) {
                Ok(target) => LinkState::Symlink(target.to_string_lossy().into_owned()),
                Err(_) => LinkState::NotSymlink,
            };
        }

        if let LinkState::Symlink(target) = &list.components()[idx].link {
            let target = target.clone();
            tracing::trace!("resolution found symlink '{prefix_host}' -> '{target}'");
            return resolve_symlink(session, ctx, &list, idx, &target, nest);
        }

        idx += 1;
        if idx < list.len() {
            if translate_all {
                // decision may depend on the suffix: redo the whole
                // translation for the longer prefix
                (prefix_host, prefix_flags) = translate_prefix(&list.prefix_string(idx))?;
            } else {
                // prefix/dir rules: the next component just lands at the
                // end of the previous host prefix
                prefix_host.push('/');
                prefix_host.push_str(&list.components()[idx].name);
            }
        }
    }

    Ok(list)
}

/// Replace the link-bearing prefix with the link target and recurse.
fn resolve_symlink(
    session: &Session,
    ctx: &MappingContext<'_>,
    list: &PathList,
    idx: usize,
    target: &str,
    nest: u32,
) -> Result<PathList, Errno> {
    let has_rest = idx + 1 < list.len();

    let mut new_list = if target.starts_with('/') {
        // absolute target replaces everything up to and including the link
        let mut t = PathList::split(target);
        if has_rest {
            t.trailing_slash = false;
        }
        t
    } else {
        // Relative target: interpreted from the *virtual* directory of
        // the link (where we pretend to be), not from where the mapping
        // took us on the host.
        let mut base = list.prefix_list(idx);
        let mut t = PathList::split(target);
        if has_rest {
            t.trailing_slash = false;
        }
        base.trailing_slash = list.trailing_slash && !has_rest || t.trailing_slash;
        base.append(t);
        base
    };

    if has_rest {
        for c in &list.components()[idx + 1..] {
            new_list.push(c.clone());
        }
        new_list.trailing_slash = list.trailing_slash;
    }

    if !new_list.absolute {
        tracing::error!("symlink expansion produced a relative path ('{new_list}')");
        return Err(Errno::EINVAL);
    }

    resolve_virtual_path(session, ctx, new_list, nest + 1)
}

/// Remove `..` components from an absolute path without breaking
/// symlink semantics. Three passes:
///
/// 1. leading `..` vanishes (the root is its own parent);
/// 2. `x/..` where `x` is already known not to be a symlink vanishes;
/// 3. for anything left, the parent prefix is resolved (through the
///    mapper for virtual paths, realpath for host paths) — if that
///    changed it, the resolved prefix is spliced in and the cleanup
///    restarts, otherwise the pair is simply dropped.
pub(crate) fn clean_dotdots(
    session: &Session,
    ctx: &MappingContext<'_>,
    list: &mut PathList,
) -> Result<(), Errno> {
    if !list.absolute {
        tracing::error!("clean_dotdots called with a relative path ('{list}')");
        return Err(Errno::EINVAL);
    }
    list.remove_dots();

    'restart: loop {
        // pass 1: the root's parent is the root
        while list.components().first().is_some_and(|c| c.is_dotdot()) {
            if list.len() == 1 {
                list.trailing_slash = true;
            }
            list.remove(0);
        }
        if list.cleanliness() != Cleanliness::HasDotDots {
            return Ok(());
        }

        // pass 2: drop pairs whose left side can't be a symlink
        let mut has_nontrivial = false;
        let mut i = 0;
        while i < list.len() {
            if !list.components()[i].is_dotdot() {
                i += 1;
                continue;
            }
            let prev_safe = i == 0 || list.components()[i - 1].known_not_symlink();
            if !prev_safe {
                has_nontrivial = true;
                i += 1;
                continue;
            }
            if i + 1 == list.len() {
                list.trailing_slash = true;
            }
            list.remove(i);
            if i > 0 {
                list.remove(i - 1);
                i -= 1;
            }
        }
        if !has_nontrivial {
            return Ok(());
        }

        // pass 3: the remaining ones need their parent prefix resolved
        let mut i = 0;
        while i < list.len() {
            if !list.components()[i].is_dotdot() {
                i += 1;
                continue;
            }

            let parent = list.prefix_list(i);
            let parent_str = parent.to_string();
            let resolved_str = if list.host_path {
                // host path: realpath is enough, no mapper recursion
                std::fs::canonicalize(&parent_str)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| parent_str.clone())
            } else {
                resolve_virtual_path(session, ctx, parent, 0)?.to_string()
            };

            if resolved_str != parent_str {
                // a symlink was resolved away: splice the real prefix in
                // and start over on the new shape
                let mut new_prefix = PathList::split(&resolved_str);
                new_prefix.mark_all_not_symlink();
                list.replace_prefix(i, new_prefix);
                continue 'restart;
            }

            if i + 1 == list.len() {
                list.trailing_slash = true;
            }
            list.remove(i);
            if i > 0 {
                list.remove(i - 1);
                i -= 1;
            }
        }
        return Ok(());
    }
}
