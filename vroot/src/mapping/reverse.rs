//! Reverse mapping: host path → virtual path.
//!
//! Used wherever host paths would leak back to the program: getcwd,
//! readlink, realpath results, AF_UNIX peer names. The reverse rule
//! list has the same structure as the forward one and is stored under
//! the sibling `rev_rules` catalog, keyed by the same mode name. A host
//! path without a reverse rule is returned unchanged; callers must
//! tolerate that.

use vroot_shared::LogLevel;

use crate::paths::{Cleanliness, PathList};
use crate::session::Session;

use super::{MappingContext, engine, resolution};

pub(crate) fn reverse_map_path(
    session: &Session,
    ctx: &MappingContext<'_>,
    abs_host_path: &str,
) -> String {
    let rules = session.rev_rules();
    if rules.is_none() {
        tracing::debug!("no reverse rules; '{abs_host_path}' stays as-is");
        return abs_host_path.to_string();
    }

    // host-side cleanup only; no virtual resolution of host paths
    let mut list = PathList::split(abs_host_path);
    list.host_path = true;
    match list.cleanliness() {
        Cleanliness::Clean => {}
        Cleanliness::HasDots => list.remove_dots(),
        Cleanliness::HasDotDots => {
            list.remove_dots();
            if resolution::clean_dotdots(session, ctx, &mut list).is_err() {
                return abs_host_path.to_string();
            }
        }
    }
    let cleaned = list.to_string();

    match engine::translate(session, ctx, rules, &cleaned, LogLevel::Debug) {
        Ok(out) => out.host_path,
        Err(err) => {
            tracing::debug!("reverse mapping of '{abs_host_path}' failed ({err}); keeping it");
            abs_host_path.to_string()
        }
    }
}
