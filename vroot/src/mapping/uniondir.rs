//! Union directories.
//!
//! A UNION_DIR rule presents one virtual directory whose *listing* is
//! the union of several real directories (think of a virtual /usr/bin
//! assembled from a tools collection and the target image). Only the
//! names matter — opening an entry goes back through the mapping engine
//! and lands wherever the rules put it — so the materialized directory
//! contains empty placeholder files, created lazily under the session
//! directory on first access.

use std::fs;
use std::io;

use crate::session::Session;

/// Materialize the union directory for `abs_virtual_path` from
/// `sources` (in order; missing sources are skipped) and return its
/// host path.
pub(crate) fn prepare_union_dir(
    session: &Session,
    abs_virtual_path: &str,
    sources: &[String],
) -> io::Result<String> {
    let dest = session
        .layout()
        .union_dir()
        .join(abs_virtual_path.trim_start_matches('/'));
    fs::create_dir_all(&dest)?;

    for src in sources {
        let entries = match fs::read_dir(src) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("union_dir: skipping source '{src}': {e}");
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let placeholder = dest.join(&name);
            match fs::File::create_new(&placeholder) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
    }

    let dest = dest.to_string_lossy().into_owned();
    tracing::debug!("union_dir: '{abs_virtual_path}' => '{dest}'");
    Ok(dest)
}
