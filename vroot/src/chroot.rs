//! chroot() simulation.
//!
//! No real chroot happens: the engine keeps a per-process virtual
//! chroot prefix which is prepended to every absolute virtual path
//! before mapping (see [`crate::mapping`]). `chroot("/")` switches the
//! simulation off — some tools (rpm) use exactly that dance to escape
//! their build root. Children inherit the prefix via
//! `__SB2_CHROOT_PATH`.

use nix::errno::Errno;

use crate::mapping::fnclass;
use crate::session::Session;

/// The chroot gate: validate `path` and install it as the virtual
/// chroot prefix. Returns the errno a libc caller should observe.
pub fn chroot_gate(session: &Session, func_name: &str, path: &str) -> Result<(), Errno> {
    let binary_name = session.config().binary_name.clone();

    // Normalize the argument on its own first: "/" always exists and
    // only deactivates the simulation.
    let plain = session.virtual_path_to_abs_virtual_path(
        &binary_name,
        func_name,
        fnclass::CHROOT,
        path,
    )?;
    if plain == "/" {
        if let Some(old) = session.chroot_path() {
            tracing::info!("deactivating virtual chroot (was '{old}')");
            session.set_chroot_path(None);
        }
        return Ok(());
    }

    // An absolute argument is relative to the *current* chroot prefix if
    // one is active; the stored prefix is always virtual-root relative.
    let new_chroot = match session.chroot_path() {
        Some(cur) if path.starts_with('/') => session.virtual_path_to_abs_virtual_path(
            &binary_name,
            func_name,
            fnclass::CHROOT,
            &format!("{cur}/{path}"),
        )?,
        _ => plain,
    };

    // Validate the target through the mapper. The mapper applies the
    // old prefix itself, so it gets the caller's original argument —
    // mapping the composed path would apply the prefix twice.
    let mapped = session.map_path(&binary_name, func_name, fnclass::CHROOT, path, false);
    if mapped.errno.is_some() || mapped.host_path.is_none() {
        tracing::debug!("chroot: mapping '{path}' failed");
        return Err(Errno::EPERM);
    }
    let host = mapped.host_path.unwrap();

    let st = crate::vperm::stat_virtualized(session, &host, true).map_err(|_| Errno::ENOENT)?;
    if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
        tracing::debug!("chroot: destination is not a directory ({host})");
        return Err(Errno::ENOTDIR);
    }

    tracing::info!("chroot '{path}' (new virtual chroot prefix '{new_chroot}')");
    session.set_chroot_path(Some(new_chroot));
    Ok(())
}
