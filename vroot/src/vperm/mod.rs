//! Virtual permissions.
//!
//! Unprivileged builds run tools that expect to chown files to root,
//! mknod device nodes and see the results in later stat calls. The real
//! syscalls fail with EPERM; this module retries them *virtually*: the
//! intended state is recorded per (dev, ino) in the rule tree (via the
//! session daemon, [`rpc`]) and substituted into every stat-family
//! result. When a real call succeeds after all — or the inode's last
//! link disappears — the virtual state is released so it can't leak onto
//! a recycled inode.
//!
//! Simulated device nodes are mode-000 regular files on disk; they are
//! unopenable, which is the intended behavior, and chmod on them is
//! refused so the placeholder can't drift out of sync.

pub mod ids;
pub mod rpc;

use std::ffi::CString;
use std::fs::{OpenOptions, Permissions};
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag};

use crate::error::VpermError;
use crate::ruletree::inodestat::{InodeStat, sim};
use crate::session::Session;
use rpc::VpermRequest;

fn cpath(path: &str) -> Result<CString, Errno> {
    CString::new(path).map_err(|_| Errno::ENOENT)
}

fn last_errno() -> Errno {
    Errno::last()
}

fn io_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

fn raw_stat(path: &str, follow: bool) -> Result<libc::stat, Errno> {
    let c = cpath(path)?;
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe {
        if follow {
            libc::stat(c.as_ptr(), st.as_mut_ptr())
        } else {
            libc::lstat(c.as_ptr(), st.as_mut_ptr())
        }
    };
    if rc < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { st.assume_init() })
}

/// Substitute virtualized fields into a stat result. Returns the number
/// of substituted fields.
pub fn virtualize_stat(session: &Session, st: &mut libc::stat) -> u32 {
    let mut substituted = 0;
    let rec = session
        .ruletree()
        .find_inodestat(st.st_dev, st.st_ino);

    if let Some(rec) = rec {
        if rec.active_fields & sim::UID != 0 {
            st.st_uid = rec.uid;
            substituted += 1;
        }
        if rec.active_fields & sim::GID != 0 {
            st.st_gid = rec.gid;
            substituted += 1;
        }
        if rec.active_fields & sim::MODE != 0 {
            st.st_mode = (st.st_mode & libc::S_IFMT) | (rec.mode & !libc::S_IFMT);
            substituted += 1;
        }
        if rec.active_fields & sim::SUIDSGID != 0 {
            st.st_mode = (st.st_mode & !(libc::S_ISUID | libc::S_ISGID))
                | (rec.suidsgid & (libc::S_ISUID | libc::S_ISGID));
            substituted += 1;
        }
        if rec.active_fields & sim::DEVNODE != 0 {
            st.st_mode = (st.st_mode & !libc::S_IFMT) | (rec.devmode & libc::S_IFMT);
            st.st_rdev = rec.rdev;
            substituted += 1;
        }
    }

    // Files with no virtualized owner belong to the configured default
    // owner (the usual fakeroot view: everything looks root-owned).
    if let Some((uid, gid)) = session.vperm_ids().unknown_file_owner {
        let active = rec.map(|r| r.active_fields).unwrap_or(0);
        if active & sim::UID == 0 {
            st.st_uid = uid;
            substituted += 1;
        }
        if active & sim::GID == 0 {
            st.st_gid = gid;
            substituted += 1;
        }
    }
    substituted
}

/// stat/lstat through the virtualization layer.
pub fn stat_virtualized(session: &Session, host_path: &str, follow: bool) -> Result<libc::stat, Errno> {
    let mut st = raw_stat(host_path, follow)?;
    virtualize_stat(session, &mut st);
    Ok(st)
}

/// fstat through the virtualization layer.
pub fn fstat_virtualized(session: &Session, fd: RawFd) -> Result<libc::stat, Errno> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } < 0 {
        return Err(last_errno());
    }
    let mut st = unsafe { st.assume_init() };
    virtualize_stat(session, &mut st);
    Ok(st)
}

fn record_for(session: &Session, st: &libc::stat) -> InodeStat {
    session
        .ruletree()
        .find_inodestat(st.st_dev, st.st_ino)
        .unwrap_or_else(|| InodeStat::key(st.st_dev, st.st_ino))
}

fn release_fields(session: &Session, st: &libc::stat, mask: u32) -> Result<(), VpermError> {
    if session
        .ruletree()
        .find_inodestat(st.st_dev, st.st_ino)
        .is_some()
    {
        rpc::send(
            session,
            &VpermRequest::Release {
                dev: st.st_dev,
                ino: st.st_ino,
                mask,
            },
        )?;
    }
    Ok(())
}

/// chown/lchown. The real call is attempted first; EPERM falls back to
/// recording the ownership virtually, a real success releases any
/// virtual ownership so the on-disk truth shows through again.
pub fn chown_virtualized(
    session: &Session,
    host_path: &str,
    uid: Option<u32>,
    gid: Option<u32>,
    follow: bool,
) -> Result<(), VpermError> {
    let result = if follow {
        std::os::unix::fs::chown(host_path, uid, gid)
    } else {
        std::os::unix::fs::lchown(host_path, uid, gid)
    };

    let mask = if uid.is_some() { sim::UID } else { 0 } | if gid.is_some() { sim::GID } else { 0 };

    match result {
        Ok(()) => {
            let st = raw_stat(host_path, follow).map_err(VpermError::Real)?;
            release_fields(session, &st, mask)?;
            return Ok(());
        }
        Err(err) if io_errno(&err) != Errno::EPERM => {
            return Err(VpermError::Real(io_errno(&err)));
        }
        Err(_) => {}
    }

    let st = raw_stat(host_path, follow).map_err(VpermError::Real)?;
    let mut rec = record_for(session, &st);
    if let Some(uid) = uid {
        rec.uid = uid;
        rec.active_fields |= sim::UID;
    }
    if let Some(gid) = gid {
        rec.gid = gid;
        rec.active_fields |= sim::GID;
    }
    rpc::send(session, &VpermRequest::Set(rec))?;
    tracing::debug!("chown simulated: '{host_path}' {uid:?}:{gid:?}");
    Ok(())
}

/// chmod. A simulated device node refuses the change (the on-disk
/// placeholder must stay mode 000); otherwise EPERM falls back to
/// recording the mode virtually, split into the plain permission bits
/// and the SUID/SGID pair.
pub fn chmod_virtualized(session: &Session, host_path: &str, mode: u32) -> Result<(), VpermError> {
    let st = raw_stat(host_path, true).map_err(VpermError::Real)?;
    if let Some(rec) = session.ruletree().find_inodestat(st.st_dev, st.st_ino) {
        if rec.active_fields & sim::DEVNODE != 0 {
            return Err(VpermError::Real(Errno::EPERM));
        }
    }

    match std::fs::set_permissions(host_path, Permissions::from_mode(mode)) {
        Ok(()) => {
            release_fields(session, &st, sim::MODE | sim::SUIDSGID)?;
            return Ok(());
        }
        Err(err) if io_errno(&err) != Errno::EPERM => {
            return Err(VpermError::Real(io_errno(&err)));
        }
        Err(_) => {}
    }

    let mut rec = record_for(session, &st);
    rec.mode = mode & !(libc::S_ISUID | libc::S_ISGID) & 0o7777;
    rec.suidsgid = mode & (libc::S_ISUID | libc::S_ISGID);
    rec.active_fields |= sim::MODE | sim::SUIDSGID;
    rpc::send(session, &VpermRequest::Set(rec))?;
    tracing::debug!("chmod simulated: '{host_path}' 0{mode:o}");
    Ok(())
}

/// mknod. EPERM creates a mode-000 placeholder file and records the
/// device type, numbers and permissions virtually. The placeholder is
/// unopenable, which is the desired semantics for a fake device.
pub fn mknod_virtualized(
    session: &Session,
    host_path: &str,
    mode: u32,
    rdev: u64,
) -> Result<(), VpermError> {
    match nix::sys::stat::mknod(
        host_path,
        SFlag::from_bits_truncate(mode),
        Mode::from_bits_truncate(mode),
        rdev as libc::dev_t,
    ) {
        Ok(()) => return Ok(()),
        Err(errno) if errno != Errno::EPERM => return Err(VpermError::Real(errno)),
        Err(_) => {}
    }

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0)
        .open(host_path)
        .map_err(|err| VpermError::Real(io_errno(&err)))?;

    let st = raw_stat(host_path, false).map_err(VpermError::Real)?;
    let mut rec = InodeStat::key(st.st_dev, st.st_ino);
    rec.devmode = mode;
    rec.rdev = rdev;
    rec.mode = mode & 0o7777;
    rec.active_fields = sim::DEVNODE | sim::MODE;
    rpc::send(session, &VpermRequest::Set(rec))?;
    tracing::debug!("mknod simulated: '{host_path}' 0{mode:o} rdev={rdev}");
    Ok(())
}

/// mkdir. As simulated root with root-fs-permission simulation active,
/// the real directory gets owner-RWX (so this process can use it) and
/// the requested mode is recorded virtually.
pub fn mkdir_virtualized(session: &Session, host_path: &str, mode: u32) -> Result<(), VpermError> {
    let idblock = session.vperm_ids();
    let force_owner_rwx = idblock.is_virtual_root() && idblock.simulate_root_fs_permissions;
    let real_mode = if force_owner_rwx { mode | 0o700 } else { mode };

    nix::unistd::mkdir(host_path, Mode::from_bits_truncate(real_mode))
        .map_err(VpermError::Real)?;

    if force_owner_rwx && real_mode != mode {
        let st = raw_stat(host_path, false).map_err(VpermError::Real)?;
        let mut rec = record_for(session, &st);
        rec.mode = mode & !(libc::S_ISUID | libc::S_ISGID) & 0o7777;
        rec.suidsgid = mode & (libc::S_ISUID | libc::S_ISGID);
        rec.active_fields |= sim::MODE | sim::SUIDSGID;
        rpc::send(session, &VpermRequest::Set(rec))?;
    }
    Ok(())
}

/// unlink. When the last link of a virtualized inode goes away, the
/// record is cleared so a recycled (dev, ino) starts clean.
pub fn unlink_virtualized(session: &Session, host_path: &str) -> Result<(), VpermError> {
    let st = raw_stat(host_path, false).ok();
    std::fs::remove_file(host_path).map_err(|err| VpermError::Real(io_errno(&err)))?;
    if let Some(st) = st {
        if st.st_nlink <= 1 {
            clear_record(session, &st)?;
        }
    }
    Ok(())
}

/// rmdir; an empty directory has nlink == 2.
pub fn rmdir_virtualized(session: &Session, host_path: &str) -> Result<(), VpermError> {
    let st = raw_stat(host_path, false).ok();
    std::fs::remove_dir(host_path).map_err(|err| VpermError::Real(io_errno(&err)))?;
    if let Some(st) = st {
        if st.st_nlink <= 2 {
            clear_record(session, &st)?;
        }
    }
    Ok(())
}

/// rename; clears the overwritten destination's record when the rename
/// removed its last link.
pub fn rename_virtualized(
    session: &Session,
    host_old: &str,
    host_new: &str,
) -> Result<(), VpermError> {
    let dest = raw_stat(host_new, false).ok();
    std::fs::rename(host_old, host_new).map_err(|err| VpermError::Real(io_errno(&err)))?;
    if let Some(st) = dest {
        let last_link = if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            st.st_nlink <= 2
        } else {
            st.st_nlink <= 1
        };
        if last_link {
            clear_record(session, &st)?;
        }
    }
    Ok(())
}

fn clear_record(session: &Session, st: &libc::stat) -> Result<(), VpermError> {
    if session
        .ruletree()
        .find_inodestat(st.st_dev, st.st_ino)
        .is_some()
    {
        rpc::send(
            session,
            &VpermRequest::Clear {
                dev: st.st_dev,
                ino: st.st_ino,
            },
        )?;
    }
    Ok(())
}

// ─── uid/gid gates ──────────────────────────────────────────────────────

pub fn getuid(session: &Session) -> u32 {
    session.vperm_ids().uids.real
}

pub fn geteuid(session: &Session) -> u32 {
    session.vperm_ids().uids.effective
}

pub fn getgid(session: &Session) -> u32 {
    session.vperm_ids().gids.real
}

pub fn getegid(session: &Session) -> u32 {
    session.vperm_ids().gids.effective
}

pub fn getresuid(session: &Session) -> (u32, u32, u32) {
    let ids = session.vperm_ids().uids;
    (ids.real, ids.effective, ids.saved)
}

pub fn getresgid(session: &Session) -> (u32, u32, u32) {
    let ids = session.vperm_ids().gids;
    (ids.real, ids.effective, ids.saved)
}

macro_rules! id_setter {
    ($name:ident, $block:ident, $method:ident, ($($arg:ident: $ty:ty),+)) => {
        pub fn $name(session: &Session, $($arg: $ty),+) -> Result<(), Errno> {
            let mut ids = session.vperm_ids();
            let privileged = ids.is_virtual_root();
            ids.$block.$method($($arg,)+ privileged)?;
            session.set_vperm_ids(ids);
            Ok(())
        }
    };
}

id_setter!(setuid, uids, set_id, (uid: u32));
id_setter!(setgid, gids, set_id, (gid: u32));
id_setter!(seteuid, uids, set_effective, (euid: u32));
id_setter!(setegid, gids, set_effective, (egid: u32));
id_setter!(setreuid, uids, set_re, (ruid: Option<u32>, euid: Option<u32>));
id_setter!(setregid, gids, set_re, (rgid: Option<u32>, egid: Option<u32>));
id_setter!(
    setresuid,
    uids,
    set_res,
    (ruid: Option<u32>, euid: Option<u32>, suid: Option<u32>)
);
id_setter!(
    setresgid,
    gids,
    set_res,
    (rgid: Option<u32>, egid: Option<u32>, sgid: Option<u32>)
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruletree::RuleTreeBuilder;
    use crate::ruletree::inodestat::write_inodestat;
    use crate::session::SessionConfig;
    use tempfile::TempDir;

    fn scratch_session(dir: &TempDir, vperm_ids: Option<&str>) -> Session {
        let mut config = SessionConfig::new(dir.path());
        if let Some(ids) = vperm_ids {
            config = config.with_vperm_ids(ids);
        }
        config.layout().prepare().unwrap();
        RuleTreeBuilder::new()
            .write_to(&config.layout().rule_tree_file())
            .unwrap();
        Session::open(config).unwrap()
    }

    #[test]
    fn test_stat_substitution() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir, None);

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let st = raw_stat(file.to_str().unwrap(), true).unwrap();

        let mut rec = InodeStat::key(st.st_dev, st.st_ino);
        rec.uid = 0;
        rec.gid = 0;
        rec.mode = 0o4755 & 0o1777;
        rec.active_fields = sim::UID | sim::GID | sim::MODE;
        write_inodestat(&session.layout().rule_tree_file(), &rec).unwrap();

        let vst = stat_virtualized(&session, file.to_str().unwrap(), true).unwrap();
        assert_eq!(vst.st_uid, 0);
        assert_eq!(vst.st_gid, 0);
        assert_eq!(vst.st_mode & 0o7777, 0o755);
        // the file-type bits survive mode substitution
        assert_eq!(vst.st_mode & libc::S_IFMT, libc::S_IFREG);
    }

    #[test]
    fn test_devnode_substitution() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir, None);

        let file = dir.path().join("null");
        std::fs::write(&file, b"").unwrap();
        let st = raw_stat(file.to_str().unwrap(), true).unwrap();

        let mut rec = InodeStat::key(st.st_dev, st.st_ino);
        rec.devmode = libc::S_IFCHR | 0o666;
        rec.rdev = libc::makedev(1, 3);
        rec.active_fields = sim::DEVNODE;
        write_inodestat(&session.layout().rule_tree_file(), &rec).unwrap();

        let vst = stat_virtualized(&session, file.to_str().unwrap(), true).unwrap();
        assert_eq!(vst.st_mode & libc::S_IFMT, libc::S_IFCHR);
        assert_eq!(vst.st_rdev, libc::makedev(1, 3));
    }

    #[test]
    fn test_unknown_file_owner_default() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir, Some("u0:0:0:0,g0:0:0:0,f0.0"));

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let vst = stat_virtualized(&session, file.to_str().unwrap(), true).unwrap();
        assert_eq!(vst.st_uid, 0);
        assert_eq!(vst.st_gid, 0);
    }

    #[test]
    fn test_id_gates() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir, Some("u0:0:0:0,g0:0:0:0"));

        assert_eq!(geteuid(&session), 0);
        // virtual root can become any uid
        setuid(&session, 1000).unwrap();
        assert_eq!(getuid(&session), 1000);
        assert_eq!(geteuid(&session), 1000);
        // and once unprivileged, can't come back
        assert_eq!(setuid(&session, 0), Err(Errno::EPERM));
        assert_eq!(getresuid(&session), (1000, 1000, 1000));
    }

    #[test]
    fn test_chmod_refused_on_simulated_devnode() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir, None);

        let file = dir.path().join("dev");
        std::fs::write(&file, b"").unwrap();
        let st = raw_stat(file.to_str().unwrap(), true).unwrap();
        let mut rec = InodeStat::key(st.st_dev, st.st_ino);
        rec.devmode = libc::S_IFBLK | 0o660;
        rec.active_fields = sim::DEVNODE;
        write_inodestat(&session.layout().rule_tree_file(), &rec).unwrap();

        let err = chmod_virtualized(&session, file.to_str().unwrap(), 0o644).unwrap_err();
        assert_eq!(err.errno(), Errno::EPERM);
    }
}
