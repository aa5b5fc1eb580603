//! Virtual permission flows against a live (in-process) vperm daemon:
//! chown/chmod/mknod that either succeed for real or get simulated, and
//! record lifecycle on unlink.

mod common;

use common::{TestSession, build_session_with, spawn_vperm_daemon};
use nix::errno::Errno;
use vroot::ruletree::inodestat::sim;
use vroot::vperm;
use vroot::vperm::rpc::{self, VpermRequest};

fn vperm_root_session() -> TestSession {
    let ts = build_session_with(
        |_b, _tmp| {},
        |config| config.with_vperm_ids("u0:0:0:0,g0:0:0:0"),
    );
    spawn_vperm_daemon(&ts.session);
    ts
}

fn stat_key(path: &str) -> (u64, u64) {
    let st = std::fs::metadata(path).unwrap();
    use std::os::unix::fs::MetadataExt;
    (st.dev(), st.ino())
}

#[test]
fn test_rpc_roundtrip_through_daemon() {
    let ts = vperm_root_session();
    let file = ts.host("f");
    std::fs::write(&file, b"x").unwrap();
    let (dev, ino) = stat_key(&file);

    let mut rec = vroot::ruletree::inodestat::InodeStat::key(dev, ino);
    rec.active_fields = sim::UID | sim::GID;
    rec.uid = 4242;
    rec.gid = 4242;
    rpc::send(&ts.session, &VpermRequest::Set(rec)).unwrap();

    let found = ts.session.ruletree().find_inodestat(dev, ino).unwrap();
    assert_eq!(found.uid, 4242);

    rpc::send(&ts.session, &VpermRequest::Clear { dev, ino }).unwrap();
    assert!(ts.session.ruletree().find_inodestat(dev, ino).is_none());
}

#[test]
fn test_chown_then_stat_agrees() {
    // as virtual root, chown to an arbitrary owner must be observed by
    // a later stat — whether the real chown worked (running as real
    // root) or the ownership was recorded virtually (EPERM path)
    let ts = vperm_root_session();
    let file = ts.host("owned");
    std::fs::write(&file, b"x").unwrap();

    vperm::chown_virtualized(&ts.session, &file, Some(4321), Some(4321), true).unwrap();

    let st = vperm::stat_virtualized(&ts.session, &file, true).unwrap();
    assert_eq!(st.st_uid, 4321);
    assert_eq!(st.st_gid, 4321);

    // giving the file back to its real owner releases the simulation
    let real_uid = nix::unistd::getuid().as_raw();
    let real_gid = nix::unistd::getgid().as_raw();
    vperm::chown_virtualized(&ts.session, &file, Some(real_uid), Some(real_gid), true).unwrap();
    let st = vperm::stat_virtualized(&ts.session, &file, true).unwrap();
    assert_eq!(st.st_uid, real_uid);
    assert_eq!(st.st_gid, real_gid);
}

#[test]
fn test_chmod_mode_bits_roundtrip() {
    // property: after chmod(m) the observed permission bits equal
    // m & 07777 and the file type bits survive
    let ts = vperm_root_session();
    let file = ts.host("modefile");
    std::fs::write(&file, b"x").unwrap();

    vperm::chmod_virtualized(&ts.session, &file, 0o4755).unwrap();

    let st = vperm::stat_virtualized(&ts.session, &file, true).unwrap();
    assert_eq!(st.st_mode & 0o7777, 0o4755);
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFREG);
}

#[test]
fn test_mknod_produces_a_device() {
    let ts = vperm_root_session();
    let node = ts.host("null");
    let rdev = libc::makedev(1, 3);

    vperm::mknod_virtualized(&ts.session, &node, libc::S_IFCHR | 0o666, rdev).unwrap();

    let st = vperm::stat_virtualized(&ts.session, &node, false).unwrap();
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFCHR);
    assert_eq!(st.st_rdev, rdev);

    // when the device is only simulated, chmod on it is refused so the
    // on-disk placeholder can't drift out of sync
    let (dev, ino) = stat_key(&node);
    if ts.session.ruletree().find_inodestat(dev, ino).is_some() {
        let err = vperm::chmod_virtualized(&ts.session, &node, 0o600).unwrap_err();
        assert_eq!(err.errno(), Errno::EPERM);
    }
}

#[test]
fn test_unlink_clears_virtual_state() {
    let ts = vperm_root_session();
    let file = ts.host("doomed");
    std::fs::write(&file, b"x").unwrap();
    let (dev, ino) = stat_key(&file);

    let mut rec = vroot::ruletree::inodestat::InodeStat::key(dev, ino);
    rec.active_fields = sim::UID;
    rec.uid = 0;
    rpc::send(&ts.session, &VpermRequest::Set(rec)).unwrap();
    assert!(ts.session.ruletree().find_inodestat(dev, ino).is_some());

    vperm::unlink_virtualized(&ts.session, &file).unwrap();

    // the last link is gone: no residual virtual fields for a recycled inode
    assert!(ts.session.ruletree().find_inodestat(dev, ino).is_none());
    assert!(!std::path::Path::new(&file).exists());
}

#[test]
fn test_mkdir_as_virtual_root_keeps_requested_mode() {
    let ts = vperm_root_session();
    let dir = ts.host("restricted");

    vperm::mkdir_virtualized(&ts.session, &dir, 0o555).unwrap();

    // the real directory is owner-usable, the observed mode is what was
    // asked for
    let st = vperm::stat_virtualized(&ts.session, &dir, true).unwrap();
    assert_eq!(st.st_mode & 0o7777, 0o555);
    let real = std::fs::metadata(&dir).unwrap();
    use std::os::unix::fs::MetadataExt;
    assert_eq!(real.mode() & 0o700, 0o700);
}
