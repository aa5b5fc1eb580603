//! Virtual uid/gid blocks and their wire format.
//!
//! The block travels across exec in `SBOX_VPERM_IDS`:
//!
//! ```text
//! u<r>:<e>:<s>:<fs>,g<r>:<e>:<s>:<fs>[,f<uid>.<gid>][,p]
//! ```
//!
//! `f` names the owner/group to attribute to files without a vperm
//! record; `p` disables root-fs-permission simulation. setuid-family
//! semantics are enforced against these values, never the kernel's.

use nix::errno::Errno;

/// One real/effective/saved/fs id quadruple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSet {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
    pub fs: u32,
}

impl IdSet {
    fn holds(&self, id: u32) -> bool {
        id == self.real || id == self.effective || id == self.saved
    }

    /// setuid()/setgid(): privileged callers set all four; unprivileged
    /// callers may switch the effective id to their real or saved id.
    pub fn set_id(&mut self, id: u32, privileged: bool) -> Result<(), Errno> {
        if privileged {
            *self = IdSet {
                real: id,
                effective: id,
                saved: id,
                fs: id,
            };
            return Ok(());
        }
        if !self.holds(id) {
            return Err(Errno::EPERM);
        }
        self.effective = id;
        self.fs = id;
        Ok(())
    }

    /// seteuid()/setegid().
    pub fn set_effective(&mut self, id: u32, privileged: bool) -> Result<(), Errno> {
        if !privileged && !self.holds(id) {
            return Err(Errno::EPERM);
        }
        self.effective = id;
        self.fs = id;
        Ok(())
    }

    /// setreuid()/setregid(); `None` keeps a value.
    pub fn set_re(
        &mut self,
        real: Option<u32>,
        effective: Option<u32>,
        privileged: bool,
    ) -> Result<(), Errno> {
        if !privileged {
            if let Some(r) = real {
                if r != self.real && r != self.effective {
                    return Err(Errno::EPERM);
                }
            }
            if let Some(e) = effective {
                if !self.holds(e) {
                    return Err(Errno::EPERM);
                }
            }
        }
        let old_real = self.real;
        if let Some(r) = real {
            self.real = r;
        }
        if let Some(e) = effective {
            self.effective = e;
            self.fs = e;
        }
        // the saved id follows the effective id whenever the real id is
        // touched or the effective id diverges from the (old) real id
        if real.is_some() || effective.is_some_and(|e| e != old_real) {
            self.saved = self.effective;
        }
        Ok(())
    }

    /// setresuid()/setresgid(); `None` keeps a value.
    pub fn set_res(
        &mut self,
        real: Option<u32>,
        effective: Option<u32>,
        saved: Option<u32>,
        privileged: bool,
    ) -> Result<(), Errno> {
        if !privileged {
            for id in [real, effective, saved].into_iter().flatten() {
                if !self.holds(id) {
                    return Err(Errno::EPERM);
                }
            }
        }
        if let Some(r) = real {
            self.real = r;
        }
        if let Some(e) = effective {
            self.effective = e;
            self.fs = e;
        }
        if let Some(s) = saved {
            self.saved = s;
        }
        Ok(())
    }

    /// setfsuid()/setfsgid(). Returns the previous fs id; an id the
    /// caller may not assume leaves the value unchanged (as the real
    /// call does).
    pub fn set_fs(&mut self, id: u32, privileged: bool) -> u32 {
        let old = self.fs;
        if privileged || self.holds(id) || id == self.fs {
            self.fs = id;
        }
        old
    }
}

/// The whole virtual id block of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpermIds {
    pub uids: IdSet,
    pub gids: IdSet,
    /// Owner/group to report for files that have no vperm record.
    pub unknown_file_owner: Option<(u32, u32)>,
    /// Simulate root's permission checks on the virtual fs (disabled by
    /// the `p` flag).
    pub simulate_root_fs_permissions: bool,
}

impl VpermIds {
    /// Initialize from the process' real ids (no virtualization active).
    pub fn from_real() -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let euid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let egid = nix::unistd::getegid().as_raw();
        Self {
            uids: IdSet {
                real: uid,
                effective: euid,
                saved: euid,
                fs: uid,
            },
            gids: IdSet {
                real: gid,
                effective: egid,
                saved: egid,
                fs: gid,
            },
            unknown_file_owner: None,
            simulate_root_fs_permissions: true,
        }
    }

    /// Parse the `SBOX_VPERM_IDS` format. Both the `u` and `g` blocks are
    /// required; order of the optional parts is free.
    pub fn parse(s: &str) -> Option<Self> {
        let mut uids = None;
        let mut gids = None;
        let mut unknown_file_owner = None;
        let mut simulate_root_fs_permissions = true;

        for part in s.split(',') {
            let mut chars = part.chars();
            match chars.next()? {
                'u' => uids = Some(parse_idset(&part[1..])?),
                'g' => gids = Some(parse_idset(&part[1..])?),
                'f' => {
                    let (u, g) = part[1..].split_once('.')?;
                    unknown_file_owner = Some((u.parse().ok()?, g.parse().ok()?));
                }
                'p' if part.len() == 1 => simulate_root_fs_permissions = false,
                _ => return None,
            }
        }

        Some(Self {
            uids: uids?,
            gids: gids?,
            unknown_file_owner,
            simulate_root_fs_permissions,
        })
    }

    /// Serialize to the `SBOX_VPERM_IDS` format.
    pub fn serialize(&self) -> String {
        let mut out = format!(
            "u{}:{}:{}:{},g{}:{}:{}:{}",
            self.uids.real,
            self.uids.effective,
            self.uids.saved,
            self.uids.fs,
            self.gids.real,
            self.gids.effective,
            self.gids.saved,
            self.gids.fs,
        );
        if let Some((u, g)) = self.unknown_file_owner {
            out.push_str(&format!(",f{u}.{g}"));
        }
        if !self.simulate_root_fs_permissions {
            out.push_str(",p");
        }
        out
    }

    /// Virtually privileged: the effective uid is root's.
    pub fn is_virtual_root(&self) -> bool {
        self.uids.effective == 0
    }

    /// Serialize the block as it must look inside the new process after
    /// exec'ing `file`: SUID/SGID bits switch the effective (and saved)
    /// ids to the file's owner/group.
    pub fn export_for_exec(&self, file_mode: u32, file_uid: u32, file_gid: u32) -> String {
        let mut next = *self;
        if file_mode & libc::S_ISUID != 0 {
            next.uids.effective = file_uid;
        }
        if file_mode & libc::S_ISGID != 0 {
            next.gids.effective = file_gid;
        }
        next.uids.saved = next.uids.effective;
        next.gids.saved = next.gids.effective;
        next.serialize()
    }
}

fn parse_idset(s: &str) -> Option<IdSet> {
    let mut it = s.split(':');
    let ids = IdSet {
        real: it.next()?.parse().ok()?,
        effective: it.next()?.parse().ok()?,
        saved: it.next()?.parse().ok()?,
        fs: it.next()?.parse().ok()?,
    };
    if it.next().is_some() {
        return None;
    }
    Some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "u0:0:0:0,g0:0:0:0";

    #[test]
    fn test_parse_root() {
        let ids = VpermIds::parse(ROOT).unwrap();
        assert!(ids.is_virtual_root());
        assert!(ids.simulate_root_fs_permissions);
        assert_eq!(ids.unknown_file_owner, None);
    }

    #[test]
    fn test_parse_full() {
        let ids = VpermIds::parse("u1000:0:0:0,g1000:0:0:0,f0.0,p").unwrap();
        assert_eq!(ids.uids.real, 1000);
        assert_eq!(ids.uids.effective, 0);
        assert_eq!(ids.unknown_file_owner, Some((0, 0)));
        assert!(!ids.simulate_root_fs_permissions);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(VpermIds::parse("").is_none());
        assert!(VpermIds::parse("u1:2:3").is_none());
        assert!(VpermIds::parse("u1:2:3:4").is_none()); // g block missing
        assert!(VpermIds::parse("u1:2:3:4,gx:0:0:0").is_none());
        assert!(VpermIds::parse("u1:2:3:4,g1:2:3:4,zoo").is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        for s in [
            ROOT,
            "u1000:1000:1000:1000,g100:100:100:100",
            "u1000:0:0:1000,g100:0:0:100,f0.0",
            "u1:2:3:4,g5:6:7:8,p",
        ] {
            let ids = VpermIds::parse(s).unwrap();
            assert_eq!(ids.serialize(), s);
        }
    }

    #[test]
    fn test_export_for_exec_suid() {
        let ids = VpermIds::parse("u1000:1000:1000:1000,g100:100:100:100").unwrap();
        let exported = ids.export_for_exec(0o4755, 0, 0);
        let next = VpermIds::parse(&exported).unwrap();
        assert_eq!(next.uids.real, 1000);
        assert_eq!(next.uids.effective, 0);
        assert_eq!(next.uids.saved, 0);
        // no SGID bit: gids unchanged
        assert_eq!(next.gids.effective, 100);
    }

    #[test]
    fn test_setuid_rules() {
        let mut ids = IdSet {
            real: 1000,
            effective: 0,
            saved: 0,
            fs: 0,
        };
        // effective root may become anyone
        ids.set_id(1234, true).unwrap();
        assert_eq!(ids.real, 1234);
        assert_eq!(ids.saved, 1234);

        // unprivileged may only pick among real/effective/saved
        let mut ids = IdSet {
            real: 1000,
            effective: 500,
            saved: 0,
            fs: 500,
        };
        assert_eq!(ids.set_id(42, false), Err(Errno::EPERM));
        ids.set_id(1000, false).unwrap();
        assert_eq!(ids.effective, 1000);
        assert_eq!(ids.real, 1000);
    }

    #[test]
    fn test_setresuid_rules() {
        let mut ids = IdSet {
            real: 1000,
            effective: 0,
            saved: 0,
            fs: 0,
        };
        // swap effective and real, keep saved
        ids.set_res(Some(0), Some(1000), None, false).unwrap();
        assert_eq!((ids.real, ids.effective, ids.saved), (0, 1000, 0));
        assert_eq!(ids.fs, 1000);

        let mut ids = IdSet {
            real: 1000,
            effective: 1000,
            saved: 1000,
            fs: 1000,
        };
        assert_eq!(
            ids.set_res(None, Some(0), None, false),
            Err(Errno::EPERM)
        );
    }
}
