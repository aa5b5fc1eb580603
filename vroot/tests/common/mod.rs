//! Shared fixtures: scratch sessions, rule trees, synthetic ELF images
//! and a minimal in-process vperm daemon.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use vroot::ruletree::RuleTreeBuilder;
use vroot::session::{Session, SessionConfig};
use vroot::vperm::rpc::VpermRequest;

pub struct TestSession {
    pub tmp: TempDir,
    pub session: Session,
}

impl TestSession {
    /// Absolute path of a file under the scratch root, as a String.
    pub fn host(&self, rel: &str) -> String {
        self.tmp.path().join(rel).to_str().unwrap().to_string()
    }
}

/// Build a session in a temp dir. `configure` gets the rule tree
/// builder and the scratch root (so rules can point at real files).
pub fn build_session(
    configure: impl FnOnce(&mut RuleTreeBuilder, &Path),
) -> TestSession {
    build_session_with(configure, |config| config)
}

/// Like [`build_session`], with a hook to adjust the session config.
pub fn build_session_with(
    configure: impl FnOnce(&mut RuleTreeBuilder, &Path),
    adjust: impl FnOnce(SessionConfig) -> SessionConfig,
) -> TestSession {
    let tmp = TempDir::new().unwrap();
    let config = adjust(SessionConfig::new(tmp.path().join("session")).with_mode("devel"));
    config.layout().prepare().unwrap();

    let mut builder = RuleTreeBuilder::new();
    configure(&mut builder, tmp.path());
    builder
        .write_to(&config.layout().rule_tree_file())
        .unwrap();

    let session = Session::open(config).unwrap();
    TestSession { tmp, session }
}

/// Write a file and mark it executable.
pub fn write_executable(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub const EM_ARM: u16 = 40;
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: u16 = 62;
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u16 = 183;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const HOST_MACHINE: u16 = 0;

/// A minimal little-endian ELF64 executable image, optionally carrying
/// a PT_INTERP segment.
pub fn elf64_le(machine: u16, interp: Option<&str>) -> Vec<u8> {
    let phnum: u16 = interp.is_some() as u16;
    let mut v = vec![0u8; 64 + phnum as usize * 56];

    v[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    v[4] = 2; // ELFCLASS64
    v[5] = 1; // ELFDATA2LSB
    v[6] = 1; // EV_CURRENT

    let put16 = |v: &mut [u8], off: usize, x: u16| v[off..off + 2].copy_from_slice(&x.to_le_bytes());
    let put32 = |v: &mut [u8], off: usize, x: u32| v[off..off + 4].copy_from_slice(&x.to_le_bytes());
    let put64 = |v: &mut [u8], off: usize, x: u64| v[off..off + 8].copy_from_slice(&x.to_le_bytes());

    put16(&mut v, 16, 2); // e_type = ET_EXEC
    put16(&mut v, 18, machine);
    put32(&mut v, 20, 1); // e_version
    put64(&mut v, 24, 0x40_0000); // e_entry
    put64(&mut v, 32, if phnum > 0 { 64 } else { 0 }); // e_phoff
    put32(&mut v, 48, 0); // e_flags
    put16(&mut v, 52, 64); // e_ehsize
    put16(&mut v, 54, 56); // e_phentsize
    put16(&mut v, 56, phnum);

    if let Some(interp) = interp {
        let interp_off = v.len() as u64;
        let interp_len = interp.len() as u64 + 1;
        put32(&mut v, 64, 3); // p_type = PT_INTERP
        put32(&mut v, 68, 4); // p_flags = PF_R
        put64(&mut v, 72, interp_off);
        put64(&mut v, 96, interp_len); // p_filesz
        put64(&mut v, 104, interp_len); // p_memsz
        put64(&mut v, 112, 1); // p_align
        v.extend_from_slice(interp.as_bytes());
        v.push(0);
    }
    v
}

/// Serve vperm mutation requests against the session's rule tree, the
/// way the session daemon would. Runs until the test process exits.
pub fn spawn_vperm_daemon(session: &Session) {
    let socket = session.layout().vperm_socket();
    let tree: PathBuf = session.layout().rule_tree_file();
    let listener = UnixListener::bind(&socket).unwrap();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut line = String::new();
            if BufReader::new(&stream).read_line(&mut line).is_err() {
                continue;
            }
            let reply = match VpermRequest::parse_line(line.trim_end()) {
                Some(req) => match req.apply(&tree) {
                    Ok(()) => "ok\n".to_string(),
                    Err(_) => format!("err {}\n", libc::EIO),
                },
                None => format!("err {}\n", libc::EINVAL),
            };
            let _ = stream.write_all(reply.as_bytes());
        }
    });
}
