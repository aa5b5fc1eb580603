//! Binary classification.
//!
//! Decides how a mapped file can be executed at all: a `#!` script, an
//! ELF image for the host CPU (static or dynamic), an ELF image for the
//! configured target CPU (to be run under the emulator), or nothing
//! executable. The file is mapped read-only and parsed with goblin;
//! capabilities are detected through the `security.capability` xattr
//! because a binary carrying them must be started via ld.so explicitly.

use std::fs::File;
use std::os::unix::fs::MetadataExt;

use goblin::elf::{Elf, header};
use memmap2::Mmap;
use nix::errno::Errno;
use nix::unistd::{AccessFlags, access};

use crate::session::Session;

/// What kind of image a candidate file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    /// The file does not exist (errno tells why).
    None,
    /// Exists but is not something we can classify.
    Unknown,
    /// Exists but may not be executed (no x permission).
    Invalid,
    HostStatic,
    HostDynamic,
    /// Foreign-CPU binary for the configured target.
    Target,
    Hashbang,
}

impl BinaryType {
    /// Types that go on to policy selection and postprocessing.
    pub fn is_executable(self) -> bool {
        !matches!(self, Self::None | Self::Invalid)
    }
}

/// What inspection learned about the file.
#[derive(Debug, Clone, Default)]
pub struct BinaryInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub machine: u16,
    /// EI_DATA byte (byte order) of the image.
    pub elf_data: u8,
    /// PT_INTERP of a dynamic host binary.
    pub pt_interp: Option<String>,
    /// The security.capability xattr is present.
    pub has_capabilities: bool,
}

/// The full outcome of one inspection.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub binary_type: BinaryType,
    pub info: BinaryInfo,
    /// errno to report for None/Invalid outcomes.
    pub errno: Option<Errno>,
}

impl Inspection {
    fn new(binary_type: BinaryType) -> Self {
        Self {
            binary_type,
            info: BinaryInfo::default(),
            errno: None,
        }
    }

    fn failed(binary_type: BinaryType, errno: Errno) -> Self {
        Self {
            binary_type,
            info: BinaryInfo::default(),
            errno: Some(errno),
        }
    }
}

#[cfg(target_arch = "x86_64")]
const HOST_MACHINES: &[u16] = &[header::EM_X86_64, header::EM_386];
#[cfg(target_arch = "aarch64")]
const HOST_MACHINES: &[u16] = &[header::EM_AARCH64];
#[cfg(target_arch = "riscv64")]
const HOST_MACHINES: &[u16] = &[header::EM_RISCV];
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
const HOST_MACHINES: &[u16] = &[];

#[cfg(target_endian = "little")]
const HOST_ELF_DATA: u8 = header::ELFDATA2LSB;
#[cfg(target_endian = "big")]
const HOST_ELF_DATA: u8 = header::ELFDATA2MSB;

struct TargetInfo {
    name: &'static str,
    machine: u16,
    default_data: u8,
    /// The CPU exists in both byte orders; an `el`/`eb` suffix on the
    /// configured name selects one.
    multi_byteorder: bool,
}

const TARGET_TABLE: &[TargetInfo] = &[
    TargetInfo {
        name: "arm",
        machine: header::EM_ARM,
        default_data: header::ELFDATA2LSB,
        multi_byteorder: true,
    },
    TargetInfo {
        name: "mips",
        machine: header::EM_MIPS,
        default_data: header::ELFDATA2MSB,
        multi_byteorder: true,
    },
    TargetInfo {
        name: "ppc",
        machine: header::EM_PPC,
        default_data: header::ELFDATA2MSB,
        multi_byteorder: false,
    },
    TargetInfo {
        name: "sh",
        machine: header::EM_SH,
        default_data: header::ELFDATA2LSB,
        multi_byteorder: true,
    },
    TargetInfo {
        name: "x86_64",
        machine: header::EM_X86_64,
        default_data: header::ELFDATA2LSB,
        multi_byteorder: false,
    },
    TargetInfo {
        name: "aarch64",
        machine: header::EM_AARCH64,
        default_data: header::ELFDATA2LSB,
        multi_byteorder: true,
    },
    TargetInfo {
        name: "riscv64",
        machine: header::EM_RISCV,
        default_data: header::ELFDATA2LSB,
        multi_byteorder: false,
    },
];

/// (machine, data) the configured target CPU name maps to.
fn target_machine(session: &Session) -> (u16, u8) {
    let target_cpu = session
        .ruletree()
        .lookup_string(&["config", "sbox_cpu"])
        .unwrap_or_else(|| "arm".to_string());

    for ti in TARGET_TABLE {
        if !target_cpu.starts_with(ti.name) {
            continue;
        }
        let mut data = ti.default_data;
        if ti.multi_byteorder && target_cpu.len() >= ti.name.len() + 2 {
            match &target_cpu[target_cpu.len() - 2..] {
                "eb" => data = header::ELFDATA2MSB,
                "el" => data = header::ELFDATA2LSB,
                _ => {}
            }
        }
        return (ti.machine, data);
    }
    (header::EM_NONE, header::ELFDATANONE)
}

fn check_exec_permission(session: &Session, filename: &str) -> Result<(), Inspection> {
    let x_errno = match access(filename, AccessFlags::X_OK) {
        Ok(()) => return Ok(()),
        Err(errno) => errno,
    };

    if let Err(errno) = access(filename, AccessFlags::F_OK) {
        // missing completely (or unreachable)
        return Err(Inspection::failed(BinaryType::None, errno));
    }

    // First-generation sandboxes skipped the x-bit check, and plenty of
    // packages ship scripts with wrong permissions; the bug-compat
    // switch keeps those buildable.
    let sb1_bug_emulation = session
        .ruletree()
        .lookup_string(&["config", "sbox_emulate_sb1_bugs"]);
    if sb1_bug_emulation.is_some_and(|flags| flags.contains('x')) {
        if let Err(errno) = access(filename, AccessFlags::R_OK) {
            tracing::debug!("no X or R permission for '{filename}'");
            return Err(Inspection::failed(BinaryType::Invalid, errno));
        }
        tracing::warn!(
            "X permission missing, but exec enabled by SB1 bug emulation mode ('{filename}')"
        );
        return Ok(());
    }

    tracing::debug!("no X permission for '{filename}'");
    Err(Inspection::failed(BinaryType::Invalid, x_errno))
}

/// Classify `filename` (a host path). `check_x_permission` is cleared
/// when a preceding step already established executability.
pub fn inspect_binary(session: &Session, filename: &str, check_x_permission: bool) -> Inspection {
    tracing::debug!("inspect_binary({filename})");

    if check_x_permission {
        if let Err(failed) = check_exec_permission(session, filename) {
            return failed;
        }
    } else if let Err(errno) = access(filename, AccessFlags::F_OK) {
        return Inspection::failed(BinaryType::None, errno);
    }

    let file = match File::open(filename) {
        Ok(f) => f,
        Err(_) => {
            // can't peek inside; assume a dynamic host binary
            tracing::debug!("inspect_binary: can't open for reading, assume dynamic");
            return Inspection::new(BinaryType::HostDynamic);
        }
    };

    let mut inspection = Inspection::new(BinaryType::Unknown);
    let Ok(meta) = file.metadata() else {
        return inspection;
    };
    inspection.info.mode = meta.mode();
    inspection.info.uid = meta.uid();
    inspection.info.gid = meta.gid();

    if !meta.is_file() {
        tracing::debug!("inspect_binary: not a regular file");
        return inspection;
    }
    if meta.len() < 4 {
        tracing::debug!("file size is too small, can't exec ({filename})");
        return Inspection {
            errno: Some(Errno::ENOEXEC),
            ..Inspection::new(BinaryType::None)
        };
    }

    let Ok(region) = (unsafe { Mmap::map(&file) }) else {
        return inspection;
    };

    if region[0] == b'#' && region[1] == b'!' {
        inspection.binary_type = BinaryType::Hashbang;
        return inspection;
    }

    let Ok(elf) = Elf::parse(&region) else {
        return inspection;
    };
    inspection.info.machine = elf.header.e_machine as u16;
    inspection.info.elf_data = elf.header.e_ident[header::EI_DATA];

    if HOST_MACHINES.contains(&inspection.info.machine)
        && inspection.info.elf_data == HOST_ELF_DATA
    {
        match elf.interpreter {
            Some(interp) => {
                tracing::debug!("inspect_binary: host ELF, PT_INTERP='{interp}'");
                inspection.info.pt_interp = Some(interp.to_string());
                inspection.info.has_capabilities =
                    matches!(xattr::get(filename, "security.capability"), Ok(Some(_)));
                inspection.binary_type = BinaryType::HostDynamic;
            }
            None => {
                tracing::debug!("inspect_binary: host ELF, static");
                inspection.info.has_capabilities =
                    matches!(xattr::get(filename, "security.capability"), Ok(Some(_)));
                inspection.binary_type = BinaryType::HostStatic;
            }
        }
        return inspection;
    }

    let (target_m, target_data) = target_machine(session);
    if target_m != header::EM_NONE
        && inspection.info.machine == target_m
        && inspection.info.elf_data == target_data
    {
        tracing::debug!("inspect_binary: target binary");
        inspection.binary_type = BinaryType::Target;
    }
    inspection
}
