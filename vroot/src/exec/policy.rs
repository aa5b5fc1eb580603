//! Exec policies.
//!
//! A policy is a named bundle of fields under the
//! `exec_policy/<mode>/<name>` catalog: which ld.so to start dynamic
//! binaries through, how to compose their LD_* variables, how to treat
//! script interpreters, and assorted flags. Which policy applies to a
//! binary is decided either by the fs-rule that mapped it (preferred) or
//! by the mode's ordered `exec_policy_selection` rules matched against
//! the *mapped* path.

use goblin::elf::header;
use vroot_shared::LogLevel;

use crate::logging;
use crate::ruletree::ObjRef;
use crate::ruletree::exec::EXEC_FLAGS_FORCE_CPU_TRANSPARENCY;
use crate::ruletree::fsrule::{SelectorType, selector_matches};
use crate::session::Session;

use super::inspect::BinaryInfo;

/// Handle to one exec policy's field catalog.
#[derive(Debug, Clone, Copy)]
pub struct ExecPolicy<'s> {
    session: &'s Session,
    catalog: ObjRef,
}

impl<'s> ExecPolicy<'s> {
    /// Look a policy up by name in the active mode.
    pub fn find(session: &'s Session, name: &str) -> Option<Self> {
        let mode = session.mode()?;
        let catalog = session.ruletree().lookup(&["exec_policy", mode, name]);
        catalog.is_some().then_some(Self { session, catalog })
    }

    /// Like [`find`](Self::find) with an optional name.
    pub fn find_opt(session: &'s Session, name: Option<&str>) -> Option<Self> {
        Self::find(session, name?)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        let tree = self.session.ruletree();
        tree.string_at(tree.catalog_get(self.catalog, key))
    }

    pub fn boolean(&self, key: &str) -> bool {
        let tree = self.session.ruletree();
        tree.bool_at(tree.catalog_get(self.catalog, key)).unwrap_or(false)
    }

    pub fn uint32(&self, key: &str) -> u32 {
        let tree = self.session.ruletree();
        tree.u32_at(tree.catalog_get(self.catalog, key)).unwrap_or(0)
    }

    pub fn rules(&self, key: &str) -> ObjRef {
        self.session.ruletree().catalog_get(self.catalog, key)
    }

    /// Emit the policy's configured log line, if it has one
    /// (`log_level`/`log_message`, or the `script_*` pair).
    pub fn emit_log_hook(&self, level_key: &str, message_key: &str) {
        if let Some(level) = self.string(level_key).as_deref().and_then(LogLevel::from_name) {
            let message = self.string(message_key).unwrap_or_default();
            logging::log_at(level, &message);
        }
    }
}

/// Find the exec policy for a mapped binary via the mode's selection
/// rules. The first matching rule wins; a rule file without a default
/// (catch-all) rule yields `None` for uncovered paths.
pub fn select_policy_name(session: &Session, mapped_path: &str) -> Option<String> {
    let mode = session.mode()?;
    let tree = session.ruletree();
    let rule_list = tree.lookup(&["exec_policy_selection", mode]);
    if rule_list.is_none() {
        tracing::error!("no exec policy selection rules for mode '{mode}'");
        return None;
    }

    for rule_offs in tree.list_items(rule_list) {
        let Some(rule) = tree.exec_selection_rule_at(rule_offs) else {
            continue;
        };
        let Some(selector_type) = SelectorType::from_u32(rule.selector_type) else {
            continue;
        };
        let Some(selector) = tree.string_at(rule.selector) else {
            continue;
        };
        if selector_matches(selector_type, &selector, mapped_path).is_some() {
            let name = tree.string_at(rule.policy_name);
            tracing::debug!("exec policy found for '{mapped_path}': {name:?}");
            return name;
        }
    }
    tracing::error!("exec policy was not found (mode='{mode}'), default rule is missing?");
    None
}

/// Can this binary run on the CPU the emulator provides? `arch` uses
/// `el`/`eb` suffixes to distinguish byte orders where both exist.
fn binary_can_run_on(info: &BinaryInfo, arch: &str) -> bool {
    match info.machine {
        header::EM_386 => arch == "i386" || arch == "x86_64",
        header::EM_X86_64 => arch == "x86_64",
        header::EM_AARCH64 => arch == "aarch64",
        header::EM_PPC => arch == "ppc",
        header::EM_RISCV => arch == "riscv64",
        header::EM_ARM => match info.elf_data {
            header::ELFDATA2LSB => arch == "armel",
            header::ELFDATA2MSB => arch == "armeb",
            _ => false,
        },
        header::EM_MIPS => match info.elf_data {
            header::ELFDATA2LSB => arch == "mipsel",
            header::ELFDATA2MSB => arch == "mipseb",
            _ => false,
        },
        header::EM_SH => match info.elf_data {
            header::ELFDATA2LSB => arch == "shel",
            header::ELFDATA2MSB => arch == "sheb",
            _ => false,
        },
        _ => false,
    }
}

/// A policy may force host-compatible binaries through the emulator
/// (`exec_flags` bit) — but only when the configured emulator can
/// actually run this binary's architecture.
pub fn force_cpu_transparency(
    session: &Session,
    exec_policy_name: Option<&str>,
    cputransp_name: &str,
    info: &BinaryInfo,
) -> bool {
    let Some(policy) = ExecPolicy::find_opt(session, exec_policy_name) else {
        return false;
    };
    if policy.uint32("exec_flags") & EXEC_FLAGS_FORCE_CPU_TRANSPARENCY == 0 {
        return false;
    }

    let tree = session.ruletree();
    let cmd = tree.lookup_string(&["cputransparency", cputransp_name, "cmd"]);
    if !cmd.is_some_and(|c| !c.is_empty()) {
        return false;
    }
    let Some(arch) = tree.lookup_string(&["cputransparency", cputransp_name, "arch"]) else {
        return false;
    };
    if binary_can_run_on(info, &arch) {
        tracing::debug!("forcing CPU transparency");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_can_run_on() {
        let arm_le = BinaryInfo {
            machine: header::EM_ARM,
            elf_data: header::ELFDATA2LSB,
            ..Default::default()
        };
        assert!(binary_can_run_on(&arm_le, "armel"));
        assert!(!binary_can_run_on(&arm_le, "armeb"));

        let x86_64 = BinaryInfo {
            machine: header::EM_X86_64,
            elf_data: header::ELFDATA2LSB,
            ..Default::default()
        };
        assert!(binary_can_run_on(&x86_64, "x86_64"));
        assert!(!binary_can_run_on(&x86_64, "i386"));

        let i386 = BinaryInfo {
            machine: header::EM_386,
            elf_data: header::ELFDATA2LSB,
            ..Default::default()
        };
        // 32-bit x86 runs on a 64-bit x86 emulator
        assert!(binary_can_run_on(&i386, "x86_64"));
    }
}
