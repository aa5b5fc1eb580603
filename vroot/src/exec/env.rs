//! Environment preparation for exec.
//!
//! Before the binary type is even known, the inherited environment is
//! rewritten once:
//!
//! - the user's `LD_LIBRARY_PATH` / `LD_PRELOAD` are parked in
//!   `__SB2_LD_*` (postprocessing composes the real values later; the
//!   next process' startup code restores the user's view),
//! - `SBOX_SESSION_DIR` and `SBOX_MAPPING_METHOD` cannot be changed or
//!   dropped — attempts are logged and reverted,
//! - `SBOX_SESSION_MODE` may change, but only to a mode the rule tree
//!   actually has rules for,
//! - the virtual id block is re-exported, and all `__SB2_*` private
//!   names are written fresh (inherited ones never relay).

use vroot_shared::env as envname;

use crate::session::Session;

/// `VAR=value` lookup by name.
pub(crate) fn env_var_value<'a>(envp: &'a [String], name: &str) -> Option<&'a str> {
    envp.iter().find_map(|entry| {
        entry
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

pub(crate) fn has_env_var(envp: &[String], name: &str) -> bool {
    env_var_value(envp, name).is_some()
}

/// Replace the value of an existing `VAR=` entry (no-op when absent).
pub(crate) fn change_env_var(envp: &mut [String], name: &str, new_value: &str) {
    for entry in envp.iter_mut() {
        if entry.starts_with(name) && entry.as_bytes().get(name.len()) == Some(&b'=') {
            *entry = format!("{name}={new_value}");
            tracing::debug!("changed: {entry}");
            return;
        }
    }
    tracing::debug!("failed to change {name}={new_value}");
}

/// Does the rule tree know this mode? Gates user-requested mode changes.
fn mode_is_known(session: &Session, mode: &str) -> bool {
    session.ruletree().lookup(&["fs_rules", mode]).is_some()
}

/// Build the new environment for an exec (the "always" part of the
/// pipeline, done before any binary-type specific postprocessing).
pub(crate) fn prepare_envp(
    session: &Session,
    orig_file: &str,
    binaryname: &str,
    envp: &[String],
) -> Vec<String> {
    let config = session.config();
    let mut user_ld_preload: Option<String> = None;
    let mut user_ld_library_path: Option<String> = None;
    let mut user_vperm_request: Option<String> = None;
    let mut has_session_dir = false;
    let mut has_sigtrap = false;
    let mut kept_session_mode = false;

    let mut new_envp: Vec<String> = Vec::with_capacity(envp.len() + 15);

    for entry in envp {
        // private names never relay; fresh values are appended below
        if entry.starts_with(envname::PRIVATE_PREFIX) {
            continue;
        }

        if let Some(value) = entry.strip_prefix("LD_PRELOAD=") {
            user_ld_preload = Some(value.to_string());
            continue;
        }
        if let Some(value) = entry.strip_prefix("LD_LIBRARY_PATH=") {
            user_ld_library_path = Some(value.to_string());
            continue;
        }
        // stale locale paths from earlier exec processing must not leak
        // into children that don't need them
        if entry.starts_with("NLSPATH=") || entry.starts_with("LOCPATH=") {
            continue;
        }

        if let Some(value) = entry.strip_prefix("SBOX_SESSION_DIR=") {
            has_session_dir = true;
            if std::path::Path::new(value) != config.session_dir {
                tracing::warn!(
                    "detected attempt to set SBOX_SESSION_DIR, restored to {}",
                    config.session_dir.display()
                );
            }
            continue;
        }
        if let Some(value) = entry.strip_prefix("SBOX_MAPPING_METHOD=") {
            if let Some(method) = &config.mapping_method {
                if value != method {
                    tracing::warn!(
                        "detected attempt to set SBOX_MAPPING_METHOD, restored to {method}"
                    );
                }
                continue;
            }
        }
        if let Some(requested) = entry.strip_prefix("SBOX_SESSION_MODE=") {
            if session.mode() == Some(requested) {
                continue; // same as current, re-added below
            }
            if mode_is_known(session, requested) {
                tracing::debug!("accepted requested mode change to '{requested}'");
                kept_session_mode = true;
            } else {
                continue;
            }
        } else if entry.starts_with("SBOX_SESSION_") {
            // other session variables are read-only
            continue;
        }
        if let Some(value) = entry.strip_prefix("SBOX_VPERM_REQUEST=") {
            user_vperm_request = Some(value.to_string());
            continue;
        }
        if entry.starts_with("SBOX_VPERM_IDS=") {
            continue; // re-exported below
        }
        if entry.starts_with("SBOX_SIGTRAP=") {
            has_sigtrap = true;
        }

        new_envp.push(entry.clone());
    }

    if !has_session_dir {
        tracing::info!(
            "detected attempt to clear SBOX_SESSION_DIR, restored to {}",
            config.session_dir.display()
        );
    }

    new_envp.push(format!(
        "SBOX_SESSION_DIR={}",
        config.session_dir.display()
    ));
    if let Some(method) = &config.mapping_method {
        new_envp.push(format!("SBOX_MAPPING_METHOD={method}"));
    }
    if let Some(mode) = &config.mode {
        if !kept_session_mode {
            new_envp.push(format!("SBOX_SESSION_MODE={mode}"));
        }
    }

    // virtual ids; SUID/SGID effects are patched in later when the
    // binary's mode is known
    let ids_value = match user_vperm_request {
        Some(request) => request,
        None => session.vperm_ids().serialize(),
    };
    new_envp.push(format!("SBOX_VPERM_IDS={ids_value}"));

    // put SBOX_SIGTRAP back if the caller wiped it (exec under gdb)
    if !has_sigtrap {
        if let Ok(sigtrap) = std::env::var(envname::SIGTRAP) {
            tracing::info!("detected attempt to clear SBOX_SIGTRAP, restored to {sigtrap}");
            new_envp.push(format!("SBOX_SIGTRAP={sigtrap}"));
        }
    }

    new_envp.push(format!("{}={binaryname}", envname::BINARYNAME));
    new_envp.push(format!("{}={orig_file}", envname::ORIG_BINARYNAME));
    // for scripts this is the script itself, never the interpreter
    new_envp.push(format!("{}={orig_file}", envname::EXEC_BINARYNAME));
    // placeholder, filled once the file has been mapped
    new_envp.push(format!("{}=", envname::REAL_BINARYNAME));

    if let Some(value) = user_ld_preload {
        new_envp.push(format!("{}={value}", envname::USER_LD_PRELOAD));
    }
    if let Some(value) = user_ld_library_path {
        new_envp.push(format!("{}={value}", envname::USER_LD_LIBRARY_PATH));
    }

    if let Some(chroot) = session.chroot_path() {
        new_envp.push(format!("{}={chroot}", envname::PRIVATE_CHROOT_PATH));
    }

    new_envp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruletree::RuleTreeBuilder;
    use crate::session::SessionConfig;
    use tempfile::TempDir;

    fn scratch_session(dir: &TempDir) -> Session {
        let config = SessionConfig::new(dir.path()).with_mode("devel");
        config.layout().prepare().unwrap();
        let mut b = RuleTreeBuilder::new();
        let rules = b.add_list(&[]);
        b.set(&["fs_rules", "devel"], rules);
        let rules2 = b.add_list(&[]);
        b.set(&["fs_rules", "other"], rules2);
        b.write_to(&config.layout().rule_tree_file()).unwrap();
        Session::open(config).unwrap()
    }

    fn v(envp: &[String], name: &str) -> Option<String> {
        env_var_value(envp, name).map(str::to_string)
    }

    #[test]
    fn test_ld_vars_are_parked() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir);
        let envp = vec![
            "LD_PRELOAD=/my/lib.so".to_string(),
            "LD_LIBRARY_PATH=/my/libs".to_string(),
            "HOME=/home/u".to_string(),
        ];
        let out = prepare_envp(&session, "/bin/ls", "ls", &envp);

        assert!(!has_env_var(&out, "LD_PRELOAD"));
        assert!(!has_env_var(&out, "LD_LIBRARY_PATH"));
        assert_eq!(v(&out, "__SB2_LD_PRELOAD").as_deref(), Some("/my/lib.so"));
        assert_eq!(
            v(&out, "__SB2_LD_LIBRARY_PATH").as_deref(),
            Some("/my/libs")
        );
        assert_eq!(v(&out, "HOME").as_deref(), Some("/home/u"));
    }

    #[test]
    fn test_session_dir_is_pinned() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir);
        let envp = vec!["SBOX_SESSION_DIR=/evil".to_string()];
        let out = prepare_envp(&session, "/bin/ls", "ls", &envp);
        assert_eq!(
            v(&out, "SBOX_SESSION_DIR").as_deref(),
            dir.path().to_str()
        );
    }

    #[test]
    fn test_session_mode_change_needs_known_mode() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir);

        let out = prepare_envp(
            &session,
            "/bin/ls",
            "ls",
            &["SBOX_SESSION_MODE=other".to_string()],
        );
        assert_eq!(v(&out, "SBOX_SESSION_MODE").as_deref(), Some("other"));

        let out = prepare_envp(
            &session,
            "/bin/ls",
            "ls",
            &["SBOX_SESSION_MODE=bogus".to_string()],
        );
        assert_eq!(v(&out, "SBOX_SESSION_MODE").as_deref(), Some("devel"));
    }

    #[test]
    fn test_private_names_rewritten() {
        let dir = TempDir::new().unwrap();
        let session = scratch_session(&dir);
        let envp = vec![
            "__SB2_BINARYNAME=stale".to_string(),
            "__SB2_SOMETHING=old".to_string(),
        ];
        let out = prepare_envp(&session, "/usr/bin/cc", "cc", &envp);
        assert_eq!(v(&out, "__SB2_BINARYNAME").as_deref(), Some("cc"));
        assert_eq!(v(&out, "__SB2_ORIG_BINARYNAME").as_deref(), Some("/usr/bin/cc"));
        assert_eq!(v(&out, "__SB2_EXEC_BINARYNAME").as_deref(), Some("/usr/bin/cc"));
        assert_eq!(v(&out, "__SB2_REAL_BINARYNAME").as_deref(), Some(""));
        assert!(!out.iter().any(|e| e.starts_with("__SB2_SOMETHING")));
        assert!(has_env_var(&out, "SBOX_VPERM_IDS"));
    }
}
