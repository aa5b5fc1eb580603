//! CPU transparency: launching foreign-CPU binaries under an emulator.
//!
//! The emulator command and its options live under
//! `cputransparency/<name>` in the rule tree. The emulator is prepended
//! to argv with `-L /` (the target's runtime linker is found under the
//! virtual root), optionally `-0 <orig argv0>` and `-libattr-hack`, and
//! — when the emulator supports environment control — every `LD_TRACE_*`
//! variable moves from the environment onto the command line as `-E`
//! pairs, so the dynamic-linker tracing applies to the *target* and not
//! to the emulator itself. The emulator gets its own LD_LIBRARY_PATH /
//! LD_PRELOAD pair; the application's preload makes no sense in the
//! emulator's (host) address space and is dropped.

use vroot_shared::env as envname;

use crate::error::ExecError;
use crate::session::Session;
use nix::errno::Errno;

use super::policy::ExecPolicy;
use super::postprocess::PostprocessOutput;

pub(crate) fn postprocess_cpu_transparency(
    session: &Session,
    exec_policy_name: Option<&str>,
    _mapped_file: &str,
    virtual_file: &str,
    orig_argv: Vec<String>,
    orig_envp: Vec<String>,
    cputransp_name: &str,
) -> Result<PostprocessOutput, ExecError> {
    let tree = session.ruletree();
    let conf = |key: &str| tree.lookup_string(&["cputransparency", cputransp_name, key]);
    let conf_bool = |key: &str| tree.lookup_bool(&["cputransparency", cputransp_name, key]);

    tracing::debug!("postprocessing cpu_transparency for '{virtual_file}'");

    let Some(policy) = ExecPolicy::find_opt(session, exec_policy_name) else {
        tracing::debug!("cpu_transparency without a valid exec policy, do not execute");
        return Err(ExecError::Denied(Errno::EINVAL));
    };
    policy.emit_log_hook("log_level", "log_message");

    let mut new_envp = vec![format!(
        "{}={}",
        envname::EXEC_POLICY_NAME,
        exec_policy_name.unwrap_or("")
    )];

    // emulator command: an argv list, or a plain command string
    let qemu_argv = tree.string_list(tree.lookup(&["cputransparency", cputransp_name, "qemu_argv"]));
    let mut new_argv: Vec<String>;
    if qemu_argv.is_empty() {
        let Some(cmd) = conf("cmd").filter(|c| !c.is_empty()) else {
            tracing::error!("no command for cpu_transparency ({cputransp_name})");
            return Err(ExecError::Denied(Errno::EINVAL));
        };
        new_argv = vec![cmd];
    } else {
        new_argv = qemu_argv;
    }
    let new_file = new_argv[0].clone();

    for entry in
        tree.string_list(tree.lookup(&["cputransparency", cputransp_name, "qemu_env"]))
    {
        new_envp.push(entry);
    }

    // the target's runtime linker comes from the virtual root
    new_argv.push("-L".to_string());
    new_argv.push("/".to_string());

    if conf_bool("has_argv0_flag") {
        new_argv.push("-0".to_string());
        new_argv.push(orig_argv[0].clone());
    }

    // works around an old libattr using the wrong syscall convention
    if conf_bool("qemu_has_libattr_hack_flag") {
        new_argv.push("-libattr-hack".to_string());
    }

    let env_control = conf_bool("qemu_has_env_control_flags");
    for entry in &orig_envp {
        // locale paths are host paths; the target must not see them
        if entry.starts_with("GCONV_PATH=")
            || entry.starts_with("NLSPATH=")
            || entry.starts_with("LOCPATH=")
        {
            continue;
        }
        if entry.starts_with("__SB2_EXEC_POLICY_NAME=") {
            continue;
        }
        if env_control {
            if entry.starts_with("LD_TRACE_") {
                // applies to the target: move onto the emulator command line
                new_argv.push("-E".to_string());
                new_argv.push(entry.clone());
                continue;
            }
            if entry.starts_with("__SB2_LD_PRELOAD=") {
                // a target-side preload can't be loaded by the host-side
                // emulator; drop it
                continue;
            }
        }
        new_envp.push(entry.clone());
    }

    // the emulator itself needs host-appropriate LD_* values
    let qemu_ld_library_path = conf("qemu_ld_library_path").filter(|v| !v.is_empty());
    new_envp.push(match qemu_ld_library_path {
        Some(value) => format!("LD_LIBRARY_PATH={value}"),
        None => format!(
            "LD_LIBRARY_PATH={}",
            tree.lookup_string(&["config", "host_ld_library_path"])
                .unwrap_or_default()
        ),
    });
    let qemu_ld_preload = conf("qemu_ld_preload").filter(|v| !v.is_empty());
    new_envp.push(match qemu_ld_preload {
        Some(value) => format!("LD_PRELOAD={value}"),
        None => format!(
            "LD_PRELOAD={}",
            tree.lookup_string(&["config", "host_ld_preload"])
                .unwrap_or_default()
        ),
    });

    // the emulator gets the *virtual* filename; it maps paths itself by
    // going through the preload library like everyone else
    new_argv.push(virtual_file.to_string());
    new_argv.extend(orig_argv.into_iter().skip(1));

    Ok(PostprocessOutput {
        file: new_file,
        virtual_file: virtual_file.to_string(),
        argv: new_argv,
        envp: new_envp,
    })
}
