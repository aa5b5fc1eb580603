//! `#!` script handling.
//!
//! The interpreter line is parsed (one interpreter, at most one
//! argument — the kernel's rule), argv is rebuilt as
//! `[interpreter, arg?, original-script-name, rest...]`, and the
//! interpreter is mapped: either through the exec policy's dedicated
//! script-interpreter rule list (an abstract-path mapping, no symlink
//! resolution), or through the ordinary full mapping. The mapped
//! interpreter then goes back through the whole exec pipeline, so a
//! foreign-CPU interpreter ends up under the emulator like any other
//! binary.

use std::io::Read;

use nix::errno::Errno;
use vroot_shared::env as envname;

use crate::error::ExecError;
use crate::mapping::engine;
use crate::mapping::fnclass;
use crate::paths::basename;
use crate::session::Session;

use super::env::change_env_var;
use super::policy::ExecPolicy;
use super::{PreparedExec, prepare_exec_inner};

/// Parsed `#!` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hashbang {
    pub interpreter: String,
    pub arg: Option<String>,
}

/// Parse the first line of a script. Whitespace delimits; newline or
/// NUL terminates; everything after the first argument is ignored.
pub(crate) fn parse_hashbang(head: &[u8]) -> Option<Hashbang> {
    let rest = head.strip_prefix(b"#!")?;
    let line_end = rest
        .iter()
        .position(|&b| b == b'\n' || b == 0)
        .unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..line_end]).ok()?;

    let mut words = line.split_ascii_whitespace();
    let interpreter = words.next()?.to_string();
    let arg = words.next().map(str::to_string);
    Some(Hashbang { interpreter, arg })
}

/// Map the interpreter and recurse through the exec pipeline.
pub(crate) fn prepare_hashbang(
    session: &Session,
    mapped_script: &str,
    orig_file: &str,
    orig_argv: Vec<String>,
    mut envp: Vec<String>,
    exec_policy_name: Option<String>,
    depth: u32,
) -> Result<PreparedExec, ExecError> {
    let mut head = [0u8; 1024];
    let n = std::fs::File::open(mapped_script)
        .and_then(|mut f| f.read(&mut head))
        .map_err(|_| ExecError::Denied(Errno::ENOENT))?;
    let Some(hashbang) = parse_hashbang(&head[..n]) else {
        return Err(ExecError::Denied(Errno::ENOEXEC));
    };

    tracing::debug!(
        "prepare_hashbang: interpreter={} arg={:?}",
        hashbang.interpreter,
        hashbang.arg
    );

    let mut new_argv = Vec::with_capacity(orig_argv.len() + 2);
    new_argv.push(hashbang.interpreter.clone());
    if let Some(arg) = &hashbang.arg {
        new_argv.push(arg.clone());
    }
    // the interpreter gets the *unmapped* script path; reading it goes
    // back through the mapping engine
    new_argv.push(orig_file.to_string());
    new_argv.extend(orig_argv.into_iter().skip(1));

    change_env_var(&mut envp, envname::ORIG_BINARYNAME, &hashbang.interpreter);

    // interpreter mapping, per policy
    let mut mapped_interpreter: Option<String> = None;
    let mut next_policy: Option<String> = None;
    let mut use_ordinary_mapping = true;

    if let Some(policy) = ExecPolicy::find_opt(session, exec_policy_name.as_deref()) {
        policy.emit_log_hook("script_log_level", "script_log_message");

        if policy.boolean("script_deny_exec") {
            tracing::debug!("prepare_hashbang: denied by script_deny_exec");
            return Err(ExecError::Refused {
                reason: "script_deny_exec",
                errno: Errno::EPERM,
            });
        }

        let interp_rules = policy.rules("script_interpreter_rules");
        if interp_rules.is_some() {
            tracing::debug!(
                "applying exec policy '{}' to script",
                exec_policy_name.as_deref().unwrap_or("")
            );
            if let Some(out) = engine::map_abstract_path(
                session,
                orig_file,
                "map_script_interpreter",
                fnclass::EXEC,
                interp_rules,
                &hashbang.interpreter,
            ) {
                next_policy = out.exec_policy_name.clone();
                if policy.boolean("script_set_argv0_to_mapped_interpreter") {
                    new_argv[0] = out.host_path.clone();
                }
                mapped_interpreter = Some(out.host_path);
                use_ordinary_mapping = false;
            }
        }
    }

    if use_ordinary_mapping {
        // the policy says nothing about interpreters: ordinary mapping
        let res = session.map_path_for_exec(basename(orig_file), &hashbang.interpreter);
        if let Some(errno) = res.errno {
            return Err(ExecError::Denied(errno));
        }
        next_policy = res.exec_policy_name.clone();
        mapped_interpreter = res.host_path;
        // the new process must see where the interpreter really is
        if let Some(mapped) = &mapped_interpreter {
            new_argv[0] = mapped.clone();
        }
    }

    let Some(mapped_interpreter) = mapped_interpreter else {
        tracing::error!(
            "failed to map script interpreter={}",
            hashbang.interpreter
        );
        return Err(ExecError::Denied(Errno::ENOENT));
    };

    // the rules downstream see the mapped interpreter's basename
    change_env_var(&mut envp, envname::BINARYNAME, basename(&mapped_interpreter));

    tracing::debug!(
        "prepare_hashbang: interpreter={} mapped_interpreter={mapped_interpreter} policy={next_policy:?}",
        hashbang.interpreter
    );

    // run the interpreter through the whole pipeline (CPU transparency
    // and all); the interpreter path has already been mapped
    prepare_exec_inner(
        session,
        next_policy,
        &mapped_interpreter,
        true,
        new_argv,
        envp,
        depth + 1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let hb = parse_hashbang(b"#!/bin/sh\necho hi\n").unwrap();
        assert_eq!(hb.interpreter, "/bin/sh");
        assert_eq!(hb.arg, None);
    }

    #[test]
    fn test_parse_with_whitespace_and_arg() {
        let hb = parse_hashbang(b"#! /usr/bin/python  -E\nprint()\n").unwrap();
        assert_eq!(hb.interpreter, "/usr/bin/python");
        assert_eq!(hb.arg.as_deref(), Some("-E"));
    }

    #[test]
    fn test_parse_only_first_arg_kept() {
        let hb = parse_hashbang(b"#!/usr/bin/env python3 -u\n").unwrap();
        assert_eq!(hb.interpreter, "/usr/bin/env");
        assert_eq!(hb.arg.as_deref(), Some("python3"));
    }

    #[test]
    fn test_parse_rejects_non_scripts() {
        assert_eq!(parse_hashbang(b"\x7fELF..."), None);
        assert_eq!(parse_hashbang(b"#!\n"), None);
        assert_eq!(parse_hashbang(b"#!   \n"), None);
    }

    #[test]
    fn test_parse_nul_terminates() {
        let hb = parse_hashbang(b"#!/bin/sh\0garbage").unwrap();
        assert_eq!(hb.interpreter, "/bin/sh");
        assert_eq!(hb.arg, None);
    }
}
