//! The exec pipeline.
//!
//! Being able to alter how exec-class calls behave is the heart of the
//! sandbox: the requested file may be substituted (cross-toolchain
//! front-ends), must be path-mapped, and — depending on what kind of
//! image it turns out to be — started through ld.so, an emulator or a
//! mapped script interpreter, with a carefully rebuilt environment.
//!
//! Control flow for one exec:
//!
//! ```text
//! execve(file, argv, envp)
//!    → envp rewrite (park user LD_*, pin SBOX_SESSION_*, export vperm ids)
//!    → preprocess (argv-mod rules keyed by basename)
//!    → path mapping of file        (also selects the exec policy)
//!    → inspect mapped file         (ELF? script? which CPU?)
//!    → HASHBANG  → parse #!, map the interpreter, recurse
//!      HOST_DYN  → ld.so startup + LD_* per policy
//!      HOST_STAT → warn, host LD_* defaults
//!      TARGET    → prepend emulator (-L / -0 / -E ...)
//!    → real execve
//! ```

pub(crate) mod env;
pub mod inspect;
pub mod policy;
pub(crate) mod postprocess;
pub(crate) mod preprocess;
pub(crate) mod qemu;
pub(crate) mod script;

use nix::errno::Errno;
use vroot_shared::env as envname;

use crate::error::ExecError;
use crate::paths::basename;
use crate::session::Session;

pub use inspect::{BinaryInfo, BinaryType};

/// Script interpreters may themselves be scripts; bound the recursion.
const MAX_INTERP_NESTING: u32 = 16;

/// A fully prepared exec: what to hand to the real execve().
#[derive(Debug, Clone)]
pub struct PreparedExec {
    /// Host path of the file to execute (ld.so / emulator / binary).
    pub file: String,
    /// The virtual file the caller ended up asking for, after argv
    /// preprocessing (diagnostics; scripts recurse through this).
    pub virtual_file: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub binary_type: BinaryType,
}

impl Session {
    /// Run the whole exec pipeline without executing anything: rewrites
    /// file, argv and envp exactly as the real exec gate would.
    pub fn prepare_exec(
        &self,
        orig_file: &str,
        argv: &[String],
        envp: &[String],
    ) -> Result<PreparedExec, ExecError> {
        if argv.is_empty() {
            return Err(ExecError::Denied(Errno::EINVAL));
        }
        let envp = env::prepare_envp(self, orig_file, basename(orig_file), envp);
        prepare_exec_inner(self, None, orig_file, false, argv.to_vec(), envp, 0)
    }

    /// Prepare and issue the real execve(). Returns only on failure.
    pub fn do_exec(
        &self,
        orig_file: &str,
        argv: &[String],
        envp: &[String],
    ) -> Result<std::convert::Infallible, ExecError> {
        let prepared = self.prepare_exec(orig_file, argv, envp)?;

        let to_cstrings = |v: &[String]| -> Result<Vec<std::ffi::CString>, ExecError> {
            v.iter()
                .map(|s| std::ffi::CString::new(s.as_str()))
                .collect::<Result<_, _>>()
                .map_err(|_| ExecError::Denied(Errno::EINVAL))
        };
        let file = std::ffi::CString::new(prepared.file.as_str())
            .map_err(|_| ExecError::Denied(Errno::EINVAL))?;
        let argv = to_cstrings(&prepared.argv)?;
        let envp = to_cstrings(&prepared.envp)?;

        match nix::unistd::execve(&file, &argv, &envp) {
            Ok(never) => match never {},
            Err(errno) => Err(ExecError::Denied(errno)),
        }
    }
}

pub(crate) fn prepare_exec_inner(
    session: &Session,
    exec_policy_name: Option<String>,
    orig_file: &str,
    file_has_been_mapped: bool,
    argv: Vec<String>,
    mut envp: Vec<String>,
    depth: u32,
) -> Result<PreparedExec, ExecError> {
    if depth > MAX_INTERP_NESTING {
        return Err(ExecError::Denied(Errno::ELOOP));
    }

    tracing::debug!("prepare_exec: orig_file='{orig_file}'");
    let binary_name = basename(orig_file).to_string();
    let mut my_file = orig_file.to_string();
    let mut my_argv = argv;

    let mut mapping_disabled_by_rule = false;
    if !file_has_been_mapped {
        let outcome = preprocess::apply_exec_preprocessing_rules(session, &mut my_file, &mut my_argv);
        mapping_disabled_by_rule = outcome.disable_mapping;
    }

    let mut exec_policy_name = exec_policy_name;
    let mapped_file = if file_has_been_mapped {
        my_file.clone()
    } else if mapping_disabled_by_rule
        || envp.iter().any(|e| e == "SBOX_DISABLE_MAPPING=1")
    {
        tracing::debug!("exec: mapping disabled, my_file = {my_file}");
        my_file.clone()
    } else {
        let res = session.map_path_for_exec(&binary_name, &my_file);
        if let Some(errno) = res.errno {
            tracing::debug!("exec: mapping failed ({my_file}) => errno={errno}");
            return Err(ExecError::Denied(errno));
        }
        if res.exec_policy_name.is_some() {
            exec_policy_name = res.exec_policy_name.clone();
        }
        res.host_path.unwrap_or_else(|| my_file.clone())
    };
    tracing::debug!("exec: my_file = {my_file}, mapped_file = {mapped_file}");

    // fill the placeholder left by prepare_envp
    env::change_env_var(&mut envp, envname::REAL_BINARYNAME, &mapped_file);

    let inspection = inspect::inspect_binary(session, &mapped_file, true);
    let info = inspection.info;

    if exec_policy_name.is_none() && inspection.binary_type.is_executable() {
        match policy::select_policy_name(session, &mapped_file) {
            Some(name) => exec_policy_name = Some(name),
            None => {
                tracing::error!("no exec policy for ({my_file},{mapped_file}) => ENOEXEC");
                return Err(ExecError::Refused {
                    reason: "no exec policy matched",
                    errno: Errno::ENOEXEC,
                });
            }
        }
    }
    tracing::debug!("exec: policy = {exec_policy_name:?}, type = {:?}", inspection.binary_type);

    let prepared = match inspection.binary_type {
        BinaryType::Hashbang => {
            return script::prepare_hashbang(
                session,
                &mapped_file,
                &my_file,
                my_argv,
                envp,
                exec_policy_name,
                depth,
            );
        }

        BinaryType::HostDynamic => {
            let out = if policy::force_cpu_transparency(
                session,
                exec_policy_name.as_deref(),
                "target",
                &info,
            ) {
                qemu::postprocess_cpu_transparency(
                    session,
                    exec_policy_name.as_deref(),
                    &mapped_file,
                    &my_file,
                    my_argv,
                    envp,
                    "target",
                )?
            } else {
                postprocess::postprocess_native(
                    session,
                    exec_policy_name.as_deref(),
                    &mapped_file,
                    &my_file,
                    my_argv,
                    envp,
                )?
            };
            finish(session, out, &info, true, BinaryType::HostDynamic)
        }

        BinaryType::HostStatic => {
            let out = if policy::force_cpu_transparency(
                session,
                exec_policy_name.as_deref(),
                "native",
                &info,
            ) {
                qemu::postprocess_cpu_transparency(
                    session,
                    exec_policy_name.as_deref(),
                    &mapped_file,
                    &my_file,
                    my_argv,
                    envp,
                    "native",
                )?
            } else {
                postprocess::postprocess_host_static(
                    session,
                    exec_policy_name.as_deref(),
                    &mapped_file,
                    &my_file,
                    my_argv,
                    envp,
                )?
            };
            finish(session, out, &info, true, BinaryType::HostStatic)
        }

        BinaryType::Target => {
            let out = qemu::postprocess_cpu_transparency(
                session,
                exec_policy_name.as_deref(),
                &mapped_file,
                &my_file,
                my_argv,
                envp,
                "target",
            )?;
            finish(session, out, &info, false, BinaryType::Target)
        }

        BinaryType::Invalid | BinaryType::None => {
            return Err(ExecError::Denied(inspection.errno.unwrap_or(Errno::ENOENT)));
        }

        BinaryType::Unknown => {
            tracing::debug!("unidentified executable detected ({mapped_file}) => ENOEXEC");
            return Err(ExecError::Denied(Errno::ENOEXEC));
        }
    };

    // Nothing runs inside the sandbox without the preload machinery:
    // losing both variables would detach every descendant process.
    if !env::has_env_var(&prepared.envp, "LD_PRELOAD")
        || !env::has_env_var(&prepared.envp, "LD_LIBRARY_PATH")
    {
        tracing::error!("exec: prepared environment lost LD_PRELOAD/LD_LIBRARY_PATH");
        return Err(ExecError::Refused {
            reason: "environment lost LD_PRELOAD or LD_LIBRARY_PATH",
            errno: Errno::EINVAL,
        });
    }

    Ok(prepared)
}

/// Shared tail of the non-script branches: SUID/SGID re-export.
fn finish(
    session: &Session,
    out: postprocess::PostprocessOutput,
    info: &BinaryInfo,
    host_compatible: bool,
    binary_type: BinaryType,
) -> PreparedExec {
    let mut envp = out.envp;
    if info.mode & (libc::S_ISUID | libc::S_ISGID) != 0 {
        let ids = session.vperm_ids();
        let exported = ids.export_for_exec(info.mode, info.uid, info.gid);
        env::change_env_var(&mut envp, envname::VPERM_IDS, &exported);
        tracing::debug!("simulate SUID/SGID, new vperm ids={exported}");

        // SUID/SGID simulation is exact under the emulator, but a
        // host-compatible binary re-enters through ld.so and may notice
        if host_compatible {
            if info.mode & libc::S_ISUID != 0 {
                tracing::warn!("SUID bit set for '{}'", out.file);
            }
            if info.mode & libc::S_ISGID != 0 {
                tracing::warn!("SGID bit set for '{}'", out.file);
            }
        }
    }
    PreparedExec {
        file: out.file,
        virtual_file: out.virtual_file,
        argv: out.argv,
        envp,
        binary_type,
    }
}
