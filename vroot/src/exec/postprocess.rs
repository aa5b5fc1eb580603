//! Postprocessing of host-compatible binaries.
//!
//! A dynamic host binary is normally not exec'd directly: the policy
//! names an ld.so to invoke explicitly, with RPATH suppressed (so the
//! binary can't accidentally pull host libraries) and, when the ld.so
//! supports it, the original argv[0] restored. LD_LIBRARY_PATH and
//! LD_PRELOAD are always rewritten — either verbatim from the policy, or
//! composed as policy-prefix : user's value : policy-suffix, or from the
//! host defaults recorded in the rule tree.
//!
//! Static host binaries can't load the preload library at all; they are
//! exec'd as-is (with a warning) so that anything *they* exec still has
//! a chance to come back under control.

use vroot_shared::env as envname;

use crate::error::ExecError;
use crate::session::Session;

use super::env::env_var_value;
use super::policy::ExecPolicy;

/// What a postprocessor produced.
#[derive(Debug, Clone)]
pub(crate) struct PostprocessOutput {
    pub file: String,
    pub virtual_file: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

/// Join non-empty parts with ':'.
fn join_nonempty(parts: &[&str]) -> String {
    parts
        .iter()
        .copied()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(":")
}

/// Compose the value for one LD_* variable per policy.
fn compose_ld_value(
    session: &Session,
    policy: &ExecPolicy<'_>,
    orig_envp: &[String],
    absolute_key: &str,
    prefix_key: &str,
    suffix_key: &str,
    user_var: &str,
    host_default_key: &str,
) -> String {
    if let Some(value) = policy.string(absolute_key) {
        return value;
    }

    let prefix = policy.string(prefix_key);
    let suffix = policy.string(suffix_key);
    if prefix.is_some() || suffix.is_some() {
        let user_value = env_var_value(orig_envp, user_var).unwrap_or("");
        return join_nonempty(&[
            prefix.as_deref().unwrap_or(""),
            user_value,
            suffix.as_deref().unwrap_or(""),
        ]);
    }

    session
        .ruletree()
        .lookup_string(&["config", host_default_key])
        .unwrap_or_default()
}

/// Copy the inherited environment, dropping the variables the
/// postprocessor just rewrote.
fn copy_env_filtered(new_envp: &mut Vec<String>, orig_envp: &[String]) {
    for entry in orig_envp {
        if entry.starts_with("LD_LIBRARY_PATH=")
            || entry.starts_with("LD_PRELOAD=")
            || entry.starts_with("LOCPATH=")
            || entry.starts_with("NLSPATH=")
            || entry.starts_with("GCONV_PATH=")
            || entry.starts_with("__SB2_EXEC_POLICY_NAME=")
        {
            continue;
        }
        new_envp.push(entry.clone());
    }
}

/// Native, dynamically linked binaries.
pub(crate) fn postprocess_native(
    session: &Session,
    exec_policy_name: Option<&str>,
    mapped_file: &str,
    virtual_file: &str,
    orig_argv: Vec<String>,
    orig_envp: Vec<String>,
) -> Result<PostprocessOutput, ExecError> {
    let Some(policy) = ExecPolicy::find_opt(session, exec_policy_name) else {
        tracing::debug!("postprocess_native: no exec policy, direct exec");
        return Ok(PostprocessOutput {
            file: mapped_file.to_string(),
            virtual_file: virtual_file.to_string(),
            argv: orig_argv,
            envp: orig_envp,
        });
    };
    policy.emit_log_hook("log_level", "log_message");
    tracing::debug!(
        "postprocess_native: applying exec policy '{}'",
        exec_policy_name.unwrap_or("")
    );

    let mut new_envp = vec![format!(
        "{}={}",
        envname::EXEC_POLICY_NAME,
        exec_policy_name.unwrap_or("")
    )];

    let mut new_argv: Vec<String> = Vec::with_capacity(orig_argv.len() + 6);
    let mut new_file = mapped_file.to_string();
    let mut first_argv_element_to_copy = 0;

    if let Some(ld_so) = policy.string("native_app_ld_so") {
        // start through ld.so instead of exec'ing the binary directly
        tracing::debug!("postprocess_native: native_app_ld_so='{ld_so}'");
        new_argv.push(ld_so.clone());

        // Ignore RPATH/RUNPATH of the binary: they would reach host
        // libraries behind the mapping's back.
        let rpath_prefix = policy.string("native_app_ld_so_rpath_prefix");
        match rpath_prefix {
            Some(prefix) if policy.boolean("native_app_ld_so_supports_rpath_prefix") => {
                new_argv.push("--rpath-prefix".to_string());
                new_argv.push(prefix);
            }
            _ => {
                new_argv.push("--inhibit-rpath".to_string());
                new_argv.push(String::new()); // empty LIST = the binary itself
            }
        }

        if policy.boolean("native_app_ld_so_supports_nodefaultdirs") {
            new_argv.push("--nodefaultdirs".to_string());
        }

        // plain ld.so loses argv[0]; a patched one takes --argv0
        if policy.boolean("native_app_ld_so_supports_argv0") {
            new_argv.push("--argv0".to_string());
            new_argv.push(orig_argv[0].clone());
        }

        new_argv.push(mapped_file.to_string());
        first_argv_element_to_copy = 1;
        new_file = ld_so;
    }

    let ld_library_path = compose_ld_value(
        session,
        &policy,
        &orig_envp,
        "native_app_ld_library_path",
        "native_app_ld_library_path_prefix",
        "native_app_ld_library_path_suffix",
        envname::USER_LD_LIBRARY_PATH,
        "host_ld_library_path",
    );
    new_envp.push(format!("LD_LIBRARY_PATH={ld_library_path}"));

    let ld_preload = compose_ld_value(
        session,
        &policy,
        &orig_envp,
        "native_app_ld_preload",
        "native_app_ld_preload_prefix",
        "native_app_ld_preload_suffix",
        envname::USER_LD_PRELOAD,
        "host_ld_preload",
    );
    new_envp.push(format!("LD_PRELOAD={ld_preload}"));

    // isalpha() and friends read locale data through these
    if let Some(locale_path) = policy.string("native_app_locale_path") {
        tracing::debug!("setting LOCPATH and NLSPATH to '{locale_path}'");
        new_envp.push(format!("LOCPATH={locale_path}"));
        new_envp.push(format!("NLSPATH={locale_path}"));
    }
    if let Some(gconv_path) = policy.string("native_app_gconv_path") {
        tracing::debug!("setting GCONV_PATH to '{gconv_path}'");
        new_envp.push(format!("GCONV_PATH={gconv_path}"));
    }

    copy_env_filtered(&mut new_envp, &orig_envp);

    new_argv.extend(orig_argv.into_iter().skip(first_argv_element_to_copy));

    Ok(PostprocessOutput {
        file: new_file,
        virtual_file: virtual_file.to_string(),
        argv: new_argv,
        envp: new_envp,
    })
}

/// Statically linked host binaries: exec directly, but carry the LD_*
/// host defaults so their children can re-enter the sandbox.
pub(crate) fn postprocess_host_static(
    session: &Session,
    exec_policy_name: Option<&str>,
    mapped_file: &str,
    virtual_file: &str,
    orig_argv: Vec<String>,
    orig_envp: Vec<String>,
) -> Result<PostprocessOutput, ExecError> {
    let allowed = std::env::var(envname::ALLOW_STATIC_BINARY)
        .is_ok_and(|allowed| allowed == mapped_file);
    if allowed {
        tracing::debug!("statically linked native binary {mapped_file} (allowed)");
    } else {
        tracing::warn!("executing statically linked native binary {mapped_file}");
    }

    let mut new_envp = Vec::with_capacity(orig_envp.len() + 3);
    if let Some(policy) = ExecPolicy::find_opt(session, exec_policy_name) {
        policy.emit_log_hook("log_level", "log_message");
        new_envp.push(format!(
            "{}={}",
            envname::EXEC_POLICY_NAME,
            exec_policy_name.unwrap_or("")
        ));
    }

    let tree = session.ruletree();
    let host_ld_library_path = tree
        .lookup_string(&["config", "host_ld_library_path"])
        .unwrap_or_default();
    let host_ld_preload = tree
        .lookup_string(&["config", "host_ld_preload"])
        .unwrap_or_default();
    new_envp.push(format!("LD_LIBRARY_PATH={host_ld_library_path}"));
    new_envp.push(format!("LD_PRELOAD={host_ld_preload}"));

    copy_env_filtered(&mut new_envp, &orig_envp);

    Ok(PostprocessOutput {
        file: mapped_file.to_string(),
        virtual_file: virtual_file.to_string(),
        argv: orig_argv,
        envp: new_envp,
    })
}
