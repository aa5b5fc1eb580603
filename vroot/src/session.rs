//! Session state.
//!
//! [`SessionConfig`] is the per-process snapshot of the `SBOX_*`
//! environment, read once and immutable afterwards (the exec pipeline
//! re-exports it, never mutates it). [`Session`] couples a config with
//! the opened rule tree and the two pieces of genuinely mutable
//! per-process state: the virtual ids and the virtual chroot prefix.
//!
//! The per-thread reentrancy guard lives here as well: while a thread is
//! inside the mapping engine, intercepted calls made by the engine
//! itself (readlink, logging, ...) must fall through unmapped. A
//! [`MappingGuard`] raises the per-thread counter for its lifetime.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::RwLock;
use vroot_shared::{SessionLayout, env};

use crate::error::SessionError;
use crate::ruletree::{ObjRef, RuleTree};
use crate::vperm::ids::VpermIds;

/// Immutable per-process configuration, normally read from `SBOX_*`
/// variables on startup.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub session_dir: PathBuf,
    /// Mapping mode; falls back to the tree's `MODES/#default`.
    pub mode: Option<String>,
    pub mapping_method: Option<String>,
    pub network_mode: Option<String>,
    /// Raw SBOX_VPERM_IDS value.
    pub vperm_ids: Option<String>,
    /// Virtual chroot in effect at spawn.
    pub chroot_path: Option<String>,
    /// SBOX_DISABLE_MAPPING was set: every path passes through.
    pub disable_mapping: bool,
    /// Colon lists consulted by redirect conditions.
    pub redirect_ignore: Option<String>,
    pub redirect_force: Option<String>,
    /// Basename of this process' binary (from __SB2_BINARYNAME).
    pub binary_name: String,
    /// Names of the logical executable, for /proc/self/exe staging.
    pub orig_binary_name: Option<String>,
    pub real_binary_name: Option<String>,
    /// Exec policy that launched this process (__SB2_EXEC_POLICY_NAME).
    pub active_exec_policy: Option<String>,
}

impl SessionConfig {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            binary_name: "unknown".to_string(),
            ..Self::default()
        }
    }

    /// Read the whole `SBOX_*` / `__SB2_*` snapshot from the environment.
    pub fn from_env() -> Result<Self, SessionError> {
        let session_dir = std::env::var_os(env::SESSION_DIR).ok_or(SessionError::NoSessionDir)?;
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Ok(Self {
            session_dir: PathBuf::from(session_dir),
            mode: var(env::SESSION_MODE),
            mapping_method: var(env::MAPPING_METHOD),
            network_mode: var(env::NETWORK_MODE),
            vperm_ids: var(env::VPERM_IDS),
            chroot_path: var(env::CHROOT_PATH),
            disable_mapping: std::env::var_os(env::DISABLE_MAPPING).is_some(),
            redirect_ignore: var(env::REDIRECT_IGNORE),
            redirect_force: var(env::REDIRECT_FORCE),
            binary_name: var(env::BINARYNAME).unwrap_or_else(|| "unknown".to_string()),
            orig_binary_name: var(env::ORIG_BINARYNAME),
            real_binary_name: var(env::REAL_BINARYNAME),
            active_exec_policy: var(env::EXEC_POLICY_NAME),
        })
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn with_binary_name(mut self, name: &str) -> Self {
        self.binary_name = name.to_string();
        self
    }

    pub fn with_network_mode(mut self, mode: &str) -> Self {
        self.network_mode = Some(mode.to_string());
        self
    }

    pub fn with_vperm_ids(mut self, ids: &str) -> Self {
        self.vperm_ids = Some(ids.to_string());
        self
    }

    pub fn with_orig_binary_name(mut self, name: &str) -> Self {
        self.orig_binary_name = Some(name.to_string());
        self
    }

    pub fn layout(&self) -> SessionLayout {
        SessionLayout::new(&self.session_dir)
    }
}

/// An opened session: config + rule tree + mutable vperm/chroot state.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    layout: SessionLayout,
    ruletree: RuleTree,
    mode: Option<String>,
    fwd_rules: OnceLock<ObjRef>,
    rev_rules: OnceLock<ObjRef>,
    vperm_ids: RwLock<VpermIds>,
    chroot: RwLock<Option<String>>,
}

impl Session {
    /// Open the session named by the environment. Fatal without
    /// SBOX_SESSION_DIR: there is no rule tree to map with.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::open(SessionConfig::from_env()?)
    }

    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let layout = config.layout();
        let ruletree = RuleTree::open(&layout.rule_tree_file())?;
        let mode = config
            .mode
            .clone()
            .or_else(|| ruletree.lookup_string(&["MODES", "#default"]));

        let vperm_ids = match &config.vperm_ids {
            Some(raw) => VpermIds::parse(raw)
                .ok_or_else(|| SessionError::InvalidVpermIds(raw.clone()))?,
            None => VpermIds::from_real(),
        };
        let chroot = config.chroot_path.clone();

        Ok(Self {
            config,
            layout,
            ruletree,
            mode,
            fwd_rules: OnceLock::new(),
            rev_rules: OnceLock::new(),
            vperm_ids: RwLock::new(vperm_ids),
            chroot: RwLock::new(chroot),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn ruletree(&self) -> &RuleTree {
        &self.ruletree
    }

    /// The resolved mode name (explicit or the tree's default).
    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }

    /// The forward fs-rule list for the active mode.
    pub fn fwd_rules(&self) -> ObjRef {
        *self.fwd_rules.get_or_init(|| match &self.mode {
            Some(mode) => self.ruletree.lookup(&["fs_rules", mode]),
            None => ObjRef::NONE,
        })
    }

    /// The reverse rule list for the active mode.
    pub fn rev_rules(&self) -> ObjRef {
        *self.rev_rules.get_or_init(|| match &self.mode {
            Some(mode) => self.ruletree.lookup(&["rev_rules", mode]),
            None => ObjRef::NONE,
        })
    }

    /// Current virtual ids (copy).
    pub fn vperm_ids(&self) -> VpermIds {
        *self.vperm_ids.read()
    }

    pub fn set_vperm_ids(&self, ids: VpermIds) {
        *self.vperm_ids.write() = ids;
    }

    pub fn update_vperm_ids(&self, f: impl FnOnce(&mut VpermIds)) {
        f(&mut self.vperm_ids.write());
    }

    /// Active virtual chroot prefix, if any.
    pub fn chroot_path(&self) -> Option<String> {
        self.chroot.read().clone()
    }

    pub fn set_chroot_path(&self, path: Option<String>) {
        *self.chroot.write() = path;
    }
}

/// Per-thread engine state.
#[derive(Debug, Default)]
pub struct ThreadContext {
    /// While non-zero, intercepted calls fall through unmapped.
    pub mapping_disabled: u32,
    /// One-slot memo: (host CWD, reverse-mapped virtual CWD).
    pub cwd_cache: Option<(String, String)>,
}

thread_local! {
    static THREAD_CTX: RefCell<ThreadContext> = RefCell::new(ThreadContext::default());
}

pub fn with_thread_context<T>(f: impl FnOnce(&mut ThreadContext) -> T) -> T {
    THREAD_CTX.with(|ctx| f(&mut ctx.borrow_mut()))
}

/// Current reentrancy depth of this thread.
pub fn mapping_disabled_level() -> u32 {
    with_thread_context(|ctx| ctx.mapping_disabled)
}

/// RAII guard: mapping is disabled on this thread while it lives.
#[derive(Debug)]
pub struct MappingGuard(());

impl MappingGuard {
    pub fn new() -> Self {
        with_thread_context(|ctx| ctx.mapping_disabled += 1);
        MappingGuard(())
    }
}

impl Default for MappingGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MappingGuard {
    fn drop(&mut self) {
        with_thread_context(|ctx| {
            debug_assert!(ctx.mapping_disabled > 0);
            ctx.mapping_disabled = ctx.mapping_disabled.saturating_sub(1);
        });
    }
}
