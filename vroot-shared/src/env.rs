//! The environment-variable contract.
//!
//! `SBOX_*` variables configure a session and survive exec; `__SB2_*`
//! variables are written by the exec pipeline for the next process and
//! are never relayed further (the engine strips them before re-exporting
//! fresh values). External tooling greps for these exact names, so they
//! are string constants rather than anything cleverer.

/// Session directory; required, everything else lives under it.
pub const SESSION_DIR: &str = "SBOX_SESSION_DIR";
/// Name of the active fs-rule subtree.
pub const SESSION_MODE: &str = "SBOX_SESSION_MODE";
/// Optional sub-key refining the mapping mode.
pub const MAPPING_METHOD: &str = "SBOX_MAPPING_METHOD";
/// Name of the active net-rule subtree.
pub const NETWORK_MODE: &str = "SBOX_NETWORK_MODE";
/// Serialized virtual uid/gid block, see `vroot::vperm::ids`.
pub const VPERM_IDS: &str = "SBOX_VPERM_IDS";
/// One-shot vperm override consumed (and dropped) by the exec pipeline.
pub const VPERM_REQUEST: &str = "SBOX_VPERM_REQUEST";
/// Virtual chroot prefix in effect when the process was spawned.
pub const CHROOT_PATH: &str = "SBOX_CHROOT_PATH";
/// Any value disables path mapping globally.
pub const DISABLE_MAPPING: &str = "SBOX_DISABLE_MAPPING";
/// Colon-separated path lists consulted by conditional mapping rules.
pub const REDIRECT_IGNORE: &str = "SBOX_REDIRECT_IGNORE";
pub const REDIRECT_FORCE: &str = "SBOX_REDIRECT_FORCE";
/// Preserved across exec so debugging a traced child keeps working.
pub const SIGTRAP: &str = "SBOX_SIGTRAP";
/// Exact mapped path of one static binary that may exec without a warning.
pub const ALLOW_STATIC_BINARY: &str = "SBOX_ALLOW_STATIC_BINARY";

/// Prefix of all engine-private variables; everything starting with this
/// is stripped from inherited environments.
pub const PRIVATE_PREFIX: &str = "__SB2_";

/// Basename of the mapped binary, set before the new process runs.
pub const BINARYNAME: &str = "__SB2_BINARYNAME";
/// The name the caller asked to exec (interpreter name for scripts).
pub const ORIG_BINARYNAME: &str = "__SB2_ORIG_BINARYNAME";
/// The original filename; for scripts, the script itself.
pub const EXEC_BINARYNAME: &str = "__SB2_EXEC_BINARYNAME";
/// Fully mapped host path of the file that is really executed.
pub const REAL_BINARYNAME: &str = "__SB2_REAL_BINARYNAME";
/// Name of the exec policy that was applied.
pub const EXEC_POLICY_NAME: &str = "__SB2_EXEC_POLICY_NAME";
/// Virtual chroot prefix relayed to children.
pub const PRIVATE_CHROOT_PATH: &str = "__SB2_CHROOT_PATH";
/// The user's LD_* values, parked here while the engine owns the real ones.
pub const USER_LD_PRELOAD: &str = "__SB2_LD_PRELOAD";
pub const USER_LD_LIBRARY_PATH: &str = "__SB2_LD_LIBRARY_PATH";
