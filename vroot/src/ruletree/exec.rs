//! Exec-related records: policy selection rules and argv-preprocessing
//! rules. Exec policies themselves are plain nested catalogs under
//! `exec_policy/<mode>/<name>/<field>` and need no record of their own.

use super::{ObjRef, RuleTree, kind};

/// Policy exec_flags bit: run host-compatible binaries through the
/// emulator anyway (when the emulator's arch can run them).
pub const EXEC_FLAGS_FORCE_CPU_TRANSPARENCY: u32 = 0x01;

/// Decoded exec-policy selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSelectionRec {
    pub selector_type: u32,
    pub flags: u32,
    pub selector: ObjRef,
    pub policy_name: ObjRef,
}

/// Decoded argv-preprocessing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecPreprocessingRec {
    pub binary_name: ObjRef,
    pub path_prefixes: ObjRef,
    pub add_head: ObjRef,
    pub add_options: ObjRef,
    pub add_tail: ObjRef,
    pub remove: ObjRef,
    pub new_filename: ObjRef,
    pub disable_mapping: bool,
}

/// Builder-side spec for one argv-preprocessing rule, keyed by program
/// basename.
#[derive(Debug, Default, Clone)]
pub struct ExecPreprocessingSpec {
    pub binary_name: String,
    /// If non-empty, the rule only applies when the file lives under one
    /// of these directory prefixes.
    pub path_prefixes: Vec<String>,
    /// Arguments inserted right after argv[0].
    pub add_head: Vec<String>,
    /// Options inserted after the head block.
    pub add_options: Vec<String>,
    /// Arguments appended at the end.
    pub add_tail: Vec<String>,
    /// Arguments removed wherever they occur.
    pub remove: Vec<String>,
    /// Replaces the file to execute.
    pub new_filename: Option<String>,
    /// Skip path mapping of the (possibly replaced) file.
    pub disable_mapping: bool,
}

impl ExecPreprocessingSpec {
    pub fn for_binary(name: &str) -> Self {
        Self {
            binary_name: name.to_string(),
            ..Self::default()
        }
    }
}

impl RuleTree {
    pub fn exec_selection_rule_at(&self, r: ObjRef) -> Option<ExecSelectionRec> {
        let f = self.fields(r, kind::EXEC_SELECTION_RULE, 4)?;
        Some(ExecSelectionRec {
            selector_type: f[0],
            flags: f[1],
            selector: ObjRef(f[2]),
            policy_name: ObjRef(f[3]),
        })
    }

    pub fn exec_preprocessing_rule_at(&self, r: ObjRef) -> Option<ExecPreprocessingRec> {
        let f = self.fields(r, kind::EXEC_PREPROCESSING_RULE, 8)?;
        Some(ExecPreprocessingRec {
            binary_name: ObjRef(f[0]),
            path_prefixes: ObjRef(f[1]),
            add_head: ObjRef(f[2]),
            add_options: ObjRef(f[3]),
            add_tail: ObjRef(f[4]),
            remove: ObjRef(f[5]),
            new_filename: ObjRef(f[6]),
            disable_mapping: f[7] != 0,
        })
    }
}
