//! Fs-rule records: selector, action and condition encoding.

use super::{ObjRef, RuleTree, kind};

/// Per-rule flags, threaded through to the mapping result.
pub mod flags {
    /// Writes through this mapping should fail with EROFS.
    pub const READONLY: u32 = 0x01;
    pub const READONLY_FS_ALWAYS: u32 = 0x02;
    pub const READONLY_FS_IF_NOT_ROOT: u32 = 0x04;
    /// Path resolution must not look past this rule (no symlink following).
    pub const FORCE_ORIG_PATH: u32 = 0x08;
    pub const FORCE_ORIG_PATH_UNLESS_CHROOT: u32 = 0x10;
    /// Set by the requirements probe only: the resolver must call the full
    /// translation for every prefix instead of concatenating components.
    pub const CALL_TRANSLATE_FOR_ALL: u32 = 0x20;

    /// The flags that mark a result read-only for writers.
    pub const ANY_READONLY: u32 = READONLY | READONLY_FS_ALWAYS | READONLY_FS_IF_NOT_ROOT;
}

/// How a rule's selector string matches a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SelectorType {
    /// Exact full-path equality.
    Path = 1,
    /// Byte prefix.
    Prefix = 2,
    /// Directory prefix: the next char after the match must be `/` or
    /// end-of-string; `/` itself matches the root.
    Dir = 3,
}

impl SelectorType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Path),
            2 => Some(Self::Prefix),
            3 => Some(Self::Dir),
            _ => None,
        }
    }
}

/// Test one selector against a full absolute path. Returns the matched
/// selector length — the minimum prefix that had to be known to decide
/// this selector.
pub fn selector_matches(selector_type: SelectorType, selector: &str, path: &str) -> Option<usize> {
    let sel_len = selector.len();
    match selector_type {
        SelectorType::Path => (path == selector).then_some(sel_len),
        SelectorType::Prefix => {
            (!selector.is_empty() && path.starts_with(selector)).then_some(sel_len)
        }
        SelectorType::Dir => {
            if selector.is_empty() {
                return None;
            }
            // the byte after the prefix must be '/' or end-of-string;
            // selector "/" matches any absolute path (the root itself)
            let tail_ok = path.len() == sel_len
                || path.as_bytes().get(sel_len) == Some(&b'/')
                || (sel_len == 1 && path.starts_with('/'));
            (tail_ok && path.starts_with(selector)).then_some(sel_len)
        }
    }
}

/// Rule action codes (the closed set of §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ActionType {
    UseOrigPath = 1,
    ForceOrigPath = 2,
    ForceOrigPathUnlessChroot = 3,
    MapTo = 4,
    ReplaceBy = 5,
    SetPath = 6,
    MapToValueOfEnvVar = 7,
    ReplaceByValueOfEnvVar = 8,
    Procfs = 9,
    UnionDir = 10,
    IfExistsThenMapTo = 11,
    IfExistsThenReplaceBy = 12,
    Subtree = 13,
    ConditionalActions = 14,
    FallbackToOldMappingEngine = 15,
}

impl ActionType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::UseOrigPath,
            2 => Self::ForceOrigPath,
            3 => Self::ForceOrigPathUnlessChroot,
            4 => Self::MapTo,
            5 => Self::ReplaceBy,
            6 => Self::SetPath,
            7 => Self::MapToValueOfEnvVar,
            8 => Self::ReplaceByValueOfEnvVar,
            9 => Self::Procfs,
            10 => Self::UnionDir,
            11 => Self::IfExistsThenMapTo,
            12 => Self::IfExistsThenReplaceBy,
            13 => Self::Subtree,
            14 => Self::ConditionalActions,
            15 => Self::FallbackToOldMappingEngine,
            _ => return None,
        })
    }
}

/// Conditions on candidate rules inside a conditional-actions list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConditionType {
    IfActiveExecPolicyIs = 1,
    IfRedirectIgnoreIsActive = 2,
    IfRedirectForceIsActive = 3,
    IfEnvVarIsNotEmpty = 4,
    IfEnvVarIsEmpty = 5,
    IfExistsIn = 6,
}

impl ConditionType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::IfActiveExecPolicyIs,
            2 => Self::IfRedirectIgnoreIsActive,
            3 => Self::IfRedirectForceIsActive,
            4 => Self::IfEnvVarIsNotEmpty,
            5 => Self::IfEnvVarIsEmpty,
            6 => Self::IfExistsIn,
            _ => return None,
        })
    }
}

/// Builder-side action description; encoded to `(action_type, string)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSpec {
    UseOrigPath,
    ForceOrigPath,
    ForceOrigPathUnlessChroot,
    MapTo(String),
    ReplaceBy(String),
    SetPath(String),
    MapToValueOfEnvVar(String),
    ReplaceByValueOfEnvVar(String),
    Procfs,
    /// Sources are carried by the rule's `rule_list_link`.
    UnionDir,
    IfExistsThenMapTo(String),
    IfExistsThenReplaceBy(String),
    /// Children are carried by the rule's `rule_list_link`.
    Subtree,
    /// Candidates are carried by the rule's `rule_list_link`.
    ConditionalActions,
    FallbackToOldMappingEngine,
}

impl ActionSpec {
    pub(crate) fn encode(&self) -> (u32, Option<&str>) {
        match self {
            Self::UseOrigPath => (ActionType::UseOrigPath as u32, None),
            Self::ForceOrigPath => (ActionType::ForceOrigPath as u32, None),
            Self::ForceOrigPathUnlessChroot => (ActionType::ForceOrigPathUnlessChroot as u32, None),
            Self::MapTo(s) => (ActionType::MapTo as u32, Some(s)),
            Self::ReplaceBy(s) => (ActionType::ReplaceBy as u32, Some(s)),
            Self::SetPath(s) => (ActionType::SetPath as u32, Some(s)),
            Self::MapToValueOfEnvVar(s) => (ActionType::MapToValueOfEnvVar as u32, Some(s)),
            Self::ReplaceByValueOfEnvVar(s) => (ActionType::ReplaceByValueOfEnvVar as u32, Some(s)),
            Self::Procfs => (ActionType::Procfs as u32, None),
            Self::UnionDir => (ActionType::UnionDir as u32, None),
            Self::IfExistsThenMapTo(s) => (ActionType::IfExistsThenMapTo as u32, Some(s)),
            Self::IfExistsThenReplaceBy(s) => (ActionType::IfExistsThenReplaceBy as u32, Some(s)),
            Self::Subtree => (ActionType::Subtree as u32, None),
            Self::ConditionalActions => (ActionType::ConditionalActions as u32, None),
            Self::FallbackToOldMappingEngine => {
                (ActionType::FallbackToOldMappingEngine as u32, None)
            }
        }
    }
}

/// Decoded fs-rule record. Field values are raw; string fields are
/// references into the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsRuleRec {
    pub name: ObjRef,
    pub selector_type: u32,
    pub selector: ObjRef,
    pub action_type: u32,
    pub action: ObjRef,
    pub condition_type: u32,
    pub condition: ObjRef,
    pub rule_list_link: ObjRef,
    pub flags: u32,
    pub binary_name: ObjRef,
    pub func_class: u32,
    pub exec_policy_name: ObjRef,
}

impl FsRuleRec {
    pub fn selector_type(&self) -> Option<SelectorType> {
        SelectorType::from_u32(self.selector_type)
    }

    pub fn action_type(&self) -> Option<ActionType> {
        ActionType::from_u32(self.action_type)
    }

    pub fn condition_type(&self) -> Option<ConditionType> {
        ConditionType::from_u32(self.condition_type)
    }
}

impl RuleTree {
    /// Decode an fs-rule record.
    pub fn fs_rule_at(&self, r: ObjRef) -> Option<FsRuleRec> {
        let f = self.fields(r, kind::FS_RULE, 12)?;
        Some(FsRuleRec {
            name: ObjRef(f[0]),
            selector_type: f[1],
            selector: ObjRef(f[2]),
            action_type: f[3],
            action: ObjRef(f[4]),
            condition_type: f[5],
            condition: ObjRef(f[6]),
            rule_list_link: ObjRef(f[7]),
            flags: f[8],
            binary_name: ObjRef(f[9]),
            func_class: f[10],
            exec_policy_name: ObjRef(f[11]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_roundtrip() {
        for v in 1..=3 {
            assert_eq!(SelectorType::from_u32(v).unwrap() as u32, v);
        }
        for v in 1..=15 {
            assert_eq!(ActionType::from_u32(v).unwrap() as u32, v);
        }
        for v in 1..=6 {
            assert_eq!(ConditionType::from_u32(v).unwrap() as u32, v);
        }
        assert!(SelectorType::from_u32(0).is_none());
        assert!(ActionType::from_u32(99).is_none());
    }

    #[test]
    fn test_action_encode() {
        let map_to = ActionSpec::MapTo("/x".into());
        let (t, arg) = map_to.encode();
        assert_eq!(t, ActionType::MapTo as u32);
        assert_eq!(arg, Some("/x"));

        let (t, arg) = ActionSpec::Subtree.encode();
        assert_eq!(t, ActionType::Subtree as u32);
        assert_eq!(arg, None);
    }
}
