//! Rule selection and action execution.
//!
//! Given a clean absolute virtual path and an ordered rule list, pick
//! the first applicable rule (depth-first through SUBTREE nesting) and
//! run its action. Conditional-actions rules evaluate an ordered
//! candidate list; `if_exists_*` candidates that miss fall through to
//! the next candidate.

use vroot_shared::LogLevel;

use crate::error::MappingError;
use crate::logging;
use crate::paths::{Cleanliness, PathList};
use crate::ruletree::fsrule::{ActionType, ConditionType, FsRuleRec, SelectorType, flags};
use crate::ruletree::ObjRef;
use crate::session::Session;

use super::{MappingContext, procfs, resolution, uniondir};

/// A selected rule plus the prefix length that was needed to select it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuleMatch {
    pub rule: FsRuleRec,
    pub min_path_len: usize,
}

/// Result of running one rule's action over one path.
#[derive(Debug, Clone, Default)]
pub(crate) struct TranslationOutput {
    pub host_path: String,
    pub flags: u32,
    pub exec_policy_name: Option<String>,
}

/// Selector match: returns the matched selector length.
fn selector_match(session: &Session, rule: &FsRuleRec, path: &str) -> Option<usize> {
    let selector = session.ruletree().string_at(rule.selector)?;
    crate::ruletree::fsrule::selector_matches(rule.selector_type()?, &selector, path)
}

/// Walk a rule list in order and return the first applicable rule.
///
/// Rules carrying conditions can't be selected here (conditions belong
/// to conditional-actions candidates); hitting one aborts the search,
/// which surfaces broken rule files instead of mismapping.
pub(crate) fn find_rule(
    session: &Session,
    ctx: &MappingContext<'_>,
    rule_list: ObjRef,
    path: &str,
) -> Option<RuleMatch> {
    let tree = session.ruletree();
    for rule_offs in tree.list_items(rule_list) {
        let Some(rule) = tree.fs_rule_at(rule_offs) else {
            continue;
        };

        if rule.condition_type != 0 {
            tracing::debug!("find_rule: rule list has a conditional rule, giving up");
            return None;
        }
        if rule.selector_type == 0 {
            // defunct rule
            continue;
        }

        let Some(min_path_len) = selector_match(session, &rule, path) else {
            continue;
        };

        if rule.func_class != 0 && rule.func_class & ctx.fn_class == 0 {
            continue;
        }
        if rule.binary_name.is_some() {
            let rule_binary = tree.string_at(rule.binary_name);
            if rule_binary.as_deref() != Some(ctx.binary_name) {
                continue;
            }
        }

        if rule.action_type() == Some(ActionType::Subtree) {
            if rule.rule_list_link.is_some() {
                if let Some(found) = find_rule(session, ctx, rule.rule_list_link, path) {
                    return Some(found);
                }
            }
            continue;
        }

        return Some(RuleMatch {
            rule,
            min_path_len,
        });
    }
    None
}

/// The resolver's pre-pass: how much of the path must be known before a
/// rule can be selected, and whether every prefix needs a full
/// translation call (actions whose decision depends on the path suffix).
pub(crate) fn mapping_requirements(
    session: &Session,
    ctx: &MappingContext<'_>,
    rule_list: ObjRef,
    path: &str,
) -> (usize, bool) {
    match find_rule(session, ctx, rule_list, path) {
        Some(m) => {
            let translate_all = matches!(
                m.rule.action_type(),
                Some(ActionType::ConditionalActions) | Some(ActionType::Procfs)
            );
            (m.min_path_len, translate_all)
        }
        None => (0, false),
    }
}

fn path_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

fn join_under(root: &str, abs_path: &str) -> String {
    if root.is_empty() || root == "/" {
        abs_path.to_string()
    } else {
        format!("{root}{abs_path}")
    }
}

/// REPLACE_BY: swap the matched selector prefix for `replacement`.
fn execute_replace(
    session: &Session,
    rule_selector: &FsRuleRec,
    path: &str,
    replacement: &str,
) -> Result<String, MappingError> {
    let selector = session
        .ruletree()
        .string_at(rule_selector.selector)
        .ok_or(MappingError::Config("replace rule without selector"))?;
    match rule_selector.selector_type() {
        Some(SelectorType::Prefix) | Some(SelectorType::Dir) => {
            Ok(format!("{replacement}{}", &path[selector.len()..]))
        }
        Some(SelectorType::Path) => {
            if path == selector {
                Ok(replacement.to_string())
            } else {
                // during resolution the path may be shorter than the selector
                Err(MappingError::Config("exact-path replacement failed"))
            }
        }
        None => Err(MappingError::Config("replace rule with bad selector type")),
    }
}

/// The "standard" actions (everything except subtree/conditional).
fn execute_std_action(
    session: &Session,
    rule_selector: &FsRuleRec,
    action: &FsRuleRec,
    path: &str,
    out_flags: &mut u32,
) -> Result<String, MappingError> {
    let tree = session.ruletree();
    let action_str = || tree.string_at(action.action);

    match action.action_type() {
        Some(ActionType::UseOrigPath) => Ok(path.to_string()),
        Some(ActionType::ForceOrigPath) => {
            *out_flags |= flags::FORCE_ORIG_PATH;
            Ok(path.to_string())
        }
        Some(ActionType::ForceOrigPathUnlessChroot) => {
            *out_flags |= flags::FORCE_ORIG_PATH_UNLESS_CHROOT;
            Ok(path.to_string())
        }
        Some(ActionType::MapTo) => Ok(join_under(&action_str().unwrap_or_default(), path)),
        Some(ActionType::ReplaceBy) => {
            let replacement = action_str().unwrap_or_default();
            execute_replace(session, rule_selector, path, &replacement)
        }
        Some(ActionType::SetPath) => {
            action_str().ok_or(MappingError::Config("set_path without a path"))
        }
        Some(ActionType::MapToValueOfEnvVar) => {
            let var = action_str().unwrap_or_default();
            let prefix = std::env::var(&var).unwrap_or_default();
            Ok(join_under(&prefix, path))
        }
        Some(ActionType::ReplaceByValueOfEnvVar) => {
            let var = action_str().unwrap_or_default();
            let replacement = std::env::var(&var).unwrap_or_default();
            execute_replace(session, rule_selector, path, &replacement)
        }
        Some(ActionType::Procfs) => {
            Ok(procfs::mapping_request(session, path).unwrap_or_else(|| path.to_string()))
        }
        Some(ActionType::UnionDir) => {
            let sources = tree.string_list(rule_selector.rule_list_link);
            if sources.is_empty() {
                return Err(MappingError::Config("union_dir rule without sources"));
            }
            uniondir::prepare_union_dir(session, path, &sources)
                .map_err(|_| MappingError::Config("union_dir preparation failed"))
        }
        Some(ActionType::FallbackToOldMappingEngine) => {
            // the old engine does not exist in this implementation
            Err(MappingError::Config("fallback_to_old_mapping_engine"))
        }
        _ => Err(MappingError::Config("unexpected action code")),
    }
}

fn in_colon_list(needle: &str, list: Option<&str>) -> bool {
    list.is_some_and(|l| l.split(':').any(|item| item == needle))
}

/// `None` = unknown condition type (a rule-file error); a condition
/// whose argument string is missing simply doesn't hold.
fn condition_holds(session: &Session, candidate: &FsRuleRec, path: &str) -> Option<bool> {
    let cond_type = candidate.condition_type()?;
    let Some(cond_str) = session.ruletree().string_at(candidate.condition) else {
        return Some(false);
    };
    let holds = match cond_type {
        ConditionType::IfActiveExecPolicyIs => {
            session.config().active_exec_policy.as_deref() == Some(cond_str.as_str())
        }
        ConditionType::IfRedirectIgnoreIsActive => {
            in_colon_list(&cond_str, session.config().redirect_ignore.as_deref())
        }
        ConditionType::IfRedirectForceIsActive => {
            in_colon_list(&cond_str, session.config().redirect_force.as_deref())
        }
        ConditionType::IfEnvVarIsNotEmpty => {
            std::env::var(&cond_str).is_ok_and(|v| !v.is_empty())
        }
        ConditionType::IfEnvVarIsEmpty => {
            !std::env::var(&cond_str).is_ok_and(|v| !v.is_empty())
        }
        ConditionType::IfExistsIn => path_exists(&join_under(&cond_str, path)),
    };
    Some(holds)
}

/// Evaluate a conditional-actions candidate list in order.
fn execute_conditional_actions(
    session: &Session,
    rule_selector: &FsRuleRec,
    candidate_list: ObjRef,
    path: &str,
    out_flags: &mut u32,
) -> Result<String, MappingError> {
    let tree = session.ruletree();
    let candidates = tree.list_items(candidate_list);
    if candidates.is_empty() {
        return Err(MappingError::Config("conditional action list is empty"));
    }

    for cand_offs in candidates {
        let Some(cand) = tree.fs_rule_at(cand_offs) else {
            continue;
        };

        if cand.condition_type != 0 {
            match condition_holds(session, &cand, path) {
                Some(true) => {
                    if cand.condition_type() == Some(ConditionType::IfExistsIn) {
                        // the "then" branch is a nested candidate list
                        if cand.rule_list_link.is_some() {
                            return execute_conditional_actions(
                                session,
                                rule_selector,
                                cand.rule_list_link,
                                path,
                                out_flags,
                            );
                        }
                        continue;
                    }
                }
                Some(false) => continue,
                None => return Err(MappingError::Config("unknown condition in rule file")),
            }
        }

        match cand.action_type() {
            Some(ActionType::IfExistsThenMapTo) => {
                let target = tree.string_at(cand.action).unwrap_or_default();
                let test_path = join_under(&target, path);
                if path_exists(&test_path) {
                    return Ok(test_path);
                }
            }
            Some(ActionType::IfExistsThenReplaceBy) => {
                let replacement = tree.string_at(cand.action).unwrap_or_default();
                if let Ok(test_path) = execute_replace(session, rule_selector, path, &replacement) {
                    if path_exists(&test_path) {
                        return Ok(test_path);
                    }
                }
            }
            Some(
                ActionType::UseOrigPath
                | ActionType::ForceOrigPath
                | ActionType::ForceOrigPathUnlessChroot
                | ActionType::MapTo
                | ActionType::ReplaceBy
                | ActionType::SetPath
                | ActionType::MapToValueOfEnvVar
                | ActionType::ReplaceByValueOfEnvVar
                | ActionType::Procfs
                | ActionType::UnionDir,
            ) => return execute_std_action(session, rule_selector, &cand, path, out_flags),
            _ => return Err(MappingError::Config("unknown conditional action")),
        }
    }

    // running off the end of the list is a rule-file error
    Err(MappingError::Config("end of conditional action list"))
}

/// Run one selected rule over a clean absolute virtual path, clean the
/// produced host path and emit the stable result log line.
pub(crate) fn translate_with_rule(
    session: &Session,
    ctx: &MappingContext<'_>,
    rule: &FsRuleRec,
    abs_clean_virtual_path: &str,
    result_level: LogLevel,
) -> Result<TranslationOutput, MappingError> {
    let tree = session.ruletree();
    let mut out_flags = rule.flags;
    let exec_policy_name = tree.string_at(rule.exec_policy_name);

    let host_path = match rule.action_type() {
        Some(ActionType::ConditionalActions) => execute_conditional_actions(
            session,
            rule,
            rule.rule_list_link,
            abs_clean_virtual_path,
            &mut out_flags,
        )?,
        Some(ActionType::Subtree) => {
            return Err(MappingError::Config("subtree rule reached action stage"));
        }
        Some(_) => {
            execute_std_action(session, rule, rule, abs_clean_virtual_path, &mut out_flags)?
        }
        None => return Err(MappingError::Config("rule without an action")),
    };

    if !host_path.starts_with('/') {
        tracing::error!(
            "mapping produced a relative result ('{abs_clean_virtual_path}' -> '{host_path}')"
        );
        return Err(MappingError::Config("mapping result is not absolute"));
    }

    let cleaned = clean_host_path(session, ctx, &host_path)?;
    logging::log_mapping_result(
        result_level,
        ctx.func_name,
        abs_clean_virtual_path,
        &cleaned,
        out_flags,
    );

    Ok(TranslationOutput {
        host_path: cleaned,
        flags: out_flags,
        exec_policy_name,
    })
}

/// Rules may assemble host paths with doubled slashes or dots; clean
/// them up before anyone sees them. `..` from a rule is legal and only
/// needs host-side (realpath) resolution.
fn clean_host_path(
    session: &Session,
    ctx: &MappingContext<'_>,
    host_path: &str,
) -> Result<String, MappingError> {
    let mut list = PathList::split(host_path);
    list.host_path = true;
    match list.cleanliness() {
        Cleanliness::Clean => {}
        Cleanliness::HasDots => list.remove_dots(),
        Cleanliness::HasDotDots => {
            list.remove_dots();
            resolution::clean_dotdots(session, ctx, &mut list)
                .map_err(MappingError::Resolution)?;
        }
    }
    Ok(list.to_string())
}

/// Translate one clean absolute virtual path against a rule list. A path
/// no rule covers passes through unchanged (logged as `pass:`).
pub(crate) fn translate(
    session: &Session,
    ctx: &MappingContext<'_>,
    rule_list: ObjRef,
    abs_clean_virtual_path: &str,
    result_level: LogLevel,
) -> Result<TranslationOutput, MappingError> {
    match find_rule(session, ctx, rule_list, abs_clean_virtual_path) {
        Some(m) => translate_with_rule(session, ctx, &m.rule, abs_clean_virtual_path, result_level),
        None => {
            logging::log_mapping_result(
                result_level,
                ctx.func_name,
                abs_clean_virtual_path,
                abs_clean_virtual_path,
                0,
            );
            Ok(TranslationOutput {
                host_path: abs_clean_virtual_path.to_string(),
                flags: 0,
                exec_policy_name: None,
            })
        }
    }
}

/// Map a path against an explicit rule list without path resolution
/// (used for script interpreters). The path must already be a clean
/// absolute virtual path; anything else makes the caller fall back to
/// the ordinary full mapping.
pub(crate) fn map_abstract_path(
    session: &Session,
    binary_name: &str,
    func_name: &str,
    fn_class: u32,
    rule_list: ObjRef,
    path: &str,
) -> Option<TranslationOutput> {
    if !path.starts_with('/') {
        return None;
    }
    let list = PathList::split(path);
    if list.cleanliness() != Cleanliness::Clean || list.to_string() != path {
        return None;
    }
    let ctx = MappingContext {
        binary_name,
        func_name,
        fn_class,
        dont_resolve_final_symlink: false,
    };
    let m = find_rule(session, &ctx, rule_list, path)?;
    translate_with_rule(session, &ctx, &m.rule, path, LogLevel::Debug).ok()
}
