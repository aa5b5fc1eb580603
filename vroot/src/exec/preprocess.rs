//! Exec preprocessing: argv-modifying rules keyed by program basename.
//!
//! Used to redirect toolchain front-ends: an attempt to run
//! `/usr/bin/gcc` can be rewritten into the cross compiler, with spec
//! options inserted and unsupported flags removed, before ordinary path
//! mapping even looks at the file. The mode selects one of two rule
//! lists (`gcc` or `misc`).

use crate::paths::basename;
use crate::ruletree::exec::ExecPreprocessingRec;
use crate::session::Session;

#[derive(Debug, Default)]
pub(crate) struct PreprocessOutcome {
    /// The rule asked for the (replaced) file to skip path mapping.
    pub disable_mapping: bool,
}

fn find_rule(session: &Session, file: &str) -> Option<ExecPreprocessingRec> {
    let mode = session.mode()?;
    let tree = session.ruletree();

    let use_gcc_rules = tree.lookup_bool(&["use_gcc_argvmods", mode]);
    let rule_list = tree.lookup(&["argvmods", if use_gcc_rules { "gcc" } else { "misc" }]);
    if rule_list.is_none() {
        return None;
    }

    let file_basename = basename(file);
    for rule_offs in tree.list_items(rule_list) {
        let Some(rule) = tree.exec_preprocessing_rule_at(rule_offs) else {
            continue;
        };
        if tree.string_at(rule.binary_name).as_deref() != Some(file_basename) {
            continue;
        }
        if rule.path_prefixes.is_some() {
            let prefixes = tree.string_list(rule.path_prefixes);
            if !prefixes.iter().any(|p| file.starts_with(p.as_str())) {
                continue;
            }
        }
        tracing::debug!("found exec preprocessing rule for '{file_basename}'");
        return Some(rule);
    }
    tracing::debug!("no exec preprocessing rules for '{file_basename}'");
    None
}

/// Apply the matching argv-mod rule, if any. `file` and `argv` are
/// updated in place; absent or non-matching rules pass everything
/// through untouched.
pub(crate) fn apply_exec_preprocessing_rules(
    session: &Session,
    file: &mut String,
    argv: &mut Vec<String>,
) -> PreprocessOutcome {
    if file.is_empty() {
        return PreprocessOutcome::default();
    }
    let Some(rule) = find_rule(session, file) else {
        return PreprocessOutcome::default();
    };
    let tree = session.ruletree();

    // argv[0] is the program name, never an option to strip
    let remove = tree.string_list(rule.remove);
    if !remove.is_empty() && argv.len() > 1 {
        let tail: Vec<String> = argv
            .drain(1..)
            .filter(|arg| !remove.contains(arg))
            .collect();
        argv.extend(tail);
    }

    let mut insert_at = 1.min(argv.len());
    for arg in tree.string_list(rule.add_head) {
        argv.insert(insert_at, arg);
        insert_at += 1;
    }
    for arg in tree.string_list(rule.add_options) {
        argv.insert(insert_at, arg);
        insert_at += 1;
    }
    for arg in tree.string_list(rule.add_tail) {
        argv.push(arg);
    }

    if let Some(new_filename) = tree.string_at(rule.new_filename) {
        tracing::debug!("exec preprocessing: file '{file}' -> '{new_filename}'");
        *file = new_filename.clone();
        // argv[0] traditionally keeps the caller's spelling; the rule
        // only replaces what is executed
    }

    PreprocessOutcome {
        disable_mapping: rule.disable_mapping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruletree::RuleTreeBuilder;
    use crate::ruletree::exec::ExecPreprocessingSpec;
    use crate::session::SessionConfig;
    use tempfile::TempDir;

    fn session_with_rule(dir: &TempDir, spec: &ExecPreprocessingSpec) -> Session {
        let config = SessionConfig::new(dir.path()).with_mode("devel");
        config.layout().prepare().unwrap();
        let mut b = RuleTreeBuilder::new();
        let rule = b.add_exec_preprocessing_rule(spec);
        let rules = b.add_list(&[rule]);
        b.set(&["argvmods", "misc"], rules);
        b.write_to(&config.layout().rule_tree_file()).unwrap();
        Session::open(config).unwrap()
    }

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rule_rewrites_argv_and_file() {
        let dir = TempDir::new().unwrap();
        let spec = ExecPreprocessingSpec {
            binary_name: "gcc".into(),
            add_head: vec!["-specs=/sb/specs".into()],
            add_tail: vec!["-lextra".into()],
            remove: vec!["-Werror".into()],
            new_filename: Some("/opt/cross/bin/real-gcc".into()),
            ..Default::default()
        };
        let session = session_with_rule(&dir, &spec);

        let mut file = "/usr/bin/gcc".to_string();
        let mut args = argv(&["gcc", "-Werror", "-c", "x.c"]);
        let outcome = apply_exec_preprocessing_rules(&session, &mut file, &mut args);

        assert_eq!(file, "/opt/cross/bin/real-gcc");
        assert_eq!(args, argv(&["gcc", "-specs=/sb/specs", "-c", "x.c", "-lextra"]));
        assert!(!outcome.disable_mapping);
    }

    #[test]
    fn test_basename_mismatch_passes_through() {
        let dir = TempDir::new().unwrap();
        let spec = ExecPreprocessingSpec {
            binary_name: "gcc".into(),
            new_filename: Some("/opt/cross/bin/real-gcc".into()),
            ..Default::default()
        };
        let session = session_with_rule(&dir, &spec);

        let mut file = "/usr/bin/ld".to_string();
        let mut args = argv(&["ld", "-o", "a.out"]);
        apply_exec_preprocessing_rules(&session, &mut file, &mut args);
        assert_eq!(file, "/usr/bin/ld");
        assert_eq!(args, argv(&["ld", "-o", "a.out"]));
    }

    #[test]
    fn test_path_prefix_filter() {
        let dir = TempDir::new().unwrap();
        let spec = ExecPreprocessingSpec {
            binary_name: "gcc".into(),
            path_prefixes: vec!["/usr/bin/".into()],
            new_filename: Some("/opt/cross/bin/real-gcc".into()),
            ..Default::default()
        };
        let session = session_with_rule(&dir, &spec);

        let mut file = "/home/u/gcc".to_string();
        let mut args = argv(&["gcc"]);
        apply_exec_preprocessing_rules(&session, &mut file, &mut args);
        assert_eq!(file, "/home/u/gcc");

        let mut file = "/usr/bin/gcc".to_string();
        apply_exec_preprocessing_rules(&session, &mut file, &mut args);
        assert_eq!(file, "/opt/cross/bin/real-gcc");
    }
}
