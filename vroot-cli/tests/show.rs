//! vroot-show behavior against a scratch session.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use vroot::ruletree::RuleTreeBuilder;
use vroot::ruletree::builder::FsRuleSpec;
use vroot::ruletree::fsrule::{ActionSpec, SelectorType};
use vroot_shared::SessionLayout;

fn scratch_session(dir: &TempDir) -> SessionLayout {
    let layout = SessionLayout::new(dir.path());
    layout.prepare().unwrap();

    let mut b = RuleTreeBuilder::new();
    let default_mode = b.add_string("devel");
    b.set(&["MODES", "#default"], default_mode);
    let rule = b.add_fs_rule(&FsRuleSpec::new(
        SelectorType::Dir,
        "/bin",
        ActionSpec::MapTo("/tools".into()),
    ));
    let rules = b.add_list(&[rule]);
    b.set(&["fs_rules", "devel"], rules);
    b.write_to(&layout.rule_tree_file()).unwrap();
    layout
}

fn show(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("vroot-show").unwrap();
    cmd.env("SBOX_SESSION_DIR", dir.path());
    cmd.env_remove("SBOX_SESSION_MODE");
    cmd
}

#[test]
fn test_path_command_prints_mappings() {
    let dir = TempDir::new().unwrap();
    scratch_session(&dir);

    show(&dir)
        .args(["path", "/bin/ls", "/etc/hosts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/bin/ls => /tools/bin/ls"))
        .stdout(predicate::str::contains("/etc/hosts => /etc/hosts"));
}

#[test]
fn test_binary_name_filter_flag() {
    let dir = TempDir::new().unwrap();
    let layout = SessionLayout::new(dir.path());
    layout.prepare().unwrap();

    let mut b = RuleTreeBuilder::new();
    let default_mode = b.add_string("devel");
    b.set(&["MODES", "#default"], default_mode);
    let only_make = b.add_fs_rule(
        &FsRuleSpec::new(
            SelectorType::Dir,
            "/bin",
            ActionSpec::MapTo("/make-view".into()),
        )
        .with_binary_name("make"),
    );
    let rules = b.add_list(&[only_make]);
    b.set(&["fs_rules", "devel"], rules);
    b.write_to(&layout.rule_tree_file()).unwrap();

    show(&dir)
        .args(["-b", "make", "path", "/bin/ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/bin/ls => /make-view/bin/ls"));

    show(&dir)
        .args(["path", "/bin/ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/bin/ls => /bin/ls"));
}

#[test]
fn test_usage_errors_exit_1() {
    let dir = TempDir::new().unwrap();
    scratch_session(&dir);

    // no subcommand
    show(&dir).assert().failure().code(1);
    // path without arguments
    show(&dir).args(["path"]).assert().failure().code(1);
    // unknown subcommand
    show(&dir).args(["bogus", "/x"]).assert().failure().code(1);
}

#[test]
fn test_outside_a_session_fails() {
    let mut cmd = Command::cargo_bin("vroot-show").unwrap();
    cmd.env_remove("SBOX_SESSION_DIR");
    cmd.args(["path", "/bin/ls"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("session"));
}

#[test]
fn test_mode_override_flag() {
    let dir = TempDir::new().unwrap();
    let layout = SessionLayout::new(dir.path());
    layout.prepare().unwrap();

    let mut b = RuleTreeBuilder::new();
    let default_mode = b.add_string("devel");
    b.set(&["MODES", "#default"], default_mode);
    let devel = b.add_fs_rule(&FsRuleSpec::new(
        SelectorType::Dir,
        "/bin",
        ActionSpec::MapTo("/devel-view".into()),
    ));
    let devel_rules = b.add_list(&[devel]);
    b.set(&["fs_rules", "devel"], devel_rules);
    let emul = b.add_fs_rule(&FsRuleSpec::new(
        SelectorType::Dir,
        "/bin",
        ActionSpec::MapTo("/emul-view".into()),
    ));
    let emul_rules = b.add_list(&[emul]);
    b.set(&["fs_rules", "emulate"], emul_rules);
    b.write_to(&layout.rule_tree_file()).unwrap();

    show(&dir)
        .args(["path", "/bin/ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("=> /devel-view/bin/ls"));

    show(&dir)
        .args(["-m", "emulate", "path", "/bin/ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("=> /emul-view/bin/ls"));
}
