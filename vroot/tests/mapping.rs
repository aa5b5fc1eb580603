//! End-to-end path mapping: rule selection, symlink resolution, reverse
//! mapping and chroot composition against real scratch directories.

mod common;

use common::{TestSession, build_session, build_session_with};
use nix::errno::Errno;
use vroot::mapping::fnclass;
use vroot::ruletree::builder::FsRuleSpec;
use vroot::ruletree::fsrule::{ActionSpec, ConditionType, SelectorType, flags};

fn map(ts: &TestSession, path: &str) -> String {
    let res = ts
        .session
        .map_path("sh", "open", fnclass::OPEN, path, false);
    assert_eq!(res.errno, None, "mapping '{path}' failed: {res:?}");
    res.host_path.clone().unwrap()
}

#[test]
fn test_dir_rule_maps_bin() {
    // one rule {DIR, "/bin", MAP_TO, "/tools"}: map_to prepends its
    // prefix to the whole virtual path, so /bin/ls lands in the tools
    // collection; untouched paths pass through
    let ts = build_session(|b, _| {
        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/bin",
            ActionSpec::MapTo("/tools".into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    let res = ts
        .session
        .map_path("sh", "open", fnclass::OPEN, "/bin/ls", false);
    assert_eq!(res.path(), Some("/tools/bin/ls"));
    assert!(!res.readonly);

    // DIR must not match a sibling with the same byte prefix
    assert_eq!(map(&ts, "/binary"), "/binary");
    // the directory itself matches
    assert_eq!(map(&ts, "/bin"), "/tools/bin");
    // cleanup happens before matching
    assert_eq!(map(&ts, "//bin/./ls"), "/tools/bin/ls");
}

#[test]
fn test_symlink_resolved_through_rule() {
    // /bin/sh -> busybox on the host side of the mapping: the resolver
    // follows the host link but re-expresses the result virtually
    let ts = build_session(|b, tmp| {
        let tools = tmp.join("tools/bin");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::write(tools.join("busybox"), b"#!x\n").unwrap();
        std::os::unix::fs::symlink("busybox", tools.join("sh")).unwrap();

        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/bin",
            ActionSpec::ReplaceBy(tmp.join("tools/bin").to_str().unwrap().into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    assert_eq!(map(&ts, "/bin/sh"), ts.host("tools/bin/busybox"));

    // lstat-style mapping must keep the final symlink itself
    let res = ts
        .session
        .map_path("sh", "lstat", fnclass::STAT, "/bin/sh", true);
    assert_eq!(res.path(), Some(ts.host("tools/bin/sh").as_str()));
}

#[test]
fn test_absolute_symlink_restarts_from_root() {
    let ts = build_session(|b, tmp| {
        let root = tmp.join("vroot");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/real.conf"), b"x").unwrap();
        std::os::unix::fs::symlink("/etc/real.conf", root.join("etc/alias.conf")).unwrap();

        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/etc",
            ActionSpec::MapTo(root.join("etc").parent().unwrap().to_str().unwrap().into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    assert_eq!(map(&ts, "/etc/alias.conf"), ts.host("vroot/etc/real.conf"));
}

#[test]
fn test_replace_by_with_readonly_flag() {
    let ts = build_session(|b, tmp| {
        let target = tmp.join("S/etc/resolv.conf");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"nameserver 10.0.0.1\n").unwrap();

        let rule = b.add_fs_rule(
            &FsRuleSpec::new(
                SelectorType::Path,
                "/etc/resolv.conf",
                ActionSpec::ReplaceBy(target.to_str().unwrap().into()),
            )
            .with_flags(flags::READONLY),
        );
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    let res = ts
        .session
        .map_path("sh", "open", fnclass::OPEN, "/etc/resolv.conf", false);
    assert_eq!(res.path(), Some(ts.host("S/etc/resolv.conf").as_str()));
    assert!(res.readonly);
}

#[test]
fn test_rule_precedence_and_subtree() {
    // first matching rule wins; a SUBTREE's children are tried
    // depth-first, and only their matches shadow later siblings
    let ts = build_session(|b, _| {
        let child = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Path,
            "/s/special",
            ActionSpec::SetPath("/from-subtree".into()),
        ));
        let children = b.add_list(&[child]);
        let subtree = b.add_fs_rule(
            &FsRuleSpec {
                selector: Some((SelectorType::Dir, "/s".into())),
                action: Some(ActionSpec::Subtree),
                ..Default::default()
            }
            .with_rule_list(children),
        );

        let wide = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/s",
            ActionSpec::MapTo("/fallback".into()),
        ));
        let narrow_but_late = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Path,
            "/s/special",
            ActionSpec::SetPath("/never-reached".into()),
        ));
        let rules = b.add_list(&[subtree, wide, narrow_but_late]);
        b.set(&["fs_rules", "devel"], rules);
    });

    assert_eq!(map(&ts, "/s/special"), "/from-subtree");
    assert_eq!(map(&ts, "/s/other"), "/fallback/s/other");
}

#[test]
fn test_func_class_and_binary_name_filters() {
    let ts = build_session(|b, _| {
        let exec_only = b.add_fs_rule(
            &FsRuleSpec::new(
                SelectorType::Dir,
                "/f",
                ActionSpec::MapTo("/exec-view".into()),
            )
            .with_func_class(fnclass::EXEC),
        );
        let for_make = b.add_fs_rule(
            &FsRuleSpec::new(
                SelectorType::Dir,
                "/f",
                ActionSpec::MapTo("/make-view".into()),
            )
            .with_binary_name("make"),
        );
        let any = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/f",
            ActionSpec::UseOrigPath,
        ));
        let rules = b.add_list(&[exec_only, for_make, any]);
        b.set(&["fs_rules", "devel"], rules);
    });

    let exec = ts
        .session
        .map_path("sh", "execve", fnclass::EXEC, "/f/x", false);
    assert_eq!(exec.path(), Some("/exec-view/f/x"));

    let make = ts
        .session
        .map_path("make", "open", fnclass::OPEN, "/f/x", false);
    assert_eq!(make.path(), Some("/make-view/f/x"));

    let other = ts
        .session
        .map_path("sh", "open", fnclass::OPEN, "/f/x", false);
    assert_eq!(other.path(), Some("/f/x"));
}

#[test]
fn test_conditional_actions() {
    let var = "VROOT_TEST_COND_7731";
    // SAFETY: var name is unique to this test
    unsafe { std::env::remove_var(var) };

    let ts = build_session(|b, tmp| {
        let overlay = tmp.join("overlay");
        std::fs::create_dir_all(overlay.join("c")).unwrap();
        std::fs::write(overlay.join("c/present"), b"x").unwrap();

        let if_env = b
            .add_fs_rule(
                &FsRuleSpec::candidate(ActionSpec::MapTo("/env-on".into()))
                    .with_condition(ConditionType::IfEnvVarIsNotEmpty, var),
            );
        let if_exists = b.add_fs_rule(&FsRuleSpec::candidate(ActionSpec::IfExistsThenMapTo(
            overlay.to_str().unwrap().into(),
        )));
        let fallback = b.add_fs_rule(&FsRuleSpec::candidate(ActionSpec::UseOrigPath));
        let candidates = b.add_list(&[if_env, if_exists, fallback]);

        let rule = b.add_fs_rule(
            &FsRuleSpec {
                selector: Some((SelectorType::Dir, "/c".into())),
                action: Some(ActionSpec::ConditionalActions),
                ..Default::default()
            }
            .with_rule_list(candidates),
        );
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    // env unset, file exists in overlay -> overlay wins
    assert_eq!(map(&ts, "/c/present"), ts.host("overlay/c/present"));
    // env unset, file absent -> falls through to use_orig_path
    assert_eq!(map(&ts, "/c/absent"), "/c/absent");

    // SAFETY: still unique to this test
    unsafe { std::env::set_var(var, "1") };
    assert_eq!(map(&ts, "/c/present"), "/env-on/c/present");
    unsafe { std::env::remove_var(var) };
}

#[test]
fn test_symlink_loop_yields_eloop() {
    let ts = build_session(|b, tmp| {
        let root = tmp.join("loop");
        std::fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink("b", root.join("a")).unwrap();
        std::os::unix::fs::symlink("a", root.join("b")).unwrap();

        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/loop",
            ActionSpec::MapTo(root.parent().unwrap().to_str().unwrap().into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    let res = ts
        .session
        .map_path("sh", "open", fnclass::OPEN, "/loop/a/x", false);
    assert_eq!(res.errno, Some(Errno::ELOOP));
}

#[test]
fn test_dotdot_across_symlink() {
    // /top/link/../file: "link" is a symlink to a sibling directory, so
    // ".." must be resolved against the link target, not lexically
    let ts = build_session(|b, tmp| {
        let top = tmp.join("top");
        std::fs::create_dir_all(top.join("real/sub")).unwrap();
        std::fs::write(top.join("real/file"), b"x").unwrap();
        std::os::unix::fs::symlink("real/sub", top.join("link")).unwrap();

        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/top",
            ActionSpec::MapTo(top.parent().unwrap().to_str().unwrap().into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    // link -> real/sub, so link/.. is real, and real/file exists
    assert_eq!(map(&ts, "/top/link/../file"), ts.host("top/real/file"));
}

#[test]
fn test_trailing_slash_preserved() {
    let ts = build_session(|b, _| {
        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/bin",
            ActionSpec::MapTo("/tools".into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    assert_eq!(map(&ts, "/bin/dir/"), "/tools/bin/dir/");
}

#[test]
fn test_reverse_mapping_roundtrip() {
    let ts = build_session(|b, tmp| {
        let tools = tmp.join("tools/bin");
        let tools_str = tools.to_str().unwrap().to_string();
        std::fs::create_dir_all(&tools).unwrap();

        let fwd = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/bin",
            ActionSpec::ReplaceBy(tools_str.clone()),
        ));
        let fwd_rules = b.add_list(&[fwd]);
        b.set(&["fs_rules", "devel"], fwd_rules);

        let rev = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            &tools_str,
            ActionSpec::ReplaceBy("/bin".into()),
        ));
        let rev_rules = b.add_list(&[rev]);
        b.set(&["rev_rules", "devel"], rev_rules);
    });

    let host = map(&ts, "/bin/ls");
    assert_eq!(host, ts.host("tools/bin/ls"));
    let back = ts
        .session
        .reverse_map_path("sh", "getcwd", fnclass::GETCWD, &host);
    assert_eq!(back, "/bin/ls");

    // a host path without a reverse rule is returned unchanged
    let unmapped = ts
        .session
        .reverse_map_path("sh", "getcwd", fnclass::GETCWD, "/somewhere/else");
    assert_eq!(unmapped, "/somewhere/else");
}

#[test]
fn test_chroot_composition() {
    // with virtual chroot C active, map("/x") == map("C/x") without it
    let ts = build_session(|b, _| {
        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/chr/bin",
            ActionSpec::MapTo("/inside".into()),
        ));
        let any = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/",
            ActionSpec::UseOrigPath,
        ));
        let rules = b.add_list(&[rule, any]);
        b.set(&["fs_rules", "devel"], rules);
    });

    let direct = map(&ts, "/chr/bin/ls");
    ts.session.set_chroot_path(Some("/chr".to_string()));
    let chrooted = map(&ts, "/bin/ls");
    ts.session.set_chroot_path(None);

    assert_eq!(direct, chrooted);
    assert_eq!(chrooted, "/inside/chr/bin/ls");
}

#[test]
fn test_chroot_gate_validation() {
    let ts = build_session(|b, tmp| {
        std::fs::create_dir_all(tmp.join("vroot/build")).unwrap();
        std::fs::write(tmp.join("vroot/not-a-dir"), b"x").unwrap();

        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/vroot",
            ActionSpec::ReplaceBy(tmp.join("vroot").to_str().unwrap().into()),
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    // nonexistent target
    assert_eq!(
        vroot::chroot::chroot_gate(&ts.session, "chroot", "/vroot/missing"),
        Err(Errno::ENOENT)
    );
    // not a directory
    assert_eq!(
        vroot::chroot::chroot_gate(&ts.session, "chroot", "/vroot/not-a-dir"),
        Err(Errno::ENOTDIR)
    );
    assert_eq!(ts.session.chroot_path(), None);

    // a valid directory activates the simulation
    vroot::chroot::chroot_gate(&ts.session, "chroot", "/vroot/build").unwrap();
    assert_eq!(ts.session.chroot_path().as_deref(), Some("/vroot/build"));

    // chroot("/") deactivates it again (the rpm escape dance)
    vroot::chroot::chroot_gate(&ts.session, "chroot", "/").unwrap();
    assert_eq!(ts.session.chroot_path(), None);
}

#[test]
fn test_set_path_and_env_var_actions() {
    let var = "VROOT_TEST_MAPTO_9152";
    // SAFETY: var name is unique to this test
    unsafe { std::env::set_var(var, "/from-env") };

    let ts = build_session(|b, _| {
        let set = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Path,
            "/fixed",
            ActionSpec::SetPath("/elsewhere/fixed".into()),
        ));
        let env = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/e",
            ActionSpec::MapToValueOfEnvVar(var.into()),
        ));
        let rules = b.add_list(&[set, env]);
        b.set(&["fs_rules", "devel"], rules);
    });

    assert_eq!(map(&ts, "/fixed"), "/elsewhere/fixed");
    assert_eq!(map(&ts, "/e/file"), "/from-env/e/file");
}

#[test]
fn test_force_orig_path_stops_resolution() {
    let ts = build_session(|b, tmp| {
        let root = tmp.join("forced");
        std::fs::create_dir_all(&root).unwrap();
        // a symlink that would redirect if it were followed
        std::os::unix::fs::symlink("/somewhere/else", root.join("link")).unwrap();

        let rule = b.add_fs_rule(&FsRuleSpec::new(
            SelectorType::Dir,
            "/forced",
            ActionSpec::ForceOrigPath,
        ));
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    // the path is neither mapped nor resolved
    assert_eq!(map(&ts, "/forced/link/x"), "/forced/link/x");
}

#[test]
fn test_procfs_exe_replacement() {
    // /proc/self/exe must reflect the logical executable, not whatever
    // ld.so or the emulator the process was really started through
    let ts = build_session_with(
        |b, _| {
            let rule = b.add_fs_rule(&FsRuleSpec::new(
                SelectorType::Dir,
                "/proc",
                ActionSpec::Procfs,
            ));
            let rules = b.add_list(&[rule]);
            b.set(&["fs_rules", "devel"], rules);
        },
        |config| config.with_orig_binary_name("/usr/bin/logical"),
    );

    // readlink-style access: the staged link itself is the result
    let res = ts
        .session
        .map_path("sh", "readlink", fnclass::STAT, "/proc/self/exe", true);
    let staged = res.path().unwrap();
    assert!(staged.starts_with(ts.session.config().session_dir.to_str().unwrap()));
    assert_eq!(
        std::fs::read_link(staged).unwrap().to_str(),
        Some("/usr/bin/logical")
    );

    // everything else under /proc passes through untouched
    let res = ts
        .session
        .map_path("sh", "open", fnclass::OPEN, "/proc/version", false);
    assert_eq!(res.path(), Some("/proc/version"));
}

#[test]
fn test_union_dir_action() {
    let ts = build_session(|b, tmp| {
        let a = tmp.join("part-a");
        let c = tmp.join("part-b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&c).unwrap();
        std::fs::write(a.join("one"), b"").unwrap();
        std::fs::write(c.join("two"), b"").unwrap();

        let sources =
            b.add_string_list(&[a.to_str().unwrap(), c.to_str().unwrap()]);
        let rule = b.add_fs_rule(
            &FsRuleSpec {
                selector: Some((SelectorType::Path, "/union/bin".into())),
                action: Some(ActionSpec::UnionDir),
                ..Default::default()
            }
            .with_rule_list(sources),
        );
        let rules = b.add_list(&[rule]);
        b.set(&["fs_rules", "devel"], rules);
    });

    let mapped = map(&ts, "/union/bin");
    let mut names: Vec<String> = std::fs::read_dir(&mapped)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["one", "two"]);
}
