//! Append-side of the rule tree format.
//!
//! The session daemon uses this to compile its rule language into the
//! binary tree; the engine's tests use it to lay out scratch sessions.
//! Records are appended immediately (their offsets are final); catalogs
//! are kept in memory and written depth-first by [`finish`], children
//! before parents, with the root catalog last.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;

use super::exec::ExecPreprocessingSpec;
use super::fsrule::{ActionSpec, ConditionType, SelectorType};
use super::net::NetRuleSpec;
use super::{HEADER_SIZE, INODESTAT_BUCKETS, MAGIC, ObjRef, VERSION, kind};

#[derive(Default)]
enum CatEntry {
    #[default]
    Empty,
    Leaf(ObjRef),
    Nested(CatalogNode),
}

type CatalogNode = BTreeMap<String, CatEntry>;

/// Specification of one fs-rule, consumed by
/// [`RuleTreeBuilder::add_fs_rule`].
#[derive(Debug, Default, Clone)]
pub struct FsRuleSpec {
    pub name: Option<String>,
    pub selector: Option<(SelectorType, String)>,
    pub action: Option<ActionSpec>,
    pub condition: Option<(ConditionType, String)>,
    /// Nested list: subtree rules, conditional candidates, union-dir
    /// sources, or an `if_exists_in` "then" branch.
    pub rule_list_link: ObjRef,
    pub flags: u32,
    pub binary_name: Option<String>,
    pub func_class: u32,
    pub exec_policy_name: Option<String>,
}

impl FsRuleSpec {
    pub fn new(selector_type: SelectorType, selector: &str, action: ActionSpec) -> Self {
        Self {
            selector: Some((selector_type, selector.to_string())),
            action: Some(action),
            ..Self::default()
        }
    }

    /// A candidate rule inside a conditional-actions list: action only,
    /// optionally guarded by a condition.
    pub fn candidate(action: ActionSpec) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn with_condition(mut self, ty: ConditionType, arg: &str) -> Self {
        self.condition = Some((ty, arg.to_string()));
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_binary_name(mut self, name: &str) -> Self {
        self.binary_name = Some(name.to_string());
        self
    }

    pub fn with_func_class(mut self, class: u32) -> Self {
        self.func_class = class;
        self
    }

    pub fn with_exec_policy(mut self, name: &str) -> Self {
        self.exec_policy_name = Some(name.to_string());
        self
    }

    pub fn with_rule_list(mut self, link: ObjRef) -> Self {
        self.rule_list_link = link;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Builds a rule tree file in memory.
pub struct RuleTreeBuilder {
    buf: Vec<u8>,
    interned: HashMap<String, ObjRef>,
    root: CatalogNode,
}

impl Default for RuleTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTreeBuilder {
    pub fn new() -> Self {
        let mut b = Self {
            buf: vec![0u8; HEADER_SIZE],
            interned: HashMap::new(),
            root: CatalogNode::new(),
        };
        // The inode-stat bucket table goes right after the header so the
        // daemon finds it at a stable place; chain heads start at none.
        let buckets = vec![ObjRef::NONE; INODESTAT_BUCKETS as usize];
        let tbl = b.add_list(&buckets);
        b.patch_u32(12, tbl.0);
        b
    }

    fn here(&self) -> ObjRef {
        ObjRef(self.buf.len() as u32)
    }

    fn push_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn patch_u32(&mut self, off: usize, v: u32) {
        self.buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Append a string record; identical strings are interned.
    pub fn add_string(&mut self, s: &str) -> ObjRef {
        if let Some(&r) = self.interned.get(s) {
            return r;
        }
        let r = self.here();
        self.buf.push(kind::STRING);
        self.push_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self.interned.insert(s.to_string(), r);
        r
    }

    fn add_opt_string(&mut self, s: Option<&str>) -> ObjRef {
        match s {
            Some(s) => self.add_string(s),
            None => ObjRef::NONE,
        }
    }

    pub fn add_list(&mut self, items: &[ObjRef]) -> ObjRef {
        let r = self.here();
        self.buf.push(kind::OBJECT_LIST);
        self.push_u32(items.len() as u32);
        for item in items {
            self.push_u32(item.0);
        }
        r
    }

    pub fn add_string_list(&mut self, items: &[&str]) -> ObjRef {
        let refs: Vec<ObjRef> = items.iter().map(|s| self.add_string(s)).collect();
        self.add_list(&refs)
    }

    pub fn add_u32(&mut self, v: u32) -> ObjRef {
        let r = self.here();
        self.buf.push(kind::UINT32);
        self.push_u32(v);
        r
    }

    pub fn add_bool(&mut self, v: bool) -> ObjRef {
        let r = self.here();
        self.buf.push(kind::BOOLEAN);
        self.push_u32(v as u32);
        r
    }

    pub fn add_fs_rule(&mut self, spec: &FsRuleSpec) -> ObjRef {
        let name = self.add_opt_string(spec.name.as_deref());
        let (sel_type, sel) = match &spec.selector {
            Some((t, s)) => (*t as u32, self.add_string(s)),
            None => (0, ObjRef::NONE),
        };
        let (action_type, action) = match &spec.action {
            Some(a) => {
                let (t, arg) = a.encode();
                (t, self.add_opt_string(arg))
            }
            None => (0, ObjRef::NONE),
        };
        let (cond_type, cond) = match &spec.condition {
            Some((t, s)) => (*t as u32, self.add_string(s)),
            None => (0, ObjRef::NONE),
        };
        let binary_name = self.add_opt_string(spec.binary_name.as_deref());
        let exec_policy_name = self.add_opt_string(spec.exec_policy_name.as_deref());

        let r = self.here();
        self.buf.push(kind::FS_RULE);
        for v in [
            name.0,
            sel_type,
            sel.0,
            action_type,
            action.0,
            cond_type,
            cond.0,
            spec.rule_list_link.0,
            spec.flags,
            binary_name.0,
            spec.func_class,
            exec_policy_name.0,
        ] {
            self.push_u32(v);
        }
        r
    }

    pub fn add_exec_selection_rule(
        &mut self,
        selector_type: SelectorType,
        selector: &str,
        policy_name: &str,
    ) -> ObjRef {
        let sel = self.add_string(selector);
        let policy = self.add_string(policy_name);
        let r = self.here();
        self.buf.push(kind::EXEC_SELECTION_RULE);
        for v in [selector_type as u32, 0, sel.0, policy.0] {
            self.push_u32(v);
        }
        r
    }

    pub fn add_exec_preprocessing_rule(&mut self, spec: &ExecPreprocessingSpec) -> ObjRef {
        let binary_name = self.add_string(&spec.binary_name);
        let prefix_strs: Vec<&str> = spec.path_prefixes.iter().map(String::as_str).collect();
        let path_prefixes = if prefix_strs.is_empty() {
            ObjRef::NONE
        } else {
            self.add_string_list(&prefix_strs)
        };
        let mut lists = [ObjRef::NONE; 4];
        for (slot, items) in lists.iter_mut().zip([
            &spec.add_head,
            &spec.add_options,
            &spec.add_tail,
            &spec.remove,
        ]) {
            if !items.is_empty() {
                let strs: Vec<&str> = items.iter().map(String::as_str).collect();
                *slot = self.add_string_list(&strs);
            }
        }
        let new_filename = self.add_opt_string(spec.new_filename.as_deref());

        let r = self.here();
        self.buf.push(kind::EXEC_PREPROCESSING_RULE);
        for v in [
            binary_name.0,
            path_prefixes.0,
            lists[0].0,
            lists[1].0,
            lists[2].0,
            lists[3].0,
            new_filename.0,
            spec.disable_mapping as u32,
        ] {
            self.push_u32(v);
        }
        r
    }

    pub fn add_net_rule(&mut self, spec: &NetRuleSpec) -> ObjRef {
        let func_name = self.add_opt_string(spec.func_name.as_deref());
        let binary_name = self.add_opt_string(spec.binary_name.as_deref());
        let address = self.add_opt_string(spec.address.as_deref());
        let new_address = self.add_opt_string(spec.new_address.as_deref());
        let log_msg = self.add_opt_string(spec.log_msg.as_deref());

        let r = self.here();
        self.buf.push(kind::NET_RULE);
        for v in [
            spec.ruletype as u32,
            func_name.0,
            binary_name.0,
            address.0,
            spec.port,
            new_address.0,
            spec.new_port,
            spec.errno,
            spec.rules.0,
            spec.log_level.map(|l| l as u32).unwrap_or(0),
            log_msg.0,
        ] {
            self.push_u32(v);
        }
        r
    }

    /// Append one inode-stat record with all fields zeroed except the key;
    /// the daemon fills fields in place later. Returns its offset without
    /// linking it anywhere (linking is [`inodestat`](super::inodestat)'s
    /// job, since it happens on the written file).
    pub fn add_raw_inodestat(&mut self, dev: u64, ino: u64) -> ObjRef {
        let r = self.here();
        self.buf.push(kind::INODE_STAT);
        self.push_u64(dev);
        self.push_u64(ino);
        for _ in 0..6 {
            self.push_u32(0);
        }
        self.push_u64(0);
        self.push_u32(0);
        r
    }

    /// Insert `value` into the root catalog under a key path, creating
    /// intermediate catalogs: `set(&["fs_rules", "devel"], rules)`.
    ///
    /// All mode-keyed catalogs (`fs_rules`, `rev_rules`, `exec_policy`,
    /// `exec_policy_selection`, `net_rules`) share one namespace of mode
    /// names, so the same `mode` string is used for each.
    pub fn set(&mut self, keys: &[&str], value: ObjRef) {
        assert!(!keys.is_empty(), "empty catalog path");
        let mut node = &mut self.root;
        for key in &keys[..keys.len() - 1] {
            let entry = node.entry(key.to_string()).or_insert(CatEntry::Empty);
            if !matches!(entry, CatEntry::Nested(_)) {
                *entry = CatEntry::Nested(CatalogNode::new());
            }
            let CatEntry::Nested(next) = entry else {
                unreachable!()
            };
            node = next;
        }
        node.insert(keys[keys.len() - 1].to_string(), CatEntry::Leaf(value));
    }

    fn write_catalog(&mut self, node: CatalogNode) -> ObjRef {
        let mut entries: Vec<(ObjRef, ObjRef)> = Vec::with_capacity(node.len());
        for (key, entry) in node {
            let key_ref = self.add_string(&key);
            let val = match entry {
                CatEntry::Empty => ObjRef::NONE,
                CatEntry::Leaf(r) => r,
                CatEntry::Nested(sub) => self.write_catalog(sub),
            };
            entries.push((key_ref, val));
        }
        let r = self.here();
        self.buf.push(kind::CATALOG);
        self.push_u32(entries.len() as u32);
        for (k, v) in entries {
            self.push_u32(k.0);
            self.push_u32(v.0);
        }
        r
    }

    /// Write all pending catalogs, patch the header and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let root = std::mem::take(&mut self.root);
        let root_ref = self.write_catalog(root);
        self.patch_u32(0, MAGIC);
        self.patch_u32(4, VERSION);
        self.patch_u32(8, root_ref.0);
        let size = self.buf.len() as u32;
        self.patch_u32(16, size);
        self.buf
    }

    /// [`finish`](Self::finish) and write the file.
    pub fn write_to(self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.finish())
    }
}
