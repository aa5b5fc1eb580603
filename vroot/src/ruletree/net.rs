//! Network rule records.

use vroot_shared::LogLevel;

use super::{ObjRef, RuleTree, kind};

/// Rule type of a net rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NetRuleType {
    Allow = 1,
    Deny = 2,
    /// Match delegates to a nested rule list.
    Rules = 3,
}

impl NetRuleType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Allow),
            2 => Some(Self::Deny),
            3 => Some(Self::Rules),
            _ => None,
        }
    }
}

/// Decoded net rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetRuleRec {
    pub ruletype: u32,
    pub func_name: ObjRef,
    pub binary_name: ObjRef,
    pub address: ObjRef,
    /// 0 = any port.
    pub port: u32,
    pub new_address: ObjRef,
    /// 0 = keep port.
    pub new_port: u32,
    /// errno for DENY; 0 = default (EPERM).
    pub errno: u32,
    pub rules: ObjRef,
    /// 0 = no extra logging.
    pub log_level: u32,
    pub log_msg: ObjRef,
}

impl NetRuleRec {
    pub fn ruletype(&self) -> Option<NetRuleType> {
        NetRuleType::from_u32(self.ruletype)
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        match self.log_level {
            1 => Some(LogLevel::Error),
            2 => Some(LogLevel::Warning),
            3 => Some(LogLevel::Network),
            4 => Some(LogLevel::Notice),
            5 => Some(LogLevel::Info),
            8 => Some(LogLevel::Debug),
            9 => Some(LogLevel::Noise),
            10 => Some(LogLevel::Noise2),
            11 => Some(LogLevel::Noise3),
            _ => None,
        }
    }
}

/// Builder-side spec for one net rule.
#[derive(Debug, Clone)]
pub struct NetRuleSpec {
    pub ruletype: NetRuleType,
    pub func_name: Option<String>,
    pub binary_name: Option<String>,
    pub address: Option<String>,
    pub port: u32,
    pub new_address: Option<String>,
    pub new_port: u32,
    pub errno: u32,
    pub rules: ObjRef,
    pub log_level: Option<LogLevel>,
    pub log_msg: Option<String>,
}

impl NetRuleSpec {
    pub fn allow() -> Self {
        Self::of_type(NetRuleType::Allow)
    }

    pub fn deny() -> Self {
        Self::of_type(NetRuleType::Deny)
    }

    pub fn nested(rules: ObjRef) -> Self {
        let mut s = Self::of_type(NetRuleType::Rules);
        s.rules = rules;
        s
    }

    fn of_type(ruletype: NetRuleType) -> Self {
        Self {
            ruletype,
            func_name: None,
            binary_name: None,
            address: None,
            port: 0,
            new_address: None,
            new_port: 0,
            errno: 0,
            rules: ObjRef::NONE,
            log_level: None,
            log_msg: None,
        }
    }

    pub fn with_address(mut self, pattern: &str) -> Self {
        self.address = Some(pattern.to_string());
        self
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn with_errno(mut self, errno: u32) -> Self {
        self.errno = errno;
        self
    }

    pub fn with_new_address(mut self, addr: &str) -> Self {
        self.new_address = Some(addr.to_string());
        self
    }

    pub fn with_new_port(mut self, port: u32) -> Self {
        self.new_port = port;
        self
    }

    pub fn with_func_name(mut self, name: &str) -> Self {
        self.func_name = Some(name.to_string());
        self
    }

    pub fn with_binary_name(mut self, name: &str) -> Self {
        self.binary_name = Some(name.to_string());
        self
    }
}

impl RuleTree {
    pub fn net_rule_at(&self, r: ObjRef) -> Option<NetRuleRec> {
        let f = self.fields(r, kind::NET_RULE, 11)?;
        Some(NetRuleRec {
            ruletype: f[0],
            func_name: ObjRef(f[1]),
            binary_name: ObjRef(f[2]),
            address: ObjRef(f[3]),
            port: f[4],
            new_address: ObjRef(f[5]),
            new_port: f[6],
            errno: f[7],
            rules: ObjRef(f[8]),
            log_level: f[9],
            log_msg: ObjRef(f[10]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruletree::RuleTreeBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_net_rule_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rt.bin");

        let mut b = RuleTreeBuilder::new();
        let rule = b.add_net_rule(
            &NetRuleSpec::deny()
                .with_address("127.0.0.0/8")
                .with_port(80)
                .with_errno(libc::ENETUNREACH as u32),
        );
        let rules = b.add_list(&[rule]);
        b.set(&["net_rules", "offline"], rules);
        b.write_to(&path).unwrap();

        let t = crate::ruletree::RuleTree::open(&path).unwrap();
        let rules = t.lookup(&["net_rules", "offline"]);
        let rec = t.net_rule_at(t.list_item(rules, 0)).unwrap();
        assert_eq!(rec.ruletype(), Some(NetRuleType::Deny));
        assert_eq!(t.string_at(rec.address).as_deref(), Some("127.0.0.0/8"));
        assert_eq!(rec.port, 80);
        assert_eq!(rec.errno, libc::ENETUNREACH as u32);
        assert!(rec.rules.is_none());
    }
}
