//! Network rule engine.
//!
//! Gates for connect/bind/sendto hand the destination address here
//! before issuing the real call. Rules live under
//! `net_rules/<SBOX_NETWORK_MODE>`: an ordered list filtered by port,
//! function name, binary name and address pattern, with nested lists
//! (RULES) for grouping. A matching ALLOW may rewrite address/port; a
//! matching DENY fails the call with the rule's errno (default EPERM).
//!
//! Address patterns: exact string, `a.b.c.d/bits` (IPv4 subnet),
//! `prefix/bits` (IPv6 prefix), and the literal names `INADDR_ANY` /
//! `IN6ADDR_ANY`, which match only the wildcard address itself.

use std::net::{Ipv4Addr, Ipv6Addr};

use nix::errno::Errno;
use vroot_shared::LogLevel;

use crate::logging;
use crate::ruletree::ObjRef;
use crate::ruletree::net::{NetRuleRec, NetRuleType};
use crate::session::Session;

/// Address family tag as passed by the gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Ipv4,
    Ipv6,
}

/// Outcome of a successful mapping: possibly rewritten address/port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAddr {
    pub address: String,
    pub port: u16,
}

fn ipv4_matches(address: &str, pattern: &str) -> bool {
    if address == pattern {
        return true;
    }
    let Ok(addr) = address.parse::<Ipv4Addr>() else {
        return false;
    };

    if pattern == "INADDR_ANY" {
        // matches only if the address *is* the wildcard, exactly
        return addr == Ipv4Addr::UNSPECIFIED;
    }

    let Some((net, bits)) = pattern.split_once('/') else {
        return false;
    };
    let (Ok(net), Ok(bits)) = (net.parse::<Ipv4Addr>(), bits.parse::<u32>()) else {
        return false;
    };
    if bits == 0 || bits > 32 {
        tracing::error!("incorrect number of bits in IPv4 subnet mask ({bits})");
        return false;
    }
    let mask = u32::MAX << (32 - bits);
    u32::from(addr) & mask == u32::from(net)
}

fn ipv6_matches(address: &str, pattern: &str) -> bool {
    if address == pattern {
        return true;
    }
    let Ok(addr) = address.parse::<Ipv6Addr>() else {
        return false;
    };

    if pattern == "IN6ADDR_ANY" {
        return addr == Ipv6Addr::UNSPECIFIED;
    }

    let Some((net, bits)) = pattern.split_once('/') else {
        return false;
    };
    let (Ok(net), Ok(bits)) = (net.parse::<Ipv6Addr>(), bits.parse::<u32>()) else {
        return false;
    };
    if bits == 0 || bits > 128 {
        tracing::error!("incorrect number of bits in IPv6 prefix ({bits})");
        return false;
    }
    let mask = if bits == 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - bits)
    };
    u128::from(addr) & mask == u128::from(net)
}

fn addr_matches(addr_type: AddrType, address: &str, pattern: &str) -> bool {
    match addr_type {
        AddrType::Ipv4 => ipv4_matches(address, pattern),
        AddrType::Ipv6 => ipv6_matches(address, pattern),
    }
}

fn find_net_rule(
    session: &Session,
    rule_list: ObjRef,
    func_name: &str,
    binary_name: &str,
    addr_type: AddrType,
    address: &str,
    port: u16,
) -> Option<NetRuleRec> {
    let tree = session.ruletree();
    for rule_offs in tree.list_items(rule_list) {
        let Some(rule) = tree.net_rule_at(rule_offs) else {
            continue;
        };

        if rule.port != 0 && rule.port != port as u32 {
            continue;
        }
        if rule.func_name.is_some()
            && tree.string_at(rule.func_name).as_deref() != Some(func_name)
        {
            continue;
        }
        if rule.binary_name.is_some()
            && tree.string_at(rule.binary_name).as_deref() != Some(binary_name)
        {
            continue;
        }
        if rule.address.is_some() {
            let Some(pattern) = tree.string_at(rule.address) else {
                continue;
            };
            if !addr_matches(addr_type, address, &pattern) {
                continue;
            }
        }

        if rule.rules.is_some() {
            return find_net_rule(
                session, rule.rules, func_name, binary_name, addr_type, address, port,
            );
        }
        return Some(rule);
    }
    None
}

/// Map (and police) one destination address. `Ok` carries the possibly
/// rewritten address/port for the real call; `Err` carries the errno
/// the caller must fail with.
pub fn map_network_addr(
    session: &Session,
    binary_name: &str,
    func_name: &str,
    addr_type: AddrType,
    orig_address: &str,
    orig_port: u16,
) -> Result<MappedAddr, Errno> {
    let Some(net_mode) = session.config().network_mode.as_deref() else {
        // no network mode configured: everything is allowed untouched
        return Ok(MappedAddr {
            address: orig_address.to_string(),
            port: orig_port,
        });
    };
    let rule_list = session.ruletree().lookup(&["net_rules", net_mode]);
    if rule_list.is_none() {
        tracing::error!("no network rules for mode '{net_mode}'");
        return Err(Errno::EPERM);
    }

    let Some(rule) = find_net_rule(
        session,
        rule_list,
        func_name,
        binary_name,
        addr_type,
        orig_address,
        orig_port,
    ) else {
        logging::log_at(
            LogLevel::Network,
            &format!("{func_name}: no net rule for {orig_address}:{orig_port}, denied"),
        );
        return Err(Errno::EPERM);
    };

    if let (Some(level), Some(msg)) = (
        rule.log_level(),
        session.ruletree().string_at(rule.log_msg),
    ) {
        logging::log_at(level, &msg);
    }

    match rule.ruletype() {
        Some(NetRuleType::Allow) => {
            let address = session
                .ruletree()
                .string_at(rule.new_address)
                .unwrap_or_else(|| orig_address.to_string());
            let port = if rule.new_port != 0 {
                rule.new_port as u16
            } else {
                orig_port
            };
            logging::log_at(
                LogLevel::Network,
                &format!("{func_name}: allowed {orig_address}:{orig_port} -> {address}:{port}"),
            );
            Ok(MappedAddr { address, port })
        }
        Some(NetRuleType::Deny) => {
            let errno = if rule.errno != 0 {
                Errno::from_raw(rule.errno as i32)
            } else {
                Errno::EPERM
            };
            logging::log_at(
                LogLevel::Network,
                &format!("{func_name}: denied {orig_address}:{orig_port} ({errno})"),
            );
            Err(errno)
        }
        _ => {
            tracing::error!("net rule with invalid type {}", rule.ruletype);
            Err(Errno::EPERM)
        }
    }
}
