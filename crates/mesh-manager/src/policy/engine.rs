//! ACL evaluation
//!
//! ACLs are evaluated first-match over a priority-sorted list. Group
//! references in node selectors are expanded to concrete member ids before
//! evaluation; the expansion is computed once per filter pass.

use crate::models::{AclAction, Group, MeshNode, NetworkAcl, NetworkAction, GROUP_REFERENCE, WILDCARD};
use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};

/// A priority-sorted ACL list ready for evaluation.
#[derive(Debug, Clone)]
pub struct AclList {
    acls: Vec<NetworkAcl>,
}

impl AclList {
    /// Sort ACLs by ascending priority, ties broken by name.
    pub fn new(mut acls: Vec<NetworkAcl>) -> Self {
        acls.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Self { acls }
    }

    /// Whether the list holds no ACLs.
    pub fn is_empty(&self) -> bool {
        self.acls.is_empty()
    }

    /// Replace `group:` references in node selectors with concrete member
    /// ids. Missing groups and reference cycles are errors.
    pub fn expand(&mut self, groups: &BTreeMap<String, Group>) -> Result<()> {
        for acl in &mut self.acls {
            acl.source_nodes = expand_selectors(&acl.source_nodes, groups)?;
            acl.destination_nodes = expand_selectors(&acl.destination_nodes, groups)?;
        }
        Ok(())
    }

    /// Evaluate a concrete traffic tuple. The first ACL whose selectors all
    /// match decides; no match means deny.
    pub fn accept(&self, action: &NetworkAction) -> bool {
        for acl in &self.acls {
            if acl_matches(acl, action) {
                return acl.action == AclAction::Accept;
            }
        }
        false
    }

    /// Whether two nodes may communicate at all: both directions must be
    /// accepted.
    pub fn allow_nodes_to_communicate(&self, a: &MeshNode, b: &MeshNode) -> bool {
        self.accept(&direct_action(a, b)) && self.accept(&direct_action(b, a))
    }
}

/// The traffic tuple for plain node-to-node reachability.
fn direct_action(src: &MeshNode, dst: &MeshNode) -> NetworkAction {
    NetworkAction {
        src_node: src.id.clone(),
        src_cidr: primary_prefix(src),
        dst_node: dst.id.clone(),
        dst_cidr: primary_prefix(dst),
        protocol: None,
        port: None,
    }
}

fn primary_prefix(node: &MeshNode) -> Option<IpNet> {
    node.private_ipv4
        .map(IpNet::V4)
        .or(node.private_ipv6.map(IpNet::V6))
}

fn acl_matches(acl: &NetworkAcl, action: &NetworkAction) -> bool {
    node_selector_matches(&acl.source_nodes, &action.src_node)
        && node_selector_matches(&acl.destination_nodes, &action.dst_node)
        && cidr_selector_matches(&acl.source_cidrs, action.src_cidr)
        && cidr_selector_matches(&acl.destination_cidrs, action.dst_cidr)
        && value_selector_matches(&acl.protocols, action.protocol.as_deref())
        && port_selector_matches(&acl.ports, action.port)
}

fn node_selector_matches(selector: &[String], id: &str) -> bool {
    selector.is_empty() || selector.iter().any(|s| s == WILDCARD || s == id)
}

/// A CIDR selector matches when it is a wildcard or one of its prefixes
/// contains the action prefix. A constrained selector never matches an
/// action without a prefix.
fn cidr_selector_matches(selector: &[String], prefix: Option<IpNet>) -> bool {
    if selector.is_empty() {
        return true;
    }
    if selector.iter().any(|s| s == WILDCARD) {
        return true;
    }
    let Some(prefix) = prefix else {
        return false;
    };
    selector
        .iter()
        .filter_map(|s| s.parse::<IpNet>().ok())
        .any(|sel| sel.contains(&prefix))
}

fn value_selector_matches(selector: &[String], value: Option<&str>) -> bool {
    if selector.is_empty() || selector.iter().any(|s| s == WILDCARD) {
        return true;
    }
    match value {
        Some(value) => selector.iter().any(|s| s.eq_ignore_ascii_case(value)),
        None => false,
    }
}

fn port_selector_matches(selector: &[u16], port: Option<u16>) -> bool {
    if selector.is_empty() {
        return true;
    }
    match port {
        Some(port) => selector.contains(&port),
        None => false,
    }
}

fn expand_selectors(
    selector: &[String],
    groups: &BTreeMap<String, Group>,
) -> Result<Vec<String>> {
    let mut expanded = Vec::new();
    for entry in selector {
        match entry.strip_prefix(GROUP_REFERENCE) {
            Some(group_name) => {
                let mut members = BTreeSet::new();
                let mut stack = Vec::new();
                resolve_group(group_name, groups, &mut stack, &mut members)?;
                expanded.extend(members);
            }
            None => expanded.push(entry.clone()),
        }
    }
    Ok(expanded)
}

fn resolve_group(
    name: &str,
    groups: &BTreeMap<String, Group>,
    stack: &mut Vec<String>,
    out: &mut BTreeSet<String>,
) -> Result<()> {
    if stack.iter().any(|n| n == name) {
        return Err(Error::InvalidAcl(format!("cyclic group reference: {}", name)));
    }
    let group = groups
        .get(name)
        .ok_or_else(|| Error::GroupNotFound(name.to_string()))?;
    stack.push(name.to_string());
    for member in &group.nodes {
        match member.strip_prefix(GROUP_REFERENCE) {
            Some(nested) => resolve_group(nested, groups, stack, out)?,
            None => {
                out.insert(member.clone());
            }
        }
    }
    stack.pop();
    Ok(())
}

/// Validate an ACL before it is persisted. Malformed ACLs are rejected at
/// write time and never skipped during evaluation.
pub fn validate_acl(acl: &NetworkAcl, groups: &BTreeMap<String, Group>) -> Result<()> {
    if acl.name.is_empty() {
        return Err(Error::InvalidAcl("name required".to_string()));
    }
    for selector in acl.source_cidrs.iter().chain(&acl.destination_cidrs) {
        if selector != WILDCARD && selector.parse::<IpNet>().is_err() {
            return Err(Error::InvalidAcl(format!("unparseable CIDR: {}", selector)));
        }
    }
    if acl.ports.contains(&0) {
        return Err(Error::InvalidAcl("port 0 is not a valid selector".to_string()));
    }
    for entry in acl.source_nodes.iter().chain(&acl.destination_nodes) {
        if let Some(group_name) = entry.strip_prefix(GROUP_REFERENCE) {
            let mut stack = Vec::new();
            let mut members = BTreeSet::new();
            resolve_group(group_name, groups, &mut stack, &mut members)
                .map_err(|e| Error::InvalidAcl(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ipnet::Ipv4Net;
    use std::str::FromStr;

    fn node(id: &str, ipv4: &str) -> MeshNode {
        MeshNode {
            id: id.to_string(),
            public_key: format!("{}-key", id),
            endpoint: None,
            private_ipv4: Some(Ipv4Net::from_str(ipv4).unwrap()),
            private_ipv6: None,
            raft_port: 9443,
            grpc_port: 8443,
            wireguard_port: 51820,
            zones: Vec::new(),
            allowed_ips: Vec::new(),
            asn: 0,
            admitted_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn allow_all() -> NetworkAcl {
        NetworkAcl::new("allow-all", 100, AclAction::Accept)
    }

    #[test]
    fn test_default_deny() {
        let acls = AclList::new(Vec::new());
        let a = node("a", "10.0.0.1/32");
        let b = node("b", "10.0.0.2/32");
        assert!(!acls.allow_nodes_to_communicate(&a, &b));
    }

    #[test]
    fn test_allow_all() {
        let acls = AclList::new(vec![allow_all()]);
        let a = node("a", "10.0.0.1/32");
        let b = node("b", "10.0.0.2/32");
        assert!(acls.allow_nodes_to_communicate(&a, &b));
    }

    #[test]
    fn test_priority_order_first_match_wins() {
        let deny = NetworkAcl::new("deny-b", 0, AclAction::Deny)
            .with_destination_nodes(vec!["b".to_string()]);
        let acls = AclList::new(vec![allow_all(), deny]);

        let a = node("a", "10.0.0.1/32");
        let b = node("b", "10.0.0.2/32");
        let c = node("c", "10.0.0.3/32");

        assert!(!acls.allow_nodes_to_communicate(&a, &b));
        assert!(acls.allow_nodes_to_communicate(&a, &c));
    }

    #[test]
    fn test_priority_tie_broken_by_name() {
        // Same priority: "a-deny" sorts before "b-allow" and wins.
        let deny = NetworkAcl::new("a-deny", 0, AclAction::Deny);
        let allow = NetworkAcl::new("b-allow", 0, AclAction::Accept);
        let acls = AclList::new(vec![allow, deny]);

        let a = node("a", "10.0.0.1/32");
        let b = node("b", "10.0.0.2/32");
        assert!(!acls.allow_nodes_to_communicate(&a, &b));
    }

    #[test]
    fn test_symmetric_evaluation() {
        // Accepting a->b is not enough; b->a must also be accepted.
        let one_way = NetworkAcl::new("one-way", 0, AclAction::Accept)
            .with_source_nodes(vec!["a".to_string()])
            .with_destination_nodes(vec!["b".to_string()]);
        let acls = AclList::new(vec![one_way]);

        let a = node("a", "10.0.0.1/32");
        let b = node("b", "10.0.0.2/32");
        assert!(!acls.allow_nodes_to_communicate(&a, &b));
    }

    #[test]
    fn test_cidr_containment() {
        let deny_lan = NetworkAcl::new("deny-lan", 0, AclAction::Deny)
            .with_destination_cidrs(vec!["192.168.0.0/16".to_string()]);
        let acls = AclList::new(vec![deny_lan, allow_all()]);

        let inside = NetworkAction {
            src_node: "a".to_string(),
            src_cidr: Some(IpNet::from_str("10.0.0.1/32").unwrap()),
            dst_node: "d".to_string(),
            dst_cidr: Some(IpNet::from_str("192.168.10.0/24").unwrap()),
            ..Default::default()
        };
        assert!(!acls.accept(&inside));

        let outside = NetworkAction {
            dst_cidr: Some(IpNet::from_str("172.16.0.0/24").unwrap()),
            ..inside.clone()
        };
        assert!(acls.accept(&outside));
    }

    #[test]
    fn test_constrained_cidr_does_not_match_unknown() {
        let allow_lan_only = NetworkAcl::new("allow-lan", 0, AclAction::Accept)
            .with_destination_cidrs(vec!["192.168.0.0/16".to_string()]);
        let acls = AclList::new(vec![allow_lan_only]);

        let action = NetworkAction {
            src_node: "a".to_string(),
            dst_node: "b".to_string(),
            ..Default::default()
        };
        assert!(!acls.accept(&action));
    }

    #[test]
    fn test_protocol_and_port_selectors() {
        let acl = NetworkAcl {
            protocols: vec!["tcp".to_string()],
            ports: vec![443],
            ..NetworkAcl::new("https-only", 0, AclAction::Accept)
        };
        let acls = AclList::new(vec![acl]);

        let https = NetworkAction {
            src_node: "a".to_string(),
            dst_node: "b".to_string(),
            protocol: Some("TCP".to_string()),
            port: Some(443),
            ..Default::default()
        };
        assert!(acls.accept(&https));

        let ssh = NetworkAction {
            port: Some(22),
            ..https.clone()
        };
        assert!(!acls.accept(&ssh));
    }

    #[test]
    fn test_group_expansion() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "storage".to_string(),
            Group {
                name: "storage".to_string(),
                nodes: vec!["b".to_string(), "c".to_string()],
            },
        );

        let acl = NetworkAcl::new("allow-storage", 0, AclAction::Accept)
            .with_source_nodes(vec![WILDCARD.to_string()])
            .with_destination_nodes(vec!["group:storage".to_string()]);
        let mut acls = AclList::new(vec![acl]);
        acls.expand(&groups).unwrap();

        let a = node("a", "10.0.0.1/32");
        let b = node("b", "10.0.0.2/32");
        let d = node("d", "10.0.0.4/32");
        // The reverse direction matches the wildcard source, group dest "a"
        // fails; so only pairs where both directions resolve pass.
        assert!(!acls.allow_nodes_to_communicate(&a, &d));
        assert!(acls.accept(&direct_action(&a, &b)));
    }

    #[test]
    fn test_nested_group_expansion() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "outer".to_string(),
            Group {
                name: "outer".to_string(),
                nodes: vec!["group:inner".to_string(), "x".to_string()],
            },
        );
        groups.insert(
            "inner".to_string(),
            Group {
                name: "inner".to_string(),
                nodes: vec!["y".to_string()],
            },
        );

        let expanded =
            expand_selectors(&["group:outer".to_string()], &groups).unwrap();
        assert_eq!(expanded, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_cyclic_group_rejected() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "a".to_string(),
            Group {
                name: "a".to_string(),
                nodes: vec!["group:b".to_string()],
            },
        );
        groups.insert(
            "b".to_string(),
            Group {
                name: "b".to_string(),
                nodes: vec!["group:a".to_string()],
            },
        );

        let result = expand_selectors(&["group:a".to_string()], &groups);
        assert!(matches!(result, Err(Error::InvalidAcl(_))));
    }

    #[test]
    fn test_validate_acl() {
        let groups = BTreeMap::new();

        let bad_cidr = NetworkAcl::new("bad", 0, AclAction::Accept)
            .with_destination_cidrs(vec!["not-a-cidr".to_string()]);
        assert!(matches!(
            validate_acl(&bad_cidr, &groups),
            Err(Error::InvalidAcl(_))
        ));

        let missing_group = NetworkAcl::new("bad", 0, AclAction::Accept)
            .with_source_nodes(vec!["group:ghost".to_string()]);
        assert!(matches!(
            validate_acl(&missing_group, &groups),
            Err(Error::InvalidAcl(_))
        ));

        let ok = NetworkAcl::new("ok", 0, AclAction::Accept)
            .with_destination_cidrs(vec![WILDCARD.to_string(), "10.0.0.0/8".to_string()]);
        assert!(validate_acl(&ok, &groups).is_ok());
    }
}
