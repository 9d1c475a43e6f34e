//! Graph filtering
//!
//! Produces an observer's view of the admission graph by dropping nodes and
//! edges the ACL set does not permit.

use super::engine::AclList;
use crate::graph::{AdjacencyMap, MeshGraph};
use crate::models::{MeshNode, NetworkAction, Route};
use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::BTreeMap;
use tracing::debug;

/// Filter the graph's adjacency map for `observer`.
///
/// The observer's row is always present, even when empty. An empty ACL list
/// yields an empty map. A node is dropped when direct communication with the
/// observer is denied, or when *any* of its advertised route CIDRs fails
/// evaluation — accepting the subset of permitted routes would be sounder,
/// but per-route filtering is left as a later improvement and the
/// whole-node drop is kept.
pub(super) fn filter_adjacency(
    graph: &MeshGraph,
    full: &AdjacencyMap,
    acls: &AclList,
    routes_by_node: &BTreeMap<String, Vec<Route>>,
    observer: &str,
) -> Result<AdjacencyMap> {
    let this_node = graph
        .vertex(observer)
        .ok_or_else(|| Error::NodeNotFound(observer.to_string()))?;

    if acls.is_empty() {
        return Ok(AdjacencyMap::new());
    }

    let mut filtered = AdjacencyMap::new();
    filtered.insert(
        observer.to_string(),
        full.get(observer).cloned().unwrap_or_default(),
    );

    // First pass: retain nodes the observer may communicate with.
    'nodes: for node_id in full.keys() {
        if node_id == observer {
            continue;
        }
        let node = graph
            .vertex(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.clone()))?;
        if !acls.allow_nodes_to_communicate(this_node, node) {
            debug!(observer = %observer, node = %node_id, "nodes not allowed to communicate");
            if let Some(edges) = filtered.get_mut(observer) {
                edges.remove(node_id);
            }
            continue 'nodes;
        }
        if let Some(routes) = routes_by_node.get(node_id) {
            for route in routes {
                for cidr in &route.destination_cidrs {
                    let action = route_action(this_node, node_id, *cidr);
                    if !acls.accept(&action) {
                        debug!(
                            observer = %observer,
                            node = %node_id,
                            cidr = %cidr,
                            "filtering node, route not allowed"
                        );
                        if let Some(edges) = filtered.get_mut(observer) {
                            edges.remove(node_id);
                        }
                        continue 'nodes;
                    }
                }
            }
        }
        filtered.insert(node_id.clone(), BTreeMap::new());
    }

    // Second pass: retain edges whose target is also reachable.
    let retained: Vec<String> = filtered.keys().cloned().collect();
    for node_id in retained {
        let Some(edges) = full.get(&node_id) else {
            continue;
        };
        'peers: for (peer_id, edge) in edges {
            if peer_id == observer {
                filtered
                    .entry(node_id.clone())
                    .or_default()
                    .insert(peer_id.clone(), edge.clone());
                continue;
            }
            let peer = graph
                .vertex(peer_id)
                .ok_or_else(|| Error::NodeNotFound(peer_id.clone()))?;
            if !acls.allow_nodes_to_communicate(this_node, peer) {
                continue 'peers;
            }
            if let Some(routes) = routes_by_node.get(peer_id) {
                for route in routes {
                    for cidr in &route.destination_cidrs {
                        if !acls.accept(&route_action(this_node, peer_id, *cidr)) {
                            continue 'peers;
                        }
                    }
                }
            }
            filtered
                .entry(node_id.clone())
                .or_default()
                .insert(peer_id.clone(), edge.clone());
        }
    }

    Ok(filtered)
}

/// Build the traffic tuple for a route advertisement, picking the observer's
/// source prefix by the route CIDR's address family.
fn route_action(observer: &MeshNode, dst_node: &str, cidr: IpNet) -> NetworkAction {
    let src_cidr = match cidr {
        IpNet::V4(_) => observer.private_ipv4.map(IpNet::V4),
        IpNet::V6(_) => observer.private_ipv6.map(IpNet::V6),
    };
    NetworkAction {
        src_node: observer.id.clone(),
        src_cidr,
        dst_node: dst_node.to_string(),
        dst_cidr: Some(cidr),
        protocol: None,
        port: None,
    }
}
