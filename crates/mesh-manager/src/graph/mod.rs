//! Mesh admission graph
//!
//! Materializes the admission graph from the peer registry. Each node's
//! `admitted_by` reference produces a link to its admitter; oriented by
//! admission the edge set is a DAG rooted at the bootstrap node, and the
//! adjacency map carries every link in both directions so walks can reach
//! a node's admitter as well as its descendants.

use crate::models::MeshNode;
use crate::registry::PeerRegistry;
use crate::Result;
use std::collections::BTreeMap;

/// A directed edge in the adjacency map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Edge origin
    pub source: String,
    /// Edge target
    pub target: String,
}

/// Adjacency map of the admission graph: `source -> target -> edge`.
/// Every vertex has a row, possibly empty. Ordered maps keep walks
/// deterministic.
pub type AdjacencyMap = BTreeMap<String, BTreeMap<String, Edge>>;

/// A snapshot of the mesh graph.
///
/// Registry mutations after the build are not reflected; callers that need
/// fresh state build a new graph.
#[derive(Debug, Clone)]
pub struct MeshGraph {
    vertices: BTreeMap<String, MeshNode>,
    adjacency: AdjacencyMap,
}

impl MeshGraph {
    /// Build a snapshot from the registry with a single prefix scan.
    pub async fn build(registry: &PeerRegistry) -> Result<Self> {
        let nodes = registry.list().await?;

        let mut vertices = BTreeMap::new();
        let mut adjacency: AdjacencyMap = BTreeMap::new();
        for node in &nodes {
            vertices.insert(node.id.clone(), node.clone());
            adjacency.entry(node.id.clone()).or_default();
        }
        for node in &nodes {
            let Some(admitter) = &node.admitted_by else {
                continue;
            };
            // An admitter that has already left leaves no edge behind.
            if !vertices.contains_key(admitter) {
                continue;
            }
            // The admission orientation is what keeps the edge set a DAG;
            // the adjacency itself carries the link in both directions so a
            // node can reach its admitter as well as its descendants.
            adjacency.entry(admitter.clone()).or_default().insert(
                node.id.clone(),
                Edge {
                    source: admitter.clone(),
                    target: node.id.clone(),
                },
            );
            adjacency.entry(node.id.clone()).or_default().insert(
                admitter.clone(),
                Edge {
                    source: node.id.clone(),
                    target: admitter.clone(),
                },
            );
        }

        Ok(Self {
            vertices,
            adjacency,
        })
    }

    /// The graph's adjacency map.
    pub fn adjacency_map(&self) -> &AdjacencyMap {
        &self.adjacency
    }

    /// Resolve a vertex captured at build time.
    pub fn vertex(&self, id: &str) -> Option<&MeshNode> {
        self.vertices.get(id)
    }

    /// Number of vertices in the snapshot.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether the snapshot holds no vertices.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}
