//! Release dependency graph.
//!
//! Builds the per-cluster DAG from `needs` declarations, assigns execution
//! groups by Kahn-style topological leveling, detects cycles, walks
//! dependency/dependent closures, and produces the deterministic
//! linearization used for display and audit. Clusters never share edges, so
//! one pass over the whole node set levels every cluster independently.

use std::collections::{BTreeMap, BTreeSet};

use ktl_stack_types::ResolvedRelease;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("release {node} needs {needs:?}, which does not exist in cluster {cluster}")]
    UnknownDependency {
        node: String,
        needs: String,
        cluster: String,
    },
    #[error("dependency cycle detected among: {}", participants.join(", "))]
    Cycle { participants: Vec<String> },
}

/// Immutable dependency graph over node ids.
#[derive(Debug, Clone, Default)]
pub struct ReleaseGraph {
    ids: BTreeSet<String>,
    deps_of: BTreeMap<String, BTreeSet<String>>,
    dependents_of: BTreeMap<String, BTreeSet<String>>,
}

impl ReleaseGraph {
    /// Build the graph, resolving each `needs` entry (a release name) to the
    /// node with that name in the same cluster.
    pub fn build(nodes: &[ResolvedRelease]) -> Result<Self, GraphError> {
        // name -> id within each cluster; names are unique per cluster by
        // compiler validation.
        let mut by_cluster_name: BTreeMap<(&str, &str), &str> = BTreeMap::new();
        for node in nodes {
            by_cluster_name.insert((node.cluster.name.as_str(), node.name.as_str()), &node.id);
        }

        let mut graph = Self::default();
        for node in nodes {
            graph.ids.insert(node.id.clone());
            graph.deps_of.entry(node.id.clone()).or_default();
            graph.dependents_of.entry(node.id.clone()).or_default();
        }

        for node in nodes {
            for needs in &node.needs {
                let dep_id = by_cluster_name
                    .get(&(node.cluster.name.as_str(), needs.as_str()))
                    .ok_or_else(|| GraphError::UnknownDependency {
                        node: node.id.clone(),
                        needs: needs.clone(),
                        cluster: node.cluster.name.clone(),
                    })?;
                graph
                    .deps_of
                    .get_mut(&node.id)
                    .expect("node registered above")
                    .insert((*dep_id).to_string());
                graph
                    .dependents_of
                    .entry((*dep_id).to_string())
                    .or_default()
                    .insert(node.id.clone());
            }
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Direct dependencies of a node.
    pub fn deps(&self, id: &str) -> impl Iterator<Item = &str> {
        self.deps_of
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents_of
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Same nodes with every edge reversed. Delete runs dependents before
    /// dependencies.
    pub fn reversed(&self) -> Self {
        Self {
            ids: self.ids.clone(),
            deps_of: self.dependents_of.clone(),
            dependents_of: self.deps_of.clone(),
        }
    }

    /// Kahn-style leveling. Round `k` holds every node whose dependencies
    /// all sit in earlier rounds; ties within a round are sorted by id.
    /// Nodes left unassigned participate in a cycle.
    pub fn topo_layers(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for id in &self.ids {
            indegree.insert(id.as_str(), self.deps_of[id].len());
        }

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut assigned = 0usize;
        let mut current: Vec<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&id, _)| id)
            .collect();

        while !current.is_empty() {
            // BTreeMap iteration already yields sorted ids; keep the layer
            // sorted for determinism.
            current.sort_unstable();
            assigned += current.len();
            let mut next: Vec<&str> = Vec::new();
            for &id in &current {
                for dependent in self.dependents_of[id].iter() {
                    let deg = indegree
                        .get_mut(dependent.as_str())
                        .expect("dependent is a registered node");
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(dependent.as_str());
                    }
                }
            }
            layers.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }

        if assigned != self.ids.len() {
            let mut participants: Vec<String> = indegree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            participants.sort_unstable();
            return Err(GraphError::Cycle { participants });
        }
        Ok(layers)
    }

    /// Execution group per node id: the index of its topological layer.
    pub fn execution_groups(&self) -> Result<BTreeMap<String, u32>, GraphError> {
        let layers = self.topo_layers()?;
        let mut groups = BTreeMap::new();
        for (i, layer) in layers.into_iter().enumerate() {
            for id in layer {
                groups.insert(id, i as u32);
            }
        }
        Ok(groups)
    }

    /// Deterministic total order: replays the ready-set discipline the
    /// scheduler uses, always admitting the lexicographically first node
    /// whose dependencies are satisfied.
    pub fn linearize(&self) -> Result<Vec<String>, GraphError> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for id in &self.ids {
            indegree.insert(id.as_str(), self.deps_of[id].len());
        }
        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(id);
            order.push(id.to_string());
            for dependent in self.dependents_of[id].iter() {
                let deg = indegree
                    .get_mut(dependent.as_str())
                    .expect("dependent is a registered node");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(dependent.as_str());
                }
            }
        }

        if order.len() != self.ids.len() {
            let mut participants: Vec<String> = indegree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            participants.sort_unstable();
            return Err(GraphError::Cycle { participants });
        }
        Ok(order)
    }

    /// All transitive dependencies of the start set, excluding the start
    /// nodes themselves.
    pub fn closure_deps(&self, start: &[String]) -> BTreeSet<String> {
        self.walk(start, &self.deps_of)
    }

    /// All transitive dependents of the start set, excluding the start
    /// nodes themselves.
    pub fn closure_dependents(&self, start: &[String]) -> BTreeSet<String> {
        self.walk(start, &self.dependents_of)
    }

    fn walk(
        &self,
        start: &[String],
        edges: &BTreeMap<String, BTreeSet<String>>,
    ) -> BTreeSet<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<&str> = start.iter().map(String::as_str).collect();
        while let Some(id) = queue.pop() {
            if let Some(next) = edges.get(id) {
                for n in next {
                    if seen.insert(n.clone()) {
                        queue.push(n);
                    }
                }
            }
        }
        for s in start {
            seen.remove(s);
        }
        seen
    }
}
