//! Build graph for dependency resolution and build ordering

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::descriptor::BuildDescriptor;
use super::BuildError;
use crate::utils;

/// BuildGraph orders app builds so base images are built before the
/// images that use them.
///
/// Nodes are `image:tag` strings addressed by integer id. A node with no
/// descriptor is external: a base image that is assumed to exist and is
/// never built.
#[derive(Debug, Default)]
pub struct BuildGraph<'a> {
    names: Vec<String>,
    ids: HashMap<String, usize>,
    descriptors: Vec<Option<&'a BuildDescriptor>>,
    in_degree: Vec<usize>,
    /// node id -> ids of the nodes that depend on it
    dependents: Vec<Vec<usize>>,
}

impl<'a> BuildGraph<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a graph with one node per descriptor and one edge per `FROM` dependency
    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = &'a BuildDescriptor>,
    {
        let mut graph = Self::new();
        for descriptor in descriptors {
            graph.add_descriptor(descriptor);
            let name = descriptor.full_image_name();
            for dependency in &descriptor.depends_on {
                graph.add_edge(dependency, &name, descriptor);
            }
        }
        graph
    }

    fn node_id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        self.descriptors.push(None);
        self.in_degree.push(0);
        self.dependents.push(Vec::new());
        id
    }

    fn attach(&mut self, id: usize, descriptor: &'a BuildDescriptor) {
        if let Some(existing) = self.descriptors[id] {
            if existing.source_path != descriptor.source_path {
                utils::print_warning(&format!(
                    "Image {} is defined by both {} and {}; using the latter",
                    utils::style_name(&self.names[id]),
                    utils::style_path(&existing.source_path.to_string_lossy()),
                    utils::style_path(&descriptor.source_path.to_string_lossy())
                ));
            }
        }
        self.descriptors[id] = Some(descriptor);
    }

    /// Register a buildable node even if it has no dependencies
    pub fn add_descriptor(&mut self, descriptor: &'a BuildDescriptor) {
        let id = self.node_id(&descriptor.full_image_name());
        self.attach(id, descriptor);
    }

    /// Record that `dependent` needs `dependency` to exist first.
    /// `descriptor` builds `dependent`.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str, descriptor: &'a BuildDescriptor) {
        let from = self.node_id(dependency);
        let to = self.node_id(dependent);

        if !self.dependents[from].contains(&to) {
            self.dependents[from].push(to);
            self.in_degree[to] += 1;
        }
        self.attach(to, descriptor);
    }

    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.iter().map(Vec::len).sum()
    }

    /// Nodes with no descriptor, sorted
    pub fn external_nodes(&self) -> Vec<&str> {
        let mut external: Vec<&str> = self
            .names
            .iter()
            .zip(&self.descriptors)
            .filter(|(_, d)| d.is_none())
            .map(|(n, _)| n.as_str())
            .collect();
        external.sort_unstable();
        external
    }

    pub fn is_external(&self, name: &str) -> bool {
        self.ids
            .get(name)
            .map(|&id| self.descriptors[id].is_none())
            .unwrap_or(false)
    }

    /// Kahn's algorithm. Among nodes that are ready at the same time the
    /// lexicographically smallest name goes first.
    pub fn topological_order(&self) -> Result<Vec<&'a BuildDescriptor>, BuildError> {
        let mut remaining = self.in_degree.clone();
        let mut ready: BTreeSet<(&str, usize)> = self
            .names
            .iter()
            .enumerate()
            .filter(|(id, _)| remaining[*id] == 0)
            .map(|(id, name)| (name.as_str(), id))
            .collect();
        let mut order = Vec::new();

        while let Some((name, id)) = ready.pop_first() {
            match self.descriptors[id] {
                Some(descriptor) => order.push(descriptor),
                None => utils::print_debug(&format!(
                    "Assuming {} is an external dependency because it has no app config",
                    utils::style_name(name)
                )),
            }

            for &next in &self.dependents[id] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.insert((self.names[next].as_str(), next));
                }
            }
        }

        let mut blocked: Vec<String> = remaining
            .iter()
            .enumerate()
            .filter(|(id, degree)| **degree > 0 && self.descriptors[*id].is_some())
            .map(|(id, _)| self.names[id].clone())
            .collect();

        if !blocked.is_empty() {
            blocked.sort();
            return Err(BuildError::CircularDependency(blocked));
        }

        Ok(order)
    }

    /// Every buildable image that directly or transitively depends on `name`
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.ids.get(name) else {
            return found;
        };

        let mut visited = vec![false; self.names.len()];
        let mut queue = VecDeque::from([start]);
        visited[start] = true;

        while let Some(id) = queue.pop_front() {
            for &next in &self.dependents[id] {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                if self.descriptors[next].is_some() {
                    found.insert(self.names[next].clone());
                }
                queue.push_back(next);
            }
        }

        found
    }

    /// Direct dependencies of `name`, in node creation order
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        let Some(&target) = self.ids.get(name) else {
            return Vec::new();
        };
        self.dependents
            .iter()
            .enumerate()
            .filter(|(_, targets)| targets.contains(&target))
            .map(|(id, _)| self.names[id].as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(order: &[&BuildDescriptor]) -> Vec<String> {
        order.iter().map(|d| d.full_image_name()).collect()
    }

    #[test]
    fn test_chain_with_external_base() {
        let a = BuildDescriptor::stub("a", "1", &["b:1"]);
        let b = BuildDescriptor::stub("b", "1", &["c:1"]);

        let graph = BuildGraph::from_descriptors([&a, &b]);
        let order = graph.topological_order().unwrap();

        assert_eq!(names(&order), vec!["b:1", "a:1"]);
        assert_eq!(graph.external_nodes(), vec!["c:1"]);
        assert!(graph.is_external("c:1"));
        assert!(!graph.is_external("a:1"));
    }

    #[test]
    fn test_add_edge_records_dependent_descriptor() {
        let a = BuildDescriptor::stub("a", "1", &[]);
        let mut graph = BuildGraph::new();
        graph.add_edge("base:1", "a:1", &a);

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.is_external("base:1"));
        assert_eq!(names(&graph.topological_order().unwrap()), vec!["a:1"]);
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let a = BuildDescriptor::stub("a", "1", &["b:1", "b:1"]);
        let b = BuildDescriptor::stub("b", "1", &[]);

        let mut graph = BuildGraph::from_descriptors([&a, &b]);
        graph.add_edge("b:1", "a:1", &a);

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(names(&graph.topological_order().unwrap()), vec!["b:1", "a:1"]);
    }

    #[test]
    fn test_descriptor_without_dependencies_is_scheduled() {
        let lone = BuildDescriptor::stub("lone", "latest", &[]);
        let graph = BuildGraph::from_descriptors([&lone]);
        assert_eq!(names(&graph.topological_order().unwrap()), vec!["lone:latest"]);
    }

    #[test]
    fn test_ties_break_lexicographically() {
        let z = BuildDescriptor::stub("zeta", "1", &["base:1"]);
        let m = BuildDescriptor::stub("mu", "1", &["base:1"]);
        let a = BuildDescriptor::stub("alpha", "1", &["base:1"]);
        let top = BuildDescriptor::stub("top", "1", &["zeta:1", "alpha:1"]);

        let first = BuildGraph::from_descriptors([&z, &m, &top, &a]);
        let second = BuildGraph::from_descriptors([&top, &a, &m, &z]);

        let expected = vec!["alpha:1", "mu:1", "zeta:1", "top:1"];
        assert_eq!(names(&first.topological_order().unwrap()), expected);
        assert_eq!(names(&second.topological_order().unwrap()), expected);
    }

    #[test]
    fn test_order_respects_every_edge() {
        let descriptors = vec![
            BuildDescriptor::stub("app", "1", &["runtime:1", "tools:1"]),
            BuildDescriptor::stub("runtime", "1", &["os:1"]),
            BuildDescriptor::stub("tools", "1", &["os:1", "ubuntu:22.04"]),
            BuildDescriptor::stub("os", "1", &["ubuntu:22.04"]),
            BuildDescriptor::stub("game", "1", &["app:1"]),
        ];
        let graph = BuildGraph::from_descriptors(&descriptors);
        let order = names(&graph.topological_order().unwrap());

        assert_eq!(order.len(), descriptors.len());
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        for d in &descriptors {
            for dep in &d.depends_on {
                if !graph.is_external(dep) {
                    assert!(pos(dep) < pos(&d.full_image_name()), "{} before {}", dep, d.image);
                }
            }
        }
    }

    #[test]
    fn test_cycle_names_every_blocked_node() {
        let x = BuildDescriptor::stub("x", "1", &["y:1"]);
        let y = BuildDescriptor::stub("y", "1", &["x:1"]);

        let graph = BuildGraph::from_descriptors([&x, &y]);
        match graph.topological_order() {
            Err(BuildError::CircularDependency(nodes)) => {
                assert_eq!(nodes, vec!["x:1", "y:1"]);
            }
            other => panic!("expected cycle error, got {:?}", other.map(|o| names(&o))),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let selfish = BuildDescriptor::stub("loop", "1", &["loop:1"]);
        let graph = BuildGraph::from_descriptors([&selfish]);
        assert!(matches!(
            graph.topological_order(),
            Err(BuildError::CircularDependency(n)) if n == vec!["loop:1"]
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let b = BuildDescriptor::stub("b", "1", &["ext:1"]);
        let c = BuildDescriptor::stub("c", "1", &["b:1"]);
        let d = BuildDescriptor::stub("d", "1", &["c:1", "b:1"]);
        let e = BuildDescriptor::stub("e", "1", &["ext:1"]);

        let graph = BuildGraph::from_descriptors([&b, &c, &d, &e]);
        let below_b: Vec<String> = graph.transitive_dependents("b:1").into_iter().collect();
        assert_eq!(below_b, vec!["c:1", "d:1"]);
        assert!(graph.transitive_dependents("d:1").is_empty());
        assert!(graph.transitive_dependents("missing:1").is_empty());
        assert_eq!(graph.dependencies_of("d:1"), vec!["b:1", "c:1"]);
    }
}
