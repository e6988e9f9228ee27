//! Import graph construction and cycle canonicalization
//!
//! Nodes live in a petgraph arena indexed by stable relative path; edges
//! reference indices, never pointers, so source-level cycles cannot create
//! ownership cycles here. Cycles are enumerated with a coloring DFS and
//! canonicalized by rotating to the minimum node.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

/// The import graph over project-relative paths.
pub struct ImportGraph {
    graph: DiGraph<String, ()>,
    index: BTreeMap<String, NodeIndex>,
}

impl ImportGraph {
    /// Build from sorted `(from, to)` edges over a sorted node set.
    pub fn build(nodes: &[String], edges: &[(String, String)]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for node in nodes {
            let idx = graph.add_node(node.clone());
            index.insert(node.clone(), idx);
        }

        for (from, to) in edges {
            if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
                graph.add_edge(a, b, ());
            }
        }

        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Files that import `path`, sorted.
    pub fn referrers(&self, path: &str) -> Vec<String> {
        let Some(&idx) = self.index.get(path) else {
            return Vec::new();
        };
        let mut refs: Vec<String> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// All dependency cycles in canonical form, deduplicated and sorted.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut colors = vec![Color::White; self.graph.node_count()];
        let mut stack: Vec<NodeIndex> = Vec::new();
        let mut found: BTreeSet<Vec<String>> = BTreeSet::new();

        // Iterative DFS over nodes in index order for determinism.
        for (_, &start) in self.index.iter() {
            if colors[start.index()] != Color::White {
                continue;
            }
            self.dfs(start, &mut colors, &mut stack, &mut found);
        }

        found.into_iter().collect()
    }

    fn dfs(
        &self,
        node: NodeIndex,
        colors: &mut [Color],
        stack: &mut Vec<NodeIndex>,
        found: &mut BTreeSet<Vec<String>>,
    ) {
        colors[node.index()] = Color::Gray;
        stack.push(node);

        // Sorted neighbor order keeps cycle discovery deterministic.
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        neighbors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        neighbors.dedup();

        for next in neighbors {
            match colors[next.index()] {
                Color::White => self.dfs(next, colors, stack, found),
                Color::Gray => {
                    // Back edge: extract the cycle from the stack.
                    if let Some(pos) = stack.iter().position(|&n| n == next) {
                        let cycle: Vec<String> =
                            stack[pos..].iter().map(|&n| self.graph[n].clone()).collect();
                        found.insert(canonicalize_cycle(&cycle));
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[node.index()] = Color::Black;
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Rotate a cycle so its node sequence is minimal under string comparison,
/// then append the first node to close the loop. Any rotation of the same
/// cycle canonicalizes identically.
pub fn canonicalize_cycle(cycle: &[String]) -> Vec<String> {
    if cycle.is_empty() {
        return Vec::new();
    }

    let n = cycle.len();
    let mut best = 0usize;
    for start in 1..n {
        for offset in 0..n {
            let a = &cycle[(start + offset) % n];
            let b = &cycle[(best + offset) % n];
            match a.cmp(b) {
                std::cmp::Ordering::Less => {
                    best = start;
                    break;
                }
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Equal => continue,
            }
        }
    }

    let mut canonical: Vec<String> = (0..n).map(|i| cycle[(best + i) % n].clone()).collect();
    canonical.push(canonical[0].clone());
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_canonicalize_rotation_invariant() {
        let a = strings(&["b.ts", "c.ts", "a.ts"]);
        let b = strings(&["a.ts", "b.ts", "c.ts"]);
        let c = strings(&["c.ts", "a.ts", "b.ts"]);
        let expected = strings(&["a.ts", "b.ts", "c.ts", "a.ts"]);
        assert_eq!(canonicalize_cycle(&a), expected);
        assert_eq!(canonicalize_cycle(&b), expected);
        assert_eq!(canonicalize_cycle(&c), expected);
    }

    #[test]
    fn test_self_cycle() {
        let nodes = strings(&["a.ts"]);
        let edges = vec![("a.ts".to_string(), "a.ts".to_string())];
        let graph = ImportGraph::build(&nodes, &edges);
        let cycles = graph.cycles();
        assert_eq!(cycles, vec![strings(&["a.ts", "a.ts"])]);
    }

    #[test]
    fn test_two_node_cycle_found_once() {
        let nodes = strings(&["a.ts", "b.ts", "c.ts"]);
        let edges = vec![
            ("a.ts".to_string(), "b.ts".to_string()),
            ("b.ts".to_string(), "a.ts".to_string()),
            ("b.ts".to_string(), "c.ts".to_string()),
        ];
        let graph = ImportGraph::build(&nodes, &edges);
        let cycles = graph.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], strings(&["a.ts", "b.ts", "a.ts"]));
    }

    #[test]
    fn test_acyclic_graph_has_no_cycles() {
        let nodes = strings(&["a.ts", "b.ts", "c.ts"]);
        let edges = vec![
            ("a.ts".to_string(), "b.ts".to_string()),
            ("b.ts".to_string(), "c.ts".to_string()),
            ("a.ts".to_string(), "c.ts".to_string()),
        ];
        let graph = ImportGraph::build(&nodes, &edges);
        assert!(graph.cycles().is_empty());
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_referrers() {
        let nodes = strings(&["a.ts", "b.ts", "c.ts"]);
        let edges = vec![
            ("a.ts".to_string(), "c.ts".to_string()),
            ("b.ts".to_string(), "c.ts".to_string()),
        ];
        let graph = ImportGraph::build(&nodes, &edges);
        assert_eq!(graph.referrers("c.ts"), strings(&["a.ts", "b.ts"]));
        assert!(graph.referrers("a.ts").is_empty());
    }
}
