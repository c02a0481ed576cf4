//! Dependency graph queries over a normalized store.
//!
//! Package ids are interned into an arena and every traversal runs on an
//! explicit queue or stack with a visited set, so deep or cyclic inputs
//! cannot exhaust the call stack.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::models::{DependencyEdge, DependencyKind};

type NodeId = usize;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, NodeId>,
    outgoing: Vec<Vec<(NodeId, DependencyKind)>>,
    incoming: Vec<Vec<(NodeId, DependencyKind)>>,
}

/// A neighbour reached by a traversal, with its distance from the start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reached {
    pub id: String,
    pub kind: DependencyKind,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dependencies,
    Dependents,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub build_edges: usize,
    pub propagated_edges: usize,
    pub max_fan_out: Option<(String, usize)>,
    pub max_fan_in: Option<(String, usize)>,
    pub leaf_packages: usize,
}

impl DependencyGraph {
    /// Build from package ids and edges. Edges naming unknown ids are
    /// ignored; the normalizer has already reported them.
    pub fn new<'a>(
        package_ids: impl IntoIterator<Item = &'a str>,
        edges: &[DependencyEdge],
    ) -> Self {
        let mut ids: Vec<String> = package_ids.into_iter().map(str::to_string).collect();
        ids.sort();
        ids.dedup();
        let index: HashMap<String, NodeId> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let mut outgoing = vec![Vec::new(); ids.len()];
        let mut incoming = vec![Vec::new(); ids.len()];
        for edge in edges {
            if let (Some(&s), Some(&t)) = (index.get(&edge.source_id), index.get(&edge.target_id)) {
                outgoing[s].push((t, edge.kind));
                incoming[t].push((s, edge.kind));
            }
        }
        for list in outgoing.iter_mut().chain(incoming.iter_mut()) {
            list.sort();
            list.dedup();
        }
        Self {
            ids,
            index,
            outgoing,
            incoming,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn adjacency(&self, direction: Direction) -> &[Vec<(NodeId, DependencyKind)>] {
        match direction {
            Direction::Dependencies => &self.outgoing,
            Direction::Dependents => &self.incoming,
        }
    }

    /// Direct neighbours in the given direction.
    pub fn neighbours(&self, id: &str, direction: Direction) -> Vec<Reached> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        self.adjacency(direction)[node]
            .iter()
            .map(|&(n, kind)| Reached {
                id: self.ids[n].clone(),
                kind,
                depth: 1,
            })
            .collect()
    }

    /// Breadth-first transitive closure, optionally bounded by depth.
    /// Each package is reported once, at its shortest distance.
    pub fn transitive(&self, id: &str, direction: Direction, max_depth: Option<usize>) -> Vec<Reached> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let adjacency = self.adjacency(direction);
        let mut visited = vec![false; self.ids.len()];
        visited[start] = true;
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::from([(start, 0)]);
        let mut out = Vec::new();

        while let Some((node, depth)) = queue.pop_front() {
            if max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            for &(next, kind) in &adjacency[node] {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                out.push(Reached {
                    id: self.ids[next].clone(),
                    kind,
                    depth: depth + 1,
                });
                queue.push_back((next, depth + 1));
            }
        }
        out
    }

    /// Shortest dependency chain from `from` to `to`, both ends included.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let (&start, &goal) = (self.index.get(from)?, self.index.get(to)?);
        if start == goal {
            return Some(vec![self.ids[start].clone()]);
        }
        let mut parent: Vec<Option<NodeId>> = vec![None; self.ids.len()];
        let mut visited = vec![false; self.ids.len()];
        visited[start] = true;
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            for &(next, _) in &self.outgoing[node] {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                parent[next] = Some(node);
                if next == goal {
                    let mut path = vec![self.ids[goal].clone()];
                    let mut cursor = goal;
                    while let Some(p) = parent[cursor] {
                        path.push(self.ids[p].clone());
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Elementary cycles found along DFS back edges. Each cycle is rotated
    /// to start at its smallest id and reported once.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let n = self.ids.len();
        let mut color = vec![Color::White; n];
        let mut cycles: Vec<Vec<NodeId>> = Vec::new();

        for root in 0..n {
            if color[root] != Color::White {
                continue;
            }
            // (node, next edge index); the stack doubles as the current path.
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            color[root] = Color::Grey;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let next_edge = self.outgoing[node].get(top.1).copied();
                top.1 += 1;
                match next_edge {
                    Some((next, _)) => match color[next] {
                        Color::White => {
                            color[next] = Color::Grey;
                            stack.push((next, 0));
                        }
                        Color::Grey => {
                            if let Some(pos) = stack.iter().position(|&(v, _)| v == next) {
                                let cycle: Vec<NodeId> =
                                    stack[pos..].iter().map(|&(v, _)| v).collect();
                                cycles.push(canonical_rotation(cycle));
                            }
                        }
                        Color::Black => {}
                    },
                    None => {
                        color[node] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }

        cycles.sort();
        cycles.dedup();
        cycles
            .into_iter()
            .map(|c| c.into_iter().map(|v| self.ids[v].clone()).collect())
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            nodes: self.ids.len(),
            ..GraphStats::default()
        };
        for list in &self.outgoing {
            for &(_, kind) in list {
                match kind {
                    DependencyKind::Build => stats.build_edges += 1,
                    DependencyKind::Propagated => stats.propagated_edges += 1,
                }
            }
        }
        stats.leaf_packages = self.outgoing.iter().filter(|l| l.is_empty()).count();
        stats.max_fan_out = max_degree(&self.ids, &self.outgoing);
        stats.max_fan_in = max_degree(&self.ids, &self.incoming);
        stats
    }
}

/// Node ids are assigned in sorted id order, so the smallest node id is
/// the smallest package id.
fn canonical_rotation(mut cycle: Vec<NodeId>) -> Vec<NodeId> {
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| **v)
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}

fn max_degree(ids: &[String], adjacency: &[Vec<(NodeId, DependencyKind)>]) -> Option<(String, usize)> {
    adjacency
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.is_empty())
        // Ties go to the smaller id.
        .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
        .map(|(i, l)| (ids[i].clone(), l.len()))
}
