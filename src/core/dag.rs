//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! The graph is an arena of tasks on petgraph's `DiGraph`, indexed by task
//! id. An edge `a -> b` means `a` must complete before `b` starts. Node
//! indices are allocated in insertion order and nodes are never removed, so
//! ordering by index is ordering by input position; every traversal below
//! relies on that for deterministic tie-breaks.

use crate::core::task::{Task, TaskId, TaskSet};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// An ordered root-to-leaf chain of task ids.
pub type ExecutionPath = Vec<TaskId>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build the graph for an admitted task set.
    ///
    /// Admission guarantees every dependency resolves, so this cannot fail.
    pub fn from_task_set(tasks: &TaskSet) -> Self {
        let mut dag = Self::new();
        for task in tasks.iter() {
            dag.add_task(task.clone());
        }
        for task in tasks.iter() {
            for dep in &task.dependencies {
                dag.link(dep, &task.id);
            }
        }
        dag
    }

    /// Build the graph from unvalidated tasks, failing on the first
    /// dependency that names a task not in the list.
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task.clone());
        }
        for task in tasks {
            for dep in &task.dependencies {
                dag.add_dependency(dep, &task.id)?;
            }
        }
        Ok(dag)
    }

    /// Add a task. A task whose id is already present keeps its existing node.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `from` must complete before `to`.
    ///
    /// Cycles are accepted here; they are reported by [`TaskDAG::find_cycle`].
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        if !self.task_index.contains_key(from) {
            return Err(Error::UnresolvedDependency {
                task_id: to.to_string(),
                dependency: from.to_string(),
            });
        }
        if !self.task_index.contains_key(to) {
            return Err(Error::Validation(format!("Task {} not found in DAG", to)));
        }
        self.link(from, to);
        Ok(())
    }

    fn link(&mut self, from: &TaskId, to: &TaskId) {
        if let (Some(&a), Some(&b)) = (self.task_index.get(from), self.task_index.get(to)) {
            if self.graph.find_edge(a, b).is_none() {
                self.graph.add_edge(a, b, ());
            }
        }
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_node_index(&self, id: &str) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &str) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &str, to: &str) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Check if `to` depends on `from` directly or transitively.
    pub fn depends_on(&self, to: &str, from: &str) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) if a != b => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Task ids in insertion order.
    pub fn task_ids(&self) -> Vec<&TaskId> {
        self.graph
            .node_indices()
            .filter_map(|i| self.graph.node_weight(i).map(|t| &t.id))
            .collect()
    }

    fn id_of(&self, index: NodeIndex) -> Option<&TaskId> {
        self.graph.node_weight(index).map(|t| &t.id)
    }

    fn predecessors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        // Follow the task's own dependency order rather than edge order.
        self.graph
            .node_weight(index)
            .map(|task| {
                task.dependencies
                    .iter()
                    .filter_map(|d| self.task_index.get(d).copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        out.sort();
        out
    }

    /// Direct dependencies of a task, in the task's declared order.
    pub fn dependencies_of(&self, id: &str) -> Vec<&TaskId> {
        self.task_index
            .get(id)
            .map(|&i| {
                self.predecessors(i)
                    .into_iter()
                    .filter_map(|p| self.id_of(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of a task, in insertion order.
    pub fn dependents_of(&self, id: &str) -> Vec<&TaskId> {
        self.task_index
            .get(id)
            .map(|&i| {
                self.successors(i)
                    .into_iter()
                    .filter_map(|s| self.id_of(s))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All transitive dependencies of a task, excluding the task itself.
    pub fn ancestors(&self, id: &str) -> HashSet<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return HashSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut out = HashSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                if let Some(task_id) = self.id_of(node) {
                    out.insert(task_id.clone());
                }
            }
        }
        out
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<&TaskId> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph.neighbors_directed(i, Direction::Incoming).next().is_none())
            .filter_map(|i| self.id_of(i))
            .collect()
    }

    /// Tasks nothing depends on.
    pub fn leaves(&self) -> Vec<&TaskId> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph.neighbors_directed(i, Direction::Outgoing).next().is_none())
            .filter_map(|i| self.id_of(i))
            .collect()
    }

    /// Tasks with neither dependencies nor dependents.
    pub fn independent_task_count(&self) -> usize {
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph.neighbors_directed(i, Direction::Incoming).next().is_none()
                    && self.graph.neighbors_directed(i, Direction::Outgoing).next().is_none()
            })
            .count()
    }

    // ========== Analysis Operations ==========

    /// Find a cycle with a three-color depth-first search over successors.
    ///
    /// Returns the tasks on the first cycle found, in dependency order.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let n = self.graph.node_count();
        let mut color = vec![Color::White; n];
        let mut parent: Vec<Option<NodeIndex>> = vec![None; n];

        for start in self.graph.node_indices() {
            if color[start.index()] != Color::White {
                continue;
            }
            color[start.index()] = Color::Gray;
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(start, self.successors(start), 0)];

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                if frame.2 >= frame.1.len() {
                    color[node.index()] = Color::Black;
                    stack.pop();
                    continue;
                }
                let next = frame.1[frame.2];
                frame.2 += 1;

                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        parent[next.index()] = Some(node);
                        stack.push((next, self.successors(next), 0));
                    }
                    Color::Gray => {
                        let mut cycle = vec![node];
                        let mut cur = node;
                        while cur != next {
                            match parent[cur.index()] {
                                Some(p) => {
                                    cycle.push(p);
                                    cur = p;
                                }
                                None => break,
                            }
                        }
                        cycle.reverse();
                        return Some(
                            cycle
                                .into_iter()
                                .filter_map(|i| self.id_of(i).cloned())
                                .collect(),
                        );
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Partition tasks into topological layers (Kahn's algorithm).
    ///
    /// Layer `k+1` holds tasks whose dependencies all lie in layers `1..=k`.
    /// Within a layer tasks keep insertion order.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect();

        let mut groups = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &node in &current {
                for succ in self.successors(node) {
                    in_degree[succ.index()] -= 1;
                    if in_degree[succ.index()] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort();
            groups.push(
                current
                    .iter()
                    .filter_map(|&i| self.id_of(i).cloned())
                    .collect(),
            );
            current = next;
        }

        if placed != self.graph.node_count() {
            return Err(Error::Internal(format!(
                "{} tasks left unscheduled after layering",
                self.graph.node_count() - placed
            )));
        }
        Ok(groups)
    }

    /// Tasks in dependency order, as computed by petgraph.
    pub fn topological_order(&self) -> Result<Vec<&TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|_| Error::Cycle)?;
        Ok(sorted.into_iter().filter_map(|i| self.id_of(i)).collect())
    }

    /// Longest dependency chain below each task; roots are at depth 0.
    pub fn depths(&self) -> Result<HashMap<TaskId, usize>> {
        let mut depths: HashMap<TaskId, usize> = HashMap::new();
        for id in self.topological_order()? {
            let depth = self
                .dependencies_of(id.as_str())
                .into_iter()
                .filter_map(|dep| depths.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id.clone(), depth);
        }
        Ok(depths)
    }

    pub fn max_depth(&self) -> Result<usize> {
        Ok(self.depths()?.into_values().max().unwrap_or(0))
    }

    /// Every root-to-leaf path, grouped by leaf in insertion order.
    ///
    /// Must only be called on an acyclic graph.
    pub fn dependency_paths(&self) -> Vec<ExecutionPath> {
        let mut memo: HashMap<NodeIndex, Vec<Vec<NodeIndex>>> = HashMap::new();
        let mut seen: HashSet<Vec<NodeIndex>> = HashSet::new();
        let mut paths = Vec::new();

        for leaf in self.graph.node_indices() {
            if self.graph.neighbors_directed(leaf, Direction::Outgoing).next().is_some() {
                continue;
            }
            for path in self.paths_to(leaf, &mut memo) {
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        paths
            .into_iter()
            .map(|p| p.into_iter().filter_map(|i| self.id_of(i).cloned()).collect())
            .collect()
    }

    fn paths_to(
        &self,
        node: NodeIndex,
        memo: &mut HashMap<NodeIndex, Vec<Vec<NodeIndex>>>,
    ) -> Vec<Vec<NodeIndex>> {
        if let Some(paths) = memo.get(&node) {
            return paths.clone();
        }
        let deps = self.predecessors(node);
        let paths = if deps.is_empty() {
            vec![vec![node]]
        } else {
            let mut out = Vec::new();
            for dep in deps {
                for mut path in self.paths_to(dep, memo) {
                    path.push(node);
                    if !out.contains(&path) {
                        out.push(path);
                    }
                }
            }
            out
        };
        memo.insert(node, paths.clone());
        paths
    }

    /// The merged list of predecessors for each task, the task itself last.
    ///
    /// Every path through a task contributes the tasks that precede it there;
    /// these are unioned in first-seen order. A task reached by a single path
    /// gets that path's prefix verbatim. Results are in insertion order.
    pub fn canonical_paths(&self, paths: &[ExecutionPath]) -> Vec<(TaskId, ExecutionPath)> {
        let mut merged: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for path in paths {
            for (pos, id) in path.iter().enumerate() {
                let entry = merged.entry(id).or_default();
                for pred in &path[..pos] {
                    if !entry.contains(&pred) {
                        entry.push(pred);
                    }
                }
            }
        }

        self.task_ids()
            .into_iter()
            .map(|id| {
                let mut canonical: ExecutionPath = merged
                    .get(id)
                    .map(|preds| preds.iter().map(|p| (*p).clone()).collect())
                    .unwrap_or_default();
                canonical.push(id.clone());
                (id.clone(), canonical)
            })
            .collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
