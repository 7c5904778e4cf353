//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Nodes are tasks; an edge `a → b` means `b` consumes `a`'s artifact and may
//! only run after `a` reached `Success`. In a campaign every edge runs from a
//! simulation to its reconstruction, but the graph does not rely on that.

use crate::core::task::{Task, TaskId, TaskKind};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a DAG from an expanded task list, wiring each `depends_on`.
    ///
    /// # Errors
    /// Returns an error if a task depends on an id that is not in the list,
    /// or a reconstruction depends on anything but a simulation.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        let edges: Vec<(TaskId, TaskId)> = tasks
            .iter()
            .filter_map(|t| t.depends_on.clone().map(|dep| (dep, t.id.clone())))
            .collect();

        for task in tasks {
            dag.add_task(task);
        }

        for (from, to) in edges {
            if let (Some(dep), Some(task)) = (dag.get_task(&from), dag.get_task(&to)) {
                if task.kind == TaskKind::Reconstruct && dep.kind != TaskKind::Simulate {
                    return Err(Error::Validation(format!(
                        "Reconstruction {} must depend on a simulation, not {}",
                        to, from
                    )));
                }
            }
            dag.add_dependency(&from, &to)?;
        }

        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// If the task already exists (same TaskId), returns the existing NodeIndex.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must succeed before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either task is missing or the edge would create
    /// a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", from)))?;

        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", to)))?;

        let edge = self.graph.add_edge(from_index, to_index, ());

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }

        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Mutable access that reports a missing id as an error.
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.get_task_mut(id)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", id)))
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

    /// All tasks in insertion (expansion) order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    // ========== Scheduling Operations ==========

    /// Ids of tasks that may be dispatched now, in expansion order.
    ///
    /// A task is ready if it is `Pending` and every dependency has reached
    /// `Success`. Anything else, including a dependency that is merely
    /// `Running` or waiting for a retry, keeps it back.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if !task.can_start() {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(Task::is_success)
                            .unwrap_or(false)
                    });
                deps_satisfied.then(|| task.id.clone())
            })
            .collect()
    }

    /// Mark every transitive dependent of `id` that has not settled as
    /// `Skipped`. Returns the ids that changed, closest first.
    pub fn skip_dependents(&mut self, id: &TaskId, reason: &str) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };

        let mut skipped = Vec::new();
        let mut stack: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .collect();

        while let Some(index) = stack.pop() {
            let Some(task) = self.graph.node_weight_mut(index) else {
                continue;
            };
            if task.is_settled() {
                continue;
            }
            task.skip(reason);
            skipped.push(task.id.clone());
            stack.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
        }

        skipped
    }

    /// Mark a task and its dependents `Skipped` before it ever ran.
    pub fn skip_task(&mut self, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        if task.is_settled() {
            return Ok(Vec::new());
        }
        task.skip(reason);
        let mut skipped = vec![id.clone()];
        skipped.extend(self.skip_dependents(id, reason));
        Ok(skipped)
    }

    /// Snapshot of all tasks in insertion order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.graph.node_weights().cloned().collect()
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
