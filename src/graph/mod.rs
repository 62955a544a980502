//! Task graph: the DAG of sub-tasks forming a single job's plan.
//!
//! Insertion order is tracked so that topological ordering and batch
//! decomposition are deterministic across runs.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    models::{Task, TaskStatus},
    ConductorError, Result,
};

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
    /// Task ids in the order they were added; tie-break for ordering.
    insertion_order: Vec<String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from an existing task map (e.g. a job loaded from the
    /// store). Iteration order of the map is not meaningful, so ids are
    /// sorted to keep derived orderings stable.
    pub fn from_tasks(tasks: &HashMap<String, Task>) -> Self {
        let mut insertion_order: Vec<String> = tasks.keys().cloned().collect();
        insertion_order.sort();
        Self {
            tasks: tasks.clone(),
            insertion_order,
        }
    }

    /// Add a task. Every id named in `depends_on` must already be present.
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(ConductorError::Graph(format!(
                "Duplicate task id: {}",
                task.id
            )));
        }
        for dep in &task.depends_on {
            if !self.tasks.contains_key(dep) {
                return Err(ConductorError::Graph(format!(
                    "Dependency {dep} not found in task graph"
                )));
            }
        }
        self.insertion_order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn into_tasks(self) -> HashMap<String, Task> {
        self.tasks
    }

    pub fn tasks(&self) -> &HashMap<String, Task> {
        &self.tasks
    }

    /// Depth-first cycle detection with white/gray/black marking.
    ///
    /// Reports the task id on the back edge when a cycle exists. `add`
    /// cannot introduce cycles on its own (dependencies must pre-exist),
    /// but graphs deserialized from external input are validated here.
    pub fn validate(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks: HashMap<&str, Mark> =
            self.tasks.keys().map(|id| (id.as_str(), Mark::White)).collect();

        fn visit<'a>(
            id: &'a str,
            tasks: &'a HashMap<String, Task>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<()> {
            marks.insert(id, Mark::Gray);
            if let Some(task) = tasks.get(id) {
                for dep in &task.depends_on {
                    match marks.get(dep.as_str()).copied() {
                        Some(Mark::Gray) => {
                            return Err(ConductorError::Graph(format!(
                                "Cycle detected in task graph involving task {id}"
                            )))
                        }
                        Some(Mark::White) => visit(dep, tasks, marks)?,
                        Some(Mark::Black) => {}
                        None => {
                            return Err(ConductorError::Graph(format!(
                                "Dependency {dep} not found in task graph"
                            )))
                        }
                    }
                }
            }
            marks.insert(id, Mark::Black);
            Ok(())
        }

        for id in &self.insertion_order {
            if marks.get(id.as_str()) == Some(&Mark::White) {
                visit(id.as_str(), &self.tasks, &mut marks)?;
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; ties broken by insertion order.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.insertion_order {
            in_degree.insert(id.as_str(), 0);
        }
        for id in &self.insertion_order {
            let task = &self.tasks[id];
            for dep in &task.depends_on {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
            }
        }

        let mut ready: VecDeque<&str> = self
            .insertion_order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            // Collect newly-freed dependents in insertion order before
            // queueing so the tie-break holds.
            let mut freed: Vec<&str> = Vec::new();
            for dependent in dependents.get(id).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).expect("known task");
                *degree -= 1;
                if *degree == 0 {
                    freed.push(dependent);
                }
            }
            freed.sort_by_key(|d| self.insertion_order.iter().position(|i| i == d));
            ready.extend(freed);
        }

        if order.len() != self.tasks.len() {
            return Err(ConductorError::Graph("Cycle detected in task graph".into()));
        }
        Ok(order)
    }

    /// Level-based BFS decomposition: each batch contains the tasks that
    /// become ready simultaneously once the previous batch is done.
    pub fn parallel_batches(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for id in &self.insertion_order {
            in_degree.insert(id.as_str(), 0);
        }
        for id in &self.insertion_order {
            for dep in &self.tasks[id].depends_on {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
            }
        }

        let mut batches: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<&str> = self
            .insertion_order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        while !current.is_empty() {
            batches.push(current.iter().map(|s| s.to_string()).collect());
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                for dependent in dependents.get(*id).into_iter().flatten() {
                    let degree = in_degree.get_mut(dependent).expect("known task");
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_by_key(|d| self.insertion_order.iter().position(|i| i == d));
            current = next;
        }

        Ok(batches)
    }

    /// Ids of tasks that are `pending` with every dependency `done`.
    pub fn ready_tasks(tasks: &HashMap<String, Task>) -> Vec<String> {
        let mut ready: Vec<String> = tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task
                        .depends_on
                        .iter()
                        .all(|dep| tasks.get(dep).map(|d| d.status) == Some(TaskStatus::Done))
            })
            .map(|task| task.id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Ids of pending tasks with at least one dependency that failed or was
    /// itself pruned. These will never become ready and are skipped.
    pub fn prunable_tasks(tasks: &HashMap<String, Task>) -> Vec<String> {
        let mut pruned: HashSet<String> = tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
            .map(|t| t.id.clone())
            .collect();

        // Propagate transitively until fixpoint.
        loop {
            let next: Vec<String> = tasks
                .values()
                .filter(|task| {
                    task.status == TaskStatus::Pending
                        && !pruned.contains(&task.id)
                        && task.depends_on.iter().any(|dep| pruned.contains(dep))
                })
                .map(|task| task.id.clone())
                .collect();
            if next.is_empty() {
                break;
            }
            pruned.extend(next);
        }

        let mut result: Vec<String> = pruned
            .into_iter()
            .filter(|id| tasks.get(id).map(|t| t.status) == Some(TaskStatus::Pending))
            .collect();
        result.sort();
        result
    }
}
