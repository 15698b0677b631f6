use crate::types::{Subtask, SubtaskStatus};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The dependency graph of one job's subtasks.
///
/// Subtasks are kept in insertion order, which is also the order ready
/// subtasks are handed out in.
#[derive(Debug)]
pub struct SubtaskGraph {
    job_id: Uuid,
    tasks: HashMap<Uuid, Subtask>,
    order: Vec<Uuid>,
    done: HashSet<Uuid>,
}

impl SubtaskGraph {
    /// An empty graph for `job_id`.
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            tasks: HashMap::new(),
            order: Vec::new(),
            done: HashSet::new(),
        }
    }

    /// Owning job.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Add a subtask to the graph.
    pub fn add(&mut self, subtask: Subtask) -> Uuid {
        let id = subtask.id;
        if self.tasks.insert(id, subtask).is_none() {
            self.order.push(id);
        }
        id
    }

    /// Queued subtasks whose dependencies are all done, in insertion order.
    pub fn ready(&self) -> Vec<&Subtask> {
        self.iter().filter(|t| t.is_ready(&self.done)).collect()
    }

    /// Set a subtask's status and return the previous one.
    pub fn set_status(&mut self, id: Uuid, status: SubtaskStatus) -> Option<SubtaskStatus> {
        let task = self.tasks.get_mut(&id)?;
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        if status == SubtaskStatus::Done {
            self.done.insert(id);
        }
        Some(std::mem::replace(&mut task.status, status))
    }

    /// Subtask by id.
    pub fn get(&self, id: Uuid) -> Option<&Subtask> {
        self.tasks.get(&id)
    }

    /// Mutable subtask by id.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Subtask> {
        self.tasks.get_mut(&id)
    }

    /// Look a subtask up by its name within the job.
    pub fn by_name(&self, name: &str) -> Option<&Subtask> {
        self.iter().find(|t| t.name == name)
    }

    /// All subtasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Subtask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Number of subtasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of subtasks in `Done`.
    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    /// Count of subtasks still waiting for dispatch.
    pub fn queued_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == SubtaskStatus::Queued)
            .count()
    }

    /// Every subtask is done.
    pub fn is_complete(&self) -> bool {
        self.done.len() == self.tasks.len()
    }

    /// Every subtask is in a terminal state.
    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// The first subtask (in insertion order) that was rejected or failed.
    pub fn first_failure(&self) -> Option<&Subtask> {
        self.iter().find(|t| {
            matches!(
                t.status,
                SubtaskStatus::Rejected { .. } | SubtaskStatus::Failed { .. }
            )
        })
    }

    /// Subtasks that have not reached a terminal state, dependencies first.
    pub fn unsettled(&self) -> Vec<Uuid> {
        self.topological_order()
            .into_iter()
            .filter(|id| self.tasks.get(id).is_some_and(|t| !t.status.is_terminal()))
            .collect()
    }

    /// Every subtask id with each dependency before its dependents. Ties
    /// keep insertion order.
    pub fn topological_order(&self) -> Vec<Uuid> {
        let mut order = Vec::with_capacity(self.order.len());
        let mut visited = HashSet::with_capacity(self.order.len());
        for &id in &self.order {
            self.visit_post_order(id, &mut visited, &mut order);
        }
        order
    }

    fn visit_post_order(&self, id: Uuid, visited: &mut HashSet<Uuid>, out: &mut Vec<Uuid>) {
        if !visited.insert(id) {
            return;
        }
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        for dep in &task.dependencies {
            self.visit_post_order(*dep, visited, out);
        }
        out.push(id);
    }

    /// Check for cycles in the dependency graph.
    /// Returns true if a cycle is detected.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        self.order
            .iter()
            .any(|&id| self.dfs_cycle(id, &mut visited))
    }

    fn dfs_cycle(&self, id: Uuid, visited: &mut HashMap<Uuid, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}
