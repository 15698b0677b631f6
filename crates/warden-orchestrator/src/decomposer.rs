//! Turns a [`JobRequest`] into a [`SubtaskGraph`].
//!
//! Every task in stage `k` depends on every task in stage `k - 1`. Tasks may
//! add extra edges by naming other tasks in `after`. Structural problems are
//! reported as [`WardenError::MalformedJob`] before anything is scheduled.

use crate::graph::SubtaskGraph;
use crate::registry::AgentRegistry;
use crate::types::{ImpactProfile, Job, JobRequest, Subtask};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;
use warden_core::{WardenError, WardenResult};

/// Stateless job decomposer.
pub struct Decomposer;

impl Decomposer {
    /// Build the dependency graph for `job`.
    ///
    /// Fails when the job has no stages, a stage has no tasks, a capability
    /// has no registered agent, an impact magnitude is not finite, a name is
    /// used twice, an `after` reference is unknown, or the resulting graph
    /// has a cycle.
    pub fn decompose(
        job: &Job,
        request: &JobRequest,
        registry: &AgentRegistry,
    ) -> WardenResult<SubtaskGraph> {
        if request.stages.is_empty() {
            return Err(WardenError::MalformedJob("job declares no stages".into()));
        }
        if let Some(i) = request.stages.iter().position(|s| s.tasks.is_empty()) {
            return Err(WardenError::MalformedJob(format!(
                "stage {} declares no tasks",
                i + 1
            )));
        }

        let unknown: BTreeSet<&str> = request
            .stages
            .iter()
            .flat_map(|s| &s.tasks)
            .map(|t| t.capability.as_str())
            .filter(|c| c.trim().is_empty() || !registry.knows_capability(c))
            .collect();
        if !unknown.is_empty() {
            let list: Vec<&str> = unknown.into_iter().collect();
            return Err(WardenError::MalformedJob(format!(
                "no registered agent for capability: {}",
                list.join(", ")
            )));
        }

        check_impact(&request.impact, "job")?;
        for task in request.stages.iter().flat_map(|s| &s.tasks) {
            if let Some(impact) = &task.impact {
                let name = task.name.as_deref().unwrap_or(&task.capability);
                check_impact(impact, &format!("task '{name}'"))?;
            }
        }

        let names = assign_names(request)?;

        let mut ids: HashMap<&str, Uuid> = HashMap::new();
        let mut stage_ids: Vec<Vec<Uuid>> = Vec::with_capacity(request.stages.len());
        let mut subtasks: Vec<Subtask> = Vec::new();

        for (stage_idx, stage) in request.stages.iter().enumerate() {
            let mut this_stage = Vec::with_capacity(stage.tasks.len());
            for (task_idx, task) in stage.tasks.iter().enumerate() {
                let name = &names[stage_idx][task_idx];
                let mut subtask = Subtask::new(job.id, name.clone(), task.capability.clone());
                subtask.input = if task.input.is_null() {
                    job.payload.clone()
                } else {
                    task.input.clone()
                };
                subtask.impact = task.impact.clone().unwrap_or_else(|| job.impact.clone());
                if let Some(previous) = stage_ids.last() {
                    subtask.dependencies.extend(previous.iter().copied());
                }
                ids.insert(name.as_str(), subtask.id);
                this_stage.push(subtask.id);
                subtasks.push(subtask);
            }
            stage_ids.push(this_stage);
        }

        let declared: Vec<(&str, &[String])> = request
            .stages
            .iter()
            .enumerate()
            .flat_map(|(si, s)| {
                let names = &names[si];
                s.tasks
                    .iter()
                    .enumerate()
                    .map(move |(ti, t)| (names[ti].as_str(), t.after.as_slice()))
            })
            .collect();

        for (subtask, (name, after)) in subtasks.iter_mut().zip(declared) {
            for reference in after {
                let Some(dep) = ids.get(reference.as_str()) else {
                    return Err(WardenError::MalformedJob(format!(
                        "task '{name}' refers to unknown task '{reference}'"
                    )));
                };
                if *dep == subtask.id {
                    return Err(WardenError::MalformedJob(format!(
                        "task '{name}' depends on itself"
                    )));
                }
                if !subtask.dependencies.contains(dep) {
                    subtask.dependencies.push(*dep);
                }
            }
        }

        let mut graph = SubtaskGraph::new(job.id);
        for subtask in subtasks {
            graph.add(subtask);
        }
        if graph.has_cycle() {
            return Err(WardenError::MalformedJob(
                "task dependencies form a cycle".into(),
            ));
        }
        Ok(graph)
    }
}

fn check_impact(impact: &ImpactProfile, owner: &str) -> WardenResult<()> {
    if impact.magnitude.is_finite() {
        Ok(())
    } else {
        Err(WardenError::MalformedJob(format!(
            "{owner} impact magnitude must be a finite number, got {}",
            impact.magnitude
        )))
    }
}

/// Explicit names must be unique. Unnamed tasks take their capability as
/// name, suffixed with their position when that would collide.
fn assign_names(request: &JobRequest) -> WardenResult<Vec<Vec<String>>> {
    let mut explicit: BTreeSet<&str> = BTreeSet::new();
    for task in request.stages.iter().flat_map(|s| &s.tasks) {
        if let Some(name) = task.name.as_deref() {
            if name.trim().is_empty() {
                return Err(WardenError::MalformedJob("task name is empty".into()));
            }
            if !explicit.insert(name) {
                return Err(WardenError::MalformedJob(format!(
                    "duplicate task name '{name}'"
                )));
            }
        }
    }

    let mut capability_uses: HashMap<&str, usize> = HashMap::new();
    for task in request.stages.iter().flat_map(|s| &s.tasks) {
        if task.name.is_none() {
            *capability_uses.entry(task.capability.as_str()).or_default() += 1;
        }
    }

    let mut names = Vec::with_capacity(request.stages.len());
    for (si, stage) in request.stages.iter().enumerate() {
        let mut stage_names = Vec::with_capacity(stage.tasks.len());
        for (ti, task) in stage.tasks.iter().enumerate() {
            let name = match &task.name {
                Some(n) => n.clone(),
                None => {
                    let cap = task.capability.as_str();
                    if capability_uses.get(cap) == Some(&1) && !explicit.contains(cap) {
                        cap.to_string()
                    } else {
                        format!("{cap}#{}.{}", si + 1, ti + 1)
                    }
                }
            };
            stage_names.push(name);
        }
        names.push(stage_names);
    }
    Ok(names)
}
