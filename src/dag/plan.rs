// src/dag/plan.rs

//! Per-run job state machine.
//!
//! [`JobPlan`] is pure: it decides which job runs next and which jobs are
//! skipped, and is unit tested without Tokio, plugins or stores. The worker
//! drives it one job at a time because the plugin protocol executes a
//! single job per client.

use std::collections::HashMap;

use tracing::debug;

use crate::dag::graph::JobGraph;
use crate::domain::{JobDescriptor, JobStatus};
use crate::errors::Result;

/// Per-run state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting on dependencies or on its turn.
    Pending,
    /// Handed to the plugin.
    Running,
    /// Finished with a per-job result.
    Done(JobStatus),
}

/// What the worker should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// Execute this job through the plugin.
    Run(String),
    /// The job was marked `Skipped`; `reason` is recorded with it.
    Skip { job: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    graph: JobGraph,
    /// Execution order: declared order, stably sorted by job priority.
    order: Vec<JobDescriptor>,
    states: HashMap<String, JobState>,
    /// First job that failed in this run, if any.
    first_failure: Option<String>,
}

impl JobPlan {
    /// Validate the declared jobs and build a plan for one run.
    pub fn new(jobs: Vec<JobDescriptor>) -> Result<Self> {
        let graph = JobGraph::from_descriptors(&jobs)?;

        let mut order = jobs;
        order.sort_by_key(|j| j.priority.unwrap_or(0));

        let states = order
            .iter()
            .map(|j| (j.name.clone(), JobState::Pending))
            .collect();

        Ok(Self {
            graph,
            order,
            states,
            first_failure: None,
        })
    }

    /// Job names in execution order.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|j| j.name.as_str())
    }

    pub fn state_of(&self, job: &str) -> Option<JobState> {
        self.states.get(job).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, JobState::Done(_)))
    }

    /// Whether every job finished with `Success`.
    pub fn all_succeeded(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, JobState::Done(JobStatus::Success)))
    }

    /// Pick the next step.
    ///
    /// Scans jobs in execution order for the first pending job whose
    /// dependencies are all terminal:
    /// - any dependency that did not succeed skips the job;
    /// - after a failure, jobs not marked independent are skipped;
    /// - otherwise the job is marked `Running` and returned.
    ///
    /// Returns `None` once every job is terminal, or while a job is still
    /// running (callers complete it first).
    pub fn next_step(&mut self) -> Option<PlanStep> {
        if self.states.values().any(|s| *s == JobState::Running) {
            return None;
        }

        let candidate = self.order.iter().find(|job| {
            self.states.get(&job.name) == Some(&JobState::Pending)
                && self
                    .graph
                    .dependencies_of(&job.name)
                    .iter()
                    .all(|dep| matches!(self.states.get(dep), Some(JobState::Done(_))))
        })?;

        let name = candidate.name.clone();
        let independent = candidate.independent;

        let unmet = self
            .graph
            .dependencies_of(&name)
            .iter()
            .find(|dep| self.states.get(*dep) != Some(&JobState::Done(JobStatus::Success)))
            .cloned();

        let skip_reason = match (unmet, &self.first_failure) {
            (Some(dep), _) => Some(format!("dependency '{dep}' did not succeed")),
            (None, Some(failed)) if !independent => {
                Some(format!("skipped after job '{failed}' failed"))
            }
            _ => None,
        };

        match skip_reason {
            Some(reason) => {
                debug!(job = %name, %reason, "skipping job");
                self.states
                    .insert(name.clone(), JobState::Done(JobStatus::Skipped));
                Some(PlanStep::Skip { job: name, reason })
            }
            None => {
                self.states.insert(name.clone(), JobState::Running);
                Some(PlanStep::Run(name))
            }
        }
    }

    /// First job that failed in this run, if any.
    pub fn first_failure(&self) -> Option<&str> {
        self.first_failure.as_deref()
    }

    /// Record the result of the running job.
    pub fn complete(&mut self, job: &str, status: JobStatus) {
        if let Some(state) = self.states.get_mut(job) {
            *state = JobState::Done(status);
            if status == JobStatus::Failed && self.first_failure.is_none() {
                self.first_failure = Some(job.to_string());
            }
        }
    }

    /// Mark every job that has not finished as skipped (the run is being
    /// torn down) and return their names in execution order.
    pub fn skip_remaining(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        for job in &self.order {
            if let Some(state) = self.states.get_mut(&job.name) {
                if !matches!(state, JobState::Done(_)) {
                    *state = JobState::Done(JobStatus::Skipped);
                    skipped.push(job.name.clone());
                }
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_deploy() -> Vec<JobDescriptor> {
        vec![
            JobDescriptor::new("build"),
            JobDescriptor::new("test").depends_on("build"),
            JobDescriptor::new("deploy").depends_on("test"),
        ]
    }

    /// Drive a plan to completion, failing the named jobs.
    fn drive(plan: &mut JobPlan, failing: &[&str]) -> Vec<(String, JobStatus)> {
        let mut log = Vec::new();
        while let Some(step) = plan.next_step() {
            match step {
                PlanStep::Run(job) => {
                    let status = if failing.contains(&job.as_str()) {
                        JobStatus::Failed
                    } else {
                        JobStatus::Success
                    };
                    plan.complete(&job, status);
                    log.push((job, status));
                }
                PlanStep::Skip { job, .. } => log.push((job, JobStatus::Skipped)),
            }
        }
        log
    }

    #[test]
    fn runs_chain_in_order() {
        let mut plan = JobPlan::new(build_test_deploy()).unwrap();
        let log = drive(&mut plan, &[]);
        assert_eq!(
            log,
            vec![
                ("build".to_string(), JobStatus::Success),
                ("test".to_string(), JobStatus::Success),
                ("deploy".to_string(), JobStatus::Success),
            ]
        );
        assert!(plan.is_finished());
        assert!(plan.all_succeeded());
    }

    #[test]
    fn failed_build_skips_dependents() {
        let mut plan = JobPlan::new(build_test_deploy()).unwrap();
        let log = drive(&mut plan, &["build"]);
        assert_eq!(
            log,
            vec![
                ("build".to_string(), JobStatus::Failed),
                ("test".to_string(), JobStatus::Skipped),
                ("deploy".to_string(), JobStatus::Skipped),
            ]
        );
        assert!(!plan.all_succeeded());
    }

    #[test]
    fn dependency_declared_later_still_runs_first() {
        let mut plan = JobPlan::new(vec![
            JobDescriptor::new("test").depends_on("build"),
            JobDescriptor::new("build"),
        ])
        .unwrap();
        let order: Vec<_> = drive(&mut plan, &[]).into_iter().map(|(j, _)| j).collect();
        assert_eq!(order, vec!["build", "test"]);
    }

    #[test]
    fn failure_halts_unrelated_jobs_unless_independent() {
        let mut plan = JobPlan::new(vec![
            JobDescriptor::new("lint"),
            JobDescriptor::new("docs"),
            JobDescriptor::new("notify").independent(),
        ])
        .unwrap();
        let log = drive(&mut plan, &["lint"]);
        assert_eq!(
            log,
            vec![
                ("lint".to_string(), JobStatus::Failed),
                ("docs".to_string(), JobStatus::Skipped),
                ("notify".to_string(), JobStatus::Success),
            ]
        );
    }

    #[test]
    fn independent_job_with_failed_dependency_is_still_skipped() {
        let mut plan = JobPlan::new(vec![
            JobDescriptor::new("build"),
            JobDescriptor::new("report").depends_on("build").independent(),
        ])
        .unwrap();
        let log = drive(&mut plan, &["build"]);
        assert_eq!(log[1], ("report".to_string(), JobStatus::Skipped));
    }

    #[test]
    fn priority_reorders_but_ties_keep_declared_order() {
        let mut plan = JobPlan::new(vec![
            JobDescriptor::new("c").with_priority(10),
            JobDescriptor::new("a"),
            JobDescriptor::new("b"),
            JobDescriptor::new("first").with_priority(-1),
        ])
        .unwrap();
        let order: Vec<_> = plan.job_names().map(str::to_string).collect();
        assert_eq!(order, vec!["first", "a", "b", "c"]);
        let ran: Vec<_> = drive(&mut plan, &[]).into_iter().map(|(j, _)| j).collect();
        assert_eq!(ran, order);
    }

    #[test]
    fn nothing_new_while_a_job_is_running() {
        let mut plan = JobPlan::new(vec![JobDescriptor::new("a"), JobDescriptor::new("b")]).unwrap();
        assert_eq!(plan.next_step(), Some(PlanStep::Run("a".to_string())));
        assert_eq!(plan.next_step(), None);
        assert_eq!(plan.state_of("a"), Some(JobState::Running));
    }

    #[test]
    fn skip_remaining_marks_unfinished_jobs() {
        let mut plan = JobPlan::new(build_test_deploy()).unwrap();
        assert_eq!(plan.next_step(), Some(PlanStep::Run("build".to_string())));
        let skipped = plan.skip_remaining();
        assert_eq!(skipped, vec!["build", "test", "deploy"]);
        assert!(plan.is_finished());
    }
}
