pub mod tasks;

pub use tasks::{PipelineState, warehouse_dag};

use async_trait::async_trait;
use common::config::PipelineSettings;
use common::{Error, Result};
use etl::utils::retry::retry_with_backoff;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tracing::{error, info};

/// A unit of work in a [`Dag`], run against shared state `S`.
#[async_trait]
pub trait Task<S>: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, state: &S) -> Result<()>;
}

/// Directed acyclic graph of named tasks.
pub struct Dag<S> {
    name: String,
    tasks: BTreeMap<String, Arc<dyn Task<S>>>,
    upstream: BTreeMap<String, BTreeSet<String>>,
}

impl<S: Send + Sync> Dag<S> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: BTreeMap::new(),
            upstream: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_task(&mut self, task: impl Task<S> + 'static) -> Result<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(Error::Pipeline(format!("Task {} is already defined", name)));
        }
        self.upstream.insert(name.clone(), BTreeSet::new());
        self.tasks.insert(name, Arc::new(task));
        Ok(())
    }

    /// Declares that `downstream` runs after `upstream` succeeded.
    pub fn set_downstream(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        for name in [upstream, downstream] {
            if !self.tasks.contains_key(name) {
                return Err(Error::Pipeline(format!("Unknown task {} in {}", name, self.name)));
            }
        }
        if let Some(deps) = self.upstream.get_mut(downstream) {
            deps.insert(upstream.to_string());
        }
        Ok(())
    }

    /// Every pair `(u, d)` of `upstreams x downstreams` becomes an edge.
    pub fn connect(&mut self, upstreams: &[&str], downstreams: &[&str]) -> Result<()> {
        for upstream in upstreams {
            for downstream in downstreams {
                self.set_downstream(upstream, downstream)?;
            }
        }
        Ok(())
    }

    pub fn upstream_of(&self, task: &str) -> Option<&BTreeSet<String>> {
        self.upstream.get(task)
    }

    /// Topological levels: every task appears after all of its upstreams,
    /// tasks within a level are independent and sorted by name.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut levels = Vec::new();

        while done.len() < self.upstream.len() {
            let ready: Vec<&str> = self
                .upstream
                .iter()
                .filter(|(task, deps)| {
                    !done.contains(task.as_str()) && deps.iter().all(|d| done.contains(d.as_str()))
                })
                .map(|(task, _)| task.as_str())
                .collect();

            if ready.is_empty() {
                let stuck: Vec<&str> = self
                    .upstream
                    .keys()
                    .map(String::as_str)
                    .filter(|task| !done.contains(task))
                    .collect();
                return Err(Error::Pipeline(format!(
                    "Cycle detected in {} among tasks: {}",
                    self.name,
                    stuck.join(", ")
                )));
            }

            done.extend(ready.iter().copied());
            levels.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(levels)
    }

    fn task(&self, name: &str) -> Result<Arc<dyn Task<S>>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Pipeline(format!("Unknown task {} in {}", name, self.name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: String,
    pub level: usize,
    pub attempts: u32,
    pub duration_ms: u128,
    pub status: TaskStatus,
}

/// Runs a [`Dag`] level by level; tasks of one level run concurrently and
/// each is retried with exponential backoff.
pub struct DagRunner {
    retries: u32,
    retry_delay_ms: u64,
}

impl DagRunner {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            retries: settings.retries,
            retry_delay_ms: settings.retry_delay_ms,
        }
    }

    pub async fn run<S: Send + Sync>(&self, dag: &Dag<S>, state: &S) -> Result<Vec<TaskRun>> {
        let levels = dag.levels()?;
        info!(dag = dag.name(), levels = levels.len(), "Starting DAG run");
        let mut runs = Vec::new();

        for (level, names) in levels.iter().enumerate() {
            let tasks = names
                .iter()
                .map(|name| dag.task(name))
                .collect::<Result<Vec<_>>>()?;

            let outcomes = join_all(tasks.iter().map(|task| self.run_task(task.as_ref(), level, state))).await;

            let mut first_error = None;
            for (run, result) in outcomes {
                if let Err(e) = result {
                    error!(dag = dag.name(), task = %run.task, attempts = run.attempts, error = %e, "Task failed");
                    first_error.get_or_insert_with(|| {
                        Error::Pipeline(format!(
                            "Task {} failed after {} attempts: {}",
                            run.task, run.attempts, e
                        ))
                    });
                }
                runs.push(run);
            }

            if let Some(e) = first_error {
                let skipped: Vec<&str> = levels[level + 1..].iter().flatten().map(String::as_str).collect();
                if !skipped.is_empty() {
                    error!(dag = dag.name(), skipped = ?skipped, "Skipping downstream tasks");
                }
                return Err(e);
            }
        }

        info!(dag = dag.name(), tasks = runs.len(), "DAG run succeeded");
        Ok(runs)
    }

    async fn run_task<S: Send + Sync>(
        &self,
        task: &dyn Task<S>,
        level: usize,
        state: &S,
    ) -> (TaskRun, Result<()>) {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        info!(task = task.name(), level, "Running task");

        let result = retry_with_backoff(self.retries, self.retry_delay_ms, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            task.run(state)
        })
        .await;

        let run = TaskRun {
            task: task.name().to_string(),
            level,
            attempts: attempts.load(Ordering::SeqCst),
            duration_ms: started.elapsed().as_millis(),
            status: if result.is_ok() {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Failed
            },
        };
        if result.is_ok() {
            info!(task = %run.task, attempts = run.attempts, duration_ms = run.duration_ms as u64, "Task succeeded");
        }
        (run, result)
    }
}
