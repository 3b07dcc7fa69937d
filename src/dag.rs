// src/dag.rs

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    future::Future,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};

/// One node of a pipeline graph: a task id and the tasks it waits on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    pub id: &'static str,
    pub upstream: Vec<&'static str>,
}

impl TaskSpec {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            upstream: Vec::new(),
        }
    }

    pub fn after(mut self, upstream: &[&'static str]) -> Self {
        self.upstream.extend_from_slice(upstream);
        self
    }
}

/// Scheduling surface of one pipeline, as consumed by the host scheduler.
#[derive(Clone, Debug, Serialize)]
pub struct DagDefinition {
    pub dag_id: &'static str,
    /// Cron expression.
    pub schedule: &'static str,
    #[serde(rename = "dagrun_timeout_secs", serialize_with = "as_secs")]
    pub timeout: Duration,
    pub tags: Vec<&'static str>,
    pub email: Vec<&'static str>,
    pub email_on_failure: bool,
    pub catchup: bool,
    pub tasks: Vec<TaskSpec>,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl DagDefinition {
    /// Check ids are unique, every upstream exists and the graph is acyclic.
    /// Returns the task ids in a deterministic topological order.
    pub fn validate(&self) -> Result<Vec<&'static str>> {
        let mut by_id: HashMap<&str, &TaskSpec> = HashMap::new();
        for task in &self.tasks {
            if by_id.insert(task.id, task).is_some() {
                bail!("dag {}: duplicate task id `{}`", self.dag_id, task.id);
            }
        }
        for task in &self.tasks {
            for up in &task.upstream {
                if !by_id.contains_key(up) {
                    bail!(
                        "dag {}: task `{}` depends on unknown task `{}`",
                        self.dag_id,
                        task.id,
                        up
                    );
                }
            }
        }

        fn visit(
            node: &'static str,
            by_id: &HashMap<&str, &TaskSpec>,
            visited: &mut HashSet<&'static str>,
            in_progress: &mut Vec<&'static str>,
            order: &mut Vec<&'static str>,
        ) -> Result<()> {
            if visited.contains(node) {
                return Ok(());
            }
            if in_progress.contains(&node) {
                in_progress.push(node);
                bail!("cycle detected: {}", in_progress.join(" -> "));
            }
            in_progress.push(node);
            if let Some(spec) = by_id.get(node) {
                for up in &spec.upstream {
                    visit(*up, by_id, visited, in_progress, order)?;
                }
            }
            in_progress.pop();
            visited.insert(node);
            order.push(node);
            Ok(())
        }

        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut in_progress = Vec::new();
            visit(task.id, &by_id, &mut visited, &mut in_progress, &mut order)
                .with_context(|| format!("validating dag {}", self.dag_id))?;
        }
        Ok(order)
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Execution ledger for one run of a DAG. Tasks are awaited in sequence and
/// each one may only start once all of its upstream tasks have completed.
pub struct TaskRun<'a> {
    dag: &'a DagDefinition,
    done: BTreeSet<&'static str>,
    started: Instant,
}

impl<'a> TaskRun<'a> {
    pub fn new(dag: &'a DagDefinition) -> Result<Self> {
        dag.validate()?;
        info!(dag = dag.dag_id, tasks = dag.tasks.len(), "dag run start");
        Ok(Self {
            dag,
            done: BTreeSet::new(),
            started: Instant::now(),
        })
    }

    /// Run the task `id`, returning whatever it produces so it can be handed
    /// to the next task.
    pub async fn task<T, F, Fut>(&mut self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let spec = self
            .dag
            .task(id)
            .ok_or_else(|| anyhow!("dag {}: no task `{}`", self.dag.dag_id, id))?;
        if self.done.contains(spec.id) {
            bail!("dag {}: task `{}` already ran", self.dag.dag_id, id);
        }
        if let Some(missing) = spec.upstream.iter().find(|up| !self.done.contains(*up)) {
            bail!(
                "dag {}: task `{}` started before upstream `{}` completed",
                self.dag.dag_id,
                id,
                missing
            );
        }

        let span = info_span!("task", dag = self.dag.dag_id, task = spec.id);
        let start = Instant::now();
        let out = f()
            .instrument(span)
            .await
            .with_context(|| format!("task {} failed", spec.id))?;
        info!(task = spec.id, elapsed = ?start.elapsed(), "task done");
        self.done.insert(spec.id);
        Ok(out)
    }

    pub fn completed(&self) -> Vec<&'static str> {
        self.done.iter().copied().collect()
    }

    /// Close the run. Every declared task must have run.
    pub fn finish(self) -> Result<()> {
        let skipped: Vec<&str> = self
            .dag
            .tasks
            .iter()
            .map(|t| t.id)
            .filter(|id| !self.done.contains(id))
            .collect();
        if !skipped.is_empty() {
            bail!(
                "dag {}: tasks never ran: {}",
                self.dag.dag_id,
                skipped.join(", ")
            );
        }
        info!(dag = self.dag.dag_id, elapsed = ?self.started.elapsed(), "dag run done");
        Ok(())
    }
}
