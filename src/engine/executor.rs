use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::ThreadPool;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{CacheKey, CacheStore};
use crate::core::{Category, Environment};
use crate::engine::report::{BuildReport, SkipReason, TaskExecution, TaskOutcome};
use crate::error::{TaskFailure, TransformError};
use crate::graph::{Task, TaskGraph, TaskRef};
use crate::transform::TransformRegistry;

/// Shared services handed to every task of a run.
#[derive(Debug, Clone, Copy)]
pub struct Runtime<'a> {
    pub env: &'a Environment,
    pub registry: &'a TransformRegistry,
    /// `None` disables caching, every transform runs.
    pub cache: Option<&'a CacheStore>,
    /// Root-relative sources removed since the previous run.
    pub deleted: &'a [Utf8PathBuf],
}

/// What a task body sees while it runs.
pub struct TaskContext<'a> {
    pub env: &'a Environment,
    pub registry: &'a TransformRegistry,
    pub cache: Option<&'a CacheStore>,
    pub deleted: &'a [Utf8PathBuf],
    pub span: Span,
    task: &'a Task,
}

impl<'a> TaskContext<'a> {
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// The task's output directory, resolved against the project root.
    pub fn output_dir(&self) -> Option<Utf8PathBuf> {
        self.task.output().map(|path| self.env.resolve(path))
    }

    /// Runs the transform registered for `category`, going through the cache
    /// when there is one.
    ///
    /// The cache key combines the identity and version of the transform with
    /// its fingerprint of the input, so a hit is only ever served for
    /// byte-identical work.
    pub fn transform(
        &self,
        category: Category,
        path: &Utf8Path,
        input: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let (Some(cache), Some(transform)) = (self.cache, self.registry.get(category)) else {
            return self.registry.run(category, path, input);
        };

        let fingerprint = transform
            .fingerprint(path, input)
            .map_err(|cause| TransformError::new(category, path, cause))?;

        let lease = cache.acquire(CacheKey::for_transform(transform, fingerprint));
        if let Some(hit) = lease.get() {
            tracing::trace!("cache hit for {path}");
            return Ok(hit);
        }

        let output = self.registry.run(category, path, input)?;
        lease.put(output.clone());
        Ok(output)
    }
}

/// Runs a [`TaskGraph`] on a rayon thread pool.
///
/// Tasks are started as soon as all of their dependencies have succeeded.
/// A failing task never brings the run down: everything downstream of it is
/// skipped, independent branches keep going.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    pool: Option<Arc<ThreadPool>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the number of task bodies running at once. By default the
    /// global rayon pool is used.
    ///
    /// The pool is built here and shared by every run of this executor.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        let limit = limit.max(1);

        self.pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(limit)
            .thread_name(|i| format!("tsumugi-{i}"))
            .build()
        {
            Ok(pool) => Some(Arc::new(pool)),
            Err(e) => {
                tracing::warn!("couldn't build a pool of {limit} threads, using the global one: {e}");
                None
            }
        };
        self
    }

    /// Executes the graph once.
    ///
    /// With `selected` set, only those tasks run. Every other task is reported
    /// as skipped because unchanged and counts as satisfied for its
    /// dependents.
    ///
    /// The algorithm works as follows:
    /// 1. Count, for each task to run, how many of its dependencies also run.
    /// 2. Tasks with a count of zero are ready. A ready task whose
    ///    dependencies didn't all succeed is skipped on the spot, otherwise it
    ///    is spawned on the pool.
    /// 3. The calling thread waits for results on a channel. Each finished
    ///    task decrements the counts of its dependents, which may make them
    ///    ready.
    /// 4. The loop ends when every task has an outcome.
    pub fn execute(
        &self,
        graph: &TaskGraph,
        rt: Runtime<'_>,
        selected: Option<&HashSet<TaskRef>>,
    ) -> BuildReport {
        let nodes_to_run: HashSet<NodeIndex> = match selected {
            Some(selected) => selected.iter().map(|task| task.0).collect(),
            None => graph.graph.node_indices().collect(),
        };

        let mut outcomes: HashMap<NodeIndex, TaskOutcome> = graph
            .graph
            .node_indices()
            .filter(|index| !nodes_to_run.contains(index))
            .map(|index| (index, TaskOutcome::Skipped(SkipReason::Unchanged)))
            .collect();
        let mut execution_times = HashMap::new();

        // Build a map from a dependency to the nodes that depend on it.
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        // A dependency only counts if it's also in the set of nodes to run.
        let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
            .iter()
            .map(|&i| (i, upstream(graph, &nodes_to_run, i).count()))
            .collect();

        let total_tasks = nodes_to_run.len();
        if total_tasks == 0 {
            return BuildReport::new(graph, outcomes, execution_times);
        }

        let root_span = tracing::span!(Level::INFO, "building_tasks");
        root_span.pb_set_length(total_tasks as u64);
        root_span.pb_set_style(&crate::utils::get_style_root());
        root_span.pb_set_message("Building tasks...");
        let _enter = root_span.enter();

        let pb_style = crate::utils::get_style_task();

        scoped(self.pool.as_deref(), |s| {
            let (result_sender, result_receiver) =
                channel::<(NodeIndex, Result<(), TaskFailure>, Instant, Duration)>();

            let spawn_task = |index: NodeIndex| {
                let task = &graph.graph[index];
                let sender = result_sender.clone();
                let pb_style = pb_style.clone();

                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "task", name = task.name());
                    span.pb_set_style(&pb_style);
                    span.pb_set_message(&format!("Running {}", task.name()));
                    let _enter = span.enter();

                    let context = TaskContext {
                        env: rt.env,
                        registry: rt.registry,
                        cache: rt.cache,
                        deleted: rt.deleted,
                        span: span.clone(),
                        task,
                    };

                    let start_time = Instant::now();

                    // A panicking body only ever touches its own output tree,
                    // everything it shares with other tasks is read-only.
                    let result = match catch_unwind(AssertUnwindSafe(|| (task.body)(&context))) {
                        Ok(result) => result,
                        Err(panic) => Err(anyhow::anyhow!(panic_message(panic.as_ref()))),
                    };

                    let result = result.map_err(|cause| TaskFailure {
                        task: task.name().to_string(),
                        cause,
                    });

                    // The receiver outlives every spawned task.
                    let _ = sender.send((index, result, start_time, start_time.elapsed()));
                });
            };

            let mut ready: Vec<NodeIndex> = nodes_to_run
                .iter()
                .copied()
                .filter(|index| dependency_counts.get(index).copied().unwrap_or(0) == 0)
                .collect();
            ready.sort_by_key(|index| std::cmp::Reverse(*index));

            let mut completed_tasks = 0;

            loop {
                while let Some(index) = ready.pop() {
                    let blocked = upstream(graph, &nodes_to_run, index)
                        .any(|dep| !outcomes.get(&dep).is_some_and(TaskOutcome::is_success));

                    if !blocked {
                        spawn_task(index);
                        continue;
                    }

                    tracing::warn!(
                        "skipping {} because a dependency failed",
                        graph.graph[index].name()
                    );
                    outcomes.insert(index, TaskOutcome::Skipped(SkipReason::FailedDependency));
                    completed_tasks += 1;
                    root_span.pb_inc(1);
                    unlock(&dependents, &mut dependency_counts, index, &mut ready);
                }

                if completed_tasks == total_tasks {
                    break;
                }

                // Wait for any task to finish
                let Ok((index, result, start, duration)) = result_receiver.recv() else {
                    break;
                };

                execution_times.insert(index, TaskExecution { start, duration });
                completed_tasks += 1;
                root_span.pb_inc(1);

                let outcome = match result {
                    Ok(()) => TaskOutcome::Succeeded,
                    Err(failure) => {
                        tracing::error!("{failure:#}");

                        if is_barrier(graph, &nodes_to_run, &outcomes, index) {
                            tracing::error!(
                                "every remaining task depends on {}, stopping",
                                graph.graph[index].name()
                            );
                        }

                        TaskOutcome::Failed(failure)
                    }
                };
                outcomes.insert(index, outcome);

                unlock(&dependents, &mut dependency_counts, index, &mut ready);
            }
        });

        tracing::info!("Build complete!");
        BuildReport::new(graph, outcomes, execution_times)
    }
}

/// Runs `op` on the calling thread inside a scope whose spawned jobs go to
/// `pool`, or to the global pool.
fn scoped<'scope, OP, R>(pool: Option<&ThreadPool>, op: OP) -> R
where
    OP: FnOnce(&rayon::Scope<'scope>) -> R,
{
    match pool {
        Some(pool) => pool.in_place_scope(op),
        None => rayon::in_place_scope(op),
    }
}

/// Dependencies of `index` that take part in this run.
fn upstream<'a>(
    graph: &'a TaskGraph,
    nodes_to_run: &'a HashSet<NodeIndex>,
    index: NodeIndex,
) -> impl Iterator<Item = NodeIndex> + 'a {
    graph
        .graph
        .neighbors_directed(index, Direction::Incoming)
        .filter(|dep| nodes_to_run.contains(dep))
}

fn unlock(
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    dependency_counts: &mut HashMap<NodeIndex, usize>,
    completed: NodeIndex,
    ready: &mut Vec<NodeIndex>,
) {
    let Some(dependents) = dependents.get(&completed) else {
        return;
    };

    for index in dependents {
        if let Some(count) = dependency_counts.get_mut(index) {
            *count -= 1;
            if *count == 0 {
                ready.push(*index);
            }
        }
    }
}

/// Whether every task still waiting for an outcome depends on `failed`,
/// which means nothing else can make progress.
fn is_barrier(
    graph: &TaskGraph,
    nodes_to_run: &HashSet<NodeIndex>,
    outcomes: &HashMap<NodeIndex, TaskOutcome>,
    failed: NodeIndex,
) -> bool {
    let downstream = graph.with_dependents([TaskRef(failed)]);
    let mut remaining = nodes_to_run
        .iter()
        .filter(|&&index| index != failed && !outcomes.contains_key(&index))
        .peekable();

    remaining.peek().is_some() && remaining.all(|&index| downstream.contains(&TaskRef(index)))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}
