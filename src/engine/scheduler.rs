//! Incremental rebuilds driven by file changes.
//!
//! When a [`ChangedSet`] arrives:
//! 1. The graph picks the tasks whose source globs match a changed path,
//!    together with everything downstream of them.
//! 2. Only that subgraph is executed, every other task is reported as
//!    unchanged.
//! 3. The outcome is handed to the [`ReloadNotifier`], which tells connected
//!    browsers to swap stylesheets, reload, or show the error.

use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::engine::executor::{Executor, Runtime};
use crate::engine::report::BuildReport;
use crate::graph::{TaskGraph, TaskRef};
use crate::reload::ReloadNotifier;
use crate::utils::as_overhead;
use crate::watch::ChangedSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduling,
    Running,
}

/// Turns batches of changes into runs of the affected part of the graph.
///
/// Batches that arrive while a run is in progress are merged and handled by
/// a single follow-up run.
pub struct IncrementalScheduler<'a> {
    graph: &'a TaskGraph,
    executor: &'a Executor,
    runtime: Runtime<'a>,
    notifier: Option<&'a ReloadNotifier>,
    state: SchedulerState,
    pending: ChangedSet,
}

impl<'a> IncrementalScheduler<'a> {
    pub fn new(graph: &'a TaskGraph, executor: &'a Executor, runtime: Runtime<'a>) -> Self {
        Self {
            graph,
            executor,
            runtime,
            notifier: None,
            state: SchedulerState::Idle,
            pending: ChangedSet::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: &'a ReloadNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Changes waiting for the next run.
    pub fn pending(&self) -> &ChangedSet {
        &self.pending
    }

    /// Queues a batch, merging it with anything already queued.
    pub fn enqueue(&mut self, changed: ChangedSet) {
        self.pending.merge(changed);
    }

    /// Tasks affected by a batch: those matching a changed path plus their
    /// transitive dependents.
    pub fn select(&self, changed: &ChangedSet) -> HashSet<TaskRef> {
        let dirty = self.graph.matching(changed.paths());
        self.graph.with_dependents(dirty)
    }

    /// Runs whatever is queued. Returns `None` when nothing was queued or no
    /// task is affected.
    pub fn run_pending(&mut self) -> Option<BuildReport> {
        if self.pending.is_empty() {
            return None;
        }

        self.state = SchedulerState::Scheduling;
        let changed = std::mem::take(&mut self.pending);
        let selected = self.select(&changed);

        if selected.is_empty() {
            tracing::debug!("{} change(s) affect no task", changed.len());
            self.state = SchedulerState::Idle;
            return None;
        }

        tracing::info!(
            "change detected, re-running {} task(s)...",
            selected.len()
        );

        let deleted: Vec<Utf8PathBuf> = changed.deleted().map(Utf8Path::to_path_buf).collect();
        let runtime = Runtime {
            deleted: &deleted,
            ..self.runtime
        };

        self.state = SchedulerState::Running;
        let s = Instant::now();
        let report = self.executor.execute(self.graph, runtime, Some(&selected));
        self.state = SchedulerState::Idle;

        if let Some(notifier) = self.notifier {
            if report.is_success() {
                notifier.notify(&changed.categories());
            } else {
                notifier.notify_error(&report);
            }
        }

        tracing::info!("rebuild complete {}, watching for changes...", as_overhead(s));
        Some(report)
    }

    /// Handles batches until the sending side hangs up. Everything that
    /// queued up during a run is merged into the next one.
    pub fn run(&mut self, changes: &Receiver<ChangedSet>) {
        while let Ok(changed) = changes.recv() {
            self.enqueue(changed);

            while let Ok(more) = changes.try_recv() {
                self.enqueue(more);
            }

            self.run_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::*;
    use crate::core::{Category, Environment, Mode};
    use crate::engine::{SkipReason, TaskOutcome};
    use crate::reload::{DevTransport, ReloadMessage};
    use crate::transform::TransformRegistry;
    use crate::watch::{ChangeEvent, ChangeKind};
    use crate::{Blueprint, Schedule};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ReloadMessage>>);

    impl DevTransport for Arc<Recorder> {
        fn send(&self, message: &ReloadMessage) {
            self.0.lock().unwrap().push(message.clone());
        }
    }

    fn event(path: &str, category: Category) -> ChangeEvent {
        ChangeEvent {
            path: Utf8PathBuf::from(path),
            kind: ChangeKind::Modified,
            category,
            time: Instant::now(),
        }
    }

    fn batch(events: impl IntoIterator<Item = ChangeEvent>) -> ChangedSet {
        let mut set = ChangedSet::default();
        for event in events {
            set.push(event);
        }
        set
    }

    struct Fixture {
        graph: TaskGraph,
        runs: Arc<Mutex<Vec<String>>>,
    }

    /// clean -> (styles, scripts, images) -> html
    fn fixture(fail_styles: bool) -> Fixture {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let mut blueprint = Blueprint::new();

        let mut task = |name: &str, source: &str, fail: bool| {
            let runs = runs.clone();
            let mut def = blueprint.task(name);
            if !source.is_empty() {
                def = def.source(source);
            }
            def.run(move |ctx| {
                runs.lock().unwrap().push(ctx.name().to_string());
                if fail {
                    anyhow::bail!("broken stylesheet");
                }
                Ok(())
            })
            .unwrap()
        };

        let clean = task("clean", "", false);
        let styles = task("styles", "src/styles/**/*.scss", fail_styles);
        let scripts = task("scripts", "src/scripts/**/*.js", false);
        let images = task("images", "src/images/**/*", false);
        let html = task("html", "src/**/*.html", false);

        blueprint
            .compose(Schedule::series([
                Schedule::task(clean),
                Schedule::parallel([styles, scripts, images]),
                Schedule::task(html),
            ]))
            .unwrap();

        Fixture {
            graph: blueprint.finish().unwrap(),
            runs,
        }
    }

    #[test]
    fn test_only_affected_tasks_run() {
        let fixture = fixture(false);
        let env = Environment::new(Mode::Serve, "/nonexistent");
        let registry = TransformRegistry::new();
        let executor = Executor::new();
        let runtime = Runtime {
            env: &env,
            registry: &registry,
            cache: None,
            deleted: &[],
        };

        let recorder = Arc::new(Recorder::default());
        let notifier = ReloadNotifier::new().with_transport(recorder.clone());
        let mut scheduler =
            IncrementalScheduler::new(&fixture.graph, &executor, runtime).with_notifier(&notifier);

        scheduler.enqueue(batch([event("src/styles/main.scss", Category::Style)]));
        let report = scheduler.run_pending().unwrap();

        let mut runs = fixture.runs.lock().unwrap().clone();
        runs.sort();
        assert_eq!(runs, ["html", "styles"]);

        for name in ["clean", "scripts", "images"] {
            assert!(matches!(
                report.outcome(name),
                Some(TaskOutcome::Skipped(SkipReason::Unchanged))
            ));
        }
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(*recorder.0.lock().unwrap(), [ReloadMessage::Css]);
    }

    #[test]
    fn test_failure_is_forwarded() {
        let fixture = fixture(true);
        let env = Environment::new(Mode::Serve, "/nonexistent");
        let registry = TransformRegistry::new();
        let executor = Executor::new();
        let runtime = Runtime {
            env: &env,
            registry: &registry,
            cache: None,
            deleted: &[],
        };

        let recorder = Arc::new(Recorder::default());
        let notifier = ReloadNotifier::new().with_transport(recorder.clone());
        let mut scheduler =
            IncrementalScheduler::new(&fixture.graph, &executor, runtime).with_notifier(&notifier);

        scheduler.enqueue(batch([event("src/styles/main.scss", Category::Style)]));
        let report = scheduler.run_pending().unwrap();
        assert!(!report.is_success());

        let messages = recorder.0.lock().unwrap();
        assert!(matches!(
            messages.as_slice(),
            [ReloadMessage::Error { message }] if message.contains("broken stylesheet")
        ));
    }

    #[test]
    fn test_deleted_paths_reach_tasks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut blueprint = Blueprint::new();

        let record = seen.clone();
        blueprint
            .task("styles")
            .source("src/styles/**/*.scss")
            .run(move |ctx| {
                record.lock().unwrap().extend(ctx.deleted.iter().cloned());
                Ok(())
            })
            .unwrap();
        let graph = blueprint.finish().unwrap();

        let env = Environment::new(Mode::Serve, "/nonexistent");
        let registry = TransformRegistry::new();
        let executor = Executor::new();
        let runtime = Runtime {
            env: &env,
            registry: &registry,
            cache: None,
            deleted: &[],
        };
        let mut scheduler = IncrementalScheduler::new(&graph, &executor, runtime);

        let mut gone = event("src/styles/old.scss", Category::Style);
        gone.kind = ChangeKind::Deleted;
        scheduler.enqueue(batch([gone, event("src/styles/main.scss", Category::Style)]));
        assert!(scheduler.run_pending().unwrap().is_success());

        assert_eq!(*seen.lock().unwrap(), [Utf8PathBuf::from("src/styles/old.scss")]);
    }

    #[test]
    fn test_unmatched_change_runs_nothing() {
        let fixture = fixture(false);
        let env = Environment::new(Mode::Serve, "/nonexistent");
        let registry = TransformRegistry::new();
        let executor = Executor::new();
        let runtime = Runtime {
            env: &env,
            registry: &registry,
            cache: None,
            deleted: &[],
        };
        let mut scheduler = IncrementalScheduler::new(&fixture.graph, &executor, runtime);

        assert!(scheduler.run_pending().is_none());

        scheduler.enqueue(batch([event("README.md", Category::Public)]));
        assert!(scheduler.run_pending().is_none());
        assert!(fixture.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_queued_batches_merge_into_one_run() {
        let fixture = fixture(false);
        let env = Environment::new(Mode::Serve, "/nonexistent");
        let registry = TransformRegistry::new();
        let executor = Executor::new();
        let runtime = Runtime {
            env: &env,
            registry: &registry,
            cache: None,
            deleted: &[],
        };

        let recorder = Arc::new(Recorder::default());
        let notifier = ReloadNotifier::new().with_transport(recorder.clone());
        let mut scheduler =
            IncrementalScheduler::new(&fixture.graph, &executor, runtime).with_notifier(&notifier);

        let (tx, rx) = channel();
        tx.send(batch([event("src/styles/main.scss", Category::Style)]))
            .unwrap();
        tx.send(batch([event("src/scripts/app.js", Category::Script)]))
            .unwrap();
        drop(tx);

        scheduler.run(&rx);

        let runs = fixture.runs.lock().unwrap();
        assert_eq!(runs.iter().filter(|name| *name == "html").count(), 1);
        assert_eq!(*recorder.0.lock().unwrap(), [ReloadMessage::Reload]);
    }
}
