use std::collections::HashMap;
use std::fmt::{Display, Write};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::error::{TaskFailure, TsumugiError};
use crate::graph::TaskGraph;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Why a task did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not selected for this run, its inputs did not change.
    Unchanged,
    /// A task it depends on failed or was skipped for the same reason.
    FailedDependency,
}

/// Terminal state of a task after one execution of the graph.
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded,
    Failed(TaskFailure),
    Skipped(SkipReason),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct TaskRecord {
    pub name: String,
    pub outcome: TaskOutcome,
    /// Present only for tasks whose body actually ran.
    pub execution: Option<TaskExecution>,
}

/// Per-task outcomes of one execution, in topological order.
#[derive(Debug, Default)]
pub struct BuildReport {
    records: Vec<TaskRecord>,
    index: HashMap<String, usize>,
}

impl BuildReport {
    pub(crate) fn new(
        graph: &TaskGraph,
        mut outcomes: HashMap<NodeIndex, TaskOutcome>,
        mut executions: HashMap<NodeIndex, TaskExecution>,
    ) -> Self {
        let mut report = Self::default();

        for (task, data) in graph.tasks() {
            let outcome = outcomes
                .remove(&task.0)
                .unwrap_or(TaskOutcome::Skipped(SkipReason::Unchanged));

            report.index.insert(data.name().to_string(), report.records.len());
            report.records.push(TaskRecord {
                name: data.name().to_string(),
                outcome,
                execution: executions.remove(&task.0),
            });
        }

        report
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.index.get(task).map(|&i| &self.records[i].outcome)
    }

    /// No task failed. Skipped tasks don't count against success.
    pub fn is_success(&self) -> bool {
        !self.records.iter().any(|r| r.outcome.is_failure())
    }

    /// Turns a failed build into an error carrying the counts.
    pub fn check(&self) -> Result<(), TsumugiError> {
        if self.is_success() {
            return Ok(());
        }

        Err(TsumugiError::Build {
            failed: self.failed(),
            skipped: self.count(|o| matches!(o, TaskOutcome::Skipped(SkipReason::FailedDependency))),
        })
    }

    /// The failures that caused this build to fail. Dependents of a failed
    /// task are skipped rather than failed, so every failure is a root cause.
    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.records.iter().filter_map(|r| match &r.outcome {
            TaskOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    /// Names of the tasks whose body ran, whatever the outcome.
    pub fn executed(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|r| r.execution.is_some())
            .map(|r| r.name.as_str())
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| o.is_success())
    }

    pub fn failed(&self) -> usize {
        self.count(TaskOutcome::is_failure)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by outcome and
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow, or failed
    /// * **Grey**: Skipped after a failed dependency
    /// * **Blue**: Skipped, unchanged
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f, graph);
        f
    }

    fn write_mermaid(&self, f: &mut String, graph: &TaskGraph) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let durations: Vec<f64> = self
            .records
            .iter()
            .filter_map(|r| r.execution.as_ref())
            .map(|e| e.duration.as_secs_f64())
            .collect();

        let min_time = durations.iter().copied().fold(f64::MAX, f64::min);
        let max_time = durations.iter().copied().fold(f64::MIN, f64::max);
        let (min_time, span) = if durations.is_empty() || max_time - min_time < f64::EPSILON {
            (0.0, 1.0)
        } else {
            (min_time, max_time - min_time)
        };

        for (task, data) in graph.tasks() {
            let Some(record) = self.index.get(data.name()).map(|&i| &self.records[i]) else {
                continue;
            };
            let name = record.name.replace('"', "\\\"");

            let (label, color) = match (&record.outcome, &record.execution) {
                (TaskOutcome::Failed(_), _) => ("Failed".to_string(), "#FF6961".to_string()),
                (TaskOutcome::Skipped(SkipReason::FailedDependency), _) => {
                    ("Skipped".to_string(), "#D3D3D3".to_string())
                }
                (TaskOutcome::Skipped(SkipReason::Unchanged), _) | (_, None) => {
                    ("Unchanged".to_string(), "#ADD8E6".to_string())
                }
                (TaskOutcome::Succeeded, Some(exec)) => {
                    // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                    let t = (exec.duration.as_secs_f64() - min_time) / span;
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };
                    (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}00"))
                }
            };

            writeln!(f, "    {:?}[\"{}\\n{}\"]", task.0.index(), name, label)?;
            writeln!(f, "    style {:?} fill:{}", task.0.index(), color)?;
        }

        for edge in graph.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Plain text summary, one line per task, suitable for terminals and for the
/// error overlay in the browser.
impl Display for BuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for record in &self.records {
            match &record.outcome {
                TaskOutcome::Succeeded => match &record.execution {
                    Some(exec) => writeln!(f, "ok      {} ({:.2?})", record.name, exec.duration)?,
                    None => writeln!(f, "ok      {}", record.name)?,
                },
                TaskOutcome::Failed(failure) => {
                    writeln!(f, "failed  {}: {:#}", record.name, failure.cause)?
                }
                TaskOutcome::Skipped(SkipReason::Unchanged) => {
                    writeln!(f, "skipped {} (unchanged)", record.name)?
                }
                TaskOutcome::Skipped(SkipReason::FailedDependency) => {
                    writeln!(f, "skipped {} (failed dependency)", record.name)?
                }
            }
        }

        Ok(())
    }
}
