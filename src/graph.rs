//! The validated task graph.
//!
//! A [`TaskGraph`] is produced by [`Blueprint::finish`](crate::Blueprint::finish)
//! and is immutable afterwards. Nodes are [`Task`]s, an edge `a -> b` means
//! that `b` depends on `a`. Construction guarantees that the graph is acyclic
//! and that tasks which may run concurrently never write to overlapping
//! output directories.

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;

use crate::engine::TaskContext;

/// The body of a task. Receives the execution context and reports failure
/// through `anyhow`.
pub type TaskBody = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A lightweight token identifying a task inside a graph.
///
/// Returned when a task is declared and used to wire dependencies and
/// compose schedules.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef(pub(crate) NodeIndex);

impl Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskRef({})", self.0.index())
    }
}

/// A source glob declared by a task, kept both in its textual form and
/// compiled for matching changed paths.
#[derive(Debug, Clone)]
pub(crate) struct InputGlob {
    pub(crate) glob: String,
    pub(crate) pattern: Pattern,
}

/// A named unit of work.
pub struct Task {
    pub(crate) name: Arc<str>,
    pub(crate) dependencies: Vec<TaskRef>,
    pub(crate) inputs: Vec<InputGlob>,
    pub(crate) output: Option<Utf8PathBuf>,
    pub(crate) body: TaskBody,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks this one waits for, in the order they were declared.
    pub fn dependencies(&self) -> &[TaskRef] {
        &self.dependencies
    }

    /// Source globs, relative to the project root.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|input| input.glob.as_str())
    }

    /// Output directory, relative to the project root.
    pub fn output(&self) -> Option<&Utf8Path> {
        self.output.as_deref()
    }

    /// Whether a root-relative path is matched by any of the source globs.
    pub fn matches(&self, path: &Utf8Path) -> bool {
        self.inputs
            .iter()
            .any(|input| input.pattern.matches_path(path.as_std_path()))
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("inputs", &self.inputs().collect::<Vec<_>>())
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// An acyclic graph of tasks, ready to be executed.
pub struct TaskGraph {
    pub(crate) graph: Graph<Task, ()>,
    pub(crate) names: HashMap<Arc<str>, NodeIndex>,
    pub(crate) order: Vec<NodeIndex>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Looks a task up by its unique name.
    pub fn find(&self, name: &str) -> Option<TaskRef> {
        self.names.get(name).copied().map(TaskRef)
    }

    pub fn task(&self, task: TaskRef) -> &Task {
        &self.graph[task.0]
    }

    /// All tasks in a topological order, dependencies first.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskRef, &Task)> {
        self.order
            .iter()
            .map(|&index| (TaskRef(index), &self.graph[index]))
    }

    /// The given tasks together with everything that transitively depends on
    /// them.
    pub fn with_dependents(&self, tasks: impl IntoIterator<Item = TaskRef>) -> HashSet<TaskRef> {
        let mut closure = HashSet::new();

        for start in tasks {
            let mut dfs = Dfs::new(&self.graph, start.0);
            while let Some(index) = dfs.next(&self.graph) {
                closure.insert(TaskRef(index));
            }
        }

        closure
    }

    /// Tasks whose source globs match any of the root-relative paths.
    pub fn matching<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a Utf8Path>,
    ) -> HashSet<TaskRef> {
        let paths: Vec<_> = paths.into_iter().collect();

        self.tasks()
            .filter(|(_, task)| paths.iter().any(|path| task.matches(path)))
            .map(|(task, _)| task)
            .collect()
    }
}

impl Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tasks().map(|(_, task)| task))
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;

            if let Some(output) = &task.output {
                let output = output.as_str().replace('"', "\\\"");
                writeln!(f, "    {:?} -.-> out{:?}[(\"{}\")]", index.index(), index.index(), output)?;
            }
        }

        for edge in self.graph.raw_edges() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Blueprint;

    fn sample() -> TaskGraph {
        let mut blueprint = Blueprint::new();
        let a = blueprint.task("a").source("src/a/**/*").run(|_| Ok(())).unwrap();
        let b = blueprint
            .task("b")
            .depends_on([a])
            .source("src/b/*.txt")
            .run(|_| Ok(()))
            .unwrap();
        blueprint.task("c").depends_on([b]).run(|_| Ok(())).unwrap();
        blueprint.task("d").run(|_| Ok(())).unwrap();
        blueprint.finish().unwrap()
    }

    #[test]
    fn test_topological_order() {
        let graph = sample();
        let names: Vec<_> = graph.tasks().map(|(_, task)| task.name()).collect();

        let pos = |name| names.iter().position(|n| *n == name).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_dependents_are_transitive() {
        let graph = sample();
        let a = graph.find("a").unwrap();
        let closure = graph.with_dependents([a]);

        let mut names: Vec<_> = closure.iter().map(|&t| graph.task(t).name()).collect();
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_matching() {
        let graph = sample();
        let hit = graph.matching([Utf8Path::new("src/b/x.txt")]);
        assert_eq!(hit, HashSet::from([graph.find("b").unwrap()]));

        let miss = graph.matching([Utf8Path::new("src/b/x.md")]);
        assert!(miss.is_empty());
    }

    #[test]
    fn test_mermaid() {
        let graph = sample();
        let rendered = graph.to_string();
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("[\"a\"]"));
        assert!(rendered.contains("-->"));
    }
}
