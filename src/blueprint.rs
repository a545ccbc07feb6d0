use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use glob::Pattern;
use petgraph::Graph;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::NodeIndex;

use crate::core::Category;
use crate::engine::TaskContext;
use crate::error::ConfigError;
use crate::graph::{InputGlob, Task, TaskBody, TaskGraph, TaskRef};
use crate::tasks::{AssetJob, CleanJob};

/// The blueprint for an asset build.
///
/// `Blueprint` is used to declare the tasks of a build and the order between
/// them. Tasks are wired either directly, with
/// [`depends_on`](TaskDef::depends_on), or by composing a [`Schedule`] out of
/// series and parallel groups.
///
/// Once configured, [`finish`](Blueprint::finish) validates the whole graph
/// and turns it into a [`TaskGraph`].
///
/// # Example
///
/// ```rust,no_run
/// use tsumugi::{Blueprint, Category, Schedule};
///
/// let mut blueprint = Blueprint::new();
/// let clean = blueprint.clean("clean").remove("dist/**/*").register()?;
/// let styles = blueprint
///     .assets("styles", Category::Style)
///     .source("src/styles/*.scss")
///     .output("dist/styles")
///     .register()?;
///
/// blueprint.compose(Schedule::series([clean, styles]))?;
/// let graph = blueprint.finish()?;
/// # Ok::<(), tsumugi::ConfigError>(())
/// ```
#[derive(Default)]
pub struct Blueprint {
    graph: Graph<Task, ()>,
    names: HashMap<Arc<str>, NodeIndex>,
    scheduled: HashSet<NodeIndex>,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a task with a custom body.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            dependencies: Vec::new(),
            sources: Vec::new(),
            output: None,
        }
    }

    /// Declares a task that runs every file matched by its sources through
    /// the transform registered for `category`.
    pub fn assets(&mut self, name: impl Into<String>, category: Category) -> AssetsDef<'_> {
        AssetsDef {
            def: self.task(name),
            category,
            suffix: None,
        }
    }

    /// Declares a task that deletes previously generated files.
    pub fn clean(&mut self, name: impl Into<String>) -> CleanDef<'_> {
        CleanDef {
            def: self.task(name),
            remove: Vec::new(),
            keep: Vec::new(),
        }
    }

    /// Adds the ordering described by `schedule` to the graph.
    ///
    /// Each task may appear in at most one position across all composed
    /// schedules.
    pub fn compose(&mut self, schedule: impl Into<Schedule>) -> Result<(), ConfigError> {
        let schedule = schedule.into();

        let mut seen = HashSet::new();
        for task in schedule.tasks() {
            if !seen.insert(task.0) || self.scheduled.contains(&task.0) {
                return Err(ConfigError::DuplicateInSchedule(self.name_of(task.0)));
            }
        }

        self.scheduled.extend(seen);
        schedule.link(&mut |from, to| self.add_dependency(from, to));

        Ok(())
    }

    /// Validates the blueprint and freezes it into an executable graph.
    pub fn finish(self) -> Result<TaskGraph, ConfigError> {
        let order = toposort(&self.graph, None)
            .map_err(|cycle| ConfigError::Cycle(self.name_of(cycle.node_id())))?;

        self.check_outputs()?;

        Ok(TaskGraph {
            graph: self.graph,
            names: self.names,
            order,
        })
    }

    fn name_of(&self, index: NodeIndex) -> String {
        self.graph[index].name.to_string()
    }

    fn add_task(&mut self, task: Task) -> Result<TaskRef, ConfigError> {
        if self.names.contains_key(&task.name) {
            return Err(ConfigError::DuplicateTask(task.name.to_string()));
        }

        let name = task.name.clone();
        let dependencies = task.dependencies.clone();
        let index = self.graph.add_node(task);
        self.names.insert(name, index);

        for dependency in dependencies {
            self.graph.update_edge(dependency.0, index, ());
        }

        Ok(TaskRef(index))
    }

    fn add_dependency(&mut self, from: TaskRef, to: TaskRef) {
        self.graph.update_edge(from.0, to.0, ());

        let dependencies = &mut self.graph[to.0].dependencies;
        if !dependencies.contains(&from) {
            dependencies.push(from);
        }
    }

    /// Two tasks may share an output tree only if one is ordered before the
    /// other.
    fn check_outputs(&self) -> Result<(), ConfigError> {
        let outputs: Vec<_> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let output = self.graph[index].output.as_deref()?;
                Some((index, normalize(output)))
            })
            .collect();

        for (i, (a, path_a)) in outputs.iter().enumerate() {
            for (b, path_b) in &outputs[i + 1..] {
                if !(path_a.starts_with(path_b) || path_b.starts_with(path_a)) {
                    continue;
                }

                let ordered = has_path_connecting(&self.graph, *a, *b, None)
                    || has_path_connecting(&self.graph, *b, *a, None);

                if !ordered {
                    let path = if path_a.starts_with(path_b) { path_a } else { path_b };
                    return Err(ConfigError::OverlappingOutputs {
                        first: self.name_of(*a),
                        second: self.name_of(*b),
                        path: path.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    path.components()
        .filter(|component| !matches!(component, Utf8Component::CurDir))
        .collect()
}

fn compile(task: &str, sources: Vec<String>) -> Result<Vec<InputGlob>, ConfigError> {
    sources
        .into_iter()
        .map(|glob| match Pattern::new(&glob) {
            Ok(pattern) => Ok(InputGlob { glob, pattern }),
            Err(source) => Err(ConfigError::Pattern {
                task: task.to_string(),
                glob,
                source,
            }),
        })
        .collect()
}

/// Declaration of a single task.
pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: String,
    dependencies: Vec<TaskRef>,
    sources: Vec<String>,
    output: Option<Utf8PathBuf>,
}

impl<'a> TaskDef<'a> {
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = TaskRef>) -> Self {
        for dependency in dependencies {
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    /// Adds a source glob, relative to the project root.
    pub fn source(mut self, glob: impl Into<String>) -> Self {
        self.sources.push(glob.into());
        self
    }

    /// Sets the output directory, relative to the project root.
    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn run<F>(self, body: F) -> Result<TaskRef, ConfigError>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Arc::new(body))
    }

    fn register(self, body: TaskBody) -> Result<TaskRef, ConfigError> {
        let inputs = compile(&self.name, self.sources)?;

        self.blueprint.add_task(Task {
            name: self.name.into(),
            dependencies: self.dependencies,
            inputs,
            output: self.output,
            body,
        })
    }
}

/// Declaration of an asset task, see [`Blueprint::assets`].
pub struct AssetsDef<'a> {
    def: TaskDef<'a>,
    category: Category,
    suffix: Option<String>,
}

impl<'a> AssetsDef<'a> {
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = TaskRef>) -> Self {
        self.def = self.def.depends_on(dependencies);
        self
    }

    pub fn source(mut self, glob: impl Into<String>) -> Self {
        self.def = self.def.source(glob);
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.def = self.def.output(path);
        self
    }

    /// Inserted between the file stem and the extension of every output,
    /// e.g. `.min` turns `main.css` into `main.min.css`.
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn register(self) -> Result<TaskRef, ConfigError> {
        if self.def.output.is_none() {
            return Err(ConfigError::MissingOutput(self.def.name));
        }

        let job = AssetJob::new(self.category, self.def.sources.clone(), self.suffix);
        self.def.register(Arc::new(move |ctx| job.run(ctx)))
    }
}

/// Declaration of a clean task, see [`Blueprint::clean`].
pub struct CleanDef<'a> {
    def: TaskDef<'a>,
    remove: Vec<String>,
    keep: Vec<String>,
}

impl<'a> CleanDef<'a> {
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = TaskRef>) -> Self {
        self.def = self.def.depends_on(dependencies);
        self
    }

    /// Paths matching this glob are deleted.
    pub fn remove(mut self, glob: impl Into<String>) -> Self {
        self.remove.push(glob.into());
        self
    }

    /// Paths matching this glob survive, even when matched by
    /// [`remove`](CleanDef::remove).
    pub fn keep(mut self, glob: impl Into<String>) -> Self {
        self.keep.push(glob.into());
        self
    }

    pub fn register(self) -> Result<TaskRef, ConfigError> {
        let name = &self.def.name;
        compile(name, self.remove.clone())?;
        let keep = compile(name, self.keep)?
            .into_iter()
            .map(|input| input.pattern)
            .collect();

        let job = CleanJob::new(self.remove, keep);
        self.def.register(Arc::new(move |ctx| job.run(ctx)))
    }
}

/// Ordering between tasks, built from series and parallel groups.
///
/// In a series every entry task of step `n + 1` depends on every exit task
/// of step `n`. Members of a parallel group are not ordered between each
/// other.
#[derive(Debug, Clone)]
pub enum Schedule {
    Task(TaskRef),
    Series(Vec<Schedule>),
    Parallel(Vec<Schedule>),
}

impl Schedule {
    pub fn task(task: TaskRef) -> Self {
        Self::Task(task)
    }

    pub fn series<S: Into<Schedule>>(steps: impl IntoIterator<Item = S>) -> Self {
        Self::Series(steps.into_iter().map(Into::into).collect())
    }

    pub fn parallel<S: Into<Schedule>>(members: impl IntoIterator<Item = S>) -> Self {
        Self::Parallel(members.into_iter().map(Into::into).collect())
    }

    /// Every task mentioned, in the order of appearance.
    pub fn tasks(&self) -> Vec<TaskRef> {
        let mut acc = Vec::new();
        self.collect(&mut acc);
        acc
    }

    fn collect(&self, acc: &mut Vec<TaskRef>) {
        match self {
            Self::Task(task) => acc.push(*task),
            Self::Series(items) | Self::Parallel(items) => {
                for item in items {
                    item.collect(acc);
                }
            }
        }
    }

    /// Tasks that start this schedule.
    fn entries(&self) -> Vec<TaskRef> {
        match self {
            Self::Task(task) => vec![*task],
            Self::Series(steps) => steps
                .iter()
                .map(Schedule::entries)
                .find(|entries| !entries.is_empty())
                .unwrap_or_default(),
            Self::Parallel(members) => members.iter().flat_map(Schedule::entries).collect(),
        }
    }

    /// Tasks that finish this schedule.
    fn exits(&self) -> Vec<TaskRef> {
        match self {
            Self::Task(task) => vec![*task],
            Self::Series(steps) => steps
                .iter()
                .rev()
                .map(Schedule::exits)
                .find(|exits| !exits.is_empty())
                .unwrap_or_default(),
            Self::Parallel(members) => members.iter().flat_map(Schedule::exits).collect(),
        }
    }

    fn link(&self, edge: &mut impl FnMut(TaskRef, TaskRef)) {
        match self {
            Self::Task(_) => {}
            Self::Parallel(members) => {
                for member in members {
                    member.link(edge);
                }
            }
            Self::Series(steps) => {
                let mut previous: Vec<TaskRef> = Vec::new();

                for step in steps {
                    step.link(edge);

                    let entries = step.entries();
                    if entries.is_empty() {
                        continue;
                    }

                    for &from in &previous {
                        for &to in &entries {
                            edge(from, to);
                        }
                    }

                    previous = step.exits();
                }
            }
        }
    }
}

impl From<TaskRef> for Schedule {
    fn from(task: TaskRef) -> Self {
        Self::Task(task)
    }
}
