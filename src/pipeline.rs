use std::collections::HashSet;
use std::time::Instant;

use camino::Utf8PathBuf;
use console::style;

use crate::blueprint::{Blueprint, Schedule};
use crate::cache::{CacheStore, DIR_CACHE};
use crate::core::{Category, Environment};
use crate::engine::{BuildReport, Executor, Runtime};
use crate::error::{ConfigError, TsumugiError};
use crate::graph::TaskGraph;
use crate::transform::TransformRegistry;
use crate::utils::as_overhead;
use crate::watch::Classifier;

/// Where the sources of a front-end project live and where the build goes.
///
/// The default is the classic layout: everything under `src/`, built into
/// `assets/`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub html: Vec<String>,
    pub styles: Vec<String>,
    pub scripts: Vec<String>,
    pub images: Vec<String>,
    pub public: Vec<String>,
    pub output: Utf8PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            html: vec!["src/**/*.html".into()],
            styles: vec![
                "src/styles/**/*.css".into(),
                "src/styles/**/*.scss".into(),
                "src/styles/**/*.less".into(),
            ],
            scripts: vec!["src/scripts/**/*.js".into()],
            images: vec![
                "src/images/**/*.jpg".into(),
                "src/images/**/*.jpeg".into(),
                "src/images/**/*.png".into(),
            ],
            public: vec!["src/public/**/*".into()],
            output: "assets".into(),
        }
    }
}

impl Paths {
    fn out(&self, name: &str) -> Utf8PathBuf {
        self.output.join(name)
    }

    /// Classifier for the watcher, one rule per source glob.
    pub fn classifier(&self) -> Result<Classifier, glob::PatternError> {
        let groups = [
            (Category::Style, &self.styles),
            (Category::Script, &self.scripts),
            (Category::Image, &self.images),
            (Category::Public, &self.public),
            (Category::Markup, &self.html),
        ];

        let mut classifier = Classifier::new();
        for (category, globs) in groups {
            for glob in globs {
                classifier = classifier.rule(category, glob)?;
            }
        }

        Ok(classifier)
    }
}

/// The stock front-end build:
///
/// ```text
/// clean -> (styles | scripts | public | images) -> html
/// ```
///
/// `clean` empties the output directory but keeps optimised images, which
/// are expensive to produce. Pages are copied last because they are written
/// to the root of the output directory, which contains everything else.
pub fn frontend(paths: &Paths) -> Result<TaskGraph, ConfigError> {
    let mut blueprint = Blueprint::new();

    let images_out = paths.out("images");
    let clean = blueprint
        .clean("clean")
        .remove(format!("{}/**/*", paths.output))
        .keep(images_out.to_string())
        .keep(format!("{images_out}/**/*"))
        .register()?;

    let mut assets = |name: &str, category: Category, globs: &[String], output: Utf8PathBuf| {
        let mut def = blueprint.assets(name, category).output(output);
        for glob in globs {
            def = def.source(glob);
        }
        def.register()
    };

    let styles = assets("styles", Category::Style, &paths.styles, paths.out("styles"))?;
    let scripts = assets("scripts", Category::Script, &paths.scripts, paths.out("scripts"))?;
    let public = assets("public", Category::Public, &paths.public, paths.out("public"))?;
    let images = assets("images", Category::Image, &paths.images, images_out.clone())?;
    let html = assets("html", Category::Markup, &paths.html, paths.output.clone())?;

    blueprint.compose(Schedule::series([
        Schedule::task(clean),
        Schedule::parallel([styles, scripts, public, images]),
        Schedule::task(html),
    ]))?;

    blueprint.finish()
}

/// A task graph together with everything needed to run it.
pub struct Pipeline {
    graph: TaskGraph,
    env: Environment,
    registry: TransformRegistry,
    cache: Option<CacheStore>,
    executor: Executor,
    classifier: Classifier,
    serve_dir: Utf8PathBuf,
}

impl Pipeline {
    /// Uses the stock transforms for the environment's mode and the on-disk
    /// cache under the project root.
    pub fn new(graph: TaskGraph, env: Environment) -> Self {
        let cache = match CacheStore::open(env.resolve(DIR_CACHE)) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!("couldn't open the cache, using a memory one: {e}");
                CacheStore::in_memory()
            }
        };

        Self {
            registry: TransformRegistry::with_defaults(env.mode),
            serve_dir: env.root.clone(),
            cache: Some(cache),
            executor: Executor::new(),
            classifier: Classifier::new(),
            graph,
            env,
        }
    }

    /// The stock front-end build, see [`frontend`].
    pub fn frontend(env: Environment, paths: &Paths) -> Result<Self, TsumugiError> {
        let graph = frontend(paths)?;
        let classifier = paths.classifier()?;
        let serve_dir = env.resolve(&paths.output);

        Ok(Self::new(graph, env)
            .with_classifier(classifier)
            .with_serve_dir(serve_dir))
    }

    pub fn with_registry(mut self, registry: TransformRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut TransformRegistry {
        &mut self.registry
    }

    /// `None` turns caching off.
    pub fn with_cache(mut self, cache: Option<CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// Decides which changed paths serve mode reacts to.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Directory served over HTTP in serve mode.
    pub fn with_serve_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.serve_dir = dir.into();
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    fn runtime(&self) -> Runtime<'_> {
        Runtime {
            env: &self.env,
            registry: &self.registry,
            cache: self.cache.as_ref(),
            deleted: &[],
        }
    }

    /// Runs the whole graph once.
    pub fn build(&self) -> BuildReport {
        eprintln!(
            "Running {} in {} mode.",
            style("tsumugi").red(),
            style("build").blue()
        );

        let s = Instant::now();
        let report = self.executor.execute(&self.graph, self.runtime(), None);
        log_summary(&report, s);

        if let Some(cache) = &self.cache {
            let stats = cache.stats();
            tracing::debug!(
                "cache: {} hit(s), {} miss(es), {} write(s)",
                stats.hits,
                stats.misses,
                stats.writes
            );
        }

        report
    }

    /// Runs only the task named `clean`.
    pub fn clean(&self) -> Result<BuildReport, ConfigError> {
        let task = self
            .graph
            .find("clean")
            .ok_or_else(|| ConfigError::UnknownTask("clean".into()))?;

        let s = Instant::now();
        let report = self
            .executor
            .execute(&self.graph, self.runtime(), Some(&HashSet::from([task])));
        log_summary(&report, s);

        Ok(report)
    }

    /// Builds once, then keeps rebuilding whatever the changes touch and
    /// tells the browser about it. Returns only if the watcher stops.
    #[cfg(feature = "live")]
    pub fn serve(mut self) -> Result<(), TsumugiError> {
        use std::sync::mpsc::channel;

        use crate::engine::IncrementalScheduler;
        use crate::reload::{ReloadNotifier, WebSocketTransport};
        use crate::watch::Watcher;

        eprintln!(
            "Running {} in {} mode.",
            style("tsumugi").red(),
            style("serve").blue()
        );

        let transport = WebSocketTransport::bind()?;
        self.env.mode = crate::core::Mode::Serve;
        self.env.port = Some(transport.port());

        if let Some(script) = self.env.get_refresh_script() {
            self.registry.inject_script(Category::Markup, &script);
        }

        tracing::info!("running initial build...");
        let s = Instant::now();
        let report = self.executor.execute(&self.graph, self.runtime(), None);
        log_summary(&report, s);

        let notifier = ReloadNotifier::new().with_transport(transport);

        let (tx, rx) = channel();
        let _watch = Watcher::new(&self.env.root, self.classifier.clone())?.watch(move |set| {
            // The receiver only goes away when serve returns.
            let _ = tx.send(set);
        })?;

        #[cfg(feature = "server")]
        let _thread_http = crate::http::start(self.serve_dir.clone(), 8080);

        tracing::info!("initial build completed, now watching for changes...");

        let mut scheduler = IncrementalScheduler::new(&self.graph, &self.executor, self.runtime())
            .with_notifier(&notifier);
        scheduler.run(&rx);

        Ok(())
    }
}

fn log_summary(report: &BuildReport, s: Instant) {
    for failure in report.failures() {
        tracing::error!("{} failed:\n{:#}", failure.task, failure.cause);
    }

    tracing::info!(
        "{} succeeded, {} failed, {} skipped {}",
        report.succeeded(),
        report.failed(),
        report.skipped(),
        as_overhead(s)
    );
}
