//! Turning filesystem events into batches of classified changes.
//!
//! Raw events from `notify` are debounced (250 ms by default), mapped to
//! project-relative paths, classified by glob into a [`Category`], and
//! collapsed so that every path appears at most once per batch:
//!
//! * the last event on a path wins,
//! * except that a create followed by modifications stays a create,
//! * and a delete followed by a create becomes a modification.
//!
//! A rename is a delete of the old path and a create of the new one. Paths
//! that match no category are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::core::Category;

#[cfg(feature = "live")]
pub use live::{WatchHandle, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Net effect of `self` followed by `next` on the same path.
    pub fn then(self, next: Self) -> Self {
        match (self, next) {
            (Self::Created, Self::Modified) => Self::Created,
            (Self::Deleted, Self::Created) => Self::Modified,
            (_, next) => next,
        }
    }
}

/// A single change to a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Relative to the project root.
    pub path: Utf8PathBuf,
    pub kind: ChangeKind,
    pub category: Category,
    pub time: Instant,
}

/// A batch of changes with at most one event per path.
#[derive(Debug, Clone, Default)]
pub struct ChangedSet {
    events: BTreeMap<Utf8PathBuf, ChangeEvent>,
}

impl ChangedSet {
    /// Adds an event, collapsing it with an earlier one on the same path.
    pub fn push(&mut self, event: ChangeEvent) {
        match self.events.get_mut(&event.path) {
            Some(existing) => {
                existing.kind = existing.kind.then(event.kind);
                existing.category = event.category;
                existing.time = event.time;
            }
            None => {
                self.events.insert(event.path.clone(), event);
            }
        }
    }

    /// Folds a later batch into this one.
    pub fn merge(&mut self, later: ChangedSet) {
        for event in later.events.into_values() {
            self.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&ChangeEvent> {
        self.events.get(path.as_ref())
    }

    pub fn events(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.events.keys().map(Utf8PathBuf::as_path)
    }

    /// Paths whose net change in this batch is a removal.
    pub fn deleted(&self) -> impl Iterator<Item = &Utf8Path> {
        self.events
            .values()
            .filter(|event| event.kind == ChangeKind::Deleted)
            .map(|event| event.path.as_path())
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.events.values().map(|event| event.category).collect()
    }

    /// The batch partitioned by category.
    pub fn by_category(&self) -> BTreeMap<Category, Vec<&ChangeEvent>> {
        let mut partitions: BTreeMap<Category, Vec<&ChangeEvent>> = BTreeMap::new();
        for event in self.events.values() {
            partitions.entry(event.category).or_default().push(event);
        }
        partitions
    }
}

impl FromIterator<ChangeEvent> for ChangedSet {
    fn from_iter<T: IntoIterator<Item = ChangeEvent>>(iter: T) -> Self {
        let mut set = Self::default();
        for event in iter {
            set.push(event);
        }
        set
    }
}

/// Maps project-relative paths to categories. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<(Category, Pattern)>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, category: Category, glob: &str) -> Result<Self, glob::PatternError> {
        self.rules.push((category, Pattern::new(glob)?));
        Ok(self)
    }

    pub fn classify(&self, path: &Utf8Path) -> Option<Category> {
        self.rules
            .iter()
            .find(|(_, pattern)| pattern.matches_path(path.as_std_path()))
            .map(|(category, _)| *category)
    }

    pub fn globs(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(_, pattern)| pattern.as_str())
    }

    /// Builds a batch out of absolute paths in event order.
    pub(crate) fn collect(
        &self,
        root: &Utf8Path,
        changes: impl IntoIterator<Item = (PathBuf, ChangeKind, Instant)>,
    ) -> ChangedSet {
        let mut set = ChangedSet::default();

        for (path, kind, time) in changes {
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let Some(category) = self.classify(relative) else {
                continue;
            };

            set.push(ChangeEvent {
                path: relative.to_path_buf(),
                kind,
                category,
                time,
            });
        }

        set
    }
}

#[cfg(feature = "live")]
mod live {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::mpsc::channel;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use camino::{Utf8Path, Utf8PathBuf};
    use notify::event::{ModifyKind, RenameMode};
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};
    use notify_debouncer_full::{Debouncer, RecommendedCache, new_debouncer};

    use super::{ChangeKind, ChangedSet, Classifier};
    use crate::error::WatchError;
    use crate::tasks::glob_base;

    /// Subscribes to changes under the project root.
    pub struct Watcher {
        root: Utf8PathBuf,
        classifier: Classifier,
        debounce: Duration,
    }

    impl Watcher {
        pub fn new(root: impl AsRef<Utf8Path>, classifier: Classifier) -> Result<Self, WatchError> {
            Ok(Self {
                root: root.as_ref().canonicalize_utf8()?,
                classifier,
                debounce: Duration::from_millis(250),
            })
        }

        pub fn with_debounce(mut self, debounce: Duration) -> Self {
            self.debounce = debounce;
            self
        }

        /// Starts watching. Every non-empty batch is passed to `on_changed`
        /// from a background thread, until the handle is dropped.
        pub fn watch<F>(self, mut on_changed: F) -> Result<WatchHandle, WatchError>
        where
            F: FnMut(ChangedSet) + Send + 'static,
        {
            let (tx, rx) = channel();
            let mut debouncer = new_debouncer(self.debounce, None, tx)?;

            let mut watched = HashSet::new();
            for glob in self.classifier.globs() {
                watched.insert(resolve_watch_root(&self.root, glob)?);
            }

            // Collapse watched paths to reduce the number of watches
            for path in collapse_watch_paths(watched) {
                tracing::info!("watching {}", path);
                debouncer.watch(path.as_std_path(), RecursiveMode::Recursive)?;
            }

            let thread = thread::spawn(move || {
                for result in rx {
                    match result {
                        Ok(events) => {
                            let batch = events.iter().flat_map(|de| {
                                changes(&de.event)
                                    .into_iter()
                                    .map(move |(path, kind)| (path, kind, de.time))
                            });

                            let set = self.classifier.collect(&self.root, batch);
                            if !set.is_empty() {
                                tracing::debug!("{} path(s) changed", set.len());
                                on_changed(set);
                            }
                        }
                        Err(errors) => {
                            for e in errors {
                                tracing::error!("watch error: {e:?}");
                            }
                        }
                    }
                }
            });

            Ok(WatchHandle {
                debouncer,
                thread,
            })
        }
    }

    /// Keeps the subscription alive.
    pub struct WatchHandle {
        debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
        thread: JoinHandle<()>,
    }

    impl WatchHandle {
        /// Cancels the subscription and waits for the last batch to be
        /// delivered.
        pub fn stop(self) {
            drop(self.debouncer);
            if self.thread.join().is_err() {
                tracing::error!("watch callback panicked");
            }
        }
    }

    /// What a raw event means for each of the paths it carries.
    pub(super) fn changes(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
        let each = |kind: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
            event
                .paths
                .iter()
                .map(|path| (path.clone(), kind))
                .collect()
        };

        match event.kind {
            EventKind::Create(_) => each(ChangeKind::Created),
            EventKind::Remove(_) => each(ChangeKind::Deleted),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeKind::Deleted),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeKind::Created),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.iter().cloned();
                let mut acc = Vec::new();
                if let Some(from) = paths.next() {
                    acc.push((from, ChangeKind::Deleted));
                }
                if let Some(to) = paths.next() {
                    acc.push((to, ChangeKind::Created));
                }
                acc
            }
            EventKind::Modify(_) => each(ChangeKind::Modified),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }

    /// The directory to watch for a root-relative glob: its static prefix,
    /// or the parent when that prefix names a file. Directories that don't
    /// exist yet are watched through their nearest existing ancestor.
    pub(super) fn resolve_watch_root(root: &Utf8Path, glob: &str) -> Result<Utf8PathBuf, WatchError> {
        let mut path = root.join(glob_base(glob));

        while !path.exists() {
            path = match path.parent() {
                Some(parent) if parent.starts_with(root) => parent.to_path_buf(),
                _ => return Err(WatchError::Resolve(glob.to_string())),
            };
        }

        let path = path.canonicalize_utf8()?;

        if path.is_file() {
            let parent = path.parent().unwrap_or(&path).to_path_buf();
            Ok(parent)
        } else {
            Ok(path)
        }
    }

    /// Reduces a set of paths to the minimal set of watch roots.
    ///
    /// If we watch `/a` and `/a/b`, we only need to watch `/a` because
    /// the watcher is recursive. This function sorts the paths and filters
    /// out any path that is a subdirectory of a previously accepted path.
    pub(super) fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
        let mut paths: Vec<_> = paths.into_iter().collect();
        paths.sort();

        let mut filtered = Vec::new();
        for path in paths {
            if let Some(last) = filtered.last()
                && path.starts_with(last)
            {
                continue;
            }
            filtered.push(path);
        }

        filtered
    }

    #[cfg(test)]
    mod tests {
        use std::fs;

        use notify::event::{CreateKind, DataChange, RemoveKind};

        use super::*;
        use crate::core::Category;

        fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
            (dir, root)
        }

        #[test]
        fn test_concrete_file() {
            let (_dir, root) = tempdir();
            fs::write(root.join("README.md"), "").unwrap();

            let watch = resolve_watch_root(&root, "README.md").unwrap();
            assert_eq!(watch, root);
        }

        #[test]
        fn test_directory_wildcard() {
            let (_dir, root) = tempdir();
            fs::create_dir_all(root.join("src/styles")).unwrap();

            let watch = resolve_watch_root(&root, "src/styles/**/*.scss").unwrap();
            assert_eq!(watch, root.join("src/styles"));
        }

        #[test]
        fn test_missing_directory_uses_ancestor() {
            let (_dir, root) = tempdir();
            fs::create_dir_all(root.join("src")).unwrap();

            let watch = resolve_watch_root(&root, "src/images/**/*").unwrap();
            assert_eq!(watch, root.join("src"));
        }

        #[test]
        fn test_collapse_watch_paths() {
            let mut paths = HashSet::new();
            paths.insert(Utf8PathBuf::from("/a"));
            paths.insert(Utf8PathBuf::from("/a/b"));
            paths.insert(Utf8PathBuf::from("/a/b/c"));
            paths.insert(Utf8PathBuf::from("/b"));
            paths.insert(Utf8PathBuf::from("/c/d"));

            let collapsed = collapse_watch_paths(paths);

            // /a/b and /a/b/c are covered by /a.
            assert_eq!(
                collapsed,
                vec![
                    Utf8PathBuf::from("/a"),
                    Utf8PathBuf::from("/b"),
                    Utf8PathBuf::from("/c/d")
                ]
            );
        }

        #[test]
        fn test_collapse_watch_paths_similar_names() {
            let mut paths = HashSet::new();
            paths.insert(Utf8PathBuf::from("/foo"));
            paths.insert(Utf8PathBuf::from("/foo-bar"));

            // /foo-bar is not a subdirectory of /foo
            assert_eq!(
                collapse_watch_paths(paths),
                vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
            );
        }

        #[test]
        fn test_event_kinds() {
            let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/p/a".into());
            let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path("/p/a".into());
            let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/p/a".into());

            assert_eq!(changes(&create), [(PathBuf::from("/p/a"), ChangeKind::Created)]);
            assert_eq!(changes(&modify), [(PathBuf::from("/p/a"), ChangeKind::Modified)]);
            assert_eq!(changes(&remove), [(PathBuf::from("/p/a"), ChangeKind::Deleted)]);
        }

        #[test]
        fn test_burst_of_writes_is_one_batch() {
            let (_dir, root) = tempdir();
            fs::create_dir_all(root.join("src/styles")).unwrap();

            let classifier = Classifier::new()
                .rule(Category::Style, "src/styles/**/*.css")
                .unwrap();
            let (tx, rx) = channel();
            let handle = Watcher::new(&root, classifier)
                .unwrap()
                .with_debounce(Duration::from_millis(50))
                .watch(move |set| {
                    let _ = tx.send(set);
                })
                .unwrap();

            let file = root.join("src/styles/a.css");
            for color in ["red", "green", "blue"] {
                fs::write(&file, format!("a {{ color: {color}; }}")).unwrap();
            }

            let set = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(set.len(), 1);
            let event = set.get("src/styles/a.css").unwrap();
            assert_eq!(event.category, Category::Style);
            assert_ne!(event.kind, ChangeKind::Deleted);

            assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
            handle.stop();
        }

        #[test]
        fn test_rename_is_delete_and_create() {
            let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path("/p/old.scss".into())
                .add_path("/p/new.scss".into());

            assert_eq!(
                changes(&rename),
                [
                    (PathBuf::from("/p/old.scss"), ChangeKind::Deleted),
                    (PathBuf::from("/p/new.scss"), ChangeKind::Created),
                ]
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new()
            .rule(Category::Style, "src/styles/**/*.scss")
            .unwrap()
            .rule(Category::Markup, "src/**/*.html")
            .unwrap()
    }

    fn at(root: &str, path: &str) -> PathBuf {
        PathBuf::from(format!("{root}/{path}"))
    }

    #[test]
    fn test_create_modify_delete_collapses_to_delete() {
        let now = Instant::now();
        let set = classifier().collect(
            Utf8Path::new("/p"),
            [
                (at("/p", "src/styles/a.scss"), ChangeKind::Created, now),
                (at("/p", "src/styles/a.scss"), ChangeKind::Modified, now),
                (at("/p", "src/styles/a.scss"), ChangeKind::Modified, now),
                (at("/p", "src/styles/a.scss"), ChangeKind::Deleted, now),
            ],
        );

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("src/styles/a.scss").unwrap().kind, ChangeKind::Deleted);
        assert_eq!(set.deleted().collect::<Vec<_>>(), ["src/styles/a.scss"]);
    }

    #[test]
    fn test_collapse_rules() {
        assert_eq!(ChangeKind::Created.then(ChangeKind::Modified), ChangeKind::Created);
        assert_eq!(ChangeKind::Deleted.then(ChangeKind::Created), ChangeKind::Modified);
        assert_eq!(ChangeKind::Modified.then(ChangeKind::Deleted), ChangeKind::Deleted);
        assert_eq!(ChangeKind::Modified.then(ChangeKind::Modified), ChangeKind::Modified);
    }

    #[test]
    fn test_unclassified_paths_are_dropped() {
        let now = Instant::now();
        let set = classifier().collect(
            Utf8Path::new("/p"),
            [
                (at("/p", "README.md"), ChangeKind::Modified, now),
                (at("/elsewhere", "src/index.html"), ChangeKind::Modified, now),
                (at("/p", "src/index.html"), ChangeKind::Modified, now),
            ],
        );

        assert_eq!(
            set.paths().map(Utf8Path::as_str).collect::<Vec<_>>(),
            ["src/index.html"]
        );
    }

    #[test]
    fn test_partition_by_category() {
        let now = Instant::now();
        let set = classifier().collect(
            Utf8Path::new("/p"),
            [
                (at("/p", "src/styles/a.scss"), ChangeKind::Modified, now),
                (at("/p", "src/styles/b.scss"), ChangeKind::Created, now),
                (at("/p", "src/index.html"), ChangeKind::Modified, now),
            ],
        );

        let parts = set.by_category();
        assert_eq!(parts[&Category::Style].len(), 2);
        assert_eq!(parts[&Category::Markup].len(), 1);
        assert_eq!(
            set.categories(),
            BTreeSet::from([Category::Style, Category::Markup])
        );
    }

    #[test]
    fn test_merge_later_batch() {
        let now = Instant::now();
        let event = |kind| ChangeEvent {
            path: "src/styles/a.scss".into(),
            kind,
            category: Category::Style,
            time: now,
        };

        let mut first: ChangedSet = [event(ChangeKind::Deleted)].into_iter().collect();
        let second: ChangedSet = [event(ChangeKind::Created)].into_iter().collect();
        first.merge(second);

        assert_eq!(first.len(), 1);
        assert_eq!(first.get("src/styles/a.scss").unwrap().kind, ChangeKind::Modified);
    }

    #[test]
    fn test_first_rule_wins() {
        let classifier = Classifier::new()
            .rule(Category::Image, "src/images/**/*")
            .unwrap()
            .rule(Category::Public, "src/**/*")
            .unwrap();

        assert_eq!(
            classifier.classify(Utf8Path::new("src/images/a.png")),
            Some(Category::Image)
        );
        assert_eq!(
            classifier.classify(Utf8Path::new("src/robots.txt")),
            Some(Category::Public)
        );
    }
}
