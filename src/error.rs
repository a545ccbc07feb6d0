use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Category;

/// A malformed task graph. Always reported before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("Task '{0}' appears more than once in the composed schedule")]
    DuplicateInSchedule(String),

    #[error("Cycle detected in task graph at task '{0}'")]
    Cycle(String),

    #[error(
        "Tasks '{first}' and '{second}' may run in parallel but both write to '{path}'"
    )]
    OverlappingOutputs {
        first: String,
        second: String,
        path: Utf8PathBuf,
    },

    #[error("Task '{task}' declares an invalid glob '{glob}':\n{source}")]
    Pattern {
        task: String,
        glob: String,
        source: glob::PatternError,
    },

    #[error("Task '{0}' writes assets but declares no output directory")]
    MissingOutput(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),
}

/// A transform plugin failed on a specific input.
#[derive(Debug, Error)]
#[error("Transform '{category}' failed on '{path}':\n{cause}")]
pub struct TransformError {
    pub category: Category,
    pub path: Utf8PathBuf,
    pub cause: anyhow::Error,
}

impl TransformError {
    pub(crate) fn new(
        category: Category,
        path: impl Into<Utf8PathBuf>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            category,
            path: path.into(),
            cause: cause.into(),
        }
    }
}

/// The cache backing store misbehaved. Callers treat this as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Corrupt metadata for cache entry {0}")]
    Metadata(String),

    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// The filesystem watch subscription failed. Fatal to serve mode only.
#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't resolve watch path '{0}'")]
    Resolve(String),
}

/// A task body returned an error or panicked.
#[derive(Debug, Error)]
#[error("Task '{task}':\n{cause}")]
pub struct TaskFailure {
    pub task: String,
    pub cause: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum TsumugiError {
    #[error("Invalid task graph:\n{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Build failed: {failed} task(s) failed, {skipped} skipped")]
    Build { failed: usize, skipped: usize },

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}
