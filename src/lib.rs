#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod cache;
mod core;
pub mod engine;
mod error;
mod graph;
#[cfg(feature = "server")]
mod http;
mod pipeline;
pub mod reload;
mod tasks;
pub mod transform;
mod utils;
pub mod watch;

pub use crate::blueprint::{AssetsDef, Blueprint, CleanDef, Schedule, TaskDef};
pub use crate::cache::{
    CacheBackend, CacheEntry, CacheKey, CacheLease, CacheStats, CacheStore, DIR_CACHE, DiskBackend,
    EntryMeta, MemoryBackend,
};
pub use crate::core::{Category, Environment, Hash32, Mode};
pub use crate::engine::{
    BuildReport, Executor, IncrementalScheduler, Runtime, SkipReason, TaskContext, TaskOutcome,
};
pub use crate::error::*;
pub use crate::graph::{Task, TaskBody, TaskGraph, TaskRef};
pub use crate::pipeline::{Paths, Pipeline, frontend};
pub use crate::transform::{Transform, TransformRegistry};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
