use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use camino::Utf8Path;

use crate::core::Hash32;
use crate::transform::{CommandTransform, Transform, command::find_on_path};

/// Output name handed to `lessc --depends`, which wants one but never
/// writes it.
const DEPENDS_TARGET: &str = "out.css";

/// Compiles Less through the `lessc` executable, reading from stdin.
///
/// Without `lessc` on `PATH` every Less file fails with an error saying so,
/// while the rest of the build carries on.
#[derive(Debug, Clone)]
pub struct LessTransform {
    program: Option<PathBuf>,
}

impl LessTransform {
    /// Looks `lessc` up on `PATH`.
    pub fn new() -> Self {
        Self {
            program: find_on_path("lessc"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.program.is_some()
    }

    /// Files `lessc` pulls in through `@import`.
    fn dependencies(&self, program: &Path, path: &Utf8Path) -> anyhow::Result<Vec<PathBuf>> {
        let output = Command::new(program)
            .arg("--depends")
            .args(include_path(path))
            .arg(path)
            .arg(DEPENDS_TARGET)
            .output()
            .with_context(|| format!("couldn't start {}", program.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "lessc --depends exited with {}:\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_depends(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Default for LessTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for LessTransform {
    fn identity(&self) -> &str {
        "lessc"
    }

    fn extension(&self) -> Option<&str> {
        Some("css")
    }

    fn version(&self) -> Cow<'_, str> {
        match &self.program {
            Some(program) => Cow::Owned(program.display().to_string()),
            None => Cow::Borrowed("missing"),
        }
    }

    fn fingerprint(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Hash32> {
        let Some(program) = &self.program else {
            return Ok(Hash32::hash(input));
        };

        let dependencies = match self.dependencies(program, path) {
            Ok(dependencies) => dependencies,
            Err(e) => {
                tracing::debug!("couldn't list the imports of {path}: {e:#}");
                return Ok(Hash32::hash(input));
            }
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(Hash32::hash(input).as_bytes());
        for dependency in dependencies {
            hasher.update(dependency.as_os_str().as_encoded_bytes());
            match fs::read(&dependency) {
                Ok(data) => {
                    hasher.update(b"\0");
                    hasher.update(Hash32::hash(data).as_bytes());
                }
                Err(_) => {
                    hasher.update(b"\x01");
                }
            }
        }

        Ok(hasher.finalize().into())
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let Some(program) = &self.program else {
            anyhow::bail!("lessc not found on PATH, can't compile {path}");
        };

        let mut command = CommandTransform::new(program);
        if let Some(include) = include_path(path) {
            command = command.arg(include);
        }
        command.arg("-").apply(path, input)
    }
}

/// Lets relative imports resolve against the directory of the entry file,
/// since the source itself arrives on stdin.
fn include_path(path: &Utf8Path) -> Option<String> {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map(|parent| format!("--include-path={parent}"))
}

/// Parses `out.css: a.less b.less` into the listed files.
fn parse_depends(stdout: &str) -> Vec<PathBuf> {
    stdout
        .split_once(": ")
        .map(|(_, files)| files.split_whitespace().map(PathBuf::from).collect())
        .unwrap_or_default()
}
