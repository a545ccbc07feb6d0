use std::borrow::Cow;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::Context;
use camino::Utf8Path;

use crate::core::Mode;
use crate::transform::Transform;

/// Pipes the input through an external program, reading the result from its
/// standard output.
///
/// This is how tools without a Rust implementation (script bundlers,
/// minifiers, `lessc`) are plugged into the registry.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: PathBuf,
    args: Vec<String>,
    extension: Option<String>,
}

impl CommandTransform {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            extension: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// `esbuild` reading a script from stdin, minified in `Build` mode.
    ///
    /// Returns `None` when `esbuild` isn't installed.
    pub fn esbuild(mode: Mode) -> Option<Self> {
        let program = find_on_path("esbuild")?;
        let transform = Self::new(program).arg("--loader=js");

        Some(match mode {
            Mode::Build => transform.arg("--minify"),
            Mode::Serve => transform,
        })
    }
}

impl Transform for CommandTransform {
    fn identity(&self) -> &str {
        self.program
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("command")
    }

    fn version(&self) -> Cow<'_, str> {
        Cow::Owned(self.args.join(" "))
    }

    fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("couldn't start {}", self.program.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .context("child process has no stdin")?;

        // Feed stdin from a separate thread so a chatty child can't fill its
        // stdout pipe while we are still writing.
        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(input));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .map_err(|_| anyhow::anyhow!("stdin writer panicked"))?;
            written?;
            anyhow::Ok(output?)
        })?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {} on {}:\n{}",
                self.identity(),
                output.status,
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output.stdout)
    }
}

pub(crate) fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;

    env::split_paths(&paths).find_map(|dir| {
        let candidates = if cfg!(windows) {
            vec![
                dir.join(format!("{program}.exe")),
                dir.join(format!("{program}.cmd")),
            ]
        } else {
            vec![dir.join(program)]
        };

        candidates.into_iter().find(|path| path.is_file())
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_pipes_through_program() {
        let transform = CommandTransform::new("tr").arg("a-z").arg("A-Z");
        let out = transform
            .apply(Utf8Path::new("main.js"), b"let x = 1;")
            .unwrap();

        assert_eq!(out, b"LET X = 1;");
        assert_eq!(transform.identity(), "tr");
    }

    #[test]
    fn test_failure_reports_stderr() {
        let transform = CommandTransform::new("sh").arg("-c").arg("echo boom >&2; exit 3");
        let err = transform
            .apply(Utf8Path::new("main.js"), b"")
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_missing_program() {
        let transform = CommandTransform::new("definitely-not-a-real-program-tsumugi");
        assert!(transform.apply(Utf8Path::new("main.js"), b"").is_err());
    }
}
