use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::engine::TaskContext;

/// Deletes generated files, sparing anything matched by a keep pattern.
#[derive(Debug, Clone)]
pub(crate) struct CleanJob {
    remove: Vec<String>,
    keep: Vec<Pattern>,
}

impl CleanJob {
    pub(crate) fn new(remove: Vec<String>, keep: Vec<Pattern>) -> Self {
        Self { remove, keep }
    }

    pub(crate) fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let removed = self.clean(&ctx.env.root)?;
        tracing::info!("{}: removed {} path(s)", ctx.name(), removed);
        Ok(())
    }

    fn clean(&self, root: &Utf8Path) -> anyhow::Result<usize> {
        let prefix = Pattern::escape(root.as_str());
        let mut doomed: Vec<Utf8PathBuf> = Vec::new();

        for glob in &self.remove {
            for entry in glob::glob(&format!("{prefix}/{glob}"))? {
                let path = Utf8PathBuf::try_from(entry?)?;
                let relative = path.strip_prefix(root).unwrap_or(&path);

                if !self.is_kept(relative) {
                    doomed.push(path);
                }
            }
        }

        // Deepest first, so directories are emptied before we look at them.
        doomed.sort_by(|a, b| {
            let depth = |p: &Utf8PathBuf| p.components().count();
            depth(b).cmp(&depth(a)).then_with(|| a.cmp(b))
        });
        doomed.dedup();

        let mut removed = 0;
        for path in doomed {
            let result = if path.is_dir() {
                // Anything still inside was kept on purpose.
                if fs::read_dir(&path)?.next().is_some() {
                    continue;
                }
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }

    fn is_kept(&self, relative: &Utf8Path) -> bool {
        self.keep
            .iter()
            .any(|pattern| pattern.matches_path(relative.as_std_path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::write_output;

    #[test]
    fn test_clean_spares_kept_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        write_output(&root.join("assets/index.html"), b"").unwrap();
        write_output(&root.join("assets/styles/main.css"), b"").unwrap();
        write_output(&root.join("assets/images/logo.png"), b"").unwrap();
        write_output(&root.join("src/index.html"), b"").unwrap();

        let job = CleanJob::new(
            vec!["assets/**/*".into()],
            vec![
                Pattern::new("assets/images").unwrap(),
                Pattern::new("assets/images/**/*").unwrap(),
            ],
        );
        let removed = job.clean(&root).unwrap();

        assert_eq!(removed, 3);
        assert!(!root.join("assets/index.html").exists());
        assert!(!root.join("assets/styles").exists());
        assert!(root.join("assets/images/logo.png").exists());
        assert!(root.join("src/index.html").exists());
    }

    #[test]
    fn test_clean_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let job = CleanJob::new(vec!["assets/**/*".into()], Vec::new());
        assert_eq!(job.clean(&root).unwrap(), 0);
    }
}
