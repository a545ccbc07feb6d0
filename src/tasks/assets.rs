use std::fs;
use std::io;
use std::time::Instant;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::core::Category;
use crate::engine::TaskContext;
use crate::utils::as_overhead;

/// Runs every matched source file through the transform of one category and
/// mirrors the results into the output directory.
#[derive(Debug, Clone)]
pub(crate) struct AssetJob {
    category: Category,
    sources: Vec<String>,
    suffix: Option<String>,
}

impl AssetJob {
    pub(crate) fn new(category: Category, sources: Vec<String>, suffix: Option<String>) -> Self {
        Self {
            category,
            sources,
            suffix,
        }
    }

    pub(crate) fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let s = Instant::now();
        let out_dir = ctx
            .output_dir()
            .with_context(|| format!("{} has no output directory", ctx.name()))?;

        let extension = ctx
            .registry
            .get(self.category)
            .and_then(|transform| transform.extension())
            .map(str::to_owned);

        self.prune(ctx, &out_dir, extension.as_deref())?;

        let files: Vec<_> = crate::tasks::expand(&ctx.env.root, &self.sources)?
            .into_iter()
            .filter(|(path, _)| !self.is_partial(path))
            .collect();

        files.par_iter().try_for_each(|(path, relative)| {
            let input = fs::read(path).with_context(|| format!("couldn't read {path}"))?;
            let output = ctx.transform(self.category, path, &input)?;

            let target = out_dir.join(destination(
                relative,
                extension.as_deref(),
                self.suffix.as_deref(),
            ));
            crate::tasks::write_output(&target, &output)
                .with_context(|| format!("couldn't write {target}"))?;

            anyhow::Ok(())
        })?;

        tracing::info!(
            "{}: {} file(s) {}",
            ctx.name(),
            files.len(),
            as_overhead(s)
        );

        Ok(())
    }

    /// Removes the outputs of sources deleted since the previous run.
    fn prune(
        &self,
        ctx: &TaskContext<'_>,
        out_dir: &Utf8Path,
        extension: Option<&str>,
    ) -> anyhow::Result<()> {
        for path in ctx.deleted {
            let Some(relative) = crate::tasks::relative_to_glob(path, &self.sources) else {
                continue;
            };

            let target = out_dir.join(destination(&relative, extension, self.suffix.as_deref()));
            match fs::remove_file(&target) {
                Ok(()) => tracing::debug!("removed {target}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("couldn't remove {target}")),
            }
        }

        Ok(())
    }

    /// Sass partials are only ever compiled through the files importing them.
    fn is_partial(&self, path: &Utf8Path) -> bool {
        self.category == Category::Style
            && path
                .file_name()
                .is_some_and(|name| name.starts_with('_'))
    }
}

/// Output path for a source, relative to the output directory.
fn destination(relative: &Utf8Path, extension: Option<&str>, suffix: Option<&str>) -> Utf8PathBuf {
    let mut path = relative.to_path_buf();

    if let Some(extension) = extension {
        path.set_extension(extension);
    }

    if let Some(suffix) = suffix {
        let stem = path.file_stem().unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}{suffix}.{ext}"),
            None => format!("{stem}{suffix}"),
        };
        path.set_file_name(name);
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination() {
        let rel = Utf8Path::new("pages/main.scss");
        assert_eq!(destination(rel, Some("css"), None), "pages/main.css");
        assert_eq!(destination(rel, Some("css"), Some(".min")), "pages/main.min.css");
        assert_eq!(destination(Utf8Path::new("logo.png"), None, None), "logo.png");
        assert_eq!(destination(Utf8Path::new("LICENSE"), None, Some(".min")), "LICENSE.min");
    }
}
