//! Built-in task bodies.

mod assets;
mod clean;

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

pub(crate) use assets::AssetJob;
pub(crate) use clean::CleanJob;

/// The static prefix of a glob, everything before the first component
/// containing a wildcard.
pub(crate) fn glob_base(glob: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(glob);

    path.components()
        .take_while(|c| !c.as_str().contains(['*', '?', '[']))
        .collect()
}

/// Expands root-relative globs into the files they match. Each file is
/// returned as an absolute path together with its path relative to the base
/// of the first glob that matched it.
pub(crate) fn expand(
    root: &Utf8Path,
    globs: &[String],
) -> anyhow::Result<BTreeMap<Utf8PathBuf, Utf8PathBuf>> {
    let prefix = Pattern::escape(root.as_str());
    let mut found = BTreeMap::new();

    for glob in globs {
        let base = root.join(glob_base(glob));

        for entry in glob::glob(&format!("{prefix}/{glob}"))? {
            let path = Utf8PathBuf::try_from(entry?)?;
            if !path.is_file() || found.contains_key(&path) {
                continue;
            }

            let relative = relative_to_base(&path, &base);
            found.insert(path, relative);
        }
    }

    Ok(found)
}

/// Where a root-relative source would land relative to the output directory,
/// going by the first glob that matches it. Works for files that no longer
/// exist.
pub(crate) fn relative_to_glob(path: &Utf8Path, globs: &[String]) -> Option<Utf8PathBuf> {
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };

    globs
        .iter()
        .find(|glob| {
            Pattern::new(glob)
                .is_ok_and(|pattern| pattern.matches_path_with(path.as_std_path(), options))
        })
        .map(|glob| relative_to_base(path, &glob_base(glob)))
}

fn relative_to_base(path: &Utf8Path, base: &Utf8Path) -> Utf8PathBuf {
    // A glob without wildcards names the file itself.
    match path.strip_prefix(base) {
        Ok(rel) if !rel.as_str().is_empty() => rel.to_path_buf(),
        _ => Utf8PathBuf::from(path.file_name().unwrap_or_default()),
    }
}

pub(crate) fn write_output(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_base() {
        assert_eq!(glob_base("src/styles/**/*.scss"), "src/styles");
        assert_eq!(glob_base("src/*.html"), "src");
        assert_eq!(glob_base("src/public/robots.txt"), "src/public/robots.txt");
        assert_eq!(glob_base("**/*"), "");
    }

    #[test]
    fn test_expand_keeps_relative_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        write_output(&root.join("src/img/a.png"), b"a").unwrap();
        write_output(&root.join("src/img/icons/b.png"), b"b").unwrap();
        write_output(&root.join("src/img/c.txt"), b"c").unwrap();

        let found = expand(&root, &["src/img/**/*.png".into()]).unwrap();
        let relative: Vec<_> = found.values().map(|path| path.as_str()).collect();

        assert_eq!(relative, ["a.png", "icons/b.png"]);
    }

    #[test]
    fn test_relative_to_glob() {
        let globs = ["src/styles/**/*.css".to_string(), "src/robots.txt".to_string()];

        assert_eq!(
            relative_to_glob(Utf8Path::new("src/styles/pages/old.css"), &globs).unwrap(),
            "pages/old.css"
        );
        assert_eq!(
            relative_to_glob(Utf8Path::new("src/robots.txt"), &globs).unwrap(),
            "robots.txt"
        );
        assert!(relative_to_glob(Utf8Path::new("src/scripts/app.js"), &globs).is_none());
    }

    #[test]
    fn test_expand_concrete_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        write_output(&root.join("src/robots.txt"), b"").unwrap();

        let found = expand(&root, &["src/robots.txt".into()]).unwrap();
        assert_eq!(found.values().next().unwrap(), "robots.txt");
    }
}
