use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Hash32, Mode};
use crate::transform::Transform;

/// Compiles SCSS (and plain CSS) with `grass`.
///
/// Imports are resolved relative to the directory of the entry file and to
/// the extra load paths. The output depends on every file an import pulls
/// in, wherever it lives and whatever its name, so each compilation records
/// the files `grass` read and the candidates it looked up. The fingerprint
/// folds all of them in.
#[derive(Debug, Clone)]
pub struct ScssTransform {
    compressed: bool,
    load_paths: Vec<Utf8PathBuf>,
    seen: Arc<Mutex<HashMap<Utf8PathBuf, Dependencies>>>,
}

impl ScssTransform {
    pub fn new(mode: Mode) -> Self {
        Self {
            compressed: matches!(mode, Mode::Build),
            load_paths: Vec::new(),
            seen: Arc::default(),
        }
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Adds an extra directory used to resolve `@use` and `@import`.
    pub fn load_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.load_paths.push(path.into());
        self
    }

    /// Compiles `input` and returns the result with everything the compiler
    /// looked at along the way.
    fn compile(&self, path: &Utf8Path, input: &[u8]) -> (anyhow::Result<Vec<u8>>, Dependencies) {
        let fs = RecordingFs::default();
        let result = self.render(path, input, &fs);
        (result, fs.finish(Hash32::hash(input)))
    }

    fn render(&self, path: &Utf8Path, input: &[u8], fs: &RecordingFs) -> anyhow::Result<Vec<u8>> {
        let style = if self.compressed {
            grass::OutputStyle::Compressed
        } else {
            grass::OutputStyle::Expanded
        };

        let mut options = grass::Options::default().style(style).fs(fs);
        if let Some(parent) = path.parent() {
            options = options.load_path(parent);
        }
        for load_path in &self.load_paths {
            options = options.load_path(load_path);
        }

        let source = String::from_utf8(input.to_vec())?;
        let css = grass::from_string(source, &options)?;

        Ok(css.into_bytes())
    }

    fn recall(&self, path: &Utf8Path) -> Option<Dependencies> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.get(path).cloned()
    }

    fn remember(&self, path: &Utf8Path, dependencies: Dependencies) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.insert(path.to_path_buf(), dependencies);
    }
}

impl Transform for ScssTransform {
    fn identity(&self) -> &str {
        "grass"
    }

    fn version(&self) -> Cow<'_, str> {
        let style = if self.compressed { "compressed" } else { "expanded" };
        let paths = self
            .load_paths
            .iter()
            .map(|path| path.as_str())
            .collect::<Vec<_>>()
            .join(":");
        Cow::Owned(format!("{style};{paths}"))
    }

    fn extension(&self) -> Option<&str> {
        Some("css")
    }

    /// The dependencies of the last compilation are reused as long as none
    /// of them changed. Otherwise the file is compiled once more to find out
    /// what it reads now.
    fn fingerprint(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Hash32> {
        let input_hash = Hash32::hash(input);

        if let Some(dependencies) = self.recall(path)
            && dependencies.is_current(input_hash)
        {
            return Ok(dependencies.digest());
        }

        // A broken stylesheet still gets a key, `apply` reports the error.
        let (_, dependencies) = self.compile(path, input);
        let digest = dependencies.digest();
        self.remember(path, dependencies);

        Ok(digest)
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let (result, dependencies) = self.compile(path, input);
        self.remember(path, dependencies);
        result
    }
}

/// Everything a single compilation depended on besides its own source.
#[derive(Debug, Clone)]
struct Dependencies {
    input: Hash32,
    files: BTreeMap<PathBuf, Hash32>,
    lookups: BTreeMap<PathBuf, bool>,
}

impl Dependencies {
    /// Whether compiling `input` now would read exactly the same bytes.
    fn is_current(&self, input: Hash32) -> bool {
        self.input == input
            && self
                .lookups
                .iter()
                .all(|(path, exists)| path.is_file() == *exists)
            && self
                .files
                .iter()
                .all(|(path, hash)| fs::read(path).is_ok_and(|data| Hash32::hash(data) == *hash))
    }

    fn digest(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.input.as_bytes());

        for (path, hash) in &self.files {
            hasher.update(path.as_os_str().as_encoded_bytes());
            hasher.update(b"\0");
            hasher.update(hash.as_bytes());
        }

        for (path, exists) in &self.lookups {
            hasher.update(path.as_os_str().as_encoded_bytes());
            hasher.update(&[0, u8::from(*exists)]);
        }

        hasher.finalize().into()
    }
}

#[derive(Debug, Default)]
struct Seen {
    files: BTreeMap<PathBuf, Hash32>,
    lookups: BTreeMap<PathBuf, bool>,
}

/// The real file system, taking notes.
#[derive(Debug, Default)]
struct RecordingFs {
    seen: Mutex<Seen>,
}

impl RecordingFs {
    fn with_seen(&self, f: impl FnOnce(&mut Seen)) {
        f(&mut self.seen.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn finish(self, input: Hash32) -> Dependencies {
        let seen = self.seen.into_inner().unwrap_or_else(PoisonError::into_inner);

        Dependencies {
            input,
            files: seen.files,
            lookups: seen.lookups,
        }
    }
}

impl grass::Fs for RecordingFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        let exists = path.is_file();
        self.with_seen(|seen| {
            seen.lookups.insert(path.to_path_buf(), exists);
        });
        exists
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let data = fs::read(path)?;
        self.with_seen(|seen| {
            seen.files.insert(path.to_path_buf(), Hash32::hash(&data));
        });
        Ok(data)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn css(transform: &ScssTransform, path: &Utf8Path, input: &[u8]) -> String {
        String::from_utf8(transform.apply(path, input).unwrap()).unwrap()
    }

    #[test]
    fn test_compile_nested() {
        let transform = ScssTransform::new(Mode::Serve);
        let out = css(&transform, Utf8Path::new("main.scss"), b"a { b { color: red; } }");

        assert!(out.contains("a b"));
        assert!(out.contains("color: red"));
    }

    #[test]
    fn test_syntax_error() {
        let transform = ScssTransform::new(Mode::Build);
        assert!(
            transform
                .apply(Utf8Path::new("main.scss"), b"a { color: ")
                .is_err()
        );
    }

    #[test]
    fn test_version_tracks_style() {
        let build = ScssTransform::new(Mode::Build);
        let serve = ScssTransform::new(Mode::Serve);
        assert_ne!(build.version(), serve.version());
    }

    #[test]
    fn test_version_lists_load_paths() {
        let transform = ScssTransform::new(Mode::Build)
            .load_path("vendor/sass")
            .load_path("node_modules");

        assert_eq!(transform.version(), "compressed;vendor/sass:node_modules");
    }

    #[test]
    fn test_fingerprint_covers_partials() {
        let (_dir, root) = tempdir();
        let main = root.join("main.scss");
        let partial = root.join("_vars.scss");

        fs::write(&partial, "$c: red;").unwrap();

        let transform = ScssTransform::new(Mode::Build);
        let input = b"@import 'vars'; a { color: $c; }";
        let before = transform.fingerprint(&main, input).unwrap();

        fs::write(&partial, "$c: blue;").unwrap();
        let after = transform.fingerprint(&main, input).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_fingerprint_covers_partial_in_parent_directory() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("pages")).unwrap();
        let home = root.join("pages/home.scss");
        let partial = root.join("_vars.scss");
        let input = b"@import '../vars'; a { color: $c; }";

        fs::write(&partial, "$c: red;").unwrap();

        let transform = ScssTransform::new(Mode::Build);
        let before = transform.fingerprint(&home, input).unwrap();
        assert!(css(&transform, &home, input).contains("red"));
        assert_eq!(transform.fingerprint(&home, input).unwrap(), before);

        fs::write(&partial, "$c: blue;").unwrap();

        assert_ne!(transform.fingerprint(&home, input).unwrap(), before);
        assert!(css(&transform, &home, input).contains("blue"));
    }

    #[test]
    fn test_fingerprint_covers_plain_import() {
        let (_dir, root) = tempdir();
        let main = root.join("main.scss");
        let theme = root.join("theme.scss");
        let input = b"@import 'theme'; a { color: $c; }";

        fs::write(&theme, "$c: red;").unwrap();

        let transform = ScssTransform::new(Mode::Build);
        let before = transform.fingerprint(&main, input).unwrap();

        fs::write(&theme, "$c: blue;").unwrap();

        // A fresh transform knows nothing from earlier runs.
        let cold = ScssTransform::new(Mode::Build);
        assert_ne!(transform.fingerprint(&main, input).unwrap(), before);
        assert_ne!(cold.fingerprint(&main, input).unwrap(), before);
    }

    #[test]
    fn test_new_partial_shadowing_an_import() {
        let (_dir, root) = tempdir();
        let main = root.join("main.scss");
        let input = b"@import 'theme'; a { color: $c; }";

        fs::write(root.join("theme.scss"), "$c: red;").unwrap();

        let transform = ScssTransform::new(Mode::Build);
        let before = transform.fingerprint(&main, input).unwrap();

        // `grass` prefers `theme.scss` here, but the lookup of it is recorded
        // all the same, so removing it invalidates the key.
        fs::remove_file(root.join("theme.scss")).unwrap();
        fs::write(root.join("_theme.scss"), "$c: blue;").unwrap();

        assert_ne!(transform.fingerprint(&main, input).unwrap(), before);
    }
}
