//! Pluggable, pure `(bytes, path) -> bytes` transforms keyed by [`Category`].
//!
//! A transform must be referentially transparent: the same input bytes and
//! path always produce the same output. This is what makes the
//! content-addressed [`CacheStore`](crate::CacheStore) sound. Transforms never
//! cache or parallelise on their own, the orchestrator does both.

pub mod command;
#[cfg(feature = "image")]
pub mod image;
pub mod inject;
pub mod less;
pub mod route;
#[cfg(feature = "grass")]
pub mod styles;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;

use crate::core::{Category, Hash32, Mode};
use crate::error::TransformError;

pub use command::CommandTransform;
pub use inject::InjectScript;
pub use less::LessTransform;
pub use route::ByExtension;
#[cfg(feature = "image")]
pub use image::ImageTransform;
#[cfg(feature = "grass")]
pub use styles::ScssTransform;

/// A deterministic asset transform.
pub trait Transform: Send + Sync {
    /// Stable name of the transform, part of every cache key it produces.
    fn identity(&self) -> &str;

    /// Configuration tag. Changing the configuration of a transform must
    /// change this value, which invalidates every cache entry made with the
    /// old configuration.
    fn version(&self) -> Cow<'_, str> {
        Cow::Borrowed("0")
    }

    /// New file extension for the output, if the transform changes it.
    fn extension(&self) -> Option<&str> {
        None
    }

    /// Content hash of everything the output depends on. For most transforms
    /// this is just the input bytes; transforms that pull in other files
    /// (stylesheet partials) fold their contents in as well.
    fn fingerprint(&self, _path: &Utf8Path, input: &[u8]) -> anyhow::Result<Hash32> {
        Ok(Hash32::hash(input))
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Copies bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn identity(&self) -> &str {
        "passthrough"
    }

    fn apply(&self, _: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

/// Adapts a closure into a [`Transform`].
pub struct FnTransform<F> {
    identity: String,
    version: String,
    extension: Option<String>,
    func: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&Utf8Path, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    pub fn new(identity: impl Into<String>, version: impl Into<String>, func: F) -> Self {
        Self {
            identity: identity.into(),
            version: version.into(),
            extension: None,
            func,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&Utf8Path, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn identity(&self) -> &str {
        &self.identity
    }

    fn version(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.version)
    }

    fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        (self.func)(path, input)
    }
}

/// Maps each asset [`Category`] to the transform that processes it.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<Category, Arc<dyn Transform>>,
}

impl TransformRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the stock transform for every category.
    ///
    /// * `Markup` and `Public` are copied through.
    /// * `Style` is compiled from SCSS with `grass` (compressed in `Build` mode),
    ///   `.less` files go to `lessc` instead.
    /// * `Image` is re-encoded with the `image` crate.
    /// * `Script` is minified with `esbuild` when it can be found on `PATH`.
    pub fn with_defaults(mode: Mode) -> Self {
        let mut registry = Self::new();

        registry.register(Category::Markup, Passthrough);
        registry.register(Category::Public, Passthrough);

        let less = LessTransform::new();
        if !less.is_available() {
            tracing::warn!("lessc not found on PATH, .less stylesheets will fail to build");
        }

        #[cfg(feature = "grass")]
        let styles = ByExtension::new(ScssTransform::new(mode));
        #[cfg(not(feature = "grass"))]
        let styles = ByExtension::new(Passthrough);
        registry.register(Category::Style, styles.route("less", less));

        #[cfg(feature = "image")]
        registry.register(Category::Image, ImageTransform::default());
        #[cfg(not(feature = "image"))]
        registry.register(Category::Image, Passthrough);

        match CommandTransform::esbuild(mode) {
            Some(esbuild) => registry.register(Category::Script, esbuild),
            None => {
                tracing::warn!("esbuild not found on PATH, scripts will be copied as-is");
                registry.register(Category::Script, Passthrough)
            }
        };

        registry
    }

    /// Registers the transform for a category, replacing any previous one.
    pub fn register(&mut self, category: Category, transform: impl Transform + 'static) -> &mut Self {
        self.transforms.insert(category, Arc::new(transform));
        self
    }

    /// Registers a closure as the transform for a category.
    pub fn register_fn<F>(
        &mut self,
        category: Category,
        identity: impl Into<String>,
        version: impl Into<String>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(&Utf8Path, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.register(category, FnTransform::new(identity, version, func))
    }

    /// Wraps the transform of `category` so that its output gets `script`
    /// appended as an inline `<script>`.
    pub fn inject_script(&mut self, category: Category, script: &str) -> &mut Self {
        if let Some(inner) = self.transforms.get(&category).cloned() {
            self.register(category, InjectScript::new(inner, script));
        }
        self
    }

    pub fn get(&self, category: Category) -> Option<&dyn Transform> {
        self.transforms.get(&category).map(Arc::as_ref)
    }

    /// Runs the transform registered for `category` on a single input.
    pub fn run(
        &self,
        category: Category,
        path: &Utf8Path,
        input: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let transform = self.get(category).ok_or_else(|| {
            TransformError::new(
                category,
                path,
                anyhow::anyhow!("no transform registered for category '{category}'"),
            )
        })?;

        transform
            .apply(path, input)
            .map_err(|cause| TransformError::new(category, path, cause))
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (category, transform) in &self.transforms {
            map.entry(category, &transform.identity());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_registered() {
        let mut registry = TransformRegistry::new();
        registry.register_fn(Category::Style, "upper", "1", |_, input| {
            Ok(input.to_ascii_uppercase())
        });

        let out = registry
            .run(Category::Style, Utf8Path::new("a.css"), b"body{}")
            .unwrap();
        assert_eq!(out, b"BODY{}");
    }

    #[test]
    fn test_error_carries_category_and_path() {
        let mut registry = TransformRegistry::new();
        registry.register_fn(Category::Script, "broken", "1", |_, _| {
            anyhow::bail!("unexpected token")
        });

        let err = registry
            .run(Category::Script, Utf8Path::new("src/scripts/main.js"), b"let")
            .unwrap_err();

        assert_eq!(err.category, Category::Script);
        assert_eq!(err.path, "src/scripts/main.js");
        assert!(err.to_string().contains("unexpected token"));
    }

    #[test]
    fn test_unregistered_category() {
        let registry = TransformRegistry::new();
        let err = registry
            .run(Category::Image, Utf8Path::new("a.png"), b"")
            .unwrap_err();

        assert_eq!(err.category, Category::Image);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = TransformRegistry::new();
        registry.register(Category::Markup, Passthrough);
        registry.register_fn(Category::Markup, "empty", "1", |_, _| Ok(vec![]));

        assert_eq!(registry.get(Category::Markup).unwrap().identity(), "empty");
    }

    #[test]
    fn test_inject_script_wraps_existing() {
        let mut registry = TransformRegistry::new();
        registry.register(Category::Markup, Passthrough);
        registry.inject_script(Category::Markup, "x()");

        let out = registry
            .run(Category::Markup, Utf8Path::new("a.html"), b"<body></body>")
            .unwrap();
        assert_eq!(out, b"<body><script>x()</script></body>");

        // Nothing to wrap.
        registry.inject_script(Category::Image, "x()");
        assert!(registry.get(Category::Image).is_none());
    }

    #[test]
    fn test_defaults_cover_every_category() {
        let registry = TransformRegistry::with_defaults(Mode::Build);
        for category in Category::ALL {
            assert!(registry.get(category).is_some(), "{category} missing");
        }
    }

    #[test]
    fn test_defaults_send_less_to_lessc() {
        let registry = TransformRegistry::with_defaults(Mode::Build);
        let styles = registry.get(Category::Style).unwrap();

        assert!(styles.version().contains("less=lessc@"));
        assert_eq!(styles.extension(), Some("css"));
    }
}
