use std::borrow::Cow;
use std::sync::Arc;

use camino::Utf8Path;

use crate::core::Hash32;
use crate::transform::Transform;

/// Picks a transform by the file extension of the source, for categories
/// that mix source languages (`.scss` next to `.less`).
///
/// Every route should produce the same output extension, the category's
/// output is named after the fallback's.
#[derive(Clone)]
pub struct ByExtension {
    fallback: Arc<dyn Transform>,
    routes: Vec<(String, Arc<dyn Transform>)>,
}

impl ByExtension {
    pub fn new(fallback: impl Transform + 'static) -> Self {
        Self {
            fallback: Arc::new(fallback),
            routes: Vec::new(),
        }
    }

    /// Sends files ending in `.{extension}` to `transform`.
    pub fn route(mut self, extension: impl Into<String>, transform: impl Transform + 'static) -> Self {
        self.routes.push((extension.into(), Arc::new(transform)));
        self
    }

    fn pick(&self, path: &Utf8Path) -> &dyn Transform {
        path.extension()
            .and_then(|ext| {
                self.routes
                    .iter()
                    .find(|(route, _)| route.eq_ignore_ascii_case(ext))
            })
            .map_or(self.fallback.as_ref(), |(_, transform)| transform.as_ref())
    }
}

impl Transform for ByExtension {
    fn identity(&self) -> &str {
        self.fallback.identity()
    }

    fn version(&self) -> Cow<'_, str> {
        let mut version = self.fallback.version().into_owned();
        for (extension, transform) in &self.routes {
            version.push_str(&format!(";{extension}={}@{}", transform.identity(), transform.version()));
        }
        Cow::Owned(version)
    }

    fn extension(&self) -> Option<&str> {
        self.fallback
            .extension()
            .or_else(|| self.routes.iter().find_map(|(_, transform)| transform.extension()))
    }

    fn fingerprint(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Hash32> {
        let transform = self.pick(path);
        let fingerprint = transform.fingerprint(path, input)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(transform.identity().as_bytes());
        hasher.update(b"\0");
        hasher.update(fingerprint.as_bytes());
        Ok(hasher.finalize().into())
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.pick(path).apply(path, input)
    }
}

impl std::fmt::Debug for ByExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_map();
        list.entry(&"*", &self.fallback.identity());
        for (extension, transform) in &self.routes {
            list.entry(extension, &transform.identity());
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{FnTransform, Passthrough};

    fn router() -> ByExtension {
        ByExtension::new(Passthrough).route(
            "less",
            FnTransform::new("shout", "1", |_, input| Ok(input.to_ascii_uppercase()))
                .with_extension("css"),
        )
    }

    #[test]
    fn test_routes_by_extension() {
        let router = router();

        assert_eq!(router.apply(Utf8Path::new("a.less"), b"a{}").unwrap(), b"A{}");
        assert_eq!(router.apply(Utf8Path::new("a.LESS"), b"a{}").unwrap(), b"A{}");
        assert_eq!(router.apply(Utf8Path::new("a.scss"), b"a{}").unwrap(), b"a{}");
        assert_eq!(router.apply(Utf8Path::new("LICENSE"), b"a{}").unwrap(), b"a{}");
    }

    #[test]
    fn test_fingerprint_depends_on_route() {
        let router = router();

        let less = router.fingerprint(Utf8Path::new("a.less"), b"a{}").unwrap();
        let css = router.fingerprint(Utf8Path::new("a.css"), b"a{}").unwrap();
        assert_ne!(less, css);
    }

    #[test]
    fn test_version_lists_routes() {
        let version = router().version().into_owned();
        assert!(version.contains("less=shout@1"));
        assert_eq!(router().extension(), Some("css"));
    }
}
