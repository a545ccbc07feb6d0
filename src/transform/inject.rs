use std::borrow::Cow;
use std::sync::Arc;

use camino::Utf8Path;

use crate::core::Hash32;
use crate::transform::Transform;

/// Runs another transform, then adds a `<script>` right before `</body>`.
///
/// Used in serve mode to ship the live-reload client with every page.
pub struct InjectScript {
    inner: Arc<dyn Transform>,
    identity: String,
    tag: String,
}

impl InjectScript {
    pub fn new(inner: Arc<dyn Transform>, script: &str) -> Self {
        Self {
            identity: format!("{}+script", inner.identity()),
            tag: format!("<script>{script}</script>"),
            inner,
        }
    }
}

impl Transform for InjectScript {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn version(&self) -> Cow<'_, str> {
        let tag = Hash32::hash(&self.tag).to_hex();
        Cow::Owned(format!("{};{}", self.inner.version(), &tag[..16]))
    }

    fn extension(&self) -> Option<&str> {
        self.inner.extension()
    }

    fn fingerprint(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Hash32> {
        self.inner.fingerprint(path, input)
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let output = self.inner.apply(path, input)?;

        let Ok(mut html) = String::from_utf8(output) else {
            anyhow::bail!("{path} is not valid UTF-8");
        };

        match html.rfind("</body>") {
            Some(at) => html.insert_str(at, &self.tag),
            None => html.push_str(&self.tag),
        }

        Ok(html.into_bytes())
    }
}
