use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `tsumugi`, this serves two purposes:
/// 1. It fingerprints the bytes of a source asset, so that the transform cache
///    tracks content rather than file names or timestamps.
/// 2. It derives cache keys, which are hashes over the transform identity,
///    its configuration version and the input fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Parses the 64 character lowercase hex form produced by [`to_hex`](Self::to_hex).
    pub fn from_hex(hex: &str) -> Option<Self> {
        fn nibble(c: u8) -> Option<u8> {
            match c {
                b'0'..=b'9' => Some(c - b'0'),
                b'a'..=b'f' => Some(c - b'a' + 10),
                _ => None,
            }
        }

        let hex = hex.as_bytes();
        if hex.len() != 64 {
            return None;
        }

        let mut acc = [0u8; 32];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            acc[i] = nibble(pair[0])? << 4 | nibble(pair[1])?;
        }

        Some(Hash32(acc))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The class of a source asset.
///
/// Categories decide which transform a file goes through, how changed files
/// are grouped by the watcher, and what kind of reload a browser receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Style,
    Script,
    Markup,
    Image,
    Public,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Style,
        Category::Script,
        Category::Markup,
        Category::Image,
        Category::Public,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Style => "style",
            Category::Script => "script",
            Category::Markup => "markup",
            Category::Image => "image",
            Category::Public => "public",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mode in which the orchestrator is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-time build.
    Build,
    /// A continuous watch mode for development.
    Serve,
}

/// Global settings available to all tasks.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The current mode (Build or Serve).
    pub mode: Mode,
    /// Project directory; every glob and output directory is relative to it.
    pub root: Utf8PathBuf,
    /// The port of the live-reload socket (if running).
    pub port: Option<u16>,
}

impl Environment {
    pub fn new(mode: Mode, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            mode,
            root: root.into(),
            port: None,
        }
    }

    /// Resolves a project-relative path against the root.
    pub fn resolve(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(path)
    }

    /// Returns a JavaScript snippet to enable live-reloading.
    ///
    /// If the orchestrator is running in `Serve` mode and a port is
    /// configured, this returns a script that connects to the WebSocket
    /// server. Style-only changes re-fetch linked stylesheets in place, every
    /// other change reloads the page, and failed rebuilds are logged to the
    /// browser console.
    pub fn get_refresh_script(&self) -> Option<String> {
        self.port.map(|port| {
            format!(
                r#"
const socket = new WebSocket("ws://localhost:{port}");
socket.addEventListener("message", event => {{
    const message = JSON.parse(event.data);
    switch (message.type) {{
        case "css":
            for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {{
                const url = new URL(link.href);
                url.searchParams.set("t", Date.now());
                link.href = url.toString();
            }}
            break;
        case "error":
            console.error(message.message);
            break;
        default:
            window.location.reload();
    }}
}});
"#
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = Hash32::hash(b"body { color: red }");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
    }

    #[test]
    fn test_hash_from_hex_rejects_garbage() {
        assert_eq!(Hash32::from_hex("abc"), None);
        assert_eq!(Hash32::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn test_one_byte_changes_hash() {
        assert_ne!(Hash32::hash(b"a.png"), Hash32::hash(b"b.png"));
    }

    #[test]
    fn test_refresh_script_only_with_port() {
        let mut env = Environment::new(Mode::Build, "/tmp");
        assert!(env.get_refresh_script().is_none());

        env.port = Some(1337);
        let script = env.get_refresh_script().unwrap();
        assert!(script.contains("ws://localhost:1337"));
        assert!(script.contains(r#"case "css""#));
    }
}
