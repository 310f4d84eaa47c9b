//! The blob store the remote tree is mirrored into.

use async_trait::async_trait;
use eyre::Result;
use tokio::io::AsyncRead;

pub mod store;

/// One stored object, as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    pub mtime: i32,
}

/// Flat-namespace object store. The transfer engine needs `list` and a
/// streaming `put`; `stat` and `get` exist for callers that probe single
/// keys.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Every object under `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Streams `reader` into the object at `key` until EOF. A failure here
    /// loses this object only, never the session.
    async fn put(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: i64,
    ) -> Result<()>;

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Maps remote paths into the key namespace under a fixed prefix, and back.
#[derive(Debug, Clone)]
pub struct KeyMap {
    prefix: String,
}

impl KeyMap {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    /// Object key for a remote path. Remote paths are raw bytes; invalid
    /// UTF-8 is replaced before the path enters the key namespace.
    pub fn key_for(&self, path: &[u8]) -> String {
        let rel = String::from_utf8_lossy(path);
        if self.prefix.is_empty() {
            rel.into_owned()
        } else {
            format!("{}/{rel}", self.prefix)
        }
    }

    /// Remote-relative path for a listed key, if it falls under the prefix.
    pub fn relative(&self, key: &str) -> Option<Vec<u8>> {
        if self.prefix.is_empty() {
            return Some(key.as_bytes().to_vec());
        }
        key.strip_prefix(&self.prefix)?
            .strip_prefix('/')
            .map(|rest| rest.as_bytes().to_vec())
    }
}
