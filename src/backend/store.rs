//! [`Backend`] over any `object_store` implementation.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::{Backend, ObjectInfo};
use crate::config::Config;

pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// S3-compatible store from the runtime configuration: path-style
    /// requests against a plain-http endpoint, static credentials when both
    /// halves are present, the ambient provider chain otherwise.
    pub fn s3(cfg: &Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region("default")
            .with_bucket_name(&cfg.s3_bucket)
            .with_endpoint(&cfg.s3_endpoint)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(true);
        if !cfg.s3_access_key.is_empty() && !cfg.s3_secret_key.is_empty() {
            builder = builder
                .with_access_key_id(&cfg.s3_access_key)
                .with_secret_access_key(&cfg.s3_secret_key);
        }
        let store = builder.build().wrap_err("invalid object store configuration")?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Volatile store; the tests mirror into this one.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }
}

fn info_from(meta: &ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        key: meta.location.to_string(),
        size: meta.size as i64,
        mtime: meta.last_modified.timestamp() as i32,
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let prefix = (!prefix.is_empty()).then(|| Path::from(prefix));
        let mut stream = self.store.list(prefix.as_ref());
        let mut out = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            out.push(info_from(&meta));
        }
        Ok(out)
    }

    async fn put(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        _size: i64,
    ) -> Result<()> {
        let path = Path::from(key);
        let (id, mut writer) = self.store.put_multipart(&path).await?;
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(_) => {
                writer.shutdown().await?;
                Ok(())
            }
            Err(e) => {
                let _ = self.store.abort_multipart(&path, &id).await;
                Err(e).wrap_err_with(|| format!("streaming into {key}"))
            }
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self.store.head(&Path::from(key)).await {
            Ok(meta) => Ok(Some(info_from(&meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let result = self.store.get(&Path::from(key)).await?;
        Ok(result.bytes().await?.to_vec())
    }
}
