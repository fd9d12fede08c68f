use async_trait::async_trait;
use opendal::{services::S3, Operator};

use crate::error::BlobError;
use crate::local::LocalBackend;
use crate::BlobBackend;

/// Configuration for the S3-compatible remote backend, read from
/// `S3_ENDPOINT`/`S3_REGION`/`S3_BUCKET`/`S3_ACCESS_KEY`/`S3_SECRET_KEY`
/// at the call site — this crate itself never touches the environment
/// directly.
pub struct RemoteConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Object-store-backed blob backend. `get` transparently caches into a
/// local directory, keyed identically to the remote key, using the
/// same stage-and-rename write path as [`LocalBackend`] so a reader
/// never observes a partial cache file.
pub struct RemoteBackend {
    op: Operator,
    cache: LocalBackend,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig, cache_dir: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        let builder = S3::default()
            .endpoint(&config.endpoint)
            .region(&config.region)
            .bucket(&config.bucket)
            .access_key_id(&config.access_key)
            .secret_access_key(&config.secret_key);
        let op = Operator::new(builder)?.finish();
        Ok(Self {
            op,
            cache: LocalBackend::new(cache_dir),
        })
    }
}

#[async_trait]
impl BlobBackend for RemoteBackend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), BlobError> {
        self.op
            .write(key, data.to_vec())
            .await
            .map_err(|e| BlobError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        if let Ok(cached) = self.cache.get(key).await {
            return Ok(cached);
        }

        let data = self
            .op
            .read(key)
            .await
            .map_err(|e| match e.kind() {
                opendal::ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
                _ => BlobError::TransportError(e.to_string()),
            })?
            .to_vec();

        self.cache.put(key, &data).await?;
        Ok(data)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        if self.cache.exists(key).await? {
            return Ok(true);
        }
        self.op
            .exists(key)
            .await
            .map_err(|e| BlobError::TransportError(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.op
            .delete(key)
            .await
            .map_err(|e| BlobError::TransportError(e.to_string()))?;
        self.cache.delete(key).await
    }
}
