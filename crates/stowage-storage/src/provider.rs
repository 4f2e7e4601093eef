//! Storage provider capability interface
//!
//! Every backend implements [`StorageProvider`]. Backends are selected by
//! [`ProviderKind`], parsed from the `type` field of a BackupStorage; adding a
//! backend means adding a variant and its constructor arm in
//! [`ProviderKind::construct`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::ObjectStore;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;

use stowage_common::Error;

/// Byte source handed to and returned from providers
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Object-store operations used by the run and storage controllers
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend kind
    fn kind(&self) -> ProviderKind;

    /// Upload everything `reader` yields to `path`, returning the byte count.
    ///
    /// A failed or dropped upload leaves no object behind.
    async fn put(&self, path: &str, reader: BoxReader) -> Result<u64, Error>;

    /// Stream the object at `path`
    async fn get(&self, path: &str) -> Result<BoxReader, Error>;

    /// Object paths under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Remove the object at `path`
    async fn delete(&self, path: &str) -> Result<(), Error>;

    /// Content length of the object at `path`
    async fn size(&self, path: &str) -> Result<u64, Error>;

    /// Release backend resources before the instance is dropped
    async fn destruct(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Supported backend types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Amazon S3 and S3-compatible stores
    S3,
    /// Process-local store for tests
    #[cfg(any(test, feature = "testing"))]
    Memory,
}

impl ProviderKind {
    /// Name used in `spec.type`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            #[cfg(any(test, feature = "testing"))]
            Self::Memory => "memory",
        }
    }

    /// Build and connection-test a provider for the named storage
    pub async fn construct(
        &self,
        storage: &str,
        parameters: &BTreeMap<String, String>,
        credentials: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn StorageProvider>, Error> {
        match self {
            Self::S3 => {
                let provider = crate::s3::build(storage, parameters, credentials)?;
                provider.check_connection().await?;
                Ok(Arc::new(provider))
            }
            #[cfg(any(test, feature = "testing"))]
            Self::Memory => Ok(Arc::new(ObjectStoreProvider::in_memory(storage))),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(Self::S3),
            #[cfg(any(test, feature = "testing"))]
            "memory" => Ok(Self::Memory),
            other => Err(Error::validation_for_field(
                "BackupStorage",
                "spec.type",
                format!("unknown storage provider type {:?}", other),
            )),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// [`StorageProvider`] over any `object_store` backend
pub struct ObjectStoreProvider {
    storage: String,
    kind: ProviderKind,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreProvider {
    /// Wrap an object store for the named storage
    pub fn new(storage: impl Into<String>, kind: ProviderKind, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            storage: storage.into(),
            kind,
            store,
        }
    }

    /// Provider backed by process memory
    #[cfg(any(test, feature = "testing"))]
    pub fn in_memory(storage: impl Into<String>) -> Self {
        Self::new(
            storage,
            ProviderKind::Memory,
            Arc::new(object_store::memory::InMemory::new()),
        )
    }

    /// Issue a single listing request to prove the credentials and bucket work
    pub async fn check_connection(&self) -> Result<(), Error> {
        self.store
            .list_with_delimiter(None)
            .await
            .map(|_| ())
            .map_err(|e| self.error(format!("failed to test connection: {}", e)))
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        Error::provider_for(&self.storage, self.kind.as_str(), msg)
    }

    fn object_error(&self, op: &str, path: &str, e: impl std::fmt::Display) -> Error {
        self.error(format!("{} {}: {}", op, path, e))
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn put(&self, path: &str, mut reader: BoxReader) -> Result<u64, Error> {
        let mut writer = BufWriter::new(self.store.clone(), Path::from(path));
        let written = match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(self.object_error("upload", path, e));
            }
        };
        writer
            .shutdown()
            .await
            .map_err(|e| self.object_error("complete upload", path, e))?;
        debug!(storage = %self.storage, path, bytes = written, "object uploaded");
        Ok(written)
    }

    async fn get(&self, path: &str) -> Result<BoxReader, Error> {
        let result = self
            .store
            .get(&Path::from(path))
            .await
            .map_err(|e| self.object_error("download", path, e))?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let prefix = Path::from(prefix);
        self.store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| self.object_error("list", prefix.as_ref(), e))
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        self.store
            .delete(&Path::from(path))
            .await
            .map_err(|e| self.object_error("delete", path, e))
    }

    async fn size(&self, path: &str) -> Result<u64, Error> {
        let meta = self
            .store
            .head(&Path::from(path))
            .await
            .map_err(|e| self.object_error("stat", path, e))?;
        Ok(meta.size as u64)
    }
}
