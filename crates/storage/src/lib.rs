//! Object storage abstraction and backends for the module proxy.
//!
//! This crate provides:
//! - A write-once object store contract with create-if-absent semantics
//! - Cursor-paginated prefix listing
//! - A local filesystem backend

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, ContinuationToken, KeyStream, ListingOptions, ListingPage, Metadata,
    ObjectSource, ObjectStore, ObjectStoreExt,
};

use modproxy_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        store
            .create_exclusive("hello.txt", Metadata::new(), Box::new(Cursor::new(b"hi")))
            .await
            .unwrap();
        assert_eq!(&store.get_bytes("hello.txt").await.unwrap()[..], b"hi");
    }

    #[tokio::test]
    async fn from_config_rejects_empty_path() {
        let config = StorageConfig::Filesystem {
            path: std::path::PathBuf::new(),
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
