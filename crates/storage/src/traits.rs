//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::io::{Read, Seek};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of object keys.
pub type KeyStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send + 'a>>;

/// Small string map stored alongside an object.
pub type Metadata = BTreeMap<String, String>;

/// Source of an object's content.
///
/// The store may rewind the source to the start and read it more than once
/// (for example when retrying an upload).
pub trait ObjectSource: Read + Seek + Send + 'static {}

impl<T: Read + Seek + Send + 'static> ObjectSource for T {}

/// Page size constraints for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 10000;

/// Maximum size for continuation tokens (2 KB).
pub const MAX_TOKEN_SIZE: usize = 2048;

/// An opaque continuation token for resuming listing operations.
///
/// This token is backend-specific and should not be parsed or modified.
#[derive(Clone, PartialEq, Eq)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    /// Create a new continuation token from raw bytes.
    ///
    /// Returns an error if the token exceeds MAX_TOKEN_SIZE.
    pub fn new(data: Vec<u8>) -> StorageResult<Self> {
        if data.len() > MAX_TOKEN_SIZE {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token too large: {} bytes (max: {})",
                data.len(),
                MAX_TOKEN_SIZE
            )));
        }
        Ok(Self(data))
    }

    /// Get the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContinuationToken")
            .field(&"<redacted>")
            .finish()
    }
}

/// A single page of listing results.
#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    /// Object keys in this page, in ascending order. May be shorter than
    /// the requested page size even when more pages follow.
    pub keys: Vec<String>,

    /// Continuation token for the next page. None on the last page.
    pub next_token: Option<ContinuationToken>,
}

/// Options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingOptions {
    /// Only keys starting with this prefix are listed.
    pub prefix: String,

    /// Number of keys to fetch per page, clamped to [MIN_PAGE_SIZE, MAX_PAGE_SIZE].
    pub page_size: usize,

    /// Token returned by the previous page, if resuming.
    pub start_token: Option<ContinuationToken>,
}

impl ListingOptions {
    /// List everything under `prefix` with the default page size.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            page_size: DEFAULT_PAGE_SIZE,
            start_token: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_start_token(mut self, token: ContinuationToken) -> Self {
        self.start_token = Some(token);
        self
    }

    /// Get the normalized page size.
    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

/// Write-once object store.
///
/// Objects are immutable once created: they can be read or deleted but
/// never overwritten.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Create an object only if no object with this key exists.
    ///
    /// Returns `StorageError::PreconditionFailed` if the key is taken. When
    /// several callers race on the same key exactly one of them succeeds.
    async fn create_exclusive(
        &self,
        key: &str,
        metadata: Metadata,
        source: Box<dyn ObjectSource>,
    ) -> StorageResult<()>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Get the metadata stored with an object.
    async fn get_metadata(&self, key: &str) -> StorageResult<Metadata>;

    /// Delete an object. Returns `StorageError::NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Fetch one page of keys.
    async fn list_page(&self, options: &ListingOptions) -> StorageResult<ListingPage>;

    /// Get the name of this storage backend.
    ///
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup. The default implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Convenience methods built on top of [`ObjectStore`].
///
/// Automatically implemented for every `ObjectStore`.
pub trait ObjectStoreExt: ObjectStore {
    /// List every key under `prefix` as a flat stream, following continuation
    /// tokens page by page.
    fn list_stream<'a>(&'a self, prefix: &str) -> KeyStream<'a> {
        let mut options = ListingOptions::new(prefix);
        let stream = async_stream::try_stream! {
            loop {
                let page = self.list_page(&options).await?;
                for key in page.keys {
                    yield key;
                }
                match page.next_token {
                    Some(token) => options.start_token = Some(token),
                    None => break,
                }
            }
        };
        Box::pin(stream)
    }

    /// Read a whole object into memory. Only for small objects.
    fn get_bytes<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = StorageResult<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let mut stream = self.get_stream(key).await?;
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok(buf.freeze())
        })
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_token_rejects_oversized_data() {
        let err = ContinuationToken::new(vec![b'a'; MAX_TOKEN_SIZE + 1]).unwrap_err();
        assert!(err.to_string().contains("too large"));

        let token = ContinuationToken::new(b"gomod/example.com/a@v1.0.0".to_vec()).unwrap();
        assert_eq!(token.as_bytes(), b"gomod/example.com/a@v1.0.0");
    }

    #[test]
    fn test_continuation_token_debug_is_redacted() {
        let token = ContinuationToken::new(b"secret".to_vec()).unwrap();
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[test]
    fn test_listing_options_clamps_page_size() {
        assert_eq!(ListingOptions::new("").with_page_size(0).normalized_page_size(), 1);
        assert_eq!(
            ListingOptions::new("").with_page_size(1_000_000).normalized_page_size(),
            MAX_PAGE_SIZE
        );
    }
}
