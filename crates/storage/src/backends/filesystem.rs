//! Local filesystem storage backend.
//!
//! Every object `<key>` is stored as three files next to each other:
//! - `<key>.<uuid>.data`: the content
//! - `<key>.link`: a JSON descriptor naming the data file and holding the
//!   object metadata
//!
//! The descriptor is first written under a temporary name and then hard
//! linked to `<key>.link`. Creating that link is the atomic step that makes
//! the object visible; it fails if the link already exists, which gives
//! create-if-absent semantics without locks.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ContinuationToken, ListingOptions, ListingPage, Metadata, ObjectSource,
    ObjectStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const LINK_SUFFIX: &str = ".link";

/// Contents of a `.link` file.
#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    /// File name of the data file, relative to the descriptor's directory.
    data: String,
    #[serde(default)]
    metadata: Metadata,
}

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Validate a key and map it to the path its files are derived from.
    ///
    /// Runs in `spawn_blocking` because symlink checks hit the filesystem.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        run_blocking(move || Self::key_path_sync(&root, &key)).await
    }

    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let path = root.join(key);
        Self::check_within_root(root, &path, key)?;
        Ok(path)
    }

    /// Verify that the nearest existing ancestor of `path` resolves inside
    /// the root, so that symlinked directories cannot redirect writes.
    fn check_within_root(root: &Path, path: &Path, key: &str) -> StorageResult<()> {
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        let mut ancestor = path;
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;
                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }
        Ok(())
    }

    async fn read_descriptor(&self, key: &str, path: &Path) -> StorageResult<Descriptor> {
        let raw = fs::read(with_suffix(path, LINK_SUFFIX))
            .await
            .map_err(|e| not_found_or_io(e, key))?;
        serde_json::from_slice(&raw).map_err(|e| {
            StorageError::Serialization(format!("corrupt descriptor for {key}: {e}"))
        })
    }

    fn create_exclusive_sync(
        path: &Path,
        key: &str,
        metadata: Metadata,
        mut source: Box<dyn ObjectSource>,
    ) -> StorageResult<()> {
        let link_path = with_suffix(path, LINK_SUFFIX);
        if std::fs::symlink_metadata(&link_path).is_ok() {
            return Err(StorageError::PreconditionFailed(key.to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let id = Uuid::new_v4();
        let data_path = with_suffix(path, &format!(".{id}.data"));
        let temp_descriptor_path = with_suffix(path, &format!(".{id}.json"));
        let data_name = data_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;

        let linked = (|| -> StorageResult<bool> {
            source.seek(SeekFrom::Start(0))?;
            let mut data = std::fs::File::create_new(&data_path)?;
            io::copy(&mut source, &mut data)?;
            data.sync_all()?;

            let descriptor = Descriptor {
                data: data_name,
                metadata,
            };
            let encoded = serde_json::to_vec(&descriptor)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let mut temp = std::fs::File::create_new(&temp_descriptor_path)?;
            temp.write_all(&encoded)?;
            temp.sync_all()?;

            match std::fs::hard_link(&temp_descriptor_path, &link_path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(StorageError::Io(e)),
            }
        })();

        if let Err(e) = std::fs::remove_file(&temp_descriptor_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %temp_descriptor_path.display(), error = %e, "failed to remove temporary descriptor");
        }
        match linked {
            Ok(true) => Ok(()),
            Ok(false) => {
                remove_quietly(&data_path);
                Err(StorageError::PreconditionFailed(key.to_string()))
            }
            Err(e) => {
                remove_quietly(&data_path);
                Err(e)
            }
        }
    }

    fn list_sync(root: &Path, prefix: &str) -> StorageResult<Vec<String>> {
        // Start at the deepest directory the prefix pins down.
        let start_rel = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let start = if start_rel.is_empty() {
            root.to_path_buf()
        } else {
            if Path::new(start_rel)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {prefix}"
                )));
            }
            root.join(start_rel)
        };

        let mut keys = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            for entry in entries {
                let entry = entry?;
                // file_type() does not follow symlinks, so links out of the root are skipped.
                let file_type = entry.file_type()?;
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if file_type.is_dir() {
                    let dir_key = format!("{rel}/");
                    if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                        stack.push(path);
                    }
                } else if file_type.is_file()
                    && let Some(key) = rel.strip_suffix(LINK_SUFFIX)
                    && key.starts_with(prefix)
                {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self, metadata, source), fields(backend = "filesystem"))]
    async fn create_exclusive(
        &self,
        key: &str,
        metadata: Metadata,
        source: Box<dyn ObjectSource>,
    ) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        let owned_key = key.to_string();
        run_blocking(move || Self::create_exclusive_sync(&path, &owned_key, metadata, source))
            .await?;
        debug!(key, "created object");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let descriptor = self.read_descriptor(key, &path).await?;
        let data_path = path.with_file_name(&descriptor.data);
        let file = fs::File::open(&data_path)
            .await
            .map_err(|e| not_found_or_io(e, key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_metadata(&self, key: &str) -> StorageResult<Metadata> {
        let path = self.key_path(key).await?;
        Ok(self.read_descriptor(key, &path).await?.metadata)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        let descriptor = self.read_descriptor(key, &path).await?;
        fs::remove_file(with_suffix(&path, LINK_SUFFIX))
            .await
            .map_err(|e| not_found_or_io(e, key))?;
        match fs::remove_file(path.with_file_name(&descriptor.data)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        Ok(())
    }

    #[instrument(skip(self, options), fields(backend = "filesystem", prefix = %options.prefix))]
    async fn list_page(&self, options: &ListingOptions) -> StorageResult<ListingPage> {
        let after = match &options.start_token {
            Some(token) => Some(String::from_utf8(token.as_bytes().to_vec()).map_err(|_| {
                StorageError::InvalidContinuationToken("token is not a key".to_string())
            })?),
            None => None,
        };
        let root = self.root.clone();
        let prefix = options.prefix.clone();
        let all = run_blocking(move || Self::list_sync(&root, &prefix)).await?;

        let page_size = options.normalized_page_size();
        let start = match &after {
            Some(after) => all.partition_point(|k| k <= after),
            None => 0,
        };
        let end = (start + page_size).min(all.len());
        let keys = all[start..end].to_vec();
        let next_token = if end < all.len() {
            match keys.last() {
                Some(last) => Some(ContinuationToken::new(last.as_bytes().to_vec())?),
                None => None,
            }
        } else {
            None
        };
        Ok(ListingPage { keys, next_token })
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn health_check(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// Object keys are `/`-separated names. Each part must be non-empty, must
/// not be `.` or `..`, must not contain a backslash and must not end in the
/// link suffix.
fn validate_key(key: &str) -> StorageResult<()> {
    for part in key.split('/') {
        let reason = match part {
            "" => Some("empty part"),
            "." | ".." => Some("relative part"),
            _ if part.contains('\\') => Some("backslash"),
            _ if part.ends_with(LINK_SUFFIX) => Some("reserved suffix"),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(StorageError::InvalidKey(format!("{reason} in {key:?}")));
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn not_found_or_io(e: io::Error, key: &str) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove orphaned file");
    }
}

async fn run_blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(io::Error::other(format!("spawn_blocking failed: {e}"))))?
}
