use bytes::Bytes;
use modproxy_storage::{FilesystemBackend, Metadata, ObjectSource};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

/// Filesystem backend rooted in a temporary directory that lives as long as the fixture.
pub struct TestStore {
    pub dir: TempDir,
    pub backend: Arc<FilesystemBackend>,
}

pub async fn test_store() -> TestStore {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
    TestStore { dir, backend }
}

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

pub fn source(data: Bytes) -> Box<dyn ObjectSource> {
    Box::new(Cursor::new(data))
}

pub fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
