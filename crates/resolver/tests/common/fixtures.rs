use super::toolchain::FakeToolchain;
use futures::StreamExt;
use modproxy_core::config::{PrivateModuleConfig, ResolverConfig};
use modproxy_resolver::{DataStream, Engine, Environ};
use modproxy_storage::{FilesystemBackend, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CREDENTIAL_HELPER: &str = "/usr/local/bin/git-credential-modproxy";

/// An engine over a temporary store, driven by the fake toolchain.
pub struct TestEngine {
    pub dir: TempDir,
    pub store: Arc<FilesystemBackend>,
    pub toolchain: Arc<FakeToolchain>,
    pub engine: Engine,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build with a tweaked resolver configuration. The parent proxy
    /// defaults to an address nothing listens on.
    pub async fn with_config(tweak: impl FnOnce(&mut ResolverConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemBackend::new(dir.path().join("store")).await.unwrap());
        let mut config = ResolverConfig {
            scratch_dir: dir.path().join("scratch"),
            parent_proxy: "http://127.0.0.1:9".to_string(),
            upstream_timeout_secs: 5,
            git_credential_helper: Some(CREDENTIAL_HELPER.to_string()),
            ..Default::default()
        };
        tweak(&mut config);

        let toolchain = Arc::new(FakeToolchain::new());
        let engine = Engine::new(&config, store.clone())
            .unwrap()
            .with_runner(toolchain.clone())
            .with_base_environ(Environ::toolchain_base(|_| None));
        Self {
            dir,
            store,
            toolchain,
            engine,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.engine.scratch_dir().to_path_buf()
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.get_metadata(key).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => panic!("get_metadata({key}): {e}"),
        }
    }

    /// Wait until the background split of `path@version` has finished.
    pub async fn wait_for_split(&self, path: &str, version: &str) {
        let gomod = format!("gomod/{path}@{version}");
        let zip = format!("zip/{path}@{version}");
        let concat = format!("concat/{path}@{version}");
        let (gomod, zip, concat) = (&gomod, &zip, &concat);
        wait_until(move || async move {
            self.exists(gomod).await && self.exists(zip).await && !self.exists(concat).await
        })
        .await;
    }

    /// Wait until every sandbox has been removed.
    pub async fn wait_for_empty_scratch(&self) {
        let scratch = &self.scratch_dir();
        wait_until(move || async move { std::fs::read_dir(scratch).unwrap().next().is_none() }).await;
    }
}

pub fn private_module(prefix: &str) -> PrivateModuleConfig {
    PrivateModuleConfig {
        path_prefix: prefix.to_string(),
        credential_helper: true,
    }
}

/// Poll `condition` for up to five seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

pub async fn collect(mut stream: DataStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}
