//! Server test utilities.

use super::toolchain::FakeToolchain;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use modproxy_core::config::AppConfig;
use modproxy_resolver::{Engine, Environ};
use modproxy_server::{AppState, create_router};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A router over a temporary store, resolving through the fake toolchain.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub toolchain: Arc<FakeToolchain>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        // Nothing listens here; public list/latest requests fail fast.
        config.resolver.parent_proxy = "http://127.0.0.1:9".to_string();
        config.resolver.upstream_timeout_secs = 5;
        tweak(&mut config);

        let storage = modproxy_storage::from_config(&config.storage)
            .await
            .expect("Failed to create storage backend");
        let toolchain = Arc::new(FakeToolchain::default());
        let engine = Engine::new(&config.resolver, storage)
            .expect("Failed to create engine")
            .with_runner(toolchain.clone())
            .with_base_environ(Environ::toolchain_base(|_| None));

        modproxy_server::metrics::register_metrics();
        let state = AppState::new(config, engine);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            toolchain,
            _temp_dir: temp_dir,
        }
    }

    /// Issue a GET and collect the whole response.
    pub async fn get(&self, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, body.to_vec())
    }
}
