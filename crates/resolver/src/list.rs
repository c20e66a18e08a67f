//! Version listing: the union of what the cache holds and what the
//! authoritative source reports.

use crate::engine::{CONCAT_PREFIX, Engine, GOMOD_PREFIX, check_module_path, release_sandbox};
use crate::error::{ResolveError, ResolveResult};
use crate::pool::PoolToken;
use crate::toolchain::{self, ListOutput};
use modproxy_core::{ModuleVersion, version};
use modproxy_storage::{ListingOptions, ObjectStore};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Number of concurrent sources joined by [`Engine::list`]. Every source
/// task reports exactly once.
const LIST_SOURCES: usize = 3;

type VersionSet = Arc<Mutex<BTreeSet<String>>>;

enum SourceReport {
    Cache,
    Authoritative(Vec<String>),
}

/// Render versions as served by `@v/list`: one per line, each terminated.
pub fn render_version_list<S: AsRef<str>>(versions: &[S]) -> String {
    let mut out = String::new();
    for v in versions {
        out.push_str(v.as_ref());
        out.push('\n');
    }
    out
}

impl Engine {
    /// The known versions of `path`, rendered as a `@v/list` body.
    ///
    /// Public modules without strong consistency are answered by the parent
    /// proxy alone. Otherwise the cache and the authoritative source are
    /// read concurrently and merged; with strong consistency every version
    /// missing from the cache is fetched before answering.
    pub async fn list(&self, path: &str) -> ResolveResult<String> {
        check_module_path(path)?;
        let private = self.private_module(path).is_some();
        let strong = self.settings.strong_list_consistency;

        if !private && !strong {
            let versions = self.upstream.list(path).await?;
            return Ok(render_version_list(&versions));
        }

        let versions: VersionSet = Arc::default();
        let cancel = CancellationToken::new();
        // Stops the sibling sources if this future is dropped.
        let _cancel_on_drop = cancel.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel::<ResolveResult<SourceReport>>(LIST_SOURCES);

        for prefix in [GOMOD_PREFIX, CONCAT_PREFIX] {
            let store = self.store.clone();
            let prefix = format!("{prefix}{path}@");
            let versions = versions.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ResolveError::Cancelled),
                    r = scan_cache(store.as_ref(), &prefix, &versions) => r,
                };
                let _ = tx.send(result.map(|()| SourceReport::Cache)).await;
            });
        }
        {
            let engine = self.clone();
            let path = path.to_string();
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let source = async {
                    if private {
                        engine.list_via_toolchain(&path).await
                    } else {
                        engine.upstream.list(&path).await
                    }
                };
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ResolveError::Cancelled),
                    r = source => r,
                };
                let _ = tx.send(result.map(SourceReport::Authoritative)).await;
            });
        }
        drop(tx);

        let mut first_error: Option<ResolveError> = None;
        let mut authoritative = Vec::new();
        let mut reports = 0;
        while reports < LIST_SOURCES {
            let Some(report) = rx.recv().await else {
                break;
            };
            reports += 1;
            match report {
                Ok(SourceReport::Cache) => {}
                Ok(SourceReport::Authoritative(list)) => authoritative = list,
                Err(e) if first_error.is_none() => {
                    cancel.cancel();
                    first_error = Some(e);
                }
                Err(ResolveError::Cancelled) => {}
                Err(e) => error!(module = path, error = %e, "secondary error while listing versions"),
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if reports < LIST_SOURCES {
            return Err(ResolveError::Internal(format!(
                "{} of {LIST_SOURCES} list sources for {path} did not report",
                LIST_SOURCES - reports
            )));
        }

        if strong {
            self.fetch_missing(path, &authoritative, &versions).await?;
        } else {
            let mut set = lock(&versions);
            set.extend(authoritative);
        }

        let mut sorted: Vec<String> = lock(&versions).iter().cloned().collect();
        version::sort(&mut sorted);
        Ok(render_version_list(&sorted))
    }

    /// Resolve every authoritative version the cache does not hold yet,
    /// in parallel up to the pool capacity. Versions that fail to resolve
    /// are logged and left out.
    async fn fetch_missing(
        &self,
        path: &str,
        authoritative: &[String],
        versions: &VersionSet,
    ) -> ResolveResult<()> {
        let mut tasks = JoinSet::new();
        for v in authoritative {
            if lock(versions).contains(v) {
                continue;
            }
            let token = self.pool.acquire().await?;
            let engine = self.clone();
            let module = ModuleVersion {
                path: path.to_string(),
                version: v.clone(),
            };
            let versions = versions.clone();
            tasks.spawn(async move {
                match engine.fetch_with_token(&module, token).await {
                    Ok(()) => {
                        lock(&versions).insert(module.version);
                    }
                    Err(e) => error!(module = %module, error = %e, "failed to fetch listed version"),
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(module = path, error = %e, "version fetch task failed");
            }
        }
        Ok(())
    }

    async fn fetch_with_token(&self, module: &ModuleVersion, token: PoolToken) -> ResolveResult<()> {
        let sandbox = self.new_sandbox().await?;
        let result = self.download_and_index(&sandbox, module, token).await;
        release_sandbox(sandbox).await;
        result.map(|_| ())
    }

    /// `go list -m -versions` in a fresh sandbox.
    async fn list_via_toolchain(&self, path: &str) -> ResolveResult<Vec<String>> {
        let module = ModuleVersion {
            path: path.to_string(),
            version: String::new(),
        };
        let sandbox = self.new_sandbox().await?;
        let result = async {
            let mut token = self.pool.acquire().await?;
            self.prepare_sandbox(&sandbox, path)?;
            let invocation = self.invocation(&sandbox, toolchain::list_versions_args(path));
            let output = self.run(&invocation, &module).await;
            token.release();
            let output = output?;
            let listed: ListOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
                ResolveError::ToolchainOutput {
                    command: invocation.command_line(),
                    reason: format!("invalid JSON ({e}), output:\n{}", output.log),
                }
            })?;
            if let Some(err) = &listed.error {
                let error = ResolveError::ToolchainOutput {
                    command: invocation.command_line(),
                    reason: format!("error loading module: {}\n{}", err.message(), output.log),
                };
                return Err(self.classify(&module, error));
            }
            Ok(listed)
        }
        .await;
        release_sandbox(sandbox).await;
        let listed = result?;

        // With no tagged versions the toolchain resolved the latest
        // pseudo-version instead; cache it while the answer is fresh.
        if listed.versions.is_empty() && !listed.version.is_empty() {
            let engine = self.clone();
            let module = ModuleVersion {
                path: path.to_string(),
                version: listed.version.clone(),
            };
            tokio::spawn(async move { engine.index_discovered(module).await });
        }
        Ok(listed.versions)
    }

    /// Index a version discovered as a side effect of listing. Detached.
    async fn index_discovered(&self, module: ModuleVersion) {
        trace!(module = %module, "discovered latest version through list, caching it");
        match self.info_from_gomod(&module).await {
            Ok(_) => {
                debug!(module = %module, "discovered version is already cached");
                return;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(module = %module, error = %e, "failed to check cache for discovered version"),
        }
        let token = match self.pool.acquire().await {
            Ok(token) => token,
            Err(e) => {
                error!(module = %module, error = %e, "failed to acquire pool token");
                return;
            }
        };
        if let Err(e) = self.fetch_with_token(&module, token).await {
            error!(module = %module, error = %e, "failed to cache discovered version");
        }
    }
}

/// Add the versions named by every key under `prefix`, skipping
/// pseudo-versions.
async fn scan_cache(store: &dyn ObjectStore, prefix: &str, versions: &VersionSet) -> ResolveResult<()> {
    let mut options = ListingOptions::new(prefix);
    loop {
        let page = store.list_page(&options).await?;
        {
            let mut set = lock(versions);
            for key in &page.keys {
                if let Some(v) = key.strip_prefix(prefix)
                    && !version::is_pseudo_version(v)
                {
                    set.insert(v.to_string());
                }
            }
        }
        match page.next_token {
            Some(token) => options = options.with_start_token(token),
            None => return Ok(()),
        }
    }
}

fn lock(versions: &VersionSet) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
    versions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
