//! The resolution engine: answers module queries from the object store,
//! falling back to the toolchain and indexing what it fetched.

use crate::DataStream;
use crate::classify::{NeverNotFound, NotFoundPolicy, quick_not_found};
use crate::concat::{self, ConcatEncoder};
use crate::environ::Environ;
use crate::error::{ResolveError, ResolveResult};
use crate::gitconfig::GitConfig;
use crate::pool::{Pool, PoolToken};
use crate::runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner, shell_quote};
use crate::sandbox::Sandbox;
use crate::shared_file::SharedFile;
use crate::toolchain::{self, DownloadOutput};
use crate::upstream::UpstreamClient;
use futures::StreamExt;
use modproxy_core::config::{HttpProxyConfig, PrivateModuleConfig, ResolverConfig};
use modproxy_core::{Info, LATEST, ModuleVersion, escape_path};
use modproxy_storage::{Metadata, ObjectStore, StorageError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, info, trace};

pub(crate) const CONCAT_PREFIX: &str = "concat/";
pub(crate) const GOMOD_PREFIX: &str = "gomod/";
pub(crate) const ZIP_PREFIX: &str = "zip/";

/// Metadata key on `gomod/` objects holding the commit time (RFC 3339, UTC).
pub const COMMIT_TIME_METADATA_KEY: &str = "gomod-commit-time";

const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(20);

pub(crate) fn object_key(prefix: &str, path: &str, version: &str) -> String {
    format!("{prefix}{path}@{version}")
}

/// Settings fixed at construction.
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) go_binary: PathBuf,
    pub(crate) scratch_dir: PathBuf,
    /// GOPROXY for public modules: the parent proxy, then direct.
    pub(crate) go_proxy: String,
    pub(crate) private_modules: Vec<PrivateModuleConfig>,
    pub(crate) credential_helper: Option<String>,
    pub(crate) go_sumdb: Option<String>,
    pub(crate) http_proxy: HttpProxyConfig,
    pub(crate) strong_list_consistency: bool,
}

/// Result of running the toolchain for one module version.
pub(crate) struct Downloaded {
    pub(crate) info: Info,
    pub(crate) output: DownloadOutput,
    /// False when another writer created the concat object first.
    pub(crate) indexed_here: bool,
}

/// Resolves module queries and maintains the cache index.
///
/// Cheap to clone; clones share the pool, store and runner.
#[derive(Clone)]
pub struct Engine {
    pub(crate) settings: Arc<Settings>,
    pub(crate) base_environ: Arc<Environ>,
    pub(crate) pool: Pool,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) upstream: UpstreamClient,
    pub(crate) not_found: Arc<dyn NotFoundPolicy>,
}

impl Engine {
    /// Create an engine that runs the real toolchain.
    ///
    /// The scratch directory is created if needed and resolved to its
    /// canonical path, since the toolchain reports canonical file names.
    pub fn new(config: &ResolverConfig, store: Arc<dyn ObjectStore>) -> ResolveResult<Self> {
        config.validate().map_err(ResolveError::Config)?;

        let parent_proxy = config.parent_proxy.trim_end_matches('/');
        if parent_proxy.contains([',', '|']) {
            return Err(ResolveError::Config(format!(
                "resolver.parent_proxy {parent_proxy:?} must not contain ',' or '|'"
            )));
        }
        std::fs::create_dir_all(&config.scratch_dir).map_err(|e| {
            ResolveError::Config(format!(
                "failed to create scratch directory {}: {e}",
                config.scratch_dir.display()
            ))
        })?;
        let scratch_dir = std::fs::canonicalize(&config.scratch_dir).map_err(|e| {
            ResolveError::Config(format!(
                "failed to resolve scratch directory {}: {e}",
                config.scratch_dir.display()
            ))
        })?;

        let settings = Settings {
            go_binary: config.go_binary.clone(),
            scratch_dir,
            go_proxy: format!("{parent_proxy},direct"),
            private_modules: config.private_modules.clone(),
            credential_helper: config.git_credential_helper.clone(),
            go_sumdb: config.sum_database.as_ref().map(|db| db.go_sumdb_env()),
            http_proxy: config.http_proxy.clone(),
            strong_list_consistency: config.strong_list_consistency,
        };

        Ok(Self {
            settings: Arc::new(settings),
            base_environ: Arc::new(Environ::toolchain_base(|name| std::env::var_os(name))),
            pool: Pool::new(config.max_parallel_commands)?,
            store,
            runner: Arc::new(ProcessRunner),
            upstream: UpstreamClient::new(parent_proxy, config.upstream_timeout())?,
            not_found: Arc::new(NeverNotFound),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_not_found_policy(mut self, policy: Arc<dyn NotFoundPolicy>) -> Self {
        self.not_found = policy;
        self
    }

    pub fn with_base_environ(mut self, environ: Environ) -> Self {
        self.base_environ = Arc::new(environ);
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamClient) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.settings.scratch_dir
    }

    /// Check that the toolchain works and that the scratch directory is not
    /// inside a module.
    ///
    /// `go mod download` without arguments must fail with "no modules
    /// specified"; if it succeeds, the sandboxes would inherit an enclosing
    /// module.
    pub async fn self_check(&self) -> ResolveResult<()> {
        let sandbox = self.new_sandbox().await?;
        let invocation = self.invocation(&sandbox, toolchain::self_check_args());
        let result = tokio::time::timeout(SELF_CHECK_TIMEOUT, self.runner.run(&invocation)).await;
        release_sandbox(sandbox).await;

        match result {
            Err(_) => Err(ResolveError::Command {
                command: invocation.command_line(),
                reason: format!("timed out after {}s", SELF_CHECK_TIMEOUT.as_secs()),
                log: String::new(),
            }),
            Ok(Ok(_)) => Err(ResolveError::Config(format!(
                "scratch directory {} appears invalid because {} succeeded unexpectedly",
                self.settings.scratch_dir.display(),
                invocation.command_line()
            ))),
            Ok(Err(ResolveError::Command { log, .. })) if self_check_passed(&log) => {
                debug!(dir = %self.settings.scratch_dir.display(), "toolchain self check passed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Version metadata for `path@version`.
    pub async fn info(&self, path: &str, version: &str) -> ResolveResult<Info> {
        let module = check_module_version(path, version)?;

        match self.info_from_gomod(&module).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }
        match self.info_from_concat(&module).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let token = self.pool.acquire().await?;
        let sandbox = self.new_sandbox().await?;
        let result = match self.download_and_index(&sandbox, &module, token).await {
            Ok(downloaded) if downloaded.indexed_here => indexed_info(downloaded.info),
            Ok(_) => self.stored_info(&module).await,
            Err(e) => Err(e),
        };
        release_sandbox(sandbox).await;
        result
    }

    /// The `go.mod` manifest of `path@version`.
    pub async fn go_mod(&self, path: &str, version: &str) -> ResolveResult<DataStream> {
        let module = check_module_version(path, version)?;

        match self.permanent_object(GOMOD_PREFIX, &module).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }
        match self.go_mod_from_concat(&module).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let token = self.pool.acquire().await?;
        let sandbox = self.new_sandbox().await?;
        let result = match self.download_and_index(&sandbox, &module, token).await {
            Ok(downloaded) if downloaded.indexed_here => {
                open_output(&sandbox, downloaded.output.go_mod.as_deref(), "GoMod")
            }
            Ok(_) => match self.go_mod_from_concat(&module).await {
                Err(e) if e.is_not_found() => self.permanent_object(GOMOD_PREFIX, &module).await,
                other => other,
            },
            Err(e) => Err(e),
        };
        release_sandbox(sandbox).await;
        result
    }

    /// The source archive of `path@version`.
    pub async fn zip(&self, path: &str, version: &str) -> ResolveResult<DataStream> {
        let module = check_module_version(path, version)?;

        match self.permanent_object(ZIP_PREFIX, &module).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }
        match self.zip_from_concat(&module).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let token = self.pool.acquire().await?;
        let sandbox = self.new_sandbox().await?;
        let result = match self.download_and_index(&sandbox, &module, token).await {
            Ok(downloaded) if downloaded.indexed_here => {
                open_output(&sandbox, downloaded.output.zip.as_deref(), "Zip")
            }
            Ok(_) => match self.zip_from_concat(&module).await {
                Err(e) if e.is_not_found() => self.permanent_object(ZIP_PREFIX, &module).await,
                other => other,
            },
            Err(e) => Err(e),
        };
        release_sandbox(sandbox).await;
        result
    }

    /// The latest version of `path`.
    ///
    /// Public modules ask the parent proxy. With strong list consistency the
    /// answer is also made resolvable from the cache before it is returned.
    pub async fn latest(&self, path: &str) -> ResolveResult<Info> {
        check_module_path(path)?;

        let mut version = LATEST.to_string();
        if self.private_module(path).is_none() {
            let upstream = self.upstream.latest(path).await?;
            if !self.settings.strong_list_consistency {
                return Ok(upstream);
            }
            trace!(module = path, version = %upstream.version, "latest from parent proxy, ensuring it is cached");
            let module = ModuleVersion::new(path, upstream.version)
                .map_err(|e| ResolveError::not_found(e.to_string()))?;
            match self.stored_info(&module).await {
                Err(e) if e.is_not_found() => {}
                other => return other,
            }
            version = module.version;
        }

        let module = ModuleVersion::new(path, version)
            .map_err(|e| ResolveError::not_found(e.to_string()))?;
        let token = self.pool.acquire().await?;
        let sandbox = self.new_sandbox().await?;
        let result = match self.download_and_index(&sandbox, &module, token).await {
            Ok(downloaded) if downloaded.indexed_here => indexed_info(downloaded.info),
            Ok(downloaded) => {
                let resolved = ModuleVersion {
                    path: module.path.clone(),
                    version: downloaded.info.version,
                };
                self.stored_info(&resolved).await
            }
            Err(e) => Err(e),
        };
        release_sandbox(sandbox).await;
        result
    }

    /// Info from the transitional object, then the permanent one.
    pub(crate) async fn stored_info(&self, module: &ModuleVersion) -> ResolveResult<Info> {
        match self.info_from_concat(module).await {
            Err(e) if e.is_not_found() => self.info_from_gomod(module).await,
            other => other,
        }
    }

    pub(crate) async fn info_from_gomod(&self, module: &ModuleVersion) -> ResolveResult<Info> {
        let key = object_key(GOMOD_PREFIX, &module.path, &module.version);
        let metadata = self.store.get_metadata(&key).await?;
        let raw = metadata
            .get(COMMIT_TIME_METADATA_KEY)
            .map(String::as_str)
            .unwrap_or_default();
        let time = OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| {
            ResolveError::InvalidMetadata {
                key: key.clone(),
                reason: format!("{COMMIT_TIME_METADATA_KEY} {raw:?}: {e}"),
            }
        })?;
        Ok(Info::new(module.version.clone(), time))
    }

    async fn info_from_concat(&self, module: &ModuleVersion) -> ResolveResult<Info> {
        let mut reader = self.concat_reader(module).await?;
        let header = concat::parse_header(&mut reader).await?;
        Ok(Info::new(module.version.clone(), header.commit_time))
    }

    async fn go_mod_from_concat(&self, module: &ModuleVersion) -> ResolveResult<DataStream> {
        let mut reader = self.concat_reader(module).await?;
        let header = concat::parse_header(&mut reader).await?;
        Ok(concat::manifest_stream(header, reader))
    }

    async fn zip_from_concat(&self, module: &ModuleVersion) -> ResolveResult<DataStream> {
        let mut reader = self.concat_reader(module).await?;
        let header = concat::parse_header(&mut reader).await?;
        Ok(concat::archive_stream(header, reader).await?)
    }

    async fn concat_reader(
        &self,
        module: &ModuleVersion,
    ) -> ResolveResult<StreamReader<DataStream, bytes::Bytes>> {
        let key = object_key(CONCAT_PREFIX, &module.path, &module.version);
        let stream = self.store.get_stream(&key).await?;
        Ok(StreamReader::new(storage_stream(stream)))
    }

    async fn permanent_object(&self, prefix: &str, module: &ModuleVersion) -> ResolveResult<DataStream> {
        let key = object_key(prefix, &module.path, &module.version);
        Ok(storage_stream(self.store.get_stream(&key).await?))
    }

    /// The private module rule covering `path`, first match wins.
    pub(crate) fn private_module(&self, path: &str) -> Option<&PrivateModuleConfig> {
        self.settings
            .private_modules
            .iter()
            .find(|rule| modproxy_core::path_is_lexical_descendant(path, &rule.path_prefix))
    }

    pub(crate) async fn new_sandbox(&self) -> ResolveResult<Sandbox> {
        Ok(Sandbox::create(&self.settings.scratch_dir, &self.base_environ).await?)
    }

    /// Point the sandbox at the right proxy, checksum database and
    /// credentials for `path`.
    pub(crate) fn prepare_sandbox(&self, sandbox: &Sandbox, path: &str) -> ResolveResult<()> {
        let mut git_config = GitConfig::new();
        match self.private_module(path) {
            Some(rule) => {
                if rule.credential_helper {
                    let helper = self.settings.credential_helper.as_deref().ok_or_else(|| {
                        ResolveError::Config(format!(
                            "private module prefix {:?} needs a git credential helper",
                            rule.path_prefix
                        ))
                    })?;
                    git_config.add(
                        "credential",
                        "helper",
                        format!("!{helper} --go-module-path={}", shell_quote(path)),
                    );
                    git_config.add("credential", "useHttpPath", "true");
                }
                sandbox.set_env("GOPROXY", "direct");
                sandbox.set_env("GOSUMDB", "off");
            }
            None => {
                sandbox.set_env("GOPROXY", self.settings.go_proxy.clone());
                match &self.settings.go_sumdb {
                    Some(sumdb) => sandbox.set_env("GOSUMDB", sumdb.clone()),
                    None => sandbox.unset_env("GOSUMDB"),
                }
            }
        }
        sandbox.set_env("no_proxy", self.settings.http_proxy.no_proxy.clone());
        sandbox.set_env("https_proxy", self.settings.http_proxy.https_proxy.clone());
        sandbox.write_git_config(&git_config)?;
        Ok(())
    }

    pub(crate) fn invocation(&self, sandbox: &Sandbox, args: Vec<String>) -> Invocation {
        Invocation {
            program: self.settings.go_binary.clone(),
            args,
            dir: sandbox.work_dir().to_path_buf(),
            env: sandbox.environ(),
        }
    }

    /// Run an invocation, letting the not-found policy reclassify failures.
    pub(crate) async fn run(
        &self,
        invocation: &Invocation,
        module: &ModuleVersion,
    ) -> ResolveResult<CommandOutput> {
        self.runner
            .run(invocation)
            .await
            .map_err(|e| self.classify(module, e))
    }

    pub(crate) fn classify(&self, module: &ModuleVersion, error: ResolveError) -> ResolveError {
        if !error.is_not_found() && self.not_found.is_not_found(module, &error) {
            return ResolveError::NotFound(error.to_string());
        }
        error
    }

    /// Fetch `module` with the toolchain and create its concat object.
    ///
    /// `token` is released as soon as the toolchain exits. If this call
    /// created the concat object, the split into permanent objects is
    /// started in the background.
    pub(crate) async fn download_and_index(
        &self,
        sandbox: &Sandbox,
        module: &ModuleVersion,
        mut token: PoolToken,
    ) -> ResolveResult<Downloaded> {
        self.prepare_sandbox(sandbox, &module.path)?;
        let invocation = self.invocation(sandbox, toolchain::download_args(&module.path, &module.version));
        let command = invocation.command_line();
        let result = self.run(&invocation, module).await;
        token.release();
        let output = result?;

        let download: DownloadOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            ResolveError::ToolchainOutput {
                command: command.clone(),
                reason: format!("invalid JSON ({e}), output:\n{}", output.log),
            }
        })?;
        if let Some(err) = &download.error {
            let error = ResolveError::ToolchainOutput {
                command: command.clone(),
                reason: format!("error loading module: {}\n{}", err.message(), output.log),
            };
            return Err(self.classify(module, error));
        }

        let info_path = required_path(&command, download.info.as_deref(), "Info")?;
        let info_json = tokio::fs::read(info_path).await?;
        let info: Info = serde_json::from_slice(&info_json).map_err(|e| {
            ResolveError::ToolchainOutput {
                command: command.clone(),
                reason: format!("invalid .info file {}: {e}", info_path.display()),
            }
        })?;
        let consistent = if module.is_latest() {
            info.version != LATEST && !info.version.is_empty()
        } else {
            info.version == module.version
        };
        if !consistent {
            return Err(ResolveError::ToolchainOutput {
                command,
                reason: format!(
                    ".info file has version {:?}, inconsistent with requested version {:?}",
                    info.version, module.version
                ),
            });
        }

        let go_mod = SharedFile::open(required_path(&command, download.go_mod.as_deref(), "GoMod")?)?;
        let zip = SharedFile::open(required_path(&command, download.zip.as_deref(), "Zip")?)?;
        let encoder = ConcatEncoder::new(info.time, go_mod.add_ref(), zip.add_ref())?;

        let resolved = ModuleVersion {
            path: module.path.clone(),
            version: info.version.clone(),
        };
        let key = object_key(CONCAT_PREFIX, &resolved.path, &resolved.version);
        let indexed_here = match self
            .store
            .create_exclusive(&key, Metadata::new(), Box::new(encoder))
            .await
        {
            Ok(()) => {
                info!(key = %key, "stored object");
                tokio::spawn(split_concat(
                    self.store.clone(),
                    sandbox.add_ref(),
                    info.time,
                    go_mod,
                    zip,
                    resolved,
                ));
                true
            }
            Err(e) if e.is_precondition_failed() => {
                debug!(key = %key, "concat object already exists");
                false
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Downloaded {
            info,
            output: download,
            indexed_here,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("pool", &self.pool)
            .field("backend", &self.store.backend_name())
            .finish_non_exhaustive()
    }
}

/// Split a concat object into the permanent `gomod/` and `zip/` objects,
/// then delete it. Runs detached; failures are logged and leave the concat
/// object in place for readers.
async fn split_concat(
    store: Arc<dyn ObjectStore>,
    sandbox: Sandbox,
    commit_time: OffsetDateTime,
    go_mod: SharedFile,
    zip: SharedFile,
    module: ModuleVersion,
) {
    if let Err(e) = store_split(store.as_ref(), commit_time, &go_mod, &zip, &module).await {
        error!(module = %module, error = %e, "failed to index module");
    }
    for file in [go_mod, zip] {
        let path = file.path().to_path_buf();
        if let Err(e) = file.release() {
            error!(module = %module, path = %path.display(), error = %e, "failed to close file");
        }
    }
    release_sandbox(sandbox).await;
}

/// The split steps, each idempotent: an object that already exists and a
/// concat object that is already gone both count as done.
pub(crate) async fn store_split(
    store: &dyn ObjectStore,
    commit_time: OffsetDateTime,
    go_mod: &SharedFile,
    zip: &SharedFile,
    module: &ModuleVersion,
) -> ResolveResult<()> {
    let key = object_key(GOMOD_PREFIX, &module.path, &module.version);
    let mut metadata = Metadata::new();
    metadata.insert(
        COMMIT_TIME_METADATA_KEY.to_string(),
        format_commit_time(commit_time).map_err(|reason| ResolveError::InvalidMetadata {
            key: key.clone(),
            reason,
        })?,
    );
    go_mod.rewind()?;
    create_if_absent(store, &key, metadata, Box::new(go_mod.add_ref())).await?;

    let key = object_key(ZIP_PREFIX, &module.path, &module.version);
    zip.rewind()?;
    create_if_absent(store, &key, Metadata::new(), Box::new(zip.add_ref())).await?;

    let key = object_key(CONCAT_PREFIX, &module.path, &module.version);
    match store.delete(&key).await {
        Ok(()) => info!(key = %key, "deleted object"),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn create_if_absent(
    store: &dyn ObjectStore,
    key: &str,
    metadata: Metadata,
    source: Box<dyn modproxy_storage::ObjectSource>,
) -> ResolveResult<()> {
    match store.create_exclusive(key, metadata, source).await {
        Ok(()) => {
            info!(key, "stored object");
            Ok(())
        }
        Err(e) if e.is_precondition_failed() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The answer the cache gives once `info` is indexed: UTC whole seconds and
/// no origin.
fn indexed_info(info: Info) -> ResolveResult<Info> {
    let time = OffsetDateTime::from_unix_timestamp(info.time.unix_timestamp())
        .map_err(|e| ResolveError::Internal(format!("commit time out of range: {e}")))?;
    Ok(Info::new(info.version, time))
}

/// RFC 3339 in UTC, whole seconds.
fn format_commit_time(commit_time: OffsetDateTime) -> Result<String, String> {
    OffsetDateTime::from_unix_timestamp(commit_time.unix_timestamp())
        .map_err(|e| e.to_string())?
        .format(&Rfc3339)
        .map_err(|e| e.to_string())
}

pub(crate) async fn release_sandbox(sandbox: Sandbox) {
    let dir = sandbox.tmp_dir().to_path_buf();
    if let Err(e) = sandbox.release().await {
        error!(dir = %dir.display(), error = %e, "failed to remove sandbox");
    }
}

fn storage_stream(stream: modproxy_storage::ByteStream) -> DataStream {
    Box::pin(stream.map(|chunk| {
        chunk.map_err(|e| match e {
            StorageError::Io(e) => e,
            other => io::Error::other(other),
        })
    }))
}

fn open_output(sandbox: &Sandbox, path: Option<&Path>, field: &str) -> ResolveResult<DataStream> {
    let path = path.ok_or_else(|| ResolveError::Internal(format!("toolchain output has no {field} file")))?;
    let file = sandbox.open(path)?;
    Ok(Box::pin(ReaderStream::new(file)))
}

fn required_path<'a>(command: &str, path: Option<&'a Path>, field: &str) -> ResolveResult<&'a Path> {
    path.filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ResolveError::ToolchainOutput {
            command: command.to_string(),
            reason: format!("output has no {field} file"),
        })
}

fn self_check_passed(log: &str) -> bool {
    log.lines().any(|line| {
        line.strip_prefix("stderr: ")
            .is_some_and(|message| message.ends_with(toolchain::SELF_CHECK_EXPECTED))
    })
}

/// Reject module paths that cannot name a module.
pub(crate) fn check_module_path(path: &str) -> ResolveResult<()> {
    if let Some(err) = quick_not_found(path) {
        return Err(err);
    }
    let malformed = path.is_empty()
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || path.contains('@')
        || escape_path(path).is_err();
    if malformed {
        return Err(ResolveError::not_found(format!("invalid module path {path:?}")));
    }
    Ok(())
}

fn check_module_version(path: &str, version: &str) -> ResolveResult<ModuleVersion> {
    check_module_path(path)?;
    let module =
        ModuleVersion::new(path, version).map_err(|e| ResolveError::not_found(e.to_string()))?;
    if module.is_latest() {
        return Err(ResolveError::not_found(format!(
            "module version {LATEST:?} is invalid"
        )));
    }
    if !module.has_canonical_version() {
        return Err(ResolveError::not_found(format!(
            "module version {version:?} is not canonical"
        )));
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modproxy_storage::{FilesystemBackend, ObjectStoreExt};
    use std::io::Write;
    use time::macros::datetime;

    fn shared(dir: &Path, name: &str, contents: &[u8]) -> SharedFile {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(contents).unwrap();
        SharedFile::open(path).unwrap()
    }

    #[tokio::test]
    async fn split_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBackend::new(dir.path().join("store")).await.unwrap();
        let module = ModuleVersion::new("example.com/a", "v1.0.0").unwrap();
        let commit_time = datetime!(2019-11-09 02:19:31 UTC);
        let go_mod = shared(dir.path(), "go.mod", b"module example.com/a\n");
        let zip = shared(dir.path(), "a.zip", b"PK zip");

        let encoder = ConcatEncoder::new(commit_time, go_mod.add_ref(), zip.add_ref()).unwrap();
        store
            .create_exclusive("concat/example.com/a@v1.0.0", Metadata::new(), Box::new(encoder))
            .await
            .unwrap();

        for _ in 0..2 {
            store_split(&store, commit_time, &go_mod, &zip, &module).await.unwrap();
            assert_eq!(
                &store.get_bytes("gomod/example.com/a@v1.0.0").await.unwrap()[..],
                b"module example.com/a\n"
            );
            assert_eq!(&store.get_bytes("zip/example.com/a@v1.0.0").await.unwrap()[..], b"PK zip");
            assert!(
                store
                    .get_metadata("concat/example.com/a@v1.0.0")
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
        }
        let metadata = store.get_metadata("gomod/example.com/a@v1.0.0").await.unwrap();
        assert_eq!(metadata[COMMIT_TIME_METADATA_KEY], "2019-11-09T02:19:31Z");
        assert!(go_mod.release().unwrap());
        assert!(zip.release().unwrap());
    }

    #[tokio::test]
    async fn split_keeps_existing_permanent_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBackend::new(dir.path().join("store")).await.unwrap();
        let module = ModuleVersion::new("example.com/a", "v1.0.0").unwrap();
        store
            .create_exclusive(
                "zip/example.com/a@v1.0.0",
                Metadata::new(),
                Box::new(std::io::Cursor::new(b"first".to_vec())),
            )
            .await
            .unwrap();

        let go_mod = shared(dir.path(), "go.mod", b"module example.com/a\n");
        let zip = shared(dir.path(), "a.zip", b"second");
        store_split(&store, datetime!(2020-01-01 00:00:00 UTC), &go_mod, &zip, &module)
            .await
            .unwrap();
        assert_eq!(&store.get_bytes("zip/example.com/a@v1.0.0").await.unwrap()[..], b"first");
    }

    #[test]
    fn object_keys() {
        assert_eq!(
            object_key(CONCAT_PREFIX, "example.com/a", "v1.0.0"),
            "concat/example.com/a@v1.0.0"
        );
        assert_eq!(object_key(ZIP_PREFIX, "x.org/b/c", "v0.1.0"), "zip/x.org/b/c@v0.1.0");
    }

    #[test]
    fn commit_time_is_whole_seconds_utc() {
        let t = datetime!(2019-11-09 03:19:31.75 +01:00);
        assert_eq!(format_commit_time(t).unwrap(), "2019-11-09T02:19:31Z");
    }

    #[test]
    fn self_check_log_matching() {
        assert!(self_check_passed(
            "stderr: go: downloading\nstderr: go mod download: no modules specified\n"
        ));
        assert!(!self_check_passed("stdout: go mod download: no modules specified\n"));
        assert!(!self_check_passed("stderr: go: go.mod file not found\n"));
    }

    #[test]
    fn module_path_checks() {
        assert!(check_module_path("example.com/a").is_ok());
        assert!(check_module_path("github.com/acme/widget/v2").is_ok());
        for bad in ["", "github.com/acme", "example.com//a", "example.com/../a", "a@b", "ex!ample.com"] {
            let err = check_module_path(bad).unwrap_err();
            assert!(err.is_not_found(), "{bad:?}: {err}");
        }
    }

    #[test]
    fn version_checks() {
        assert!(check_module_version("example.com/a", "v1.2.3").is_ok());
        assert!(check_module_version("example.com/a", "v0.0.0-20191109021931-daa7c04131f5").is_ok());
        for bad in ["latest", "", "1.2.3", "v1.2", "master"] {
            assert!(check_module_version("example.com/a", bad).unwrap_err().is_not_found());
        }
    }
}
