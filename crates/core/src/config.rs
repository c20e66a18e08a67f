//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Per-request timeout in seconds. Toolchain invocations for large
    /// modules can take minutes.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_secs == 0 {
            return Err("server.request_timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path must not be empty".to_string())
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// A module path prefix whose modules are fetched directly from version
/// control instead of through the parent proxy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateModuleConfig {
    /// Path prefix, matched on `/` boundaries (e.g., "github.com/acme").
    pub path_prefix: String,
    /// Configure git to ask the credential helper for these modules.
    #[serde(default = "default_true")]
    pub credential_helper: bool,
}

fn default_true() -> bool {
    true
}

/// Checksum database consulted by the toolchain for public modules.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SumDatabaseConfig {
    /// Database name (e.g., "sum.golang.org").
    pub name: String,
    /// Verifier key, without the name prefix.
    pub public_key: String,
    /// URL the toolchain should contact.
    pub url: String,
}

impl SumDatabaseConfig {
    /// Render as a GOSUMDB environment variable value.
    pub fn go_sumdb_env(&self) -> String {
        format!("{}+{} {}", self.name, self.public_key, self.url)
    }
}

/// HTTP forward proxy used by toolchain invocations.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProxyConfig {
    /// Value for `https_proxy`.
    #[serde(default)]
    pub https_proxy: String,
    /// Value for `no_proxy`.
    #[serde(default)]
    pub no_proxy: String,
}

/// Resolution engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Path to the `go` binary.
    #[serde(default = "default_go_binary")]
    pub go_binary: PathBuf,
    /// Directory under which per-request sandboxes are created. Must not be
    /// inside a Go module.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Maximum number of concurrent toolchain processes (default: 20).
    #[serde(default = "default_max_parallel_commands")]
    pub max_parallel_commands: usize,
    /// Base URL of the upstream proxy for public modules.
    #[serde(default = "default_parent_proxy")]
    pub parent_proxy: String,
    /// Timeout for requests to the parent proxy in seconds.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Make every listed version resolvable before answering a list request.
    #[serde(default)]
    pub strong_list_consistency: bool,
    /// Shell command git runs as credential helper for private modules.
    #[serde(default)]
    pub git_credential_helper: Option<String>,
    /// Private module prefixes, first match wins.
    #[serde(default)]
    pub private_modules: Vec<PrivateModuleConfig>,
    /// Checksum database for public modules. Unset leaves GOSUMDB unset.
    #[serde(default)]
    pub sum_database: Option<SumDatabaseConfig>,
    /// Forward proxy for toolchain invocations.
    #[serde(default)]
    pub http_proxy: HttpProxyConfig,
}

fn default_go_binary() -> PathBuf {
    PathBuf::from("go")
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("modproxy")
}

fn default_max_parallel_commands() -> usize {
    20
}

fn default_parent_proxy() -> String {
    "https://proxy.golang.org".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            go_binary: default_go_binary(),
            scratch_dir: default_scratch_dir(),
            max_parallel_commands: default_max_parallel_commands(),
            parent_proxy: default_parent_proxy(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            strong_list_consistency: false,
            git_credential_helper: None,
            private_modules: Vec::new(),
            sum_database: None,
            http_proxy: HttpProxyConfig::default(),
        }
    }
}

impl ResolverConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Validate resolver configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel_commands == 0 {
            return Err("resolver.max_parallel_commands must be positive".to_string());
        }
        if !self.parent_proxy.starts_with("http://") && !self.parent_proxy.starts_with("https://")
        {
            return Err(format!(
                "resolver.parent_proxy must be an http(s) URL, got {:?}",
                self.parent_proxy
            ));
        }
        if self.scratch_dir.as_os_str().is_empty() {
            return Err("resolver.scratch_dir must not be empty".to_string());
        }
        for private in &self.private_modules {
            let prefix = &private.path_prefix;
            if prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/') {
                return Err(format!(
                    "resolver.private_modules: invalid path_prefix {prefix:?}"
                ));
            }
            if private.credential_helper && self.git_credential_helper.is_none() {
                return Err(format!(
                    "resolver.private_modules: {prefix:?} uses the credential helper but \
                     resolver.git_credential_helper is not set"
                ));
            }
        }
        if let Some(db) = &self.sum_database
            && (db.name.is_empty() || db.public_key.is_empty() || db.url.is_empty())
        {
            return Err(
                "resolver.sum_database requires name, public_key and url".to_string(),
            );
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Resolution engine configuration.
    #[serde(default)]
    pub resolver: ResolverConfig,
}

impl AppConfig {
    /// Create a test configuration rooted at `dir`.
    ///
    /// **For testing only.**
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::Filesystem {
                path: dir.join("storage"),
            },
            resolver: ResolverConfig {
                scratch_dir: dir.join("scratch"),
                max_parallel_commands: 4,
                ..ResolverConfig::default()
            },
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.storage.validate()?;
        self.resolver.validate()
    }
}
