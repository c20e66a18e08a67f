//! Deciding when a failure means "this module does not exist".

use crate::error::ResolveError;
use modproxy_core::ModuleVersion;

/// Reclassifies toolchain failures as not-found.
///
/// The toolchain reports a missing module, a missing version and a broken
/// network the same way (non-zero exit with a message), so any mapping to
/// not-found is heuristic and left to the deployment.
pub trait NotFoundPolicy: Send + Sync + 'static {
    /// Returns true if `error`, produced while resolving `module`, should be
    /// reported as not found.
    fn is_not_found(&self, module: &ModuleVersion, error: &ResolveError) -> bool;
}

/// Never reclassifies anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverNotFound;

impl NotFoundPolicy for NeverNotFound {
    fn is_not_found(&self, _module: &ModuleVersion, _error: &ResolveError) -> bool {
        false
    }
}

/// Treats command failures whose log contains any of the given phrases as
/// not found.
#[derive(Clone, Debug, Default)]
pub struct LogPhrasePolicy {
    phrases: Vec<String>,
}

impl LogPhrasePolicy {
    pub fn new(phrases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            phrases: phrases.into_iter().map(Into::into).collect(),
        }
    }
}

impl NotFoundPolicy for LogPhrasePolicy {
    fn is_not_found(&self, _module: &ModuleVersion, error: &ResolveError) -> bool {
        let text = match error {
            ResolveError::Command { log, .. } => log.as_str(),
            ResolveError::ToolchainOutput { reason, .. } => reason.as_str(),
            _ => return false,
        };
        self.phrases.iter().any(|p| text.contains(p.as_str()))
    }
}

/// Cheap syntactic checks that answer not-found without any I/O.
///
/// Repositories on github.com live at `github.com/<owner>/<repo>`, so a
/// shorter path can never be a module.
pub fn quick_not_found(path: &str) -> Option<ResolveError> {
    if let Some(rest) = path.strip_prefix("github.com")
        && (rest.is_empty() || rest.starts_with('/'))
        && path.matches('/').count() < 2
    {
        return Some(ResolveError::NotFound(format!(
            "{path:?} is not a valid github.com module path"
        )));
    }
    None
}
