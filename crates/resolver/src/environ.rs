//! Ordered environment variable sets for child processes.

use std::ffi::OsString;

/// Variables copied from the server's own environment into every toolchain
/// invocation. Everything else is dropped.
#[cfg(windows)]
const INHERITED: &[&str] = &["PATH", "SYSTEMROOT"];
#[cfg(not(windows))]
const INHERITED: &[&str] = &["PATH"];

/// Variables fixed for every toolchain invocation.
const FIXED: &[(&str, &str)] = &[
    ("CGO_ENABLED", "0"),
    ("GIT_ALLOW_PROTOCOL", "git:https"),
    ("GIT_CONFIG_NOSYSTEM", "1"),
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GO111MODULE", "on"),
    ("GOFLAGS", "-mod=mod"),
];

/// An insertion-ordered set of environment variables.
///
/// Names are compared case-insensitively on Windows, where the OS treats
/// them that way, and case-sensitively elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environ {
    case_sensitive: bool,
    vars: Vec<(String, String)>,
}

impl Default for Environ {
    fn default() -> Self {
        Self::new()
    }
}

impl Environ {
    /// An empty set using the platform's case rules.
    pub fn new() -> Self {
        Self::with_case_sensitivity(!cfg!(windows))
    }

    pub fn with_case_sensitivity(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            vars: Vec::new(),
        }
    }

    /// Build from `NAME=value` pairs. The first occurrence of a name wins and
    /// entries without `=` are skipped.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a str>, case_sensitive: bool) -> Self {
        let mut environ = Self::with_case_sensitivity(case_sensitive);
        for entry in entries {
            if let Some((name, value)) = entry.split_once('=')
                && environ.position(name).is_none()
            {
                environ.vars.push((name.to_string(), value.to_string()));
            }
        }
        environ
    }

    /// The base environment for toolchain invocations: the inherited
    /// allow-list taken from `lookup`, then the fixed settings.
    pub fn toolchain_base(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut environ = Self::new();
        for name in INHERITED {
            if let Some(value) = lookup(name) {
                environ.set(*name, value.to_string_lossy());
            }
        }
        for (name, value) in FIXED {
            environ.set(*name, *value);
        }
        environ
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|(n, _)| {
            if self.case_sensitive {
                n == name
            } else {
                n.eq_ignore_ascii_case(name)
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.vars[i].1.as_str())
    }

    /// Set a variable, keeping its original position if it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        debug_assert!(!name.contains('='), "variable name must not contain '='");
        let value = value.into();
        match self.position(&name) {
            Some(i) => self.vars[i] = (name, value),
            None => self.vars.push((name, value)),
        }
    }

    pub fn unset(&mut self, name: &str) {
        if let Some(i) = self.position(name) {
            self.vars.remove(i);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
