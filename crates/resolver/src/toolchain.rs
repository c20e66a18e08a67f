//! Toolchain command lines and their JSON output.

use serde::Deserialize;
use std::path::PathBuf;

/// The `Error` field is a plain string in `go mod download -json` and an
/// object with an `Err` field in `go list -m -json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ToolchainError {
    Message(String),
    Detailed {
        #[serde(rename = "Err")]
        err: String,
    },
}

impl ToolchainError {
    pub fn message(&self) -> &str {
        match self {
            ToolchainError::Message(m) => m,
            ToolchainError::Detailed { err } => err,
        }
    }
}

/// Output of `go mod download -json <path>@<version>`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownloadOutput {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub error: Option<ToolchainError>,
    /// Absolute path of the `.info` file in the module cache.
    #[serde(default)]
    pub info: Option<PathBuf>,
    /// Absolute path of the `.mod` file in the module cache.
    #[serde(default)]
    pub go_mod: Option<PathBuf>,
    /// Absolute path of the `.zip` file in the module cache.
    #[serde(default)]
    pub zip: Option<PathBuf>,
}

/// Output of `go list -m -versions -json <path>`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListOutput {
    #[serde(default)]
    pub path: String,
    /// Resolved latest version. Present even when `versions` is empty.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub error: Option<ToolchainError>,
}

pub fn download_args(path: &str, version: &str) -> Vec<String> {
    vec![
        "mod".to_string(),
        "download".to_string(),
        "-json".to_string(),
        format!("{path}@{version}"),
    ]
}

pub fn list_versions_args(path: &str) -> Vec<String> {
    vec![
        "list".to_string(),
        "-m".to_string(),
        "-versions".to_string(),
        "-json".to_string(),
        path.to_string(),
    ]
}

/// Arguments that make the toolchain fail immediately unless the working
/// directory is inside a module.
pub fn self_check_args() -> Vec<String> {
    vec!["mod".to_string(), "download".to_string()]
}

/// Message printed by [`self_check_args`] outside of a module.
pub const SELF_CHECK_EXPECTED: &str = "no modules specified";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_download_output() {
        let raw = r#"{
            "Path": "example.com/a",
            "Version": "v1.0.0",
            "Info": "/gopath/pkg/mod/cache/download/example.com/a/@v/v1.0.0.info",
            "GoMod": "/gopath/pkg/mod/cache/download/example.com/a/@v/v1.0.0.mod",
            "Zip": "/gopath/pkg/mod/cache/download/example.com/a/@v/v1.0.0.zip",
            "Dir": "/gopath/pkg/mod/example.com/a@v1.0.0",
            "Sum": "h1:abc=",
            "GoModSum": "h1:def="
        }"#;
        let out: DownloadOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(out.version, "v1.0.0");
        assert!(out.error.is_none());
        assert!(out.zip.unwrap().ends_with("v1.0.0.zip"));
    }

    #[test]
    fn parses_both_error_shapes() {
        let download: DownloadOutput =
            serde_json::from_str(r#"{"Path":"x","Error":"unknown revision"}"#).unwrap();
        assert_eq!(download.error.unwrap().message(), "unknown revision");

        let list: ListOutput =
            serde_json::from_str(r#"{"Path":"x","Error":{"Err":"not found"}}"#).unwrap();
        assert_eq!(list.error.unwrap().message(), "not found");
    }

    #[test]
    fn list_output_without_versions() {
        let list: ListOutput =
            serde_json::from_str(r#"{"Path":"x","Version":"v0.0.0-20200101000000-abcdefabcdef"}"#)
                .unwrap();
        assert!(list.versions.is_empty());
        assert_eq!(list.version, "v0.0.0-20200101000000-abcdefabcdef");
    }

    #[test]
    fn argument_lists() {
        assert_eq!(
            download_args("example.com/a", "v1.0.0"),
            vec!["mod", "download", "-json", "example.com/a@v1.0.0"]
        );
        assert_eq!(
            list_versions_args("example.com/a"),
            vec!["list", "-m", "-versions", "-json", "example.com/a"]
        );
    }
}
