//! A minimal stand-in for the `go` command: downloads known versions into
//! the sandbox module cache and fails everything else.

use async_trait::async_trait;
use modproxy_core::escape_path;
use modproxy_resolver::{CommandOutput, CommandRunner, Invocation, ResolveError, ResolveResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct FakeToolchain {
    /// `path@version` -> (commit time, go.mod, zip)
    versions: Mutex<BTreeMap<String, (&'static str, Vec<u8>, Vec<u8>)>>,
    pub downloads: AtomicUsize,
}

#[allow(dead_code)]
impl FakeToolchain {
    pub fn add_version(&self, path: &str, version: &str, time: &'static str) -> (Vec<u8>, Vec<u8>) {
        let go_mod = format!("module {path}\n").into_bytes();
        let zip = format!("PK\x03\x04 {path}@{version}").into_bytes();
        self.versions.lock().unwrap().insert(
            format!("{path}@{version}"),
            (time, go_mod.clone(), zip.clone()),
        );
        (go_mod, zip)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn failure(invocation: &Invocation, log: String) -> ResolveError {
        ResolveError::Command {
            command: invocation.command_line(),
            reason: "exit status 1".to_string(),
            log,
        }
    }
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(&self, invocation: &Invocation) -> ResolveResult<CommandOutput> {
        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        let ["mod", "download", "-json", target] = args.as_slice() else {
            return Err(Self::failure(
                invocation,
                "stderr: go mod download: no modules specified\n".to_string(),
            ));
        };
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let Some((time, go_mod, zip)) = self.versions.lock().unwrap().get(*target).cloned() else {
            return Err(Self::failure(
                invocation,
                format!("stderr: go: {target}: invalid version: unknown revision\n"),
            ));
        };
        let (path, version) = target.rsplit_once('@').unwrap();

        let dir = PathBuf::from(invocation.env.get("GOPATH").unwrap())
            .join("pkg/mod/cache/download")
            .join(escape_path(path).unwrap())
            .join("@v");
        std::fs::create_dir_all(&dir).unwrap();
        let info_file = dir.join(format!("{version}.info"));
        let mod_file = dir.join(format!("{version}.mod"));
        let zip_file = dir.join(format!("{version}.zip"));
        std::fs::write(&info_file, format!(r#"{{"Version":"{version}","Time":"{time}"}}"#)).unwrap();
        std::fs::write(&mod_file, go_mod).unwrap();
        std::fs::write(&zip_file, zip).unwrap();

        let stdout = serde_json::json!({
            "Path": path,
            "Version": version,
            "Info": info_file,
            "GoMod": mod_file,
            "Zip": zip_file,
        });
        Ok(CommandOutput {
            stdout: serde_json::to_vec(&stdout).unwrap(),
            log: String::new(),
        })
    }
}
