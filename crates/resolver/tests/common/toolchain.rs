//! A scripted stand-in for the `go` command.

use async_trait::async_trait;
use modproxy_core::escape_path;
use modproxy_resolver::{CommandOutput, CommandRunner, Environ, Invocation, ResolveError, ResolveResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One version the fake toolchain can download.
#[derive(Clone, Debug)]
pub struct FakeVersion {
    pub time: &'static str,
    pub go_mod: Vec<u8>,
    pub zip: Vec<u8>,
}

/// What the fake saw when it ran.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub args: Vec<String>,
    pub env: Environ,
    pub git_config: Option<String>,
}

/// Answers `mod download`, `list -m -versions` and the self check the way
/// the real toolchain does, writing files into the sandbox's module cache.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeToolchain {
    modules: Mutex<BTreeMap<String, BTreeMap<String, FakeVersion>>>,
    /// Version reported for `@latest` and by `list` when nothing is tagged.
    latest: Mutex<BTreeMap<String, String>>,
    /// Versions reported by `list`; defaults to every known version.
    listed: Mutex<BTreeMap<String, Vec<String>>>,
    delay: Mutex<Duration>,
    /// Stamp each download's files with its run number.
    distinct_runs: AtomicBool,
    /// Raw JSON written as the `Origin` field of `.info` files.
    origin: Mutex<Option<String>>,
    self_check_succeeds: Mutex<bool>,
    pub downloads: AtomicUsize,
    pub lists: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub recorded: Mutex<Vec<Recorded>>,
}

#[allow(dead_code)]
impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_version(&self, path: &str, version: &str, time: &'static str) -> FakeVersion {
        let v = FakeVersion {
            time,
            go_mod: format!("module {path}\n\ngo 1.21\n").into_bytes(),
            zip: format!("PK\x03\x04 {path}@{version}").into_bytes(),
        };
        self.modules
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .insert(version.to_string(), v.clone());
        v
    }

    pub fn set_latest(&self, path: &str, version: &str) {
        self.latest.lock().unwrap().insert(path.to_string(), version.to_string());
    }

    pub fn set_listed(&self, path: &str, versions: &[&str]) {
        self.listed.lock().unwrap().insert(
            path.to_string(),
            versions.iter().map(|v| v.to_string()).collect(),
        );
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_distinct_runs(&self, distinct: bool) {
        self.distinct_runs.store(distinct, Ordering::SeqCst);
    }

    pub fn set_origin(&self, origin: &str) {
        *self.origin.lock().unwrap() = Some(origin.to_string());
    }

    pub fn set_self_check_succeeds(&self, succeeds: bool) {
        *self.self_check_succeeds.lock().unwrap() = succeeds;
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

    fn download(&self, invocation: &Invocation, target: &str) -> ResolveResult<CommandOutput> {
        let run = self.downloads.fetch_add(1, Ordering::SeqCst) + 1;
        let (path, requested) = target.rsplit_once('@').unwrap();
        let version = if requested == "latest" {
            match self.latest.lock().unwrap().get(path) {
                Some(v) => v.clone(),
                None => {
                    return Err(Self::failure(
                        invocation,
                        format!("stderr: go: module {path}: no matching versions for query \"latest\"\n"),
                    ));
                }
            }
        } else {
            requested.to_string()
        };
        let found = self
            .modules
            .lock()
            .unwrap()
            .get(path)
            .and_then(|versions| versions.get(&version).cloned());
        let Some(mut found) = found else {
            return Err(Self::failure(
                invocation,
                format!("stderr: go: {path}@{version}: invalid version: unknown revision {version}\n"),
            ));
        };

        if self.distinct_runs.load(Ordering::SeqCst) {
            found.go_mod.extend_from_slice(format!("// go.mod from run {run}\n").as_bytes());
            found.zip.extend_from_slice(format!(" zip from run {run}").as_bytes());
        }
        let origin = match self.origin.lock().unwrap().as_deref() {
            Some(origin) => format!(r#","Origin":{origin}"#),
            None => String::new(),
        };

        let gopath = PathBuf::from(invocation.env.get("GOPATH").unwrap());
        let dir = gopath
            .join("pkg/mod/cache/download")
            .join(escape_path(path).unwrap())
            .join("@v");
        std::fs::create_dir_all(&dir).unwrap();
        let info = dir.join(format!("{version}.info"));
        let go_mod = dir.join(format!("{version}.mod"));
        let zip = dir.join(format!("{version}.zip"));
        std::fs::write(
            &info,
            format!(r#"{{"Version":"{version}","Time":"{}"{origin}}}"#, found.time),
        )
        .unwrap();
        std::fs::write(&go_mod, &found.go_mod).unwrap();
        std::fs::write(&zip, &found.zip).unwrap();

        let stdout = serde_json::json!({
            "Path": path,
            "Version": version,
            "Info": info,
            "GoMod": go_mod,
            "Zip": zip,
        });
        Ok(CommandOutput {
            stdout: serde_json::to_vec_pretty(&stdout).unwrap(),
            log: String::new(),
        })
    }

    fn list(&self, path: &str) -> ResolveResult<CommandOutput> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let versions = match self.listed.lock().unwrap().get(path) {
            Some(listed) => listed.clone(),
            None => self
                .modules
                .lock()
                .unwrap()
                .get(path)
                .map(|versions| versions.keys().cloned().collect())
                .unwrap_or_default(),
        };
        let latest = self.latest.lock().unwrap().get(path).cloned().unwrap_or_default();
        let stdout = serde_json::json!({
            "Path": path,
            "Version": latest,
            "Versions": versions,
        });
        Ok(CommandOutput {
            stdout: serde_json::to_vec(&stdout).unwrap(),
            log: String::new(),
        })
    }
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(&self, invocation: &Invocation) -> ResolveResult<CommandOutput> {
        let git_config = invocation
            .env
            .get("HOME")
            .and_then(|home| std::fs::read_to_string(PathBuf::from(home).join(".gitconfig")).ok());
        self.recorded.lock().unwrap().push(Recorded {
            args: invocation.args.clone(),
            env: invocation.env.clone(),
            git_config,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["mod", "download"] => {
                if *self.self_check_succeeds.lock().unwrap() {
                    Ok(CommandOutput::default())
                } else {
                    Err(Self::failure(
                        invocation,
                        "stderr: go mod download: no modules specified\n".to_string(),
                    ))
                }
            }
            ["mod", "download", "-json", target] => self.download(invocation, target),
            ["list", "-m", "-versions", "-json", path] => self.list(path),
            other => panic!("unexpected toolchain arguments {other:?}"),
        }
    }
}
