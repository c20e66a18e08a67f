//! Isolated scratch environments for toolchain invocations.

use crate::environ::Environ;
use crate::gitconfig::GitConfig;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{error, trace, warn};
use uuid::Uuid;

struct State {
    tmp_dir: PathBuf,
    gopath_dir: PathBuf,
    cache_dir: PathBuf,
    home_dir: PathBuf,
    work_dir: PathBuf,
    environ: Mutex<Environ>,
    refs: AtomicUsize,
    removed: AtomicBool,
}

impl State {
    fn remove(&self) -> io::Result<()> {
        if self.removed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The module cache is read-only, so permissions are reset first.
        let chmod_result = make_writable(&self.tmp_dir);
        match std::fs::remove_dir_all(&self.tmp_dir) {
            Ok(()) => trace!(dir = %self.tmp_dir.display(), "removed sandbox"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                if let Err(chmod_err) = &chmod_result {
                    error!(dir = %self.tmp_dir.display(), error = %chmod_err, "failed to reset sandbox permissions");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn remove_logged(&self) {
        if let Err(e) = self.remove() {
            error!(dir = %self.tmp_dir.display(), error = %e, "failed to remove sandbox");
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if !self.removed.load(Ordering::Acquire) {
            self.remove_logged();
        }
    }
}

/// One owning reference to a sandbox directory.
///
/// Layout under a fresh directory in the scratch root:
///
/// ```text
/// gopath/      GOPATH, holds the module cache
/// gocache/     GOCACHE
/// home/        HOME, holds .gitconfig
/// home/work/   working directory for invocations
/// ```
///
/// The directory is removed when the last reference is released. Release
/// explicitly with [`Sandbox::release`] to observe removal errors; a handle
/// dropped without release logs a warning and releases itself.
pub struct Sandbox {
    state: Arc<State>,
    released: bool,
}

impl Sandbox {
    /// Create a sandbox under `scratch_root` with `base` as its starting environment.
    pub async fn create(scratch_root: &Path, base: &Environ) -> io::Result<Sandbox> {
        let scratch_root = scratch_root.to_path_buf();
        let base = base.clone();
        tokio::task::spawn_blocking(move || Self::create_blocking(&scratch_root, &base))
            .await
            .map_err(|e| io::Error::other(format!("spawn_blocking failed: {e}")))?
    }

    pub fn create_blocking(scratch_root: &Path, base: &Environ) -> io::Result<Sandbox> {
        std::fs::create_dir_all(scratch_root)?;
        let tmp_dir = scratch_root.join(format!("sandbox-{}", Uuid::new_v4()));
        create_private_dir(&tmp_dir)?;

        let gopath_dir = tmp_dir.join("gopath");
        let cache_dir = tmp_dir.join("gocache");
        let home_dir = tmp_dir.join("home");
        let work_dir = home_dir.join("work");

        let mut environ = base.clone();
        environ.set("PWD", work_dir.to_string_lossy());
        environ.set("HOME", home_dir.to_string_lossy());
        environ.set("GOPATH", gopath_dir.to_string_lossy());
        environ.set("GOCACHE", cache_dir.to_string_lossy());
        // Points at nothing so git ignores per-user config.
        environ.set("XDG_CONFIG_HOME", tmp_dir.join("non-existing").to_string_lossy());

        // From here on State's Drop removes the directory if setup fails.
        let state = Arc::new(State {
            tmp_dir,
            gopath_dir,
            cache_dir,
            home_dir,
            work_dir,
            environ: Mutex::new(environ),
            refs: AtomicUsize::new(1),
            removed: AtomicBool::new(false),
        });
        create_private_dir(&state.gopath_dir)?;
        create_private_dir(&state.cache_dir)?;
        create_private_dir(&state.home_dir)?;
        create_private_dir(&state.work_dir)?;
        trace!(dir = %state.tmp_dir.display(), "created sandbox");

        Ok(Sandbox {
            state,
            released: false,
        })
    }

    /// Take another reference.
    pub fn add_ref(&self) -> Sandbox {
        self.state.refs.fetch_add(1, Ordering::AcqRel);
        Sandbox {
            state: self.state.clone(),
            released: false,
        }
    }

    /// Release this reference on a blocking thread, removing the directory
    /// if it was the last one.
    pub async fn release(self) -> io::Result<()> {
        tokio::task::spawn_blocking(move || self.release_blocking())
            .await
            .map_err(|e| io::Error::other(format!("spawn_blocking failed: {e}")))?
    }

    /// Release this reference on the current thread.
    pub fn release_blocking(mut self) -> io::Result<()> {
        self.release_ref()
    }

    fn release_ref(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.state.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            return self.state.remove();
        }
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.state.refs.load(Ordering::Acquire)
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.state.tmp_dir
    }

    pub fn gopath_dir(&self) -> &Path {
        &self.state.gopath_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.state.cache_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.state.home_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.state.work_dir
    }

    fn environ_lock(&self) -> MutexGuard<'_, Environ> {
        self.state
            .environ
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the environment for the next invocation.
    pub fn environ(&self) -> Environ {
        self.environ_lock().clone()
    }

    pub fn set_env(&self, name: &str, value: impl Into<String>) {
        self.environ_lock().set(name, value);
    }

    pub fn unset_env(&self, name: &str) {
        self.environ_lock().unset(name);
    }

    /// Write `home/.gitconfig`, replacing any previous one.
    pub fn write_git_config(&self, config: &GitConfig) -> io::Result<()> {
        let rendered = config.render()?;
        let path = self.state.home_dir.join(".gitconfig");
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        io::Write::write_all(&mut file, rendered.as_bytes())
    }

    /// Open a file produced inside the sandbox. The returned handle keeps the
    /// sandbox alive until it is dropped.
    pub fn open(&self, path: &Path) -> io::Result<SandboxFile> {
        if !path.is_absolute()
            || !path.starts_with(&self.state.tmp_dir)
            || path.components().any(|c| matches!(c, Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is not inside sandbox {}",
                    path.display(),
                    self.state.tmp_dir.display()
                ),
            ));
        }
        let file = std::fs::File::open(path)?;
        Ok(SandboxFile {
            file: tokio::fs::File::from_std(file),
            sandbox: Some(self.add_ref()),
        })
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(dir = %self.state.tmp_dir.display(), "sandbox handle dropped without release");
        self.released = true;
        if self.state.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let state = self.state.clone();
            remove_off_thread(state);
        }
    }
}

/// Remove on a blocking thread when a runtime is available.
fn remove_off_thread(state: Arc<State>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || state.remove_logged());
        }
        Err(_) => state.remove_logged(),
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("tmp_dir", &self.state.tmp_dir)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A file opened inside a sandbox, holding a sandbox reference.
pub struct SandboxFile {
    file: tokio::fs::File,
    sandbox: Option<Sandbox>,
}

impl AsyncRead for SandboxFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl Drop for SandboxFile {
    fn drop(&mut self) {
        if let Some(mut sandbox) = self.sandbox.take() {
            sandbox.released = true;
            if sandbox.state.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                remove_off_thread(sandbox.state.clone());
            }
        }
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

/// Give the owner full access to everything under `root`, without following
/// symlinks. Returns the first error but keeps going.
fn make_writable(root: &Path) -> io::Result<()> {
    let mut first_error = None;
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                first_error.get_or_insert(e);
                continue;
            }
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if let Err(e) = set_owner_writable(&path, &meta) {
            first_error.get_or_insert(e);
        }
        if meta.is_dir() {
            match std::fs::read_dir(&path) {
                Ok(entries) => stack.extend(entries.filter_map(|e| e.ok()).map(|e| e.path())),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn set_owner_writable(path: &Path, _meta: &std::fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_owner_writable(path: &Path, meta: &std::fs::Metadata) -> io::Result<()> {
    let mut permissions = meta.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
