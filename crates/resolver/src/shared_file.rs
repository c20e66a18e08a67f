//! Reference-counted handle to an open file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

struct Inner {
    path: PathBuf,
    file: Mutex<Option<File>>,
    refs: AtomicUsize,
}

/// A file opened once and read by several owners in turn.
///
/// Each handle is one reference. The descriptor is closed when the last
/// reference is released, either explicitly through [`SharedFile::release`]
/// or by dropping the handle. Handles share the file position, so owners
/// must not read concurrently; rewind before reading.
pub struct SharedFile {
    inner: Arc<Inner>,
    released: bool,
}

impl SharedFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                file: Mutex::new(Some(file)),
                refs: AtomicUsize::new(1),
            }),
            released: false,
        })
    }

    /// Take another reference to the same descriptor.
    pub fn add_ref(&self) -> SharedFile {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        SharedFile {
            inner: self.inner.clone(),
            released: false,
        }
    }

    /// Drop this reference. Returns true if it was the last one and the
    /// descriptor was closed; a failure to close is returned only from
    /// that final release.
    pub fn release(mut self) -> io::Result<bool> {
        self.release_ref()
    }

    fn release_ref(&mut self) -> io::Result<bool> {
        if self.released {
            return Ok(false);
        }
        self.released = true;
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(false);
        }
        let file = self.lock().take();
        match file {
            Some(file) => close(file).map(|()| true),
            None => Ok(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Live references to the descriptor.
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.with_file(|f| f.metadata())?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn rewind(&self) -> io::Result<()> {
        self.with_file(|mut f| f.seek(SeekFrom::Start(0)).map(|_| ()))
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        // A panic while holding the lock cannot leave the Option inconsistent.
        self.inner
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let guard = self.lock();
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(io::Error::other(format!(
                "{} is already closed",
                self.inner.path.display()
            ))),
        }
    }
}

impl Read for SharedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_file(|mut f| f.read(buf))
    }
}

impl Seek for SharedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.with_file(|mut f| f.seek(pos))
    }
}

impl Drop for SharedFile {
    fn drop(&mut self) {
        if let Err(e) = self.release_ref() {
            tracing::warn!(path = %self.inner.path.display(), error = %e, "failed to close file");
        }
    }
}

/// Close explicitly so the error from close(2) is not discarded.
#[cfg(unix)]
fn close(file: File) -> io::Result<()> {
    use std::os::fd::IntoRawFd;

    let fd = file.into_raw_fd();
    // SAFETY: `fd` was just taken out of the `File`, which no longer owns it.
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn close(file: File) -> io::Result<()> {
    drop(file);
    Ok(())
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile")
            .field("path", &self.inner.path)
            .field("refs", &self.ref_count())
            .finish()
    }
}
