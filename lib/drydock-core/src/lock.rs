//! Advisory deploy lock.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use snafu::{ResultExt as _, Snafu};
use tracing::debug;

/// Deploy lock errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LockError {
    /// The lock file could not be opened.
    #[snafu(display("Failed to open lock file '{}': {}", path.display(), source))]
    Open {
        /// Lock file path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Another process holds the lock.
    #[snafu(display("Lock '{}' is held by another deployment.", path.display()))]
    Held {
        /// Lock file path.
        path: PathBuf,
    },

    /// Locking failed for a reason other than contention.
    #[snafu(display("Failed to lock '{}': {}", path.display(), source))]
    Acquire {
        /// Lock file path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },
}

/// An exclusive advisory lock on a file.
///
/// The lock is released when the value is dropped. The lock file itself is left in place.
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

impl DeployLock {
    /// Attempts to acquire the lock at `path`, without waiting.
    ///
    /// # Errors
    ///
    /// If the lock file cannot be opened, or the lock is already held, an error is returned.
    pub fn try_acquire<P>(path: P) -> Result<Self, LockError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .context(Open { path: path.clone() })?;

        // Called through the trait so that std's own `File::try_lock_exclusive` is not picked.
        match fs4::fs_std::FileExt::try_lock_exclusive(&file) {
            Ok(true) => {}
            Ok(false) => return Held { path }.fail(),
            Err(e) => return Err(e).context(Acquire { path }),
        }

        debug!(lock = %path.display(), "Acquired deploy lock.");
        Ok(Self { file, path })
    }

    /// Returns the path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if let Err(e) = fs4::fs_std::FileExt::unlock(&self.file) {
            debug!(lock = %self.path.display(), error = %e, "Failed to release deploy lock.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".acme-search.lock");

        let first = DeployLock::try_acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());
        assert!(matches!(DeployLock::try_acquire(&path), Err(LockError::Held { .. })));

        drop(first);
        let again = DeployLock::try_acquire(&path).unwrap();
        assert!(again.path().exists());
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join(".acme-search.lock");

        assert!(matches!(DeployLock::try_acquire(&path), Err(LockError::Open { .. })));
    }
}
