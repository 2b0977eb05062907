//! Filesystem path handling for databases and bundles.
//!
//! [`FilePath`] wraps a path with the small set of operations the engine
//! needs: subpath composition, directory materialization, and
//! existence/type checks. Bundle resolution in the database layer is built
//! entirely from these primitives.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A filesystem path with directory/filename composition helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePath {
    path: PathBuf,
}

impl FilePath {
    /// Wraps a path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns a subpath: this path extended with `name`.
    pub fn subpath(&self, name: &str) -> FilePath {
        FilePath { path: self.path.join(name) }
    }

    /// Returns a sibling path whose file name is this one's with `suffix`
    /// appended (`db.sqlite3` + `-wal` → `db.sqlite3-wal`).
    pub fn appending(&self, suffix: &str) -> FilePath {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(suffix);
        FilePath { path: self.path.with_file_name(name) }
    }

    /// The parent directory, if there is one.
    pub fn parent(&self) -> Option<FilePath> {
        self.path.parent().map(|p| FilePath { path: p.to_path_buf() })
    }

    /// Borrow as a standard path.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// True if something exists at this path.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// True if a directory exists at this path.
    pub fn exists_as_dir(&self) -> bool {
        self.path.is_dir()
    }

    /// Creates this directory. Returns true if it was newly created,
    /// false if a directory already existed here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if creation fails for any
    /// reason other than the directory already existing.
    pub fn mkdir(&self) -> Result<bool> {
        match fs::create_dir(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && self.exists_as_dir() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Fails unless a directory exists at this path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) carrying `NotFound` if
    /// nothing exists here, or `NotADirectory`-shaped detail if a
    /// non-directory is in the way.
    pub fn must_exist_as_dir(&self) -> Result<()> {
        if self.exists_as_dir() {
            return Ok(());
        }
        let kind =
            if self.exists() { io::ErrorKind::InvalidInput } else { io::ErrorKind::NotFound };
        Err(io::Error::new(kind, format!("{} is not an existing directory", self)).into())
    }

    /// Removes the file at this path if it exists. Returns whether a file
    /// was removed.
    pub fn remove_file_if_exists(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively deletes the directory at this path, if present.
    pub fn delete_recursive(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&Path> for FilePath {
    fn from(path: &Path) -> Self {
        FilePath::new(path)
    }
}

impl AsRef<Path> for FilePath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_subpath_and_appending() {
        let base = FilePath::new("/tmp/bundle");
        assert_eq!(base.subpath("db.sqlite3").as_path(), Path::new("/tmp/bundle/db.sqlite3"));
        assert_eq!(
            base.subpath("db.sqlite3").appending("-wal").as_path(),
            Path::new("/tmp/bundle/db.sqlite3-wal")
        );
    }

    #[test]
    fn test_mkdir_reports_creation() {
        let dir = tempdir().unwrap();
        let sub = FilePath::new(dir.path()).subpath("bundle");

        assert!(sub.mkdir().unwrap(), "first mkdir creates");
        assert!(!sub.mkdir().unwrap(), "second mkdir finds it existing");
        assert!(sub.exists_as_dir());
    }

    #[test]
    fn test_must_exist_as_dir() {
        let dir = tempdir().unwrap();
        let present = FilePath::new(dir.path());
        assert!(present.must_exist_as_dir().is_ok());

        let absent = present.subpath("nope");
        assert!(absent.must_exist_as_dir().is_err());

        // A plain file is not a directory.
        let file = present.subpath("file");
        std::fs::write(file.as_path(), b"x").unwrap();
        assert!(file.must_exist_as_dir().is_err());
    }

    #[test]
    fn test_remove_file_if_exists() {
        let dir = tempdir().unwrap();
        let file = FilePath::new(dir.path()).subpath("f");
        assert!(!file.remove_file_if_exists().unwrap());
        std::fs::write(file.as_path(), b"x").unwrap();
        assert!(file.remove_file_if_exists().unwrap());
        assert!(!file.exists());
    }
}
