use std::{
    fs,
    io::{ErrorKind, Write as _},
    path::{Component, Path, PathBuf},
};

/// The persistent byte store the proxy records into and replays from. Keys
/// are `/`-separated path strings. There is no update or delete: examples are
/// created once via [`ExampleStore::write_new`] and live until removed
/// out-of-band.
pub trait ExampleStore: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    /// Create-if-absent: fails with [`StoreError::AlreadyExists`] when the key
    /// is already populated, atomically with respect to concurrent writers.
    fn write_new(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    /// All keys under the prefix, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    AlreadyExists(String),
    Io { key: String, message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists(key) => write!(f, "key `{key}` already exists"),
            Self::Io { key, message } => write!(f, "`{key}`: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Filesystem-backed store rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    base: PathBuf,
}

impl FsStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let traversal = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if traversal || key.is_empty() {
            return Err(StoreError::Io {
                key: key.to_owned(),
                message: "key must be a relative path without `.` or `..` components".to_owned(),
            });
        }
        Ok(self.base.join(relative))
    }

    fn io_error(key: &str, err: std::io::Error) -> StoreError {
        StoreError::Io {
            key: key.to_owned(),
            message: err.to_string(),
        }
    }
}

impl ExampleStore for FsStore {
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(key)?.is_file())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        fs::read(&path).map_err(|err| Self::io_error(key, err))
    }

    fn write_new(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Self::io_error(key, err))?;
        }

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(key.to_owned()));
            }
            Err(err) => return Err(Self::io_error(key, err)),
        };
        file.write_all(bytes).map_err(|err| Self::io_error(key, err))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.resolve(prefix)?;
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        collect_keys(&root, prefix, &mut keys).map_err(|err| Self::io_error(prefix, err))?;
        keys.sort();
        Ok(keys)
    }
}

fn collect_keys(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> std::io::Result<()> {
    for entry_result in fs::read_dir(dir)? {
        let entry = entry_result?;
        let file_type = entry.file_type()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let key = format!("{prefix}/{name}");
        if file_type.is_dir() {
            collect_keys(&entry.path(), &key, keys)?;
        } else {
            keys.push(key);
        }
    }
    Ok(())
}
