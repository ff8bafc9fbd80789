use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::KeyValueStore;
use crate::errors::{WalletError, WalletResult};

const MAX_KEY_LEN: usize = 128;

/// Directory-backed store: one file per key, written atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    root_dir: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> WalletResult<Self> {
        let root_dir = root.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(WalletError::StorageError(
                "Storage root directory cannot be empty".to_string(),
            ));
        }
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn path_for(&self, key: &str) -> WalletResult<PathBuf> {
        let valid = !key.is_empty()
            && key.len() <= MAX_KEY_LEN
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(WalletError::StorageError(format!(
                "Invalid storage key '{}'",
                key
            )));
        }
        Ok(self.root_dir.join(key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()> {
        let path = self.path_for(key)?;
        let tmp_path = self.root_dir.join(format!(".{}.tmp", key));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> WalletResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
