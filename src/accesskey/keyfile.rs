// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access key file and its backup.
//!
//! The primary file is only ever replaced by `rename`, so a crash mid-write
//! leaves either the old or the new key in place, never a torn file. Before a
//! new key is written the current one is renamed to `<path>.backup`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use tracing::debug;

use super::codec::load_priv_pem;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Load and decode the primary key.
    pub fn load(&self) -> Result<SigningKey> {
        load_key(&self.path)
    }

    /// Load and decode the backup key.
    pub fn load_backup(&self) -> Result<SigningKey> {
        load_key(&self.backup_path())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn backup_exists(&self) -> bool {
        self.backup_path().is_file()
    }

    /// Move the primary key aside. Returns false if there was nothing to move.
    pub fn backup_current(&self) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }
        debug!(path = %self.path.display(), "backing up existing key");
        fs::rename(&self.path, self.backup_path())?;
        Ok(true)
    }

    /// Move the backup key back to the primary path.
    pub fn restore_backup(&self) -> Result<()> {
        debug!(path = %self.path.display(), "restoring backup key");
        fs::rename(self.backup_path(), &self.path)?;
        Ok(())
    }

    /// Replace the primary key with `pem` via temp file and rename.
    pub fn write(&self, pem: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&temp)?;
            file.write_all(pem.as_bytes())?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn load_key(path: &Path) -> Result<SigningKey> {
    let bytes = fs::read(path)?;
    Ok(load_priv_pem(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accesskey::codec::generate_access_key;

    #[test]
    fn backup_path_appends_suffix() {
        let file = KeyFile::new("/root/accesskey/priv.key");
        assert_eq!(
            file.backup_path(),
            PathBuf::from("/root/accesskey/priv.key.backup")
        );
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("nested").join("priv.key"));
        let pair = generate_access_key().unwrap();

        file.write(&pair.private_pem).unwrap();
        assert_eq!(fs::read_to_string(file.path()).unwrap(), pair.private_pem);
        file.load().unwrap();
        assert!(!dir.path().join("nested").join("priv.key.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("priv.key"));
        assert!(file.load().unwrap_err().is_not_found());
        assert!(!file.backup_current().unwrap());
    }

    #[test]
    fn backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("priv.key"));
        let pair = generate_access_key().unwrap();
        file.write(&pair.private_pem).unwrap();

        assert!(file.backup_current().unwrap());
        assert!(!file.exists());
        assert!(file.backup_exists());
        file.load_backup().unwrap();

        file.restore_backup().unwrap();
        assert!(file.exists());
        assert!(!file.backup_exists());
        assert_eq!(fs::read_to_string(file.path()).unwrap(), pair.private_pem);
    }

    #[test]
    fn corrupt_file_is_a_key_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("priv.key"));
        fs::write(file.path(), "garbage").unwrap();
        let err = file.load().unwrap_err();
        assert!(matches!(err, crate::error::Error::Key(_)));
    }
}
