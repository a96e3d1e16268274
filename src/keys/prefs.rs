//! JSON preferences storage under a per-user state directory.
//!
//! Documents are written atomically: serialized to a sibling temp file,
//! then renamed over the target. Ids of known key stores live in an
//! index document so `load` can enumerate them without listing files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const INDEX_PATH: &str = "keys/index.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, PersistenceError>;

/// A handle to the preferences root. Passed explicitly to load/save
/// instead of living in process-global state.
#[derive(Debug, Clone)]
pub struct Preferences {
    root: PathBuf,
}

impl Preferences {
    /// Opens (creating if needed) the platform state directory for
    /// `app_name`: `$XDG_STATE_HOME/<app>` or `~/.local/state/<app>`.
    pub fn open(app_name: &str) -> Result<Self> {
        let base = std::env::var_os("XDG_STATE_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/state"))
            })
            .unwrap_or_else(|| PathBuf::from("."));
        Self::at(base.join(app_name))
    }

    /// Uses an explicit directory as the preferences root.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read_json<T: DeserializeOwned>(&self, rel: &str) -> Result<Option<T>> {
        let path = self.root.join(rel);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn delete(&self, rel: &str) -> Result<()> {
        match fs::remove_file(self.root.join(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clears the whole preferences root.
    pub fn delete_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn known_ids(&self) -> Result<Vec<u32>> {
        Ok(self.read_json(INDEX_PATH)?.unwrap_or_default())
    }

    pub fn register_id(&self, id: u32) -> Result<()> {
        let mut ids = self.known_ids()?;
        if !ids.contains(&id) {
            ids.push(id);
            self.write_json(INDEX_PATH, &ids)?;
        }
        Ok(())
    }

    pub fn unregister_id(&self, id: u32) -> Result<()> {
        let mut ids = self.known_ids()?;
        if let Some(pos) = ids.iter().position(|known| *known == id) {
            ids.remove(pos);
            self.write_json(INDEX_PATH, &ids)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_prefs() -> (tempfile::TempDir, Preferences) {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::at(dir.path().join("state")).unwrap();
        (dir, prefs)
    }

    #[test]
    fn read_missing_is_none() {
        let (_dir, prefs) = temp_prefs();
        let value: Option<Vec<u32>> = prefs.read_json("keys/1.json").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, prefs) = temp_prefs();
        prefs.write_json("keys/1.json", &vec![1u32, 2, 3]).unwrap();
        let value: Option<Vec<u32>> = prefs.read_json("keys/1.json").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        // No temp file left behind.
        assert!(!prefs.root().join("keys/1.json.tmp").exists());
    }

    #[test]
    fn index_registers_ids_once() {
        let (_dir, prefs) = temp_prefs();
        prefs.register_id(7).unwrap();
        prefs.register_id(7).unwrap();
        prefs.register_id(9).unwrap();
        assert_eq!(prefs.known_ids().unwrap(), vec![7, 9]);
        prefs.unregister_id(7).unwrap();
        assert_eq!(prefs.known_ids().unwrap(), vec![9]);
    }

    #[test]
    fn delete_all_clears_root() {
        let (_dir, prefs) = temp_prefs();
        prefs.write_json("keys/1.json", &1u32).unwrap();
        prefs.delete_all().unwrap();
        assert!(!prefs.root().exists());
    }
}
