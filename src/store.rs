//! A directory of ledger files, one per resource.
//!
//! Lookups scan every `*.json` file in the directory. File names carry no
//! meaning; the `url` field inside each record is the key. The scan walks
//! files in lexical order, so when several records share a URL the first
//! one by file name wins.
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{Pattern, glob};

use crate::error::LedgerError;
use crate::io::write_atomic;
use crate::ledger::ResourceLedger;

#[derive(Debug, Clone)]
pub struct LedgerStore {
    root: Utf8PathBuf,
}

impl LedgerStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, LedgerError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| LedgerError::Io(root.clone(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Paths of all ledger files, in lexical order.
    fn paths(&self) -> Result<Vec<Utf8PathBuf>, LedgerError> {
        let pattern = format!("{}/*.json", Pattern::escape(self.root.as_str()));
        let mut paths = Vec::new();

        for entry in glob(&pattern)? {
            match entry {
                Ok(path) => paths.push(Utf8PathBuf::try_from(path)?),
                Err(e) => tracing::warn!("skipping unreadable store entry: {e}"),
            }
        }

        paths.sort();
        Ok(paths)
    }

    pub fn load(&self, path: &Utf8Path) -> Result<ResourceLedger, LedgerError> {
        let bytes = fs::read(path).map_err(|e| LedgerError::Io(path.to_owned(), e))?;
        ResourceLedger::from_slice(&bytes).map_err(|e| LedgerError::Parse(path.to_owned(), e))
    }

    /// Every readable record in the store. Malformed files are skipped.
    pub fn list(&self) -> Result<Vec<(Utf8PathBuf, ResourceLedger)>, LedgerError> {
        let mut records = Vec::new();

        for path in self.paths()? {
            match self.load(&path) {
                Ok(ledger) => records.push((path, ledger)),
                Err(e) => tracing::warn!("{e}"),
            }
        }

        Ok(records)
    }

    /// Finds the record whose `url` equals `url` exactly.
    pub fn find_by_url(
        &self,
        url: &str,
    ) -> Result<Option<(Utf8PathBuf, ResourceLedger)>, LedgerError> {
        tracing::debug!(url, store = %self.root, "searching ledger store");

        for path in self.paths()? {
            match self.load(&path) {
                Ok(ledger) if ledger.url == url => {
                    tracing::debug!(url, path = %path, "ledger found");
                    return Ok(Some((path, ledger)));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("{e}"),
            }
        }

        Ok(None)
    }

    /// Writes a new record and returns its path. Fails if a record for the
    /// same URL is already present.
    pub fn create(&self, ledger: &ResourceLedger) -> Result<Utf8PathBuf, LedgerError> {
        if let Some((path, _)) = self.find_by_url(&ledger.url)? {
            return Err(LedgerError::Duplicate {
                url: ledger.url.clone(),
                path,
            });
        }

        let path = self.fresh_path(&ledger.url);
        self.save(&path, ledger)?;
        tracing::info!(url = %ledger.url, path = %path, "created ledger");

        Ok(path)
    }

    /// Overwrites the record at `path`. On failure the previous contents stay
    /// intact.
    pub fn save(&self, path: &Utf8Path, ledger: &ResourceLedger) -> Result<(), LedgerError> {
        let json = ledger
            .to_json()
            .map_err(|e| LedgerError::Encode(ledger.url.clone(), e))?;

        write_atomic(path, json.as_bytes()).map_err(|e| LedgerError::Io(path.to_owned(), e))
    }

    /// Copies the record at `path` verbatim into `backup_dir`. Failures are
    /// logged and reported as `None`; a missing backup never stops a pass.
    pub fn backup(&self, path: &Utf8Path, backup_dir: &Utf8Path) -> Option<Utf8PathBuf> {
        if !path.is_file() {
            tracing::warn!(path = %path, "ledger not found, skipping backup");
            return None;
        }

        let name = path.file_name()?;
        let target = backup_dir.join(name);

        let result = fs::create_dir_all(backup_dir).and_then(|_| fs::copy(path, &target));
        match result {
            Ok(_) => {
                tracing::debug!(path = %target, "ledger backed up");
                Some(target)
            }
            Err(e) => {
                tracing::warn!(path = %path, "couldn't back up ledger: {e}");
                None
            }
        }
    }

    /// A file name derived from the URL hash, deduplicated against files that
    /// already exist.
    fn fresh_path(&self, url: &str) -> Utf8PathBuf {
        let hash = blake3::hash(url.as_bytes()).to_hex();
        let stem = &hash.as_str()[..16];

        let mut path = self.root.join(format!("{stem}.json"));
        let mut counter = 1;

        while path.exists() {
            path = self.root.join(format!("{stem}_{counter}.json"));
            counter += 1;
        }

        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TaskState;
    use crate::task::TaskKind;

    fn temp_store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().join("metadata")).unwrap();
        let store = LedgerStore::open(root).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_find() {
        let (_dir, store) = temp_store();

        let mut ledger = ResourceLedger::new("https://x/1");
        ledger.record_completion(TaskKind::Download, "/v/1.mp4");
        let path = store.create(&ledger).unwrap();

        let (found, loaded) = store.find_by_url("https://x/1").unwrap().unwrap();
        assert_eq!(found, path);
        assert_eq!(loaded, ledger);

        assert!(store.find_by_url("https://x/1/").unwrap().is_none());
        assert!(store.find_by_url("https://x/2").unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_duplicate() {
        let (_dir, store) = temp_store();
        let ledger = ResourceLedger::new("https://x/1");

        store.create(&ledger).unwrap();
        let err = store.create(&ledger).unwrap_err();

        assert!(matches!(err, LedgerError::Duplicate { .. }));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_files_are_skipped() {
        let (_dir, store) = temp_store();

        fs::write(store.root().join("0-broken.json"), "{ not json").unwrap();
        fs::write(store.root().join("1-no-url.json"), r#"{"title":"x"}"#).unwrap();
        fs::write(store.root().join("notes.txt"), "ignored").unwrap();
        store.create(&ResourceLedger::new("https://x/1")).unwrap();

        assert!(store.find_by_url("https://x/1").unwrap().is_some());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_single_match_regardless_of_position() {
        let (_dir, store) = temp_store();

        for name in ["a", "m", "z"] {
            let ledger = ResourceLedger::new(format!("https://other/{name}"));
            store.save(&store.root().join(format!("{name}.json")), &ledger).unwrap();
        }
        let target = store.root().join("k.json");
        store.save(&target, &ResourceLedger::new("https://x/q")).unwrap();

        let (found, _) = store.find_by_url("https://x/q").unwrap().unwrap();
        assert_eq!(found, target);
    }

    #[test]
    fn test_duplicates_resolve_to_first_file() {
        let (_dir, store) = temp_store();

        let mut first = ResourceLedger::new("https://x/1");
        first.set_state(TaskKind::Watermark, TaskState::Pending);
        store.save(&store.root().join("b.json"), &ResourceLedger::new("https://x/1")).unwrap();
        store.save(&store.root().join("a.json"), &first).unwrap();

        let (found, ledger) = store.find_by_url("https://x/1").unwrap().unwrap();
        assert_eq!(found, store.root().join("a.json"));
        assert_eq!(ledger, first);
    }

    #[test]
    fn test_save_overwrites() {
        let (_dir, store) = temp_store();
        let mut ledger = ResourceLedger::new("https://x/1");
        let path = store.create(&ledger).unwrap();

        ledger.record_completion(TaskKind::Watermark, "/v/1_wm.mp4");
        store.save(&path, &ledger).unwrap();

        assert_eq!(store.load(&path).unwrap(), ledger);
    }

    #[test]
    fn test_failed_save_is_an_error() {
        let (_dir, store) = temp_store();
        let path = store.root().join("taken.json");
        fs::create_dir_all(path.join("inner")).unwrap();

        let err = store.save(&path, &ResourceLedger::new("https://x/1")).unwrap_err();

        assert!(matches!(err, LedgerError::Io(ref p, _) if *p == path));
        assert!(path.join("inner").is_dir());
    }

    #[test]
    fn test_fresh_path_avoids_collisions() {
        let (_dir, store) = temp_store();
        let first = store.fresh_path("https://x/1");
        fs::write(&first, "{}").unwrap();

        let second = store.fresh_path("https://x/1");
        assert_ne!(first, second);
        assert!(second.as_str().ends_with("_1.json"));
    }

    #[test]
    fn test_backup() {
        let (dir, store) = temp_store();
        let backups = Utf8PathBuf::try_from(dir.path().join("backup")).unwrap();

        let path = store.create(&ResourceLedger::new("https://x/1")).unwrap();
        let copy = store.backup(&path, &backups).unwrap();

        assert_eq!(fs::read(&copy).unwrap(), fs::read(&path).unwrap());
        assert!(store.backup(&store.root().join("gone.json"), &backups).is_none());
    }
}
