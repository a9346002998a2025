use super::error::{DepotError, DepotResult};
use super::schema::FileRecord;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// JSON-document-backed record of every stored file.
///
/// The whole collection lives in one pretty-printed JSON array and is
/// rewritten on each mutation: serialized to a sibling temp file, fsynced,
/// then renamed over the document. Every read-modify-write runs under the
/// in-process mutex and an exclusive advisory lock on `<document>.lock`;
/// plain reads take the advisory lock shared.
pub struct MetadataStore {
    document: PathBuf,
    lock_path: PathBuf,
    gate: Mutex<()>,
}

impl MetadataStore {
    pub fn new(document: impl Into<PathBuf>) -> Self {
        let document = document.into();
        let mut lock_name = document
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = document.with_file_name(lock_name);
        Self {
            document,
            lock_path,
            gate: Mutex::new(()),
        }
    }

    pub fn document_path(&self) -> &Path {
        &self.document
    }

    /// Current collection. Missing document means empty; unreadable or
    /// corrupt documents are logged and also read as empty.
    pub fn load(&self) -> Vec<FileRecord> {
        let _gate = self.gate.lock();
        let result = DocumentLock::shared(&self.lock_path).and_then(|_lock| self.read_document());
        match result {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    document = %self.document.display(),
                    error = %e,
                    "failed to read metadata, treating as empty"
                );
                Vec::new()
            }
        }
    }

    /// Replace the stored collection with `records`.
    pub fn replace_all(&self, records: &[FileRecord]) -> DepotResult<()> {
        let _gate = self.gate.lock();
        let _lock = DocumentLock::exclusive(&self.lock_path)?;
        self.write_document(records)
    }

    pub fn append(&self, record: FileRecord) -> DepotResult<()> {
        self.mutate(|records| {
            records.push(record);
            true
        })?;
        Ok(())
    }

    /// Drop every record matching `predicate`. Returns the remaining
    /// collection and how many were removed. Nothing is written when nothing
    /// matches.
    pub fn remove_where<P>(&self, predicate: P) -> DepotResult<(Vec<FileRecord>, usize)>
    where
        P: Fn(&FileRecord) -> bool,
    {
        let mut removed = 0;
        let remaining = self.mutate(|records| {
            let before = records.len();
            records.retain(|r| !predicate(r));
            removed = before - records.len();
            removed > 0
        })?;
        Ok((remaining, removed))
    }

    /// Apply `mutator` to the first record matching `predicate`.
    pub fn update_where<P, M>(&self, predicate: P, mutator: M) -> DepotResult<bool>
    where
        P: Fn(&FileRecord) -> bool,
        M: FnOnce(&mut FileRecord),
    {
        let mut matched = false;
        self.mutate(|records| {
            if let Some(record) = records.iter_mut().find(|r| predicate(r)) {
                mutator(record);
                matched = true;
            }
            matched
        })?;
        Ok(matched)
    }

    /// Read, transform, persist under both locks. `transform` returns whether
    /// the collection changed; unchanged collections are not rewritten.
    ///
    /// Unlike `load`, a corrupt document is an error here, so a mutation
    /// never overwrites records it could not read.
    fn mutate<F>(&self, transform: F) -> DepotResult<Vec<FileRecord>>
    where
        F: FnOnce(&mut Vec<FileRecord>) -> bool,
    {
        let _gate = self.gate.lock();
        let _lock = DocumentLock::exclusive(&self.lock_path)?;
        let mut records = self.read_document()?;
        if transform(&mut records) {
            self.write_document(&records)?;
        }
        Ok(records)
    }

    fn read_document(&self) -> DepotResult<Vec<FileRecord>> {
        let file = match File::open(&self.document) {
            Ok(f) => f,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DepotError::io(
                    format!("failed to open {}", self.document.display()),
                    e,
                ))
            }
        };
        let records: Vec<FileRecord> = serde_json::from_reader(BufReader::new(file))?;
        debug!(count = records.len(), "metadata loaded");
        Ok(records)
    }

    fn write_document(&self, records: &[FileRecord]) -> DepotResult<()> {
        let dir = self
            .document
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .map_err(|e| DepotError::io(format!("failed to create {}", dir.display()), e))?;

        // Dropping `tmp` on any early return deletes the temp file.
        let tmp = tempfile::Builder::new()
            .prefix(".metadata-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| DepotError::io("failed to create temporary metadata file", e))?;

        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer
                .flush()
                .map_err(|e| DepotError::io("failed to write temporary metadata file", e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| DepotError::io("failed to sync temporary metadata file", e))?;

        tmp.persist(&self.document).map_err(|e| {
            DepotError::Concurrency(format!(
                "failed to replace {}: {}",
                self.document.display(),
                e.error
            ))
        })?;
        sync_dir(dir);

        info!(count = records.len(), "metadata persisted");
        Ok(())
    }
}

/// Make the rename durable. Failures are only logged.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory sync skipped");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Advisory lock on the document's companion lock file, released on drop.
///
/// The lock lives on a separate file because the document itself is
/// replaced by rename, which would leave a lock on the old inode.
struct DocumentLock {
    file: File,
}

impl DocumentLock {
    fn shared(path: &Path) -> DepotResult<Self> {
        let file = Self::open(path)?;
        file.lock_shared().map_err(|e| {
            DepotError::Concurrency(format!("shared lock on {}: {e}", path.display()))
        })?;
        Ok(Self { file })
    }

    fn exclusive(path: &Path) -> DepotResult<Self> {
        let file = Self::open(path)?;
        file.lock().map_err(|e| {
            DepotError::Concurrency(format!("exclusive lock on {}: {e}", path.display()))
        })?;
        Ok(Self { file })
    }

    fn open(path: &Path) -> DepotResult<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                DepotError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                DepotError::Concurrency(format!("cannot open lock file {}: {e}", path.display()))
            })
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "failed to release metadata lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            filename: format!("{id}.txt"),
            relative_path: String::new(),
            date: "2024-01-01".into(),
            storage_path: PathBuf::from(format!("/tmp/{id}.txt")),
            upload_time: Utc::now(),
            file_size: 1,
            viewed: false,
            viewed_time: None,
        }
    }

    fn store() -> (TempDir, MetadataStore) {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(tmp.path().join("file_metadata.json"));
        (tmp, store)
    }

    #[test]
    fn missing_document_loads_empty() {
        let (_tmp, store) = store();
        assert!(store.load().is_empty());
    }

    #[test]
    fn append_preserves_insertion_order() {
        let (_tmp, store) = store();
        store.append(record("a")).unwrap();
        store.append(record("b")).unwrap();
        let ids: Vec<_> = store.load().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn corrupt_document_loads_empty_but_blocks_mutation() {
        let (_tmp, store) = store();
        fs::write(store.document_path(), b"{ not json").unwrap();

        assert!(store.load().is_empty());
        let err = store.append(record("a")).unwrap_err();
        assert!(matches!(err, DepotError::Corrupt(_)));
        assert_eq!(fs::read(store.document_path()).unwrap(), b"{ not json");
    }

    #[test]
    fn remove_where_is_idempotent() {
        let (_tmp, store) = store();
        store.append(record("a")).unwrap();
        store.append(record("b")).unwrap();

        let (remaining, removed) = store.remove_where(|r| r.id == "a").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(remaining.len(), 1);

        let before = fs::read(store.document_path()).unwrap();
        let (remaining, removed) = store.remove_where(|r| r.id == "a").unwrap();
        assert_eq!(removed, 0);
        assert_eq!(remaining.len(), 1);
        assert_eq!(fs::read(store.document_path()).unwrap(), before);
    }

    #[test]
    fn update_where_touches_first_match_only() {
        let (_tmp, store) = store();
        store.append(record("a")).unwrap();
        store.append(record("a")).unwrap();

        let matched = store.update_where(|r| r.id == "a", |r| r.file_size = 99).unwrap();
        assert!(matched);
        let sizes: Vec<_> = store.load().into_iter().map(|r| r.file_size).collect();
        assert_eq!(sizes, vec![99, 1]);

        assert!(!store.update_where(|r| r.id == "zzz", |r| r.file_size = 5).unwrap());
    }

    #[test]
    fn replace_all_leaves_no_temp_files() {
        let (tmp, store) = store();
        store.replace_all(&[record("a"), record("b")]).unwrap();
        store.replace_all(&[record("c")]).unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(store.load().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn failed_rename_keeps_old_document() {
        let (tmp, store) = store();
        store.replace_all(&[record("a")]).unwrap();

        // A directory where the document should be makes the rename fail.
        let blocked = MetadataStore::new(tmp.path().join("blocked"));
        fs::create_dir_all(tmp.path().join("blocked").join("child")).unwrap();
        let err = blocked.replace_all(&[record("b")]).unwrap_err();
        assert!(matches!(err, DepotError::Concurrency(_)));

        assert_eq!(store.load().len(), 1);
        let leftovers = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn document_is_a_pretty_json_array() {
        let (_tmp, store) = store();
        store.append(record("a")).unwrap();
        let raw = fs::read_to_string(store.document_path()).unwrap();
        assert!(raw.starts_with("[\n  {"));
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0]["uuid"], "a");
    }
}
