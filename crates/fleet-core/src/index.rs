//! Checksum index over the file transfer store.
//!
//! Maps every observed store file to its SHA-256 and last writer. The boot
//! reconcile walks the two partitions and attributes anything new or changed
//! to the server; the upload path attributes the client and updates the
//! index before the upload response goes out, so a client that reads the
//! index right after its own upload sees its write. Entries are never
//! pruned for files that disappear.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use fleet_crypto::digest::file_sha256_hex;
use fleet_protocol::{FileRecord, UpdatedBy};
use walkdir::WalkDir;

use crate::error::FleetError;
use crate::store::{FleetStore, StoredFileRecord};

pub const PUBLIC_DIR: &str = "publicStore";
pub const USER_DIR: &str = "usrStore";

#[derive(Debug, Clone)]
struct IndexEntry {
    store_path: String,
    public: bool,
    checksum: String,
    updated_by: UpdatedBy,
}

pub struct ChecksumIndex {
    root: PathBuf,
    threshold_bytes: u64,
    store: Arc<dyn FleetStore>,
    entries: DashMap<PathBuf, IndexEntry>,
    // Serializes write-then-hash per target path; without it two uploads
    // to the same path can index a checksum for bytes neither wrote.
    path_locks: DashMap<PathBuf, Arc<StdMutex<()>>>,
}

impl ChecksumIndex {
    /// Open the index over an FTS root, creating the two partitions if
    /// absent and loading persisted attribution records.
    pub fn open(
        root: impl Into<PathBuf>,
        threshold_bytes: u64,
        store: Arc<dyn FleetStore>,
    ) -> Result<Self, FleetError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(PUBLIC_DIR))?;
        std::fs::create_dir_all(root.join(USER_DIR))?;

        let entries = DashMap::new();
        match store.file_records() {
            Ok(records) => {
                for record in records {
                    entries.insert(
                        PathBuf::from(&record.path),
                        IndexEntry {
                            store_path: record.store_path,
                            public: record.public,
                            checksum: record.checksum,
                            updated_by: record.updated_by,
                        },
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not load persisted index records");
            }
        }

        Ok(Self {
            root,
            threshold_bytes,
            store,
            entries,
            path_locks: DashMap::new(),
        })
    }

    /// Walk both partitions and fold on-disk reality into the index.
    /// New and changed files are attributed to the server: out-of-band
    /// changes while the server was down came from an administrator, not
    /// a client. Returns the number of entries inserted or updated.
    pub fn reconcile(&self) -> Result<usize, FleetError> {
        let mut changed = 0;
        for (public, dir) in [
            (true, self.root.join(PUBLIC_DIR)),
            (false, self.root.join(USER_DIR)),
        ] {
            for walk_entry in WalkDir::new(&dir) {
                let walk_entry = match walk_entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable store entry");
                        continue;
                    }
                };
                if !walk_entry.file_type().is_file() {
                    continue;
                }
                let path = walk_entry.path();
                let checksum = match file_sha256_hex(path) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                let store_path = match path.strip_prefix(&dir) {
                    Ok(rel) => rel.to_string_lossy().into_owned(),
                    Err(_) => continue,
                };
                if self.apply(path.to_path_buf(), store_path, public, checksum, UpdatedBy::Server) {
                    changed += 1;
                }
            }
        }
        tracing::info!(changed, total = self.entries.len(), "checksum index reconciled");
        Ok(changed)
    }

    /// Accept an upload: space guard first, then write, then index with
    /// client attribution. All-or-nothing; a rejected upload writes no
    /// bytes and touches no entry. Returns the fresh checksum.
    pub fn store_upload(
        &self,
        public: bool,
        store_path: &str,
        data: &[u8],
    ) -> Result<String, FleetError> {
        let abs = self.resolve(public, store_path)?;
        let lock = self
            .path_locks
            .entry(abs.clone())
            .or_insert_with(|| Arc::new(StdMutex::new(())))
            .clone();
        let _guard = lock
            .lock()
            .map_err(|_| FleetError::Io(std::io::Error::other("upload lock poisoned")))?;
        self.check_capacity(data.len() as u64)?;
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs, data)?;
        let checksum = self.record_upload(public, store_path)?;
        tracing::info!(path = %abs.display(), public, "file uploaded");
        Ok(checksum)
    }

    /// Index a just-written file with client attribution.
    pub fn record_upload(&self, public: bool, store_path: &str) -> Result<String, FleetError> {
        let abs = self.resolve(public, store_path)?;
        let checksum = file_sha256_hex(&abs)?;
        self.apply(
            abs,
            store_path.to_string(),
            public,
            checksum.clone(),
            UpdatedBy::Client,
        );
        Ok(checksum)
    }

    pub fn read_file(&self, public: bool, store_path: &str) -> Result<Vec<u8>, FleetError> {
        let abs = self.resolve(public, store_path)?;
        if !abs.is_file() {
            return Err(FleetError::FileNotFound(store_path.to_string()));
        }
        Ok(std::fs::read(&abs)?)
    }

    /// Ordered view of one partition. For the private store, `scope_user`
    /// limits entries to that user's own segment.
    pub fn snapshot(&self, public: bool, scope_user: Option<&str>) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.value().public == public)
            .filter(|entry| match scope_user {
                Some(user) => entry
                    .value()
                    .store_path
                    .strip_prefix(user)
                    .is_some_and(|rest| rest.starts_with('/')),
                None => true,
            })
            .map(|entry| FileRecord {
                store_path: entry.value().store_path.clone(),
                checksum: entry.value().checksum.clone(),
                last_updated_by: entry.value().updated_by,
            })
            .collect();
        records.sort_by(|a, b| a.store_path.cmp(&b.store_path));
        records
    }

    /// Create a user's private store directory.
    pub fn ensure_user_dir(&self, username: &str) -> Result<(), FleetError> {
        crate::registry::validate_username(username)?;
        std::fs::create_dir_all(self.root.join(USER_DIR).join(username))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_capacity(&self, upload_size: u64) -> Result<(), FleetError> {
        let free = free_bytes(&self.root)?;
        if capacity_ok(free, self.threshold_bytes, upload_size) {
            Ok(())
        } else {
            Err(FleetError::InsufficientSpace {
                needed: upload_size,
                free: free.saturating_sub(self.threshold_bytes),
            })
        }
    }

    /// Insert or update one entry, mirroring to the store. Returns whether
    /// anything changed.
    fn apply(
        &self,
        abs: PathBuf,
        store_path: String,
        public: bool,
        checksum: String,
        updated_by: UpdatedBy,
    ) -> bool {
        use dashmap::mapref::entry::Entry;
        let changed = match self.entries.entry(abs.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().checksum == checksum {
                    false
                } else {
                    slot.get_mut().checksum = checksum.clone();
                    slot.get_mut().updated_by = updated_by;
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(IndexEntry {
                    store_path: store_path.clone(),
                    public,
                    checksum: checksum.clone(),
                    updated_by,
                });
                true
            }
        };
        if changed {
            let record = StoredFileRecord {
                path: abs.display().to_string(),
                store_path,
                public,
                checksum,
                updated_by,
            };
            if let Err(e) = self.store.put_file_record(&record) {
                tracing::warn!(path = %record.path, error = %e, "failed to mirror index record");
            }
        }
        changed
    }

    fn resolve(&self, public: bool, store_path: &str) -> Result<PathBuf, FleetError> {
        let rel = Path::new(store_path);
        if store_path.is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(FleetError::InvalidPath(store_path.to_string()));
        }
        let partition = if public { PUBLIC_DIR } else { USER_DIR };
        Ok(self.root.join(partition).join(rel))
    }
}

fn capacity_ok(free: u64, threshold: u64, upload_size: u64) -> bool {
    free.saturating_sub(threshold) >= upload_size
}

#[cfg(unix)]
fn free_bytes(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_bytes(_path: &Path) -> std::io::Result<u64> {
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use fleet_crypto::digest::sha256_hex;

    fn index_at(root: &Path, store: Arc<dyn FleetStore>) -> ChecksumIndex {
        ChecksumIndex::open(root, 0, store).unwrap()
    }

    #[test]
    fn reconcile_converges_on_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let public = dir.path().join(PUBLIC_DIR);
        std::fs::create_dir_all(&public).unwrap();

        // f1: new on disk, unknown to the index.
        std::fs::write(public.join("f1.txt"), b"one").unwrap();
        // f2: known, but content changed while the server was down.
        std::fs::write(public.join("f2.txt"), b"two v2").unwrap();
        store
            .put_file_record(&StoredFileRecord {
                path: public.join("f2.txt").display().to_string(),
                store_path: "f2.txt".into(),
                public: true,
                checksum: sha256_hex(b"two v1"),
                updated_by: UpdatedBy::Client,
            })
            .unwrap();
        // f3: known and unchanged, previously written by a client.
        std::fs::write(public.join("f3.txt"), b"three").unwrap();
        store
            .put_file_record(&StoredFileRecord {
                path: public.join("f3.txt").display().to_string(),
                store_path: "f3.txt".into(),
                public: true,
                checksum: sha256_hex(b"three"),
                updated_by: UpdatedBy::Client,
            })
            .unwrap();

        let index = index_at(dir.path(), store);
        let changed = index.reconcile().unwrap();
        assert_eq!(changed, 2);

        let snapshot = index.snapshot(true, None);
        let by_path = |p: &str| snapshot.iter().find(|r| r.store_path == p).unwrap().clone();
        assert_eq!(by_path("f1.txt").last_updated_by, UpdatedBy::Server);
        assert_eq!(by_path("f1.txt").checksum, sha256_hex(b"one"));
        assert_eq!(by_path("f2.txt").last_updated_by, UpdatedBy::Server);
        assert_eq!(by_path("f2.txt").checksum, sha256_hex(b"two v2"));
        // Unchanged file keeps its client attribution.
        assert_eq!(by_path("f3.txt").last_updated_by, UpdatedBy::Client);
    }

    #[test]
    fn reconcile_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        std::fs::write(dir.path().join(PUBLIC_DIR).join("a.txt"), b"a").unwrap();
        assert_eq!(index.reconcile().unwrap(), 1);
        assert_eq!(index.reconcile().unwrap(), 0);
    }

    #[test]
    fn upload_read_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        let checksum = index
            .store_upload(false, "alice/notes.txt", b"remember the milk")
            .unwrap();
        assert_eq!(checksum, sha256_hex(b"remember the milk"));

        let snapshot = index.snapshot(false, Some("alice"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].store_path, "alice/notes.txt");
        assert_eq!(snapshot[0].checksum, checksum);
        assert_eq!(snapshot[0].last_updated_by, UpdatedBy::Client);

        assert_eq!(
            index.read_file(false, "alice/notes.txt").unwrap(),
            b"remember the milk"
        );
    }

    #[test]
    fn private_snapshot_is_scoped_to_the_user() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        index.store_upload(false, "alice/a.txt", b"a").unwrap();
        index.store_upload(false, "alicewith/sub.txt", b"s").unwrap();
        index.store_upload(false, "bob/b.txt", b"b").unwrap();

        let alice = index.snapshot(false, Some("alice"));
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].store_path, "alice/a.txt");
    }

    #[test]
    fn snapshot_is_sorted_and_partitioned() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        index.store_upload(true, "zz.txt", b"z").unwrap();
        index.store_upload(true, "aa.txt", b"a").unwrap();
        index.store_upload(false, "carol/c.txt", b"c").unwrap();

        let public = index.snapshot(true, None);
        assert_eq!(
            public.iter().map(|r| r.store_path.as_str()).collect::<Vec<_>>(),
            vec!["aa.txt", "zz.txt"]
        );
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        for bad in ["../evil.txt", "a/../../evil.txt", "/etc/passwd", ""] {
            assert!(matches!(
                index.store_upload(true, bad, b"x").unwrap_err(),
                FleetError::InvalidPath(_)
            ));
        }
    }

    #[test]
    fn space_guard_rejects_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let index =
            ChecksumIndex::open(dir.path(), u64::MAX, Arc::new(MemoryStore::new())).unwrap();
        let err = index.store_upload(true, "big.bin", b"data").unwrap_err();
        assert!(matches!(err, FleetError::InsufficientSpace { .. }));
        assert!(!dir.path().join(PUBLIC_DIR).join("big.bin").exists());
        assert!(index.snapshot(true, None).is_empty());
    }

    #[test]
    fn capacity_arithmetic() {
        assert!(capacity_ok(100, 10, 90));
        assert!(!capacity_ok(100, 10, 91));
        // Threshold larger than free space never accepts.
        assert!(!capacity_ok(100, 200, 1));
        assert!(capacity_ok(100, 200, 0));
    }

    #[test]
    fn same_path_uploads_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(index_at(dir.path(), Arc::new(MemoryStore::new())));

        let mut handles = Vec::new();
        for i in 0u8..4 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for _ in 0..20 {
                    index
                        .store_upload(true, "contended.bin", &vec![i; 64 * 1024])
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Whichever upload landed last, the indexed checksum matches the
        // bytes on disk.
        let on_disk = index.read_file(true, "contended.bin").unwrap();
        let snapshot = index.snapshot(true, None);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].checksum, sha256_hex(&on_disk));
    }

    #[test]
    fn attribution_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let index = index_at(dir.path(), Arc::clone(&store));
        index.store_upload(true, "kept.txt", b"kept").unwrap();
        drop(index);

        let reopened = index_at(dir.path(), store);
        reopened.reconcile().unwrap();
        let snapshot = reopened.snapshot(true, None);
        assert_eq!(snapshot[0].last_updated_by, UpdatedBy::Client);
    }

    #[test]
    fn download_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            index.read_file(true, "ghost.txt").unwrap_err(),
            FleetError::FileNotFound(_)
        ));
    }

    #[test]
    fn ensure_user_dir_validates_names() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path(), Arc::new(MemoryStore::new()));
        index.ensure_user_dir("alice").unwrap();
        assert!(dir.path().join(USER_DIR).join("alice").is_dir());
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(index.ensure_user_dir(bad).is_err());
        }
    }
}
