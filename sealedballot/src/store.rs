use crate::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

const BACKUP_INDEX_FILE: &str = "backup-index.json";

/// A store of encrypted election keys, one record per election
pub trait KeyStore: Send + Sync {
    /// Write a record, returning where it landed
    fn put(&self, election_id: ElectionId, record: &EncryptedKeyRecord)
        -> Result<String, StorageError>;

    /// Read a record, `None` if this store does not hold one
    fn get(&self, election_id: ElectionId) -> Result<Option<EncryptedKeyRecord>, StorageError>;

    /// Remove a record, returning whether one existed
    fn remove(&self, election_id: ElectionId) -> Result<bool, StorageError>;

    /// Elections with a record in this store, ascending
    fn list(&self) -> Result<Vec<ElectionId>, StorageError>;

    fn contains(&self, election_id: ElectionId) -> Result<bool, StorageError> {
        Ok(self.get(election_id)?.is_some())
    }
}

/// An addressable content store used as a best-effort replica
pub trait RemoteBackup: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<String, BackupError>;
    fn get(&self, id: &str) -> Result<Vec<u8>, BackupError>;
}

/// Create a directory (and parents) readable only by the owner
pub fn ensure_private_dir(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| StorageError::io(path, e))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .map_err(|e| StorageError::io(path, e))?;
    }
    Ok(())
}

/// Serialize to a sibling temp file, then rename over `path`
///
/// The file is created owner-read/write only.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::json(path, e))?;
    let tmp = path.with_extension("json.tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

/// Read a JSON file, `None` if it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let value = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| StorageError::json(path, e))?;
    Ok(Some(value))
}

/// Encrypted keys as `election-<id>-key.json` files in a private directory
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;
        Ok(FileKeyStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, election_id: ElectionId) -> PathBuf {
        self.dir.join(format!("election-{}-key.json", election_id))
    }
}

impl KeyStore for FileKeyStore {
    fn put(
        &self,
        election_id: ElectionId,
        record: &EncryptedKeyRecord,
    ) -> Result<String, StorageError> {
        let path = self.key_path(election_id);
        write_json_atomic(&path, record)?;
        tracing::info!("encrypted key stored locally for election {}", election_id);
        Ok(path.display().to_string())
    }

    fn get(&self, election_id: ElectionId) -> Result<Option<EncryptedKeyRecord>, StorageError> {
        read_json(&self.key_path(election_id))
    }

    fn remove(&self, election_id: ElectionId) -> Result<bool, StorageError> {
        let path = self.key_path(election_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    fn list(&self) -> Result<Vec<ElectionId>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut elections = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix("election-"))
                .and_then(|n| n.strip_suffix("-key.json"))
                .and_then(|n| n.parse::<ElectionId>().ok());
            if let Some(id) = id {
                elections.push(id);
            }
        }
        elections.sort_unstable();
        Ok(elections)
    }
}

/// A simple key store that uses an in-memory BTreeMap
#[derive(Default)]
pub struct MemKeyStore {
    inner: RwLock<BTreeMap<ElectionId, EncryptedKeyRecord>>,
}

impl KeyStore for MemKeyStore {
    fn put(
        &self,
        election_id: ElectionId,
        record: &EncryptedKeyRecord,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;
        inner.insert(election_id, record.clone());
        Ok(format!("memory://election-{}", election_id))
    }

    fn get(&self, election_id: ElectionId) -> Result<Option<EncryptedKeyRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.get(&election_id).cloned())
    }

    fn remove(&self, election_id: ElectionId) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.remove(&election_id).is_some())
    }

    fn list(&self) -> Result<Vec<ElectionId>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.keys().copied().collect())
    }
}

fn content_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content-addressed in-memory replica
///
/// Can be switched offline to simulate an unreachable remote.
pub struct MemBackup {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    online: AtomicBool,
}

impl Default for MemBackup {
    fn default() -> Self {
        MemBackup {
            objects: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }
}

impl MemBackup {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), BackupError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackupError::Unavailable("memory backup is offline".to_string()))
        }
    }
}

impl RemoteBackup for MemBackup {
    fn put(&self, bytes: &[u8]) -> Result<String, BackupError> {
        self.check_online()?;
        let id = content_id(bytes);
        let mut objects = self
            .objects
            .write()
            .map_err(|_| BackupError::Unavailable("lock poisoned".to_string()))?;
        objects.insert(id.clone(), bytes.to_vec());
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>, BackupError> {
        self.check_online()?;
        let objects = self
            .objects
            .read()
            .map_err(|_| BackupError::Unavailable("lock poisoned".to_string()))?;
        objects
            .get(id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }
}

/// Content-addressed replica in a directory, e.g. a mounted network share
pub struct DirBackup {
    dir: PathBuf,
}

impl DirBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;
        Ok(DirBackup { dir })
    }
}

impl RemoteBackup for DirBackup {
    fn put(&self, bytes: &[u8]) -> Result<String, BackupError> {
        let id = content_id(bytes);
        fs::write(self.dir.join(&id), bytes).map_err(|e| BackupError::Unavailable(e.to_string()))?;
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>, BackupError> {
        // ids are hex digests; anything else could escape the directory
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BackupError::NotFound(id.to_string()));
        }
        let bytes = match fs::read(self.dir.join(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(id.to_string()))
            }
            Err(e) => return Err(BackupError::Unavailable(e.to_string())),
        };
        if content_id(&bytes) != id {
            return Err(BackupError::Corrupt(id.to_string()));
        }
        Ok(bytes)
    }
}

/// Where a stored key landed
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredLocation {
    pub local_path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_backup_id: Option<String>,
}

/// Local store plus optional best-effort remote replica
///
/// The local copy is authoritative. The replica is written after every local write and read
/// only on a local miss, through an index of election id to backup id.
pub struct TieredKeyStore {
    local: Box<dyn KeyStore>,
    remote: Option<Arc<dyn RemoteBackup>>,
    index: RwLock<BTreeMap<ElectionId, String>>,
    index_path: Option<PathBuf>,
    remote_timeout: Duration,
}

impl TieredKeyStore {
    /// File-backed local tier, backup index persisted alongside the keys
    pub fn open(
        dir: impl Into<PathBuf>,
        remote: Option<Arc<dyn RemoteBackup>>,
        remote_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let local = FileKeyStore::new(dir)?;
        let index_path = local.dir().join(BACKUP_INDEX_FILE);
        let index = read_json(&index_path)?.unwrap_or_default();
        Ok(TieredKeyStore {
            local: Box::new(local),
            remote,
            index: RwLock::new(index),
            index_path: Some(index_path),
            remote_timeout,
        })
    }

    /// Arbitrary local tier with an in-memory backup index
    pub fn with_local(
        local: Box<dyn KeyStore>,
        remote: Option<Arc<dyn RemoteBackup>>,
        remote_timeout: Duration,
    ) -> Self {
        TieredKeyStore {
            local,
            remote,
            index: RwLock::new(BTreeMap::new()),
            index_path: None,
            remote_timeout,
        }
    }

    /// Replace the bound on remote fetches
    pub fn with_remote_timeout(mut self, remote_timeout: Duration) -> Self {
        self.remote_timeout = remote_timeout;
        self
    }

    pub fn remote_timeout(&self) -> Duration {
        self.remote_timeout
    }

    pub fn local(&self) -> &dyn KeyStore {
        self.local.as_ref()
    }

    /// Write locally (fatal on failure), then replicate (logged on failure)
    pub fn store(
        &self,
        election_id: ElectionId,
        record: &EncryptedKeyRecord,
    ) -> Result<StoredLocation, StorageError> {
        let local_path = self.local.put(election_id, record)?;

        let remote_backup_id = match &self.remote {
            Some(remote) => self.replicate(remote.as_ref(), election_id, record),
            None => None,
        };

        Ok(StoredLocation {
            local_path,
            remote_backup_id,
        })
    }

    // On failure any previous backup id is dropped: it names a superseded record
    fn replicate(
        &self,
        remote: &dyn RemoteBackup,
        election_id: ElectionId,
        record: &EncryptedKeyRecord,
    ) -> Option<String> {
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("could not serialize key for backup (election {}): {}", election_id, e);
                self.forget_backup(election_id);
                return None;
            }
        };

        match remote.put(&bytes) {
            Ok(id) => {
                tracing::info!("encrypted key backed up for election {} ({})", election_id, id);
                if let Err(e) = self.update_index(|index| {
                    index.insert(election_id, id.clone());
                }) {
                    tracing::warn!("could not record backup id for election {}: {}", election_id, e);
                }
                Some(id)
            }
            Err(e) => {
                tracing::warn!("remote backup failed for election {}, local copy only: {}", election_id, e);
                self.forget_backup(election_id);
                None
            }
        }
    }

    fn forget_backup(&self, election_id: ElectionId) {
        let mut stale = false;
        if let Err(e) = self.update_index(|index| {
            stale = index.remove(&election_id).is_some();
        }) {
            tracing::warn!("could not drop stale backup id for election {}: {}", election_id, e);
        } else if stale {
            tracing::warn!("previous backup for election {} is superseded and forgotten", election_id);
        }
    }

    /// Local first; on a miss, fetch from the replica and re-cache locally
    pub fn fetch(&self, election_id: ElectionId) -> Result<Option<EncryptedKeyRecord>, StorageError> {
        if let Some(record) = self.local.get(election_id)? {
            tracing::debug!("encrypted key for election {} found locally", election_id);
            return Ok(Some(record));
        }

        let backup_id = self.backup_id(election_id)?;
        let (remote, backup_id) = match (&self.remote, backup_id) {
            (Some(remote), Some(backup_id)) => (remote.clone(), backup_id),
            _ => return Ok(None),
        };

        tracing::info!(
            "encrypted key for election {} not found locally, trying remote backup",
            election_id
        );
        let bytes = match fetch_with_timeout(remote, backup_id, self.remote_timeout) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("remote retrieval failed for election {}: {}", election_id, e);
                return Ok(None);
            }
        };

        let record: EncryptedKeyRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("remote backup for election {} is unreadable: {}", election_id, e);
                return Ok(None);
            }
        };

        if let Err(e) = self.local.put(election_id, &record) {
            tracing::warn!("could not re-cache key for election {}: {}", election_id, e);
        }
        Ok(Some(record))
    }

    /// True if the key is held locally or has a recorded backup
    pub fn contains(&self, election_id: ElectionId) -> Result<bool, StorageError> {
        if self.local.contains(election_id)? {
            return Ok(true);
        }
        Ok(self.remote.is_some() && self.backup_id(election_id)?.is_some())
    }

    /// Remove the local copy and forget the backup id; missing keys are not an error
    ///
    /// The remote object itself is content-addressed and left in place.
    pub fn remove(&self, election_id: ElectionId) -> Result<bool, StorageError> {
        let removed_local = self.local.remove(election_id)?;
        let mut removed_index = false;
        self.update_index(|index| {
            removed_index = index.remove(&election_id).is_some();
        })?;
        Ok(removed_local || removed_index)
    }

    /// Elections known to either tier, ascending
    pub fn list(&self) -> Result<Vec<ElectionId>, StorageError> {
        let mut elections: BTreeSet<ElectionId> = self.local.list()?.into_iter().collect();
        if self.remote.is_some() {
            let index = self.index.read().map_err(|_| StorageError::Poisoned)?;
            elections.extend(index.keys().copied());
        }
        Ok(elections.into_iter().collect())
    }

    pub fn backup_id(&self, election_id: ElectionId) -> Result<Option<String>, StorageError> {
        let index = self.index.read().map_err(|_| StorageError::Poisoned)?;
        Ok(index.get(&election_id).cloned())
    }

    fn update_index<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<ElectionId, String>),
    {
        let mut index = self.index.write().map_err(|_| StorageError::Poisoned)?;
        f(&mut index);
        if let Some(path) = &self.index_path {
            write_json_atomic(path, &*index)?;
        }
        Ok(())
    }
}

// A reply arriving after the timeout is dropped with the detached thread
fn fetch_with_timeout(
    remote: Arc<dyn RemoteBackup>,
    id: String,
    timeout: Duration,
) -> Result<Vec<u8>, BackupError> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(remote.get(&id));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(BackupError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(byte: u8) -> EncryptedKeyRecord {
        EncryptedKeyRecord {
            ciphertext: vec![byte; 32],
            iv: vec![1; 12],
            auth_tag: vec![2; 16],
            salt: vec![3; 32],
            algorithm: KEY_ENCRYPTION_ALGORITHM.to_string(),
            created_at: 1,
        }
    }

    struct SlowBackup;

    impl RemoteBackup for SlowBackup {
        fn put(&self, _bytes: &[u8]) -> Result<String, BackupError> {
            Ok("ab".to_string())
        }

        fn get(&self, _id: &str) -> Result<Vec<u8>, BackupError> {
            std::thread::sleep(Duration::from_secs(5));
            Err(BackupError::NotFound("ab".to_string()))
        }
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys")).unwrap();

        assert!(store.get(3).unwrap().is_none());
        let path = store.put(3, &record(9)).unwrap();
        assert!(path.ends_with("election-3-key.json"));
        store.put(12, &record(8)).unwrap();

        assert_eq!(store.get(3).unwrap(), Some(record(9)));
        assert_eq!(store.list().unwrap(), vec![3, 12]);
        assert!(store.remove(3).unwrap());
        assert!(!store.remove(3).unwrap());
        assert_eq!(store.list().unwrap(), vec![12]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.key_path(12)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let mode = fs::metadata(store.dir()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn local_miss_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup = Arc::new(MemBackup::default());
        let remote: Arc<dyn RemoteBackup> = backup.clone();
        let store =
            TieredKeyStore::open(dir.path(), Some(remote.clone()), Duration::from_secs(1)).unwrap();

        let location = store.store(5, &record(7)).unwrap();
        let backup_id = location.remote_backup_id.unwrap();
        assert_eq!(backup.len(), 1);

        // Simulate losing the local disk
        assert!(store.local().remove(5).unwrap());
        assert!(store.contains(5).unwrap());
        assert_eq!(store.fetch(5).unwrap(), Some(record(7)));
        assert!(store.local().contains(5).unwrap());

        // The index survives a restart
        let reopened =
            TieredKeyStore::open(dir.path(), Some(remote), Duration::from_secs(1)).unwrap();
        assert_eq!(reopened.backup_id(5).unwrap(), Some(backup_id));
    }

    #[test]
    fn offline_backup_is_not_fatal() {
        let backup = Arc::new(MemBackup::default());
        backup.set_online(false);
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            Some(backup.clone() as Arc<dyn RemoteBackup>),
            Duration::from_secs(1),
        );

        let location = store.store(1, &record(1)).unwrap();
        assert!(location.remote_backup_id.is_none());
        assert!(location.local_path.starts_with("memory://"));
        assert!(backup.is_empty());
        assert_eq!(store.fetch(1).unwrap(), Some(record(1)));
        assert_eq!(store.fetch(2).unwrap(), None);
    }

    #[test]
    fn failed_rebackup_never_restores_superseded_key() {
        let dir = tempfile::tempdir().unwrap();
        let backup = Arc::new(MemBackup::default());
        let remote: Arc<dyn RemoteBackup> = backup.clone();
        let store =
            TieredKeyStore::open(dir.path(), Some(remote.clone()), Duration::from_secs(1)).unwrap();

        store.store(1, &record(1)).unwrap();
        assert!(store.backup_id(1).unwrap().is_some());

        let mut newer = record(2);
        newer.created_at = 2;
        backup.set_online(false);
        let location = store.store(1, &newer).unwrap();
        assert!(location.remote_backup_id.is_none());
        assert_eq!(store.backup_id(1).unwrap(), None);
        backup.set_online(true);

        // The persisted index agrees after a restart
        let reopened =
            TieredKeyStore::open(dir.path(), Some(remote), Duration::from_secs(1)).unwrap();
        assert_eq!(reopened.backup_id(1).unwrap(), None);

        store.local().remove(1).unwrap();
        assert_eq!(store.fetch(1).unwrap(), None);
        assert!(!store.contains(1).unwrap());
    }

    #[test]
    fn slow_backup_times_out() {
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            Some(Arc::new(SlowBackup)),
            Duration::from_millis(50),
        );
        store.store(1, &record(1)).unwrap();
        store.local().remove(1).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(store.fetch(1).unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn dir_backup_checks_content() {
        let dir = tempfile::tempdir().unwrap();
        let backup = DirBackup::new(dir.path()).unwrap();
        let id = backup.put(b"sealed").unwrap();
        assert_eq!(backup.get(&id).unwrap(), b"sealed".to_vec());

        fs::write(dir.path().join(&id), b"tampered").unwrap();
        assert!(matches!(backup.get(&id), Err(BackupError::Corrupt(_))));
        assert!(matches!(backup.get("../etc"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn remove_is_idempotent() {
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            Some(Arc::new(MemBackup::default())),
            Duration::from_secs(1),
        );
        assert!(!store.remove(4).unwrap());
        store.store(4, &record(4)).unwrap();
        store.store(2, &record(2)).unwrap();
        assert_eq!(store.list().unwrap(), vec![2, 4]);
        assert!(store.remove(4).unwrap());
        assert!(!store.contains(4).unwrap());
        assert_eq!(store.list().unwrap(), vec![2]);
    }
}
