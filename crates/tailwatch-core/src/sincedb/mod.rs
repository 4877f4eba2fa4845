//! Persistent read positions keyed by content fingerprint.
//!
//! The store maps a [`FingerprintKey`] to the records of every stream that
//! begins with those bytes. Records sharing a key are told apart by their
//! secondary fingerprint. A record is *allocated* while a live
//! [`WatchedFile`] owns it; unallocated records come from disk or from files
//! that went away, and are handed to the first file that proves it carries
//! the same content.
//!
//! Keys shorter than the fingerprint window (small files) are indexed
//! separately so a file that has since grown can still find its record.

pub mod codec;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::fingerprint::{FingerprintKey, MAX_WINDOW};
use crate::identity::IdentityKey;
use crate::lock::StoreLock;
use crate::watched_file::{WatchedFile, WatchedFileId};

pub use codec::{SincedbFormat, StoredKey, StoredRecord};

/// Seconds since the Unix epoch, as stored in `last_seen`.
#[must_use]
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// One stream's confirmed read position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    position: u64,
    last_seen: f64,
    secondary: Option<FingerprintKey>,
    allocated_to: Option<WatchedFileId>,
    path: Option<PathBuf>,
    identity: Option<IdentityKey>,
}

impl PositionRecord {
    #[must_use]
    pub fn new(position: u64) -> Self {
        Self {
            position,
            last_seen: epoch_now(),
            secondary: None,
            allocated_to: None,
            path: None,
            identity: None,
        }
    }

    #[must_use]
    pub fn with_secondary(mut self, secondary: Option<FingerprintKey>) -> Self {
        self.secondary = secondary;
        self
    }

    #[must_use]
    pub fn with_last_seen(mut self, last_seen: f64) -> Self {
        self.last_seen = last_seen;
        self
    }

    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub const fn last_seen(&self) -> f64 {
        self.last_seen
    }

    #[must_use]
    pub const fn secondary(&self) -> Option<FingerprintKey> {
        self.secondary
    }

    #[must_use]
    pub const fn allocated_to(&self) -> Option<WatchedFileId> {
        self.allocated_to
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn touch(&mut self) {
        self.last_seen = epoch_now();
    }

    fn allocate(&mut self, wf: &WatchedFile) {
        self.touch();
        self.allocated_to = Some(wf.id());
        self.path = Some(wf.path().to_path_buf());
        self.identity = Some(wf.identity());
    }

    fn secondary_matches(&self, wf: &WatchedFile) -> bool {
        self.secondary.is_none_or(|key| wf.matches_at(&key))
    }
}

/// Result of matching a watched file against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A record is now allocated to the file; `position` is where to resume.
    Allocated { position: u64 },
    /// The only matching record belongs to another live file.
    Conflict(WatchedFileId),
    /// Nothing on record carries this content.
    NotFound,
}

/// How a [`PositionStore`] persists itself.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub format: SincedbFormat,
    pub write_interval: Duration,
    pub clean_after: Duration,
    pub window: u16,
    pub lock_timeout: Duration,
}

impl StoreSettings {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: SincedbFormat::Plain,
            write_interval: Duration::from_secs(10),
            clean_after: Duration::from_secs(10 * 24 * 3600),
            window: MAX_WINDOW,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub struct PositionStore {
    settings: StoreSettings,
    records: HashMap<FingerprintKey, Vec<PositionRecord>>,
    legacy: HashMap<IdentityKey, PositionRecord>,
    short_keys: BTreeSet<FingerprintKey>,
    allocations: HashMap<WatchedFileId, FingerprintKey>,
    last_write: Option<Instant>,
    _lock: Option<StoreLock>,
}

impl PositionStore {
    /// An empty store that has not touched disk.
    #[must_use]
    pub fn in_memory(settings: StoreSettings) -> Self {
        Self {
            settings,
            records: HashMap::new(),
            legacy: HashMap::new(),
            short_keys: BTreeSet::new(),
            allocations: HashMap::new(),
            last_write: None,
            _lock: None,
        }
    }

    /// Lock the store file and load every record that has not expired.
    ///
    /// A missing file is an empty store. Regular-file targets are locked
    /// for the lifetime of the store; devices are not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Lock`] if another process holds the lock,
    /// [`StoreError::Io`] if the file exists but cannot be read, or
    /// [`StoreError::Json`] for a malformed JSON document.
    pub fn open(settings: StoreSettings) -> Result<Self, StoreError> {
        let target = fs::metadata(&settings.path);
        let lock = match &target {
            Ok(meta) if !meta.is_file() => None,
            _ => Some(StoreLock::acquire(&settings.path, settings.lock_timeout)?),
        };

        let text = match target {
            Ok(meta) if meta.is_file() => {
                fs::read_to_string(&settings.path).map_err(|source| StoreError::Io {
                    path: settings.path.clone(),
                    source,
                })?
            }
            _ => String::new(),
        };

        let mut store = Self::in_memory(settings);
        store._lock = lock;

        let now = epoch_now();
        let ttl = store.settings.clean_after.as_secs_f64();
        let mut expired = 0usize;
        for stored in codec::decode(store.settings.format, &text, now)? {
            if stored.last_seen + ttl <= now {
                expired += 1;
                continue;
            }
            store.load(stored);
        }

        debug!(
            path = %store.settings.path.display(),
            keys = store.records.len(),
            legacy = store.legacy.len(),
            expired,
            "sincedb opened"
        );
        Ok(store)
    }

    fn load(&mut self, stored: StoredRecord) {
        let record = PositionRecord {
            position: stored.position,
            last_seen: stored.last_seen,
            secondary: stored.secondary,
            allocated_to: None,
            path: stored.path,
            identity: stored.identity,
        };
        match stored.key {
            StoredKey::Fingerprint(key) => self.set(key, record),
            StoredKey::Legacy(identity) => {
                self.legacy.insert(identity, record);
            }
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    // -----------------------------------------------------------------------
    // Key-level operations
    // -----------------------------------------------------------------------

    /// Add `record` under `key`, alongside any records already there.
    pub fn set(&mut self, key: FingerprintKey, record: PositionRecord) {
        if let Some(id) = record.allocated_to {
            self.allocations.insert(id, key);
        }
        if key.is_short(self.settings.window) {
            self.short_keys.insert(key);
        }
        self.records.entry(key).or_default().push(record);
    }

    /// First record stored under `key`.
    #[must_use]
    pub fn get(&self, key: &FingerprintKey) -> Option<&PositionRecord> {
        self.records.get(key).and_then(|bucket| bucket.first())
    }

    /// Every record stored under `key`.
    #[must_use]
    pub fn get_all(&self, key: &FingerprintKey) -> &[PositionRecord] {
        self.records.get(key).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn contains_key(&self, key: &FingerprintKey) -> bool {
        self.records.contains_key(key)
    }

    /// Remove and return every record stored under `key`.
    pub fn delete(&mut self, key: &FingerprintKey) -> Vec<PositionRecord> {
        self.short_keys.remove(key);
        let bucket = self.records.remove(key).unwrap_or_default();
        for record in &bucket {
            if let Some(id) = record.allocated_to {
                self.allocations.remove(&id);
            }
        }
        bucket
    }

    /// Re-file every record under `from` to `to`.
    pub fn move_key(&mut self, from: &FingerprintKey, to: FingerprintKey) {
        for record in self.delete(from) {
            self.set(to, record);
        }
    }

    /// Number of records, legacy included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum::<usize>() + self.legacy.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &FingerprintKey> {
        self.records.keys()
    }

    #[must_use]
    pub const fn short_keys(&self) -> &BTreeSet<FingerprintKey> {
        &self.short_keys
    }

    // -----------------------------------------------------------------------
    // Legacy records
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn has_legacy(&self, identity: &IdentityKey) -> bool {
        self.legacy.contains_key(identity)
    }

    /// Remove the legacy record for `identity`.
    pub fn take_legacy(&mut self, identity: &IdentityKey) -> Option<PositionRecord> {
        self.legacy.remove(identity)
    }

    #[must_use]
    pub fn legacy_len(&self) -> usize {
        self.legacy.len()
    }

    // -----------------------------------------------------------------------
    // File-level operations
    // -----------------------------------------------------------------------

    /// Record currently allocated to `wf`, if any.
    #[must_use]
    pub fn allocated(&self, wf: &WatchedFile) -> Option<&PositionRecord> {
        let key = self.allocations.get(&wf.id())?;
        self.records
            .get(key)?
            .iter()
            .find(|r| r.allocated_to == Some(wf.id()))
    }

    fn allocated_mut(&mut self, id: WatchedFileId) -> Option<&mut PositionRecord> {
        let key = self.allocations.get(&id)?;
        self.records
            .get_mut(key)?
            .iter_mut()
            .find(|r| r.allocated_to == Some(id))
    }

    /// Match `wf` to a stored record and allocate it.
    ///
    /// 1. a record already allocated to `wf` under its current key;
    /// 2. an unallocated record under the same key whose secondary
    ///    fingerprint (if any) is present in the file, preferring records
    ///    that carry one;
    /// 3. the longest short key the file's leading bytes still cover,
    ///    re-keyed to the file's current key.
    ///
    /// A match allocated to another live file is never taken; the owner is
    /// reported as [`Lookup::Conflict`] instead.
    ///
    /// On success `wf`'s bytes read is set to the resume position, clamped
    /// to the file's size.
    pub fn find(&mut self, wf: &mut WatchedFile, event: &str) -> Lookup {
        let Some(key) = wf.storage_key() else {
            return Lookup::NotFound;
        };
        debug!(path = %wf.path().display(), %event, %key, "sincedb find");

        if self.allocations.get(&wf.id()) == Some(&key) {
            if let Some(record) = self.allocated_mut(wf.id()) {
                record.touch();
                return Lookup::Allocated {
                    position: record.position,
                };
            }
        }

        match self.direct_match(wf, key) {
            Lookup::NotFound => self.short_key_match(wf, key),
            found => found,
        }
    }

    fn direct_match(&mut self, wf: &mut WatchedFile, key: FingerprintKey) -> Lookup {
        let Some(bucket) = self.records.get(&key) else {
            return Lookup::NotFound;
        };

        let mut pick = None;
        let mut owner = None;
        for (idx, record) in bucket.iter().enumerate() {
            if !record.secondary_matches(wf) {
                continue;
            }
            match record.allocated_to {
                None if record.secondary.is_some() => {
                    pick = Some(idx);
                    break;
                }
                None => {
                    pick = pick.or(Some(idx));
                }
                Some(id) => owner = owner.or(Some(id)),
            }
        }

        if let Some(idx) = pick {
            self.release_allocation(wf.id());
            let size = wf.size();
            let Some(record) = self.records.get_mut(&key).and_then(|b| b.get_mut(idx)) else {
                return Lookup::NotFound;
            };
            record.position = record.position.min(size);
            record.allocate(wf);
            let position = record.position;
            self.allocations.insert(wf.id(), key);
            wf.set_bytes_read(position);
            debug!(path = %wf.path().display(), %key, position, "sincedb allocated");
            return Lookup::Allocated { position };
        }

        if let Some(other) = owner {
            debug!(
                path = %wf.path().display(),
                %key,
                owner = %other,
                "sincedb match allocated to another file"
            );
            return Lookup::Conflict(other);
        }
        Lookup::NotFound
    }

    fn short_key_match(&mut self, wf: &mut WatchedFile, key: FingerprintKey) -> Lookup {
        let Some(primary) = wf.primary() else {
            return Lookup::NotFound;
        };
        let candidate = self
            .short_keys
            .iter()
            .rev()
            .filter(|k| k.length < key.length)
            .find(|k| primary.covers(k))
            .copied();
        let Some(old_key) = candidate else {
            debug!(path = %wf.path().display(), %key, "sincedb not found");
            return Lookup::NotFound;
        };

        let mut bucket = self.delete(&old_key);
        let pick = bucket
            .iter()
            .position(|r| r.allocated_to == Some(wf.id()))
            .or_else(|| {
                bucket
                    .iter()
                    .position(|r| r.allocated_to.is_none() && r.secondary_matches(wf))
            });

        let Some(idx) = pick else {
            let owner = bucket.iter().find_map(|r| r.allocated_to);
            for rest in bucket {
                self.set(old_key, rest);
            }
            return match owner {
                Some(other) => {
                    debug!(
                        path = %wf.path().display(),
                        %old_key,
                        owner = %other,
                        "sincedb short key allocated to another file"
                    );
                    Lookup::Conflict(other)
                }
                None => Lookup::NotFound,
            };
        };

        let mut record = bucket.swap_remove(idx);
        if record.allocated_to.is_none() {
            record.position = record.position.min(wf.size());
            wf.set_bytes_read(record.position);
        }
        record.allocate(wf);
        for rest in bucket {
            self.set(old_key, rest);
        }

        debug!(
            path = %wf.path().display(),
            old = %old_key,
            new = %key,
            position = record.position,
            "sincedb short key match"
        );
        let position = record.position;
        self.release_allocation(wf.id());
        self.set(key, record);
        Lookup::Allocated { position }
    }

    fn release_allocation(&mut self, id: WatchedFileId) {
        if let Some(record) = self.allocated_mut(id) {
            record.allocated_to = None;
        }
        self.allocations.remove(&id);
    }

    /// Create a record for a file with no history, allocated to it.
    pub fn allocate_new(&mut self, wf: &mut WatchedFile, position: u64) {
        let Some(key) = wf.storage_key() else {
            return;
        };
        self.release_allocation(wf.id());
        let mut record = PositionRecord::new(position).with_secondary(wf.secondary_key());
        record.allocate(wf);
        wf.set_bytes_read(position);
        self.set(key, record);
    }

    /// Adopt an existing record for `wf` under its storage key.
    pub fn adopt(&mut self, wf: &mut WatchedFile, mut record: PositionRecord) {
        let Some(key) = wf.storage_key() else {
            return;
        };
        self.release_allocation(wf.id());
        record.position = record.position.min(wf.size());
        wf.set_bytes_read(record.position);
        record.allocate(wf);
        self.set(key, record);
    }

    /// Consume `amount` more bytes of `wf`.
    pub fn increment(&mut self, wf: &mut WatchedFile, amount: u64) {
        wf.add_bytes_read(amount);
        self.sync(wf);
    }

    /// Move `wf` (and its record) to `position`.
    pub fn update_position(&mut self, wf: &mut WatchedFile, position: u64) {
        wf.set_bytes_read(position);
        self.sync(wf);
    }

    /// Copy `wf`'s bytes read and secondary fingerprint into its record.
    pub fn sync(&mut self, wf: &WatchedFile) {
        let secondary = wf.secondary_key();
        if let Some(record) = self.allocated_mut(wf.id()) {
            record.position = wf.bytes_read();
            if secondary.is_some() {
                record.secondary = secondary;
            }
            record.touch();
        }
    }

    /// Detach `wf` from its record, keeping the last position and
    /// secondary fingerprint for a future match.
    pub fn deallocate(&mut self, wf: &WatchedFile) {
        self.sync(wf);
        self.release_allocation(wf.id());
    }

    /// Follow `wf` from `old` to `new` after its leading window changed.
    pub fn rekey(&mut self, wf: &WatchedFile, old: FingerprintKey, new: FingerprintKey) {
        if self.allocations.get(&wf.id()) != Some(&old) {
            return;
        }
        let Some(bucket) = self.records.get_mut(&old) else {
            return;
        };
        let Some(idx) = bucket.iter().position(|r| r.allocated_to == Some(wf.id())) else {
            return;
        };
        let record = bucket.swap_remove(idx);
        if bucket.is_empty() {
            self.records.remove(&old);
            self.short_keys.remove(&old);
        }
        debug!(path = %wf.path().display(), %old, %new, "sincedb rekey");
        self.set(new, record);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn snapshot(&self) -> Vec<StoredRecord> {
        let mut keys: Vec<&FingerprintKey> = self.records.keys().collect();
        keys.sort_unstable();

        let mut out = Vec::with_capacity(self.len());
        for key in keys {
            for record in &self.records[key] {
                out.push(StoredRecord {
                    key: StoredKey::Fingerprint(*key),
                    position: record.position,
                    last_seen: record.last_seen,
                    secondary: record.secondary,
                    path: record.path.clone(),
                    identity: record.identity,
                });
            }
        }

        let mut legacy: Vec<(&IdentityKey, &PositionRecord)> = self.legacy.iter().collect();
        legacy.sort_unstable_by_key(|(identity, _)| **identity);
        for (identity, record) in legacy {
            out.push(StoredRecord {
                key: StoredKey::Legacy(*identity),
                position: record.position,
                last_seen: record.last_seen,
                secondary: None,
                path: record.path.clone(),
                identity: Some(*identity),
            });
        }
        out
    }

    /// Serialize every record to the store file.
    ///
    /// Regular files are replaced atomically through a sibling temp file.
    /// Devices and other special targets are written in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be written.
    pub fn write(&mut self, reason: &str) -> Result<(), StoreError> {
        debug!(path = %self.settings.path.display(), %reason, "sincedb write");
        let body = codec::encode(self.settings.format, &self.snapshot())?;
        write_store_file(&self.settings.path, body.as_bytes()).map_err(|source| {
            StoreError::Io {
                path: self.settings.path.clone(),
                source,
            }
        })?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Write if the write interval has elapsed since the last success.
    ///
    /// Failures are logged and retried on the next call.
    pub fn write_periodically(&mut self) {
        let due = self
            .last_write
            .is_none_or(|at| at.elapsed() >= self.settings.write_interval);
        if !due {
            return;
        }
        if let Err(err) = self.write("periodic") {
            warn!(code = %err.code(), error = %err, "sincedb write failed, will retry");
        }
    }
}

fn write_store_file(path: &Path, body: &[u8]) -> io::Result<()> {
    let regular = fs::metadata(path).map_or(true, |meta| meta.is_file());
    if !regular || cfg!(not(unix)) {
        return fs::write(path, body);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}
