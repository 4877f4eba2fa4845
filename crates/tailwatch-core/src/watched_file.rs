//! Per-path read state and lifecycle.
//!
//! ```text
//!            admit                 idle + fully read
//! watched ─────────▶ active ───────────────────────▶ closed
//!    │   ▲                                              │
//!    │   └──────────── size changed ────────────────────┘
//!    │   ▲
//!    │   └──────────── size changed (unignore) ─── ignored
//!    └──── older than ignore_older at discovery ─────▶ ignored
//!
//! any ───── exclude match / close_file ─────▶ unwatched (terminal)
//! ```

use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::fingerprint::{FingerprintKey, Fingerprinter, MAX_WINDOW};
use crate::identity::{FileIdentity, IdentityKey};

/// Stable handle for a watched file, unique within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchedFileId(pub u64);

impl fmt::Display for WatchedFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wf-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Watched,
    Active,
    Closed,
    Ignored,
    Unwatched,
}

impl FileState {
    const fn bit(self) -> u8 {
        match self {
            Self::Watched => 1,
            Self::Active => 1 << 1,
            Self::Closed => 1 << 2,
            Self::Ignored => 1 << 3,
            Self::Unwatched => 1 << 4,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Watched => "watched",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Ignored => "ignored",
            Self::Unwatched => "unwatched",
        };
        f.write_str(s)
    }
}

/// Set of states a file has left at least once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateHistory(u8);

impl StateHistory {
    pub fn insert(&mut self, state: FileState) {
        self.0 |= state.bit();
    }

    #[must_use]
    pub const fn contains(self, state: FileState) -> bool {
        self.0 & state.bit() != 0
    }

    #[must_use]
    pub fn contains_any(self, states: &[FileState]) -> bool {
        states.iter().any(|s| self.contains(*s))
    }
}

/// The parts of a stat result the watch loop compares between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
    pub identity: IdentityKey,
}

impl FileStat {
    #[must_use]
    pub fn from_metadata(path: &Path, metadata: &Metadata, resolver: &dyn FileIdentity) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            identity: resolver.identity_of(path, metadata),
        }
    }
}

/// Per-file knobs shared by every file a discoverer creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSettings {
    pub window: u16,
    pub close_older: Option<Duration>,
    pub ignore_older: Option<Duration>,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            window: MAX_WINDOW,
            close_older: None,
            ignore_older: None,
        }
    }
}

/// Outcome of re-reading the leading window after a size change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintChange {
    Unchanged,
    /// First fingerprint for a file that used to be empty or unreadable.
    Created,
    /// Same prefix, more bytes in the window.
    Grown {
        old: FingerprintKey,
        new: FingerprintKey,
    },
    /// Same prefix, fewer bytes in the window.
    Shrunk {
        old: FingerprintKey,
        new: FingerprintKey,
    },
    /// Leading bytes differ: a different stream now lives at this path.
    Replaced { old: FingerprintKey },
    /// File is empty; identity is deferred until content arrives.
    Cleared { old: FingerprintKey },
}

pub struct WatchedFile {
    id: WatchedFileId,
    path: PathBuf,
    resolver: Arc<dyn FileIdentity>,
    stat: FileStat,
    identity: IdentityKey,
    created_at: SystemTime,
    state: FileState,
    history: StateHistory,
    initial: bool,
    bytes_read: u64,
    ignored_size: u64,
    primary: Option<Fingerprinter>,
    secondary: Option<Fingerprinter>,
    handle: Option<File>,
    accessed_at: Instant,
    settings: FileSettings,
}

impl fmt::Debug for WatchedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("size", &self.stat.size)
            .field("bytes_read", &self.bytes_read)
            .field("key", &self.storage_key())
            .field("open", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl WatchedFile {
    /// Track `path` using an already-taken stat result.
    ///
    /// The primary fingerprint is taken immediately when the file has
    /// content; an unreadable prefix leaves the file unstorable until the
    /// next size change.
    pub fn new(
        id: WatchedFileId,
        path: PathBuf,
        metadata: &Metadata,
        resolver: Arc<dyn FileIdentity>,
        settings: FileSettings,
        initial: bool,
    ) -> Self {
        let stat = FileStat::from_metadata(&path, metadata, resolver.as_ref());
        let mut wf = Self {
            id,
            identity: stat.identity,
            created_at: metadata.created().unwrap_or(stat.modified),
            path,
            resolver,
            stat,
            state: FileState::Watched,
            history: StateHistory::default(),
            initial,
            bytes_read: 0,
            ignored_size: 0,
            primary: None,
            secondary: None,
            handle: None,
            accessed_at: Instant::now(),
            settings,
        };
        if wf.stat.size > 0 {
            wf.invalidate_fingerprints();
        }
        wf
    }

    #[must_use]
    pub const fn id(&self) -> WatchedFileId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn stat(&self) -> &FileStat {
        &self.stat
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.stat.size
    }

    #[must_use]
    pub const fn identity(&self) -> IdentityKey {
        self.identity
    }

    #[must_use]
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    pub const fn state(&self) -> FileState {
        self.state
    }

    #[must_use]
    pub const fn history(&self) -> StateHistory {
        self.history
    }

    #[must_use]
    pub const fn is_initial(&self) -> bool {
        self.initial
    }

    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    #[must_use]
    pub const fn ignored_size(&self) -> u64 {
        self.ignored_size
    }

    #[must_use]
    pub const fn window(&self) -> u16 {
        self.settings.window
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: FileState) {
        if self.state != next {
            debug!(path = %self.path.display(), from = %self.state, to = %next, "file state");
        }
        self.history.insert(self.state);
        self.state = next;
    }

    pub fn activate(&mut self) {
        self.transition(FileState::Active);
    }

    pub fn close(&mut self) {
        self.transition(FileState::Closed);
    }

    /// Move to `ignored`; everything currently in the file counts as read.
    pub fn ignore(&mut self) {
        self.transition(FileState::Ignored);
        self.ignored_size = self.stat.size;
        self.bytes_read = self.stat.size;
    }

    pub fn watch(&mut self) {
        self.transition(FileState::Watched);
    }

    pub fn unwatch(&mut self) {
        self.transition(FileState::Unwatched);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == FileState::Active
    }

    #[must_use]
    pub fn is_watched(&self) -> bool {
        self.state == FileState::Watched
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == FileState::Closed
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.state == FileState::Ignored
    }

    #[must_use]
    pub fn is_unwatched(&self) -> bool {
        self.state == FileState::Unwatched
    }

    /// True once the file has ever been `closed` or `ignored`.
    #[must_use]
    pub fn was_parked(&self) -> bool {
        self.history
            .contains_any(&[FileState::Closed, FileState::Ignored])
    }

    // -----------------------------------------------------------------------
    // Stat and fingerprints
    // -----------------------------------------------------------------------

    /// Refresh the cached stat.
    ///
    /// # Errors
    ///
    /// Returns the stat error; `NotFound` means the path is gone.
    pub fn restat(&mut self) -> io::Result<()> {
        let metadata = fs::metadata(&self.path)?;
        self.stat = FileStat::from_metadata(&self.path, &metadata, self.resolver.as_ref());
        Ok(())
    }

    /// Current size differs from what has been consumed.
    #[must_use]
    pub const fn size_changed(&self) -> bool {
        self.stat.size != self.bytes_read
    }

    /// Platform identity differs from the one seen when the file was opened.
    #[must_use]
    pub fn identity_changed(&self) -> bool {
        self.stat.identity != self.identity
    }

    /// Adopt the latest stat identity as the file's identity.
    pub fn update_identity(&mut self) {
        self.identity = self.stat.identity;
    }

    /// Primary fingerprint may not describe the file's current size.
    #[must_use]
    pub fn fingerprint_stale(&self) -> bool {
        let window = u64::from(self.settings.window);
        match &self.primary {
            None => self.stat.size > 0,
            Some(fp) => {
                let held = u64::from(fp.len());
                self.stat.size < held || (held < window && self.stat.size > held)
            }
        }
    }

    /// Re-read the leading window and report how the primary key moved.
    ///
    /// A replaced prefix also drops the secondary fingerprint. A shrink
    /// below the secondary window drops it too.
    pub fn invalidate_fingerprints(&mut self) -> FingerprintChange {
        let fresh = if self.stat.size == 0 {
            None
        } else {
            match Fingerprinter::read(&self.path, 0, self.settings.window) {
                Ok(fp) if fp.is_empty() => None,
                Ok(fp) => Some(fp),
                Err(err) => {
                    debug!(path = %self.path.display(), error = %err, "fingerprint read failed");
                    return FingerprintChange::Unchanged;
                }
            }
        };

        let change = match (&self.primary, &fresh) {
            (None, None) => FingerprintChange::Unchanged,
            (None, Some(_)) => FingerprintChange::Created,
            (Some(prev), None) => FingerprintChange::Cleared { old: prev.key() },
            (Some(prev), Some(next)) if prev.key() == next.key() => FingerprintChange::Unchanged,
            (Some(prev), Some(next)) if next.starts_with(prev) => {
                if next.len() > prev.len() {
                    FingerprintChange::Grown {
                        old: prev.key(),
                        new: next.key(),
                    }
                } else {
                    FingerprintChange::Shrunk {
                        old: prev.key(),
                        new: next.key(),
                    }
                }
            }
            (Some(prev), Some(_)) => FingerprintChange::Replaced { old: prev.key() },
        };

        match change {
            FingerprintChange::Replaced { .. } | FingerprintChange::Cleared { .. } => {
                self.secondary = None;
            }
            _ => {
                let size = self.stat.size;
                if self
                    .secondary
                    .as_ref()
                    .is_some_and(|fp| fp.offset() + u64::from(fp.len()) > size)
                {
                    self.secondary = None;
                }
            }
        }

        self.primary = fresh;
        change
    }

    /// Recompute the secondary fingerprint over the window just before
    /// `bytes_read`, once two full windows have been consumed.
    ///
    /// Returns true when the secondary key changed.
    pub fn refresh_secondary(&mut self) -> bool {
        let window = u64::from(self.settings.window);
        if self.bytes_read < window * 2 {
            return false;
        }
        let offset = self.bytes_read - window;
        if self.secondary.as_ref().is_some_and(|fp| fp.offset() == offset) {
            return false;
        }
        match Fingerprinter::read(&self.path, offset, self.settings.window) {
            Ok(fp) if u64::from(fp.len()) == window => {
                self.secondary = Some(fp);
                true
            }
            Ok(_) => false,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "secondary fingerprint read failed");
                false
            }
        }
    }

    /// Whether the bytes at `key`'s range of this file hash to `key`.
    #[must_use]
    pub fn matches_at(&self, key: &FingerprintKey) -> bool {
        let held = [self.secondary.as_ref(), self.primary.as_ref()];
        if let Some(fp) = held
            .into_iter()
            .flatten()
            .find(|fp| fp.offset() == key.offset && key.length <= fp.len())
        {
            return fp.covers(key);
        }
        Fingerprinter::read(&self.path, key.offset, key.length)
            .is_ok_and(|fp| fp.key() == *key)
    }

    /// A file is storable once it has a primary fingerprint.
    #[must_use]
    pub const fn is_storable(&self) -> bool {
        self.primary.is_some()
    }

    /// Key under which this file's position is stored.
    #[must_use]
    pub fn storage_key(&self) -> Option<FingerprintKey> {
        self.primary.as_ref().map(Fingerprinter::key)
    }

    #[must_use]
    pub const fn primary(&self) -> Option<&Fingerprinter> {
        self.primary.as_ref()
    }

    #[must_use]
    pub fn secondary_key(&self) -> Option<FingerprintKey> {
        self.secondary.as_ref().map(Fingerprinter::key)
    }

    // -----------------------------------------------------------------------
    // Read bookkeeping
    // -----------------------------------------------------------------------

    pub fn set_bytes_read(&mut self, position: u64) {
        self.bytes_read = position;
    }

    pub fn add_bytes_read(&mut self, amount: u64) {
        self.bytes_read = self.bytes_read.saturating_add(amount);
    }

    /// Everything on disk has been consumed.
    #[must_use]
    pub const fn all_read(&self) -> bool {
        self.bytes_read >= self.stat.size
    }

    // -----------------------------------------------------------------------
    // Handle
    // -----------------------------------------------------------------------

    /// Open a read handle and pin the identity it was opened under.
    ///
    /// # Errors
    ///
    /// Returns the open error.
    pub fn open(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        self.handle = Some(file);
        self.accessed_at = Instant::now();
        self.update_identity();
        Ok(())
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// # Errors
    ///
    /// Fails when the file is not open or the seek fails.
    pub fn seek(&mut self, position: u64) -> io::Result<()> {
        let handle = self.handle.as_mut().ok_or_else(not_open)?;
        handle.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Read the next chunk into `buf`; zero means end of file.
    ///
    /// # Errors
    ///
    /// Fails when the file is not open or the read fails.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.accessed_at = Instant::now();
        let handle = self.handle.as_mut().ok_or_else(not_open)?;
        handle.read(buf)
    }

    pub fn close_handle(&mut self) {
        if self.handle.take().is_some() {
            debug!(path = %self.path.display(), "closed handle");
        }
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    /// Idle past `close_older` with nothing left to read.
    #[must_use]
    pub fn is_closable(&self) -> bool {
        self.settings
            .close_older
            .is_some_and(|limit| self.accessed_at.elapsed() > limit)
            && !self.size_changed()
    }

    /// Last modified longer ago than `ignore_older`.
    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        self.settings.ignore_older.is_some_and(|limit| {
            SystemTime::now()
                .duration_since(self.stat.modified)
                .is_ok_and(|age| age > limit)
        })
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "file is not open")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fnv1a64;
    use crate::identity::platform_identity;
    use std::io::Write;
    use tempfile::TempDir;

    fn watched(dir: &TempDir, name: &str, content: &[u8], settings: FileSettings) -> WatchedFile {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        let meta = fs::metadata(&path).unwrap();
        WatchedFile::new(WatchedFileId(1), path, &meta, platform_identity(), settings, true)
    }

    fn append(wf: &WatchedFile, content: &[u8]) {
        let mut file = fs::OpenOptions::new().append(true).open(wf.path()).unwrap();
        file.write_all(content).unwrap();
    }

    #[test]
    fn new_file_is_watched_and_keyed_on_content() {
        let dir = TempDir::new().unwrap();
        let wf = watched(&dir, "a.log", b"line1\nline2\n", FileSettings::default());

        assert!(wf.is_watched());
        assert!(wf.is_initial());
        assert!(wf.is_storable());
        assert_eq!(
            wf.storage_key(),
            Some(FingerprintKey::new(fnv1a64(b"line1\nline2\n"), 0, 12))
        );
        assert!(wf.size_changed());
    }

    #[test]
    fn empty_file_is_unstorable_until_content_arrives() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "empty.log", b"", FileSettings::default());
        assert!(!wf.is_storable());
        assert!(!wf.fingerprint_stale());

        append(&wf, b"hello\n");
        wf.restat().unwrap();
        assert!(wf.fingerprint_stale());
        assert_eq!(wf.invalidate_fingerprints(), FingerprintChange::Created);
        assert!(wf.is_storable());
    }

    #[test]
    fn growth_inside_the_window_rekeys() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "a.log", b"line1\nline2\n", FileSettings::default());
        let old = wf.storage_key().unwrap();

        append(&wf, b"line3\n");
        wf.restat().unwrap();
        assert!(wf.fingerprint_stale());
        let FingerprintChange::Grown { old: from, new } = wf.invalidate_fingerprints() else {
            panic!("expected growth");
        };
        assert_eq!(from, old);
        assert_eq!(new.length, 18);
    }

    #[test]
    fn rewritten_prefix_is_a_replacement() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "a.log", b"first version\n", FileSettings::default());
        let old = wf.storage_key().unwrap();

        fs::write(wf.path(), b"second version, longer\n").unwrap();
        wf.restat().unwrap();
        assert_eq!(wf.invalidate_fingerprints(), FingerprintChange::Replaced { old });
        assert_ne!(wf.storage_key(), Some(old));
    }

    #[test]
    fn truncation_to_zero_clears_identity() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "a.log", b"content\n", FileSettings::default());
        let old = wf.storage_key().unwrap();

        fs::write(wf.path(), b"").unwrap();
        wf.restat().unwrap();
        assert_eq!(wf.invalidate_fingerprints(), FingerprintChange::Cleared { old });
        assert!(!wf.is_storable());
    }

    #[test]
    fn ignore_counts_existing_content_as_read() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "a.log", b"0123456789", FileSettings::default());
        wf.ignore();

        assert!(wf.is_ignored());
        assert_eq!(wf.bytes_read(), 10);
        assert_eq!(wf.ignored_size(), 10);
        assert!(wf.all_read());
        assert!(wf.history().contains(FileState::Watched));
    }

    #[test]
    fn history_remembers_parked_states() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "a.log", b"x\n", FileSettings::default());
        assert!(!wf.was_parked());
        wf.activate();
        wf.close();
        wf.watch();
        assert!(wf.was_parked());
        assert!(wf.is_watched());
    }

    #[test]
    fn secondary_follows_bytes_read() {
        let dir = TempDir::new().unwrap();
        let settings = FileSettings {
            window: 8,
            ..FileSettings::default()
        };
        let mut wf = watched(&dir, "a.log", b"aaaaaaaabbbbbbbbcccccccc", settings);

        wf.set_bytes_read(15);
        assert!(!wf.refresh_secondary());
        assert_eq!(wf.secondary_key(), None);

        wf.set_bytes_read(16);
        assert!(wf.refresh_secondary());
        assert_eq!(
            wf.secondary_key(),
            Some(FingerprintKey::new(fnv1a64(b"bbbbbbbb"), 8, 8))
        );
        assert!(!wf.refresh_secondary());

        wf.set_bytes_read(24);
        assert!(wf.refresh_secondary());
        assert_eq!(wf.secondary_key().map(|k| k.offset), Some(16));
    }

    #[test]
    fn matches_at_reads_unheld_ranges_from_disk() {
        let dir = TempDir::new().unwrap();
        let settings = FileSettings {
            window: 4,
            ..FileSettings::default()
        };
        let wf = watched(&dir, "a.log", b"headbodytail", settings);

        assert!(wf.matches_at(&FingerprintKey::new(fnv1a64(b"body"), 4, 4)));
        assert!(!wf.matches_at(&FingerprintKey::new(fnv1a64(b"nope"), 4, 4)));
        assert!(wf.matches_at(&FingerprintKey::new(fnv1a64(b"he"), 0, 2)));
    }

    #[test]
    fn handle_reads_from_seek_position() {
        let dir = TempDir::new().unwrap();
        let mut wf = watched(&dir, "a.log", b"0123456789", FileSettings::default());
        let mut buf = [0u8; 4];
        assert!(wf.read_chunk(&mut buf).is_err());

        wf.open().unwrap();
        wf.seek(6).unwrap();
        assert_eq!(wf.read_chunk(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");
        assert_eq!(wf.read_chunk(&mut buf).unwrap(), 0);

        wf.close_handle();
        assert!(!wf.is_open());
    }

    #[test]
    fn closable_needs_idle_time_and_no_unread_bytes() {
        let dir = TempDir::new().unwrap();
        let settings = FileSettings {
            close_older: Some(Duration::from_millis(20)),
            ..FileSettings::default()
        };
        let mut wf = watched(&dir, "a.log", b"abc\n", settings);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!wf.is_closable());

        wf.set_bytes_read(4);
        assert!(wf.is_closable());
    }

    #[test]
    fn ignorable_follows_mtime() {
        let dir = TempDir::new().unwrap();
        let settings = FileSettings {
            ignore_older: Some(Duration::from_secs(3600)),
            ..FileSettings::default()
        };
        let wf = watched(&dir, "fresh.log", b"abc\n", settings);
        assert!(!wf.is_ignorable());

        let never = watched(&dir, "b.log", b"abc\n", FileSettings::default());
        assert!(!never.is_ignorable());
    }
}
