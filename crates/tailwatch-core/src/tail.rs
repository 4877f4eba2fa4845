//! Observing tail: answers watch events by reading new lines.
//!
//! Every delivered line advances the file's position by the line length
//! plus the delimiter length. A trailing partial line stays buffered and is
//! never counted, so a restart re-reads it whole.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::{EnvOverrides, Settings, StartPosition, TailConfig};
use crate::discover::Discoverer;
use crate::error::TailError;
use crate::identity::platform_identity;
use crate::sincedb::{Lookup, PositionStore};
use crate::throttle::PathThrottle;
use crate::tokenizer::Tokenizer;
use crate::watch::{EventKind, QuitHandle, Watch};
use crate::watched_file::{WatchedFile, WatchedFileId};

/// Receives what the tail reads. Every callback defaults to a no-op.
pub trait Observer {
    fn created(&mut self, _path: &Path) {}

    fn line(&mut self, _path: &Path, _line: &[u8]) {}

    fn eof(&mut self, _path: &Path) {}

    fn deleted(&mut self, _path: &Path) {}

    fn timed_out(&mut self, _path: &Path) {}

    fn error(&mut self, _path: &Path, _error: &io::Error) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSettings {
    pub start_new_files_at: StartPosition,
    pub delimiter: Vec<u8>,
    pub file_chunk_size: usize,
    /// Chunks read per event before yielding; `None` reads to end of file.
    pub read_iterations: Option<u64>,
    pub open_warn_interval: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            start_new_files_at: StartPosition::End,
            delimiter: b"\n".to_vec(),
            file_chunk_size: 32768,
            read_iterations: None,
            open_warn_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub struct Tail {
    watch: Arc<Watch>,
    reader: Reader,
}

impl Tail {
    /// Build from a config, reading overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Fails on invalid config, an unresolvable store path, or a store file
    /// that cannot be read or locked.
    pub fn new(config: &TailConfig) -> Result<Self, TailError> {
        Self::from_settings(config.resolve(&EnvOverrides::from_process())?)
    }

    /// # Errors
    ///
    /// Fails on an invalid exclude glob or a store file that cannot be
    /// read or locked.
    pub fn from_settings(settings: Settings) -> Result<Self, TailError> {
        let discoverer = Discoverer::new(settings.files, &settings.exclude, platform_identity())?;
        let store = PositionStore::open(settings.store)?;
        Ok(Self {
            watch: Arc::new(Watch::new(settings.watch, discoverer, store)),
            reader: Reader::new(settings.tail),
        })
    }

    /// Follow files matching `pattern`. Returns how many were found now.
    ///
    /// Other threads can register patterns while this tail runs through the
    /// handle from [`Tail::watch`].
    ///
    /// # Errors
    ///
    /// Returns [`TailError::Pattern`] for an invalid glob.
    pub fn tail(&self, pattern: &str) -> Result<usize, TailError> {
        self.watch.watch(pattern)
    }

    /// Process events until quit, then write the store.
    ///
    /// # Errors
    ///
    /// Returns the final store write error.
    pub fn subscribe<O: Observer>(&mut self, observer: &mut O) -> Result<(), TailError> {
        self.run(None, observer).map(|_| ())
    }

    /// Like [`Tail::subscribe`], stopping after `ticks` ticks.
    ///
    /// # Errors
    ///
    /// Returns the final store write error.
    pub fn run_ticks<O: Observer>(&mut self, ticks: u64, observer: &mut O) -> Result<u64, TailError> {
        self.run(Some(ticks), observer)
    }

    fn run<O: Observer>(&mut self, max_ticks: Option<u64>, observer: &mut O) -> Result<u64, TailError> {
        let Self { watch, reader } = self;
        let ticks = watch.run(max_ticks, |event, wf, store| {
            reader.handle(event, wf, store, observer);
        });
        watch.with_store(|store| store.write("shutting down"))?;
        Ok(ticks)
    }

    /// Declare `path` finished: it is closed, never reopened by this tail,
    /// and the store is written.
    ///
    /// # Errors
    ///
    /// Returns the store write error.
    pub fn close_file(&mut self, path: &Path) -> Result<bool, TailError> {
        let id = self.watch.with_discoverer(|d| d.id_for_path(path));
        let found = self.watch.unwatch(path);
        if let Some(id) = id {
            self.reader.forget(id, path);
        }
        self.watch.with_store(|store| store.write("close_file"))?;
        Ok(found)
    }

    /// # Errors
    ///
    /// Returns the store write error.
    pub fn sincedb_write(&self, reason: &str) -> Result<(), TailError> {
        self.watch.with_store(|store| store.write(reason))?;
        Ok(())
    }

    pub fn quit(&self) {
        self.watch.quit();
    }

    #[must_use]
    pub fn quit_handle(&self) -> QuitHandle {
        self.watch.quit_handle()
    }

    /// Run `f` against the position store, waiting out a running tick.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut PositionStore) -> R) -> R {
        self.watch.with_store(f)
    }

    /// Shared handle to the underlying watch; clone it to register patterns
    /// from another thread.
    #[must_use]
    pub const fn watch(&self) -> &Arc<Watch> {
        &self.watch
    }

    #[must_use]
    pub fn converted_records(&self) -> usize {
        self.watch
            .with_discoverer(|d| d.converter().converted_records())
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Reader {
    settings: TailSettings,
    tokenizers: HashMap<WatchedFileId, Tokenizer>,
    open_warnings: PathThrottle,
    buf: Vec<u8>,
}

impl Reader {
    fn new(settings: TailSettings) -> Self {
        let open_warnings = PathThrottle::new(settings.open_warn_interval);
        let buf = vec![0; settings.file_chunk_size.max(1)];
        Self {
            settings,
            tokenizers: HashMap::new(),
            open_warnings,
            buf,
        }
    }

    fn forget(&mut self, id: WatchedFileId, path: &Path) {
        self.tokenizers.remove(&id);
        self.open_warnings.forget(path);
    }

    /// Drop a buffered partial line whose bytes were truncated away.
    fn discard_partial(&mut self, wf: &WatchedFile) {
        let Some(tokenizer) = self
            .tokenizers
            .get_mut(&wf.id())
            .filter(|tokenizer| tokenizer.pending() > 0)
        else {
            return;
        };
        let dropped = tokenizer.flush();
        debug!(path = %wf.path().display(), bytes = dropped.len(), "truncated, dropping partial line");
    }

    fn handle<O: Observer>(
        &mut self,
        event: EventKind,
        wf: &mut WatchedFile,
        store: &mut PositionStore,
        observer: &mut O,
    ) {
        let path = wf.path().to_path_buf();
        debug!(path = %path.display(), %event, open = wf.is_open(), "handle event");

        match event {
            EventKind::Unignore => {
                let known = wf.storage_key().is_some_and(|key| store.contains_key(&key));
                if !known && !wf.is_open() && self.open_file(wf, event, store) {
                    observer.created(&path);
                }
            }
            EventKind::Create | EventKind::CreateInitial => {
                if wf.is_open() {
                    debug!(path = %path.display(), %event, "already open");
                    return;
                }
                if self.open_file(wf, event, store) {
                    observer.created(&path);
                    self.read_file(wf, store, observer);
                }
            }
            EventKind::Grow => {
                if wf.is_open() || self.open_file(wf, event, store) {
                    self.read_file(wf, store, observer);
                }
            }
            EventKind::Shrink => {
                self.discard_partial(wf);
                if wf.is_open() || self.open_file(wf, event, store) {
                    self.read_file(wf, store, observer);
                }
            }
            EventKind::Delete => {
                if wf.is_open() {
                    self.read_file(wf, store, observer);
                    wf.close_handle();
                }
                store.deallocate(wf);
                self.forget(wf.id(), &path);
                observer.deleted(&path);
            }
            EventKind::Timeout => {
                wf.close_handle();
                observer.timed_out(&path);
            }
        }
    }

    /// Resolve where `wf` resumes, open it and seek there.
    ///
    /// Returns false when the file stays closed: it has no fingerprint yet,
    /// its record belongs to another live file, or the open failed.
    fn open_file(&mut self, wf: &mut WatchedFile, event: EventKind, store: &mut PositionStore) -> bool {
        if !wf.is_storable() {
            return false;
        }

        let position = match store.find(wf, event.as_str()) {
            Lookup::Allocated { position } => {
                if !self.attempt_open(wf) {
                    return false;
                }
                if event == EventKind::Shrink {
                    wf.size()
                } else {
                    position
                }
            }
            Lookup::Conflict(owner) => {
                debug!(path = %wf.path().display(), %owner, "content allocated to another file, retrying later");
                wf.watch();
                return false;
            }
            Lookup::NotFound => {
                if !self.attempt_open(wf) {
                    return false;
                }
                let position = match event {
                    EventKind::CreateInitial
                        if self.settings.start_new_files_at == StartPosition::End =>
                    {
                        wf.size()
                    }
                    EventKind::Unignore => wf.bytes_read(),
                    _ => 0,
                };
                store.allocate_new(wf, position);
                position
            }
        };

        if let Err(err) = wf.seek(position) {
            warn!(path = %wf.path().display(), error = %err, "seek failed");
            wf.close_handle();
            wf.watch();
            return false;
        }
        store.update_position(wf, position);
        self.tokenizers.remove(&wf.id());
        debug!(path = %wf.path().display(), %event, position, "opened");
        true
    }

    fn attempt_open(&mut self, wf: &mut WatchedFile) -> bool {
        match wf.open() {
            Ok(()) => true,
            Err(err) => {
                if self.open_warnings.allow(wf.path()) {
                    warn!(path = %wf.path().display(), error = %err, "failed to open");
                } else {
                    debug!(path = %wf.path().display(), error = %err, "failed to open (warning suppressed)");
                }
                wf.watch();
                false
            }
        }
    }

    fn read_file<O: Observer>(&mut self, wf: &mut WatchedFile, store: &mut PositionStore, observer: &mut O) {
        let path = wf.path().to_path_buf();
        let tokenizer = self
            .tokenizers
            .entry(wf.id())
            .or_insert_with(|| Tokenizer::new(&self.settings.delimiter));
        let delimiter_len = byte_len(tokenizer.delimiter_len());

        let mut changed = false;
        let mut iterations = 0u64;
        loop {
            if self
                .settings
                .read_iterations
                .is_some_and(|max| iterations >= max)
            {
                break;
            }
            iterations += 1;

            match wf.read_chunk(&mut self.buf) {
                Ok(0) => {
                    observer.eof(&path);
                    break;
                }
                Ok(n) => {
                    changed = true;
                    for line in tokenizer.extract(&self.buf[..n]) {
                        observer.line(&path, &line);
                        store.increment(wf, byte_len(line.len()) + delimiter_len);
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    observer.error(&path, &err);
                    break;
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "read failed");
                    observer.error(&path, &err);
                    break;
                }
            }
        }

        if changed {
            wf.refresh_secondary();
            store.sync(wf);
            store.write_periodically();
        }
    }
}

fn byte_len(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sincedb::PositionRecord;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Collect {
        lines: Vec<String>,
        created: Vec<PathBuf>,
        deleted: Vec<PathBuf>,
        timed_out: Vec<PathBuf>,
        eofs: usize,
    }

    impl Observer for Collect {
        fn created(&mut self, path: &Path) {
            self.created.push(path.to_path_buf());
        }

        fn line(&mut self, _path: &Path, line: &[u8]) {
            self.lines.push(String::from_utf8_lossy(line).into_owned());
        }

        fn eof(&mut self, _path: &Path) {
            self.eofs += 1;
        }

        fn deleted(&mut self, path: &Path) {
            self.deleted.push(path.to_path_buf());
        }

        fn timed_out(&mut self, path: &Path) {
            self.timed_out.push(path.to_path_buf());
        }
    }

    fn config(dir: &TempDir) -> TailConfig {
        TailConfig {
            sincedb_path: Some(dir.path().join("sincedb")),
            start_new_files_at: StartPosition::Beginning,
            stat_interval: 0.0,
            ..TailConfig::default()
        }
    }

    fn tail(config: &TailConfig) -> Tail {
        Tail::from_settings(config.resolve(&EnvOverrides::default()).unwrap()).unwrap()
    }

    fn glob(dir: &TempDir) -> String {
        dir.path().join("*.log").to_string_lossy().into_owned()
    }

    fn append(path: &Path, data: &[u8]) {
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data).unwrap();
    }

    #[test]
    fn reads_existing_lines_from_beginning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"line1\nline2\n").unwrap();
        let mut tail = tail(&config(&dir));
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();

        assert_eq!(seen.lines, vec!["line1", "line2"]);
        assert_eq!(seen.created, vec![path]);
        assert!(seen.eofs >= 1);
    }

    #[test]
    fn start_at_end_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"old1\nold2\n").unwrap();
        let cfg = TailConfig {
            start_new_files_at: StartPosition::End,
            ..config(&dir)
        };
        let mut tail = tail(&cfg);
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        assert!(seen.lines.is_empty());

        append(&path, b"new\n");
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["new"]);
    }

    #[test]
    fn partial_line_is_held_until_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"whole\npart").unwrap();
        let mut tail = tail(&config(&dir));
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["whole"]);
        let key = tail
            .watch()
            .with_discoverer(|d| d.find_by_path(&path).and_then(WatchedFile::storage_key))
            .unwrap();
        let position = tail.with_store(|store| store.get(&key).map(PositionRecord::position));
        assert_eq!(position, Some(6));

        append(&path, b"ial\n");
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["whole", "partial"]);
    }

    #[test]
    fn restart_resumes_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"line1\nline2\n").unwrap();
        let cfg = config(&dir);

        let mut first = Collect::default();
        {
            let mut tail = tail(&cfg);
            tail.tail(&glob(&dir)).unwrap();
            tail.run_ticks(1, &mut first).unwrap();
        }
        append(&path, b"line3\n");

        let mut second = Collect::default();
        let mut tail = tail(&cfg);
        tail.tail(&glob(&dir)).unwrap();
        tail.run_ticks(2, &mut second).unwrap();

        assert_eq!(first.lines, vec!["line1", "line2"]);
        assert_eq!(second.lines, vec!["line3"]);
    }

    #[test]
    fn second_tail_on_same_store_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let cfg = TailConfig {
            sincedb_lock_timeout: 0.05,
            ..config(&dir)
        };
        let _held = tail(&cfg);
        let err = Tail::from_settings(cfg.resolve(&EnvOverrides::default()).unwrap()).unwrap_err();
        assert!(matches!(err, TailError::Store(_)));
    }

    #[test]
    fn deleted_file_is_drained_and_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"line1\n").unwrap();
        let mut tail = tail(&config(&dir));
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        fs::remove_file(&path).unwrap();
        tail.run_ticks(1, &mut seen).unwrap();

        assert_eq!(seen.deleted, vec![path]);
        assert_eq!(seen.lines, vec!["line1"]);
    }

    #[test]
    fn idle_file_times_out_and_resumes_on_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"line1\n").unwrap();
        let cfg = TailConfig {
            close_older: Some(0.03),
            ..config(&dir)
        };
        let mut tail = tail(&cfg);
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.timed_out, vec![path.clone()]);

        append(&path, b"line2\n");
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["line1", "line2"]);
    }

    #[test]
    fn close_file_stops_delivery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"line1\n").unwrap();
        let mut tail = tail(&config(&dir));
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        assert!(tail.close_file(&path).unwrap());

        append(&path, b"line2\n");
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["line1"]);
        assert!(dir.path().join("sincedb").exists());
    }

    #[test]
    fn custom_delimiter_counts_its_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"a\r\nbb\r\n").unwrap();
        let cfg = TailConfig {
            delimiter: "\r\n".to_string(),
            ..config(&dir)
        };
        let mut tail = tail(&cfg);
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["a", "bb"]);
        let read = tail
            .watch()
            .with_discoverer(|d| d.find_by_path(&path).map(WatchedFile::bytes_read));
        assert_eq!(read, Some(7));
    }

    #[test]
    fn read_iterations_bound_each_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"0123456\n0123456\n0123456\n").unwrap();
        let cfg = TailConfig {
            file_chunk_size: 8,
            read_iterations: Some(1),
            ..config(&dir)
        };
        let mut tail = tail(&cfg);
        tail.tail(&glob(&dir)).unwrap();

        // one chunk on create, one more on the grow in the same tick
        let mut seen = Collect::default();
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines.len(), 2);
        tail.run_ticks(1, &mut seen).unwrap();
        assert_eq!(seen.lines, vec!["0123456"; 3]);
    }

    /// Truncates the file at the first end of file, appends at the second.
    struct TruncateThenAppend {
        path: PathBuf,
        eofs: usize,
        lines: Vec<String>,
    }

    impl Observer for TruncateThenAppend {
        fn line(&mut self, _path: &Path, line: &[u8]) {
            self.lines.push(String::from_utf8_lossy(line).into_owned());
        }

        fn eof(&mut self, _path: &Path) {
            self.eofs += 1;
            match self.eofs {
                1 => fs::write(&self.path, b"aaaa\n").unwrap(),
                2 => append(&self.path, b"cc\n"),
                _ => {}
            }
        }
    }

    #[test]
    fn truncation_drops_buffered_partial_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"aaaa\nbbbb\npart").unwrap();
        let mut tail = tail(&config(&dir));
        tail.tail(&glob(&dir)).unwrap();

        let mut seen = TruncateThenAppend {
            path: path.clone(),
            eofs: 0,
            lines: Vec::new(),
        };
        tail.run_ticks(3, &mut seen).unwrap();

        assert!(seen.eofs >= 2);
        assert_eq!(seen.lines, vec!["aaaa", "bbbb", "cc"]);
        let read = tail
            .watch()
            .with_discoverer(|d| d.find_by_path(&path).map(WatchedFile::bytes_read));
        assert_eq!(read, Some(8));
    }
}
