//! End-to-end scenarios for the watch loop and the observing tail.
//!
//! Each test works in its own temp directory with its own position store
//! and drives the loop tick by tick, so no test depends on wall-clock
//! polling.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tailwatch_core::discover::Discoverer;
use tailwatch_core::identity::platform_identity;
use tailwatch_core::sincedb::epoch_now;
use tailwatch_core::{
    EnvOverrides, EventKind, FileSettings, Observer, PositionStore, StartPosition, StoreSettings,
    Tail, TailConfig, Watch, WatchSettings, WatchedFile,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Recorder {
    lines: Vec<(PathBuf, String)>,
    created: Vec<PathBuf>,
    deleted: Vec<PathBuf>,
}

impl Recorder {
    fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|(_, l)| l.as_str()).collect()
    }

    fn texts_for(&self, path: &Path) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, l)| l.as_str())
            .collect()
    }
}

impl Observer for Recorder {
    fn created(&mut self, path: &Path) {
        self.created.push(path.to_path_buf());
    }

    fn line(&mut self, path: &Path, line: &[u8]) {
        self.lines
            .push((path.to_path_buf(), String::from_utf8_lossy(line).into_owned()));
    }

    fn deleted(&mut self, path: &Path) {
        self.deleted.push(path.to_path_buf());
    }
}

fn base_config(dir: &TempDir) -> TailConfig {
    TailConfig {
        sincedb_path: Some(dir.path().join("sincedb")),
        start_new_files_at: StartPosition::Beginning,
        stat_interval: 0.0,
        discover_interval: 1,
        ..TailConfig::default()
    }
}

fn open_tail(config: &TailConfig) -> Tail {
    let settings = config
        .resolve(&EnvOverrides::default())
        .expect("config resolves");
    Tail::from_settings(settings).expect("tail opens")
}

fn logs(dir: &TempDir) -> PathBuf {
    dir.path().join("logs")
}

fn log_glob(dir: &TempDir) -> String {
    logs(dir).join("*.log").to_string_lossy().into_owned()
}

fn write_log(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    fs::create_dir_all(logs(dir)).unwrap();
    let path = logs(dir).join(name);
    fs::write(&path, content).unwrap();
    path
}

fn append(path: &Path, data: &[u8]) {
    let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(data).unwrap();
}

fn raw_watch(dir: &TempDir, settings: WatchSettings) -> Watch {
    let discoverer = Discoverer::new(FileSettings::default(), &[], platform_identity()).unwrap();
    let store = PositionStore::in_memory(StoreSettings::new(dir.path().join("sincedb")));
    Watch::new(settings, discoverer, store)
}

/// Shared 260-byte header followed by `tag`-specific lines, 650 bytes total.
fn shared_prefix_content(tag: char) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..13 {
        out.extend_from_slice(format!("header line {i:07}\n").as_bytes());
    }
    for i in 0..30 {
        out.extend_from_slice(format!("{tag}-line {i:05}\n").as_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Watch loop scenarios
// ---------------------------------------------------------------------------

#[test]
fn preexisting_file_yields_create_initial_then_grow() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, "1.log", b"line1\nline2\n");
    let watch = raw_watch(&dir, WatchSettings::default());
    watch.watch(&log_glob(&dir)).unwrap();

    let mut events = Vec::new();
    watch.tick_once(&mut |kind: EventKind, wf: &mut WatchedFile, store: &mut PositionStore| {
        events.push(kind);
        match kind {
            EventKind::CreateInitial => store.allocate_new(wf, 0),
            EventKind::Grow => {
                let size = wf.size();
                store.update_position(wf, size);
            }
            _ => {}
        }
    });

    assert_eq!(events, vec![EventKind::CreateInitial, EventKind::Grow]);
    let read = watch.with_discoverer(|d| d.find_by_path(&path).map(WatchedFile::bytes_read));
    assert_eq!(read, Some(12));
}

#[test]
fn single_open_slot_admits_one_file_per_tick() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "1.log", b"line1\nline2\n");
    write_log(&dir, "2.log", b"lineA\nlineB\n");
    let settings = WatchSettings {
        max_open_files: 1,
        max_files_warn_interval: Duration::ZERO,
        ..WatchSettings::default()
    };
    let watch = raw_watch(&dir, settings);
    watch.watch(&log_glob(&dir)).unwrap();

    let mut events = Vec::new();
    watch.tick_once(&mut |kind: EventKind, wf: &mut WatchedFile, store: &mut PositionStore| {
        events.push((kind, wf.path().to_path_buf()));
        if kind == EventKind::CreateInitial {
            store.allocate_new(wf, 0);
        }
    });

    let kinds: Vec<EventKind> = events.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![EventKind::CreateInitial, EventKind::Grow]);
    assert_eq!(events[0].1, events[1].1);
    let (active, waiting) = watch.with_discoverer(|d| {
        (
            d.files().filter(|wf| wf.is_active()).count(),
            d.files().filter(|wf| wf.is_watched()).count(),
        )
    });
    assert_eq!((active, waiting), (1, 1));
}

#[test]
fn rediscovery_without_changes_emits_nothing() {
    let dir = TempDir::new().unwrap();
    write_log(&dir, "1.log", b"line1\n");
    let watch = raw_watch(&dir, WatchSettings::default());
    watch.watch(&log_glob(&dir)).unwrap();

    let mut count = 0;
    let mut consume = |kind: EventKind, wf: &mut WatchedFile, store: &mut PositionStore| {
        count += 1;
        if kind == EventKind::CreateInitial {
            store.allocate_new(wf, 0);
        } else {
            let size = wf.size();
            store.update_position(wf, size);
        }
    };
    watch.tick_once(&mut consume);
    watch.discover();
    watch.discover();
    assert_eq!(watch.tick_once(&mut consume), 0);
    assert_eq!(count, 2);
}

// ---------------------------------------------------------------------------
// Tail scenarios
// ---------------------------------------------------------------------------

#[test]
fn ignored_file_delivers_only_appended_bytes() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, "old.log", b"line1\nline2\n");
    thread::sleep(Duration::from_millis(30));
    let config = TailConfig {
        ignore_older: Some(0.01),
        ..base_config(&dir)
    };
    let mut tail = open_tail(&config);
    tail.tail(&log_glob(&dir)).unwrap();

    let mut seen = Recorder::default();
    tail.run_ticks(1, &mut seen).unwrap();
    assert!(seen.lines.is_empty());

    append(&path, b"line3\n");
    tail.run_ticks(1, &mut seen).unwrap();
    assert_eq!(seen.texts(), vec!["line3"]);
}

#[test]
fn shared_prefix_files_are_distinct_streams() {
    let dir = TempDir::new().unwrap();
    let a = write_log(&dir, "a.log", &shared_prefix_content('a'));
    let b = write_log(&dir, "b.log", &shared_prefix_content('b'));
    let config = base_config(&dir);

    {
        let mut tail = open_tail(&config);
        tail.tail(&log_glob(&dir)).unwrap();
        let mut seen = Recorder::default();
        tail.run_ticks(1, &mut seen).unwrap();

        assert_eq!(seen.texts_for(&a).len(), 43);
        assert_eq!(seen.texts_for(&b).len(), 43);

        let key = tail
            .watch()
            .with_discoverer(|d| d.find_by_path(&a).and_then(WatchedFile::storage_key))
            .unwrap();
        let records = tail.with_store(|store| store.get_all(&key).to_vec());
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.position() == 650));
        assert!(records.iter().all(|r| r.secondary().is_some()));
        assert_ne!(records[0].secondary(), records[1].secondary());
    }

    append(&a, b"a-tail\n");
    append(&b, b"b-tail\n");

    let mut tail = open_tail(&config);
    tail.tail(&log_glob(&dir)).unwrap();
    let mut seen = Recorder::default();
    tail.run_ticks(1, &mut seen).unwrap();
    assert_eq!(seen.texts_for(&a), vec!["a-tail"]);
    assert_eq!(seen.texts_for(&b), vec!["b-tail"]);
}

#[test]
fn rename_within_glob_resumes_instead_of_rereading() {
    let dir = TempDir::new().unwrap();
    let old = write_log(&dir, "app.log", b"line1\nline2\n");
    let mut tail = open_tail(&base_config(&dir));
    tail.tail(&log_glob(&dir)).unwrap();

    let mut seen = Recorder::default();
    tail.run_ticks(1, &mut seen).unwrap();
    assert_eq!(seen.texts(), vec!["line1", "line2"]);

    let new = logs(&dir).join("app-1.log");
    fs::rename(&old, &new).unwrap();
    append(&new, b"line3\n");
    tail.run_ticks(3, &mut seen).unwrap();

    assert_eq!(seen.deleted, vec![old]);
    assert_eq!(seen.texts(), vec!["line1", "line2", "line3"]);
    assert_eq!(seen.texts_for(&new), vec!["line3"]);
}

#[test]
fn rename_out_of_glob_is_a_delete() {
    let dir = TempDir::new().unwrap();
    let old = write_log(&dir, "app.log", b"line1\n");
    let mut tail = open_tail(&base_config(&dir));
    tail.tail(&log_glob(&dir)).unwrap();

    let mut seen = Recorder::default();
    tail.run_ticks(1, &mut seen).unwrap();
    fs::rename(&old, logs(&dir).join("app.log.1")).unwrap();
    tail.run_ticks(2, &mut seen).unwrap();

    assert_eq!(seen.deleted, vec![old]);
    assert!(tail.watch().with_discoverer(Discoverer::is_empty));
}

#[test]
fn truncation_never_leaves_bytes_read_past_size() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, "app.log", b"line1\nline2\nline3\n");
    let mut tail = open_tail(&base_config(&dir));
    tail.tail(&log_glob(&dir)).unwrap();

    let mut seen = Recorder::default();
    tail.run_ticks(1, &mut seen).unwrap();

    fs::write(&path, b"line1\n").unwrap();
    tail.run_ticks(1, &mut seen).unwrap();
    let (read, size) = tail
        .watch()
        .with_discoverer(|d| d.find_by_path(&path).map(|wf| (wf.bytes_read(), wf.size())))
        .unwrap();
    assert!(read <= size);
    assert_eq!(read, 6);

    append(&path, b"line4\n");
    tail.run_ticks(1, &mut seen).unwrap();
    assert_eq!(seen.texts(), vec!["line1", "line2", "line3", "line4"]);
}

#[test]
fn restart_reads_only_new_lines() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, "app.log", b"line1\nline2\n");
    let config = base_config(&dir);

    let mut first = Recorder::default();
    {
        let mut tail = open_tail(&config);
        tail.tail(&log_glob(&dir)).unwrap();
        tail.run_ticks(2, &mut first).unwrap();
    }
    append(&path, b"line3\nline4\n");

    let mut second = Recorder::default();
    let mut tail = open_tail(&config);
    tail.tail(&log_glob(&dir)).unwrap();
    tail.run_ticks(2, &mut second).unwrap();

    assert_eq!(first.texts(), vec!["line1", "line2"]);
    assert_eq!(second.texts(), vec!["line3", "line4"]);
}

#[test]
fn json_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, "app.log", b"line1\n");
    let config = TailConfig {
        sincedb_format: tailwatch_core::SincedbFormat::Json,
        ..base_config(&dir)
    };

    {
        let mut tail = open_tail(&config);
        tail.tail(&log_glob(&dir)).unwrap();
        tail.run_ticks(1, &mut Recorder::default()).unwrap();
    }
    let text = fs::read_to_string(dir.path().join("sincedb")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(doc["records"][0]["position"], 6);
    assert_eq!(doc["records"][0]["fingerprints"][0]["algo"], "fnv");

    append(&path, b"line2\n");
    let mut seen = Recorder::default();
    let mut tail = open_tail(&config);
    tail.tail(&log_glob(&dir)).unwrap();
    tail.run_ticks(1, &mut seen).unwrap();
    assert_eq!(seen.texts(), vec!["line2"]);
}

#[cfg(unix)]
#[test]
fn legacy_record_is_converted_and_resumed() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, "app.log", b"line1\nline2\n");
    let identity = platform_identity().identity_of(&path, &fs::metadata(&path).unwrap());
    fs::write(
        dir.path().join("sincedb"),
        format!("{identity} 6 {:.6}\n", epoch_now()),
    )
    .unwrap();

    let mut tail = open_tail(&base_config(&dir));
    tail.tail(&log_glob(&dir)).unwrap();
    assert_eq!(tail.converted_records(), 1);

    let text = fs::read_to_string(dir.path().join("sincedb")).unwrap();
    assert!(text.lines().all(|line| line.contains(',')));

    let mut seen = Recorder::default();
    tail.run_ticks(1, &mut seen).unwrap();
    assert_eq!(seen.texts(), vec!["line2"]);
}
