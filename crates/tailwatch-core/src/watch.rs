//! Polling scheduler.
//!
//! One tick is one pass over every tracked file, in a fixed order:
//!
//! 1. closed files that changed size go back to `watched`;
//! 2. ignored files that changed size go back to `watched` (`unignore`);
//! 3. watched files are admitted up to the open-file budget
//!    (`create_initial` / `create`);
//! 4. active files are restatted and classified
//!    (`delete`, `timeout`, `shrink`, `grow`, `create`);
//! 5. files whose stat failed are forgotten.
//!
//! Registration, discovery and the position store share one mutex with the
//! tick, so the event callback must not call back into the same [`Watch`].
//! The lock is free between ticks.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::discover::Discoverer;
use crate::error::TailError;
use crate::sincedb::PositionStore;
use crate::throttle::WarnThrottle;
use crate::watched_file::{FingerprintChange, WatchedFile, WatchedFileId};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CreateInitial,
    Create,
    Grow,
    Shrink,
    Delete,
    Timeout,
    Unignore,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateInitial => "create_initial",
            Self::Create => "create",
            Self::Grow => "grow",
            Self::Shrink => "shrink",
            Self::Delete => "delete",
            Self::Timeout => "timeout",
            Self::Unignore => "unignore",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub stat_interval: Duration,
    /// Re-glob every this many ticks.
    pub discover_interval: u64,
    pub max_open_files: usize,
    pub max_files_warn_interval: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            stat_interval: Duration::from_secs(1),
            discover_interval: 5,
            max_open_files: 4095,
            max_files_warn_interval: Duration::from_secs(20),
        }
    }
}

/// Stops a running [`Watch`] from any thread.
#[derive(Debug, Clone, Default)]
pub struct QuitHandle(Arc<AtomicBool>);

impl QuitHandle {
    pub fn quit(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_quit(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Watch {
    state: Mutex<WatchState>,
    quit: QuitHandle,
}

#[derive(Debug)]
struct WatchState {
    discoverer: Discoverer,
    store: PositionStore,
    settings: WatchSettings,
    budget_warning: WarnThrottle,
}

/// Delivers events to the caller's callback and counts them.
struct Emitter<'a, F> {
    store: &'a mut PositionStore,
    on_event: &'a mut F,
    emitted: usize,
}

impl<F> Emitter<'_, F>
where
    F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
{
    fn emit(&mut self, kind: EventKind, wf: &mut WatchedFile) {
        debug!(path = %wf.path().display(), event = %kind, "emit");
        (self.on_event)(kind, wf, &mut *self.store);
        self.emitted += 1;
    }
}

impl Watch {
    /// The watch owns `store`; callbacks and [`Watch::with_store`] reach it
    /// under the same lock as the tick.
    #[must_use]
    pub fn new(settings: WatchSettings, discoverer: Discoverer, store: PositionStore) -> Self {
        let budget_warning = WarnThrottle::new(settings.max_files_warn_interval);
        Self {
            state: Mutex::new(WatchState {
                discoverer,
                store,
                settings,
                budget_warning,
            }),
            quit: QuitHandle::default(),
        }
    }

    /// Register a glob and discover its current matches.
    ///
    /// Safe to call from another thread while [`Watch::run`] is looping; the
    /// call waits for the current tick to finish.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::Pattern`] for an invalid glob.
    pub fn watch(&self, pattern: &str) -> Result<usize, TailError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let converted = state.discoverer.converter().converted_records();
        let found = state.discoverer.add_path(pattern, &mut state.store)?;
        state.persist_conversions(converted);
        Ok(found)
    }

    /// Re-glob every registered pattern now.
    pub fn discover(&self) -> usize {
        self.state.lock().discover()
    }

    /// Stop tracking `path` for good: close it and release its record.
    ///
    /// Returns false when the path is not tracked.
    pub fn unwatch(&self, path: &Path) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(id) = state.discoverer.id_for_path(path) else {
            return false;
        };
        let Some(wf) = state.discoverer.get_mut(id) else {
            return false;
        };
        wf.close_handle();
        wf.unwatch();
        state.store.deallocate(wf);
        true
    }

    pub fn quit(&self) {
        self.quit.quit();
    }

    #[must_use]
    pub fn is_quit(&self) -> bool {
        self.quit.is_quit()
    }

    #[must_use]
    pub fn quit_handle(&self) -> QuitHandle {
        self.quit.clone()
    }

    /// Run `f` against the tracked files while holding the lock.
    pub fn with_discoverer<R>(&self, f: impl FnOnce(&Discoverer) -> R) -> R {
        f(&self.state.lock().discoverer)
    }

    /// Run `f` against the position store while holding the lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut PositionStore) -> R) -> R {
        f(&mut self.state.lock().store)
    }

    /// One pass over every tracked file. Returns the number of events emitted.
    pub fn tick_once<F>(&self, on_event: &mut F) -> usize
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        self.state.lock().tick(&self.quit, on_event)
    }

    /// Tick until quit, sleeping `stat_interval` between ticks.
    pub fn subscribe<F>(&self, on_event: F) -> u64
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        self.run(None, on_event)
    }

    /// Like [`Watch::subscribe`], stopping after `max_ticks` when given.
    ///
    /// The lock is held for one discovery plus one tick at a time and is
    /// free while pausing. Open handles are closed on return. Returns the
    /// number of ticks run.
    pub fn run<F>(&self, max_ticks: Option<u64>, mut on_event: F) -> u64
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        let (stat_interval, discover_interval) = {
            let state = self.state.lock();
            (state.settings.stat_interval, state.settings.discover_interval.max(1))
        };
        let done = |ticks: u64| self.is_quit() || max_ticks.is_some_and(|max| ticks >= max);

        let mut ticks = 0u64;
        let mut since_discover = 0u64;
        while !done(ticks) {
            since_discover += 1;
            {
                let mut state = self.state.lock();
                if since_discover >= discover_interval {
                    state.discover();
                    since_discover = 0;
                }
                if self.is_quit() {
                    break;
                }
                state.tick(&self.quit, &mut on_event);
            }
            ticks += 1;
            if done(ticks) {
                break;
            }
            self.pause(stat_interval);
        }

        self.state.lock().discoverer.close_all();
        debug!(ticks, "watch loop stopped");
        ticks
    }

    fn pause(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.is_quit() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

impl WatchState {
    fn discover(&mut self) -> usize {
        let converted = self.discoverer.converter().converted_records();
        let found = self.discoverer.discover(&mut self.store);
        self.persist_conversions(converted);
        found
    }

    /// Write the store once if discovery converted legacy records.
    fn persist_conversions(&mut self, before: usize) {
        let converter = self.discoverer.converter();
        if converter.converted_records() > before {
            if let Err(err) = converter.write_converted(&mut self.store) {
                warn!(code = %err.code(), error = %err, "sincedb write failed after conversion");
            }
        }
    }

    fn tick<F>(&mut self, quit: &QuitHandle, on_event: &mut F) -> usize
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        let Self {
            discoverer,
            store,
            settings,
            budget_warning,
        } = self;
        let mut files = Files {
            discoverer,
            settings,
            budget_warning,
        };
        let mut out = Emitter {
            store,
            on_event,
            emitted: 0,
        };

        let mut gone = Vec::new();
        files.process_closed(quit, &mut out, &mut gone);
        files.process_ignored(quit, &mut out, &mut gone);
        files.process_watched(quit, &mut out, &mut gone);
        files.process_active(quit, &mut out, &mut gone);

        for wf in files.discoverer.delete(&gone) {
            out.store.deallocate(&wf);
            debug!(path = %wf.path().display(), "forgot file");
        }
        out.emitted
    }
}

/// The tracked files of one tick, split off from the store so both can be
/// borrowed at once.
struct Files<'a> {
    discoverer: &'a mut Discoverer,
    settings: &'a WatchSettings,
    budget_warning: &'a WarnThrottle,
}

impl Files<'_> {
    fn process_closed<F>(&mut self, quit: &QuitHandle, out: &mut Emitter<'_, F>, gone: &mut Vec<WatchedFileId>)
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        for id in self.discoverer.ids() {
            if quit.is_quit() {
                return;
            }
            let Some(wf) = self.discoverer.get_mut(id) else {
                continue;
            };
            if !wf.is_closed() {
                continue;
            }
            if let Err(err) = wf.restat() {
                debug!(path = %wf.path().display(), error = %err, "closed file no longer readable");
                gone.push(id);
                continue;
            }
            if wf.size_changed() {
                apply_invalidation(wf, out.store);
                wf.watch();
            }
        }
    }

    fn process_ignored<F>(&mut self, quit: &QuitHandle, out: &mut Emitter<'_, F>, gone: &mut Vec<WatchedFileId>)
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        for id in self.discoverer.ids() {
            if quit.is_quit() {
                return;
            }
            let Some(wf) = self.discoverer.get_mut(id) else {
                continue;
            };
            if !wf.is_ignored() {
                continue;
            }
            if let Err(err) = wf.restat() {
                debug!(path = %wf.path().display(), error = %err, "ignored file no longer readable");
                gone.push(id);
                continue;
            }
            if wf.size_changed() {
                apply_invalidation(wf, out.store);
                wf.watch();
                out.emit(EventKind::Unignore, wf);
            }
        }
    }

    fn process_watched<F>(&mut self, quit: &QuitHandle, out: &mut Emitter<'_, F>, gone: &mut Vec<WatchedFileId>)
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        let max = self.settings.max_open_files;
        let active = self.discoverer.files().filter(|wf| wf.is_active()).count();
        let mut budget = max.saturating_sub(active);
        let waiting: Vec<WatchedFileId> = self
            .discoverer
            .files()
            .filter(|wf| wf.is_watched())
            .map(WatchedFile::id)
            .collect();

        for (idx, id) in waiting.iter().copied().enumerate() {
            if quit.is_quit() {
                return;
            }
            if budget == 0 {
                self.warn_budget(max, self.storable_count(&waiting[idx..]));
                return;
            }
            let Some(wf) = self.discoverer.get_mut(id) else {
                continue;
            };
            if let Err(err) = wf.restat() {
                debug!(path = %wf.path().display(), error = %err, "watched file no longer readable");
                out.emit(EventKind::Delete, wf);
                gone.push(id);
                continue;
            }
            if wf.fingerprint_stale() {
                apply_invalidation(wf, out.store);
            }
            if !wf.is_storable() {
                continue;
            }

            wf.activate();
            budget -= 1;
            if wf.was_parked() {
                continue;
            }
            let kind = if wf.is_initial() {
                EventKind::CreateInitial
            } else {
                EventKind::Create
            };
            out.emit(kind, wf);
        }
    }

    fn process_active<F>(&mut self, quit: &QuitHandle, out: &mut Emitter<'_, F>, gone: &mut Vec<WatchedFileId>)
    where
        F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
    {
        for id in self.discoverer.ids() {
            if quit.is_quit() {
                return;
            }
            let Some(wf) = self.discoverer.get_mut(id) else {
                continue;
            };
            if !wf.is_active() {
                continue;
            }
            if let Err(err) = wf.restat() {
                debug!(path = %wf.path().display(), error = %err, "active file no longer readable");
                out.emit(EventKind::Delete, wf);
                gone.push(id);
                continue;
            }
            if wf.is_closable() {
                out.emit(EventKind::Timeout, wf);
                wf.close_handle();
                wf.close();
                continue;
            }

            if wf.size() < wf.bytes_read() {
                handle_shrink(wf, out);
            } else if wf.size() > wf.bytes_read() {
                handle_grow(wf, out);
            }
        }
    }

    /// Files among `ids` that could take an open slot; empty files never do.
    fn storable_count(&self, ids: &[WatchedFileId]) -> usize {
        ids.iter()
            .filter(|id| self.discoverer.get(**id).is_some_and(WatchedFile::is_storable))
            .count()
    }

    fn warn_budget(&self, max: usize, waiting: usize) {
        if let Some(suppressed) = self.budget_warning.allow() {
            warn!(
                max_open_files = max,
                waiting,
                suppressed,
                "Reached open files limit: {max}, set by the 'max_open_files' option or default, files yet to open: {waiting}"
            );
        }
    }
}

/// The file lost bytes: rewind to the new end, then report.
fn handle_shrink<F>(wf: &mut WatchedFile, out: &mut Emitter<'_, F>)
where
    F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
{
    apply_invalidation(wf, out.store);
    let position = wf.bytes_read().min(wf.size());
    out.store.update_position(wf, position);
    if wf.is_open() {
        if let Err(err) = wf.seek(position) {
            debug!(path = %wf.path().display(), error = %err, "seek after truncation failed");
            wf.close_handle();
        }
    }

    if wf.identity_changed() {
        wf.close_handle();
        if wf.size() > 0 {
            out.emit(EventKind::Shrink, wf);
        } else {
            debug!(path = %wf.path().display(), "replaced by an empty file, waiting for content");
        }
    } else {
        out.emit(EventKind::Shrink, wf);
    }
}

fn handle_grow<F>(wf: &mut WatchedFile, out: &mut Emitter<'_, F>)
where
    F: FnMut(EventKind, &mut WatchedFile, &mut PositionStore),
{
    apply_invalidation(wf, out.store);
    if !wf.identity_changed() {
        out.emit(EventKind::Grow, wf);
    } else if wf.is_open() {
        wf.close_handle();
        out.emit(EventKind::Grow, wf);
    } else {
        out.emit(EventKind::Create, wf);
    }
}

/// Re-read the leading window and carry the store along.
fn apply_invalidation(wf: &mut WatchedFile, store: &mut PositionStore) {
    match wf.invalidate_fingerprints() {
        FingerprintChange::Grown { old, new } | FingerprintChange::Shrunk { old, new } => {
            store.rekey(wf, old, new);
        }
        FingerprintChange::Replaced { old } | FingerprintChange::Cleared { old } => {
            debug!(path = %wf.path().display(), %old, "leading bytes changed, starting over");
            wf.close_handle();
            store.deallocate(wf);
            wf.set_bytes_read(0);
        }
        FingerprintChange::Created | FingerprintChange::Unchanged => {}
    }
}
