//! Glob discovery of files to watch.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::converter::Converter;
use crate::error::TailError;
use crate::identity::FileIdentity;
use crate::sincedb::PositionStore;
use crate::watched_file::{FileSettings, WatchedFile, WatchedFileId};

/// Owns every [`WatchedFile`], in first-seen order.
#[derive(Debug)]
pub struct Discoverer {
    patterns: Vec<String>,
    exclude: GlobSet,
    files: BTreeMap<WatchedFileId, WatchedFile>,
    paths: HashMap<PathBuf, WatchedFileId>,
    next_id: u64,
    settings: FileSettings,
    resolver: Arc<dyn FileIdentity>,
    converter: Converter,
}

impl Discoverer {
    /// # Errors
    ///
    /// Returns [`TailError::Pattern`] if an exclude glob is invalid.
    pub fn new(
        settings: FileSettings,
        exclude: &[String],
        resolver: Arc<dyn FileIdentity>,
    ) -> Result<Self, TailError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude {
            let glob = Glob::new(pattern).map_err(|err| TailError::Pattern {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;
            builder.add(glob);
        }
        let exclude_set = builder.build().map_err(|err| TailError::Pattern {
            pattern: exclude.join(","),
            reason: err.to_string(),
        })?;

        Ok(Self {
            patterns: Vec::new(),
            exclude: exclude_set,
            files: BTreeMap::new(),
            paths: HashMap::new(),
            next_id: 1,
            settings,
            resolver,
            converter: Converter::new(),
        })
    }

    /// Register `pattern` and discover its current matches.
    ///
    /// Files found here are flagged initial. Registering a pattern twice
    /// is a no-op. Returns the number of newly tracked files.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::Pattern`] if `pattern` is not a valid glob.
    pub fn add_path(&mut self, pattern: &str, store: &mut PositionStore) -> Result<usize, TailError> {
        if self.patterns.iter().any(|p| p == pattern) {
            return Ok(0);
        }
        glob::Pattern::new(pattern).map_err(|err| TailError::Pattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        self.patterns.push(pattern.to_string());
        Ok(self.discover_pattern(pattern, true, store))
    }

    /// Re-glob every registered pattern, tracking new matches.
    pub fn discover(&mut self, store: &mut PositionStore) -> usize {
        let patterns = self.patterns.clone();
        patterns
            .iter()
            .map(|pattern| self.discover_pattern(pattern, false, store))
            .sum()
    }

    fn discover_pattern(&mut self, pattern: &str, initial: bool, store: &mut PositionStore) -> usize {
        let mut added = 0;
        for path in globbed_files(pattern) {
            if self.paths.contains_key(&path) {
                continue;
            }
            let metadata = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "discovered path vanished");
                    continue;
                }
            };

            let id = WatchedFileId(self.next_id);
            self.next_id += 1;
            let mut wf = WatchedFile::new(
                id,
                path.clone(),
                &metadata,
                Arc::clone(&self.resolver),
                self.settings,
                initial,
            );
            debug!(path = %path.display(), %id, initial, "discovered");

            if self.is_excluded(&path) {
                debug!(path = %path.display(), "skipping, matches exclude");
                wf.unwatch();
            } else {
                if initial && wf.is_ignorable() {
                    debug!(path = %path.display(), "skipping, older than ignore_older");
                    wf.ignore();
                }
                if wf.is_storable() {
                    self.converter.convert(&mut wf, store);
                }
            }

            self.paths.insert(path, id);
            self.files.insert(id, wf);
            added += 1;
        }
        added
    }

    fn is_excluded(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| self.exclude.is_match(Path::new(name)))
    }

    #[must_use]
    pub const fn converter(&self) -> &Converter {
        &self.converter
    }

    #[must_use]
    pub fn get(&self, id: WatchedFileId) -> Option<&WatchedFile> {
        self.files.get(&id)
    }

    pub fn get_mut(&mut self, id: WatchedFileId) -> Option<&mut WatchedFile> {
        self.files.get_mut(&id)
    }

    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<&WatchedFile> {
        self.paths.get(path).and_then(|id| self.files.get(id))
    }

    #[must_use]
    pub fn id_for_path(&self, path: &Path) -> Option<WatchedFileId> {
        self.paths.get(path).copied()
    }

    /// Ids in first-seen order.
    #[must_use]
    pub fn ids(&self) -> Vec<WatchedFileId> {
        self.files.keys().copied().collect()
    }

    pub fn files(&self) -> impl Iterator<Item = &WatchedFile> {
        self.files.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stop tracking `ids`; the removed files are returned.
    pub fn delete(&mut self, ids: &[WatchedFileId]) -> Vec<WatchedFile> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(wf) = self.files.remove(id) {
                self.paths.remove(wf.path());
                removed.push(wf);
            }
        }
        removed
    }

    /// Close every open handle.
    pub fn close_all(&mut self) {
        for wf in self.files.values_mut() {
            wf.close_handle();
        }
    }
}

/// Regular-file matches for `pattern`, falling back to the literal path
/// when the glob matches nothing.
fn globbed_files(pattern: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(%pattern, error = %err, "glob entry unreadable");
                    None
                }
            })
            .filter(|p| p.is_file())
            .collect(),
        Err(err) => {
            debug!(%pattern, error = %err, "invalid glob, trying literal path");
            Vec::new()
        }
    };
    if found.is_empty() {
        let literal = PathBuf::from(pattern);
        if literal.is_file() {
            debug!(%pattern, "glob matched nothing, using literal path");
            found.push(literal);
        }
    }
    found
}
