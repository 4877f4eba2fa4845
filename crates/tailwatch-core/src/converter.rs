//! Migration of identity-keyed (v1) records to fingerprint keys.
//!
//! Runs once per newly discovered, storable file. A file whose record says
//! it was fully read is parked as `ignored` so only appended bytes are
//! delivered.

use tracing::debug;

use crate::error::StoreError;
use crate::sincedb::{Lookup, PositionStore};
use crate::watched_file::WatchedFile;

#[derive(Debug, Default)]
pub struct Converter {
    converted: usize,
}

impl Converter {
    #[must_use]
    pub const fn new() -> Self {
        Self { converted: 0 }
    }

    /// Number of legacy records moved to fingerprint keys so far.
    #[must_use]
    pub const fn converted_records(&self) -> usize {
        self.converted
    }

    /// Reconcile `wf` with whatever the store already knows about it.
    pub fn convert(&mut self, wf: &mut WatchedFile, store: &mut PositionStore) {
        let Some(key) = wf.storage_key() else {
            return;
        };
        let identity = wf.identity();
        let has_legacy = store.has_legacy(&identity);
        let has_key = store.contains_key(&key);
        debug!(
            path = %wf.path().display(),
            %key,
            %identity,
            has_legacy,
            has_key,
            "convert"
        );

        if has_legacy && !has_key {
            let Some(record) = store.take_legacy(&identity) else {
                return;
            };
            store.adopt(wf, record);
            self.converted += 1;
            if wf.all_read() {
                wf.ignore();
            }
        } else if has_key
            && matches!(store.find(wf, "convert"), Lookup::Allocated { .. })
            && wf.all_read()
        {
            debug!(path = %wf.path().display(), "all bytes already read, ignoring");
            wf.ignore();
        }
    }

    /// Persist the store, noting how many records were converted.
    ///
    /// # Errors
    ///
    /// Returns the store's write error.
    pub fn write_converted(&self, store: &mut PositionStore) -> Result<(), StoreError> {
        store.write(&format!("converted old records: {}", self.converted))
    }
}
