//! tailwatch-core library.
//!
//! Follows files matching glob patterns and remembers how far each one has
//! been read, keyed by a hash of its leading bytes so positions survive
//! renames, rotation and restarts.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums carrying an [`error::ErrorCode`];
//!   `anyhow::Result` only where a config file is loaded.
//! - **Logging**: `tracing` macros with structured fields
//!   (`path = %path.display()`, `event = %kind`).

pub mod config;
pub mod converter;
pub mod discover;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod lock;
pub mod sincedb;
pub mod tail;
pub mod throttle;
pub mod tokenizer;
pub mod watch;
pub mod watched_file;

pub use config::{EnvOverrides, Settings, StartPosition, TailConfig, load_config};
pub use error::{ErrorCode, StoreError, TailError};
pub use fingerprint::{FingerprintKey, Fingerprinter};
pub use sincedb::{Lookup, PositionRecord, PositionStore, SincedbFormat, StoreSettings};
pub use tail::{NullObserver, Observer, Tail, TailSettings};
pub use watch::{EventKind, QuitHandle, Watch, WatchSettings};
pub use watched_file::{FileSettings, FileState, WatchedFile, WatchedFileId};
