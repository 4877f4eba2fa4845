//! On-disk encodings of the position store.
//!
//! # Plain format
//!
//! One record per line, space separated:
//!
//! ```text
//! <hash>,<offset>,<length> <position> <last_seen> [<hash2>,<offset2>,<length2>]   # fingerprint record
//! <inode> <dev_major> <dev_minor> <position> [<last_seen>]                         # legacy record
//! ```
//!
//! `last_seen` is fractional seconds since the Unix epoch.
//!
//! # JSON format
//!
//! ```text
//! {"version":"1.0","records":[{"position":..,"last_seen":..,
//!   "fingerprints":[{"hash":..,"offset":..,"size":..,"algo":"fnv"}],
//!   "path":..,"state":{"inode":..,"device_major":..,"device_minor":..}}]}
//! ```
//!
//! A record without fingerprints is a legacy record keyed on `state`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::fingerprint::FingerprintKey;
use crate::identity::IdentityKey;

pub const JSON_VERSION: &str = "1.0";
const FINGERPRINT_ALGO: &str = "fnv";

/// Which encoding the store file uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SincedbFormat {
    #[default]
    Plain,
    Json,
}

/// What a persisted record is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKey {
    Fingerprint(FingerprintKey),
    Legacy(IdentityKey),
}

/// A record as it appears on disk, independent of the live store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: StoredKey,
    pub position: u64,
    pub last_seen: f64,
    pub secondary: Option<FingerprintKey>,
    pub path: Option<PathBuf>,
    pub identity: Option<IdentityKey>,
}

/// Decode a whole store file. `now` fills in a missing legacy `last_seen`.
///
/// Plain lines that cannot be parsed are logged and skipped.
///
/// # Errors
///
/// Returns [`StoreError::Json`] if a JSON document is malformed.
pub fn decode(format: SincedbFormat, text: &str, now: f64) -> Result<Vec<StoredRecord>, StoreError> {
    match format {
        SincedbFormat::Plain => Ok(text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(idx, line)| match parse_line(line, idx + 1, now) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(code = %err.code(), error = %err, "skipping sincedb line");
                    None
                }
            })
            .collect()),
        SincedbFormat::Json => decode_json(text, now),
    }
}

/// Encode records in the requested format.
///
/// # Errors
///
/// Returns [`StoreError::Json`] if serialization fails.
pub fn encode(format: SincedbFormat, records: &[StoredRecord]) -> Result<String, StoreError> {
    match format {
        SincedbFormat::Plain => {
            let mut out = String::new();
            for record in records {
                out.push_str(&format_line(record));
                out.push('\n');
            }
            Ok(out)
        }
        SincedbFormat::Json => encode_json(records),
    }
}

// ---------------------------------------------------------------------------
// Plain lines
// ---------------------------------------------------------------------------

/// Parse one plain line; `line_no` is 1-based and only used for errors.
///
/// # Errors
///
/// Returns [`StoreError::Parse`] describing the first bad field.
pub fn parse_line(line: &str, line_no: usize, now: f64) -> Result<StoredRecord, StoreError> {
    let parse_err = |reason: String| StoreError::Parse {
        line: line_no,
        reason,
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    let Some(first) = fields.first() else {
        return Err(parse_err("empty line".to_string()));
    };

    if first.contains(',') {
        let [key, position, last_seen, rest @ ..] = fields.as_slice() else {
            return Err(parse_err(format!(
                "expected at least 3 fields, found {}",
                fields.len()
            )));
        };
        let secondary = match rest {
            [] => None,
            [secondary] => Some(
                secondary
                    .parse::<FingerprintKey>()
                    .map_err(|err| parse_err(err.to_string()))?,
            ),
            _ => return Err(parse_err(format!("unexpected trailing fields: {rest:?}"))),
        };
        return Ok(StoredRecord {
            key: StoredKey::Fingerprint(
                key.parse::<FingerprintKey>()
                    .map_err(|err| parse_err(err.to_string()))?,
            ),
            position: parse_u64(position, "position").map_err(parse_err)?,
            last_seen: parse_f64(last_seen).map_err(parse_err)?,
            secondary,
            path: None,
            identity: None,
        });
    }

    let (inode, major, minor, position, last_seen) = match fields.as_slice() {
        [inode, major, minor, position] => (inode, major, minor, position, None),
        [inode, major, minor, position, last_seen] => {
            (inode, major, minor, position, Some(last_seen))
        }
        _ => {
            return Err(parse_err(format!(
                "expected 4 or 5 legacy fields, found {}",
                fields.len()
            )));
        }
    };
    let identity = IdentityKey::new(
        parse_u64(inode, "inode").map_err(parse_err)?,
        parse_u64(major, "device major").map_err(parse_err)?,
        parse_u64(minor, "device minor").map_err(parse_err)?,
    );
    let last_seen = match last_seen {
        Some(raw) => parse_f64(raw).map_err(parse_err)?,
        None => now,
    };
    Ok(StoredRecord {
        key: StoredKey::Legacy(identity),
        position: parse_u64(position, "position").map_err(parse_err)?,
        last_seen,
        secondary: None,
        path: None,
        identity: Some(identity),
    })
}

/// Format one record as a plain line, without the trailing newline.
#[must_use]
pub fn format_line(record: &StoredRecord) -> String {
    match record.key {
        StoredKey::Fingerprint(key) => {
            let mut line = format!("{key} {} {:.6}", record.position, record.last_seen);
            if let Some(secondary) = record.secondary {
                line.push(' ');
                line.push_str(&secondary.to_string());
            }
            line
        }
        StoredKey::Legacy(identity) => {
            format!("{identity} {} {:.6}", record.position, record.last_seen)
        }
    }
}

fn parse_u64(raw: &str, what: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("{what} `{raw}` is not an unsigned integer"))
}

fn parse_f64(raw: &str) -> Result<f64, String> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(format!("last_seen `{raw}` is not a timestamp")),
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct JsonDocument {
    version: String,
    #[serde(default)]
    records: Vec<JsonRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonRecord {
    position: u64,
    #[serde(default)]
    last_seen: Option<f64>,
    #[serde(default)]
    fingerprints: Vec<JsonFingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<JsonState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonFingerprint {
    hash: u64,
    offset: u64,
    size: u16,
    #[serde(default = "default_algo")]
    algo: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonState {
    inode: u64,
    device_major: u64,
    device_minor: u64,
}

fn default_algo() -> String {
    FINGERPRINT_ALGO.to_string()
}

impl From<FingerprintKey> for JsonFingerprint {
    fn from(key: FingerprintKey) -> Self {
        Self {
            hash: key.hash,
            offset: key.offset,
            size: key.length,
            algo: default_algo(),
        }
    }
}

impl From<&JsonFingerprint> for FingerprintKey {
    fn from(fp: &JsonFingerprint) -> Self {
        Self::new(fp.hash, fp.offset, fp.size)
    }
}

impl From<IdentityKey> for JsonState {
    fn from(identity: IdentityKey) -> Self {
        Self {
            inode: identity.file_id,
            device_major: identity.major,
            device_minor: identity.minor,
        }
    }
}

impl From<&JsonState> for IdentityKey {
    fn from(state: &JsonState) -> Self {
        Self::new(state.inode, state.device_major, state.device_minor)
    }
}

fn encode_json(records: &[StoredRecord]) -> Result<String, StoreError> {
    let records = records
        .iter()
        .map(|record| {
            let fingerprints = match record.key {
                StoredKey::Fingerprint(key) => std::iter::once(key)
                    .chain(record.secondary)
                    .map(JsonFingerprint::from)
                    .collect(),
                StoredKey::Legacy(_) => Vec::new(),
            };
            let identity = match record.key {
                StoredKey::Legacy(identity) => Some(identity),
                StoredKey::Fingerprint(_) => record.identity,
            };
            JsonRecord {
                position: record.position,
                last_seen: Some(record.last_seen),
                fingerprints,
                path: record.path.clone(),
                state: identity.map(JsonState::from),
            }
        })
        .collect();

    let doc = JsonDocument {
        version: JSON_VERSION.to_string(),
        records,
    };
    Ok(serde_json::to_string(&doc)?)
}

fn decode_json(text: &str, now: f64) -> Result<Vec<StoredRecord>, StoreError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: JsonDocument = serde_json::from_str(text)?;
    if doc.version != JSON_VERSION {
        warn!(version = %doc.version, "unknown sincedb JSON version, reading anyway");
    }

    let mut out = Vec::with_capacity(doc.records.len());
    for (idx, record) in doc.records.iter().enumerate() {
        let identity = record.state.as_ref().map(IdentityKey::from);
        let key = match (record.fingerprints.first(), identity) {
            (Some(primary), _) => StoredKey::Fingerprint(primary.into()),
            (None, Some(identity)) => StoredKey::Legacy(identity),
            (None, None) => {
                let err = StoreError::Parse {
                    line: idx + 1,
                    reason: "record has neither fingerprints nor state".to_string(),
                };
                warn!(code = %err.code(), error = %err, "skipping sincedb record");
                continue;
            }
        };
        out.push(StoredRecord {
            key,
            position: record.position,
            last_seen: record.last_seen.unwrap_or(now),
            secondary: record.fingerprints.get(1).map(FingerprintKey::from),
            path: record.path.clone(),
            identity,
        });
    }
    Ok(out)
}
