//! Content fingerprints.
//!
//! A fingerprint is an FNV-1a 64-bit hash over a bounded window of a file,
//! tagged with the window's offset and length. Two files whose leading
//! fingerprints are equal are considered the same logical stream, no matter
//! what they are called or which inode they live on.
//!
//! The window is capped at [`MAX_WINDOW`] bytes so fingerprinting cost stays
//! constant regardless of file size.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Largest fingerprint window, in bytes.
pub const MAX_WINDOW: u16 = 255;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a 64-bit hash of `data`.
#[must_use]
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ---------------------------------------------------------------------------
// FingerprintKey
// ---------------------------------------------------------------------------

/// Value-typed signature of `length` bytes starting at `offset`.
///
/// Keys order by `(length, offset, hash)`; the short-key search walks
/// candidates from greatest to least under this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintKey {
    pub hash: u64,
    pub offset: u64,
    pub length: u16,
}

impl FingerprintKey {
    #[must_use]
    pub const fn new(hash: u64, offset: u64, length: u16) -> Self {
        Self {
            hash,
            offset,
            length,
        }
    }

    /// True when the key covers fewer bytes than a full `window`.
    #[must_use]
    pub const fn is_short(&self, window: u16) -> bool {
        self.length < window
    }
}

impl Ord for FingerprintKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.length
            .cmp(&other.length)
            .then(self.offset.cmp(&other.offset))
            .then(self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for FingerprintKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.hash, self.offset, self.length)
    }
}

/// A `hash,offset,length` triple could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint key `{input}`: {reason}")]
pub struct KeyParseError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for FingerprintKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| KeyParseError {
            input: s.to_string(),
            reason,
        };

        let mut parts = s.split(',');
        let (Some(hash), Some(offset), Some(length), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err("expected three comma-separated fields"));
        };

        Ok(Self {
            hash: hash.parse::<u64>().map_err(|_| err("hash is not a u64"))?,
            offset: offset.parse::<u64>().map_err(|_| err("offset is not a u64"))?,
            length: length.parse::<u16>().map_err(|_| err("length is not a u16"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Fingerprinter
// ---------------------------------------------------------------------------

/// Bytes of a window read from a file, plus the offset they were read at.
///
/// Keeping the bytes (at most [`MAX_WINDOW`]) lets the hash be recomputed
/// over any prefix, which is how short keys written for small files are
/// recognised once the file has grown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprinter {
    offset: u64,
    data: Vec<u8>,
}

impl Fingerprinter {
    /// Read up to `window` bytes of `path` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be opened, seeked,
    /// or read.
    pub fn read(path: &Path, offset: u64, window: u16) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut data = Vec::with_capacity(usize::from(window));
        file.take(u64::from(window.min(MAX_WINDOW)))
            .read_to_end(&mut data)?;

        Ok(Self { offset, data })
    }

    /// Build a fingerprint from bytes already in memory.
    #[must_use]
    pub fn from_bytes(offset: u64, data: &[u8]) -> Self {
        let take = data.len().min(usize::from(MAX_WINDOW));
        Self {
            offset,
            data: data[..take].to_vec(),
        }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes covered.
    #[must_use]
    pub fn len(&self) -> u16 {
        // data is capped at MAX_WINDOW on construction
        u16::try_from(self.data.len()).unwrap_or(MAX_WINDOW)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hash over the first `length` bytes (or all bytes if fewer are held).
    #[must_use]
    pub fn hash_at(&self, length: u16) -> u64 {
        let end = usize::from(length).min(self.data.len());
        fnv1a64(&self.data[..end])
    }

    /// Key over every byte held.
    #[must_use]
    pub fn key(&self) -> FingerprintKey {
        FingerprintKey::new(self.hash_at(self.len()), self.offset, self.len())
    }

    /// Copy of this fingerprint truncated to `length` bytes.
    #[must_use]
    pub fn with_length(&self, length: u16) -> Self {
        Self::from_bytes(self.offset, &self.data[..usize::from(length).min(self.data.len())])
    }

    /// First candidate whose offset equals ours and whose hash equals ours
    /// recomputed over the candidate's declared length.
    ///
    /// Candidates longer than the bytes held can never match. Iteration order
    /// is preserved, so callers pass candidates in preference order.
    pub fn matches_any<'a, I>(&self, candidates: I) -> Option<FingerprintKey>
    where
        I: IntoIterator<Item = &'a FingerprintKey>,
    {
        candidates
            .into_iter()
            .find(|candidate| self.covers(candidate))
            .copied()
    }

    /// True when `key` describes a prefix of the bytes held.
    #[must_use]
    pub fn covers(&self, key: &FingerprintKey) -> bool {
        key.offset == self.offset
            && usize::from(key.length) <= self.data.len()
            && self.hash_at(key.length) == key.hash
    }

    /// True when the shorter of the two ranges hashes equal to the
    /// overlapping prefix of the longer.
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        if self.offset != other.offset {
            return false;
        }
        let shared = self.len().min(other.len());
        self.hash_at(shared) == other.hash_at(shared)
    }
}
