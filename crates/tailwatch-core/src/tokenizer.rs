//! Delimiter-based line splitting across read boundaries.

/// Splits a byte stream into delimiter-terminated lines.
///
/// Bytes after the last delimiter are held until a later chunk completes
/// them; they are never reported as a line on their own.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl Tokenizer {
    /// An empty delimiter falls back to `\n`.
    #[must_use]
    pub fn new(delimiter: &[u8]) -> Self {
        let delimiter = if delimiter.is_empty() {
            b"\n".to_vec()
        } else {
            delimiter.to_vec()
        };
        Self {
            delimiter,
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub fn delimiter_len(&self) -> usize {
        self.delimiter.len()
    }

    /// Feed `data`; returns every line it completes, delimiters stripped.
    pub fn extract(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let dlen = self.delimiter.len();
        // a delimiter may straddle the previous chunk boundary
        let mut cursor = self.buffer.len().saturating_sub(dlen - 1);
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(idx) = find(&self.buffer[cursor..], &self.delimiter) {
            let end = cursor + idx;
            lines.push(self.buffer[start..end].to_vec());
            start = end + dlen;
            cursor = start;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Bytes held back waiting for a delimiter.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Take the incomplete tail, leaving the buffer empty.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
