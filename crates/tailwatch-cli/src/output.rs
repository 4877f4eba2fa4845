//! Line printer used as the tail observer.

use std::io::{self, Write};
use std::path::Path;

use tailwatch_core::{Observer, QuitHandle};
use tracing::{debug, warn};

/// Writes each line to `out`, optionally prefixed with its source path.
///
/// The first write failure (usually a closed pipe) stops the tail; later
/// lines are dropped and the failure is reported by [`PrintLines::finish`].
pub struct PrintLines<W: Write> {
    out: W,
    with_path: bool,
    quit: QuitHandle,
    failed: Option<io::Error>,
}

impl<W: Write> PrintLines<W> {
    pub const fn new(out: W, with_path: bool, quit: QuitHandle) -> Self {
        Self {
            out,
            with_path,
            quit,
            failed: None,
        }
    }

    /// Flush and surface any write failure.
    pub fn finish(mut self) -> io::Result<()> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        self.out.flush()
    }

    fn write_line(&mut self, path: &Path, line: &[u8]) -> io::Result<()> {
        if self.with_path {
            write!(self.out, "{}: ", path.display())?;
        }
        self.out.write_all(line)?;
        self.out.write_all(b"\n")
    }

    fn fail(&mut self, err: io::Error) {
        self.quit.quit();
        self.failed = Some(err);
    }
}

impl<W: Write> Observer for PrintLines<W> {
    fn created(&mut self, path: &Path) {
        debug!(path = %path.display(), "following");
    }

    fn line(&mut self, path: &Path, line: &[u8]) {
        if self.failed.is_some() {
            return;
        }
        if let Err(err) = self.write_line(path, line) {
            self.fail(err);
        }
    }

    fn eof(&mut self, _path: &Path) {
        if self.failed.is_some() {
            return;
        }
        if let Err(err) = self.out.flush() {
            self.fail(err);
        }
    }

    fn deleted(&mut self, path: &Path) {
        debug!(path = %path.display(), "stopped following deleted file");
    }

    fn timed_out(&mut self, path: &Path) {
        debug!(path = %path.display(), "closed idle file");
    }

    fn error(&mut self, path: &Path, error: &io::Error) {
        warn!(path = %path.display(), %error, "read failed");
    }
}
