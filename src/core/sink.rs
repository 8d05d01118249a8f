//! Output sinks.
//!
//! A sink only ever receives a complete artifact: the pass manager hands it the
//! buffered bytes once every pass has succeeded. File sinks write to a
//! temporary sibling and rename it into place, so an interrupted write never
//! leaves a truncated artifact behind.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

enum SinkKind {
    Memory(Vec<u8>),
    File(PathBuf),
    Stdout,
    Writer(Box<dyn Write + Send>),
}

/// Destination of an emitted artifact, owned by the caller of a pipeline run.
pub struct OutputSink {
    kind: SinkKind,
    committed: usize,
}

impl OutputSink {
    pub fn memory() -> Self {
        Self::with_kind(SinkKind::Memory(Vec::new()))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_kind(SinkKind::File(path.into()))
    }

    pub fn stdout() -> Self {
        Self::with_kind(SinkKind::Stdout)
    }

    pub fn writer(writer: Box<dyn Write + Send>) -> Self {
        Self::with_kind(SinkKind::Writer(writer))
    }

    fn with_kind(kind: SinkKind) -> Self {
        Self { kind, committed: 0 }
    }

    /// Write a complete artifact.
    pub fn commit(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.kind {
            SinkKind::Memory(buffer) => buffer.extend_from_slice(bytes),
            SinkKind::File(path) => write_atomically(path, bytes)?,
            SinkKind::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()?;
            }
            SinkKind::Writer(writer) => {
                writer.write_all(bytes)?;
                writer.flush()?;
            }
        }
        self.committed += bytes.len();
        log::debug!("committed {} bytes to {self}", bytes.len());
        Ok(())
    }

    /// Bytes committed so far.
    pub fn committed_len(&self) -> usize {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// Contents of an in-memory sink.
    pub fn contents(&self) -> Option<&[u8]> {
        match &self.kind {
            SinkKind::Memory(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.kind {
            SinkKind::Memory(buffer) => Some(buffer),
            _ => None,
        }
    }
}

impl fmt::Display for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SinkKind::Memory(_) => f.write_str("<memory>"),
            SinkKind::File(path) => write!(f, "{}", path.display()),
            SinkKind::Stdout => f.write_str("<stdout>"),
            SinkKind::Writer(_) => f.write_str("<writer>"),
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("target", &self.to_string())
            .field("committed", &self.committed)
            .finish()
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("`{}` is not a file path", path.display()))
    })?;
    tmp_name.push(".partial");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
