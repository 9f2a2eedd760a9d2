//! Log sinks consuming build output lines.
//!
//! Two implementations back the renderer: [`FileLog`] appends every line
//! to a UTF-8 file and fails fast on I/O errors, [`MessageCollector`]
//! holds lines in memory until flushed. Flushing hands buffered lines
//! back to the caller, which clears the live display before printing;
//! the sink never touches the terminal itself.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// A closeable consumer of log lines.
pub trait ClientLog: Send {
    /// Append one line.
    fn accept(&mut self, line: &str) -> io::Result<()>;

    /// Flush buffered state. Returned lines must be printed to stdout by
    /// the caller after clearing the live display.
    fn flush(&mut self) -> io::Result<Vec<String>>;

    /// Close the sink, returning any last lines to print.
    fn close(&mut self) -> io::Result<Vec<String>>;

    /// Whether lines end up in a file rather than on the terminal.
    fn is_file_backed(&self) -> bool {
        false
    }
}

/// Sink writing each line to a buffered UTF-8 file.
#[derive(Debug)]
pub struct FileLog {
    out: BufWriter<File>,
    path: PathBuf,
}

impl FileLog {
    /// Create or truncate the log file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let out = BufWriter::new(File::create(&path)?);
        Ok(Self { out, path })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClientLog for FileLog {
    fn accept(&mut self, line: &str) -> io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<Vec<String>> {
        self.out.flush()?;
        Ok(Vec::new())
    }

    fn close(&mut self) -> io::Result<Vec<String>> {
        self.flush()
    }

    fn is_file_backed(&self) -> bool {
        true
    }
}

/// Sink collecting lines in memory until flush or close.
#[derive(Debug, Default)]
pub struct MessageCollector {
    lines: Vec<String>,
}

impl MessageCollector {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines currently buffered. Exposed for tests.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl ClientLog for MessageCollector {
    fn accept(&mut self, line: &str) -> io::Result<()> {
        self.lines.push(line.to_owned());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<Vec<String>> {
        Ok(std::mem::take(&mut self.lines))
    }

    fn close(&mut self) -> io::Result<Vec<String>> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_hands_lines_back_on_flush() {
        let mut sink = MessageCollector::new();
        sink.accept("one").unwrap();
        sink.accept("two").unwrap();
        assert_eq!(sink.flush().unwrap(), vec!["one", "two"]);
        assert!(sink.flush().unwrap().is_empty());
    }

    #[test]
    fn file_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        {
            let mut sink = FileLog::create(&path).unwrap();
            sink.accept("alpha").unwrap();
            sink.accept("beta").unwrap();
            assert!(sink.close().unwrap().is_empty());
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "alpha\nbeta\n");
    }

    #[test]
    fn only_file_log_reports_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileLog::create(dir.path().join("x.log")).unwrap().is_file_backed());
        assert!(!MessageCollector::new().is_file_backed());
    }
}
