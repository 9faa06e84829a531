//! Append-only log file writer.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Shared handle to a log file opened in append mode.
///
/// Unbuffered: each `write` call is one append to the file. Callers that
/// hand over a whole line per call keep lines intact when several processes
/// share the file.
#[derive(Clone)]
pub struct AppendWriter {
    inner: Arc<Mutex<File>>,
}

impl AppendWriter {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for AppendWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for AppendWriter {
    type Writer = AppendWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_and_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("logs").join("outbox.jsonl");

        let mut first = AppendWriter::open(&path).unwrap();
        first.write_all(b"one\n").unwrap();

        // A second handle appends rather than truncating.
        let mut second = AppendWriter::open(&path).unwrap();
        second.write_all(b"two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn interleaved_handles_keep_lines_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let mut writer = AppendWriter::open(&path).unwrap();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let line = format!("{{\"worker\":{worker},\"n\":{n}}}\n");
                        writer.write_all(line.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 200);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value["worker"].is_u64());
        }
    }
}
