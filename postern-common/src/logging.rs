//! Logging bootstrap.
//!
//! Every crate logs through `tracing`. Output goes to stderr and to the
//! configured log file, which rotates by size: once the active file passes
//! 100 MiB it is shifted to `<file>.1`, older generations shift up, and the
//! fifth is dropped.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LogLevel;

const MAX_LOG_SIZE: u64 = 100 * 1024 * 1024;
const KEEP_GENERATIONS: usize = 5;

struct Time;

impl FormatTime for Time {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_str(&Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
    }
}

struct Inner {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    keep: usize,
}

impl Inner {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let generation = |n: usize| {
            let mut os = self.path.as_os_str().to_owned();
            os.push(format!(".{n}"));
            PathBuf::from(os)
        };

        let _ = fs::remove_file(generation(self.keep));
        for n in (1..self.keep).rev() {
            let _ = fs::rename(generation(n), generation(n + 1));
        }
        fs::rename(&self.path, generation(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

/// Append-only log sink with size-based rotation. Writes are serialized;
/// clones share the same file.
#[derive(Clone)]
pub struct RotatingWriter(Arc<Mutex<Inner>>);

impl RotatingWriter {
    /// # Errors
    ///
    /// Fails when the parent directory cannot be created or the file cannot
    /// be opened for append.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::with_limits(path, MAX_LOG_SIZE, KEEP_GENERATIONS)
    }

    /// # Errors
    ///
    /// See [`RotatingWriter::open`].
    pub fn with_limits(path: &Path, max_size: u64, keep: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();

        Ok(Self(Arc::new(Mutex::new(Inner {
            path: path.to_path_buf(),
            file,
            written,
            max_size,
            keep,
        }))))
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.0.lock();
        if inner.written + buf.len() as u64 > inner.max_size {
            inner.rotate()?;
        }
        let n = inner.file.write(buf)?;
        inner.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().file.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

const fn filter_for(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

/// Installs the global subscriber. Call once, during the `Logging` phase.
///
/// # Errors
///
/// Fails when the log file cannot be opened.
pub fn init(level: LogLevel, log_file: &Path) -> io::Result<()> {
    let filter = filter_for(level);
    let file_writer = RotatingWriter::open(log_file)?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_ansi(true)
                .with_timer(Time)
                .with_writer(io::stderr)
                .with_filter(filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_timer(Time)
                .with_writer(file_writer)
                .with_filter(filter),
        )
        .init();

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::RotatingWriter;

    #[test]
    fn rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut writer = RotatingWriter::with_limits(&path, 64, 2).unwrap();
        for _ in 0..10 {
            writer.write_all(&[b'x'; 32]).unwrap();
        }
        writer.flush().unwrap();

        assert!(path.exists());
        assert!(dir.path().join("test.log.1").exists());
        assert!(dir.path().join("test.log.2").exists());
        assert!(!dir.path().join("test.log.3").exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 64);
    }

    #[test]
    fn resumes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.log");

        std::fs::write(&path, b"existing").unwrap();
        let mut writer = RotatingWriter::with_limits(&path, 1024, 2).unwrap();
        writer.write_all(b" more").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"existing more");
    }
}
