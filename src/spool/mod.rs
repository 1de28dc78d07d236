//! Maildir-based durable message spool.
//!
//! Implements the qmail Maildir convention (`tmp`/`new`/`cur`) with an
//! atomic writer: messages are written into `tmp/`, then committed with a
//! single `rename` into `new/`. The queue processor (see [`crate::queue`])
//! claims ownership of a file with a hard-link lock before transmitting it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Errors raised by the spool.
#[derive(Debug, Error)]
pub enum Error {
    /// `path` is not a directory containing `tmp`/`new`/`cur`, and `create`
    /// was not requested (or failed).
    #[error("{0} is not a Maildir folder")]
    NotAMaildir(PathBuf),

    /// Could not mint a unique key after 1000 attempts.
    #[error("failed to create a unique file name in {0}, are we under a DoS attack?")]
    ResourceExhausted(PathBuf),

    /// `commit()` was called on a writer that had already been aborted.
    #[error("cannot commit, message already aborted")]
    WriterMisuse,

    /// An I/O error not otherwise classified.
    #[error(transparent)]
    Io(#[from] io::Error),
}

const MAX_KEY_ATTEMPTS: u32 = 1000;

/// A Maildir folder: `tmp/`, `new/`, and `cur/` siblings under `path`.
#[derive(Debug, Clone)]
pub struct Maildir {
    path: PathBuf,
}

impl Maildir {
    /// Opens a Maildir at `path`. If `create` is true and `path` does not
    /// already exist, the folder and its three subdirectories are created.
    /// Otherwise, `path` must already contain `tmp`, `new`, and `cur` or
    /// this fails with [`Error::NotAMaildir`].
    pub fn open(path: impl Into<PathBuf>, create: bool) -> Result<Maildir, Error> {
        let path = path.into();

        let is_maildir = |p: &Path| {
            p.join("tmp").is_dir() && p.join("new").is_dir() && p.join("cur").is_dir()
        };

        if create && !path.exists() {
            fs::create_dir_all(path.join("tmp"))?;
            fs::create_dir_all(path.join("new"))?;
            fs::create_dir_all(path.join("cur"))?;
        } else if !is_maildir(&path) {
            return Err(Error::NotAMaildir(path));
        }

        Ok(Maildir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn subdir(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Lists every message under `new/` and `cur/`, skipping any entry whose
    /// base name starts with `.` (lock links, rejection snapshots, and any
    /// other reserved file). Order is unspecified but stable within one
    /// call.
    pub fn iterate(&self) -> Result<Vec<PathBuf>, Error> {
        let mut messages = Vec::new();
        for sub in ["new", "cur"] {
            let dir = self.subdir(sub);
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                messages.push(entry.path());
            }
        }
        Ok(messages)
    }

    /// Mints a fresh unique key and returns a writer for it, with its tmp
    /// file already open.
    pub fn new_message(&self) -> Result<MessageWriter, Error> {
        let tmp_dir = self.subdir("tmp");
        let new_dir = self.subdir("new");
        let pid = std::process::id();
        let host = hostname();

        for attempt in 0..MAX_KEY_ATTEMPTS {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let key = format!("{timestamp}.{pid}.{host}");
            let tmp_path = tmp_dir.join(&key);
            if tmp_path.exists() {
                if attempt + 1 >= MAX_KEY_ATTEMPTS {
                    break;
                }
                // Subsecond clock granularity: sleeping forces the next
                // attempt's timestamp to differ.
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            let new_path = new_dir.join(&key);
            return Ok(MessageWriter::new(tmp_path, new_path, file));
        }
        Err(Error::ResourceExhausted(tmp_dir))
    }
}

pub(crate) fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// A writer bound to one freshly-minted spool key.
///
/// Exactly one of [`commit`][MessageWriter::commit] or
/// [`abort`][MessageWriter::abort] has observable effect; later calls to
/// either are no-ops, except that `commit()` after `abort()` fails with
/// [`Error::WriterMisuse`].
pub struct MessageWriter {
    tmp_path: PathBuf,
    new_path: PathBuf,
    file: Option<File>,
    closed: bool,
    aborted: bool,
}

impl MessageWriter {
    fn new(tmp_path: PathBuf, new_path: PathBuf, file: File) -> Self {
        MessageWriter {
            tmp_path,
            new_path,
            file: Some(file),
            closed: false,
            aborted: false,
        }
    }

    /// Buffers bytes into the tmp file. May be called repeatedly before
    /// `commit`/`abort`.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file
            .as_mut()
            .expect("write after commit/abort")
            .write_all(data)
    }

    /// Buffers an iterator of byte slices into the tmp file.
    pub fn writelines<I, B>(&mut self, lines: I) -> io::Result<()>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        for line in lines {
            self.write(line.as_ref())?;
        }
        Ok(())
    }

    /// Flushes, closes, and atomically renames `tmp/<key>` to `new/<key>`.
    /// Idempotent: a second call is a no-op.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.closed && self.aborted {
            return Err(Error::WriterMisuse);
        }
        if !self.closed {
            self.closed = true;
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            fs::rename(&self.tmp_path, &self.new_path)?;
        }
        Ok(())
    }

    /// Closes and unlinks the tmp file. Idempotent: a no-op after `commit`.
    pub fn abort(&mut self) -> Result<(), Error> {
        if !self.closed {
            self.closed = true;
            self.aborted = true;
            self.file.take();
            match fs::remove_file(&self.tmp_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.abort();
        }
    }
}
