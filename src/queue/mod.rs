//! The queue processor: a long-lived loop that drains a [`crate::spool::Maildir`],
//! delivering each message over SMTP and retrying transient failures.
//!
//! The hard part is the per-message lock-link dance (§ below): messages are
//! claimed with a hard link so that several processor instances can share
//! one spool directory safely, with no in-memory locking required.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::spool::Maildir;
use crate::transport::smtp::{envelope_from, SmtpMailer};

/// How long a `.sending-` lock link may exist before it is assumed to
/// belong to a worker that died mid-send and is reclaimed.
const DEFAULT_MAX_SEND_TIME: Duration = Duration::from_secs(3 * 60 * 60);

/// Configuration for a [`QueueProcessor`].
#[derive(Debug, Clone)]
pub struct QueueProcessorConfig {
    /// How long to sleep between ticks once the spool has been drained.
    pub interval: Duration,
    /// How long to sleep, in `interval`-sized slices, after a transient
    /// failure before retrying.
    pub retry_interval: Duration,
    /// Age past which a `.sending-` lock is considered abandoned.
    pub max_send_time: Duration,
    /// Sweep stale `.sending-` links before the first tick, compensating
    /// for an unclean shutdown.
    pub clean_lock_links_on_start: bool,
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        QueueProcessorConfig {
            interval: Duration::from_secs(3),
            retry_interval: Duration::from_secs(3),
            max_send_time: DEFAULT_MAX_SEND_TIME,
            clean_lock_links_on_start: false,
        }
    }
}

/// A cheaply cloneable flag used to ask a running [`QueueProcessor`] to
/// stop. Checked at the top of every tick and inside every retry-sleep
/// slice, bounding shutdown latency to one `interval`.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    /// Requests that the processor stop at its next opportunity.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of attempting to deliver one spool file, reported for testing
/// and to drive the scan loop's retry-and-break behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Sent (possibly with some recipients refused, logged separately).
    Delivered,
    /// Another worker holds the lock, or the file vanished; left as-is.
    Skipped,
    /// Quarantined to `.rejected-<base>`.
    Permanent,
    /// Lock released, left in place for the next tick.
    Transient,
}

/// Drains one [`Maildir`] over SMTP. Owns its [`SmtpMailer`]; nothing here
/// is shared across processor instances, so one instance per worker
/// thread/process.
pub struct QueueProcessor {
    maildir: Maildir,
    mailer: SmtpMailer,
    config: QueueProcessorConfig,
    stop: StopFlag,
}

impl QueueProcessor {
    pub fn new(maildir: Maildir, mailer: SmtpMailer, config: QueueProcessorConfig) -> Self {
        QueueProcessor {
            maildir,
            mailer,
            config,
            stop: StopFlag::new(),
        }
    }

    /// A cloneable handle the host application can use to request shutdown
    /// (e.g. from a signal handler) independently of the thread running
    /// [`run`][Self::run].
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Runs the processor loop until stopped: list the spool, attempt
    /// delivery of each file, sleep, repeat.
    pub fn run(&mut self) {
        if self.config.clean_lock_links_on_start {
            self.clean_lock_links();
        }

        loop {
            if self.stop.is_stopped() {
                return;
            }
            self.tick();
            if self.stop.is_stopped() {
                return;
            }
            self.sleep_stoppable(self.config.interval);
        }
    }

    /// Sweeps every `.sending-*` link out of `new/` and `cur/`.
    pub fn clean_lock_links(&self) {
        for sub in ["new", "cur"] {
            let dir = self.maildir.path().join(sub);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "failed to sweep lock links");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(".sending-") {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    /// One pass over the spool. Returns early (after sleeping
    /// `retry_interval`) on the first transient failure, so the message is
    /// retried fresh next tick rather than racing ahead through the rest of
    /// the list.
    pub fn tick(&mut self) {
        let files = match self.maildir.iterate() {
            Ok(files) => files,
            Err(err) => {
                tracing::error!(error = %err, "failed to list spool");
                return;
            }
        };

        for file in files {
            if self.stop.is_stopped() {
                return;
            }

            let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.deliver_one(&file)
            })) {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(file = %file.display(), "unexpected panic while processing message, skipping");
                    continue;
                }
            };

            if outcome == Outcome::Transient {
                self.sleep_stoppable(self.config.retry_interval);
                break;
            }
        }
    }

    fn sleep_stoppable(&self, total: Duration) {
        let slice = if self.config.interval.is_zero() {
            total
        } else {
            self.config.interval.min(total).max(Duration::from_millis(1))
        };
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.stop.is_stopped() {
                return;
            }
            let nap = slice.min(remaining);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }

    /// The per-message delivery protocol: stat/reclaim/claim the lock
    /// link, parse the message, attempt the send, and resolve the file
    /// according to the outcome.
    fn deliver_one(&mut self, file: &Path) -> Outcome {
        let Some(dir) = file.parent() else {
            return Outcome::Skipped;
        };
        let Some(base) = file.file_name() else {
            return Outcome::Skipped;
        };
        let lock = dir.join(format!(".sending-{}", base.to_string_lossy()));

        match fs::symlink_metadata(&lock) {
            Ok(meta) => {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or(Duration::ZERO);
                if age <= self.config.max_send_time {
                    // Another worker is sending.
                    return Outcome::Skipped;
                }
                if let Err(err) = fs::remove_file(&lock) {
                    if err.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(lock = %lock.display(), error = %err, "failed to reclaim stale lock");
                        return Outcome::Skipped;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(lock = %lock.display(), error = %err, "failed to stat lock");
                return Outcome::Skipped;
            }
        }

        if let Err(err) = filetime::set_file_mtime(file, filetime::FileTime::now()) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(file = %file.display(), error = %err, "failed to refresh mtime before claiming lock");
            }
            return Outcome::Skipped;
        }

        if let Err(err) = fs::hard_link(file, &lock) {
            if err.kind() != io::ErrorKind::AlreadyExists {
                tracing::warn!(file = %file.display(), error = %err, "failed to create lock link");
            }
            return Outcome::Skipped;
        }

        self.deliver_locked(file, &lock, base)
    }

    fn deliver_locked(&mut self, file: &Path, lock: &Path, base: &OsStr) -> Outcome {
        let raw = match fs::read(file) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(file = %file.display(), error = %err, "failed to read queued message");
                let _ = fs::remove_file(lock);
                return Outcome::Skipped;
            }
        };

        let parsed = match parse_message(&raw) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::error!(file = %file.display(), reason = %reason, "malformed queue file, quarantining");
                self.quarantine(file, lock, base);
                return Outcome::Permanent;
            }
        };

        let recipients_csv = parsed.recipients.join(", ");
        let sender_display = parsed.sender.clone().unwrap_or_default();

        let envelope = match envelope_from(parsed.sender.as_deref(), &parsed.recipients) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(
                    file = %file.display(), error = %err,
                    "invalid envelope in queued message, quarantining"
                );
                self.quarantine(file, lock, base);
                return Outcome::Permanent;
            }
        };

        match self.mailer.send(&envelope, &parsed.body) {
            Ok(()) => {
                tracing::info!("Mail from {} to {} sent.", sender_display, recipients_csv);
                let _ = fs::remove_file(file);
                let _ = fs::remove_file(lock);
                Outcome::Delivered
            }
            Err(err) => {
                if let Some(accepted) = err.partial_recipients_accepted() {
                    let refused_csv = err.refused_recipients().join(", ");
                    if accepted > 0 {
                        tracing::warn!("Email recipients refused: {}", refused_csv);
                        let _ = fs::remove_file(file);
                        let _ = fs::remove_file(lock);
                        return Outcome::Delivered;
                    }
                    // Every recipient was refused: classify the reduced
                    // response code like any other failure rather than
                    // assuming total refusal is always permanent.
                    if err.is_transient() {
                        tracing::error!(
                            error = %err,
                            "Error while sending mail from {} to {}.",
                            sender_display,
                            recipients_csv
                        );
                        let _ = fs::remove_file(lock);
                        return Outcome::Transient;
                    }
                    tracing::error!("Email recipients refused: {}", refused_csv);
                    self.quarantine(file, lock, base);
                    return Outcome::Permanent;
                }

                if err.is_transient() {
                    tracing::error!(
                        error = %err,
                        "Error while sending mail from {} to {}.",
                        sender_display,
                        recipients_csv
                    );
                    let _ = fs::remove_file(lock);
                    return Outcome::Transient;
                }

                tracing::error!(
                    "Discarding email from {} to {} due to a permanent error: {}",
                    sender_display,
                    recipients_csv,
                    err
                );
                self.quarantine(file, lock, base);
                Outcome::Permanent
            }
        }
    }

    fn quarantine(&self, file: &Path, lock: &Path, base: &OsStr) {
        let rejected = file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".rejected-{}", base.to_string_lossy()));
        if let Err(err) = fs::hard_link(file, &rejected) {
            tracing::error!(file = %file.display(), error = %err, "failed to quarantine message");
        }
        let _ = fs::remove_file(file);
        let _ = fs::remove_file(lock);
    }
}

struct ParsedMessage {
    sender: Option<String>,
    recipients: Vec<String>,
    body: Vec<u8>,
}

/// Parses the queued message file format: first line `X-Zope-From: <sender>`,
/// second line `X-Zope-To: <csv-recipients>`, remainder is the wire message
/// exactly as submitted.
fn parse_message(raw: &[u8]) -> Result<ParsedMessage, &'static str> {
    let first_nl = find(raw, b'\n').ok_or("missing X-Zope-From header line")?;
    let (line1, rest) = (&raw[..first_nl], &raw[first_nl + 1..]);

    let second_nl = find(rest, b'\n').ok_or("missing X-Zope-To header line")?;
    let (line2, body) = (&rest[..second_nl], &rest[second_nl + 1..]);

    let sender_field = strip_prefix(line1, b"X-Zope-From:").ok_or("first line is not X-Zope-From")?;
    let to_field = strip_prefix(line2, b"X-Zope-To:").ok_or("second line is not X-Zope-To")?;

    let sender = std::str::from_utf8(sender_field)
        .map_err(|_| "X-Zope-From is not valid UTF-8")?
        .trim();
    let sender = if sender.is_empty() { None } else { Some(sender.to_string()) };

    let recipients = std::str::from_utf8(to_field)
        .map_err(|_| "X-Zope-To is not valid UTF-8")?
        .trim()
        .split(", ")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    Ok(ParsedMessage {
        sender,
        recipients,
        body: body.to_vec(),
    })
}

fn find(haystack: &[u8], byte: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == byte)
}

fn strip_prefix<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= prefix.len() || !line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    Some(line[prefix.len()..].trim_ascii_start_compat())
}

trait TrimAsciiStartCompat {
    fn trim_ascii_start_compat(&self) -> &Self;
}

impl TrimAsciiStartCompat for [u8] {
    fn trim_ascii_start_compat(&self) -> &Self {
        let start = self.iter().position(|&b| !b.is_ascii_whitespace()).unwrap_or(self.len());
        &self[start..]
    }
}
