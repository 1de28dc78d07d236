//! The public entry point: hand a message to a delivery facade and get back
//! a `Message-Id`, with the actual send deferred to the surrounding
//! transaction's fate.
//!
//! [`DirectDelivery`] dispatches over SMTP synchronously at commit time;
//! [`QueuedDelivery`] spools to a [`crate::spool::Maildir`] and lets
//! [`crate::queue`] drive retries. Both share the same message preparation
//! step (`prepare`) and both join a [`crate::transaction::MailDataManager`]
//! to the calling thread's current transaction.

mod message_id;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use crate::address::Envelope;
use crate::message::Message;
use crate::spool::Maildir;
use crate::transaction::{self, MailDataManager};
use crate::transport::smtp::{envelope_from, SmtpMailer};
use crate::Error;

/// Normalizes `message`, extracts or generates its `Message-Id`, and
/// returns the (possibly rewritten) message together with the bare id.
///
/// A present `Message-Id` must be bracketed (`<...>`); a missing one is
/// synthesized from the current time, pid, and `hostname`, and prepended.
fn prepare(message: impl Into<Message>, hostname: &str) -> Result<(Message, String), Error> {
    let mut message = message.into();
    match message.message_id()? {
        Some(id) => Ok((message, id)),
        None => {
            let id = message_id::generate(hostname);
            message.prepend_message_id(&id);
            Ok((message, id))
        }
    }
}

fn local_hostname() -> String {
    crate::spool::hostname()
}

/// Direct delivery: the message is sent over SMTP synchronously when the
/// surrounding transaction commits.
///
/// The mailer is shared (via `Rc<RefCell<_>>`) between the data manager's
/// `vote`, `finish`, and `abort` callbacks, since all three may run against
/// the same underlying connection over the lifetime of one `send` call.
pub struct DirectDelivery {
    mailer: Rc<RefCell<SmtpMailer>>,
    hostname: String,
}

impl DirectDelivery {
    pub fn new(mailer: SmtpMailer) -> Self {
        DirectDelivery {
            mailer: Rc::new(RefCell::new(mailer)),
            hostname: local_hostname(),
        }
    }

    /// Prepares `message`, joins a data manager to the current transaction,
    /// and returns the message-id. The actual SMTP conversation happens at
    /// `vote`/commit time, not here.
    pub fn send(
        &self,
        sender: Option<&str>,
        recipients: &[String],
        message: impl Into<Message>,
    ) -> Result<String, Error> {
        let (message, id) = prepare(message, &self.hostname)?;
        let envelope = envelope_from(sender, recipients)?;
        let body = message.into_bytes();

        let vote_mailer = self.mailer.clone();
        let action_mailer = self.mailer.clone();
        let abort_mailer = self.mailer.clone();
        let action_envelope = envelope.clone();

        let dm = MailDataManager::new(
            move || {
                action_mailer
                    .borrow_mut()
                    .send(&action_envelope, &body)
                    .map_err(Error::from)
            },
            Some(move || vote_mailer.borrow_mut().vote().map_err(Error::from)),
            Some(move || abort_mailer.borrow_mut().abort()),
        );
        transaction::join(dm);

        Ok(id)
    }
}

/// Queued delivery: the message is written to a Maildir spool eagerly, at
/// submission time, and atomically committed (renamed into `new/`) only
/// when the surrounding transaction commits. A submission that is later
/// aborted never leaves a trace beyond its `tmp/` file, which `abort()`
/// unlinks.
pub struct QueuedDelivery {
    path: PathBuf,
    create: bool,
    hostname: String,
}

impl QueuedDelivery {
    pub fn new(path: impl Into<PathBuf>, create: bool) -> Self {
        QueuedDelivery {
            path: path.into(),
            create,
            hostname: local_hostname(),
        }
    }

    /// Opens the spool, writes the envelope headers and message body into a
    /// fresh tmp file, and joins a data manager whose `finish` commits it
    /// (rename into `new/`) and whose `abort` unlinks it.
    pub fn send(
        &self,
        sender: Option<&str>,
        recipients: &[String],
        message: impl Into<Message>,
    ) -> Result<String, Error> {
        let (message, id) = prepare(message, &self.hostname)?;
        let envelope = envelope_from(sender, recipients)?;

        let maildir = Maildir::open(&self.path, self.create)?;
        let mut writer = maildir.new_message()?;
        writer.write(format!("X-Zope-From: {}\n", sender_display(&envelope)).as_bytes())?;
        writer.write(format!("X-Zope-To: {}\n", recipients.join(", ")).as_bytes())?;
        writer.write(message.as_bytes())?;

        let writer = Rc::new(RefCell::new(writer));
        let action_writer = writer.clone();
        let abort_writer = writer;

        let dm = MailDataManager::new(
            move || action_writer.borrow_mut().commit().map_err(Error::from),
            None::<fn() -> Result<(), Error>>,
            Some(move || {
                let _ = abort_writer.borrow_mut().abort();
            }),
        );
        transaction::join(dm);

        Ok(id)
    }
}

fn sender_display(envelope: &Envelope) -> String {
    envelope
        .from()
        .map(|a| a.to_string())
        .unwrap_or_default()
}
