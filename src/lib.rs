//! Transactional email submission and delivery.
//!
//! Applications hand a message to a [`delivery`] facade. The message is
//! released to an SMTP relay only if the surrounding transaction commits:
//! *direct* delivery sends synchronously during commit, *queued* delivery
//! spools the message to a durable [`spool::Maildir`] at commit and lets the
//! [`queue`] processor drive retries asynchronously.
//!
//! ## Modules
//!
//! - [`address`] — validated email addresses and envelopes.
//! - [`message`] — the raw RFC 5322 byte sequence, `Message-Id` handling.
//! - [`transaction`] — the two-phase-commit participant that ties message
//!   dispatch to the surrounding transaction's fate.
//! - [`spool`] — the Maildir-based crash-safe on-disk queue.
//! - [`transport::smtp`] — the SMTP wire protocol and the transactional
//!   mailer (`vote`/`send`/`abort`).
//! - [`delivery`] — the public entry point applications call.
//! - [`queue`] — the long-lived worker that drains the spool.
//! - [`config`] — CLI and INI configuration loading for the queue processor
//!   binary.

pub mod address;
pub mod config;
pub mod delivery;
mod error;
pub mod message;
pub mod queue;
pub mod spool;
pub mod transaction;
pub mod transport;

pub use self::address::{Address, AddressError, Envelope};
pub use self::error::Error;
pub use self::message::Message;
