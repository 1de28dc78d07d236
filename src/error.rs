//! Crate-wide error type
//!
//! Each subsystem (spool, transaction manager, delivery facade, queue,
//! configuration) has its own error type; this is the union surfaced to
//! callers at the public edges (the delivery facade's `send`, the queue
//! processor's setup, and the CLI).

use thiserror::Error;

use crate::address::AddressError;

/// Errors that can occur while submitting or delivering a message
#[derive(Debug, Error)]
pub enum Error {
    /// An envelope was built with no recipients
    #[error("envelope has no recipients")]
    MissingTo,

    /// A `Message-Id` header was present but not bracketed in `<...>`
    #[error("Message-Id header must be enclosed in angle brackets")]
    MalformedMessageId,

    /// An address failed to parse or validate
    #[error(transparent)]
    Address(#[from] AddressError),

    /// An SMTP transport error
    #[error(transparent)]
    Smtp(#[from] crate::transport::smtp::Error),

    /// A Maildir spool error
    #[error(transparent)]
    Spool(#[from] crate::spool::Error),

    /// A configuration error (CLI flags, INI file)
    #[error(transparent)]
    Config(#[from] crate::config::Error),

    /// An I/O error not otherwise classified
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
