//! Error and result types for the SMTP transport

use std::{error::Error as StdError, fmt, io};

use super::response::{Response, Severity};

/// Errors returned by the SMTP transport
#[derive(Debug)]
pub struct Error(Box<ErrorKind>);

#[derive(Debug)]
enum ErrorKind {
    /// Transient failure, 4xx reply code
    ///
    /// The server asks the client to retry later; per
    /// [RFC 5321, section 4.2.1](https://tools.ietf.org/html/rfc5321#section-4.2.1)
    /// this must not be treated as a permanent failure.
    Transient(Response),
    /// Permanent failure, 5xx reply code
    Permanent(Response),
    /// One or more recipients were rejected; carries the code judged most
    /// representative of the batch, how many recipients *were* accepted
    /// (0 means every recipient was refused and the message was never
    /// transmitted), and the addresses that were refused.
    RecipientsRefused {
        response: Response,
        accepted: usize,
        refused: Vec<String>,
    },
    /// Could not parse a response from the server
    ResponseParsing(String),
    /// A network-level error (DNS, TCP, TLS handshake, I/O)
    Network(Box<dyn StdError + Send + Sync>),
    /// TLS configuration or handshake error
    Tls(Box<dyn StdError + Send + Sync>),
    /// Programmer/client-side error: unsupported feature, bad input, protocol
    /// violation that isn't a server response
    Client(String),
}

impl Error {
    /// Severity-based classification used to decide whether the caller
    /// should retry a queued delivery. A recipients-refusal carries the
    /// most-frequent refusal code observed, so it is transient exactly
    /// when that code is (e.g. "452 too many recipients", or greylisting).
    pub fn is_transient(&self) -> bool {
        match &*self.0 {
            ErrorKind::Transient(_) | ErrorKind::Network(_) | ErrorKind::Tls(_) => true,
            ErrorKind::RecipientsRefused { response, .. } => {
                response.code().severity == Severity::TransientNegativeCompletion
            }
            _ => false,
        }
    }

    /// True if the server has permanently rejected the transaction
    /// (a "permanent failure" in the sense of RFC 5321 4.2.1): retrying
    /// without changing the message or recipients is pointless.
    pub fn is_permanent(&self) -> bool {
        match &*self.0 {
            ErrorKind::Permanent(_) => true,
            ErrorKind::RecipientsRefused { response, .. } => {
                response.code().severity == Severity::PermanentNegativeCompletion
            }
            _ => false,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match &*self.0 {
            ErrorKind::Transient(r) | ErrorKind::Permanent(r) => Some(r),
            ErrorKind::RecipientsRefused { response, .. } => Some(response),
            _ => None,
        }
    }

    /// `Some(n)` if this error is a recipient refusal and `n` recipients
    /// were nonetheless accepted and sent the message (a *partial*
    /// refusal, which the queue processor treats as an overall success);
    /// `Some(0)` means every recipient was refused; `None` means this
    /// isn't a recipient refusal at all.
    pub fn partial_recipients_accepted(&self) -> Option<usize> {
        match &*self.0 {
            ErrorKind::RecipientsRefused { accepted, .. } => Some(*accepted),
            _ => None,
        }
    }

    /// The addresses that were refused, if this is a recipients-refusal
    /// error; empty otherwise.
    pub fn refused_recipients(&self) -> &[String] {
        match &*self.0 {
            ErrorKind::RecipientsRefused { refused, .. } => refused,
            _ => &[],
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorKind::Transient(r) => write!(f, "transient SMTP error: {r:?}"),
            ErrorKind::Permanent(r) => write!(f, "permanent SMTP error: {r:?}"),
            ErrorKind::RecipientsRefused {
                response,
                accepted,
                refused,
            } => {
                write!(
                    f,
                    "{accepted} recipient(s) accepted, refused [{}]: {response:?}",
                    refused.join(", ")
                )
            }
            ErrorKind::ResponseParsing(s) => write!(f, "could not parse SMTP response: {s}"),
            ErrorKind::Network(e) => write!(f, "network error: {e}"),
            ErrorKind::Tls(e) => write!(f, "TLS error: {e}"),
            ErrorKind::Client(s) => write!(f, "{s}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &*self.0 {
            ErrorKind::Network(e) | ErrorKind::Tls(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Builds an [`Error`] from a completed (non-positive) response, classifying
/// it by severity.
pub fn code(response: Response) -> Error {
    let kind = match response.code().severity {
        Severity::TransientNegativeCompletion => ErrorKind::Transient(response),
        Severity::PermanentNegativeCompletion => ErrorKind::Permanent(response),
        _ => ErrorKind::Client(format!("unexpected response severity: {response:?}")),
    };
    Error(Box::new(kind))
}

/// Used by the envelope-recipient reduction step: several RCPT TO commands
/// returned different codes, and `response` is the most-frequent one.
/// `accepted` is how many recipients were not refused; `refused` is the
/// full list of addresses that were (regardless of which code each one
/// individually got).
pub fn recipients_refused(response: Response, accepted: usize, refused: Vec<String>) -> Error {
    Error(Box::new(ErrorKind::RecipientsRefused {
        response,
        accepted,
        refused,
    }))
}

pub fn response<E: Into<String>>(message: E) -> Error {
    Error(Box::new(ErrorKind::ResponseParsing(message.into())))
}

pub fn network<E: Into<Box<dyn StdError + Send + Sync>>>(err: E) -> Error {
    Error(Box::new(ErrorKind::Network(err.into())))
}

pub fn tls<E: Into<Box<dyn StdError + Send + Sync>>>(err: E) -> Error {
    Error(Box::new(ErrorKind::Tls(err.into())))
}

pub fn client<S: Into<String>>(message: S) -> Error {
    Error(Box::new(ErrorKind::Client(message.into())))
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        network(err)
    }
}

/// SMTP result type
pub type SmtpResult = Result<Response, Error>;
