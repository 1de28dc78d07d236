//! The SMTP transport: connection primitives plus the transactional
//! [`SmtpMailer`] that the delivery facade and queue processor drive.

pub use self::authentication::{Credentials, Mechanism};
pub use self::client::{SmtpConnection, TlsParameters};
pub use self::error::Error;
pub use self::extension::ClientId;
pub use self::mailer::{envelope_from, SmtpMailer, SmtpMailerConfig, TlsPolicy};
pub use self::response::Response;

pub mod authentication;
pub mod client;
mod commands;
pub mod error;
pub mod extension;
pub mod mailer;
pub mod response;
mod util;

// Registered port numbers:
// https://www.iana.org/assignments/service-names-port-numbers/service-names-port-numbers.xhtml

/// Default SMTP port, used for both plaintext and opportunistic/required
/// STARTTLS connections (RFC 5321)
pub const SMTP_PORT: u16 = 25;

/// Mail submission port (RFC 6409), the recommended port for client
/// submission with STARTTLS
pub const SUBMISSION_PORT: u16 = 587;

/// Implicit TLS submission port, "SMTPS" (RFC 8314)
pub const SUBMISSIONS_PORT: u16 = 465;
