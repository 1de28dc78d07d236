//! Transports for sending emails.
//!
//! [`smtp`] is the wire-level connection and the transactional
//! [`smtp::SmtpMailer`] built on top of it: `vote` pre-flights a connection,
//! `send` transmits and always tears the connection down, and `abort` tears
//! down a connection that was never used. Both the direct delivery facade
//! and the queue processor drive a mailer through exactly those three calls.

pub mod smtp;
