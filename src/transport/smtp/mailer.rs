//! The transactional mailer: `vote`/`send`/`abort`, the shape a
//! [`crate::transaction::MailDataManager`] drives an SMTP connection
//! through.
//!
//! An [`SmtpMailer`] pre-flights a connection at `vote` time and reuses it
//! for the `send` that follows, so a failed `EHLO`/`HELO` aborts the
//! transaction before anything has been handed to the spool or the
//! application. Each worker owns its own mailer; nothing here is shared
//! across threads.

use std::time::Duration;

use super::{error, ClientId, Credentials, Error, Mechanism, SmtpConnection, TlsParameters};
use crate::address::{Address, Envelope};

/// How an [`SmtpMailer`] negotiates transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Upgrade with `STARTTLS` if the server advertises it; otherwise send
    /// in the clear. The default.
    Opportunistic,
    /// Never upgrade, even if `STARTTLS` is advertised.
    Never,
    /// Require `STARTTLS`; fail if the server doesn't advertise it.
    Required,
    /// Connect already encrypted (SMTPS), from the first byte. Never
    /// attempts `STARTTLS`.
    Implicit,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy::Opportunistic
    }
}

/// Configuration for an [`SmtpMailer`].
#[derive(Debug, Clone)]
pub struct SmtpMailerConfig {
    pub hostname: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub authentication: Vec<Mechanism>,
    pub tls: TlsPolicy,
    pub timeout: Option<Duration>,
    pub hello_name: ClientId,
}

impl Default for SmtpMailerConfig {
    fn default() -> Self {
        SmtpMailerConfig {
            hostname: "localhost".into(),
            port: super::SMTP_PORT,
            credentials: None,
            authentication: vec![
                Mechanism::Xoauth2,
                Mechanism::CramMd5,
                Mechanism::Plain,
                Mechanism::Login,
            ],
            tls: TlsPolicy::Opportunistic,
            timeout: Some(Duration::from_secs(60)),
            hello_name: ClientId::default(),
        }
    }
}

/// A transactional SMTP mailer: `vote` pre-flights a connection, `send`
/// transmits one message over it and always tears it down, `abort` tears
/// down a connection that was never used.
///
/// One instance is owned per worker (direct-delivery call or queue
/// processor thread); nothing here is `Send`/`Sync` by design.
pub struct SmtpMailer {
    config: SmtpMailerConfig,
    connection: Option<SmtpConnection>,
}

impl SmtpMailer {
    pub fn new(config: SmtpMailerConfig) -> Self {
        SmtpMailer {
            config,
            connection: None,
        }
    }

    fn tls_parameters(&self) -> Result<TlsParameters, Error> {
        TlsParameters::new(self.config.hostname.clone())
    }

    /// Opens a connection and performs the greeting (`EHLO`, falling back to
    /// `HELO`). Any non-2xx reply here is a configuration/connection error
    /// and propagates. On success the connection is held for the `send`
    /// that follows.
    pub fn vote(&mut self) -> Result<(), Error> {
        let implicit = match self.config.tls {
            TlsPolicy::Implicit => Some(self.tls_parameters()?),
            _ => None,
        };

        let connection = SmtpConnection::connect(
            (self.config.hostname.as_str(), self.config.port),
            self.config.timeout,
            &self.config.hello_name,
            implicit.as_ref(),
            None,
        )?;

        self.connection = Some(connection);
        Ok(())
    }

    /// Ensures a connection (calling [`vote`][Self::vote] if none is held),
    /// negotiates TLS per policy, authenticates if credentials and ESMTP
    /// permit, then transmits the envelope and message. The connection is
    /// always closed before returning, on every exit path.
    pub fn send(&mut self, envelope: &Envelope, message: &[u8]) -> Result<(), Error> {
        if self.connection.is_none() {
            self.vote()?;
        }

        let result = self.send_over_open_connection(envelope, message);
        self.close();
        result
    }

    fn send_over_open_connection(
        &mut self,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<(), Error> {
        let can_starttls = self
            .connection
            .as_ref()
            .expect("connection ensured by send()")
            .can_starttls();

        match self.config.tls {
            TlsPolicy::Implicit | TlsPolicy::Never => { /* never upgrade */ }
            TlsPolicy::Required => {
                if !can_starttls {
                    return Err(error::client(
                        "STARTTLS is required but the server does not advertise it",
                    ));
                }
                self.starttls()?;
            }
            TlsPolicy::Opportunistic => {
                if can_starttls {
                    self.starttls()?;
                }
            }
        }

        let conn = self.connection.as_mut().expect("connection ensured by send()");
        let does_esmtp = conn.does_esmtp();

        if let Some(credentials) = &self.config.credentials {
            if !does_esmtp {
                return Err(error::client(
                    "a username is configured but the server does not speak ESMTP",
                ));
            }
            conn.auth(&self.config.authentication, credentials)?;
        }

        conn.send(envelope, message)?;
        Ok(())
    }

    fn starttls(&mut self) -> Result<(), Error> {
        let tls_parameters = self.tls_parameters()?;
        let connection = self.connection.take().expect("connection ensured by send()");
        let connection = connection.starttls(&tls_parameters, &self.config.hello_name)?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Closes a pending connection, if one exists. A quit that fails (e.g.
    /// a broken TLS session) degrades to a hard close rather than
    /// propagating: the connection is going away either way.
    fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if connection.quit().is_err() {
                connection.abort();
            }
        }
    }

    /// Closes any pending connection. Called when the owning transaction
    /// aborts after a successful `vote`.
    pub fn abort(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.abort();
        }
    }
}

/// Builds an [`Envelope`] from the sender/recipient strings the delivery
/// facade and queue processor carry around, so callers don't need to parse
/// addresses themselves.
pub fn envelope_from(sender: Option<&str>, recipients: &[String]) -> Result<Envelope, crate::Error> {
    let from = sender.map(|s| s.parse::<Address>()).transpose()?;
    let to = recipients
        .iter()
        .map(|r| r.parse::<Address>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Envelope::new(from, to)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tls_policy_is_opportunistic() {
        assert_eq!(SmtpMailerConfig::default().tls, TlsPolicy::Opportunistic);
    }

    #[test]
    fn envelope_from_builds_addresses() {
        let envelope = envelope_from(
            Some("jim@example.com"),
            &["a@example.com".to_string(), "b@example.com".to_string()],
        )
        .unwrap();
        assert_eq!(envelope.to().len(), 2);
        assert!(envelope.from().is_some());
    }

    #[test]
    fn envelope_from_rejects_empty_recipients() {
        assert!(envelope_from(Some("jim@example.com"), &[]).is_err());
    }
}
