use std::{
    collections::HashMap,
    fmt::Display,
    io::{self, BufRead, BufReader, Write},
    net::{IpAddr, ToSocketAddrs},
    time::Duration,
};

use super::escape_crlf;
use super::{ClientCodec, ConnectionState, NetworkStream, TlsParameters};
use crate::{
    address::{Address, Envelope},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        commands::{Auth, Data, Ehlo, Helo, Mail, Noop, Quit, Rcpt, Starttls},
        error,
        error::Error,
        extension::{ClientId, Extension, MailBodyParameter, MailParameter, ServerInfo},
        response::{parse_response, Code, Response},
    },
};

/// Structure that implements the SMTP client
pub struct SmtpConnection {
    /// TCP stream between client and server
    stream: BufReader<NetworkStream>,
    /// Information about the server
    server_info: ServerInfo,
    /// Whether the greeting was answered with EHLO (vs. a HELO fallback)
    esmtp: bool,
}

impl SmtpConnection {
    /// Get information about the server
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Connects to the configured server.
    ///
    /// Sends `EHLO` and parses server information; falls back to `HELO`
    /// when the server doesn't understand the extended greeting.
    pub fn connect<A: ToSocketAddrs>(
        server: A,
        timeout: Option<Duration>,
        hello_name: &ClientId,
        tls_parameters: Option<&TlsParameters>,
        local_address: Option<IpAddr>,
    ) -> Result<SmtpConnection, Error> {
        let stream = NetworkStream::connect(server, timeout, tls_parameters, local_address)?;
        let stream = BufReader::new(stream);
        let mut conn = SmtpConnection {
            stream,
            server_info: ServerInfo::default(),
            esmtp: false,
        };
        conn.set_timeout(timeout).map_err(error::network)?;
        let _banner = conn.read_response()?;

        conn.hello(hello_name)?;

        tracing::debug!("server {}", conn.server_info);
        Ok(conn)
    }

    /// Sends `MAIL FROM`, `RCPT TO` for every recipient, and `DATA`,
    /// returning once the message content has been acknowledged.
    ///
    /// Recipients that are individually refused do not necessarily fail the
    /// whole transaction: if at least one recipient is accepted the message
    /// is still transmitted to them, and the refusal is reported as an
    /// error built from the most frequent refusal code observed.
    pub fn send(&mut self, envelope: &Envelope, email: &[u8]) -> Result<Response, Error> {
        let mut mail_options = vec![];

        // Internationalization handling, RFC 6152 / RFC 6531
        if envelope.has_non_ascii_addresses() {
            if !self.server_info().supports_feature(Extension::SmtpUtfEight) {
                return Err(error::client(
                    "Envelope contains non-ascii chars but server does not support SMTPUTF8",
                ));
            }
            mail_options.push(MailParameter::SmtpUtfEight);
        }

        if !email.is_ascii() {
            if !self.server_info().supports_feature(Extension::EightBitMime) {
                return Err(error::client(
                    "Message contains non-ascii chars but server does not support 8BITMIME",
                ));
            }
            mail_options.push(MailParameter::Body(MailBodyParameter::EightBitMime));
        }

        self.command(Mail::new(envelope.from().cloned(), mail_options))?;

        let mut refused = Vec::new();
        let mut accepted = 0usize;
        for to_address in envelope.to() {
            match self.command(Rcpt::new(to_address.clone(), vec![])) {
                Ok(_) => accepted += 1,
                Err(err) => refused.push((to_address.clone(), err)),
            }
        }

        if accepted == 0 {
            return Err(reduce_recipient_errors(refused, 0));
        }

        self.command(Data)?;
        let response = self.message(email)?;

        if !refused.is_empty() {
            tracing::debug!(
                "{} of {} recipients refused",
                refused.len(),
                envelope.to().len()
            );
            return Err(reduce_recipient_errors(refused, accepted));
        }

        Ok(response)
    }

    pub fn has_broken(&self) -> bool {
        match self.stream.get_ref().state() {
            ConnectionState::Ok => false,
            ConnectionState::Broken | ConnectionState::Closed => true,
        }
    }

    pub fn can_starttls(&self) -> bool {
        !self.is_encrypted() && self.server_info.supports_feature(Extension::StartTls)
    }

    pub fn starttls(
        mut self,
        tls_parameters: &TlsParameters,
        hello_name: &ClientId,
    ) -> Result<Self, Error> {
        if self.server_info.supports_feature(Extension::StartTls) {
            self.command(Starttls)?;
            let mut stream = self.stream.into_inner();
            stream.upgrade_tls(tls_parameters)?;
            self.stream = BufReader::new(stream);
            tracing::debug!("connection encrypted");
            // Send EHLO again; the server may advertise different extensions over TLS
            self.hello(hello_name)?;
            Ok(self)
        } else {
            Err(error::client("STARTTLS is not supported on this server"))
        }
    }

    /// Sends EHLO, falling back to HELO if the server rejects the extended
    /// greeting, and updates server info
    fn hello(&mut self, hello_name: &ClientId) -> Result<(), Error> {
        match self.command(Ehlo::new(hello_name.clone())) {
            Ok(response) => {
                self.server_info = ServerInfo::from_response(&response)?;
                self.esmtp = true;
            }
            Err(_) => {
                tracing::debug!("EHLO rejected, falling back to HELO");
                let response = self.command(Helo::new(hello_name.clone()))?;
                self.server_info = ServerInfo::from_response(&response)?;
                self.esmtp = false;
            }
        }
        Ok(())
    }

    /// Whether the server answered the extended greeting (`EHLO`) rather
    /// than falling back to plain `HELO`.
    pub fn does_esmtp(&self) -> bool {
        self.esmtp
    }

    pub fn quit(&mut self) -> Result<Response, Error> {
        self.command(Quit)
    }

    pub fn abort(&mut self) {
        match self.stream.get_ref().state() {
            ConnectionState::Ok | ConnectionState::Broken => {
                let _ = self.command(Quit);
                let _ = self.stream.get_mut().shutdown(std::net::Shutdown::Both);
                self.stream.get_mut().set_state(ConnectionState::Closed);
            }
            ConnectionState::Closed => {}
        }
    }

    /// Sets the underlying stream
    pub fn set_stream(&mut self, stream: NetworkStream) {
        self.stream = BufReader::new(stream);
    }

    /// Tells if the underlying stream is currently encrypted
    pub fn is_encrypted(&self) -> bool {
        self.stream.get_ref().is_encrypted()
    }

    /// Set timeout
    pub fn set_timeout(&mut self, duration: Option<Duration>) -> io::Result<()> {
        self.stream.get_mut().set_read_timeout(duration)?;
        self.stream.get_mut().set_write_timeout(duration)
    }

    /// Checks if the server is connected using the NOOP SMTP command
    pub fn test_connected(&mut self) -> bool {
        self.command(Noop).is_ok()
    }

    /// Sends an AUTH command with the given mechanism, and handles the challenge if needed
    pub fn auth(
        &mut self,
        mechanisms: &[Mechanism],
        credentials: &Credentials,
    ) -> Result<Response, Error> {
        let mechanism = self
            .server_info
            .get_auth_mechanism(mechanisms)
            .ok_or_else(|| error::client("No compatible authentication mechanism was found"))?;

        // Limit challenges to avoid blocking
        let mut challenges = 10;
        let mut response = self.command(Auth::new(mechanism, credentials.clone(), None)?)?;

        while challenges > 0 && response.has_code(334) {
            challenges -= 1;
            response = self.command(Auth::new_from_response(
                mechanism,
                credentials.clone(),
                &response,
            )?)?;
        }

        if challenges == 0 {
            Err(error::response("Unexpected number of challenges"))
        } else {
            Ok(response)
        }
    }

    /// Sends the message content
    pub fn message(&mut self, message: &[u8]) -> Result<Response, Error> {
        let mut codec = ClientCodec::new();
        let mut out_buf = Vec::with_capacity(message.len());
        codec.encode(message, &mut out_buf);
        self.write(out_buf.as_slice())?;
        self.write(b"\r\n.\r\n")?;

        self.read_response()
    }

    /// Sends an SMTP command
    pub fn command<C: Display>(&mut self, command: C) -> Result<Response, Error> {
        self.write(command.to_string().as_bytes())?;
        self.read_response()
    }

    /// Writes a string to the server
    fn write(&mut self, string: &[u8]) -> Result<(), Error> {
        self.stream.get_ref().state().verify()?;
        self.stream.get_mut().set_state(ConnectionState::Broken);

        self.stream
            .get_mut()
            .write_all(string)
            .map_err(error::network)?;
        self.stream.get_mut().flush().map_err(error::network)?;

        self.stream.get_mut().set_state(ConnectionState::Ok);

        tracing::debug!("Wrote: {}", escape_crlf(&String::from_utf8_lossy(string)));
        Ok(())
    }

    /// Gets the SMTP response
    pub fn read_response(&mut self) -> Result<Response, Error> {
        self.stream.get_ref().state().verify()?;
        self.stream.get_mut().set_state(ConnectionState::Broken);

        let mut buffer = String::with_capacity(100);

        while self.stream.read_line(&mut buffer).map_err(error::network)? > 0 {
            tracing::debug!("<< {}", escape_crlf(&buffer));
            match parse_response(&buffer) {
                Ok((_remaining, response)) => {
                    self.stream.get_mut().set_state(ConnectionState::Ok);

                    return if response.is_positive() {
                        Ok(response)
                    } else {
                        Err(error::code(response))
                    };
                }
                Err(nom::Err::Failure(e)) => {
                    return Err(error::response(e.to_string()));
                }
                Err(nom::Err::Incomplete(_)) => { /* read more */ }
                Err(nom::Err::Error(e)) => {
                    return Err(error::response(e.to_string()));
                }
            }
        }

        Err(error::response("incomplete response"))
    }

    /// The X509 certificate of the server (DER encoded)
    pub fn peer_certificate(&self) -> Result<Vec<u8>, Error> {
        self.stream.get_ref().peer_certificate()
    }
}

/// Collapses several per-recipient refusals into a single error carrying the
/// most frequently observed response code, so a batch of RCPT failures
/// doesn't need to be threaded through as a `Vec`.
fn reduce_recipient_errors(refused: Vec<(Address, Error)>, accepted: usize) -> Error {
    let mut by_code: HashMap<Code, (Response, usize)> = HashMap::new();
    let mut fallback = None;
    let refused_addresses: Vec<String> = refused.iter().map(|(addr, _)| addr.to_string()).collect();

    for (_, err) in refused {
        match err.response() {
            Some(response) => {
                let entry = by_code
                    .entry(response.code())
                    .or_insert_with(|| (response.clone(), 0));
                entry.1 += 1;
            }
            None => {
                fallback.get_or_insert(err);
            }
        };
    }

    match by_code.into_values().max_by_key(|(_, count)| *count) {
        Some((response, _)) => error::recipients_refused(response, accepted, refused_addresses),
        None => fallback.unwrap_or_else(|| error::client("all recipients refused")),
    }
}
