//! Authentication mechanisms and credentials

use std::fmt::{self, Display, Formatter};

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;

use super::error::{self, Error};

/// A username/password pair used to authenticate against an SMTP server
#[derive(PartialEq, Eq, Clone)]
pub struct Credentials {
    authentication_identity: String,
    secret: String,
}

impl Credentials {
    /// Creates a new credentials structure
    pub fn new(authentication_identity: String, secret: String) -> Credentials {
        Credentials {
            authentication_identity,
            secret,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("authentication_identity", &self.authentication_identity)
            .field("secret", &"***")
            .finish()
    }
}

/// Accepted authentication mechanisms, ordered so the most secure one a
/// server advertises is tried first when more than one is configured
#[derive(PartialEq, Eq, Copy, Clone, Hash, Debug)]
#[non_exhaustive]
pub enum Mechanism {
    /// PLAIN authentication mechanism
    ///
    /// RFC 4616: <https://tools.ietf.org/html/rfc4616>
    Plain,
    /// LOGIN authentication mechanism
    ///
    /// Obsolete but still used by some servers
    Login,
    /// CRAM-MD5 authentication mechanism
    ///
    /// RFC 2195: <https://tools.ietf.org/html/rfc2195>
    CramMd5,
    /// XOAUTH2 authentication mechanism
    Xoauth2,
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::CramMd5 => "CRAM-MD5",
            Mechanism::Xoauth2 => "XOAUTH2",
        })
    }
}

impl Mechanism {
    /// Does the mechanism support sending data alongside the initial `AUTH` command
    pub fn supports_initial_response(self) -> bool {
        matches!(self, Mechanism::Plain | Mechanism::Xoauth2)
    }

    /// Returns the string to send to the server, using the provided
    /// credentials and challenge (for challenge-response mechanisms)
    pub fn response(
        self,
        credentials: &Credentials,
        challenge: Option<&str>,
    ) -> Result<String, Error> {
        match self {
            Mechanism::Plain => match challenge {
                Some(_) => Err(error::client("This mechanism does not expect a challenge")),
                None => Ok(format!(
                    "\u{0}{}\u{0}{}",
                    credentials.authentication_identity, credentials.secret
                )),
            },
            Mechanism::Login => match challenge {
                Some(challenge) if challenge == "Username:" => {
                    Ok(credentials.authentication_identity.clone())
                }
                Some(challenge) if challenge == "Password:" => Ok(credentials.secret.clone()),
                Some(_) => Err(error::client("Unrecognized LOGIN challenge")),
                None => Err(error::client("This mechanism does expect a challenge")),
            },
            Mechanism::CramMd5 => {
                let challenge = challenge
                    .ok_or_else(|| error::client("This mechanism does expect a challenge"))?;

                let mut mac = Hmac::<Md5>::new_from_slice(credentials.secret.as_bytes())
                    .expect("HMAC can take a key of any size");
                mac.update(challenge.as_bytes());
                let code = mac.finalize().into_bytes();

                Ok(format!(
                    "{} {}",
                    credentials.authentication_identity,
                    hex_encode(&code)
                ))
            }
            Mechanism::Xoauth2 => match challenge {
                Some(_) => Err(error::client("This mechanism does not expect a challenge")),
                None => Ok(format!(
                    "user={}\u{1}auth=Bearer {}\u{1}\u{1}",
                    credentials.authentication_identity, credentials.secret
                )),
            },
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub(super) fn encode(raw: &str) -> String {
    STANDARD.encode(raw.as_bytes())
}

pub(super) fn decode(encoded: &str) -> Result<String, Error> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| error::response(format!("invalid base64 in server challenge: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| error::response(format!("server challenge is not valid UTF-8: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plain() {
        let credentials = Credentials::new("username".to_string(), "password".to_string());

        assert_eq!(
            Mechanism::Plain.response(&credentials, None).unwrap(),
            "\u{0}username\u{0}password"
        );
        assert!(Mechanism::Plain
            .response(&credentials, Some("test"))
            .is_err());
    }

    #[test]
    fn test_cram_md5() {
        let credentials = Credentials::new("alice".to_string(), "wonderland".to_string());

        assert_eq!(
            Mechanism::CramMd5
                .response(
                    &credentials,
                    Some("<17893.1320679123@tesseract.susam.in>")
                )
                .unwrap(),
            "alice 64b2a43c1f6ed6806a980914e23e75f0"
        );
        assert!(Mechanism::CramMd5
            .response(&credentials, None)
            .is_err());
    }
}
