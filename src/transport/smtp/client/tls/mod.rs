//! TLS configuration
//!
//! Backed by `native-tls`, which picks up the platform certificate store
//! (the system store on Windows, the keychain on macOS, OpenSSL directories
//! on Linux).

use std::fmt::{self, Debug};

use crate::transport::smtp::{error, Error};

/// TLS protocol versions
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub enum TlsVersion {
    /// TLS 1.0 - only for legacy servers that haven't updated past it
    Tlsv10,
    /// TLS 1.1 - only for legacy servers that haven't updated past it
    Tlsv11,
    /// TLS 1.2 - a good default for most SMTP servers
    Tlsv12,
    /// TLS 1.3 - the most secure option, not supported by `native-tls`
    Tlsv13,
}

impl TlsVersion {
    fn into_native_tls(self) -> Result<native_tls::Protocol, Error> {
        match self {
            TlsVersion::Tlsv10 => Ok(native_tls::Protocol::Tlsv10),
            TlsVersion::Tlsv11 => Ok(native_tls::Protocol::Tlsv11),
            TlsVersion::Tlsv12 => Ok(native_tls::Protocol::Tlsv12),
            TlsVersion::Tlsv13 => Err(error::tls("min TLS version Tlsv13 is not supported")),
        }
    }
}

/// Source for the base set of root certificates to trust
#[derive(Clone, Debug, Default)]
pub enum CertificateStore {
    /// Use the platform's default certificate store
    #[default]
    Default,
    /// Don't trust any system certificates; only the ones explicitly added
    /// via [`TlsParametersBuilder::add_root_certificate`]
    None,
}

/// Parameters to use for secure clients
#[derive(Clone)]
pub struct TlsParameters {
    pub(crate) connector: native_tls::TlsConnector,
    /// The domain name which is expected in the TLS certificate from the server
    pub(super) domain: String,
}

/// Builder for [`TlsParameters`]
#[derive(Debug, Clone)]
pub struct TlsParametersBuilder {
    domain: String,
    cert_store: CertificateStore,
    root_certs: Vec<Certificate>,
    identity: Option<Identity>,
    accept_invalid_hostnames: bool,
    accept_invalid_certs: bool,
    min_tls_version: TlsVersion,
}

impl TlsParametersBuilder {
    /// Creates a new builder for `TlsParameters`
    pub fn new(domain: String) -> Self {
        Self {
            domain,
            cert_store: CertificateStore::Default,
            root_certs: Vec::new(),
            identity: None,
            accept_invalid_hostnames: false,
            accept_invalid_certs: false,
            min_tls_version: TlsVersion::Tlsv12,
        }
    }

    /// Set the source for the base set of root certificates to trust
    pub fn certificate_store(mut self, cert_store: CertificateStore) -> Self {
        self.cert_store = cert_store;
        self
    }

    /// Add a custom root certificate, e.g. for a self-signed server
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certs.push(cert);
        self
    }

    /// Configure a client certificate to present to the server
    pub fn identify_with(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Controls whether certificates with an invalid hostname are accepted.
    /// Defaults to `false`; disabling hostname verification exposes the
    /// connection to MITM attacks.
    pub fn dangerous_accept_invalid_hostnames(mut self, accept_invalid_hostnames: bool) -> Self {
        self.accept_invalid_hostnames = accept_invalid_hostnames;
        self
    }

    /// Controls the minimum TLS version allowed. Defaults to 1.2.
    pub fn set_min_tls_version(mut self, min_tls_version: TlsVersion) -> Self {
        self.min_tls_version = min_tls_version;
        self
    }

    /// Controls whether invalid certificates (self-signed, expired, wrong
    /// hostname) are accepted. Defaults to `false`.
    pub fn dangerous_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> Self {
        self.accept_invalid_certs = accept_invalid_certs;
        self
    }

    /// Builds the `TlsParameters`
    pub fn build(self) -> Result<TlsParameters, Error> {
        let mut builder = native_tls::TlsConnector::builder();
        builder.min_protocol_version(Some(self.min_tls_version.into_native_tls()?));
        builder.danger_accept_invalid_hostnames(self.accept_invalid_hostnames);
        builder.danger_accept_invalid_certs(self.accept_invalid_certs);

        if matches!(self.cert_store, CertificateStore::None) {
            builder.disable_built_in_roots(true);
        }
        for cert in self.root_certs {
            builder.add_root_certificate(cert.0);
        }
        if let Some(identity) = self.identity {
            builder.identity(identity.0);
        }

        let connector = builder.build().map_err(error::tls)?;
        Ok(TlsParameters {
            connector,
            domain: self.domain,
        })
    }
}

impl TlsParameters {
    /// Creates `TlsParameters` with the default configuration for `domain`
    pub fn new(domain: String) -> Result<Self, Error> {
        TlsParametersBuilder::new(domain).build()
    }

    /// Creates a new `TlsParameters` builder
    pub fn builder(domain: String) -> TlsParametersBuilder {
        TlsParametersBuilder::new(domain)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Only one TLS backend is ever compiled in, so this has a single variant;
/// kept as a wrapper so the SMTP connection layer doesn't depend directly
/// on `native-tls` types.
#[derive(Clone)]
pub(crate) struct InnerTlsParameters {
    pub(crate) connector: native_tls::TlsConnector,
}

impl From<&TlsParameters> for InnerTlsParameters {
    fn from(params: &TlsParameters) -> Self {
        InnerTlsParameters {
            connector: params.connector.clone(),
        }
    }
}

/// A certificate that can be used with [`TlsParametersBuilder::add_root_certificate`]
#[derive(Clone)]
pub struct Certificate(native_tls::Certificate);

impl Certificate {
    /// Create a `Certificate` from a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        Ok(Self(native_tls::Certificate::from_der(der).map_err(error::tls)?))
    }

    /// Create a `Certificate` from a PEM encoded certificate
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        Ok(Self(native_tls::Certificate::from_pem(pem).map_err(error::tls)?))
    }
}

impl Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate").finish_non_exhaustive()
    }
}

/// An identity (private key + certificate) that can be used with
/// [`TlsParametersBuilder::identify_with`]
#[derive(Clone)]
pub struct Identity(native_tls::Identity);

impl Identity {
    pub fn from_pem(pem: &[u8], key: &[u8]) -> Result<Self, Error> {
        Ok(Self(
            native_tls::Identity::from_pkcs8(pem, key).map_err(error::tls)?,
        ))
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").finish_non_exhaustive()
    }
}
