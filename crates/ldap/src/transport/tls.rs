//! TLS settings for LDAPS connections.

use crate::error::TlsConfigError;

use std::fmt;
use std::io::BufRead;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms, aws_lc_rs};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Whether the connection is wrapped in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    /// Plain LDAP.
    #[default]
    Disabled,
    /// LDAPS: TLS handshake right after the TCP connect.
    Tls,
}

/// Decides whether a presented server certificate chain is acceptable.
///
/// Arguments are the end-entity certificate, the intermediates, and the
/// server name the client connected to.
pub type ServerCertificateCallback = Arc<
    dyn Fn(&CertificateDer<'_>, &[CertificateDer<'_>], &ServerName<'_>) -> bool + Send + Sync,
>;

/// How the server certificate is validated.
#[derive(Clone, Default)]
pub enum CertificateValidation {
    /// Validate against the Mozilla root program.
    #[default]
    SystemRoots,
    /// Validate against the given trust anchors only.
    TrustedRoots(Vec<CertificateDer<'static>>),
    /// Let the callback decide. Handshake signatures are still verified.
    Custom(ServerCertificateCallback),
    /// Accept any certificate. Handshake signatures are still verified.
    ///
    /// This disables server authentication and must only be used against
    /// test servers.
    DangerousAcceptAll,
}

impl CertificateValidation {
    /// Trust the certificates found in a PEM document.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM cannot be read or holds no certificate.
    pub fn trusted_roots_from_pem(mut pem: impl BufRead) -> Result<Self, TlsConfigError> {
        let roots = rustls_pemfile::certs(&mut pem).collect::<Result<Vec<_>, _>>()?;
        if roots.is_empty() {
            return Err(TlsConfigError::MissingCertificates);
        }
        Ok(Self::TrustedRoots(roots))
    }

    /// Validate with a callback.
    pub fn custom<F>(callback: F) -> Self
    where
        F: Fn(&CertificateDer<'_>, &[CertificateDer<'_>], &ServerName<'_>) -> bool
            + Send
            + Sync
            + 'static,
    {
        Self::Custom(Arc::new(callback))
    }
}

impl fmt::Debug for CertificateValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemRoots => f.write_str("SystemRoots"),
            Self::TrustedRoots(roots) => f
                .debug_struct("TrustedRoots")
                .field("count", &roots.len())
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::DangerousAcceptAll => f.write_str("DangerousAcceptAll"),
        }
    }
}

/// Certificate chain and key presented for mutual TLS.
pub struct ClientIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    /// Create an identity from DER parts.
    #[must_use]
    pub const fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    /// Load an identity from PEM documents holding the chain and the key.
    ///
    /// # Errors
    ///
    /// Returns an error if either document cannot be read, the chain is
    /// empty, or no private key is present.
    pub fn from_pem(mut chain: impl BufRead, mut key: impl BufRead) -> Result<Self, TlsConfigError> {
        let chain = rustls_pemfile::certs(&mut chain).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(TlsConfigError::MissingCertificates);
        }
        let key = rustls_pemfile::private_key(&mut key)?.ok_or(TlsConfigError::MissingPrivateKey)?;
        Ok(Self { chain, key })
    }

    /// The certificate chain, end-entity first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// TLS client settings.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server certificate validation policy.
    pub certificate_validation: CertificateValidation,
    /// Identity presented to servers that request one.
    pub client_identity: Option<ClientIdentity>,
}

impl TlsConfig {
    /// Build the rustls client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a trust anchor or the client identity is rejected
    /// by rustls.
    pub fn client_config(&self) -> Result<ClientConfig, TlsConfigError> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = match &self.certificate_validation {
            CertificateValidation::SystemRoots => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                builder.with_root_certificates(roots)
            }
            CertificateValidation::TrustedRoots(certs) => {
                let mut roots = RootCertStore::empty();
                for cert in certs {
                    roots.add(cert.clone())?;
                }
                debug!(count = roots.len(), "using custom trust anchors");
                builder.with_root_certificates(roots)
            }
            CertificateValidation::Custom(callback) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CallbackVerifier::new(
                    callback.clone(),
                    &provider,
                ))),
            CertificateValidation::DangerousAcceptAll => {
                warn!("server certificate validation is disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(CallbackVerifier::new(
                        Arc::new(accept_any),
                        &provider,
                    )))
            }
        };

        let config = match &self.client_identity {
            Some(identity) => {
                builder.with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }

    /// Build a connector for `tokio-rustls`.
    ///
    /// # Errors
    ///
    /// See [`TlsConfig::client_config`].
    pub fn connector(&self) -> Result<TlsConnector, TlsConfigError> {
        Ok(TlsConnector::from(Arc::new(self.client_config()?)))
    }
}

fn accept_any(_: &CertificateDer<'_>, _: &[CertificateDer<'_>], _: &ServerName<'_>) -> bool {
    true
}

/// Delegates the chain decision to a callback and keeps signature checks.
struct CallbackVerifier {
    callback: ServerCertificateCallback,
    algorithms: WebPkiSupportedAlgorithms,
}

impl CallbackVerifier {
    fn new(callback: ServerCertificateCallback, provider: &CryptoProvider) -> Self {
        Self {
            callback,
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if (self.callback)(end_entity, intermediates, server_name) {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!(server = ?server_name, "server certificate rejected by callback");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
