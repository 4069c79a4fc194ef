//! Transport layer for LDAP connections.
//!
//! This module opens the socket under a connection and optionally wraps it
//! in TLS, according to the configured certificate validation policy.

pub mod stream;
pub mod tls;

pub use stream::Transport;
pub use tls::{
    CertificateValidation, ClientIdentity, Encryption, ServerCertificateCallback, TlsConfig,
};
