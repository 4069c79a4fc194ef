//! Asynchronous LDAPv3 client protocol engine.
//!
//! This crate speaks the LDAP wire protocol (RFC 4511) over plain TCP or
//! TLS. A single connection can carry many concurrent operations: requests
//! are written one at a time, and a background message pump routes every
//! response to the caller waiting on its message id.
//!
//! # Features
//!
//! - **Concurrent operations**: Any number of tasks can queue operations on one connection
//! - **Cancellation**: Every wait takes a `CancellationToken`; a cancelled operation returns what it has so far
//! - **LDAPS**: rustls with system roots by default, custom roots, callbacks and client certificates
//! - **Directory authentication**: Turn a username, domain and password into a principal
//!
//! # Example
//!
//! ```no_run
//! use proven_ldap::{
//!     CancellationToken, ConnectionConfig, Filter, LdapConnection, SearchRequest, SearchScope,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::builder().tls().build();
//!     let connection = LdapConnection::open("ldap.example.com", 636, config).await?;
//!
//!     connection
//!         .simple_bind("cn=reader,dc=example,dc=com", b"secret", CancellationToken::new())
//!         .await?;
//!
//!     let request = SearchRequest::new(
//!         "dc=example,dc=com",
//!         SearchScope::WholeSubtree,
//!         Filter::equal("uid", "jdoe"),
//!     )
//!     .with_attributes(["cn", "mail"]);
//!
//!     let results = connection.search(request, CancellationToken::new()).await?;
//!     for entry in results.entries {
//!         println!("{}", entry.object_name);
//!     }
//!
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod pump;
pub mod transport;

// Re-export commonly used types
pub use auth::{
    Authenticator, AuthenticatorConfig, BindNameFormat, DirectoryAuthenticator, Principal,
};
pub use connection::{
    ConnectionBuilder, ConnectionConfig, ConnectionState, LdapConnection, SearchResults,
};
pub use error::{
    ConnectError, DecodeError, Error, InvalidOperationError, QueueError, Result, TlsConfigError,
};
pub use protocol::{
    Control, Filter, LdapMessage, LdapResult, MessageId, OperationCode, ProtocolOp, ResultCode,
    SearchRequest, SearchScope,
};
pub use pump::{MessagePump, PumpExit, ResponseStream};
pub use transport::{CertificateValidation, ClientIdentity, Encryption, TlsConfig};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
