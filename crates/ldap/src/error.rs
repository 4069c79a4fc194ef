//! Error types for the LDAP client.

use crate::connection::ConnectionState;
use crate::protocol::{LdapResult, MessageId, OperationCode};

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for LDAP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for LDAP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Establishing the connection failed.
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Queueing an operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An operation was used in the wrong protocol direction.
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperationError),

    /// TLS settings could not be turned into a client configuration.
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] TlsConfigError),

    /// The server answered with a non-success result code.
    #[error("Operation failed: {0}")]
    Result(LdapResult),

    /// The server answered with an operation that does not belong to the request.
    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(OperationCode),

    /// The operation was cancelled before its terminating response arrived.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors raised while opening a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Failed to open the socket.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Socket connect plus handshake did not finish in time.
    #[error("Connecting to {addr} timed out after {timeout:?}")]
    Timeout {
        /// The address we tried to connect to.
        addr: String,
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// The host cannot be used as a TLS server name.
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// The TLS client configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),

    /// The TLS handshake failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// `connect` was called on a connection that is not unconnected.
    #[error("Cannot connect from state {0:?}")]
    InvalidState(ConnectionState),

    /// The connection was closed while the connect was in progress.
    #[error("Connection closed while connecting")]
    Aborted,
}

/// Errors raised while queueing an operation or awaiting its responses.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The connection is not open.
    #[error("Connection is closed")]
    Closed,

    /// The connection was closed while the operation was in flight.
    #[error("Connection is closing")]
    Closing,

    /// The server went away or the stream was corrupted.
    #[error("Connection lost")]
    ConnectionLost,

    /// Writing the request to the transport failed.
    #[error("Failed to write message {message_id}: {source}")]
    Write {
        /// Id of the message being written.
        message_id: MessageId,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The allocated message id still has a pending correlation.
    #[error("Message id {0} is still pending")]
    MessageIdInUse(MessageId),

    /// A response for this operation could not be decoded.
    #[error("Failed to decode response: {0}")]
    Decode(#[from] DecodeError),

    /// The operation cannot be sent.
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperationError),
}

/// Errors raised by the BER reader and the operation decoders.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The input ended inside an element.
    #[error("Truncated element")]
    Truncated,

    /// An element carried a different tag than the layout requires.
    #[error("Unexpected tag: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedTag {
        /// Tag required by the layout.
        expected: u8,
        /// Tag found on the wire.
        actual: u8,
    },

    /// Multi-byte tag numbers are not used by LDAP.
    #[error("Unsupported tag: {0:#04x}")]
    UnsupportedTag(u8),

    /// Indefinite lengths are forbidden by LDAP.
    #[error("Indefinite length")]
    IndefiniteLength,

    /// The length octets are malformed or too large.
    #[error("Invalid length")]
    InvalidLength,

    /// An integer does not fit the target type.
    #[error("Integer overflow")]
    IntegerOverflow,

    /// An LDAPString was not valid UTF-8.
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The operation tag is not a known LDAP operation.
    #[error("Unknown operation: {0:#04x}")]
    UnknownOperation(u8),

    /// A field carried a value outside its allowed range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A message exceeds the configured maximum size.
    #[error("Message size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the message.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The message is a request and can not be read back.
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperationError),
}

/// Protocol-direction misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidOperationError {
    /// Requests are write-only.
    #[error("Cannot decode a request: {0:?}")]
    DecodeRequest(OperationCode),

    /// Responses are read-only on a client.
    #[error("Cannot queue a response: {0:?}")]
    QueueResponse(OperationCode),
}

/// Errors raised while building TLS settings.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    /// rustls rejected the configuration.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// PEM input could not be read.
    #[error("Failed to read PEM: {0}")]
    Pem(#[from] io::Error),

    /// The PEM input held no certificates.
    #[error("No certificates found in PEM input")]
    MissingCertificates,

    /// The PEM input held no private key.
    #[error("No private key found in PEM input")]
    MissingPrivateKey,
}

impl QueueError {
    /// Whether this error means the connection can no longer be used.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Closing | Self::ConnectionLost)
    }
}
