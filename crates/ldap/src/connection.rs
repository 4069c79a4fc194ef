//! LDAP connection handle.

use crate::error::{ConnectError, DecodeError, Error, InvalidOperationError, QueueError, Result};
use crate::protocol::{
    BindRequest, Control, ExtendedRequest, LdapCodec, LdapMessage, LdapResult,
    MAX_MESSAGE_SIZE, MessageId, ProtocolOp, SearchRequest, SearchResultEntry, WHO_AM_I_OID,
};
use crate::pump::MessagePump;
use crate::transport::{CertificateValidation, ClientIdentity, Encryption, TlsConfig, Transport};

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Configuration for an LDAP connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Whether to use LDAPS.
    pub encryption: Encryption,
    /// TLS settings, used when `encryption` is [`Encryption::Tls`].
    pub tls: TlsConfig,
    /// Bound on socket connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Largest message accepted from or sent to the server.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            encryption: Encryption::Disabled,
            tls: TlsConfig::default(),
            connect_timeout: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use LDAPS.
    #[must_use]
    pub const fn tls(mut self) -> Self {
        self.config.encryption = Encryption::Tls;
        self
    }

    /// Set how the server certificate is validated.
    #[must_use]
    pub fn certificate_validation(mut self, validation: CertificateValidation) -> Self {
        self.config.tls.certificate_validation = validation;
        self
    }

    /// Present a client certificate.
    #[must_use]
    pub fn client_identity(mut self, identity: ClientIdentity) -> Self {
        self.config.tls.client_identity = Some(identity);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Finish the configuration.
    #[must_use]
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect` not called yet.
    Unconnected,
    /// `connect` in progress.
    Connecting,
    /// Ready for operations.
    Open,
    /// `close` in progress.
    Closing,
    /// Closed, or the server went away. Terminal.
    Closed,
}

type Writer = FramedWrite<WriteHalf<Transport>, LdapCodec>;

/// Bound on each best-effort step of a shutdown.
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// The open transport: a serialized writer and the pump owning the reader.
struct Link {
    writer: Mutex<Writer>,
    pump: MessagePump,
    closing: CancellationToken,
}

impl Link {
    async fn send(&self, message: LdapMessage) -> std::result::Result<(), QueueError> {
        let message_id = message.message_id;

        // A write stalled on a peer that stopped reading must not block close.
        let result = tokio::select! {
            biased;
            () = self.closing.cancelled() => return Err(QueueError::Closing),
            result = async { self.writer.lock().await.send(message).await } => result,
        };

        result.map_err(|source| match self.pump.exit() {
            Some(reason) => reason.error(),
            None => QueueError::Write { message_id, source },
        })
    }

    async fn shutdown(&self, unbind_id: MessageId) {
        if self.pump.exit().is_none() {
            let unbind = LdapMessage::new(unbind_id, ProtocolOp::UnbindRequest);
            let sent = timeout(SHUTDOWN_STEP_TIMEOUT, async {
                self.writer.lock().await.send(unbind).await
            })
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "failed to send unbind request"),
                Err(_) => debug!("writer busy, skipping unbind request"),
            }
        }

        self.closing.cancel();
        self.pump.stop().await;

        let mut writer = self.writer.lock().await;
        match timeout(SHUTDOWN_STEP_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "failed to shut down transport"),
            Err(_) => debug!("timed out shutting down transport"),
        }
    }
}

/// Results of a search operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    /// Returned entries, in arrival order.
    pub entries: Vec<SearchResultEntry>,
    /// Continuation reference URIs.
    pub references: Vec<String>,
    /// Final result of the search.
    pub result: LdapResult,
}

/// A client connection to a directory server.
///
/// The connection owns its transport. Operations can be queued concurrently
/// from many tasks; the requests are written one at a time and the responses
/// are read by a background pump.
pub struct LdapConnection {
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    next_message_id: AtomicI32,
    link: RwLock<Option<Arc<Link>>>,
    shutdown: CancellationToken,
}

impl LdapConnection {
    /// Create an unconnected handle.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ConnectionState::Unconnected),
            next_message_id: AtomicI32::new(1),
            link: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a handle and connect it.
    ///
    /// # Errors
    ///
    /// See [`LdapConnection::connect`].
    pub async fn open(
        host: &str,
        port: u16,
        config: ConnectionConfig,
    ) -> std::result::Result<Self, ConnectError> {
        let connection = Self::new(config);
        connection.connect(host, port).await?;
        Ok(connection)
    }

    /// The configuration this connection was created with.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current lifecycle state.
    ///
    /// An open connection whose pump has stopped on its own reports
    /// [`ConnectionState::Closed`].
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let state = *self.state.read();
        if state == ConnectionState::Open
            && self
                .link
                .read()
                .as_ref()
                .is_some_and(|link| link.pump.exit().is_some())
        {
            return ConnectionState::Closed;
        }
        state
    }

    /// Connect to `host:port` and start reading responses.
    ///
    /// On failure the connection is [`ConnectionState::Closed`] and any
    /// socket opened along the way has been released.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not unconnected, the socket or
    /// the TLS handshake fails, the connect timeout elapses, or the
    /// connection is closed while connecting.
    #[instrument(skip(self))]
    pub async fn connect(&self, host: &str, port: u16) -> std::result::Result<(), ConnectError> {
        {
            let mut state = self.state.write();
            if *state != ConnectionState::Unconnected {
                return Err(ConnectError::InvalidState(*state));
            }
            *state = ConnectionState::Connecting;
        }

        match self.establish(host, port).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to connect");
                *self.state.write() = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    async fn establish(&self, host: &str, port: u16) -> std::result::Result<(), ConnectError> {
        let connect = Transport::connect(host, port, self.config.encryption, &self.config.tls);

        let transport = tokio::select! {
            () = self.shutdown.cancelled() => return Err(ConnectError::Aborted),
            result = timeout(self.config.connect_timeout, connect) => match result {
                Ok(transport) => transport?,
                Err(_) => {
                    return Err(ConnectError::Timeout {
                        addr: format!("{host}:{port}"),
                        timeout: self.config.connect_timeout,
                    });
                }
            },
        };

        let encrypted = transport.is_encrypted();
        let codec = LdapCodec::new().with_max_message_size(self.config.max_message_size);
        let (reader, writer) = tokio::io::split(transport);
        let link = Arc::new(Link {
            writer: Mutex::new(FramedWrite::new(writer, codec)),
            pump: MessagePump::new(reader, codec),
            closing: CancellationToken::new(),
        });

        {
            let mut state = self.state.write();
            if *state != ConnectionState::Connecting {
                return Err(ConnectError::Aborted);
            }
            link.pump.start();
            *self.link.write() = Some(link);
            *state = ConnectionState::Open;
        }

        info!(host, port, encrypted, "LDAP connection established");
        Ok(())
    }

    fn next_message_id(&self) -> MessageId {
        self.next_message_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id == MessageId::MAX { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    fn link(&self) -> std::result::Result<Arc<Link>, QueueError> {
        match *self.state.read() {
            ConnectionState::Open => self.link.read().clone().ok_or(QueueError::Closed),
            ConnectionState::Closing => Err(QueueError::Closing),
            ConnectionState::Unconnected | ConnectionState::Connecting | ConnectionState::Closed => {
                Err(QueueError::Closed)
            }
        }
    }

    /// Send a request and collect its responses.
    ///
    /// Returns every response up to and including the terminating one, or
    /// an empty sequence for requests without a response. If `token` is
    /// cancelled first, the responses received so far are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if `op` is a response, the connection is not open,
    /// the write fails, the connection closes or is lost while waiting, or a
    /// response for this request cannot be decoded.
    pub async fn queue(
        &self,
        op: ProtocolOp,
        token: CancellationToken,
    ) -> std::result::Result<Vec<LdapMessage>, QueueError> {
        self.queue_with_controls(op, Vec::new(), token).await
    }

    /// [`queue`](Self::queue) with request controls.
    ///
    /// # Errors
    ///
    /// See [`LdapConnection::queue`].
    #[instrument(skip(self, op, controls, token), fields(op = ?op.code()))]
    pub async fn queue_with_controls(
        &self,
        op: ProtocolOp,
        controls: Vec<Control>,
        token: CancellationToken,
    ) -> std::result::Result<Vec<LdapMessage>, QueueError> {
        if !op.is_request() {
            return Err(InvalidOperationError::QueueResponse(op.code()).into());
        }

        let link = self.link()?;
        if let Some(reason) = link.pump.exit() {
            return Err(reason.error());
        }

        let message_id = self.next_message_id();
        let responses = if op.has_response() {
            Some(link.pump.get_response(message_id, token)?)
        } else {
            None
        };

        debug!(message_id, "sending request");
        link.send(LdapMessage::new(message_id, op).with_controls(controls))
            .await?;

        let Some(mut responses) = responses else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        while let Some(message) = responses.next().await {
            messages.push(message?);
        }
        Ok(messages)
    }

    async fn queue_single(&self, op: ProtocolOp, token: CancellationToken) -> Result<ProtocolOp> {
        let mut messages = self.queue(op, token).await?;
        match messages.pop() {
            Some(message) if message.is_terminating() => Ok(message.op),
            _ => Err(Error::Cancelled),
        }
    }

    /// Bind with a DN and password.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Result`] if the server rejects the bind, or any
    /// error of [`LdapConnection::queue`].
    pub async fn simple_bind(
        &self,
        name: &str,
        password: &[u8],
        token: CancellationToken,
    ) -> Result<LdapResult> {
        let request = BindRequest::simple(name, Bytes::copy_from_slice(password));
        match self.queue_single(ProtocolOp::BindRequest(request), token).await? {
            ProtocolOp::BindResponse(response) => response.result.success(),
            other => Err(Error::UnexpectedResponse(other.code())),
        }
    }

    /// Run a search and collect its results.
    ///
    /// A non-success final result is returned in [`SearchResults::result`]
    /// together with the entries received before it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `token` is cancelled before the search
    /// completes, or any error of [`LdapConnection::queue`].
    pub async fn search(
        &self,
        request: SearchRequest,
        token: CancellationToken,
    ) -> Result<SearchResults> {
        let mut entries = Vec::new();
        let mut references = Vec::new();
        let mut result = None;

        for message in self.queue(ProtocolOp::SearchRequest(request), token).await? {
            match message.op {
                ProtocolOp::SearchResultEntry(entry) => entries.push(entry),
                ProtocolOp::SearchResultReference(uris) => references.extend(uris),
                ProtocolOp::SearchResultDone(done) => result = Some(done),
                other => return Err(Error::UnexpectedResponse(other.code())),
            }
        }

        let result = result.ok_or(Error::Cancelled)?;
        debug!(entries = entries.len(), %result, "search complete");

        Ok(SearchResults {
            entries,
            references,
            result,
        })
    }

    /// Ask the server which authorization identity this connection has.
    ///
    /// Returns `None` for an anonymous connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Result`] if the server rejects the operation, or any
    /// error of [`LdapConnection::queue`].
    pub async fn who_am_i(&self, token: CancellationToken) -> Result<Option<String>> {
        let request = ExtendedRequest {
            name: WHO_AM_I_OID.to_string(),
            value: None,
        };

        match self
            .queue_single(ProtocolOp::ExtendedRequest(request), token)
            .await?
        {
            ProtocolOp::ExtendedResponse(response) => {
                response.result.success()?;
                let Some(value) = response.value.filter(|value| !value.is_empty()) else {
                    return Ok(None);
                };
                let authz_id = std::str::from_utf8(&value).map_err(DecodeError::from)?;
                Ok(Some(authz_id.to_string()))
            }
            other => Err(Error::UnexpectedResponse(other.code())),
        }
    }

    /// Ask the server to abandon an outstanding operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be written.
    pub async fn abandon(&self, message_id: MessageId) -> std::result::Result<(), QueueError> {
        self.queue(ProtocolOp::AbandonRequest(message_id), CancellationToken::new())
            .await
            .map(|_| ())
    }

    /// Unbind and close the connection.
    ///
    /// Operations in flight observe [`QueueError::Closing`]. Safe to call
    /// more than once and from several tasks.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let link = {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return,
                ConnectionState::Unconnected | ConnectionState::Connecting => {
                    *state = ConnectionState::Closed;
                    self.shutdown.cancel();
                    return;
                }
                ConnectionState::Open => *state = ConnectionState::Closing,
            }
            self.link.write().take()
        };

        self.shutdown.cancel();
        if let Some(link) = link {
            link.shutdown(self.next_message_id()).await;
        }

        *self.state.write() = ConnectionState::Closed;
        info!("LDAP connection closed");
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // Dropping the link aborts the pump and releases both stream halves.
        if self.link.get_mut().take().is_some() {
            debug!("LDAP connection dropped without close");
        }
    }
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultCode;

    #[test]
    fn test_builder() {
        let config = ConnectionConfig::builder()
            .tls()
            .certificate_validation(CertificateValidation::DangerousAcceptAll)
            .connect_timeout(Duration::from_secs(5))
            .max_message_size(1024)
            .build();

        assert_eq!(config.encryption, Encryption::Tls);
        assert!(matches!(
            config.tls.certificate_validation,
            CertificateValidation::DangerousAcceptAll
        ));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.encryption, Encryption::Disabled);
        assert!(matches!(
            config.tls.certificate_validation,
            CertificateValidation::SystemRoots
        ));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_message_ids_wrap_to_one() {
        let connection = LdapConnection::new(ConnectionConfig::default());
        assert_eq!(connection.next_message_id(), 1);
        assert_eq!(connection.next_message_id(), 2);

        connection
            .next_message_id
            .store(MessageId::MAX, Ordering::SeqCst);
        assert_eq!(connection.next_message_id(), MessageId::MAX);
        assert_eq!(connection.next_message_id(), 1);
    }

    #[tokio::test]
    async fn test_queue_requires_open_connection() {
        let connection = LdapConnection::new(ConnectionConfig::default());
        assert_eq!(connection.state(), ConnectionState::Unconnected);

        let result = connection
            .queue(ProtocolOp::UnbindRequest, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_responses_cannot_be_queued() {
        let connection = LdapConnection::new(ConnectionConfig::default());
        let result = connection
            .queue(
                ProtocolOp::DelResponse(LdapResult::new(ResultCode::Success)),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(QueueError::InvalidOperation(
                InvalidOperationError::QueueResponse(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let connection = LdapConnection::new(ConnectionConfig::default());
        connection.close().await;
        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        assert!(matches!(
            connection.connect("127.0.0.1", 389).await,
            Err(ConnectError::InvalidState(ConnectionState::Closed))
        ));
    }
}
