//! The message pump: the single reader of a connection.
//!
//! The pump owns the read half of the transport. It splits the byte stream
//! into messages, routes each one to the caller waiting on its message id,
//! and releases every waiter when it stops.

use crate::error::{DecodeError, QueueError};
use crate::protocol::{LdapCodec, LdapMessage, MessageId, NOTICE_OF_DISCONNECTION_OID, ProtocolOp};

use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Responses correlated to one message id, in arrival order.
///
/// The stream ends after the terminating response or when the caller's token
/// is cancelled. If the pump stops or a response for this id cannot be
/// decoded, it yields a single error and ends.
pub type ResponseStream = BoxStream<'static, Result<LdapMessage, QueueError>>;

type Correlations = Arc<DashMap<MessageId, mpsc::UnboundedSender<Delivery>>>;

#[derive(Debug)]
enum Delivery {
    Message(LdapMessage),
    Failed(QueueError),
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// `stop` was called or the pump was dropped.
    Stopped,
    /// The server closed the stream, framing was lost, or the server sent a
    /// notice of disconnection.
    ConnectionLost,
}

impl PumpExit {
    /// The error reported to waiters released by this exit.
    #[must_use]
    pub const fn error(self) -> QueueError {
        match self {
            Self::Stopped => QueueError::Closing,
            Self::ConnectionLost => QueueError::ConnectionLost,
        }
    }
}

/// Reads messages from a transport and delivers them to waiting callers.
pub struct MessagePump {
    correlations: Correlations,
    frames: Mutex<Option<BoxStream<'static, io::Result<Bytes>>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    exit: Arc<RwLock<Option<PumpExit>>>,
}

impl MessagePump {
    /// Create a pump over `reader`. Nothing is read until [`start`](Self::start).
    pub fn new<R>(reader: R, codec: LdapCodec) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            correlations: Arc::new(DashMap::new()),
            frames: Mutex::new(Some(FramedRead::new(reader, codec).boxed())),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            exit: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the read loop. Does nothing if it was already started.
    pub fn start(&self) {
        let Some(frames) = self.frames.lock().take() else {
            return;
        };

        let correlations = Arc::clone(&self.correlations);
        let shutdown = self.shutdown.clone();
        let exit = Arc::clone(&self.exit);

        let handle = tokio::spawn(async move {
            let reason = Self::run(frames, &correlations, &shutdown).await;
            let reason = *exit.write().get_or_insert(reason);
            release_all(&correlations, reason);
        });

        *self.task.lock() = Some(handle);
    }

    /// Register interest in `message_id` and return its responses.
    ///
    /// The correlation exists as soon as this returns, so a request written
    /// afterwards can not have its responses missed. Dropping the stream
    /// removes the correlation.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::MessageIdInUse`] if the id is still pending, or
    /// the pump's exit error if it has stopped.
    pub fn get_response(
        &self,
        message_id: MessageId,
        token: CancellationToken,
    ) -> Result<ResponseStream, QueueError> {
        let mut registration = self.register(message_id)?;
        let exit = Arc::clone(&self.exit);

        Ok(stream! {
            loop {
                let delivery = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!(message_id, "response wait cancelled");
                        break;
                    }
                    delivery = registration.receiver.recv() => delivery,
                };

                match delivery {
                    Some(Delivery::Message(message)) => {
                        let terminating = message.is_terminating();
                        yield Ok(message);
                        if terminating {
                            break;
                        }
                    }
                    Some(Delivery::Failed(error)) => {
                        yield Err(error);
                        break;
                    }
                    None => {
                        let reason = (*exit.read()).unwrap_or(PumpExit::Stopped);
                        yield Err(reason.error());
                        break;
                    }
                }
            }
        }
        .boxed())
    }

    fn register(&self, message_id: MessageId) -> Result<Registration, QueueError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        match self.correlations.entry(message_id) {
            Entry::Occupied(_) => return Err(QueueError::MessageIdInUse(message_id)),
            Entry::Vacant(entry) => {
                entry.insert(sender);
            }
        }

        // The read loop sets `exit` before releasing correlations, so either
        // it sees this entry or we see its exit.
        if let Some(reason) = *self.exit.read() {
            self.correlations.remove(&message_id);
            return Err(reason.error());
        }

        Ok(Registration {
            message_id,
            correlations: Arc::clone(&self.correlations),
            receiver,
        })
    }

    /// Stop the read loop and release every pending correlation.
    ///
    /// Waiters observe [`QueueError::Closing`], or
    /// [`QueueError::ConnectionLost`] if the pump had already lost the
    /// connection. Safe to call more than once.
    pub async fn stop(&self) {
        let reason = *self.exit.write().get_or_insert(PumpExit::Stopped);
        self.shutdown.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "message pump task failed");
                }
            }
        }

        // Drops the reader if the pump was never started.
        self.frames.lock().take();
        release_all(&self.correlations, reason);
    }

    /// Why the pump stopped, or `None` while it may still deliver.
    #[must_use]
    pub fn exit(&self) -> Option<PumpExit> {
        *self.exit.read()
    }

    /// Number of message ids with a waiting consumer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.correlations.len()
    }

    async fn run(
        mut frames: BoxStream<'static, io::Result<Bytes>>,
        correlations: &DashMap<MessageId, mpsc::UnboundedSender<Delivery>>,
        shutdown: &CancellationToken,
    ) -> PumpExit {
        loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("message pump shutdown requested");
                    return PumpExit::Stopped;
                }
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    if let ControlFlow::Break(reason) = dispatch(correlations, frame) {
                        return reason;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "LDAP stream error");
                    return PumpExit::ConnectionLost;
                }
                None => {
                    debug!("LDAP stream closed");
                    return PumpExit::ConnectionLost;
                }
            }
        }
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
        let reason = *self.exit.write().get_or_insert(PumpExit::Stopped);
        release_all(&self.correlations, reason);
    }
}

/// A caller's end of one correlation.
struct Registration {
    message_id: MessageId,
    correlations: Correlations,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.receiver.close();
        // Only our own entry has a closed sender.
        self.correlations
            .remove_if(&self.message_id, |_, sender| sender.is_closed());
    }
}

fn dispatch(
    correlations: &DashMap<MessageId, mpsc::UnboundedSender<Delivery>>,
    frame: Bytes,
) -> ControlFlow<PumpExit> {
    let message_id = match LdapMessage::peek_header(&frame) {
        Ok(header) => header.message_id,
        Err(e) => {
            warn!(error = %e, "dropping message with unreadable header");
            return ControlFlow::Continue(());
        }
    };

    let decoded = LdapMessage::decode(frame);

    if message_id == 0 {
        return unsolicited(decoded);
    }

    let message = match decoded {
        Ok(message) => message,
        Err(e) => {
            warn!(message_id, error = %e, "failed to decode message");
            if let Some((_, sender)) = correlations.remove(&message_id) {
                let _ = sender.send(Delivery::Failed(QueueError::Decode(e)));
            }
            return ControlFlow::Continue(());
        }
    };

    if message.is_terminating() {
        if let Some((_, sender)) = correlations.remove(&message_id) {
            let _ = sender.send(Delivery::Message(message));
            return ControlFlow::Continue(());
        }
    } else if let Some(sender) = correlations.get(&message_id) {
        let _ = sender.send(Delivery::Message(message));
        return ControlFlow::Continue(());
    }

    debug!(message_id, "dropping message for unknown message id");
    ControlFlow::Continue(())
}

fn unsolicited(
    decoded: Result<LdapMessage, DecodeError>,
) -> ControlFlow<PumpExit> {
    match decoded {
        Ok(LdapMessage {
            op: ProtocolOp::ExtendedResponse(response),
            ..
        }) if response.name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) => {
            warn!(result = %response.result, "server sent notice of disconnection");
            ControlFlow::Break(PumpExit::ConnectionLost)
        }
        Ok(message) => {
            debug!(op = ?message.op.code(), "ignoring unsolicited message");
            ControlFlow::Continue(())
        }
        Err(e) => {
            warn!(error = %e, "failed to decode unsolicited message");
            ControlFlow::Continue(())
        }
    }
}

fn release_all(
    correlations: &DashMap<MessageId, mpsc::UnboundedSender<Delivery>>,
    reason: PumpExit,
) {
    correlations.retain(|message_id, sender| {
        debug!(message_id, ?reason, "releasing pending operation");
        let _ = sender.send(Delivery::Failed(reason.error()));
        false
    });
}
