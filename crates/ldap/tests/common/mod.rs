//! Scripted LDAP server for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use proven_ldap::protocol::ber::{BerReader, tag};
use proven_ldap::protocol::{
    BindResponse, ExtendedResponse, LdapCodec, LdapMessage, LdapResult, MessageId,
    NOTICE_OF_DISCONNECTION_OID, OperationCode, PartialAttribute, ProtocolOp, ResultCode,
    SearchResultEntry,
};
use proven_ldap::{ConnectionConfig, LdapConnection};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

/// A request as seen by the server.
#[derive(Debug, Clone)]
pub struct Request {
    pub message_id: MessageId,
    pub operation: OperationCode,
    pub frame: Bytes,
}

type Script = Arc<dyn Fn(&Request) -> Vec<LdapMessage> + Send + Sync>;

/// Answers each request with whatever the script returns.
///
/// An UnbindRequest closes the connection.
pub struct TestServer {
    port: u16,
    requests: Arc<Mutex<Vec<Request>>>,
    accepted: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(&Request) -> Vec<LdapMessage> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let script: Script = Arc::new(script);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let accept = {
            let requests = Arc::clone(&requests);
            let accepted = Arc::clone(&accepted);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let script = Arc::clone(&script);
                    let requests = Arc::clone(&requests);
                    let finished = Arc::clone(&finished);
                    tokio::spawn(async move {
                        serve(socket, script, requests).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            port,
            requests,
            accepted,
            finished,
            accept,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn operations(&self) -> Vec<OperationCode> {
        self.requests.lock().iter().map(|r| r.operation).collect()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections whose client side has gone away.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> LdapConnection {
        LdapConnection::open("127.0.0.1", self.port, ConnectionConfig::default())
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(socket: TcpStream, script: Script, requests: Arc<Mutex<Vec<Request>>>) {
    let (reader, mut writer) = socket.into_split();
    let mut frames = FramedRead::new(reader, LdapCodec::new());

    while let Some(Ok(frame)) = frames.next().await {
        let Ok(header) = LdapMessage::peek_header(&frame) else {
            break;
        };
        let Ok(operation) = header.operation() else {
            break;
        };

        let request = Request {
            message_id: header.message_id,
            operation,
            frame,
        };
        requests.lock().push(request.clone());

        if operation == OperationCode::UnbindRequest {
            break;
        }

        for response in script(&request) {
            if writer.write_all(&response.to_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Wait until `condition` holds, failing the test after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Name and password of a simple bind request.
pub fn bind_credentials(request: &Request) -> (String, Bytes) {
    let mut message = BerReader::new(request.frame.clone())
        .read_constructed(tag::SEQUENCE)
        .unwrap();
    message.read_i32(tag::INTEGER).unwrap();
    let mut bind = message
        .read_constructed(OperationCode::BindRequest.tag())
        .unwrap();
    assert_eq!(bind.read_i32(tag::INTEGER).unwrap(), 3);
    let name = bind.read_string(tag::OCTET_STRING).unwrap();
    let password = bind.read_octet_string(tag::context(0, false)).unwrap();
    (name, password)
}

pub fn bind_response(message_id: MessageId, result_code: ResultCode) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::BindResponse(BindResponse {
            result: LdapResult::new(result_code),
            server_sasl_creds: None,
        }),
    )
}

pub fn entry(message_id: MessageId, dn: &str) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: vec![PartialAttribute::new("cn", [dn.to_string()])],
        }),
    )
}

pub fn reference(message_id: MessageId, uri: &str) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::SearchResultReference(vec![uri.to_string()]),
    )
}

pub fn done(message_id: MessageId, result_code: ResultCode) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::SearchResultDone(LdapResult::new(result_code)),
    )
}

pub fn extended(message_id: MessageId, value: Option<&'static str>) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::new(ResultCode::Success),
            name: None,
            value: value.map(|value| Bytes::from_static(value.as_bytes())),
        }),
    )
}

pub fn notice_of_disconnection() -> LdapMessage {
    LdapMessage::new(
        0,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::new(ResultCode::Unavailable),
            name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            value: None,
        }),
    )
}
