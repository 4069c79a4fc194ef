//! Integration tests for `LdapConnection` against a scripted server.

mod common;

use common::{
    TestServer, bind_credentials, bind_response, done, entry, eventually, extended,
    notice_of_disconnection, reference,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proven_ldap::protocol::{
    AddRequest, AttributeValueAssertion, BindRequest, Change, CompareRequest, LdapResult,
    ModifyOperation, ModifyRequest, OperationCode, PartialAttribute,
};
use proven_ldap::{
    CancellationToken, CertificateValidation, ConnectError, ConnectionConfig, ConnectionState,
    Error, Filter, LdapConnection, ProtocolOp, QueueError, ResultCode, SearchRequest, SearchScope,
};
use tokio::net::TcpListener;
use tracing_test::traced_test;

fn search(base: &str) -> SearchRequest {
    SearchRequest::new(base, SearchScope::WholeSubtree, Filter::default())
}

fn answer_binds(request: &common::Request) -> Vec<proven_ldap::LdapMessage> {
    match request.operation {
        OperationCode::BindRequest => vec![bind_response(request.message_id, ResultCode::Success)],
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn test_bind_success_returns_single_terminating_message() {
    let server = TestServer::start(answer_binds).await;
    let connection = server.connect().await;
    assert_eq!(connection.state(), ConnectionState::Open);

    let responses = connection
        .queue(
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin", "secret")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert!(response.is_terminating());
    assert_eq!(response.message_id, server.requests()[0].message_id);
    assert!(response.op.result().unwrap().is_success());

    connection.close().await;
}

#[tokio::test]
async fn test_simple_bind_reports_result_code() {
    let server = TestServer::start(|request| {
        if request.operation != OperationCode::BindRequest {
            return Vec::new();
        }
        let (name, password) = bind_credentials(request);
        let code = if name == "cn=admin" && &password[..] == b"secret" {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        };
        vec![bind_response(request.message_id, code)]
    })
    .await;
    let connection = server.connect().await;

    connection
        .simple_bind("cn=admin", b"secret", CancellationToken::new())
        .await
        .unwrap();

    let err = connection
        .simple_bind("cn=admin", b"wrong", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Result(ref result) if result.result_code == ResultCode::InvalidCredentials
    ));

    connection.close().await;
}

#[tokio::test]
#[traced_test]
async fn test_search_collects_until_done_and_drops_trailing_messages() {
    let server = TestServer::start(|request| match request.operation {
        OperationCode::SearchRequest => {
            let id = request.message_id;
            vec![
                entry(id, "cn=a,dc=example,dc=com"),
                reference(id, "ldap://replica.example.com/dc=example,dc=com"),
                entry(id, "cn=b,dc=example,dc=com"),
                done(id, ResultCode::Success),
                // Nobody waits for these.
                entry(id, "cn=late,dc=example,dc=com"),
                done(id + 1000, ResultCode::Success),
            ]
        }
        _ => answer_binds(request),
    })
    .await;
    let connection = server.connect().await;

    let results = connection
        .search(search("dc=example,dc=com"), CancellationToken::new())
        .await
        .unwrap();

    let names: Vec<_> = results
        .entries
        .iter()
        .map(|entry| entry.object_name.as_str())
        .collect();
    assert_eq!(names, ["cn=a,dc=example,dc=com", "cn=b,dc=example,dc=com"]);
    assert_eq!(results.references.len(), 1);
    assert!(results.result.is_success());

    // The connection is still usable after the stray messages.
    connection
        .simple_bind("cn=admin", b"secret", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Open);

    connection.close().await;
}

#[tokio::test]
async fn test_concurrent_operations_are_not_cross_delivered() {
    const OPERATIONS: usize = 8;

    // Hold every search until all have arrived, then answer them interleaved.
    let held = Arc::new(Mutex::new(Vec::new()));
    let server = {
        let held = Arc::clone(&held);
        TestServer::start(move |request| {
            let mut held = held.lock();
            held.push(request.message_id);
            if held.len() < OPERATIONS {
                return Vec::new();
            }

            let mut responses = Vec::new();
            for round in 0..3 {
                for &id in held.iter().rev() {
                    responses.push(entry(id, &format!("cn={id},ou={round}")));
                }
            }
            for &id in held.iter() {
                responses.push(done(id, ResultCode::Success));
            }
            responses
        })
        .await
    };

    let connection = Arc::new(server.connect().await);
    let tasks: Vec<_> = (0..OPERATIONS)
        .map(|_| {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .queue(
                        ProtocolOp::SearchRequest(search("dc=example,dc=com")),
                        CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        let messages = task.await.unwrap().unwrap();
        assert_eq!(messages.len(), 4);

        let id = messages[0].message_id;
        assert!(seen.insert(id), "message id {id} delivered twice");
        for message in &messages {
            assert_eq!(message.message_id, id);
            if let ProtocolOp::SearchResultEntry(entry) = &message.op {
                assert!(entry.object_name.starts_with(&format!("cn={id},")));
            }
        }
        assert!(messages[3].is_terminating());
    }
    assert_eq!(seen.len(), OPERATIONS);

    connection.close().await;
}

#[tokio::test]
async fn test_cancellation_returns_partial_results_and_drops_stale_responses() {
    let pending_search = Arc::new(Mutex::new(None));
    let server = {
        let pending_search = Arc::clone(&pending_search);
        TestServer::start(move |request| match request.operation {
            OperationCode::SearchRequest => {
                *pending_search.lock() = Some(request.message_id);
                vec![entry(request.message_id, "cn=first")]
            }
            OperationCode::BindRequest => {
                let mut responses = Vec::new();
                if let Some(id) = pending_search.lock().take() {
                    responses.push(done(id, ResultCode::Success));
                }
                responses.push(bind_response(request.message_id, ResultCode::Success));
                responses
            }
            _ => Vec::new(),
        })
        .await
    };
    let connection = server.connect().await;

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        })
    };

    let partial = connection
        .queue(ProtocolOp::SearchRequest(search("dc=example,dc=com")), token)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(partial.len(), 1);
    assert!(!partial[0].is_terminating());

    // The late SearchResultDone precedes the bind response and is dropped.
    let responses = connection
        .queue(
            ProtocolOp::BindRequest(BindRequest::simple("", "")),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].op.code(), OperationCode::BindResponse);

    connection.close().await;
}

#[tokio::test]
async fn test_cancelled_before_any_response_is_empty() {
    let server = TestServer::start(|_| Vec::new()).await;
    let connection = server.connect().await;

    let token = CancellationToken::new();
    token.cancel();

    let responses = connection
        .queue(ProtocolOp::SearchRequest(search("dc=example,dc=com")), token)
        .await
        .unwrap();
    assert!(responses.is_empty());

    let err = connection
        .search(search("dc=example,dc=com"), {
            let token = CancellationToken::new();
            token.cancel();
            token
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    connection.close().await;
}

#[tokio::test]
async fn test_close_while_in_flight_reports_closing() {
    let server = TestServer::start(|_| Vec::new()).await;
    let connection = Arc::new(server.connect().await);

    let in_flight = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            connection
                .queue(
                    ProtocolOp::SearchRequest(search("dc=example,dc=com")),
                    CancellationToken::new(),
                )
                .await
        })
    };

    eventually(|| server.operations().contains(&OperationCode::SearchRequest)).await;

    tokio::join!(connection.close(), connection.close());
    connection.close().await;

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(QueueError::Closing)));
    assert_eq!(connection.state(), ConnectionState::Closed);

    eventually(|| server.operations().contains(&OperationCode::UnbindRequest)).await;

    let after = connection
        .queue(ProtocolOp::AbandonRequest(1), CancellationToken::new())
        .await;
    assert!(matches!(after, Err(QueueError::Closed)));
}

#[tokio::test]
async fn test_notice_of_disconnection_closes_connection() {
    let server = TestServer::start(|request| match request.operation {
        OperationCode::SearchRequest => vec![notice_of_disconnection()],
        _ => Vec::new(),
    })
    .await;
    let connection = server.connect().await;

    let result = connection
        .queue(
            ProtocolOp::SearchRequest(search("dc=example,dc=com")),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(QueueError::ConnectionLost)));
    assert_eq!(connection.state(), ConnectionState::Closed);

    connection.close().await;
}

#[tokio::test]
async fn test_abandon_and_who_am_i() {
    let server = TestServer::start(|request| match request.operation {
        OperationCode::ExtendedRequest => vec![extended(request.message_id, Some("dn:cn=admin"))],
        _ => Vec::new(),
    })
    .await;
    let connection = server.connect().await;

    connection.abandon(42).await.unwrap();
    let authz_id = connection.who_am_i(CancellationToken::new()).await.unwrap();
    assert_eq!(authz_id.as_deref(), Some("dn:cn=admin"));

    assert_eq!(
        &server.operations()[..2],
        &[OperationCode::AbandonRequest, OperationCode::ExtendedRequest]
    );

    connection.close().await;
}

#[tokio::test]
async fn test_update_operations_receive_their_responses() {
    let server = TestServer::start(|request| {
        let result = LdapResult::new(ResultCode::Success);
        let op = match request.operation {
            OperationCode::ModifyRequest => ProtocolOp::ModifyResponse(result),
            OperationCode::AddRequest => ProtocolOp::AddResponse(result),
            OperationCode::CompareRequest => {
                ProtocolOp::CompareResponse(LdapResult::new(ResultCode::CompareTrue))
            }
            _ => return Vec::new(),
        };
        vec![proven_ldap::LdapMessage::new(request.message_id, op)]
    })
    .await;
    let connection = server.connect().await;

    let requests = [
        ProtocolOp::AddRequest(AddRequest {
            entry: "cn=x,dc=example,dc=com".into(),
            attributes: vec![PartialAttribute::new("objectClass", ["person"])],
        }),
        ProtocolOp::ModifyRequest(ModifyRequest {
            object: "cn=x,dc=example,dc=com".into(),
            changes: vec![Change {
                operation: ModifyOperation::Replace,
                modification: PartialAttribute::new("sn", ["x"]),
            }],
        }),
        ProtocolOp::CompareRequest(CompareRequest {
            entry: "cn=x,dc=example,dc=com".into(),
            assertion: AttributeValueAssertion::new("sn", "x"),
        }),
    ];
    let expected = [
        (OperationCode::AddResponse, ResultCode::Success),
        (OperationCode::ModifyResponse, ResultCode::Success),
        (OperationCode::CompareResponse, ResultCode::CompareTrue),
    ];

    for (op, (code, result_code)) in requests.into_iter().zip(expected) {
        let responses = connection.queue(op, CancellationToken::new()).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].op.code(), code);
        assert_eq!(responses[0].op.result().unwrap().result_code, result_code);
    }

    assert_eq!(
        server.operations(),
        [
            OperationCode::AddRequest,
            OperationCode::ModifyRequest,
            OperationCode::CompareRequest
        ]
    );

    connection.close().await;
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let server = TestServer::start(answer_binds).await;
    let connection = server.connect().await;
    eventually(|| server.accepted() == 1).await;

    let result = connection.connect("127.0.0.1", server.port()).await;
    assert!(matches!(
        result,
        Err(ConnectError::InvalidState(ConnectionState::Open))
    ));

    // The rejected connect opened no second socket.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);

    connection.close().await;
}

#[tokio::test]
async fn test_drop_without_close_releases_socket() {
    let server = TestServer::start(answer_binds).await;
    let connection = server.connect().await;
    eventually(|| server.accepted() == 1).await;

    drop(connection);

    eventually(|| server.finished() == 1).await;
}

#[tokio::test]
async fn test_tls_handshake_against_plaintext_peer_fails() {
    let server = TestServer::start(answer_binds).await;
    let config = ConnectionConfig::builder()
        .tls()
        .certificate_validation(CertificateValidation::DangerousAcceptAll)
        .connect_timeout(Duration::from_secs(5))
        .build();
    let connection = LdapConnection::new(config);

    let result = connection.connect("127.0.0.1", server.port()).await;
    assert!(matches!(result, Err(ConnectError::Handshake { .. })));
    assert_eq!(connection.state(), ConnectionState::Closed);

    // The half-open socket was released.
    eventually(|| server.finished() == 1).await;
}

#[tokio::test]
async fn test_close_is_not_blocked_by_stalled_write() {
    // A peer that accepts but never reads.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let config = ConnectionConfig::builder()
        .max_message_size(64 << 20)
        .build();
    let connection = Arc::new(LdapConnection::open("127.0.0.1", port, config).await.unwrap());
    let _socket = peer.await.unwrap();

    // Far larger than the loopback socket buffers, so the write stalls.
    let in_flight = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            let value = vec![0u8; 32 << 20];
            connection
                .queue(
                    ProtocolOp::AddRequest(AddRequest {
                        entry: "cn=big,dc=example,dc=com".into(),
                        attributes: vec![PartialAttribute::new("jpegPhoto", [value])],
                    }),
                    CancellationToken::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(10), connection.close())
        .await
        .expect("close finished while a write was stalled");
    assert_eq!(connection.state(), ConnectionState::Closed);

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(QueueError::Closing)));
}
