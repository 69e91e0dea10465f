//! Request/response correlation through a live session.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use common::FakeServer;
use topicwire_client::conversation::{Continuation, ResponseCallback};
use topicwire_client::handler::{HandlerResult, RequestContext};
use topicwire_client::protocol::{ServiceEnvelope, ServiceMode, ServiceType};
use topicwire_client::{
    ConversationId, DiscardReason, ErrorCode, ServiceError, SessionError, SessionState,
};

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Response,
    Error(ErrorCode),
    Discard(DiscardReason),
}

struct Tagged {
    tag: u32,
    outcomes: Arc<Mutex<Vec<(u32, Outcome)>>>,
}

impl Continuation for Tagged {
    fn on_response(self: Box<Self>, _payload: Bytes) {
        self.outcomes.lock().push((self.tag, Outcome::Response));
    }

    fn on_error(self: Box<Self>, error: ServiceError) {
        self.outcomes.lock().push((self.tag, Outcome::Error(error.code)));
    }

    fn on_discard(self: Box<Self>, reason: DiscardReason) {
        self.outcomes.lock().push((self.tag, Outcome::Discard(reason)));
    }
}

fn tagged(outcomes: &Arc<Mutex<Vec<(u32, Outcome)>>>, tag: u32) -> Box<dyn Continuation> {
    Box::new(Tagged {
        tag,
        outcomes: Arc::clone(outcomes),
    })
}

#[tokio::test]
async fn test_typed_request_response() {
    let server = FakeServer::new();
    let session = server.session().await;
    assert_eq!(session.state(), SessionState::Connected);

    let request = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request::<_, String>(ServiceType::Fetch, &"?a//")
                .await
        })
    };

    let frame = server.expect(ServiceType::Fetch).await;
    assert_ne!(frame.conversation_id, ConversationId::RESERVED);
    server.respond(&frame, &"fetched");

    assert_eq!(request.await.unwrap().unwrap(), "fetched");
    assert_eq!(session.pending_conversations(), 0);
}

#[tokio::test]
async fn test_service_error_is_not_fatal() {
    let server = FakeServer::new();
    let session = server.session().await;

    let request = {
        let session = session.clone();
        tokio::spawn(async move { session.request_raw(ServiceType::Fetch, b"x").await })
    };
    let frame = server.expect(ServiceType::Fetch).await;
    server.respond_error(&frame, ServiceError::new(ErrorCode::AccessDenied, "denied"));

    match request.await.unwrap() {
        Err(SessionError::Service(error)) => {
            assert_eq!(error.code, ErrorCode::AccessDenied);
            assert_eq!(error.message, "denied");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_unknown_conversation_replies_are_harmless() {
    let server = FakeServer::new();
    let session = server.session().await;
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    session
        .send_request(ServiceType::Fetch, b"", tagged(&outcomes, 1))
        .unwrap();
    let frame = server.expect(ServiceType::Fetch).await;

    server.deliver(ServiceEnvelope::encode(
        ServiceType::Fetch,
        ServiceMode::Response,
        ConversationId::new(9_999),
        b"",
    ));
    server.deliver(ServiceEnvelope::encode(
        ServiceType::Fetch,
        ServiceMode::Error,
        ConversationId::new(9_998),
        b"not msgpack",
    ));
    server.sync(&session).await;
    assert!(outcomes.lock().is_empty());
    assert_eq!(session.pending_conversations(), 1);

    server.respond_empty(&frame);
    server.sync(&session).await;
    assert_eq!(*outcomes.lock(), vec![(1, Outcome::Response)]);
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_close_discards_every_pending_conversation_once() {
    let server = FakeServer::new();
    let session = server.session().await;
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    for tag in 0..5 {
        session
            .send_request(ServiceType::Fetch, b"", tagged(&outcomes, tag))
            .unwrap();
    }
    let first = server.expect(ServiceType::Fetch).await;
    let second = server.expect(ServiceType::Fetch).await;
    server.respond_empty(&first);
    server.respond_error(&second, ServiceError::new(ErrorCode::InvalidTopicPath, "bad"));
    server.sync(&session).await;

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    let outcomes = outcomes.lock().clone();
    assert_eq!(outcomes.len(), 5);
    assert_eq!(outcomes[0], (0, Outcome::Response));
    assert_eq!(outcomes[1], (1, Outcome::Error(ErrorCode::InvalidTopicPath)));
    for (tag, (seen, outcome)) in outcomes[2..].iter().enumerate() {
        assert_eq!(*seen, tag as u32 + 2);
        assert_eq!(*outcome, Outcome::Discard(DiscardReason::SessionClosed));
    }
    assert_eq!(session.pending_conversations(), 0);
}

#[tokio::test]
async fn test_request_after_close_is_discarded_and_refused() {
    let server = FakeServer::new();
    let session = server.session().await;
    session.close().await;

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let result = session.send_request(ServiceType::Fetch, b"", tagged(&outcomes, 1));
    assert!(matches!(result, Err(SessionError::SessionClosed)));
    assert_eq!(
        *outcomes.lock(),
        vec![(1, Outcome::Discard(DiscardReason::SessionClosed))]
    );

    assert!(matches!(
        session.request_raw(ServiceType::Fetch, b"").await,
        Err(SessionError::SessionClosed)
    ));
}

#[tokio::test]
async fn test_unhandled_inbound_request_closes_session() {
    let server = FakeServer::new();
    let session = server.session().await;
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    session
        .send_request(ServiceType::Fetch, b"", tagged(&outcomes, 1))
        .unwrap();

    server.push(ServiceType::Fetch, &"unsolicited");

    assert!(session.closed_within(Duration::from_secs(5)).await);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        *outcomes.lock(),
        vec![(1, Outcome::Discard(DiscardReason::ProtocolViolation))]
    );
}

#[tokio::test]
async fn test_only_fatal_handler_errors_close_session() {
    let server = FakeServer::new();
    let session = server
        .builder()
        .handler(
            ServiceType::SendReceiver,
            |_request: ServiceEnvelope, _ctx: RequestContext| -> HandlerResult {
                Err(SessionError::InvalidArgument("not for this client".to_string()))
            },
        )
        .handler(
            ServiceType::Fetch,
            |_request: ServiceEnvelope, _ctx: RequestContext| -> HandlerResult {
                Err(SessionError::Protocol("garbled request".to_string()))
            },
        )
        .start()
        .await
        .unwrap();

    server.push(ServiceType::SendReceiver, &"hello");
    server.sync(&session).await;
    assert_eq!(session.state(), SessionState::Connected);

    server.push(ServiceType::Fetch, &"hello");
    assert!(session.closed_within(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_malformed_frame_closes_session() {
    let server = FakeServer::new();
    let session = server.session().await;

    // Declares a 4 byte payload, carries none.
    let mut frame = ServiceEnvelope::encode(
        ServiceType::PingSystem,
        ServiceMode::Request,
        ConversationId::new(3),
        b"ping",
    )
    .to_vec();
    frame.truncate(frame.len() - 4);
    server.deliver(Bytes::from(frame));

    assert!(session.closed_within(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_system_ping_answered() {
    let server = FakeServer::new();
    let session = server.session().await;

    let id = server.push(ServiceType::PingSystem, &());
    let reply = server.next_frame().await;
    assert_eq!(reply.service_type, ServiceType::PingSystem);
    assert_eq!(reply.mode, ServiceMode::Response);
    assert_eq!(reply.conversation_id, id);
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_ping_server_measures_round_trip() {
    let server = FakeServer::new();
    let session = server.session().await;

    let ping = {
        let session = session.clone();
        tokio::spawn(async move { session.ping_server().await })
    };
    let frame = server.expect(ServiceType::PingUser).await;
    server.respond_empty(&frame);

    assert!(ping.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_builder_handler_answers_server_requests() {
    let server = FakeServer::new();
    let session = server
        .builder()
        .handler(
            ServiceType::SEND_MSG_TO_SESSION,
            |request: ServiceEnvelope, ctx: RequestContext| {
                assert_eq!(request.service_type, ServiceType::SendReceiver);
                ctx.respond(&"received")
            },
        )
        .start()
        .await
        .unwrap();

    let id = server.push(ServiceType::SendReceiver, &"hello");
    let reply = server.next_frame().await;
    assert_eq!(reply.mode, ServiceMode::Response);
    assert_eq!(reply.conversation_id, id);
    let body: String = topicwire_client::codec::MsgPackCodec::decode(&reply.payload).unwrap();
    assert_eq!(body, "received");

    assert!(session.deregister_handler(ServiceType::SendReceiver));
}

#[tokio::test]
async fn test_continuation_may_chain_requests() {
    let server = FakeServer::new();
    let session = server.session().await;
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let chained = session.clone();
    let recorded = Arc::clone(&outcomes);
    session
        .send_request(
            ServiceType::Fetch,
            b"",
            Box::new(ResponseCallback::ack(move |result| {
                assert!(result.is_ok());
                chained
                    .send_request(ServiceType::Fetch, b"second", tagged(&recorded, 2))
                    .unwrap();
            })),
        )
        .unwrap();

    let first = server.expect(ServiceType::Fetch).await;
    server.respond_empty(&first);
    let second = server.expect(ServiceType::Fetch).await;
    assert_eq!(&second.payload[..], b"second");
    server.respond_empty(&second);
    server.sync(&session).await;

    assert_eq!(*outcomes.lock(), vec![(2, Outcome::Response)]);
}
