//! Session states, recovery, queueing and session-properties listeners.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{eventually, FakeServer, Recorder};
use topicwire_client::codec::MsgPackCodec;
use topicwire_client::conversation::ResponseCallback;
use topicwire_client::features::session_properties::{
    PropertiesUpdateType, PropertySelector, SessionPropertiesEvent, SessionPropertiesEventType,
};
use topicwire_client::listener::Observer;
use topicwire_client::protocol::{FrameBuffer, Header, ServiceEnvelope, ServiceMode, ServiceType};
use topicwire_client::session::StateChange;
use topicwire_client::transport::{
    BoxFuture, Connection, Connector, DeliveryHandle, TcpConnector, TransportError,
};
use topicwire_client::{DiscardReason, Session, SessionError, SessionState};

#[derive(Default)]
struct States {
    changes: Mutex<Vec<(SessionState, SessionState)>>,
}

impl Observer<StateChange> for States {
    fn on_event(&self, change: StateChange) {
        self.changes.lock().push((change.old, change.new));
    }
}

impl States {
    fn seen(&self) -> Vec<(SessionState, SessionState)> {
        self.changes.lock().clone()
    }
}

type Outcomes = Arc<Mutex<Vec<topicwire_client::Result<()>>>>;

fn ack_into(outcomes: &Outcomes) -> Box<ResponseCallback<()>> {
    let outcomes = Arc::clone(outcomes);
    Box::new(ResponseCallback::ack(move |result| {
        outcomes.lock().push(result)
    }))
}

/// Wraps a connector and reports the connection lost on one attempt, before
/// the attempt has even returned.
struct LosingConnector<C> {
    inner: C,
    attempts: AtomicUsize,
    lose_on: usize,
}

impl<C: Connector> LosingConnector<C> {
    fn new(inner: C, lose_on: usize) -> Self {
        Self {
            inner,
            attempts: AtomicUsize::new(0),
            lose_on,
        }
    }
}

impl<C: Connector> Connector for LosingConnector<C> {
    fn connect(
        &self,
        delivery: DeliveryHandle,
    ) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.lose_on {
            delivery.disconnected("lost during handshake");
        }
        self.inner.connect(delivery)
    }
}

#[tokio::test]
async fn test_state_sequence_through_recovery() {
    use SessionState::*;

    let server = FakeServer::new();
    let states = Arc::new(States::default());
    let session = server.builder().listener(&states).start().await.unwrap();
    assert_eq!(session.state(), Connected);

    server.drop_connection();
    eventually(|| states.seen().len() == 3).await;
    assert_eq!(server.connection_count(), 2);

    session.close().await;
    assert_eq!(
        states.seen(),
        vec![
            (Connecting, Connected),
            (Connected, Recovering),
            (Recovering, Connected),
            (Connected, Closed),
        ]
    );
}

#[tokio::test]
async fn test_session_id_reported() {
    let server = FakeServer::new();
    server.set_session_id("0123456789abcdef-0000000000000001");
    let session = server.session().await;
    assert_eq!(
        session.session_id().as_deref(),
        Some("0123456789abcdef-0000000000000001")
    );
}

#[tokio::test]
async fn test_initial_connection_failure() {
    let server = FakeServer::new();
    server.refuse_connections(true);

    let result = server.builder().start().await;
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_missing_connector_rejected() {
    let result = Session::builder().start().await;
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_requests_queued_while_recovering() {
    let server = FakeServer::new();
    let states = Arc::new(States::default());
    let session = server.builder().listener(&states).start().await.unwrap();

    server.refuse_connections(true);
    server.drop_connection();
    eventually(|| session.state() == SessionState::Recovering).await;

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    session
        .send_request(ServiceType::Fetch, b"first", ack_into(&outcomes))
        .unwrap();
    session
        .send_request(ServiceType::Fetch, b"second", ack_into(&outcomes))
        .unwrap();
    assert_eq!(session.queued_frames(), 2);
    assert_eq!(session.pending_conversations(), 2);

    server.refuse_connections(false);
    let first = server.expect(ServiceType::Fetch).await;
    let second = server.expect(ServiceType::Fetch).await;
    assert_eq!(&first.payload[..], b"first");
    assert_eq!(&second.payload[..], b"second");
    assert_eq!(session.queued_frames(), 0);

    server.respond_empty(&first);
    server.respond_empty(&second);
    eventually(|| outcomes.lock().len() == 2).await;
    assert!(outcomes.lock().iter().all(|r| r.is_ok()));
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_queue_limit() {
    let server = FakeServer::new();
    let session = server
        .builder()
        .max_outbound_queue(2)
        .start()
        .await
        .unwrap();

    server.refuse_connections(true);
    server.drop_connection();
    eventually(|| session.state() == SessionState::Recovering).await;

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        session
            .send_request(ServiceType::Fetch, b"", ack_into(&outcomes))
            .unwrap();
    }
    let refused = session.send_request(ServiceType::Fetch, b"", ack_into(&outcomes));
    assert!(matches!(refused, Err(SessionError::QueueFull)));

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        Err(SessionError::Discarded(DiscardReason::Cancelled))
    ));
}

#[tokio::test]
async fn test_failed_transmit_triggers_recovery() {
    let server = FakeServer::new();
    let session = server.session().await;

    server.break_silently();
    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.request_raw(ServiceType::Fetch, b"kept").await })
    };

    // The frame that failed to go out is sent on the new connection.
    let request = server.expect(ServiceType::Fetch).await;
    assert_eq!(&request.payload[..], b"kept");
    server.respond(&request, &"done");
    pending.await.unwrap().unwrap();
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn test_reconnection_timeout_closes_session() {
    let server = FakeServer::new();
    let states = Arc::new(States::default());
    let session = server
        .builder()
        .reconnection_timeout(Duration::from_millis(100))
        .listener(&states)
        .start()
        .await
        .unwrap();

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    session
        .send_request(ServiceType::Fetch, b"", ack_into(&outcomes))
        .unwrap();
    server.expect(ServiceType::Fetch).await;

    server.refuse_connections(true);
    server.drop_connection();

    assert!(session.closed_within(Duration::from_secs(5)).await);
    assert!(server.connection_count() >= 2);
    assert_eq!(
        states.seen().last(),
        Some(&(SessionState::Recovering, SessionState::Closed))
    );
    assert!(matches!(
        outcomes.lock()[..],
        [Err(SessionError::Discarded(DiscardReason::ConnectionLost))]
    ));
}

#[tokio::test]
async fn test_connection_loss_without_reconnection() {
    let server = FakeServer::new();
    let session = server.builder().no_reconnection().start().await.unwrap();

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    session
        .send_request(ServiceType::Fetch, b"", ack_into(&outcomes))
        .unwrap();
    server.expect(ServiceType::Fetch).await;
    server.drop_connection();

    assert!(session.closed_within(Duration::from_secs(5)).await);
    assert_eq!(server.connection_count(), 1);
    assert!(matches!(
        outcomes.lock()[..],
        [Err(SessionError::Discarded(DiscardReason::ConnectionLost))]
    ));
}

#[tokio::test]
async fn test_dropping_last_handle_closes() {
    let server = FakeServer::new();
    let session = server.session().await;
    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    session
        .send_request(ServiceType::Fetch, b"", ack_into(&outcomes))
        .unwrap();

    drop(session);
    eventually(|| outcomes.lock().len() == 1).await;
    assert!(matches!(
        outcomes.lock()[..],
        [Err(SessionError::Discarded(DiscardReason::SessionClosed))]
    ));
}

#[derive(Debug, Deserialize)]
struct PropertiesRegistration {
    selectors: Vec<String>,
}

#[derive(Serialize)]
struct PropertiesEvent<'a> {
    registration: u64,
    event_type: u8,
    session_id: &'a str,
    properties: std::collections::HashMap<&'a str, &'a str>,
    update_type: Option<u8>,
    close_reason: Option<&'a str>,
}

#[tokio::test]
async fn test_session_properties_listener() {
    let server = FakeServer::new();
    let session = server.session().await;
    let listener = Recorder::<SessionPropertiesEvent>::new();

    let pending = {
        let session = session.clone();
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            session
                .add_session_properties_listener(
                    vec![PropertySelector::AllFixed, PropertySelector::named("Department")],
                    &listener,
                )
                .await
        })
    };
    let request = server
        .expect(ServiceType::SessionPropertiesRegistration2)
        .await;
    let body: PropertiesRegistration = MsgPackCodec::decode(&request.payload).unwrap();
    assert_eq!(body.selectors, vec!["*F".to_string(), "Department".to_string()]);
    server.respond_empty(&request);
    let registration = pending.await.unwrap().unwrap();
    let wire = request.conversation_id.get();

    let mut properties = std::collections::HashMap::new();
    properties.insert("Department", "Accounts");
    // The older service id is routed to the same listener.
    server.push(
        ServiceType::SessionPropertiesEvent,
        &PropertiesEvent {
            registration: wire,
            event_type: SessionPropertiesEventType::Open as u8,
            session_id: "peer",
            properties: properties.clone(),
            update_type: None,
            close_reason: None,
        },
    );
    server.push(
        ServiceType::SessionPropertiesEvent2,
        &PropertiesEvent {
            registration: wire,
            event_type: SessionPropertiesEventType::Update as u8,
            session_id: "peer",
            properties,
            update_type: Some(PropertiesUpdateType::Updated as u8),
            close_reason: None,
        },
    );
    server.sync(&session).await;

    let events = listener.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], SessionPropertiesEvent::Registered);
    match &events[1] {
        SessionPropertiesEvent::Session(update) => {
            assert_eq!(update.event_type, SessionPropertiesEventType::Open);
            assert_eq!(update.session_id, "peer");
            assert_eq!(update.properties["Department"], "Accounts");
        }
        other => panic!("unexpected event {:?}", other),
    }
    match &events[2] {
        SessionPropertiesEvent::Session(update) => {
            assert_eq!(update.update_type, Some(PropertiesUpdateType::Updated));
        }
        other => panic!("unexpected event {:?}", other),
    }

    registration.close();
    registration.close();
    assert!(!registration.is_active());
    assert_eq!(listener.events().last(), Some(&SessionPropertiesEvent::Closed));
}

#[tokio::test]
async fn test_session_properties_requires_selectors() {
    let server = FakeServer::new();
    let session = server.session().await;
    let listener = Recorder::<SessionPropertiesEvent>::new();

    assert!(matches!(
        session.add_session_properties_listener(Vec::new(), &listener).await,
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(
        session
            .add_session_properties_listener(vec![PropertySelector::named("")], &listener)
            .await,
        Err(SessionError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending a request");
            if let Some(frame) = frames.push(&buf[..n]).unwrap().into_iter().next() {
                let request = ServiceEnvelope::decode(frame).unwrap();
                assert_eq!(request.mode, ServiceMode::Request);
                let payload = MsgPackCodec::encode(&"pong").unwrap();
                stream.write_all(&request.response(&payload)).await.unwrap();
                return request.service_type;
            }
        }
    });

    let session = Session::builder()
        .connector(TcpConnector::new(addr))
        .no_reconnection()
        .start()
        .await
        .unwrap();
    let reply: String = session
        .request(ServiceType::Fetch, &"ping")
        .await
        .unwrap();

    assert_eq!(reply, "pong");
    assert_eq!(server.await.unwrap(), ServiceType::Fetch);
    session.close().await;
}

#[tokio::test]
async fn test_connection_lost_while_recovering_retries() {
    use SessionState::*;

    let server = FakeServer::new();
    let states = Arc::new(States::default());
    let session = server
        .builder()
        .connector(LosingConnector::new(server.connector(), 2))
        .listener(&states)
        .start()
        .await
        .unwrap();

    server.drop_connection();
    eventually(|| states.seen().len() == 3).await;
    assert_eq!(server.connection_count(), 3);
    assert_eq!(session.state(), Connected);

    // The session is usable on the third connection.
    server.sync(&session).await;
    session.close().await;
    assert_eq!(
        states.seen(),
        vec![
            (Connecting, Connected),
            (Connected, Recovering),
            (Recovering, Connected),
            (Connected, Closed),
        ]
    );
}

#[tokio::test]
async fn test_connection_lost_during_start_fails_start() {
    let server = FakeServer::new();
    let result = server
        .builder()
        .connector(LosingConnector::new(server.connector(), 1))
        .start()
        .await;

    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_oversized_header_closes_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending a request");
            if let Some(frame) = frames.push(&buf[..n]).unwrap().into_iter().next() {
                let request = ServiceEnvelope::decode(frame).unwrap();
                let header = Header::new(
                    ServiceType::Fetch.id(),
                    ServiceMode::Response as u8,
                    request.conversation_id.get(),
                    1024,
                );
                stream.write_all(&header.encode()).await.unwrap();
                break;
            }
        }
        // A framing error is not a lost connection: nobody reconnects.
        let reconnected = tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_ok();
        drop(stream);
        reconnected
    });

    let session = Session::builder()
        .connector(TcpConnector::new(addr).with_max_payload_size(64))
        .reconnection_interval(Duration::from_millis(20))
        .start()
        .await
        .unwrap();
    let result: topicwire_client::Result<String> =
        session.request(ServiceType::Fetch, &"ping").await;

    assert!(matches!(
        result,
        Err(SessionError::Discarded(DiscardReason::ProtocolViolation))
    ));
    session.closed().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!server.await.unwrap());
}
