//! In-process fake server for session tests.
//!
//! `FakeServer::connector()` hands the session a loopback connector. Frames
//! the client transmits are decoded and queued for the test; frames the test
//! sends are delivered through the session's current `DeliveryHandle`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use topicwire_client::codec::MsgPackCodec;
use topicwire_client::listener::{DiscardSink, ErrorSink, Observer};
use topicwire_client::protocol::{ServiceEnvelope, ServiceMode, ServiceType};
use topicwire_client::transport::{
    BoxFuture, Connection, Connector, DeliveryHandle, Transport, TransportError,
};
use topicwire_client::{ConversationId, DiscardReason, ServiceError, Session, SessionBuilder};

const WAIT: Duration = Duration::from_secs(5);

struct LoopbackTransport {
    outbound: mpsc::UnboundedSender<ServiceEnvelope>,
    broken: AtomicBool,
}

impl Transport for LoopbackTransport {
    fn transmit(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let envelope = ServiceEnvelope::decode(frame).expect("client sent a malformed frame");
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

struct Link {
    delivery: DeliveryHandle,
    transport: Arc<LoopbackTransport>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<ServiceEnvelope>,
    link: Mutex<Option<Link>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
    session_id: Mutex<Option<String>>,
}

struct LoopbackConnector {
    shared: Arc<Shared>,
}

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        delivery: DeliveryHandle,
    ) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.connects.fetch_add(1, Ordering::SeqCst);
            if shared.refuse.load(Ordering::Acquire) {
                return Err(TransportError::Connect("refused".to_string()));
            }
            let transport = Arc::new(LoopbackTransport {
                outbound: shared.outbound.clone(),
                broken: AtomicBool::new(false),
            });
            *shared.link.lock() = Some(Link {
                delivery,
                transport: Arc::clone(&transport),
            });
            let connection = Connection::new(transport);
            Ok(match shared.session_id.lock().clone() {
                Some(id) => connection.with_session_id(id),
                None => connection,
            })
        })
    }
}

/// The server side of one or more loopback connections.
pub struct FakeServer {
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServiceEnvelope>>,
    /// Frames read past by `sync`, returned first by `next_frame`.
    stash: Mutex<VecDeque<ServiceEnvelope>>,
    next_push_id: AtomicU64,
}

impl FakeServer {
    pub fn new() -> Self {
        let (outbound, inbound) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                outbound,
                link: Mutex::new(None),
                refuse: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                session_id: Mutex::new(None),
            }),
            inbound: tokio::sync::Mutex::new(inbound),
            stash: Mutex::new(VecDeque::new()),
            next_push_id: AtomicU64::new(1_000_000),
        }
    }

    pub fn connector(&self) -> impl Connector {
        LoopbackConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Builder preconfigured with this server's connector and fast
    /// reconnection.
    pub fn builder(&self) -> SessionBuilder {
        Session::builder()
            .connector(self.connector())
            .reconnection_interval(Duration::from_millis(20))
            .reconnection_timeout(Duration::from_secs(2))
    }

    pub async fn session(&self) -> Session {
        self.builder().start().await.expect("session start")
    }

    pub fn set_session_id(&self, id: &str) {
        *self.shared.session_id.lock() = Some(id.to_string());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::Release);
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Next frame the client sent, of any kind.
    pub async fn next_frame(&self) -> ServiceEnvelope {
        if let Some(frame) = self.stash.lock().pop_front() {
            return frame;
        }
        self.recv().await
    }

    async fn recv(&self) -> ServiceEnvelope {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(WAIT, inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server channel closed")
    }

    /// Next frame, which must be a request for `service_type`.
    pub async fn expect(&self, service_type: ServiceType) -> ServiceEnvelope {
        let frame = self.next_frame().await;
        assert_eq!(frame.service_type, service_type, "unexpected frame {:?}", frame);
        assert_eq!(frame.mode, ServiceMode::Request);
        frame
    }

    /// Assert the client sends nothing for `within`.
    pub async fn expect_silence(&self, within: Duration) {
        if let Some(frame) = self.stash.lock().pop_front() {
            panic!("unexpected client frame {:?}", frame);
        }
        let mut inbound = self.inbound.lock().await;
        if let Ok(Some(frame)) = tokio::time::timeout(within, inbound.recv()).await {
            panic!("unexpected client frame {:?}", frame);
        }
    }

    pub fn deliver(&self, frame: Bytes) {
        let link = self.shared.link.lock();
        let link = link.as_ref().expect("no connection");
        link.delivery.deliver(frame);
    }

    pub fn respond<T: Serialize>(&self, request: &ServiceEnvelope, body: &T) {
        let payload = MsgPackCodec::encode(body).unwrap();
        self.deliver(request.response(&payload));
    }

    pub fn respond_empty(&self, request: &ServiceEnvelope) {
        self.deliver(request.response(&[]));
    }

    pub fn respond_error(&self, request: &ServiceEnvelope, error: ServiceError) {
        let payload = MsgPackCodec::encode(&error).unwrap();
        self.deliver(request.error(&payload));
    }

    /// Send a server-initiated request. Returns its conversation id.
    pub fn push<T: Serialize>(&self, service_type: ServiceType, body: &T) -> ConversationId {
        let id = ConversationId::new(self.next_push_id.fetch_add(1, Ordering::Relaxed));
        let payload = MsgPackCodec::encode(body).unwrap();
        self.deliver(ServiceEnvelope::encode(
            service_type,
            ServiceMode::Request,
            id,
            &payload,
        ));
        id
    }

    /// Break the current connection and report it lost.
    pub fn drop_connection(&self) {
        let link = self.shared.link.lock().take().expect("no connection");
        link.transport.broken.store(true, Ordering::Release);
        link.delivery.disconnected("dropped by test");
    }

    /// Break the current connection without telling the session. The next
    /// transmit fails.
    pub fn break_silently(&self) {
        let link = self.shared.link.lock();
        let link = link.as_ref().expect("no connection");
        link.transport.broken.store(true, Ordering::Release);
    }

    /// Wait until every frame delivered so far has been routed.
    pub async fn sync(&self, session: &Session) {
        let ping = {
            let session = session.clone();
            tokio::spawn(async move { session.ping_server().await })
        };
        loop {
            let frame = self.recv().await;
            if frame.service_type == ServiceType::PingUser && frame.mode == ServiceMode::Request {
                self.respond_empty(&frame);
                break;
            }
            self.stash.lock().push_back(frame);
        }
        ping.await.unwrap().expect("sync ping");
    }
}

/// Records everything a listener is told.
pub struct Recorder<E> {
    pub events: Mutex<Vec<E>>,
    pub errors: Mutex<Vec<ServiceError>>,
    pub discards: Mutex<Vec<DiscardReason>>,
}

impl<E> Recorder<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            discards: Mutex::new(Vec::new()),
        })
    }
}

impl<E: Clone> Recorder<E> {
    pub fn events(&self) -> Vec<E> {
        self.events.lock().clone()
    }
}

impl<E: Send + 'static> Observer<E> for Recorder<E> {
    fn on_event(&self, event: E) {
        self.events.lock().push(event);
    }
}

impl<E: Send + 'static> ErrorSink for Recorder<E> {
    fn on_error(&self, error: &ServiceError) {
        self.errors.lock().push(error.clone());
    }
}

impl<E: Send + 'static> DiscardSink for Recorder<E> {
    fn on_discard(&self, reason: DiscardReason) {
        self.discards.lock().push(reason);
    }
}

/// Poll `condition` until it holds or the wait expires.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
