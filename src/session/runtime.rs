//! Session runtime: delivery task, outbound path, and reconnection.
//!
//! All inbound traffic for a session, including connection loss and every
//! established connection, is funnelled through one unbounded channel and
//! handled by a single delivery task. Routing and callbacks therefore never
//! overlap, and a connection is only adopted after every event its
//! connector reported before handing it over.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::config::{ReconnectionConfig, SessionConfig};
use super::state::{SessionListener, SessionState, StateChange};
use crate::codec::MsgPackCodec;
use crate::conversation::{
    Continuation, ConversationId, ConversationRegistry, DiscardReason, OneshotContinuation,
};
use crate::error::{Result, SessionError};
use crate::features::messaging::RequestStreamRegistry;
use crate::features::notifications::NotificationRegistry;
use crate::features::session_properties::PropertiesRegistry;
use crate::features::update_source::UpdateSourceRegistry;
use crate::handler::{FrameSink, RequestContext, ServiceHandler, ServiceHandlerRegistry};
use crate::protocol::{ServiceEnvelope, ServiceMode, ServiceType};
use crate::transport::{Connection, Connector, DeliveryHandle, Transport, TransportError};

/// Events consumed by the delivery task.
pub(crate) enum Inbound {
    Frame { epoch: u64, frame: Bytes },
    Disconnected { epoch: u64, reason: String },
    /// The connection broke the framing rules. Not recoverable.
    ProtocolViolation { epoch: u64, reason: String },
    Connected {
        epoch: u64,
        connection: Connection,
        origin: Origin,
    },
    ReconnectFailed { reason: String },
    Close { ack: oneshot::Sender<()> },
}

/// Who established a connection, and what happens if it cannot be adopted.
pub(crate) enum Origin {
    /// `Session::start`, told whether the connection was adopted.
    Start(oneshot::Sender<bool>),
    /// The reconnection loop, resumed with its progress if the connection
    /// was lost before adoption.
    Reconnect(Retry),
}

/// Progress of one recovery.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Retry {
    started: Instant,
    attempts: u32,
}

impl Retry {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adoption {
    Adopted,
    /// The connection was reported lost before it could be adopted.
    Lost,
    /// Superseded, or the session no longer wants a connection.
    Unwanted,
}

/// Encodes a request payload when the request is transmitted.
///
/// Requests that name a registration use this so the payload carries the
/// id the server knows the registration by on the connection it is sent
/// over, not the one current when the request was made.
pub(crate) type BoundPayload = Box<dyn Fn(&SessionInner) -> Result<Bytes> + Send>;

enum Outbound {
    Frame(Bytes),
    Bound {
        id: ConversationId,
        service_type: ServiceType,
        encode: BoundPayload,
    },
}

impl Outbound {
    fn materialize(
        &self,
        inner: &SessionInner,
    ) -> std::result::Result<Bytes, (ConversationId, SessionError)> {
        match self {
            Outbound::Frame(frame) => Ok(frame.clone()),
            Outbound::Bound {
                id,
                service_type,
                encode,
            } => match encode(inner) {
                Ok(payload) => Ok(ServiceEnvelope::encode(
                    *service_type,
                    ServiceMode::Request,
                    *id,
                    &payload,
                )),
                Err(e) => Err((*id, e)),
            },
        }
    }
}

struct Link {
    state: SessionState,
    /// Generation of the current (or currently attempted) connection.
    epoch: u64,
    /// The attempt for `epoch` was reported lost before it was adopted.
    attempt_lost: bool,
    transport: Option<Arc<dyn Transport>>,
    /// Requests waiting for a usable transport, oldest first.
    queue: VecDeque<Outbound>,
    session_id: Option<String>,
}

impl Link {
    fn enqueue(&mut self, item: Outbound, max: usize) -> Result<()> {
        if self.queue.len() >= max {
            return Err(SessionError::QueueFull);
        }
        self.queue.push_back(item);
        Ok(())
    }

    /// Transmit queued requests in order. A request that fails to transmit
    /// stays queued; one whose payload cannot be bound is moved to
    /// `refused`.
    ///
    /// Bound payloads run under the link lock. They may take feature
    /// registry locks, which never wait on the link.
    fn flush(
        &mut self,
        inner: &SessionInner,
        refused: &mut Vec<(ConversationId, SessionError)>,
    ) -> std::result::Result<(), TransportError> {
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        while let Some(item) = self.queue.pop_front() {
            let frame = match item.materialize(inner) {
                Ok(frame) => frame,
                Err(refusal) => {
                    refused.push(refusal);
                    continue;
                }
            };
            if let Err(e) = transport.transmit(frame) {
                self.queue.push_front(item);
                return Err(e);
            }
        }
        Ok(())
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    link: Mutex<Link>,
    next_epoch: AtomicU64,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    connector: Arc<dyn Connector>,
    listeners: Mutex<Vec<Weak<dyn SessionListener>>>,
    closed_tx: watch::Sender<bool>,
    self_ref: Weak<SessionInner>,
    pub(crate) conversations: ConversationRegistry,
    pub(crate) handlers: ServiceHandlerRegistry,
    pub(crate) notifications: NotificationRegistry,
    pub(crate) update_sources: UpdateSourceRegistry,
    pub(crate) properties: PropertiesRegistry,
    pub(crate) request_streams: RequestStreamRegistry,
}

impl SessionInner {
    pub(crate) fn state(&self) -> SessionState {
        self.link.lock().state
    }

    /// Queue or transmit one outbound request.
    ///
    /// Between connections the request is queued when `hold` is set and
    /// dropped otherwise. Returns whether it was kept.
    fn push(&self, item: Outbound, hold: bool) -> Result<bool> {
        let max = self.config.max_outbound_queue;
        let mut refused = Vec::new();
        let flushed = {
            let mut link = self.link.lock();
            match link.state {
                SessionState::Closed => return Err(SessionError::SessionClosed),
                SessionState::Connecting | SessionState::Recovering => {
                    if !hold {
                        return Ok(false);
                    }
                    link.enqueue(item, max)?;
                    return Ok(true);
                }
                SessionState::Connected => {
                    link.enqueue(item, max)?;
                    link.flush(self, &mut refused).map_err(|e| (link.epoch, e))
                }
            }
        };

        self.refuse(refused);
        if let Err((epoch, e)) = flushed {
            self.report_disconnect(epoch, format!("transmit failed: {}", e));
        }
        Ok(true)
    }

    /// Queue or transmit one encoded frame.
    pub(crate) fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.push(Outbound::Frame(frame), true).map(|_| ())
    }

    /// Open a conversation and send its request.
    ///
    /// The continuation ends exactly once whatever happens. When an `Err` is
    /// returned it has already been discarded: with the sweep's reason if
    /// the session is closed, with `Cancelled` if the frame was refused.
    pub(crate) fn send_request(
        &self,
        service_type: ServiceType,
        payload: &[u8],
        continuation: Box<dyn Continuation>,
    ) -> Result<ConversationId> {
        let id = self.conversations.allocate();
        self.send_request_with_id(id, service_type, payload, continuation)?;
        Ok(id)
    }

    pub(crate) fn send_request_with_id(
        &self,
        id: ConversationId,
        service_type: ServiceType,
        payload: &[u8],
        continuation: Box<dyn Continuation>,
    ) -> Result<()> {
        self.conversations
            .open_reserved(id, service_type, continuation)?;

        let frame = ServiceEnvelope::encode(service_type, ServiceMode::Request, id, payload);
        if let Err(e) = self.send_frame(frame) {
            self.conversations.cancel(id, DiscardReason::Cancelled);
            return Err(e);
        }
        tracing::debug!(service = %service_type, conversation = %id, "Request sent");
        Ok(())
    }

    /// Like [`send_request`](Self::send_request), with the payload encoded
    /// at transmission. A payload that cannot be encoded then ends the
    /// conversation with `Cancelled`.
    pub(crate) fn send_bound_request(
        &self,
        service_type: ServiceType,
        encode: BoundPayload,
        continuation: Box<dyn Continuation>,
    ) -> Result<ConversationId> {
        let id = self.conversations.allocate();
        self.conversations
            .open_reserved(id, service_type, continuation)?;

        let item = Outbound::Bound {
            id,
            service_type,
            encode,
        };
        if let Err(e) = self.push(item, true) {
            self.conversations.cancel(id, DiscardReason::Cancelled);
            return Err(e);
        }
        tracing::debug!(service = %service_type, conversation = %id, "Bound request sent");
        Ok(id)
    }

    /// Send a request only if the session is connected. Otherwise the
    /// continuation is discarded with `Cancelled` and `None` returned.
    pub(crate) fn send_if_connected(
        &self,
        service_type: ServiceType,
        payload: &[u8],
        continuation: Box<dyn Continuation>,
    ) -> Result<Option<ConversationId>> {
        let id = self.conversations.allocate();
        self.conversations
            .open_reserved(id, service_type, continuation)?;

        let frame = ServiceEnvelope::encode(service_type, ServiceMode::Request, id, payload);
        match self.push(Outbound::Frame(frame), false) {
            Ok(true) => Ok(Some(id)),
            Ok(false) => {
                self.conversations.cancel(id, DiscardReason::Cancelled);
                Ok(None)
            }
            Err(e) => {
                self.conversations.cancel(id, DiscardReason::Cancelled);
                Err(e)
            }
        }
    }

    /// Transmit a registration replay on the connection being adopted,
    /// ahead of everything queued while it was down.
    ///
    /// Only called from [`on_connected`](Self::on_connected).
    pub(crate) fn replay_request(
        &self,
        id: ConversationId,
        service_type: ServiceType,
        payload: &[u8],
        continuation: Box<dyn Continuation>,
    ) -> Result<()> {
        self.conversations
            .open_reserved(id, service_type, continuation)?;

        let frame = ServiceEnvelope::encode(service_type, ServiceMode::Request, id, payload);
        let sent = {
            let link = self.link.lock();
            match link.transport.as_ref() {
                Some(transport) => transport.transmit(frame).map_err(|e| Some((link.epoch, e))),
                None => Err(None),
            }
        };

        match sent {
            Ok(()) => {
                tracing::debug!(service = %service_type, conversation = %id, "Replay sent");
                Ok(())
            }
            Err(failure) => {
                self.conversations.cancel(id, DiscardReason::ConnectionLost);
                match failure {
                    Some((epoch, e)) => {
                        self.report_disconnect(epoch, format!("transmit failed: {}", e));
                        Err(SessionError::Transport(e))
                    }
                    None => Err(SessionError::Transport(TransportError::Closed)),
                }
            }
        }
    }

    fn refuse(&self, refused: Vec<(ConversationId, SessionError)>) {
        for (id, error) in refused {
            tracing::debug!(conversation = %id, %error, "Queued request no longer applies");
            self.conversations.cancel(id, DiscardReason::Cancelled);
        }
    }

    fn report_disconnect(&self, epoch: u64, reason: String) {
        let _ = self
            .inbound_tx
            .send(Inbound::Disconnected { epoch, reason });
    }

    fn frame_sink(&self) -> Weak<dyn FrameSink> {
        let weak: Weak<SessionInner> = self.self_ref.clone();
        weak
    }

    fn notify_state(&self, old: SessionState, new: SessionState) {
        tracing::debug!(%old, %new, "Session state changed");
        let live: Vec<Arc<dyn SessionListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.on_event(StateChange { old, new });
        }
    }

    /// Start a connection attempt: allocate and record its epoch.
    ///
    /// Returns `None` when the session no longer wants a connection.
    fn begin_attempt(&self) -> Option<u64> {
        let mut link = self.link.lock();
        match link.state {
            SessionState::Connecting | SessionState::Recovering => {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                link.epoch = epoch;
                link.attempt_lost = false;
                Some(epoch)
            }
            _ => None,
        }
    }

    /// Adopt an established connection.
    ///
    /// After a recovery every registration is replayed before anything
    /// queued is flushed, so queued requests that name a registration are
    /// bound to its replayed id.
    fn on_connected(self: &Arc<Self>, epoch: u64, connection: Connection) -> Adoption {
        let recovering = {
            let mut link = self.link.lock();
            if link.epoch != epoch || !link.state.can_transition_to(SessionState::Connected) {
                drop(link);
                tracing::debug!(epoch, "Discarding connection the session no longer wants");
                connection.transport.close();
                return Adoption::Unwanted;
            }
            if link.attempt_lost {
                drop(link);
                tracing::warn!(epoch, "Connection lost before it was adopted");
                connection.transport.close();
                return Adoption::Lost;
            }
            link.transport = Some(connection.transport);
            if connection.session_id.is_some() {
                link.session_id = connection.session_id;
            }
            link.state == SessionState::Recovering
        };

        if recovering {
            let session = Session {
                inner: Arc::clone(self),
            };
            self.notifications.replay(&session);
            self.update_sources.replay(&session);
            self.properties.replay(&session);
        }

        let mut refused = Vec::new();
        let (old, flushed) = {
            let mut link = self.link.lock();
            if link.epoch != epoch || link.state.is_closed() {
                return Adoption::Unwanted;
            }
            let old = link.state;
            link.state = SessionState::Connected;
            let flushed = link.flush(self, &mut refused).map_err(|e| (link.epoch, e));
            (old, flushed)
        };

        self.notify_state(old, SessionState::Connected);
        self.refuse(refused);
        if let Err((epoch, e)) = flushed {
            self.report_disconnect(epoch, format!("transmit failed: {}", e));
        }
        Adoption::Adopted
    }

    fn on_disconnected(self: &Arc<Self>, epoch: u64, reason: String) {
        let transport = {
            let mut link = self.link.lock();
            if link.epoch != epoch {
                tracing::debug!(epoch, %reason, "Ignoring stale disconnect");
                return;
            }
            match link.state {
                SessionState::Connected => {}
                SessionState::Connecting | SessionState::Recovering => {
                    // The connection for this attempt is not adopted yet.
                    tracing::debug!(epoch, %reason, "Attempt lost before adoption");
                    link.attempt_lost = true;
                    return;
                }
                SessionState::Closed => return,
            }
            if !self.config.reconnection.enabled {
                None
            } else {
                link.state = SessionState::Recovering;
                link.transport.take()
            }
        };

        if !self.config.reconnection.enabled {
            tracing::warn!(%reason, "Connection lost, reconnection disabled");
            self.shutdown(DiscardReason::ConnectionLost);
            return;
        }

        tracing::warn!(%reason, "Connection lost, recovering");
        if let Some(transport) = transport {
            transport.close();
        }
        self.notify_state(SessionState::Connected, SessionState::Recovering);
        tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            self.config.reconnection.clone(),
            Retry::new(),
        ));
    }

    fn on_protocol_error(&self, epoch: u64, reason: String) {
        {
            let link = self.link.lock();
            if link.epoch != epoch || link.state.is_closed() {
                tracing::debug!(epoch, %reason, "Ignoring framing error of old connection");
                return;
            }
        }
        self.protocol_violation(SessionError::Protocol(reason));
    }

    fn on_frame(&self, epoch: u64, frame: Bytes) {
        {
            let link = self.link.lock();
            if link.epoch != epoch || link.state.is_closed() {
                tracing::debug!(
                    epoch,
                    current = link.epoch,
                    "Dropping frame from superseded connection"
                );
                return;
            }
        }

        let envelope =
            match ServiceEnvelope::decode_with_limit(frame, self.config.max_payload_size) {
                Ok(envelope) => envelope,
                Err(e) => return self.protocol_violation(e),
            };

        if envelope.mode.is_reply() {
            self.conversations.resolve(envelope);
            return;
        }

        let ctx = RequestContext::with_sink(
            envelope.service_type,
            envelope.conversation_id,
            self.frame_sink(),
        );
        let service_type = envelope.service_type;
        if let Err(e) = self.handlers.dispatch(envelope, ctx) {
            if e.is_fatal() {
                self.protocol_violation(e);
            } else {
                tracing::warn!(
                    service = %service_type,
                    error = %e,
                    "Inbound request handler failed"
                );
            }
        }
    }

    fn protocol_violation(&self, error: SessionError) {
        tracing::error!(error = %error, "Protocol violation, closing session");
        self.shutdown(DiscardReason::ProtocolViolation);
    }

    /// Move to Closed and release everything. Idempotent.
    pub(crate) fn shutdown(&self, reason: DiscardReason) {
        let (old, transport) = {
            let mut link = self.link.lock();
            if link.state.is_closed() {
                return;
            }
            let old = link.state;
            link.state = SessionState::Closed;
            link.queue.clear();
            (old, link.transport.take())
        };

        if let Some(transport) = transport {
            transport.close();
        }
        self.notify_state(old, SessionState::Closed);

        let discarded = self.conversations.discard_all(reason);
        self.notifications.close_all();
        self.update_sources.close_all();
        self.properties.close_all();
        self.request_streams.close_all();
        self.handlers.clear();
        tracing::debug!(%reason, discarded, "Session closed");

        let _ = self.closed_tx.send(true);
    }
}

impl FrameSink for SessionInner {
    fn send_frame(&self, frame: Bytes) -> Result<()> {
        SessionInner::send_frame(self, frame)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown(DiscardReason::SessionClosed);
    }
}

fn raw_payload(bytes: &[u8]) -> Result<Bytes> {
    Ok(Bytes::copy_from_slice(bytes))
}

/// Single consumer of a session's inbound events.
async fn delivery_loop(session: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };

        match event {
            Inbound::Frame { epoch, frame } => inner.on_frame(epoch, frame),
            Inbound::Disconnected { epoch, reason } => inner.on_disconnected(epoch, reason),
            Inbound::ProtocolViolation { epoch, reason } => {
                inner.on_protocol_error(epoch, reason)
            }
            Inbound::Connected {
                epoch,
                connection,
                origin,
            } => {
                let adoption = inner.on_connected(epoch, connection);
                match origin {
                    Origin::Start(adopted) => {
                        let _ = adopted.send(adoption == Adoption::Adopted);
                    }
                    Origin::Reconnect(retry) => {
                        if adoption == Adoption::Lost {
                            tokio::spawn(reconnect_loop(
                                Arc::downgrade(&inner),
                                inner.config.reconnection.clone(),
                                retry,
                            ));
                        }
                    }
                }
            }
            Inbound::ReconnectFailed { reason } => {
                if inner.state() == SessionState::Recovering {
                    tracing::error!(%reason, "Reconnection failed, closing session");
                    inner.shutdown(DiscardReason::ConnectionLost);
                }
            }
            Inbound::Close { ack } => {
                inner.shutdown(DiscardReason::SessionClosed);
                let _ = ack.send(());
            }
        }

        if inner.state().is_closed() {
            break;
        }
    }
    tracing::debug!("Delivery task finished");
}

/// Attempt connections until one is handed to the delivery task or the
/// timeout passes. The first attempt of a recovery is immediate.
async fn reconnect_loop(
    session: Weak<SessionInner>,
    config: ReconnectionConfig,
    mut retry: Retry,
) {
    loop {
        if retry.attempts > 0 {
            if retry.started.elapsed() + config.interval > config.timeout {
                if let Some(inner) = session.upgrade() {
                    let _ = inner.inbound_tx.send(Inbound::ReconnectFailed {
                        reason: format!("gave up after {} attempts", retry.attempts),
                    });
                }
                return;
            }
            tokio::time::sleep(config.interval).await;
        }
        retry.attempts += 1;

        let (epoch, delivery, connector, tx) = {
            let Some(inner) = session.upgrade() else {
                return;
            };
            let Some(epoch) = inner.begin_attempt() else {
                return;
            };
            (
                epoch,
                DeliveryHandle::new(inner.inbound_tx.clone(), epoch),
                Arc::clone(&inner.connector),
                inner.inbound_tx.clone(),
            )
        };

        match connector.connect(delivery).await {
            Ok(connection) => {
                tracing::debug!(attempt = retry.attempts, epoch, "Reconnected");
                let _ = tx.send(Inbound::Connected {
                    epoch,
                    connection,
                    origin: Origin::Reconnect(retry),
                });
                return;
            }
            Err(e) => {
                tracing::warn!(attempt = retry.attempts, error = %e, "Reconnection attempt failed");
            }
        }
    }
}

/// A logical connection to the server.
///
/// Cheap to clone; all clones drive the same session. The session closes
/// when [`close`](Session::close) is called, when the connection is lost
/// beyond recovery, or when the last clone is dropped.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> super::SessionBuilder {
        super::SessionBuilder::new()
    }

    pub(crate) async fn start(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        handlers: ServiceHandlerRegistry,
        listeners: Vec<Weak<dyn SessionListener>>,
    ) -> Result<Session> {
        config.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|self_ref| SessionInner {
            config,
            link: Mutex::new(Link {
                state: SessionState::Connecting,
                epoch: 0,
                attempt_lost: false,
                transport: None,
                queue: VecDeque::new(),
                session_id: None,
            }),
            next_epoch: AtomicU64::new(1),
            inbound_tx,
            connector,
            listeners: Mutex::new(listeners),
            closed_tx,
            self_ref: self_ref.clone(),
            conversations: ConversationRegistry::new(),
            handlers,
            notifications: NotificationRegistry::new(),
            update_sources: UpdateSourceRegistry::new(),
            properties: PropertiesRegistry::new(),
            request_streams: RequestStreamRegistry::new(),
        });
        let session = Session { inner };

        crate::features::install_handlers(&session);
        tokio::spawn(delivery_loop(Arc::downgrade(&session.inner), inbound_rx));

        let epoch = session
            .inner
            .begin_attempt()
            .ok_or(SessionError::SessionClosed)?;
        let delivery = DeliveryHandle::new(session.inner.inbound_tx.clone(), epoch);
        match session.inner.connector.connect(delivery).await {
            Ok(connection) => {
                let (adopted_tx, adopted) = oneshot::channel();
                let _ = session.inner.inbound_tx.send(Inbound::Connected {
                    epoch,
                    connection,
                    origin: Origin::Start(adopted_tx),
                });
                if adopted.await.unwrap_or(false) {
                    return Ok(session);
                }
                tracing::error!("Initial connection lost before it was adopted");
                session.inner.shutdown(DiscardReason::ConnectionLost);
                Err(SessionError::Transport(TransportError::Connect(
                    "connection lost during handshake".to_string(),
                )))
            }
            Err(e) => {
                tracing::error!(error = %e, "Initial connection failed");
                session.inner.shutdown(DiscardReason::ConnectionLost);
                Err(SessionError::Transport(e))
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Server-assigned session id, when the connector reported one.
    pub fn session_id(&self) -> Option<String> {
        self.inner.link.lock().session_id.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Conversations still waiting for a reply.
    pub fn pending_conversations(&self) -> usize {
        self.inner.conversations.pending_count()
    }

    /// Frames held while the session has no usable connection.
    pub fn queued_frames(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    /// Send a request and decode its MessagePack response.
    pub async fn request<Req, Resp>(
        &self,
        service_type: ServiceType,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let payload = MsgPackCodec::encode(request)?;
        self.call(service_type, &payload, MsgPackCodec::decode::<Resp>)
            .await
    }

    /// Send a request with a raw payload and return the raw response.
    pub async fn request_raw(&self, service_type: ServiceType, payload: &[u8]) -> Result<Bytes> {
        self.call(service_type, payload, raw_payload).await
    }

    /// Send a request whose outcome goes to `continuation`.
    pub fn send_request(
        &self,
        service_type: ServiceType,
        payload: &[u8],
        continuation: Box<dyn Continuation>,
    ) -> Result<ConversationId> {
        self.inner.send_request(service_type, payload, continuation)
    }

    pub(crate) async fn call<T: Send + 'static>(
        &self,
        service_type: ServiceType,
        payload: &[u8],
        decode: crate::conversation::Decoder<T>,
    ) -> Result<T> {
        let (continuation, response) = OneshotContinuation::channel(decode);
        self.inner
            .send_request(service_type, payload, Box::new(continuation))?;
        response.await
    }

    /// [`call`](Self::call) with the payload encoded at transmission.
    pub(crate) async fn call_bound<T: Send + 'static>(
        &self,
        service_type: ServiceType,
        encode: BoundPayload,
        decode: crate::conversation::Decoder<T>,
    ) -> Result<T> {
        let (continuation, response) = OneshotContinuation::channel(decode);
        self.inner
            .send_bound_request(service_type, encode, Box::new(continuation))?;
        response.await
    }

    /// [`call`](Self::call) if connected. Resolves to `None` without
    /// contacting the server otherwise.
    pub(crate) async fn call_if_connected<T: Send + 'static>(
        &self,
        service_type: ServiceType,
        payload: &[u8],
        decode: crate::conversation::Decoder<T>,
    ) -> Result<Option<T>> {
        let (continuation, response) = OneshotContinuation::channel(decode);
        match self
            .inner
            .send_if_connected(service_type, payload, Box::new(continuation))?
        {
            Some(_) => response.await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle server-initiated requests for `service_type`.
    pub fn register_handler<H: ServiceHandler>(
        &self,
        service_type: ServiceType,
        handler: H,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        self.inner.handlers.register(service_type, handler)
    }

    pub fn deregister_handler(&self, service_type: ServiceType) -> bool {
        self.inner.handlers.deregister(service_type)
    }

    /// Observe state changes. Held weakly.
    pub fn add_listener<L: SessionListener>(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn SessionListener> = weak;
        self.inner.listeners.lock().push(weak);
    }

    /// Close the session. Resolves once every pending conversation has been
    /// discarded and every registration has been closed. Idempotent.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.inbound_tx.send(Inbound::Close { ack }).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Resolves once the session is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Wait until the session is closed or `timeout` elapses. Returns
    /// whether the session closed.
    pub async fn closed_within(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.closed()).await.is_ok()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}
