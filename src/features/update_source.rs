//! Update sources.
//!
//! An update source claims a topic branch so the client can supply values
//! for it. Its state is driven by the server:
//!
//! ```text
//! Init ──► Active ◄──► Standby
//!   │        │            │
//!   └────────┴─► Closed ◄─┘
//! ```
//!
//! Updates are only sent while Active. In any other state they complete
//! with [`UpdateStatus::InvalidUpdater`] without contacting the server.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::registry::WireRegistry;
use crate::codec::MsgPackCodec;
use crate::conversation::{ConversationId, DiscardReason, ResponseCallback};
use crate::error::{Result, SessionError};
use crate::listener::{DiscardSink, ErrorSink, Observer};
use crate::protocol::ServiceType;
use crate::session::{BoundPayload, Session, SessionInner};

/// State of an update source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum UpdateSourceState {
    Init = 0,
    Active = 1,
    Closed = 2,
    Standby = 3,
}

impl UpdateSourceState {
    /// Whether the server may move a source from `self` to `next`.
    pub fn can_transition_to(self, next: UpdateSourceState) -> bool {
        use UpdateSourceState::*;
        matches!(
            (self, next),
            (Init, Init)
                | (Init, Active)
                | (Init, Standby)
                | (Active, Standby)
                | (Standby, Active)
                | (Init, Closed)
                | (Active, Closed)
                | (Standby, Closed)
        )
    }

    #[inline]
    pub fn is_closed(self) -> bool {
        self == UpdateSourceState::Closed
    }
}

impl TryFrom<u8> for UpdateSourceState {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(UpdateSourceState::Init),
            1 => Ok(UpdateSourceState::Active),
            2 => Ok(UpdateSourceState::Closed),
            3 => Ok(UpdateSourceState::Standby),
            other => Err(format!("Unknown update source state: {}", other)),
        }
    }
}

impl From<UpdateSourceState> for u8 {
    fn from(value: UpdateSourceState) -> Self {
        value as u8
    }
}

impl fmt::Display for UpdateSourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateSourceState::Init => "INIT",
            UpdateSourceState::Active => "ACTIVE",
            UpdateSourceState::Closed => "CLOSED",
            UpdateSourceState::Standby => "STANDBY",
        };
        f.write_str(name)
    }
}

/// Outcome of an update. Part of the caller-visible contract; codes are
/// fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum UpdateStatus {
    Ok = 0,
    IncompatibleUpdate = 1,
    UpdateFailed = 2,
    InvalidUpdater = 3,
    MissingTopic = 4,
    ExclusiveUpdaterConflict = 7,
    DeltaWithoutValue = 8,
    ClusterRepartition = 9,
    IncompatibleState = 10,
}

impl UpdateStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        use UpdateStatus::*;
        Some(match code {
            0 => Ok,
            1 => IncompatibleUpdate,
            2 => UpdateFailed,
            3 => InvalidUpdater,
            4 => MissingTopic,
            7 => ExclusiveUpdaterConflict,
            8 => DeltaWithoutValue,
            9 => ClusterRepartition,
            10 => IncompatibleState,
            _ => return None,
        })
    }

    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == UpdateStatus::Ok
    }

    /// Worth retrying the same update after a delay.
    #[inline]
    pub fn is_retryable(self) -> bool {
        self == UpdateStatus::ClusterRepartition
    }

    /// The source must register again before further updates can succeed.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateStatus::InvalidUpdater | UpdateStatus::ExclusiveUpdaterConflict
        )
    }
}

impl TryFrom<u32> for UpdateStatus {
    type Error = String;

    fn try_from(code: u32) -> std::result::Result<Self, Self::Error> {
        UpdateStatus::from_code(code).ok_or_else(|| format!("Unknown update status: {}", code))
    }
}

impl From<UpdateStatus> for u32 {
    fn from(value: UpdateStatus) -> Self {
        value.code()
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStatus::Ok => "OK",
            UpdateStatus::IncompatibleUpdate => "INCOMPATIBLE_UPDATE",
            UpdateStatus::UpdateFailed => "UPDATE_FAILED",
            UpdateStatus::InvalidUpdater => "INVALID_UPDATER",
            UpdateStatus::MissingTopic => "MISSING_TOPIC",
            UpdateStatus::ExclusiveUpdaterConflict => "EXCLUSIVE_UPDATER_CONFLICT",
            UpdateStatus::DeltaWithoutValue => "DELTA_WITHOUT_VALUE",
            UpdateStatus::ClusterRepartition => "CLUSTER_REPARTITION",
            UpdateStatus::IncompatibleState => "INCOMPATIBLE_STATE",
        };
        f.write_str(name)
    }
}

/// Stable identifier of an update source within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpdaterId(u64);

impl UpdaterId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UpdaterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "updater:{}", self.0)
    }
}

/// Everything an update source handler observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSourceEvent {
    /// The server accepted the registration in `state`.
    Registered { state: UpdateSourceState },
    StateChanged {
        previous: UpdateSourceState,
        current: UpdateSourceState,
    },
    /// The source is closed. Last event delivered.
    Closed,
}

/// Handler for an [`UpdateSource`].
pub trait UpdateSourceHandler: Observer<UpdateSourceEvent> + ErrorSink + DiscardSink {}

impl<T> UpdateSourceHandler for T where T: Observer<UpdateSourceEvent> + ErrorSink + DiscardSink {}

/// Which update service a value goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    Set,
    Delta,
}

impl UpdateKind {
    fn service_type(self) -> ServiceType {
        match self {
            UpdateKind::Set => ServiceType::UpdateSourceSet,
            UpdateKind::Delta => ServiceType::UpdateSourceDelta,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegistrationRequest {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegistrationResponse {
    pub state: UpdateSourceState,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UpdaterRequest {
    pub updater: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UpdateRequest {
    pub updater: u64,
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UpdateResponse {
    pub status: UpdateStatus,
}

/// Payload of an inbound `UPDATE_SOURCE_STATE` request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StateMessage {
    pub updater: u64,
    pub state: UpdateSourceState,
}

fn decode_status(bytes: &[u8]) -> Result<UpdateStatus> {
    let response: UpdateResponse = MsgPackCodec::decode(bytes)?;
    Ok(response.status)
}

fn decode_registration(bytes: &[u8]) -> Result<UpdateSourceState> {
    let response: RegistrationResponse = MsgPackCodec::decode(bytes)?;
    Ok(response.state)
}

struct Entry {
    handler: Weak<dyn UpdateSourceHandler>,
    topic_path: String,
    state: UpdateSourceState,
    /// The server has answered the registration at least once.
    confirmed: bool,
}

impl Entry {
    fn handler(&self) -> Option<Arc<dyn UpdateSourceHandler>> {
        self.handler.upgrade()
    }
}

/// Per-session table of update sources.
///
/// Updates and state pushes name a source by the conversation id of its
/// registration request currently known to the server.
pub(crate) struct UpdateSourceRegistry {
    table: WireRegistry<Entry>,
}

impl UpdateSourceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            table: WireRegistry::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    fn insert(
        &self,
        handler: Weak<dyn UpdateSourceHandler>,
        topic_path: String,
        wire: ConversationId,
    ) -> UpdaterId {
        let entry = Entry {
            handler,
            topic_path,
            state: UpdateSourceState::Init,
            confirmed: false,
        };
        UpdaterId(self.table.insert(entry, wire))
    }

    fn current(&self, id: UpdaterId) -> (UpdateSourceState, Option<ConversationId>) {
        match self.table.with(id.0, |entry| entry.state) {
            Some(state) => (state, self.table.wire(id.0)),
            None => (UpdateSourceState::Closed, None),
        }
    }

    fn wire(&self, id: UpdaterId) -> Result<ConversationId> {
        self.table.wire(id.0).ok_or(SessionError::RegistrationClosed)
    }

    fn handler(&self, id: UpdaterId) -> Option<Arc<dyn UpdateSourceHandler>> {
        self.table.with(id.0, |entry| entry.handler()).flatten()
    }

    /// Record the state the server registered a source in.
    fn set_initial(
        &self,
        id: UpdaterId,
        initial: UpdateSourceState,
    ) -> Option<Arc<dyn UpdateSourceHandler>> {
        self.table
            .with(id.0, |entry| {
                entry.state = initial;
                entry.confirmed = true;
                entry.handler()
            })
            .flatten()
    }

    /// Apply a server-driven state. Transitions outside the table are
    /// logged and ignored unless `force` is set.
    fn transition(&self, id: UpdaterId, next: UpdateSourceState, force: bool) {
        if next.is_closed() {
            self.close(id);
            return;
        }
        let change = self.table.with(id.0, |entry| {
            let previous = entry.state;
            if previous == next {
                return None;
            }
            if !force && !previous.can_transition_to(next) {
                tracing::warn!(
                    updater = %id,
                    %previous,
                    %next,
                    "Ignoring invalid update source transition"
                );
                return None;
            }
            entry.state = next;
            entry.handler().map(|handler| (handler, previous))
        });

        if let Some(Some((handler, previous))) = change {
            tracing::debug!(
                updater = %id,
                %previous,
                current = %next,
                "Update source state changed"
            );
            handler.on_event(UpdateSourceEvent::StateChanged {
                previous,
                current: next,
            });
        }
    }

    /// Remove a source and tell its handler.
    fn close(&self, id: UpdaterId) -> bool {
        match self.table.remove(id.0) {
            Some(entry) => {
                if let Some(handler) = entry.handler() {
                    handler.on_event(UpdateSourceEvent::Closed);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&self) {
        for entry in self.table.drain() {
            if let Some(handler) = entry.handler() {
                handler.on_event(UpdateSourceEvent::Closed);
            }
        }
    }

    pub(crate) fn on_state_message(&self, message: StateMessage) {
        let wire = ConversationId::new(message.updater);
        match self.table.with_wire(wire, |id, _| UpdaterId(id)) {
            Some(id) => self.transition(id, message.state, false),
            None => tracing::debug!(updater = %wire, "State for unknown update source"),
        }
    }

    /// Re-register every source on a new connection.
    ///
    /// A source the server has not answered yet is left to its own
    /// registration request.
    pub(crate) fn replay(&self, session: &Session) {
        let conversations = &session.inner.conversations;
        let plans = self.table.rebind(
            || conversations.allocate(),
            |entry| entry.confirmed.then(|| entry.topic_path.clone()),
        );

        for (id, wire, path) in plans {
            let id = UpdaterId(id);
            tracing::debug!(updater = %id, %path, "Replaying update source registration");
            let sent = registration(session, id, path, None).and_then(|(payload, continuation)| {
                session.inner.replay_request(
                    wire,
                    ServiceType::UpdateSourceRegistration,
                    &payload,
                    Box::new(continuation),
                )
            });
            if let Err(e) = sent {
                tracing::warn!(updater = %id, error = %e, "Update source replay failed");
            }
        }
    }
}

type RegistrationReply = oneshot::Sender<Result<UpdateSourceState>>;

/// Payload and continuation of a registration request for `id`.
fn registration(
    session: &Session,
    id: UpdaterId,
    path: String,
    reply: Option<RegistrationReply>,
) -> Result<(Bytes, ResponseCallback<UpdateSourceState>)> {
    let payload = MsgPackCodec::encode(&RegistrationRequest { path })?;
    let weak = Arc::downgrade(&session.inner);
    let continuation = ResponseCallback::new(decode_registration, move |result| {
        on_registration(&weak, id, result, reply);
    });
    Ok((payload, continuation))
}

fn on_registration(
    session: &Weak<SessionInner>,
    id: UpdaterId,
    result: Result<UpdateSourceState>,
    reply: Option<RegistrationReply>,
) {
    let Some(inner) = session.upgrade() else {
        return;
    };
    let registry = &inner.update_sources;
    match result {
        Ok(state) => {
            match &reply {
                Some(_) if state.is_closed() => {
                    registry.close(id);
                }
                Some(_) => {
                    if let Some(handler) = registry.set_initial(id, state) {
                        handler.on_event(UpdateSourceEvent::Registered { state });
                    }
                }
                // The server may report any state after a reconnection.
                None => registry.transition(id, state, true),
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(state));
            }
        }
        Err(e) => {
            if let Some(handler) = registry.handler(id) {
                match &e {
                    SessionError::Service(error) => handler.on_error(error),
                    SessionError::Discarded(reason) => handler.on_discard(*reason),
                    _ => {}
                }
            }
            if !matches!(e, SessionError::Discarded(_)) {
                registry.close(id);
            }
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
        }
    }
}

/// Handle to one registered update source.
///
/// Dropping the handle leaves the source registered until the session
/// closes; call [`deregister`](Self::deregister) to release the branch.
#[derive(Clone)]
pub struct UpdateSource {
    session: Session,
    id: UpdaterId,
    topic_path: String,
}

impl UpdateSource {
    pub fn id(&self) -> UpdaterId {
        self.id
    }

    /// The branch this source was registered for.
    pub fn topic_path(&self) -> &str {
        &self.topic_path
    }

    pub fn state(&self) -> UpdateSourceState {
        self.session.inner.update_sources.current(self.id).0
    }

    /// Id the server currently knows this source by, while registered.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.session.inner.update_sources.current(self.id).1
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Set the value of `topic_path`.
    pub async fn update(&self, topic_path: &str, value: impl Into<Bytes>) -> Result<UpdateStatus> {
        self.submit_and_wait(UpdateKind::Set, topic_path, value.into())
            .await
    }

    /// Apply a binary delta to the value of `topic_path`.
    pub async fn apply_delta(
        &self,
        topic_path: &str,
        delta: impl Into<Bytes>,
    ) -> Result<UpdateStatus> {
        self.submit_and_wait(UpdateKind::Delta, topic_path, delta.into())
            .await
    }

    async fn submit_and_wait(
        &self,
        kind: UpdateKind,
        topic_path: &str,
        value: Bytes,
    ) -> Result<UpdateStatus> {
        let (tx, rx) = oneshot::channel();
        self.submit(kind, topic_path, value, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await
            .unwrap_or(Err(SessionError::Discarded(DiscardReason::SessionClosed)))
    }

    /// Core update path. `on_done` runs exactly once, unless an `Err` is
    /// returned, in which case it is not run at all.
    ///
    /// The update names the source by the id the server knows it by when
    /// the update is transmitted. An update queued while the session
    /// recovers therefore follows the source's replayed registration. If
    /// the source is closed before that, the update completes with
    /// [`UpdateStatus::InvalidUpdater`].
    pub(crate) fn submit<F>(
        &self,
        kind: UpdateKind,
        topic_path: &str,
        value: Bytes,
        on_done: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<UpdateStatus>) + Send + 'static,
    {
        if topic_path.is_empty() {
            return Err(SessionError::InvalidArgument(
                "topic path must not be empty".to_string(),
            ));
        }
        if self.session.is_closed() {
            return Err(SessionError::SessionClosed);
        }

        let state = self.state();
        if state != UpdateSourceState::Active {
            tracing::debug!(updater = %self.id, %state, "Update rejected locally");
            on_done(Ok(UpdateStatus::InvalidUpdater));
            return Ok(());
        }

        let id = self.id;
        let path = topic_path.to_string();
        let payload: BoundPayload = Box::new(move |inner: &SessionInner| {
            let wire = inner.update_sources.wire(id)?;
            MsgPackCodec::encode(&UpdateRequest {
                updater: wire.get(),
                path: path.clone(),
                value: value.to_vec(),
            })
        });

        let session = Arc::downgrade(&self.session.inner);
        let continuation = ResponseCallback::new(decode_status, move |result| {
            let source_gone = || {
                session
                    .upgrade()
                    .map_or(true, |inner| inner.update_sources.wire(id).is_err())
            };
            match result {
                Err(SessionError::Discarded(DiscardReason::Cancelled)) if source_gone() => {
                    on_done(Ok(UpdateStatus::InvalidUpdater))
                }
                other => on_done(other),
            }
        });
        // The continuation is discarded (and `on_done` run) if the request
        // cannot be queued, so report that outcome through `on_done` only.
        let _ = self.session.inner.send_bound_request(
            kind.service_type(),
            payload,
            Box::new(continuation),
        );
        Ok(())
    }

    /// Release the branch. The source is Closed locally at once.
    ///
    /// While the session is recovering nothing is sent: the source is not
    /// replayed, so the server has already forgotten it.
    pub async fn deregister(&self) -> Result<()> {
        let registry = &self.session.inner.update_sources;
        let Some(wire) = registry.current(self.id).1 else {
            return Ok(());
        };
        registry.close(self.id);

        let payload = MsgPackCodec::encode(&UpdaterRequest {
            updater: wire.get(),
        })?;
        let answered = self
            .session
            .call_if_connected(
                ServiceType::UpdateSourceDeregistration,
                &payload,
                MsgPackCodec::decode_ack,
            )
            .await?;
        if answered.is_none() {
            tracing::debug!(updater = %self.id, "Deregistered locally while disconnected");
        }
        Ok(())
    }
}

impl fmt::Debug for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSource")
            .field("id", &self.id)
            .field("topic_path", &self.topic_path)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Register as the update source for the branch at `topic_path`.
    ///
    /// Resolves once the server answers with the initial state; the handler
    /// has then seen [`UpdateSourceEvent::Registered`].
    pub async fn register_update_source<H: UpdateSourceHandler>(
        &self,
        topic_path: &str,
        handler: &Arc<H>,
    ) -> Result<UpdateSource> {
        if topic_path.is_empty() {
            return Err(SessionError::InvalidArgument(
                "topic path must not be empty".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }

        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn UpdateSourceHandler> = weak;
        let wire = self.inner.conversations.allocate();
        let id = self
            .inner
            .update_sources
            .insert(weak, topic_path.to_string(), wire);

        let (reply, done) = oneshot::channel();
        let sent = registration(self, id, topic_path.to_string(), Some(reply)).and_then(
            |(payload, continuation)| {
                self.inner.send_request_with_id(
                    wire,
                    ServiceType::UpdateSourceRegistration,
                    &payload,
                    Box::new(continuation),
                )
            },
        );
        if let Err(e) = sent {
            self.inner.update_sources.table.remove(id.0);
            return Err(e);
        }

        match done.await {
            Ok(Ok(_)) => Ok(UpdateSource {
                session: self.clone(),
                id,
                topic_path: topic_path.to_string(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Discarded(DiscardReason::SessionClosed)),
        }
    }

    /// Number of registered update sources.
    pub fn update_sources(&self) -> usize {
        self.inner.update_sources.len()
    }
}
