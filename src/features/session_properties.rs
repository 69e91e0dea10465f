//! Session properties of other sessions.
//!
//! A listener names the properties it needs with [`PropertySelector`]s.
//! The server then pushes an event whenever a session opens, changes one of
//! those properties, disconnects, or closes.

use std::collections::HashMap;
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
use crate::session::{Session, SessionInner};

/// Selects every fixed property.
pub const ALL_FIXED_PROPERTIES: &str = "*F";

/// Selects every user-defined property.
pub const ALL_USER_PROPERTIES: &str = "*U";

/// One required-property selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertySelector {
    AllFixed,
    AllUser,
    Named(String),
}

impl PropertySelector {
    pub fn named(name: impl Into<String>) -> Self {
        PropertySelector::Named(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertySelector::AllFixed => ALL_FIXED_PROPERTIES,
            PropertySelector::AllUser => ALL_USER_PROPERTIES,
            PropertySelector::Named(name) => name,
        }
    }
}

impl From<&str> for PropertySelector {
    fn from(value: &str) -> Self {
        match value {
            ALL_FIXED_PROPERTIES => PropertySelector::AllFixed,
            ALL_USER_PROPERTIES => PropertySelector::AllUser,
            name => PropertySelector::Named(name.to_string()),
        }
    }
}

impl fmt::Display for PropertySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum SessionPropertiesEventType {
    Open = 0,
    Update = 1,
    Close = 2,
    Disconnected = 3,
}

impl TryFrom<u8> for SessionPropertiesEventType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionPropertiesEventType::Open),
            1 => Ok(SessionPropertiesEventType::Update),
            2 => Ok(SessionPropertiesEventType::Close),
            3 => Ok(SessionPropertiesEventType::Disconnected),
            other => Err(format!("Unknown session properties event type: {}", other)),
        }
    }
}

impl From<SessionPropertiesEventType> for u8 {
    fn from(value: SessionPropertiesEventType) -> Self {
        value as u8
    }
}

/// Why the properties in an `Update` event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum PropertiesUpdateType {
    Updated = 0,
    Reconnected = 1,
    FailedOver = 2,
    Disconnected = 3,
}

impl TryFrom<u8> for PropertiesUpdateType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PropertiesUpdateType::Updated),
            1 => Ok(PropertiesUpdateType::Reconnected),
            2 => Ok(PropertiesUpdateType::FailedOver),
            3 => Ok(PropertiesUpdateType::Disconnected),
            other => Err(format!("Unknown properties update type: {}", other)),
        }
    }
}

impl From<PropertiesUpdateType> for u8 {
    fn from(value: PropertiesUpdateType) -> Self {
        value as u8
    }
}

/// A change to another session, as pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPropertiesUpdate {
    pub event_type: SessionPropertiesEventType,
    pub session_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Set on `Update` events.
    #[serde(default)]
    pub update_type: Option<PropertiesUpdateType>,
    /// Set on `Close` events.
    #[serde(default)]
    pub close_reason: Option<String>,
}

/// Everything a session properties listener observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPropertiesEvent {
    Registered,
    Session(SessionPropertiesUpdate),
    /// The listener was removed. Last event delivered.
    Closed,
}

pub trait SessionPropertiesListener:
    Observer<SessionPropertiesEvent> + ErrorSink + DiscardSink
{
}

impl<T> SessionPropertiesListener for T where
    T: Observer<SessionPropertiesEvent> + ErrorSink + DiscardSink
{
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegistrationRequest {
    pub selectors: Vec<String>,
}

/// Payload of an inbound `SESSION_PROPERTIES_EVENT_2` request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EventMessage {
    pub registration: u64,
    pub event_type: SessionPropertiesEventType,
    pub session_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub update_type: Option<PropertiesUpdateType>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl EventMessage {
    #[cfg(test)]
    fn new(registration: u64, update: SessionPropertiesUpdate) -> Self {
        Self {
            registration,
            event_type: update.event_type,
            session_id: update.session_id,
            properties: update.properties,
            update_type: update.update_type,
            close_reason: update.close_reason,
        }
    }

    fn into_update(self) -> SessionPropertiesUpdate {
        SessionPropertiesUpdate {
            event_type: self.event_type,
            session_id: self.session_id,
            properties: self.properties,
            update_type: self.update_type,
            close_reason: self.close_reason,
        }
    }
}

struct Entry {
    listener: Weak<dyn SessionPropertiesListener>,
    selectors: Vec<PropertySelector>,
    /// The server has acknowledged the registration.
    confirmed: bool,
}

pub(crate) struct PropertiesRegistry {
    table: WireRegistry<Entry>,
}

impl PropertiesRegistry {
    pub(crate) fn new() -> Self {
        Self {
            table: WireRegistry::new(),
        }
    }

    fn insert(
        &self,
        listener: Weak<dyn SessionPropertiesListener>,
        selectors: Vec<PropertySelector>,
        wire: ConversationId,
    ) -> u64 {
        let entry = Entry {
            listener,
            selectors,
            confirmed: false,
        };
        self.table.insert(entry, wire)
    }

    fn listener(&self, id: u64) -> Option<Arc<dyn SessionPropertiesListener>> {
        self.table.with(id, |entry| entry.listener.upgrade()).flatten()
    }

    fn confirm(&self, id: u64) {
        self.table.with(id, |entry| entry.confirmed = true);
    }

    fn contains(&self, id: u64) -> bool {
        self.table.contains(id)
    }

    fn close(&self, id: u64) -> bool {
        match self.table.remove(id) {
            Some(entry) => {
                if let Some(listener) = entry.listener.upgrade() {
                    listener.on_event(SessionPropertiesEvent::Closed);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&self) {
        for entry in self.table.drain() {
            if let Some(listener) = entry.listener.upgrade() {
                listener.on_event(SessionPropertiesEvent::Closed);
            }
        }
    }

    pub(crate) fn on_event_message(&self, message: EventMessage) {
        let wire = ConversationId::new(message.registration);
        let listener = self
            .table
            .with_wire(wire, |_, entry| entry.listener.upgrade())
            .flatten();
        match listener {
            Some(listener) => {
                listener.on_event(SessionPropertiesEvent::Session(message.into_update()))
            }
            None => tracing::debug!(registration = %wire, "Properties event for unknown listener"),
        }
    }

    /// Register every acknowledged listener again on a new connection.
    pub(crate) fn replay(&self, session: &Session) {
        let conversations = &session.inner.conversations;
        let plans = self.table.rebind(
            || conversations.allocate(),
            |entry| entry.confirmed.then(|| entry.selectors.clone()),
        );

        for (id, wire, selectors) in plans {
            tracing::debug!(registration = id, "Replaying session properties listener");
            let sent = registration(session, id, &selectors, None).and_then(
                |(payload, continuation)| {
                    session.inner.replay_request(
                        wire,
                        ServiceType::SessionPropertiesRegistration2,
                        &payload,
                        Box::new(continuation),
                    )
                },
            );
            if let Err(e) = sent {
                tracing::warn!(registration = id, error = %e, "Properties listener replay failed");
            }
        }
    }
}

type RegistrationReply = oneshot::Sender<Result<()>>;

fn registration(
    session: &Session,
    id: u64,
    selectors: &[PropertySelector],
    reply: Option<RegistrationReply>,
) -> Result<(Bytes, ResponseCallback<()>)> {
    let payload = MsgPackCodec::encode(&RegistrationRequest {
        selectors: selectors.iter().map(|s| s.as_str().to_string()).collect(),
    })?;
    let weak = Arc::downgrade(&session.inner);
    let continuation = ResponseCallback::ack(move |result| {
        on_registration(&weak, id, result, reply);
    });
    Ok((payload, continuation))
}

fn on_registration(
    session: &Weak<SessionInner>,
    id: u64,
    result: Result<()>,
    reply: Option<RegistrationReply>,
) {
    let Some(inner) = session.upgrade() else {
        return;
    };
    let registry = &inner.properties;
    match result {
        Ok(()) => {
            registry.confirm(id);
            if reply.is_some() {
                if let Some(listener) = registry.listener(id) {
                    listener.on_event(SessionPropertiesEvent::Registered);
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }
        Err(e) => {
            if let Some(listener) = registry.listener(id) {
                match &e {
                    SessionError::Service(error) => listener.on_error(error),
                    SessionError::Discarded(reason) => listener.on_discard(*reason),
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

/// Handle to a session properties listener registration.
#[derive(Clone)]
pub struct PropertiesRegistration {
    session: Session,
    id: u64,
}

impl PropertiesRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.session.inner.properties.contains(self.id)
    }

    /// Stop delivering events to the listener.
    ///
    /// There is no deregistration service; the server keeps the
    /// registration until the session closes and later events are dropped
    /// here. Closing twice is a no-op.
    pub fn close(&self) {
        self.session.inner.properties.close(self.id);
    }
}

impl fmt::Debug for PropertiesRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertiesRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Session {
    /// Listen for property changes of other sessions.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty selection or an empty property name.
    pub async fn add_session_properties_listener<L: SessionPropertiesListener>(
        &self,
        selectors: Vec<PropertySelector>,
        listener: &Arc<L>,
    ) -> Result<PropertiesRegistration> {
        if selectors.is_empty() {
            return Err(SessionError::InvalidArgument(
                "at least one property selector is required".to_string(),
            ));
        }
        if selectors
            .iter()
            .any(|s| matches!(s, PropertySelector::Named(name) if name.is_empty()))
        {
            return Err(SessionError::InvalidArgument(
                "property names must not be empty".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }

        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn SessionPropertiesListener> = weak;
        let wire = self.inner.conversations.allocate();
        let id = self.inner.properties.insert(weak, selectors.clone(), wire);

        let (reply, done) = oneshot::channel();
        let sent = registration(self, id, &selectors, Some(reply)).and_then(
            |(payload, continuation)| {
                self.inner.send_request_with_id(
                    wire,
                    ServiceType::SessionPropertiesRegistration2,
                    &payload,
                    Box::new(continuation),
                )
            },
        );
        if let Err(e) = sent {
            self.inner.properties.table.remove(id);
            return Err(e);
        }

        match done.await {
            Ok(Ok(())) => Ok(PropertiesRegistration {
                session: self.clone(),
                id,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Discarded(DiscardReason::SessionClosed)),
        }
    }
}
