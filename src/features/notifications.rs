//! Topic notifications.
//!
//! A [`NotificationRegistration`] owns a set of selectors. The server streams
//! topic events for paths matching them, plus descendant events naming the
//! nearest bound topic on branches not yet selected. The client routes those
//! events to the registration's listener in arrival order and suppresses
//! events that would repeat what the listener already knows:
//!
//! - `Added`/`Selected` for a path the listener already holds
//! - `Removed`/`Deselected` for a path it does not hold
//!
//! The same rule keeps a reconnection replay from re-announcing topics.

use std::collections::{BTreeSet, HashMap, HashSet};
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
use crate::selector::SelectorMatcher;
use crate::session::{BoundPayload, Session, SessionInner};

/// Kind of change reported for a topic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum NotificationType {
    Added = 0,
    Selected = 1,
    Removed = 2,
    Deselected = 3,
}

impl NotificationType {
    /// The path is known to the listener after this event.
    #[inline]
    pub fn is_arrival(self) -> bool {
        matches!(self, NotificationType::Added | NotificationType::Selected)
    }
}

impl TryFrom<u8> for NotificationType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(NotificationType::Added),
            1 => Ok(NotificationType::Selected),
            2 => Ok(NotificationType::Removed),
            3 => Ok(NotificationType::Deselected),
            other => Err(format!("Unknown notification type: {}", other)),
        }
    }
}

impl From<NotificationType> for u8 {
    fn from(value: NotificationType) -> Self {
        value as u8
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationType::Added => "ADDED",
            NotificationType::Selected => "SELECTED",
            NotificationType::Removed => "REMOVED",
            NotificationType::Deselected => "DESELECTED",
        };
        f.write_str(name)
    }
}

/// Type and properties of a topic, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpecification {
    pub topic_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl TopicSpecification {
    pub fn new(topic_type: impl Into<String>) -> Self {
        Self {
            topic_type: topic_type.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A change to a selected topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNotificationEvent {
    pub topic_path: String,
    pub specification: Option<TopicSpecification>,
    pub notification_type: NotificationType,
}

/// Everything a notification listener observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// The server accepted the registration.
    Registered,
    Topic(TopicNotificationEvent),
    /// A bound topic below a selector that does not select it yet.
    Descendant {
        topic_path: String,
        notification_type: NotificationType,
    },
    /// The registration ended. Last event delivered.
    Closed,
}

/// Listener for a [`NotificationRegistration`].
///
/// Implement [`Observer<NotificationEvent>`] plus [`ErrorSink`] and
/// [`DiscardSink`] (both have default methods).
pub trait TopicNotificationListener:
    Observer<NotificationEvent> + ErrorSink + DiscardSink
{
}

impl<T> TopicNotificationListener for T where
    T: Observer<NotificationEvent> + ErrorSink + DiscardSink
{
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SelectionRequest {
    pub registration: u64,
    pub selector: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DeregistrationRequest {
    pub registration: u64,
}

/// Payload of an inbound `TOPIC_NOTIFICATION_EVENTS` request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TopicEventMessage {
    pub registration: u64,
    pub path: String,
    pub notification_type: NotificationType,
    #[serde(default)]
    pub specification: Option<TopicSpecification>,
}

/// Payload of an inbound `TOPIC_DESCENDANT_EVENTS` request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DescendantEventMessage {
    pub registration: u64,
    pub path: String,
    pub notification_type: NotificationType,
}

struct Entry {
    listener: Weak<dyn TopicNotificationListener>,
    /// The server has acknowledged the registration at least once.
    confirmed: bool,
    selectors: BTreeSet<String>,
    known_topics: HashSet<String>,
    known_descendants: HashSet<String>,
}

impl Entry {
    fn listener(&self) -> Option<Arc<dyn TopicNotificationListener>> {
        self.listener.upgrade()
    }
}

/// Per-session table of notification registrations.
///
/// Inbound events name a registration by the conversation id of the
/// registration request currently known to the server.
pub(crate) struct NotificationRegistry {
    table: WireRegistry<Entry>,
}

impl NotificationRegistry {
    pub(crate) fn new() -> Self {
        Self {
            table: WireRegistry::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    fn insert(&self, listener: Weak<dyn TopicNotificationListener>, wire: ConversationId) -> u64 {
        let entry = Entry {
            listener,
            confirmed: false,
            selectors: BTreeSet::new(),
            known_topics: HashSet::new(),
            known_descendants: HashSet::new(),
        };
        self.table.insert(entry, wire)
    }

    fn wire_id(&self, id: u64) -> Result<ConversationId> {
        self.table.wire(id).ok_or(SessionError::RegistrationClosed)
    }

    fn listener(&self, id: u64) -> Option<Arc<dyn TopicNotificationListener>> {
        self.table.with(id, |entry| entry.listener()).flatten()
    }

    fn contains_selector(&self, id: u64, selector: &str) -> Result<bool> {
        self.table
            .with(id, |entry| entry.selectors.contains(selector))
            .ok_or(SessionError::RegistrationClosed)
    }

    fn record_selector(&self, id: u64, selector: &str, selected: bool) {
        self.table.with(id, |entry| {
            if selected {
                entry.selectors.insert(selector.to_string());
            } else {
                entry.selectors.remove(selector);
            }
        });
    }

    fn selectors(&self, id: u64) -> Vec<String> {
        self.table
            .with(id, |entry| entry.selectors.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn confirm(&self, id: u64) {
        self.table.with(id, |entry| entry.confirmed = true);
    }

    fn is_registered(&self, id: u64) -> bool {
        self.table.contains(id)
    }

    /// Remove a registration and tell its listener.
    fn close(&self, id: u64) -> bool {
        match self.table.remove(id) {
            Some(entry) => {
                if let Some(listener) = entry.listener() {
                    listener.on_event(NotificationEvent::Closed);
                }
                true
            }
            None => false,
        }
    }

    /// Close every registration. Used when the session closes.
    pub(crate) fn close_all(&self) {
        for entry in self.table.drain() {
            if let Some(listener) = entry.listener() {
                listener.on_event(NotificationEvent::Closed);
            }
        }
    }

    pub(crate) fn on_topic_event(&self, message: TopicEventMessage) {
        let wire = ConversationId::new(message.registration);
        let routed = self.table.with_wire(wire, |_, entry| {
            if !track(&mut entry.known_topics, &message.path, message.notification_type) {
                tracing::debug!(
                    path = %message.path,
                    kind = %message.notification_type,
                    "Suppressed repeated topic event"
                );
                return None;
            }
            entry.listener()
        });

        match routed {
            Some(Some(listener)) => {
                listener.on_event(NotificationEvent::Topic(TopicNotificationEvent {
                    topic_path: message.path,
                    specification: message.specification,
                    notification_type: message.notification_type,
                }));
            }
            Some(None) => {}
            None => tracing::debug!(registration = %wire, "Topic event for unknown registration"),
        }
    }

    pub(crate) fn on_descendant_event(&self, message: DescendantEventMessage) {
        let wire = ConversationId::new(message.registration);
        let routed = self.table.with_wire(wire, |_, entry| {
            // Descendant events describe unselected topics only.
            if entry.known_topics.contains(&message.path) {
                return None;
            }
            if !track(
                &mut entry.known_descendants,
                &message.path,
                message.notification_type,
            ) {
                return None;
            }
            entry.listener()
        });

        match routed {
            Some(Some(listener)) => listener.on_event(NotificationEvent::Descendant {
                topic_path: message.path,
                notification_type: message.notification_type,
            }),
            Some(None) => {}
            None => {
                tracing::debug!(registration = %wire, "Descendant event for unknown registration")
            }
        }
    }

    /// Re-issue every registration and its selectors on a new connection.
    ///
    /// A registration the server has not acknowledged yet is left to its
    /// own request, which is still queued or still awaiting an answer.
    pub(crate) fn replay(&self, session: &Session) {
        let conversations = &session.inner.conversations;
        let plans = self.table.rebind(
            || conversations.allocate(),
            |entry| {
                entry
                    .confirmed
                    .then(|| entry.selectors.iter().cloned().collect::<Vec<String>>())
            },
        );

        for (id, wire, selectors) in plans {
            tracing::debug!(
                registration = id,
                selectors = selectors.len(),
                "Replaying notification registration"
            );
            let continuation = registration_callback(Arc::downgrade(&session.inner), id, None);
            if let Err(e) = session.inner.replay_request(
                wire,
                ServiceType::TopicNotificationRegistration,
                &[],
                Box::new(continuation),
            ) {
                tracing::warn!(registration = id, error = %e, "Notification replay failed");
                continue;
            }
            for selector in selectors {
                replay_selection(session, id, wire, selector);
            }
        }
    }
}

/// Apply one event to a known-path set. Returns whether it changes it.
fn track(known: &mut HashSet<String>, path: &str, kind: NotificationType) -> bool {
    if kind.is_arrival() {
        known.insert(path.to_string())
    } else {
        known.remove(path)
    }
}

fn replay_selection(session: &Session, id: u64, wire: ConversationId, selector: String) {
    let payload = match MsgPackCodec::encode(&SelectionRequest {
        registration: wire.get(),
        selector,
    }) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(registration = id, error = %e, "Selection replay not encoded");
            return;
        }
    };
    let weak = Arc::downgrade(&session.inner);
    let continuation = ResponseCallback::ack(move |result| {
        if let Err(e) = result {
            report_failure(&weak, id, e);
        }
    });
    let conversation = session.inner.conversations.allocate();
    if let Err(e) = session.inner.replay_request(
        conversation,
        ServiceType::TopicNotificationSelection,
        &payload,
        Box::new(continuation),
    ) {
        tracing::warn!(registration = id, error = %e, "Selection replay failed");
    }
}

/// Payload naming registration `id` by its wire id at transmission.
fn bound_to<F>(id: u64, build: F) -> BoundPayload
where
    F: Fn(u64) -> Result<Bytes> + Send + 'static,
{
    Box::new(move |inner: &SessionInner| {
        let wire = inner.notifications.wire_id(id)?;
        build(wire.get())
    })
}

/// Route a failed request to the registration's listener.
fn report_failure(session: &Weak<SessionInner>, id: u64, error: SessionError) {
    let Some(inner) = session.upgrade() else {
        return;
    };
    let Some(listener) = inner.notifications.listener(id) else {
        return;
    };
    match error {
        SessionError::Service(error) => listener.on_error(&error),
        SessionError::Discarded(reason) => listener.on_discard(reason),
        other => tracing::warn!(registration = id, error = %other, "Notification request failed"),
    }
}

fn registration_callback(
    session: Weak<SessionInner>,
    id: u64,
    reply: Option<oneshot::Sender<Result<()>>>,
) -> ResponseCallback<()> {
    ResponseCallback::ack(move |result| {
        let Some(inner) = session.upgrade() else {
            return;
        };
        let first = reply.is_some();
        match result {
            Ok(()) => {
                inner.notifications.confirm(id);
                if first {
                    if let Some(listener) = inner.notifications.listener(id) {
                        listener.on_event(NotificationEvent::Registered);
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                let discarded = matches!(e, SessionError::Discarded(_));
                if let Some(listener) = inner.notifications.listener(id) {
                    match &e {
                        SessionError::Service(error) => listener.on_error(error),
                        SessionError::Discarded(reason) => listener.on_discard(*reason),
                        _ => {}
                    }
                }
                // A discard means the session is closing, or a replay did
                // not reach the server and the next recovery repeats it.
                if !discarded {
                    inner.notifications.close(id);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    })
}

/// Handle to one notification registration.
///
/// Dropping the handle leaves the registration active until the session
/// closes; call [`close`](Self::close) to end it.
#[derive(Clone)]
pub struct NotificationRegistration {
    session: Session,
    id: u64,
    /// Serializes selection changes made through this handle and its clones.
    changes: Arc<tokio::sync::Mutex<()>>,
}

impl NotificationRegistration {
    /// Local identifier, stable across reconnections.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the registration is still in effect.
    pub fn is_active(&self) -> bool {
        self.session.inner.notifications.is_registered(self.id)
    }

    /// Selectors acknowledged by the server.
    pub fn selectors(&self) -> Vec<String> {
        self.session.inner.notifications.selectors(self.id)
    }

    /// Acknowledged selectors that select `topic_path` according to
    /// `matcher`.
    pub fn selected_by(&self, topic_path: &str, matcher: &dyn SelectorMatcher) -> Vec<String> {
        self.selectors()
            .into_iter()
            .filter(|selector| matcher.matches(selector, topic_path))
            .collect()
    }

    /// Add `selector`. Completes at once if it is already selected.
    ///
    /// Changes are applied one at a time: a `select` of a selector already
    /// being selected waits for the first and then completes without a
    /// request of its own.
    pub async fn select(&self, selector: &str) -> Result<()> {
        self.change_selection(selector, true).await
    }

    /// Remove `selector`. Completes at once if it is not selected.
    pub async fn deselect(&self, selector: &str) -> Result<()> {
        self.change_selection(selector, false).await
    }

    async fn change_selection(&self, selector: &str, select: bool) -> Result<()> {
        if selector.is_empty() {
            return Err(SessionError::InvalidArgument(
                "selector must not be empty".to_string(),
            ));
        }
        let registry = &self.session.inner.notifications;
        if registry.contains_selector(self.id, selector)? == select {
            return Ok(());
        }

        let _serial = self.changes.lock().await;
        if registry.contains_selector(self.id, selector)? == select {
            return Ok(());
        }

        let service_type = if select {
            ServiceType::TopicNotificationSelection
        } else {
            ServiceType::TopicNotificationDeselection
        };
        let owned = selector.to_string();
        let payload = bound_to(self.id, move |registration| {
            MsgPackCodec::encode(&SelectionRequest {
                registration,
                selector: owned.clone(),
            })
        });
        self.session
            .call_bound(service_type, payload, MsgPackCodec::decode_ack)
            .await
            .map_err(|e| self.closed_or(e))?;

        registry.record_selector(self.id, selector, select);
        Ok(())
    }

    /// `RegistrationClosed` if the registration went away while a request
    /// for it waited for a connection.
    fn closed_or(&self, error: SessionError) -> SessionError {
        match error {
            SessionError::Discarded(DiscardReason::Cancelled) if !self.is_active() => {
                SessionError::RegistrationClosed
            }
            other => other,
        }
    }

    /// Deregister. The listener receives [`NotificationEvent::Closed`] once
    /// the server acknowledges. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let registry = &self.session.inner.notifications;
        if !registry.is_registered(self.id) {
            return Ok(());
        }
        let payload = bound_to(self.id, |registration| {
            MsgPackCodec::encode(&DeregistrationRequest { registration })
        });
        match self
            .session
            .call_bound(
                ServiceType::TopicNotificationDeregistration,
                payload,
                MsgPackCodec::decode_ack,
            )
            .await
            .map_err(|e| self.closed_or(e))
        {
            Ok(()) | Err(SessionError::RegistrationClosed) => {}
            Err(e) => return Err(e),
        }

        registry.close(self.id);
        Ok(())
    }
}

impl fmt::Debug for NotificationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRegistration")
            .field("id", &self.id)
            .field("selectors", &self.selectors())
            .finish()
    }
}

impl Session {
    /// Register a topic notification listener.
    ///
    /// Resolves once the server accepts the registration. The listener is
    /// held weakly; keep the `Arc` alive for as long as events are wanted.
    pub async fn add_topic_notification_listener<L: TopicNotificationListener>(
        &self,
        listener: &Arc<L>,
    ) -> Result<NotificationRegistration> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn TopicNotificationListener> = weak;

        let wire = self.inner.conversations.allocate();
        let id = self.inner.notifications.insert(weak, wire);
        let (reply, done) = oneshot::channel();
        let continuation = registration_callback(Arc::downgrade(&self.inner), id, Some(reply));

        if let Err(e) = self.inner.send_request_with_id(
            wire,
            ServiceType::TopicNotificationRegistration,
            &[],
            Box::new(continuation),
        ) {
            self.inner.notifications.table.remove(id);
            return Err(e);
        }

        match done.await {
            Ok(Ok(())) => Ok(NotificationRegistration {
                session: self.clone(),
                id,
                changes: Arc::new(tokio::sync::Mutex::new(())),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Discarded(DiscardReason::SessionClosed)),
        }
    }

    /// Number of active notification registrations.
    pub fn notification_registrations(&self) -> usize {
        self.inner.notifications.len()
    }
}
