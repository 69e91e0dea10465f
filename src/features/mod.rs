//! Protocol features built on sessions.
//!
//! - [`notifications`] - topic notification registrations
//! - [`update_source`] - exclusive update sources and their state machine
//! - [`legacy`] - callback-style update adapter
//! - [`session_properties`] - property events for other sessions
//! - [`messaging`] - path-addressed requests and request streams
//! - [`pings`] - system and user pings

pub mod legacy;
pub mod messaging;
pub mod notifications;
pub mod pings;
pub(crate) mod registry;
pub mod session_properties;
pub mod update_source;

use std::sync::{Arc, Weak};

use crate::handler::{HandlerResult, RequestContext, ServiceHandler, TypedHandler};
use crate::protocol::ServiceType;
use crate::session::{Session, SessionInner};

use self::messaging::InboundRequestMessage;
use self::notifications::{DescendantEventMessage, TopicEventMessage};
use self::session_properties::EventMessage;
use self::update_source::StateMessage;

/// Register the handlers for every server push the features consume.
///
/// Pushes are one-way: they are not answered. A handler supplied through the
/// builder for the same service takes precedence.
pub(crate) fn install_handlers(session: &Session) {
    let handlers = &session.inner.handlers;
    let weak = Arc::downgrade(&session.inner);

    install(session, ServiceType::PingSystem, pings::answer_system_ping);
    install(
        session,
        ServiceType::TopicNotificationEvents,
        with_session(&weak, |inner, message: TopicEventMessage| {
            inner.notifications.on_topic_event(message)
        }),
    );
    install(
        session,
        ServiceType::TopicDescendantEvents,
        with_session(&weak, |inner, message: DescendantEventMessage| {
            inner.notifications.on_descendant_event(message)
        }),
    );
    install(
        session,
        ServiceType::UpdateSourceState,
        with_session(&weak, |inner, message: StateMessage| {
            inner.update_sources.on_state_message(message)
        }),
    );
    install(
        session,
        ServiceType::SessionPropertiesEvent2,
        with_session(&weak, |inner, message: EventMessage| {
            inner.properties.on_event_message(message)
        }),
    );
    let streams = weak.clone();
    install(
        session,
        ServiceType::MessagingReceiverClient,
        TypedHandler::new(move |message: InboundRequestMessage, ctx: RequestContext| {
            match streams.upgrade() {
                Some(inner) => inner.request_streams.dispatch(message, ctx),
                None => Ok(()),
            }
        }),
    );
    tracing::trace!(handlers = handlers.len(), "Feature handlers installed");
}

fn install<H: ServiceHandler>(session: &Session, service_type: ServiceType, handler: H) {
    if let Err(e) = session.inner.handlers.register(service_type, handler) {
        tracing::debug!(service = %service_type, error = %e, "Keeping caller-supplied handler");
    }
}

/// Wrap a push consumer into a typed handler holding the session weakly.
fn with_session<T, F>(
    session: &Weak<SessionInner>,
    consume: F,
) -> TypedHandler<impl Fn(T, RequestContext) -> HandlerResult + Send + Sync + 'static, T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    F: Fn(&SessionInner, T) + Send + Sync + 'static,
{
    let session = session.clone();
    TypedHandler::new(move |message: T, _ctx: RequestContext| {
        if let Some(inner) = session.upgrade() {
            consume(&inner, message);
        }
        Ok(())
    })
}
