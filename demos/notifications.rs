//! Topic notifications - print every topic that appears below a selector.
//!
//! ```text
//! cargo run --example notifications -- 127.0.0.1:8090 "?sensors//"
//! ```
//!
//! The session reconnects on its own; the registration and its selector are
//! restored on every new connection.

use std::sync::Arc;

use topicwire_client::features::notifications::NotificationEvent;
use topicwire_client::listener::{DiscardSink, ErrorSink, Observer};
use topicwire_client::session::StateChange;
use topicwire_client::transport::TcpConnector;
use topicwire_client::{DiscardReason, ServiceError, Session};

struct Printer;

impl Observer<NotificationEvent> for Printer {
    fn on_event(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::Registered => println!("registered"),
            NotificationEvent::Topic(topic) => {
                let kind = topic
                    .specification
                    .as_ref()
                    .map(|spec| spec.topic_type.as_str())
                    .unwrap_or("?");
                println!("{} {} ({})", topic.notification_type, topic.topic_path, kind);
            }
            NotificationEvent::Descendant {
                topic_path,
                notification_type,
            } => println!("{} {} (descendant)", notification_type, topic_path),
            NotificationEvent::Closed => println!("closed"),
        }
    }
}

impl ErrorSink for Printer {
    fn on_error(&self, error: &ServiceError) {
        eprintln!("rejected: {}", error);
    }
}

impl DiscardSink for Printer {
    fn on_discard(&self, reason: DiscardReason) {
        eprintln!("discarded: {}", reason);
    }
}

struct States;

impl Observer<StateChange> for States {
    fn on_event(&self, change: StateChange) {
        eprintln!("session {} -> {}", change.old, change.new);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:8090".to_string());
    let selector = args.next().unwrap_or_else(|| "?//".to_string());

    let states = Arc::new(States);
    let session = Session::builder()
        .connector(TcpConnector::new(addr))
        .listener(&states)
        .start()
        .await?;

    let printer = Arc::new(Printer);
    let registration = session.add_topic_notification_listener(&printer).await?;
    registration.select(&selector).await?;

    tokio::select! {
        _ = session.closed() => {}
        _ = tokio::signal::ctrl_c() => {
            registration.close().await?;
            session.close().await;
        }
    }
    Ok(())
}
