//! Update source - publish a counter to a topic while this client is the
//! active source for its branch.
//!
//! ```text
//! cargo run --example update_source -- 127.0.0.1:8090 counters/demo
//! ```
//!
//! Run two copies against the same branch: one becomes active, the other
//! stands by and takes over when the first exits.

use std::sync::Arc;
use std::time::Duration;

use topicwire_client::features::update_source::{
    UpdateSourceEvent, UpdateSourceState, UpdateStatus,
};
use topicwire_client::listener::{DiscardSink, ErrorSink, Observer};
use topicwire_client::transport::TcpConnector;
use topicwire_client::{ServiceError, Session};

struct Logger;

impl Observer<UpdateSourceEvent> for Logger {
    fn on_event(&self, event: UpdateSourceEvent) {
        println!("{:?}", event);
    }
}

impl ErrorSink for Logger {
    fn on_error(&self, error: &ServiceError) {
        eprintln!("registration rejected: {}", error);
    }
}

impl DiscardSink for Logger {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:8090".to_string());
    let path = args.next().unwrap_or_else(|| "counters/demo".to_string());

    let session = Session::builder()
        .connector(TcpConnector::new(addr))
        .start()
        .await?;

    let logger = Arc::new(Logger);
    let source = session.register_update_source(&path, &logger).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session.closed() => break,
            _ = tokio::signal::ctrl_c() => {
                source.deregister().await?;
                session.close().await;
                break;
            }
        }

        if source.state() == UpdateSourceState::Closed {
            break;
        }
        if source.state() != UpdateSourceState::Active {
            continue;
        }

        counter += 1;
        match source.update(&path, counter.to_string().into_bytes()).await? {
            UpdateStatus::Ok => {}
            status if status.is_retryable() => eprintln!("{}: will retry", status),
            status => {
                eprintln!("{}: giving up", status);
                break;
            }
        }
    }
    Ok(())
}
