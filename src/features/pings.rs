//! Pings in both directions.

use std::time::Duration;

use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::handler::{HandlerResult, RequestContext};
use crate::protocol::{ServiceEnvelope, ServiceType};
use crate::session::Session;

/// Answers the server's liveness check.
pub(crate) fn answer_system_ping(_request: ServiceEnvelope, ctx: RequestContext) -> HandlerResult {
    tracing::trace!(conversation = %ctx.conversation_id(), "System ping");
    ctx.respond_empty()
}

impl Session {
    /// Ping the server and return the round-trip time.
    pub async fn ping_server(&self) -> Result<Duration> {
        let started = Instant::now();
        self.call(ServiceType::PingUser, &[], MsgPackCodec::decode_ack)
            .await?;
        Ok(started.elapsed())
    }
}
