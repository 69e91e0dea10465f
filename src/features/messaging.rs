//! Request/response messaging addressed by path.
//!
//! A session sends a request to a path with
//! [`Session::send_request_to_path`]; whichever handler the server routes it
//! to answers it. Requests the server routes to this session reach the
//! [`RequestStream`] set for their path. Request streams are local: setting
//! or removing one sends nothing to the server.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::error::{ErrorCode, Result, ServiceError, SessionError};
use crate::handler::{HandlerResult, RequestContext};
use crate::listener::ErrorSink;
use crate::protocol::ServiceType;
use crate::session::Session;

/// Format of a request or response value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum DataType {
    Binary = 0,
    Json = 1,
    String = 2,
    Double = 3,
    Int64 = 4,
    RecordV2 = 5,
}

impl TryFrom<u8> for DataType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(DataType::Binary),
            1 => Ok(DataType::Json),
            2 => Ok(DataType::String),
            3 => Ok(DataType::Double),
            4 => Ok(DataType::Int64),
            5 => Ok(DataType::RecordV2),
            other => Err(format!("Unknown data type: {}", other)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        value as u8
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Binary => "binary",
            DataType::Json => "json",
            DataType::String => "string",
            DataType::Double => "double",
            DataType::Int64 => "int64",
            DataType::RecordV2 => "record_v2",
        };
        f.write_str(name)
    }
}

/// A request or response body tagged with its data type.
///
/// The bytes are carried as-is; encoding them for `datatype` is up to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageValue {
    pub datatype: DataType,
    pub bytes: Bytes,
}

impl MessageValue {
    pub fn new(datatype: DataType, bytes: impl Into<Bytes>) -> Self {
        Self {
            datatype,
            bytes: bytes.into(),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(DataType::String, value.into().into_bytes())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SendRequestMessage {
    pub path: String,
    pub request_datatype: DataType,
    pub response_datatype: DataType,
    #[serde(with = "serde_bytes")]
    pub request: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResponseMessage {
    pub datatype: DataType,
    #[serde(with = "serde_bytes")]
    pub response: Vec<u8>,
}

/// Payload of an inbound `MESSAGING_RECEIVER_CLIENT` request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct InboundRequestMessage {
    pub path: String,
    pub request_datatype: DataType,
    pub response_datatype: DataType,
    #[serde(with = "serde_bytes")]
    pub request: Vec<u8>,
}

fn decode_response(bytes: &[u8]) -> Result<MessageValue> {
    let response: ResponseMessage = MsgPackCodec::decode(bytes)?;
    Ok(MessageValue::new(response.datatype, response.response))
}

/// Handles requests sent to one path.
///
/// Runs on the session's delivery task. A stream that needs to do slow
/// work should move the [`Responder`] elsewhere and answer from there.
pub trait RequestStream: ErrorSink {
    fn on_request(&self, path: &str, request: MessageValue, responder: Responder);

    /// The stream was removed or its session closed. Last call made.
    fn on_close(&self) {}
}

/// Answers one inbound request. Clones share the single answer.
#[derive(Clone)]
pub struct Responder {
    ctx: RequestContext,
    response_datatype: DataType,
    answered: Arc<AtomicBool>,
}

impl Responder {
    fn new(ctx: RequestContext, response_datatype: DataType) -> Self {
        Self {
            ctx,
            response_datatype,
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Data type the requester expects back.
    pub fn response_datatype(&self) -> DataType {
        self.response_datatype
    }

    /// Send `response`, encoded as [`response_datatype`](Self::response_datatype).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the request was already answered.
    pub fn respond(&self, response: impl Into<Bytes>) -> Result<()> {
        self.claim()?;
        let response: Bytes = response.into();
        self.ctx.respond(&ResponseMessage {
            datatype: self.response_datatype,
            response: response.to_vec(),
        })
    }

    /// Refuse the request. The requester sees a `RejectedRequest` error
    /// carrying `message`.
    pub fn reject(&self, message: impl Into<String>) -> Result<()> {
        self.claim()?;
        self.ctx
            .error(&ServiceError::new(ErrorCode::RejectedRequest, message))
    }

    fn claim(&self) -> Result<()> {
        if self.answered.swap(true, Ordering::AcqRel) {
            return Err(SessionError::InvalidArgument(
                "request already answered".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("conversation", &self.ctx.conversation_id())
            .field("response_datatype", &self.response_datatype)
            .field("answered", &self.answered.load(Ordering::Acquire))
            .finish()
    }
}

struct StreamEntry {
    stream: Arc<dyn RequestStream>,
    request_datatype: DataType,
    response_datatype: DataType,
}

/// Request streams of one session, keyed by path.
///
/// Unlike listeners, streams are held strongly: the session owns a stream
/// until it is removed or the session closes.
pub(crate) struct RequestStreamRegistry {
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl RequestStreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.lock().len()
    }

    fn set(
        &self,
        path: String,
        stream: Arc<dyn RequestStream>,
        request_datatype: DataType,
        response_datatype: DataType,
    ) -> Option<Arc<dyn RequestStream>> {
        let entry = StreamEntry {
            stream,
            request_datatype,
            response_datatype,
        };
        self.streams
            .lock()
            .insert(path, entry)
            .map(|previous| previous.stream)
    }

    fn remove(&self, path: &str) -> Option<Arc<dyn RequestStream>> {
        let removed = self.streams.lock().remove(path)?;
        removed.stream.on_close();
        Some(removed.stream)
    }

    pub(crate) fn close_all(&self) {
        let mut drained: Vec<(String, StreamEntry)> = self.streams.lock().drain().collect();
        drained.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (_, entry) in drained {
            entry.stream.on_close();
        }
    }

    /// Route an inbound request to the stream for its path.
    ///
    /// Requests nobody can take are answered with an Error reply here.
    pub(crate) fn dispatch(
        &self,
        message: InboundRequestMessage,
        ctx: RequestContext,
    ) -> HandlerResult {
        let target = self.streams.lock().get(&message.path).map(|entry| {
            (
                entry.stream.clone(),
                entry.request_datatype,
                entry.response_datatype,
            )
        });

        let Some((stream, request_datatype, response_datatype)) = target else {
            tracing::debug!(path = %message.path, "Request for path without a stream");
            return ctx.error(&ServiceError::new(
                ErrorCode::UnhandledMessage,
                format!("no request stream for {}", message.path),
            ));
        };

        if message.request_datatype != request_datatype
            || message.response_datatype != response_datatype
        {
            let error = ServiceError::new(
                ErrorCode::IncompatibleDatatype,
                format!(
                    "stream for {} takes {} and answers {}, got {} expecting {}",
                    message.path,
                    request_datatype,
                    response_datatype,
                    message.request_datatype,
                    message.response_datatype
                ),
            );
            tracing::warn!(path = %message.path, %error, "Request datatype mismatch");
            stream.on_error(&error);
            return ctx.error(&error);
        }

        tracing::trace!(
            path = %message.path,
            conversation = %ctx.conversation_id(),
            "Request dispatched"
        );
        let request = MessageValue::new(message.request_datatype, message.request);
        stream.on_request(&message.path, request, Responder::new(ctx, response_datatype));
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SessionError::InvalidArgument(
            "request path must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl Session {
    /// Send `request` to `path` and wait for the response.
    ///
    /// # Errors
    ///
    /// `Service` with [`ErrorCode::IncompatibleDatatype`] when the response
    /// is not of `response_datatype`. A rejection by the receiving handler
    /// arrives as `Service` with its own code.
    pub async fn send_request_to_path(
        &self,
        path: &str,
        request: MessageValue,
        response_datatype: DataType,
    ) -> Result<MessageValue> {
        validate_path(path)?;
        let payload = MsgPackCodec::encode(&SendRequestMessage {
            path: path.to_string(),
            request_datatype: request.datatype,
            response_datatype,
            request: request.bytes.to_vec(),
        })?;

        let response = self
            .call(ServiceType::MessagingSend, &payload, decode_response)
            .await?;
        if response.datatype != response_datatype {
            return Err(SessionError::Service(ServiceError::new(
                ErrorCode::IncompatibleDatatype,
                format!(
                    "expected a {} response from {}, got {}",
                    response_datatype, path, response.datatype
                ),
            )));
        }
        Ok(response)
    }

    /// Handle requests sent to `path` with `stream`.
    ///
    /// Returns the stream previously set for the path, which is replaced
    /// without being closed.
    pub fn set_request_stream<S: RequestStream>(
        &self,
        path: &str,
        request_datatype: DataType,
        response_datatype: DataType,
        stream: &Arc<S>,
    ) -> Result<Option<Arc<dyn RequestStream>>> {
        validate_path(path)?;
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        let stream: Arc<dyn RequestStream> = stream.clone();
        Ok(self.inner.request_streams.set(
            path.to_string(),
            stream,
            request_datatype,
            response_datatype,
        ))
    }

    /// Remove the stream for `path`, closing it. Later requests to the path
    /// are refused.
    pub fn remove_request_stream(&self, path: &str) -> Option<Arc<dyn RequestStream>> {
        self.inner.request_streams.remove(path)
    }

    /// Number of request streams set.
    pub fn request_streams(&self) -> usize {
        self.inner.request_streams.len()
    }
}
