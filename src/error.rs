//! Error types for topicwire-client.
//!
//! [`SessionError`] is the single error type returned by the public API.
//! Server-side rejections travel as [`ServiceError`], carrying an
//! [`ErrorCode`] from the server's error table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::DiscardReason;
use crate::protocol::ServiceType;
use crate::transport::TransportError;

/// Main error type for all session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration documents only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed or unroutable envelope. Fatal to the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server pushed a request for a service with no registered handler.
    #[error("No handler registered for inbound service {0}")]
    HandlerNotFound(ServiceType),

    /// Rejected locally before contacting the server.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The registration this call refers to has been closed.
    #[error("Registration closed")]
    RegistrationClosed,

    /// The session is closed.
    #[error("Session closed")]
    SessionClosed,

    /// The outbound queue held while recovering is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// Transport failure reported by the connector.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server rejected the request.
    #[error("Service error: {0}")]
    Service(ServiceError),

    /// The request was abandoned before a response arrived.
    #[error("Request discarded: {0}")]
    Discarded(DiscardReason),
}

impl SessionError {
    /// True when the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Protocol(_)
                | SessionError::HandlerNotFound(_)
                | SessionError::MsgPackDecode(_)
        )
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

/// A rejection sent by the server in an ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ServiceError {
    /// Error code from the server's table.
    pub code: ErrorCode,
    /// Human readable description.
    pub message: String,
}

impl ServiceError {
    /// Create a service error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes reported by the server.
///
/// The numbering is part of the wire contract; codes from 100 upwards are
/// the "communication" range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Unknown = 1,
    Service = 2,
    SessionCreateFailed = 3,
    TransportCreateFailed = 4,
    NoSession = 5,
    NoTransport = 6,
    NoStartFn = 7,
    NoCloseFn = 8,
    NoServersDefined = 9,
    AddrLookupFail = 10,
    SocketCreateFail = 11,
    SocketConnectFail = 12,
    HandshakeSendFail = 13,
    HandshakeRecvFail = 14,
    InvalidConnectionProtocol = 15,
    InvalidTopicSpecification = 16,
    TopicAlreadyExists = 17,
    ConnectionRejected = 18,
    ConnectionErrorUndefined = 19,
    MessageQueueFail = 20,
    MessageSendFail = 21,
    ParseUrl = 22,
    UnknownTransport = 23,
    SocketReadFail = 24,
    SocketWriteFail = 25,
    Downgrade = 26,
    ConnectionUnsupported = 27,
    LicenceExceeded = 28,
    ReconnectionUnsupported = 29,
    ConnectionProtocolError = 30,
    AuthenticationFailed = 31,
    ProtocolVersion = 32,
    UnknownSession = 33,
    MessageLoss = 34,
    InvalidFilter = 35,
    IllegalState = 36,
    NoSuchTopic = 37,
    RejectedRequest = 38,
    IncompatibleTopic = 39,
    IncompatibleExistingTopic = 40,
    UnsatisfiedConstraint = 41,
    InvalidUpdateStream = 42,
    ExistingTopic = 43,
    IncompatibleParentTopic = 44,
    IncompatibleMasterTopic = 45,
    InvalidTopicPath = 46,
    AddTopic = 47,
    IllegalArgument = 48,
    InvalidScript = 49,
    InvalidPatch = 50,
    FailedPatch = 51,
    CommunicationError = 100,
    SessionClosed = 101,
    RequestTimeOut = 102,
    AccessDenied = 103,
    Unsupported = 104,
    CallbackFail = 105,
    InvalidData = 106,
    NoSuchSession = 107,
    IncompatibleDatatype = 108,
    UnhandledMessage = 109,
    ClusterRepartition = 110,
    IncompatibleState = 111,
}

impl ErrorCode {
    const TABLE: [ErrorCode; 64] = [
        ErrorCode::Success,
        ErrorCode::Unknown,
        ErrorCode::Service,
        ErrorCode::SessionCreateFailed,
        ErrorCode::TransportCreateFailed,
        ErrorCode::NoSession,
        ErrorCode::NoTransport,
        ErrorCode::NoStartFn,
        ErrorCode::NoCloseFn,
        ErrorCode::NoServersDefined,
        ErrorCode::AddrLookupFail,
        ErrorCode::SocketCreateFail,
        ErrorCode::SocketConnectFail,
        ErrorCode::HandshakeSendFail,
        ErrorCode::HandshakeRecvFail,
        ErrorCode::InvalidConnectionProtocol,
        ErrorCode::InvalidTopicSpecification,
        ErrorCode::TopicAlreadyExists,
        ErrorCode::ConnectionRejected,
        ErrorCode::ConnectionErrorUndefined,
        ErrorCode::MessageQueueFail,
        ErrorCode::MessageSendFail,
        ErrorCode::ParseUrl,
        ErrorCode::UnknownTransport,
        ErrorCode::SocketReadFail,
        ErrorCode::SocketWriteFail,
        ErrorCode::Downgrade,
        ErrorCode::ConnectionUnsupported,
        ErrorCode::LicenceExceeded,
        ErrorCode::ReconnectionUnsupported,
        ErrorCode::ConnectionProtocolError,
        ErrorCode::AuthenticationFailed,
        ErrorCode::ProtocolVersion,
        ErrorCode::UnknownSession,
        ErrorCode::MessageLoss,
        ErrorCode::InvalidFilter,
        ErrorCode::IllegalState,
        ErrorCode::NoSuchTopic,
        ErrorCode::RejectedRequest,
        ErrorCode::IncompatibleTopic,
        ErrorCode::IncompatibleExistingTopic,
        ErrorCode::UnsatisfiedConstraint,
        ErrorCode::InvalidUpdateStream,
        ErrorCode::ExistingTopic,
        ErrorCode::IncompatibleParentTopic,
        ErrorCode::IncompatibleMasterTopic,
        ErrorCode::InvalidTopicPath,
        ErrorCode::AddTopic,
        ErrorCode::IllegalArgument,
        ErrorCode::InvalidScript,
        ErrorCode::InvalidPatch,
        ErrorCode::FailedPatch,
        ErrorCode::CommunicationError,
        ErrorCode::SessionClosed,
        ErrorCode::RequestTimeOut,
        ErrorCode::AccessDenied,
        ErrorCode::Unsupported,
        ErrorCode::CallbackFail,
        ErrorCode::InvalidData,
        ErrorCode::NoSuchSession,
        ErrorCode::IncompatibleDatatype,
        ErrorCode::UnhandledMessage,
        ErrorCode::ClusterRepartition,
        ErrorCode::IncompatibleState,
    ];

    /// Numeric value on the wire.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map a wire value back to a code. Unrecognised values become `Unknown`.
    pub fn from_code(code: u32) -> Self {
        Self::TABLE
            .iter()
            .copied()
            .find(|c| c.code() == code)
            .unwrap_or(ErrorCode::Unknown)
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        ErrorCode::from_code(code)
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}
