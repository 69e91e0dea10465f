//! Path-addressed requests and request streams against a fake server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use common::FakeServer;
use topicwire_client::codec::MsgPackCodec;
use topicwire_client::features::messaging::{DataType, MessageValue, RequestStream, Responder};
use topicwire_client::listener::ErrorSink;
use topicwire_client::protocol::{ServiceMode, ServiceType};
use topicwire_client::{ErrorCode, ServiceError, SessionError, SessionState};

#[derive(Debug, Deserialize)]
struct SendRequest {
    path: String,
    request_datatype: u8,
    response_datatype: u8,
    #[serde(with = "serde_bytes")]
    request: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    datatype: u8,
    #[serde(with = "serde_bytes")]
    response: Vec<u8>,
}

#[derive(Serialize)]
struct InboundRequest<'a> {
    path: &'a str,
    request_datatype: u8,
    response_datatype: u8,
    #[serde(with = "serde_bytes")]
    request: &'a [u8],
}

/// Answers with the request upper-cased, or rejects empty requests.
#[derive(Default)]
struct Shouter {
    requests: Mutex<Vec<(String, MessageValue)>>,
    errors: Mutex<Vec<ServiceError>>,
    closes: AtomicUsize,
}

impl RequestStream for Shouter {
    fn on_request(&self, path: &str, request: MessageValue, responder: Responder) {
        self.requests.lock().push((path.to_string(), request.clone()));
        if request.bytes.is_empty() {
            responder.reject("nothing to say").unwrap();
        } else {
            responder.respond(request.bytes.to_ascii_uppercase()).unwrap();
        }
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl ErrorSink for Shouter {
    fn on_error(&self, error: &ServiceError) {
        self.errors.lock().push(error.clone());
    }
}

fn request_to(server: &FakeServer, path: &str, datatype: DataType, body: &[u8]) {
    server.push(
        ServiceType::MessagingReceiverClient,
        &InboundRequest {
            path,
            request_datatype: datatype as u8,
            response_datatype: DataType::String as u8,
            request: body,
        },
    );
}

#[tokio::test]
async fn test_send_request_to_path() {
    let server = FakeServer::new();
    let session = server.session().await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request_to_path("svc/echo", MessageValue::string("hi"), DataType::String)
                .await
        })
    };
    let request = server.expect(ServiceType::MessagingSend).await;
    let body: SendRequest = MsgPackCodec::decode(&request.payload).unwrap();
    assert_eq!(body.path, "svc/echo");
    assert_eq!(body.request_datatype, DataType::String as u8);
    assert_eq!(body.response_datatype, DataType::String as u8);
    assert_eq!(body.request, b"hi");
    server.respond(
        &request,
        &Response {
            datatype: DataType::String as u8,
            response: b"HI".to_vec(),
        },
    );

    assert_eq!(pending.await.unwrap().unwrap(), MessageValue::string("HI"));
}

#[tokio::test]
async fn test_response_of_wrong_datatype_refused() {
    let server = FakeServer::new();
    let session = server.session().await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request_to_path("svc/n", MessageValue::string("1"), DataType::Int64)
                .await
        })
    };
    let request = server.expect(ServiceType::MessagingSend).await;
    server.respond(
        &request,
        &Response {
            datatype: DataType::Json as u8,
            response: b"{}".to_vec(),
        },
    );

    assert!(matches!(
        pending.await.unwrap(),
        Err(SessionError::Service(ServiceError {
            code: ErrorCode::IncompatibleDatatype,
            ..
        }))
    ));
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_rejected_request_reported() {
    let server = FakeServer::new();
    let session = server.session().await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request_to_path("svc/echo", MessageValue::string(""), DataType::String)
                .await
        })
    };
    let request = server.expect(ServiceType::MessagingSend).await;
    server.respond_error(
        &request,
        ServiceError::new(ErrorCode::RejectedRequest, "nothing to say"),
    );

    match pending.await.unwrap() {
        Err(SessionError::Service(error)) => {
            assert_eq!(error, ServiceError::new(ErrorCode::RejectedRequest, "nothing to say"))
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_path_rejected_locally() {
    let server = FakeServer::new();
    let session = server.session().await;
    let stream = Arc::new(Shouter::default());

    assert!(matches!(
        session
            .send_request_to_path("", MessageValue::string("x"), DataType::String)
            .await,
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.set_request_stream("", DataType::String, DataType::String, &stream),
        Err(SessionError::InvalidArgument(_))
    ));
    server.sync(&session).await;
    server
        .expect_silence(std::time::Duration::from_millis(50))
        .await;
}

#[tokio::test]
async fn test_request_stream_answers_server() {
    let server = FakeServer::new();
    let session = server.session().await;
    let stream = Arc::new(Shouter::default());
    let previous = session
        .set_request_stream("svc/shout", DataType::String, DataType::String, &stream)
        .unwrap();
    assert!(previous.is_none());
    assert_eq!(session.request_streams(), 1);

    let pushed = server.push(
        ServiceType::MessagingReceiverClient,
        &InboundRequest {
            path: "svc/shout",
            request_datatype: DataType::String as u8,
            response_datatype: DataType::String as u8,
            request: b"quiet",
        },
    );
    let answer = server.next_frame().await;
    assert_eq!(answer.service_type, ServiceType::MessagingReceiverClient);
    assert_eq!(answer.mode, ServiceMode::Response);
    assert_eq!(answer.conversation_id, pushed);
    let reply: Response = MsgPackCodec::decode(&answer.payload).unwrap();
    assert_eq!(reply.datatype, DataType::String as u8);
    assert_eq!(reply.response, b"QUIET");

    request_to(&server, "svc/shout", DataType::String, b"");
    let rejected = server.next_frame().await;
    assert_eq!(rejected.mode, ServiceMode::Error);
    let error: ServiceError = MsgPackCodec::decode(&rejected.payload).unwrap();
    assert_eq!(error.code, ErrorCode::RejectedRequest);

    assert_eq!(
        *stream.requests.lock(),
        vec![
            ("svc/shout".to_string(), MessageValue::string("quiet")),
            ("svc/shout".to_string(), MessageValue::string("")),
        ]
    );
}

#[tokio::test]
async fn test_requests_nobody_can_take_refused() {
    let server = FakeServer::new();
    let session = server.session().await;
    let stream = Arc::new(Shouter::default());
    session
        .set_request_stream("svc/shout", DataType::String, DataType::String, &stream)
        .unwrap();

    request_to(&server, "svc/other", DataType::String, b"x");
    let unknown = server.next_frame().await;
    assert_eq!(unknown.mode, ServiceMode::Error);
    let error: ServiceError = MsgPackCodec::decode(&unknown.payload).unwrap();
    assert_eq!(error.code, ErrorCode::UnhandledMessage);

    request_to(&server, "svc/shout", DataType::Json, b"{}");
    let mismatch = server.next_frame().await;
    let error: ServiceError = MsgPackCodec::decode(&mismatch.payload).unwrap();
    assert_eq!(error.code, ErrorCode::IncompatibleDatatype);
    assert_eq!(stream.errors.lock()[0].code, ErrorCode::IncompatibleDatatype);
    assert!(stream.requests.lock().is_empty());
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_remove_request_stream() {
    let server = FakeServer::new();
    let session = server.session().await;
    let first = Arc::new(Shouter::default());
    let second = Arc::new(Shouter::default());
    session
        .set_request_stream("svc/shout", DataType::String, DataType::String, &first)
        .unwrap();

    // Replacing hands the old stream back without closing it.
    let replaced = session
        .set_request_stream("svc/shout", DataType::String, DataType::String, &second)
        .unwrap();
    assert!(replaced.is_some());
    assert_eq!(first.closes.load(Ordering::SeqCst), 0);

    assert!(session.remove_request_stream("svc/shout").is_some());
    assert!(session.remove_request_stream("svc/shout").is_none());
    assert_eq!(second.closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.request_streams(), 0);

    request_to(&server, "svc/shout", DataType::String, b"late");
    let refused = server.next_frame().await;
    assert_eq!(refused.mode, ServiceMode::Error);
    assert!(second.requests.lock().is_empty());
}

#[tokio::test]
async fn test_session_close_closes_request_streams() {
    let server = FakeServer::new();
    let session = server.session().await;
    let stream = Arc::new(Shouter::default());
    session
        .set_request_stream("svc/shout", DataType::String, DataType::String, &stream)
        .unwrap();

    session.close().await;
    assert_eq!(stream.closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.request_streams(), 0);
    assert!(matches!(
        session.set_request_stream("svc/shout", DataType::String, DataType::String, &stream),
        Err(SessionError::SessionClosed)
    ));
}
