//! HTTP front end of the command relay
//!
//! Accepts a command from a remote control page on any path and issues one
//! registry send-command call per POST.

use super::cloudiot::{CommandSender, RelayError};
use crate::protocol::CommandMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use warp::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
};
use warp::http::{HeaderValue, Method, StatusCode};
use warp::reply::Response;
use warp::{Filter, Reply};

const CORS_HEADERS: [(warp::http::header::HeaderName, &str); 5] = [
    (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (ACCESS_CONTROL_ALLOW_METHODS, "POST"),
    (ACCESS_CONTROL_ALLOW_HEADERS, "Vary, Origin, Content-Type"),
    (ACCESS_CONTROL_ALLOW_CREDENTIALS, "true"),
    (ACCESS_CONTROL_MAX_AGE, "300"),
];

/// POST body: the target device plus the command fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayRequest {
    pub device_id: String,
    #[serde(flatten)]
    pub command: CommandMessage,
}

/// `{"message": ...}` body of every non-OPTIONS response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayResponse {
    pub message: String,
}

impl RelayResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// All relay routes. Path is ignored; dispatch is on method only.
pub fn routes(
    sender: Arc<dyn CommandSender>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::method()
        .and(warp::body::bytes())
        .and(warp::any().map(move || sender.clone()))
        .and_then(handle_request)
}

async fn handle_request(
    method: Method,
    body: Bytes,
    sender: Arc<dyn CommandSender>,
) -> Result<Response, Infallible> {
    let response = match method {
        Method::OPTIONS => respond(StatusCode::OK, None),
        Method::POST => match relay_command(&body, sender.as_ref()).await {
            Ok(()) => respond(StatusCode::OK, Some(RelayResponse::new("success"))),
            Err(e) => {
                error!(error = %e, size = body.len(), "Command relay failed");
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(RelayResponse::new(e.to_string())),
                )
            }
        },
        other => {
            warn!(method = %other, "Rejected relay request");
            respond(
                StatusCode::METHOD_NOT_ALLOWED,
                Some(RelayResponse::new("method not allowed")),
            )
        }
    };
    Ok(response)
}

/// Decode the POST body and issue exactly one send-command call
pub async fn relay_command(body: &[u8], sender: &dyn CommandSender) -> Result<(), RelayError> {
    let request: RelayRequest = serde_json::from_slice(body)?;

    info!(
        device_id = %request.device_id,
        remote = %request.command.remote,
        name = %request.command.name,
        duration_ms = request.command.duration_millis,
        "Relaying command"
    );
    sender
        .send_command(&request.device_id, &request.command)
        .await
}

fn respond(status: StatusCode, body: Option<RelayResponse>) -> Response {
    let mut response = match body {
        Some(body) => warp::reply::with_status(warp::reply::json(&body), status).into_response(),
        None => warp::reply::with_status(warp::reply(), status).into_response(),
    };

    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(
    addr: SocketAddr,
    sender: Arc<dyn CommandSender>,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(sender))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| RelayError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    info!(addr = %bound, "Command relay listening");
    server.await;
    info!("Command relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockCommandSender;

    fn filter(
        sender: MockCommandSender,
    ) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
        routes(Arc::new(sender))
    }

    fn assert_cors(response: &warp::http::Response<Bytes>) {
        let headers = response.headers();
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], "POST");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Vary, Origin, Content-Type");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "300");
    }

    #[tokio::test]
    async fn test_options_is_empty_ok() {
        let sender = MockCommandSender::new();
        let response = warp::test::request()
            .method("OPTIONS")
            .path("/anything")
            .reply(&filter(sender.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body().is_empty());
        assert_cors(&response);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_post_relays_once() {
        let sender = MockCommandSender::new();
        let response = warp::test::request()
            .method("POST")
            .path("/")
            .body(r#"{"device_id":"dev-1","remote":"r1","name":"open","duration":500}"#)
            .reply(&filter(sender.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), br#"{"message":"success"}"#);
        assert_cors(&response);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device_id, "dev-1");
        assert_eq!(sent[0].command.name, "open");
        assert_eq!(sent[0].command.duration_millis, 500);
    }

    #[tokio::test]
    async fn test_bad_json_is_500_without_call() {
        let sender = MockCommandSender::new();
        let response = warp::test::request()
            .method("POST")
            .path("/")
            .body("not json")
            .reply(&filter(sender.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: RelayResponse = serde_json::from_slice(response.body()).unwrap();
        assert!(!body.message.is_empty());
        assert_cors(&response);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_500() {
        let sender = MockCommandSender::with_failure("unavailable");
        let response = warp::test::request()
            .method("POST")
            .path("/")
            .body(r#"{"device_id":"dev-1","remote":"r1","name":"open","duration":500}"#)
            .reply(&filter(sender))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: RelayResponse = serde_json::from_slice(response.body()).unwrap();
        assert!(body.message.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        for method in ["GET", "PUT", "DELETE"] {
            let sender = MockCommandSender::new();
            let response = warp::test::request()
                .method(method)
                .path("/")
                .reply(&filter(sender.clone()))
                .await;

            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
            assert_eq!(
                response.body().as_ref(),
                br#"{"message":"method not allowed"}"#
            );
            assert_cors(&response);
            assert!(sender.sent().is_empty());
        }
    }
}
