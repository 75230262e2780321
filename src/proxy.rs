//! Upstream execution.
//!
//! A call opens an [`UpstreamLease`], posts the adapted payload and then either
//!
//! - relays an event stream: the lease moves into a [`LeasedStream`] and is released when the
//!   stream ends, fails, hits the deadline, or is dropped because the caller went away; or
//! - buffers the body: the lease is released as soon as the body has been read.
//!
//! Either way the lease is released exactly once.
use crate::auth::CallerIdentity;
use crate::client::HttpClient;
use crate::errors::GatewayError;
use crate::payload::ChatCompletionPayload;
use axum::Json;
use axum::body::{Body, BodyDataStream, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bon::Builder;
use futures_util::Stream;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

/// API version pinned on every upstream call.
pub const API_VERSION: &str = "2024-05-01-preview";

const EVENT_STREAM: &str = "text/event-stream";

/// Largest non-streaming upstream body the gateway will buffer.
pub const MAX_BUFFERED_BODY_BYTES: usize = 32 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Behaviour switches for the proxy, usually taken from the command line.
#[derive(Debug, Clone, Default, Builder)]
pub struct ProxySettings {
    /// Total deadline for an upstream call, including reading or streaming its body.
    pub timeout: Option<Duration>,
    /// Skip per-model access control for every request.
    #[builder(default)]
    pub bypass_model_access_control: bool,
    /// Send the caller's identity upstream as `x-forwarded-user-*` headers.
    #[builder(default)]
    pub forward_user_info_headers: bool,
}

/// Counts upstream leases opened and released.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn open(&self, model: &str) -> UpstreamLease {
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!("Opened upstream lease for model {}", model);
        UpstreamLease {
            tracker: self.clone(),
            model: model.to_string(),
            opened_at: Instant::now(),
            released: false,
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.opened().saturating_sub(self.released())
    }
}

/// Ownership of one upstream connection. Released explicitly or on drop, whichever comes first.
#[derive(Debug)]
pub struct UpstreamLease {
    tracker: ConnectionTracker,
    model: String,
    opened_at: Instant,
    released: bool,
}

impl UpstreamLease {
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tracker.released.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Released upstream lease for model {} after {:?}",
            self.model,
            self.opened_at.elapsed()
        );
    }
}

impl Drop for UpstreamLease {
    fn drop(&mut self) {
        self.finish();
    }
}

/// An upstream byte stream bound to its lease and the call deadline.
pub struct LeasedStream<S> {
    inner: Option<S>,
    lease: Option<UpstreamLease>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> LeasedStream<S> {
    pub fn new(inner: S, lease: UpstreamLease, deadline: Option<Instant>) -> Self {
        Self {
            inner: Some(inner),
            lease: Some(lease),
            deadline: deadline.map(|at| Box::pin(tokio::time::sleep_until(at))),
        }
    }

    fn close(&mut self) {
        self.inner = None;
        self.deadline = None;
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl<S, E> Stream for LeasedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            warn!("Upstream stream exceeded the client timeout, closing");
            this.close();
            return Poll::Ready(Some(Err("upstream stream exceeded the client timeout".into())));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                let e = e.into();
                error!("Upstream stream failed: {}", e);
                this.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A buffered upstream body: JSON when it parses, raw text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamBody {
    Json(Value),
    Text(String),
}

impl UpstreamBody {
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => UpstreamBody::Json(value),
            Err(e) => {
                warn!("Upstream body is not JSON ({}), falling back to text", e);
                UpstreamBody::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Best-effort human-readable detail from an upstream error body.
///
/// Prefers `error.message`, then the `error` value itself, then a raw text body.
pub fn error_detail(body: &UpstreamBody) -> Option<String> {
    let detail = match body {
        UpstreamBody::Json(Value::Object(map)) => {
            let error = map.get("error")?;
            match error.get("message") {
                Some(message) => render(message),
                None => render(error),
            }
        }
        UpstreamBody::Json(Value::String(text)) | UpstreamBody::Text(text) => text.clone(),
        UpstreamBody::Json(_) => return None,
    };
    (!detail.is_empty()).then_some(detail)
}

/// The outcome of a successful upstream call.
pub enum UpstreamCallResult {
    Streaming {
        status: StatusCode,
        headers: HeaderMap,
        body: LeasedStream<BodyDataStream>,
    },
    Buffered {
        status: StatusCode,
        body: UpstreamBody,
    },
}

impl UpstreamCallResult {
    pub fn is_streaming(&self) -> bool {
        matches!(self, UpstreamCallResult::Streaming { .. })
    }
}

impl std::fmt::Debug for UpstreamCallResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamCallResult::Streaming {
                status, headers, ..
            } => f
                .debug_struct("Streaming")
                .field("status", status)
                .field("headers", headers)
                .field("body", &"<stream>")
                .finish(),
            UpstreamCallResult::Buffered { status, body } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("body", body)
                .finish(),
        }
    }
}

impl IntoResponse for UpstreamCallResult {
    fn into_response(self) -> Response {
        match self {
            UpstreamCallResult::Streaming {
                status,
                headers,
                body,
            } => {
                let mut response = Response::new(Body::from_stream(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            UpstreamCallResult::Buffered {
                status,
                body: UpstreamBody::Json(value),
            } => (status, Json(value)).into_response(),
            UpstreamCallResult::Buffered {
                status,
                body: UpstreamBody::Text(text),
            } => (status, Json(Value::String(text))).into_response(),
        }
    }
}

/// One upstream call.
#[derive(Debug, Builder)]
pub struct UpstreamCall<'a> {
    pub base_url: &'a str,
    pub api_key: &'a str,
    pub payload: &'a ChatCompletionPayload,
    /// Identity to forward as headers, if enabled.
    pub forwarded_identity: Option<&'a CallerIdentity>,
    #[builder(default = MAX_BUFFERED_BODY_BYTES)]
    pub max_body_bytes: usize,
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains(EVENT_STREAM))
}

async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await,
        None => Ok(fut.await),
    }
}

fn identity_headers(caller: &CallerIdentity) -> Vec<(HeaderName, HeaderValue)> {
    [
        ("x-forwarded-user-name", caller.name.as_str()),
        ("x-forwarded-user-id", caller.id.as_str()),
        ("x-forwarded-user-email", caller.email.as_str()),
        ("x-forwarded-user-role", caller.role.as_str()),
    ]
    .into_iter()
    .filter_map(|(name, value)| match HeaderValue::from_str(value) {
        Ok(value) => Some((HeaderName::from_static(name), value)),
        Err(_) => {
            debug!("Skipping {} header: value is not a valid header", name);
            None
        }
    })
    .collect()
}

fn build_request(call: &UpstreamCall<'_>) -> Result<axum::extract::Request, GatewayError> {
    let upstream_uri = format!(
        "{}/chat/completions?api-version={}",
        call.base_url.trim_end_matches('/'),
        API_VERSION
    );
    let uri = Uri::try_from(&upstream_uri).map_err(|e| {
        error!("Invalid upstream URI {}: {}", upstream_uri, e);
        GatewayError::Connection(format!("invalid upstream URI: {e}"))
    })?;
    let body = serde_json::to_vec(call.payload)
        .map_err(|e| GatewayError::BadRequest(format!("Unserializable payload: {e}")))?;

    let mut builder = axum::http::Request::builder()
        .method(Method::POST)
        .uri(uri.clone())
        .header("api-key", call.api_key)
        .header(header::CONTENT_TYPE, "application/json");

    // Match the host header to the upstream rather than the gateway.
    if let Some(host) = uri.host() {
        let host_value = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        builder = builder.header(header::HOST, host_value);
    }

    if let Some(caller) = call.forwarded_identity {
        for (name, value) in identity_headers(caller) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(body))
        .map_err(|e| GatewayError::Connection(format!("failed to build upstream request: {e}")))
}

/// Performs one upstream call and classifies its response.
pub async fn execute<T: HttpClient>(
    client: &T,
    connections: &ConnectionTracker,
    timeout: Option<Duration>,
    call: UpstreamCall<'_>,
) -> Result<UpstreamCallResult, GatewayError> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let lease = connections.open(&call.payload.model);

    let request = build_request(&call)?;
    info!(
        "Forwarding model {} to {}",
        call.payload.model, call.base_url
    );

    let response = match with_deadline(deadline, client.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!("Error forwarding request to {}: {}", call.base_url, e);
            return Err(GatewayError::Connection(e.to_string()));
        }
        Err(_) => {
            error!("Timed out waiting for {}", call.base_url);
            return Err(GatewayError::Connection("upstream timed out".to_string()));
        }
    };

    let (parts, body) = response.into_parts();
    let status = parts.status;

    if is_event_stream(&parts.headers) {
        debug!("Relaying event stream with status {}", status);
        return Ok(UpstreamCallResult::Streaming {
            status,
            headers: parts.headers,
            body: LeasedStream::new(body.into_data_stream(), lease, deadline),
        });
    }

    let bytes = with_deadline(
        deadline,
        axum::body::to_bytes(body, call.max_body_bytes),
    )
    .await;
    lease.release();
    let bytes = match bytes {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) if status.is_client_error() || status.is_server_error() => {
            error!("Failed to read error body from {}: {}", call.base_url, e);
            return Err(GatewayError::Upstream {
                status,
                detail: None,
            });
        }
        Ok(Err(e)) => {
            error!(
                "Failed to read upstream body from {} (limit {} bytes): {}",
                call.base_url, call.max_body_bytes, e
            );
            return Err(GatewayError::Connection(e.to_string()));
        }
        Err(_) => {
            error!("Timed out reading upstream body from {}", call.base_url);
            return Err(GatewayError::Upstream {
                status,
                detail: None,
            });
        }
    };

    let body = UpstreamBody::decode(&bytes);
    if status.is_client_error() || status.is_server_error() {
        let detail = error_detail(&body);
        error!(
            "Upstream {} returned {}: {}",
            call.base_url,
            status,
            detail.as_deref().unwrap_or("<no detail>")
        );
        return Err(GatewayError::Upstream { status, detail });
    }

    Ok(UpstreamCallResult::Buffered { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::test_utils::MockHttpClient;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::convert::Infallible;

    fn payload() -> ChatCompletionPayload {
        serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .unwrap()
    }

    async fn run(
        client: &MockHttpClient,
        connections: &ConnectionTracker,
    ) -> Result<UpstreamCallResult, GatewayError> {
        let payload = payload();
        execute(
            client,
            connections,
            Some(Duration::from_secs(5)),
            UpstreamCall::builder()
                .base_url("https://res.openai.azure.com/openai/deployments/gpt-4o/")
                .api_key("azure-key")
                .payload(&payload)
                .build(),
        )
        .await
    }

    #[tokio::test]
    async fn test_request_shape() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"id": "x"}"#);
        let connections = ConnectionTracker::default();
        run(&client, &connections).await.unwrap();

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.uri,
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-05-01-preview"
        );
        assert_eq!(request.header("api-key"), Some("azure-key"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("host"), Some("res.openai.azure.com"));
        assert_eq!(request.header("x-forwarded-user-id"), None);

        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["model"], "gpt-4o");
    }

    #[tokio::test]
    async fn test_forwards_identity_headers_when_given() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let connections = ConnectionTracker::default();
        let payload = payload();
        let caller = CallerIdentity::builder()
            .id("u1")
            .name("Ada")
            .email("ada@example.com")
            .role(Role::Admin)
            .build();

        execute(
            &client,
            &connections,
            None,
            UpstreamCall::builder()
                .base_url("https://res.openai.azure.com/openai")
                .api_key("k")
                .payload(&payload)
                .forwarded_identity(&caller)
                .build(),
        )
        .await
        .unwrap();

        let request = &client.get_requests()[0];
        assert_eq!(request.header("x-forwarded-user-id"), Some("u1"));
        assert_eq!(request.header("x-forwarded-user-role"), Some("admin"));
    }

    #[tokio::test]
    async fn test_buffered_success_returns_decoded_json() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"choices": [{"index": 0}]}"#);
        let connections = ConnectionTracker::default();

        let result = run(&client, &connections).await.unwrap();
        match result {
            UpstreamCallResult::Buffered { status, body } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(body, UpstreamBody::Json(json!({"choices": [{"index": 0}]})));
            }
            other => panic!("expected buffered result, got {other:?}"),
        }
        assert_eq!(connections.in_flight(), 0);
        assert_eq!(connections.released(), 1);
        assert_eq!(client.body_drops(), 1);
    }

    #[tokio::test]
    async fn test_buffered_text_body_falls_back() {
        let client = MockHttpClient::new(StatusCode::OK, "plain words");
        let connections = ConnectionTracker::default();
        let result = run(&client, &connections).await.unwrap();
        assert!(matches!(
            result,
            UpstreamCallResult::Buffered { body: UpstreamBody::Text(ref t), .. } if t == "plain words"
        ));
    }

    #[tokio::test]
    async fn test_upstream_error_surfaces_nested_message() {
        let client =
            MockHttpClient::new(StatusCode::UNAUTHORIZED, r#"{"error": {"message": "bad key"}}"#);
        let connections = ConnectionTracker::default();

        let err = run(&client, &connections).await.unwrap_err();
        match err {
            GatewayError::Upstream { status, detail } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(detail.as_deref(), Some("bad key"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert_eq!(connections.in_flight(), 0);
        assert_eq!(connections.released(), 1);
        assert_eq!(client.body_drops(), 1);
    }

    #[tokio::test]
    async fn test_redirect_status_is_relayed_not_failed() {
        let client = MockHttpClient::new(StatusCode::FOUND, r#"{"moved": true}"#);
        let connections = ConnectionTracker::default();

        let result = run(&client, &connections).await.unwrap();
        match result {
            UpstreamCallResult::Buffered { status, body } => {
                assert_eq!(status, StatusCode::FOUND);
                assert_eq!(body, UpstreamBody::Json(json!({"moved": true})));
            }
            other => panic!("expected buffered result, got {other:?}"),
        }
        assert_eq!(connections.released(), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_and_lease_released() {
        let client = MockHttpClient::new(StatusCode::OK, &"x".repeat(64));
        let connections = ConnectionTracker::default();
        let payload = payload();

        let err = execute(
            &client,
            &connections,
            None,
            UpstreamCall::builder()
                .base_url("https://res.openai.azure.com/openai")
                .api_key("k")
                .payload(&payload)
                .max_body_bytes(16)
                .build(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail(), crate::errors::CONNECTION_ERROR_DETAIL);
        assert_eq!(connections.in_flight(), 0);
        assert_eq!(connections.released(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_is_generic_500() {
        let client = MockHttpClient::failing("connection refused");
        let connections = ConnectionTracker::default();

        let err = run(&client, &connections).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail(), crate::errors::CONNECTION_ERROR_DETAIL);
        assert_eq!(connections.opened(), 1);
        assert_eq!(connections.released(), 1);
    }

    #[tokio::test]
    async fn test_streaming_preserves_status_and_headers() {
        let client = MockHttpClient::new_streaming(
            StatusCode::OK,
            vec![
                "data: {\"delta\": \"Hel\"}\n\n".to_string(),
                "data: {\"delta\": \"lo\"}\n\n".to_string(),
                "data: [DONE]\n\n".to_string(),
            ],
        );
        let connections = ConnectionTracker::default();

        let result = run(&client, &connections).await.unwrap();
        assert!(result.is_streaming());
        let UpstreamCallResult::Streaming {
            status,
            headers,
            body,
        } = result
        else {
            unreachable!()
        };
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
        assert_eq!(headers.get("cache-control").unwrap(), "no-cache");

        // Still open while the relay is live.
        assert_eq!(connections.in_flight(), 1);

        let chunks: Vec<Bytes> = body.map(|chunk| chunk.unwrap()).collect().await;
        let text: String = chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(connections.in_flight(), 0);
        assert_eq!(connections.released(), 1);
        assert_eq!(client.body_drops(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_mid_relay_releases_once() {
        let connections = ConnectionTracker::default();
        let lease = connections.open("gpt-4o");
        let inner = futures_util::stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(
            b"data: first\n\n",
        ))])
        .chain(futures_util::stream::pending());
        let mut stream = LeasedStream::new(Box::pin(inner), lease, None);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), b"data: first\n\n");
        assert_eq!(connections.in_flight(), 1);

        drop(stream);
        assert_eq!(connections.in_flight(), 0);
        assert_eq!(connections.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_deadline_closes_relay() {
        let connections = ConnectionTracker::default();
        let lease = connections.open("gpt-4o");
        let inner = futures_util::stream::pending::<Result<Bytes, Infallible>>();
        let mut stream = LeasedStream::new(
            inner,
            lease,
            Some(Instant::now() + Duration::from_secs(1)),
        );

        let item = stream.next().await.unwrap();
        assert!(item.is_err());
        assert_eq!(connections.released(), 1);
        assert!(stream.next().await.is_none());
        assert_eq!(connections.released(), 1);
    }

    #[test]
    fn test_lease_release_then_drop_counts_once() {
        let connections = ConnectionTracker::default();
        let lease = connections.open("m");
        lease.release();
        assert_eq!(connections.released(), 1);
        drop(connections.open("m"));
        assert_eq!(connections.opened(), 2);
        assert_eq!(connections.released(), 2);
    }

    #[test]
    fn test_error_detail_fallbacks() {
        assert_eq!(
            error_detail(&UpstreamBody::Json(json!({"error": {"message": "bad key"}}))),
            Some("bad key".to_string())
        );
        assert_eq!(
            error_detail(&UpstreamBody::Json(json!({"error": {"code": 429}}))),
            Some(r#"{"code":429}"#.to_string())
        );
        assert_eq!(
            error_detail(&UpstreamBody::Json(json!({"error": "quota exceeded"}))),
            Some("quota exceeded".to_string())
        );
        assert_eq!(
            error_detail(&UpstreamBody::Json(json!({"message": "no error key"}))),
            None
        );
        assert_eq!(error_detail(&UpstreamBody::Json(json!([1, 2]))), None);
        assert_eq!(
            error_detail(&UpstreamBody::Text("Bad Gateway".into())),
            Some("Bad Gateway".to_string())
        );
        assert_eq!(error_detail(&UpstreamBody::Text(String::new())), None);
    }
}
