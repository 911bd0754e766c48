//! MCP HTTP server setup
//!
//! One `/mcp` route fronts every session. The `Mcp-Session-Id` header picks
//! the [`TransportChannel`](super::channel::TransportChannel); a request
//! without it gets a fresh channel that must complete the `initialize`
//! handshake before it is registered.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use rmcp::model::{ErrorCode, ErrorData};
use serde_json::{json, Value};
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;

use super::channel::{ChannelReply, CloseReason};
use super::protocol::{FramingError, JsonRpcRequest, JsonRpcResponse, SERVER_ERROR};
use super::session::{SessionError, SessionId, SessionStore};
use crate::config::{DnsRebindingProtection, McpHttpConfig, ServerIdentity};
use crate::tools::ToolRegistry;

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Shared state behind the `/mcp` routes
#[derive(Debug, Clone)]
pub struct McpState {
    pub sessions: SessionStore,
    pub config: Arc<McpHttpConfig>,
}

/// Failures rendered as JSON-RPC error bodies
#[derive(Debug, thiserror::Error)]
pub enum McpHttpError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Invalid Request: {}", .0.body_text())]
    Body(BytesRejection),
    #[error("Forbidden: invalid Host header")]
    ForbiddenHost,
    #[error("Forbidden: invalid Origin header")]
    ForbiddenOrigin,
    #[error("Unsupported Media Type: Content-Type must be application/json")]
    UnsupportedMediaType,
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("Bad Request: Mcp-Session-Id header is required")]
    MissingSession,
    #[error("Bad Request: malformed Mcp-Session-Id header")]
    InvalidSessionHeader,
}

impl McpHttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            McpHttpError::Framing(_) => StatusCode::BAD_REQUEST,
            McpHttpError::Session(SessionError::NotInitialized) => StatusCode::BAD_REQUEST,
            McpHttpError::Session(_) => StatusCode::NOT_FOUND,
            McpHttpError::Body(rejection) => rejection.status(),
            McpHttpError::ForbiddenHost | McpHttpError::ForbiddenOrigin => StatusCode::FORBIDDEN,
            McpHttpError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            McpHttpError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            McpHttpError::MissingSession | McpHttpError::InvalidSessionHeader => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            McpHttpError::Framing(e) => e.code(),
            McpHttpError::Session(e) => e.code(),
            McpHttpError::Body(_) => ErrorCode::INVALID_REQUEST,
            _ => SERVER_ERROR,
        }
    }
}

impl IntoResponse for McpHttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!("Rejected MCP request ({}): {}", status, self);
        let body = JsonRpcResponse::failure(Value::Null, ErrorData::new(self.code(), self.to_string(), None));
        let mut response = (status, Json(body)).into_response();
        if matches!(self, McpHttpError::MethodNotAllowed) {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST, DELETE"));
        }
        response
    }
}

/// Middleware to log all incoming HTTP requests
async fn log_request_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let session = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{} {} session={} -> {} ({:?})",
        method,
        uri,
        session,
        response.status(),
        started.elapsed()
    );
    response
}

/// Fallback handler for unmatched routes
async fn fallback_handler(method: Method, uri: axum::http::Uri) -> impl IntoResponse {
    tracing::warn!("Unmatched request {} {}", method, uri);
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Route not found",
            "received": { "method": method.as_str(), "path": uri.path() },
            "hint": "MCP endpoint is at /mcp. Send 'initialize' request first.",
            "available_endpoints": ["/mcp", "/debug"],
        })),
    )
}

/// Debug endpoint that returns server info
async fn debug_handler(State(state): State<McpState>) -> impl IntoResponse {
    Json(json!({
        "server": state.sessions.identity().name,
        "version": state.sessions.identity().version,
        "mcp_endpoint": "/mcp",
        "active_sessions": state.sessions.len(),
        "tools": state.sessions.registry().len(),
        "dns_rebinding_protection": state.config.dns_rebinding.enabled,
    }))
}

fn panic_response(_err: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("Request handler panicked");
    let body = JsonRpcResponse::failure(Value::Null, ErrorData::internal_error("Internal error", None));
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn check_dns_rebinding(protection: &DnsRebindingProtection, headers: &HeaderMap) -> Result<(), McpHttpError> {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !protection.host_allowed(host) {
        return Err(McpHttpError::ForbiddenHost);
    }
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !protection.origin_allowed(origin) {
        return Err(McpHttpError::ForbiddenOrigin);
    }
    Ok(())
}

fn session_header(headers: &HeaderMap) -> Result<Option<SessionId>, McpHttpError> {
    match headers.get(SESSION_HEADER) {
        None => Ok(None),
        Some(value) => match value.to_str() {
            Ok(id) if !id.trim().is_empty() => Ok(Some(SessionId::from(id.trim()))),
            _ => Err(McpHttpError::InvalidSessionHeader),
        },
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

fn with_session_header(mut response: Response, session_id: Option<SessionId>) -> Response {
    if let Some(id) = session_id {
        match HeaderValue::from_str(id.as_str()) {
            Ok(value) => {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            Err(e) => tracing::error!("Session id {} is not a valid header value: {}", id, e),
        }
    }
    response
}

async fn handle_mcp(
    State(state): State<McpState>,
    method: Method,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, McpHttpError> {
    check_dns_rebinding(&state.config.dns_rebinding, &headers)?;
    match method {
        Method::POST => {
            let body = body.map_err(McpHttpError::Body)?;
            handle_post(&state, &headers, &body).await
        }
        Method::DELETE => handle_delete(&state, &headers),
        _ => Err(McpHttpError::MethodNotAllowed),
    }
}

async fn handle_post(state: &McpState, headers: &HeaderMap, body: &[u8]) -> Result<Response, McpHttpError> {
    if !is_json(headers) {
        return Err(McpHttpError::UnsupportedMediaType);
    }
    let request = JsonRpcRequest::from_slice(body)?;

    let channel = match session_header(headers)? {
        Some(id) => state
            .sessions
            .get(&id)
            .ok_or(SessionError::UnknownSession(id))?,
        None => state.sessions.create(),
    };

    let reply = channel.handle(request).await?;
    let response = match reply {
        ChannelReply::Response(response) => (StatusCode::OK, Json(response)).into_response(),
        ChannelReply::Accepted => StatusCode::ACCEPTED.into_response(),
    };
    Ok(with_session_header(response, channel.session_id()))
}

fn handle_delete(state: &McpState, headers: &HeaderMap) -> Result<Response, McpHttpError> {
    let id = session_header(headers)?.ok_or(McpHttpError::MissingSession)?;
    if !state.sessions.close_session(&id, CloseReason::ClientTerminated) {
        return Err(SessionError::UnknownSession(id).into());
    }
    Ok(StatusCode::OK.into_response())
}

/// Axum router serving `/mcp` and `/debug` over `sessions`
pub fn mcp_router(sessions: SessionStore, config: McpHttpConfig) -> Router {
    let max_body_bytes = config.max_body_bytes;
    let state = McpState {
        sessions,
        config: Arc::new(config),
    };
    Router::new()
        .route("/mcp", any(handle_mcp))
        .route("/debug", any(debug_handler))
        .fallback(fallback_handler)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(log_request_middleware))
}

/// Running HTTP transport
#[derive(Debug)]
pub struct McpHttpServer {
    pub local_addr: SocketAddr,
    pub sessions: SessionStore,
    pub handle: JoinHandle<std::result::Result<(), std::io::Error>>,
}

/// Serve the MCP HTTP endpoint for `registry`
///
/// The server stops accepting connections once `shutdown` resolves, then
/// closes every remaining session before the task completes.
pub async fn serve_mcp_http<F>(
    registry: Arc<ToolRegistry>,
    identity: Arc<ServerIdentity>,
    config: McpHttpConfig,
    shutdown: F,
) -> Result<McpHttpServer>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("Starting MCP HTTP transport at http://{}/mcp", config.addr);
    if config.dns_rebinding.enabled {
        tracing::info!(
            "DNS rebinding protection enabled (hosts: {:?})",
            config.dns_rebinding.allowed_hosts
        );
    }

    let sessions = SessionStore::new(registry, identity);
    let reaper = config
        .session_idle_timeout
        .map(|timeout| sessions.spawn_idle_reaper(timeout));

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    let local_addr = listener.local_addr()?;
    let app = mcp_router(sessions.clone(), config);

    let task_sessions = sessions.clone();
    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        let closed = task_sessions.close_all(CloseReason::Shutdown);
        tracing::info!("MCP HTTP transport stopped, closed {} sessions", closed);
        result
    });

    Ok(McpHttpServer {
        local_addr,
        sessions,
        handle,
    })
}
