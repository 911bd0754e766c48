//! Per-session transport channel
//!
//! A [`TransportChannel`] owns one client conversation. It starts
//! `Uninitialized`, becomes `Active` when it answers an `initialize`
//! request (minting the session id at that moment), and ends `Closed`.
//! Lifecycle transitions are reported to registered [`ChannelObserver`]s.

use rmcp::model::{
    CallToolResult, Content, ErrorCode, ErrorData, Implementation, InitializeResult,
    ListToolsResult, ServerCapabilities,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use super::protocol::{
    negotiate_protocol_version, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use super::session::{SessionError, SessionId};
use crate::config::ServerIdentity;
use crate::tools::{ToolError, ToolRegistry};

/// Text returned to clients when a tool handler fails. Details stay in the log.
pub const TOOL_FAILURE_MESSAGE: &str = "Tool execution failed";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelState {
    Uninitialized,
    Active { session_id: SessionId },
    Closed,
}

/// Externally visible lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Uninitialized,
    Active,
    Closed,
}

/// Why a channel was closed; reported in [`ChannelEvent::Closed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent an explicit termination (HTTP DELETE)
    ClientTerminated,
    /// Input stream ended (stdio EOF)
    EndOfStream,
    /// Reading from or writing to the transport failed
    TransportError,
    /// No traffic within the configured idle window
    IdleTimeout,
    /// Server-wide shutdown
    Shutdown,
}

/// Lifecycle notification sent to every [`ChannelObserver`].
///
/// `Initialized` fires once, when the handshake succeeds. `Closed` fires
/// once, on the first close.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Initialized {
        session_id: SessionId,
        channel: Arc<TransportChannel>,
    },
    Closed {
        /// `None` when the channel closed before completing its handshake
        session_id: Option<SessionId>,
        reason: CloseReason,
    },
}

/// Receives lifecycle events. Called synchronously from the channel, outside
/// any channel lock.
pub trait ChannelObserver: Send + Sync {
    fn on_event(&self, event: &ChannelEvent);
}

/// What the transport should send back for one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelReply {
    Response(JsonRpcResponse),
    /// Notification consumed, nothing to send
    Accepted,
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// One client conversation.
///
/// Owns the handshake state machine and dispatches `ping`, `tools/list` and
/// `tools/call` to the shared [`ToolRegistry`]. Requests on one channel are
/// handled one at a time; separate channels run concurrently.
pub struct TransportChannel {
    registry: Arc<ToolRegistry>,
    identity: Arc<ServerIdentity>,
    state: Mutex<ChannelState>,
    // Held for the whole life cycle of one request
    turn: tokio::sync::Mutex<()>,
    observers: Vec<Arc<dyn ChannelObserver>>,
    created_at: SystemTime,
    last_activity: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportChannel {
    pub fn new(registry: Arc<ToolRegistry>, identity: Arc<ServerIdentity>) -> Self {
        Self {
            registry,
            identity,
            state: Mutex::new(ChannelState::Uninitialized),
            turn: tokio::sync::Mutex::new(()),
            observers: Vec::new(),
            created_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChannelObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn phase(&self) -> ChannelPhase {
        match &*lock(&self.state) {
            ChannelState::Uninitialized => ChannelPhase::Uninitialized,
            ChannelState::Active { .. } => ChannelPhase::Active,
            ChannelState::Closed => ChannelPhase::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == ChannelPhase::Closed
    }

    /// Session id, once the handshake has completed and until close
    pub fn session_id(&self) -> Option<SessionId> {
        match &*lock(&self.state) {
            ChannelState::Active { session_id } => Some(session_id.clone()),
            _ => None,
        }
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn emit(&self, event: &ChannelEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    /// Handle one inbound message to completion.
    ///
    /// Messages on the same channel are processed one at a time in arrival
    /// order. A request already past the closed check finishes even if the
    /// channel is closed meanwhile.
    pub async fn handle(self: &Arc<Self>, request: JsonRpcRequest) -> Result<ChannelReply, SessionError> {
        let _turn = self.turn.lock().await;
        self.touch();

        match self.phase() {
            ChannelPhase::Closed => return Err(SessionError::ChannelClosed),
            ChannelPhase::Uninitialized => return self.handshake(request),
            ChannelPhase::Active => {}
        }

        let Some(id) = request.id.clone() else {
            tracing::debug!("Notification {} accepted", request.method);
            return Ok(ChannelReply::Accepted);
        };

        let response = match request.method.as_str() {
            METHOD_INITIALIZE => JsonRpcResponse::failure(
                id,
                ErrorData::invalid_request("Server already initialized", None),
            ),
            METHOD_PING => JsonRpcResponse::success(id, json!({})),
            METHOD_TOOLS_LIST => {
                JsonRpcResponse::encode(id, &ListToolsResult::with_all_items(self.registry.list()))
            }
            METHOD_TOOLS_CALL => self.call_tool(id, request.params).await,
            other => {
                tracing::debug!("Unknown method {}", other);
                JsonRpcResponse::failure(
                    id,
                    ErrorData::new(
                        ErrorCode::METHOD_NOT_FOUND,
                        format!("Method not found: {other}"),
                        None,
                    ),
                )
            }
        };
        Ok(ChannelReply::Response(response))
    }

    fn handshake(self: &Arc<Self>, request: JsonRpcRequest) -> Result<ChannelReply, SessionError> {
        let id = match (&request.id, request.is_initialize()) {
            (Some(id), true) => id.clone(),
            _ => return Err(SessionError::NotInitialized),
        };

        let requested = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let result = InitializeResult {
            protocol_version: negotiate_protocol_version(requested),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.identity.name.clone(),
                version: self.identity.version.clone(),
                ..Default::default()
            },
            instructions: None,
        };

        let session_id = SessionId::generate();
        {
            let mut state = lock(&self.state);
            if *state != ChannelState::Uninitialized {
                return Err(SessionError::ChannelClosed);
            }
            *state = ChannelState::Active {
                session_id: session_id.clone(),
            };
        }
        tracing::info!("Session {} initialized", session_id);
        self.emit(&ChannelEvent::Initialized {
            session_id,
            channel: Arc::clone(self),
        });

        Ok(ChannelReply::Response(JsonRpcResponse::encode(id, &result)))
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                return JsonRpcResponse::failure(
                    id,
                    ErrorData::invalid_params("Missing params for tools/call", None),
                )
            }
            Err(e) => {
                return JsonRpcResponse::failure(
                    id,
                    ErrorData::invalid_params(format!("Invalid params for tools/call: {e}"), None),
                )
            }
        };

        tracing::debug!("Calling tool {}", params.name);
        let result = match self
            .registry
            .invoke(&params.name, params.arguments.as_ref())
            .await
        {
            Ok(result) => result,
            Err(ToolError::Validation { field, expected }) => {
                tracing::warn!("Rejected {} call: invalid `{}`", params.name, field);
                let message = format!("Invalid argument `{field}`: expected {expected}");
                return JsonRpcResponse::failure(
                    id,
                    ErrorData::invalid_params(
                        message,
                        Some(json!({ "field": field, "expected": expected })),
                    ),
                );
            }
            Err(ToolError::UnknownTool(name)) => {
                return JsonRpcResponse::failure(
                    id,
                    ErrorData::invalid_params(format!("Unknown tool: {name}"), None),
                );
            }
            Err(ToolError::Execution { tool, source }) => {
                tracing::error!("Tool {} failed: {}", tool, source);
                CallToolResult::error(vec![Content::text(TOOL_FAILURE_MESSAGE)])
            }
            Err(err @ (ToolError::DuplicateTool(_) | ToolError::InvalidSchema { .. })) => {
                tracing::error!("Registry error at request time: {}", err);
                return JsonRpcResponse::failure(id, ErrorData::internal_error("Internal error", None));
            }
        };

        JsonRpcResponse::encode(id, &result)
    }

    /// Move to `Closed`. Returns `false` if the channel was already closed;
    /// the closed event fires only on the first call.
    pub fn close(&self, reason: CloseReason) -> bool {
        let session_id = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, ChannelState::Closed) {
                ChannelState::Closed => return false,
                ChannelState::Active { session_id } => Some(session_id),
                ChannelState::Uninitialized => None,
            }
        };
        match &session_id {
            Some(id) => tracing::info!("Session {} closed ({:?})", id, reason),
            None => tracing::debug!("Uninitialized channel closed ({:?})", reason),
        }
        self.emit(&ChannelEvent::Closed { session_id, reason });
        true
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("state", &*lock(&self.state))
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{METHOD_INITIALIZE, NOTIFICATION_INITIALIZED};
    use crate::storage::StorageError;
    use crate::tools::{InputSchema, ParamKind, ParamSpec, ToolDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ChannelObserver for Recorder {
        fn on_event(&self, event: &ChannelEvent) {
            let entry = match event {
                ChannelEvent::Initialized { session_id, .. } => format!("init:{session_id}"),
                ChannelEvent::Closed { session_id, reason } => format!(
                    "closed:{}:{reason:?}",
                    session_id.as_ref().map(|s| s.to_string()).unwrap_or_default()
                ),
            };
            lock(&self.events).push(entry);
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut builder = ToolRegistry::builder();
        builder
            .register(ToolDescriptor::new(
                "shout",
                "Upper-case a word",
                InputSchema::new(vec![ParamSpec::required("word", ParamKind::String, "Word")]),
                |args: Value| async move {
                    let word = args["word"].as_str().unwrap_or_default().to_uppercase();
                    Ok(CallToolResult::success(vec![Content::text(word)]))
                },
            ))
            .unwrap()
            .register(ToolDescriptor::new(
                "explode",
                "Always fails",
                InputSchema::empty(),
                |_args: Value| async { Err(StorageError::Backend("secret detail".into())) },
            ))
            .unwrap();
        Arc::new(builder.build())
    }

    fn channel_with(recorder: Arc<Recorder>) -> Arc<TransportChannel> {
        Arc::new(
            TransportChannel::new(registry(), Arc::new(ServerIdentity::default()))
                .with_observer(recorder),
        )
    }

    fn initialize() -> JsonRpcRequest {
        JsonRpcRequest::new(
            0,
            METHOD_INITIALIZE,
            Some(json!({"protocolVersion": "2024-11-05", "capabilities": {}})),
        )
    }

    fn response(reply: ChannelReply) -> JsonRpcResponse {
        match reply {
            ChannelReply::Response(response) => response,
            ChannelReply::Accepted => panic!("expected a response"),
        }
    }

    async fn active_channel() -> (Arc<TransportChannel>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let channel = channel_with(recorder.clone());
        channel.handle(initialize()).await.unwrap();
        (channel, recorder)
    }

    #[tokio::test]
    async fn initialize_activates_and_fires_event_once() {
        let recorder = Arc::new(Recorder::default());
        let channel = channel_with(recorder.clone());
        assert_eq!(channel.phase(), ChannelPhase::Uninitialized);
        assert!(channel.session_id().is_none());

        let reply = response(channel.handle(initialize()).await.unwrap());
        assert_eq!(reply.result.as_ref().unwrap()["protocolVersion"], "2024-11-05");
        assert_eq!(
            reply.result.as_ref().unwrap()["serverInfo"]["name"],
            "my-movies-ai-mcp-server"
        );

        assert_eq!(channel.phase(), ChannelPhase::Active);
        let id = channel.session_id().unwrap();
        assert_eq!(*lock(&recorder.events), vec![format!("init:{id}")]);
    }

    #[tokio::test]
    async fn non_initialize_first_message_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let channel = channel_with(recorder.clone());

        let err = channel
            .handle(JsonRpcRequest::new(1, METHOD_TOOLS_LIST, None))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotInitialized));
        assert_eq!(channel.phase(), ChannelPhase::Uninitialized);
        assert!(lock(&recorder.events).is_empty());
    }

    #[tokio::test]
    async fn second_initialize_is_a_protocol_error() {
        let (channel, _) = active_channel().await;
        let reply = response(channel.handle(initialize()).await.unwrap());
        assert_eq!(reply.error.unwrap().code, ErrorCode::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn notifications_are_accepted() {
        let (channel, _) = active_channel().await;
        let reply = channel
            .handle(JsonRpcRequest::notification(NOTIFICATION_INITIALIZED))
            .await
            .unwrap();
        assert_eq!(reply, ChannelReply::Accepted);
    }

    #[tokio::test]
    async fn ping_and_unknown_method() {
        let (channel, _) = active_channel().await;
        let pong = response(channel.handle(JsonRpcRequest::new(2, METHOD_PING, None)).await.unwrap());
        assert_eq!(pong.result, Some(json!({})));

        let unknown = response(
            channel
                .handle(JsonRpcRequest::new(3, "resources/list", None))
                .await
                .unwrap(),
        );
        assert_eq!(unknown.error.unwrap().code, ErrorCode::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_list_returns_registered_tools() {
        let (channel, _) = active_channel().await;
        let reply = response(
            channel
                .handle(JsonRpcRequest::new(4, METHOD_TOOLS_LIST, None))
                .await
                .unwrap(),
        );
        let tools = reply.result.unwrap()["tools"].clone();
        assert_eq!(tools[0]["name"], "shout");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["word"]));
        assert_eq!(tools[1]["name"], "explode");
    }

    #[tokio::test]
    async fn tools_call_success_and_validation_failure() {
        let (channel, _) = active_channel().await;

        let ok = response(
            channel
                .handle(JsonRpcRequest::new(
                    5,
                    METHOD_TOOLS_CALL,
                    Some(json!({"name": "shout", "arguments": {"word": "dune"}})),
                ))
                .await
                .unwrap(),
        );
        assert_eq!(ok.result.unwrap()["content"][0]["text"], "DUNE");

        let bad = response(
            channel
                .handle(JsonRpcRequest::new(
                    6,
                    METHOD_TOOLS_CALL,
                    Some(json!({"name": "shout", "arguments": {"word": 42}})),
                ))
                .await
                .unwrap(),
        );
        let error = bad.error.unwrap();
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert_eq!(error.data.unwrap()["field"], "word");
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_params() {
        let (channel, _) = active_channel().await;
        let unknown = response(
            channel
                .handle(JsonRpcRequest::new(7, METHOD_TOOLS_CALL, Some(json!({"name": "nope"}))))
                .await
                .unwrap(),
        );
        assert_eq!(unknown.error.unwrap().code, ErrorCode::INVALID_PARAMS);

        let missing = response(
            channel
                .handle(JsonRpcRequest::new(8, METHOD_TOOLS_CALL, None))
                .await
                .unwrap(),
        );
        assert_eq!(missing.error.unwrap().code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn handler_failure_hides_details() {
        let (channel, _) = active_channel().await;
        let reply = response(
            channel
                .handle(JsonRpcRequest::new(9, METHOD_TOOLS_CALL, Some(json!({"name": "explode"}))))
                .await
                .unwrap(),
        );
        let result = reply.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["content"][0]["text"], TOOL_FAILURE_MESSAGE);
        assert!(!result.to_string().contains("secret detail"));
    }

    #[tokio::test]
    async fn close_fires_once_and_rejects_later_requests() {
        let (channel, recorder) = active_channel().await;
        let id = channel.session_id().unwrap();

        assert!(channel.close(CloseReason::ClientTerminated));
        assert!(!channel.close(CloseReason::Shutdown));
        assert_eq!(channel.phase(), ChannelPhase::Closed);
        assert_eq!(
            *lock(&recorder.events),
            vec![format!("init:{id}"), format!("closed:{id}:ClientTerminated")]
        );

        let err = channel
            .handle(JsonRpcRequest::new(10, METHOD_PING, None))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ChannelClosed));
    }

    #[tokio::test]
    async fn closed_before_handshake_cannot_initialize() {
        let recorder = Arc::new(Recorder::default());
        let channel = channel_with(recorder.clone());
        channel.close(CloseReason::Shutdown);
        let err = channel.handle(initialize()).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelClosed));
        assert_eq!(*lock(&recorder.events), vec!["closed::Shutdown".to_string()]);
    }

    fn gauge_registry(in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let mut builder = ToolRegistry::builder();
        builder
            .register(ToolDescriptor::new(
                "slow",
                "Sleeps briefly",
                InputSchema::empty(),
                move |_args: Value| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(CallToolResult::success(vec![]))
                    }
                },
            ))
            .unwrap();
        Arc::new(builder.build())
    }

    fn slow_call(id: i64) -> JsonRpcRequest {
        JsonRpcRequest::new(id, METHOD_TOOLS_CALL, Some(json!({"name": "slow"})))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn requests_on_one_channel_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(TransportChannel::new(
            gauge_registry(in_flight, peak.clone()),
            Arc::new(ServerIdentity::default()),
        ));
        channel.handle(initialize()).await.unwrap();

        let calls = (0..4).map(|i| {
            let channel = channel.clone();
            tokio::spawn(async move { channel.handle(slow_call(i)).await })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_channels_run_concurrently() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = gauge_registry(in_flight, peak.clone());
        let identity = Arc::new(ServerIdentity::default());

        let mut channels = Vec::new();
        for _ in 0..2 {
            let channel = Arc::new(TransportChannel::new(registry.clone(), identity.clone()));
            channel.handle(initialize()).await.unwrap();
            channels.push(channel);
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let calls = channels.into_iter().enumerate().map(|(i, channel)| {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                channel.handle(slow_call(i as i64)).await
            })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
