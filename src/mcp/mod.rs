//! MCP (Model Context Protocol) transport
//!
//! Session-multiplexed HTTP server plus the pieces it is built from: JSON-RPC
//! framing, per-session channels and the session store.

pub mod channel;
pub mod protocol;
pub mod server;
pub mod session;

pub use channel::{ChannelEvent, ChannelObserver, ChannelPhase, ChannelReply, CloseReason, TransportChannel};
pub use server::{mcp_router, serve_mcp_http, McpHttpError, McpHttpServer, SESSION_HEADER};
pub use session::{SessionError, SessionId, SessionStore};
