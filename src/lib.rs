//! Movies MCP - movie catalog tools over session-multiplexed MCP transports
//!
//! Tools are registered once in a [`ToolRegistry`] and served either over
//! HTTP, where every client conversation gets its own
//! [`TransportChannel`](mcp::TransportChannel) tracked by a
//! [`SessionStore`](mcp::SessionStore), or over stdio as a single session.
//!
//! ## Example
//!
//! ```rust,no_run
//! use movies_mcp::{movie_registry, InMemoryMovieStore, McpHttpConfig, TransportServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(InMemoryMovieStore::seeded());
//! let registry = Arc::new(movie_registry(store)?);
//!
//! TransportServer::builder(registry)
//!     .with_mcp_http_config(McpHttpConfig::new(3001))
//!     .build()?
//!     .serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod mcp;
pub mod server;
pub mod stdio;
pub mod storage;
pub mod tools;

// Re-export main API
pub use config::{
    ConfigError, DnsRebindingProtection, McpHttpConfig, ServerIdentity, StdioConfig,
    TransportConfig,
};
pub use server::{serve_then_close, TransportServer, TransportServerBuilder};
pub use storage::{InMemoryMovieStore, Movie, MoviePatch, MovieStore, StorageError};
pub use tools::movies::movie_registry;
pub use tools::{ToolDescriptor, ToolError, ToolRegistry};
