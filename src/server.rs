//! Transport server builder and orchestration

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

use crate::config::{ConfigError, McpHttpConfig, ServerIdentity, StdioConfig, TransportConfig};
use crate::mcp::server::serve_mcp_http;
use crate::stdio::serve_stdio;
use crate::storage::MovieStore;
use crate::tools::ToolRegistry;

/// Transport server hosting a tool registry
///
/// Supports two transports:
/// - Stdio (line-delimited JSON-RPC, single session)
/// - MCP HTTP (session-multiplexed)
#[derive(Debug)]
pub struct TransportServer {
    registry: Arc<ToolRegistry>,
    identity: Arc<ServerIdentity>,
    config: TransportConfig,
}

impl TransportServer {
    /// Create a builder for configuring transports
    pub fn builder(registry: Arc<ToolRegistry>) -> TransportServerBuilder {
        TransportServerBuilder::new(registry)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Run the configured transport until `shutdown` resolves
    ///
    /// If stdio is configured it is the only transport served. For HTTP this
    /// returns once the listener has stopped and every session is closed.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(stdio_config) = self.config.stdio {
            if self.config.mcp_http.is_some() {
                tracing::warn!("Both stdio and MCP HTTP configured; serving stdio only");
            }
            return serve_stdio(self.registry, self.identity, stdio_config, shutdown).await;
        }

        let Some(mcp_config) = self.config.mcp_http else {
            tracing::warn!("No transports configured, nothing to serve");
            return Err(ConfigError::NoTransport.into());
        };

        let server = serve_mcp_http(self.registry, self.identity, mcp_config, shutdown).await?;
        tracing::info!("MCP Movies Server running on http://{}/mcp", server.local_addr);

        match server.handle.await {
            Ok(Ok(())) => tracing::info!("MCP server stopped"),
            Ok(Err(e)) => {
                tracing::error!("MCP server error: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                tracing::error!("MCP server task failed: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Await `transport`, then close `store`
///
/// The store is closed only after the transport future has finished, and
/// is closed even when the transport failed. The transport's result is
/// returned; a failed close is logged.
pub async fn serve_then_close<F>(transport: F, store: &dyn MovieStore) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = transport.await;
    if let Err(e) = &result {
        tracing::error!("Transport stopped with error: {}", e);
    }
    match store.close().await {
        Ok(()) => tracing::info!("Movie store closed"),
        Err(e) => tracing::error!("Failed to close movie store: {}", e),
    }
    result
}

/// Builder for configuring transport servers
#[derive(Debug)]
pub struct TransportServerBuilder {
    registry: Arc<ToolRegistry>,
    identity: ServerIdentity,
    config: TransportConfig,
}

impl TransportServerBuilder {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            identity: ServerIdentity::default(),
            config: TransportConfig::default(),
        }
    }

    pub fn with_identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Enable stdio transport (MCP-compatible)
    pub fn with_stdio(mut self) -> Self {
        self.config.stdio = Some(StdioConfig::default());
        self
    }

    /// Enable MCP HTTP transport on the specified port
    pub fn with_mcp_http(mut self, port: u16) -> Self {
        self.config.mcp_http = Some(McpHttpConfig::new(port));
        self
    }

    /// Enable MCP HTTP transport with custom configuration
    pub fn with_mcp_http_config(mut self, config: McpHttpConfig) -> Self {
        self.config.mcp_http = Some(config);
        self
    }

    /// Build the transport server
    pub fn build(self) -> Result<TransportServer> {
        self.config.validate()?;
        Ok(TransportServer {
            registry: self.registry,
            identity: Arc::new(self.identity),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InsertOutcome, Movie, MoviePatch, StorageError, UpdateOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    /// Store that only records when it is closed
    struct RecordingStore {
        log: Log,
        fail_close: bool,
    }

    #[async_trait]
    impl MovieStore for RecordingStore {
        async fn find(&self, _title: &str) -> Result<Option<Movie>, StorageError> {
            Ok(None)
        }

        async fn insert(&self, _movie: Movie) -> Result<InsertOutcome, StorageError> {
            unreachable!("not used during shutdown")
        }

        async fn update(&self, _title: &str, _patch: MoviePatch) -> Result<UpdateOutcome, StorageError> {
            unreachable!("not used during shutdown")
        }

        async fn list_titles(&self) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), StorageError> {
            self.log.lock().unwrap().push("store closed");
            if self.fail_close {
                return Err(StorageError::Closed);
            }
            Ok(())
        }
    }

    fn recording_store(fail_close: bool) -> (RecordingStore, Log) {
        let log = Log::default();
        (RecordingStore { log: log.clone(), fail_close }, log)
    }

    #[tokio::test]
    async fn store_closes_after_transport_stops() {
        let (store, log) = recording_store(false);
        let transport_log = log.clone();
        let transport = async move {
            tokio::task::yield_now().await;
            transport_log.lock().unwrap().push("transport stopped");
            Ok(())
        };
        serve_then_close(transport, &store).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["transport stopped", "store closed"]);
    }

    #[tokio::test]
    async fn store_closes_when_transport_fails() {
        let (store, log) = recording_store(false);
        let result = serve_then_close(async { Err(anyhow::anyhow!("bind failed")) }, &store).await;
        assert_eq!(result.unwrap_err().to_string(), "bind failed");
        assert_eq!(*log.lock().unwrap(), ["store closed"]);
    }

    #[tokio::test]
    async fn failed_close_keeps_transport_result() {
        let (store, log) = recording_store(true);
        serve_then_close(async { Ok(()) }, &store).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["store closed"]);
    }

    #[tokio::test]
    async fn http_transport_finishes_before_store_closes() {
        let (store, log) = recording_store(false);
        let registry = Arc::new(ToolRegistry::builder().build());
        let server = TransportServer::builder(registry)
            .with_mcp_http(0)
            .build()
            .unwrap();
        let transport_log = log.clone();
        let transport = async move {
            let result = server.serve(async {}).await;
            transport_log.lock().unwrap().push("transport stopped");
            result
        };
        serve_then_close(transport, &store).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["transport stopped", "store closed"]);
    }

    #[test]
    fn build_requires_a_transport() {
        let registry = Arc::new(ToolRegistry::builder().build());
        assert!(TransportServer::builder(registry.clone()).build().is_err());
        let server = TransportServer::builder(registry).with_mcp_http(0).build().unwrap();
        assert!(server.config().mcp_http.is_some());
    }

    #[tokio::test]
    async fn http_server_stops_on_shutdown() {
        let registry = Arc::new(ToolRegistry::builder().build());
        let server = TransportServer::builder(registry)
            .with_mcp_http(0)
            .build()
            .unwrap();
        server.serve(async {}).await.unwrap();
    }
}
