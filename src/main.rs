use anyhow::Result;
use clap::Parser;
use movies_mcp::config::{default_host, DEFAULT_PORT};
use movies_mcp::{
    movie_registry, serve_then_close, DnsRebindingProtection, InMemoryMovieStore, McpHttpConfig,
    TransportServer,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Movie catalog MCP server
#[derive(Debug, Parser)]
#[command(name = "movies-mcp", version, about)]
struct Cli {
    /// Port for the HTTP transport
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind host; defaults to loopback in development, all interfaces otherwise
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Application environment (`development`, `production`, ...)
    #[arg(long = "env", env = "APP_ENV")]
    app_env: Option<String>,

    /// Reject requests whose Host/Origin headers are not allow-listed
    #[arg(long, env = "ENABLE_DNS_REBINDING_PROTECTION")]
    enable_dns_rebinding_protection: bool,

    #[arg(long, env = "ALLOWED_HOSTS", value_delimiter = ',')]
    allowed_hosts: Vec<String>,

    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Close sessions idle for this many seconds
    #[arg(long, env = "SESSION_IDLE_TIMEOUT_SECS")]
    session_idle_timeout_secs: Option<u64>,

    /// Serve a single session over stdin/stdout instead of HTTP
    #[arg(long)]
    stdio: bool,
}

impl Cli {
    fn http_config(&self) -> Result<McpHttpConfig> {
        let host = self
            .host
            .as_deref()
            .unwrap_or_else(|| default_host(self.app_env.as_deref()));
        let mut config = McpHttpConfig::new(self.port).with_host(host)?;

        if self.enable_dns_rebinding_protection {
            let mut protection = DnsRebindingProtection::enabled();
            if !self.allowed_hosts.is_empty() {
                protection.allowed_hosts = self.allowed_hosts.clone();
            }
            protection.allowed_origins = self.allowed_origins.clone();
            config = config.with_dns_rebinding(protection);
        }
        if let Some(secs) = self.session_idle_timeout_secs {
            config = config.with_idle_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received, shutting down"),
        Err(e) => {
            tracing::error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays free for the stdio transport
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let store = Arc::new(InMemoryMovieStore::seeded());
    let registry = Arc::new(movie_registry(store.clone())?);

    let builder = TransportServer::builder(registry);
    let builder = if cli.stdio {
        builder.with_stdio()
    } else {
        builder.with_mcp_http_config(cli.http_config()?)
    };

    let transport = builder.build()?.serve(shutdown_signal());
    let result = serve_then_close(transport, &*store).await;
    tracing::info!("Shutdown complete");
    result
}
