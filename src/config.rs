//! Configuration types for transport servers

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_SERVER_NAME: &str = "my-movies-ai-mcp-server";
/// Largest JSON-RPC message accepted by either transport
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bind host `{0}`")]
    InvalidHost(String),
    #[error("no transport configured")]
    NoTransport,
}

/// Name and version reported to clients during `initialize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Complete transport configuration
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub stdio: Option<StdioConfig>,
    pub mcp_http: Option<McpHttpConfig>,
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stdio.is_none() && self.mcp_http.is_none() {
            return Err(ConfigError::NoTransport);
        }
        Ok(())
    }
}

/// Stdio (line-delimited JSON-RPC) configuration
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Largest accepted line, in bytes
    pub max_line_bytes: usize,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Host/Origin allow-lists checked before any session work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsRebindingProtection {
    pub enabled: bool,
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
}

impl DnsRebindingProtection {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            allowed_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            allowed_origins: Vec::new(),
        }
    }

    /// `Host` header values match an entry either exactly or by hostname
    /// with the port stripped.
    pub fn host_allowed(&self, host: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(host) = host else {
            return false;
        };
        let bare = strip_port(host);
        self.allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host) || allowed.eq_ignore_ascii_case(bare))
    }

    /// Requests without an `Origin` pass; with an empty allow-list every
    /// origin is rejected.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            _ if !self.enabled => true,
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)),
        }
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:3001
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// MCP HTTP server configuration
#[derive(Debug, Clone)]
pub struct McpHttpConfig {
    pub addr: SocketAddr,
    pub dns_rebinding: DnsRebindingProtection,
    /// Close sessions idle for this long. `None` keeps them until closed.
    pub session_idle_timeout: Option<Duration>,
    /// Request bodies above this size are rejected with 413
    pub max_body_bytes: usize,
}

impl McpHttpConfig {
    /// Loopback bind on `port`
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            dns_rebinding: DnsRebindingProtection::default(),
            session_idle_timeout: None,
            max_body_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_host(mut self, host: &str) -> Result<Self, ConfigError> {
        let ip = match host {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other
                .parse()
                .map_err(|_| ConfigError::InvalidHost(other.to_string()))?,
        };
        self.addr.set_ip(ip);
        Ok(self)
    }

    pub fn with_dns_rebinding(mut self, protection: DnsRebindingProtection) -> Self {
        self.dns_rebinding = protection;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}

impl Default for McpHttpConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

/// Bind host for an application environment: loopback in development,
/// every interface otherwise
pub fn default_host(app_env: Option<&str>) -> &'static str {
    match app_env {
        Some(env) if env.eq_ignore_ascii_case("development") => "127.0.0.1",
        _ => "0.0.0.0",
    }
}
