//! Stdio transport - Line-delimited JSON-RPC over stdin/stdout
//!
//! One process, one session: every line goes to a single
//! [`TransportChannel`], which still has to see `initialize` first.

use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::{ServerIdentity, StdioConfig};
use crate::mcp::channel::{ChannelReply, CloseReason, TransportChannel};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use rmcp::model::ErrorData;
use crate::tools::ToolRegistry;

/// Serve the registry over stdio
///
/// Runs until stdin is closed or `shutdown` resolves.
pub async fn serve_stdio<F>(
    registry: Arc<ToolRegistry>,
    identity: Arc<ServerIdentity>,
    config: StdioConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tracing::info!("Starting stdio transport (MCP-compatible)");
    let channel = Arc::new(TransportChannel::new(registry, identity));
    let stdin = BufReader::new(tokio::io::stdin());
    serve_lines(channel, stdin, tokio::io::stdout(), config, shutdown).await
}

/// Line loop behind [`serve_stdio`], generic over the byte streams
pub async fn serve_lines<R, W, F>(
    channel: Arc<TransportChannel>,
    mut reader: R,
    mut writer: W,
    config: StdioConfig,
    shutdown: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let reason = loop {
        let line = tokio::select! {
            line = read_line(&mut reader, config.max_line_bytes) => line,
            _ = &mut shutdown => break CloseReason::Shutdown,
        };
        let response = match line {
            Ok(Line::Complete(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::debug!("Received request: {}", trimmed);
                handle_line(&channel, trimmed).await
            }
            Ok(Line::TooLong) => {
                tracing::warn!("Dropped stdin line over {} bytes", config.max_line_bytes);
                Some(JsonRpcResponse::failure(
                    Value::Null,
                    ErrorData::invalid_request("Message exceeds maximum size", None),
                ))
            }
            Ok(Line::Eof) => break CloseReason::EndOfStream,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                channel.close(CloseReason::TransportError);
                return Err(e.into());
            }
        };

        if let Some(response) = response {
            let encoded = serde_json::to_string(&response)?;
            writer.write_all(encoded.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            tracing::debug!("Sent response: {}", encoded);
        }
    };

    channel.close(reason);
    Ok(())
}

enum Line {
    Complete(Vec<u8>),
    /// Over the limit; the rest of the line was discarded unbuffered
    TooLong,
    Eof,
}

/// Read up to the next `\n`, buffering at most `max` bytes
async fn read_line<R>(reader: &mut R, max: usize) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (overflow, line.is_empty()) {
                (true, _) => Line::TooLong,
                (false, true) => Line::Eof,
                (false, false) => Line::Complete(line),
            });
        }

        let newline = available.iter().position(|&b| b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        if !overflow {
            if line.len() + chunk.len() > max {
                overflow = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);

        if newline.is_some() {
            return Ok(if overflow { Line::TooLong } else { Line::Complete(line) });
        }
    }
}

async fn handle_line(channel: &Arc<TransportChannel>, line: &str) -> Option<JsonRpcResponse> {
    let request = match JsonRpcRequest::from_slice(line.as_bytes()) {
        Ok(request) => request,
        Err(e) => {
            return Some(JsonRpcResponse::failure(
                Value::Null,
                ErrorData::new(e.code(), e.to_string(), None),
            ))
        }
    };

    let id = request.id.clone();
    match channel.handle(request).await {
        Ok(ChannelReply::Response(response)) => Some(response),
        Ok(ChannelReply::Accepted) => None,
        Err(e) => {
            tracing::warn!("Rejected stdio message: {}", e);
            id.map(|id| JsonRpcResponse::failure(id, ErrorData::new(e.code(), e.to_string(), None)))
        }
    }
}
