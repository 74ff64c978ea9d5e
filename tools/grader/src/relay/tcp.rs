//! Stream mode: raw bytes pumped both ways, each chunk accumulated into the
//! current stage's record for its direction.

use super::{RelayContext, RelaySettings};
use crate::logging::append_run_log;
use crate::types::Side;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

pub const STREAM_METHOD: &str = "TCP";

const CHUNK_SIZE: usize = 8192;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The server may still be binding its port, so keep trying for a while.
async fn connect_upstream(settings: &RelaySettings) -> Result<TcpStream, String> {
    let deadline = Instant::now() + settings.connect_retry;
    loop {
        match TcpStream::connect(settings.upstream_addr).await {
            Ok(stream) => return Ok(stream),
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(error) => return Err(format!("connect {}: {error}", settings.upstream_addr)),
        }
    }
}

async fn pump<R, W>(mut from: R, mut to: W, side: Side, context: &RelayContext) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let count = from.read(&mut buffer).await?;
        if count == 0 {
            let _ = to.shutdown().await;
            return Ok(total);
        }
        context.record(side, STREAM_METHOD, &buffer[..count], None);
        to.write_all(&buffer[..count]).await?;
        total += count as u64;
    }
}

pub(crate) async fn relay_connection(inbound: TcpStream, context: Arc<RelayContext>) {
    let upstream = match connect_upstream(&context.settings).await {
        Ok(stream) => stream,
        Err(error) => {
            context.record_failure(STREAM_METHOD, &error);
            return;
        }
    };
    let _ = inbound.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    let (client_read, client_write) = inbound.into_split();
    let (server_read, server_write) = upstream.into_split();

    // Whichever direction finishes first ends the pairing.
    let (closed_by, result) = tokio::select! {
        result = pump(client_read, server_write, Side::Server, &context) => (Side::Client, result),
        result = pump(server_read, client_write, Side::Client, &context) => (Side::Server, result),
    };
    match result {
        Ok(bytes) => append_run_log(
            "debug",
            "relay.stream.closed",
            json!({ "closed_by": closed_by.as_str(), "bytes": bytes }),
        ),
        Err(error) => append_run_log(
            "warn",
            "relay.stream.failed",
            json!({ "closed_by": closed_by.as_str(), "error": error.to_string() }),
        ),
    }
}
