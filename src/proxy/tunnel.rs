//! Raw bidirectional relay between client and upstream.
//!
//! Used for opaque CONNECT targets (excluded from interception, or not
//! speaking TLS at all) and for WebSocket connections after the upgrade
//! head has been replayed to the upstream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::hooks::ProxyEvents;
use crate::http::{BoxedIo, BufferedConn};

const RELAY_CHUNK_SIZE: usize = 8192;

/// Relays bytes in both directions until either side reports EOF or an
/// error, then shuts both sides down.
///
/// Each transfer is reported to the `data_sent` (client to upstream) and
/// `data_received` (upstream to client) observers. The relay owns both
/// connections; when it returns they are closed.
pub(crate) async fn relay(
    mut client: BufferedConn<BoxedIo>,
    mut upstream: BufferedConn<BoxedIo>,
    events: &ProxyEvents,
) -> (u64, u64) {
    let mut client_chunk = [0u8; RELAY_CHUNK_SIZE];
    let mut upstream_chunk = [0u8; RELAY_CHUNK_SIZE];
    let mut sent = 0u64;
    let mut received = 0u64;

    loop {
        tokio::select! {
            read = client.read(&mut client_chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if upstream.write_all(&client_chunk[..count]).await.is_err()
                        || upstream.flush().await.is_err()
                    {
                        break;
                    }
                    sent += count as u64;
                    events.emit_data_sent(count);
                }
            },
            read = upstream.read(&mut upstream_chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if client.write_all(&upstream_chunk[..count]).await.is_err()
                        || client.flush().await.is_err()
                    {
                        break;
                    }
                    received += count as u64;
                    events.emit_data_received(count);
                }
            },
        }
    }

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    debug!(
        "tunnel closed: {} bytes client->upstream, {} bytes upstream->client",
        sent, received
    );
    (sent, received)
}
