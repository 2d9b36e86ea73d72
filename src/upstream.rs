//! # Upstream Call Stream Link
//!
//! WebSocket client for the call stream of one call.
//!
//! ## Tasks:
//! - **Reader**: forwards every text frame to the owning socket actor and
//!   reports exactly one `Closed` when the stream ends or errors.
//! - **Writer**: sends keepalive pings and the final close frame.
//!
//! `UpstreamLink::close` stops both tasks without waiting for the peer to
//! answer the close handshake. The link never reconnects. Losing it fails the call.

use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// Upper bound on flushing the close frame to an unresponsive peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the reader task reports to the socket actor.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    Frame(String),
    Closed(String),
}

#[derive(Debug)]
enum Outbound {
    Ping(i64),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The configured URL could not be turned into a request
    InvalidUrl(String),
    /// Handshake or TCP connect failed
    Connect(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::InvalidUrl(msg) => write!(f, "invalid call stream url: {}", msg),
            LinkError::Connect(msg) => write!(f, "could not connect to call stream: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// Substitute the call id into the configured stream URL template.
pub fn stream_url(template: &str, call_id: &str) -> String {
    template.replace("{call_id}", call_id)
}

/// Keepalive frame sent to the call stream.
pub fn ping_frame(timestamp_ms: i64) -> String {
    serde_json::json!({ "type": "ping", "timestamp": timestamp_ms }).to_string()
}

/// Handle to a connected link.
#[derive(Debug)]
pub struct UpstreamLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
}

impl UpstreamLink {
    pub fn send_ping(&self) {
        let _ = self.outbound.send(Outbound::Ping(chrono::Utc::now().timestamp_millis()));
    }

    /// Send the close frame and stop the reader. Nothing is reported back.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        let _ = self.shutdown.send(true);
    }
}

/// Connect to the call stream and spawn the reader and writer tasks.
pub async fn connect(url: &str, inbound: mpsc::UnboundedSender<UpstreamMessage>) -> Result<UpstreamLink, LinkError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .map_err(|e| LinkError::InvalidUrl(e.to_string()))?;

    info!(%url, "Connecting to call stream");
    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| LinkError::Connect(e.to_string()))?;
    info!(%url, "Call stream connected");

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let reason = loop {
            let next = tokio::select! {
                // Sender dropped counts as shutdown too.
                _ = shutdown_rx.wait_for(|closed| *closed) => {
                    debug!("Call stream reader stopped locally");
                    return;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(UpstreamMessage::Frame(text)).is_err() {
                        // Actor is gone, nobody to report to.
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    trace!(len = bytes.len(), "Ignoring binary frame from call stream");
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by peer ({}): {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by peer".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            }
        };
        debug!(%reason, "Call stream reader finished");
        let _ = inbound.send(UpstreamMessage::Closed(reason));
    });

    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Ping(timestamp) => {
                    if let Err(e) = sink.send(Message::Text(ping_frame(timestamp))).await {
                        warn!(error = %e, "Keepalive send failed");
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
            warn!("Timed out closing call stream");
        }
        debug!("Call stream writer finished");
    });

    Ok(UpstreamLink {
        outbound: tx,
        shutdown: shutdown_tx,
    })
}
