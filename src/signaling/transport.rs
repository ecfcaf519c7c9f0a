//! Session signaling transport — WebSocket connection with keep-alive and
//! reconnection.
//!
//! One transport instance serves one call. It owns the socket on a spawned
//! task, surfaces decoded messages through an event channel, pings the server
//! every 25s while open, and reconnects with capped exponential backoff after
//! an unexpected close. An intentional leave latches the instance shut:
//! no further reconnect attempts are made for the rest of its life.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{encode_message, parse_message, SignalMessage};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Keep-alive cadence while the socket is open.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Reconnect backoff: 1.5s base, doubling, capped at 10s.
const BACKOFF_BASE_MS: u64 = 1500;
const BACKOFF_CAP_MS: u64 = 10_000;

/// What the session hears from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Socket (re)opened. The session re-joins and resyncs on every open.
    Opened,
    /// A decoded signaling message.
    Message(SignalMessage),
    /// Socket closed. `will_retry` is false only after an intentional leave
    /// (reconnection permanently disabled).
    Closed { will_retry: bool },
}

/// Handle to the running transport task.
pub struct SignalingTransport {
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    open: Arc<AtomicBool>,
    left: Arc<AtomicBool>,
    leave: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

/// Build the session-scoped signaling endpoint URL.
///
/// Auth is the bearer token as a query parameter; the server validates it
/// during the WebSocket handshake.
pub fn session_url(server_url: &str, session_id: &str, token: &str) -> String {
    let base = server_url
        .trim_end_matches('/')
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    format!("{}/signal/sessions/{}?token={}", base, session_id, token)
}

/// Delay before reconnect attempt number `attempt` (0-based).
fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

impl SignalingTransport {
    /// Spawn the transport task for `url`. Returns the handle and the event
    /// receiver the session loop consumes.
    pub fn spawn(url: String) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let left = Arc::new(AtomicBool::new(false));
        let leave = Arc::new(Notify::new());

        let task = tokio::spawn(run(
            url,
            event_tx,
            outgoing_rx,
            open.clone(),
            left.clone(),
            leave.clone(),
        ));

        (
            Self {
                outgoing: outgoing_tx,
                open,
                left,
                leave,
                task,
            },
            event_rx,
        )
    }

    /// Send a message, best-effort. When the channel is not open the message
    /// is dropped, not queued — delivery across a disconnect is the round
    /// counter's problem, not the transport's.
    pub fn send(&self, msg: SignalMessage) {
        if !self.open.load(Ordering::SeqCst) {
            tracing::debug!("Signaling channel not open, dropping {:?}", msg);
            return;
        }
        if self.outgoing.send(msg).is_err() {
            tracing::debug!("Signaling task gone, message dropped");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// True once `disconnect` has been called.
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Intentional leave: send LEAVE_SESSION best-effort, close the socket,
    /// and permanently disable reconnection for this instance.
    pub fn disconnect(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.open.load(Ordering::SeqCst) {
            let _ = self.outgoing.send(SignalMessage::LeaveSession);
        }
        self.leave.notify_one();
    }

    /// Wait for the transport task to finish (after `disconnect`).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Connection loop: connect, run the socket, decide whether to retry.
async fn run(
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outgoing: mpsc::UnboundedReceiver<SignalMessage>,
    open: Arc<AtomicBool>,
    left: Arc<AtomicBool>,
    leave: Arc<Notify>,
) {
    let mut attempt: u32 = 0;

    loop {
        if left.load(Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Closed { will_retry: false });
            return;
        }

        match SessionSocket::connect(&url).await {
            Ok(mut socket) => {
                attempt = 0;
                open.store(true, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Opened);

                let closed_by_leave =
                    run_io(&mut socket, &events, &mut outgoing, &leave).await;

                open.store(false, Ordering::SeqCst);
                let retry = !closed_by_leave && !left.load(Ordering::SeqCst);
                let _ = events.send(TransportEvent::Closed { will_retry: retry });
                if !retry {
                    return;
                }
            }
            Err(e) => {
                // Handshake/connect failures take the same reconnect path as
                // an unexpected close.
                tracing::warn!("Signaling connect failed: {:#}", e);
                if left.load(Ordering::SeqCst) {
                    let _ = events.send(TransportEvent::Closed { will_retry: false });
                    return;
                }
            }
        }

        let delay = backoff_delay(attempt);
        attempt += 1;
        tracing::info!("Reconnecting signaling channel in {:?}", delay);
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = leave.notified() => {
                let _ = events.send(TransportEvent::Closed { will_retry: false });
                return;
            }
        }
    }
}

/// Socket event loop for one connection. Returns true if the loop ended
/// because of an intentional leave.
async fn run_io(
    socket: &mut SessionSocket,
    events: &mpsc::UnboundedSender<TransportEvent>,
    outgoing: &mut mpsc::UnboundedReceiver<SignalMessage>,
    leave: &Notify,
) -> bool {
    let mut keepalive = time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            msg = socket.recv_msg() => {
                match msg {
                    Ok(Some(m)) => {
                        let _ = events.send(TransportEvent::Message(m));
                    }
                    Ok(None) => {
                        tracing::info!("Signaling channel closed by server");
                        return false;
                    }
                    Err(e) => {
                        tracing::warn!("Signaling recv error: {:#}", e);
                        return false;
                    }
                }
            }
            out = outgoing.recv() => {
                match out {
                    Some(m) => {
                        if let Err(e) = socket.send_msg(&m).await {
                            tracing::warn!("Signaling send failed: {:#}", e);
                            return false;
                        }
                    }
                    None => return false, // handle dropped
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = socket.send_msg(&SignalMessage::Ping).await {
                    tracing::warn!("Keep-alive send failed: {:#}", e);
                    return false;
                }
            }
            _ = leave.notified() => {
                // Flush whatever is queued (the LEAVE_SESSION among it),
                // then close. All best-effort.
                while let Ok(m) = outgoing.try_recv() {
                    let _ = socket.send_msg(&m).await;
                }
                let _ = socket.close().await;
                return true;
            }
        }
    }
}

/// Thin wrapper around the WebSocket stream: JSON encode/decode plus
/// protocol-level ping handling.
struct SessionSocket {
    stream: WsStream,
}

impl SessionSocket {
    async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting signaling channel");
        let (stream, response) = connect_async(url)
            .await
            .context("WebSocket connection failed")?;
        tracing::info!("Signaling channel connected (status={})", response.status());
        Ok(Self { stream })
    }

    async fn send_msg(&mut self, msg: &SignalMessage) -> Result<()> {
        let text = encode_message(msg);
        tracing::debug!("Signal send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send signaling message")
    }

    /// Receive the next decoded message.
    ///
    /// Transport pings are answered in place; JSON-level PING is answered
    /// with PONG and PONG itself is swallowed — neither reaches the caller.
    /// Returns `Ok(None)` when the server closes the connection.
    async fn recv_msg(&mut self) -> Result<Option<SignalMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("Signal recv: {}", text);
                    match parse_message(&text) {
                        Some(SignalMessage::Ping) => {
                            self.send_msg(&SignalMessage::Pong).await?;
                        }
                        Some(SignalMessage::Pong) => {
                            tracing::debug!("Keep-alive pong");
                        }
                        Some(msg) => return Ok(Some(msg)),
                        None => {} // malformed, already warned
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Signaling close frame: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("Signaling frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await.context("WebSocket close failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1500));
        assert_eq!(backoff_delay(1), Duration::from_millis(3000));
        assert_eq!(backoff_delay(2), Duration::from_millis(6000));
        assert_eq!(backoff_delay(3), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(10), Duration::from_millis(10_000));
        // Large attempt counts must not overflow the shift.
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_session_url() {
        assert_eq!(
            session_url("https://api.fitlink.example/", "s-42", "tok"),
            "wss://api.fitlink.example/signal/sessions/s-42?token=tok"
        );
        assert_eq!(
            session_url("http://localhost:8080", "s", "t"),
            "ws://localhost:8080/signal/sessions/s?token=t"
        );
    }

    #[tokio::test]
    async fn test_send_drops_when_not_open() {
        // Point at a URL that will never connect; the open flag stays false.
        let (transport, _events) =
            SignalingTransport::spawn("ws://127.0.0.1:1/signal/sessions/x?token=t".into());
        assert!(!transport.is_open());
        // Must not queue or panic.
        transport.send(SignalMessage::Ping);
        transport.disconnect();
        assert!(transport.has_left());
    }

    #[tokio::test]
    async fn test_leave_latch_stops_reconnect() {
        let (transport, mut events) =
            SignalingTransport::spawn("ws://127.0.0.1:1/signal/sessions/x?token=t".into());
        transport.disconnect();
        // The task must wind down with a terminal Closed event instead of
        // retrying forever.
        let ev = tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Closed { will_retry }) => return Some(will_retry),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .expect("transport did not close in time");
        assert_eq!(ev, Some(false));
        transport.join().await;
    }
}
