//! Session controller — wires signaling, media and the negotiation engine
//! into one running call.
//!
//! Everything multiplexes through a single select loop: transport events,
//! engine outbound messages, peer events, media events and keyboard
//! controls. `end_call` is the only path out — it latches the transport
//! shut, sends LEAVE best-effort, tears down the peer connection and stops
//! local capture, whether the exit was a hang-up, Ctrl-C, a fatal engine
//! event or a terminal notification from the server.

use std::sync::Arc;

use anyhow::Result;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyModifiers};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};

use crate::call::engine::{EngineEvent, NegotiationEngine};
use crate::call::media::{CaptureSettings, MediaEvent, MediaSource, TrackKind};
use crate::call::peer::RtcPeerFactory;
use crate::call::CallRole;
use crate::signaling::transport::{session_url, SignalingTransport, TransportEvent};
use crate::signaling::SignalMessage;

/// Everything a call needs, resolved before it starts. The role comes from
/// session data (trainer offers, trainee answers) and never changes.
pub struct CallParams {
    pub server_url: String,
    pub token: String,
    pub session_id: String,
    pub role: CallRole,
    pub ice_servers: Vec<String>,
    pub capture: CaptureSettings,
}

/// Run one call to completion.
pub async fn run_call(params: CallParams) -> Result<()> {
    println!("Joining session {} as {}", params.session_id, params.role);

    // Media first. Acquisition failure is surfaced but does not stop the
    // call — a signaling-only session is still a session. Never retried
    // from here.
    let (media_tx, mut media_events) = mpsc::unbounded_channel();
    let mut source = MediaSource::new(params.capture.clone(), media_tx);
    if let Err(e) = source.acquire_camera_and_mic() {
        tracing::error!("Media acquisition failed: {:#}", e);
        println!("Warning: continuing without local media ({:#})", e);
    }
    let media = Arc::new(Mutex::new(source));

    let (peer_tx, mut peer_events) = mpsc::unbounded_channel();
    let factory = Arc::new(RtcPeerFactory::new(
        media.clone(),
        params.ice_servers.clone(),
        peer_tx,
    ));

    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
    let (engine_tx, mut engine_events) = mpsc::unbounded_channel();
    let mut engine = NegotiationEngine::new(params.role, factory, outbound_tx, engine_tx);

    let url = session_url(&params.server_url, &params.session_id, &params.token);
    let (transport, mut transport_events) = SignalingTransport::spawn(url);

    // Delayed re-offer after a connection failure comes back in through
    // this channel so the loop stays single-threaded.
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<()>();

    // Keyboard controls need raw mode; without a terminal (piped stdin)
    // the call still runs, ended by Ctrl-C or the server.
    let raw_mode = crossterm::terminal::enable_raw_mode().is_ok();
    if raw_mode {
        println!("Controls: [m]ute mic  [v]ideo on/off  [s]creen share  [q] hang up\r");
    }
    let mut keys = EventStream::new();

    loop {
        tokio::select! {
            ev = transport_events.recv() => {
                match ev {
                    Some(TransportEvent::Opened) => {
                        transport.send(SignalMessage::JoinSession);
                        transport.send(SignalMessage::Resync);
                        engine.on_transport_open();
                        if params.role == CallRole::Offerer {
                            if let Err(e) = engine.create_offer(false).await {
                                tracing::warn!("Offer failed: {}", e);
                            }
                        }
                    }
                    Some(TransportEvent::Message(msg)) => {
                        if msg.is_terminal() {
                            println!("Session ended by server ({:?})\r", msg);
                            break;
                        }
                        if let Err(e) = engine.handle_signal(msg).await {
                            // Negotiation noise; the round/state guards keep
                            // it from corrupting anything.
                            tracing::warn!("Negotiation step failed: {}", e);
                        }
                    }
                    Some(TransportEvent::Closed { will_retry }) => {
                        engine.on_transport_closed().await;
                        if !will_retry {
                            tracing::info!("Signaling channel permanently closed");
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(msg) = outbound.recv() => {
                transport.send(msg);
            }
            Some(ev) = peer_events.recv() => {
                if let Err(e) = engine.on_peer_event(ev).await {
                    tracing::warn!("Peer event handling failed: {}", e);
                }
            }
            Some(ev) = engine_events.recv() => {
                match ev {
                    EngineEvent::LinkUp => println!("Connected to peer\r"),
                    EngineEvent::LinkDown => tracing::warn!("Peer connection degraded"),
                    EngineEvent::ScheduleOfferRetry { delay } => {
                        let retry_tx = retry_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = retry_tx.send(());
                        });
                    }
                    EngineEvent::Fatal { reason } => {
                        println!("Call failed: {}\r", reason);
                        break;
                    }
                }
            }
            Some(()) = retry_rx.recv() => {
                if let Err(e) = engine.create_offer(true).await {
                    tracing::warn!("Re-offer after failure failed: {}", e);
                }
            }
            Some(ev) = media_events.recv() => {
                match ev {
                    MediaEvent::ScreenShareEnded => {
                        revert_screen_share(&media, &mut engine, &transport).await;
                    }
                }
            }
            key = keys.next(), if raw_mode => {
                match key {
                    Some(Ok(Event::Key(k))) => {
                        if handle_key(k, &media, &mut engine, &transport).await {
                            println!("Hanging up\r");
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => tracing::debug!("Key event error: {}", e),
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nHanging up\r");
                break;
            }
        }
    }

    end_call(transport, &mut engine, &media).await;
    if raw_mode {
        let _ = crossterm::terminal::disable_raw_mode();
    }
    Ok(())
}

/// The sanctioned teardown sequence: disable reconnects + LEAVE best-effort
/// + close transport, tear down the peer connection, stop local media.
async fn end_call(
    transport: SignalingTransport,
    engine: &mut NegotiationEngine,
    media: &Arc<Mutex<MediaSource>>,
) {
    transport.disconnect();
    engine.teardown().await;
    media.lock().await.stop_all();
    transport.join().await;
    println!("Call ended");
}

/// Returns true when the key means "hang up".
async fn handle_key(
    key: KeyEvent,
    media: &Arc<Mutex<MediaSource>>,
    engine: &mut NegotiationEngine,
    transport: &SignalingTransport,
) -> bool {
    match key.code {
        KeyCode::Char('m') => {
            media.lock().await.toggle_enabled(TrackKind::Audio);
            false
        }
        KeyCode::Char('v') => {
            media.lock().await.toggle_enabled(TrackKind::Video);
            false
        }
        KeyCode::Char('s') => {
            toggle_screen_share(media, engine, transport).await;
            false
        }
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => true,
        _ => false,
    }
}

/// Start or stop screen sharing. The swap replaces the video sender's track
/// on the live connection — the connection itself is untouched — followed
/// by exactly one renegotiation request.
async fn toggle_screen_share(
    media: &Arc<Mutex<MediaSource>>,
    engine: &mut NegotiationEngine,
    transport: &SignalingTransport,
) {
    let swapped = {
        let mut m = media.lock().await;
        if m.is_screen_sharing() {
            m.stop_screen_share();
            m.camera_track()
        } else {
            match m.acquire_screen_share() {
                Ok(track) => Some(track),
                Err(e) => {
                    println!("Screen share unavailable: {:#}\r", e);
                    return;
                }
            }
        }
    };
    if let Some(track) = swapped {
        if let Err(e) = engine.replace_video_track(track).await {
            tracing::warn!("Video track swap failed: {}", e);
        }
    }
    request_renegotiation(engine, transport).await;
}

/// The capture source went away on its own (e.g. the producer stopped):
/// fall back to the camera and renegotiate once.
async fn revert_screen_share(
    media: &Arc<Mutex<MediaSource>>,
    engine: &mut NegotiationEngine,
    transport: &SignalingTransport,
) {
    let camera = {
        let mut m = media.lock().await;
        if !m.is_screen_sharing() {
            return; // already reverted by a manual toggle
        }
        println!("Screen share source ended, back to camera\r");
        m.stop_screen_share();
        m.camera_track()
    };
    if let Some(track) = camera {
        if let Err(e) = engine.replace_video_track(track).await {
            tracing::warn!("Video track swap failed: {}", e);
        }
    }
    request_renegotiation(engine, transport).await;
}

/// Ask the offerer for a fresh offer after a track swap. When the local
/// side is the offerer the request is applied locally instead of waiting
/// for the peer to echo it back.
async fn request_renegotiation(engine: &mut NegotiationEngine, transport: &SignalingTransport) {
    transport.send(SignalMessage::RequestRenegotiation);
    if engine.role() == CallRole::Offerer {
        if let Err(e) = engine.handle_renegotiation_request().await {
            tracing::warn!("Local renegotiation failed: {}", e);
        }
    }
}
