//! The peer-connection seam.
//!
//! `PeerLink` is the narrow surface the negotiation engine drives; `RtcPeer`
//! implements it over `webrtc::RTCPeerConnection`. The engine rebuilds peers
//! (stale offers, hard failures), so construction goes through a factory.
//! Each built peer gets a monotonically increasing epoch, and every event it
//! emits carries that epoch — callbacks from a discarded peer can still fire
//! after a rebuild, and the engine drops them by epoch the same way it drops
//! stale wire messages by round.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::call::media::MediaSource;
use crate::signaling::IceCandidateBlob;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("no video sender to replace")]
    NoVideoSender,
}

/// Which half of the SDP exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Coarse connection health, mapped from the peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An event from a built peer, tagged with its epoch.
#[derive(Debug)]
pub struct PeerEvent {
    pub epoch: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    /// A locally gathered ICE candidate ready to signal to the remote side.
    IceCandidate(IceCandidateBlob),
    StateChanged(PeerState),
}

/// The operations the negotiation engine needs from a peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn signaling_state(&self) -> RTCSignalingState;
    async fn create_offer(&self) -> Result<String, PeerError>;
    async fn create_answer(&self) -> Result<String, PeerError>;
    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidateBlob) -> Result<(), PeerError>;
    /// Swap the video sender's track without renegotiating.
    async fn replace_video_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), PeerError>;
    async fn close(&self);
}

/// A built peer plus the epoch its events carry.
pub struct PeerHandle {
    pub peer: Arc<dyn PeerLink>,
    pub epoch: u64,
}

/// Builds fresh peer connections for the engine.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<PeerHandle, PeerError>;
}

/// Production `PeerLink` over an `RTCPeerConnection`.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

fn description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, PeerError> {
    let desc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(desc)
}

#[async_trait]
impl PeerLink for RtcPeer {
    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        self.pc.set_local_description(description(kind, sdp)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        self.pc.set_remote_description(description(kind, sdp)?).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateBlob) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), PeerError> {
        let sender = self.video_sender.lock().await;
        match sender.as_ref() {
            Some(s) => {
                s.replace_track(Some(track)).await?;
                Ok(())
            }
            None => Err(PeerError::NoVideoSender),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Peer connection close: {}", e);
        }
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(PeerState::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Factory for production peers: default codecs and interceptors, the
/// configured ICE servers, and the current local tracks attached as senders.
pub struct RtcPeerFactory {
    media: Arc<Mutex<MediaSource>>,
    ice_servers: Vec<String>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_epoch: AtomicU64,
}

impl RtcPeerFactory {
    pub fn new(
        media: Arc<Mutex<MediaSource>>,
        ice_servers: Vec<String>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            media,
            ice_servers,
            events,
            next_epoch: AtomicU64::new(1),
        }
    }
}

/// Senders keep interceptor state (NACK/RR) flowing only while something
/// reads their RTCP; drain it in the background.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut buf).await {}
    });
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self) -> Result<PeerHandle, PeerError> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        tracing::info!("Built peer connection (epoch {})", epoch);

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!("ICE candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let blob = IceCandidateBlob {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = events.send(PeerEvent {
                            epoch,
                            kind: PeerEventKind::IceCandidate(blob),
                        });
                    }
                    Err(e) => tracing::warn!("Could not serialize ICE candidate: {}", e),
                }
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                tracing::info!("Peer connection state: {}", state);
                if let Some(mapped) = map_state(state) {
                    let _ = events.send(PeerEvent {
                        epoch,
                        kind: PeerEventKind::StateChanged(mapped),
                    });
                }
            })
        }));

        // Remote media is consumed for liveness only; rendering it is the
        // web client's job, not this one's.
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            Box::pin(async move {
                tracing::info!(
                    "Receiving remote {} track ({})",
                    track.kind(),
                    track.codec().capability.mime_type
                );
            })
        }));

        let mut video_sender = None;
        {
            let media = self.media.lock().await;
            if let Some(track) = media.audio_track() {
                let sender = pc
                    .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                drain_rtcp(sender);
            }
            if let Some(track) = media.active_video_track() {
                let sender = pc
                    .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                drain_rtcp(sender.clone());
                video_sender = Some(sender);
            }
        }

        let peer = Arc::new(RtcPeer {
            pc,
            video_sender: Mutex::new(video_sender),
        });

        Ok(PeerHandle { peer, epoch })
    }
}
