//! Negotiation engine — the state machine that decides when to offer, how to
//! apply remote descriptions, and which messages are stale.
//!
//! One engine instance serves one call. The signaling channel does not
//! guarantee arrival order, so every offer cycle carries a round number
//! (`nid`): the offerer increments it per offer, the answerer adopts it from
//! the offer it answers, and anything tagged with a different round is
//! dropped without side effects. Signaling-state guards cover what round
//! numbers cannot (e.g. a duplicate answer inside the same round).
//!
//! The engine never cancels an in-flight SDP operation; recovery is always
//! discard-the-peer-and-rebuild. Stale events from a discarded peer are
//! filtered by epoch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_local::TrackLocal;

use crate::call::peer::{
    PeerError, PeerEvent, PeerEventKind, PeerFactory, PeerLink, PeerState, SdpKind,
};
use crate::call::CallRole;
use crate::signaling::{IceCandidateBlob, SignalMessage};

/// Delay before the single post-failure re-offer.
const OFFER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Events the engine surfaces to the session controller.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Media path is up.
    LinkUp,
    /// Transient degradation; the ICE layer may still recover on its own.
    LinkDown,
    /// The offerer should call `create_offer(true)` after `delay`.
    ScheduleOfferRetry { delay: Duration },
    /// Unrecoverable; the session must end or be restarted explicitly.
    Fatal { reason: String },
}

pub struct NegotiationEngine {
    role: CallRole,
    factory: Arc<dyn PeerFactory>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<EngineEvent>,

    /// Current peer connection; `None` is the unattached state.
    link: Option<Arc<dyn PeerLink>>,
    /// Epoch of `link`; 0 while unattached. Peer events from any other
    /// epoch are stale.
    epoch: u64,
    /// Current negotiation round. Monotonic for the offerer; adopted from
    /// incoming offers by the answerer. Survives peer rebuilds — a fresh
    /// connection continues from "next round", never back to zero.
    round: u64,
    /// Set once an offer went out for the current round.
    offer_outstanding: bool,
    transport_open: bool,
    /// Remote candidates received before a remote description exists.
    /// Flushed FIFO exactly once, then never replayed.
    pending_ice: VecDeque<IceCandidateBlob>,
    consecutive_failures: u32,
}

impl NegotiationEngine {
    pub fn new(
        role: CallRole,
        factory: Arc<dyn PeerFactory>,
        outbound: mpsc::UnboundedSender<SignalMessage>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            role,
            factory,
            outbound,
            events,
            link: None,
            epoch: 0,
            round: 0,
            offer_outstanding: false,
            transport_open: false,
            pending_ice: VecDeque::new(),
            consecutive_failures: 0,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    #[cfg(test)]
    fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn on_transport_open(&mut self) {
        self.transport_open = true;
    }

    /// The signaling channel dropped: every piece of in-flight negotiation
    /// state goes with it. A successful reopen starts a fresh cycle.
    pub async fn on_transport_closed(&mut self) {
        self.transport_open = false;
        self.detach_peer().await;
    }

    /// Full teardown (end of call). The engine is unusable for offers until
    /// the transport reopens.
    pub async fn teardown(&mut self) {
        self.transport_open = false;
        self.detach_peer().await;
    }

    async fn detach_peer(&mut self) {
        if let Some(peer) = self.link.take() {
            peer.close().await;
        }
        self.epoch = 0;
        self.offer_outstanding = false;
        self.pending_ice.clear();
    }

    async fn ensure_peer(&mut self) -> Result<Arc<dyn PeerLink>, PeerError> {
        if let Some(peer) = &self.link {
            return Ok(peer.clone());
        }
        let handle = self.factory.create().await?;
        self.link = Some(handle.peer.clone());
        self.epoch = handle.epoch;
        Ok(handle.peer)
    }

    fn send(&self, msg: SignalMessage) {
        if self.outbound.send(msg).is_err() {
            tracing::debug!("Engine outbound channel closed");
        }
    }

    /// Produce and send a fresh offer.
    ///
    /// Offerer-only. Skipped (not queued, not forced) unless the transport
    /// is open and the connection is in stable signaling state; skipped when
    /// an offer is already out for the current round, unless `force`.
    /// At most one unconfirmed offer is in flight per round.
    pub async fn create_offer(&mut self, force: bool) -> Result<(), PeerError> {
        if self.role != CallRole::Offerer {
            tracing::warn!("Protocol violation: create_offer called on the answerer side");
            return Ok(());
        }
        if !self.transport_open {
            tracing::debug!("Not offering: signaling channel not open");
            return Ok(());
        }
        if self.offer_outstanding && !force {
            tracing::debug!("Not offering: offer already sent for round {}", self.round);
            return Ok(());
        }
        let peer = self.ensure_peer().await?;
        let state = peer.signaling_state();
        if state != RTCSignalingState::Stable {
            tracing::debug!("Not offering: signaling state is {}", state);
            return Ok(());
        }

        let sdp = peer.create_offer().await?;
        self.round += 1;
        peer.set_local_description(SdpKind::Offer, sdp.clone()).await?;
        self.offer_outstanding = true;
        self.send(SignalMessage::Offer {
            sdp,
            nid: self.round,
        });
        tracing::info!("Sent offer (round {})", self.round);
        Ok(())
    }

    /// Route an incoming signaling message to its handler.
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Result<(), PeerError> {
        match msg {
            SignalMessage::Offer { sdp, nid } => self.handle_offer(sdp, nid).await,
            SignalMessage::Answer { sdp, nid } => self.handle_answer(sdp, nid).await,
            SignalMessage::IceCandidate { candidate, nid } => {
                self.handle_ice(candidate, nid).await
            }
            SignalMessage::RequestRenegotiation => self.handle_renegotiation_request().await,
            other => {
                tracing::debug!("Engine ignoring non-negotiation message {:?}", other);
                Ok(())
            }
        }
    }

    /// Apply a remote offer and answer it. Answerer-only.
    ///
    /// A half-negotiated existing connection is discarded and rebuilt —
    /// correctness over continuity. The offer's round number is adopted
    /// verbatim: the offering side is authoritative for rounds.
    async fn handle_offer(&mut self, sdp: String, nid: u64) -> Result<(), PeerError> {
        if self.role != CallRole::Answerer {
            tracing::warn!("Protocol violation: OFFER received while acting as offerer, ignored");
            return Ok(());
        }
        if let Some(peer) = &self.link {
            let state = peer.signaling_state();
            if state != RTCSignalingState::Stable {
                tracing::info!(
                    "Discarding half-negotiated connection (state {}) for fresh offer",
                    state
                );
                self.detach_peer().await;
            }
        }
        let peer = self.ensure_peer().await?;
        self.round = nid;
        peer.set_remote_description(SdpKind::Offer, sdp).await?;
        self.flush_pending_ice(&peer).await;
        let answer = peer.create_answer().await?;
        peer.set_local_description(SdpKind::Answer, answer.clone()).await?;
        self.send(SignalMessage::Answer { sdp: answer, nid });
        tracing::info!("Answered offer (round {})", nid);
        Ok(())
    }

    /// Apply a remote answer. Offerer-only.
    ///
    /// Dropped unless the round matches exactly and we are still awaiting an
    /// answer — both are expected stale-message noise, not errors.
    async fn handle_answer(&mut self, sdp: String, nid: u64) -> Result<(), PeerError> {
        if self.role != CallRole::Offerer {
            tracing::warn!("Protocol violation: ANSWER received while acting as answerer, ignored");
            return Ok(());
        }
        if nid != self.round {
            tracing::debug!("Ignoring stale answer (nid {}, current round {})", nid, self.round);
            return Ok(());
        }
        let Some(peer) = self.link.clone() else {
            tracing::debug!("Ignoring answer: no peer connection");
            return Ok(());
        };
        let state = peer.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            tracing::debug!("Ignoring answer in signaling state {}", state);
            return Ok(());
        }
        peer.set_remote_description(SdpKind::Answer, sdp).await?;
        self.flush_pending_ice(&peer).await;
        tracing::info!("Answer applied (round {})", nid);
        Ok(())
    }

    /// Apply or queue a remote ICE candidate.
    async fn handle_ice(&mut self, candidate: IceCandidateBlob, nid: u64) -> Result<(), PeerError> {
        if nid != self.round {
            tracing::debug!(
                "Dropping ICE candidate for round {} (current round {})",
                nid,
                self.round
            );
            return Ok(());
        }
        let Some(peer) = self.link.clone() else {
            self.pending_ice.push_back(candidate);
            return Ok(());
        };
        if peer.has_remote_description().await {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply ICE candidate: {}", e);
            }
        } else {
            self.pending_ice.push_back(candidate);
        }
        Ok(())
    }

    async fn flush_pending_ice(&mut self, peer: &Arc<dyn PeerLink>) {
        if self.pending_ice.is_empty() {
            return;
        }
        let count = self.pending_ice.len();
        while let Some(candidate) = self.pending_ice.pop_front() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply queued ICE candidate: {}", e);
            }
        }
        tracing::debug!("Flushed {} queued ICE candidates", count);
    }

    /// The other side replaced a track and wants a fresh offer. The offerer
    /// clears its per-round guard and re-offers; the answerer has nothing
    /// to do.
    pub async fn handle_renegotiation_request(&mut self) -> Result<(), PeerError> {
        match self.role {
            CallRole::Offerer => {
                tracing::info!("Renegotiation requested, producing fresh offer");
                self.offer_outstanding = false;
                self.create_offer(false).await
            }
            CallRole::Answerer => {
                tracing::debug!("Ignoring renegotiation request as answerer");
                Ok(())
            }
        }
    }

    /// Swap the live connection's video sender track (screen-share toggle).
    /// No-op while unattached.
    pub async fn replace_video_track(
        &mut self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), PeerError> {
        match self.link.clone() {
            Some(peer) => peer.replace_video_track(track).await,
            None => {
                tracing::debug!("No peer connection, track swap deferred to next build");
                Ok(())
            }
        }
    }

    /// Feed a peer event (ICE gathered, connection state change) into the
    /// machine. Events from a discarded peer are dropped by epoch.
    pub async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), PeerError> {
        if event.epoch != self.epoch {
            tracing::debug!(
                "Dropping event from stale peer (epoch {}, current {})",
                event.epoch,
                self.epoch
            );
            return Ok(());
        }
        match event.kind {
            PeerEventKind::IceCandidate(blob) => {
                self.send(SignalMessage::IceCandidate {
                    candidate: blob,
                    nid: self.round,
                });
                Ok(())
            }
            PeerEventKind::StateChanged(state) => {
                match state {
                    PeerState::Connected => {
                        self.consecutive_failures = 0;
                        let _ = self.events.send(EngineEvent::LinkUp);
                    }
                    PeerState::Disconnected => {
                        let _ = self.events.send(EngineEvent::LinkDown);
                    }
                    PeerState::Failed => self.on_peer_failed().await,
                    PeerState::Connecting | PeerState::Closed => {
                        tracing::debug!("Peer state: {:?}", state);
                    }
                }
                Ok(())
            }
        }
    }

    /// Hard failure: tear the connection down entirely. The offerer gets
    /// exactly one delayed re-offer; a second consecutive failure is fatal
    /// and the surrounding session must be restarted explicitly.
    async fn on_peer_failed(&mut self) {
        tracing::warn!("Peer connection failed, tearing down");
        self.detach_peer().await;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= 2 {
            let _ = self.events.send(EngineEvent::Fatal {
                reason: "peer connection failed twice in a row".into(),
            });
            return;
        }
        if self.role == CallRole::Offerer {
            let _ = self.events.send(EngineEvent::ScheduleOfferRetry {
                delay: OFFER_RETRY_DELAY,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use webrtc::api::media_engine::MIME_TYPE_H264;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    use crate::call::peer::PeerHandle;

    /// Peer double that records every call and mimics the signaling-state
    /// transitions of the real connection.
    struct FakePeer {
        state: StdMutex<RTCSignalingState>,
        remote_set: AtomicBool,
        applied_ice: StdMutex<Vec<String>>,
        remote_descs: StdMutex<Vec<(SdpKind, String)>>,
        replaced_tracks: StdMutex<Vec<String>>,
        closed: AtomicBool,
        sdp_counter: AtomicU64,
    }

    impl FakePeer {
        fn new() -> Self {
            Self {
                state: StdMutex::new(RTCSignalingState::Stable),
                remote_set: AtomicBool::new(false),
                applied_ice: StdMutex::new(Vec::new()),
                remote_descs: StdMutex::new(Vec::new()),
                replaced_tracks: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                sdp_counter: AtomicU64::new(0),
            }
        }

        fn set_state(&self, state: RTCSignalingState) {
            *self.state.lock().unwrap() = state;
        }

        fn applied_ice(&self) -> Vec<String> {
            self.applied_ice.lock().unwrap().clone()
        }

        fn remote_descs(&self) -> Vec<(SdpKind, String)> {
            self.remote_descs.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerLink for FakePeer {
        fn signaling_state(&self) -> RTCSignalingState {
            *self.state.lock().unwrap()
        }

        async fn create_offer(&self) -> Result<String, PeerError> {
            let n = self.sdp_counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("offer-sdp-{}", n))
        }

        async fn create_answer(&self) -> Result<String, PeerError> {
            let n = self.sdp_counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("answer-sdp-{}", n))
        }

        async fn set_local_description(&self, kind: SdpKind, _sdp: String) -> Result<(), PeerError> {
            self.set_state(match kind {
                SdpKind::Offer => RTCSignalingState::HaveLocalOffer,
                SdpKind::Answer => RTCSignalingState::Stable,
            });
            Ok(())
        }

        async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
            self.remote_descs.lock().unwrap().push((kind, sdp));
            self.remote_set.store(true, Ordering::SeqCst);
            self.set_state(match kind {
                SdpKind::Offer => RTCSignalingState::HaveRemoteOffer,
                SdpKind::Answer => RTCSignalingState::Stable,
            });
            Ok(())
        }

        async fn has_remote_description(&self) -> bool {
            self.remote_set.load(Ordering::SeqCst)
        }

        async fn add_ice_candidate(&self, candidate: IceCandidateBlob) -> Result<(), PeerError> {
            self.applied_ice.lock().unwrap().push(candidate.candidate);
            Ok(())
        }

        async fn replace_video_track(
            &self,
            track: Arc<dyn TrackLocal + Send + Sync>,
        ) -> Result<(), PeerError> {
            self.replaced_tracks.lock().unwrap().push(track.id().to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        peers: StdMutex<Vec<Arc<FakePeer>>>,
        next_epoch: AtomicU64,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                peers: StdMutex::new(Vec::new()),
                next_epoch: AtomicU64::new(1),
            }
        }

        fn peer(&self, idx: usize) -> Arc<FakePeer> {
            self.peers.lock().unwrap()[idx].clone()
        }

        fn built(&self) -> usize {
            self.peers.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create(&self) -> Result<PeerHandle, PeerError> {
            let peer = Arc::new(FakePeer::new());
            self.peers.lock().unwrap().push(peer.clone());
            Ok(PeerHandle {
                peer,
                epoch: self.next_epoch.fetch_add(1, Ordering::SeqCst),
            })
        }
    }

    struct Rig {
        engine: NegotiationEngine,
        factory: Arc<FakeFactory>,
        outbound: mpsc::UnboundedReceiver<SignalMessage>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    fn rig(role: CallRole) -> Rig {
        let factory = Arc::new(FakeFactory::new());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let mut engine = NegotiationEngine::new(role, factory.clone(), out_tx, ev_tx);
        engine.on_transport_open();
        Rig {
            engine,
            factory,
            outbound: out_rx,
            events: ev_rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SignalMessage>) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn blob(name: &str) -> IceCandidateBlob {
        IceCandidateBlob {
            candidate: name.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_offer_suppressed() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        r.engine.create_offer(false).await.unwrap();
        let sent = drain(&mut r.outbound);
        assert_eq!(sent.len(), 1, "exactly one OFFER for the round: {:?}", sent);
        assert!(matches!(sent[0], SignalMessage::Offer { nid: 1, .. }));
        assert_eq!(r.engine.round(), 1);
        assert_eq!(r.factory.built(), 1);
    }

    #[tokio::test]
    async fn test_offer_requires_open_transport() {
        let mut r = rig(CallRole::Offerer);
        r.engine.on_transport_closed().await;
        r.engine.create_offer(false).await.unwrap();
        assert!(drain(&mut r.outbound).is_empty());
        assert_eq!(r.engine.round(), 0);
    }

    #[tokio::test]
    async fn test_answerer_never_offers() {
        let mut r = rig(CallRole::Answerer);
        r.engine.create_offer(false).await.unwrap();
        r.engine.create_offer(true).await.unwrap();
        assert!(drain(&mut r.outbound).is_empty());
        assert_eq!(r.factory.built(), 0);
    }

    #[tokio::test]
    async fn test_offer_skipped_outside_stable_state() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        drain(&mut r.outbound);
        // Forcing does not override the signaling-state guard.
        r.engine.create_offer(true).await.unwrap();
        assert!(drain(&mut r.outbound).is_empty());
        assert_eq!(r.engine.round(), 1);
    }

    #[tokio::test]
    async fn test_answerer_adopts_offer_round() {
        let mut r = rig(CallRole::Answerer);
        r.engine.handle_signal(SignalMessage::Offer {
            sdp: "remote-offer".into(),
            nid: 7,
        })
        .await
        .unwrap();
        assert_eq!(r.engine.round(), 7);
        let sent = drain(&mut r.outbound);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalMessage::Answer { nid: 7, .. }));
        let peer = r.factory.peer(0);
        assert_eq!(peer.remote_descs()[0].0, SdpKind::Offer);
        assert_eq!(peer.signaling_state(), RTCSignalingState::Stable);
    }

    #[tokio::test]
    async fn test_offerer_ignores_offer() {
        let mut r = rig(CallRole::Offerer);
        r.engine.handle_signal(SignalMessage::Offer {
            sdp: "rogue".into(),
            nid: 9,
        })
        .await
        .unwrap();
        assert!(drain(&mut r.outbound).is_empty());
        assert_eq!(r.factory.built(), 0);
        assert_eq!(r.engine.round(), 0);
    }

    #[tokio::test]
    async fn test_answerer_ignores_answer() {
        let mut r = rig(CallRole::Answerer);
        r.engine.handle_signal(SignalMessage::Offer {
            sdp: "remote-offer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        drain(&mut r.outbound);
        let peer = r.factory.peer(0);
        let before = peer.remote_descs().len();
        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "rogue-answer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        assert_eq!(peer.remote_descs().len(), before);
    }

    #[tokio::test]
    async fn test_stale_answer_round_mismatch_dropped() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        let peer = r.factory.peer(0);
        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "late".into(),
            nid: 2,
        })
        .await
        .unwrap();
        assert!(peer.remote_descs().is_empty());
        assert_eq!(peer.signaling_state(), RTCSignalingState::HaveLocalOffer);

        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "good".into(),
            nid: 1,
        })
        .await
        .unwrap();
        assert_eq!(peer.remote_descs(), vec![(SdpKind::Answer, "good".to_string())]);
        assert_eq!(peer.signaling_state(), RTCSignalingState::Stable);
    }

    #[tokio::test]
    async fn test_duplicate_answer_after_stable_ignored() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        let peer = r.factory.peer(0);
        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "answer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        // A delayed copy of the same answer: round matches, but the
        // connection already left have-local-offer.
        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "answer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        assert_eq!(peer.remote_descs().len(), 1);
    }

    #[tokio::test]
    async fn test_ice_queued_until_remote_description_then_flushed_in_order() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        let peer = r.factory.peer(0);

        for name in ["a", "b", "c"] {
            r.engine.handle_signal(SignalMessage::IceCandidate {
                candidate: blob(name),
                nid: 1,
            })
            .await
            .unwrap();
        }
        assert!(peer.applied_ice().is_empty());
        assert_eq!(r.engine.pending_ice_len(), 3);

        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "answer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        assert_eq!(peer.applied_ice(), vec!["a", "b", "c"]);
        assert_eq!(r.engine.pending_ice_len(), 0);

        // With the remote description in place, candidates apply directly.
        r.engine.handle_signal(SignalMessage::IceCandidate {
            candidate: blob("d"),
            nid: 1,
        })
        .await
        .unwrap();
        assert_eq!(peer.applied_ice(), vec!["a", "b", "c", "d"]);
        assert_eq!(r.engine.pending_ice_len(), 0);
    }

    #[tokio::test]
    async fn test_ice_round_mismatch_dropped_until_round_advances() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        drain(&mut r.outbound);

        // Candidate from a future round: dropped without side effects.
        r.engine.handle_signal(SignalMessage::IceCandidate {
            candidate: blob("early"),
            nid: 2,
        })
        .await
        .unwrap();
        assert_eq!(r.engine.pending_ice_len(), 0);

        // Round advances via a renegotiation cycle; the resent candidate
        // is accepted now.
        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "answer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        r.engine.handle_signal(SignalMessage::RequestRenegotiation).await.unwrap();
        assert_eq!(r.engine.round(), 2);
        r.engine.handle_signal(SignalMessage::IceCandidate {
            candidate: blob("early"),
            nid: 2,
        })
        .await
        .unwrap();
        let peer = r.factory.peer(0);
        assert!(peer.applied_ice().contains(&"early".to_string()));
    }

    #[tokio::test]
    async fn test_renegotiation_request_clears_offer_guard() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        r.engine.handle_signal(SignalMessage::Answer {
            sdp: "answer".into(),
            nid: 1,
        })
        .await
        .unwrap();
        drain(&mut r.outbound);

        // Stable again, but the per-round guard still holds...
        r.engine.create_offer(false).await.unwrap();
        assert!(drain(&mut r.outbound).is_empty());

        // ...until the remote side asks for a renegotiation.
        r.engine.handle_signal(SignalMessage::RequestRenegotiation).await.unwrap();
        let sent = drain(&mut r.outbound);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalMessage::Offer { nid: 2, .. }));
    }

    #[tokio::test]
    async fn test_renegotiation_request_noop_for_answerer() {
        let mut r = rig(CallRole::Answerer);
        r.engine.handle_signal(SignalMessage::RequestRenegotiation).await.unwrap();
        assert!(drain(&mut r.outbound).is_empty());
        assert_eq!(r.factory.built(), 0);
    }

    #[tokio::test]
    async fn test_half_negotiated_peer_rebuilt_on_fresh_offer() {
        let mut r = rig(CallRole::Answerer);
        r.engine.handle_signal(SignalMessage::Offer {
            sdp: "first".into(),
            nid: 1,
        })
        .await
        .unwrap();
        let first = r.factory.peer(0);
        // Wedge the connection mid-negotiation.
        first.set_state(RTCSignalingState::HaveRemoteOffer);

        r.engine.handle_signal(SignalMessage::Offer {
            sdp: "second".into(),
            nid: 2,
        })
        .await
        .unwrap();
        assert!(first.is_closed());
        assert_eq!(r.factory.built(), 2);
        assert_eq!(r.engine.round(), 2);
        let second = r.factory.peer(1);
        assert_eq!(second.remote_descs(), vec![(SdpKind::Offer, "second".to_string())]);
    }

    #[tokio::test]
    async fn test_outgoing_ice_tagged_with_current_round() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        drain(&mut r.outbound);
        r.engine.on_peer_event(PeerEvent {
            epoch: 1,
            kind: PeerEventKind::IceCandidate(blob("local")),
        })
        .await
        .unwrap();
        let sent = drain(&mut r.outbound);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalMessage::IceCandidate { nid: 1, .. }));
    }

    #[tokio::test]
    async fn test_stale_epoch_events_dropped() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        drain(&mut r.outbound);
        r.engine.on_peer_event(PeerEvent {
            epoch: 99,
            kind: PeerEventKind::IceCandidate(blob("ghost")),
        })
        .await
        .unwrap();
        assert!(drain(&mut r.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_failure_retries_once_then_fatal() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        drain(&mut r.outbound);
        let first = r.factory.peer(0);

        r.engine.on_peer_event(PeerEvent {
            epoch: 1,
            kind: PeerEventKind::StateChanged(PeerState::Failed),
        })
        .await
        .unwrap();
        assert!(first.is_closed());
        let events = drain_events(&mut r.events);
        assert!(matches!(events[..], [EngineEvent::ScheduleOfferRetry { .. }]));

        // A late event from the discarded peer must not double-retry.
        r.engine.on_peer_event(PeerEvent {
            epoch: 1,
            kind: PeerEventKind::StateChanged(PeerState::Failed),
        })
        .await
        .unwrap();
        assert!(drain_events(&mut r.events).is_empty());

        // The session performs the retry; the round continues, never resets.
        r.engine.create_offer(true).await.unwrap();
        assert_eq!(r.engine.round(), 2);
        assert_eq!(r.factory.built(), 2);
        let sent = drain(&mut r.outbound);
        assert!(matches!(sent[..], [SignalMessage::Offer { nid: 2, .. }]));

        // Second consecutive failure: fatal, no further retry.
        r.engine.on_peer_event(PeerEvent {
            epoch: 2,
            kind: PeerEventKind::StateChanged(PeerState::Failed),
        })
        .await
        .unwrap();
        let events = drain_events(&mut r.events);
        assert!(matches!(events[..], [EngineEvent::Fatal { .. }]));
    }

    #[tokio::test]
    async fn test_connected_resets_failure_counter() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        r.engine.on_peer_event(PeerEvent {
            epoch: 1,
            kind: PeerEventKind::StateChanged(PeerState::Failed),
        })
        .await
        .unwrap();
        drain_events(&mut r.events);

        r.engine.create_offer(true).await.unwrap();
        r.engine.on_peer_event(PeerEvent {
            epoch: 2,
            kind: PeerEventKind::StateChanged(PeerState::Connected),
        })
        .await
        .unwrap();
        assert!(matches!(
            drain_events(&mut r.events)[..],
            [EngineEvent::LinkUp]
        ));

        // After a healthy stretch, a failure earns a fresh retry, not Fatal.
        r.engine.on_peer_event(PeerEvent {
            epoch: 2,
            kind: PeerEventKind::StateChanged(PeerState::Failed),
        })
        .await
        .unwrap();
        assert!(matches!(
            drain_events(&mut r.events)[..],
            [EngineEvent::ScheduleOfferRetry { .. }]
        ));
    }

    #[tokio::test]
    async fn test_transport_close_tears_down_negotiation_state() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        r.engine.handle_signal(SignalMessage::IceCandidate {
            candidate: blob("q"),
            nid: 1,
        })
        .await
        .unwrap();
        assert_eq!(r.engine.pending_ice_len(), 1);
        let peer = r.factory.peer(0);

        r.engine.on_transport_closed().await;
        assert!(peer.is_closed());
        assert_eq!(r.engine.pending_ice_len(), 0);

        // Closed transport: no offers.
        drain(&mut r.outbound);
        r.engine.create_offer(false).await.unwrap();
        assert!(drain(&mut r.outbound).is_empty());

        // Reopen: a fresh cycle on a fresh peer, round keeps counting.
        r.engine.on_transport_open();
        r.engine.create_offer(false).await.unwrap();
        let sent = drain(&mut r.outbound);
        assert!(matches!(sent[..], [SignalMessage::Offer { nid: 2, .. }]));
        assert_eq!(r.factory.built(), 2);
    }

    #[tokio::test]
    async fn test_track_swap_does_not_rebuild_peer() {
        let mut r = rig(CallRole::Offerer);
        r.engine.create_offer(false).await.unwrap();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "screen".to_owned(),
            "fitcall".to_owned(),
        ));
        r.engine.replace_video_track(track).await.unwrap();
        let peer = r.factory.peer(0);
        assert_eq!(
            peer.replaced_tracks.lock().unwrap().clone(),
            vec!["screen".to_string()]
        );
        assert!(!peer.is_closed());
        assert_eq!(r.factory.built(), 1);
    }
}
