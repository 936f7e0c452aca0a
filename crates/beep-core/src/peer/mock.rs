//! In-process peer connection for tests and offline runs.
//!
//! SDP is fake (`v=0` plus a marker line) but the mock enforces the same
//! ordering rules a real stack does: answers need a remote offer, candidates
//! need a remote description, and nothing works after `close`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PeerConnection, PeerConnector, PeerError, TrackHandler, TriggerHandler};
use crate::signal::{IceCandidate, SdpKind, SessionDescription};
use crate::sink::SinkRegistry;

type SharedTrigger = Arc<dyn Fn() + Send + Sync>;
type SharedTrackHandler = Arc<dyn Fn(Arc<SinkRegistry>) + Send + Sync>;

/// Knobs for [`MockPeer`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Fire ICE-gathering-complete as soon as a local description is set.
    pub auto_gather: bool,
    /// Fire negotiation-needed when a track is added.
    pub negotiate_on_track: bool,
    pub fail_offer: bool,
    pub fail_answer: bool,
    /// How long offer/answer creation takes.
    pub create_delay: Duration,
    /// `local_description` reports nothing even after one was set.
    pub withhold_local_description: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            auto_gather: true,
            negotiate_on_track: true,
            fail_offer: false,
            fail_answer: false,
            create_delay: Duration::ZERO,
            withhold_local_description: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    sources: Vec<Arc<SinkRegistry>>,
    closed: bool,
}

#[derive(Default)]
struct Handlers {
    negotiation_needed: Option<SharedTrigger>,
    ice_complete: Option<SharedTrigger>,
    track: Option<SharedTrackHandler>,
}

#[derive(Default)]
pub struct MockPeer {
    behavior: MockBehavior,
    state: Mutex<MockState>,
    handlers: Mutex<Handlers>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ..Default::default()
        })
    }

    pub fn fire_negotiation_needed(&self) {
        let handler = self.handlers.lock().negotiation_needed.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn fire_ice_gathering_complete(&self) {
        let handler = self.handlers.lock().ice_complete.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Simulates the remote side starting a track; returns the registry the
    /// handler was given so tests can push audio through it.
    pub fn fire_track(&self) -> Arc<SinkRegistry> {
        let registry = Arc::new(SinkRegistry::new());
        let handler = self.handlers.lock().track.clone();
        if let Some(handler) = handler {
            handler(registry.clone());
        }
        registry
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Highest number of offer/answer creations observed running at once.
    pub fn max_concurrent_generations(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn sources(&self) -> Vec<Arc<SinkRegistry>> {
        self.state.lock().sources.clone()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state.lock().closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    async fn generate(&self, kind: SdpKind) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.behavior.create_delay.is_zero() {
            tokio::time::sleep(self.behavior.create_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match kind {
            SdpKind::Offer => {
                if self.behavior.fail_offer {
                    return Err(PeerError::Description("offer creation failed".into()));
                }
                let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(SessionDescription::offer(format!("v=0\r\ns=mock-offer-{n}\r\n")))
            }
            SdpKind::Answer => {
                if self.behavior.fail_answer {
                    return Err(PeerError::Description("answer creation failed".into()));
                }
                let has_remote_offer = matches!(
                    self.state.lock().remote.as_ref().map(|desc| desc.kind),
                    Some(SdpKind::Offer)
                );
                if !has_remote_offer {
                    return Err(PeerError::Description(
                        "cannot answer without a remote offer".into(),
                    ));
                }
                let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(SessionDescription::answer(format!("v=0\r\ns=mock-answer-{n}\r\n")))
            }
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.generate(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.generate(SdpKind::Answer).await
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PeerError::Closed);
            }
            state.local = Some(desc);
        }
        if self.behavior.auto_gather {
            self.fire_ice_gathering_complete();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::Description("malformed sdp".into()));
        }
        if desc.kind == SdpKind::Answer
            && !matches!(state.local.as_ref().map(|d| d.kind), Some(SdpKind::Offer))
        {
            return Err(PeerError::Description(
                "answer received without a local offer".into(),
            ));
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if state.remote.is_none() {
            return Err(PeerError::Candidate("remote description not set".into()));
        }
        if candidate.candidate.trim().is_empty() {
            return Err(PeerError::Candidate("empty candidate".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        if self.behavior.withhold_local_description {
            return None;
        }
        self.state.lock().local.clone()
    }

    async fn add_track(&self, source: Arc<SinkRegistry>) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PeerError::Closed);
            }
            state.sources.push(source);
        }
        if self.behavior.negotiate_on_track {
            self.fire_negotiation_needed();
        }
        Ok(())
    }

    fn on_negotiation_needed(&self, handler: TriggerHandler) {
        self.handlers.lock().negotiation_needed = Some(Arc::from(handler));
    }

    fn on_ice_gathering_complete(&self, handler: TriggerHandler) {
        self.handlers.lock().ice_complete = Some(Arc::from(handler));
    }

    fn on_track(&self, handler: TrackHandler) {
        self.handlers.lock().track = Some(Arc::from(handler));
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.closed = true;
        state.sources.clear();
        Ok(())
    }
}

/// Hands out a fixed [`MockPeer`], or fails every time.
pub struct MockConnector {
    peer: Option<Arc<MockPeer>>,
}

impl MockConnector {
    pub fn new(peer: Arc<MockPeer>) -> Self {
        Self { peer: Some(peer) }
    }

    pub fn failing() -> Self {
        Self { peer: None }
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        match &self.peer {
            Some(peer) => Ok(peer.clone() as Arc<dyn PeerConnection>),
            None => Err(PeerError::Setup("mock connector configured to fail".into())),
        }
    }
}
