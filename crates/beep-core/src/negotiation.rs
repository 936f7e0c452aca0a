//! Offer/answer state machine around one [`PeerConnection`].
//!
//! One cycle per role: the instigator generates an offer and waits for the
//! answer, the responder applies the remote offer and generates an answer.
//! Candidates are not trickled; the local description is signalled once, after
//! ICE gathering completes, with every candidate folded into the SDP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use crate::peer::{PeerConnection, PeerConnector, PeerError, TrackHandler};
use crate::signal::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
use crate::sink::SinkRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Instigator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    GeneratingOffer,
    AwaitingAnswer,
    GeneratingAnswer,
    Stable,
    Closed,
}

impl NegotiationState {
    pub fn is_generating(&self) -> bool {
        matches!(
            self,
            NegotiationState::GeneratingOffer | NegotiationState::GeneratingAnswer
        )
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to create peer connection: {0}")]
    Connect(#[source] PeerError),
    #[error("instigator requires a local audio source")]
    MissingSource,
    #[error("failed to attach local track: {0}")]
    Track(#[source] PeerError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptionError {
    #[error("remote {kind} rejected: {source}")]
    Rejected {
        kind: SdpKind,
        #[source]
        source: PeerError,
    },
    #[error("unexpected remote {kind} while {state:?}")]
    UnexpectedState {
        kind: SdpKind,
        state: NegotiationState,
    },
    #[error("negotiation engine closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IceError {
    #[error("remote description not set yet")]
    NoRemoteDescription,
    #[error("candidate rejected: {0}")]
    Rejected(#[source] PeerError),
    #[error("negotiation engine closed")]
    Closed,
}

/// Result of a generation request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The local description was set and ICE gathering has completed.
    Completed,
    /// Another cycle already ran or is running; nothing was generated.
    Skipped(NegotiationState),
}

/// Why a generation request did not produce a local description.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("{role:?} does not generate {kind}s")]
    WrongRole { role: Role, kind: SdpKind },
    #[error("failed to create {kind}: {source}")]
    Create {
        kind: SdpKind,
        #[source]
        source: PeerError,
    },
    #[error("failed to set local {kind}: {source}")]
    SetLocal {
        kind: SdpKind,
        #[source]
        source: PeerError,
    },
    #[error("local {kind} could not be signalled: {reason}")]
    Unsignalled { kind: SdpKind, reason: String },
    #[error("negotiation engine closed")]
    Closed,
}

/// Outbound half of the signaling channel.
///
/// `signal` resolves once the payload has been handed to the remote peer;
/// delivery retries are the implementation's business.
#[async_trait]
pub trait Signaler: Send + Sync {
    async fn signal(&self, payload: String);
}

pub struct SessionOptions {
    pub role: Role,
    pub signaler: Arc<dyn Signaler>,
    /// Audio to send. Required for the instigator.
    pub local_source: Option<Arc<SinkRegistry>>,
    /// Invoked for each remote track. Only consulted for the responder.
    pub on_remote_track: Option<TrackHandler>,
}

impl SessionOptions {
    pub fn instigator(signaler: Arc<dyn Signaler>, source: Arc<SinkRegistry>) -> Self {
        Self {
            role: Role::Instigator,
            signaler,
            local_source: Some(source),
            on_remote_track: None,
        }
    }

    pub fn responder(signaler: Arc<dyn Signaler>, on_remote_track: TrackHandler) -> Self {
        Self {
            role: Role::Responder,
            signaler,
            local_source: None,
            on_remote_track: Some(on_remote_track),
        }
    }
}

/// Internal phase. `Creating`, `Gathering` and `Signalling` all surface as
/// `Generating{Offer,Answer}`. `Creating` records whether ICE gathering
/// finished before the local description was set; `Signalling` marks the one
/// caller that owns building the outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Creating { kind: SdpKind, gathered: bool },
    Gathering(SdpKind),
    Signalling(SdpKind),
    AwaitingAnswer,
    Stable,
    Closed,
}

impl Phase {
    fn public(self) -> NegotiationState {
        match self {
            Phase::Idle => NegotiationState::Idle,
            Phase::Creating { kind, .. } | Phase::Gathering(kind) | Phase::Signalling(kind) => {
                generating(kind)
            }
            Phase::AwaitingAnswer => NegotiationState::AwaitingAnswer,
            Phase::Stable => NegotiationState::Stable,
            Phase::Closed => NegotiationState::Closed,
        }
    }

    fn generating_kind(self) -> Option<SdpKind> {
        match self {
            Phase::Creating { kind, .. } | Phase::Gathering(kind) | Phase::Signalling(kind) => {
                Some(kind)
            }
            _ => None,
        }
    }
}

fn generating(kind: SdpKind) -> NegotiationState {
    match kind {
        SdpKind::Offer => NegotiationState::GeneratingOffer,
        SdpKind::Answer => NegotiationState::GeneratingAnswer,
    }
}

fn after_signal(kind: SdpKind) -> Phase {
    match kind {
        SdpKind::Offer => Phase::AwaitingAnswer,
        SdpKind::Answer => Phase::Stable,
    }
}

struct EngineInner {
    role: Role,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    phase: watch::Sender<Phase>,
    /// Serialises generation cycles and remote-description application.
    turn: AsyncMutex<()>,
    remote_applied: AtomicBool,
    closed: AtomicBool,
    signaler: Arc<dyn Signaler>,
    on_remote_track: Option<TrackHandler>,
    signals_sent: AtomicUsize,
}

impl EngineInner {
    fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.lock().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Drives negotiation for one session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl NegotiationEngine {
    /// Creates the peer connection and wires its triggers.
    ///
    /// For the instigator the local source is attached as an outgoing track,
    /// which is what eventually raises negotiation-needed.
    pub async fn start(
        connector: &dyn PeerConnector,
        options: SessionOptions,
    ) -> Result<Self, StartError> {
        let SessionOptions {
            role,
            signaler,
            local_source,
            on_remote_track,
        } = options;
        if role == Role::Instigator && local_source.is_none() {
            return Err(StartError::MissingSource);
        }

        info!(target = "beep::negotiation", role = ?role, "starting peer connection");
        let peer = connector.connect().await.map_err(StartError::Connect)?;

        let (phase, _) = watch::channel(Phase::Idle);
        let engine = Self {
            inner: Arc::new(EngineInner {
                role,
                peer: Mutex::new(Some(peer.clone())),
                phase,
                turn: AsyncMutex::new(()),
                remote_applied: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                signaler,
                on_remote_track,
                signals_sent: AtomicUsize::new(0),
            }),
        };
        engine.register_triggers(peer.as_ref());

        if let (Role::Instigator, Some(source)) = (role, local_source) {
            if let Err(err) = peer.add_track(source).await {
                engine.close().await;
                return Err(StartError::Track(err));
            }
            debug!(target = "beep::negotiation", "local audio track attached");
        }
        Ok(engine)
    }

    fn register_triggers(&self, peer: &dyn PeerConnection) {
        let weak = Arc::downgrade(&self.inner);
        peer.on_ice_gathering_complete(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let engine = NegotiationEngine { inner };
            tokio::spawn(async move { engine.on_ice_gathering_complete().await });
        }));

        match self.inner.role {
            Role::Instigator => {
                let weak = Arc::downgrade(&self.inner);
                peer.on_negotiation_needed(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        NegotiationEngine { inner }.on_negotiation_needed();
                    }
                }));
            }
            Role::Responder => {
                let weak = Arc::downgrade(&self.inner);
                peer.on_track(Box::new(move |track: Arc<SinkRegistry>| {
                    if let Some(inner) = weak.upgrade() {
                        NegotiationEngine { inner }.on_add_track(track);
                    }
                }));
            }
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.phase.borrow().public()
    }

    /// Resolves with the first state satisfying `predicate`, checking the
    /// current state first.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(NegotiationState) -> bool,
    ) -> NegotiationState {
        let mut rx = self.inner.phase.subscribe();
        match rx.wait_for(|phase| predicate(phase.public())).await {
            Ok(phase) => phase.public(),
            Err(_) => self.state(),
        }
    }

    /// Local descriptions handed to the signaler so far.
    pub fn signals_sent(&self) -> usize {
        self.inner.signals_sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Negotiation-needed trigger: schedules offer generation on its own task.
    pub fn on_negotiation_needed(&self) {
        if self.inner.is_closed() || self.inner.role != Role::Instigator {
            return;
        }
        debug!(target = "beep::negotiation", "negotiation needed");
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = engine.generate_offer().await;
        });
    }

    /// Remote-track trigger: hands the track to the responder's handler.
    pub fn on_add_track(&self, track: Arc<SinkRegistry>) {
        if self.inner.is_closed() {
            return;
        }
        match &self.inner.on_remote_track {
            Some(handler) => {
                info!(target = "beep::negotiation", "remote audio track added");
                handler(track);
            }
            None => debug!(target = "beep::negotiation", "remote track ignored"),
        }
    }

    /// ICE-gathering-complete trigger. Signals the local description if a
    /// generation cycle is waiting for it; otherwise only records that
    /// gathering finished.
    pub async fn on_ice_gathering_complete(&self) {
        if self.inner.is_closed() {
            return;
        }
        let mut ready = None;
        self.inner.phase.send_if_modified(|phase| match *phase {
            Phase::Gathering(kind) => {
                *phase = Phase::Signalling(kind);
                ready = Some(kind);
                true
            }
            Phase::Creating {
                kind,
                gathered: false,
            } => {
                *phase = Phase::Creating {
                    kind,
                    gathered: true,
                };
                true
            }
            _ => false,
        });
        match ready {
            Some(kind) => {
                if let Ok(payload) = self.prepare_signal(kind).await {
                    self.send_signal(kind, payload).await;
                }
            }
            None => debug!(
                target = "beep::negotiation",
                state = ?self.state(),
                "ice gathering complete outside a pending cycle"
            ),
        }
    }

    pub async fn generate_offer(&self) -> Result<GenerationOutcome, GenerationError> {
        self.generate(SdpKind::Offer).await
    }

    pub async fn generate_answer(&self) -> Result<GenerationOutcome, GenerationError> {
        self.generate(SdpKind::Answer).await
    }

    async fn generate(&self, kind: SdpKind) -> Result<GenerationOutcome, GenerationError> {
        let role = self.inner.role;
        let allowed = matches!(
            (role, kind),
            (Role::Instigator, SdpKind::Offer) | (Role::Responder, SdpKind::Answer)
        );
        if !allowed {
            return Err(GenerationError::WrongRole { role, kind });
        }

        let turn = self.inner.turn.lock().await;
        let mut observed = Phase::Idle;
        let entered = self.inner.phase.send_if_modified(|phase| {
            observed = *phase;
            if *phase == Phase::Idle {
                *phase = Phase::Creating {
                    kind,
                    gathered: false,
                };
                true
            } else {
                false
            }
        });
        if !entered {
            if observed == Phase::Closed {
                return Err(GenerationError::Closed);
            }
            debug!(
                target = "beep::negotiation",
                %kind,
                state = ?observed.public(),
                "generation already done or in progress; skipping"
            );
            return Ok(GenerationOutcome::Skipped(observed.public()));
        }

        let Some(peer) = self.inner.peer() else {
            return Err(GenerationError::Closed);
        };
        info!(target = "beep::negotiation", %kind, "generating local description");
        let created = match kind {
            SdpKind::Offer => peer.create_offer().await,
            SdpKind::Answer => peer.create_answer().await,
        };
        let desc = match created {
            Ok(desc) => desc,
            Err(source) => {
                warn!(target = "beep::negotiation", %kind, error = %source, "failed to create local description");
                self.abandon_cycle(kind);
                return Err(GenerationError::Create { kind, source });
            }
        };
        if let Err(source) = peer.set_local_description(desc).await {
            warn!(target = "beep::negotiation", %kind, error = %source, "failed to set local description");
            self.abandon_cycle(kind);
            return Err(GenerationError::SetLocal { kind, source });
        }

        let mut gathered_early = false;
        self.inner.phase.send_if_modified(|phase| match *phase {
            Phase::Creating {
                kind: current,
                gathered,
            } if current == kind => {
                if gathered {
                    *phase = Phase::Signalling(kind);
                    gathered_early = true;
                } else {
                    *phase = Phase::Gathering(kind);
                }
                true
            }
            _ => false,
        });
        if gathered_early {
            let payload = self.prepare_signal(kind).await?;
            // The phase already moved on; delivery does not need the turn.
            drop(turn);
            self.send_signal(kind, payload).await;
            return Ok(GenerationOutcome::Completed);
        }

        debug!(target = "beep::negotiation", %kind, "local description set; waiting for ice gathering");
        // Hold the turn until the payload is built or the engine closes.
        let mut rx = self.inner.phase.subscribe();
        let settled = match rx.wait_for(|phase| phase.generating_kind() != Some(kind)).await {
            Ok(phase) => *phase,
            Err(_) => Phase::Closed,
        };
        drop(turn);
        match settled {
            Phase::Closed => Err(GenerationError::Closed),
            Phase::Idle => Err(GenerationError::Unsignalled {
                kind,
                reason: "local description unavailable after ice gathering".into(),
            }),
            _ => Ok(GenerationOutcome::Completed),
        }
    }

    fn abandon_cycle(&self, kind: SdpKind) {
        self.inner
            .phase
            .send_if_modified(|phase| match phase.generating_kind() {
                Some(current) if current == kind => {
                    *phase = Phase::Idle;
                    true
                }
                _ => false,
            });
    }

    /// Builds the outbound payload for a cycle in `Signalling` and moves the
    /// phase past it. On failure the cycle is abandoned and the state returns
    /// to `Idle`, so the public state never reports a signal that was not sent.
    async fn prepare_signal(&self, kind: SdpKind) -> Result<String, GenerationError> {
        let Some(peer) = self.inner.peer() else {
            return Err(GenerationError::Closed);
        };
        let encoded = match peer.local_description().await {
            Some(local) => SignalMessage::from(local)
                .encode()
                .map_err(|err| err.to_string()),
            None => Err("no local description".to_owned()),
        };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(reason) => {
                warn!(target = "beep::negotiation", %kind, %reason, "cannot signal local description");
                self.abandon_cycle(kind);
                return Err(GenerationError::Unsignalled { kind, reason });
            }
        };
        let advanced = self.inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Signalling(kind) {
                *phase = after_signal(kind);
                true
            } else {
                false
            }
        });
        if !advanced {
            return Err(GenerationError::Closed);
        }
        Ok(payload)
    }

    async fn send_signal(&self, kind: SdpKind, payload: String) {
        info!(target = "beep::negotiation", %kind, bytes = payload.len(), "signalling local description");
        self.inner.signaler.signal(payload).await;
        self.inner.signals_sent.fetch_add(1, Ordering::SeqCst);
    }

    /// Applies a description from the remote peer. A remote offer schedules
    /// answer generation on its own task.
    pub async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), DescriptionError> {
        if self.inner.is_closed() {
            return Err(DescriptionError::Closed);
        }
        let kind = desc.kind;
        {
            let _turn = self.inner.turn.lock().await;
            let state = self.state();
            let expected = match kind {
                SdpKind::Offer => {
                    self.inner.role == Role::Responder && state == NegotiationState::Idle
                }
                SdpKind::Answer => {
                    self.inner.role == Role::Instigator
                        && state == NegotiationState::AwaitingAnswer
                }
            };
            if state == NegotiationState::Closed {
                return Err(DescriptionError::Closed);
            }
            if !expected {
                warn!(target = "beep::negotiation", %kind, state = ?state, "unexpected remote description");
                return Err(DescriptionError::UnexpectedState { kind, state });
            }
            let Some(peer) = self.inner.peer() else {
                return Err(DescriptionError::Closed);
            };
            if let Err(source) = peer.set_remote_description(desc).await {
                warn!(target = "beep::negotiation", %kind, error = %source, "remote description rejected");
                return Err(DescriptionError::Rejected { kind, source });
            }
            self.inner.remote_applied.store(true, Ordering::SeqCst);
            if kind == SdpKind::Answer {
                self.inner.phase.send_if_modified(|phase| {
                    if *phase == Phase::AwaitingAnswer {
                        *phase = Phase::Stable;
                        true
                    } else {
                        false
                    }
                });
            }
        }
        info!(target = "beep::negotiation", %kind, "remote description applied");

        if kind == SdpKind::Offer {
            let engine = self.clone();
            tokio::spawn(async move {
                let _ = engine.generate_answer().await;
            });
        }
        Ok(())
    }

    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), IceError> {
        if self.inner.is_closed() {
            return Err(IceError::Closed);
        }
        if !self.inner.remote_applied.load(Ordering::SeqCst) {
            warn!(target = "beep::negotiation", "dropping ice candidate received before remote description");
            return Err(IceError::NoRemoteDescription);
        }
        let Some(peer) = self.inner.peer() else {
            return Err(IceError::Closed);
        };
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => {
                debug!(target = "beep::negotiation", "remote ice candidate applied");
                Ok(())
            }
            Err(err) => {
                warn!(target = "beep::negotiation", error = %err, "ice candidate rejected");
                Err(IceError::Rejected(err))
            }
        }
    }

    /// Releases the peer connection. Later calls, and any trigger that fires
    /// afterwards, do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.phase.send_replace(Phase::Closed);
        let peer = self.inner.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                warn!(target = "beep::negotiation", error = %err, "error closing peer connection");
            }
        }
        info!(target = "beep::negotiation", "peer connection closed");
    }
}
