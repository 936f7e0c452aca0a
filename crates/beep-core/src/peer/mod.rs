//! Boundary to the media/transport stack.
//!
//! ICE connectivity, DTLS, SRTP and codecs all live behind
//! [`PeerConnection`]. The negotiation engine only ever talks to this trait, so
//! the concrete stack can be swapped (see the `beep-webrtc` crate) or replaced
//! by [`mock::MockPeer`] in tests.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::signal::{IceCandidate, SessionDescription};
use crate::sink::SinkRegistry;

pub mod mock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("track setup failed: {0}")]
    Track(String),
    #[error("peer connection closed")]
    Closed,
}

/// Fired with no payload: negotiation-needed and ICE-gathering-complete.
pub type TriggerHandler = Box<dyn Fn() + Send + Sync>;

/// Fired when the remote side starts sending a track. The registry fans the
/// decoded remote audio out to whatever sinks get attached to it.
pub type TrackHandler = Box<dyn Fn(Arc<SinkRegistry>) + Send + Sync>;

/// Creates peer connections. Failing here is fatal to a session.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Operations the negotiation engine needs from one peer connection.
///
/// Handlers may be invoked from any task. Registering a handler replaces the
/// previous one.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Current local description, including every candidate gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Sends audio from `source` to the remote peer. The connection registers
    /// its own sink on `source` and keeps it alive for as long as it is open.
    async fn add_track(&self, source: Arc<SinkRegistry>) -> Result<(), PeerError>;

    fn on_negotiation_needed(&self, handler: TriggerHandler);
    fn on_ice_gathering_complete(&self, handler: TriggerHandler);
    fn on_track(&self, handler: TrackHandler);

    async fn close(&self) -> Result<(), PeerError>;
}
