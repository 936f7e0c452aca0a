//! Offer/answer negotiation and periodic audio fan-out for a two-party
//! real-time session.
//!
//! The media stack itself stays behind [`peer::PeerConnection`]; everything in
//! this crate drives it from the outside.

pub mod audio;
pub mod clock;
pub mod negotiation;
pub mod peer;
pub mod router;
pub mod signal;
pub mod sink;

pub use audio::{AudioChunk, Sink};
pub use clock::{ClockConfig, ClockError, SampleClock, SquareWave};
pub use negotiation::{
    DescriptionError, GenerationError, GenerationOutcome, IceError, NegotiationEngine,
    NegotiationState, Role, SessionOptions, Signaler, StartError,
};
pub use peer::{PeerConnection, PeerConnector, PeerError};
pub use router::{DispatchOutcome, SignalRouter};
pub use signal::{CodecError, IceCandidate, SdpKind, SessionDescription, SignalMessage};
pub use sink::SinkRegistry;
