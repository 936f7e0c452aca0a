use serde_json::Value;
use tracing::{debug, warn};

use crate::negotiation::{DescriptionError, IceError, NegotiationEngine};
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

/// What happened to one inbound signaling payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    DescriptionApplied(SdpKind),
    DescriptionRejected(DescriptionError),
    CandidateApplied,
    CandidateRejected(IceError),
    InvalidDescription,
    InvalidCandidate,
    Unrecognized,
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::DescriptionApplied(_) | DispatchOutcome::CandidateApplied
        )
    }
}

/// Classifies inbound payloads and forwards them to a [`NegotiationEngine`].
///
/// Nothing here fails loudly: every payload yields a [`DispatchOutcome`] and a
/// log line, and bad input is dropped.
#[derive(Debug, Clone)]
pub struct SignalRouter {
    engine: NegotiationEngine,
}

impl SignalRouter {
    pub fn new(engine: NegotiationEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    pub async fn dispatch(&self, raw: &[u8]) -> DispatchOutcome {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(target = "beep::router", error = %err, bytes = raw.len(), "dropping unparseable signal");
                return DispatchOutcome::Unrecognized;
            }
        };
        let Value::Object(mut fields) = value else {
            warn!(target = "beep::router", "dropping non-object signal");
            return DispatchOutcome::Unrecognized;
        };

        // A payload carrying both shapes is treated as a description. An
        // explicit null counts as absent.
        if let Some(sdp) = fields.remove("sdp").filter(|value| !value.is_null()) {
            return self.route_description(sdp).await;
        }
        if let Some(candidate) = fields.remove("candidate").filter(|value| !value.is_null()) {
            return self.route_candidate(candidate).await;
        }
        warn!(target = "beep::router", "dropping signal with neither sdp nor candidate");
        DispatchOutcome::Unrecognized
    }

    async fn route_description(&self, raw: Value) -> DispatchOutcome {
        let desc: SessionDescription = match serde_json::from_value(raw) {
            Ok(desc) => desc,
            Err(err) => {
                warn!(target = "beep::router", error = %err, "dropping invalid session description");
                return DispatchOutcome::InvalidDescription;
            }
        };
        let kind = desc.kind;
        debug!(target = "beep::router", %kind, "routing remote description");
        match self.engine.apply_remote_description(desc).await {
            Ok(()) => DispatchOutcome::DescriptionApplied(kind),
            Err(err) => DispatchOutcome::DescriptionRejected(err),
        }
    }

    async fn route_candidate(&self, raw: Value) -> DispatchOutcome {
        let candidate: IceCandidate = match serde_json::from_value(raw) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(target = "beep::router", error = %err, "dropping invalid ice candidate");
                return DispatchOutcome::InvalidCandidate;
            }
        };
        match self.engine.add_remote_ice_candidate(candidate).await {
            Ok(()) => DispatchOutcome::CandidateApplied,
            Err(err) => DispatchOutcome::CandidateRejected(err),
        }
    }
}
