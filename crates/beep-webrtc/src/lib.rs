//! [`PeerConnection`] backed by the `webrtc` crate.
//!
//! Audio travels as PCMU (G.711 µ-law, 8 kHz mono). Descriptions are never
//! trickled: the negotiation engine waits for ICE gathering to complete and
//! signals the full local description.

use std::sync::Arc;

use async_trait::async_trait;
use beep_core::peer::{PeerConnection, PeerConnector, PeerError, TrackHandler, TriggerHandler};
use beep_core::{IceCandidate, SdpKind, SessionDescription, Sink, SinkRegistry};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub mod config;
pub mod g711;
pub mod track;

pub use config::RtcConfig;
use track::{PCMU_RATE, TrackSink, spawn_pump, spawn_remote_reader};

fn setup_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn description_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::Description(err.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(setup_error)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(setup_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(description_error)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(PeerError::Description(format!(
            "unsupported description type {other:?}"
        ))),
    }
}

/// Creates [`RtcPeer`]s from one [`RtcConfig`].
#[derive(Debug, Clone, Default)]
pub struct RtcConnector {
    config: RtcConfig,
}

impl RtcConnector {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let api = build_api()?;
        let pc = api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(setup_error)?;
        info!(
            target = "beep::webrtc",
            ice_servers = self.config.ice_servers.len(),
            "peer connection created"
        );
        Ok(Arc::new(RtcPeer::new(Arc::new(pc))))
    }
}

/// Outgoing sink and the registry it is attached to.
struct Outgoing {
    source: Arc<SinkRegistry>,
    sink: Arc<dyn Sink>,
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    outgoing: Mutex<Vec<Outgoing>>,
}

impl RtcPeer {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            outgoing: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(description_error)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(description_error)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        match from_rtc(desc) {
            Ok(desc) => Some(desc),
            Err(err) => {
                warn!(target = "beep::webrtc", error = %err, "ignoring local description");
                None
            }
        }
    }

    async fn add_track(&self, source: Arc<SinkRegistry>) -> Result<(), PeerError> {
        let local_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "beep".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| PeerError::Track(err.to_string()))?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
        });

        let (sink, queue) = TrackSink::channel();
        spawn_pump(local_track, queue);
        let sink: Arc<dyn Sink> = Arc::new(sink);
        source.add(&sink);
        self.outgoing.lock().push(Outgoing { source, sink });
        debug!(target = "beep::webrtc", "outgoing pcmu track added");
        Ok(())
    }

    fn on_negotiation_needed(&self, handler: TriggerHandler) {
        self.pc.on_negotiation_needed(Box::new(move || {
            handler();
            Box::pin(async {})
        }));
    }

    fn on_ice_gathering_complete(&self, handler: TriggerHandler) {
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                debug!(target = "beep::webrtc", state = ?state, "ice gathering state changed");
                if state == RTCIceGathererState::Complete {
                    handler();
                }
                Box::pin(async {})
            }));
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let mime_type = track.codec().capability.mime_type;
                if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
                    let registry = Arc::new(SinkRegistry::new());
                    handler(Arc::clone(&registry));
                    spawn_remote_reader(track, registry);
                } else {
                    warn!(target = "beep::webrtc", %mime_type, "ignoring remote track with unsupported codec");
                }
                Box::pin(async {})
            },
        ));
    }

    async fn close(&self) -> Result<(), PeerError> {
        let outgoing = std::mem::take(&mut *self.outgoing.lock());
        for Outgoing { source, sink } in outgoing {
            source.remove(&sink);
        }
        self.pc
            .close()
            .await
            .map_err(|err| PeerError::Setup(err.to_string()))
    }
}
