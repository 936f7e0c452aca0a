use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// ICE configuration for new peer connections.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self::with_stun(DEFAULT_STUN_URL)
    }
}

impl RtcConfig {
    pub fn with_stun(url: impl Into<String>) -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![url.into()],
                ..Default::default()
            }],
        }
    }

    /// Host candidates only; no STUN round trips.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }

    /// `BEEP_LOCALHOST_ONLY` (any value) disables STUN; otherwise
    /// `BEEP_STUN_URL` overrides the default server.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup("BEEP_LOCALHOST_ONLY").is_some() {
            return Self::localhost();
        }
        match lookup("BEEP_STUN_URL").filter(|url| !url.trim().is_empty()) {
            Some(url) => Self::with_stun(url.trim()),
            None => Self::default(),
        }
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        }
    }
}
