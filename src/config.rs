use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;

/// Default STUN server used when no ICE servers were configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// How long the REST negotiation waits for the ICE connection to come up.
pub const DEFAULT_ICE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl Default for IceServer {
    fn default() -> Self {
        IceServer {
            urls: vec![DEFAULT_STUN_SERVER.to_owned()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(value: &IceServer) -> Self {
        RTCIceServer {
            urls: value.urls.clone(),
            username: value.username.clone(),
            credential: value.credential.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    #[default]
    MaxBundle,
}

impl From<BundlePolicy> for RTCBundlePolicy {
    fn from(value: BundlePolicy) -> Self {
        match value {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        }
    }
}

/// Strategy used to turn independently arriving remote tracks into the single
/// stream handed to a [crate::media::MediaSink].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositionStrategy {
    /// Every arriving track replaces the sink content with that track's stream.
    FirstStream,
    /// Tracks are buffered until the announced count is reached, then the
    /// stream is composed exactly once.
    #[default]
    Incremental,
    /// Every arriving track recomposes the sink content from all tracks so far.
    AllTracks,
}

/// What a contact peer asks to receive from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiveOptions {
    pub audio: bool,
    pub video: bool,
    pub strategy: CompositionStrategy,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions {
            audio: true,
            video: true,
            strategy: CompositionStrategy::default(),
        }
    }
}

/// Settings of the REST negotiation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestConfig {
    /// Base URL of the application, eg. `https://rtc.live.cloudflare.com/v1/apps/{appId}`.
    /// Service paths are resolved under `{service_base_url}/sessions/`.
    pub service_base_url: String,
    pub access_token: String,
    #[serde(default = "default_ice_timeout_ms")]
    pub ice_timeout_ms: u64,
}

fn default_ice_timeout_ms() -> u64 {
    DEFAULT_ICE_TIMEOUT_MS
}

impl RestConfig {
    pub fn new(service_base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        RestConfig {
            service_base_url: service_base_url.into(),
            access_token: access_token.into(),
            ice_timeout_ms: DEFAULT_ICE_TIMEOUT_MS,
        }
    }

    pub fn ice_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_timeout_ms)
    }
}

/// Connection configuration shared by every contact peer created by a
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub ice_servers: Vec<IceServer>,
    pub bundle_policy: BundlePolicy,
    pub receive: ReceiveOptions,
    /// Label of the data channel each contact opens eagerly for file transfer.
    pub data_channel_label: String,
    pub signalling_url: Option<String>,
    pub rest: Option<RestConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ice_servers: vec![IceServer::default()],
            bundle_policy: BundlePolicy::default(),
            receive: ReceiveOptions::default(),
            data_channel_label: "file".to_owned(),
            signalling_url: None,
            rest: None,
        }
    }
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(RTCIceServer::from).collect(),
            bundle_policy: self.bundle_policy.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let json = r#"{
            "rest": {"serviceBaseUrl": "https://calls.example/v1/apps/app", "accessToken": "t"}
        }"#;
        let options = Options::from_json(json).unwrap();
        assert_eq!(options.ice_servers, vec![IceServer::default()]);
        assert_eq!(options.bundle_policy, BundlePolicy::MaxBundle);
        assert_eq!(options.receive.strategy, CompositionStrategy::Incremental);
        assert_eq!(options.data_channel_label, "file");
        let rest = options.rest.unwrap();
        assert_eq!(rest.ice_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn bundle_policy_uses_kebab_case() {
        let options = Options::from_json(r#"{"bundlePolicy": "max-compat"}"#).unwrap();
        assert_eq!(options.bundle_policy, BundlePolicy::MaxCompat);
        assert_eq!(options.rtc_config().bundle_policy, RTCBundlePolicy::MaxCompat);
    }
}
