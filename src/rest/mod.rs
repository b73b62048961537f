//! Client for the session-based REST negotiation service.
//!
//! Every call is a bearer-authenticated JSON request against
//! `{service_base_url}/sessions/…`. Responses are normalised into a
//! [ServiceResult]: a body carrying `errorCode` counts as a failure just like a
//! transport error does.

mod negotiation;

pub use negotiation::{
    NegotiationOutcome, NegotiationSession, RemoteSessionDetails, RestNegotiationClient,
};

use crate::config::RestConfig;
use crate::connection::SessionDescription;
use crate::error::Error;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackLocation {
    Local,
    Remote,
}

/// Track as the negotiation service knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    pub location: TrackLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub track_name: String,
    /// Session that publishes the track, required for remote tracks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TrackDescriptor {
    pub fn local(mid: String, track_name: String) -> Self {
        TrackDescriptor {
            location: TrackLocation::Local,
            mid: Some(mid),
            track_name,
            session_id: None,
        }
    }

    pub fn remote(mid: Option<String>, track_name: String, session_id: &str) -> Self {
        TrackDescriptor {
            location: TrackLocation::Remote,
            mid,
            track_name,
            session_id: Some(session_id.to_owned()),
        }
    }
}

/// A single JSON request, independent of the HTTP stack executing it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

/// Executes [FetchRequest]s. A non-success status is an error.
#[async_trait]
pub trait JsonFetch: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<Value, Error>;
}

/// [JsonFetch] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpFetch { client })
    }
}

#[async_trait]
impl JsonFetch for HttpFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<Value, Error> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("{status}: {text}")));
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Normalised outcome of a service call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceResult {
    pub valid: bool,
    pub response: Option<Value>,
    pub error: Option<String>,
}

impl ServiceResult {
    pub fn failed(error: impl Into<String>) -> Self {
        ServiceResult {
            valid: false,
            response: None,
            error: Some(error.into()),
        }
    }

    /// Field of the response body, if any.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.response.as_ref()?.get(name)
    }

    /// `sessionDescription` of the response body, if it carries a valid one.
    pub fn session_description(&self) -> Option<SessionDescription> {
        let value = self.field("sessionDescription")?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// Thin client over the five service endpoints.
#[derive(Clone)]
pub struct RestClient {
    config: RestConfig,
    fetch: Arc<dyn JsonFetch>,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        Ok(Self::with_fetch(config, Arc::new(HttpFetch::new()?)))
    }

    pub fn with_fetch(config: RestConfig, fetch: Arc<dyn JsonFetch>) -> Self {
        RestClient { config, fetch }
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/sessions/{path}",
            self.config.service_base_url.trim_end_matches('/')
        )
    }

    async fn call(&self, method: Method, path: String, body: Option<Value>) -> ServiceResult {
        let request = FetchRequest {
            method,
            url: self.url(&path),
            headers: vec![
                ("Authorization", format!("Bearer {}", self.config.access_token)),
                ("Content-Type", "application/json".to_owned()),
            ],
            body,
        };
        match self.fetch.fetch(request).await {
            Ok(response) => match response.get("errorCode") {
                Some(code) => {
                    let description = response
                        .get("errorDescription")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    log::warn!("sessions/{path} rejected: {code} {description}");
                    ServiceResult {
                        valid: false,
                        error: Some(format!("{code}: {description}")),
                        response: Some(response),
                    }
                }
                None => ServiceResult {
                    valid: true,
                    response: Some(response),
                    error: None,
                },
            },
            Err(e) => {
                log::warn!("sessions/{path} failed: {e}");
                ServiceResult::failed(e.to_string())
            }
        }
    }

    pub async fn create_new_session(&self, offer: &SessionDescription) -> ServiceResult {
        self.call(Method::POST, "new".into(), Some(json!({ "sessionDescription": offer })))
            .await
    }

    pub async fn add_new_track(
        &self,
        session_id: &str,
        description: Option<&SessionDescription>,
        tracks: &[TrackDescriptor],
    ) -> ServiceResult {
        let mut body = json!({ "tracks": tracks });
        if let Some(description) = description {
            body["sessionDescription"] = json!(description);
        }
        self.call(Method::POST, format!("add/{session_id}"), Some(body))
            .await
    }

    pub async fn renegotiate_session(
        &self,
        session_id: &str,
        answer: &SessionDescription,
    ) -> ServiceResult {
        self.call(
            Method::PUT,
            format!("reneg/{session_id}"),
            Some(json!({ "sessionDescription": answer })),
        )
        .await
    }

    pub async fn close_track(
        &self,
        session_id: &str,
        offer: &SessionDescription,
        mids: &[String],
        force: bool,
    ) -> ServiceResult {
        let tracks: Vec<_> = mids.iter().map(|mid| json!({ "mid": mid })).collect();
        self.call(
            Method::PUT,
            format!("close/{session_id}"),
            Some(json!({ "force": force, "sessionDescription": offer, "tracks": tracks })),
        )
        .await
    }

    pub async fn get_session_information(&self, session_id: &str) -> ServiceResult {
        self.call(Method::GET, format!("info/{session_id}"), None).await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("service_base_url", &self.config.service_base_url)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MockFetch;

    fn client(fetch: Arc<MockFetch>) -> RestClient {
        let config = RestConfig::new("https://calls.example/v1/apps/app/", "secret");
        RestClient::with_fetch(config, fetch)
    }

    #[tokio::test]
    async fn requests_are_bearer_authenticated_json() {
        let fetch = MockFetch::new();
        fetch.respond("new", Ok(json!({"sessionId": "s1"})));
        let result = client(fetch.clone())
            .create_new_session(&SessionDescription::offer("v=0"))
            .await;
        assert!(result.valid);
        assert_eq!(result.field("sessionId"), Some(&json!("s1")));

        let requests = fetch.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].url, "https://calls.example/v1/apps/app/sessions/new");
        assert!(requests[0]
            .headers
            .contains(&("Authorization", "Bearer secret".to_owned())));
        assert_eq!(
            requests[0].body,
            Some(json!({"sessionDescription": {"type": "offer", "sdp": "v=0"}}))
        );
    }

    #[tokio::test]
    async fn error_code_and_transport_failures_are_invalid() {
        let fetch = MockFetch::new();
        fetch.respond(
            "info/s1",
            Ok(json!({"errorCode": "not_found", "errorDescription": "no such session"})),
        );
        let rest = client(fetch.clone());
        let result = rest.get_session_information("s1").await;
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("\"not_found\": no such session"));
        assert!(result.response.is_some());

        let result = rest.renegotiate_session("s1", &SessionDescription::answer("v=0")).await;
        assert!(!result.valid);
        assert!(result.response.is_none());
        assert_eq!(fetch.requests()[1].method, Method::PUT);
    }

    #[tokio::test]
    async fn close_track_lists_mids() {
        let fetch = MockFetch::new();
        fetch.respond("close/s1", Ok(json!({})));
        let result = client(fetch.clone())
            .close_track("s1", &SessionDescription::offer("v=0"), &["0".into(), "1".into()], true)
            .await;
        assert!(result.valid);
        let body = fetch.requests()[0].body.clone().unwrap();
        assert_eq!(body["force"], json!(true));
        assert_eq!(body["tracks"], json!([{"mid": "0"}, {"mid": "1"}]));
    }

    #[test]
    fn track_descriptors_use_service_field_names() {
        let remote = TrackDescriptor::remote(None, "cam".into(), "s1");
        assert_eq!(
            serde_json::to_value(&remote).unwrap(),
            json!({"location": "remote", "trackName": "cam", "sessionId": "s1"})
        );
        let local = TrackDescriptor::local("0".into(), "cam".into());
        assert_eq!(
            serde_json::to_value(&local).unwrap(),
            json!({"location": "local", "mid": "0", "trackName": "cam"})
        );
    }
}
