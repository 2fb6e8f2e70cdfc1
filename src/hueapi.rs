//! HTTPS client for the hub's local REST control plane.

use std::error::Error as _;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use crate::error::{BridgeError, BridgeResult};

const ENTERTAINMENT_CONFIGURATION_PATH: &str = "/clip/v2/resource/entertainment_configuration";

/// A hub-side entertainment configuration, as reported by the control
/// plane, mirrored read-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntertainmentConfigurationSummary {
    pub id: String,
    pub name: Option<String>,
    pub channel_ids: Vec<u8>,
}

/// The subset of the control plane a [`crate::runner::HubRunner`] needs,
/// abstracted so startup logic (in particular the channel-set check in
/// the hub runner's startup) can be tested against a fake without a
/// network.
pub trait HueApi: Send + Sync {
    async fn list_entertainment_configurations(
        &self,
    ) -> BridgeResult<Vec<EntertainmentConfigurationSummary>>;
    async fn resolve_application_id(&self) -> BridgeResult<String>;
    async fn start_entertainment_configuration(&self, id: &str) -> BridgeResult<()>;
    async fn stop_entertainment_configuration(&self, id: &str) -> BridgeResult<()>;
}

pub struct HueApiClient {
    addr: String,
    app_key: String,
    strict: Client,
    insecure: Client,
    /// Sticky: once a TLS failure forces the insecure fallback, stay
    /// insecure for the rest of the process rather than retrying strict
    /// verification on every call.
    use_insecure: AtomicBool,
}

impl HueApiClient {
    pub fn new(addr: impl Into<String>, app_key: impl Into<String>) -> Self {
        let strict = Client::builder()
            .build()
            .expect("reqwest client with default TLS settings");
        let insecure = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .expect("reqwest client with certificate verification disabled");
        Self {
            addr: addr.into(),
            app_key: app_key.into(),
            strict,
            insecure,
            use_insecure: AtomicBool::new(false),
        }
    }

    /// GET `/auth/v1`, resolving the PSK identity from the
    /// `hue-application-id` response header, falling back to the
    /// configured app key when the header is absent.
    pub async fn resolve_application_id(&self) -> BridgeResult<String> {
        let path = "/auth/v1";
        let resp = self
            .request(Method::GET, path, |b| {
                b.header("hue-application-key", &self.app_key)
            })
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure("GET", path, status.as_u16(), body));
        }
        let application_id = resp
            .headers()
            .get("hue-application-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let _ = resp.bytes().await; // drain the body regardless
        Ok(application_id.unwrap_or_else(|| self.app_key.clone()))
    }

    pub async fn list_entertainment_configurations(
        &self,
    ) -> BridgeResult<Vec<EntertainmentConfigurationSummary>> {
        let resp = self
            .request(Method::GET, ENTERTAINMENT_CONFIGURATION_PATH, |b| {
                b.header("hue-application-key", &self.app_key)
            })
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(http_failure(
                "GET",
                ENTERTAINMENT_CONFIGURATION_PATH,
                status.as_u16(),
                body,
            ));
        }
        let envelope: V2Envelope<Vec<EntertainmentConfigurationJson>> =
            serde_json::from_str(&body)?;
        Ok(envelope
            .data
            .into_iter()
            .map(EntertainmentConfigurationSummary::from)
            .collect())
    }

    pub async fn start_entertainment_configuration(&self, id: &str) -> BridgeResult<()> {
        self.set_action(id, "start").await
    }

    pub async fn stop_entertainment_configuration(&self, id: &str) -> BridgeResult<()> {
        self.set_action(id, "stop").await
    }

    async fn set_action(&self, id: &str, action: &str) -> BridgeResult<()> {
        let path = format!("{ENTERTAINMENT_CONFIGURATION_PATH}/{id}");
        let payload = json!({ "action": action });
        let resp = self
            .request(Method::PUT, &path, |b| {
                b.header("hue-application-key", &self.app_key)
                    .json(&payload)
            })
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure("PUT", &path, status.as_u16(), body));
        }
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> BridgeResult<Response> {
        let url = format!("https://{}{}", self.addr, path);
        let use_insecure = self.use_insecure.load(Ordering::SeqCst);
        let client = if use_insecure { &self.insecure } else { &self.strict };

        match build(client.request(method.clone(), &url)).send().await {
            Ok(resp) => Ok(resp),
            Err(e) if !use_insecure && is_tls_error(&e) => {
                warn!(
                    "TLS verification failed for {url}, retrying once with certificate validation disabled"
                );
                self.use_insecure.store(true, Ordering::SeqCst);
                build(self.insecure.request(method, &url))
                    .send()
                    .await
                    .map_err(|e| BridgeError::TlsFailure(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl HueApi for HueApiClient {
    async fn list_entertainment_configurations(
        &self,
    ) -> BridgeResult<Vec<EntertainmentConfigurationSummary>> {
        HueApiClient::list_entertainment_configurations(self).await
    }

    async fn resolve_application_id(&self) -> BridgeResult<String> {
        HueApiClient::resolve_application_id(self).await
    }

    async fn start_entertainment_configuration(&self, id: &str) -> BridgeResult<()> {
        HueApiClient::start_entertainment_configuration(self, id).await
    }

    async fn stop_entertainment_configuration(&self, id: &str) -> BridgeResult<()> {
        HueApiClient::stop_entertainment_configuration(self, id).await
    }
}

fn is_tls_error(err: &reqwest::Error) -> bool {
    err.is_connect()
        && err
            .source()
            .map(|s| s.to_string().to_lowercase())
            .is_some_and(|s| s.contains("certificate") || s.contains("tls") || s.contains("ssl"))
}

fn http_failure(method: &str, path: &str, status: u16, body: String) -> BridgeError {
    BridgeError::HttpFailure {
        method: method.to_string(),
        path: path.to_string(),
        status,
        body,
    }
}

#[derive(Debug, Deserialize)]
struct V2Envelope<T> {
    #[serde(default)]
    #[allow(dead_code)]
    errors: Vec<V2ErrorItem>,
    #[serde(default)]
    data: T,
}

#[derive(Debug, Deserialize)]
struct V2ErrorItem {
    #[allow(dead_code)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct EntertainmentConfigurationJson {
    id: String,
    #[serde(default)]
    metadata: Option<EntertainmentMetadataJson>,
    #[serde(default)]
    channels: Vec<EntertainmentChannelJson>,
}

#[derive(Debug, Deserialize)]
struct EntertainmentMetadataJson {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntertainmentChannelJson {
    channel_id: serde_json::Value,
}

impl From<EntertainmentConfigurationJson> for EntertainmentConfigurationSummary {
    fn from(raw: EntertainmentConfigurationJson) -> Self {
        Self {
            id: raw.id,
            name: raw.metadata.and_then(|m| m.name),
            channel_ids: raw
                .channels
                .into_iter()
                .filter_map(|c| finite_channel_id(&c.channel_id))
                .collect(),
        }
    }
}

/// `channels[].channel_id` filtered to finite integers.
fn finite_channel_id(value: &serde_json::Value) -> Option<u8> {
    value.as_u64().and_then(|n| u8::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entertainment_configuration_list() {
        let body = r#"{
            "errors": [],
            "data": [
                {
                    "id": "01234567-89ab-cdef-0123-456789abcdef",
                    "metadata": { "name": "Living Room" },
                    "channels": [
                        { "channel_id": 0 },
                        { "channel_id": 1 },
                        { "channel_id": "not-a-number" }
                    ]
                }
            ]
        }"#;
        let envelope: V2Envelope<Vec<EntertainmentConfigurationJson>> =
            serde_json::from_str(body).unwrap();
        let summaries: Vec<EntertainmentConfigurationSummary> = envelope
            .data
            .into_iter()
            .map(EntertainmentConfigurationSummary::from)
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name.as_deref(), Some("Living Room"));
        assert_eq!(summaries[0].channel_ids, vec![0, 1]);
    }
}
