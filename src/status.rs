//! In-memory observability store: per-receiver and per-hub
//! counters and state, snapshotted on demand as a deep, serializable copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::dtls::SendOutcome;
use crate::packet::ColorUpdate;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReceiverStatus {
    pub bind_address: String,
    pub last_frame_at: Option<u64>,
    pub frames_total: u64,
    pub malformed_total: u64,
    pub frames_by_universe: HashMap<u16, u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LightStatus {
    pub rgb16: [u16; 3],
    pub last_update_at: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HubStatus {
    pub started: bool,
    pub streaming_enabled: bool,
    pub dtls_connected: bool,
    pub last_dmx_at: Option<u64>,
    pub last_send_at: Option<u64>,
    pub frames_matched: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_throttled: u64,
    pub last_error: Option<String>,
    pub lights: HashMap<u8, LightStatus>,
}

/// A deep copy of the store, safe to serialize for a future dashboard.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RuntimeStatusSnapshot {
    pub receiver: Option<ReceiverStatus>,
    pub hubs: HashMap<String, HubStatus>,
}

/// Cheaply cloneable handle shared across the receiver and every hub
/// runner; all mutation goes through a single mutex.
#[derive(Clone, Default)]
pub struct RuntimeStatus {
    inner: Arc<Mutex<RuntimeStatusSnapshot>>,
}

impl RuntimeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> RuntimeStatusSnapshot {
        self.inner.lock().await.clone()
    }

    pub async fn register_receiver(&self, bind_address: String) {
        let mut inner = self.inner.lock().await;
        inner.receiver = Some(ReceiverStatus {
            bind_address,
            ..Default::default()
        });
    }

    pub async fn record_frame(&self, universe: u16) {
        let mut inner = self.inner.lock().await;
        if let Some(receiver) = inner.receiver.as_mut() {
            receiver.frames_total += 1;
            receiver.last_frame_at = Some(now_millis());
            *receiver.frames_by_universe.entry(universe).or_insert(0) += 1;
        }
    }

    pub async fn record_malformed(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(receiver) = inner.receiver.as_mut() {
            receiver.malformed_total += 1;
        }
    }

    pub async fn register_hub(&self, hub_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.hubs.entry(hub_id.to_string()).or_default();
    }

    pub async fn set_started(&self, hub_id: &str, started: bool) {
        self.with_hub(hub_id, |hub| hub.started = started).await;
    }

    pub async fn set_streaming_enabled(&self, hub_id: &str, enabled: bool) {
        self.with_hub(hub_id, |hub| hub.streaming_enabled = enabled)
            .await;
    }

    pub async fn set_dtls_connected(&self, hub_id: &str, connected: bool) {
        self.with_hub(hub_id, |hub| hub.dtls_connected = connected)
            .await;
    }

    pub async fn record_dmx_match(&self, hub_id: &str) {
        let at = now_millis();
        self.with_hub(hub_id, move |hub| {
            hub.last_dmx_at = Some(at);
            hub.frames_matched += 1;
        })
        .await;
    }

    pub async fn record_send_outcome(
        &self,
        hub_id: &str,
        outcome: SendOutcome,
        updates: &[ColorUpdate],
    ) {
        let at = now_millis();
        let updates = updates.to_vec();
        self.with_hub(hub_id, move |hub| {
            match outcome {
                SendOutcome::Sent => {
                    hub.packets_sent += 1;
                    hub.last_send_at = Some(at);
                    for update in updates {
                        hub.lights.insert(
                            update.channel_id,
                            LightStatus {
                                rgb16: update.rgb16,
                                last_update_at: at,
                            },
                        );
                    }
                }
                SendOutcome::Throttled => hub.packets_throttled += 1,
                SendOutcome::NotOpen | SendOutcome::Skipped => hub.packets_dropped += 1,
            }
        })
        .await;
    }

    pub async fn set_last_error(&self, hub_id: &str, error: String) {
        self.with_hub(hub_id, move |hub| hub.last_error = Some(error))
            .await;
    }

    async fn with_hub(&self, hub_id: &str, f: impl FnOnce(&mut HubStatus)) {
        let mut inner = self.inner.lock().await;
        let hub = inner.hubs.entry(hub_id.to_string()).or_default();
        f(hub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_frames_and_hub_state() {
        let status = RuntimeStatus::new();
        status.register_receiver("0.0.0.0:6454".into()).await;
        status.record_frame(1).await;
        status.record_frame(1).await;
        status.record_malformed().await;

        status.register_hub("hub-1").await;
        status.set_started("hub-1", true).await;
        status
            .record_send_outcome(
                "hub-1",
                SendOutcome::Sent,
                &[ColorUpdate {
                    channel_id: 0,
                    rgb16: [1, 2, 3],
                }],
            )
            .await;

        let snapshot = status.snapshot().await;
        let receiver = snapshot.receiver.unwrap();
        assert_eq!(receiver.frames_total, 2);
        assert_eq!(receiver.malformed_total, 1);
        assert_eq!(receiver.frames_by_universe.get(&1), Some(&2));

        let hub = snapshot.hubs.get("hub-1").unwrap();
        assert!(hub.started);
        assert_eq!(hub.packets_sent, 1);
        assert_eq!(hub.lights.get(&0).unwrap().rgb16, [1, 2, 3]);
    }
}
