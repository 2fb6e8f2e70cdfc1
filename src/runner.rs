//! Per-hub orchestration: takes one hub from configured to
//! streaming, forwards matching Art-Net frames, and tears everything
//! down cleanly on exit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};

use crate::artnet::ArtDmxFrame;
use crate::config::{decode_client_key, HubConfig};
use crate::dtls::{ControllerState, StreamingController};
use crate::error::{BridgeError, BridgeResult};
use crate::hueapi::{HueApi, HueApiClient};
use crate::packet::ColorUpdate;
use crate::status::RuntimeStatus;

/// Runtime commands a caller (e.g. a future CLI or dashboard) can send
/// to a running hub without going through Art-Net.
#[derive(Clone, Debug)]
pub enum HubCommand {
    SendSolidColor([u16; 3]),
}

/// A [`HubRunner`] wired to the real hub control plane. This is the
/// type every caller outside of tests actually uses.
pub type DefaultHubRunner = HubRunner<HueApiClient>;

/// Races `fut` against the shutdown signal. `None` means shutdown fired
/// first and `fut` was dropped without completing.
async fn cancellable<F: Future>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.changed() => None,
        res = fut => Some(res),
    }
}

/// Drives one hub from startup through streaming to shutdown. Generic
/// over the control-plane client so startup logic can be exercised
/// against a fake [`HueApi`] without a network.
pub struct HubRunner<A: HueApi> {
    config: HubConfig,
    api: A,
    status: RuntimeStatus,
    commands: mpsc::UnboundedSender<HubCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<HubCommand>>,
}

impl HubRunner<HueApiClient> {
    pub fn new(config: HubConfig, status: RuntimeStatus) -> Self {
        let api = HueApiClient::new(config.host.clone(), config.username.clone());
        Self::with_api(config, api, status)
    }
}

impl<A: HueApi> HubRunner<A> {
    pub fn with_api(config: HubConfig, api: A, status: RuntimeStatus) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            config,
            api,
            status,
            commands,
            commands_rx: Some(commands_rx),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<HubCommand> {
        self.commands.clone()
    }

    /// Runs this hub to completion: connects, streams until `shutdown`
    /// fires or the transport fails, then tears down. Startup failures
    /// and streaming failures both take the same teardown path so a
    /// stopped entertainment configuration is never left running on the
    /// hub.
    pub async fn run(
        mut self,
        mut frames: broadcast::Receiver<Arc<ArtDmxFrame>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BridgeResult<()> {
        self.status.register_hub(&self.config.id).await;

        let controller = match self.start(&mut shutdown).await {
            Ok(Some(controller)) => controller,
            Ok(None) => {
                info!("hub {}: shutdown requested during startup", self.config.id);
                if let Some(id) = &self.config.entertainment_configuration_id {
                    let _ = self.api.stop_entertainment_configuration(id).await;
                }
                self.status.set_started(&self.config.id, false).await;
                return Ok(());
            }
            Err(e) => {
                self.status.set_last_error(&self.config.id, e.to_string()).await;
                error!("hub {}: startup failed: {e}", self.config.id);
                if let Some(id) = &self.config.entertainment_configuration_id {
                    let _ = self.api.stop_entertainment_configuration(id).await;
                }
                return Err(e);
            }
        };

        self.status.set_streaming_enabled(&self.config.id, true).await;
        let keepalive = controller.spawn_keepalive();
        let mut commands_rx = self.commands_rx.take().expect("commands_rx taken once");

        let result = self
            .stream(&controller, &mut frames, &mut commands_rx, &mut shutdown)
            .await;

        keepalive.abort();
        controller.close().await;
        self.status.set_dtls_connected(&self.config.id, false).await;
        self.status.set_streaming_enabled(&self.config.id, false).await;

        if let Some(id) = &self.config.entertainment_configuration_id {
            if let Err(e) = self.api.stop_entertainment_configuration(id).await {
                warn!("hub {}: failed to stop entertainment configuration: {e}", self.config.id);
            }
        }
        self.status.set_started(&self.config.id, false).await;

        result
    }

    /// The startup sequence: validate required
    /// fields, verify the remote channel set matches the configured one
    /// (failing *before* any `start` call), claim the configuration,
    /// wait out the hub's settle window, connect, and push one
    /// all-black frame once the session is open.
    ///
    /// Every suspension point (the remote calls, the settle sleep, the
    /// DTLS handshake) races the `shutdown` signal; `Ok(None)` means
    /// shutdown fired before startup finished and the caller should
    /// skip straight to teardown instead of treating this as a failure.
    async fn start(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BridgeResult<Option<StreamingController>> {
        let id = self.config.id.clone();

        let entertainment_configuration_id = self
            .config
            .entertainment_configuration_id
            .as_ref()
            .ok_or_else(|| BridgeError::ConfigInvalid(format!("hub {id}: missing entertainmentConfigurationId")))?
            .clone();
        if self.config.username.is_empty() {
            return Err(BridgeError::ConfigInvalid(format!("hub {id}: missing username")));
        }
        if self.config.client_key.is_empty() {
            return Err(BridgeError::ConfigInvalid(format!("hub {id}: missing clientKey")));
        }
        if self.config.channels.is_empty() {
            return Err(BridgeError::ConfigInvalid(format!("hub {id}: channels must be non-empty")));
        }

        let Some(remote) = cancellable(shutdown, self.api.list_entertainment_configurations()).await
        else {
            return Ok(None);
        };
        let remote = remote?;
        let remote_channels = remote
            .iter()
            .find(|c| c.id == entertainment_configuration_id)
            .ok_or_else(|| {
                BridgeError::ConfigInvalid(format!(
                    "hub {id}: entertainment configuration {entertainment_configuration_id} not found on hub"
                ))
            })?;

        let mut configured: Vec<u8> = self.config.channels.iter().map(|c| c.channel_id).collect();
        configured.sort_unstable();
        let mut remote_ids = remote_channels.channel_ids.clone();
        remote_ids.sort_unstable();
        if configured != remote_ids {
            let missing: Vec<u8> = remote_ids
                .iter()
                .filter(|c| !configured.contains(c))
                .copied()
                .collect();
            let extra: Vec<u8> = configured
                .iter()
                .filter(|c| !remote_ids.contains(c))
                .copied()
                .collect();
            return Err(BridgeError::ConfigMismatch { hub: id, missing, extra });
        }

        let psk_secret =
            decode_client_key(&self.config.client_key).map_err(BridgeError::ConfigInvalid)?;

        let Some(psk_identity) = cancellable(shutdown, self.api.resolve_application_id()).await
        else {
            return Ok(None);
        };
        let psk_identity = psk_identity?;

        let Some(started) = cancellable(
            shutdown,
            self.api.start_entertainment_configuration(&entertainment_configuration_id),
        )
        .await
        else {
            return Ok(None);
        };
        started?;
        self.status.set_started(&id, true).await;

        // Hue hubs need a short settle window between claiming the
        // configuration and the first DTLS handshake attempt.
        if cancellable(shutdown, tokio::time::sleep(Duration::from_millis(1000)))
            .await
            .is_none()
        {
            return Ok(None);
        }

        let (controller, mut events) = StreamingController::new(
            self.config.host.clone(),
            psk_identity.into_bytes(),
            psk_secret,
            entertainment_configuration_id,
        );
        let Some(connected) = cancellable(shutdown, controller.connect()).await else {
            return Ok(None);
        };
        connected?;
        self.status.set_dtls_connected(&id, true).await;

        let black: Vec<ColorUpdate> = self
            .config
            .channels
            .iter()
            .map(|c| ColorUpdate { channel_id: c.channel_id, rgb16: [0, 0, 0] })
            .collect();
        controller.send_update(&black).await;

        // Drain the one-shot Connected event so a later Error/Closed
        // from the background keepalive isn't mistaken for it.
        let _ = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;

        Ok(Some(controller))
    }

    async fn stream(
        &self,
        controller: &StreamingController,
        frames: &mut broadcast::Receiver<Arc<ArtDmxFrame>>,
        commands: &mut mpsc::UnboundedReceiver<HubCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BridgeResult<()> {
        loop {
            if controller.state().await != ControllerState::Open {
                return Err(BridgeError::TransportLoss(format!(
                    "hub {}: dtls session closed",
                    self.config.id
                )));
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("hub {}: shutting down", self.config.id);
                        return Ok(());
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        Ok(frame) => self.handle_frame(controller, &frame).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("hub {}: dropped {n} art-net frames while lagging", self.config.id);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(BridgeError::TransportLoss(format!(
                                "hub {}: art-net receiver closed",
                                self.config.id
                            )));
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(HubCommand::SendSolidColor(rgb16)) => {
                            let updates: Vec<ColorUpdate> = self
                                .config
                                .channels
                                .iter()
                                .map(|c| ColorUpdate { channel_id: c.channel_id, rgb16 })
                                .collect();
                            let outcome = controller.send_update(&updates).await;
                            self.status.record_send_outcome(&self.config.id, outcome, &updates).await;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, controller: &StreamingController, frame: &ArtDmxFrame) {
        if frame.universe != self.config.art_net_universe {
            return;
        }
        self.status.record_dmx_match(&self.config.id).await;

        let updates: Vec<ColorUpdate> = self
            .config
            .channels
            .iter()
            .map(|mapping| ColorUpdate {
                channel_id: mapping.channel_id,
                rgb16: mapping.decode(&frame.data),
            })
            .collect();

        let outcome = controller.send_update(&updates).await;
        self.status.record_send_outcome(&self.config.id, outcome, &updates).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::channel::{ChannelMapping, ChannelMode};
    use crate::hueapi::EntertainmentConfigurationSummary;

    use super::*;

    /// A canned control plane: the remote entertainment configuration's
    /// channel set is fixed at construction, and every call to `start`
    /// is recorded so tests can assert it was never reached.
    struct FakeHueApi {
        remote: Vec<EntertainmentConfigurationSummary>,
        start_called: AtomicBool,
    }

    impl HueApi for FakeHueApi {
        async fn list_entertainment_configurations(
            &self,
        ) -> BridgeResult<Vec<EntertainmentConfigurationSummary>> {
            Ok(self.remote.clone())
        }

        async fn resolve_application_id(&self) -> BridgeResult<String> {
            Ok("app-id".to_string())
        }

        async fn start_entertainment_configuration(&self, _id: &str) -> BridgeResult<()> {
            self.start_called.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_entertainment_configuration(&self, _id: &str) -> BridgeResult<()> {
            Ok(())
        }
    }

    fn hub_config(remote_channel_ids: &[u8]) -> (HubConfig, FakeHueApi) {
        let hub = HubConfig {
            id: "hub-1".to_string(),
            name: None,
            host: "192.168.1.10".to_string(),
            username: "user".to_string(),
            client_key: "0011223344556677".to_string(),
            entertainment_configuration_id: Some(
                "01234567-89ab-cdef-0123-456789abcdef".to_string(),
            ),
            art_net_universe: 0,
            channels: vec![
                ChannelMapping { channel_id: 0, dmx_start: 1, channel_mode: ChannelMode::EightBit },
                ChannelMapping { channel_id: 1, dmx_start: 4, channel_mode: ChannelMode::EightBit },
            ],
        };
        let api = FakeHueApi {
            remote: vec![EntertainmentConfigurationSummary {
                id: "01234567-89ab-cdef-0123-456789abcdef".to_string(),
                name: None,
                channel_ids: remote_channel_ids.to_vec(),
            }],
            start_called: AtomicBool::new(false),
        };
        (hub, api)
    }

    #[tokio::test]
    async fn channel_set_mismatch_aborts_before_start_is_called() {
        let (hub, api) = hub_config(&[0, 2]); // hub has channel 2, not 1; missing 1, extra 2
        let runner = HubRunner::with_api(hub, api, RuntimeStatus::new());
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let err = runner.start(&mut shutdown_rx).await.unwrap_err();
        match err {
            BridgeError::ConfigMismatch { missing, extra, .. } => {
                assert_eq!(missing, vec![1]);
                assert_eq!(extra, vec![2]);
            }
            other => panic!("expected ConfigMismatch, got {other:?}"),
        }
        assert!(!runner.api.start_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn matching_channel_set_reaches_start() {
        let (hub, api) = hub_config(&[0, 1]);
        let runner = HubRunner::with_api(hub, api, RuntimeStatus::new());
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        // connect() will fail fast (nothing is listening on 192.168.1.10),
        // but start_entertainment_configuration must have been reached.
        let _ = tokio::time::timeout(Duration::from_secs(2), runner.start(&mut shutdown_rx)).await;
        assert!(runner.api.start_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_during_settle_sleep_cancels_startup() {
        let (hub, api) = hub_config(&[0, 1]);
        let runner = HubRunner::with_api(hub, api, RuntimeStatus::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        // Fires once start_entertainment_configuration has been reached,
        // i.e. partway through the 1s settle sleep that follows it.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown_tx.send(true);
        });

        let result = tokio::time::timeout(Duration::from_secs(1), runner.start(&mut shutdown_rx))
            .await
            .expect("start() must return promptly once shutdown fires, not after the full sleep");
        assert!(result.unwrap().is_none());
        assert!(runner.api.start_called.load(Ordering::SeqCst));
    }
}
