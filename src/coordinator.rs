//! Process-wide orchestration: validates the configuration,
//! starts the Art-Net receiver and one runner per hub, and drains
//! everything on shutdown.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::artnet::ArtNetReceiver;
use crate::config::{validate_hub_locally, Config};
use crate::error::BridgeResult;
use crate::runner::DefaultHubRunner;
use crate::status::RuntimeStatus;

/// Owns the receiver and every hub runner for one process lifetime.
pub struct Coordinator {
    receiver_task: JoinHandle<()>,
    hub_tasks: JoinSet<(String, BridgeResult<()>)>,
    hub_count: usize,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// Validates every hub's local invariants (via
    /// [`validate_hub_locally`]) up front, logging and skipping any hub
    /// that fails rather than aborting the whole document: configuration
    /// and setup errors abort the affected runner only. Binds the
    /// Art-Net receiver and spawns one task per
    /// receiver/runner; each runner's remote-state startup (entitlement
    /// check, DTLS handshake) happens inside its own task, so one hub's
    /// startup failure never blocks another's.
    pub async fn new(config: Config, status: RuntimeStatus) -> std::io::Result<Self> {
        let receiver = Arc::new(ArtNetReceiver::bind(config.artnet.bind_ip, status.clone()).await?);
        let (shutdown_tx, _) = watch::channel(false);

        let mut hub_tasks = JoinSet::new();
        for hub in config.hubs {
            let id = hub.id.clone();
            if let Err(e) = validate_hub_locally(&hub) {
                warn!("skipping hub {id}: {e}");
                continue;
            }
            let runner = DefaultHubRunner::new(hub, status.clone());
            let frames = receiver.subscribe();
            let shutdown_rx = shutdown_tx.subscribe();
            hub_tasks.spawn(async move { (id, runner.run(frames, shutdown_rx).await) });
        }
        let hub_count = hub_tasks.len();

        let receiver_task = {
            let receiver = Arc::clone(&receiver);
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { receiver.run(shutdown_rx).await })
        };

        Ok(Self {
            receiver_task,
            hub_tasks,
            hub_count,
            shutdown_tx,
        })
    }

    /// Number of hubs that passed local validation and got a runner
    /// task. The caller should treat zero as a startup failure: there
    /// is nothing left for the process to do.
    pub fn hub_count(&self) -> usize {
        self.hub_count
    }

    /// Signals every hub and the receiver to stop, cancels the receiver
    /// first, then drains every hub task concurrently so one slow hub
    /// cannot block the others' teardown, swallowing individual
    /// failures. Returns `true` if every hub task exited cleanly.
    pub async fn shutdown(mut self) -> bool {
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.receiver_task.await {
            error!("art-net receiver task panicked: {e}");
        }

        let mut all_clean = true;
        while let Some(joined) = self.hub_tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => info!("hub {id}: shut down cleanly"),
                Ok((id, Err(e))) => {
                    all_clean = false;
                    error!("hub {id}: exited with error: {e}");
                }
                Err(e) => {
                    all_clean = false;
                    error!("hub task panicked: {e}");
                }
            }
        }
        all_clean
    }
}
