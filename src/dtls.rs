//! PSK-DTLS streaming controller: one session to one hub, carrying
//! entertainment updates at up to 25 Hz with a keepalive fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::conn::Conn;

use crate::error::{BridgeError, BridgeResult};
use crate::packet::{encode_update_packet, ColorUpdate};

pub const HUE_STREAM_PORT: u16 = 2100;

/// Ceiling on the handshake, covering a 4-retransmission budget at
/// webrtc-dtls's default ~1s flight interval.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(40);
const KEEPALIVE_TICK: Duration = Duration::from_millis(1000);
const KEEPALIVE_STALE_AFTER: Duration = Duration::from_millis(2000);

/// Throttle gate: true once a prior send lies within `min_interval` of `now`.
fn below_min_interval(last_sent_at: Option<Instant>, now: Instant, min_interval: Duration) -> bool {
    last_sent_at.is_some_and(|last| now.duration_since(last) < min_interval)
}

/// Keepalive gate: true once no send attempt has landed within `threshold`
/// of `now`, or none ever has.
fn is_stale(last_attempt_at: Option<Instant>, now: Instant, threshold: Duration) -> bool {
    last_attempt_at.map_or(true, |t| now.duration_since(t) >= threshold)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Idle,
    Handshaking,
    Open,
    Closed,
}

/// Outcome of a [`StreamingController::send_update`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    Sent,
    NotOpen,
    Throttled,
    /// Reserved: emitted only when the (currently inert) rate-halving
    /// policy is enabled.
    Skipped,
}

/// Lifecycle events emitted by the controller's state machine.
#[derive(Clone, Debug)]
pub enum DtlsEvent {
    Connected,
    Error(String),
    Closed,
}

struct Inner {
    state: ControllerState,
    conn: Option<Arc<dyn Conn + Send + Sync>>,
    last_sent_at: Option<Instant>,
    last_attempt_at: Option<Instant>,
    last_update: Option<Vec<u8>>,
    skip_next: bool,
}

/// One PSK-DTLS session to one hub.
pub struct StreamingController {
    host: String,
    psk_identity: Vec<u8>,
    psk_secret: Arc<Vec<u8>>,
    entertainment_configuration_id: String,
    min_interval: Duration,
    /// Disabled rate-halving hook: when set, every
    /// other accepted send is reported as `Skipped` instead of sent.
    pub skip_odd_frames: bool,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::UnboundedSender<DtlsEvent>,
}

impl StreamingController {
    pub fn new(
        host: impl Into<String>,
        psk_identity: impl Into<Vec<u8>>,
        psk_secret: Vec<u8>,
        entertainment_configuration_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<DtlsEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            host: host.into(),
            psk_identity: psk_identity.into(),
            psk_secret: Arc::new(psk_secret),
            entertainment_configuration_id: entertainment_configuration_id.into(),
            min_interval: DEFAULT_MIN_INTERVAL,
            skip_odd_frames: false,
            inner: Arc::new(Mutex::new(Inner {
                state: ControllerState::Idle,
                conn: None,
                last_sent_at: None,
                last_attempt_at: None,
                last_update: None,
                skip_next: false,
            })),
            events_tx,
        };
        (controller, events_rx)
    }

    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state
    }

    /// Binds a UDP socket, performs the PSK-DTLS handshake and transitions
    /// to `Open` on success.
    pub async fn connect(&self) -> BridgeResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = ControllerState::Handshaking;
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.host.as_str(), HUE_STREAM_PORT)).await?;

        let secret = self.psk_secret.clone();
        let identity_hint = self.psk_identity.clone();
        let config = Config {
            psk: Some(Arc::new(move |_hint: &[u8]| Ok(secret.as_ref().clone()))),
            psk_identity_hint: Some(identity_hint),
            cipher_suites: vec![CipherSuiteId::Tls_Psk_With_Aes_128_Gcm_Sha256],
            extended_master_secret: ExtendedMasterSecretType::Require,
            ..Default::default()
        };

        let handshake = DTLSConn::new(Arc::new(socket), config, true, None);
        let conn = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.fail(DtlsEvent::Error(e.to_string())).await;
                return Err(BridgeError::DtlsHandshakeFailure(e.to_string()));
            }
            Err(_) => {
                self.fail(DtlsEvent::Error("handshake timed out".into())).await;
                return Err(BridgeError::DtlsHandshakeFailure(
                    "handshake timed out".into(),
                ));
            }
        };

        let mut inner = self.inner.lock().await;
        inner.state = ControllerState::Open;
        inner.conn = Some(Arc::new(conn));
        drop(inner);

        info!("dtls session to {} open", self.host);
        let _ = self.events_tx.send(DtlsEvent::Connected);
        Ok(())
    }

    /// Sends one update, subject to the throttle gate.
    pub async fn send_update(&self, updates: &[ColorUpdate]) -> SendOutcome {
        let packet = encode_update_packet(&self.entertainment_configuration_id, updates);
        let now = Instant::now();

        let mut inner = self.inner.lock().await;
        inner.last_attempt_at = Some(now);

        if inner.state != ControllerState::Open {
            return SendOutcome::NotOpen;
        }

        if below_min_interval(inner.last_sent_at, now, self.min_interval) {
            inner.last_update = Some(packet);
            return SendOutcome::Throttled;
        }

        if self.skip_odd_frames {
            if inner.skip_next {
                inner.skip_next = false;
                inner.last_update = Some(packet);
                return SendOutcome::Skipped;
            }
            inner.skip_next = true;
        }

        let conn = inner.conn.clone();
        inner.last_update = Some(packet.clone());
        inner.last_sent_at = Some(now);
        drop(inner);

        self.write(conn, packet).await
    }

    /// Resends the last-known update unconditionally if the controller has
    /// gone quiet.
    pub async fn keepalive_tick(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.state != ControllerState::Open {
            return;
        }
        if !is_stale(inner.last_attempt_at, now, KEEPALIVE_STALE_AFTER) {
            return;
        }
        let Some(packet) = inner.last_update.clone() else {
            return;
        };
        let conn = inner.conn.clone();
        inner.last_sent_at = Some(now);
        drop(inner);

        self.write(conn, packet).await;
    }

    async fn write(&self, conn: Option<Arc<dyn Conn + Send + Sync>>, packet: Vec<u8>) -> SendOutcome {
        match conn {
            Some(conn) => match conn.send(&packet).await {
                Ok(_) => SendOutcome::Sent,
                Err(e) => {
                    self.fail(DtlsEvent::Error(e.to_string())).await;
                    SendOutcome::NotOpen
                }
            },
            None => SendOutcome::NotOpen,
        }
    }

    /// Idempotent shutdown: closing an already-closed controller is a no-op.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ControllerState::Closed {
            return;
        }
        let conn = inner.conn.take();
        inner.state = ControllerState::Closed;
        drop(inner);

        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!("error closing dtls session to {}: {e}", self.host);
            }
        }
        let _ = self.events_tx.send(DtlsEvent::Closed);
    }

    async fn fail(&self, event: DtlsEvent) {
        let mut inner = self.inner.lock().await;
        if inner.state == ControllerState::Closed {
            return;
        }
        inner.state = ControllerState::Closed;
        inner.conn = None;
        drop(inner);

        error!("dtls session to {} failed: {event:?}", self.host);
        let _ = self.events_tx.send(event);
        let _ = self.events_tx.send(DtlsEvent::Closed);
    }

    /// Spawns the periodic keepalive task; it stops on its own once the
    /// controller leaves `Open` (checked every tick).
    pub fn spawn_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_TICK);
            loop {
                interval.tick().await;
                if controller.state().await != ControllerState::Open {
                    break;
                }
                controller.keepalive_tick().await;
            }
        })
    }
}
