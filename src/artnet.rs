//! Art-Net ingestion: binds UDP/6454, parses ArtDmx datagrams and
//! fans them out to every subscriber.

use std::net::IpAddr;
use std::sync::Arc;

use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};

use crate::error::BridgeResult;
use crate::status::RuntimeStatus;

pub const ARTNET_PORT: u16 = 6454;

const ART_NET_ID: &[u8; 8] = b"Art-Net\0";
const OP_DMX: u16 = 0x5000;
const HEADER_LEN: usize = 18;

/// A parsed ArtDmx datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtDmxFrame {
    pub universe: u16,
    pub sequence: u8,
    pub data: Vec<u8>,
}

/// Parses one UDP datagram as an ArtDmx packet. Returns `None` for
/// anything else (wrong ID, wrong opcode, truncated header/body) — the
/// caller counts these as malformed and drops them.
pub fn parse_art_dmx(datagram: &[u8]) -> Option<ArtDmxFrame> {
    if datagram.len() < HEADER_LEN || &datagram[0..8] != ART_NET_ID {
        return None;
    }
    let op_code = u16::from_le_bytes([datagram[8], datagram[9]]);
    if op_code != OP_DMX {
        return None;
    }
    let sequence = datagram[12];
    let sub_uni = datagram[14];
    let net = datagram[15];
    let universe = ((net as u16 & 0x7F) << 8) | sub_uni as u16;
    let length = u16::from_be_bytes([datagram[16], datagram[17]]) as usize;

    let body = &datagram[HEADER_LEN..];
    if body.len() < length {
        return None;
    }

    Some(ArtDmxFrame {
        universe,
        sequence,
        data: body[..length].to_vec(),
    })
}

/// Binds UDP/6454 on one interface and fans parsed frames out to every
/// [`HubRunner`](crate::runner::HubRunner). Only one instance exists per
/// process; the socket is shared read-only by the broadcast.
pub struct ArtNetReceiver {
    socket: UdpSocket,
    sender: broadcast::Sender<Arc<ArtDmxFrame>>,
    status: RuntimeStatus,
}

impl ArtNetReceiver {
    pub async fn bind(bind_ip: IpAddr, status: RuntimeStatus) -> BridgeResult<Self> {
        let socket = UdpSocket::bind((bind_ip, ARTNET_PORT)).await?;
        let (sender, _) = broadcast::channel(256);
        status.register_receiver(format!("{bind_ip}:{ARTNET_PORT}")).await;
        Ok(Self {
            socket,
            sender,
            status,
        })
    }

    /// Each hub runner subscribes once at startup; a lagging subscriber
    /// only drops frames for itself, never blocking the receiver or other
    /// hubs: no ordering guarantee is offered across hubs.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ArtDmxFrame>> {
        self.sender.subscribe()
    }

    /// Runs the receive loop until `shutdown` is signaled. Never blocks
    /// on a subscriber: the hot path only does a parse and a channel send
    /// it must immediately hand frames off and return.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _peer)) => self.handle_datagram(&buf[..len]).await,
                        Err(e) => warn!("art-net socket error: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        match parse_art_dmx(datagram) {
            Some(frame) => {
                self.status.record_frame(frame.universe).await;
                // A full channel means every subscriber is behind; that's
                // fine, the oldest buffered frame is dropped for them.
                let _ = self.sender.send(Arc::new(frame));
            }
            None => self.status.record_malformed().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn art_dmx_datagram(universe: u16, sequence: u8, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(ART_NET_ID);
        buf.extend_from_slice(&OP_DMX.to_le_bytes());
        buf.extend_from_slice(&[0x00, 0x0e]); // ProtVer 14
        buf.push(sequence);
        buf.push(0); // physical
        buf.push((universe & 0xFF) as u8); // SubUni
        buf.push(((universe >> 8) & 0x7F) as u8); // Net
        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn parses_well_formed_art_dmx() {
        let datagram = art_dmx_datagram(3, 7, &[1, 2, 3, 4]);
        let frame = parse_art_dmx(&datagram).unwrap();
        assert_eq!(frame.universe, 3);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_wrong_id() {
        let mut datagram = art_dmx_datagram(0, 0, &[]);
        datagram[0] = b'X';
        assert!(parse_art_dmx(&datagram).is_none());
    }

    #[test]
    fn rejects_wrong_opcode() {
        let mut datagram = art_dmx_datagram(0, 0, &[]);
        datagram[8] = 0x00;
        datagram[9] = 0x20; // ArtPoll, not ArtDmx
        assert!(parse_art_dmx(&datagram).is_none());
    }

    #[test]
    fn rejects_truncated_body() {
        let mut datagram = art_dmx_datagram(0, 0, &[1, 2, 3, 4]);
        datagram.truncate(datagram.len() - 2);
        assert!(parse_art_dmx(&datagram).is_none());
    }

    #[test]
    fn rejects_short_header() {
        assert!(parse_art_dmx(&[0u8; 10]).is_none());
    }
}
