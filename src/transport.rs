//! Outbound half of the datagram substrate.

use std::net::{SocketAddr, UdpSocket};

use crate::packet::Packet;

/// Fire-and-forget delivery of a packet to a remote endpoint.
///
/// Implementations may drop, duplicate or reorder; callers never learn which.
pub trait Transport: Send + Sync {
    fn send(&self, packet: &Packet, dst: SocketAddr);
}

/// Sends each packet as a single UDP datagram.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&self, packet: &Packet, dst: SocketAddr) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode packet for {dst}: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, dst) {
            log::debug!("datagram to {dst} lost: {e}");
        }
    }
}
