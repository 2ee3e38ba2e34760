//! Port allocation and inbound packet routing.
//!
//! Two tables: listening connections keyed by local port, and connections
//! bound to a peer keyed by [`Quad`]. A connection sits in exactly one of them
//! at a time. Lookups clone the `Arc` and release the router lock before the
//! packet is delivered, so the lock order is always connection, then router.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error as ThisError;

use crate::packet::Packet;
use crate::tcp::Connection;

pub const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Routing key for a connection that knows its peer.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Copy)]
pub struct Quad {
    pub remote: SocketAddr,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum RoutingError {
    #[error("port {0} already has a listening connection")]
    PortInUse(u16),
    #[error("a connection is already registered for {0:?}")]
    ConnectionExists(Quad),
    #[error("no listening connection of ours on port {0}")]
    NotListening(u16),
    #[error("no connection of ours registered for {0:?}")]
    NotRegistered(Quad),
    #[error("no free ephemeral port")]
    PortsExhausted,
}

#[derive(Default)]
struct Tables {
    next_port: u16,
    listening: HashMap<u16, Arc<Connection>>,
    connections: HashMap<Quad, Arc<Connection>>,
}

impl Tables {
    fn in_use(&self, port: u16) -> bool {
        self.listening.contains_key(&port) || self.connections.keys().any(|q| q.local_port == port)
    }
}

#[derive(Default)]
pub struct Demux {
    tables: Mutex<Tables>,
}

impl Demux {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out the next ephemeral port not used by either table.
    pub fn allocate_local_port(&self) -> Result<u16, RoutingError> {
        let mut t = self.tables();
        let (lo, hi) = (*EPHEMERAL_PORTS.start(), *EPHEMERAL_PORTS.end());
        if !EPHEMERAL_PORTS.contains(&t.next_port) {
            t.next_port = lo;
        }
        for _ in EPHEMERAL_PORTS {
            let port = t.next_port;
            t.next_port = if port == hi { lo } else { port + 1 };
            if !t.in_use(port) {
                return Ok(port);
            }
        }
        Err(RoutingError::PortsExhausted)
    }

    pub fn register_listening(&self, port: u16, conn: Arc<Connection>) -> Result<(), RoutingError> {
        match self.tables().listening.entry(port) {
            Entry::Vacant(v) => {
                v.insert(conn);
                Ok(())
            }
            Entry::Occupied(_) => Err(RoutingError::PortInUse(port)),
        }
    }

    pub fn register_connection(&self, quad: Quad, conn: Arc<Connection>) -> Result<(), RoutingError> {
        match self.tables().connections.entry(quad) {
            Entry::Vacant(v) => {
                v.insert(conn);
                Ok(())
            }
            Entry::Occupied(_) => Err(RoutingError::ConnectionExists(quad)),
        }
    }

    pub fn unregister_listening(&self, port: u16, conn: &Connection) -> Result<(), RoutingError> {
        let mut t = self.tables();
        match t.listening.entry(port) {
            Entry::Occupied(o) if std::ptr::eq(Arc::as_ptr(o.get()), conn) => {
                o.remove();
                Ok(())
            }
            _ => Err(RoutingError::NotListening(port)),
        }
    }

    pub fn unregister_connection(&self, quad: Quad, conn: &Connection) -> Result<(), RoutingError> {
        let mut t = self.tables();
        match t.connections.entry(quad) {
            Entry::Occupied(o) if std::ptr::eq(Arc::as_ptr(o.get()), conn) => {
                o.remove();
                Ok(())
            }
            _ => Err(RoutingError::NotRegistered(quad)),
        }
    }

    /// Find the connection an inbound packet belongs to: a connection bound to
    /// the sending peer first, else one listening on the destination port.
    pub fn lookup(&self, packet: &Packet, from: SocketAddr) -> Option<Arc<Connection>> {
        let t = self.tables();
        let q = Quad {
            remote: from,
            local_port: packet.dst_port,
            remote_port: packet.src_port,
        };
        t.connections
            .get(&q)
            .or_else(|| t.listening.get(&packet.dst_port))
            .cloned()
    }

    /// Deliver an inbound packet to its connection, dropping it if nobody
    /// claims it.
    pub fn route(&self, packet: &Packet, from: SocketAddr) {
        match self.lookup(packet, from) {
            Some(conn) => conn.deliver_packet(packet, from),
            None => log::debug!(
                "no connection for {from}:{} -> port {}, dropping {:?}",
                packet.src_port,
                packet.dst_port,
                packet.flags
            ),
        }
    }

    pub fn listening_count(&self) -> usize {
        self.tables().listening.len()
    }

    pub fn connection_count(&self) -> usize {
        self.tables().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        let t = self.tables();
        t.listening.is_empty() && t.connections.is_empty()
    }
}
