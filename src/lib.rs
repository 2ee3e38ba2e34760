//! A simplified TCP: connection establishment and teardown over an unreliable
//! datagram substrate.
//!
//! Each [`Connection`] is a monitor (one mutex, one condition variable) that
//! three independent sources drive: the application (`connect`,
//! `accept_connection`, `close`), the [`Demux`] delivering inbound packets, and
//! the [`Timer`] expiring retransmission and TIME_WAIT delays. No payload is
//! carried; sequence numbers are only echoed back for correlation.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub mod demux;
pub mod error;
pub mod packet;
pub mod sim;
pub mod tcp;
pub mod teardown;
pub mod timer;
pub mod transport;

pub use demux::{Demux, Quad, RoutingError};
pub use error::ConnectError;
pub use packet::{Flags, Packet, PacketError};
pub use tcp::{Connection, State};
pub use teardown::TeardownWatcher;
pub use timer::{ManualTimer, ThreadTimer, Timer, TimerError, TimerHandle};
pub use transport::{Transport, UdpTransport};

/// How long the packet loop blocks on the socket before checking whether the
/// interface is shutting down.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Config {
    /// Delay before an unacknowledged SYN or FIN is sent again.
    pub retransmit_interval: Duration,
    /// Quiet period spent in TIME_WAIT.
    pub time_wait: Duration,
    /// Window advertised in every packet.
    pub window: u16,
    /// Initial sequence number; random per connection when unset.
    pub initial_seq: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            retransmit_interval: Duration::from_secs(1),
            time_wait: Duration::from_secs(30),
            window: 1024,
            initial_seq: None,
        }
    }
}

impl Config {
    pub fn initial_seq(&self) -> u32 {
        self.initial_seq.unwrap_or_else(rand::random)
    }
}

/// The collaborators a connection is built with.
#[derive(Clone)]
pub struct Stack {
    pub demux: Arc<Demux>,
    pub transport: Arc<dyn Transport>,
    pub timer: Arc<dyn Timer>,
    pub config: Config,
}

impl Stack {
    pub fn new(
        demux: Arc<Demux>,
        transport: Arc<dyn Transport>,
        timer: Arc<dyn Timer>,
        config: Config,
    ) -> Self {
        Stack {
            demux,
            transport,
            timer,
            config,
        }
    }
}

/// A UDP socket with a packet loop routing everything it receives.
pub struct Interface {
    stack: Stack,
    local_addr: SocketAddr,
    terminal: Arc<AtomicBool>,
    jh: Option<thread::JoinHandle<io::Result<()>>>,
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.terminal.store(true, Ordering::Release);
        if let Some(jh) = self.jh.take() {
            match jh.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("packet loop on {} failed: {e}", self.local_addr),
                Err(_) => log::error!("packet loop on {} panicked", self.local_addr),
            }
        }
    }
}

fn packet_loop(socket: UdpSocket, demux: Arc<Demux>, terminal: Arc<AtomicBool>) -> io::Result<()> {
    let mut buf = [0u8; 1504];
    loop {
        if terminal.load(Ordering::Acquire) {
            return Ok(());
        }
        let (nbytes, from) = match socket.recv_from(&mut buf[..]) {
            Ok(r) => r,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            // ICMP port unreachable from an earlier send, on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => return Err(e),
        };

        match Packet::decode(&buf[..nbytes]) {
            Ok(packet) => demux.route(&packet, from),
            Err(e) => log::warn!("ignoring weird datagram from {from}: {e}"),
        }
    }
}

impl Interface {
    pub fn bind(addr: impl ToSocketAddrs, config: Config) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let demux = Arc::new(Demux::new());
        let stack = Stack::new(
            demux.clone(),
            Arc::new(UdpTransport::new(socket.try_clone()?)),
            Arc::new(ThreadTimer::new()),
            config,
        );

        let terminal = Arc::new(AtomicBool::new(false));
        let jh = {
            let terminal = terminal.clone();
            thread::Builder::new()
                .name(format!("packet-loop-{local_addr}"))
                .spawn(move || packet_loop(socket, demux, terminal))?
        };
        Ok(Interface {
            stack,
            local_addr,
            terminal,
            jh: Some(jh),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Open a connection to port `port` at the interface bound to `remote`.
    pub fn connect(&self, remote: SocketAddr, port: u16) -> Result<Arc<Connection>, ConnectError> {
        let conn = Connection::new(self.stack.clone());
        conn.connect(remote, port)?;
        Ok(conn)
    }

    /// Wait for one peer to connect to `port`.
    pub fn accept(&self, port: u16) -> Result<Arc<Connection>, ConnectError> {
        let conn = Connection::bound(self.stack.clone(), port);
        conn.accept_connection()?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_initial_seq_is_used_verbatim() {
        let config = Config {
            initial_seq: Some(5),
            ..Config::default()
        };
        assert_eq!(config.initial_seq(), 5);
        assert_eq!(config.initial_seq(), 5);
    }

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.retransmit_interval, Duration::from_secs(1));
        assert_eq!(config.time_wait, Duration::from_secs(30));
        assert!(config.initial_seq.is_none());
    }
}
