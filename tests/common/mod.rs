#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reltcp::sim::SimNetwork;
use reltcp::{Config, Connection, ManualTimer, Stack, State};

pub const RTO: Duration = Duration::from_secs(1);
pub const QUIET: Duration = Duration::from_secs(30);
pub const SERVER_PORT: u16 = 80;

/// Two nodes on a simulated network, each with its own virtual clock so
/// their retransmissions can be fired independently.
pub struct Pair {
    pub net: SimNetwork,
    pub client: Stack,
    pub server: Stack,
    pub client_timer: Arc<ManualTimer>,
    pub server_timer: Arc<ManualTimer>,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
}

pub fn pair() -> Pair {
    let net = SimNetwork::new();
    let client_addr: SocketAddr = "10.0.0.1:7000".parse().unwrap();
    let server_addr: SocketAddr = "10.0.0.2:7000".parse().unwrap();
    let client_timer = Arc::new(ManualTimer::new());
    let server_timer = Arc::new(ManualTimer::new());
    let config = Config {
        initial_seq: Some(5),
        ..Config::default()
    };
    let client = net.stack(client_addr, client_timer.clone(), config.clone());
    let server = net.stack(server_addr, server_timer.clone(), config);
    Pair {
        net,
        client,
        server,
        client_timer,
        server_timer,
        client_addr,
        server_addr,
    }
}

pub fn wait_state(conn: &Connection, state: State) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.current_state() != state {
        assert!(
            Instant::now() < deadline,
            "expected {state}, stuck in {}",
            conn.current_state()
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Wait for `conn` to have a timer pending, which happens only after the
/// packet it guards has been handed to the network.
pub fn wait_armed(conn: &Connection) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !conn.timer_armed() {
        assert!(Instant::now() < deadline, "no timer armed in {}", conn.current_state());
        thread::sleep(Duration::from_millis(1));
    }
}

impl Pair {
    /// Start a listener on the server, returning the connection and the
    /// thread blocked in `accept_connection`.
    pub fn listen(&self) -> (Arc<Connection>, thread::JoinHandle<()>) {
        let conn = Connection::bound(self.server.clone(), SERVER_PORT);
        let c = conn.clone();
        let jh = thread::spawn(move || c.accept_connection().unwrap());
        wait_state(&conn, State::Listen);
        (conn, jh)
    }

    pub fn dial(&self) -> (Arc<Connection>, thread::JoinHandle<()>) {
        let conn = Connection::new(self.client.clone());
        let c = conn.clone();
        let server = self.server_addr;
        let jh = thread::spawn(move || c.connect(server, SERVER_PORT).unwrap());
        (conn, jh)
    }

    /// Run a loss-free handshake, returning (client, server).
    pub fn establish(&self) -> (Arc<Connection>, Arc<Connection>) {
        let (server, accepting) = self.listen();
        let (client, connecting) = self.dial();
        connecting.join().unwrap();
        accepting.join().unwrap();
        (client, server)
    }
}
