//! In-process stand-ins for the datagram substrate.
//!
//! [`Recorder`] keeps everything it is asked to send and delivers nothing.
//! [`SimNetwork`] connects several port routers by address and delivers
//! asynchronously from a pump thread, optionally dropping datagrams picked by
//! a filter, which is how loss is injected. Holding the network queues
//! datagrams in send order until it is released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::demux::Demux;
use crate::packet::Packet;
use crate::timer::Timer;
use crate::transport::Transport;
use crate::{Config, Stack};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct Recorder {
    sent: Mutex<Vec<(SocketAddr, Packet)>>,
}

impl Recorder {
    pub fn sent(&self) -> Vec<(SocketAddr, Packet)> {
        lock(&self.sent).clone()
    }

    pub fn packets(&self) -> Vec<Packet> {
        lock(&self.sent).iter().map(|(_, p)| p.clone()).collect()
    }
}

impl Transport for Recorder {
    fn send(&self, packet: &Packet, dst: SocketAddr) {
        lock(&self.sent).push((dst, packet.clone()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub packet: Packet,
    /// Set when the filter chose to lose this datagram.
    pub dropped: bool,
}

enum Msg {
    Datagram(Datagram),
    Shutdown,
}

type Filter = Box<dyn FnMut(&Datagram) -> bool + Send>;

#[derive(Default)]
struct Shared {
    nodes: Mutex<HashMap<SocketAddr, Arc<Demux>>>,
    filter: Mutex<Option<Filter>>,
    log: Mutex<Vec<Datagram>>,
    var: Condvar,
    held: Mutex<bool>,
    gate: Condvar,
}

pub struct SimNetwork {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Msg>,
    pump: Option<thread::JoinHandle<()>>,
}

/// A node's sending side on a [`SimNetwork`].
pub struct SimTransport {
    addr: SocketAddr,
    tx: mpsc::Sender<Msg>,
}

impl Transport for SimTransport {
    fn send(&self, packet: &Packet, dst: SocketAddr) {
        let d = Datagram {
            from: self.addr,
            to: dst,
            packet: packet.clone(),
            dropped: false,
        };
        if self.tx.send(Msg::Datagram(d)).is_err() {
            log::debug!("network is down, {} lost its datagram", self.addr);
        }
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel();
        let pump = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("sim-pump".into())
                .spawn(move || pump(shared, rx))
                .ok()
        };
        if pump.is_none() {
            log::error!("could not start the simulated network, nothing will be delivered");
        }
        SimNetwork { shared, tx, pump }
    }

    /// Plug `demux` into the network at `addr`.
    pub fn attach(&self, addr: SocketAddr, demux: Arc<Demux>) -> Arc<SimTransport> {
        lock(&self.shared.nodes).insert(addr, demux);
        Arc::new(SimTransport {
            addr,
            tx: self.tx.clone(),
        })
    }

    /// A fresh router attached at `addr`, bundled with `timer` and `config`.
    pub fn stack(&self, addr: SocketAddr, timer: Arc<dyn Timer>, config: Config) -> Stack {
        let demux = Arc::new(Demux::new());
        let transport = self.attach(addr, demux.clone());
        Stack::new(demux, transport, timer, config)
    }

    /// Lose every datagram for which `keep` returns false.
    pub fn set_filter(&self, keep: impl FnMut(&Datagram) -> bool + Send + 'static) {
        *lock(&self.shared.filter) = Some(Box::new(keep));
    }

    pub fn clear_filter(&self) {
        *lock(&self.shared.filter) = None;
    }

    /// Stop delivering; datagrams queue up until [`SimNetwork::release`].
    pub fn hold(&self) {
        *lock(&self.shared.held) = true;
    }

    pub fn release(&self) {
        *lock(&self.shared.held) = false;
        self.shared.gate.notify_all();
    }

    /// Every datagram handed to the network so far, lost ones included.
    pub fn datagrams(&self) -> Vec<Datagram> {
        lock(&self.shared.log).clone()
    }

    /// Block until `done` holds over the datagram log or `timeout` elapses.
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(&[Datagram]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut log = lock(&self.shared.log);
        loop {
            if done(&log) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            log = self
                .shared
                .var
                .wait_timeout(log, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for SimNetwork {
    fn drop(&mut self) {
        self.release();
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                log::error!("simulated network pump panicked");
            }
        }
    }
}

fn pump(shared: Arc<Shared>, rx: mpsc::Receiver<Msg>) {
    for msg in rx {
        let mut d = match msg {
            Msg::Datagram(d) => d,
            Msg::Shutdown => return,
        };
        {
            let mut held = lock(&shared.held);
            while *held {
                held = shared.gate.wait(held).unwrap_or_else(PoisonError::into_inner);
            }
        }
        d.dropped = !lock(&shared.filter).as_mut().is_none_or(|keep| keep(&d));

        let dst = (!d.dropped)
            .then(|| lock(&shared.nodes).get(&d.to).cloned())
            .flatten();
        let (packet, from) = (d.packet.clone(), d.from);
        lock(&shared.log).push(d);
        shared.var.notify_all();

        match dst {
            Some(demux) => demux.route(&packet, from),
            None => log::debug!("datagram from {from} not delivered"),
        }
    }
}
