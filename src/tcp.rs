use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::Stack;
use crate::demux::{Quad, RoutingError};
use crate::error::ConnectError;
use crate::packet::{Flags, Packet};
use crate::teardown::TeardownWatcher;
use crate::timer::{TimerError, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynRcvd => "SYN_RCVD",
            State::Estab => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME_WAIT",
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    handle: TimerHandle,
    generation: u64,
}

/// Everything guarded by the connection lock.
struct Tcb {
    state: State,
    local_port: u16,
    /// Peer address and port, unknown until the handshake resolves them.
    remote: Option<(SocketAddr, u16)>,
    local_seq: u32,
    peer_seq: u32,
    /// Last SYN or FIN we sent, kept for retransmission.
    last_control: Option<Packet>,
    /// Last pure ACK we sent, kept for when the peer retransmits.
    last_ack: Option<Packet>,
    timer: Option<ArmedTimer>,
    generation: u64,
    /// Set once ESTABLISHED has been reached; blocked openers wait on this
    /// rather than the current state, which may already have moved on.
    established: bool,
    fatal: Option<TimerError>,
    teardown_error: Option<RoutingError>,
}

impl Tcb {
    fn quad(&self) -> Option<Quad> {
        self.remote.map(|(remote, remote_port)| Quad {
            remote,
            local_port: self.local_port,
            remote_port,
        })
    }
}

/// One connection attempt, from CLOSED back to CLOSED.
///
/// All operations take the connection lock, so the application thread, the
/// packet-delivery path and timer expirations are serialized against each
/// other. Blocking calls release the lock while they wait on the condition
/// variable and re-check their predicate after every wakeup.
pub struct Connection {
    tcb: Mutex<Tcb>,
    var: Condvar,
    stack: Stack,
}

impl Connection {
    pub fn new(stack: Stack) -> Arc<Self> {
        Self::bound(stack, 0)
    }

    /// A connection whose local port is already chosen, as for the accepted
    /// side of a listening socket.
    pub fn bound(stack: Stack, local_port: u16) -> Arc<Self> {
        Arc::new(Connection {
            tcb: Mutex::new(Tcb {
                state: State::Closed,
                local_port,
                remote: None,
                local_seq: 0,
                peer_seq: 0,
                last_control: None,
                last_ack: None,
                timer: None,
                generation: 0,
                established: false,
                fatal: None,
                teardown_error: None,
            }),
            var: Condvar::new(),
            stack,
        })
    }

    fn tcb(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_state(&self) -> State {
        self.tcb().state
    }

    pub fn local_port(&self) -> u16 {
        self.tcb().local_port
    }

    /// Peer address and port, once known.
    pub fn remote(&self) -> Option<(SocketAddr, u16)> {
        self.tcb().remote
    }

    pub fn last_control_packet(&self) -> Option<Packet> {
        self.tcb().last_control.clone()
    }

    pub fn last_ack_packet(&self) -> Option<Packet> {
        self.tcb().last_ack.clone()
    }

    pub fn timer_armed(&self) -> bool {
        self.tcb().timer.is_some()
    }

    /// Byte streams are not carried by this transport.
    pub fn input_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "data transfer is not available",
        ))
    }

    pub fn output_stream(&self) -> io::Result<Box<dyn Write + Send>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "data transfer is not available",
        ))
    }

    fn check_fresh(tcb: &Tcb) -> Result<(), ConnectError> {
        if tcb.state != State::Closed {
            return Err(ConnectError::InvalidState(tcb.state));
        }
        if tcb.remote.is_some() || tcb.established {
            return Err(ConnectError::Reused);
        }
        Ok(())
    }

    /// Active open: send SYN to `remote`:`remote_port` and block until the
    /// handshake completes.
    pub fn connect(self: &Arc<Self>, remote: SocketAddr, remote_port: u16) -> Result<(), ConnectError> {
        let mut tcb = self.tcb();
        Self::check_fresh(&tcb)?;

        let demux = &self.stack.demux;
        let local_port = demux.allocate_local_port()?;
        let quad = Quad {
            remote,
            local_port,
            remote_port,
        };
        demux.register_connection(quad, self.clone())?;

        tcb.local_port = local_port;
        tcb.remote = Some((remote, remote_port));
        tcb.local_seq = self.stack.config.initial_seq();

        let syn = self.packet(&tcb, tcb.local_seq, 0, Flags::SYN);
        tcb.local_seq = tcb.local_seq.wrapping_add(1);
        if let Err(e) = self.send(&mut tcb, syn) {
            if let Err(e) = demux.unregister_connection(quad, self) {
                log::warn!("[{local_port}] failed to release {quad:?}: {e}");
            }
            tcb.remote = None;
            return Err(e.into());
        }
        self.transition(&mut tcb, State::SynSent);

        self.wait_established(tcb)
    }

    /// Passive open on the connection's local port: listen and block until a
    /// peer completes the handshake with us.
    pub fn accept_connection(self: &Arc<Self>) -> Result<(), ConnectError> {
        let mut tcb = self.tcb();
        Self::check_fresh(&tcb)?;

        self.stack
            .demux
            .register_listening(tcb.local_port, self.clone())?;
        self.transition(&mut tcb, State::Listen);

        self.wait_established(tcb)
    }

    fn wait_established(&self, mut tcb: MutexGuard<'_, Tcb>) -> Result<(), ConnectError> {
        loop {
            if tcb.established {
                return Ok(());
            }
            if let Some(e) = tcb.fatal.take() {
                self.abandon(&mut tcb);
                return Err(e.into());
            }
            tcb = self.var.wait(tcb).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Give up on a handshake: nothing will retransmit for us any more, so
    /// leave the router and drop back to CLOSED.
    fn abandon(&self, tcb: &mut Tcb) {
        self.cancel_timer(tcb);
        let demux = &self.stack.demux;
        let released = match tcb.quad() {
            Some(quad) => demux.unregister_connection(quad, self),
            None => demux.unregister_listening(tcb.local_port, self),
        };
        if let Err(e) = released {
            log::warn!("[{}] {e}", tcb.local_port);
        }
        tcb.remote = None;
        self.transition(tcb, State::Closed);
    }

    /// Send our FIN and return at once; the returned watcher finishes when the
    /// connection reaches CLOSED.
    ///
    /// Returns `None` if the connection never had a peer, or if it is still
    /// mid-handshake: no FIN is sent then and nothing would ever finish the
    /// teardown.
    pub fn close(self: &Arc<Self>) -> io::Result<Option<TeardownWatcher>> {
        let mut tcb = self.tcb();
        if tcb.remote.is_none() {
            return Ok(None);
        }

        let next = match tcb.state {
            State::Estab => Some(State::FinWait1),
            State::CloseWait => Some(State::LastAck),
            s @ (State::Listen | State::SynSent | State::SynRcvd) => {
                log::warn!("[{}] close in {s} before the handshake finished", tcb.local_port);
                return Ok(None);
            }
            s => {
                log::warn!("[{}] close in {s}, not sending FIN", tcb.local_port);
                None
            }
        };

        let mut armed = Ok(());
        if let Some(next) = next {
            self.cancel_timer(&mut tcb);
            let fin = self.packet(&tcb, tcb.local_seq, tcb.peer_seq.wrapping_add(1), Flags::FIN);
            tcb.local_seq = tcb.local_seq.wrapping_add(1);
            armed = self.send(&mut tcb, fin);
            self.transition(&mut tcb, next);
        }
        drop(tcb);

        armed.map_err(io::Error::other)?;
        TeardownWatcher::spawn(self.clone()).map(Some)
    }

    /// Block until the connection has reached CLOSED, handing back any error
    /// from unregistering it.
    pub(crate) fn wait_closed(&self) -> Result<(), RoutingError> {
        let mut tcb = self.tcb();
        while tcb.state != State::Closed {
            tcb = self.var.wait(tcb).unwrap_or_else(PoisonError::into_inner);
        }
        match tcb.teardown_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Entry point for the port router.
    pub fn deliver_packet(self: &Arc<Self>, packet: &Packet, from: SocketAddr) {
        let mut tcb = self.tcb();
        if let Err(e) = self.on_packet(&mut tcb, packet, from) {
            log::error!("[{}] could not arm retransmission: {e}", tcb.local_port);
            tcb.fatal = Some(e);
        }
        drop(tcb);
        self.var.notify_all();
    }

    fn on_packet(self: &Arc<Self>, tcb: &mut Tcb, p: &Packet, from: SocketAddr) -> Result<(), TimerError> {
        match tcb.state {
            State::Listen if p.syn() && !p.ack() => {
                let quad = Quad {
                    remote: from,
                    local_port: tcb.local_port,
                    remote_port: p.src_port,
                };
                let demux = &self.stack.demux;
                if let Err(e) = demux.register_connection(quad, self.clone()) {
                    log::warn!("[{}] ignoring SYN from {from}: {e}", tcb.local_port);
                    return Ok(());
                }
                if let Err(e) = demux.unregister_listening(tcb.local_port, self) {
                    log::warn!("[{}] {e}", tcb.local_port);
                }

                tcb.remote = Some((from, p.src_port));
                tcb.peer_seq = p.seq;
                tcb.local_seq = self.stack.config.initial_seq();
                let synack = self.packet(
                    tcb,
                    tcb.local_seq,
                    p.seq.wrapping_add(1),
                    Flags::SYN | Flags::ACK,
                );
                tcb.local_seq = tcb.local_seq.wrapping_add(1);
                self.transition(tcb, State::SynRcvd);
                self.send(tcb, synack)?;
            }
            State::SynSent if p.syn() && p.ack() => {
                self.cancel_timer(tcb);
                tcb.peer_seq = p.seq;
                let ack = self.packet(tcb, tcb.local_seq, p.seq.wrapping_add(1), Flags::ACK);
                self.transition(tcb, State::Estab);
                self.send(tcb, ack)?;
            }
            State::SynRcvd if p.syn() && !p.ack() => self.resend_control(tcb),
            State::SynRcvd if p.ack() => {
                self.cancel_timer(tcb);
                if let Some((_, port)) = tcb.remote.as_mut() {
                    *port = p.src_port;
                }
                self.transition(tcb, State::Estab);
            }
            // our ACK of their SYN+ACK was lost
            State::Estab | State::FinWait1 if p.syn() && p.ack() => self.resend_ack(tcb),
            State::Estab if p.fin() => {
                self.ack_fin(tcb, p)?;
                self.transition(tcb, State::CloseWait);
            }
            State::FinWait1 if p.ack() => {
                self.cancel_timer(tcb);
                self.transition(tcb, State::FinWait2);
            }
            State::FinWait1 if p.fin() => {
                self.ack_fin(tcb, p)?;
                self.transition(tcb, State::Closing);
            }
            State::FinWait2 if p.fin() => {
                self.ack_fin(tcb, p)?;
                self.transition(tcb, State::TimeWait);
                self.arm(tcb, self.stack.config.time_wait)?;
            }
            // the peer retransmitted its FIN, so our ACK was lost
            State::LastAck | State::Closing | State::CloseWait | State::TimeWait if p.fin() => {
                self.resend_ack(tcb)
            }
            State::LastAck | State::Closing if p.ack() => {
                self.cancel_timer(tcb);
                self.transition(tcb, State::TimeWait);
                self.arm(tcb, self.stack.config.time_wait)?;
            }
            s => log::debug!(
                "[{}] discarding {:?} (seq {}, ack {}) in {s}",
                tcb.local_port,
                p.flags,
                p.seq,
                p.ack
            ),
        }
        Ok(())
    }

    /// Invoked by the timer. `generation` identifies which arming fired; an
    /// expiration for a timer that has since been cancelled is ignored.
    pub(crate) fn expire_timer(self: &Arc<Self>, generation: u64) {
        let mut tcb = self.tcb();
        if tcb.timer.map(|t| t.generation) != Some(generation) {
            log::debug!("[{}] stale timer {generation}", tcb.local_port);
            return;
        }
        self.cancel_timer(&mut tcb);

        if tcb.state == State::TimeWait {
            self.transition(&mut tcb, State::Closed);
            if let Some(quad) = tcb.quad() {
                if let Err(e) = self.stack.demux.unregister_connection(quad, self) {
                    log::error!("[{}] {e}", tcb.local_port);
                    tcb.teardown_error = Some(e);
                }
            }
        } else if let Some((packet, (remote, _))) = tcb.last_control.clone().zip(tcb.remote) {
            log::debug!(
                "[{}] retransmitting {:?} in {}",
                tcb.local_port,
                packet.flags,
                tcb.state
            );
            self.stack.transport.send(&packet, remote);
            if let Err(e) = self.arm(&mut tcb, self.stack.config.retransmit_interval) {
                log::error!("[{}] could not re-arm retransmission: {e}", tcb.local_port);
                tcb.fatal = Some(e);
            }
        } else {
            log::warn!("[{}] timer fired in {} with nothing to resend", tcb.local_port, tcb.state);
        }
        drop(tcb);
        self.var.notify_all();
    }

    fn transition(&self, tcb: &mut Tcb, next: State) {
        log::info!("[{}] {} -> {}", tcb.local_port, tcb.state, next);
        tcb.state = next;
        if next == State::Estab {
            tcb.established = true;
        }
    }

    fn packet(&self, tcb: &Tcb, seq: u32, ack: u32, flags: Flags) -> Packet {
        let remote_port = tcb.remote.map_or(0, |(_, port)| port);
        Packet::new(tcb.local_port, remote_port, seq, ack, flags, self.stack.config.window)
    }

    fn ack_fin(self: &Arc<Self>, tcb: &mut Tcb, fin: &Packet) -> Result<(), TimerError> {
        tcb.peer_seq = fin.seq;
        let ack = self.packet(tcb, tcb.local_seq, fin.seq.wrapping_add(1), Flags::ACK);
        self.send(tcb, ack)
    }

    /// Hand `packet` to the transport and cache it. Control packets also arm
    /// the retransmission timer; the caller must have cancelled any previous one.
    fn send(self: &Arc<Self>, tcb: &mut Tcb, packet: Packet) -> Result<(), TimerError> {
        let Some((remote, _)) = tcb.remote else {
            log::warn!("[{}] no peer to send {:?} to", tcb.local_port, packet.flags);
            return Ok(());
        };
        self.stack.transport.send(&packet, remote);

        if packet.is_control() {
            tcb.last_control = Some(packet);
            self.arm(tcb, self.stack.config.retransmit_interval)
        } else {
            tcb.last_ack = Some(packet);
            Ok(())
        }
    }

    fn resend_control(&self, tcb: &Tcb) {
        self.resend(tcb, tcb.last_control.as_ref());
    }

    fn resend_ack(&self, tcb: &Tcb) {
        self.resend(tcb, tcb.last_ack.as_ref());
    }

    fn resend(&self, tcb: &Tcb, cached: Option<&Packet>) {
        match (cached, tcb.remote) {
            (Some(packet), Some((remote, _))) => {
                log::debug!("[{}] resending {:?} in {}", tcb.local_port, packet.flags, tcb.state);
                self.stack.transport.send(packet, remote);
            }
            _ => log::debug!("[{}] nothing cached to resend in {}", tcb.local_port, tcb.state),
        }
    }

    fn arm(self: &Arc<Self>, tcb: &mut Tcb, delay: std::time::Duration) -> Result<(), TimerError> {
        debug_assert!(tcb.timer.is_none(), "timer armed while another is pending");
        self.cancel_timer(tcb);

        tcb.generation += 1;
        let generation = tcb.generation;
        let me = Arc::downgrade(self);
        let handle = self.stack.timer.schedule(
            delay,
            Box::new(move || {
                if let Some(conn) = me.upgrade() {
                    conn.expire_timer(generation);
                }
            }),
        )?;
        tcb.timer = Some(ArmedTimer { handle, generation });
        Ok(())
    }

    fn cancel_timer(&self, tcb: &mut Tcb) {
        if let Some(t) = tcb.timer.take() {
            self.stack.timer.cancel(t.handle);
        }
    }
}
