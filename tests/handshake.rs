//! Three-way handshake between two connections over the simulated network.

mod common;

use std::time::Duration;

use common::{RTO, SERVER_PORT, pair, wait_armed};
use reltcp::{Flags, Packet, State};

#[test]
fn both_sides_reach_established_with_matching_identities() {
    let p = pair();
    let (client, server) = p.establish();

    assert_eq!(client.current_state(), State::Estab);
    assert_eq!(server.current_state(), State::Estab);
    assert_eq!(client.remote(), Some((p.server_addr, SERVER_PORT)));
    assert_eq!(server.remote(), Some((p.client_addr, client.local_port())));
    assert_eq!(server.local_port(), SERVER_PORT);

    assert_eq!(p.server.demux.listening_count(), 0);
    assert_eq!(p.server.demux.connection_count(), 1);
    assert_eq!(p.client.demux.connection_count(), 1);
}

#[test]
fn handshake_exchanges_syn_synack_ack() {
    let p = pair();
    let (client, _server) = p.establish();
    let port = client.local_port();

    assert!(p.net.wait_until(Duration::from_secs(5), |log| log.len() == 3));
    let packets: Vec<Packet> = p.net.datagrams().into_iter().map(|d| d.packet).collect();
    assert_eq!(packets[0], Packet::new(port, SERVER_PORT, 5, 0, Flags::SYN, 1024));
    assert_eq!(
        packets[1],
        Packet::new(SERVER_PORT, port, 5, 6, Flags::SYN | Flags::ACK, 1024)
    );
    assert_eq!(packets[2], Packet::new(port, SERVER_PORT, 6, 6, Flags::ACK, 1024));
}

#[test]
fn dropped_synack_is_resent_until_acked() {
    let p = pair();
    let mut dropped = 0;
    p.net.set_filter(move |d| {
        if d.packet.syn() && d.packet.ack() && dropped < 2 {
            dropped += 1;
            return false;
        }
        true
    });

    let (server, accepting) = p.listen();
    let (client, connecting) = p.dial();
    wait_armed(&server);
    let synack = server.last_control_packet().unwrap();

    // first SYN+ACK lost; the retransmission timer sends it again
    assert!(p.net.wait_until(Duration::from_secs(5), |log| log.len() == 2));
    p.server_timer.advance(RTO);
    assert!(p.net.wait_until(Duration::from_secs(5), |log| log.len() == 3));
    assert_eq!(client.current_state(), State::SynSent);

    p.server_timer.advance(RTO);
    connecting.join().unwrap();
    accepting.join().unwrap();

    let synacks: Vec<_> = p
        .net
        .datagrams()
        .into_iter()
        .filter(|d| d.packet.syn() && d.packet.ack())
        .collect();
    assert_eq!(synacks.len(), 3);
    assert!(synacks.iter().all(|d| d.packet == synack));
    assert!(synacks[0].dropped && synacks[1].dropped && !synacks[2].dropped);
    assert!(!server.timer_armed());
}

#[test]
fn dropped_syn_is_resent_by_the_client() {
    let p = pair();
    let mut dropped = false;
    p.net.set_filter(move |d| {
        if d.packet.syn() && !d.packet.ack() && !dropped {
            dropped = true;
            return false;
        }
        true
    });

    let (server, accepting) = p.listen();
    let (client, connecting) = p.dial();
    wait_armed(&client);
    assert!(p.net.wait_until(Duration::from_secs(5), |log| log.len() == 1));
    assert_eq!(server.current_state(), State::Listen);

    p.client_timer.advance(RTO);
    connecting.join().unwrap();
    accepting.join().unwrap();
    assert_eq!(client.current_state(), State::Estab);
}

#[test]
fn dropped_final_ack_is_recovered_by_synack_retransmit() {
    let p = pair();
    let mut dropped = false;
    p.net.set_filter(move |d| {
        if d.packet.flags == Flags::ACK && !dropped {
            dropped = true;
            return false;
        }
        true
    });

    let (server, accepting) = p.listen();
    let (client, connecting) = p.dial();
    connecting.join().unwrap();
    wait_armed(&server);
    assert!(p.net.wait_until(Duration::from_secs(5), |log| log.len() == 3));
    assert_eq!(server.current_state(), State::SynRcvd);

    // server resends SYN+ACK, the established client answers with its cached ACK
    let ack = client.last_ack_packet().unwrap();
    p.server_timer.advance(RTO);
    accepting.join().unwrap();

    let log = p.net.datagrams();
    assert_eq!(log.last().map(|d| &d.packet), Some(&ack));
    assert_eq!(client.current_state(), State::Estab);
}

#[test]
fn syn_to_a_port_nobody_listens_on_is_dropped() {
    let p = pair();
    let (client, _connecting) = p.dial();
    assert!(p.net.wait_until(Duration::from_secs(5), |log| log.len() == 1));
    assert_eq!(client.current_state(), State::SynSent);
    assert!(p.server.demux.is_empty());
}
