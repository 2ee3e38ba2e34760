use bitflags::bitflags;
use etherparse::{TcpHeader, TcpHeaderSlice};
use thiserror::Error as ThisError;

bitflags! {
    pub struct Flags: u8 {
        const SYN = 0b00000001;
        const ACK = 0b00000010;
        const FIN = 0b00000100;
    }
}

/// A control message exchanged between two connections.
///
/// Sequence and acknowledgment numbers are correlation tokens echoed back to
/// the peer; no payload is ever carried by the state machine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, ThisError)]
pub enum PacketError {
    #[error("malformed header: {0}")]
    Malformed(String),
    #[error("failed to write header: {0}")]
    Io(#[from] std::io::Error),
}

impl Packet {
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: Flags, window: u16) -> Self {
        Packet {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            payload: None,
        }
    }

    pub fn syn(&self) -> bool {
        self.flags.contains(Flags::SYN)
    }

    pub fn ack(&self) -> bool {
        self.flags.contains(Flags::ACK)
    }

    pub fn fin(&self) -> bool {
        self.flags.contains(Flags::FIN)
    }

    /// A packet carrying SYN or FIN; anything else is a pure acknowledgment.
    pub fn is_control(&self) -> bool {
        self.flags.intersects(Flags::SYN | Flags::FIN)
    }

    /// Serialize as a TCP header followed by the payload.
    ///
    /// The checksum stays zero: the datagram substrate checksums the whole thing.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut tcp = TcpHeader::new(self.src_port, self.dst_port, self.seq, self.window);
        tcp.acknowledgment_number = self.ack;
        tcp.syn = self.syn();
        tcp.ack = self.ack();
        tcp.fin = self.fin();

        let payload = self.payload.as_deref().unwrap_or_default();
        let mut buf = Vec::with_capacity(tcp.header_len() as usize + payload.len());
        tcp.write(&mut buf)?;
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let tcph =
            TcpHeaderSlice::from_slice(buf).map_err(|e| PacketError::Malformed(e.to_string()))?;

        let mut flags = Flags::empty();
        flags.set(Flags::SYN, tcph.syn());
        flags.set(Flags::ACK, tcph.ack());
        flags.set(Flags::FIN, tcph.fin());

        let data = &buf[tcph.slice().len()..];
        Ok(Packet {
            src_port: tcph.source_port(),
            dst_port: tcph.destination_port(),
            seq: tcph.sequence_number(),
            ack: tcph.acknowledgment_number(),
            flags,
            window: tcph.window_size(),
            payload: (!data.is_empty()).then(|| data.to_vec()),
        })
    }
}
