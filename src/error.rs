use thiserror::Error as ThisError;

use crate::demux::RoutingError;
use crate::tcp::State;
use crate::timer::TimerError;

/// Why `connect` or `accept_connection` gave up.
#[derive(Debug, ThisError)]
pub enum ConnectError {
    #[error("routing: {0}")]
    Routing(#[from] RoutingError),
    #[error("retransmission timer: {0}")]
    Timer(#[from] TimerError),
    #[error("connection is {0}, expected CLOSED")]
    InvalidState(State),
    #[error("connection has already been used")]
    Reused,
}
