use std::io;
use std::sync::Arc;
use std::thread;

use crate::demux::RoutingError;
use crate::tcp::Connection;

/// Background thread that outlives `close()` and finishes once the connection
/// has reached CLOSED and left the port router.
///
/// Join it before the process exits, otherwise the quiet period and the final
/// unregistration are cut short.
pub struct TeardownWatcher {
    conn: Arc<Connection>,
    jh: thread::JoinHandle<Result<(), RoutingError>>,
}

impl TeardownWatcher {
    pub(crate) fn spawn(conn: Arc<Connection>) -> io::Result<Self> {
        let jh = {
            let conn = conn.clone();
            thread::Builder::new()
                .name(format!("teardown-{}", conn.local_port()))
                .spawn(move || conn.wait_closed())?
        };
        Ok(TeardownWatcher { conn, jh })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn is_finished(&self) -> bool {
        self.jh.is_finished()
    }

    /// Wait for the connection to finish closing.
    pub fn join(self) -> Result<(), RoutingError> {
        match self.jh.join() {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
