use tracing::debug;

use crate::core::connection::Connection;

/// User callbacks fired by a worker as a connection moves through its
/// lifecycle. Buffers are user-owned for the duration of each call.
pub trait EventHandler: Send {
    /// The connection was claimed by this worker; nothing has been read yet.
    fn on_accept(&mut self, conn: &mut Connection);

    /// `conn.read_data()` holds the bytes of the completed read.
    fn on_read(&mut self, conn: &mut Connection);

    /// The kernel confirmed `n` bytes written.
    fn on_write(&mut self, conn: &mut Connection, n: usize);

    fn on_close(&mut self, _conn: &mut Connection) {}
}

/// Writes every received byte back to the peer.
#[derive(Debug, Default)]
pub struct Echo;

impl EventHandler for Echo {
    fn on_accept(&mut self, conn: &mut Connection) {
        debug!(fd = conn.fd(), remote = ?conn.remote_addr(), "accepted");
    }

    fn on_read(&mut self, conn: &mut Connection) {
        let data = conn.read_data().to_vec();
        conn.write(&data);
    }

    fn on_write(&mut self, _conn: &mut Connection, _n: usize) {}
}
