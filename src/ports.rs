//! Free-port allocation for worker subprocesses.

use std::io;
use std::net::TcpListener;

/// Ask the OS for a currently free TCP port on the loopback interface.
///
/// The listener is dropped before returning, so the port is only *likely*
/// free by the time the worker binds it; callers that lose the race surface
/// a start failure and retry through the normal worker lifecycle.
pub fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
