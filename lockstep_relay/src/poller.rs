// Readiness multiplexing for the relay loop.
//
// The server builds one `PollEntry` per socket (listener first, then every
// connection) and calls `poll_sockets` once per loop iteration. On unix this
// is a single `poll(2)` call with a bounded timeout. Elsewhere there is no
// portable readiness API in std, so the fallback sleeps briefly and reports
// every socket as ready; all sockets are non-blocking, so a spurious "ready"
// just costs one `WouldBlock`.

use std::io;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct PollEntry {
    #[cfg(unix)]
    pub fd: std::os::unix::io::RawFd,
    pub want_write: bool,
    /// Readable, or hung up / errored (a read will report which).
    pub readable: bool,
    pub writable: bool,
}

impl PollEntry {
    #[cfg(unix)]
    pub fn new(fd: std::os::unix::io::RawFd, want_write: bool) -> Self {
        Self {
            fd,
            want_write,
            readable: false,
            writable: false,
        }
    }

    #[cfg(not(unix))]
    pub fn new(want_write: bool) -> Self {
        Self {
            want_write,
            readable: false,
            writable: false,
        }
    }
}

/// Poll entry for any socket the relay owns.
#[cfg(unix)]
pub fn entry_for<S: std::os::unix::io::AsRawFd>(socket: &S, want_write: bool) -> PollEntry {
    PollEntry::new(socket.as_raw_fd(), want_write)
}

#[cfg(not(unix))]
pub fn entry_for<S>(_socket: &S, want_write: bool) -> PollEntry {
    PollEntry::new(want_write)
}

/// Wait until at least one entry is ready or `timeout` elapses. Returns the
/// number of ready entries. An interrupted wait reports zero.
///
/// The `poll(2)` call here is the only `unsafe` in the workspace.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn poll_sockets(entries: &mut [PollEntry], timeout: Duration) -> io::Result<usize> {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|e| libc::pollfd {
            fd: e.fd,
            events: libc::POLLIN | if e.want_write { libc::POLLOUT } else { 0 },
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a live, correctly sized array of `pollfd` for the
    // duration of the call, and every fd belongs to a socket we own.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    for (entry, fd) in entries.iter_mut().zip(&fds) {
        entry.readable = fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
        entry.writable = fd.revents & libc::POLLOUT != 0;
    }
    Ok(ready as usize)
}

#[cfg(not(unix))]
pub fn poll_sockets(entries: &mut [PollEntry], timeout: Duration) -> io::Result<usize> {
    std::thread::sleep(timeout.min(Duration::from_millis(5)));
    for entry in entries.iter_mut() {
        entry.readable = true;
        entry.writable = entry.want_write;
    }
    Ok(entries.len())
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    fn idle_socket_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut entries = [PollEntry::new(listener.as_raw_fd(), false)];
        let ready = poll_sockets(&mut entries, Duration::from_millis(10)).unwrap();
        assert_eq!(ready, 0);
        assert!(!entries[0].readable);
    }

    #[test]
    fn pending_accept_and_data_are_readable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut entries = [PollEntry::new(listener.as_raw_fd(), false)];
        poll_sockets(&mut entries, Duration::from_secs(2)).unwrap();
        assert!(entries[0].readable);

        let (server, _) = listener.accept().unwrap();
        client.write_all(b"x").unwrap();
        let mut entries = [PollEntry::new(server.as_raw_fd(), false)];
        poll_sockets(&mut entries, Duration::from_secs(2)).unwrap();
        assert!(entries[0].readable);
        assert!(!entries[0].writable);

        let mut entries = [PollEntry::new(server.as_raw_fd(), true)];
        poll_sockets(&mut entries, Duration::from_secs(2)).unwrap();
        assert!(entries[0].writable);
    }
}
