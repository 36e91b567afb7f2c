//! Strictly alternating request/reply sockets over TCP or Unix domain sockets.
//!
//! Each frame travels as `[u32 LE length][frame bytes]` on the stream. A
//! [`ReplySocket`] accepts any number of peers but serves one request at a
//! time: after `recv` the next call must be `send`, which answers the peer
//! that asked. A [`RequestSocket`] is the mirror image: every `request` is one
//! send followed by one blocking receive.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use libc::{nfds_t, poll, pollfd, POLLERR, POLLHUP, POLLIN};
use log::{debug, warn};

use crate::core::{Error, Result};

pub const MAX_FRAME_LEN: usize = 1 << 30;
/// Read/write bound for a peer once poll reported it readable, so a stalled
/// peer cannot wedge the reply loop.
const PEER_IO_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_FRAME_CAPACITY: usize = 64 * 1024;
/// Pause after a failed accept (e.g. EMFILE); the listener stays readable.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Transport address: `tcp://host:port` or `ipc://path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host` is `*` to bind every interface.
    Tcp { host: String, port: u16 },
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let invalid = || Error::InvalidEndpoint(endpoint.to_string());
        if let Some(rest) = endpoint.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Ipc(PathBuf::from(path)));
        }
        Err(invalid())
    }

    fn socket_addr(host: &str, port: u16) -> String {
        if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}", Endpoint::socket_addr(host, *port)),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn connect(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect(Endpoint::socket_addr(host, *port))?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Endpoint::Ipc(path) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
            Stream::Unix(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
        }
    }

    fn set_blocking(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_nonblocking(false),
            Stream::Unix(stream) => stream.set_nonblocking(false),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(stream) => stream.as_raw_fd(),
            Stream::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = match endpoint {
            Endpoint::Tcp { host, port } => {
                let host = if host == "*" { "0.0.0.0" } else { host.as_str() };
                let listener = TcpListener::bind(Endpoint::socket_addr(host, *port))?;
                listener.set_nonblocking(true)?;
                Listener::Tcp(listener)
            }
            Endpoint::Ipc(path) => {
                prepare_socket_path(path)?;
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Listener::Unix {
                    listener,
                    path: path.clone(),
                }
            }
        };
        Ok(listener)
    }

    fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            Listener::Unix { path, .. } => Ok(Endpoint::Ipc(path.clone())),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Creates the socket's parent directory and clears a stale socket file left
/// by a previous process. Any other kind of file at `path` is left alone and
/// makes the bind fail.
fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn write_frame(stream: &mut impl Write, frame: &[u8]) -> Result<()> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN}-byte limit",
            frame.len()
        )));
    }
    stream.write_all(&(frame.len() as u32).to_le_bytes())?;
    stream.write_all(frame)?;
    stream.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly
/// between frames.
fn read_frame(stream: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match stream.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::MalformedMessage(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN}-byte limit"
        )));
    }
    // Grow with the bytes that actually arrive instead of trusting the prefix.
    let mut frame = Vec::with_capacity(len.min(INITIAL_FRAME_CAPACITY));
    let received = Read::by_ref(stream).take(len as u64).read_to_end(&mut frame)?;
    if received < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated after {received} of {len} bytes"),
        )
        .into());
    }
    Ok(Some(frame))
}

struct Peer {
    id: u64,
    stream: Stream,
}

/// The responder side of the transport.
pub struct ReplySocket {
    listener: Listener,
    peers: Vec<Peer>,
    next_peer_id: u64,
    /// Peer index where the next poll starts scanning, for fairness.
    cursor: usize,
    /// Frame read during `poll` and not yet handed out by `recv`.
    inbox: Option<(u64, Vec<u8>)>,
    /// Peer owed a reply by the next `send`.
    awaiting_reply: Option<u64>,
}

impl ReplySocket {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Ok(Self {
            listener: Listener::bind(endpoint)?,
            peers: Vec::new(),
            next_peer_id: 0,
            cursor: 0,
            inbox: None,
            awaiting_reply: None,
        })
    }

    /// The bound address, with an ephemeral TCP port resolved.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.listener.local_endpoint()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Waits up to `timeout` for a request. Returns `true` once a full frame is
    /// ready for [`ReplySocket::recv`].
    pub fn poll(&mut self, timeout: Duration) -> Result<bool> {
        if self.awaiting_reply.is_some() {
            return Err(Error::InvalidArgument(
                "previous request has not been answered".to_string(),
            ));
        }
        if self.inbox.is_some() {
            return Ok(true);
        }

        let mut fds = Vec::with_capacity(1 + self.peers.len());
        fds.push(pollfd {
            fd: self.listener.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        });
        fds.extend(self.peers.iter().map(|peer| pollfd {
            fd: peer.stream.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        }));
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let res = unsafe { poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err.into());
        }
        if res == 0 {
            return Ok(false);
        }

        let peer_count = self.peers.len();
        let mut dead = Vec::new();
        for step in 0..peer_count {
            let idx = (self.cursor + step) % peer_count;
            if fds[1 + idx].revents & (POLLIN | POLLHUP | POLLERR) == 0 {
                continue;
            }
            let peer = &mut self.peers[idx];
            match read_frame(&mut peer.stream) {
                Ok(Some(frame)) => {
                    self.inbox = Some((peer.id, frame));
                    self.cursor = idx + 1;
                    break;
                }
                Ok(None) => {
                    debug!("peer {} disconnected", peer.id);
                    dead.push(peer.id);
                }
                Err(err) => {
                    warn!("dropping peer {}: {err}", peer.id);
                    dead.push(peer.id);
                }
            }
        }
        if !dead.is_empty() {
            self.peers.retain(|peer| !dead.contains(&peer.id));
        }
        if fds[0].revents & POLLIN != 0 {
            self.accept_pending()?;
        }
        Ok(self.inbox.is_some())
    }

    /// Takes the frame found by the last successful poll.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        if self.awaiting_reply.is_some() {
            return Err(Error::InvalidArgument(
                "previous request has not been answered".to_string(),
            ));
        }
        let (peer_id, frame) = self
            .inbox
            .take()
            .ok_or_else(|| Error::InvalidArgument("no request ready to receive".to_string()))?;
        self.awaiting_reply = Some(peer_id);
        Ok(frame)
    }

    /// Answers the request returned by the last `recv`. A reply to a peer that
    /// has gone away is dropped.
    pub fn send(&mut self, frame: &[u8]) -> Result<()> {
        let peer_id = self
            .awaiting_reply
            .take()
            .ok_or_else(|| Error::InvalidArgument("no request awaiting a reply".to_string()))?;
        let Some(idx) = self.peers.iter().position(|peer| peer.id == peer_id) else {
            debug!("peer {peer_id} left before its reply was sent");
            return Ok(());
        };
        if let Err(err) = write_frame(&mut self.peers[idx].stream, frame) {
            self.peers.remove(idx);
            return Err(err);
        }
        Ok(())
    }

    fn accept_pending(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    stream.set_blocking()?;
                    stream.set_timeout(Some(PEER_IO_TIMEOUT))?;
                    let id = self.next_peer_id;
                    self.next_peer_id += 1;
                    debug!("peer {id} connected");
                    self.peers.push(Peer { id, stream });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {err}; backing off {ACCEPT_BACKOFF:?}");
                    thread::sleep(ACCEPT_BACKOFF);
                    return Ok(());
                }
            }
        }
    }
}

/// The requester side of the transport. Connects on first use and again
/// after a failed exchange.
pub struct RequestSocket {
    endpoint: Endpoint,
    stream: Option<Stream>,
    timeout: Option<Duration>,
}

impl RequestSocket {
    pub fn connect(endpoint: &Endpoint) -> Self {
        Self {
            endpoint: endpoint.clone(),
            stream: None,
            timeout: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Bounds each send and receive. `None` blocks indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        if let Some(stream) = &self.stream {
            stream.set_timeout(timeout)?;
        }
        Ok(())
    }

    /// Sends `frame` and blocks until the reply frame arrives.
    pub fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let result = exchange(stream, frame);
        if result.is_err() {
            // The exchange is out of step; start over on a fresh connection.
            self.stream = None;
        }
        result
    }

    fn stream(&mut self) -> Result<&mut Stream> {
        if self.stream.is_none() {
            let stream = Stream::connect(&self.endpoint)?;
            stream.set_timeout(self.timeout)?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::NotConnected)))
    }
}

fn exchange(stream: &mut Stream, frame: &[u8]) -> Result<Vec<u8>> {
    write_frame(stream, frame)?;
    read_frame(stream)?.ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "responder closed the connection",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn parses_tcp_and_ipc_endpoints() {
        assert_eq!(
            Endpoint::parse("tcp://0.0.0.0:5555").unwrap(),
            Endpoint::Tcp {
                host: "0.0.0.0".to_string(),
                port: 5555
            }
        );
        assert_eq!(
            Endpoint::parse("tcp://[::1]:7000").unwrap(),
            Endpoint::Tcp {
                host: "::1".to_string(),
                port: 7000
            }
        );
        assert_eq!(
            Endpoint::parse("ipc:///tmp/feeds/0").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/feeds/0"))
        );
        assert_eq!(
            Endpoint::parse("tcp://[::1]:7000").unwrap().to_string(),
            "tcp://[::1]:7000"
        );
    }

    #[test]
    fn rejects_other_schemes_and_bad_ports() {
        for bad in ["udp://host:1", "tcp://host", "tcp://host:99999", "tcp://:80", "ipc://", "/tmp/x"] {
            assert!(
                matches!(Endpoint::parse(bad), Err(Error::InvalidEndpoint(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn frames_round_trip_over_a_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        write_frame(&mut wire, b"").unwrap();
        let mut reader = io::Cursor::new(wire);
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"");
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        wire.truncate(6);
        assert!(read_frame(&mut io::Cursor::new(wire)).is_err());
    }

    #[test]
    fn bogus_length_prefix_fails_on_the_bytes_that_arrived() {
        let mut wire = ((MAX_FRAME_LEN - 1) as u32).to_le_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        match read_frame(&mut io::Cursor::new(wire)) {
            Err(Error::Io(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
                assert!(err.to_string().contains("after 3 of"), "{err}");
            }
            other => panic!("expected truncated frame, got {other:?}"),
        }
    }

    #[test]
    fn reply_socket_enforces_alternation() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Ipc(dir.path().join("nested").join("sock"));
        let mut socket = ReplySocket::bind(&endpoint).unwrap();
        assert!(matches!(socket.recv(), Err(Error::InvalidArgument(_))));
        assert!(matches!(socket.send(b"x"), Err(Error::InvalidArgument(_))));
        assert!(!socket.poll(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn request_reply_exchange_over_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Ipc(dir.path().join("feeds").join("0"));
        let mut server = ReplySocket::bind(&endpoint).unwrap();

        let client_endpoint = endpoint.clone();
        let client = thread::spawn(move || {
            let mut socket = RequestSocket::connect(&client_endpoint);
            let first = socket.request(b"ping").unwrap();
            let second = socket.request(b"again").unwrap();
            (first, second)
        });

        for expected in [&b"ping"[..], &b"again"[..]] {
            while !server.poll(Duration::from_millis(50)).unwrap() {}
            let frame = server.recv().unwrap();
            assert_eq!(frame, expected);
            assert!(server.poll(Duration::from_millis(1)).is_err());
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&frame);
            server.send(&reply).unwrap();
        }

        let (first, second) = client.join().unwrap();
        assert_eq!(first, b"re:ping");
        assert_eq!(second, b"re:again");
    }

    #[test]
    fn ipc_socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let socket = ReplySocket::bind(&Endpoint::Ipc(path.clone())).unwrap();
        assert!(path.exists());
        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn tcp_ephemeral_port_is_resolved() {
        let socket = ReplySocket::bind(&Endpoint::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        match socket.local_endpoint().unwrap() {
            Endpoint::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_ne!(port, 0);
            }
            other => panic!("unexpected endpoint {other}"),
        }
    }
}
