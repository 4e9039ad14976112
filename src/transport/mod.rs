//! Byte-level transport (spec §4.1, component C1).
//!
//! Holds whatever socket is currently live — plain TCP, STARTTLS-upgraded
//! TLS, either with XEP-0138 compression layered on top — behind a single
//! `Arc<Mutex<..>>` handle so the background reader thread and the actor's
//! writer side can share one connection without the FSM ever seeing the
//! concrete socket type.
//!
//! Grounded on the pack's synchronous transport
//! (`other_examples/.../aftershootco-xmpp-rs__src-transport.rs`), which
//! solves the same problem with its `LockedIO<T>` wrapper around
//! `Arc<Mutex<TcpStream>>`. We generalize `T` to an enum instead of a type
//! parameter, since the same live handle must support an in-place STARTTLS
//! upgrade (spec §4.1 "reset_parser").

#[cfg(feature = "bosh")]
mod bosh;
mod compression;
mod dns;
mod tls;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use crate::config::{SessionOptions, SocketType};
use crate::error::Error;

#[cfg(feature = "bosh")]
pub use bosh::BoshTransport;
pub use compression::CompressionHandle;

/// A concrete, owned socket of one of the kinds the FSM can be driving.
enum RawSocket {
    Tcp(TcpStream),
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Read for RawSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RawSocket::Tcp(s) => s.read(buf),
            RawSocket::Tls(s) => s.read(buf),
        }
    }
}

impl Write for RawSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RawSocket::Tcp(s) => s.write(buf),
            RawSocket::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RawSocket::Tcp(s) => s.flush(),
            RawSocket::Tls(s) => s.flush(),
        }
    }
}

/// One handle onto a [`RawSocket`], shared between however many
/// [`compression::Half`] clones currently need it.
type SharedSocket = Arc<Mutex<RawSocket>>;

/// What's currently layered on top of the raw socket.
///
/// Cheaply cloneable (an `Arc` bump either way) so a caller can pull a
/// handle to the live connection out from behind [`SharedIo`]'s slot lock
/// and do the actual blocking I/O against the clone, without holding that
/// lock for the duration of the call.
#[derive(Clone)]
enum Conn {
    Raw(SharedSocket),
    Compressed(CompressionHandle),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Raw(s) => s.lock().expect("transport mutex poisoned").read(buf),
            Conn::Compressed(c) => c.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Raw(s) => s.lock().expect("transport mutex poisoned").write(buf),
            Conn::Compressed(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Raw(s) => s.lock().expect("transport mutex poisoned").flush(),
            Conn::Compressed(c) => c.flush(),
        }
    }
}

/// The live transport, shared between the background reader thread and
/// whichever side writes outbound stanzas.
///
/// Upgrades (`upgrade_tls`, `enable_compression`) briefly take the current
/// [`Conn`] out of the slot and put a new one back. The slot lock only ever
/// guards that swap and the short `Conn::clone()` a [`TransportHandle`]
/// pulls out of it before reading or writing — it is never held across the
/// blocking I/O itself. That alone isn't enough to make a swap safe while a
/// read is in flight against the *old* connection, so the FSM's reader
/// thread additionally parks on a control channel right after handing back
/// a `<proceed/>`/`<compressed/>`/`<success/>` element, and only resumes
/// once the actor has finished the swap and reset the parser (see
/// `fsm::spawn_reader`/`fsm::restart_stream`).
#[derive(Clone)]
pub struct SharedIo(Arc<Mutex<Option<Conn>>>);

impl SharedIo {
    fn from_tcp(stream: TcpStream) -> Self {
        let shared: SharedSocket = Arc::new(Mutex::new(RawSocket::Tcp(stream)));
        SharedIo(Arc::new(Mutex::new(Some(Conn::Raw(shared)))))
    }

    fn from_tls(stream: native_tls::TlsStream<TcpStream>) -> Self {
        let shared: SharedSocket = Arc::new(Mutex::new(RawSocket::Tls(Box::new(stream))));
        SharedIo(Arc::new(Mutex::new(Some(Conn::Raw(shared)))))
    }

    /// Clone a handle usable as a [`Read`]/[`Write`] source, e.g. to hand to
    /// [`crate::parser::StreamParser::reset`].
    pub fn handle(&self) -> TransportHandle {
        TransportHandle(self.clone())
    }

    /// Perform the STARTTLS handshake in place, replacing the plain socket
    /// underneath this handle with a TLS one. Must not be called while
    /// compression is already active (spec §4.1: STARTTLS and compression
    /// compose in one order only, STARTTLS first).
    pub fn upgrade_tls(&self, domain: &str) -> Result<(), Error> {
        let mut slot = self.0.lock().expect("transport mutex poisoned");
        let conn = slot.take().expect("transport already torn down");
        let raw = match conn {
            Conn::Raw(shared) => shared,
            other @ Conn::Compressed(_) => {
                *slot = Some(other);
                return Err(Error::CouldNotEncryptStream);
            }
        };
        let tcp = {
            let mut guard = raw.lock().expect("socket mutex poisoned");
            match std::mem::replace(&mut *guard, RawSocket::Tcp(dummy_tcp())) {
                RawSocket::Tcp(tcp) => tcp,
                RawSocket::Tls(_) => return Err(Error::CouldNotEncryptStream),
            }
        };
        let tls_stream = tls::handshake(tcp, domain)?;
        *slot = Some(Conn::Raw(Arc::new(Mutex::new(RawSocket::Tls(Box::new(
            tls_stream,
        ))))));
        Ok(())
    }

    /// Layer XEP-0138 zlib compression on top of whatever socket is
    /// currently live.
    pub fn enable_compression(&self) -> Result<(), Error> {
        let mut slot = self.0.lock().expect("transport mutex poisoned");
        let conn = slot.take().expect("transport already torn down");
        let raw = match conn {
            Conn::Raw(shared) => shared,
            Conn::Compressed(_) => return Err(Error::CouldNotCompressStream),
        };
        *slot = Some(Conn::Compressed(CompressionHandle::wrap(raw)));
        Ok(())
    }

    /// The peer address of the underlying TCP socket, if still reachable.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        let slot = self.0.lock().ok()?;
        match slot.as_ref()? {
            Conn::Raw(shared) => match &*shared.lock().ok()? {
                RawSocket::Tcp(s) => s.peer_addr().ok(),
                RawSocket::Tls(s) => s.get_ref().peer_addr().ok(),
            },
            Conn::Compressed(c) => c.peer_addr(),
        }
    }
}

fn dummy_tcp() -> TcpStream {
    // Never observed: immediately replaced inside the same lock scope.
    // TcpStream has no cheap "empty" constructor, so we open a loopback
    // socket to ourselves for the instant it takes to swap it back out.
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| {
            let addr = l.local_addr()?;
            TcpStream::connect(addr)
        })
        .expect("loopback socket for transport swap")
}

/// A cloneable [`Read`]/[`Write`] handle onto a live [`SharedIo`].
pub struct TransportHandle(SharedIo);

impl TransportHandle {
    /// Clone the live `Conn` out from behind the slot lock and release the
    /// lock immediately; the blocking I/O call happens against the clone.
    fn conn(&self) -> io::Result<Conn> {
        let slot = self.0 .0.lock().expect("transport mutex poisoned");
        slot.as_ref()
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport torn down"))
    }
}

impl Read for TransportHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn()?.read(buf)
    }
}

impl Write for TransportHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn()?.flush()
    }
}

/// Send a single whitespace byte, the idle keepalive of spec §4.1.
/// A no-op over BOSH, which has its own polling cadence.
pub fn whitespace_ping(io: &mut TransportHandle) -> io::Result<()> {
    io.write_all(b" ")?;
    io.flush()
}

/// Open a TCP connection to `domain`, honoring `options.local_ip`/`local_port`
/// and `options.socket_type`. Resolves via DNS-SRV when the `dns` feature is
/// enabled, otherwise connects to `domain:5222`/`5223` directly.
pub fn connect_tcp(domain: &str, options: &SessionOptions) -> Result<SharedIo, Error> {
    let port_hint = options.port.unwrap_or(match options.socket_type {
        SocketType::Plain => 5222,
        SocketType::Tls => 5223,
    });
    let srv_name = match options.socket_type {
        SocketType::Plain => "_xmpp-client._tcp",
        SocketType::Tls => "_xmpps-client._tcp",
    };
    let stream = dns::resolve(domain, srv_name, port_hint, options)?;
    stream
        .set_read_timeout(Some(options.timeout))
        .map_err(|e| Error::Connect(e.to_string()))?;
    match options.socket_type {
        SocketType::Plain => Ok(SharedIo::from_tcp(stream)),
        SocketType::Tls => Ok(SharedIo::from_tls(tls::handshake(stream, domain)?)),
    }
}
