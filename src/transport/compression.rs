//! XEP-0138 stream compression, layered on top of whatever raw socket
//! [`super::SharedIo`] currently holds.
//!
//! `flate2`'s `ZlibEncoder`/`ZlibDecoder` each need to own their underlying
//! stream, but the same socket is read from and written to independently;
//! we hand each one a cloned [`Half`] onto the same `Arc<Mutex<RawSocket>>`
//! rather than splitting the socket itself.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use flate2::write::ZlibEncoder;
use flate2::read::ZlibDecoder;
use flate2::Compression;

use super::RawSocket;

type SharedSocket = Arc<Mutex<RawSocket>>;

/// One of two independent handles onto the same underlying socket, used as
/// the `R`/`W` type parameter for the zlib encoder and decoder respectively.
#[derive(Clone)]
pub(super) struct Half(SharedSocket);

impl Read for Half {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().expect("socket mutex poisoned").read(buf)
    }
}

impl Write for Half {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("socket mutex poisoned").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().expect("socket mutex poisoned").flush()
    }
}

/// A compressed transport: writes go through a persistent `ZlibEncoder`,
/// reads through a persistent `ZlibDecoder`, both backed by the same socket.
///
/// Encoder and decoder each sit behind their own lock instead of a single
/// lock over the whole handle, so a reader blocked decoding the next stanza
/// never holds up a concurrent write, and `CompressionHandle` can be cheaply
/// cloned (cloning the `Arc`s, not the codec state) for callers that need to
/// release an outer lock before doing the actual I/O.
#[derive(Clone)]
pub struct CompressionHandle {
    socket: SharedSocket,
    encoder: Arc<Mutex<ZlibEncoder<Half>>>,
    decoder: Arc<Mutex<ZlibDecoder<Half>>>,
}

impl CompressionHandle {
    pub(super) fn wrap(socket: SharedSocket) -> Self {
        let encoder = ZlibEncoder::new(Half(socket.clone()), Compression::default());
        let decoder = ZlibDecoder::new(Half(socket.clone()));
        CompressionHandle {
            socket,
            encoder: Arc::new(Mutex::new(encoder)),
            decoder: Arc::new(Mutex::new(decoder)),
        }
    }

    pub(super) fn peer_addr(&self) -> Option<SocketAddr> {
        match &*self.socket.lock().ok()? {
            RawSocket::Tcp(s) => s.peer_addr().ok(),
            RawSocket::Tls(s) => s.get_ref().peer_addr().ok(),
        }
    }
}

impl Read for CompressionHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.lock().expect("decoder mutex poisoned").read(buf)
    }
}

impl Write for CompressionHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.lock().expect("encoder mutex poisoned").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Z_SYNC_FLUSH semantics: push out a full stanza's bytes without
        // closing the zlib stream, so the peer can decode it immediately.
        self.encoder.lock().expect("encoder mutex poisoned").flush()
    }
}
