//! TLS handshake helper shared between STARTTLS upgrade and TLS-on-connect.
//!
//! Grounded on the teacher's `starttls::get_tls_stream` (`starttls/client.rs`):
//! build a bare `native_tls::TlsConnector` and hand it ownership of the raw
//! `TcpStream`. We don't carry the teacher's `tls-rust`/rustls alternative,
//! since spec options only ever name one TLS backend.

use std::net::TcpStream;

use crate::error::Error;

/// Perform the TLS client handshake over an already-connected `TcpStream`.
pub(super) fn handshake(
    stream: TcpStream,
    domain: &str,
) -> Result<native_tls::TlsStream<TcpStream>, Error> {
    let connector = native_tls::TlsConnector::new().map_err(|_| Error::CouldNotEncryptStream)?;
    connector
        .connect(domain, stream)
        .map_err(|_| Error::CouldNotEncryptStream)
}
