//! A synchronous XMPP client session core: stream negotiation, STARTTLS,
//! stream compression, SASL and legacy authentication, resource binding,
//! session establishment, and steady-state stanza exchange.
//!
//! This crate is deliberately *just* the session state machine — one
//! [`Session`] handle, one background actor thread driving an explicit
//! finite-state machine, and a channel of classified notifications coming
//! back out. Higher-level conveniences (roster management, presence
//! tracking, a `Client`/`Agent` facade) belong in a crate built on top of
//! this one.
//!
//! # Getting started
//!
//! ```no_run
//! use xmpp_session_core::config::{AuthMethod, SessionOptions};
//! use xmpp_session_core::session::Session;
//!
//! let session = Session::new();
//! session.set_auth(
//!     AuthMethod::Plain,
//!     "user@example.org".parse().unwrap(),
//!     "hunter2".to_string(),
//! ).unwrap();
//! session.connect_tcp("example.org", None, SessionOptions::new()).unwrap();
//! let jid = session.login(None, None).unwrap();
//! println!("logged in as {jid}");
//! ```
//!
//! # Features
//!
//! - `dns` (default): DNS SRV resolution (`_xmpp-client._tcp`/`_xmpps-client._tcp`) for `connect_tcp`/`connect_tls`.
//! - `tls` (default): STARTTLS and TLS-on-connect via `native-tls`.
//! - `compression` (default): XEP-0138 stream compression via `flate2`.
//! - `bosh`: BOSH (XEP-0124/0206) as an alternate transport via `ureq`.

#![deny(unsafe_code, bare_trait_objects)]

pub use xmpp_parsers as parsers;
pub use xmpp_parsers::{jid, minidom};

pub mod config;
pub mod digest_md5;
pub mod dispatch;
/// Detailed error types.
pub mod error;
pub mod fsm;
pub mod parser;
pub mod sasl_driver;
pub mod session;
pub mod transport;

#[doc(inline)]
pub use crate::error::Error;
pub use crate::session::Session;

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::jid;
        #[allow(unused_imports)]
        use crate::minidom;
        #[allow(unused_imports)]
        use crate::parsers;
    }
}
