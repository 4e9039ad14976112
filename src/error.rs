//! Error types for the session core.
//!
//! Mirrors the taxonomy of spec §7: configuration errors are returned
//! synchronously to the caller without touching FSM state, connect-phase and
//! protocol errors travel back through a pending-reply completion, and
//! transport errors are always terminal.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use xmpp_parsers::jid::Error as JidError;

/// Top-level error type returned by any [`Session`](crate::session::Session)
/// operation.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport.
    Io(IoError),
    /// Error parsing a Jabber ID.
    JidParse(JidError),
    /// Protocol-level error (malformed or out-of-sequence XMPP).
    Protocol(ProtocolError),
    /// Authentication-specific error.
    Auth(AuthError),
    /// A command was rejected because the session is in the wrong state.
    Busy(BusyError),
    /// A configuration error, detected before any network I/O happened.
    Config(ConfigError),
    /// The blocking command timed out waiting for a reply.
    Timeout,
    /// The connection attempt failed before a stream could be established.
    Connect(String),
    /// The peer closed the TCP connection.
    TcpClosed,
    /// Stream compression (XEP-0138) could not be negotiated.
    CouldNotCompressStream,
    /// The TLS handshake failed.
    CouldNotEncryptStream,
    /// The stream was closed, normally or otherwise; the session is no
    /// longer usable.
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "I/O error: {}", e),
            Error::JidParse(e) => write!(fmt, "JID parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Busy(e) => write!(fmt, "{}", e),
            Error::Config(e) => write!(fmt, "{}", e),
            Error::Timeout => write!(fmt, "operation timed out"),
            Error::Connect(reason) => write!(fmt, "connect error: {}", reason),
            Error::TcpClosed => write!(fmt, "tcp connection closed"),
            Error::CouldNotCompressStream => write!(fmt, "could not compress stream"),
            Error::CouldNotEncryptStream => write!(fmt, "could not encrypt stream"),
            Error::Disconnected => write!(fmt, "disconnected"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<JidError> for Error {
    fn from(e: JidError) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<BusyError> for Error {
    fn from(e: BusyError) -> Self {
        Error::Busy(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

/// Protocol-level error: the stream said something the FSM didn't expect.
#[derive(Debug)]
pub enum ProtocolError {
    /// The XML parser could not tokenize the incoming bytes.
    MalformedXml(String),
    /// The server sent a `<stream:error>`.
    StreamError(String),
    /// Resource binding failed or returned an unreadable response.
    BindError,
    /// Session establishment (RFC 3921 §3) failed.
    SessionError,
    /// In-band registration (XEP-0077) failed.
    RegisterError(String),
    /// Legacy auth (XEP-0078) query result didn't advertise a usable field.
    NotAuthMethodResult,
    /// None of the mechanisms offered by the server are supported locally.
    NoSupportedAuthMethod,
    /// Digest-based legacy auth requires a stream id, and none was received.
    NoStreamIdForDigestAuth,
    /// STARTTLS is mandatory per the server but disabled locally.
    PolicyViolation,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::MalformedXml(e) => write!(fmt, "malformed XML: {}", e),
            ProtocolError::StreamError(cond) => write!(fmt, "stream error: {}", cond),
            ProtocolError::BindError => write!(fmt, "resource binding failed"),
            ProtocolError::SessionError => write!(fmt, "session establishment failed"),
            ProtocolError::RegisterError(reason) => write!(fmt, "registration failed: {}", reason),
            ProtocolError::NotAuthMethodResult => {
                write!(fmt, "legacy auth query did not return a usable method")
            }
            ProtocolError::NoSupportedAuthMethod => {
                write!(fmt, "no supported authentication method offered by server")
            }
            ProtocolError::NoStreamIdForDigestAuth => write!(
                fmt,
                "no stream id available to compute legacy digest auth"
            ),
            ProtocolError::PolicyViolation => write!(
                fmt,
                "starttls is required by the server but disabled locally (policy-violation)"
            ),
        }
    }
}

impl StdError for ProtocolError {}

/// Authentication-specific error.
#[derive(Debug)]
pub enum AuthError {
    /// No SASL mechanism offered by the server is implemented locally.
    NoMechanism,
    /// The local mechanism driver rejected its own state (implementation
    /// bug or malformed challenge).
    Sasl(String),
    /// The server sent `<failure/>` with this `defined-condition`.
    Fail(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(e) => write!(fmt, "local SASL implementation error: {}", e),
            AuthError::Fail(cond) => write!(fmt, "failure from the server: {}", cond),
        }
    }
}

impl StdError for AuthError {}

/// A command was refused because the session isn't in a state that allows
/// it (spec §7, "Busy" category).
#[derive(Debug)]
pub enum BusyError {
    /// A blocking command is already outstanding; only one is allowed.
    BusyConnectingToServer,
    /// `send_packet`/`login`/etc. called before `connect_*` completed.
    NotConnected,
    /// An operation that requires `LoggedIn` was attempted earlier.
    NotLoggedIn,
    /// The command isn't valid in the current state.
    UnallowedCommand,
}

impl fmt::Display for BusyError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusyError::BusyConnectingToServer => write!(fmt, "busy_connecting_to_server"),
            BusyError::NotConnected => write!(fmt, "not_connected"),
            BusyError::NotLoggedIn => write!(fmt, "not_logged_in"),
            BusyError::UnallowedCommand => write!(fmt, "unallowed_command"),
        }
    }
}

impl StdError for BusyError {}

/// Configuration errors, raised synchronously without touching FSM state.
#[derive(Debug)]
pub enum ConfigError {
    /// The supplied JID string did not parse.
    IncorrectJid,
    /// `login()` was called with `auth_method` still `Unset`.
    AuthMethodUndefined,
    /// `login()`/`register()` was called with no credentials set.
    AuthInfoUndefined,
    /// Neither credentials nor an explicit domain were set before connect.
    AuthenticationOrDomainUndefined,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IncorrectJid => write!(fmt, "incorrect_jid"),
            ConfigError::AuthMethodUndefined => write!(fmt, "auth_method_undefined"),
            ConfigError::AuthInfoUndefined => write!(fmt, "auth_info_undefined"),
            ConfigError::AuthenticationOrDomainUndefined => {
                write!(fmt, "authentication_or_domain_undefined")
            }
        }
    }
}

impl StdError for ConfigError {}
