//! Credentials and configuration store (spec §3, §6: "Configuration
//! options"). Holds everything the FSM needs before a single byte is sent:
//! who we are, how we plan to authenticate, and which optional features to
//! attempt.
//!
//! Grounded on the teacher's `connect::DnsConfig` builder idiom
//! (`DnsConfig::srv`, `srv_default_client`): small, `Clone`-able value types
//! with named constructors rather than a generic options map.

use std::net::IpAddr;
use std::time::Duration;

use xmpp_parsers::jid::Jid;

/// Tagged authentication method, spec §3 `auth_method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No method selected yet.
    Unset,
    /// Legacy plaintext password auth (XEP-0078, `jabber:iq:auth`).
    Password,
    /// Legacy SHA-1 digest auth over the stream id (XEP-0078).
    Digest,
    /// SASL PLAIN.
    Plain,
    /// SASL ANONYMOUS.
    Anonymous,
    /// SASL DIGEST-MD5 (RFC 2831).
    DigestMd5,
}

/// Credentials pair: a JID (which may carry a resource) and a password.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Full Jabber ID, e.g. `user@host/res`. The resource part, if any, is
    /// the preferred resource to bind.
    pub jid: Jid,
    /// Plaintext password, as supplied by the owner. Never logged.
    pub password: String,
}

/// Whether an optional stream feature should be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Attempt to use the feature if the server offers it.
    Enabled,
    /// Never attempt to use the feature, even if offered.
    Disabled,
}

impl Toggle {
    /// True if the feature should be attempted.
    pub fn is_enabled(self) -> bool {
        matches!(self, Toggle::Enabled)
    }
}

/// How long to stay idle in `LoggedIn` before sending a keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitespacePing {
    /// Send a single whitespace byte after this much inactivity.
    Every(Duration),
    /// Never send a whitespace ping.
    Never,
}

/// Which socket to open on `connect_tcp`/`connect_tls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Plain TCP; STARTTLS may upgrade it in-band later.
    Plain,
    /// TLS-on-connect (implicit TLS, e.g. port 5223).
    Tls,
}

/// Recognized configuration keys and their effects (spec §6).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bind the client socket to this local address before connecting.
    pub local_ip: Option<IpAddr>,
    /// Bind the client socket to this local port before connecting.
    pub local_port: Option<u16>,
    /// Override the XMPP domain (stream `to=`) independent of the TCP host.
    pub domain: Option<String>,
    /// Skip SRV/A lookup and connect directly to this port on the TCP host.
    /// Mainly for non-standard deployments and test servers.
    pub port: Option<u16>,
    /// Whether to negotiate STARTTLS when offered.
    pub starttls: Toggle,
    /// Whether to negotiate stream compression (XEP-0138) when offered.
    pub compression: Toggle,
    /// Idle-keepalive configuration.
    pub whitespace_ping: WhitespacePing,
    /// Connect-phase timeout; also the default for `login()`.
    pub timeout: Duration,
    /// Plain TCP vs. TLS-on-connect.
    pub socket_type: SocketType,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            local_ip: None,
            local_port: None,
            domain: None,
            port: None,
            starttls: Toggle::Enabled,
            compression: Toggle::Enabled,
            whitespace_ping: WhitespacePing::Never,
            timeout: Duration::from_secs(5),
            socket_type: SocketType::Plain,
        }
    }
}

impl SessionOptions {
    /// Start from the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: override `starttls`.
    pub fn with_starttls(mut self, toggle: Toggle) -> Self {
        self.starttls = toggle;
        self
    }

    /// Builder: override `compression`.
    pub fn with_compression(mut self, toggle: Toggle) -> Self {
        self.compression = toggle;
        self
    }

    /// Builder: override `whitespace_ping`.
    pub fn with_whitespace_ping(mut self, ping: WhitespacePing) -> Self {
        self.whitespace_ping = ping;
        self
    }

    /// Builder: override `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: override `domain`.
    pub fn with_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Builder: override `socket_type`.
    pub fn with_socket_type(mut self, socket_type: SocketType) -> Self {
        self.socket_type = socket_type;
        self
    }

    /// Builder: connect directly to this port instead of the SRV/A default.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder: bind to this local address/port pair before connecting.
    pub fn with_local_bind(mut self, ip: IpAddr, port: u16) -> Self {
        self.local_ip = Some(ip);
        self.local_port = Some(port);
        self
    }
}
