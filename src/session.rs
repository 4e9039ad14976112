//! Owner-facing session API (spec §4.6, component C7).
//!
//! A thin, blocking wrapper around the FSM actor (component C5): every
//! method here sends one [`OwnerCommand`](crate::fsm::OwnerCommand) down the
//! actor's input channel and, for commands that produce a result, blocks on
//! a one-shot reply channel with a timeout. Grounded on the teacher's
//! `Client`/`Agent` split in spirit — a handle type that owns channels into
//! a background worker — but synchronous throughout, per spec §5.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use minidom::Element;
use xmpp_parsers::jid::Jid;

use crate::config::{AuthMethod, SessionOptions};
use crate::dispatch::OwnerEvent;
use crate::error::Error;
use crate::fsm::{Fsm, Input, OwnerCommand, ReplyValue};

#[cfg(feature = "bosh")]
use crate::transport::BoshTransport;

/// A live (or not-yet-connected) XMPP client session.
///
/// Owns the one input channel into the FSM actor thread and the one
/// receiver for its outbound notifications;
/// [`Session::set_controlling_process`] replaces the latter.
pub struct Session {
    input_tx: Sender<Input>,
    events: Receiver<OwnerEvent>,
    default_timeout: Duration,
    #[cfg(feature = "bosh")]
    bosh: std::sync::Mutex<Option<BoshTransport>>,
}

impl Session {
    /// Build a new session in `Setup`. No network I/O happens until a
    /// `connect_*` call.
    pub fn new() -> Self {
        let (owner_tx, owner_rx) = mpsc::channel();
        let (fsm, input_tx) = Fsm::new(owner_tx);
        thread::spawn(move || fsm.run());
        Session {
            input_tx,
            events: owner_rx,
            default_timeout: Duration::from_secs(5),
            #[cfg(feature = "bosh")]
            bosh: std::sync::Mutex::new(None),
        }
    }

    /// The channel of inbound stanzas, unrecognized elements, and stream
    /// closure notices. Block on `.recv()` or poll with `.try_recv()`.
    pub fn events(&self) -> &Receiver<OwnerEvent> {
        &self.events
    }

    /// Replace the owner's notification channel, returning the new
    /// receiver. Any event already in flight to the old receiver is lost,
    /// matching spec §4.6 `set_controlling_process` semantics.
    pub fn set_controlling_process(&mut self) -> Result<(), Error> {
        let (tx, rx) = mpsc::channel();
        self.send(OwnerCommand::SetControllingProcess(tx))?;
        self.events = rx;
        Ok(())
    }

    /// Store credentials for a later `login`/`register_account`, without
    /// touching the FSM's current state.
    pub fn set_credentials(&self, jid: Jid, password: String) -> Result<(), Error> {
        self.send(OwnerCommand::SetCredentials { jid, password })
    }

    /// Select which authentication method `login` will use.
    pub fn set_auth_method(&self, method: AuthMethod) -> Result<(), Error> {
        self.send(OwnerCommand::SetAuthMethod(method))
    }

    /// Convenience: set both credentials and auth method in one call.
    pub fn set_auth(&self, method: AuthMethod, jid: Jid, password: String) -> Result<(), Error> {
        self.send(OwnerCommand::SetAuth {
            method,
            jid,
            password,
        })
    }

    /// Open a plain (STARTTLS-upgradeable) TCP connection to `host` and
    /// negotiate the stream up through features. Blocks until
    /// `StreamOpened` or failure. Returns the stream id.
    ///
    /// `port` overrides whatever `options.port`/SRV resolution would
    /// otherwise pick, matching spec §4.6's `connect_tcp(host, port,
    /// options)`.
    pub fn connect_tcp(&self, host: &str, port: Option<u16>, options: SessionOptions) -> Result<String, Error> {
        let timeout = options.timeout;
        let reply = self.blocking(timeout, |reply| OwnerCommand::ConnectTcp {
            host: host.to_string(),
            port,
            options,
            reply,
        })?;
        expect_text(reply)
    }

    /// Open an implicit-TLS connection (e.g. port 5223) to `host`. See
    /// [`Session::connect_tcp`] for `port`.
    pub fn connect_tls(&self, host: &str, port: Option<u16>, options: SessionOptions) -> Result<String, Error> {
        let timeout = options.timeout;
        let reply = self.blocking(timeout, |reply| OwnerCommand::ConnectTls {
            host: host.to_string(),
            port,
            options,
            reply,
        })?;
        expect_text(reply)
    }

    /// Open a BOSH (XEP-0124/0206) session against `url` for `host`.
    ///
    /// BOSH has no persistent byte stream for the FSM to drive (spec §1),
    /// so this bypasses the actor entirely: the session keeps the
    /// [`BoshTransport`] itself and `send_packet`/`events` become
    /// request/response polling against it instead of going through
    /// [`OwnerCommand::SendPacket`].
    #[cfg(feature = "bosh")]
    pub fn connect_bosh(&self, url: &str, host: &str, options: SessionOptions) -> Result<String, Error> {
        let transport = BoshTransport::connect(url, host, options.timeout)?;
        let mut guard = self.bosh.lock().expect("bosh mutex poisoned");
        *guard = Some(transport);
        Ok(host.to_string())
    }

    /// In-band registration (XEP-0077) against the currently open stream.
    pub fn register_account(&self, username: Option<String>, password: String) -> Result<(), Error> {
        let reply = self.blocking(self.default_timeout, |reply| OwnerCommand::RegisterAccount {
            username,
            password,
            reply,
        })?;
        expect_unit(reply)
    }

    /// Authenticate using the previously configured method/credentials,
    /// bind a resource, and establish a session. Returns the bound JID.
    pub fn login(&self, mechanism: Option<String>, timeout: Option<Duration>) -> Result<Jid, Error> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let reply = self.blocking(timeout, |reply| OwnerCommand::Login {
            mechanism,
            timeout,
            reply,
        })?;
        expect_jid(reply)
    }

    /// Send one stanza. Assigns an `id` attribute if the caller didn't set
    /// one, and returns whichever id was used.
    pub fn send_packet(&self, packet: Element) -> Result<String, Error> {
        #[cfg(feature = "bosh")]
        {
            let guard = self.bosh.lock().expect("bosh mutex poisoned");
            if let Some(bosh) = guard.as_ref() {
                let id = packet.attr("id").unwrap_or_default().to_string();
                bosh.send(vec![packet])?;
                return Ok(id);
            }
        }
        let reply = self.blocking(self.default_timeout, |reply| OwnerCommand::SendPacket {
            packet,
            reply,
        })?;
        expect_text(reply)
    }

    /// Look up a runtime property of the current connection (`peer_addr`,
    /// `stream_id`, `encrypted`, `compressed`). Returns `None` for unknown
    /// names or when the property isn't currently known.
    pub fn get_connection_property(&self, name: &str) -> Result<Option<String>, Error> {
        let reply = self.blocking(self.default_timeout, |reply| OwnerCommand::GetConnectionProperty {
            name: name.to_string(),
            reply,
        })?;
        match reply {
            ReplyValue::Property(p) => Ok(p),
            _ => Ok(None),
        }
    }

    /// Tear the session down. The actor thread exits after processing
    /// this; further calls on this `Session` return [`Error::Disconnected`].
    pub fn stop(&self) -> Result<(), Error> {
        #[cfg(feature = "bosh")]
        {
            let mut guard = self.bosh.lock().expect("bosh mutex poisoned");
            if let Some(bosh) = guard.take() {
                let _ = bosh.disconnect();
            }
        }
        self.send(OwnerCommand::Stop)
    }

    fn send(&self, cmd: OwnerCommand) -> Result<(), Error> {
        self.input_tx
            .send(Input::Owner(cmd))
            .map_err(|_| Error::Disconnected)
    }

    fn blocking<F>(&self, timeout: Duration, build: F) -> Result<ReplyValue, Error>
    where
        F: FnOnce(Sender<Result<ReplyValue, Error>>) -> OwnerCommand,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        let cmd = build(reply_tx);
        self.input_tx
            .send(Input::Owner(cmd))
            .map_err(|_| Error::Disconnected)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_text(value: ReplyValue) -> Result<String, Error> {
    match value {
        ReplyValue::Text(s) => Ok(s),
        _ => Ok(String::new()),
    }
}

fn expect_jid(value: ReplyValue) -> Result<Jid, Error> {
    match value {
        ReplyValue::Jid(jid) => Ok(jid),
        _ => Err(Error::Protocol(crate::error::ProtocolError::BindError)),
    }
}

fn expect_unit(value: ReplyValue) -> Result<(), Error> {
    match value {
        ReplyValue::Unit => Ok(()),
        _ => Ok(()),
    }
}
