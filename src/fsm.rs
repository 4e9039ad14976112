//! Session FSM (spec §4.5, component C5) — the central state machine.
//!
//! Runs as a single-threaded actor (spec §5): one `Input` at a time, off a
//! channel shared by the owner's commands and the background reader
//! thread's parser events, giving total order over everything the FSM
//! reacts to. Grounded in shape on the teacher's `client/login.rs`
//! state-driven `auth()` loop and `xmpp_stream.rs` feature-negotiation walk,
//! generalized per spec §9 into an explicit `State`/`Input` pair instead of
//! the teacher's per-state async dispatch.

use std::io::Write as _;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use minidom::Element;
use xmpp_parsers::jid::Jid;

use crate::config::{AuthMethod, SessionOptions, WhitespacePing};
use crate::dispatch::{self, Dispatched, OwnerEvent};
use crate::error::{AuthError, BusyError, ConfigError, Error, ProtocolError};
use crate::parser::{find_attr, StreamEvent, StreamParser};
use crate::sasl_driver::{SaslDriver, Step as SaslStep};
use crate::transport::{self, SharedIo, TransportHandle};

const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
const NS_CLIENT: &str = "jabber:client";
const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
const NS_COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
const NS_COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";
const NS_IQ_AUTH: &str = "jabber:iq:auth";
const NS_IQ_REGISTER: &str = "jabber:iq:register";

/// The FSM's states (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Setup,
    WaitForStream,
    WaitForStreamFeatures,
    WaitForStarttlsResult,
    WaitForCompressionResult,
    WaitForBindResponse,
    WaitForSessionResponse,
    StreamOpened,
    WaitForLegacyAuthMethod,
    WaitForAuthResult,
    WaitForSaslResponse,
    WaitForRegisterResult,
    LoggedIn,
    StreamError,
    StreamClosed,
}

/// Result payload carried back through a [`PendingReply`].
#[derive(Debug, Clone)]
pub enum ReplyValue {
    Unit,
    Text(String),
    Jid(Jid),
    Property(Option<String>),
}

type PendingReply = Sender<Result<ReplyValue, Error>>;

/// One command issued by the owner (spec §4.6, component C7).
pub enum OwnerCommand {
    SetCredentials {
        jid: Jid,
        password: String,
    },
    SetAuthMethod(AuthMethod),
    SetAuth {
        method: AuthMethod,
        jid: Jid,
        password: String,
    },
    ConnectTcp {
        host: String,
        port: Option<u16>,
        options: SessionOptions,
        reply: PendingReply,
    },
    ConnectTls {
        host: String,
        port: Option<u16>,
        options: SessionOptions,
        reply: PendingReply,
    },
    RegisterAccount {
        username: Option<String>,
        password: String,
        reply: PendingReply,
    },
    Login {
        mechanism: Option<String>,
        timeout: Duration,
        reply: PendingReply,
    },
    SendPacket {
        packet: Element,
        reply: PendingReply,
    },
    GetConnectionProperty {
        name: String,
        reply: PendingReply,
    },
    SetControllingProcess(Sender<OwnerEvent>),
    Stop,
}

/// One event fed into the FSM's single input channel. Reader-thread inputs
/// carry the generation of the transport handle they were read over, mostly
/// for event provenance: the reader thread itself only ever advances past a
/// stream restart once the actor tells it to (see [`ReaderControl`]), so
/// there's no second thread left racing the new one, but the tag is cheap
/// insurance and lets `handle()` assert inputs arrive in the order expected.
pub enum Input {
    Owner(OwnerCommand),
    Parser(u64, Result<StreamEvent, Error>),
    ReaderClosed(u64),
}

/// Told to the background reader thread by the actor. `Reset` hands it a
/// freshly upgraded/restarted [`TransportHandle`] to resume reading from, in
/// place, without spawning a second thread; `Stop` is used when a restart
/// trigger turned out not to lead anywhere (e.g. the TLS handshake itself
/// failed after `<proceed/>`) and the reader is parked waiting for a `Reset`
/// that will never come.
enum ReaderControl {
    Reset(TransportHandle),
    Stop,
}

/// True for the three elements that always precede a stream restart
/// (spec §4.1/§4.5): `<proceed/>`, `<compressed/>`, SASL `<success/>`. The
/// reader thread checks this itself, right after handing the event to the
/// actor, and parks on its control channel instead of racing ahead into
/// another blocking read — only one reader thread ever exists, and it never
/// touches the transport again until the actor has finished whatever
/// transport swap the event requires and tells it to resume.
fn is_restart_trigger(event: &StreamEvent) -> bool {
    matches!(
        event,
        StreamEvent::StreamElement(el)
            if el.is("proceed", NS_TLS)
                || el.is("compressed", NS_COMPRESS_PROTOCOL)
                || el.is("success", NS_SASL)
    )
}

/// Spawn the single background reader thread (spec §5) that owns `parser`
/// for the life of the connection and feeds every event it produces into
/// the actor's single input channel, preserving total order with owner
/// commands sent on the same `tx`. Lives across STARTTLS/compression/SASL
/// restarts by pausing on `control` rather than being torn down and
/// replaced.
fn spawn_reader(
    mut parser: StreamParser<TransportHandle>,
    tx: Sender<Input>,
    control: Receiver<ReaderControl>,
) {
    thread::spawn(move || {
        let mut generation = 0u64;
        loop {
            match parser.next_event() {
                Ok(Some(event)) => {
                    let must_pause = is_restart_trigger(&event);
                    if tx.send(Input::Parser(generation, Ok(event))).is_err() {
                        return;
                    }
                    if must_pause {
                        match control.recv() {
                            Ok(ReaderControl::Reset(handle)) => {
                                parser.reset(handle);
                                generation += 1;
                            }
                            Ok(ReaderControl::Stop) | Err(_) => return,
                        }
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Input::ReaderClosed(generation));
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Input::Parser(generation, Err(e)));
                    return;
                }
            }
        }
    });
}

/// Generates a never-reused-within-process packet id, prefixed `session` per
/// spec §4.5.
struct PacketIds {
    next: u64,
}

impl PacketIds {
    fn new() -> Self {
        PacketIds { next: 1 }
    }

    fn next_id(&mut self) -> String {
        let id = format!("session{}", self.next);
        self.next += 1;
        id
    }
}

/// The FSM's full mutable state (spec §3).
pub struct Fsm {
    state: State,
    owner: Sender<OwnerEvent>,
    credentials: Option<(Jid, String)>,
    auth_method: AuthMethod,
    stream_version: (u8, u8),
    options: SessionOptions,
    domain: Option<String>,
    authenticated: bool,
    compressed: bool,
    encrypted: bool,
    transport: Option<SharedIo>,
    stream_id: Option<String>,
    pending_reply: Option<PendingReply>,
    sasl: Option<SaslDriver>,
    bound_jid: Option<Jid>,
    last_stream_error: Option<String>,
    packet_ids: PacketIds,
    input_tx: Sender<Input>,
    input_rx: Receiver<Input>,
    idle_deadline: Option<Instant>,
    deadline: Option<Instant>,
    generation: u64,
    reader_ctrl: Option<Sender<ReaderControl>>,
}

impl Fsm {
    /// Build a new FSM in `Setup`, returning it along with the `Sender` the
    /// owner-facing API and the background reader use to push inputs.
    pub fn new(owner: Sender<OwnerEvent>) -> (Self, Sender<Input>) {
        let (tx, rx) = mpsc::channel();
        let fsm = Fsm {
            state: State::Setup,
            owner,
            credentials: None,
            auth_method: AuthMethod::Unset,
            stream_version: (1, 0),
            options: SessionOptions::default(),
            domain: None,
            authenticated: false,
            compressed: false,
            encrypted: false,
            transport: None,
            stream_id: None,
            pending_reply: None,
            sasl: None,
            bound_jid: None,
            last_stream_error: None,
            packet_ids: PacketIds::new(),
            input_tx: tx.clone(),
            input_rx: rx,
            idle_deadline: None,
            deadline: None,
            generation: 0,
            reader_ctrl: None,
        };
        (fsm, tx)
    }

    /// Run the actor loop until `stop` or a terminal transport/protocol
    /// failure. Blocks the calling thread; run this on its own thread.
    pub fn run(mut self) {
        loop {
            let wait = self.next_wait();
            let input = match wait {
                Some(d) => match self.input_rx.recv_timeout(d) {
                    Ok(i) => i,
                    Err(RecvTimeoutError::Timeout) => {
                        self.handle_timeout();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match self.input_rx.recv() {
                    Ok(i) => i,
                    Err(_) => return,
                },
            };
            if !self.handle(input) {
                return;
            }
        }
    }

    fn next_wait(&self) -> Option<Duration> {
        let now = Instant::now();
        let a = self.idle_deadline.map(|d| d.saturating_duration_since(now));
        let b = self.deadline.map(|d| d.saturating_duration_since(now));
        match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn handle_timeout(&mut self) {
        let now = Instant::now();
        if let Some(d) = self.deadline {
            if d <= now {
                self.deadline = None;
                self.fail_pending(Error::Timeout);
                self.transition_to_stream_error("timeout".to_string());
                return;
            }
        }
        if let Some(d) = self.idle_deadline {
            if d <= now && self.state == State::LoggedIn {
                if let Some(io) = &self.transport {
                    let mut handle = io.handle();
                    let _ = transport::whitespace_ping(&mut handle);
                }
                self.rearm_idle();
            }
        }
    }

    fn rearm_idle(&mut self) {
        self.idle_deadline = match self.options.whitespace_ping {
            WhitespacePing::Every(d) if self.state == State::LoggedIn => {
                Some(Instant::now() + d)
            }
            _ => None,
        };
    }

    /// Dispatch one input. Returns `false` when the actor should stop.
    fn handle(&mut self, input: Input) -> bool {
        self.rearm_idle();
        match input {
            Input::Owner(cmd) => self.handle_owner(cmd),
            Input::Parser(gen, _) | Input::ReaderClosed(gen) if gen != self.generation => true,
            Input::Parser(_, Ok(event)) => {
                self.handle_parser_event(event);
                true
            }
            Input::Parser(_, Err(e)) => {
                log::warn!("stream read failed: {e}");
                self.fail_pending(e);
                self.transition_to_stream_error("malformed-xml".to_string());
                true
            }
            Input::ReaderClosed(_) => {
                log::info!("transport closed by peer in state {:?}", self.state);
                self.fail_pending(Error::TcpClosed);
                let _ = self.owner.send(OwnerEvent::StreamClosed(None));
                self.state = State::StreamClosed;
                false
            }
        }
    }

    fn fail_pending(&mut self, err: Error) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn reply_ok(&mut self, value: ReplyValue) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Ok(value));
        }
    }

    fn reply_err(&mut self, err: Error) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn transition_to_stream_error(&mut self, condition: String) {
        log::error!("stream error: {condition}");
        self.last_stream_error = Some(condition.clone());
        self.fail_pending(Error::Protocol(ProtocolError::StreamError(condition.clone())));
        let _ = self.owner.send(OwnerEvent::StreamClosed(Some(condition)));
        self.state = State::StreamError;
    }

    // ---- owner commands -------------------------------------------------

    fn handle_owner(&mut self, cmd: OwnerCommand) -> bool {
        match cmd {
            OwnerCommand::SetCredentials { jid, password } => {
                self.credentials = Some((jid, password));
                true
            }
            OwnerCommand::SetAuthMethod(m) => {
                self.auth_method = m;
                true
            }
            OwnerCommand::SetAuth { method, jid, password } => {
                self.auth_method = method;
                self.credentials = Some((jid, password));
                true
            }
            OwnerCommand::ConnectTcp {
                host,
                port,
                options,
                reply,
            } => {
                self.begin_connect(host, port, options, reply);
                true
            }
            OwnerCommand::ConnectTls {
                host,
                port,
                options,
                reply,
            } => {
                let mut options = options;
                options.socket_type = crate::config::SocketType::Tls;
                self.begin_connect(host, port, options, reply);
                true
            }
            OwnerCommand::RegisterAccount {
                username,
                password,
                reply,
            } => {
                self.begin_register(username, password, reply);
                true
            }
            OwnerCommand::Login {
                mechanism,
                timeout,
                reply,
            } => {
                self.begin_login(mechanism, timeout, reply);
                true
            }
            OwnerCommand::SendPacket { packet, reply } => {
                self.send_stanza(packet, reply);
                true
            }
            OwnerCommand::GetConnectionProperty { name, reply } => {
                let value = self.get_property(&name);
                let _ = reply.send(Ok(ReplyValue::Property(value)));
                true
            }
            OwnerCommand::SetControllingProcess(new_owner) => {
                self.owner = new_owner;
                true
            }
            OwnerCommand::Stop => {
                log::info!("session stopped by owner");
                self.fail_pending(Error::Disconnected);
                if let Some(ctrl) = self.reader_ctrl.take() {
                    let _ = ctrl.send(ReaderControl::Stop);
                }
                if let Some(io) = self.transport.take() {
                    drop(io);
                }
                self.state = State::StreamClosed;
                false
            }
        }
    }

    fn get_property(&self, name: &str) -> Option<String> {
        match name {
            "peer_addr" => self
                .transport
                .as_ref()
                .and_then(|t| t.peer_addr())
                .map(|a| a.to_string()),
            "stream_id" => self.stream_id.clone(),
            "encrypted" => Some(self.encrypted.to_string()),
            "compressed" => Some(self.compressed.to_string()),
            _ => None,
        }
    }

    fn begin_connect(
        &mut self,
        host: String,
        port: Option<u16>,
        options: SessionOptions,
        reply: PendingReply,
    ) {
        if self.state != State::Setup {
            let _ = reply.send(Err(Error::Busy(BusyError::UnallowedCommand)));
            return;
        }
        if self.pending_reply.is_some() {
            let _ = reply.send(Err(Error::Busy(BusyError::BusyConnectingToServer)));
            return;
        }
        let domain = options
            .domain
            .clone()
            .or_else(|| self.credentials.as_ref().map(|(jid, _)| jid.domain().to_string()));
        let domain = match domain {
            Some(d) => d,
            None => {
                let _ = reply.send(Err(Error::Config(
                    ConfigError::AuthenticationOrDomainUndefined,
                )));
                return;
            }
        };
        let mut options = options;
        if let Some(p) = port {
            options.port = Some(p);
        }
        self.options = options.clone();
        self.domain = Some(domain.clone());

        log::debug!("connecting to {host} ({domain})");
        let io = match transport::connect_tcp(&host, &options) {
            Ok(io) => io,
            Err(e) => {
                log::warn!("connect to {host} failed: {e}");
                let _ = reply.send(Err(e));
                return;
            }
        };
        let (ctrl_tx, ctrl_rx) = mpsc::channel();
        let parser = StreamParser::new(io.handle());
        spawn_reader(parser, self.input_tx.clone(), ctrl_rx);
        self.reader_ctrl = Some(ctrl_tx);
        self.transport = Some(io);
        self.pending_reply = Some(reply);
        self.deadline = Some(Instant::now() + options.timeout);
        self.open_stream(&domain);
        self.state = State::WaitForStream;
    }

    /// Write the `<stream:stream>` open tag over the current transport.
    fn open_stream(&mut self, domain: &str) {
        if let Some(io) = &self.transport {
            let mut handle = io.handle();
            let open = format!(
                "<stream:stream xmlns='{}' xmlns:stream='{}' to='{}' version='1.0'>",
                NS_CLIENT, NS_STREAMS, domain
            );
            let _ = handle.write_all(open.as_bytes());
            let _ = handle.flush();
        }
    }

    /// Restart the stream on the same connection after an in-place upgrade
    /// or successful SASL auth (spec §4.1/§4.5 "reset_parser"). The reader
    /// thread is already parked waiting for this (it pauses right after
    /// handing the triggering `<proceed/>`/`<compressed/>`/`<success/>`
    /// element to the actor — see `spawn_reader`), so there is no old reader
    /// left competing for the transport: wake it with a parser reset over
    /// the (possibly just-upgraded) transport handle, then send the new
    /// opening tag.
    fn restart_stream(&mut self, domain: &str) {
        self.generation += 1;
        if let Some(io) = &self.transport {
            if let Some(ctrl) = &self.reader_ctrl {
                let _ = ctrl.send(ReaderControl::Reset(io.handle()));
            }
        }
        log::debug!("restarting stream to {domain}");
        self.open_stream(domain);
    }

    fn begin_register(&mut self, username: Option<String>, password: String, reply: PendingReply) {
        if self.state != State::StreamOpened {
            let _ = reply.send(Err(Error::Busy(BusyError::UnallowedCommand)));
            return;
        }
        if self.pending_reply.is_some() {
            let _ = reply.send(Err(Error::Busy(BusyError::BusyConnectingToServer)));
            return;
        }
        let user = username.or_else(|| {
            self.credentials
                .as_ref()
                .and_then(|(jid, _)| jid.node().map(|n| n.to_string()))
        });
        let user = match user {
            Some(u) => u,
            None => {
                let _ = reply.send(Err(Error::Config(ConfigError::AuthInfoUndefined)));
                return;
            }
        };
        let id = self.packet_ids.next_id();
        let mut iq = Element::bare("iq", NS_CLIENT);
        iq.set_attr("type", "set");
        iq.set_attr("id", id);
        let mut query = Element::bare("query", NS_IQ_REGISTER);
        let mut username_el = Element::bare("username", NS_IQ_REGISTER);
        username_el.append_text_node(user);
        let mut password_el = Element::bare("password", NS_IQ_REGISTER);
        password_el.append_text_node(password);
        query.append_child(username_el);
        query.append_child(password_el);
        iq.append_child(query);
        self.write_element(&iq);
        self.pending_reply = Some(reply);
        self.state = State::WaitForRegisterResult;
    }

    fn begin_login(&mut self, mechanism: Option<String>, timeout: Duration, reply: PendingReply) {
        if self.state != State::StreamOpened {
            let _ = reply.send(Err(Error::Busy(BusyError::UnallowedCommand)));
            return;
        }
        if self.pending_reply.is_some() {
            let _ = reply.send(Err(Error::Busy(BusyError::BusyConnectingToServer)));
            return;
        }
        if self.auth_method == AuthMethod::Unset {
            let _ = reply.send(Err(Error::Config(ConfigError::AuthMethodUndefined)));
            return;
        }
        let (jid, password) = match &self.credentials {
            Some(c) => c.clone(),
            None => {
                let _ = reply.send(Err(Error::Config(ConfigError::AuthInfoUndefined)));
                return;
            }
        };
        self.deadline = Some(Instant::now() + timeout);
        self.pending_reply = Some(reply);

        match self.auth_method {
            AuthMethod::Password | AuthMethod::Digest => {
                let id = self.packet_ids.next_id();
                let mut iq = Element::bare("iq", NS_CLIENT);
                iq.set_attr("type", "get");
                iq.set_attr("id", id);
                let query = Element::bare("query", NS_IQ_AUTH);
                iq.append_child(query);
                self.write_element(&iq);
                self.state = State::WaitForLegacyAuthMethod;
            }
            AuthMethod::Plain | AuthMethod::Anonymous | AuthMethod::DigestMd5 => {
                let wire_name = match self.auth_method {
                    AuthMethod::Plain => "PLAIN",
                    AuthMethod::Anonymous => "ANONYMOUS",
                    AuthMethod::DigestMd5 => "DIGEST-MD5",
                    _ => unreachable!(),
                };
                let mechanism = mechanism.unwrap_or_else(|| wire_name.to_string());
                let username = jid.node().map(|n| n.to_string()).unwrap_or_default();
                let domain = jid.domain().to_string();
                let mut driver = match SaslDriver::init(&mechanism, &username, &domain, &password) {
                    Some(d) => d,
                    None => {
                        self.reply_err(Error::Auth(AuthError::NoMechanism));
                        self.state = State::StreamOpened;
                        return;
                    }
                };
                let initial = driver.initial_response();
                self.sasl = Some(driver);
                let mut auth = Element::bare("auth", NS_SASL);
                auth.set_attr("mechanism", mechanism);
                if !initial.is_empty() {
                    auth.append_text_node(BASE64.encode(initial));
                }
                self.write_element(&auth);
                self.state = State::WaitForSaslResponse;
            }
            AuthMethod::Unset => unreachable!(),
        }
    }

    fn send_stanza(&mut self, mut packet: Element, reply: PendingReply) {
        if !matches!(self.state, State::StreamOpened | State::LoggedIn) {
            let _ = reply.send(Err(Error::Busy(BusyError::NotConnected)));
            return;
        }
        let id = packet.attr("id").map(|s| s.to_string()).unwrap_or_else(|| {
            let id = self.packet_ids.next_id();
            packet.set_attr("id", id.clone());
            id
        });
        self.write_element(&packet);
        let _ = reply.send(Ok(ReplyValue::Text(id)));
    }

    fn write_element(&mut self, el: &Element) {
        if let Some(io) = &self.transport {
            let mut handle = io.handle();
            let _ = el.write_to(&mut handle);
            let _ = handle.flush();
        }
    }

    // ---- parser events ----------------------------------------------------

    fn handle_parser_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::StreamStart { attrs } => self.on_stream_start(attrs),
            StreamEvent::StreamElement(el) => self.on_stream_element(el),
            StreamEvent::StreamEnd => {
                self.fail_pending(Error::Disconnected);
                let _ = self.owner.send(OwnerEvent::StreamClosed(None));
                self.state = State::StreamClosed;
            }
        }
    }

    fn on_stream_start(&mut self, attrs: Vec<(String, String)>) {
        if self.state != State::WaitForStream {
            return;
        }
        self.stream_id = find_attr(&attrs, "id");
        let version = find_attr(&attrs, "version").unwrap_or_default();
        if version == "1.0" {
            self.stream_version = (1, 0);
            self.state = State::WaitForStreamFeatures;
        } else {
            self.stream_version = (0, 0);
            self.deadline = None;
            let stream_id = self.stream_id.clone().unwrap_or_default();
            self.reply_ok(ReplyValue::Text(stream_id));
            self.state = State::StreamOpened;
        }
    }

    fn on_stream_element(&mut self, el: Element) {
        match self.state {
            State::WaitForStreamFeatures => self.on_features(el),
            State::WaitForStarttlsResult => self.on_starttls_result(el),
            State::WaitForCompressionResult => self.on_compression_result(el),
            State::WaitForSaslResponse => self.on_sasl_element(el),
            State::WaitForLegacyAuthMethod => self.on_legacy_auth_method(el),
            State::WaitForAuthResult => self.on_legacy_auth_result(el),
            State::WaitForBindResponse => self.on_bind_result(el),
            State::WaitForSessionResponse => self.on_session_result(el),
            State::WaitForRegisterResult => self.on_register_result(el),
            State::StreamOpened | State::LoggedIn => self.on_steady_state_element(el),
            _ => {}
        }
    }

    fn on_features(&mut self, features: Element) {
        let tls_offered = features
            .get_child("starttls", NS_TLS)
            .is_some();
        let tls_required = features
            .get_child("starttls", NS_TLS)
            .map(|t| t.get_child("required", NS_TLS).is_some())
            .unwrap_or(false);
        let compression_offered = features.get_child("compression", NS_COMPRESS_FEATURE).is_some();

        if tls_offered && !self.encrypted {
            if self.options.starttls.is_enabled() {
                let starttls = Element::bare("starttls", NS_TLS);
                self.write_element(&starttls);
                self.state = State::WaitForStarttlsResult;
                return;
            } else if tls_required {
                self.transition_to_stream_error("policy-violation".to_string());
                return;
            }
        }
        if compression_offered && !self.compressed && self.options.compression.is_enabled() {
            let mut compress = Element::bare("compress", NS_COMPRESS_PROTOCOL);
            let mut method = Element::bare("method", NS_COMPRESS_PROTOCOL);
            method.append_text_node("zlib");
            compress.append_child(method);
            self.write_element(&compress);
            self.state = State::WaitForCompressionResult;
            return;
        }
        if self.authenticated {
            self.send_bind_request(&features);
            return;
        }
        self.deadline = None;
        let stream_id = self.stream_id.clone().unwrap_or_default();
        self.reply_ok(ReplyValue::Text(stream_id));
        self.state = State::StreamOpened;
    }

    fn send_bind_request(&mut self, _features: &Element) {
        let resource = self
            .credentials
            .as_ref()
            .and_then(|(jid, _)| jid.resource_str().map(|r| r.to_string()));
        let id = self.packet_ids.next_id();
        let mut iq = Element::bare("iq", NS_CLIENT);
        iq.set_attr("type", "set");
        iq.set_attr("id", id);
        let mut bind = Element::bare("bind", NS_BIND);
        if let Some(resource) = resource {
            let mut res_el = Element::bare("resource", NS_BIND);
            res_el.append_text_node(resource);
            bind.append_child(res_el);
        }
        iq.append_child(bind);
        self.write_element(&iq);
        self.state = State::WaitForBindResponse;
    }

    /// The reader thread parked right after handing us this element (see
    /// `spawn_reader`'s `is_restart_trigger` check) and is waiting on its
    /// control channel; if we're not about to call `restart_stream`, it must
    /// be told to stop instead, or it waits forever.
    fn abandon_paused_reader(&mut self) {
        if let Some(ctrl) = self.reader_ctrl.take() {
            let _ = ctrl.send(ReaderControl::Stop);
        }
    }

    fn on_starttls_result(&mut self, el: Element) {
        if el.is("proceed", NS_TLS) {
            let domain = self.domain.clone().unwrap_or_default();
            let upgraded = self.transport.as_ref().map(|io| io.upgrade_tls(&domain));
            match upgraded {
                Some(Ok(())) => {
                    log::debug!("starttls negotiated, restarting stream");
                    self.encrypted = true;
                    self.restart_stream(&domain);
                    self.state = State::WaitForStream;
                }
                _ => {
                    log::warn!("starttls handshake failed after <proceed/>");
                    self.abandon_paused_reader();
                    self.fail_pending(Error::CouldNotEncryptStream);
                    self.state = State::StreamError;
                }
            }
        } else if el.is("failure", NS_TLS) {
            log::warn!("server rejected starttls");
            self.fail_pending(Error::CouldNotEncryptStream);
            self.state = State::StreamError;
        }
    }

    fn on_compression_result(&mut self, el: Element) {
        if el.is("compressed", NS_COMPRESS_PROTOCOL) {
            let domain = self.domain.clone().unwrap_or_default();
            let ok = self
                .transport
                .as_ref()
                .map(|io| io.enable_compression())
                .unwrap_or(Err(Error::CouldNotCompressStream));
            match ok {
                Ok(()) => {
                    log::debug!("compression negotiated, restarting stream");
                    self.compressed = true;
                    self.restart_stream(&domain);
                    self.state = State::WaitForStream;
                }
                Err(e) => {
                    log::warn!("failed to enable compression: {e}");
                    self.abandon_paused_reader();
                    self.fail_pending(e);
                    self.state = State::StreamError;
                }
            }
        } else {
            log::warn!("server rejected compression request");
            self.fail_pending(Error::CouldNotCompressStream);
            self.state = State::StreamError;
        }
    }

    fn on_sasl_element(&mut self, el: Element) {
        if el.is("challenge", NS_SASL) {
            let text = el.text();
            let challenge = BASE64.decode(text.trim()).unwrap_or_default();
            let step = self
                .sasl
                .as_mut()
                .map(|d| d.step(&challenge))
                .unwrap_or(Err(AuthError::NoMechanism));
            match step {
                Ok(SaslStep::Continue(bytes)) => {
                    let mut response = Element::bare("response", NS_SASL);
                    response.append_text_node(BASE64.encode(bytes));
                    self.write_element(&response);
                }
                Ok(SaslStep::Done) => {
                    let response = Element::bare("response", NS_SASL);
                    self.write_element(&response);
                }
                Err(e) => {
                    self.reply_err(Error::Auth(e));
                    self.state = State::StreamOpened;
                }
            }
        } else if el.is("success", NS_SASL) {
            log::debug!("sasl authentication succeeded, restarting stream");
            self.authenticated = true;
            self.sasl = None;
            let domain = self.domain.clone().unwrap_or_default();
            self.restart_stream(&domain);
            self.state = State::WaitForStream;
        } else if el.is("failure", NS_SASL) {
            let condition = el
                .children()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "not-authorized".to_string());
            log::warn!("sasl authentication failed: {condition}");
            self.sasl = None;
            self.reply_err(Error::Auth(AuthError::Fail(condition)));
            self.state = State::StreamOpened;
        }
    }

    fn on_legacy_auth_method(&mut self, el: Element) {
        if !el.is("iq", NS_CLIENT) {
            return;
        }
        if el.attr("type") == Some("error") {
            self.reply_err(Error::Protocol(ProtocolError::NotAuthMethodResult));
            self.state = State::StreamOpened;
            return;
        }
        let query = match el.get_child("query", NS_IQ_AUTH) {
            Some(q) => q,
            None => {
                self.reply_err(Error::Protocol(ProtocolError::NotAuthMethodResult));
                self.state = State::StreamOpened;
                return;
            }
        };
        let supports_digest = query.get_child("digest", NS_IQ_AUTH).is_some();
        let (jid, password) = match &self.credentials {
            Some(c) => c.clone(),
            None => {
                self.reply_err(Error::Config(ConfigError::AuthInfoUndefined));
                self.state = State::StreamOpened;
                return;
            }
        };
        let username = jid.node().map(|n| n.to_string()).unwrap_or_default();
        let resource = jid.resource_str().unwrap_or("session").to_string();
        let id = self.packet_ids.next_id();
        let mut iq = Element::bare("iq", NS_CLIENT);
        iq.set_attr("type", "set");
        iq.set_attr("id", id);
        let mut q = Element::bare("query", NS_IQ_AUTH);
        let mut username_el = Element::bare("username", NS_IQ_AUTH);
        username_el.append_text_node(username.clone());
        q.append_child(username_el);

        if supports_digest && self.auth_method == AuthMethod::Digest {
            let stream_id = match &self.stream_id {
                Some(s) => s.clone(),
                None => {
                    self.reply_err(Error::Protocol(ProtocolError::NoStreamIdForDigestAuth));
                    self.state = State::StreamOpened;
                    return;
                }
            };
            let digest = legacy_digest(&stream_id, &password);
            let mut digest_el = Element::bare("digest", NS_IQ_AUTH);
            digest_el.append_text_node(digest);
            q.append_child(digest_el);
        } else {
            let mut password_el = Element::bare("password", NS_IQ_AUTH);
            password_el.append_text_node(password);
            q.append_child(password_el);
        }
        let mut resource_el = Element::bare("resource", NS_IQ_AUTH);
        resource_el.append_text_node(resource);
        q.append_child(resource_el);
        iq.append_child(q);
        self.write_element(&iq);
        self.state = State::WaitForAuthResult;
    }

    fn on_legacy_auth_result(&mut self, el: Element) {
        if !el.is("iq", NS_CLIENT) {
            return;
        }
        match el.attr("type") {
            Some("result") => {
                self.authenticated = true;
                self.deadline = None;
                let jid = self
                    .credentials
                    .as_ref()
                    .map(|(jid, _)| jid.clone())
                    .unwrap_or_else(|| "unknown@unknown".parse().expect("fallback jid parses"));
                log::info!("legacy auth succeeded as {jid}");
                self.reply_ok(ReplyValue::Jid(jid.clone()));
                self.bound_jid = Some(jid);
                self.state = State::LoggedIn;
                self.rearm_idle();
            }
            _ => {
                let condition = error_condition(&el).unwrap_or_else(|| "not-authorized".to_string());
                log::warn!("legacy auth failed: {condition}");
                self.reply_err(Error::Auth(AuthError::Fail(condition)));
                self.state = State::StreamOpened;
            }
        }
    }

    fn on_bind_result(&mut self, el: Element) {
        if !el.is("iq", NS_CLIENT) {
            return;
        }
        if el.attr("type") != Some("result") {
            self.reply_err(Error::Protocol(ProtocolError::BindError));
            self.state = State::StreamOpened;
            return;
        }
        let jid = el
            .get_child("bind", NS_BIND)
            .and_then(|b| b.get_child("jid", NS_BIND))
            .map(|j| j.text());
        let jid: Jid = match jid.and_then(|s| s.parse().ok()) {
            Some(j) => j,
            None => {
                self.reply_err(Error::Protocol(ProtocolError::BindError));
                self.state = State::StreamOpened;
                return;
            }
        };
        self.bound_jid = Some(jid);
        let id = self.packet_ids.next_id();
        let mut iq = Element::bare("iq", NS_CLIENT);
        iq.set_attr("type", "set");
        iq.set_attr("id", id);
        let session = Element::bare("session", NS_SESSION);
        iq.append_child(session);
        self.write_element(&iq);
        self.state = State::WaitForSessionResponse;
    }

    fn on_session_result(&mut self, el: Element) {
        if !el.is("iq", NS_CLIENT) {
            return;
        }
        if el.attr("type") != Some("result") {
            self.reply_err(Error::Protocol(ProtocolError::SessionError));
            self.state = State::StreamOpened;
            return;
        }
        self.deadline = None;
        let jid = self.bound_jid.clone().unwrap_or_else(|| {
            self.credentials
                .as_ref()
                .map(|(jid, _)| jid.clone())
                .expect("bound jid or credentials present by session establishment")
        });
        log::info!("session established as {jid}");
        self.reply_ok(ReplyValue::Jid(jid));
        self.state = State::LoggedIn;
        self.rearm_idle();
    }

    fn on_register_result(&mut self, el: Element) {
        if !el.is("iq", NS_CLIENT) {
            return;
        }
        match el.attr("type") {
            Some("result") => {
                self.reply_ok(ReplyValue::Unit);
            }
            _ => {
                let reason = error_condition(&el).unwrap_or_else(|| "unknown".to_string());
                self.reply_err(Error::Protocol(ProtocolError::RegisterError(reason)));
            }
        }
        self.state = State::StreamOpened;
    }

    fn on_steady_state_element(&mut self, el: Element) {
        match dispatch::classify(el) {
            Dispatched::Notify(n) => {
                let _ = self.owner.send(OwnerEvent::Stanza(n));
            }
            Dispatched::StreamError(condition) => {
                self.transition_to_stream_error(condition);
            }
            Dispatched::Raw(el) => {
                let _ = self.owner.send(OwnerEvent::Raw(el));
            }
        }
    }
}

fn error_condition(iq: &Element) -> Option<String> {
    iq.get_child("error", NS_CLIENT)
        .and_then(|e| e.children().next())
        .map(|c| c.name().to_string())
}

/// XEP-0078 SHA-1 digest over `stream_id + password`.
fn legacy_digest(stream_id: &str, password: &str) -> String {
    use xmpp_parsers::sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(40);
    for byte in digest {
        use std::fmt::Write as _;
        write!(out, "{:02x}", byte).unwrap();
    }
    out
}
