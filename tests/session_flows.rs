//! Integration tests driving [`Session`] end to end against a scripted
//! loopback TCP server, covering the legacy and SASL login scenarios.
//!
//! Each fake server is a plain thread reading/writing raw bytes rather than
//! a full XMPP implementation: on loopback, a client-side `write_all` +
//! `flush` per stanza reliably shows up as one `read` on the other end, so
//! the scripts below drive the exchange one `read`/`write` pair at a time.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use xmpp_session_core::config::{AuthMethod, SessionOptions};
use xmpp_session_core::session::Session;

fn fake_server<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept test client");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        script(stream);
    });
    (port, handle)
}

fn read_chunk(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).expect("read from test client");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

fn write_all(stream: &mut TcpStream, data: &str) {
    stream.write_all(data.as_bytes()).expect("write to test client");
    stream.flush().unwrap();
}

fn test_options(port: u16) -> SessionOptions {
    SessionOptions::new()
        .with_domain("test.example")
        .with_port(port)
}

/// Scenario S1: a server that never advertises `version='1.0'` skips
/// feature negotiation entirely and goes straight to legacy (XEP-0078)
/// plaintext auth.
#[test]
fn legacy_version_zero_login_succeeds() {
    let (port, server) = fake_server(|mut stream| {
        let opening = read_chunk(&mut stream);
        assert!(opening.contains("stream:stream"));
        write_all(
            &mut stream,
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='test.example'>",
        );

        let auth_get = read_chunk(&mut stream);
        assert!(auth_get.contains("jabber:iq:auth"));
        assert!(auth_get.contains("type='get'") || auth_get.contains("type=\"get\""));
        write_all(
            &mut stream,
            "<iq type='result' id='session1'><query xmlns='jabber:iq:auth'><username/><password/><resource/></query></iq>",
        );

        let auth_set = read_chunk(&mut stream);
        assert!(auth_set.contains("<username>alice</username>"));
        assert!(auth_set.contains("<password>hunter2</password>"));
        write_all(&mut stream, "<iq type='result' id='session2'/>");
    });

    let session = Session::new();
    session
        .set_auth(
            AuthMethod::Password,
            "alice@test.example/phone".parse().unwrap(),
            "hunter2".to_string(),
        )
        .unwrap();
    let stream_id = session
        .connect_tcp("127.0.0.1", None, test_options(port))
        .expect("connect_tcp should succeed against the legacy server");
    assert_eq!(stream_id, "s1");

    let jid = session
        .login(None, Some(Duration::from_secs(2)))
        .expect("legacy login should succeed");
    assert_eq!(jid.to_string(), "alice@test.example/phone");

    server.join().unwrap();
}

/// Scenario S2: a `version='1.0'` server offering only SASL PLAIN, followed
/// by resource binding and session establishment after the post-auth stream
/// restart.
#[test]
fn sasl_plain_login_succeeds() {
    let (port, server) = fake_server(|mut stream| {
        let opening = read_chunk(&mut stream);
        assert!(opening.contains("stream:stream"));
        write_all(
            &mut stream,
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s2a' from='test.example' version='1.0'>\
             <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        );

        let auth = read_chunk(&mut stream);
        assert!(auth.contains("mechanism='PLAIN'") || auth.contains("mechanism=\"PLAIN\""));
        write_all(
            &mut stream,
            "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>",
        );

        let restart = read_chunk(&mut stream);
        assert!(restart.contains("stream:stream"));
        write_all(
            &mut stream,
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s2b' from='test.example' version='1.0'>\
             <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></stream:features>",
        );

        let bind_iq = read_chunk(&mut stream);
        assert!(bind_iq.contains("urn:ietf:params:xml:ns:xmpp-bind"));
        write_all(
            &mut stream,
            "<iq type='result' id='session1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>bob@test.example/laptop</jid></bind></iq>",
        );

        let session_iq = read_chunk(&mut stream);
        assert!(session_iq.contains("urn:ietf:params:xml:ns:xmpp-session"));
        write_all(&mut stream, "<iq type='result' id='session2'/>");
    });

    let session = Session::new();
    session
        .set_auth(
            AuthMethod::Plain,
            "bob@test.example".parse().unwrap(),
            "secret".to_string(),
        )
        .unwrap();
    session
        .connect_tcp("127.0.0.1", None, test_options(port))
        .expect("connect_tcp should succeed before authentication");

    let jid = session
        .login(None, Some(Duration::from_secs(2)))
        .expect("SASL PLAIN login should succeed");
    assert_eq!(jid.to_string(), "bob@test.example/laptop");

    server.join().unwrap();
}

/// Scenario S5: a SASL failure surfaces as an `Auth` error and leaves the
/// session usable for a retry rather than tearing down the stream.
#[test]
fn sasl_failure_is_reported_and_stream_stays_usable() {
    let (port, server) = fake_server(|mut stream| {
        let _opening = read_chunk(&mut stream);
        write_all(
            &mut stream,
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s5' from='test.example' version='1.0'>\
             <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        );

        let _auth = read_chunk(&mut stream);
        write_all(
            &mut stream,
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        );
        // Keep the connection open; a real server would let the client retry.
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink);
    });

    let session = Session::new();
    session
        .set_auth(
            AuthMethod::Plain,
            "carol@test.example".parse().unwrap(),
            "wrong".to_string(),
        )
        .unwrap();
    session
        .connect_tcp("127.0.0.1", None, test_options(port))
        .expect("connect_tcp should succeed");

    let result = session.login(None, Some(Duration::from_secs(2)));
    assert!(matches!(
        result,
        Err(xmpp_session_core::Error::Auth(
            xmpp_session_core::error::AuthError::Fail(_)
        ))
    ));

    session.stop().ok();
    drop(server);
}
