//! SASL mechanism driver (spec §4.3, component C3).
//!
//! For PLAIN and ANONYMOUS this is a thin wrapper over the `sasl` crate's
//! `Mechanism` trait, the same one the teacher drives in `client/login.rs`'s
//! `auth()` loop. DIGEST-MD5 isn't implemented upstream, so it's driven
//! through our own [`crate::digest_md5::DigestMd5`].

use sasl::client::mechanisms::{Anonymous, Plain};
use sasl::client::Mechanism as SaslMechanism;
use sasl::common::Credentials;

use crate::digest_md5::{DigestMd5, StepResult as DigestStep};
use crate::error::AuthError;

/// Outcome of feeding a server challenge to the mechanism driver.
pub enum Step {
    /// Send this response and keep waiting for either another challenge or
    /// `<success/>`/`<failure/>`.
    Continue(Vec<u8>),
    /// The mechanism has nothing further to send; the next server message
    /// determines success or failure.
    Done,
}

enum Inner {
    Plain(Plain),
    Anonymous(Anonymous),
    DigestMd5(DigestMd5),
}

/// Drives one SASL mechanism across however many challenge/response rounds
/// it needs.
pub struct SaslDriver {
    inner: Inner,
}

impl SaslDriver {
    /// Mechanism names this driver can produce, in client preference order
    /// (spec §4.3 lists PLAIN, ANONYMOUS, DIGEST-MD5 as the required set).
    pub const SUPPORTED: &'static [&'static str] = &["DIGEST-MD5", "PLAIN", "ANONYMOUS"];

    /// Build a driver for `mechanism`, given the credentials and target
    /// domain. Returns `None` if the mechanism name isn't recognized.
    pub fn init(mechanism: &str, username: &str, domain: &str, password: &str) -> Option<Self> {
        let inner = match mechanism {
            "PLAIN" => {
                let creds = Credentials::default()
                    .with_username(username)
                    .with_password(password);
                Inner::Plain(Plain::from_credentials(creds).ok()?)
            }
            "ANONYMOUS" => Inner::Anonymous(Anonymous::new()),
            "DIGEST-MD5" => Inner::DigestMd5(DigestMd5::new(username, domain, password)),
            _ => return None,
        };
        Some(SaslDriver { inner })
    }

    /// The wire name of the mechanism in use, for the `<auth mechanism=.../>`
    /// attribute.
    pub fn name(&self) -> &'static str {
        match &self.inner {
            Inner::Plain(_) => "PLAIN",
            Inner::Anonymous(_) => "ANONYMOUS",
            Inner::DigestMd5(_) => "DIGEST-MD5",
        }
    }

    /// Payload for the initial `<auth/>` element.
    pub fn initial_response(&mut self) -> Vec<u8> {
        match &mut self.inner {
            Inner::Plain(m) => m.initial(),
            Inner::Anonymous(m) => m.initial(),
            Inner::DigestMd5(m) => m.initial_response(),
        }
    }

    /// Consume one base64-decoded `<challenge/>` payload from the server.
    pub fn step(&mut self, challenge: &[u8]) -> Result<Step, AuthError> {
        match &mut self.inner {
            Inner::Plain(m) => m
                .response(challenge)
                .map(Step::Continue)
                .map_err(|e| AuthError::Sasl(e.to_string())),
            Inner::Anonymous(m) => m
                .response(challenge)
                .map(Step::Continue)
                .map_err(|e| AuthError::Sasl(e.to_string())),
            Inner::DigestMd5(m) => match m.step(challenge)? {
                DigestStep::Continue(bytes) => Ok(Step::Continue(bytes)),
                DigestStep::Done => Ok(Step::Done),
            },
        }
    }
}
