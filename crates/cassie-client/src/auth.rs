//! Pluggable SASL authentication.
//!
//! When the server answers STARTUP with AUTHENTICATE, the connection asks the
//! configured [`Authenticator`] for a session and exchanges tokens until the
//! server sends AUTH_SUCCESS.

use std::fmt::Debug;

use crate::error::Error;

/// Creates a per-connection authentication session.
pub trait Authenticator: Send + Sync + Debug {
    /// Start a session for the server-side authenticator `class_name`.
    fn new_session(&self, class_name: &str) -> Result<Box<dyn AuthSession>, Error>;
}

/// One SASL exchange.
pub trait AuthSession: Send {
    /// Token sent in the first AUTH_RESPONSE.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, Error>;

    /// Answer an AUTH_CHALLENGE.
    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error>;

    /// Called with the final AUTH_SUCCESS token.
    fn on_success(&mut self, _token: Option<&[u8]>) -> Result<(), Error> {
        Ok(())
    }
}

/// Username/password authentication using the SASL PLAIN mechanism.
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn new_session(&self, class_name: &str) -> Result<Box<dyn AuthSession>, Error> {
        tracing::debug!(authenticator = class_name, "starting plain text authentication");
        Ok(Box::new(PlainTextSession {
            token: plain_token(&self.username, &self.password),
            sent: false,
        }))
    }
}

struct PlainTextSession {
    token: Vec<u8>,
    sent: bool,
}

impl AuthSession for PlainTextSession {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.sent = true;
        Ok(Some(self.token.clone()))
    }

    fn evaluate_challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        // PLAIN is a single round trip; a second challenge means the server
        // expects a mechanism we do not speak.
        if self.sent {
            return Err(Error::Authentication(
                "unexpected challenge for plain text authentication".to_string(),
            ));
        }
        self.initial_response()
    }
}

/// `\0username\0password`
fn plain_token(username: &str, password: &str) -> Vec<u8> {
    let mut token = Vec::with_capacity(username.len() + password.len() + 2);
    token.push(0);
    token.extend_from_slice(username.as_bytes());
    token.push(0);
    token.extend_from_slice(password.as_bytes());
    token
}
