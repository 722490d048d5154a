// src/server.rs
//! Binding server: per-connection request validation pipeline.
//!
//! Each accepted connection is handled by its own task and carries one
//! completed request/response exchange; challenge rounds stay on the same
//! connection so the client can re-authenticate. Tasks share nothing
//! mutable - the authenticator is a read-only lookup and completed
//! [`Connection`] records leave through a multi-producer channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AuthError, StunResult};
use crate::msg::attribute::{
    CODE_BAD_REQUEST, CODE_STALE_NONCE, CODE_UNAUTHORIZED, MESSAGE_INTEGRITY, NONCE, REALM,
    USERNAME,
};
use crate::msg::auth::{compute_integrity, verify_integrity, IntegrityOutcome, NonceIssuer};
use crate::msg::{Attribute, Message, MessageType};

/// Injected credential lookup: the long-term password for a username.
pub trait Authenticator: Send + Sync {
    /// Password for `username`, or `None` for an unknown user.
    fn password_for(&self, username: &str) -> Option<String>;
}

/// A plain user table is a perfectly good authenticator.
impl Authenticator for HashMap<String, String> {
    fn password_for(&self, username: &str) -> Option<String> {
        self.get(username).cloned()
    }
}

/// A completed exchange handed to the collaborator sink: the decoded
/// request, the write side of the connection, the peer address, and the
/// resolved credentials when authentication ran.
pub struct Connection {
    /// The decoded inbound request.
    pub request: Message,
    /// Write side of the connection, for out-of-band replies.
    pub out: Box<dyn AsyncWrite + Send + Unpin>,
    /// Peer address as seen by the transport.
    pub peer: SocketAddr,
    /// Resolved username, empty if authentication did not run.
    pub username: String,
    /// Resolved password, empty if authentication did not run.
    pub password: String,
    /// Resolved realm, empty if authentication did not run.
    pub realm: String,
    /// Whether the request passed credential validation.
    pub authenticated: bool,
}

impl Connection {
    /// Write a message back to the peer.
    pub async fn write(&mut self, message: &Message) -> StunResult<()> {
        self.out.write_all(&message.encode()).await?;
        Ok(())
    }
}

/// Binding server.
pub struct Server {
    realm: String,
    authenticator: Option<Arc<dyn Authenticator>>,
    nonces: NonceIssuer,
    connections: mpsc::Sender<Connection>,
}

impl Server {
    /// Server without authentication: every binding request succeeds.
    /// Completed connections are handed to `connections`.
    pub fn new(realm: impl Into<String>, connections: mpsc::Sender<Connection>) -> Self {
        Self {
            realm: realm.into(),
            authenticator: None,
            nonces: NonceIssuer::default(),
            connections,
        }
    }

    /// Require long-term credential authentication via `authenticator`.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Override the nonce lifetime (default 60 seconds).
    pub fn with_nonce_lifetime(mut self, lifetime: Duration) -> Self {
        self.nonces = NonceIssuer::new(lifetime);
        self
    }

    /// Accept loop: one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> StunResult<()> {
        info!(realm = %self.realm, "listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, peer).await {
                    warn!(%peer, "connection handling failed: {e}");
                }
            });
        }
    }

    /// Handle one completed exchange on an accepted stream.
    ///
    /// A decode failure ends the exchange without a reply - the frame could
    /// not be parsed well enough to know where to address one. Rejections
    /// keep the stream open: the client re-authenticates over the same
    /// connection, so the loop only terminates on a completed exchange.
    pub async fn handle<S>(&self, stream: S, peer: SocketAddr) -> StunResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let mut out: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        loop {
            let request = Message::decode(&mut read_half).await?;
            debug!(%peer, "received {}", request.header());

            if request.msg_type() != MessageType::BINDING_REQUEST {
                debug!(%peer, "unrecognized message type {}", request.msg_type());
                self.hand_off(Connection {
                    request,
                    out,
                    peer,
                    username: String::new(),
                    password: String::new(),
                    realm: String::new(),
                    authenticated: false,
                })
                .await;
                return Ok(());
            }

            let Some(authenticator) = self.authenticator.as_deref() else {
                let mut response = Message::new_response(MessageType::BINDING_RESPONSE, &request);
                response.add_attribute(Attribute::xor_mapped_address(peer));
                out.write_all(&response.encode()).await?;
                debug!(%peer, "bound without authentication");
                self.hand_off(Connection {
                    request,
                    out,
                    peer,
                    username: String::new(),
                    password: String::new(),
                    realm: String::new(),
                    authenticated: false,
                })
                .await;
                return Ok(());
            };

            match self.validate(&request, authenticator) {
                Err(rejection) => {
                    debug!(%peer, "rejecting request: {rejection}");
                    let response = self.rejection_response(&request, &rejection)?;
                    out.write_all(&response.encode()).await?;
                }
                Ok((username, password, realm)) => {
                    let mut response =
                        Message::new_response(MessageType::BINDING_RESPONSE, &request);
                    response.add_attribute(Attribute::xor_mapped_address(peer));
                    let mac = compute_integrity(&username, &password, &realm, &response);
                    response.add_attribute(Attribute::message_integrity(mac));
                    out.write_all(&response.encode()).await?;
                    debug!(%peer, %username, "bound with valid credentials");
                    self.hand_off(Connection {
                        request,
                        out,
                        peer,
                        username,
                        password,
                        realm,
                        authenticated: true,
                    })
                    .await;
                    return Ok(());
                }
            }
        }
    }

    /// The validation ladder. Order matters: absence of MESSAGE-INTEGRITY
    /// is a challenge, a malformed credential set is a bad request, and
    /// only then are user, nonce, and digest checked.
    fn validate(
        &self,
        request: &Message,
        authenticator: &dyn Authenticator,
    ) -> Result<(String, String, String), AuthError> {
        if request.attribute(MESSAGE_INTEGRITY).is_none() {
            return Err(AuthError::MissingAttribute("MESSAGE-INTEGRITY"));
        }

        let username = match request.attribute(USERNAME) {
            Some(Attribute::Username(username)) => username.clone(),
            _ => return Err(AuthError::MissingAttribute("USERNAME")),
        };
        let realm = match request.attribute(REALM) {
            Some(Attribute::Realm(realm)) => realm.clone(),
            _ => return Err(AuthError::MissingAttribute("REALM")),
        };
        let nonce = match request.attribute(NONCE) {
            Some(Attribute::Nonce(nonce)) => nonce,
            _ => return Err(AuthError::MissingAttribute("NONCE")),
        };

        let Some(password) = authenticator.password_for(&username) else {
            return Err(AuthError::UnknownUser(username));
        };

        if !NonceIssuer::is_valid(nonce) {
            return Err(AuthError::StaleNonce);
        }

        match verify_integrity(&username, &password, &realm, request) {
            IntegrityOutcome::Valid => Ok((username, password, realm)),
            _ => Err(AuthError::BadIntegrity),
        }
    }

    /// Build the error response for a rejection.
    ///
    /// A missing MESSAGE-INTEGRITY is the challenge (401); a missing
    /// credential attribute is a bad request (400) and carries nothing
    /// else. Every other path re-attaches the realm and a fresh nonce so
    /// the client can re-authenticate without an out-of-band realm
    /// exchange; the client's own nonce is never echoed back.
    fn rejection_response(&self, request: &Message, rejection: &AuthError) -> StunResult<Message> {
        let mut response = Message::new_response(MessageType::BINDING_ERROR, request);
        let (code, reason) = match rejection {
            AuthError::MissingAttribute("MESSAGE-INTEGRITY") | AuthError::BadIntegrity => {
                (CODE_UNAUTHORIZED, "Unauthorized")
            }
            AuthError::MissingAttribute(_) => (CODE_BAD_REQUEST, "Bad Request"),
            AuthError::UnknownUser(_) => (CODE_UNAUTHORIZED, "User Not Found"),
            AuthError::StaleNonce => (CODE_STALE_NONCE, "Stale Nonce"),
            AuthError::InvalidCredentials => (CODE_UNAUTHORIZED, "Unauthorized"),
        };
        response.add_attribute(Attribute::error_code(code, reason)?);
        if code != CODE_BAD_REQUEST {
            response.add_attribute(Attribute::realm(&self.realm)?);
            response.add_attribute(Attribute::nonce(self.nonces.mint()));
        }
        Ok(response)
    }

    async fn hand_off(&self, connection: Connection) {
        if self.connections.send(connection).await.is_err() {
            warn!("connection sink closed, dropping completed connection");
        }
    }
}
