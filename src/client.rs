// src/client.rs
//! Binding client: one foreground transaction driving send, timeout,
//! retransmission with bounded increasing backoff, and the long-term
//! credential challenge-response, over any already-connected byte stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{AuthError, ProtocolError, StunError, StunResult};
use crate::msg::attribute::{
    CODE_STALE_NONCE, CODE_UNAUTHORIZED, ERROR_CODE, MESSAGE_INTEGRITY, NONCE, REALM,
    XOR_MAPPED_ADDRESS,
};
use crate::msg::auth::compute_integrity;
use crate::msg::{Attribute, Message, MessageClass, MessageType};

/// Retransmission policy for a client transaction.
///
/// A value object handed to the client constructor; there is no process-wide
/// timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Initial retransmission timeout.
    pub rto: Duration,
    /// Retransmission count before the terminal wait.
    pub rc: u32,
    /// Multiplier for the terminal wait (`prev + rto * rm`).
    pub rm: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rto: Duration::from_millis(500),
            rc: 7,
            rm: 16,
        }
    }
}

/// Long-term credential state on the client side.
///
/// `realm` and `nonce` start absent and are captured from the server's first
/// challenge, then reused for every subsequent request on this credential
/// set until a new challenge replaces them.
#[derive(Debug, Clone)]
pub struct Credentials {
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<Vec<u8>>,
}

impl Credentials {
    /// Credentials for a username/password pair, with no realm or nonce yet.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: None,
            nonce: None,
        }
    }
}

enum Outcome {
    Mapped(SocketAddr),
    Challenge {
        realm: Option<String>,
        nonce: Option<Vec<u8>>,
    },
}

/// Binding client.
///
/// Drives at most one foreground transaction at a time (`&mut self` enforces
/// the single-writer invariant); a background task owns the read side of the
/// connection and forwards decoded messages through a depth-1 channel.
pub struct Client {
    policy: RetryPolicy,
    rto: Duration,
    credentials: Option<Credentials>,
    outstanding: Arc<AtomicUsize>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Client with the default retransmission policy and no credentials.
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    /// Client with a custom retransmission policy.
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rto: policy.rto,
            credentials: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach long-term credentials for challenge-response authentication.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Transactions currently in flight. Accounting only; the reference
    /// design runs one foreground transaction per client.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Current adaptive RTO baseline.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Connect to `server` over TCP and run one binding exchange.
    pub async fn connect_tcp(&mut self, server: &str) -> StunResult<SocketAddr> {
        let conn = TcpStream::connect(server).await?;
        debug!(server, "connected");
        self.bind(conn).await
    }

    /// Run one binding exchange over an already-connected stream, returning
    /// the reflexive address the server sees.
    pub async fn bind<S>(&mut self, conn: S) -> StunResult<SocketAddr>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(conn);
        let (tx, mut rx) = mpsc::channel(1);
        let reader = tokio::spawn(read_loop(read_half, tx));

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let result = self.run_exchange(&mut write_half, &mut rx).await;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        reader.abort();
        result
    }

    async fn run_exchange<W>(
        &mut self,
        out: &mut W,
        responses: &mut mpsc::Receiver<Message>,
    ) -> StunResult<SocketAddr>
    where
        W: AsyncWrite + Unpin,
    {
        let mut request = self.build_request()?;
        let mut authenticated = request.attribute(MESSAGE_INTEGRITY).is_some();

        loop {
            match self.run_transaction(&request, out, responses).await? {
                Outcome::Mapped(addr) => return Ok(addr),
                Outcome::Challenge { realm, nonce } => {
                    // Exactly one re-authentication attempt: a challenge
                    // after credentials were attached is a hard failure.
                    if authenticated {
                        return Err(AuthError::InvalidCredentials.into());
                    }
                    let Some(creds) = self.credentials.as_mut() else {
                        return Err(AuthError::InvalidCredentials.into());
                    };
                    let (Some(realm), Some(nonce)) = (realm, nonce) else {
                        return Err(ProtocolError::MalformedServerResponse(
                            "challenge without REALM and NONCE",
                        )
                        .into());
                    };
                    debug!(%realm, "challenged, retrying with credentials");
                    creds.realm = Some(realm);
                    creds.nonce = Some(nonce);
                    request = self.build_request()?;
                    authenticated = true;
                }
            }
        }
    }

    /// One send/retransmit cycle for a single request.
    async fn run_transaction<W>(
        &mut self,
        request: &Message,
        out: &mut W,
        responses: &mut mpsc::Receiver<Message>,
    ) -> StunResult<Outcome>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = request.encode();
        let tid = *request.transaction_id();

        out.write_all(&bytes).await?;
        debug!(%tid, "sent binding request");

        let mut attempt: u32 = 0;
        let mut current = self.rto;
        let timer = sleep(current);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = &mut timer => {
                    attempt += 1;
                    if attempt > self.policy.rc {
                        warn!(%tid, "server timed out");
                        return Err(StunError::ServerTimedOut { attempts: attempt });
                    }
                    current = if attempt < self.policy.rc {
                        current * 2 + self.rto
                    } else {
                        current + self.rto * self.policy.rm
                    };
                    debug!(%tid, attempt, "no response, retransmitting; next wait {:?}", current);
                    // Identical bytes: same transaction id, never
                    // re-randomized.
                    out.write_all(&bytes).await?;
                    timer.as_mut().reset(Instant::now() + current);
                }
                response = responses.recv() => {
                    let Some(response) = response else {
                        return Err(StunError::Transport(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed while awaiting response",
                        )));
                    };
                    if *response.transaction_id() != tid {
                        debug!("ignoring response for foreign transaction {}", response.transaction_id());
                        continue;
                    }
                    // Adopt the timeout in effect at receipt as the new
                    // baseline for this client.
                    self.rto = current;
                    return self.classify(response);
                }
            }
        }
    }

    fn classify(&self, response: Message) -> StunResult<Outcome> {
        if !matches!(
            response.msg_type().class(),
            MessageClass::SuccessResponse | MessageClass::ErrorResponse
        ) {
            return Err(ProtocolError::UnexpectedMessageType(response.msg_type().as_u16()).into());
        }

        if let Some(Attribute::ErrorCode { code, .. }) = response.attribute(ERROR_CODE) {
            if matches!(*code, CODE_UNAUTHORIZED | CODE_STALE_NONCE) {
                let realm = match response.attribute(REALM) {
                    Some(Attribute::Realm(realm)) => Some(realm.clone()),
                    _ => None,
                };
                let nonce = match response.attribute(NONCE) {
                    Some(Attribute::Nonce(nonce)) => Some(nonce.clone()),
                    _ => None,
                };
                return Ok(Outcome::Challenge { realm, nonce });
            }
            return Err(ProtocolError::MalformedServerResponse("unexpected error code").into());
        }

        if let Some(Attribute::XorMappedAddress(addr)) = response.attribute(XOR_MAPPED_ADDRESS) {
            debug!(%addr, "binding succeeded");
            return Ok(Outcome::Mapped(*addr));
        }

        Err(ProtocolError::MalformedServerResponse("no XOR-MAPPED-ADDRESS or challenge").into())
    }

    /// Build the binding request. Credentials are attached only once a
    /// challenge has supplied realm and nonce; MESSAGE-INTEGRITY goes last
    /// so its digest covers the authentication attributes.
    fn build_request(&self) -> StunResult<Message> {
        let mut request = Message::new_request(MessageType::BINDING_REQUEST);
        if let Some(creds) = &self.credentials {
            if let (Some(realm), Some(nonce)) = (&creds.realm, &creds.nonce) {
                request.add_attribute(Attribute::username(&creds.username)?);
                request.add_attribute(Attribute::realm(realm)?);
                request.add_attribute(Attribute::nonce(nonce.clone()));
                let mac = compute_integrity(&creds.username, &creds.password, realm, &request);
                request.add_attribute(Attribute::message_integrity(mac));
            }
        }
        Ok(request)
    }
}

/// Background read loop: decode messages off the connection and forward
/// them to the foreground.
///
/// A corrupt frame from a misbehaving peer must not end the ability to
/// receive the eventual well-formed reply, so framing errors are logged and
/// skipped; only transport errors (including EOF) end the loop. On a stream
/// transport a corrupt length field can desynchronize everything after it -
/// this is best effort, there is no resync marker beyond the cookie check.
async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Message>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match Message::decode(&mut reader).await {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(StunError::Transport(e)) => {
                debug!("read loop ending: {e}");
                return;
            }
            Err(e) => warn!("dropping undecodable frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_protocol_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rto, Duration::from_millis(500));
        assert_eq!(policy.rc, 7);
        assert_eq!(policy.rm, 16);
    }

    #[test]
    fn unauthenticated_request_is_bare() {
        let client = Client::new().with_credentials(Credentials::new("alice", "secret"));
        let request = client.build_request().unwrap();
        assert!(request.attributes().is_empty());
    }

    #[test]
    fn challenged_request_carries_auth_attributes_in_order() {
        let mut creds = Credentials::new("alice", "secret");
        creds.realm = Some("example.org".into());
        creds.nonce = Some(vec![8; 8]);
        let client = Client::new().with_credentials(creds);

        let request = client.build_request().unwrap();
        let types: Vec<u16> = request.attributes().iter().map(|a| a.attr_type()).collect();
        assert_eq!(
            types,
            vec![
                crate::msg::attribute::USERNAME,
                REALM,
                NONCE,
                MESSAGE_INTEGRITY
            ]
        );
        // The digest covers everything before it.
        assert_eq!(
            crate::msg::auth::verify_integrity("alice", "secret", "example.org", &request),
            crate::msg::auth::IntegrityOutcome::Valid
        );
    }
}
