// tests/integration_tests.rs
//! End-to-end client/server exchanges over in-memory duplex streams.
//!
//! These cover the wire-visible behavior of both state machines: the server
//! validation ladder, the signed success response, the client's
//! retransmission schedule, and the single re-authentication attempt.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use gust::msg::attribute::{
    CODE_BAD_REQUEST, CODE_STALE_NONCE, CODE_UNAUTHORIZED, ERROR_CODE, MESSAGE_INTEGRITY, NONCE,
    REALM, USERNAME, XOR_MAPPED_ADDRESS,
};
use gust::msg::auth::{compute_integrity, verify_integrity, IntegrityOutcome};
use gust::{
    Attribute, AuthError, Client, Connection, Credentials, Message, MessageClass, MessageType,
    NonceIssuer, Server, StunError,
};

const REALM_NAME: &str = "gust.example";

fn peer() -> SocketAddr {
    "198.51.100.7:45000".parse().unwrap()
}

fn user_table() -> HashMap<String, String> {
    [("user", "password")]
        .into_iter()
        .map(|(u, p)| (u.to_owned(), p.to_owned()))
        .collect()
}

fn auth_server() -> (Server, mpsc::Receiver<Connection>) {
    let (tx, rx) = mpsc::channel(4);
    let server = Server::new(REALM_NAME, tx).with_authenticator(Arc::new(user_table()));
    (server, rx)
}

fn spawn_server(server: Server, stream: DuplexStream) {
    tokio::spawn(async move {
        let _ = server.handle(stream, peer()).await;
    });
}

/// A request carrying the full long-term credential attribute set, signed
/// over everything that precedes the digest.
fn signed_request(username: &str, password: &str, realm: &str, nonce: Vec<u8>) -> Message {
    let mut request = Message::new_request(MessageType::BINDING_REQUEST);
    request.add_attribute(Attribute::username(username).unwrap());
    request.add_attribute(Attribute::realm(realm).unwrap());
    request.add_attribute(Attribute::nonce(nonce));
    let mac = compute_integrity(username, password, realm, &request);
    request.add_attribute(Attribute::message_integrity(mac));
    request
}

fn expired_nonce() -> Vec<u8> {
    let past = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - 10;
    past.to_be_bytes().to_vec()
}

/// Send one request and decode the single response to it.
async fn exchange(server: Server, request: &Message) -> Message {
    let (client_end, server_end) = tokio::io::duplex(4096);
    spawn_server(server, server_end);

    let (mut read, mut write) = tokio::io::split(client_end);
    write.write_all(&request.encode()).await.unwrap();
    Message::decode(&mut read).await.unwrap()
}

fn error_code(response: &Message) -> (u16, String) {
    match response.attribute(ERROR_CODE) {
        Some(Attribute::ErrorCode { code, reason }) => (*code, reason.clone()),
        other => panic!("expected ERROR-CODE, got {other:?}"),
    }
}

#[tokio::test]
async fn open_binding_returns_peer_address() {
    let (tx, mut rx) = mpsc::channel(4);
    let server = Server::new(REALM_NAME, tx);
    let (client_end, server_end) = tokio::io::duplex(4096);
    spawn_server(server, server_end);

    let mut client = Client::new();
    let mapped = client.bind(client_end).await.unwrap();
    assert_eq!(mapped, peer());
    assert_eq!(client.outstanding(), 0);

    let conn = rx.recv().await.unwrap();
    assert!(!conn.authenticated);
    assert_eq!(conn.peer, peer());
}

#[tokio::test]
async fn full_credential_handshake() {
    let (server, mut rx) = auth_server();
    let (client_end, server_end) = tokio::io::duplex(4096);
    spawn_server(server, server_end);

    let mut client = Client::new().with_credentials(Credentials::new("user", "password"));
    let mapped = client.bind(client_end).await.unwrap();
    assert_eq!(mapped, peer());

    let conn = rx.recv().await.unwrap();
    assert!(conn.authenticated);
    assert_eq!(conn.username, "user");
    assert_eq!(conn.realm, REALM_NAME);
}

#[tokio::test]
async fn missing_integrity_gets_challenge_with_fresh_nonce() {
    let (server, _rx) = auth_server();

    // Username, realm, and a client-chosen nonce, but no MESSAGE-INTEGRITY.
    let mut request = Message::new_request(MessageType::BINDING_REQUEST);
    request.add_attribute(Attribute::username("user").unwrap());
    request.add_attribute(Attribute::realm(REALM_NAME).unwrap());
    let client_nonce = vec![0x11; 8];
    request.add_attribute(Attribute::nonce(client_nonce.clone()));

    let response = exchange(server, &request).await;
    assert_eq!(response.msg_type(), MessageType::BINDING_ERROR);
    assert_eq!(response.transaction_id(), request.transaction_id());
    assert_eq!(error_code(&response), (CODE_UNAUTHORIZED, "Unauthorized".into()));

    assert_eq!(
        response.attribute(REALM),
        Some(&Attribute::Realm(REALM_NAME.into()))
    );
    match response.attribute(NONCE) {
        Some(Attribute::Nonce(nonce)) => {
            assert_ne!(nonce, &client_nonce);
            assert!(NonceIssuer::is_valid(nonce));
        }
        other => panic!("expected fresh NONCE, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_nonce_gets_bare_bad_request() {
    let (server, _rx) = auth_server();

    let mut request = Message::new_request(MessageType::BINDING_REQUEST);
    request.add_attribute(Attribute::username("user").unwrap());
    request.add_attribute(Attribute::realm(REALM_NAME).unwrap());
    let mac = compute_integrity("user", "password", REALM_NAME, &request);
    request.add_attribute(Attribute::message_integrity(mac));

    let response = exchange(server, &request).await;
    assert_eq!(response.msg_type(), MessageType::BINDING_ERROR);
    assert_eq!(error_code(&response).0, CODE_BAD_REQUEST);
    assert_eq!(response.attribute(REALM), None);
    assert_eq!(response.attribute(NONCE), None);
}

#[tokio::test]
async fn unknown_user_gets_user_not_found() {
    let (server, _rx) = auth_server();
    let request = signed_request(
        "mallory",
        "password",
        REALM_NAME,
        NonceIssuer::default().mint(),
    );

    let response = exchange(server, &request).await;
    assert_eq!(
        error_code(&response),
        (CODE_UNAUTHORIZED, "User Not Found".into())
    );
    assert!(response.attribute(REALM).is_some());
    assert!(response.attribute(NONCE).is_some());
}

#[tokio::test]
async fn expired_nonce_gets_stale_nonce() {
    let (server, _rx) = auth_server();
    let request = signed_request("user", "password", REALM_NAME, expired_nonce());

    let response = exchange(server, &request).await;
    assert_eq!(error_code(&response), (CODE_STALE_NONCE, "Stale Nonce".into()));
    match response.attribute(NONCE) {
        Some(Attribute::Nonce(nonce)) => assert!(NonceIssuer::is_valid(nonce)),
        other => panic!("expected fresh NONCE, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_password_gets_unauthorized() {
    let (server, _rx) = auth_server();
    let request = signed_request(
        "user",
        "not-the-password",
        REALM_NAME,
        NonceIssuer::default().mint(),
    );

    let response = exchange(server, &request).await;
    assert_eq!(error_code(&response), (CODE_UNAUTHORIZED, "Unauthorized".into()));
}

#[tokio::test]
async fn valid_request_gets_signed_success() {
    let (server, mut rx) = auth_server();
    let request = signed_request("user", "password", REALM_NAME, NonceIssuer::default().mint());

    let response = exchange(server, &request).await;
    assert_eq!(response.msg_type(), MessageType::BINDING_RESPONSE);
    assert_eq!(response.transaction_id(), request.transaction_id());
    assert_eq!(
        response.attribute(XOR_MAPPED_ADDRESS),
        Some(&Attribute::XorMappedAddress(peer()))
    );
    // The response is independently verifiable with the same credentials.
    assert_eq!(
        verify_integrity("user", "password", REALM_NAME, &response),
        IntegrityOutcome::Valid
    );

    let conn = rx.recv().await.unwrap();
    assert!(conn.authenticated);
    assert_eq!(conn.password, "password");
}

#[tokio::test]
async fn unrecognized_message_goes_to_sink() {
    let (server, mut rx) = auth_server();
    let odd_type = MessageType::from_parts(0x002, MessageClass::Request).unwrap();
    let request = Message::new_request(odd_type);

    let (client_end, server_end) = tokio::io::duplex(4096);
    spawn_server(server, server_end);
    let (mut read, mut write) = tokio::io::split(client_end);
    write.write_all(&request.encode()).await.unwrap();

    let mut conn = rx.recv().await.unwrap();
    assert_eq!(conn.request.msg_type(), odd_type);
    assert!(!conn.authenticated);

    // The record still owns the write side for out-of-band replies.
    let mut reply = Message::new_response(MessageType::BINDING_ERROR, &conn.request);
    reply.add_attribute(Attribute::error_code(400, "Bad Request").unwrap());
    conn.write(&reply).await.unwrap();

    let seen = Message::decode(&mut read).await.unwrap();
    assert_eq!(seen.transaction_id(), request.transaction_id());
}

#[tokio::test]
async fn reader_survives_a_corrupt_frame() {
    let (client_end, server_end) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(server_end);
        let request = Message::decode(&mut read).await.unwrap();

        // 20 bytes of junk: the cookie check fails, the reader drops the
        // frame and stays on the stream.
        write.write_all(&[0u8; 20]).await.unwrap();

        let mut response = Message::new_response(MessageType::BINDING_RESPONSE, &request);
        response.add_attribute(Attribute::xor_mapped_address(peer()));
        write.write_all(&response.encode()).await.unwrap();
    });

    let mut client = Client::new();
    let mapped = client.bind(client_end).await.unwrap();
    assert_eq!(mapped, peer());
}

#[tokio::test(start_paused = true)]
async fn retransmission_schedule_and_timeout() {
    let (client_end, server_end) = tokio::io::duplex(4096);

    // Silent server: record when each retransmission lands.
    let (times_tx, mut times_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut read, _write) = tokio::io::split(server_end);
        while let Ok(message) = Message::decode(&mut read).await {
            let _ = times_tx.send((Instant::now(), *message.transaction_id()));
        }
    });

    let start = Instant::now();
    let mut client = Client::new();
    let err = client.bind(client_end).await.unwrap_err();
    assert!(matches!(err, StunError::ServerTimedOut { attempts: 8 }));
    assert_eq!(Instant::now() - start, Duration::from_millis(195_000));

    let mut sends = Vec::new();
    while let Some(entry) = times_rx.recv().await {
        sends.push(entry);
    }

    // Rc retransmissions plus the initial send.
    assert_eq!(sends.len(), 8);
    // Identical bytes every time: the transaction id is never re-randomized.
    assert!(sends.iter().all(|(_, tid)| *tid == sends[0].1));
    // next = prev*2 + RTO, then one final wait of prev + RTO*16.
    let offsets: Vec<u64> = sends
        .iter()
        .map(|(t, _)| (*t - start).as_millis() as u64)
        .collect();
    assert_eq!(offsets, vec![0, 500, 2_000, 5_500, 13_000, 28_500, 60_000, 123_500]);
}

#[tokio::test]
async fn client_reauthenticates_exactly_once() {
    let (client_end, server_end) = tokio::io::duplex(4096);

    // A server that challenges every request, valid credentials or not.
    let script = tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(server_end);
        let mut seen = Vec::new();
        for _ in 0..2 {
            let request = Message::decode(&mut read).await.unwrap();
            let mut response = Message::new_response(MessageType::BINDING_ERROR, &request);
            response.add_attribute(Attribute::error_code(401, "Unauthorized").unwrap());
            response.add_attribute(Attribute::realm(REALM_NAME).unwrap());
            response.add_attribute(Attribute::nonce(vec![0xAB; 8]));
            write.write_all(&response.encode()).await.unwrap();
            seen.push(request);
        }
        let third = Message::decode(&mut read).await;
        (seen, third.is_ok())
    });

    let mut client = Client::new().with_credentials(Credentials::new("user", "password"));
    let err = client.bind(client_end).await.unwrap_err();
    assert!(matches!(err, StunError::Auth(AuthError::InvalidCredentials)));

    let (seen, got_third) = script.await.unwrap();
    assert!(!got_third, "client must not send a third request");

    let first = &seen[0];
    let second = &seen[1];
    assert!(first.attribute(MESSAGE_INTEGRITY).is_none());

    // The retry is a fresh transaction carrying the challenge's realm and
    // nonce plus a digest that verifies against the credentials.
    assert_ne!(second.transaction_id(), first.transaction_id());
    assert_eq!(
        second.attribute(USERNAME),
        Some(&Attribute::Username("user".into()))
    );
    assert_eq!(
        second.attribute(REALM),
        Some(&Attribute::Realm(REALM_NAME.into()))
    );
    assert_eq!(
        second.attribute(NONCE),
        Some(&Attribute::Nonce(vec![0xAB; 8]))
    );
    assert_eq!(
        verify_integrity("user", "password", REALM_NAME, second),
        IntegrityOutcome::Valid
    );
}
