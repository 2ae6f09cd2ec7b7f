//! Loopback TCP tests: both roles, trust gate, data, broadcast, and recovery from bad input.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keylink_core::crypto::dearmor_message;
use keylink_core::protocol::unix_time32;
use keylink_core::wire::frame_len;
use keylink_core::{
    encode_frame, Cipher, ConnectionId, CryptoError, KeyPair, Packet, PacketError, Payload,
    ProtocolError, SealedBox, Settings, PROTOCOL_VERSION,
};
use keylink_net::{
    Client, ClientSession, Listener, PeerHandle, SendError, Server, ServerEvent, SessionError,
    SessionEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn keys() -> KeyPair {
    SealedBox::generate(None).unwrap()
}

async fn listen(server: &Server) -> Listener {
    server.listen("127.0.0.1:0").await.unwrap()
}

async fn server_event(listener: &mut Listener) -> ServerEvent {
    timeout(WAIT, listener.next_event())
        .await
        .expect("timed out waiting for server event")
        .expect("listener closed")
}

async fn client_event(session: &mut ClientSession) -> SessionEvent {
    timeout(WAIT, session.next_event())
        .await
        .expect("timed out waiting for client event")
        .expect("session ended")
}

fn connection(event: SessionEvent) -> PeerHandle {
    match event {
        SessionEvent::Connection(peer) => peer,
        other => panic!("expected connection, got {other:?}"),
    }
}

fn protocol_error(event: SessionEvent) -> ProtocolError {
    match event {
        SessionEvent::Error(SessionError::Protocol(e)) => e,
        other => panic!("expected protocol error, got {other:?}"),
    }
}

fn payload(event: SessionEvent) -> Payload {
    match event {
        SessionEvent::Message(message) => message.payload,
        other => panic!("expected message, got {other:?}"),
    }
}

/// Connect a client and wait for both sides to finish key exchange.
async fn establish(
    client: &Client,
    listener: &mut Listener,
) -> (ClientSession, PeerHandle, PeerHandle) {
    let mut session = client.connect(listener.local_addr()).await.unwrap();
    let to_server = connection(client_event(&mut session).await);
    let tagged = server_event(listener).await;
    let to_client = connection(tagged.event);
    assert_eq!(to_client.id(), tagged.connection);
    (session, to_server, to_client)
}

async fn write_packet(stream: &mut TcpStream, packet: &[u8]) {
    stream.write_all(&encode_frame(packet).unwrap()).await.unwrap();
}

async fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut header = [0u8; 4];
    timeout(WAIT, stream.read_exact(&mut header))
        .await
        .expect("timed out reading frame")
        .unwrap();
    let mut body = vec![0u8; frame_len(header).unwrap()];
    stream.read_exact(&mut body).await.unwrap();
    Packet::decode(&body).unwrap()
}

fn handshake(version: u8) -> Vec<u8> {
    Packet::Handshake {
        version,
        timestamp: unix_time32(),
        latency: None,
    }
    .encode()
}

#[tokio::test]
async fn establishes_with_exchanged_keys() {
    let server_keys = keys();
    let client_keys = keys();
    let server = Server::new(Settings::new(server_keys.clone()));
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(client_keys.clone()));

    let (_session, to_server, to_client) = establish(&client, &mut listener).await;

    assert_eq!(to_server.public_key(), server_keys.public_key);
    assert_eq!(to_client.public_key(), client_keys.public_key);
    assert_eq!(
        to_client.fingerprint(),
        SealedBox.fingerprint(&client_keys.public_key).unwrap()
    );
    assert_eq!(server.connection_count().await, 1);
    assert_eq!(server.connections().await[0].id(), to_client.id());
}

#[tokio::test]
async fn text_and_binary_round_trip() {
    let server_keys = keys();
    let client_keys = keys();
    let server = Server::new(Settings::new(server_keys.clone()));
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(client_keys.clone()));
    let (mut session, to_server, to_client) = establish(&client, &mut listener).await;

    let armored = to_server.send_data("hello, server").unwrap();
    let sealed = dearmor_message(&armored).unwrap();
    assert_eq!(
        SealedBox.decrypt(&server_keys.private_key, None, &sealed).unwrap(),
        b"hello, server"
    );
    let received = server_event(&mut listener).await;
    assert_eq!(received.connection, to_client.id());
    assert_eq!(payload(received.event), Payload::Text("hello, server".into()));

    let bytes = [0u8, 1, 2, 254, 255];
    let sealed = to_client.send_binary_data(&bytes).unwrap();
    assert_eq!(
        SealedBox.decrypt(&client_keys.private_key, None, &sealed).unwrap(),
        bytes
    );
    assert_eq!(
        payload(client_event(&mut session).await),
        Payload::Binary(bytes.to_vec())
    );

    to_server.send_data("").unwrap();
    assert_eq!(
        payload(server_event(&mut listener).await.event),
        Payload::Text(String::new())
    );
}

#[tokio::test]
async fn pinned_list_rejects_unknown_client() {
    let server =
        Server::new(Settings::new(keys()).with_trusted_fingerprints(["DEADBEEF"]));
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(keys()));

    let mut session = client.connect(listener.local_addr()).await.unwrap();
    assert_eq!(
        protocol_error(client_event(&mut session).await),
        ProtocolError::PeerRejected
    );
    assert_eq!(server.connection_count().await, 0);

    session.close();
    assert!(matches!(
        client_event(&mut session).await,
        SessionEvent::Close
    ));
    // The rejecting side surfaces nothing but the close.
    assert!(matches!(
        server_event(&mut listener).await.event,
        SessionEvent::Close
    ));
}

#[tokio::test]
async fn pinned_list_is_case_insensitive() {
    let client_keys = keys();
    let fingerprint = SealedBox
        .fingerprint(&client_keys.public_key)
        .unwrap()
        .to_lowercase();
    let server = Server::new(Settings::new(keys()).with_trusted_fingerprints([fingerprint]));
    server.should_trust(|_| async { false });
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(client_keys));

    let (_session, _, _) = establish(&client, &mut listener).await;
    assert_eq!(server.connection_count().await, 1);
}

#[tokio::test]
async fn client_predicate_rejection_unwinds_server() {
    let server_keys = keys();
    let server = Server::new(Settings::new(server_keys.clone()));
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(keys()));
    let asked = Arc::new(Mutex::new(Vec::new()));
    let seen = asked.clone();
    client.should_trust(move |fingerprint| {
        seen.lock().unwrap().push(fingerprint);
        async { false }
    });

    let mut session = client.connect(listener.local_addr()).await.unwrap();
    let tagged = server_event(&mut listener).await;
    let to_client = connection(tagged.event);
    assert_eq!(
        protocol_error(server_event(&mut listener).await.event),
        ProtocolError::PeerRejected
    );
    assert_eq!(server.connection_count().await, 0);
    assert_eq!(
        *asked.lock().unwrap(),
        vec![SealedBox.fingerprint(&server_keys.public_key).unwrap()]
    );

    to_client.close();
    assert!(matches!(
        client_event(&mut session).await,
        SessionEvent::Close
    ));
}

#[tokio::test]
async fn async_predicate_accepts_after_suspension() {
    let server = Server::new(Settings::new(keys()));
    server.should_trust(|_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        true
    });
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(keys()));

    let (_session, to_server, _) = establish(&client, &mut listener).await;
    to_server.send_data("after trust").unwrap();
    assert_eq!(
        payload(server_event(&mut listener).await.event),
        Payload::Text("after trust".into())
    );
}

/// Decrypts with a delay that shrinks as the message index grows.
struct SlowCipher;

impl Cipher for SlowCipher {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        SealedBox.encrypt(public_key, plaintext)
    }

    fn decrypt(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plain = SealedBox.decrypt(private_key, passphrase, ciphertext)?;
        let index = plain.first().copied().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(u64::from(10 - index.min(10)) * 3));
        Ok(plain)
    }

    fn fingerprint(&self, public_key: &str) -> Result<String, CryptoError> {
        SealedBox.fingerprint(public_key)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_arrive_in_send_order() {
    let server = Server::new(Settings::new(keys())).with_cipher(Arc::new(SlowCipher));
    let mut listener = listen(&server).await;
    let client = Client::new(Settings::new(keys()));
    let (_session, to_server, _) = establish(&client, &mut listener).await;

    for i in 0..10u8 {
        to_server.send_binary_data(&[i]).unwrap();
    }
    for i in 0..10u8 {
        assert_eq!(
            payload(server_event(&mut listener).await.event),
            Payload::Binary(vec![i])
        );
    }
}

/// Refuses to encrypt to one public key.
struct FlakyCipher {
    poisoned: String,
}

impl Cipher for FlakyCipher {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if public_key == self.poisoned {
            return Err(CryptoError::Encrypt);
        }
        SealedBox.encrypt(public_key, plaintext)
    }

    fn decrypt(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        SealedBox.decrypt(private_key, passphrase, ciphertext)
    }

    fn fingerprint(&self, public_key: &str) -> Result<String, CryptoError> {
        SealedBox.fingerprint(public_key)
    }
}

#[tokio::test]
async fn broadcast_isolates_failing_recipient() {
    let poisoned = keys();
    let server = Server::new(Settings::new(keys())).with_cipher(Arc::new(FlakyCipher {
        poisoned: poisoned.public_key.clone(),
    }));
    let mut listener = listen(&server).await;

    let (mut a, _, to_a) = establish(&Client::new(Settings::new(keys())), &mut listener).await;
    let (mut b, _, to_b) = establish(&Client::new(Settings::new(poisoned)), &mut listener).await;
    let (mut c, _, to_c) = establish(&Client::new(Settings::new(keys())), &mut listener).await;

    let report = server.broadcast("news").await;
    let mut delivered = report.delivered.clone();
    delivered.sort_by_key(|id| *id.as_uuid());
    let mut expected: Vec<ConnectionId> = vec![to_a.id(), to_c.id()];
    expected.sort_by_key(|id| *id.as_uuid());
    assert_eq!(delivered, expected);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, to_b.id());
    assert!(matches!(
        report.failed[0].1,
        SendError::Crypto(CryptoError::Encrypt)
    ));
    assert!(!report.is_complete());

    assert_eq!(payload(client_event(&mut a).await), Payload::Text("news".into()));
    assert_eq!(payload(client_event(&mut c).await), Payload::Text("news".into()));

    b.close();
    assert!(matches!(client_event(&mut b).await, SessionEvent::Close));
}

#[tokio::test]
async fn closed_connections_leave_the_set() {
    let server = Server::new(Settings::new(keys()));
    let mut listener = listen(&server).await;
    let (mut first, _, to_first) =
        establish(&Client::new(Settings::new(keys())), &mut listener).await;
    let (mut second, _, to_second) =
        establish(&Client::new(Settings::new(keys())), &mut listener).await;
    assert_eq!(server.connection_count().await, 2);

    first.close();
    first.closed().await;
    let tagged = server_event(&mut listener).await;
    assert_eq!(tagged.connection, to_first.id());
    assert!(matches!(tagged.event, SessionEvent::Close));
    let remaining = server.connections().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), to_second.id());

    to_second.close();
    assert!(matches!(
        client_event(&mut second).await,
        SessionEvent::Close
    ));
    let tagged = server_event(&mut listener).await;
    assert_eq!(tagged.connection, to_second.id());
    assert!(matches!(tagged.event, SessionEvent::Close));
    assert_eq!(server.connection_count().await, 0);
    assert!(server.broadcast("nobody").await.delivered.is_empty());
}

#[tokio::test]
async fn unknown_tag_reports_once_and_keeps_connection() {
    let server = Server::new(Settings::new(keys()));
    let mut listener = listen(&server).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    write_packet(&mut stream, &[0xff, 0x01, 0x02]).await;
    write_packet(&mut stream, &handshake(PROTOCOL_VERSION)).await;

    let error = protocol_error(server_event(&mut listener).await.event);
    assert!(matches!(
        error,
        ProtocolError::InvalidPacket(PacketError::UnknownTag { tag: 0xff, .. })
    ));
    assert_eq!(error.raw(), Some(&[0xff, 0x01, 0x02][..]));

    match read_packet(&mut stream).await {
        Packet::Handshake {
            version, latency, ..
        } => {
            assert_eq!(version, PROTOCOL_VERSION);
            assert!(latency.is_some());
        }
        other => panic!("expected handshake ack, got {other:?}"),
    }
}

#[tokio::test]
async fn version_mismatch_writes_no_ack() {
    let server = Server::new(Settings::new(keys()));
    let mut listener = listen(&server).await;
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

    write_packet(&mut stream, &handshake(PROTOCOL_VERSION + 1)).await;
    assert_eq!(
        protocol_error(server_event(&mut listener).await.event),
        ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            received: PROTOCOL_VERSION + 1,
        }
    );
    let mut buf = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(200), stream.read(&mut buf))
            .await
            .is_err(),
        "responder must not answer a mismatched handshake"
    );
}

#[tokio::test]
async fn setup_deadline_closes_silent_peers() {
    let server =
        Server::new(Settings::new(keys())).with_handshake_timeout(Duration::from_millis(100));
    let mut listener = listen(&server).await;

    let _silent = TcpStream::connect(listener.local_addr()).await.unwrap();
    assert_eq!(
        protocol_error(server_event(&mut listener).await.event),
        ProtocolError::HandshakeTimeout
    );
    assert!(matches!(
        server_event(&mut listener).await.event,
        SessionEvent::Close
    ));

    let mut half_done = TcpStream::connect(listener.local_addr()).await.unwrap();
    write_packet(&mut half_done, &handshake(PROTOCOL_VERSION)).await;
    assert!(matches!(
        read_packet(&mut half_done).await,
        Packet::Handshake { .. }
    ));
    assert_eq!(
        protocol_error(server_event(&mut listener).await.event),
        ProtocolError::ExchangeTimeout
    );
    assert!(matches!(
        server_event(&mut listener).await.event,
        SessionEvent::Close
    ));
}

#[tokio::test]
async fn close_right_after_large_send_delivers_it() {
    let server = Server::new(Settings::new(keys()));
    let mut listener = listen(&server).await;
    let (mut session, to_server, to_client) =
        establish(&Client::new(Settings::new(keys())), &mut listener).await;
    let big = "x".repeat(4 * 1024 * 1024);

    to_server.send_data(&big).unwrap();
    session.close();
    assert_eq!(
        payload(server_event(&mut listener).await.event),
        Payload::Text(big.clone())
    );
    assert!(matches!(
        server_event(&mut listener).await.event,
        SessionEvent::Close
    ));
    assert!(matches!(client_event(&mut session).await, SessionEvent::Close));
    assert!(matches!(to_client.send_data("late"), Err(SendError::Closed)));

    let (mut session, _, to_client) =
        establish(&Client::new(Settings::new(keys())), &mut listener).await;
    to_client.send_binary_data(big.as_bytes()).unwrap();
    to_client.close();
    assert_eq!(
        payload(client_event(&mut session).await),
        Payload::Binary(big.into_bytes())
    );
    assert!(matches!(client_event(&mut session).await, SessionEvent::Close));
}

#[tokio::test]
async fn setup_deadline_interrupts_pending_predicate() {
    let server =
        Server::new(Settings::new(keys())).with_handshake_timeout(Duration::from_millis(100));
    server.should_trust(|_| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        true
    });
    let mut listener = listen(&server).await;
    let _session = Client::new(Settings::new(keys()))
        .connect(listener.local_addr())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(
        protocol_error(server_event(&mut listener).await.event),
        ProtocolError::ExchangeTimeout
    );
    assert!(matches!(
        server_event(&mut listener).await.event,
        SessionEvent::Close
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn close_interrupts_pending_predicate() {
    let server = Server::new(Settings::new(keys()));
    let listener = listen(&server).await;
    let client = Client::new(Settings::new(keys()));
    let asked = Arc::new(tokio::sync::Notify::new());
    let signal = asked.clone();
    client.should_trust(move |_| {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_secs(3)).await;
            true
        }
    });

    let mut session = client.connect(listener.local_addr()).await.unwrap();
    timeout(WAIT, asked.notified()).await.unwrap();
    session.close();
    let event = timeout(Duration::from_secs(1), session.next_event())
        .await
        .expect("close waited for the predicate")
        .expect("session ended");
    assert!(matches!(event, SessionEvent::Close));
}
