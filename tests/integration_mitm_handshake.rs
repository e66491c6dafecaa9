//! The capture-and-replay attack, end to end at the forwarder level and
//! byte-exact: challenge substitution, authenticator harvest with RST
//! tear-down, challenge replay on the reconnect, welcome, and the single
//! forged injection.

mod common;

use common::framed;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tcp_interceptor::mitm::{Leg, MitmConfig, MitmMachine, Phase};
use tcp_interceptor::proxy::forwarder::{self, ForwardOutcome, ForwarderContext};
use tcp_interceptor::rules::RuleSetHandle;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

const CLIENT_IP: &str = "10.10.20.11";
const SERVER_IP: &str = "10.10.20.13";
const MALICIOUS: &[u8] = b"#CHALLENGE#EVIL";

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn context(leg: Leg, mitm: Arc<MitmMachine>) -> ForwarderContext {
    let (source, target) = match leg {
        Leg::ClientToServer => (CLIENT_IP, SERVER_IP),
        Leg::ServerToClient => (SERVER_IP, CLIENT_IP),
    };
    ForwarderContext {
        leg,
        label: format!("{source}->{target}"),
        source_ip: ip(source),
        target_ip: ip(target),
        rules: RuleSetHandle::default(),
        mitm,
        process_start: Instant::now(),
    }
}

/// Run one forwarder leg over the given input until EOF (or tear-down)
/// and collect what reached the peer.
async fn run_leg(leg: Leg, mitm: Arc<MitmMachine>, input: Vec<u8>) -> (Vec<u8>, ForwardOutcome) {
    let (mut tx, reader) = duplex(64 * 1024);
    let (writer, mut peer) = duplex(64 * 1024);
    let task = tokio::spawn(forwarder::run(reader, writer, context(leg, mitm)));

    tx.write_all(&input).await.unwrap();
    tx.shutdown().await.unwrap();

    let outcome = task.await.unwrap();
    drop(tx);
    let mut out = Vec::new();
    peer.read_to_end(&mut out).await.unwrap();
    (out, outcome)
}

fn machine() -> Arc<MitmMachine> {
    MitmMachine::new(MitmConfig {
        enabled: true,
        payload: MALICIOUS.to_vec(),
        log: false,
    })
}

#[tokio::test]
async fn capture_and_replay_attack_is_byte_exact() {
    let mitm = machine();
    let original_challenge = framed(b"#CHALLENGE#ABC");

    // (a) First connection, server->client: the challenge is suppressed
    // and the configured malicious bytes go to the client instead.
    let (to_client, outcome) = run_leg(
        Leg::ServerToClient,
        mitm.clone(),
        original_challenge.clone(),
    )
    .await;
    assert_eq!(to_client, MALICIOUS);
    assert_eq!(outcome, ForwardOutcome::Eof);

    // (b)+(c) Client's response to the malicious challenge is harvested
    // and the connection is torn down; nothing reaches the server.
    let (to_server, outcome) = run_leg(Leg::ClientToServer, mitm.clone(), framed(b"AUTH1")).await;
    assert!(to_server.is_empty());
    assert_eq!(outcome, ForwardOutcome::TearDown);
    assert_eq!(mitm.phase().await, Phase::WaitingReconnect);

    // (d)+(e) New connection: the fresh server challenge is replaced by
    // the stored original, then the welcome passes through.
    let mut reconnect_input = framed(b"#CHALLENGE#XYZ");
    reconnect_input.extend_from_slice(&framed(b"#WELCOME#"));
    let (to_client, outcome) = run_leg(Leg::ServerToClient, mitm.clone(), reconnect_input).await;

    let mut expected = original_challenge.clone();
    expected.extend_from_slice(&framed(b"#WELCOME#"));
    assert_eq!(to_client, expected);
    assert_eq!(outcome, ForwardOutcome::Eof);
    assert_eq!(mitm.phase().await, Phase::ReadyForInjection);

    // (f) Next client->server slot: the forged frame precedes the
    // client's own message. Length field covers payload + authenticator.
    let client_message = framed(b"ordinary");
    let (to_server, _) = run_leg(Leg::ClientToServer, mitm.clone(), client_message.clone()).await;

    let body = [MALICIOUS, b"AUTH1"].concat();
    let mut expected = (body.len() as u32).to_be_bytes().to_vec();
    expected.extend_from_slice(&body);
    expected.extend_from_slice(&client_message);
    assert_eq!(to_server, expected);
    assert!(mitm.injected().await);
    assert_eq!(mitm.phase().await, Phase::Done);
}

#[tokio::test]
async fn injection_happens_at_most_once_across_connections() {
    let mitm = machine();

    run_leg(Leg::ServerToClient, mitm.clone(), framed(b"#CHALLENGE#A")).await;
    run_leg(Leg::ClientToServer, mitm.clone(), framed(b"AUTH")).await;
    let mut reconnect = framed(b"#CHALLENGE#B");
    reconnect.extend_from_slice(&framed(b"#WELCOME#"));
    run_leg(Leg::ServerToClient, mitm.clone(), reconnect).await;

    // First post-welcome client message carries the injection.
    let message = framed(b"m1");
    let (out, _) = run_leg(Leg::ClientToServer, mitm.clone(), message.clone()).await;
    assert!(out.len() > message.len());

    // Any number of later connections and messages: forwarded unchanged,
    // no second injection.
    for i in 0..3 {
        let message = framed(format!("again-{i}").as_bytes());
        let (out, outcome) = run_leg(Leg::ClientToServer, mitm.clone(), message.clone()).await;
        assert_eq!(out, message);
        assert_eq!(outcome, ForwardOutcome::Eof);
    }
    assert!(mitm.injected().await);
}

#[tokio::test]
async fn attack_disabled_leaves_handshake_untouched() {
    let mitm = MitmMachine::disabled();
    let mut input = framed(b"#CHALLENGE#ABC");
    input.extend_from_slice(&framed(b"#WELCOME#"));

    let (out, outcome) = run_leg(Leg::ServerToClient, mitm.clone(), input.clone()).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ForwardOutcome::Eof);
    assert!(!mitm.injected().await);
}

#[tokio::test]
async fn non_challenge_traffic_before_handshake_flows_normally() {
    let mitm = machine();
    let input = framed(b"plain status line");
    let (out, _) = run_leg(Leg::ServerToClient, mitm.clone(), input.clone()).await;
    assert_eq!(out, input);
    assert_eq!(mitm.phase().await, Phase::Idle);
}
