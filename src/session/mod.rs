//! Session controller: owns the peer table, gates traffic behind the
//! room verifier, runs cover traffic, and supervises reconnects.
//!
//! The controller is a single task that owns the swarm handle and the
//! session table; every public operation is a request over an
//! internal channel with exactly one reply. Each connected socket
//! runs its own session task that exclusively owns that peer's
//! ratchet, so encrypt and decrypt stay strictly serial per
//! conversation.

pub mod verify;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::crypto::ratchet::{Decrypted, Ratchet};
use crate::crypto::{room_psk, swarm_key, Key, LocalIdentity, PreKeyBundle};
use crate::error::Fault;
use crate::framing::{encode_frame, now_jittered, FrameDecoder, KEEPALIVE_PERIOD_MS};
use crate::protocol::{ChatMessage, EnvelopeKind, MessageContent, WireFrame};
use crate::session::verify::{PeerVerifier, VERIFY_TIMEOUT_MS};
use crate::swarm::{Swarm, SwarmConnection, TransportMode};

/// No verified peer within this window flips the transport mode and
/// retries the swarm join.
pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Delay before the single scheduled reconnect after the last peer is
/// lost.
pub const RECONNECT_DELAY_MS: u64 = 5_000;

/// Repeated auth faults from one peer inside the window tear that
/// peer down.
const AUTH_STRIKE_LIMIT: usize = 3;
const AUTH_STRIKE_WINDOW_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Host-facing events, the upward callbacks of the core.
#[derive(Debug)]
pub enum CoreEvent {
    /// A decrypted application message from a verified peer.
    Message { peer: String, message: ChatMessage },
    ConnectionStatus(ConnectionStatus),
    /// Non-fatal trouble the host may want to surface. The text
    /// leads with the stable fault kind; key material never appears.
    BackendError(String),
    /// Per-peer outcome of one `send`.
    PeerDelivery { message_id: String, success: bool },
}

enum Command {
    Send {
        content: MessageContent,
        kind: Option<EnvelopeKind>,
        reply: oneshot::Sender<Result<String, Fault>>,
    },
    SetTransport {
        mode: TransportMode,
        reply: oneshot::Sender<Result<(), Fault>>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
}

enum PeerCommand {
    Send {
        message_id: String,
        content: MessageContent,
        kind: Option<EnvelopeKind>,
    },
    Close,
}

enum Supervision {
    Verified { peer: String },
    Gone { peer: String },
    ReconnectDue,
    Fatal { reason: String },
}

struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
    verified: Arc<AtomicBool>,
}

/// Handle to a running core. Cheap to clone; all operations are
/// request/response against the controller task.
#[derive(Clone)]
pub struct Core {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Core {
    /// Derive the room key material, join the swarm, and start the
    /// controller. `peer_bundle` is the out-of-band identity material
    /// of the expected peer; `identity` is our own, published the
    /// same way.
    pub async fn initialize<S: Swarm>(
        room_id: &str,
        identity: LocalIdentity,
        peer_bundle: PreKeyBundle,
        mut swarm: S,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoreEvent>), Fault> {
        let key = swarm_key(room_id);
        let psk_local = Arc::new(room_psk(room_id, &identity.bundle()));
        let psk_remote = Arc::new(room_psk(room_id, &peer_bundle));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sup_tx, sup_rx) = mpsc::unbounded_channel();

        let mode = TransportMode::Direct;
        let connections = swarm.join(key, mode).await?;
        let _ = event_tx.send(CoreEvent::ConnectionStatus(ConnectionStatus::Connecting));

        let controller = Controller {
            swarm,
            key,
            mode,
            identity: Arc::new(identity),
            peer_bundle,
            psk_local,
            psk_remote,
            peers: HashMap::new(),
            verified_count: 0,
            reconnect_scheduled: false,
            event_tx,
            cmd_rx,
            sup_tx,
            sup_rx,
        };
        tokio::spawn(controller.run(connections));

        Ok((Self { cmd_tx }, event_rx))
    }

    /// Encrypt and fan a text message out to every verified peer.
    /// Returns the message id used in delivery reports.
    pub async fn send(&self, text: impl Into<String>) -> Result<String, Fault> {
        self.send_content(MessageContent::Text(text.into()), None)
            .await
    }

    /// Same path with an explicit content and envelope kind; the
    /// file-transfer adapter sends chunks through here.
    pub async fn send_content(
        &self,
        content: MessageContent,
        kind: Option<EnvelopeKind>,
    ) -> Result<String, Fault> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { content, kind, reply })
            .map_err(|_| Fault::Usage("core is shut down".into()))?;
        rx.await
            .map_err(|_| Fault::Usage("core is shut down".into()))?
    }

    pub async fn set_transport(&self, mode: TransportMode) -> Result<(), Fault> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetTransport { mode, reply })
            .map_err(|_| Fault::Usage("core is shut down".into()))?;
        rx.await
            .map_err(|_| Fault::Usage("core is shut down".into()))?
    }

    /// Stop timers, close every socket, leave the swarm, and wipe key
    /// material. Idempotent: a second call is a no-op.
    pub async fn cleanup(&self) -> Result<(), Fault> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Cleanup { reply }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

struct Controller<S: Swarm> {
    swarm: S,
    key: [u8; 32],
    mode: TransportMode,
    identity: Arc<LocalIdentity>,
    peer_bundle: PreKeyBundle,
    psk_local: Arc<Key>,
    psk_remote: Arc<Key>,
    peers: HashMap<String, PeerHandle>,
    verified_count: usize,
    reconnect_scheduled: bool,
    event_tx: mpsc::UnboundedSender<CoreEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    sup_tx: mpsc::UnboundedSender<Supervision>,
    sup_rx: mpsc::UnboundedReceiver<Supervision>,
}

impl<S: Swarm> Controller<S> {
    async fn run(mut self, mut connections: mpsc::UnboundedReceiver<SwarmConnection>) {
        let mut connect_deadline = Instant::now() + Duration::from_millis(CONNECT_TIMEOUT_MS);

        loop {
            let awaiting_peer = self.verified_count == 0;
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    Command::Send { content, kind, reply } => {
                        let _ = reply.send(self.fan_out(content, kind));
                    }
                    Command::SetTransport { mode, reply } => {
                        self.mode = mode;
                        let _ = reply.send(self.rejoin(&mut connections).await);
                    }
                    Command::Cleanup { reply } => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                },
                Some(conn) = connections.recv() => self.spawn_session(conn),
                Some(sup) = self.sup_rx.recv() => match sup {
                    Supervision::Verified { peer } => {
                        info!(%peer, "peer verified");
                        self.verified_count += 1;
                        if self.verified_count == 1 {
                            let _ = self.event_tx.send(CoreEvent::ConnectionStatus(
                                ConnectionStatus::Connected,
                            ));
                        }
                    }
                    Supervision::Gone { peer } => {
                        if let Some(handle) = self.peers.remove(&peer) {
                            if handle.verified.load(Ordering::Relaxed) {
                                self.verified_count -= 1;
                            }
                            debug!(%peer, "peer gone");
                        }
                        if self.peers.is_empty() {
                            let _ = self.event_tx.send(CoreEvent::ConnectionStatus(
                                ConnectionStatus::Disconnected,
                            ));
                            self.schedule_reconnect();
                        }
                    }
                    Supervision::ReconnectDue => {
                        self.reconnect_scheduled = false;
                        if self.peers.is_empty() {
                            info!("reconnecting to swarm");
                            let _ = self.rejoin(&mut connections).await;
                        }
                    }
                    Supervision::Fatal { reason } => {
                        let _ = self.event_tx.send(CoreEvent::BackendError(reason));
                        self.teardown().await;
                        return;
                    }
                },
                _ = sleep_until(connect_deadline), if awaiting_peer => {
                    self.mode = self.mode.flipped();
                    warn!(mode = ?self.mode, "connection timeout, flipping transport mode");
                    let _ = self.rejoin(&mut connections).await;
                    connect_deadline = Instant::now() + Duration::from_millis(CONNECT_TIMEOUT_MS);
                }
            }
        }
    }

    fn fan_out(
        &mut self,
        content: MessageContent,
        kind: Option<EnvelopeKind>,
    ) -> Result<String, Fault> {
        let verified: Vec<&PeerHandle> = self
            .peers
            .values()
            .filter(|p| p.verified.load(Ordering::Relaxed))
            .collect();
        if verified.is_empty() {
            return Err(Fault::Usage("no verified session to send through".into()));
        }
        let message_id = generate_message_id();
        for handle in verified {
            // Best effort: a dead channel means the session task is
            // already winding down and will report itself gone.
            let _ = handle.tx.send(PeerCommand::Send {
                message_id: message_id.clone(),
                content: content.clone(),
                kind,
            });
        }
        Ok(message_id)
    }

    fn spawn_session(&mut self, conn: SwarmConnection) {
        let peer_id = conn.addr.to_string();
        if self.peers.contains_key(&peer_id) {
            debug!(peer = %peer_id, "duplicate connection dropped");
            return;
        }
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let verified = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_session(SessionArgs {
            peer_id: peer_id.clone(),
            stream: conn.stream,
            identity: self.identity.clone(),
            peer_bundle: self.peer_bundle.clone(),
            psk_local: self.psk_local.clone(),
            psk_remote: self.psk_remote.clone(),
            verified: verified.clone(),
            cmd_rx,
            event_tx: self.event_tx.clone(),
            sup_tx: self.sup_tx.clone(),
        }));
        self.peers.insert(peer_id, PeerHandle { tx, verified });
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_scheduled {
            return;
        }
        self.reconnect_scheduled = true;
        let sup_tx = self.sup_tx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
            let _ = sup_tx.send(Supervision::ReconnectDue);
        });
    }

    async fn rejoin(
        &mut self,
        connections: &mut mpsc::UnboundedReceiver<SwarmConnection>,
    ) -> Result<(), Fault> {
        match self.swarm.join(self.key, self.mode).await {
            Ok(rx) => {
                *connections = rx;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .event_tx
                    .send(CoreEvent::BackendError(format!("{} fault: {e}", e.kind())));
                Err(e)
            }
        }
    }

    async fn teardown(&mut self) {
        for (_, handle) in self.peers.drain() {
            let _ = handle.tx.send(PeerCommand::Close);
        }
        self.verified_count = 0;
        self.swarm.leave().await;
    }
}

struct SessionArgs {
    peer_id: String,
    stream: tokio::net::TcpStream,
    identity: Arc<LocalIdentity>,
    peer_bundle: PreKeyBundle,
    psk_local: Arc<Key>,
    psk_remote: Arc<Key>,
    verified: Arc<AtomicBool>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    event_tx: mpsc::UnboundedSender<CoreEvent>,
    sup_tx: mpsc::UnboundedSender<Supervision>,
}

/// One task per socket. Owns this peer's ratchet and verifier; ends
/// by reporting itself gone to the controller. The ratchet wipes its
/// keys on drop, so every exit path leaves no key material behind.
async fn run_session(args: SessionArgs) {
    let SessionArgs {
        peer_id,
        stream,
        identity,
        peer_bundle,
        psk_local,
        psk_remote,
        verified,
        mut cmd_rx,
        event_tx,
        sup_tx,
    } = args;

    let (mut reader, mut writer) = stream.into_split();
    let (mut verifier, challenge) = PeerVerifier::new(now_ms(), psk_local, psk_remote);

    let mut ratchet = match Ratchet::initialize(&identity, &peer_bundle) {
        Ok(r) => r,
        Err(e) => {
            let _ = sup_tx.send(Supervision::Fatal {
                reason: format!("{} fault during session setup: {e}", e.kind()),
            });
            return;
        }
    };

    let mut end_reason = "session closed";
    'session: {
        match challenge.to_bytes() {
            Ok(bytes) => {
                if write_payload(&mut writer, &bytes).await.is_err() {
                    end_reason = "challenge write failed";
                    break 'session;
                }
            }
            Err(_) => {
                end_reason = "challenge encode failed";
                break 'session;
            }
        }

        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 8192];
        let mut auth_strikes: VecDeque<i64> = VecDeque::new();
        let mut last_seen = now_ms();
        let mut keepalive = interval(Duration::from_millis(KEEPALIVE_PERIOD_MS));
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let verify_deadline = sleep(Duration::from_millis(VERIFY_TIMEOUT_MS as u64));
        tokio::pin!(verify_deadline);

        'run: loop {
            tokio::select! {
                result = reader.read(&mut read_buf) => {
                    let n = match result {
                        Ok(0) => {
                            end_reason = "peer closed the connection";
                            break 'run;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            debug!(peer = %peer_id, "read failed: {e}");
                            end_reason = "read failed";
                            break 'run;
                        }
                    };
                    last_seen = now_ms();
                    decoder.push(&read_buf[..n]);
                    loop {
                        let payload = match decoder.next_frame() {
                            Ok(Some(p)) => p,
                            Ok(None) => break,
                            Err(e) => {
                                // A desynced frame stream cannot be
                                // recovered; drop the peer.
                                let _ = event_tx.send(CoreEvent::BackendError(format!(
                                    "{} fault from {peer_id}: {e}",
                                    e.kind()
                                )));
                                end_reason = "frame desync";
                                break 'run;
                            }
                        };
                        match handle_payload(
                            &payload,
                            &peer_id,
                            &mut verifier,
                            &mut ratchet,
                            &mut writer,
                            &verified,
                            &mut auth_strikes,
                            &event_tx,
                            &sup_tx,
                        )
                        .await
                        {
                            PayloadOutcome::Continue => {}
                            PayloadOutcome::Drop(reason) => {
                                end_reason = reason;
                                break 'run;
                            }
                            PayloadOutcome::Fatal => return,
                        }
                    }
                }
                Some(cmd) = cmd_rx.recv() => match cmd {
                    PeerCommand::Send { message_id, content, kind } => {
                        let success = encrypt_and_write(
                            &mut ratchet,
                            &mut writer,
                            content,
                            kind,
                            &event_tx,
                            &sup_tx,
                            &peer_id,
                        )
                        .await;
                        let _ = event_tx.send(CoreEvent::PeerDelivery {
                            message_id,
                            success: success == WriteOutcome::Written,
                        });
                        match success {
                            WriteOutcome::Written => {}
                            WriteOutcome::WriteFailed => {
                                end_reason = "write failed";
                                break 'run;
                            }
                            WriteOutcome::Fatal => return,
                        }
                    }
                    PeerCommand::Close => {
                        end_reason = "closed by controller";
                        break 'run;
                    }
                },
                _ = keepalive.tick(), if verifier.is_verified() => {
                    let outcome = seal_and_write_keepalive(&mut ratchet, &mut writer).await;
                    match outcome {
                        WriteOutcome::Written => {}
                        WriteOutcome::WriteFailed => {
                            end_reason = "keepalive write failed";
                            break 'run;
                        }
                        WriteOutcome::Fatal => {
                            let _ = sup_tx.send(Supervision::Fatal {
                                reason: "crypto fault sealing keepalive".into(),
                            });
                            return;
                        }
                    }
                }
                _ = &mut verify_deadline, if !verifier.is_verified() => {
                    let fault = verifier.expire();
                    let _ = event_tx.send(CoreEvent::BackendError(format!(
                        "{} fault from {peer_id}: {fault}",
                        fault.kind()
                    )));
                    end_reason = "verification timeout";
                    break 'run;
                }
            }
        }

        debug!(
            peer = %peer_id,
            verified_at = ?verifier.verified_at(),
            last_seen,
            "session winding down"
        );
    }

    debug!(peer = %peer_id, "session ended: {end_reason}");
    let _ = sup_tx.send(Supervision::Gone { peer: peer_id });
}

enum PayloadOutcome {
    Continue,
    Drop(&'static str),
    Fatal,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum WriteOutcome {
    Written,
    WriteFailed,
    Fatal,
}

#[allow(clippy::too_many_arguments)]
async fn handle_payload(
    payload: &[u8],
    peer_id: &str,
    verifier: &mut PeerVerifier,
    ratchet: &mut Ratchet,
    writer: &mut OwnedWriteHalf,
    verified: &Arc<AtomicBool>,
    auth_strikes: &mut VecDeque<i64>,
    event_tx: &mpsc::UnboundedSender<CoreEvent>,
    sup_tx: &mpsc::UnboundedSender<Supervision>,
) -> PayloadOutcome {
    let frame = match WireFrame::from_bytes(payload) {
        Ok(f) => f,
        Err(e) => {
            debug!(peer = %peer_id, "undecodable frame dropped: {e}");
            return PayloadOutcome::Continue;
        }
    };

    if !verifier.is_verified() {
        let control = match frame {
            WireFrame::Control(c) if c.is_verification() => c,
            // The gate: nothing but verification traffic passes
            // before the peer proves room membership.
            _ => {
                debug!(peer = %peer_id, "non-verification frame dropped while unverified");
                return PayloadOutcome::Continue;
            }
        };
        return match verifier.handle(&control, now_ms()) {
            Ok(Some(reply)) => {
                let now_verified = verifier.is_verified();
                let Ok(bytes) = reply.to_bytes() else {
                    return PayloadOutcome::Drop("verification reply encode failed");
                };
                if write_payload(writer, &bytes).await.is_err() {
                    return PayloadOutcome::Drop("verification write failed");
                }
                if now_verified {
                    verified.store(true, Ordering::Relaxed);
                    let _ = sup_tx.send(Supervision::Verified {
                        peer: peer_id.to_string(),
                    });
                }
                PayloadOutcome::Continue
            }
            Ok(None) => PayloadOutcome::Continue,
            Err(fault) => {
                let _ = event_tx.send(CoreEvent::BackendError(format!(
                    "{} fault from {peer_id}: {fault}",
                    fault.kind()
                )));
                PayloadOutcome::Drop("verification failed")
            }
        };
    }

    match frame {
        WireFrame::Control(control) => {
            if control.is_verification() {
                // Late verification_success from the peer's side of
                // the mutual handshake.
                let _ = verifier.handle(&control, now_ms());
            } else {
                debug!(peer = %peer_id, "plaintext control frame dropped post-verification");
            }
            PayloadOutcome::Continue
        }
        WireFrame::Envelope(envelope) => match ratchet.decrypt(&envelope) {
            Ok(Decrypted::Message { message, .. }) => {
                let _ = event_tx.send(CoreEvent::Message {
                    peer: peer_id.to_string(),
                    message,
                });
                PayloadOutcome::Continue
            }
            Ok(Decrypted::Keepalive { .. }) => {
                match seal_and_write_keepalive_ack(ratchet, writer).await {
                    WriteOutcome::Written => PayloadOutcome::Continue,
                    WriteOutcome::WriteFailed => PayloadOutcome::Drop("keepalive ack write failed"),
                    WriteOutcome::Fatal => {
                        let _ = sup_tx.send(Supervision::Fatal {
                            reason: "crypto fault sealing keepalive ack".into(),
                        });
                        PayloadOutcome::Fatal
                    }
                }
            }
            Ok(Decrypted::KeepaliveAck { .. }) => PayloadOutcome::Continue,
            Err(fault @ Fault::Replay { .. }) => {
                // Replay: discard, tell the host, session stays up.
                let _ = event_tx.send(CoreEvent::BackendError(format!(
                    "{} fault from {peer_id}: {fault}",
                    fault.kind()
                )));
                PayloadOutcome::Continue
            }
            Err(fault @ Fault::Auth(_)) => {
                let _ = event_tx.send(CoreEvent::BackendError(format!(
                    "{} fault from {peer_id}: {fault}",
                    fault.kind()
                )));
                let now = now_ms();
                while auth_strikes
                    .front()
                    .is_some_and(|t| *t < now - AUTH_STRIKE_WINDOW_MS)
                {
                    auth_strikes.pop_front();
                }
                auth_strikes.push_back(now);
                if auth_strikes.len() >= AUTH_STRIKE_LIMIT {
                    warn!(peer = %peer_id, "repeated auth faults, dropping peer");
                    PayloadOutcome::Drop("repeated auth faults")
                } else {
                    PayloadOutcome::Continue
                }
            }
            Err(fault @ Fault::Codec(_)) => {
                debug!(peer = %peer_id, "undecodable envelope dropped: {fault}");
                PayloadOutcome::Continue
            }
            Err(fault) => {
                // Crypto faults on the decrypt path are fatal to the
                // whole core.
                let _ = sup_tx.send(Supervision::Fatal {
                    reason: format!("{} fault from {peer_id}: {fault}", fault.kind()),
                });
                PayloadOutcome::Fatal
            }
        },
    }
}

async fn encrypt_and_write(
    ratchet: &mut Ratchet,
    writer: &mut OwnedWriteHalf,
    content: MessageContent,
    kind: Option<EnvelopeKind>,
    event_tx: &mpsc::UnboundedSender<CoreEvent>,
    sup_tx: &mpsc::UnboundedSender<Supervision>,
    peer_id: &str,
) -> WriteOutcome {
    let envelope = match ratchet.encrypt(content, now_jittered(), kind) {
        Ok(e) => e,
        Err(fault) => {
            let _ = event_tx.send(CoreEvent::BackendError(format!(
                "{} fault encrypting for {peer_id}: {fault}",
                fault.kind()
            )));
            let _ = sup_tx.send(Supervision::Fatal {
                reason: format!("{} fault on encrypt", fault.kind()),
            });
            return WriteOutcome::Fatal;
        }
    };
    let Ok(bytes) = envelope.to_bytes() else {
        return WriteOutcome::WriteFailed;
    };
    match write_payload(writer, &bytes).await {
        Ok(()) => WriteOutcome::Written,
        Err(_) => WriteOutcome::WriteFailed,
    }
}

async fn seal_and_write_keepalive(ratchet: &mut Ratchet, writer: &mut OwnedWriteHalf) -> WriteOutcome {
    let envelope = match ratchet.seal_keepalive(now_jittered()) {
        Ok(e) => e,
        Err(_) => return WriteOutcome::Fatal,
    };
    let Ok(bytes) = envelope.to_bytes() else {
        return WriteOutcome::WriteFailed;
    };
    match write_payload(writer, &bytes).await {
        Ok(()) => WriteOutcome::Written,
        Err(_) => WriteOutcome::WriteFailed,
    }
}

async fn seal_and_write_keepalive_ack(
    ratchet: &mut Ratchet,
    writer: &mut OwnedWriteHalf,
) -> WriteOutcome {
    // Acks answer with the current wall clock, unjittered.
    let envelope = match ratchet.seal_keepalive_ack(now_ms()) {
        Ok(e) => e,
        Err(_) => return WriteOutcome::Fatal,
    };
    let Ok(bytes) = envelope.to_bytes() else {
        return WriteOutcome::WriteFailed;
    };
    match write_payload(writer, &bytes).await {
        Ok(()) => WriteOutcome::Written,
        Err(_) => WriteOutcome::WriteFailed,
    }
}

async fn write_payload(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), Fault> {
    let frame = encode_frame(payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Fault::Transport(e.to_string()))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn generate_message_id() -> String {
    let bytes: Vec<u8> = (0..8).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(bytes)
}
