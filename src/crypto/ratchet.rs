//! Forward-secret message ratchet.
//!
//! Per-message keys come off a sending/receiving chain pair derived
//! from a root key; the root is refreshed by a DH rotation every
//! [`ROTATE_AFTER`] sends or whenever the peer shows up with a new
//! ratchet public key. Envelopes are sender-authenticated with a
//! detached Ed25519 signature over the ciphertext.

use std::collections::HashSet;
use std::mem;

use zeroize::Zeroize;

use crate::crypto::{
    aead_open, aead_seal, ct_eq, dh_keypair, is_initiator, kdf_subkey, random_nonce, session_keys,
    sign, verify_sig, Key, LocalIdentity, PreKeyBundle,
};
use crate::error::Fault;
use crate::protocol::{
    ChatMessage, ControlFrame, Envelope, EnvelopeKind, InnerPlaintext, MessageContent,
};

/// DH rotation fires after this many messages sent on one chain.
pub const ROTATE_AFTER: u32 = 100;

/// How far below `n_r` the replay classifier will re-derive message
/// keys. Bounds the replay set and the failure-classification scan.
const REPLAY_WINDOW: u32 = 128;

const CTX_SENDING: &[u8; 8] = b"sending\0";
const CTX_RECEIVING: &[u8; 8] = b"receivin";
const CTX_MESSAGE: &[u8; 8] = b"msg\0\0\0\0\0";

const ID_SENDING: u64 = 1;
const ID_RECEIVING: u64 = 2;

/// Result of opening one envelope.
#[derive(Debug)]
pub enum Decrypted {
    /// An application message; counters advanced.
    Message {
        message: ChatMessage,
        kind: Option<EnvelopeKind>,
    },
    /// Encrypted cover traffic; counters untouched.
    Keepalive { timestamp: i64 },
    KeepaliveAck { timestamp: i64 },
}

/// Ratchet state for one conversation.
///
/// Owned exclusively by its session task; encrypt and decrypt are
/// strictly serial, which is what keeps the counter-to-key order
/// intact.
pub struct Ratchet {
    // Local ratchet keypair. Starts as the identity bundle keypair,
    // replaced by an ephemeral one on every send-side rotation.
    dh_secret: Key,
    dh_public: [u8; 32],
    remote_dh: [u8; 32],

    // Per-session Ed25519 material. The agreement keys never sign.
    signing_seed: Key,
    remote_verify: [u8; 32],

    root: Key,
    sending: Key,
    receiving: Key,

    n_s: u32,
    n_r: u32,

    // Bumped on every rotation; replay ids from epochs older than the
    // previous one are garbage collected.
    epoch: u32,
    replay: HashSet<(u32, u32, i64)>,
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl Ratchet {
    /// Set up mirrored state from the local identity and the peer's
    /// pre-key bundle. Both sides arrive at the same root; chain
    /// assignment swaps with the initiator role so this side's
    /// sending chain is the peer's receiving chain.
    pub fn initialize(local: &LocalIdentity, peer: &PreKeyBundle) -> Result<Self, Fault> {
        let dh_secret = Key::from_bytes(local.dh_secret_bytes());
        let dh_public = local.dh_public_bytes();
        let (rx, tx) = session_keys(dh_secret.as_bytes(), &dh_public, &peer.dh)?;

        let mut ratchet = Ratchet {
            dh_secret,
            dh_public,
            remote_dh: peer.dh,
            signing_seed: Key::from_bytes(local.signing_key_bytes()),
            remote_verify: peer.sig,
            root: Key::from_bytes([0u8; 32]),
            sending: Key::from_bytes([0u8; 32]),
            receiving: Key::from_bytes([0u8; 32]),
            n_s: 0,
            n_r: 0,
            epoch: 0,
            replay: HashSet::new(),
        };
        ratchet.adopt_session(rx, tx)?;
        ratchet.epoch = 0;
        Ok(ratchet)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.dh_public
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.n_s, self.n_r)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Send-side DH rotation: fresh ephemeral keypair, agreement with
    /// the current remote key, chains re-derived, counters reset.
    pub fn rotate(&mut self) -> Result<(), Fault> {
        let (mut secret, public) = dh_keypair();
        let (rx, tx) = session_keys(&secret, &public, &self.remote_dh)?;
        let old_secret = mem::replace(&mut self.dh_secret, Key::from_bytes(secret));
        secret.zeroize();
        drop(old_secret);
        self.dh_public = public;
        self.adopt_session(rx, tx)
    }

    /// Encrypt one application message. `timestamp` is expected to be
    /// pre-jittered by the framer.
    pub fn encrypt(
        &mut self,
        content: MessageContent,
        timestamp: i64,
        kind: Option<EnvelopeKind>,
    ) -> Result<Envelope, Fault> {
        if self.n_s >= ROTATE_AFTER {
            self.rotate()?;
        }

        let message = ChatMessage {
            content,
            timestamp,
            counter: self.n_s,
            dh_key: self.dh_public,
        };
        let plaintext = InnerPlaintext::Message(message).to_bytes()?;
        let envelope = self.seal(self.n_s, &plaintext, kind)?;
        self.n_s += 1;
        Ok(envelope)
    }

    /// Seal a keep-alive under the current chain position without
    /// advancing `n_s`. The payload is 32 random bytes, so after
    /// framing the datagram is indistinguishable from a short
    /// message.
    pub fn seal_keepalive(&mut self, timestamp: i64) -> Result<Envelope, Fault> {
        let mut cover = vec![0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut cover);
        let plaintext = InnerPlaintext::Control(ControlFrame::Keepalive { timestamp, cover })
            .to_bytes()?;
        self.seal(self.n_s, &plaintext, None)
    }

    /// Same for the immediate acknowledgement.
    pub fn seal_keepalive_ack(&mut self, timestamp: i64) -> Result<Envelope, Fault> {
        let plaintext =
            InnerPlaintext::Control(ControlFrame::KeepaliveAck { timestamp }).to_bytes()?;
        self.seal(self.n_s, &plaintext, None)
    }

    fn seal(
        &self,
        counter: u32,
        plaintext: &[u8],
        kind: Option<EnvelopeKind>,
    ) -> Result<Envelope, Fault> {
        let k_m = kdf_subkey(&self.sending, counter as u64, CTX_MESSAGE)?;
        let nonce = random_nonce();
        let cipher = aead_seal(&k_m, &nonce, plaintext)?;
        let sig = sign(self.signing_seed.as_bytes(), &cipher);
        Ok(Envelope {
            nonce,
            cipher,
            sig,
            dh: self.dh_public,
            kind,
        })
    }

    /// Open one envelope. Signature first, then the rotation follow
    /// if the sender shows a new ratchet key, then AEAD, replay
    /// bookkeeping, and counter advance.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Decrypted, Fault> {
        verify_sig(&self.remote_verify, &envelope.cipher, &envelope.sig)?;

        if !ct_eq(&envelope.dh, &self.remote_dh) {
            return self.decrypt_after_rotation(envelope);
        }

        let k_m = kdf_subkey(&self.receiving, self.n_r as u64, CTX_MESSAGE)?;
        match aead_open(&k_m, &envelope.nonce, &envelope.cipher) {
            Ok(plaintext) => self.accept(envelope, &plaintext),
            Err(_) => Err(self.classify_failure(envelope)),
        }
    }

    /// The peer rotated: re-derive with our current keypair and its
    /// new public key, but commit nothing until the envelope opens
    /// under the candidate chains. The envelope `dh` field is outside
    /// the signature, so an unverified value must not corrupt state.
    fn decrypt_after_rotation(&mut self, envelope: &Envelope) -> Result<Decrypted, Fault> {
        let (rx, tx) = session_keys(self.dh_secret.as_bytes(), &self.dh_public, &envelope.dh)?;
        let initiator = is_initiator(&self.dh_public, &envelope.dh);
        let root = pick_root(rx, tx, initiator);
        let (sending, receiving) = derive_chains(&root, initiator)?;

        let k_m = kdf_subkey(&receiving, 0, CTX_MESSAGE)?;
        let plaintext = aead_open(&k_m, &envelope.nonce, &envelope.cipher)
            .map_err(|_| Fault::Auth("envelope does not open under rotated chain".into()))?;

        self.remote_dh = envelope.dh;
        self.install_chains(root, sending, receiving);
        self.accept(envelope, &plaintext)
    }

    fn accept(&mut self, envelope: &Envelope, plaintext: &[u8]) -> Result<Decrypted, Fault> {
        match InnerPlaintext::from_bytes(plaintext)? {
            InnerPlaintext::Control(ControlFrame::Keepalive { timestamp, .. }) => {
                Ok(Decrypted::Keepalive { timestamp })
            }
            InnerPlaintext::Control(ControlFrame::KeepaliveAck { timestamp }) => {
                Ok(Decrypted::KeepaliveAck { timestamp })
            }
            InnerPlaintext::Control(_) => {
                Err(Fault::Codec("verification frame inside an envelope".into()))
            }
            InnerPlaintext::Message(message) => {
                if !ct_eq(&message.dh_key, &envelope.dh) {
                    return Err(Fault::Auth(
                        "ratchet key mismatch between envelope and message".into(),
                    ));
                }
                if message.counter != self.n_r {
                    return Err(Fault::Codec(format!(
                        "message counter {} does not match chain position {}",
                        message.counter, self.n_r
                    )));
                }
                let id = (self.epoch, message.counter, message.timestamp);
                if self.replay.contains(&id) {
                    return Err(Fault::Replay {
                        counter: message.counter,
                        timestamp: message.timestamp,
                    });
                }
                self.replay.insert(id);
                self.n_r += 1;
                Ok(Decrypted::Message {
                    message,
                    kind: envelope.kind,
                })
            }
        }
    }

    /// The primary open failed on a sender-authentic envelope. Walk
    /// the bounded window of earlier counters on the current chain:
    /// an envelope that opens there was accepted before and is a
    /// replay. Anything else is an auth fault.
    fn classify_failure(&self, envelope: &Envelope) -> Fault {
        let lower = self.n_r.saturating_sub(REPLAY_WINDOW);
        for counter in lower..self.n_r {
            let Ok(k_m) = kdf_subkey(&self.receiving, counter as u64, CTX_MESSAGE) else {
                continue;
            };
            let Ok(plaintext) = aead_open(&k_m, &envelope.nonce, &envelope.cipher) else {
                continue;
            };
            return match InnerPlaintext::from_bytes(&plaintext) {
                Ok(InnerPlaintext::Message(m)) => Fault::Replay {
                    counter: m.counter,
                    timestamp: m.timestamp,
                },
                Ok(InnerPlaintext::Control(ControlFrame::Keepalive { timestamp, .. })) => {
                    Fault::Replay { counter, timestamp }
                }
                _ => Fault::Replay { counter, timestamp: 0 },
            };
        }
        Fault::Auth("AEAD tag mismatch".into())
    }

    /// Zero every key buffer. Runs on drop; callable earlier by
    /// `cleanup()` so teardown order does not depend on drop order.
    pub fn wipe(&mut self) {
        self.dh_secret.wipe();
        self.signing_seed.wipe();
        self.root.wipe();
        self.sending.wipe();
        self.receiving.wipe();
        self.replay.clear();
        self.n_s = 0;
        self.n_r = 0;
    }

    /// True once every owned key buffer reads as zeros.
    pub fn is_wiped(&self) -> bool {
        self.dh_secret.is_zeroed()
            && self.signing_seed.is_zeroed()
            && self.root.is_zeroed()
            && self.sending.is_zeroed()
            && self.receiving.is_zeroed()
    }

    /// Adopt a fresh session-key pair: pick the shared root, wipe and
    /// re-derive both chains, reset counters, advance the epoch.
    fn adopt_session(&mut self, rx: Key, tx: Key) -> Result<(), Fault> {
        let initiator = is_initiator(&self.dh_public, &self.remote_dh);
        let root = pick_root(rx, tx, initiator);
        let (sending, receiving) = derive_chains(&root, initiator)?;
        self.install_chains(root, sending, receiving);
        Ok(())
    }

    fn install_chains(&mut self, root: Key, sending: Key, receiving: Key) {
        let mut old = mem::replace(&mut self.root, root);
        old.wipe();
        let mut old = mem::replace(&mut self.sending, sending);
        old.wipe();
        let mut old = mem::replace(&mut self.receiving, receiving);
        old.wipe();
        self.n_s = 0;
        self.n_r = 0;
        self.epoch += 1;
        let current = self.epoch;
        self.replay.retain(|(epoch, _, _)| epoch + 1 >= current);
    }
}

/// Both peers must share one root: the initiator-direction session
/// subkey is the initiator's tx and the responder's rx, so selecting
/// by role lands on the same 32 bytes on both sides. The unused
/// directional key zeroizes on drop.
fn pick_root(rx: Key, tx: Key, initiator: bool) -> Key {
    if initiator {
        tx
    } else {
        rx
    }
}

/// sending = KDF(root, 1, "sending"), receiving = KDF(root, 2,
/// "receivin"), swapped for the responder so the chains line up
/// across the wire.
fn derive_chains(root: &Key, initiator: bool) -> Result<(Key, Key), Fault> {
    let k1 = kdf_subkey(root, ID_SENDING, CTX_SENDING)?;
    let k2 = kdf_subkey(root, ID_RECEIVING, CTX_RECEIVING)?;
    Ok(if initiator { (k1, k2) } else { (k2, k1) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Ratchet, Ratchet) {
        let alice_id = LocalIdentity::generate();
        let bob_id = LocalIdentity::generate();
        let alice = Ratchet::initialize(&alice_id, &bob_id.bundle()).unwrap();
        let bob = Ratchet::initialize(&bob_id, &alice_id.bundle()).unwrap();
        (alice, bob)
    }

    fn text(s: &str) -> MessageContent {
        MessageContent::Text(s.to_string())
    }

    fn unwrap_text(decrypted: Decrypted) -> String {
        match decrypted {
            Decrypted::Message {
                message:
                    ChatMessage {
                        content: MessageContent::Text(t),
                        ..
                    },
                ..
            } => t,
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn round_trip() {
        let (mut alice, mut bob) = pair();
        let envelope = alice.encrypt(text("hello"), 1_000, None).unwrap();
        assert_eq!(unwrap_text(bob.decrypt(&envelope).unwrap()), "hello");
        assert_eq!(alice.counters().0, 1);
        assert_eq!(bob.counters().1, 1);
    }

    #[test]
    fn both_directions() {
        let (mut alice, mut bob) = pair();
        for i in 0..10 {
            let e = alice.encrypt(text(&format!("a{i}")), i, None).unwrap();
            assert_eq!(unwrap_text(bob.decrypt(&e).unwrap()), format!("a{i}"));
            let e = bob.encrypt(text(&format!("b{i}")), i, None).unwrap();
            assert_eq!(unwrap_text(alice.decrypt(&e).unwrap()), format!("b{i}"));
        }
    }

    #[test]
    fn mirrored_counter_sequences() {
        let (mut alice, mut bob) = pair();
        for i in 0..20i64 {
            assert_eq!(alice.counters().0, bob.counters().1);
            let e = alice.encrypt(text("tick"), i, None).unwrap();
            bob.decrypt(&e).unwrap();
        }
        assert_eq!(alice.counters().0, 20);
        assert_eq!(bob.counters().1, 20);
    }

    #[test]
    fn rotation_after_one_hundred_sends() {
        let (mut alice, mut bob) = pair();

        let mut dh_at_100 = [0u8; 32];
        for i in 0..101i64 {
            let e = alice.encrypt(text(&format!("m{i}")), i, None).unwrap();
            if i == 99 {
                dh_at_100 = e.dh;
            }
            if i == 100 {
                // The 101st envelope carries a fresh ratchet key.
                assert_ne!(e.dh, dh_at_100);
            }
            assert_eq!(unwrap_text(bob.decrypt(&e).unwrap()), format!("m{i}"));
        }

        // The receiver followed the rotation: one message into the
        // new chain.
        assert_eq!(bob.counters().1, 1);
        assert_eq!(alice.counters().0, 1);
        assert_eq!(alice.epoch(), bob.epoch());
    }

    #[test]
    fn conversation_survives_rotation() {
        let (mut alice, mut bob) = pair();
        for i in 0..101i64 {
            let e = alice.encrypt(text("fill"), i, None).unwrap();
            bob.decrypt(&e).unwrap();
        }
        // Bob replies on the rotated chains.
        let e = bob.encrypt(text("still here"), 0, None).unwrap();
        assert_eq!(unwrap_text(alice.decrypt(&e).unwrap()), "still here");
    }

    #[test]
    fn replay_is_detected() {
        let (mut alice, mut bob) = pair();
        let envelope = alice.encrypt(text("once"), 42, None).unwrap();
        bob.decrypt(&envelope).unwrap();

        let err = bob.decrypt(&envelope).unwrap_err();
        assert_eq!(err.kind(), "replay");
    }

    #[test]
    fn replay_of_older_message_is_detected() {
        let (mut alice, mut bob) = pair();
        let first = alice.encrypt(text("first"), 1, None).unwrap();
        bob.decrypt(&first).unwrap();
        for i in 0..5i64 {
            let e = alice.encrypt(text("more"), i, None).unwrap();
            bob.decrypt(&e).unwrap();
        }
        let err = bob.decrypt(&first).unwrap_err();
        assert_eq!(err.kind(), "replay");
    }

    #[test]
    fn bit_flips_are_auth_faults() {
        let (mut alice, mut bob) = pair();
        let envelope = alice.encrypt(text("payload"), 7, None).unwrap();

        for i in 0..envelope.cipher.len() {
            let mut tampered = envelope.clone();
            tampered.cipher[i] ^= 1;
            assert_eq!(bob.decrypt(&tampered).unwrap_err().kind(), "auth");
        }

        let mut tampered = envelope.clone();
        tampered.sig[0] ^= 1;
        assert_eq!(bob.decrypt(&tampered).unwrap_err().kind(), "auth");

        // The untampered original still opens: the session survived.
        assert_eq!(unwrap_text(bob.decrypt(&envelope).unwrap()), "payload");
    }

    #[test]
    fn foreign_signature_is_an_auth_fault() {
        let (mut alice, mut bob) = pair();
        let mallory = LocalIdentity::generate();
        let envelope = alice.encrypt(text("hi"), 0, None).unwrap();
        let mut forged = envelope.clone();
        forged.sig = sign(&mallory.signing_key_bytes(), &forged.cipher);

        assert_eq!(bob.decrypt(&forged).unwrap_err().kind(), "auth");
        // The injected envelope advanced nothing; the genuine one
        // still opens and the session stays usable.
        assert_eq!(unwrap_text(bob.decrypt(&envelope).unwrap()), "hi");
        let e = alice.encrypt(text("still fine"), 1, None).unwrap();
        assert_eq!(unwrap_text(bob.decrypt(&e).unwrap()), "still fine");
    }

    #[test]
    fn keepalives_hold_counters_still() {
        let (mut alice, mut bob) = pair();
        let e = alice.encrypt(text("real"), 0, None).unwrap();
        bob.decrypt(&e).unwrap();

        for i in 0..5i64 {
            let ka = alice.seal_keepalive(i).unwrap();
            match bob.decrypt(&ka).unwrap() {
                Decrypted::Keepalive { timestamp } => assert_eq!(timestamp, i),
                other => panic!("expected keepalive, got {other:?}"),
            }
        }
        assert_eq!(alice.counters().0, 1);
        assert_eq!(bob.counters().1, 1);

        // Real traffic still flows at the unchanged position.
        let e = alice.encrypt(text("after"), 9, None).unwrap();
        assert_eq!(unwrap_text(bob.decrypt(&e).unwrap()), "after");
    }

    #[test]
    fn keepalive_ack_round_trip() {
        let (mut alice, mut bob) = pair();
        let ack = bob.seal_keepalive_ack(77).unwrap();
        match alice.decrypt(&ack).unwrap() {
            Decrypted::KeepaliveAck { timestamp } => assert_eq!(timestamp, 77),
            other => panic!("expected keepalive ack, got {other:?}"),
        }
        assert_eq!(alice.counters(), (0, 0));
    }

    #[test]
    fn tampered_ratchet_key_does_not_corrupt_state() {
        let (mut alice, mut bob) = pair();
        let envelope = alice.encrypt(text("genuine"), 0, None).unwrap();
        let mut tampered = envelope.clone();
        tampered.dh = [0x42; 32];

        // The open under the bogus candidate chain fails and the
        // rotation is not committed.
        assert_eq!(bob.decrypt(&tampered).unwrap_err().kind(), "auth");

        // State is intact: the genuine envelope and the next one both
        // open.
        assert_eq!(unwrap_text(bob.decrypt(&envelope).unwrap()), "genuine");
        let e = alice.encrypt(text("next"), 1, None).unwrap();
        assert_eq!(unwrap_text(bob.decrypt(&e).unwrap()), "next");
    }

    #[test]
    fn wipe_zeroizes_every_key() {
        let (mut alice, mut bob) = pair();
        let e = alice.encrypt(text("x"), 0, None).unwrap();
        bob.decrypt(&e).unwrap();

        assert!(!alice.is_wiped());
        alice.wipe();
        assert!(alice.is_wiped());
        bob.wipe();
        assert!(bob.is_wiped());
    }

    #[test]
    fn file_kind_passes_through() {
        let (mut alice, mut bob) = pair();
        let e = alice
            .encrypt(text("chunk stand-in"), 0, Some(EnvelopeKind::File))
            .unwrap();
        match bob.decrypt(&e).unwrap() {
            Decrypted::Message { kind, .. } => assert_eq!(kind, Some(EnvelopeKind::File)),
            other => panic!("expected message, got {other:?}"),
        }
    }
}
