//! Room-membership verification.
//!
//! Before any ratchet traffic flows, each side proves knowledge of
//! the room PSK: a 32-byte random challenge goes out, the peer
//! answers with MAC(PSK, challenge), and the answer is checked in
//! constant time. The PSK is bound to the challenger's pre-key
//! bundle, so a responder answers under the PSK derived from its
//! peer's bundle and verifies under the PSK derived from its own.
//! The gate is mutual; each socket runs one verifier.

use std::sync::Arc;

use rand::RngCore;

use crate::crypto::{auth, auth_verify, Key};
use crate::error::Fault;
use crate::protocol::ControlFrame;

/// A peer that has not answered its challenge within this window is
/// dropped.
pub const VERIFY_TIMEOUT_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    /// Challenge sent, waiting for the peer's response.
    Pending,
    /// The peer's response checked out; message traffic may flow.
    Verified,
    /// Bad response or timeout; the socket is to be dropped.
    Failed,
}

pub struct PeerVerifier {
    state: VerifyState,
    challenge: [u8; 32],
    expires_at: i64,
    verified_at: Option<i64>,
    /// Checks responses to our challenge (PSK over our own bundle).
    verify_psk: Arc<Key>,
    /// Answers the peer's challenge (PSK over the peer's bundle).
    respond_psk: Arc<Key>,
    /// Set when the peer reports that our response satisfied it.
    remote_confirmed: bool,
}

impl PeerVerifier {
    /// Arm a verifier for a fresh connection. Returns the challenge
    /// frame to put on the wire.
    pub fn new(now_ms: i64, verify_psk: Arc<Key>, respond_psk: Arc<Key>) -> (Self, ControlFrame) {
        let mut challenge = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        let verifier = Self {
            state: VerifyState::Pending,
            challenge,
            expires_at: now_ms + VERIFY_TIMEOUT_MS,
            verified_at: None,
            verify_psk,
            respond_psk,
            remote_confirmed: false,
        };
        let frame = ControlFrame::VerificationChallenge { challenge };
        (verifier, frame)
    }

    pub fn state(&self) -> VerifyState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.state == VerifyState::Verified
    }

    pub fn remote_confirmed(&self) -> bool {
        self.remote_confirmed
    }

    /// When the peer's response checked out, milliseconds since the
    /// epoch.
    pub fn verified_at(&self) -> Option<i64> {
        self.verified_at
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.state == VerifyState::Pending && now_ms >= self.expires_at
    }

    /// The response window closed without a valid answer.
    pub fn expire(&mut self) -> Fault {
        self.state = VerifyState::Failed;
        self.challenge = [0u8; 32];
        Fault::Verify("no verification response within the timeout".into())
    }

    /// Feed one verification frame through the state machine.
    /// Returns the frame to send back, if any.
    pub fn handle(&mut self, frame: &ControlFrame, now_ms: i64) -> Result<Option<ControlFrame>, Fault> {
        match frame {
            ControlFrame::VerificationChallenge { challenge } => {
                // Answer the peer's challenge regardless of our own
                // pending one; verification is mutual.
                Ok(Some(ControlFrame::VerificationResponse {
                    response: auth(&self.respond_psk, challenge),
                }))
            }
            ControlFrame::VerificationResponse { response } => {
                if self.state != VerifyState::Pending {
                    return Err(Fault::Verify("unexpected verification response".into()));
                }
                if now_ms >= self.expires_at {
                    return Err(self.expire());
                }
                if auth_verify(&self.verify_psk, &self.challenge, response) {
                    self.state = VerifyState::Verified;
                    self.verified_at = Some(now_ms);
                    self.challenge = [0u8; 32];
                    Ok(Some(ControlFrame::VerificationSuccess { timestamp: now_ms }))
                } else {
                    self.state = VerifyState::Failed;
                    Err(Fault::Verify("verification response does not match".into()))
                }
            }
            ControlFrame::VerificationSuccess { .. } => {
                self.remote_confirmed = true;
                Ok(None)
            }
            _ => Err(Fault::Verify(
                "non-verification frame before verification".into(),
            )),
        }
    }
}
