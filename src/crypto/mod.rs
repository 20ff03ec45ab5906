pub mod ratchet;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Fault;

/// AEAD nonce length (XChaCha20-Poly1305-IETF).
pub const NONCE_LEN: usize = 24;
/// Detached Ed25519 signature length.
pub const SIG_LEN: usize = 64;
/// Every chain, root, and message key is exactly this long.
pub const KEY_LEN: usize = 32;

const KX_INITIATOR_INFO: &[u8] = b"sotto-kx-i2r";
const KX_RESPONDER_INFO: &[u8] = b"sotto-kx-r2i";

/// A 32-byte secret that overwrites itself with zeros on drop.
///
/// Never cloned into growable buffers; callers borrow the bytes for
/// the duration of a single primitive call.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Wipe in place ahead of drop. Used when a key's last use is
    /// earlier than the end of its owner's lifetime.
    pub fn wipe(&mut self) {
        self.0.zeroize();
    }

    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Public half of a peer's identity material, exchanged out-of-band
/// before the session starts: X25519 agreement key plus Ed25519
/// verifying key (signatures never use the agreement key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub dh: [u8; 32],
    pub sig: [u8; 32],
}

impl PreKeyBundle {
    pub const LEN: usize = 64;

    /// Wire form: dh ‖ sig. This byte string is also the bundle input
    /// to room-PSK derivation.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..32].copy_from_slice(&self.dh);
        out[32..].copy_from_slice(&self.sig);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fault> {
        if bytes.len() != Self::LEN {
            return Err(Fault::Codec(format!(
                "pre-key bundle must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut dh = [0u8; 32];
        let mut sig = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        sig.copy_from_slice(&bytes[32..]);
        Ok(Self { dh, sig })
    }
}

/// Local identity: both secret halves of the pre-key bundle.
pub struct LocalIdentity {
    dh_secret: StaticSecret,
    dh_public: PublicKey,
    signing: SigningKey,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        let dh_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh_public = PublicKey::from(&dh_secret);
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            dh_secret,
            dh_public,
            signing,
        }
    }

    pub fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            dh: *self.dh_public.as_bytes(),
            sig: self.signing.verifying_key().to_bytes(),
        }
    }

    pub fn dh_secret_bytes(&self) -> [u8; 32] {
        self.dh_secret.to_bytes()
    }

    pub fn dh_public_bytes(&self) -> [u8; 32] {
        *self.dh_public.as_bytes()
    }

    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Secret wire form for handing an identity to another process:
    /// dh secret ‖ signing seed. The public bundle is derivable.
    pub fn to_secret_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.dh_secret.to_bytes());
        out[32..].copy_from_slice(&self.signing.to_bytes());
        out
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, Fault> {
        if bytes.len() != 64 {
            return Err(Fault::Codec(format!(
                "identity secret must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut dh = [0u8; 32];
        let mut seed = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        seed.copy_from_slice(&bytes[32..]);
        let dh_secret = StaticSecret::from(dh);
        let dh_public = PublicKey::from(&dh_secret);
        Ok(Self {
            dh_secret,
            dh_public,
            signing: SigningKey::from_bytes(&seed),
        })
    }
}

/// Generate an ephemeral X25519 keypair as raw bytes.
pub fn dh_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), *public.as_bytes())
}

/// X25519 agreement. Rejects a non-contributory result (all-zero
/// shared secret from a low-order public key).
pub fn dh_agree(secret: &[u8; 32], remote_pub: &[u8; 32]) -> Result<Key, Fault> {
    let secret = StaticSecret::from(*secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_pub));
    if !shared.was_contributory() {
        return Err(Fault::Crypto("non-contributory DH agreement".into()));
    }
    Ok(Key::from_bytes(shared.to_bytes()))
}

/// Client-session agreement: derive the two directional 32-byte
/// session subkeys from a DH agreement, bound to both public keys.
///
/// The transcript orders the public keys initiator-first, so the pair
/// mirrors across the wire: initiator tx == responder rx.
pub fn session_keys(
    local_secret: &[u8; 32],
    local_pub: &[u8; 32],
    remote_pub: &[u8; 32],
) -> Result<(Key, Key), Fault> {
    let shared = dh_agree(local_secret, remote_pub)?;
    let initiator = is_initiator(local_pub, remote_pub);

    let mut transcript = [0u8; 64];
    let (first, second) = if initiator {
        (local_pub, remote_pub)
    } else {
        (remote_pub, local_pub)
    };
    transcript[..32].copy_from_slice(first);
    transcript[32..].copy_from_slice(second);

    let hk = Hkdf::<Sha256>::new(Some(&transcript), shared.as_bytes());
    let mut i2r = [0u8; KEY_LEN];
    let mut r2i = [0u8; KEY_LEN];
    hk.expand(KX_INITIATOR_INFO, &mut i2r)
        .map_err(|_| Fault::Crypto("kx subkey expand failed".into()))?;
    hk.expand(KX_RESPONDER_INFO, &mut r2i)
        .map_err(|_| Fault::Crypto("kx subkey expand failed".into()))?;

    let (rx, tx) = if initiator { (r2i, i2r) } else { (i2r, r2i) };
    Ok((Key::from_bytes(rx), Key::from_bytes(tx)))
}

/// Initiator role is decided by byte order of the two agreement
/// public keys, so both peers agree on it without negotiation.
pub fn is_initiator(local_pub: &[u8; 32], remote_pub: &[u8; 32]) -> bool {
    local_pub < remote_pub
}

/// Labelled subkey derivation: 32 bytes out of a 32-byte master key,
/// an 8-byte context string, and a 64-bit subkey id.
pub fn kdf_subkey(master: &Key, id: u64, ctx: &[u8; 8]) -> Result<Key, Fault> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut info = [0u8; 16];
    info[..8].copy_from_slice(ctx);
    info[8..].copy_from_slice(&id.to_le_bytes());
    let mut out = [0u8; KEY_LEN];
    hk.expand(&info, &mut out)
        .map_err(|_| Fault::Crypto("kdf subkey expand failed".into()))?;
    Ok(Key::from_bytes(out))
}

/// Fresh random 24-byte AEAD nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// XChaCha20-Poly1305-IETF encrypt, no associated data.
pub fn aead_seal(key: &Key, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, Fault> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| Fault::Crypto("AEAD encrypt failed".into()))
}

/// XChaCha20-Poly1305-IETF decrypt. A tag mismatch is an auth fault,
/// not a crypto fault: the primitive worked, the message did not.
pub fn aead_open(key: &Key, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, Fault> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Fault::Auth("AEAD tag mismatch".into()))
}

/// Detached Ed25519 signature over arbitrary bytes.
pub fn sign(signing_key: &[u8; 32], message: &[u8]) -> [u8; SIG_LEN] {
    let key = SigningKey::from_bytes(signing_key);
    key.sign(message).to_bytes()
}

pub fn verify_sig(
    verifying_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIG_LEN],
) -> Result<(), Fault> {
    let key = VerifyingKey::from_bytes(verifying_key)
        .map_err(|_| Fault::Auth("invalid verifying key".into()))?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| Fault::Auth("signature verification failed".into()))
}

/// Keyed MAC used by the peer verifier (room-PSK challenge/response).
pub fn auth(psk: &Key, message: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(psk.as_bytes(), message).as_bytes()
}

/// Constant-time MAC verification.
pub fn auth_verify(psk: &Key, message: &[u8], tag: &[u8; 32]) -> bool {
    ct_eq(&auth(psk, message), tag)
}

/// Constant-time equality over byte strings of equal length.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// 32-byte swarm join key: generic-hash of the room identifier.
pub fn swarm_key(room_id: &str) -> [u8; 32] {
    *blake3::hash(room_id.as_bytes()).as_bytes()
}

/// 32-byte room PSK: generic-hash of roomId ‖ preKeyBundle. Used only
/// for the peer-verification MAC.
pub fn room_psk(room_id: &str, bundle: &PreKeyBundle) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(room_id.as_bytes());
    hasher.update(&bundle.to_bytes());
    Key::from_bytes(*hasher.finalize().as_bytes())
}
