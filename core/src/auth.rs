//! Password authentication: nonce issuance, salted hashing, and the
//! joining peer's challenge buffering.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::protocol::{GameMessage, PasswordChallenge, PROTOCOL_VERSION};

pub const NONCE_BYTES: usize = 32;

/// Nonce generator and password digest. The RNG is owned per instance so
/// tests can seed it instead of patching a global.
pub struct PasswordHasher {
    rng: Mutex<StdRng>,
}

impl PasswordHasher {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic nonce sequence, for tests only.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// 32 random bytes rendered as 64 lowercase hex characters.
    pub fn generate_nonce(&self) -> String {
        let mut bytes = [0u8; NONCE_BYTES];
        self.rng.lock().fill(&mut bytes[..]);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Hex SHA-256 of `password ‖ nonce`.
    pub fn hash(password: &str, nonce: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(nonce.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-side verdict on a `Password` message. `consumed_nonce` must come
/// from the transport's read-once lookup; when it is `None` (never issued,
/// or already spent) the answer is `false` no matter what hash the peer
/// sent, so replayed messages cannot succeed.
pub fn verify_join(password: &str, consumed_nonce: Option<String>, claimed_hash: &str) -> bool {
    match consumed_nonce {
        Some(nonce) => PasswordHasher::hash(password, &nonce) == claimed_hash,
        None => false,
    }
}

/// What the joining peer should do next.
#[derive(Debug, PartialEq)]
pub enum HandshakeAction {
    /// Send this `Password` message to the host.
    SendPassword(GameMessage),
    /// Protocol versions differ; no password message may be sent.
    Incompatible { local: i32, remote: i32 },
}

/// Joining-peer state for the password handshake.
///
/// The challenge usually arrives before the user has typed a password, so
/// whichever side shows up first is buffered; the action fires once when
/// both are present, and never again.
#[derive(Default)]
pub struct JoinHandshake {
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    challenge: Option<PasswordChallenge>,
    password: Option<String>,
    done: bool,
}

impl JoinHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_challenge(&self, challenge: PasswordChallenge) -> Option<HandshakeAction> {
        let mut slots = self.slots.lock();
        slots.challenge = Some(challenge);
        Self::try_complete(&mut slots)
    }

    pub fn on_password(&self, password: &str) -> Option<HandshakeAction> {
        let mut slots = self.slots.lock();
        slots.password = Some(password.to_string());
        Self::try_complete(&mut slots)
    }

    fn try_complete(slots: &mut Slots) -> Option<HandshakeAction> {
        if slots.done || slots.challenge.is_none() || slots.password.is_none() {
            return None;
        }
        slots.done = true;
        let challenge = slots.challenge.take().expect("checked above");
        let password = slots.password.take().expect("checked above");

        if challenge.protocol_version != PROTOCOL_VERSION {
            return Some(HandshakeAction::Incompatible {
                local: PROTOCOL_VERSION,
                remote: challenge.protocol_version,
            });
        }
        Some(HandshakeAction::SendPassword(GameMessage::Password {
            password_hash: PasswordHasher::hash(&password, &challenge.nonce),
        }))
    }
}
