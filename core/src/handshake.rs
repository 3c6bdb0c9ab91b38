//! Handshake: a two-flight signed-ECDH state machine that
//! derives a mutually authenticated session key, converging both peers on
//! the same key regardless of who opens the conversation first.
//!
//! The relay round-trips are abstracted behind [`HandshakeTransport`] so
//! this module stays transport-agnostic: the same resolution algorithm
//! runs whether the caller is talking HTTP, a test double, or (in
//! `relay`'s own integration tests) an in-process Axum router.

use crate::canonical::SignedFields;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::session_key::SessionKeyTable;
use crate::vault::KeyVault;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::{PublicKey as DhPublicKey, SecretKey as DhSecretKey};
use sha2::{Digest, Sha256};

const EXCHANGE_TTL_MS: i64 = 10 * 60 * 1000;
const TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

/// An ephemeral ECDH pair generated at the start of a handshake role. The
/// private scalar is what gets password-wrapped into `IdentityStore` so a
/// page reload can resume an in-flight handshake within the TTL.
pub struct ExchangePair {
    pub exchange_id: String,
    secret: DhSecretKey,
    pub created_at_ms: i64,
}

impl ExchangePair {
    pub fn generate(exchange_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            secret: DhSecretKey::random(&mut rand_core::OsRng),
            created_at_ms: now_ms,
        }
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.secret.public_key().to_sec1_bytes())
    }

    pub fn to_private_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    pub fn from_private_bytes(exchange_id: impl Into<String>, bytes: &[u8], created_at_ms: i64) -> CoreResult<Self> {
        let secret = DhSecretKey::from_slice(bytes).map_err(|_| CoreError::ExchangeLost)?;
        Ok(Self {
            exchange_id: exchange_id.into(),
            secret,
            created_at_ms,
        })
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.created_at_ms > EXCHANGE_TTL_MS
    }

    /// Raw 256-bit ECDH shared secret with `their_public_b64` (SEC1 bytes).
    fn shared_secret(&self, their_public_b64: &str) -> CoreResult<[u8; 32]> {
        let bytes = BASE64.decode(their_public_b64).map_err(|_| CoreError::BadSignature)?;
        let their_public = DhPublicKey::from_sec1_bytes(&bytes).map_err(|_| CoreError::BadSignature)?;
        let shared = diffie_hellman(&self.secret.to_nonzero_scalar(), their_public.as_affine());
        let mut z = [0u8; 32];
        z.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(z)
    }
}

/// Derives the 256-bit session key. Symmetric in the peers:
/// whichever side computes this, `self_id`/`other_id` are sorted before
/// being folded into the HKDF `info` string, so both arrive at the same
/// key. Ephemeral public keys are deliberately NOT folded into `info`:
/// each peer observes a different ephemeral public in INITIATE vs RESPOND,
/// so doing so would break symmetry. Channel binding instead rests on the
/// signed INITIATE/RESPOND messages alone.
pub fn derive_session_key(shared_secret: &[u8; 32], self_id: &str, other_id: &str) -> [u8; 32] {
    let mut ids = [self_id, other_id];
    ids.sort_unstable();
    let info = format!("Cipherlink-Session-Key-{}-{}", ids[0], ids[1]);
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// `{type, from, to, publicKey, timestamp}` plus a detached signature over
/// the canonical serialization of those five fields.
/// Used for both INITIATE and RESPOND; `message_type` carries which.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DhHandshakeMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "publicKey")]
    pub public_key_b64: String,
    pub timestamp: i64,
    pub signature: String,
}

/// `{type, from, to, hash}`, not identity-signed; the hash
/// itself binds sender, recipient, and timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfirmMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: String,
    pub to: String,
    pub hash: String,
}

fn sign_dh_message(
    message_type: &str,
    from: &str,
    to: &str,
    public_key_b64: &str,
    timestamp: i64,
    identity: &IdentityKeyPair,
) -> CoreResult<DhHandshakeMessage> {
    let fields = SignedFields {
        message_type: message_type.to_string(),
        from_user_id: from.to_string(),
        to_user_id: to.to_string(),
        public_key_b64: public_key_b64.to_string(),
        timestamp,
    };
    let signature = identity.sign(&fields.canonical_bytes())?;
    Ok(DhHandshakeMessage {
        message_type: message_type.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        public_key_b64: public_key_b64.to_string(),
        timestamp,
        signature: BASE64.encode(signature),
    })
}

/// Verifies `msg` against `signer`'s registered identity key:
/// checks the message type tag, the ±5 minute timestamp window, then the
/// detached signature over the canonical five fields.
fn verify_dh_message(
    msg: &DhHandshakeMessage,
    expected_type: &str,
    signer: &IdentityPublicKey,
    clock: &dyn Clock,
) -> CoreResult<()> {
    if msg.message_type != expected_type {
        tracing::warn!(event = "invalid_signature", reason = "unexpected message type");
        return Err(CoreError::BadSignature);
    }
    let now_ms = clock.now_ms();
    if (now_ms - msg.timestamp).abs() > TIMESTAMP_SKEW_MS {
        tracing::warn!(event = "invalid_signature", reason = "timestamp out of range");
        return Err(CoreError::BadSignature);
    }
    let fields = SignedFields {
        message_type: msg.message_type.clone(),
        from_user_id: msg.from.clone(),
        to_user_id: msg.to.clone(),
        public_key_b64: msg.public_key_b64.clone(),
        timestamp: msg.timestamp,
    };
    let signature = BASE64.decode(&msg.signature).map_err(|_| CoreError::BadSignature)?;
    signer.verify(&fields.canonical_bytes(), &signature).map_err(|e| {
        tracing::warn!(event = "invalid_signature", from = %msg.from);
        e
    })
}

fn confirm_hash(sender_id: &str, recipient_id: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"KEY-CONFIRMED");
    hasher.update(sender_id.as_bytes());
    hasher.update(recipient_id.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Round-trips to the relay needed by the resolution algorithm, kept
/// abstract so `core` never depends on an HTTP client directly.
#[async_trait(?Send)]
pub trait HandshakeTransport {
    async fn fetch_identity_public_key(&self, user_id: &str) -> CoreResult<IdentityPublicKey>;
    /// An incoming INITIATE addressed to `self_id` from `peer_id`, if any
    /// PendingExchange exists where `self_id` is the responder and no
    /// response has been stored yet.
    async fn fetch_pending_initiate(&self, self_id: &str, peer_id: &str) -> CoreResult<Option<DhHandshakeMessage>>;
    async fn submit_initiate(&self, msg: &DhHandshakeMessage) -> CoreResult<()>;
    async fn submit_respond(&self, msg: &DhHandshakeMessage) -> CoreResult<()>;
    /// The RESPOND to an INITIATE `self_id` previously sent to `peer_id`,
    /// if the relay has recorded one, paired with the original INITIATE so
    /// the initiator can re-verify its own signature against the copy the
    /// relay echoed back.
    async fn fetch_response(&self, self_id: &str, peer_id: &str) -> CoreResult<Option<HandshakeResponse>>;
    async fn submit_confirm(&self, msg: &ConfirmMessage) -> CoreResult<()>;
}

/// A stored RESPOND together with the INITIATE it answers, as echoed back
/// by the relay.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HandshakeResponse {
    pub initiate: DhHandshakeMessage,
    pub respond: DhHandshakeMessage,
}

/// Outcome of a completed handshake, ready to install into a
/// [`SessionKeyTable`] and, optionally, persist via `IdentityStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub peer_id: String,
    pub session_key: [u8; 32],
}

/// Where `open_conversation` left the {self, peer} pair.
/// `Idle`/`Failed` are not represented: the former is simply "call again
/// later", the latter is the `Err` variant of the enclosing `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    Established(HandshakeOutcome),
    AwaitingResponse,
    AwaitingConfirm,
}

/// Drives one resolution step of the state machine. Callers
/// poll this on a timer or in response to a relay push notification;
/// repeated calls are safe and idempotent once `Established` is reached.
#[allow(clippy::too_many_arguments)]
pub async fn open_conversation<V: KeyVault, T: HandshakeTransport, C: Clock>(
    self_id: &str,
    peer_id: &str,
    identity: &IdentityKeyPair,
    vault: &V,
    transport: &T,
    session_keys: &SessionKeyTable<C>,
    password: &str,
    clock: &C,
) -> CoreResult<HandshakeProgress> {
    // Priority 1: an established session already exists.
    if let Some(sk) = session_keys.get(peer_id) {
        return Ok(HandshakeProgress::Established(HandshakeOutcome {
            peer_id: peer_id.to_string(),
            session_key: sk.key,
        }));
    }
    if let Ok(key) = vault.load_session_key(peer_id, password).await {
        session_keys.install(peer_id, key);
        return Ok(HandshakeProgress::Established(HandshakeOutcome {
            peer_id: peer_id.to_string(),
            session_key: key,
        }));
    }

    // Priority 2: respond to an incoming, unanswered INITIATE.
    if let Some(initiate) = transport.fetch_pending_initiate(self_id, peer_id).await? {
        return responder_path(self_id, peer_id, &initiate, identity, vault, transport, session_keys, password, clock)
            .await;
    }

    // Priority 3: complete our own INITIATE now that a RESPOND exists.
    if let Some(HandshakeResponse { initiate, respond }) = transport.fetch_response(self_id, peer_id).await? {
        return initiator_completion_path(
            self_id, peer_id, &initiate, &respond, identity, vault, transport, session_keys, password, clock,
        )
        .await;
    }

    // Priority 4: nothing in flight, open a fresh exchange.
    initiator_path(self_id, peer_id, identity, vault, transport, password, clock).await
}

#[allow(clippy::too_many_arguments)]
async fn responder_path<V: KeyVault, T: HandshakeTransport, C: Clock>(
    self_id: &str,
    peer_id: &str,
    initiate: &DhHandshakeMessage,
    identity: &IdentityKeyPair,
    vault: &V,
    transport: &T,
    session_keys: &SessionKeyTable<C>,
    password: &str,
    clock: &C,
) -> CoreResult<HandshakeProgress> {
    let initiator_identity = transport
        .fetch_identity_public_key(peer_id)
        .await
        .map_err(|_| CoreError::NoPeerIdentity)?;
    verify_dh_message(initiate, "INITIATE", &initiator_identity, clock)?;

    let exchange_id = uuid::Uuid::new_v4().to_string();
    let pair = ExchangePair::generate(&exchange_id, clock.now_ms());

    let respond = sign_dh_message(
        "RESPOND",
        self_id,
        peer_id,
        &pair.public_key_b64(),
        clock.now_ms(),
        identity,
    )?;
    transport.submit_respond(&respond).await?;

    let shared = pair.shared_secret(&initiate.public_key_b64)?;
    let session_key = derive_session_key(&shared, self_id, peer_id);

    vault.store_session_key(peer_id, &session_key, password).await?;
    session_keys.install(peer_id, session_key);

    let confirm_ts = clock.now_ms();
    let confirm = ConfirmMessage {
        message_type: "CONFIRM".to_string(),
        from: self_id.to_string(),
        to: peer_id.to_string(),
        hash: confirm_hash(self_id, peer_id, confirm_ts),
    };
    transport.submit_confirm(&confirm).await?;

    Ok(HandshakeProgress::Established(HandshakeOutcome {
        peer_id: peer_id.to_string(),
        session_key,
    }))
}

#[allow(clippy::too_many_arguments)]
async fn initiator_completion_path<V: KeyVault, T: HandshakeTransport, C: Clock>(
    self_id: &str,
    peer_id: &str,
    initiate: &DhHandshakeMessage,
    respond: &DhHandshakeMessage,
    identity: &IdentityKeyPair,
    vault: &V,
    transport: &T,
    session_keys: &SessionKeyTable<C>,
    password: &str,
    clock: &C,
) -> CoreResult<HandshakeProgress> {
    // Re-verify the relay's echoed copy of our own INITIATE against our own
    // registered identity key, so a relay that tampers with the echoed
    // fields is caught before the session key is derived from them.
    verify_dh_message(initiate, "INITIATE", &identity.public_key()?, clock)?;

    let responder_identity = transport
        .fetch_identity_public_key(peer_id)
        .await
        .map_err(|_| CoreError::NoPeerIdentity)?;
    verify_dh_message(respond, "RESPOND", &responder_identity, clock)?;

    let exchange_id = format!("{self_id}:{peer_id}");
    let stored = vault
        .load_exchange_private(&exchange_id, password)
        .await
        .map_err(|_| CoreError::ExchangeLost)?;
    let pair = ExchangePair::from_private_bytes(exchange_id.clone(), &stored.private_scalar, clock.now_ms())?;
    if pair.is_expired(clock.now_ms()) {
        let _ = vault.delete_exchange_private(&exchange_id).await;
        return Err(CoreError::ExchangeLost);
    }

    let shared = pair.shared_secret(&respond.public_key_b64)?;
    let session_key = derive_session_key(&shared, self_id, peer_id);

    vault.store_session_key(peer_id, &session_key, password).await?;
    let _ = vault.delete_exchange_private(&exchange_id).await;
    session_keys.install(peer_id, session_key);

    let confirm_ts = clock.now_ms();
    let confirm = ConfirmMessage {
        message_type: "CONFIRM".to_string(),
        from: self_id.to_string(),
        to: peer_id.to_string(),
        hash: confirm_hash(self_id, peer_id, confirm_ts),
    };
    transport.submit_confirm(&confirm).await?;

    Ok(HandshakeProgress::Established(HandshakeOutcome {
        peer_id: peer_id.to_string(),
        session_key,
    }))
}

async fn initiator_path<V: KeyVault, T: HandshakeTransport, C: Clock>(
    self_id: &str,
    peer_id: &str,
    identity: &IdentityKeyPair,
    vault: &V,
    transport: &T,
    password: &str,
    clock: &C,
) -> CoreResult<HandshakeProgress> {
    let exchange_id = format!("{self_id}:{peer_id}");
    let pair = ExchangePair::generate(&exchange_id, clock.now_ms());
    vault
        .store_exchange_private(&exchange_id, &pair.to_private_bytes(), password)
        .await?;

    let initiate = sign_dh_message(
        "INITIATE",
        self_id,
        peer_id,
        &pair.public_key_b64(),
        clock.now_ms(),
        identity,
    )?;
    transport.submit_initiate(&initiate).await?;

    Ok(HandshakeProgress::AwaitingResponse)
}
