//! AEADCodec: encodes/decodes `CipherRecord`s (messages) and
//! `CipherChunk`s (files). All encryption is AES-256-GCM with a fresh
//! random 12-byte IV per operation, keyed by the 256-bit `SessionKey`.

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, CoreResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

pub const TAG_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const NONCE_RAW_LEN: usize = 16;
pub const FILE_CHUNK_SIZE: usize = 1024 * 1024;
/// Records older than this are still decrypted, but flagged for diagnostics.
/// Freshness enforcement belongs to the relay's ReplayGate, not the codec.
const STALE_WARNING_MS: i64 = 10 * 60 * 1000;

fn cipher_for(key: &[u8; 32]) -> CoreResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| CoreError::Internal(format!("aead key init: {e}")))
}

fn fresh_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn fresh_nonce() -> String {
    let mut raw = [0u8; NONCE_RAW_LEN];
    OsRng.fill_bytes(&mut raw);
    BASE64.encode(raw)
}

fn seal(key: &[u8; 32], iv: &[u8; IV_LEN], plaintext: &[u8]) -> CoreResult<(Vec<u8>, [u8; TAG_LEN])> {
    let cipher = cipher_for(key)?;
    let nonce = GenericArray::from_slice(iv);
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CoreError::Internal(format!("aead seal: {e}")))?;
    if sealed.len() < TAG_LEN {
        return Err(CoreError::Internal("aead output shorter than tag".into()));
    }
    let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);
    Ok((sealed, tag))
}

fn open(key: &[u8; 32], iv: &[u8; IV_LEN], ciphertext: &[u8], tag: &[u8; TAG_LEN]) -> CoreResult<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = GenericArray::from_slice(iv);
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| CoreError::Undecipherable)
}

/// Per-conversation sequence counter and nonce source. Created explicitly
/// by the caller, not a process singleton, so tests can hold
/// several independent conversations in one process.
pub struct ConversationState<C: Clock = SystemClock> {
    sequences: Mutex<HashMap<String, u64>>,
    clock: C,
}

impl ConversationState<SystemClock> {
    pub fn new() -> Self {
        Self {
            sequences: Mutex::new(HashMap::new()),
            clock: SystemClock,
        }
    }
}

impl Default for ConversationState<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> ConversationState<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            sequences: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn next_sequence(&self, conversation_id: &str) -> u64 {
        let mut guard = self.sequences.lock().unwrap();
        let next = guard.get(conversation_id).copied().unwrap_or(0) + 1;
        guard.insert(conversation_id.to_string(), next);
        next
    }

    /// Explicit reset, permitted only after a new handshake completes.
    /// Never called implicitly by `encode_message`.
    pub fn reset_sequence(&self, conversation_id: &str) {
        self.sequences.lock().unwrap().remove(conversation_id);
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

/// A sealed text message, ready for transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherRecord {
    #[serde(with = "b64_vec")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64_array12")]
    pub iv: [u8; IV_LEN],
    #[serde(with = "b64_array16")]
    pub tag: [u8; TAG_LEN],
    pub timestamp: i64,
    pub sequence: u64,
    pub nonce: String,
}

/// Wire-shape counterpart with optional replay fields, matching the JSON a
/// relay actually receives/returns before it's been validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CipherRecordWire {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub timestamp: Option<i64>,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: Option<u64>,
    pub nonce: Option<String>,
}

impl From<&CipherRecord> for CipherRecordWire {
    fn from(record: &CipherRecord) -> Self {
        Self {
            ciphertext: BASE64.encode(&record.ciphertext),
            iv: BASE64.encode(record.iv),
            tag: BASE64.encode(record.tag),
            timestamp: Some(record.timestamp),
            sequence_number: Some(record.sequence),
            nonce: Some(record.nonce.clone()),
        }
    }
}

impl CipherRecordWire {
    /// Validates structural presence of the replay triple and nonce
    /// syntax, producing a fully-populated `CipherRecord`.
    pub fn into_record(self) -> CoreResult<CipherRecord> {
        let (timestamp, sequence, nonce) = match (self.timestamp, self.sequence_number, self.nonce) {
            (Some(t), Some(s), Some(n)) => (t, s, n),
            _ => return Err(CoreError::MissingReplayFields),
        };
        if nonce.len() < 16 || BASE64.decode(&nonce).is_err() {
            return Err(CoreError::BadNonce);
        }
        let ciphertext = BASE64.decode(&self.ciphertext).map_err(|_| CoreError::Undecipherable)?;
        let iv_bytes = BASE64.decode(&self.iv).map_err(|_| CoreError::Undecipherable)?;
        let tag_bytes = BASE64.decode(&self.tag).map_err(|_| CoreError::Undecipherable)?;
        let iv: [u8; IV_LEN] = iv_bytes.try_into().map_err(|_| CoreError::Undecipherable)?;
        let tag: [u8; TAG_LEN] = tag_bytes.try_into().map_err(|_| CoreError::Undecipherable)?;
        Ok(CipherRecord {
            ciphertext,
            iv,
            tag,
            timestamp,
            sequence,
            nonce,
        })
    }
}

/// Result of a successful decode: the plaintext plus a soft staleness flag,
/// surfaced purely for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub plaintext: String,
    pub stale: bool,
}

/// Encrypts `plaintext` for `conversation_id` under `key`, stamping the
/// replay-protection triple.
pub fn encode_message<C: Clock>(
    plaintext: &str,
    key: &[u8; 32],
    conversation_id: &str,
    conversation_state: &ConversationState<C>,
) -> CoreResult<CipherRecord> {
    let iv = fresh_iv();
    let (ciphertext, tag) = seal(key, &iv, plaintext.as_bytes())?;
    Ok(CipherRecord {
        ciphertext,
        iv,
        tag,
        timestamp: conversation_state.now_ms(),
        sequence: conversation_state.next_sequence(conversation_id),
        nonce: fresh_nonce(),
    })
}

/// Decrypts a validated `CipherRecord`. Freshness and sequence monotonicity
/// are NOT enforced here: that is the relay's `ReplayGate`.
pub fn decode_message<C: Clock>(
    record: &CipherRecord,
    key: &[u8; 32],
    clock: &C,
) -> CoreResult<DecodedMessage> {
    let plaintext_bytes = open(key, &record.iv, &record.ciphertext, &record.tag)?;
    let plaintext = String::from_utf8(plaintext_bytes).map_err(|_| CoreError::Undecipherable)?;
    let stale = clock.now_ms() - record.timestamp > STALE_WARNING_MS;
    Ok(DecodedMessage { plaintext, stale })
}

/// A single independently-sealed file chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherChunk {
    pub chunk_index: u32,
    #[serde(with = "b64_vec")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64_array12")]
    pub iv: [u8; IV_LEN],
    #[serde(with = "b64_array16")]
    pub tag: [u8; TAG_LEN],
}

/// Plaintext metadata plus the ordered list of sealed chunks.
/// Name/size/mime-type are plaintext to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEnvelope {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunks: Vec<CipherChunk>,
}

/// Splits `data` into 1 MiB chunks (last chunk may be shorter) and seals
/// each independently under its own IV/tag.
pub fn encrypt_file(
    data: &[u8],
    key: &[u8; 32],
    file_name: &str,
    mime_type: &str,
) -> CoreResult<FileEnvelope> {
    let mut chunks = Vec::new();
    for (index, plaintext_chunk) in data.chunks(FILE_CHUNK_SIZE).enumerate() {
        let iv = fresh_iv();
        let (ciphertext, tag) = seal(key, &iv, plaintext_chunk)?;
        chunks.push(CipherChunk {
            chunk_index: index as u32,
            ciphertext,
            iv,
            tag,
        });
    }
    let total_chunks = chunks.len() as u32;
    Ok(FileEnvelope {
        file_name: file_name.to_string(),
        file_size: data.len() as u64,
        mime_type: mime_type.to_string(),
        total_chunks,
        chunks,
    })
}

/// Reassembles plaintext in ascending `chunk_index` order. Chunks may be
/// handed in out of order; each decrypts independently of the others.
pub fn decrypt_file(envelope: &FileEnvelope, key: &[u8; 32]) -> CoreResult<Vec<u8>> {
    let mut ordered = envelope.chunks.clone();
    ordered.sort_by_key(|c| c.chunk_index);
    let mut out = Vec::with_capacity(envelope.file_size as usize);
    for chunk in &ordered {
        out.extend_from_slice(&open(key, &chunk.iv, &chunk.ciphertext, &chunk.tag)?);
    }
    Ok(out)
}

mod b64_vec {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_array12 {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 12], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 12], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 12 bytes"))
    }
}

mod b64_array16 {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}
