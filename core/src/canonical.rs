//! Canonical signed-message serialization.
//!
//! The signature input is the UTF-8 bytes of a JSON object with exactly five
//! fields, in order, with a single space after every colon and comma: the
//! default separators of a `json.dumps`-style stringifier, not serde_json's
//! default compact output (which has no spaces at all). We therefore hand
//! assemble the object instead of deriving `Serialize` for it, delegating
//! per-field quoting/escaping to `serde_json::to_string` so arbitrary user
//! ids still round-trip safely.

use serde::{Deserialize, Serialize};

/// The fields signed over in every handshake wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFields {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "fromUserId")]
    pub from_user_id: String,
    #[serde(rename = "toUserId")]
    pub to_user_id: String,
    #[serde(rename = "publicKey")]
    pub public_key_b64: String,
    pub timestamp: i64,
}

impl SignedFields {
    /// Produces the exact byte sequence both peers must sign and verify.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // unwrap: String, i64 serialization into serde_json::to_string never fails.
        let ty = serde_json::to_string(&self.message_type).unwrap();
        let from = serde_json::to_string(&self.from_user_id).unwrap();
        let to = serde_json::to_string(&self.to_user_id).unwrap();
        let key = serde_json::to_string(&self.public_key_b64).unwrap();
        format!(
            "{{\"type\": {}, \"fromUserId\": {}, \"toUserId\": {}, \"publicKey\": {}, \"timestamp\": {}}}",
            ty, from, to, key, self.timestamp
        )
        .into_bytes()
    }
}
