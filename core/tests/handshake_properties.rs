//! Black-box coverage of the handshake's session-symmetry and
//! signature-binding properties, driven through the public API with an
//! in-process relay double (no real transport involved).

use async_trait::async_trait;
use cipherlink_core::canonical::SignedFields;
use cipherlink_core::clock::FixedClock;
use cipherlink_core::error::{CoreError, CoreResult};
use cipherlink_core::handshake::{
    open_conversation, ConfirmMessage, DhHandshakeMessage, HandshakeProgress, HandshakeResponse, HandshakeTransport,
};
use cipherlink_core::identity::{generate_identity, IdentityPublicKey, SigningAlgorithm};
use cipherlink_core::session_key::SessionKeyTable;
use cipherlink_core::vault::InMemoryVault;
use std::cell::RefCell;
use std::collections::HashMap;

struct MockRelay {
    identities: RefCell<HashMap<String, IdentityPublicKey>>,
    initiates: RefCell<HashMap<(String, String), DhHandshakeMessage>>,
    responds: RefCell<HashMap<(String, String), DhHandshakeMessage>>,
}

impl MockRelay {
    fn new() -> Self {
        Self {
            identities: RefCell::new(HashMap::new()),
            initiates: RefCell::new(HashMap::new()),
            responds: RefCell::new(HashMap::new()),
        }
    }

    fn register(&self, user_id: &str, public: IdentityPublicKey) {
        self.identities.borrow_mut().insert(user_id.to_string(), public);
    }
}

struct RelayHandle<'a>(&'a MockRelay);

#[async_trait(?Send)]
impl<'a> HandshakeTransport for RelayHandle<'a> {
    async fn fetch_identity_public_key(&self, user_id: &str) -> CoreResult<IdentityPublicKey> {
        self.0
            .identities
            .borrow()
            .get(user_id)
            .cloned()
            .ok_or(CoreError::NoPeerIdentity)
    }

    async fn fetch_pending_initiate(&self, self_id: &str, peer_id: &str) -> CoreResult<Option<DhHandshakeMessage>> {
        let key = (peer_id.to_string(), self_id.to_string());
        if self.0.responds.borrow().contains_key(&key) {
            return Ok(None);
        }
        Ok(self.0.initiates.borrow().get(&key).cloned())
    }

    async fn submit_initiate(&self, msg: &DhHandshakeMessage) -> CoreResult<()> {
        self.0
            .initiates
            .borrow_mut()
            .insert((msg.from.clone(), msg.to.clone()), msg.clone());
        Ok(())
    }

    async fn submit_respond(&self, msg: &DhHandshakeMessage) -> CoreResult<()> {
        self.0
            .responds
            .borrow_mut()
            .insert((msg.to.clone(), msg.from.clone()), msg.clone());
        Ok(())
    }

    async fn fetch_response(&self, self_id: &str, peer_id: &str) -> CoreResult<Option<HandshakeResponse>> {
        let key = (self_id.to_string(), peer_id.to_string());
        let Some(respond) = self.0.responds.borrow().get(&key).cloned() else {
            return Ok(None);
        };
        let initiate = self
            .0
            .initiates
            .borrow()
            .get(&key)
            .cloned()
            .expect("a stored RESPOND always has a matching INITIATE");
        Ok(Some(HandshakeResponse { initiate, respond }))
    }

    async fn submit_confirm(&self, _msg: &ConfirmMessage) -> CoreResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn session_key_is_identical_on_both_sides_regardless_of_initiator_role() {
    let relay = MockRelay::new();
    let alice_identity = generate_identity(SigningAlgorithm::P256Ecdsa).unwrap();
    let bob_identity = generate_identity(SigningAlgorithm::Rsa2048Pss).unwrap();
    relay.register("alice", alice_identity.public_key().unwrap());
    relay.register("bob", bob_identity.public_key().unwrap());
    let transport = RelayHandle(&relay);

    let alice_vault = InMemoryVault::new();
    let bob_vault = InMemoryVault::new();
    let alice_keys = SessionKeyTable::with_clock(FixedClock::new(5_000));
    let bob_keys = SessionKeyTable::with_clock(FixedClock::new(5_000));
    let clock = FixedClock::new(5_000);

    let alice_step1 = open_conversation(
        "alice", "bob", &alice_identity, &alice_vault, &transport, &alice_keys, "pw", &clock,
    )
    .await
    .unwrap();
    assert_eq!(alice_step1, HandshakeProgress::AwaitingResponse);

    let bob_done = open_conversation(
        "bob", "alice", &bob_identity, &bob_vault, &transport, &bob_keys, "pw", &clock,
    )
    .await
    .unwrap();
    let alice_done = open_conversation(
        "alice", "bob", &alice_identity, &alice_vault, &transport, &alice_keys, "pw", &clock,
    )
    .await
    .unwrap();

    let (HandshakeProgress::Established(a), HandshakeProgress::Established(b)) = (alice_done, bob_done) else {
        panic!("expected both sides established");
    };
    assert_eq!(a.session_key, b.session_key);
}

#[test]
fn substituting_the_ephemeral_public_key_invalidates_the_signature() {
    let identity = generate_identity(SigningAlgorithm::Rsa2048Pss).unwrap();
    let public = identity.public_key().unwrap();

    let original = SignedFields {
        message_type: "INITIATE".into(),
        from_user_id: "alice".into(),
        to_user_id: "bob".into(),
        public_key_b64: "AAAA".into(),
        timestamp: 1_000,
    };
    let signature = identity.sign(&original.canonical_bytes()).unwrap();
    public.verify(&original.canonical_bytes(), &signature).unwrap();

    let mut swapped = original.clone();
    swapped.public_key_b64 = "QUJD".into();
    assert!(public.verify(&swapped.canonical_bytes(), &signature).is_err());
}
