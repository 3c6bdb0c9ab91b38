//! LongTermKeys: generation and serialization of the identity
//! signing key pair. The public half is what gets registered at the relay
//! and is never used for key agreement or to encrypt payloads, only to
//! authenticate handshake messages (see [`crate::handshake`]).

use crate::error::{CoreError, CoreResult};
use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand_core::OsRng;
use rsa::pss::{Signature as RsaPssSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use p256::ecdsa::{
    signature::Signer as EcdsaSigner, signature::Verifier as EcdsaVerifier, Signature as P256Signature,
    SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey,
};
use sha2::Sha256;
use spki::{DecodePublicKey, EncodePublicKey};

const RSA_BITS: usize = 2048;

/// The identity signing algorithm, persisted alongside the private blob and
/// selected identically on signing and verification. Never inferred from
/// the decoded bytes: a codebase that silently fell back to a different
/// algorithm on mismatch would make key-substitution attacks invisible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SigningAlgorithm {
    /// RSA-2048 with PSS padding, SHA-256, salt length 32 (the default).
    Rsa2048Pss,
    /// NIST P-256 ECDSA (the documented equivalent-curve alternative).
    P256Ecdsa,
}

/// An identity key pair: algorithm tag plus private/public halves.
pub enum IdentityKeyPair {
    Rsa2048Pss(Box<RsaPrivateKey>),
    P256Ecdsa(P256SigningKey),
}

/// An identity public key, tagged with the algorithm it must be verified
/// under. Mixing algorithms between signer and verifier is a fatal error,
/// so the tag travels with the bytes everywhere this type goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPublicKey {
    pub algorithm: SigningAlgorithm,
    der: Vec<u8>,
}

impl IdentityKeyPair {
    pub fn algorithm(&self) -> SigningAlgorithm {
        match self {
            IdentityKeyPair::Rsa2048Pss(_) => SigningAlgorithm::Rsa2048Pss,
            IdentityKeyPair::P256Ecdsa(_) => SigningAlgorithm::P256Ecdsa,
        }
    }

    pub fn public_key(&self) -> CoreResult<IdentityPublicKey> {
        match self {
            IdentityKeyPair::Rsa2048Pss(sk) => {
                let pk = RsaPublicKey::from(sk.as_ref());
                let der = pk
                    .to_public_key_der()
                    .map_err(|e| CoreError::Internal(format!("rsa public key encode: {e}")))?;
                Ok(IdentityPublicKey {
                    algorithm: SigningAlgorithm::Rsa2048Pss,
                    der: der.as_bytes().to_vec(),
                })
            }
            IdentityKeyPair::P256Ecdsa(sk) => {
                let vk = P256VerifyingKey::from(sk);
                Ok(IdentityPublicKey {
                    algorithm: SigningAlgorithm::P256Ecdsa,
                    der: vk.to_sec1_bytes().to_vec(),
                })
            }
        }
    }

    /// Signs `message` with PSS/SHA-256/salt-32 (RSA) or ECDSA/SHA-256 (P-256).
    pub fn sign(&self, message: &[u8]) -> CoreResult<Vec<u8>> {
        match self {
            IdentityKeyPair::Rsa2048Pss(sk) => {
                let signing_key = RsaSigningKey::<Sha256>::new((**sk).clone());
                let sig: RsaPssSignature = signing_key.sign_with_rng(&mut OsRng, message);
                Ok(sig.to_vec())
            }
            IdentityKeyPair::P256Ecdsa(sk) => {
                let sig: P256Signature = EcdsaSigner::sign(sk, message);
                Ok(sig.to_vec())
            }
        }
    }

    /// PKCS#8 DER for RSA, SEC1 DER for P-256: opaque bytes to be wrapped
    /// by [`crate::vault`] under a password-derived key.
    pub fn to_private_der(&self) -> CoreResult<Vec<u8>> {
        match self {
            IdentityKeyPair::Rsa2048Pss(sk) => sk
                .to_pkcs8_der()
                .map(|d| d.as_bytes().to_vec())
                .map_err(|e| CoreError::Internal(format!("rsa private key encode: {e}"))),
            IdentityKeyPair::P256Ecdsa(sk) => Ok(sk.to_bytes().to_vec()),
        }
    }

    pub fn from_private_der(algorithm: SigningAlgorithm, der: &[u8]) -> CoreResult<Self> {
        match algorithm {
            SigningAlgorithm::Rsa2048Pss => RsaPrivateKey::from_pkcs8_der(der)
                .map(|sk| IdentityKeyPair::Rsa2048Pss(Box::new(sk)))
                .map_err(|_| CoreError::WrongPasswordOrCorrupt),
            SigningAlgorithm::P256Ecdsa => P256SigningKey::from_slice(der)
                .map(IdentityKeyPair::P256Ecdsa)
                .map_err(|_| CoreError::WrongPasswordOrCorrupt),
        }
    }
}

impl IdentityPublicKey {
    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn from_der(algorithm: SigningAlgorithm, der: &[u8]) -> CoreResult<Self> {
        match algorithm {
            SigningAlgorithm::Rsa2048Pss => {
                RsaPublicKey::from_public_key_der(der).map_err(|_| CoreError::BadSignature)?;
            }
            SigningAlgorithm::P256Ecdsa => {
                P256VerifyingKey::from_sec1_bytes(der).map_err(|_| CoreError::BadSignature)?;
            }
        }
        Ok(Self {
            algorithm,
            der: der.to_vec(),
        })
    }

    /// Verifies `signature` over `message`. A mismatched algorithm tag
    /// (caller passing a signature produced under a different scheme) is
    /// always a verification failure, never a silent fallback.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CoreResult<()> {
        match self.algorithm {
            SigningAlgorithm::Rsa2048Pss => {
                let pk = RsaPublicKey::from_public_key_der(&self.der)
                    .map_err(|_| CoreError::BadSignature)?;
                let verifying_key = RsaVerifyingKey::<Sha256>::new(pk);
                let sig = RsaPssSignature::try_from(signature).map_err(|_| CoreError::BadSignature)?;
                verifying_key
                    .verify(message, &sig)
                    .map_err(|_| CoreError::BadSignature)
            }
            SigningAlgorithm::P256Ecdsa => {
                let vk = P256VerifyingKey::from_sec1_bytes(&self.der)
                    .map_err(|_| CoreError::BadSignature)?;
                let sig = P256Signature::try_from(signature).map_err(|_| CoreError::BadSignature)?;
                EcdsaVerifier::verify(&vk, message, &sig).map_err(|_| CoreError::BadSignature)
            }
        }
    }
}

/// Generates a fresh identity key pair under the given algorithm. RSA-2048
/// is the default; P-256 ECDSA is the documented equivalent.
pub fn generate_identity(algorithm: SigningAlgorithm) -> CoreResult<IdentityKeyPair> {
    match algorithm {
        SigningAlgorithm::Rsa2048Pss => {
            let sk = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
                .map_err(|e| CoreError::Internal(format!("rsa keygen failed: {e}")))?;
            Ok(IdentityKeyPair::Rsa2048Pss(Box::new(sk)))
        }
        SigningAlgorithm::P256Ecdsa => Ok(IdentityKeyPair::P256Ecdsa(P256SigningKey::random(&mut OsRng))),
    }
}
