//! Validator and account keys using CRYSTALS-Dilithium5 signatures.
//!
//! Every account and validator is identified by an [`Address`] derived from
//! its signing public key. Keys and signatures travel as plain byte vectors
//! whose length is checked on the way in.

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Address;

pub(crate) const DILITHIUM5_PK_BYTES: usize = 2592;
pub(crate) const DILITHIUM5_SIG_BYTES: usize = 4627;

/// Rejected key or signature bytes.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{what}: expected {expected} bytes, got {got}")]
    WrongLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

fn expect_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<(), KeyError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(KeyError::WrongLength {
            what,
            expected,
            got: bytes.len(),
        })
    }
}

/// Dilithium5 public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

/// Dilithium5 secret key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// Detached Dilithium5 signature. The empty signature marks the genesis
/// block and never verifies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Signature(pub(crate) Vec<u8>);

impl TryFrom<Vec<u8>> for SigningPublicKey {
    type Error = KeyError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, KeyError> {
        expect_len("public key", &bytes, DILITHIUM5_PK_BYTES)?;
        Ok(SigningPublicKey(bytes))
    }
}

impl From<SigningPublicKey> for Vec<u8> {
    fn from(key: SigningPublicKey) -> Self {
        key.0
    }
}

impl TryFrom<Vec<u8>> for Signature {
    type Error = KeyError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, KeyError> {
        if !bytes.is_empty() {
            expect_len("signature", &bytes, DILITHIUM5_SIG_BYTES)?;
        }
        Ok(Signature(bytes))
    }
}

impl From<Signature> for Vec<u8> {
    fn from(sig: Signature) -> Self {
        sig.0
    }
}

impl Signature {
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A validator's or account holder's signing keys.
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        SigningKeypair {
            public: SigningPublicKey(pk.as_bytes().to_vec()),
            secret: SigningSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Rebuild a keypair from stored bytes; `None` if either half is malformed.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        dilithium5::PublicKey::from_bytes(&public).ok()?;
        dilithium5::SecretKey::from_bytes(&secret).ok()?;
        Some(SigningKeypair {
            public: SigningPublicKey(public),
            secret: SigningSecretKey(secret),
        })
    }

    /// Detached signature over `message`. A corrupted secret key yields the
    /// empty signature, which no verifier accepts.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let Ok(sk) = dilithium5::SecretKey::from_bytes(&self.secret.0) else {
            tracing::error!("signing key is corrupted, producing empty signature");
            return Signature::empty();
        };
        Signature(dilithium5::detached_sign(message, &sk).as_bytes().to_vec())
    }

    pub fn address(&self) -> Address {
        self.public.address()
    }
}

impl SigningPublicKey {
    /// Wrap raw public key bytes, rejecting anything the library can't parse.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        dilithium5::PublicKey::from_bytes(&bytes).ok()?;
        Some(SigningPublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let (Ok(pk), Ok(sig)) = (
            dilithium5::PublicKey::from_bytes(&self.0),
            dilithium5::DetachedSignature::from_bytes(&signature.0),
        ) else {
            return false;
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// `blake3_derive_key("tally.address", key bytes)`.
    pub fn address(&self) -> Address {
        Address(crate::hash_domain(b"tally.address", &self.0))
    }

    pub fn is_valid_size(&self) -> bool {
        self.0.len() == DILITHIUM5_PK_BYTES
    }
}
