use std::{fmt, hash::Hash};

use rand_core::CryptoRngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::CryptographyError;

#[cfg(feature = "k256")]
pub mod k256_impl;

/// Represents the algorithms a participant uses for signing and encryption.
///
/// This is the trait that any scheme usable in this library must implement.
/// The library provides an implementation over secp256k1 behind the `k256`
/// feature, beyond that you'll need to implement this trait yourself.
///
/// The protocol itself never looks inside keys: it only needs to order
/// verification keys, compare encryption keys, and move everything over the
/// wire with serde.
pub trait Scheme: Clone + fmt::Debug + PartialEq + Eq + Send + Sync + 'static {
    /// Used for domain separation.
    const NAME: &'static [u8];

    type SigningKey: Clone + fmt::Debug + Send + Sync;
    type VerificationKey: Clone
        + fmt::Debug
        + Ord
        + Hash
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;
    /// Decryption keys are revealed on the wire when a shuffle fails.
    type DecryptionKey: Clone
        + fmt::Debug
        + PartialEq
        + Eq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;
    type EncryptionKey: Clone
        + fmt::Debug
        + PartialEq
        + Eq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    fn generate_signing_key(rng: &mut impl CryptoRngCore) -> Self::SigningKey;

    fn generate_decryption_key(rng: &mut impl CryptoRngCore) -> Self::DecryptionKey;

    fn verification_key(key: &Self::SigningKey) -> Self::VerificationKey;

    fn sign(key: &Self::SigningKey, data: &[u8]) -> Result<Signature, CryptographyError>;

    /// Check a signature, returning false on any kind of failure.
    #[must_use]
    fn verify(key: &Self::VerificationKey, data: &[u8], signature: &Signature) -> bool;

    /// The address holding the coins controlled by this key.
    fn address(key: &Self::VerificationKey) -> Address;

    fn encryption_key(key: &Self::DecryptionKey) -> Self::EncryptionKey;

    fn encrypt(key: &Self::EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError>;

    fn decrypt(key: &Self::DecryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError>;
}

/// An address on the ledger.
///
/// Addresses are opaque to the protocol; they only get moved around,
/// compared, and encrypted.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bytes which get encrypted during the shuffle.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Parse an address out of a fully decrypted shuffle entry.
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        String::from_utf8(bytes).ok().filter(|s| !s.is_empty()).map(Self)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A detached signature, in whatever encoding the scheme chooses.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}
