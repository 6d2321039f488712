use std::{error, fmt, marker::PhantomData};

use ck_meow::Meow;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{message::Message, scheme::Scheme, serde::encode};

const HASH_LABEL: &[u8] = b"coinshuffle v0.1.0 hash";
const HASH_LEN: usize = 32;

/// Represents an error produced by a cryptographic primitive.
///
/// Providers must report failures this way rather than silently returning
/// something of lower quality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptographyError(String);

impl CryptographyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for CryptographyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cryptography error: {}", self.0)
    }
}

impl error::Error for CryptographyError {}

/// The output of our hash function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; HASH_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

/// Hash some bytes, with domain separation.
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut meow = Meow::new(HASH_LABEL);
    meow.ad(data, false);

    let mut out = [0u8; HASH_LEN];
    meow.prf(&mut out, false);

    Digest(out)
}

/// The cryptographic capabilities a participant consumes.
///
/// The algorithms themselves live in the [`Scheme`]; this trait provides
/// the things that need a source of randomness, along with the commitment
/// hash. Implementations are shared between simulated participants, so
/// they need to be usable through a shared reference.
pub trait Crypto<C: Scheme> {
    fn new_signing_key(&self) -> Result<C::SigningKey, CryptographyError>;

    fn new_decryption_key(&self) -> Result<C::DecryptionKey, CryptographyError>;

    /// Return a uniformly random integer in `[0, n]`.
    fn random(&self, n: usize) -> Result<usize, CryptographyError>;

    fn hash(&self, message: &Message<C>) -> Result<Digest, CryptographyError>;
}

/// A provider backed by the operating system's randomness.
#[derive(Debug, Clone, Copy)]
pub struct OsCrypto<C> {
    _scheme: PhantomData<fn() -> C>,
}

impl<C> OsCrypto<C> {
    pub fn new() -> Self {
        Self {
            _scheme: PhantomData,
        }
    }
}

impl<C> Default for OsCrypto<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn next_u64() -> Result<u64, CryptographyError> {
    let mut bytes = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptographyError::new(format!("randomness unavailable: {e}")))?;
    Ok(u64::from_le_bytes(bytes))
}

impl<C: Scheme> Crypto<C> for OsCrypto<C> {
    fn new_signing_key(&self) -> Result<C::SigningKey, CryptographyError> {
        Ok(C::generate_signing_key(&mut OsRng))
    }

    fn new_decryption_key(&self) -> Result<C::DecryptionKey, CryptographyError> {
        Ok(C::generate_decryption_key(&mut OsRng))
    }

    fn random(&self, n: usize) -> Result<usize, CryptographyError> {
        let n = u64::try_from(n).map_err(|_| CryptographyError::new("bound out of range"))?;
        let Some(range) = n.checked_add(1) else {
            return Ok(next_u64()? as usize);
        };
        // Rejection sampling, to avoid any modulo bias.
        let limit = u64::MAX - u64::MAX % range;
        loop {
            let x = next_u64()?;
            if x < limit {
                return Ok((x % range) as usize);
            }
        }
    }

    fn hash(&self, message: &Message<C>) -> Result<Digest, CryptographyError> {
        Ok(hash_bytes(&encode(message)))
    }
}
