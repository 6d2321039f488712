//! A scheme over secp256k1.
//!
//! Signatures are plain ECDSA. Encryption is ECIES: an ephemeral
//! Diffie-Hellman exchange, HKDF-SHA256 for key derivation, and AES-256-GCM.
//! Since every ciphertext uses a fresh ephemeral key, a fixed nonce is fine.
use std::fmt;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use k256::{
    ecdh::{diffie_hellman, EphemeralSecret, SharedSecret},
    ecdsa::{
        self,
        signature::{Signer, Verifier},
        VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey, Secp256k1,
};
use rand_core::{CryptoRngCore, OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Address, Scheme, Signature};
use crate::crypto::CryptographyError;

const KDF_INFO: &[u8] = b"coinshuffle v0.1.0 ecies";
/// The length of a compressed SEC1 point.
const POINT_LEN: usize = 33;
/// How many bytes of the key hash make up an address.
const ADDRESS_LEN: usize = 20;

#[derive(Clone)]
pub struct SigningKey(ecdsa::SigningKey);

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

/// A compressed SEC1 encoding of an ECDSA public key.
///
/// We keep the encoding rather than the point, which gives us a total order
/// every participant agrees on.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerificationKey(Vec<u8>);

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = hex::encode(&self.0);
        write!(f, "VerificationKey({})", &encoded[..encoded.len().min(16)])
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionKey(Vec<u8>);

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecryptionKey(..)")
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey(Vec<u8>);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({})", hex::encode(&self.0))
    }
}

fn cipher(shared: &SharedSecret) -> Result<Aes256Gcm, CryptographyError> {
    let kdf = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
    let mut key = [0u8; 32];
    kdf.expand(KDF_INFO, &mut key)
        .map_err(|_| CryptographyError::new("key derivation failed"))?;
    Aes256Gcm::new_from_slice(&key).map_err(|_| CryptographyError::new("bad cipher key length"))
}

impl Scheme for Secp256k1 {
    const NAME: &'static [u8] = b"Secp256k1";

    type SigningKey = SigningKey;
    type VerificationKey = VerificationKey;
    type DecryptionKey = DecryptionKey;
    type EncryptionKey = EncryptionKey;

    fn generate_signing_key(rng: &mut impl CryptoRngCore) -> SigningKey {
        SigningKey(ecdsa::SigningKey::random(rng))
    }

    fn generate_decryption_key(rng: &mut impl CryptoRngCore) -> DecryptionKey {
        DecryptionKey(SecretKey::random(rng).to_bytes().to_vec())
    }

    fn verification_key(key: &SigningKey) -> VerificationKey {
        VerificationKey(
            key.0
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
        )
    }

    fn sign(key: &SigningKey, data: &[u8]) -> Result<Signature, CryptographyError> {
        let signature: ecdsa::Signature = key
            .0
            .try_sign(data)
            .map_err(|e| CryptographyError::new(format!("signing failed: {e}")))?;
        Ok(Signature::from_bytes(signature.to_bytes().to_vec()))
    }

    fn verify(key: &VerificationKey, data: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_sec1_bytes(&key.0) else {
            return false;
        };
        let Ok(signature) = ecdsa::Signature::from_slice(signature.as_bytes()) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }

    fn address(key: &VerificationKey) -> Address {
        let digest = Sha256::digest(&key.0);
        Address::new(hex::encode(&digest[..ADDRESS_LEN]))
    }

    fn encryption_key(key: &DecryptionKey) -> EncryptionKey {
        // A malformed key maps to an empty encryption key, which matches nothing.
        let public = SecretKey::from_slice(&key.0)
            .map(|secret| secret.public_key().to_encoded_point(true).as_bytes().to_vec())
            .unwrap_or_default();
        EncryptionKey(public)
    }

    fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let recipient = PublicKey::from_sec1_bytes(&key.0)
            .map_err(|_| CryptographyError::new("malformed encryption key"))?;
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let shared = ephemeral.diffie_hellman(&recipient);

        let mut out = ephemeral
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        let sealed = cipher(&shared)?
            .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
            .map_err(|_| CryptographyError::new("encryption failed"))?;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(key: &DecryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        if ciphertext.len() < POINT_LEN {
            return Err(CryptographyError::new("ciphertext too short"));
        }
        let (point, sealed) = ciphertext.split_at(POINT_LEN);
        let secret = SecretKey::from_slice(&key.0)
            .map_err(|_| CryptographyError::new("malformed decryption key"))?;
        let ephemeral = PublicKey::from_sec1_bytes(point)
            .map_err(|_| CryptographyError::new("malformed ephemeral key"))?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
        cipher(&shared)?
            .decrypt(Nonce::from_slice(&[0u8; 12]), sealed)
            .map_err(|_| CryptographyError::new("decryption failed"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_signatures_verify_only_under_their_key() {
        let sk = Secp256k1::generate_signing_key(&mut OsRng);
        let other = Secp256k1::generate_signing_key(&mut OsRng);
        let vk = Secp256k1::verification_key(&sk);

        let signature = Secp256k1::sign(&sk, b"hello world").unwrap();
        assert!(Secp256k1::verify(&vk, b"hello world", &signature));
        assert!(!Secp256k1::verify(&vk, b"hello there", &signature));
        assert!(!Secp256k1::verify(
            &Secp256k1::verification_key(&other),
            b"hello world",
            &signature
        ));
    }

    #[test]
    fn test_layered_encryption_peels_in_order() {
        let dk0 = Secp256k1::generate_decryption_key(&mut OsRng);
        let dk1 = Secp256k1::generate_decryption_key(&mut OsRng);
        let ek0 = Secp256k1::encryption_key(&dk0);
        let ek1 = Secp256k1::encryption_key(&dk1);

        let inner = Secp256k1::encrypt(&ek1, b"address").unwrap();
        let outer = Secp256k1::encrypt(&ek0, &inner).unwrap();

        assert!(Secp256k1::decrypt(&dk1, &outer).is_err());
        let peeled = Secp256k1::decrypt(&dk0, &outer).unwrap();
        assert_eq!(peeled, inner);
        assert_eq!(Secp256k1::decrypt(&dk1, &peeled).unwrap(), b"address");
    }

    #[test]
    fn test_malformed_decryption_key_matches_nothing() {
        let dk = Secp256k1::generate_decryption_key(&mut OsRng);
        let bogus = DecryptionKey(vec![0u8; 5]);
        assert_ne!(
            Secp256k1::encryption_key(&bogus),
            Secp256k1::encryption_key(&dk)
        );
    }

    #[test]
    fn test_addresses_are_stable() {
        let sk = Secp256k1::generate_signing_key(&mut OsRng);
        let vk = Secp256k1::verification_key(&sk);
        assert_eq!(Secp256k1::address(&vk), Secp256k1::address(&vk.clone()));
        assert_eq!(Secp256k1::address(&vk).as_str().len(), 2 * ADDRESS_LEN);
    }
}
