//! The message and packet model.
//!
//! A [`Message`] is an immutable sequence of typed atoms. Instead of
//! consuming a message when reading it, one reads through a [`Reader`],
//! a cursor over the atoms, so the same message can be read as many times
//! as needed (once for routing, once for hashing, once more during blame).
//!
//! A [`Packet`] wraps a message with the routing information, and a
//! [`SignedPacket`] attaches a signature covering all of it, so that a packet
//! replayed into another phase or another session fails to verify.
use std::{error, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    blame::BlameAtom,
    crypto::{CryptographyError, Digest},
    ledger::Transaction,
    protocol::{Phase, SessionId},
    scheme::{Address, Scheme, Signature},
    serde::encode,
};

/// One typed element of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Atom<C: Scheme> {
    Address(Address),
    EncryptionKey(C::EncryptionKey),
    /// An address wrapped in one or more layers of encryption.
    Ciphertext(Vec<u8>),
    Signature(Signature),
    Blame(BlameAtom<C>),
    Transaction(Transaction),
    Packet(Box<SignedPacket<C>>),
    Digest(Digest),
}

impl<C: Scheme> Atom<C> {
    fn kind(&self) -> &'static str {
        match self {
            Atom::Address(_) => "address",
            Atom::EncryptionKey(_) => "encryption key",
            Atom::Ciphertext(_) => "ciphertext",
            Atom::Signature(_) => "signature",
            Atom::Blame(_) => "blame",
            Atom::Transaction(_) => "transaction",
            Atom::Packet(_) => "packet",
            Atom::Digest(_) => "digest",
        }
    }
}

/// Represents a message which doesn't have the shape we expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub expected: &'static str,
    pub found: Option<&'static str>,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.found {
            Some(found) => write!(f, "expected {}, found {}", self.expected, found),
            None => write!(f, "expected {}, found end of message", self.expected),
        }
    }
}

impl error::Error for FormatError {}

/// An ordered, immutable sequence of atoms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Message<C: Scheme> {
    atoms: Vec<Atom<C>>,
}

impl<C: Scheme> Message<C> {
    pub fn new() -> Self {
        Self { atoms: Vec::new() }
    }

    /// Return this message, extended with one more atom.
    #[must_use]
    pub fn attach(mut self, atom: Atom<C>) -> Self {
        self.atoms.push(atom);
        self
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn atoms(&self) -> &[Atom<C>] {
        &self.atoms
    }

    /// Start reading this message from the beginning.
    pub fn reader(&self) -> Reader<'_, C> {
        Reader {
            atoms: &self.atoms,
            position: 0,
        }
    }
}

impl<C: Scheme> Default for Message<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Scheme> FromIterator<Atom<C>> for Message<C> {
    fn from_iter<I: IntoIterator<Item = Atom<C>>>(iter: I) -> Self {
        Self {
            atoms: iter.into_iter().collect(),
        }
    }
}

/// A cursor over the atoms of a message.
#[derive(Debug, Clone)]
pub struct Reader<'a, C: Scheme> {
    atoms: &'a [Atom<C>],
    position: usize,
}

impl<'a, C: Scheme> Reader<'a, C> {
    pub fn remaining(&self) -> usize {
        self.atoms.len() - self.position
    }

    fn read<T>(
        &mut self,
        expected: &'static str,
        f: impl FnOnce(&'a Atom<C>) -> Option<T>,
    ) -> Result<T, FormatError> {
        let atom = self.atoms.get(self.position).ok_or(FormatError {
            expected,
            found: None,
        })?;
        let out = f(atom).ok_or(FormatError {
            expected,
            found: Some(atom.kind()),
        })?;
        self.position += 1;
        Ok(out)
    }

    /// Read the next atom only if it has the right kind.
    fn read_if<T>(&mut self, f: impl FnOnce(&'a Atom<C>) -> Option<T>) -> Option<T> {
        let out = self.atoms.get(self.position).and_then(f)?;
        self.position += 1;
        Some(out)
    }

    pub fn read_address(&mut self) -> Result<&'a Address, FormatError> {
        self.read("address", |atom| match atom {
            Atom::Address(x) => Some(x),
            _ => None,
        })
    }

    pub fn read_optional_address(&mut self) -> Option<&'a Address> {
        self.read_if(|atom| match atom {
            Atom::Address(x) => Some(x),
            _ => None,
        })
    }

    pub fn read_optional_encryption_key(&mut self) -> Option<&'a C::EncryptionKey> {
        self.read_if(|atom| match atom {
            Atom::EncryptionKey(x) => Some(x),
            _ => None,
        })
    }

    pub fn read_ciphertext(&mut self) -> Result<&'a [u8], FormatError> {
        self.read("ciphertext", |atom| match atom {
            Atom::Ciphertext(x) => Some(x.as_slice()),
            _ => None,
        })
    }

    pub fn read_signature(&mut self) -> Result<&'a Signature, FormatError> {
        self.read("signature", |atom| match atom {
            Atom::Signature(x) => Some(x),
            _ => None,
        })
    }

    pub fn read_digest(&mut self) -> Result<&'a Digest, FormatError> {
        self.read("digest", |atom| match atom {
            Atom::Digest(x) => Some(x),
            _ => None,
        })
    }

    pub fn read_blame(&mut self) -> Result<&'a BlameAtom<C>, FormatError> {
        self.read("blame", |atom| match atom {
            Atom::Blame(x) => Some(x),
            _ => None,
        })
    }

    /// Check that nothing is left over.
    pub fn finish(self) -> Result<(), FormatError> {
        match self.atoms.get(self.position) {
            None => Ok(()),
            Some(atom) => Err(FormatError {
                expected: "end of message",
                found: Some(atom.kind()),
            }),
        }
    }
}

/// A message, along with where it came from, where it's going, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Packet<C: Scheme> {
    pub session: SessionId,
    pub phase: Phase,
    pub from: C::VerificationKey,
    pub to: C::VerificationKey,
    pub payload: Message<C>,
}

impl<C: Scheme> Packet<C> {
    /// Sign this packet, covering every field.
    pub fn sign(self, key: &C::SigningKey) -> Result<SignedPacket<C>, CryptographyError> {
        let signature = C::sign(key, &encode(&self))?;
        Ok(SignedPacket {
            packet: self,
            signature,
        })
    }
}

/// A packet along with the signature of its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SignedPacket<C: Scheme> {
    pub packet: Packet<C>,
    pub signature: Signature,
}

impl<C: Scheme> SignedPacket<C> {
    /// Check that the claimed sender actually signed this packet.
    #[must_use]
    pub fn verify(&self) -> bool {
        C::verify(&self.packet.from, &encode(&self.packet), &self.signature)
    }

    pub fn from(&self) -> &C::VerificationKey {
        &self.packet.from
    }

    pub fn to(&self) -> &C::VerificationKey {
        &self.packet.to
    }

    pub fn phase(&self) -> Phase {
        self.packet.phase
    }

    pub fn payload(&self) -> &Message<C> {
        &self.packet.payload
    }
}
