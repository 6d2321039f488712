//! The boundary to the coin ledger.
//!
//! The protocol never talks to a blockchain directly. It asks a [`Ledger`]
//! whether funds are there, has it build the joint transaction, and hands the
//! finished transaction back for broadcast.
use std::{collections::BTreeMap, error, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    scheme::{Address, Signature},
    serde::encode,
};

/// Represents a failure of the ledger backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerError(String);

impl LedgerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ledger error: {}", self.0)
    }
}

impl error::Error for LedgerError {}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Output {
    pub address: Address,
    pub value: u64,
}

/// A transaction, as built by the ledger.
///
/// Participants sign the encoding of this structure, so everyone needs to
/// end up with the exact same value, down to the order of the entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Address>,
    pub outputs: Vec<Output>,
}

impl Transaction {
    /// The bytes each participant signs.
    pub fn signing_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Check whether this transaction spends from a given address.
    pub fn spends(&self, address: &Address) -> bool {
        self.inputs.contains(address)
    }
}

/// The ledger capabilities the protocol consumes.
///
/// Every simulated participant calls into the same ledger, so implementations
/// need to be usable from several threads through a shared reference.
pub trait Ledger {
    /// How much is held at an address.
    fn value_held(&self, address: &Address) -> Result<u64, LedgerError>;

    /// Build the transaction mixing `amount` from each input into the outputs.
    ///
    /// `change` maps an input address to the address receiving whatever the
    /// input holds beyond `amount`.
    fn build_shuffle_transaction(
        &self,
        amount: u64,
        inputs: &[Address],
        outputs: &[Address],
        change: &BTreeMap<Address, Address>,
    ) -> Result<Transaction, LedgerError>;

    /// Broadcast a finished transaction, along with the signature of the
    /// owner of each input.
    fn send(
        &self,
        transaction: &Transaction,
        signatures: &BTreeMap<Address, Signature>,
    ) -> Result<(), LedgerError>;

    /// Find a transaction which moved funds away from an address, leaving it
    /// with less than `amount`.
    ///
    /// This is used to prove that a participant spent its funds.
    fn offending_transaction(
        &self,
        address: &Address,
        amount: u64,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// Check a transaction cited by someone else as proof that an address
    /// can no longer cover `amount`.
    fn is_offending(
        &self,
        address: &Address,
        amount: u64,
        transaction: &Transaction,
    ) -> Result<bool, LedgerError>;
}
