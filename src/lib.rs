//! CoinShuffle is a decentralized protocol for mixing coins, letting a group
//! of users move funds to fresh addresses in a single joint transaction,
//! without anybody learning which output belongs to whom.
//!
//! The protocol is accountable: if a round fails, the honest participants
//! end up agreeing on who caused it, and can try again without them.
//!
//! # Warning
//!
//! This is experimental software. It has not been audited.
//!
//! # Design
//!
//! Each round goes through a sequence of phases:
//!
//! - Every player checks that everybody else can afford the shuffle amount.
//! - Each player, except the first, announces a fresh encryption key.
//! - The players shuffle in turn. Player `i` receives a list of onion encrypted
//! output addresses, peels off one layer of encryption, adds its own output
//! address, encrypted under the keys of everyone after it, and forwards
//! a shuffled list to player `i + 1`.
//! - The last player broadcasts the final, fully decrypted, list of outputs.
//! - Everyone broadcasts a digest of what they saw, to catch equivocation.
//! - Everyone signs the resulting transaction, and sends it to the ledger.
//!
//! When something goes wrong, the round switches to a blame phase: the players
//! broadcast their accusations, along with whatever evidence backs them up,
//! including their decryption keys if needed, and replay the round to decide
//! who is at fault. This verdict is returned as a [`BlameMatrix`].
//!
//! A [`Session`] wraps rounds into a loop, dropping the guilty players
//! after each failed round.
//!
//! ## API Design
//!
//! The protocol is driven through async functions, on top of three pluggable
//! capabilities:
//! - [`Crypto`]: randomness, hashing and encryption keys,
//! - [`Ledger`]: balances and transactions,
//! - [`Network`]: moving signed packets between players.
//!
//! The crate comes with [`OsCrypto`], and an in-memory [`LocalNetwork`], which
//! is handy for simulations.
//!
//! # Generic Schemes
//!
//! The signature and encryption scheme is abstracted behind the [`Scheme`]
//! trait. This crate provides implementations behind features:
//!
//! | Scheme | Feature |
//! |-------|---------|
//! |Secp256k1|`k256`|
pub mod blame;
pub mod crypto;
pub mod ledger;
mod mailbox;
pub mod message;
pub mod network;
pub mod participants;
pub mod protocol;
pub mod round;
pub mod scheme;
mod serde;
pub mod session;
pub mod shuffle;

pub use blame::BlameMatrix;
pub use crypto::{Crypto, OsCrypto};
pub use ledger::{Ledger, Transaction};
pub use network::{LocalNetwork, Network};
pub use protocol::{Phase, ProtocolError, SessionId};
pub use round::{Round, RoundOutcome};
pub use scheme::{Address, Scheme};
pub use session::{Outcome, Session, SessionConfig};
