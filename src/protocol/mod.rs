//! This module provides the vocabulary shared by every part of the protocol.
//!
//! A run of CoinShuffle moves each participant through a fixed sequence of
//! phases. Every packet is tagged with the phase it belongs to and with the
//! session it was produced for, which is what allows the mailbox to sort
//! out early, late, and replayed packets.
use core::fmt;
use std::error;

use serde::{Deserialize, Serialize};

use crate::{crypto::CryptographyError, ledger::LedgerError, network::NetworkError};

/// A named stage of the protocol.
///
/// Phases are ordered by the sequence in which an honest round visits them.
/// Blame comes last, since it can be entered from any other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Uninitiated,
    Announcement,
    Shuffling,
    BroadcastOutput,
    EquivocationCheck,
    VerificationAndSubmission,
    Completed,
    Blame,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitiated => "uninitiated",
            Phase::Announcement => "announcement",
            Phase::Shuffling => "shuffling",
            Phase::BroadcastOutput => "broadcast output",
            Phase::EquivocationCheck => "equivocation check",
            Phase::VerificationAndSubmission => "verification and submission",
            Phase::Completed => "completed",
            Phase::Blame => "blame",
        };
        f.write_str(name)
    }
}

/// Identifies one round of one run of the protocol.
///
/// Every packet carries this, and packets with any other value are dropped,
/// which prevents replays across sessions and across retries of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub protocol: String,
    pub version: u32,
    pub id: String,
    /// Which attempt of the session this is, starting at 0.
    pub attempt: u32,
}

impl SessionId {
    pub const PROTOCOL: &'static str = "coinshuffle";
    pub const VERSION: u32 = 1;

    pub fn new(id: impl Into<String>) -> Self {
        Self {
            protocol: Self::PROTOCOL.to_string(),
            version: Self::VERSION,
            id: id.into(),
            attempt: 0,
        }
    }

    /// The identifier to use for the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.protocol, self.version, self.id, self.attempt
        )
    }
}

/// Represents an error which ends an attempt at the protocol.
///
/// Misbehavior by other participants never shows up here: that leads to
/// the blame phase instead. These errors come from our own environment.
#[derive(Debug)]
pub enum ProtocolError {
    /// The network stayed silent while we were waiting in some phase.
    ///
    /// This holds the round indices of the players we never heard from.
    Timeout { phase: Phase, silent: Vec<usize> },
    Cryptography(CryptographyError),
    Ledger(LedgerError),
    Network(NetworkError),
    /// One of the collaborators we were handed broke a promise the protocol
    /// relies on, so retrying with the same collaborators is pointless.
    InvalidImplementation(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Timeout { phase, silent } => {
                write!(f, "timed out in {phase} phase waiting for {silent:?}")
            }
            ProtocolError::Cryptography(e) => write!(f, "{}", e),
            ProtocolError::Ledger(e) => write!(f, "{}", e),
            ProtocolError::Network(e) => write!(f, "{}", e),
            ProtocolError::InvalidImplementation(e) => write!(f, "invalid implementation: {}", e),
        }
    }
}

impl error::Error for ProtocolError {}

impl From<CryptographyError> for ProtocolError {
    fn from(e: CryptographyError) -> Self {
        Self::Cryptography(e)
    }
}

impl From<LedgerError> for ProtocolError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

impl From<NetworkError> for ProtocolError {
    fn from(e: NetworkError) -> Self {
        Self::Network(e)
    }
}

/// Represents an error which can happen when *initializing* a protocol.
///
/// These are related to bad parameters for the protocol, and things like that.
///
/// These are usually more recoverable than other protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializationError {
    BadParameters(String),
    /// Our key is missing from the player set, or the set is unusable.
    InvalidParticipantSet(String),
}

impl fmt::Display for InitializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitializationError::BadParameters(s) => write!(f, "bad parameters: {}", s),
            InitializationError::InvalidParticipantSet(s) => {
                write!(f, "invalid participant set: {}", s)
            }
        }
    }
}

impl error::Error for InitializationError {}
