//! One round of the CoinShuffle protocol.
//!
//! The players of a round are numbered `1..=N` by verification key. Each
//! player holds coins at the address of its verification key, and wants to
//! move `amount` of them to a fresh output address, without anyone learning
//! which output belongs to which input.
//!
//! The round goes through the following phases:
//!
//! 1. Announcement: everyone but player 1 announces a fresh encryption key.
//! 2. Shuffling: player 1 encrypts its output address in layers, with the
//!    keys of players `N, ..., 2`, and passes it on to player 2. Each player
//!    in turn strips a layer off everything it receives, adds its own output,
//!    shuffles, and passes the list on. Player `N` ends up with plain addresses.
//! 3. Broadcast output: player `N` sends the list of outputs to everyone.
//! 4. Equivocation check: everyone broadcasts a hash of the announcements and
//!    outputs they saw, making sure nobody got told a different story.
//! 5. Verification and submission: everyone signs the joint transaction,
//!    checks the signatures of the others, and submits it.
//!
//! Any deviation from this leads to the blame phase, where the culprit gets
//! identified, so that the next round can go ahead without it.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::{
    blame::{blame_phase, BlameAtom, BlameMatrix, Evidence, FailureKind, Replay},
    crypto::{Crypto, CryptographyError},
    ledger::{Ledger, LedgerError, Transaction},
    mailbox::Mailbox,
    message::{Atom, Message, SignedPacket},
    network::Network,
    participants::{ParticipantList, ParticipantMap},
    protocol::{InitializationError, Phase, ProtocolError, SessionId},
    scheme::{Address, Scheme},
    shuffle::shuffle,
};

/// What made us give up on the happy path.
#[derive(Debug)]
pub(crate) enum BlameTrigger<C: Scheme> {
    /// We noticed something wrong ourselves.
    Detected(Vec<BlameAtom<C>>),
    /// Somebody else did, and sent us this.
    Received(SignedPacket<C>),
}

/// The ways a phase can end, other than successfully.
#[derive(Debug)]
pub(crate) enum RoundError<C: Scheme> {
    Blame(BlameTrigger<C>),
    /// A packet arrived from someone else than who we're waiting on.
    ///
    /// The packet gets dropped, and we keep waiting.
    UnexpectedSender {
        expected: C::VerificationKey,
        packet: SignedPacket<C>,
    },
    Fatal(ProtocolError),
}

impl<C: Scheme> From<ProtocolError> for RoundError<C> {
    fn from(e: ProtocolError) -> Self {
        Self::Fatal(e)
    }
}

impl<C: Scheme> From<CryptographyError> for RoundError<C> {
    fn from(e: CryptographyError) -> Self {
        Self::Fatal(e.into())
    }
}

impl<C: Scheme> From<LedgerError> for RoundError<C> {
    fn from(e: LedgerError) -> Self {
        Self::Fatal(e.into())
    }
}

fn suspect<C: Scheme>(kind: FailureKind) -> RoundError<C> {
    RoundError::Blame(BlameTrigger::Detected(vec![BlameAtom::Suspect(kind)]))
}

/// The message everybody hashes in the equivocation check.
///
/// This holds a digest of the announcement of each player, in order,
/// followed by the output addresses.
pub(crate) fn equivocation_message<C: Scheme>(
    crypto: &impl Crypto<C>,
    announcements: &[Message<C>],
    outputs: &[Address],
) -> Result<Message<C>, CryptographyError> {
    let mut message = Message::new();
    for announcement in announcements {
        message = message.attach(Atom::Digest(crypto.hash(announcement)?));
    }
    Ok(outputs
        .iter()
        .cloned()
        .map(Atom::Address)
        .fold(message, Message::attach))
}

/// How a round ended, if it didn't hit an error.
#[derive(Debug)]
pub enum RoundOutcome<C: Scheme> {
    /// The joint transaction went out.
    Completed {
        transaction: Transaction,
        /// Where our coins went.
        output: Address,
        /// The key controlling the output address.
        output_key: C::SigningKey,
    },
    /// Somebody misbehaved, and we figured out who.
    Blamed {
        /// The phase we were in when things went wrong.
        phase: Phase,
        matrix: BlameMatrix<C>,
    },
}

/// What we know so far, which the blame phase might need.
struct State<C: Scheme> {
    phase: Phase,
    decryption_key: Option<C::DecryptionKey>,
}

/// A single round of the protocol, from the point of view of one player.
pub struct Round<'a, C: Scheme, R, L, N> {
    session: SessionId,
    amount: u64,
    key: C::SigningKey,
    me: C::VerificationKey,
    /// Our index among the players, starting at 1.
    index: usize,
    players: ParticipantList<C>,
    change: Option<Address>,
    crypto: &'a R,
    ledger: &'a L,
    network: &'a N,
}

impl<'a, C, R, L, N> Round<'a, C, R, L, N>
where
    C: Scheme,
    R: Crypto<C>,
    L: Ledger,
    N: Network<C>,
{
    /// Set up a round.
    ///
    /// `change` is where anything we hold beyond `amount` should go.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionId,
        amount: u64,
        key: C::SigningKey,
        players: &[C::VerificationKey],
        change: Option<Address>,
        crypto: &'a R,
        ledger: &'a L,
        network: &'a N,
    ) -> Result<Self, InitializationError> {
        if players.len() < 2 {
            return Err(InitializationError::InvalidParticipantSet(format!(
                "a round needs at least 2 players, found {}",
                players.len()
            )));
        }
        let players = ParticipantList::new(players).ok_or_else(|| {
            InitializationError::InvalidParticipantSet("players contain duplicates".to_string())
        })?;
        let me = C::verification_key(&key);
        let index = players.index(&me).ok_or_else(|| {
            InitializationError::InvalidParticipantSet("players do not contain our key".to_string())
        })?;
        Ok(Self {
            session,
            amount,
            key,
            me,
            index,
            players,
            change,
            crypto,
            ledger,
            network,
        })
    }

    pub fn players(&self) -> &ParticipantList<C> {
        &self.players
    }

    /// Run the round to the end.
    ///
    /// Misbehavior by other players doesn't produce an error, but rather a
    /// [`RoundOutcome::Blamed`].
    pub async fn run(&self) -> Result<RoundOutcome<C>, ProtocolError> {
        self.run_with(Vec::new()).await.0
    }

    /// Run the round, starting with packets an earlier attempt received
    /// ahead of time.
    ///
    /// This also returns the packets we received for later attempts.
    pub(crate) async fn run_with(
        &self,
        early: Vec<SignedPacket<C>>,
    ) -> (Result<RoundOutcome<C>, ProtocolError>, Vec<SignedPacket<C>>) {
        let mut mailbox = Mailbox::new(
            self.session.clone(),
            self.key.clone(),
            self.players.clone(),
            self.network,
        );
        mailbox.deliver(early);
        let out = self.execute(&mut mailbox).await;
        (out, mailbox.take_later())
    }

    async fn execute(
        &self,
        mailbox: &mut Mailbox<'_, C, N>,
    ) -> Result<RoundOutcome<C>, ProtocolError> {
        let mut state = State {
            phase: Phase::Uninitiated,
            decryption_key: None,
        };
        info!(
            me = self.index,
            players = self.players.len(),
            session = %self.session,
            "starting round"
        );

        let trigger = match self.protocol(mailbox, &mut state).await {
            Ok(outcome) => return Ok(outcome),
            Err(RoundError::Blame(trigger)) => trigger,
            Err(RoundError::Fatal(e)) => return Err(e),
            Err(RoundError::UnexpectedSender { expected, .. }) => {
                return Err(ProtocolError::InvalidImplementation(format!(
                    "unhandled packet while waiting on {expected:?}"
                )))
            }
        };

        warn!(me = self.index, phase = %state.phase, "round failed, entering blame");
        let replay = Replay {
            session: &self.session,
            me: &self.me,
            players: &self.players,
            amount: self.amount,
            crypto: self.crypto,
            ledger: self.ledger,
        };
        let matrix = blame_phase(
            &replay,
            mailbox,
            trigger,
            state.decryption_key.as_ref(),
        )
        .await?;
        Ok(RoundOutcome::Blamed {
            phase: state.phase,
            matrix,
        })
    }

    /// Wait for a packet from one player, dropping anything else.
    async fn receive_from(
        &self,
        mailbox: &mut Mailbox<'_, C, N>,
        from: &C::VerificationKey,
        phase: Phase,
    ) -> Result<SignedPacket<C>, RoundError<C>> {
        loop {
            match mailbox.receive_from(from, phase).await {
                Err(RoundError::UnexpectedSender { expected, packet }) => {
                    warn!(%phase, expected = ?expected, from = ?packet.from(), "dropping packet");
                }
                out => return out,
            }
        }
    }

    fn build_transaction(
        &self,
        outputs: &[Address],
        change: &BTreeMap<Address, Address>,
    ) -> Result<Transaction, LedgerError> {
        let inputs: Vec<Address> = self.players.iter().map(C::address).collect();
        self.ledger
            .build_shuffle_transaction(self.amount, &inputs, outputs, change)
    }

    /// Check that every player holds enough to take part.
    ///
    /// A shortfall caused by `ours`, the round's own transaction, is fine.
    fn check_funds(&self, ours: Option<&Transaction>) -> Result<(), RoundError<C>> {
        let mut accusations = Vec::new();
        for player in self.players.iter() {
            let address = C::address(player);
            if self.ledger.value_held(&address)? >= self.amount {
                continue;
            }
            let evidence = match self.ledger.offending_transaction(&address, self.amount)? {
                Some(tx) if Some(&tx) == ours => continue,
                Some(tx) => Evidence::InsufficientFunds(tx),
                None => Evidence::NoFundsAtAll,
            };
            warn!(me = self.index, %address, "player lacks funds");
            accusations.push(BlameAtom::Accuse {
                accused: player.clone(),
                evidence,
            });
        }
        if accusations.is_empty() {
            Ok(())
        } else {
            Err(RoundError::Blame(BlameTrigger::Detected(accusations)))
        }
    }

    async fn protocol(
        &self,
        mailbox: &mut Mailbox<'_, C, N>,
        state: &mut State<C>,
    ) -> Result<RoundOutcome<C>, RoundError<C>> {
        let n = self.players.len();
        let i = self.index;
        let others: Vec<_> = self.players.others(&self.me).cloned().collect();

        self.check_funds(None)?;

        // Phase 1: announcement
        state.phase = Phase::Announcement;
        debug!(me = i, phase = %state.phase);
        if i > 1 {
            state.decryption_key = Some(self.crypto.new_decryption_key()?);
        }
        let my_key = state.decryption_key.as_ref().map(C::encryption_key);
        let mut change_outputs = BTreeMap::new();
        let mut announcement = Message::new();
        if let Some(key) = &my_key {
            announcement = announcement.attach(Atom::EncryptionKey(key.clone()));
        }
        if let Some(change) = &self.change {
            announcement = announcement.attach(Atom::Address(change.clone()));
            change_outputs.insert(C::address(&self.me), change.clone());
        }
        mailbox
            .broadcast(Phase::Announcement, announcement.clone())
            .await?;

        let announcements = mailbox
            .receive_from_multiple(&others, Phase::Announcement, true)
            .await?;
        let mut announced = ParticipantMap::new(&self.players);
        announced.put(&self.me, announcement);
        let mut keys = ParticipantMap::new(&self.players);
        if let Some(key) = my_key {
            keys.put(&self.me, key);
        }
        for (from, packet) in &announcements {
            let mut reader = packet.payload().reader();
            let key = reader.read_optional_encryption_key();
            let change = reader.read_optional_address();
            if reader.finish().is_err() {
                warn!(me = i, from = ?from, "malformed announcement");
                return Err(suspect(FailureKind::Shuffle));
            }
            let j = self.players.index(from).unwrap_or(0);
            match key {
                Some(key) if j > 1 => {
                    keys.put(from, key.clone());
                }
                None if j > 1 => {
                    warn!(me = i, from = j, "announcement without an encryption key");
                    return Err(suspect(FailureKind::Shuffle));
                }
                _ => {}
            }
            if let Some(change) = change {
                change_outputs.insert(C::address(from), change.clone());
            }
            announced.put(from, packet.payload().clone());
        }
        let announced: Vec<Message<C>> = announced.iter().map(|(_, m)| m.clone()).collect();
        // Player 1 has no key, so keys[j - 2] belongs to player j.
        let keys: Vec<C::EncryptionKey> = keys.iter().map(|(_, key)| key.clone()).collect();

        // Phase 2: shuffling
        state.phase = Phase::Shuffling;
        debug!(me = i, phase = %state.phase);
        let output_key = self.crypto.new_signing_key()?;
        let output = C::address(&C::verification_key(&output_key));

        let mut entries = Vec::with_capacity(i);
        if let (Some(previous), Some(decryption_key)) =
            (self.players.get(i - 1), state.decryption_key.as_ref())
        {
            let packet = self.receive_from(mailbox, previous, Phase::Shuffling).await?;
            let mut reader = packet.payload().reader();
            while reader.remaining() > 0 {
                let Ok(entry) = reader.read_ciphertext() else {
                    warn!(me = i, "shuffle entry is not a ciphertext");
                    return Err(suspect(FailureKind::Shuffle));
                };
                match C::decrypt(decryption_key, entry) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!(me = i, error = %e, "could not decrypt shuffle entry");
                        return Err(suspect(FailureKind::Shuffle));
                    }
                }
            }
            let distinct = entries.iter().collect::<BTreeSet<_>>().len();
            if entries.len() != i - 1 || distinct != entries.len() {
                warn!(me = i, received = entries.len(), distinct, "bad shuffle input");
                return Err(suspect(FailureKind::Shuffle));
            }
        }

        let mut mine = output.to_bytes();
        for key in keys[i - 1..].iter().rev() {
            mine = C::encrypt(key, &mine)?;
        }
        entries.push(mine);
        let entries = shuffle(self.crypto, entries)?;

        // Phase 3: broadcast output
        let next = self.players.get(i + 1).cloned();
        let last = self.players.get(n).cloned();
        let outputs = if let (Some(next), Some(last)) = (next, last) {
            let message = entries.into_iter().map(Atom::Ciphertext).collect();
            mailbox.send(Phase::Shuffling, &next, message).await?;

            state.phase = Phase::BroadcastOutput;
            debug!(me = i, phase = %state.phase);
            let packet = self.receive_from(mailbox, &last, Phase::BroadcastOutput).await?;
            let mut reader = packet.payload().reader();
            let mut outputs = Vec::with_capacity(n);
            while reader.remaining() > 0 {
                let Ok(address) = reader.read_address() else {
                    warn!(me = i, "output list holds something other than addresses");
                    return Err(suspect(FailureKind::Shuffle));
                };
                outputs.push(address.clone());
            }
            outputs
        } else {
            let Some(outputs) = entries
                .into_iter()
                .map(Address::from_bytes)
                .collect::<Option<Vec<_>>>()
            else {
                warn!(me = i, "decrypted entries are not addresses");
                return Err(suspect(FailureKind::Shuffle));
            };
            state.phase = Phase::BroadcastOutput;
            debug!(me = i, phase = %state.phase);
            let message = outputs.iter().cloned().map(Atom::Address).collect();
            mailbox.broadcast(Phase::BroadcastOutput, message).await?;
            outputs
        };
        let distinct = outputs.iter().collect::<BTreeSet<_>>().len();
        if outputs.len() != n || distinct != n || !outputs.contains(&output) {
            warn!(
                me = i,
                outputs = outputs.len(),
                distinct,
                "our output is missing or the list is bad"
            );
            return Err(suspect(FailureKind::Shuffle));
        }

        // Phase 4: equivocation check
        state.phase = Phase::EquivocationCheck;
        debug!(me = i, phase = %state.phase);
        let digest = self
            .crypto
            .hash(&equivocation_message(self.crypto, &announced, &outputs)?)?;
        mailbox
            .broadcast(
                Phase::EquivocationCheck,
                Message::new().attach(Atom::Digest(digest)),
            )
            .await?;
        let digests = mailbox
            .receive_from_multiple(&others, Phase::EquivocationCheck, true)
            .await?;
        for (from, packet) in &digests {
            if packet.payload().reader().read_digest() != Ok(&digest) {
                warn!(me = i, from = ?from, "equivocation check failed");
                return Err(suspect(FailureKind::Equivocation));
            }
        }

        // Phase 5: verification and submission
        state.phase = Phase::VerificationAndSubmission;
        debug!(me = i, phase = %state.phase);
        let transaction = self.build_transaction(&outputs, &change_outputs)?;
        let message = transaction.signing_bytes();
        let signature = C::sign(&self.key, &message)?;
        mailbox
            .broadcast(
                Phase::VerificationAndSubmission,
                Message::new().attach(Atom::Signature(signature.clone())),
            )
            .await?;

        let packets = mailbox
            .receive_from_multiple(&others, Phase::VerificationAndSubmission, true)
            .await?;
        let mut signatures = BTreeMap::new();
        signatures.insert(C::address(&self.me), signature);
        let mut accusations = Vec::new();
        for (from, packet) in packets {
            let signature = packet
                .payload()
                .reader()
                .read_signature()
                .ok()
                .filter(|s| C::verify(&from, &message, s))
                .cloned();
            match signature {
                Some(signature) => {
                    signatures.insert(C::address(&from), signature);
                }
                None => {
                    warn!(me = i, from = ?from, "invalid transaction signature");
                    accusations.push(BlameAtom::Accuse {
                        accused: from,
                        evidence: Evidence::InvalidSignature(packet),
                    });
                }
            }
        }
        if !accusations.is_empty() {
            return Err(RoundError::Blame(BlameTrigger::Detected(accusations)));
        }

        // Somebody might have spent their coins in the meantime.
        self.check_funds(Some(&transaction))?;
        self.ledger.send(&transaction, &signatures)?;

        state.phase = Phase::Completed;
        info!(me = i, %output, "round completed");
        Ok(RoundOutcome::Completed {
            transaction,
            output,
            output_key,
        })
    }
}

#[cfg(all(test, feature = "k256"))]
mod test {
    use std::time::Duration;

    use k256::Secp256k1;
    use rand_core::OsRng;

    use super::*;
    use crate::{crypto::OsCrypto, network::LocalNetwork, test::MockLedger};

    #[test]
    fn test_bad_player_sets_are_rejected() {
        let key = Secp256k1::generate_signing_key(&mut OsRng);
        let me = Secp256k1::verification_key(&key);
        let other = Secp256k1::verification_key(&Secp256k1::generate_signing_key(&mut OsRng));
        let stranger = Secp256k1::verification_key(&Secp256k1::generate_signing_key(&mut OsRng));

        let crypto = OsCrypto::<Secp256k1>::new();
        let ledger = MockLedger::new();
        let endpoints =
            LocalNetwork::endpoints::<Secp256k1>(&[me.clone()], Duration::from_millis(10));

        let setups: [&[_]; 3] = [
            &[me.clone()],
            &[me.clone(), other.clone(), me.clone()],
            &[other, stranger],
        ];
        for players in setups {
            let round = Round::<Secp256k1, _, _, _>::new(
                SessionId::new("round"),
                10,
                key.clone(),
                players,
                None,
                &crypto,
                &ledger,
                &endpoints[0],
            );
            assert!(matches!(
                round,
                Err(InitializationError::InvalidParticipantSet(_))
            ));
        }
    }

    #[test]
    fn test_equivocation_message_covers_announcements() {
        let crypto = OsCrypto::<Secp256k1>::new();
        let dk = Secp256k1::generate_decryption_key(&mut OsRng);
        let ek = Secp256k1::encryption_key(&dk);
        let first = Message::<Secp256k1>::new().attach(Atom::Address(Address::new("change")));
        let second = Message::new().attach(Atom::EncryptionKey(ek));
        let outputs = [Address::new("a"), Address::new("b")];
        let announcements = [first.clone(), second.clone()];
        let message = equivocation_message(&crypto, &announcements, &outputs).unwrap();

        let mut reader = message.reader();
        assert_eq!(reader.read_digest().unwrap(), &crypto.hash(&first).unwrap());
        assert_eq!(reader.read_digest().unwrap(), &crypto.hash(&second).unwrap());
        assert_eq!(reader.read_address().unwrap(), &outputs[0]);
        assert_eq!(reader.read_address().unwrap(), &outputs[1]);
        assert!(reader.finish().is_ok());

        // A different change address changes the message.
        let other = Message::new().attach(Atom::Address(Address::new("elsewhere")));
        let changed = equivocation_message(&crypto, &[other, second], &outputs).unwrap();
        assert_ne!(crypto.hash(&message).unwrap(), crypto.hash(&changed).unwrap());
    }
}
