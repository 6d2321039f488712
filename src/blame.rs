//! Figuring out who to blame when a round goes wrong.
//!
//! Once a participant notices a problem, it stops following the happy path,
//! and broadcasts a blame packet. This packet contains accusations, which
//! come with self-contained evidence, and suspicions, which don't. To back
//! up a suspicion, a participant reveals the relevant part of its packet
//! history, along with its decryption key for shuffle problems.
//!
//! After collecting everybody's blame packets, each participant replays
//! the round from the revealed packets. Since the replay only looks at
//! broadcast information, every honest participant arrives at the same
//! verdict, recorded in a [`BlameMatrix`].
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    crypto::Crypto,
    ledger::{Ledger, Transaction},
    mailbox::Mailbox,
    message::{Atom, Message, SignedPacket},
    network::Network,
    participants::ParticipantList,
    protocol::{Phase, ProtocolError, SessionId},
    round::{equivocation_message, BlameTrigger},
    scheme::{Address, Scheme},
};

/// The kinds of failure which need revealed history to be judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Shuffle,
    Equivocation,
    /// Checking a transaction signature needs the joint transaction.
    Signature,
}

impl FailureKind {
    /// The phases whose packets need to be revealed.
    fn phases(self) -> &'static [Phase] {
        match self {
            FailureKind::Shuffle => &[
                Phase::Announcement,
                Phase::Shuffling,
                Phase::BroadcastOutput,
            ],
            FailureKind::Equivocation => &[
                Phase::Announcement,
                Phase::BroadcastOutput,
                Phase::EquivocationCheck,
            ],
            FailureKind::Signature => &[Phase::Announcement, Phase::BroadcastOutput],
        }
    }
}

/// Why a participant is being blamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Evidence<C: Scheme> {
    /// The input address doesn't hold enough coins.
    NoFundsAtAll,
    /// The input address was spent by this transaction.
    InsufficientFunds(Transaction),
    /// These packets, all signed by the accused, don't agree with each other.
    EquivocationFailure(Vec<SignedPacket<C>>),
    /// The accused didn't shuffle correctly.
    ShuffleFailure {
        key: Option<C::DecryptionKey>,
        packets: Vec<SignedPacket<C>>,
    },
    /// This packet holds a bad signature over the joint transaction.
    InvalidSignature(SignedPacket<C>),
    /// This blame packet makes a claim which doesn't hold up.
    FalseAccusation(SignedPacket<C>),
}

/// One entry of a blame packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum BlameAtom<C: Scheme> {
    Accuse {
        accused: C::VerificationKey,
        evidence: Evidence<C>,
    },
    /// Something went wrong, but figuring out who did it needs a replay.
    Suspect(FailureKind),
    Reveal {
        kind: FailureKind,
        key: Option<C::DecryptionKey>,
        packets: Vec<SignedPacket<C>>,
    },
}

impl<C: Scheme> BlameAtom<C> {
    /// Which kind of revealed history this atom calls for, if any.
    fn calls_for(&self) -> Option<FailureKind> {
        match self {
            BlameAtom::Suspect(kind) | BlameAtom::Reveal { kind, .. } => Some(*kind),
            BlameAtom::Accuse { evidence, .. } => match evidence {
                Evidence::ShuffleFailure { .. } => Some(FailureKind::Shuffle),
                Evidence::EquivocationFailure(_) => Some(FailureKind::Equivocation),
                Evidence::InvalidSignature(_) => Some(FailureKind::Signature),
                _ => None,
            },
        }
    }
}

/// A single accusation, along with our judgement of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blame<C: Scheme> {
    pub evidence: Evidence<C>,
    /// Whether the evidence held up when we checked it.
    pub credible: bool,
}

/// Who blames whom, and for what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameMatrix<C: Scheme> {
    blame: BTreeMap<C::VerificationKey, BTreeMap<C::VerificationKey, Vec<Blame<C>>>>,
}

impl<C: Scheme> BlameMatrix<C> {
    pub fn new() -> Self {
        Self {
            blame: BTreeMap::new(),
        }
    }

    pub fn put(
        &mut self,
        accuser: &C::VerificationKey,
        accused: &C::VerificationKey,
        evidence: Evidence<C>,
        credible: bool,
    ) {
        self.blame
            .entry(accuser.clone())
            .or_default()
            .entry(accused.clone())
            .or_default()
            .push(Blame { evidence, credible });
    }

    pub fn is_empty(&self) -> bool {
        self.blame.is_empty()
    }

    /// Everything one participant blamed another for.
    pub fn get(&self, accuser: &C::VerificationKey, accused: &C::VerificationKey) -> &[Blame<C>] {
        self.blame
            .get(accuser)
            .and_then(|row| row.get(accused))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterate over every entry, as `(accuser, accused, blame)`.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&C::VerificationKey, &C::VerificationKey, &Blame<C>)> + '_ {
        self.blame.iter().flat_map(|(accuser, row)| {
            row.iter()
                .flat_map(move |(accused, blame)| blame.iter().map(move |b| (accuser, accused, b)))
        })
    }

    /// The participants facing at least one credible accusation.
    pub fn guilty(&self) -> BTreeSet<C::VerificationKey> {
        self.iter()
            .filter(|(_, _, b)| b.credible)
            .map(|(_, accused, _)| accused.clone())
            .collect()
    }
}

impl<C: Scheme> Default for BlameMatrix<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Gather the packets of some phases from our logs, for revealing.
fn reveal<C: Scheme, N: Network<C>>(
    mailbox: &Mailbox<'_, C, N>,
    kind: FailureKind,
    key: Option<&C::DecryptionKey>,
) -> BlameAtom<C> {
    let phases = kind.phases();
    let mut packets: Vec<SignedPacket<C>> = Vec::new();
    for p in mailbox.history().iter().chain(mailbox.sent()) {
        if !phases.contains(&p.phase()) {
            continue;
        }
        // A broadcast shows up once per recipient in our logs.
        let seen = packets.iter().any(|q| {
            q.from() == p.from() && q.phase() == p.phase() && q.payload() == p.payload()
        });
        if !seen {
            packets.push(p.clone());
        }
    }
    BlameAtom::Reveal {
        kind,
        key: match kind {
            FailureKind::Shuffle => key.cloned(),
            FailureKind::Equivocation | FailureKind::Signature => None,
        },
        packets,
    }
}

/// Read the atoms out of a blame packet.
fn blame_atoms<C: Scheme>(packet: &SignedPacket<C>) -> Option<Vec<BlameAtom<C>>> {
    let mut reader = packet.payload().reader();
    let mut out = Vec::with_capacity(reader.remaining());
    while reader.remaining() > 0 {
        match reader.read_blame() {
            Ok(atom) => out.push(atom.clone()),
            Err(e) => {
                warn!(from = ?packet.from(), error = %e, "ignoring malformed blame packet");
                return None;
            }
        }
    }
    Some(out)
}

/// Run the blame phase, returning the verdict.
///
/// We broadcast what we found, then collect what everyone else found. Any
/// time someone calls for a kind of history we haven't revealed yet, we
/// reveal it and collect once more.
pub(crate) async fn blame_phase<C, R, L, N>(
    replay: &Replay<'_, C, R, L>,
    mailbox: &mut Mailbox<'_, C, N>,
    trigger: BlameTrigger<C>,
    key: Option<&C::DecryptionKey>,
) -> Result<BlameMatrix<C>, ProtocolError>
where
    C: Scheme,
    R: Crypto<C>,
    L: Ledger,
    N: Network<C>,
{
    let (local, mut received) = match trigger {
        BlameTrigger::Detected(atoms) => (atoms, Vec::new()),
        BlameTrigger::Received(packet) => (Vec::new(), vec![packet]),
    };
    info!(me = ?mailbox.me(), found = local.len(), "entering blame phase");

    let mut revealed = BTreeSet::new();
    let mut first = true;
    loop {
        let mut wanted: BTreeSet<FailureKind> =
            local.iter().filter_map(BlameAtom::calls_for).collect();
        for packet in &received {
            for atom in blame_atoms(packet).unwrap_or_default() {
                wanted.extend(atom.calls_for());
            }
        }
        let wanted: Vec<_> = wanted.difference(&revealed).copied().collect();
        if !first && wanted.is_empty() {
            break;
        }

        let mut atoms: Vec<BlameAtom<C>> = if first { local.clone() } else { Vec::new() };
        for kind in wanted {
            atoms.push(reveal(mailbox, kind, key));
            revealed.insert(kind);
        }
        first = false;
        mailbox
            .broadcast(Phase::Blame, atoms.into_iter().map(Atom::Blame).collect())
            .await?;

        for (_, packets) in mailbox.receive_all_blame().await {
            received.extend(packets);
        }
    }

    // Our own blame packets get judged like everybody else's.
    let mut packets = received;
    for p in mailbox.sent() {
        let known = packets
            .iter()
            .any(|q| q.from() == p.from() && q.payload() == p.payload());
        if p.phase() == Phase::Blame && !known {
            packets.push(p.clone());
        }
    }
    let matrix = replay.run(&packets)?;
    info!(me = ?mailbox.me(), guilty = ?matrix.guilty(), "blame phase done");
    Ok(matrix)
}

/// The signed packets revealed during blame, sorted by signer and phase.
///
/// Only packets genuinely signed by a player of this round are kept.
struct Pool<C: Scheme> {
    packets: BTreeMap<(C::VerificationKey, Phase), Vec<SignedPacket<C>>>,
}

impl<C: Scheme> Pool<C> {
    fn new() -> Self {
        Self {
            packets: BTreeMap::new(),
        }
    }

    fn insert(
        &mut self,
        session: &SessionId,
        players: &ParticipantList<C>,
        packet: &SignedPacket<C>,
    ) {
        if &packet.packet.session != session
            || !players.contains(packet.from())
            || !packet.verify()
        {
            return;
        }
        let entry = self
            .packets
            .entry((packet.from().clone(), packet.phase()))
            .or_default();
        // We only care about distinct messages, not distinct recipients.
        if !entry.iter().any(|p| p.payload() == packet.payload()) {
            entry.push(packet.clone());
        }
    }

    fn all(&self, signer: &C::VerificationKey, phase: Phase) -> &[SignedPacket<C>] {
        self.packets
            .get(&(signer.clone(), phase))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn first(&self, signer: &C::VerificationKey, phase: Phase) -> Option<&SignedPacket<C>> {
        self.all(signer, phase).first()
    }

    /// The announcement of a player, split into its key and change address.
    fn announcement(
        &self,
        signer: &C::VerificationKey,
    ) -> Option<(Option<C::EncryptionKey>, Option<Address>)> {
        let packet = self.first(signer, Phase::Announcement)?;
        let mut reader = packet.payload().reader();
        let key = reader.read_optional_encryption_key().cloned();
        let change = reader.read_optional_address().cloned();
        reader.finish().ok()?;
        Some((key, change))
    }
}

fn ciphertexts<C: Scheme>(message: &Message<C>) -> Option<Vec<Vec<u8>>> {
    let mut reader = message.reader();
    let mut out = Vec::with_capacity(reader.remaining());
    while reader.remaining() > 0 {
        out.push(reader.read_ciphertext().ok()?.to_vec());
    }
    Some(out)
}

fn addresses<C: Scheme>(message: &Message<C>) -> Option<Vec<Address>> {
    let mut reader = message.reader();
    let mut out = Vec::with_capacity(reader.remaining());
    while reader.remaining() > 0 {
        out.push(reader.read_address().ok()?.clone());
    }
    Some(out)
}

/// Remove every layer of encryption, in order.
fn peel<C: Scheme>(keys: &[C::DecryptionKey], entry: &[u8]) -> Option<Vec<u8>> {
    let mut out = entry.to_vec();
    for key in keys {
        out = C::decrypt(key, &out).ok()?;
    }
    Some(out)
}

fn all_distinct<T: Ord>(items: &[T]) -> bool {
    items.iter().collect::<BTreeSet<_>>().len() == items.len()
}

/// Everything needed to judge the blame packets of a round.
pub struct Replay<'a, C: Scheme, R, L> {
    pub session: &'a SessionId,
    pub me: &'a C::VerificationKey,
    pub players: &'a ParticipantList<C>,
    pub amount: u64,
    pub crypto: &'a R,
    pub ledger: &'a L,
}

/// What a blame packet claims.
struct Claim<'p, C: Scheme> {
    packet: &'p SignedPacket<C>,
    atom: BlameAtom<C>,
}

impl<'a, C: Scheme, R: Crypto<C>, L: Ledger> Replay<'a, C, R, L> {
    /// Judge a set of blame packets.
    pub fn run(&self, packets: &[SignedPacket<C>]) -> Result<BlameMatrix<C>, ProtocolError> {
        let mut claims = Vec::new();
        let mut pool = Pool::new();
        let mut keys = BTreeMap::new();
        for packet in packets {
            if packet.phase() != Phase::Blame
                || &packet.packet.session != self.session
                || !self.players.contains(packet.from())
                || !packet.verify()
            {
                continue;
            }
            for atom in blame_atoms(packet).unwrap_or_default() {
                if let BlameAtom::Reveal { kind, key, packets } = &atom {
                    for p in packets {
                        pool.insert(self.session, self.players, p);
                    }
                    if *kind == FailureKind::Shuffle {
                        keys.insert(packet.from().clone(), key.clone());
                    }
                }
                claims.push(Claim { packet, atom });
            }
        }

        let called_for =
            |kind: FailureKind| claims.iter().any(|c| c.atom.calls_for() == Some(kind));
        let mut matrix = BlameMatrix::new();
        let mut culprits = Vec::new();
        self.check_equivocation(&pool, &mut culprits)?;
        if culprits.is_empty() && called_for(FailureKind::Shuffle) {
            self.check_shuffle(&pool, &keys, &mut culprits);
        }
        let named: BTreeSet<_> = culprits.iter().map(|(vk, _)| vk.clone()).collect();
        let transaction = if called_for(FailureKind::Signature) {
            self.joint_transaction(&pool)
        } else {
            None
        };

        for claim in &claims {
            let accuser = claim.packet.from();
            match &claim.atom {
                BlameAtom::Accuse { accused, evidence } => {
                    let credible = match evidence {
                        Evidence::ShuffleFailure { .. } | Evidence::EquivocationFailure(_) => {
                            Some(named.contains(accused))
                        }
                        // We only trust our own judgement of other accusations.
                        Evidence::FalseAccusation(_) => Some(false),
                        _ => self.check_accusation(accused, evidence, transaction.as_ref())?,
                    };
                    matrix.put(accuser, accused, evidence.clone(), credible.unwrap_or(false));
                    let checkable = matches!(
                        evidence,
                        Evidence::NoFundsAtAll
                            | Evidence::InsufficientFunds(_)
                            | Evidence::InvalidSignature(_)
                    );
                    if checkable && credible == Some(false) {
                        info!(accuser = ?accuser, accused = ?accused, "refuted accusation");
                        let evidence = Evidence::FalseAccusation(claim.packet.clone());
                        matrix.put(self.me, accuser, evidence, true);
                    }
                }
                BlameAtom::Suspect(kind) => {
                    if named.is_empty() {
                        info!(suspecter = ?accuser, ?kind, "suspicion with no culprit");
                        let evidence = Evidence::FalseAccusation(claim.packet.clone());
                        matrix.put(self.me, accuser, evidence, true);
                    }
                }
                BlameAtom::Reveal { .. } => {}
            }
        }
        for (culprit, evidence) in culprits {
            info!(culprit = ?culprit, "replay found a culprit");
            matrix.put(self.me, &culprit, evidence, true);
        }
        Ok(matrix)
    }

    /// Rebuild the joint transaction from the revealed announcements and
    /// output list.
    fn joint_transaction(&self, pool: &Pool<C>) -> Option<Transaction> {
        let outputs = self
            .players
            .get(self.players.len())
            .and_then(|last| pool.first(last, Phase::BroadcastOutput))
            .and_then(|p| addresses(p.payload()))?;
        let mut change = BTreeMap::new();
        for player in self.players.iter() {
            if let (_, Some(address)) = pool.announcement(player)? {
                change.insert(C::address(player), address);
            }
        }
        let inputs: Vec<Address> = self.players.iter().map(C::address).collect();
        match self
            .ledger
            .build_shuffle_transaction(self.amount, &inputs, &outputs, &change)
        {
            Ok(transaction) => Some(transaction),
            Err(e) => {
                warn!(error = %e, "could not rebuild the joint transaction");
                None
            }
        }
    }

    /// Check an accusation against the ledger and the joint transaction.
    ///
    /// This returns None when we don't have what we need to check it.
    fn check_accusation(
        &self,
        accused: &C::VerificationKey,
        evidence: &Evidence<C>,
        transaction: Option<&Transaction>,
    ) -> Result<Option<bool>, ProtocolError> {
        if !self.players.contains(accused) {
            return Ok(Some(false));
        }
        let address = C::address(accused);
        let out = match evidence {
            Evidence::NoFundsAtAll => Some(self.ledger.value_held(&address)? < self.amount),
            Evidence::InsufficientFunds(tx) => {
                Some(self.ledger.is_offending(&address, self.amount, tx)?)
            }
            Evidence::InvalidSignature(packet) => {
                if packet.from() != accused
                    || packet.phase() != Phase::VerificationAndSubmission
                    || &packet.packet.session != self.session
                    || !packet.verify()
                {
                    Some(false)
                } else {
                    match packet.payload().reader().read_signature() {
                        Err(_) => Some(true),
                        Ok(signature) => transaction
                            .map(|tx| !C::verify(accused, &tx.signing_bytes(), signature)),
                    }
                }
            }
            _ => None,
        };
        Ok(out)
    }

    /// Look for players who sent conflicting messages.
    fn check_equivocation(
        &self,
        pool: &Pool<C>,
        culprits: &mut Vec<(C::VerificationKey, Evidence<C>)>,
    ) -> Result<(), ProtocolError> {
        for ((signer, phase), packets) in &pool.packets {
            let broadcast = matches!(
                phase,
                Phase::Announcement | Phase::BroadcastOutput | Phase::EquivocationCheck
            );
            if broadcast && packets.len() > 1 {
                culprits.push((signer.clone(), Evidence::EquivocationFailure(packets.clone())));
            }
        }
        if !culprits.is_empty() {
            return Ok(());
        }

        let checks: Vec<_> = self
            .players
            .iter()
            .filter_map(|p| pool.first(p, Phase::EquivocationCheck))
            .collect();
        if checks.is_empty() {
            return Ok(());
        }
        let n = self.players.len();
        let mut announcements = Vec::with_capacity(n);
        for player in self.players.iter() {
            match pool.first(player, Phase::Announcement) {
                Some(packet) => announcements.push(packet.payload().clone()),
                None => return Ok(()),
            }
        }
        let outputs = self
            .players
            .get(n)
            .and_then(|last| pool.first(last, Phase::BroadcastOutput))
            .and_then(|p| addresses(p.payload()));
        let Some(outputs) = outputs else {
            return Ok(());
        };
        let message = equivocation_message(self.crypto, &announcements, &outputs)?;
        let expected = self.crypto.hash(&message)?;
        for packet in checks {
            if packet.payload().reader().read_digest() != Ok(&expected) {
                culprits.push((
                    packet.from().clone(),
                    Evidence::EquivocationFailure(vec![packet.clone()]),
                ));
            }
        }
        Ok(())
    }

    /// Replay the shuffle, step by step, to find the first player who
    /// deviated from it.
    fn check_shuffle(
        &self,
        pool: &Pool<C>,
        revealed: &BTreeMap<C::VerificationKey, Option<C::DecryptionKey>>,
        culprits: &mut Vec<(C::VerificationKey, Evidence<C>)>,
    ) {
        let n = self.players.len();
        let players = self.players.to_vec();

        // keys[j - 2] is the decryption key of player j.
        let mut keys = Vec::with_capacity(n - 1);
        for player in &players[1..] {
            let announcement = pool.first(player, Phase::Announcement);
            let announced = announcement
                .and_then(|p| p.payload().reader().read_optional_encryption_key().cloned());
            let key = revealed.get(player).cloned().flatten();
            match (&announced, &key) {
                (Some(ek), Some(dk)) if &C::encryption_key(dk) == ek => keys.push(dk.clone()),
                _ => culprits.push((
                    player.clone(),
                    Evidence::ShuffleFailure {
                        key,
                        packets: announcement.into_iter().cloned().collect(),
                    },
                )),
            }
        }
        if keys.len() < n - 1 {
            return;
        }

        for i in 1..=n {
            let player = &players[i - 1];
            let input = if i > 1 {
                pool.first(&players[i - 2], Phase::Shuffling)
            } else {
                None
            };
            let phase = if i < n {
                Phase::Shuffling
            } else {
                Phase::BroadcastOutput
            };
            let output = pool.all(player, phase);
            let evidence = |packets: &[SignedPacket<C>]| Evidence::ShuffleFailure {
                key: if i > 1 { Some(keys[i - 2].clone()) } else { None },
                packets: input.into_iter().chain(packets).cloned().collect(),
            };
            if output.len() != 1 {
                culprits.push((player.clone(), evidence(output)));
                return;
            }

            // The previous step checked that these decrypt all the way down.
            let peeled: Vec<Vec<u8>> = match input {
                None => Vec::new(),
                Some(p) => ciphertexts(p.payload())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|c| C::decrypt(&keys[i - 2], c).ok())
                    .collect(),
            };

            let honest = if i < n {
                self.check_shuffle_step(i, &keys[i - 1..], &peeled, &output[0])
            } else {
                self.check_last_step(&peeled, &output[0])
            };
            if !honest {
                culprits.push((player.clone(), evidence(output)));
                return;
            }
        }
    }

    /// Check the output of player `i < n`, given the entries it received,
    /// already stripped of its layer.
    fn check_shuffle_step(
        &self,
        i: usize,
        layers: &[C::DecryptionKey],
        peeled: &[Vec<u8>],
        output: &SignedPacket<C>,
    ) -> bool {
        let Some(mut remaining) = ciphertexts(output.payload()) else {
            return false;
        };
        if remaining.len() != i {
            return false;
        }
        let mut finals = Vec::with_capacity(i);
        for entry in &remaining {
            match peel::<C>(layers, entry).and_then(Address::from_bytes) {
                Some(address) => finals.push(address),
                None => return false,
            }
        }
        for entry in peeled {
            match remaining.iter().position(|x| x == entry) {
                Some(j) => {
                    remaining.swap_remove(j);
                }
                None => return false,
            }
        }
        all_distinct(&finals)
    }

    /// Check the output list broadcast by the last player.
    fn check_last_step(&self, peeled: &[Vec<u8>], output: &SignedPacket<C>) -> bool {
        let Some(mut remaining) = addresses(output.payload()) else {
            return false;
        };
        if remaining.len() != self.players.len() || !all_distinct(&remaining) {
            return false;
        }
        for entry in peeled {
            let position = Address::from_bytes(entry.clone())
                .and_then(|address| remaining.iter().position(|x| x == &address));
            match position {
                Some(j) => {
                    remaining.swap_remove(j);
                }
                None => return false,
            }
        }
        true
    }
}

#[cfg(all(test, feature = "k256"))]
mod test {
    use k256::Secp256k1;
    use rand_core::OsRng;

    use super::*;
    use crate::{crypto::OsCrypto, message::Packet, test::MockLedger};

    type SigningKey = <Secp256k1 as Scheme>::SigningKey;
    type VerificationKey = <Secp256k1 as Scheme>::VerificationKey;

    fn players(n: usize) -> (Vec<SigningKey>, ParticipantList<Secp256k1>) {
        let mut keys: Vec<SigningKey> = (0..n)
            .map(|_| Secp256k1::generate_signing_key(&mut OsRng))
            .collect();
        keys.sort_by_key(Secp256k1::verification_key);
        let vks: Vec<_> = keys.iter().map(Secp256k1::verification_key).collect();
        (keys, ParticipantList::new(&vks).unwrap())
    }

    fn blame_packet(
        session: &SessionId,
        from: &SigningKey,
        to: &VerificationKey,
        atoms: Vec<BlameAtom<Secp256k1>>,
    ) -> SignedPacket<Secp256k1> {
        Packet {
            session: session.clone(),
            phase: Phase::Blame,
            from: Secp256k1::verification_key(from),
            to: to.clone(),
            payload: atoms.into_iter().map(Atom::Blame).collect(),
        }
        .sign(from)
        .unwrap()
    }

    #[test]
    fn test_guilty_needs_credible_evidence() {
        let (_, list) = players(3);
        let p: Vec<_> = list.to_vec();
        let mut matrix = BlameMatrix::<Secp256k1>::new();
        assert!(matrix.is_empty());

        matrix.put(&p[0], &p[1], Evidence::NoFundsAtAll, false);
        assert!(matrix.guilty().is_empty());

        matrix.put(&p[0], &p[2], Evidence::NoFundsAtAll, true);
        matrix.put(&p[1], &p[2], Evidence::NoFundsAtAll, true);
        assert_eq!(matrix.guilty(), BTreeSet::from([p[2].clone()]));
        assert_eq!(matrix.get(&p[1], &p[2]).len(), 1);
        assert!(matrix.get(&p[2], &p[1]).is_empty());
        assert_eq!(matrix.iter().count(), 3);
    }

    #[test]
    fn test_funds_accusations_are_checked_against_the_ledger() {
        let (keys, list) = players(3);
        let p = list.to_vec();
        let session = SessionId::new("blame");
        let ledger = MockLedger::new();
        for vk in &p {
            ledger.fund(&Secp256k1::address(vk), 100);
        }
        ledger.fund(&Secp256k1::address(&p[2]), 0);

        let truthful = blame_packet(
            &session,
            &keys[0],
            &p[1],
            vec![BlameAtom::Accuse {
                accused: p[2].clone(),
                evidence: Evidence::NoFundsAtAll,
            }],
        );
        let lying = blame_packet(
            &session,
            &keys[1],
            &p[0],
            vec![BlameAtom::Accuse {
                accused: p[0].clone(),
                evidence: Evidence::NoFundsAtAll,
            }],
        );

        let crypto = OsCrypto::<Secp256k1>::new();
        let replay = Replay {
            session: &session,
            me: &p[0],
            players: &list,
            amount: 50,
            crypto: &crypto,
            ledger: &ledger,
        };
        let matrix = replay.run(&[truthful, lying.clone()]).unwrap();

        assert_eq!(matrix.guilty(), BTreeSet::from([p[1].clone(), p[2].clone()]));
        assert!(matrix.get(&p[0], &p[2])[0].credible);
        assert!(!matrix.get(&p[1], &p[0])[0].credible);
        assert_eq!(
            matrix.get(&p[0], &p[1])[0].evidence,
            Evidence::FalseAccusation(lying)
        );
    }

    fn signed(
        session: &SessionId,
        from: &SigningKey,
        to: &VerificationKey,
        phase: Phase,
        payload: Message<Secp256k1>,
    ) -> SignedPacket<Secp256k1> {
        Packet {
            session: session.clone(),
            phase,
            from: Secp256k1::verification_key(from),
            to: to.clone(),
            payload,
        }
        .sign(from)
        .unwrap()
    }

    #[test]
    fn test_signature_accusations_are_checked_against_revealed_packets() {
        let (keys, list) = players(2);
        let p = list.to_vec();
        let session = SessionId::new("blame");
        let ledger = MockLedger::new();
        for vk in &p {
            ledger.fund(&Secp256k1::address(vk), 150);
        }
        let ek = Secp256k1::encryption_key(&Secp256k1::generate_decryption_key(&mut OsRng));
        let outputs = [Address::new("out-1"), Address::new("out-2")];
        let change = Address::new("change-1");

        // The history both players reveal, which pins down the transaction.
        let history = vec![
            signed(
                &session,
                &keys[0],
                &p[1],
                Phase::Announcement,
                Message::new().attach(Atom::Address(change.clone())),
            ),
            signed(
                &session,
                &keys[1],
                &p[0],
                Phase::Announcement,
                Message::new().attach(Atom::EncryptionKey(ek)),
            ),
            signed(
                &session,
                &keys[1],
                &p[0],
                Phase::BroadcastOutput,
                outputs.iter().cloned().map(Atom::Address).collect(),
            ),
        ];
        let inputs: Vec<Address> = p.iter().map(Secp256k1::address).collect();
        let tx = ledger
            .build_shuffle_transaction(
                50,
                &inputs,
                &outputs,
                &BTreeMap::from([(inputs[0].clone(), change)]),
            )
            .unwrap();
        let signature = |key: &SigningKey, bytes: &[u8]| {
            let signature = Secp256k1::sign(key, bytes).unwrap();
            Message::new().attach(Atom::Signature(signature))
        };
        let good = signed(
            &session,
            &keys[1],
            &p[0],
            Phase::VerificationAndSubmission,
            signature(&keys[1], &tx.signing_bytes()),
        );
        let bad = signed(
            &session,
            &keys[1],
            &p[0],
            Phase::VerificationAndSubmission,
            signature(&keys[1], b"something else"),
        );
        let accuse = |evidence| {
            blame_packet(
                &session,
                &keys[0],
                &p[1],
                vec![
                    BlameAtom::Accuse {
                        accused: p[1].clone(),
                        evidence,
                    },
                    BlameAtom::Reveal {
                        kind: FailureKind::Signature,
                        key: None,
                        packets: history.clone(),
                    },
                ],
            )
        };

        let crypto = OsCrypto::<Secp256k1>::new();
        let replay = Replay {
            session: &session,
            me: &p[1],
            players: &list,
            amount: 50,
            crypto: &crypto,
            ledger: &ledger,
        };

        let matrix = replay.run(&[accuse(Evidence::InvalidSignature(bad))]).unwrap();
        assert_eq!(matrix.guilty(), BTreeSet::from([p[1].clone()]));

        let lying = accuse(Evidence::InvalidSignature(good));
        let matrix = replay.run(&[lying.clone()]).unwrap();
        assert_eq!(matrix.guilty(), BTreeSet::from([p[0].clone()]));
        assert_eq!(
            matrix.get(&p[1], &p[0])[0].evidence,
            Evidence::FalseAccusation(lying)
        );
    }

    #[test]
    fn test_signature_accusations_without_history_are_not_credible() {
        let (keys, list) = players(2);
        let p = list.to_vec();
        let session = SessionId::new("blame");
        let ledger = MockLedger::new();
        let signature = Secp256k1::sign(&keys[1], b"anything").unwrap();
        let packet = signed(
            &session,
            &keys[1],
            &p[0],
            Phase::VerificationAndSubmission,
            Message::new().attach(Atom::Signature(signature)),
        );
        let accusation = blame_packet(
            &session,
            &keys[0],
            &p[1],
            vec![BlameAtom::Accuse {
                accused: p[1].clone(),
                evidence: Evidence::InvalidSignature(packet),
            }],
        );

        let crypto = OsCrypto::<Secp256k1>::new();
        let replay = Replay {
            session: &session,
            me: &p[1],
            players: &list,
            amount: 50,
            crypto: &crypto,
            ledger: &ledger,
        };
        let matrix = replay.run(&[accusation]).unwrap();
        assert!(matrix.guilty().is_empty());
        assert!(!matrix.get(&p[0], &p[1])[0].credible);
    }

    #[test]
    fn test_groundless_suspicion_is_a_false_accusation() {
        let (keys, list) = players(2);
        let p = list.to_vec();
        let session = SessionId::new("blame");
        let ledger = MockLedger::new();
        let suspicion = blame_packet(
            &session,
            &keys[1],
            &p[0],
            vec![BlameAtom::Suspect(FailureKind::Equivocation)],
        );

        let crypto = OsCrypto::<Secp256k1>::new();
        let replay = Replay {
            session: &session,
            me: &p[0],
            players: &list,
            amount: 50,
            crypto: &crypto,
            ledger: &ledger,
        };
        let matrix = replay.run(&[suspicion]).unwrap();
        assert_eq!(matrix.guilty(), BTreeSet::from([p[1].clone()]));
    }

    #[test]
    fn test_foreign_blame_packets_are_ignored() {
        let (keys, list) = players(2);
        let p = list.to_vec();
        let session = SessionId::new("blame");
        let ledger = MockLedger::new();
        let stale = blame_packet(
            &session.next_attempt(),
            &keys[1],
            &p[0],
            vec![BlameAtom::Suspect(FailureKind::Shuffle)],
        );

        let crypto = OsCrypto::<Secp256k1>::new();
        let replay = Replay {
            session: &session,
            me: &p[0],
            players: &list,
            amount: 50,
            crypto: &crypto,
            ledger: &ledger,
        };
        assert!(replay.run(&[stale]).unwrap().is_empty());
    }
}
