//! A phase-aware mailbox, sitting on top of a raw network.
//!
//! Participants don't move through the phases in lockstep: a fast peer may
//! send us its packet for the next phase before we're done with the current
//! one. The mailbox keeps such packets around until we ask for their phase.
//! Blame packets are the exception, since they need to interrupt whatever we
//! are doing.
//!
//! Every packet we accept, and every packet we send, also ends up in a
//! permanent log. These logs are the only evidence admitted in the blame phase.
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::{
    message::{Message, Packet, SignedPacket},
    network::{Network, NetworkError},
    participants::ParticipantList,
    protocol::{Phase, ProtocolError, SessionId},
    round::{BlameTrigger, RoundError},
    scheme::Scheme,
};

/// What became of a packet fresh off the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Accepted,
    /// Kept for a later attempt at our session.
    Later,
    /// Forged, or not from a fellow player.
    Dropped,
    /// Meant for another session, or another recipient.
    Mismatched,
}

pub struct Mailbox<'a, C: Scheme, N> {
    session: SessionId,
    key: C::SigningKey,
    me: C::VerificationKey,
    players: ParticipantList<C>,
    network: &'a N,
    /// Packets we accepted but nobody asked for yet.
    delivered: VecDeque<SignedPacket<C>>,
    /// Every packet we accepted.
    history: Vec<SignedPacket<C>>,
    /// Every packet we sent.
    sent: Vec<SignedPacket<C>>,
    /// Packets for a later attempt at our session.
    later: Vec<SignedPacket<C>>,
}

impl<'a, C: Scheme, N: Network<C>> Mailbox<'a, C, N> {
    pub fn new(
        session: SessionId,
        key: C::SigningKey,
        players: ParticipantList<C>,
        network: &'a N,
    ) -> Self {
        let me = C::verification_key(&key);
        Self {
            session,
            key,
            me,
            players,
            network,
            delivered: VecDeque::new(),
            history: Vec::new(),
            sent: Vec::new(),
            later: Vec::new(),
        }
    }

    /// Hand over packets which reached an earlier mailbox too soon.
    pub fn deliver(&mut self, packets: Vec<SignedPacket<C>>) {
        for packet in packets {
            if self.accept(&packet) == Admission::Accepted {
                self.history.push(packet.clone());
                self.delivered.push_back(packet);
            }
        }
    }

    /// Take the packets which showed up for a later attempt at our session.
    pub fn take_later(&mut self) -> Vec<SignedPacket<C>> {
        std::mem::take(&mut self.later)
    }

    pub fn me(&self) -> &C::VerificationKey {
        &self.me
    }

    pub fn history(&self) -> &[SignedPacket<C>] {
        &self.history
    }

    pub fn sent(&self) -> &[SignedPacket<C>] {
        &self.sent
    }

    /// Sign and send a message to one participant.
    ///
    /// Sending is fire and forget: a peer we can't reach will show up later
    /// as a timeout, so a failed send is only logged.
    pub async fn send(
        &mut self,
        phase: Phase,
        to: &C::VerificationKey,
        payload: Message<C>,
    ) -> Result<(), ProtocolError> {
        let packet = Packet {
            session: self.session.clone(),
            phase,
            from: self.me.clone(),
            to: to.clone(),
            payload,
        }
        .sign(&self.key)?;
        self.sent.push(packet.clone());
        if let Err(e) = self.network.send_to(to, packet).await {
            warn!(%phase, to = ?to, error = %e, "failed to send packet");
        }
        Ok(())
    }

    /// Send the same message to every other participant.
    pub async fn broadcast(
        &mut self,
        phase: Phase,
        payload: Message<C>,
    ) -> Result<(), ProtocolError> {
        let others: Vec<_> = self.players.others(&self.me).cloned().collect();
        for to in others {
            self.send(phase, &to, payload.clone()).await?;
        }
        Ok(())
    }

    /// Decide whether a packet fresh off the network deserves our attention.
    fn accept(&mut self, packet: &SignedPacket<C>) -> Admission {
        let from = packet.from();
        if !packet.verify() {
            warn!(from = ?from, phase = %packet.phase(), "dropping packet with a bad signature");
            return Admission::Dropped;
        }
        if from == &self.me || !self.players.contains(from) {
            warn!(from = ?from, "dropping packet from outside the round");
            return Admission::Dropped;
        }
        let session = &packet.packet.session;
        if session != &self.session {
            let later = SessionId {
                attempt: self.session.attempt,
                ..session.clone()
            } == self.session
                && session.attempt > self.session.attempt;
            if later {
                debug!(from = ?from, %session, "keeping packet for a later attempt");
                self.later.push(packet.clone());
                return Admission::Later;
            }
            debug!(from = ?from, %session, "dropping packet from another session");
            return Admission::Mismatched;
        }
        if packet.to() != &self.me {
            warn!(from = ?from, to = ?packet.to(), "dropping packet addressed to someone else");
            return Admission::Mismatched;
        }
        Admission::Accepted
    }

    /// Wait for the next acceptable packet on the network, logging it.
    async fn next_from_network(&mut self) -> Result<SignedPacket<C>, NetworkError> {
        loop {
            match self.network.receive().await {
                Ok(packet) => match self.accept(&packet) {
                    Admission::Accepted => {
                        self.history.push(packet.clone());
                        return Ok(packet);
                    }
                    // A peer which moved on to a later attempt has nothing
                    // more to say in this one.
                    Admission::Later => return Err(NetworkError::Timeout),
                    Admission::Dropped | Admission::Mismatched => {}
                },
                Err(NetworkError::Malformed(e)) => {
                    warn!(error = %e, "dropping malformed packet");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Take a packet of some phase we already received, if any.
    fn take_delivered(&mut self, phase: Phase) -> Option<SignedPacket<C>> {
        let i = self.delivered.iter().position(|p| p.phase() == phase)?;
        self.delivered.remove(i)
    }

    /// Receive the next packet for a given phase.
    ///
    /// Packets from later phases get set aside for later calls. A blame packet
    /// is returned right away, whatever phase we're waiting for.
    pub async fn receive_next_packet(
        &mut self,
        expected: Phase,
    ) -> Result<SignedPacket<C>, NetworkError> {
        if let Some(packet) = self.take_delivered(expected) {
            return Ok(packet);
        }
        loop {
            let packet = self.next_from_network().await?;
            let phase = packet.phase();
            if phase == expected || phase == Phase::Blame {
                return Ok(packet);
            }
            debug!(%phase, %expected, from = ?packet.from(), "setting packet aside");
            self.delivered.push_back(packet);
        }
    }

    fn silent(&self, keys: &[C::VerificationKey]) -> Vec<usize> {
        keys.iter().filter_map(|k| self.players.index(k)).collect()
    }

    fn receive_error(
        &self,
        phase: Phase,
        missing: &[C::VerificationKey],
        e: NetworkError,
    ) -> RoundError<C> {
        match e {
            NetworkError::Timeout => RoundError::Fatal(ProtocolError::Timeout {
                phase,
                silent: self.silent(missing),
            }),
            e => RoundError::Fatal(ProtocolError::Network(e)),
        }
    }

    /// Receive a packet for a given phase from a specific participant.
    pub async fn receive_from(
        &mut self,
        from: &C::VerificationKey,
        phase: Phase,
    ) -> Result<SignedPacket<C>, RoundError<C>> {
        if phase != Phase::Blame {
            if let Some(packet) = self.take_delivered(Phase::Blame) {
                return Err(RoundError::Blame(BlameTrigger::Received(packet)));
            }
        }
        let packet = self
            .receive_next_packet(phase)
            .await
            .map_err(|e| self.receive_error(phase, std::slice::from_ref(from), e))?;
        if packet.phase() != phase {
            return Err(RoundError::Blame(BlameTrigger::Received(packet)));
        }
        if packet.from() != from {
            return Err(RoundError::UnexpectedSender {
                expected: from.clone(),
                packet,
            });
        }
        Ok(packet)
    }

    /// Receive one packet for a given phase from each of several participants.
    ///
    /// With `blame_interrupt` set, a blame packet ends the wait; otherwise it
    /// is set aside for later.
    pub async fn receive_from_multiple(
        &mut self,
        from: &[C::VerificationKey],
        phase: Phase,
        blame_interrupt: bool,
    ) -> Result<BTreeMap<C::VerificationKey, SignedPacket<C>>, RoundError<C>> {
        if blame_interrupt && phase != Phase::Blame {
            if let Some(packet) = self.take_delivered(Phase::Blame) {
                return Err(RoundError::Blame(BlameTrigger::Received(packet)));
            }
        }
        let mut out = BTreeMap::new();
        while out.len() < from.len() {
            let packet = match self.receive_next_packet(phase).await {
                Ok(packet) => packet,
                Err(e) => {
                    let missing: Vec<_> = from
                        .iter()
                        .filter(|k| !out.contains_key(*k))
                        .cloned()
                        .collect();
                    return Err(self.receive_error(phase, &missing, e));
                }
            };
            if packet.phase() != phase {
                if blame_interrupt {
                    return Err(RoundError::Blame(BlameTrigger::Received(packet)));
                }
                self.delivered.push_back(packet);
                continue;
            }
            let sender = packet.from().clone();
            if !from.contains(&sender) {
                warn!(%phase, from = ?sender, "dropping packet from unexpected sender");
                continue;
            }
            if out.contains_key(&sender) {
                return Err(RoundError::Fatal(ProtocolError::InvalidImplementation(
                    format!("received two {phase} packets from {sender:?}"),
                )));
            }
            out.insert(sender, packet);
        }
        Ok(out)
    }

    /// Collect blame packets until the network falls silent, or a peer
    /// moves on to a later attempt.
    ///
    /// A packet meant for another session or recipient also ends the pass.
    /// Packets of other phases are set aside. The packets are grouped by
    /// sender.
    pub async fn receive_all_blame(
        &mut self,
    ) -> BTreeMap<C::VerificationKey, Vec<SignedPacket<C>>> {
        let mut out: BTreeMap<_, Vec<_>> = BTreeMap::new();
        loop {
            if let Some(packet) = self.take_delivered(Phase::Blame) {
                out.entry(packet.from().clone()).or_default().push(packet);
                continue;
            }
            if !self.later.is_empty() {
                break;
            }
            let packet = match self.network.receive().await {
                Ok(packet) => packet,
                Err(NetworkError::Timeout) => break,
                Err(e) => {
                    warn!(error = %e, "blame collection cut short");
                    break;
                }
            };
            match self.accept(&packet) {
                Admission::Accepted => {
                    self.history.push(packet.clone());
                    if packet.phase() == Phase::Blame {
                        out.entry(packet.from().clone()).or_default().push(packet);
                    } else {
                        self.delivered.push_back(packet);
                    }
                }
                Admission::Dropped => {}
                Admission::Later => break,
                Admission::Mismatched => {
                    debug!(from = ?packet.from(), "stray packet ends blame collection");
                    break;
                }
            }
        }
        out
    }
}
