//! The boundary to the transport.
//!
//! The protocol only needs to send a signed packet to a given participant,
//! and to receive the next packet addressed to it, giving up after a while.
//! This module defines that contract, along with [`LocalNetwork`], an
//! in-memory implementation, useful for simulations and tests.
use std::{collections::BTreeMap, error, fmt, sync::Arc, time::Duration};

use smol::{channel, future, Timer};

use crate::{
    message::SignedPacket,
    scheme::Scheme,
    serde::{decode, encode},
};

/// The default time to wait for a packet before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Represents an error which can happen when using the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Nothing arrived before the timeout.
    Timeout,
    /// The transport has been shut down.
    Closed,
    /// We don't know how to reach this participant.
    UnknownRecipient(String),
    /// Some bytes arrived, but they don't decode into a packet.
    Malformed(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Timeout => write!(f, "network timed out"),
            NetworkError::Closed => write!(f, "network closed"),
            NetworkError::UnknownRecipient(to) => write!(f, "unknown recipient {}", to),
            NetworkError::Malformed(e) => write!(f, "malformed packet: {}", e),
        }
    }
}

impl error::Error for NetworkError {}

/// A point to point channel between participants.
///
/// `receive` must eventually return, with [`NetworkError::Timeout`] if
/// nothing shows up in time.
#[allow(async_fn_in_trait)]
pub trait Network<C: Scheme> {
    async fn send_to(
        &self,
        to: &C::VerificationKey,
        packet: SignedPacket<C>,
    ) -> Result<(), NetworkError>;

    async fn receive(&self) -> Result<SignedPacket<C>, NetworkError>;
}

/// An in-memory network connecting a fixed set of participants.
///
/// Packets are encoded when sent and decoded when received, like they
/// would be over a real wire.
pub struct LocalNetwork;

impl LocalNetwork {
    /// Create one connected endpoint per participant.
    pub fn endpoints<C: Scheme>(
        participants: &[C::VerificationKey],
        timeout: Duration,
    ) -> Vec<Endpoint<C>> {
        let mut senders = BTreeMap::new();
        let mut receivers = Vec::with_capacity(participants.len());
        for p in participants {
            let (sender, receiver) = channel::unbounded();
            senders.insert(p.clone(), sender);
            receivers.push((p.clone(), receiver));
        }
        let senders = Arc::new(senders);

        receivers
            .into_iter()
            .map(|(me, inbox)| Endpoint {
                me,
                inbox,
                peers: Arc::clone(&senders),
                timeout,
            })
            .collect()
    }
}

/// One participant's view of a [`LocalNetwork`].
pub struct Endpoint<C: Scheme> {
    me: C::VerificationKey,
    inbox: channel::Receiver<Vec<u8>>,
    peers: Arc<BTreeMap<C::VerificationKey, channel::Sender<Vec<u8>>>>,
    timeout: Duration,
}

impl<C: Scheme> Endpoint<C> {
    pub fn me(&self) -> &C::VerificationKey {
        &self.me
    }
}

impl<C: Scheme> Network<C> for Endpoint<C> {
    async fn send_to(
        &self,
        to: &C::VerificationKey,
        packet: SignedPacket<C>,
    ) -> Result<(), NetworkError> {
        let peer = self
            .peers
            .get(to)
            .ok_or_else(|| NetworkError::UnknownRecipient(format!("{to:?}")))?;
        peer.send(encode(&packet))
            .await
            .map_err(|_| NetworkError::Closed)
    }

    async fn receive(&self) -> Result<SignedPacket<C>, NetworkError> {
        let recv = async {
            let data = self.inbox.recv().await.map_err(|_| NetworkError::Closed)?;
            decode(&data).map_err(|e| NetworkError::Malformed(e.to_string()))
        };
        let timeout = async {
            Timer::after(self.timeout).await;
            Err(NetworkError::Timeout)
        };
        future::or(recv, timeout).await
    }
}

#[cfg(all(test, feature = "k256"))]
mod test {
    use k256::Secp256k1;
    use rand_core::OsRng;

    use super::*;
    use crate::{
        message::{Message, Packet},
        protocol::{Phase, SessionId},
    };

    #[test]
    fn test_packets_arrive_and_silence_times_out() {
        let sk0 = Secp256k1::generate_signing_key(&mut OsRng);
        let sk1 = Secp256k1::generate_signing_key(&mut OsRng);
        let vk0 = Secp256k1::verification_key(&sk0);
        let vk1 = Secp256k1::verification_key(&sk1);

        let players = [vk0.clone(), vk1.clone()];
        let endpoints = LocalNetwork::endpoints::<Secp256k1>(&players, Duration::from_millis(50));

        let packet = Packet {
            session: SessionId::new("net"),
            phase: Phase::Announcement,
            from: vk0.clone(),
            to: vk1.clone(),
            payload: Message::new(),
        }
        .sign(&sk0)
        .unwrap();

        smol::block_on(async {
            endpoints[0].send_to(&vk1, packet.clone()).await.unwrap();
            let received = endpoints[1].receive().await.unwrap();
            assert_eq!(received, packet);
            assert!(received.verify());

            assert_eq!(endpoints[1].receive().await, Err(NetworkError::Timeout));
        });
    }
}
