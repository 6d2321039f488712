//! Running rounds until the shuffle goes through.
//!
//! A round which fails tells us who to blame. The session drops those
//! players, and tries again with whoever is left, until a round completes,
//! too few players remain, or we run out of attempts.
//!
//! A timeout ends the session without dropping anyone: players waiting at
//! different points may each see a different player go silent.
use std::{error, fmt};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    blame::BlameMatrix,
    crypto::Crypto,
    ledger::{Ledger, Transaction},
    message::SignedPacket,
    network::Network,
    participants::ParticipantList,
    protocol::{InitializationError, Phase, ProtocolError, SessionId},
    round::{Round, RoundOutcome},
    scheme::{Address, Scheme},
};

/// The parameters of a session.
///
/// Missing fields take their default values, so this can be loaded from a
/// partial configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How much each player moves to its output.
    pub amount: u64,
    /// Give up once fewer players than this remain.
    pub min_players: usize,
    /// How many rounds to run at most.
    pub max_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            amount: 0,
            min_players: 2,
            max_attempts: 3,
        }
    }
}

/// Represents an error preventing a session from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Initialization(InitializationError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Initialization(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for SessionError {}

impl From<InitializationError> for SessionError {
    fn from(e: InitializationError) -> Self {
        Self::Initialization(e)
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum Outcome<C: Scheme> {
    Completed {
        transaction: Transaction,
        output: Address,
        output_key: C::SigningKey,
        /// How many rounds it took.
        attempts: usize,
    },
    Failed {
        /// The phase the last round failed in.
        ///
        /// This is [`Phase::Uninitiated`] when the failure came from our own
        /// environment, before we knew where we were.
        phase: Phase,
        /// The verdict of the last blame phase, if there was one.
        matrix: Option<BlameMatrix<C>>,
        /// The error which ended the last round, if any.
        error: Option<ProtocolError>,
    },
}

/// A CoinShuffle session, from the point of view of one player.
pub struct Session<'a, C: Scheme, R, L, N> {
    session: SessionId,
    config: SessionConfig,
    key: C::SigningKey,
    players: ParticipantList<C>,
    change: Option<Address>,
    crypto: &'a R,
    ledger: &'a L,
    network: &'a N,
}

impl<'a, C, R, L, N> Session<'a, C, R, L, N>
where
    C: Scheme,
    R: Crypto<C>,
    L: Ledger,
    N: Network<C>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionId,
        config: SessionConfig,
        key: C::SigningKey,
        players: &[C::VerificationKey],
        change: Option<Address>,
        crypto: &'a R,
        ledger: &'a L,
        network: &'a N,
    ) -> Result<Self, SessionError> {
        if config.amount == 0 {
            return Err(
                InitializationError::BadParameters("amount must be positive".to_string()).into(),
            );
        }
        if config.min_players < 2 {
            return Err(InitializationError::BadParameters(format!(
                "min_players must be at least 2, found {}",
                config.min_players
            ))
            .into());
        }
        if config.max_attempts == 0 {
            return Err(InitializationError::BadParameters(
                "max_attempts must be positive".to_string(),
            )
            .into());
        }
        if players.len() < config.min_players {
            return Err(InitializationError::BadParameters(format!(
                "{} players is fewer than the minimum of {}",
                players.len(),
                config.min_players
            ))
            .into());
        }
        let players = ParticipantList::new(players).ok_or_else(|| {
            InitializationError::InvalidParticipantSet("players contain duplicates".to_string())
        })?;
        if !players.contains(&C::verification_key(&key)) {
            return Err(InitializationError::InvalidParticipantSet(
                "players do not contain our key".to_string(),
            )
            .into());
        }
        Ok(Self {
            session,
            config,
            key,
            players,
            change,
            crypto,
            ledger,
            network,
        })
    }

    /// Run rounds until one completes, or there's no point in going on.
    pub async fn run(&self) -> Outcome<C> {
        let me = C::verification_key(&self.key);
        let mut session = self.session.clone();
        let mut players = self.players.clone();
        let mut early: Vec<SignedPacket<C>> = Vec::new();
        let mut failure: (Phase, Option<BlameMatrix<C>>, Option<ProtocolError>) =
            (Phase::Uninitiated, None, None);

        for attempt in 1..=self.config.max_attempts {
            if players.len() < self.config.min_players {
                info!(remaining = players.len(), "too few players left");
                break;
            }
            let round = match Round::<C, R, L, N>::new(
                session.clone(),
                self.config.amount,
                self.key.clone(),
                &players.to_vec(),
                self.change.clone(),
                self.crypto,
                self.ledger,
                self.network,
            ) {
                Ok(round) => round,
                Err(e) => {
                    failure.2 = Some(ProtocolError::InvalidImplementation(e.to_string()));
                    break;
                }
            };
            info!(attempt, %session, players = players.len(), "starting attempt");
            let (result, later) = round.run_with(std::mem::take(&mut early)).await;
            early = later;

            let eliminated: Vec<C::VerificationKey> = match result {
                Ok(RoundOutcome::Completed {
                    transaction,
                    output,
                    output_key,
                }) => {
                    return Outcome::Completed {
                        transaction,
                        output,
                        output_key,
                        attempts: attempt,
                    }
                }
                Ok(RoundOutcome::Blamed { phase, matrix }) => {
                    let guilty = matrix.guilty();
                    if guilty.is_empty() || guilty.contains(&me) {
                        warn!(
                            attempt,
                            %phase,
                            guilty = guilty.len(),
                            "blame leaves nobody to drop, or drops us"
                        );
                        return Outcome::Failed {
                            phase,
                            matrix: Some(matrix),
                            error: None,
                        };
                    }
                    let guilty: Vec<_> = guilty.into_iter().collect();
                    failure = (phase, Some(matrix), None);
                    guilty
                }
                Err(ProtocolError::Timeout { phase, silent }) => {
                    warn!(attempt, %phase, ?silent, "timed out, ending the session");
                    return Outcome::Failed {
                        phase,
                        matrix: None,
                        error: Some(ProtocolError::Timeout { phase, silent }),
                    };
                }
                Err(e) => {
                    warn!(attempt, error = %e, "round failed");
                    failure.2 = Some(e);
                    break;
                }
            };

            info!(attempt, dropped = ?eliminated, "eliminating players");
            players = match players.without(&eliminated) {
                Some(players) => players,
                None => break,
            };
            session = session.next_attempt();
        }

        let (phase, matrix, error) = failure;
        Outcome::Failed {
            phase,
            matrix,
            error,
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_config_defaults_fill_gaps() {
        let partial = rmp_serde::to_vec_named(&BTreeMap::from([("amount", 5u64)])).unwrap();
        let config: SessionConfig = rmp_serde::from_slice(&partial).unwrap();
        assert_eq!(
            config,
            SessionConfig {
                amount: 5,
                min_players: 2,
                max_attempts: 3,
            }
        );
    }

    #[cfg(feature = "k256")]
    #[test]
    fn test_bad_parameters_are_rejected() {
        use std::time::Duration;

        use k256::Secp256k1;
        use rand_core::OsRng;

        use crate::{crypto::OsCrypto, network::LocalNetwork, test::MockLedger};

        let key = Secp256k1::generate_signing_key(&mut OsRng);
        let me = Secp256k1::verification_key(&key);
        let other = Secp256k1::verification_key(&Secp256k1::generate_signing_key(&mut OsRng));
        let players = [me.clone(), other];

        let crypto = OsCrypto::<Secp256k1>::new();
        let ledger = MockLedger::new();
        let endpoints = LocalNetwork::endpoints::<Secp256k1>(&players, Duration::from_millis(10));

        let configs = [
            SessionConfig::default(),
            SessionConfig {
                amount: 1,
                min_players: 1,
                ..Default::default()
            },
            SessionConfig {
                amount: 1,
                max_attempts: 0,
                ..Default::default()
            },
            SessionConfig {
                amount: 1,
                min_players: 3,
                ..Default::default()
            },
        ];
        for config in configs {
            let session = Session::<Secp256k1, _, _, _>::new(
                SessionId::new("session"),
                config,
                key.clone(),
                &players,
                None,
                &crypto,
                &ledger,
                &endpoints[0],
            );
            assert!(matches!(
                session,
                Err(SessionError::Initialization(InitializationError::BadParameters(_)))
            ));
        }
    }
}
