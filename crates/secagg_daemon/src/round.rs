//! Round outcomes, fatal error taxonomy, and the multi-round controller.

use crate::aggregator::Aggregator;
use crate::config::Config;
use secagg_core::ClientId;
use std::fmt;
use thiserror::Error;
use tracing::{error, info};

/// The five client-facing phases of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Advertise,
    ShareKeys,
    Masking,
    Consistency,
    Unmasking,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Advertise => "advertise",
            Phase::ShareKeys => "share-keys",
            Phase::Masking => "masking",
            Phase::Consistency => "consistency",
            Phase::Unmasking => "unmasking",
        };
        f.write_str(name)
    }
}

/// Fatal round failures. Everything below a phase barrier is absorbed into
/// "did this client submit"; only these surface, at phase boundaries.
#[derive(Debug, Error)]
pub enum RoundError {
    /// A phase closed with fewer than `t` submissions.
    #[error("insufficient submissions in {phase} phase: {received} < {required}")]
    InsufficientSubmissions {
        phase: Phase,
        received: usize,
        required: usize,
    },

    /// At least one client dissented from the survivor-set transcript.
    #[error("consistency violation: dissent from {}", format_ids(dissenters))]
    ConsistencyViolation { dissenters: Vec<ClientId> },

    /// The round could not be completed for a non-protocol reason
    /// (reconstruction failure, socket error on a fan-out, codec error).
    #[error("round failed: {0}")]
    Internal(String),
}

fn format_ids(ids: &[ClientId]) -> String {
    ids.iter()
        .map(ClientId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl RoundError {
    /// Process exit code: 1 for any failed round, 2 for a consistency
    /// violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            RoundError::ConsistencyViolation { .. } => 2,
            _ => 1,
        }
    }
}

/// Run the configured number of rounds on the aggregator, resetting state
/// between rounds. Returns the process exit code.
///
/// The aggregator never verifies long-term signatures itself (clients do);
/// it therefore needs no key directory.
pub async fn run_aggregator(config: Config) -> anyhow::Result<i32> {
    let output_path = config.aggregator.output_path.clone();
    let rounds = config.protocol.rounds;
    let aggregator = Aggregator::bind(config).await?;

    for round in 0..rounds {
        info!(round, "starting round");
        match aggregator.run_round().await {
            Ok(aggregate) => {
                info!(round, len = aggregate.len(), "round complete");
                if let Some(path) = &output_path {
                    let json = serde_json::to_string(&aggregate)?;
                    std::fs::write(path, json)?;
                    info!(path = %path.display(), "wrote aggregate");
                }
            }
            Err(e) => {
                error!(round, error = %e, "round failed");
                return Ok(e.exit_code());
            }
        }
        aggregator.clean();
    }

    Ok(0)
}
