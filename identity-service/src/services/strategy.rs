use chrono::Duration;

use super::error::ServiceError;
use crate::models::{AppData, AuthStrategy, ChallengeType, FirstFactorInternalStrategy, Transport};

/// Configured strategies matching `requested` on identity, challenge and
/// transport, in declaration order.
pub fn filter_compatible(
    requested: &FirstFactorInternalStrategy,
    configured: &[AuthStrategy],
) -> Vec<FirstFactorInternalStrategy> {
    configured
        .iter()
        .filter_map(|strategy| match strategy {
            AuthStrategy::FirstFactorInternal(s) => Some(*s),
            AuthStrategy::FirstFactorFederated(_) => None,
        })
        .filter(|s| {
            s.challenge == requested.challenge
                && s.transport == requested.transport
                && s.identity == requested.identity
        })
        .collect()
}

/// First compatible strategy of the app.
pub fn select_strategy(
    app: &AppData,
    requested: &FirstFactorInternalStrategy,
) -> Result<FirstFactorInternalStrategy, ServiceError> {
    filter_compatible(requested, &app.auth_strategies)
        .into_iter()
        .next()
        .ok_or(ServiceError::StrategyUnsupportedByApp)
}

pub fn expire_challenge_duration(strategy: &FirstFactorInternalStrategy) -> Duration {
    match (strategy.challenge, strategy.transport) {
        (ChallengeType::Otp, Transport::Sms) => Duration::minutes(5),
        (ChallengeType::Otp, _) => Duration::minutes(10),
        (ChallengeType::MagicLink, _) => Duration::minutes(30),
        (ChallengeType::Password, _) => Duration::zero(),
    }
}
