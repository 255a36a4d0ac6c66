use std::sync::Arc;

use switchyard_core::usage::{
    EventUsage, LimitDecision, UsageEvent, UsageKeys, UsageReport, UsageScope,
};

use super::ledger::{LimitBreach, QuotaRequest, UsageLedger};
use crate::config::UsageConfig;

/// Applies configured per-session and per-origin daily quotas on top of the ledger.
pub struct UsageLimiter {
    ledger: Arc<UsageLedger>,
    config: UsageConfig,
}

impl UsageLimiter {
    pub fn new(ledger: Arc<UsageLedger>, config: UsageConfig) -> Self {
        Self { ledger, config }
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Admit and record `units` of `event`, or deny without recording anything.
    pub fn consume(&self, event: UsageEvent, keys: &UsageKeys, units: u64) -> LimitDecision {
        match self.consume_all(keys, &[(event, units)]) {
            Ok(mut decisions) => decisions.pop().unwrap_or_else(|| allowed(None, None, None)),
            Err(denied) => denied,
        }
    }

    /// Admit several events as one metered action. Either every event is
    /// recorded and one allow decision per event is returned, or nothing is
    /// recorded and the first breached quota's denial is returned.
    pub fn consume_all(
        &self,
        keys: &UsageKeys,
        events: &[(UsageEvent, u64)],
    ) -> Result<Vec<LimitDecision>, LimitDecision> {
        let requests: Vec<QuotaRequest> = events
            .iter()
            .map(|&(event, units)| QuotaRequest {
                event,
                units,
                session_limit: self.config.limit(UsageScope::Session, event),
                origin_limit: self.config.limit(UsageScope::Origin, event),
            })
            .collect();

        let recorded = self.ledger.consume_all(keys, &requests).map_err(|breach| {
            tracing::info!(
                event = breach.event.as_str(),
                scope = breach.scope.as_str(),
                limit = breach.limit,
                current = breach.current,
                decision = "deny",
                "usage limiter decision"
            );
            LimitDecision {
                allowed: false,
                limit_type: Some(breach.scope),
                limit: Some(breach.limit),
                remaining: Some(breach.limit.saturating_sub(breach.current)),
                message: Some(denial_message(&breach)),
            }
        })?;

        Ok(requests
            .iter()
            .zip(recorded)
            .map(|(request, counts)| {
                let session_remaining = request
                    .session_limit
                    .map(|limit| limit.saturating_sub(counts.session));
                let origin_remaining = match (request.origin_limit, counts.origin) {
                    (Some(limit), Some(count)) => Some(limit.saturating_sub(count)),
                    _ => None,
                };
                let (limit_type, limit, remaining) = tightest(
                    request.session_limit,
                    session_remaining,
                    request.origin_limit,
                    origin_remaining,
                );
                tracing::debug!(
                    event = request.event.as_str(),
                    session_count = counts.session,
                    origin_count = ?counts.origin,
                    remaining = ?remaining,
                    decision = "allow",
                    "usage limiter decision"
                );
                allowed(limit_type, limit, remaining)
            })
            .collect())
    }

    /// Today's usage for every metered event plus token totals.
    pub fn report(&self, keys: &UsageKeys) -> UsageReport {
        let events = UsageEvent::ALL
            .into_iter()
            .map(|event| EventUsage {
                event,
                counts: self.ledger.get_count(event, keys),
                session_limit: self.config.limit(UsageScope::Session, event),
                origin_limit: self.config.limit(UsageScope::Origin, event),
            })
            .collect();
        let tokens = self.ledger.get_token_usage(keys);
        UsageReport {
            day: self.ledger.today().format("%Y-%m-%d").to_string(),
            events,
            session_tokens: tokens.session,
            origin_tokens: tokens.origin,
        }
    }
}

fn allowed(limit_type: Option<UsageScope>, limit: Option<u64>, remaining: Option<u64>) -> LimitDecision {
    LimitDecision {
        allowed: true,
        limit_type,
        limit,
        remaining,
        message: None,
    }
}

/// Pick the scope with the least headroom left; unlimited scopes never win.
fn tightest(
    session_limit: Option<u64>,
    session_remaining: Option<u64>,
    origin_limit: Option<u64>,
    origin_remaining: Option<u64>,
) -> (Option<UsageScope>, Option<u64>, Option<u64>) {
    match (session_remaining, origin_remaining) {
        (Some(s), Some(o)) if o < s => (Some(UsageScope::Origin), origin_limit, Some(o)),
        (Some(s), _) => (Some(UsageScope::Session), session_limit, Some(s)),
        (None, Some(o)) => (Some(UsageScope::Origin), origin_limit, Some(o)),
        (None, None) => (None, None, None),
    }
}

fn denial_message(breach: &LimitBreach) -> String {
    let event = breach.event;
    match breach.scope {
        UsageScope::Session => format!(
            "You've reached today's limit of {} {} for this session. The limit resets at midnight UTC.",
            breach.limit,
            event.label()
        ),
        UsageScope::Origin => format!(
            "Your network has reached today's limit of {} {}. The limit resets at midnight UTC.",
            breach.limit,
            event.label()
        ),
    }
}
