//! Day-bucketed usage counters keyed by (scope, key, event).
//!
//! Every bucket carries the day it was last written. Any read or write first
//! compares that stamp to today and zeroes the bucket when they differ; there
//! is no background sweep. Mutations only mark the snapshot dirty; a flusher
//! task writes it to disk on the blocking pool, outside the counter lock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use switchyard_core::dispatch::TokenUsage;
use switchyard_core::usage::{UsageCounts, UsageEvent, UsageKeys, UsageScope};

use crate::persist::{self, SnapshotError};

/// Source of "today". Injected so tests can roll the calendar.
pub type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub fn utc_day_clock() -> DayClock {
    Arc::new(|| Utc::now().date_naive())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DayCount {
    day: String,
    count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenBucket {
    day: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerSnapshot {
    /// "scope:key" -> event -> bucket
    #[serde(default)]
    counters: BTreeMap<String, BTreeMap<String, DayCount>>,
    /// "scope:key" -> bucket
    #[serde(default)]
    tokens: BTreeMap<String, TokenBucket>,
}

#[derive(Debug, Default)]
struct LedgerState {
    snapshot: LedgerSnapshot,
    dirty: bool,
}

fn scope_key(scope: UsageScope, key: &str) -> String {
    format!("{}:{}", scope.as_str(), key)
}

impl LedgerState {
    fn count(&mut self, scope: UsageScope, key: &str, event: UsageEvent, today: &str) -> u64 {
        let Some(bucket) = self
            .snapshot
            .counters
            .get_mut(&scope_key(scope, key))
            .and_then(|events| events.get_mut(event.as_str()))
        else {
            return 0;
        };
        if bucket.day != today {
            bucket.day = today.to_string();
            bucket.count = 0;
            self.dirty = true;
        }
        bucket.count
    }

    fn add(&mut self, scope: UsageScope, key: &str, event: UsageEvent, today: &str, units: u64) -> u64 {
        let bucket = self
            .snapshot
            .counters
            .entry(scope_key(scope, key))
            .or_default()
            .entry(event.as_str().to_string())
            .or_insert_with(|| DayCount {
                day: today.to_string(),
                count: 0,
            });
        if bucket.day != today {
            bucket.day = today.to_string();
            bucket.count = 0;
        }
        bucket.count = bucket.count.saturating_add(units);
        self.dirty = true;
        bucket.count
    }

    fn tokens(&mut self, scope: UsageScope, key: &str, today: &str) -> TokenUsage {
        let Some(bucket) = self.snapshot.tokens.get_mut(&scope_key(scope, key)) else {
            return TokenUsage::default();
        };
        if bucket.day != today {
            *bucket = empty_token_bucket(today);
            self.dirty = true;
        }
        TokenUsage {
            prompt_tokens: bucket.prompt_tokens,
            completion_tokens: bucket.completion_tokens,
            total_tokens: bucket.total_tokens,
        }
    }

    fn add_tokens(&mut self, scope: UsageScope, key: &str, today: &str, usage: &TokenUsage) {
        let bucket = self
            .snapshot
            .tokens
            .entry(scope_key(scope, key))
            .or_insert_with(|| empty_token_bucket(today));
        if bucket.day != today {
            *bucket = empty_token_bucket(today);
        }
        bucket.prompt_tokens = bucket.prompt_tokens.saturating_add(usage.prompt_tokens);
        bucket.completion_tokens = bucket.completion_tokens.saturating_add(usage.completion_tokens);
        bucket.total_tokens = bucket.total_tokens.saturating_add(usage.total_tokens);
        self.dirty = true;
    }
}

fn empty_token_bucket(today: &str) -> TokenBucket {
    TokenBucket {
        day: today.to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    }
}

/// Cumulative token usage for today, per scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTotals {
    pub session: TokenUsage,
    pub origin: Option<TokenUsage>,
}

/// One metered event in a `consume_all` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRequest {
    pub event: UsageEvent,
    pub units: u64,
    pub session_limit: Option<u64>,
    pub origin_limit: Option<u64>,
}

/// A quota that would be exceeded; nothing was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitBreach {
    pub event: UsageEvent,
    pub scope: UsageScope,
    pub limit: u64,
    pub current: u64,
}

pub struct UsageLedger {
    state: Mutex<LedgerState>,
    snapshot_path: Option<PathBuf>,
    clock: DayClock,
}

impl UsageLedger {
    /// Ledger without persistence.
    pub fn in_memory(clock: DayClock) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            snapshot_path: None,
            clock,
        }
    }

    /// Ledger backed by a JSON snapshot, loading any existing counters.
    pub fn open(path: impl Into<PathBuf>, clock: DayClock) -> Result<Self, SnapshotError> {
        let path = path.into();
        let snapshot = persist::read_snapshot::<LedgerSnapshot>(&path)?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(LedgerState {
                snapshot,
                dirty: false,
            }),
            snapshot_path: Some(path),
            clock,
        })
    }

    pub fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    fn today_stamp(&self) -> String {
        self.today().format("%Y-%m-%d").to_string()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the snapshot if anything changed since the last flush. The body
    /// is encoded under the lock; the disk write happens after releasing it.
    pub async fn flush(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let body = {
            let mut state = self.lock();
            if !state.dirty {
                return;
            }
            match persist::encode_snapshot(path, &state.snapshot) {
                Ok(body) => {
                    state.dirty = false;
                    body
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode usage snapshot");
                    return;
                }
            }
        };
        if let Err(err) = persist::write_encoded(path.clone(), body).await {
            tracing::warn!(error = %err, "failed to persist usage snapshot");
            self.lock().dirty = true;
        }
    }

    /// Flush dirty counters every `period` until the runtime shuts down.
    pub fn spawn_flusher(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ledger.flush().await;
            }
        })
    }

    pub fn get_count(&self, event: UsageEvent, keys: &UsageKeys) -> UsageCounts {
        let today = self.today_stamp();
        let mut state = self.lock();
        UsageCounts {
            session: state.count(UsageScope::Session, &keys.session, event, &today),
            origin: keys
                .origin
                .as_deref()
                .map(|origin| state.count(UsageScope::Origin, origin, event, &today)),
        }
    }

    pub fn record(&self, event: UsageEvent, keys: &UsageKeys, units: u64) {
        let today = self.today_stamp();
        let mut state = self.lock();
        state.add(UsageScope::Session, &keys.session, event, &today, units);
        if let Some(origin) = keys.origin.as_deref() {
            state.add(UsageScope::Origin, origin, event, &today, units);
        }
    }

    pub fn get_token_usage(&self, keys: &UsageKeys) -> TokenTotals {
        let today = self.today_stamp();
        let mut state = self.lock();
        TokenTotals {
            session: state.tokens(UsageScope::Session, &keys.session, &today),
            origin: keys
                .origin
                .as_deref()
                .map(|origin| state.tokens(UsageScope::Origin, origin, &today)),
        }
    }

    pub fn record_tokens(&self, keys: &UsageKeys, usage: &TokenUsage) {
        if usage.is_empty() {
            return;
        }
        let today = self.today_stamp();
        let mut state = self.lock();
        state.add_tokens(UsageScope::Session, &keys.session, &today, usage);
        if let Some(origin) = keys.origin.as_deref() {
            state.add_tokens(UsageScope::Origin, origin, &today, usage);
        }
    }

    /// Check every request against both quotas and record all of them, or
    /// none when any one would be exceeded. Session limits are checked before
    /// origin limits, in request order. The check and the write happen under
    /// one lock so two concurrent consumers of the same key cannot both slip
    /// past a limit.
    pub fn consume_all(
        &self,
        keys: &UsageKeys,
        requests: &[QuotaRequest],
    ) -> Result<Vec<UsageCounts>, LimitBreach> {
        let today = self.today_stamp();
        let mut state = self.lock();

        for request in requests {
            if let Some(breach) = state.breach(keys, request, &today) {
                return Err(breach);
            }
        }

        let recorded = requests
            .iter()
            .map(|request| UsageCounts {
                session: state.add(
                    UsageScope::Session,
                    &keys.session,
                    request.event,
                    &today,
                    request.units,
                ),
                origin: keys.origin.as_deref().map(|origin| {
                    state.add(UsageScope::Origin, origin, request.event, &today, request.units)
                }),
            })
            .collect();
        Ok(recorded)
    }
}

impl LedgerState {
    fn breach(&mut self, keys: &UsageKeys, request: &QuotaRequest, today: &str) -> Option<LimitBreach> {
        let session_count = self.count(UsageScope::Session, &keys.session, request.event, today);
        if let Some(limit) = request
            .session_limit
            .filter(|limit| session_count.saturating_add(request.units) > *limit)
        {
            return Some(LimitBreach {
                event: request.event,
                scope: UsageScope::Session,
                limit,
                current: session_count,
            });
        }

        let origin = keys.origin.as_deref()?;
        let limit = request.origin_limit?;
        let current = self.count(UsageScope::Origin, origin, request.event, today);
        (current.saturating_add(request.units) > limit).then_some(LimitBreach {
            event: request.event,
            scope: UsageScope::Origin,
            limit,
            current,
        })
    }
}
