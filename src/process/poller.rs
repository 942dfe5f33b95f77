//! Bounded-concurrency polling of server-side processes.
//!
//! # Rounds
//!
//! Each round issues one status request per pending id, at most
//! [`PollPolicy::concurrency`] at a time. Workers only report results; the
//! coordinating loop applies them to the pending set and status map, so no
//! shared state is mutated concurrently.
//!
//! | Outcome                      | Effect                                  |
//! |------------------------------|-----------------------------------------|
//! | `finished` / `failed`        | recorded, id leaves the pending set     |
//! | `queued`                     | recorded, id stays pending              |
//! | retryable error              | id stays pending for the next round     |
//! | non-retryable error          | id recorded as `failed`, leaves pending |
//!
//! Between rounds the loop sleeps for a wait that starts at
//! [`PollPolicy::initial_wait`], doubles each round, and is capped by both
//! [`PollPolicy::max_wait`] and the remaining budget.
//!
//! # Budget vs. cancellation
//!
//! Running out of budget is a soft outcome: polling stops and ids still
//! pending are reported as `queued`. Cancelling the [`CallScope`] (or hitting
//! the scope's own deadline) is a hard error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{ProcessStatusSource, QueuedProcess};
use crate::api::{ClientError, is_retryable};
use crate::config::{
    ClientConfig, DEFAULT_POLL_CONCURRENCY, DEFAULT_POLL_INITIAL_WAIT, DEFAULT_POLL_MAX_WAIT,
};
use crate::scope::CallScope;

/// Timing and concurrency for one poll session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait after the first round.
    pub initial_wait: Duration,
    /// Cap on the wait between rounds.
    pub max_wait: Duration,
    /// Wall-clock budget measured from the start of polling.
    pub budget: Duration,
    /// Concurrent status requests per round.
    pub concurrency: usize,
}

impl PollPolicy {
    /// Creates a policy with default wait bounds.
    #[must_use]
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            initial_wait: DEFAULT_POLL_INITIAL_WAIT,
            max_wait: DEFAULT_POLL_MAX_WAIT,
            budget,
            concurrency: DEFAULT_POLL_CONCURRENCY,
        }
    }

    /// Creates a policy from the client's configured bounds.
    #[must_use]
    pub fn from_config(config: &ClientConfig, budget: Duration) -> Self {
        Self {
            initial_wait: config.poll_initial_wait(),
            max_wait: config.poll_max_wait(),
            budget,
            concurrency: config.poll_concurrency(),
        }
    }

    /// Overrides the wait bounds. `max` is promoted to `initial` if smaller.
    #[must_use]
    pub fn waits(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_wait = initial;
        self.max_wait = max.max(initial);
        self
    }

    /// Overrides the per-round concurrency (at least 1).
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Polls `process_ids` until each is terminal or the budget runs out.
///
/// The result mirrors the input order, including duplicates; empty ids are
/// skipped. Ids that never reached a terminal state are reported as queued.
///
/// # Errors
///
/// Returns [`ClientError::Cancelled`] or [`ClientError::DeadlineExceeded`]
/// when the caller's scope stops polling. Budget exhaustion is not an error.
#[instrument(skip(source, scope, process_ids), fields(ids = process_ids.len(), budget_ms = policy.budget.as_millis()))]
pub async fn poll(
    source: Arc<dyn ProcessStatusSource>,
    scope: &CallScope,
    process_ids: &[String],
    policy: PollPolicy,
) -> Result<Vec<QueuedProcess>, ClientError> {
    let deadline = Instant::now() + policy.budget;

    let mut seen = HashSet::new();
    let mut pending: Vec<String> = process_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(ToString::to_string)
        .collect();
    let mut statuses: HashMap<String, QueuedProcess> = HashMap::new();
    let semaphore = Arc::new(Semaphore::new(policy.concurrency.max(1)));
    let mut wait = policy.initial_wait;
    let mut round = 0u32;

    while !pending.is_empty() {
        scope.check()?;
        if Instant::now() >= deadline {
            break;
        }
        round += 1;

        let round_scope = scope.child_with_deadline(deadline);
        let results = tokio::select! {
            () = scope.token().cancelled() => return Err(ClientError::Cancelled),
            results = run_round(&source, &round_scope, &pending, &semaphore) => results,
        };
        scope.check()?;

        let mut done = HashSet::new();
        for (id, result) in results {
            match result {
                Ok(process) => {
                    let terminal = process.status.is_terminal();
                    debug!(round, process_id = %id, status = %process.status, "process status");
                    if terminal {
                        done.insert(id.clone());
                    }
                    statuses.insert(id.clone(), QueuedProcess { id, ..process });
                }
                Err(error) if error.is_cancelled() || is_retryable(&error) => {
                    debug!(round, process_id = %id, error = %error, "status check failed; will retry");
                }
                Err(error) => {
                    warn!(process_id = %id, error = %error, "status check failed permanently; marking process failed");
                    done.insert(id.clone());
                    statuses.insert(id.clone(), QueuedProcess::failed(id));
                }
            }
        }
        pending.retain(|id| !done.contains(id));

        if pending.is_empty() {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let nap = wait.min(policy.max_wait).min(remaining);
        debug!(round, pending = pending.len(), wait_ms = nap.as_millis(), "waiting before next poll round");
        scope.sleep(nap).await?;
        wait = wait.saturating_mul(2).min(policy.max_wait);
    }

    if !pending.is_empty() {
        info!(
            rounds = round,
            pending = pending.len(),
            "poll budget exhausted; returning partial results"
        );
    }

    Ok(process_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(|id| {
            statuses
                .get(id)
                .cloned()
                .unwrap_or_else(|| QueuedProcess::queued(id))
        })
        .collect())
}

/// Runs one round of status requests and collects every worker's result.
async fn run_round(
    source: &Arc<dyn ProcessStatusSource>,
    scope: &CallScope,
    pending: &[String],
    semaphore: &Arc<Semaphore>,
) -> Vec<(String, Result<QueuedProcess, ClientError>)> {
    let mut tasks = JoinSet::new();
    for id in pending {
        let id = id.clone();
        let source = Arc::clone(source);
        let scope = scope.clone();
        let semaphore = Arc::clone(semaphore);
        tasks.spawn(async move {
            // Permit is dropped when this block exits (RAII)
            let _permit = semaphore.acquire_owned().await;
            let result = source.fetch_status(&scope, &id).await;
            (id, result)
        });
    }

    let mut results = Vec::with_capacity(pending.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(pair) => results.push(pair),
            Err(error) => warn!(error = %error, "status worker ended abnormally"),
        }
    }
    results
}
