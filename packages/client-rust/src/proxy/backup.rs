//! Backup-request race.
//!
//! The primary attempt is sent at once. If it is still pending after the
//! configured delay, or fails before that, the same request goes to the
//! backup endpoint. The first successful attempt to claim the shared winner
//! flag provides the response; the other attempt is left to finish on its
//! own (bounded by its dispatch timeout) and its response is discarded.
//! A loser that fails is still counted, and the dispatch stack reports it
//! to the selector like any other attempt.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use tailrpc_core::{BackupRequest, Endpoint, ErrorKind, Status};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::Instrument;

use crate::dispatch::{DispatchRequest, DispatchResponse, Dispatcher};
use crate::stats::ProxyStats;

const UNCLAIMED: i8 = -1;
const PRIMARY: i8 = 0;
const BACKUP: i8 = 1;

/// Result of one race.
#[derive(Debug)]
pub struct RaceOutcome {
    /// The winner's response, or the later failure when both failed.
    pub result: Result<Bytes, Status>,
    /// `0` primary, `1` backup, `None` when nobody succeeded.
    pub winner: Option<i8>,
    pub backup_fired: bool,
    /// Endpoint that produced `result`.
    pub endpoint: Endpoint,
}

impl RaceOutcome {
    #[must_use]
    pub fn success_node_index(&self) -> i8 {
        self.winner.unwrap_or(UNCLAIMED)
    }
}

/// What one attempt produced.
struct Attempt {
    index: i8,
    endpoint: Endpoint,
    result: Result<Bytes, Status>,
    won: bool,
}

impl Attempt {
    /// An attempt whose task ended without reporting back.
    fn lost(err: &JoinError, endpoint: Endpoint) -> Self {
        Self {
            index: UNCLAIMED,
            endpoint,
            result: Err(Status::from_kind(
                ErrorKind::Unknown,
                format!("backup race attempt did not complete: {err}"),
            )),
            won: false,
        }
    }
}

fn spawn_attempt(
    attempts: &mut JoinSet<Attempt>,
    dispatcher: Dispatcher,
    request: DispatchRequest,
    index: i8,
    claim: &Arc<AtomicI8>,
) {
    let claim = Arc::clone(claim);
    let endpoint = request.msg.endpoint.clone();
    attempts.spawn(
        async move {
            let result = match AssertUnwindSafe(dispatcher.oneshot(request))
                .catch_unwind()
                .await
            {
                Ok(result) => result.map(DispatchResponse::into_bytes),
                Err(_) => Err(Status::from_kind(
                    ErrorKind::Unknown,
                    format!("dispatch to {endpoint} panicked"),
                )),
            };
            let won = result.is_ok()
                && claim
                    .compare_exchange(UNCLAIMED, index, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            Attempt {
                index,
                endpoint,
                result,
                won,
            }
        }
        .instrument(tracing::Span::current()),
    );
}

/// State of one race in progress.
struct Race<'a> {
    attempts: JoinSet<Attempt>,
    claim: Arc<AtomicI8>,
    /// The backup copy until it is sent.
    pending: Option<(Dispatcher, DispatchRequest)>,
    budget: Duration,
    started: Instant,
    state: &'a mut BackupRequest,
    stats: Arc<ProxyStats>,
}

impl Race<'_> {
    /// Sends the backup copy, if still pending, with whatever is left of the
    /// call budget. The resend is recorded on the call's backup state at
    /// once, so it survives the race being cancelled.
    fn fire_backup(&mut self) {
        let Some((dispatcher, mut request)) = self.pending.take() else {
            return;
        };
        request.msg.timeout = self.budget.saturating_sub(self.started.elapsed());
        tracing::debug!(endpoint = %request.msg.endpoint, "backup request fired");
        self.stats.record_backup_fired();
        self.state.increment_resend_count();
        spawn_attempt(&mut self.attempts, dispatcher, request, BACKUP, &self.claim);
    }

    fn backup_fired(&self) -> bool {
        self.pending.is_none()
    }
}

/// Races `request` (addressed to the primary) against a copy sent to
/// `backup` after `delay`.
///
/// `state` is the call's backup-request state: its resend count grows when
/// the backup is sent and its success index is set when the race ends.
/// Dropping the returned future aborts every attempt still running.
pub async fn race(
    dispatcher: Dispatcher,
    request: DispatchRequest,
    backup: Endpoint,
    delay: Duration,
    state: &mut BackupRequest,
    stats: Arc<ProxyStats>,
) -> RaceOutcome {
    let mut backup_copy = request.clone();
    backup_copy.msg.endpoint = backup;
    let primary_endpoint = request.msg.endpoint.clone();

    let mut race = Race {
        attempts: JoinSet::new(),
        claim: Arc::new(AtomicI8::new(UNCLAIMED)),
        pending: Some((dispatcher.clone(), backup_copy)),
        budget: request.msg.timeout,
        started: Instant::now(),
        state,
        stats,
    };
    spawn_attempt(&mut race.attempts, dispatcher, request, PRIMARY, &race.claim);

    let timer = tokio::time::sleep(delay);
    tokio::pin!(timer);
    let mut winner: Option<Attempt> = None;
    let mut last_failure: Option<(Endpoint, Status)> = None;

    while winner.is_none() {
        tokio::select! {
            () = &mut timer, if !race.backup_fired() => race.fire_backup(),
            joined = race.attempts.join_next() => {
                let Some(joined) = joined else { break };
                let attempt = joined.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "backup race attempt did not complete");
                    Attempt::lost(&e, primary_endpoint.clone())
                });
                if attempt.won {
                    winner = Some(attempt);
                    continue;
                }
                match attempt.result {
                    Ok(_) => {
                        tracing::debug!(index = attempt.index, "backup race response discarded");
                        race.stats.record_backup_discarded();
                    }
                    Err(status) => {
                        tracing::debug!(
                            index = attempt.index,
                            code = status.framework_code(),
                            "backup race attempt failed"
                        );
                        race.stats.record_attempt_failed();
                        last_failure = Some((attempt.endpoint, status));
                        race.fire_backup();
                    }
                }
            }
        }
    }

    let backup_fired = race.backup_fired();
    let Race {
        attempts,
        state,
        stats,
        ..
    } = race;
    if !attempts.is_empty() {
        tokio::spawn(drain_losers(attempts, stats));
    }

    let outcome = match winner {
        Some(attempt) => {
            tracing::debug!(index = attempt.index, backup_fired, "backup race won");
            RaceOutcome {
                result: attempt.result,
                winner: Some(attempt.index),
                backup_fired,
                endpoint: attempt.endpoint,
            }
        }
        None => {
            let (endpoint, status) = last_failure.unwrap_or_else(|| {
                (
                    primary_endpoint,
                    Status::from_kind(ErrorKind::Unknown, "backup race ended without a result"),
                )
            });
            RaceOutcome {
                result: Err(status),
                winner: None,
                backup_fired,
                endpoint,
            }
        }
    };
    state.set_success_node_index(outcome.success_node_index());
    outcome
}

/// Lets the losing attempt finish, counting its response as discarded or
/// its failure as a failed attempt.
async fn drain_losers(mut attempts: JoinSet<Attempt>, stats: Arc<ProxyStats>) {
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(Attempt {
                index, result: Ok(_), ..
            }) => {
                tracing::debug!(index, "late backup race response discarded");
                stats.record_backup_discarded();
            }
            Ok(Attempt {
                index,
                result: Err(status),
                ..
            }) => {
                tracing::debug!(index, code = status.framework_code(), "late backup race attempt failed");
                stats.record_attempt_failed();
            }
            Err(e) => {
                tracing::warn!(error = %e, "backup race attempt did not complete");
                stats.record_attempt_failed();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
