//! Optimistic diff submission with bounded retry.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use backon::Retryable;
use tokio::time::Instant;

use super::plan::plan_batch;
use crate::config::{DiffConfig, ElementLimits};
use crate::error::{ErrorCode, WaymarkError, WaymarkResult};
use crate::traits::ElementStore;
use crate::types::{DiffBatch, DiffResult, DiffResultEntry, DiffState};

/// Validates and commits diff batches against an [`ElementStore`].
///
/// Each attempt reads a fresh snapshot, plans the batch against it and hands
/// the plan to the store, which rejects it if the snapshot went stale. Stale
/// snapshots and busy storage are retried with exponential backoff until the
/// retry window closes.
#[derive(Clone)]
pub struct DiffEngine {
    store: Arc<dyn ElementStore>,
    config: DiffConfig,
    limits: ElementLimits,
}

/// Bookkeeping for one submission across its attempts.
struct Submission {
    changeset_id: i64,
    /// Every state entered so far. Never empty.
    states: Mutex<Vec<DiffState>>,
    attempts: AtomicU32,
    last_unavailable: AtomicBool,
}

impl Submission {
    fn new(changeset_id: i64) -> Self {
        Self {
            changeset_id,
            states: Mutex::new(vec![DiffState::Pending]),
            attempts: AtomicU32::new(0),
            last_unavailable: AtomicBool::new(false),
        }
    }

    fn transition(&self, next: DiffState) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let current = states.last().copied().unwrap_or(DiffState::Pending);
        if current.is_terminal() {
            tracing::warn!(
                changeset_id = self.changeset_id,
                from = %current,
                to = %next,
                "Diff already finished, ignoring transition"
            );
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(
                changeset_id = self.changeset_id,
                from = %current,
                to = %next,
                "Unexpected diff state transition"
            );
        }
        tracing::trace!(
            changeset_id = self.changeset_id,
            from = %current,
            to = %next,
            "Diff state"
        );
        states.push(next);
    }

    fn states(&self) -> Vec<DiffState> {
        self.states.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl DiffEngine {
    pub fn new(store: Arc<dyn ElementStore>, config: DiffConfig, limits: ElementLimits) -> Self {
        Self {
            store,
            config,
            limits,
        }
    }

    /// Submit a batch. All operations commit together or none do.
    ///
    /// Version mismatches and validation failures are returned immediately.
    /// If the retry window closes while attempts keep going stale the result
    /// is a retry-exhausted `Conflict`, or `Unavailable` if storage was busy.
    pub async fn submit(&self, batch: &DiffBatch) -> WaymarkResult<DiffResult> {
        let submission = Submission::new(batch.changeset_id);
        let deadline = Instant::now() + self.config.retry_timeout();

        let attempt = || self.attempt(batch, &submission, deadline);
        let outcome = attempt
            .retry(self.config.backoff())
            .when(|e| e.is_retryable() && Instant::now() < deadline)
            .notify(|err, dur| {
                tracing::warn!(
                    changeset_id = batch.changeset_id,
                    attempt = submission.attempts(),
                    "Diff attempt failed, retrying in {:?}: {}",
                    dur,
                    err
                );
            })
            .await;

        match outcome {
            Ok(entries) => {
                submission.transition(DiffState::Committed);
                tracing::info!(
                    changeset_id = batch.changeset_id,
                    operations = entries.len(),
                    attempts = submission.attempts(),
                    "Diff committed"
                );
                Ok(DiffResult {
                    entries,
                    attempts: submission.attempts(),
                    states: submission.states(),
                })
            }
            Err(err) if err.is_retryable() || err.code() == ErrorCode::DiffRetryExhausted => {
                submission.transition(DiffState::Rejected);
                tracing::warn!(
                    changeset_id = batch.changeset_id,
                    attempts = submission.attempts(),
                    "Diff retry window exhausted: {}",
                    err
                );
                let attempts = submission.attempts();
                Err(match err {
                    WaymarkError::Unavailable { .. } => err,
                    _ if submission.last_unavailable.load(Ordering::SeqCst) => {
                        WaymarkError::unavailable(format!(
                            "Storage stayed busy across {} diff attempts",
                            attempts
                        ))
                    }
                    _ if err.code() == ErrorCode::DiffRetryExhausted => err,
                    _ => WaymarkError::retry_exhausted(format!(
                        "Diff could not be applied after {} attempts: {}",
                        attempts, err
                    )),
                })
            }
            Err(err) => {
                submission.transition(DiffState::Rejected);
                tracing::debug!(changeset_id = batch.changeset_id, "Diff rejected: {}", err);
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        batch: &DiffBatch,
        submission: &Submission,
        deadline: Instant,
    ) -> WaymarkResult<Vec<DiffResultEntry>> {
        let n = submission.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        submission.transition(DiffState::Validating);

        let result = self.validate_and_commit(batch, deadline).await;

        match &result {
            Ok(_) => {}
            Err(err) if err.is_retryable() => {
                let unavailable = matches!(err, WaymarkError::Unavailable { .. });
                submission
                    .last_unavailable
                    .store(unavailable, Ordering::SeqCst);
                submission.transition(DiffState::Conflicted);
                tracing::debug!(
                    changeset_id = batch.changeset_id,
                    attempt = n,
                    "Diff conflicted: {}",
                    err
                );
            }
            Err(_) => {}
        }
        result
    }

    async fn validate_and_commit(
        &self,
        batch: &DiffBatch,
        deadline: Instant,
    ) -> WaymarkResult<Vec<DiffResultEntry>> {
        // Only validation is bounded by the deadline. A plan handed to the
        // store commits or fails on its own.
        let planned = tokio::time::timeout_at(deadline, async {
            let snapshot = self.store.current_sequence_id().await?;
            plan_batch(self.store.as_ref(), &self.limits, batch, snapshot).await
        })
        .await;
        let plan = match planned {
            Ok(plan) => plan?,
            Err(_) => {
                return Err(WaymarkError::retry_exhausted(
                    "Diff retry window closed during validation",
                ))
            }
        };

        if plan.writes.is_empty() {
            return Ok(Vec::new());
        }
        let receipt = self.store.commit(plan).await?;
        Ok(receipt.entries)
    }
}
