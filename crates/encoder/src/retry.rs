//! Failure classification and automatic retry scheduling.
//!
//! Failed jobs are classified by matching their error text against an
//! ordered rule table. Permanent failures are checked first and
//! short-circuit as non-retryable, so an error string carrying both a
//! permanent cue and an incidental temporary-sounding word is still
//! rejected from retry. Unmatched errors are treated as temporary.
//!
//! Two independent paths re-queue eligible failures: a reactive listener
//! on the queue's status events, and a periodic sweep over Failed jobs
//! that catches anything the reactive path missed. Both funnel into
//! [`EncodingQueue::retry`], whose Failed -> Pending swap under the job
//! table lock de-duplicates overlapping re-submissions.

use crate::job::{now_ms, EncodingJob, EncodingStatus};
use crate::queue::EncodingQueue;
use audiobook_encoder_config::RetryPolicy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Period of the background sweep over failed jobs.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Failure history entries older than this are pruned on write.
const FAILURE_HISTORY_RETENTION_HOURS: i64 = 24;

/// Trailing window for the per-chapter circuit breaker.
const RECENT_FAILURE_WINDOW_SECS: i64 = 3600;

/// Classification of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Transient fault, retried with standard backoff.
    Temporary,
    /// Bad input, never retried.
    Permanent,
    /// Resource exhaustion, retried with an extended delay.
    Recoverable,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureType::Temporary => write!(f, "temporary"),
            FailureType::Permanent => write!(f, "permanent"),
            FailureType::Recoverable => write!(f, "recoverable"),
        }
    }
}

struct ClassificationRule {
    failure_type: FailureType,
    patterns: &'static [&'static str],
    delay_multiplier: f64,
    recovery_hint: &'static str,
}

/// Ordered classification table. Permanent rules must stay first.
const CLASSIFICATION_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        failure_type: FailureType::Permanent,
        patterns: &[
            "not found",
            "permission denied",
            "invalid format",
            "corrupted",
            "unsupported",
            "codec not found",
        ],
        delay_multiplier: 0.0,
        recovery_hint: "Check input file and format",
    },
    ClassificationRule {
        failure_type: FailureType::Recoverable,
        patterns: &["disk space", "memory", "resource", "quota"],
        delay_multiplier: 2.0,
        recovery_hint: "Check system resources and try again",
    },
    ClassificationRule {
        failure_type: FailureType::Temporary,
        patterns: &["timeout", "network", "connection", "temporary", "busy", "locked"],
        delay_multiplier: 1.0,
        recovery_hint: "Automatic retry will be attempted",
    },
];

/// Outcome of classifying one failure. Recomputed on each failure, never
/// persisted.
#[derive(Debug, Clone, Serialize)]
pub struct FailureAnalysis {
    pub failure_type: FailureType,
    pub retryable: bool,
    pub suggested_delay_secs: f64,
    pub recovery_hint: Option<String>,
}

/// Summary returned by [`RetryManager::handle_failure`].
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub job_id: String,
    pub chapter_id: String,
    pub failure_type: FailureType,
    pub retryable: bool,
    pub retry_scheduled: bool,
    pub suggested_delay_secs: f64,
    pub recovery_hint: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Aggregate failure-history statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FailureStats {
    pub chapters_with_failures: usize,
    pub total_failures: usize,
    pub recent_failures_1h: usize,
    pub failure_threshold: usize,
    pub max_retries: u32,
}

/// Exponential backoff: `min(base * multiplier^n, max)`.
pub fn calculate_delay(policy: &RetryPolicy, retry_count: u32) -> f64 {
    let delay = policy.base_delay_secs * policy.backoff_multiplier.powi(retry_count as i32);
    delay.min(policy.max_delay_secs).max(0.0)
}

/// Classify an error text against the ordered rule table.
pub fn analyze_failure(error_text: &str, retry_count: u32, policy: &RetryPolicy) -> FailureAnalysis {
    let error = error_text.to_lowercase();

    for rule in CLASSIFICATION_RULES {
        if rule.patterns.iter().any(|pattern| error.contains(pattern)) {
            let retryable = rule.failure_type != FailureType::Permanent;
            return FailureAnalysis {
                failure_type: rule.failure_type,
                retryable,
                suggested_delay_secs: if retryable {
                    calculate_delay(policy, retry_count) * rule.delay_multiplier
                } else {
                    0.0
                },
                recovery_hint: Some(rule.recovery_hint.to_string()),
            };
        }
    }

    // Unknown errors are treated as temporary while retries remain
    FailureAnalysis {
        failure_type: FailureType::Temporary,
        retryable: retry_count < policy.max_retries,
        suggested_delay_secs: calculate_delay(policy, retry_count),
        recovery_hint: None,
    }
}

/// Classifies failures, tracks per-chapter failure history, and re-queues
/// eligible failed jobs after their computed delay.
#[derive(Clone)]
pub struct RetryManager {
    inner: Arc<RetryInner>,
}

struct RetryInner {
    queue: EncodingQueue,
    policy: RetryPolicy,
    failure_history: Mutex<HashMap<String, Vec<i64>>>,
    sweep_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl RetryManager {
    pub fn new(queue: EncodingQueue, policy: RetryPolicy) -> Self {
        Self::with_sweep_interval(queue, policy, DEFAULT_SWEEP_INTERVAL)
    }

    /// Variant with a custom sweep period, for tests and tuning.
    pub fn with_sweep_interval(
        queue: EncodingQueue,
        policy: RetryPolicy,
        sweep_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RetryInner {
                queue,
                policy,
                failure_history: Mutex::new(HashMap::new()),
                sweep_interval,
                shutdown_tx,
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Classify a job's recorded failure.
    pub fn analyze_job(&self, job: &EncodingJob) -> FailureAnalysis {
        analyze_failure(
            job.error_message.as_deref().unwrap_or(""),
            job.retry_count,
            &self.inner.policy,
        )
    }

    /// Decide whether a failed job should be retried without operator
    /// involvement: retry ceiling, failure classification, then the
    /// per-chapter circuit breaker.
    pub fn should_retry_automatically(&self, job: &EncodingJob) -> bool {
        if job.retry_count >= self.inner.policy.max_retries {
            return false;
        }

        if !self.analyze_job(job).retryable {
            return false;
        }

        let recent = self.recent_failures(&job.chapter_id);
        if recent >= self.inner.policy.failure_threshold {
            warn!(
                chapter_id = %job.chapter_id,
                recent_failures = recent,
                "circuit breaker open, automatic retry suppressed"
            );
            return false;
        }

        true
    }

    /// Append the failure to the chapter's history, pruning entries older
    /// than the retention window.
    pub fn record_failure(&self, job: &EncodingJob) {
        let cutoff = now_ms() - FAILURE_HISTORY_RETENTION_HOURS * 3600 * 1000;
        let mut history = self.inner.lock_history();
        let entries = history.entry(job.chapter_id.clone()).or_default();
        entries.push(now_ms());
        entries.retain(|&at| at > cutoff);
    }

    /// Fire-and-forget re-queue of an eligible failed job after its
    /// suggested delay. Eligibility is re-checked when the delay elapses;
    /// a job already re-queued by another path is left alone.
    pub fn schedule_retry(&self, job: &EncodingJob) -> bool {
        if !self.should_retry_automatically(job) {
            return false;
        }

        let analysis = self.analyze_job(job);
        let delay = Duration::from_secs_f64(analysis.suggested_delay_secs.max(0.0));
        let manager = self.clone();
        let job_id = job.job_id.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(current) = manager.inner.queue.get_job(&job_id) else {
                return;
            };
            if current.status != EncodingStatus::Failed {
                return;
            }
            if !manager.should_retry_automatically(&current) {
                return;
            }
            if manager.inner.queue.retry(&job_id) {
                info!(
                    job_id = %job_id,
                    attempt = current.retry_count + 1,
                    delay_secs = delay.as_secs_f64(),
                    "automatic retry re-queued"
                );
            }
        });

        true
    }

    /// Record and classify a failure, scheduling an automatic retry when
    /// the analysis allows one.
    pub fn handle_failure(&self, job: &EncodingJob) -> FailureReport {
        self.record_failure(job);

        let analysis = self.analyze_job(job);
        let retry_scheduled = analysis.retryable && self.schedule_retry(job);

        warn!(
            job_id = %job.job_id,
            chapter_id = %job.chapter_id,
            failure_type = %analysis.failure_type,
            retryable = analysis.retryable,
            retry_scheduled,
            error = job.error_message.as_deref().unwrap_or(""),
            "encoding failure handled"
        );

        FailureReport {
            job_id: job.job_id.clone(),
            chapter_id: job.chapter_id.clone(),
            failure_type: analysis.failure_type,
            retryable: analysis.retryable,
            retry_scheduled,
            suggested_delay_secs: analysis.suggested_delay_secs,
            recovery_hint: analysis.recovery_hint,
            retry_count: job.retry_count,
            max_retries: self.inner.policy.max_retries,
        }
    }

    /// Operator escape hatch: reset the circuit breaker for one chapter or
    /// globally. Returns the number of history entries dropped.
    pub fn clear_failure_history(&self, chapter_id: Option<&str>) -> usize {
        let mut history = self.inner.lock_history();
        match chapter_id {
            Some(chapter_id) => history.remove(chapter_id).map(|v| v.len()).unwrap_or(0),
            None => {
                let total = history.values().map(Vec::len).sum();
                history.clear();
                total
            }
        }
    }

    pub fn failure_stats(&self) -> FailureStats {
        let history = self.inner.lock_history();
        let recent_cutoff = now_ms() - RECENT_FAILURE_WINDOW_SECS * 1000;

        FailureStats {
            chapters_with_failures: history.len(),
            total_failures: history.values().map(Vec::len).sum(),
            recent_failures_1h: history
                .values()
                .flatten()
                .filter(|&&at| at > recent_cutoff)
                .count(),
            failure_threshold: self.inner.policy.failure_threshold,
            max_retries: self.inner.policy.max_retries,
        }
    }

    /// Start the reactive failure listener and the background sweep loop.
    pub fn start(&self) {
        self.spawn_event_listener();
        self.spawn_sweep_loop();
        info!("retry manager started");
    }

    /// Signal both background tasks to stop.
    pub fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    fn spawn_event_listener(&self) {
        let manager = self.clone();
        let mut events = manager.inner.queue.subscribe();
        let mut shutdown_rx = manager.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) if event.status == EncodingStatus::Failed => {
                                if let Some(job) = manager.inner.queue.get_job(&event.job_id) {
                                    if job.status == EncodingStatus::Failed {
                                        manager.handle_failure(&job);
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                // The sweep loop repairs whatever was missed
                                warn!(skipped, "retry listener lagged behind status events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    fn spawn_sweep_loop(&self) {
        let manager = self.clone();
        let mut shutdown_rx = manager.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.inner.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        manager.sweep_failed_jobs();
                    }
                }
            }
        });
    }

    /// Retry failed jobs whose computed delay has already elapsed. This
    /// covers failures recorded while the reactive path was unavailable.
    fn sweep_failed_jobs(&self) {
        for job in self.inner.queue.jobs_by_status(EncodingStatus::Failed) {
            if !self.should_retry_automatically(&job) {
                continue;
            }
            let Some(completed_at) = job.completed_at_ms else {
                continue;
            };

            let analysis = self.analyze_job(&job);
            let elapsed_secs = (now_ms() - completed_at) as f64 / 1000.0;
            if elapsed_secs >= analysis.suggested_delay_secs
                && self.inner.queue.retry(&job.job_id)
            {
                info!(job_id = %job.job_id, "failed job re-queued by retry sweep");
            }
        }
    }

    fn recent_failures(&self, chapter_id: &str) -> usize {
        let cutoff = now_ms() - RECENT_FAILURE_WINDOW_SECS * 1000;
        self.inner
            .lock_history()
            .get(chapter_id)
            .map(|entries| entries.iter().filter(|&&at| at > cutoff).count())
            .unwrap_or(0)
    }
}

impl RetryInner {
    fn lock_history(&self) -> MutexGuard<'_, HashMap<String, Vec<i64>>> {
        self.failure_history
            .lock()
            .expect("failure history lock poisoned")
    }
}
