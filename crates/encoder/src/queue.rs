//! Encoding job queue with a fixed worker pool.
//!
//! Jobs are submitted into a bounded channel and tracked in an in-memory
//! table guarded by a single lock. A dispatcher loop hands dequeued job ids
//! to spawned worker tasks, with a semaphore bounding how many encodes run
//! concurrently. The worker that claims a job is its sole writer until the
//! job reaches a terminal state; cancel and retry mutate jobs only under
//! the table lock while the job is not claimed.
//!
//! Status changes are published on a broadcast channel instead of a
//! callback list, so notification delivery can never block or re-enter the
//! table lock's critical section.

use crate::encode::{EncodingOutcome, FfmpegEncoder};
use crate::files::EncodingFileManager;
use crate::job::{now_ms, EncodingJob, EncodingStatus};
use crate::store::ChapterStore;
use audiobook_encoder_config::EnvironmentConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Capacity of the status-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for job submission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded queue has no free slot.
    #[error("Job queue is full")]
    QueueFull,

    /// The queue has been stopped and no longer accepts jobs.
    #[error("Job queue is shut down")]
    ShutDown,
}

/// One status-change notification, published per transition and per
/// progress checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub chapter_id: String,
    pub book_id: String,
    pub status: EncodingStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl JobEvent {
    fn from_job(job: &EncodingJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            chapter_id: job.chapter_id.clone(),
            book_id: job.book_id.clone(),
            status: job.status,
            progress: job.progress,
            error_message: job.error_message.clone(),
            retry_count: job.retry_count,
        }
    }
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub status_counts: HashMap<String, usize>,
    /// Jobs enqueued but not yet claimed by a worker.
    pub queue_depth: usize,
    pub worker_count: u32,
    pub avg_processing_secs: f64,
    pub running: bool,
}

/// Bounded job queue serviced by a fixed worker pool.
#[derive(Clone)]
pub struct EncodingQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    jobs: Mutex<HashMap<String, EncodingJob>>,
    job_tx: mpsc::Sender<String>,
    job_rx: Mutex<Option<mpsc::Receiver<String>>>,
    semaphore: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    encoder: FfmpegEncoder,
    files: EncodingFileManager,
    store: Arc<dyn ChapterStore>,
    max_retries: u32,
    max_workers: u32,
    archive_originals: bool,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl EncodingQueue {
    /// Build a queue from the environment profile and its collaborators.
    pub fn new(
        config: &EnvironmentConfig,
        encoder: FfmpegEncoder,
        files: EncodingFileManager,
        store: Arc<dyn ChapterStore>,
    ) -> Self {
        let capacity = config.max_queue_size.max(1);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(HashMap::new()),
                job_tx,
                job_rx: Mutex::new(Some(job_rx)),
                semaphore: Arc::new(Semaphore::new(config.max_workers.max(1) as usize)),
                events,
                encoder,
                files,
                store,
                max_retries: config.retry.max_retries,
                max_workers: config.max_workers.max(1),
                archive_originals: config.archive_originals,
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Subscribe to job status events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Start the dispatcher loop. Idempotent; the queue cannot be
    /// restarted after [`stop`](Self::stop).
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(mut job_rx) = self.inner.lock_rx().take() else {
            warn!("encoding queue cannot be restarted after stop");
            return;
        };

        let inner = self.inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!(workers = inner.max_workers, "encoding queue started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    job_id = job_rx.recv() => {
                        let Some(job_id) = job_id else { break };
                        let worker = inner.clone();
                        tokio::spawn(async move {
                            let _permit = worker
                                .semaphore
                                .clone()
                                .acquire_owned()
                                .await
                                .expect("worker semaphore is never closed");
                            worker.process_job(&job_id).await;
                        });
                    }
                }
            }
            info!("encoding queue stopped");
        });
    }

    /// Signal the dispatcher to stop. Already-claimed jobs run to
    /// completion; queued jobs stay Pending.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Submit a new encoding job. Never blocks; fails when the queue's
    /// capacity is exhausted or the queue has shut down.
    pub fn submit(
        &self,
        chapter_id: &str,
        book_id: &str,
        input_path: &str,
        output_path: &str,
    ) -> Result<String, SubmitError> {
        let job = EncodingJob::new(
            chapter_id,
            book_id,
            input_path,
            output_path,
            self.inner.max_retries,
        );
        let job_id = job.job_id.clone();

        let event = {
            let mut jobs = self.inner.lock_jobs();
            match self.inner.job_tx.try_send(job_id.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => return Err(SubmitError::QueueFull),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(SubmitError::ShutDown),
            }
            let event = JobEvent::from_job(&job);
            jobs.insert(job_id.clone(), job);
            event
        };

        info!(job_id = %job_id, chapter_id, "encoding job submitted");
        self.inner.send_event(event);
        Ok(job_id)
    }

    /// Cancel a job. Succeeds only while the job is still Pending;
    /// in-flight external-process work is never preempted.
    pub fn cancel(&self, job_id: &str) -> bool {
        let event = {
            let mut jobs = self.inner.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if job.status != EncodingStatus::Pending {
                return false;
            }
            job.status = EncodingStatus::Cancelled;
            job.completed_at_ms = Some(now_ms());
            JobEvent::from_job(job)
        };

        info!(job_id, "encoding job cancelled");
        self.inner.send_event(event);
        true
    }

    /// Re-queue a failed job. Succeeds only if the job is Failed with
    /// retries remaining; the Failed -> Pending swap under the table lock
    /// also de-duplicates racing re-submission paths (a second caller
    /// finds the job already Pending and gets `false`).
    pub fn retry(&self, job_id: &str) -> bool {
        let event = {
            let mut jobs = self.inner.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if !job.can_retry() {
                return false;
            }
            if self.inner.job_tx.try_send(job_id.to_string()).is_err() {
                warn!(job_id, "queue full, retry not enqueued");
                return false;
            }
            job.status = EncodingStatus::Pending;
            job.retry_count += 1;
            job.error_message = None;
            job.progress = 0.0;
            job.started_at_ms = None;
            job.completed_at_ms = None;
            JobEvent::from_job(job)
        };

        info!(job_id, "encoding job re-queued for retry");
        self.inner.send_event(event);
        true
    }

    /// Snapshot of one job.
    pub fn get_job(&self, job_id: &str) -> Option<EncodingJob> {
        self.inner.lock_jobs().get(job_id).cloned()
    }

    /// Snapshot of all jobs in a given status.
    pub fn jobs_by_status(&self, status: EncodingStatus) -> Vec<EncodingJob> {
        self.inner
            .lock_jobs()
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect()
    }

    /// Snapshot of all jobs owned by a chapter.
    pub fn jobs_by_chapter(&self, chapter_id: &str) -> Vec<EncodingJob> {
        self.inner
            .lock_jobs()
            .values()
            .filter(|job| job.chapter_id == chapter_id)
            .cloned()
            .collect()
    }

    /// Snapshot of all jobs belonging to a book.
    pub fn jobs_by_book(&self, book_id: &str) -> Vec<EncodingJob> {
        self.inner
            .lock_jobs()
            .values()
            .filter(|job| job.book_id == book_id)
            .cloned()
            .collect()
    }

    /// Aggregate queue statistics.
    pub fn stats(&self) -> QueueStats {
        let jobs = self.inner.lock_jobs();

        let mut status_counts: HashMap<String, usize> = EncodingStatus::all()
            .iter()
            .map(|status| (status.to_string(), 0))
            .collect();
        for job in jobs.values() {
            *status_counts.entry(job.status.to_string()).or_insert(0) += 1;
        }

        let processing_times: Vec<f64> = jobs
            .values()
            .filter(|job| job.status == EncodingStatus::Completed)
            .filter_map(|job| job.processing_secs())
            .collect();
        let avg_processing_secs = if processing_times.is_empty() {
            0.0
        } else {
            processing_times.iter().sum::<f64>() / processing_times.len() as f64
        };

        QueueStats {
            total_jobs: jobs.len(),
            status_counts,
            queue_depth: self.inner.job_tx.max_capacity() - self.inner.job_tx.capacity(),
            worker_count: self.inner.max_workers,
            avg_processing_secs,
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }

    /// Purge terminal jobs older than the age threshold from the table.
    /// Job history is in-memory only and does not survive a restart.
    pub fn cleanup_old_jobs(&self, max_age_hours: u64) -> usize {
        let cutoff = now_ms() - (max_age_hours as i64) * 3600 * 1000;
        let mut jobs = self.inner.lock_jobs();

        let stale: Vec<String> = jobs
            .values()
            .filter(|job| job.is_terminal() && job.created_at_ms < cutoff)
            .map(|job| job.job_id.clone())
            .collect();

        for job_id in &stale {
            jobs.remove(job_id);
        }

        if !stale.is_empty() {
            info!(removed = stale.len(), "cleaned up old encoding jobs");
        }
        stale.len()
    }
}

impl QueueInner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, EncodingJob>> {
        self.jobs.lock().expect("job table lock poisoned")
    }

    fn lock_rx(&self) -> MutexGuard<'_, Option<mpsc::Receiver<String>>> {
        self.job_rx.lock().expect("job receiver lock poisoned")
    }

    fn send_event(&self, event: JobEvent) {
        debug!(job_id = %event.job_id, status = %event.status, progress = event.progress, "job status event");
        let _ = self.events.send(event);
    }

    /// Advance a job's progress checkpoint and publish one event for it.
    fn checkpoint(&self, job_id: &str, progress: f64) {
        let event = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.set_progress(progress);
            JobEvent::from_job(job)
        };
        self.send_event(event);
    }

    /// Run one dequeued job through the pipeline. The claiming worker is
    /// the sole writer of the job until it reaches a terminal state; no
    /// failure escapes into the dispatcher loop.
    async fn process_job(&self, job_id: &str) {
        let job = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.status != EncodingStatus::Pending {
                debug!(job_id, status = %job.status, "skipping dequeued job");
                return;
            }
            job.status = EncodingStatus::Processing;
            job.started_at_ms = Some(now_ms());
            job.set_progress(0.1);
            job.clone()
        };
        self.send_event(JobEvent::from_job(&job));

        info!(
            job_id,
            chapter_id = %job.chapter_id,
            input = %job.input_path,
            output = %job.output_path,
            attempt = job.retry_count + 1,
            "encoding job started"
        );
        if let Err(e) = self.store.mark_processing_started(&job.chapter_id) {
            warn!(chapter_id = %job.chapter_id, error = %e, "chapter store update failed");
        }

        match self.run_pipeline(&job).await {
            Ok(outcome) => self.finish_success(&job, outcome),
            Err(reason) => self.finish_failure(&job, &reason),
        }
    }

    /// The strictly sequential checkpoint pipeline: prepare, validate
    /// input, transcode, validate output. The first failing step
    /// short-circuits the rest.
    async fn run_pipeline(&self, job: &EncodingJob) -> Result<EncodingOutcome, String> {
        self.files
            .ensure_directories(&job.book_id)
            .map_err(|e| format!("Failed to create directories: {}", e))?;

        let input = Path::new(&job.input_path);
        let output = Path::new(&job.output_path);

        if !input.exists() {
            return Err(format!("Input file not found: {}", job.input_path));
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create output directory: {}", e))?;
        }
        self.checkpoint(&job.job_id, 0.3);

        self.files
            .validate_integrity(input)
            .map_err(|e| format!("Input file integrity check failed: {}", e))?;
        self.checkpoint(&job.job_id, 0.5);

        let outcome = self
            .encoder
            .encode(input, output)
            .await
            .map_err(|e| e.to_string())?;
        self.checkpoint(&job.job_id, 0.8);

        self.files
            .validate_integrity(output)
            .map_err(|e| format!("Encoded file validation failed: {}", e))?;

        Ok(outcome)
    }

    fn finish_success(&self, job: &EncodingJob, outcome: EncodingOutcome) {
        let metadata = outcome.metadata.to_map();

        let event = {
            let mut jobs = self.lock_jobs();
            let Some(record) = jobs.get_mut(&job.job_id) else {
                return;
            };
            record.complete(metadata.clone());
            JobEvent::from_job(record)
        };
        self.send_event(event);

        if outcome.original_size > 0 && outcome.encoded_size > 0 {
            let ratio = outcome.original_size as f64 / outcome.encoded_size as f64;
            info!(
                job_id = %job.job_id,
                chapter_id = %job.chapter_id,
                original_bytes = outcome.original_size,
                encoded_bytes = outcome.encoded_size,
                compression = %format!("{:.2}x", ratio),
                elapsed_secs = outcome.elapsed.as_secs_f64(),
                "encoding job completed"
            );
        } else {
            info!(job_id = %job.job_id, chapter_id = %job.chapter_id, "encoding job completed");
        }

        if let Err(e) = self.store.mark_processing_completed(&job.chapter_id, &metadata) {
            warn!(chapter_id = %job.chapter_id, error = %e, "chapter store update failed");
        }

        self.files.cleanup_temp(&job.book_id, &job.chapter_id);

        if self.archive_originals {
            if let Some(filename) = Path::new(&job.input_path)
                .file_name()
                .and_then(|name| name.to_str())
            {
                if self
                    .files
                    .archive_original(&job.book_id, &job.chapter_id, filename)
                {
                    debug!(job_id = %job.job_id, filename, "original archived");
                }
            }
        }
    }

    fn finish_failure(&self, job: &EncodingJob, reason: &str) {
        let event = {
            let mut jobs = self.lock_jobs();
            let Some(record) = jobs.get_mut(&job.job_id) else {
                return;
            };
            record.fail(reason);
            JobEvent::from_job(record)
        };
        self.send_event(event);

        error!(job_id = %job.job_id, chapter_id = %job.chapter_id, error = reason, "encoding job failed");

        if let Err(e) = self.store.mark_processing_error(&job.chapter_id, reason) {
            warn!(chapter_id = %job.chapter_id, error = %e, "chapter store update failed");
        }

        // Best-effort removal of a partially-written output
        let output = Path::new(&job.output_path);
        if output.exists() {
            let _ = fs::remove_file(output);
        }
    }
}
