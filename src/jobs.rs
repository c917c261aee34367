use crate::{
    config::env_parse,
    metrics,
    pipeline::{ItemReport, OutcomeCounts, Pipeline, PipelineError},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchState {
    pub status: JobStatus,
    pub total_items: usize,
    pub chunk_size: usize,
    pub current_chunk: Option<usize>,
    pub next_chunk: usize,
    pub total_chunks: usize,
    pub processed_count: usize,
    pub remaining: usize,
    pub counts: OutcomeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Pool offset each chunk index reads from; index `n + 1` is only known once `n`
    /// has run, because untouched items stay in the pool ahead of the cursor.
    #[serde(skip)]
    chunk_offsets: Vec<usize>,
}

impl BatchState {
    fn idle(chunk_size: usize) -> Self {
        Self {
            status: JobStatus::Idle,
            total_items: 0,
            chunk_size,
            current_chunk: None,
            next_chunk: 0,
            total_chunks: 0,
            processed_count: 0,
            remaining: 0,
            counts: OutcomeCounts::default(),
            failure: None,
            updated_at: Utc::now(),
            chunk_offsets: vec![0],
        }
    }

    fn fail(&mut self, err: &PipelineError) {
        self.status = JobStatus::Failed;
        self.failure = Some(err.to_string());
        self.updated_at = Utc::now();
    }

    fn percent(&self) -> f32 {
        if self.total_items == 0 {
            return 100.0;
        }
        let done = self.total_items.saturating_sub(self.remaining) as f32;
        ((done / self.total_items as f32) * 1000.0).round() / 10.0
    }
}

pub fn chunks_for(items: usize, chunk_size: usize) -> usize {
    items.div_ceil(chunk_size.max(1))
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    pub job_id: String,
    pub status: JobStatus,
    pub current_chunk: usize,
    pub next_chunk: Option<usize>,
    pub total_chunks: usize,
    pub processed: usize,
    pub processed_total: usize,
    pub remaining: usize,
    pub percent: f32,
    pub counts: OutcomeCounts,
    pub results: Vec<ItemReport>,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: BatchState,
}

/// One categorization sweep. Chunks are requested by the caller; the handle only
/// remembers where the sweep is and whether it was asked to stop.
pub struct BatchJob {
    id: Uuid,
    created_at: DateTime<Utc>,
    pipeline: Pipeline,
    state: Mutex<BatchState>,
    cancel_requested: AtomicBool,
    chunk_gate: Mutex<()>,
}

impl std::fmt::Debug for BatchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJob")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl BatchJob {
    pub fn new(pipeline: Pipeline) -> Self {
        let chunk_size = pipeline.config.chunk_size;
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            pipeline,
            state: Mutex::new(BatchState::idle(chunk_size)),
            cancel_requested: AtomicBool::new(false),
            chunk_gate: Mutex::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn snapshot(&self) -> JobInfo {
        JobInfo {
            id: self.id.to_string(),
            created_at: self.created_at,
            state: self.state.lock().await.clone(),
        }
    }

    pub async fn status(&self) -> JobStatus {
        self.state.lock().await.status
    }

    /// Resets counters, sizes the sweep and runs chunk 0.
    pub async fn start(&self) -> Result<ChunkResult, PipelineError> {
        let _gate = self.chunk_gate.lock().await;
        if self.state.lock().await.status == JobStatus::Running {
            return Err(PipelineError::conflict("start", "job is already running"));
        }

        if let Err(err) = self.preflight().await {
            if err.is_fatal() {
                self.state.lock().await.fail(&err);
                warn!(target = "catmatch.jobs", job_id = %self.id, error = %err, "job_failed");
            }
            return Err(err);
        }
        let total = self.pipeline.count_uncategorized().await?;

        {
            let mut state = self.state.lock().await;
            *state = BatchState::idle(self.pipeline.config.chunk_size);
            // Cleared under the lock: any cancel that sees `Running` must stick.
            self.cancel_requested.store(false, Ordering::SeqCst);
            state.status = JobStatus::Running;
            state.total_items = total;
            state.remaining = total;
            state.total_chunks = chunks_for(total, state.chunk_size);
        }
        info!(
            target = "catmatch.jobs",
            job_id = %self.id,
            total_items = total,
            chunk_size = self.pipeline.config.chunk_size,
            "job_started"
        );
        self.process_locked(0).await
    }

    /// Runs `chunk_index`; indices up to the next unprocessed one are accepted, so a
    /// failed or interrupted chunk can be requested again.
    pub async fn request_chunk(&self, chunk_index: usize) -> Result<ChunkResult, PipelineError> {
        let _gate = self.chunk_gate.lock().await;
        self.process_locked(chunk_index).await
    }

    pub async fn next_chunk(&self) -> Result<ChunkResult, PipelineError> {
        let _gate = self.chunk_gate.lock().await;
        let index = self.state.lock().await.next_chunk;
        self.process_locked(index).await
    }

    /// Cooperative: a chunk already in flight finishes and keeps its writes.
    pub async fn cancel(&self) -> Result<JobStatus, PipelineError> {
        let mut state = self.state.lock().await;
        if state.status != JobStatus::Running {
            return Err(PipelineError::conflict(
                "cancel",
                format!("job is {}", state.status.as_str()),
            ));
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        if self.chunk_gate.try_lock().is_ok() {
            state.status = JobStatus::Cancelled;
            state.updated_at = Utc::now();
        }
        info!(target = "catmatch.jobs", job_id = %self.id, status = state.status.as_str(), "job_cancel_requested");
        Ok(state.status)
    }

    /// Starts the sweep and keeps requesting chunks, pausing `delay` between them,
    /// until the job leaves `Running`.
    pub async fn run(&self, delay: Duration) -> Result<JobInfo, PipelineError> {
        let mut last = self.start().await?;
        while last.status == JobStatus::Running {
            sleep(delay).await;
            last = match self.next_chunk().await {
                Ok(result) => result,
                Err(err) => {
                    if self.status().await != JobStatus::Cancelled {
                        return Err(err);
                    }
                    info!(target = "catmatch.jobs", job_id = %self.id, detail = %err, "sweep_stopped");
                    break;
                }
            };
        }
        Ok(self.snapshot().await)
    }

    async fn preflight(&self) -> Result<(), PipelineError> {
        self.pipeline.ensure_ready()?;
        self.pipeline.vocabulary().await.map(|_| ())
    }

    async fn process_locked(&self, chunk_index: usize) -> Result<ChunkResult, PipelineError> {
        let (offset, chunk_size) = {
            let mut state = self.state.lock().await;
            match state.status {
                JobStatus::Running => {}
                other => {
                    return Err(PipelineError::conflict(
                        "request_chunk",
                        format!("job is {}", other.as_str()),
                    ));
                }
            }
            if self.cancel_requested.load(Ordering::SeqCst) {
                state.status = JobStatus::Cancelled;
                state.updated_at = Utc::now();
                return Err(PipelineError::conflict("request_chunk", "job is cancelled"));
            }
            if chunk_index > state.next_chunk {
                return Err(PipelineError::invalid_input(
                    "request_chunk",
                    format!(
                        "chunk {chunk_index} is not reachable yet; next chunk is {}",
                        state.next_chunk
                    ),
                ));
            }
            (state.chunk_offsets[chunk_index], state.chunk_size)
        };

        let uncategorized = self.pipeline.count_uncategorized().await?;
        {
            let mut state = self.state.lock().await;
            state.total_chunks =
                chunk_index + chunks_for(uncategorized.saturating_sub(offset), chunk_size).max(1);
        }

        let started = Instant::now();
        let outcome = match self.pipeline.process_chunk(offset, chunk_size).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_fatal() {
                    self.state.lock().await.fail(&err);
                }
                warn!(target = "catmatch.jobs", job_id = %self.id, chunk_index, error = %err, "chunk_failed");
                return Err(err);
            }
        };
        for report in &outcome.reports {
            debug!(
                target = "catmatch.jobs",
                job_id = %self.id,
                item_id = report.item_id,
                outcome = report.label(),
                "item_reported"
            );
        }
        let remaining = self.pipeline.count_uncategorized().await?;
        let elapsed_ms = started.elapsed().as_millis();
        metrics::chunk_elapsed(&self.id.to_string(), chunk_index, elapsed_ms);

        let mut state = self.state.lock().await;
        let next_offset = offset + outcome.counts.left_in_pool();
        state.chunk_offsets.truncate(chunk_index + 1);
        state.chunk_offsets.push(next_offset);
        state.next_chunk = chunk_index + 1;
        state.current_chunk = Some(chunk_index);
        state.processed_count += outcome.reports.len();
        state.remaining = remaining;
        state.total_chunks =
            chunk_index + 1 + chunks_for(remaining.saturating_sub(next_offset), chunk_size);
        state.counts.absorb(&outcome.counts);
        state.updated_at = Utc::now();

        if self.cancel_requested.load(Ordering::SeqCst) {
            state.status = JobStatus::Cancelled;
        } else if !(chunk_index + 1 < state.total_chunks && remaining > 0) {
            state.status = JobStatus::Completed;
        }

        info!(
            target = "catmatch.jobs",
            job_id = %self.id,
            chunk_index,
            processed = outcome.reports.len(),
            matched = outcome.counts.matched,
            unmatched = outcome.counts.unmatched,
            untouched = outcome.counts.untouched,
            remaining,
            status = state.status.as_str(),
            "chunk_processed"
        );

        Ok(ChunkResult {
            job_id: self.id.to_string(),
            status: state.status,
            current_chunk: chunk_index,
            next_chunk: (state.status == JobStatus::Running).then_some(state.next_chunk),
            total_chunks: state.total_chunks,
            processed: outcome.reports.len(),
            processed_total: state.processed_count,
            remaining,
            percent: state.percent(),
            counts: outcome.counts,
            results: outcome.reports,
            elapsed_ms,
            timestamp: state.updated_at,
        })
    }
}

/// Jobs known to the HTTP surface. At most one of them sweeps the pool at a time.
#[derive(Clone)]
pub struct JobRegistry {
    pipeline: Pipeline,
    jobs: Arc<Mutex<HashMap<Uuid, Arc<BatchJob>>>>,
    launch: Arc<Mutex<()>>,
    capacity: usize,
}

impl JobRegistry {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            launch: Arc::new(Mutex::new(())),
            capacity: job_history_from_env(),
        }
    }

    /// Creates a job and runs its chunk 0, unless another job is starting or still
    /// `Running`; that one has to finish or be cancelled first.
    pub async fn start(&self) -> Result<(Arc<BatchJob>, ChunkResult), PipelineError> {
        let Ok(_launch) = self.launch.try_lock() else {
            return Err(PipelineError::conflict("start", "another job is starting"));
        };
        if let Some(active) = self.running().await {
            return Err(PipelineError::conflict(
                "start",
                format!("job {active} is already running"),
            ));
        }
        let job = self.create().await;
        let chunk = job.start().await?;
        Ok((job, chunk))
    }

    async fn running(&self) -> Option<Uuid> {
        let guard = self.jobs.lock().await;
        for (id, job) in guard.iter() {
            if job.status().await == JobStatus::Running {
                return Some(*id);
            }
        }
        None
    }

    async fn create(&self) -> Arc<BatchJob> {
        let job = Arc::new(BatchJob::new(self.pipeline.clone()));
        let mut guard = self.jobs.lock().await;
        if guard.len() >= self.capacity {
            let mut finished = Vec::new();
            for (id, existing) in guard.iter() {
                let status = existing.status().await;
                if status.is_terminal() || status == JobStatus::Idle {
                    finished.push((existing.created_at, *id));
                }
            }
            finished.sort();
            let excess = guard.len() + 1 - self.capacity;
            for (_, id) in finished.into_iter().take(excess) {
                guard.remove(&id);
            }
        }
        guard.insert(job.id(), job.clone());
        job
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<BatchJob>> {
        self.jobs.lock().await.get(&id).cloned()
    }
}

fn job_history_from_env() -> usize {
    env_parse::<usize>("JOB_HISTORY_LIMIT")
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
