use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    FinishedState, JobQueue, QueueError, QueueEvent, QueueEvents, QueueHealth, QueueObserver,
    QueueStats,
};
use crate::domain::delivery_job::DeliveryJob;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, DeliveryJob>,
    waiting: VecDeque<String>,
    delayed: Vec<(DateTime<Utc>, String)>,
    active: HashMap<String, DateTime<Utc>>,
    completed: Vec<(DateTime<Utc>, String)>,
    failed: Vec<(DateTime<Utc>, String)>,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let (due, pending): (Vec<_>, Vec<_>) = self
            .delayed
            .drain(..)
            .partition(|(due_at, _)| *due_at <= now);
        self.delayed = pending;
        self.waiting.extend(due.into_iter().map(|(_, job_id)| job_id));
    }

    fn reclaim_stalled(&mut self, now: DateTime<Utc>) -> u64 {
        let stalled: Vec<String> = self
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in &stalled {
            self.active.remove(job_id);
            self.waiting.push_front(job_id.clone());
        }

        stalled.len() as u64
    }

    fn finished(&mut self, state: FinishedState) -> &mut Vec<(DateTime<Utc>, String)> {
        match state {
            FinishedState::Completed => &mut self.completed,
            FinishedState::Failed => &mut self.failed,
        }
    }
}

/// Process-local queue with the same semantics as [`super::RedisJobQueue`].
/// Health and enqueue failures can be toggled to exercise degraded paths.
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    stall_timeout: Duration,
    healthy: AtomicBool,
    reject_enqueues: AtomicBool,
    events: QueueEvents,
}

impl InMemoryJobQueue {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            stall_timeout,
            healthy: AtomicBool::new(true),
            reject_enqueues: AtomicBool::new(false),
            events: QueueEvents::new("in-memory:welcome-email"),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.events.subscribe(observer);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_reject_enqueues(&self, reject: bool) {
        self.reject_enqueues.store(reject, Ordering::SeqCst);
    }

    /// Every job still stored, in no particular order.
    pub async fn jobs(&self) -> Vec<DeliveryJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    fn ensure_reachable(&self) -> Result<(), QueueError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Rejected("queue is unavailable".to_string()))
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: DeliveryJob) -> Result<bool, QueueError> {
        self.ensure_reachable()?;
        if self.reject_enqueues.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected("enqueue refused".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.job_id) {
            return Ok(false);
        }
        state.waiting.push_back(job.job_id.clone());
        state.jobs.insert(job.job_id.clone(), job);

        Ok(true)
    }

    async fn health_check(&self) -> QueueHealth {
        if self.healthy.load(Ordering::SeqCst) {
            QueueHealth::Healthy
        } else {
            QueueHealth::Unhealthy
        }
    }

    async fn claim(&self) -> Result<Option<DeliveryJob>, QueueError> {
        self.ensure_reachable()?;

        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.promote_due(now);
        let stalled = state.reclaim_stalled(now);
        if stalled > 0 {
            self.events.emit(QueueEvent::Stalled { count: stalled });
        }

        let job_id = match state.waiting.pop_front() {
            Some(job_id) => job_id,
            None => return Ok(None),
        };
        let lease_deadline = now
            + chrono::Duration::from_std(self.stall_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        state.active.insert(job_id.clone(), lease_deadline);

        let job = match state.jobs.get_mut(&job_id) {
            Some(job) => {
                job.start_attempt();
                job.clone()
            }
            None => {
                state.active.remove(&job_id);
                return Err(QueueError::Rejected(format!(
                    "job {} has no stored data",
                    job_id
                )));
            }
        };

        self.events.emit(QueueEvent::Active {
            job_id: job.job_id.clone(),
            attempt: job.attempts_made,
        });

        Ok(Some(job))
    }

    async fn complete(&self, job: &DeliveryJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.active.remove(&job.job_id);
        state.jobs.remove(&job.job_id);
        state.completed.push((Utc::now(), job.job_id.clone()));

        self.events.emit(QueueEvent::Completed {
            job_id: job.job_id.clone(),
        });

        Ok(())
    }

    async fn retry(&self, job: &DeliveryJob, error: &str) -> Result<Duration, QueueError> {
        let delay = job.retry_delay();
        let due_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let mut state = self.state.lock().await;
        state.active.remove(&job.job_id);
        let mut job = job.clone();
        job.last_error = Some(error.to_string());
        state.delayed.push((due_at, job.job_id.clone()));
        state.jobs.insert(job.job_id.clone(), job.clone());

        self.events.emit(QueueEvent::Retrying {
            job_id: job.job_id,
            attempt: job.attempts_made,
            delay,
        });

        Ok(delay)
    }

    async fn fail(&self, job: &DeliveryJob, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.active.remove(&job.job_id);
        let mut job = job.clone();
        job.last_error = Some(error.to_string());
        state.failed.push((Utc::now(), job.job_id.clone()));
        state.jobs.insert(job.job_id.clone(), job.clone());

        self.events.emit(QueueEvent::Failed {
            job_id: job.job_id,
            attempt: job.attempts_made,
            error: error.to_string(),
        });

        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.ensure_reachable()?;
        let state = self.state.lock().await;

        Ok(QueueStats {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            timestamp: Utc::now(),
        })
    }

    async fn clean(&self, state: FinishedState, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let mut queue_state = self.state.lock().await;
        let (expired, kept): (Vec<_>, Vec<_>) = queue_state
            .finished(state)
            .drain(..)
            .partition(|(finished_at, _)| *finished_at <= cutoff);
        *queue_state.finished(state) = kept;
        for (_, job_id) in &expired {
            queue_state.jobs.remove(job_id);
        }

        let count = expired.len() as u64;
        if count > 0 {
            self.events.emit(QueueEvent::Cleaned { state, count });
        }

        Ok(count)
    }
}
