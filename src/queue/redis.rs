use ::redis::{aio::Connection, Client, Script};
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    FinishedState, JobQueue, QueueError, QueueEvent, QueueEvents, QueueHealth, QueueObserver,
    QueueStats,
};
use crate::domain::delivery_job::DeliveryJob;

// Adds the job unless its id is already known.
// KEYS: jobs hash, waiting list. ARGV: job id, job json.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

// Promotes due delayed jobs, moves expired leases back to waiting, leases the
// next waiting job and counts the attempt.
// KEYS: waiting list, active zset, delayed zset, attempts hash.
// ARGV: now ms, lease deadline ms.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('LPUSH', KEYS[1], id)
end
local stalled = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
local id = redis.call('RPOP', KEYS[1])
if not id then
  return {'', 0, #stalled}
end
redis.call('ZADD', KEYS[2], ARGV[2], id)
local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
return {id, attempts, #stalled}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    jobs: String,
    attempts: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn new(namespace: &str) -> Self {
        Self {
            jobs: format!("{}:jobs", namespace),
            attempts: format!("{}:attempts", namespace),
            waiting: format!("{}:waiting", namespace),
            delayed: format!("{}:delayed", namespace),
            active: format!("{}:active", namespace),
            completed: format!("{}:completed", namespace),
            failed: format!("{}:failed", namespace),
        }
    }

    fn finished(&self, state: FinishedState) -> &str {
        match state {
            FinishedState::Completed => &self.completed,
            FinishedState::Failed => &self.failed,
        }
    }
}

/// Redis-backed queue. Every job lives in a hash keyed by job id; the
/// waiting list and the delayed/active/completed/failed sorted sets only hold
/// ids. Scores are unix millis: due time for delayed, lease deadline for
/// active, finish time for completed and failed.
pub struct RedisJobQueue {
    client: Client,
    keys: QueueKeys,
    stall_timeout: Duration,
    operation_timeout: Duration,
    events: QueueEvents,
    reachable: AtomicBool,
    enqueue_script: Script,
    claim_script: Script,
}

impl RedisJobQueue {
    /// `namespace` prefixes every key, e.g. `production:queue:welcome-email`.
    pub fn new(
        client: Client,
        namespace: &str,
        stall_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            client,
            keys: QueueKeys::new(namespace),
            stall_timeout,
            operation_timeout,
            events: QueueEvents::new(namespace),
            reachable: AtomicBool::new(false),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.events.subscribe(observer);
        self
    }

    async fn connection(&self) -> Result<Connection, QueueError> {
        Ok(self.client.get_tokio_connection().await?)
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, QueueError>>,
    {
        let result = match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.operation_timeout)),
        };

        if let Err(err) = &result {
            self.events.emit(QueueEvent::Error {
                message: err.to_string(),
            });
        }

        result
    }

    async fn load_job(&self, conn: &mut Connection, job_id: &str) -> Result<Option<DeliveryJob>, QueueError> {
        let job_json: Option<String> = ::redis::cmd("HGET")
            .arg(&self.keys.jobs)
            .arg(job_id)
            .query_async(conn)
            .await?;

        Ok(job_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?)
    }

    /// Stores the job's latest state and moves its id from active to `target`
    /// with the given score.
    async fn park(&self, job: &DeliveryJob, target: &str, score: i64) -> Result<(), QueueError> {
        let job_json = serde_json::to_string(job)?;

        self.bounded(async {
            let mut conn = self.connection().await?;
            ::redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&self.keys.jobs)
                .arg(&job.job_id)
                .arg(&job_json)
                .ignore()
                .cmd("ZREM")
                .arg(&self.keys.active)
                .arg(&job.job_id)
                .ignore()
                .cmd("ZADD")
                .arg(target)
                .arg(score)
                .arg(&job.job_id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[tracing::instrument(name = "Enqueue a delivery job", skip(self, job), fields(job_id = %job.job_id))]
    async fn enqueue(&self, job: DeliveryJob) -> Result<bool, QueueError> {
        let job_json = serde_json::to_string(&job)?;

        let added: i64 = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let mut invocation = self.enqueue_script.prepare_invoke();
                invocation
                    .key(&self.keys.jobs)
                    .key(&self.keys.waiting)
                    .arg(&job.job_id)
                    .arg(&job_json);

                Ok(invocation.invoke_async(&mut conn).await?)
            })
            .await?;

        if added == 0 {
            tracing::warn!("A job with this id already exists");
        }

        Ok(added == 1)
    }

    async fn health_check(&self) -> QueueHealth {
        let ping = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
                Ok(pong)
            })
            .await;

        match ping {
            Ok(_) => {
                if !self.reachable.swap(true, Ordering::Relaxed) {
                    self.events.emit(QueueEvent::Ready);
                }
                QueueHealth::Healthy
            }
            Err(err) => {
                self.reachable.store(false, Ordering::Relaxed);
                tracing::error!(error = %err, "Queue health check failed");
                QueueHealth::Unhealthy
            }
        }
    }

    async fn claim(&self) -> Result<Option<DeliveryJob>, QueueError> {
        let claimed = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let now = Utc::now().timestamp_millis();
                let lease_deadline = now + self.stall_timeout.as_millis() as i64;

                let mut invocation = self.claim_script.prepare_invoke();
                invocation
                    .key(&self.keys.waiting)
                    .key(&self.keys.active)
                    .key(&self.keys.delayed)
                    .key(&self.keys.attempts)
                    .arg(now)
                    .arg(lease_deadline);
                let (job_id, attempts, stalled): (String, u32, u64) =
                    invocation.invoke_async(&mut conn).await?;

                if stalled > 0 {
                    self.events.emit(QueueEvent::Stalled { count: stalled });
                }
                if job_id.is_empty() {
                    return Ok(None);
                }

                let mut job = match self.load_job(&mut conn, &job_id).await? {
                    Some(job) => job,
                    None => {
                        ::redis::pipe()
                            .atomic()
                            .cmd("ZREM")
                            .arg(&self.keys.active)
                            .arg(&job_id)
                            .ignore()
                            .cmd("HDEL")
                            .arg(&self.keys.attempts)
                            .arg(&job_id)
                            .ignore()
                            .query_async::<_, ()>(&mut conn)
                            .await?;
                        return Err(QueueError::Rejected(format!(
                            "job {} has no stored data",
                            job_id
                        )));
                    }
                };

                // The attempts hash is authoritative, the stored json may lag behind
                job.attempts_made = attempts;

                Ok(Some(job))
            })
            .await?;

        if let Some(job) = &claimed {
            self.events.emit(QueueEvent::Active {
                job_id: job.job_id.clone(),
                attempt: job.attempts_made,
            });
        }

        Ok(claimed)
    }

    async fn complete(&self, job: &DeliveryJob) -> Result<(), QueueError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            ::redis::pipe()
                .atomic()
                .cmd("ZREM")
                .arg(&self.keys.active)
                .arg(&job.job_id)
                .ignore()
                .cmd("HDEL")
                .arg(&self.keys.jobs)
                .arg(&job.job_id)
                .ignore()
                .cmd("HDEL")
                .arg(&self.keys.attempts)
                .arg(&job.job_id)
                .ignore()
                .cmd("ZADD")
                .arg(&self.keys.completed)
                .arg(Utc::now().timestamp_millis())
                .arg(&job.job_id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        })
        .await?;

        self.events.emit(QueueEvent::Completed {
            job_id: job.job_id.clone(),
        });

        Ok(())
    }

    async fn retry(&self, job: &DeliveryJob, error: &str) -> Result<Duration, QueueError> {
        let delay = job.retry_delay();
        let mut job = job.clone();
        job.last_error = Some(error.to_string());
        let due_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        self.park(&job, &self.keys.delayed, due_at).await?;

        self.events.emit(QueueEvent::Retrying {
            job_id: job.job_id.clone(),
            attempt: job.attempts_made,
            delay,
        });

        Ok(delay)
    }

    async fn fail(&self, job: &DeliveryJob, error: &str) -> Result<(), QueueError> {
        let mut job = job.clone();
        job.last_error = Some(error.to_string());

        self.park(&job, &self.keys.failed, Utc::now().timestamp_millis())
            .await?;

        self.events.emit(QueueEvent::Failed {
            job_id: job.job_id.clone(),
            attempt: job.attempts_made,
            error: error.to_string(),
        });

        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let counts = ::redis::pipe()
                    .cmd("LLEN")
                    .arg(&self.keys.waiting)
                    .cmd("ZCARD")
                    .arg(&self.keys.delayed)
                    .cmd("ZCARD")
                    .arg(&self.keys.active)
                    .cmd("ZCARD")
                    .arg(&self.keys.completed)
                    .cmd("ZCARD")
                    .arg(&self.keys.failed)
                    .query_async(&mut conn)
                    .await?;
                Ok(counts)
            })
            .await?;

        Ok(QueueStats {
            waiting,
            delayed,
            active,
            completed,
            failed,
            timestamp: Utc::now(),
        })
    }

    async fn clean(&self, state: FinishedState, older_than: Duration) -> Result<u64, QueueError> {
        let key = self.keys.finished(state);
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;

        let removed = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let job_ids: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(cutoff)
                    .query_async(&mut conn)
                    .await?;

                if job_ids.is_empty() {
                    return Ok(0);
                }

                ::redis::pipe()
                    .atomic()
                    .cmd("ZREM")
                    .arg(key)
                    .arg(&job_ids)
                    .ignore()
                    .cmd("HDEL")
                    .arg(&self.keys.jobs)
                    .arg(&job_ids)
                    .ignore()
                    .cmd("HDEL")
                    .arg(&self.keys.attempts)
                    .arg(&job_ids)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;

                Ok(job_ids.len() as u64)
            })
            .await?;

        if removed > 0 {
            self.events.emit(QueueEvent::Cleaned {
                state,
                count: removed,
            });
        }

        Ok(removed)
    }
}
