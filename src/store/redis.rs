//! Redis storage backend.
//!
//! Each job is stored as a JSON record under its own `job:{id}` key. Queue
//! membership is tracked in per-queue sorted sets (`waiting` and `delayed`) plus
//! global `active` and `terminal` sets used by the sweeps. All state transitions
//! are WATCH/MULTI/EXEC compare-and-swap loops over the affected keys, so a
//! transition that loses a race is retried against fresh state and a job can
//! only ever be claimed by a single worker.

use std::collections::HashMap;

use async_trait::async_trait;
use log::warn;
use redis::AsyncCommands;

use crate::models::job::{EnqueueRequest, JobRecord, State};
use crate::models::{queue, DateTime, Duration, Error, JobStats, QueueInfo, Result, ServerInfo};
use crate::store::keys::{self, Keys};
use crate::store::JobStore;

type Connection = deadpool_redis::Connection;

/// Weight of the priority component in a waiting set score. Leaves the full
/// id range below it so that ids tie-break FIFO within a priority.
const PRIORITY_WEIGHT: f64 = (1u64 << 42) as f64;

/// Score of a job in a queue's waiting set: lower scores are claimed first,
/// so higher priorities map to lower scores and ids break ties FIFO.
fn claim_score(priority: i32, job_id: u64) -> f64 {
    job_id as f64 - f64::from(priority) * PRIORITY_WEIGHT
}

async fn watch(conn: &mut Connection, key: &str) -> Result<()> {
    redis::cmd("WATCH").arg(key).query_async::<_, ()>(conn).await?;
    Ok(())
}

async fn unwatch(conn: &mut Connection) -> Result<()> {
    redis::cmd("UNWATCH").query_async::<_, ()>(conn).await?;
    Ok(())
}

pub struct RedisStore {
    pool: deadpool_redis::Pool,
    keys: Keys,
}

impl RedisStore {
    pub fn new(pool: deadpool_redis::Pool, key_namespace: &str) -> Self {
        Self {
            pool,
            keys: Keys::new(key_namespace),
        }
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn ensure_queue(&self, conn: &mut Connection, queue: &str) -> Result<()> {
        let exists: bool = conn.exists(self.keys.queue_settings(queue)).await?;
        if exists {
            Ok(())
        } else {
            Err(Error::NoSuchQueue(queue.to_owned()))
        }
    }

    /// Fetch and parse a job record after its key has been WATCHed, checking that
    /// it is in the state the caller's transition expects. Clears the WATCH on
    /// any failure so the connection goes back to the pool clean.
    async fn watched_job(
        &self,
        conn: &mut Connection,
        job_id: u64,
        expected: State,
    ) -> Result<JobRecord> {
        let raw: Option<String> = conn.get(self.keys.job(job_id)).await?;
        let record: JobRecord = match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(err) => {
                    unwatch(conn).await?;
                    return Err(err.into());
                }
            },
            None => {
                unwatch(conn).await?;
                return Err(Error::NoSuchJob(job_id));
            }
        };
        if record.state != expected {
            unwatch(conn).await?;
            return Err(Error::conflict(format!(
                "Job {} is {}, expected {}",
                job_id, record.state, expected
            )));
        }
        Ok(record)
    }

    /// Move jobs whose delay has elapsed from the delayed set to the waiting set.
    async fn promote_delayed(&self, conn: &mut Connection, queue: &str) -> Result<()> {
        let delayed_key = self.keys.queue_delayed(queue);
        let waiting_key = self.keys.queue_waiting(queue);
        loop {
            let now_millis = DateTime::now().timestamp_millis();
            watch(conn, &delayed_key).await?;
            let due: Vec<u64> = conn
                .zrangebyscore_limit(&delayed_key, "-inf", now_millis, 0, 100)
                .await?;
            if due.is_empty() {
                unwatch(conn).await?;
                return Ok(());
            }

            let mut get_pipe = redis::pipe();
            for job_id in &due {
                get_pipe.get(self.keys.job(*job_id));
            }
            let raws: Vec<Option<String>> = get_pipe.query_async(conn).await?;

            let mut pipe = redis::pipe();
            pipe.atomic();
            for (job_id, raw) in due.iter().zip(raws) {
                pipe.zrem(&delayed_key, *job_id).ignore();
                match raw.as_deref().map(serde_json::from_str::<JobRecord>) {
                    Some(Ok(record)) => {
                        pipe.zadd(&waiting_key, *job_id, claim_score(record.priority, *job_id))
                            .ignore();
                    }
                    // record gone or unreadable, just drop the set entry
                    _ => warn!("Dropping orphaned delayed entry for job {}", job_id),
                }
            }
            let exec: Option<()> = pipe.query_async(conn).await?;
            if exec.is_some() {
                return Ok(());
            }
        }
    }

    /// Fetch job records by id, silently skipping ids whose record has been
    /// evicted since the id was read.
    async fn jobs_by_ids(&self, conn: &mut Connection, job_ids: &[u64]) -> Result<Vec<JobRecord>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for job_id in job_ids {
            pipe.get(self.keys.job(*job_id));
        }
        let raws: Vec<Option<String>> = pipe.query_async(conn).await?;
        let mut records = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            records.push(serde_json::from_str(&raw)?);
        }
        Ok(records)
    }

    async fn settings_by_queue(
        &self,
        conn: &mut Connection,
    ) -> Result<HashMap<String, queue::Settings>> {
        let names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        let mut settings = HashMap::with_capacity(names.len());
        for name in names {
            let raw: Option<String> = conn.get(self.keys.queue_settings(&name)).await?;
            if let Some(raw) = raw {
                settings.insert(name, serde_json::from_str(&raw)?);
            }
        }
        Ok(settings)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn register_queue(&self, name: &str, settings: &queue::Settings) -> Result<bool> {
        if !queue::is_valid_name(name) {
            return Err(Error::bad_request(format!("Invalid queue name: {}", name)));
        }
        let mut conn = self.conn().await?;
        let settings_key = self.keys.queue_settings(name);
        let existed: bool = conn.exists(&settings_key).await?;
        redis::pipe()
            .atomic()
            .set(&settings_key, serde_json::to_string(settings)?)
            .ignore()
            .sadd(self.keys.queues(), name)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(!existed)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        names.sort_unstable();
        Ok(names)
    }

    async fn queue_settings(&self, name: &str) -> Result<queue::Settings> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.keys.queue_settings(name)).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(Error::NoSuchQueue(name.to_owned())),
        }
    }

    async fn queue_size(&self, name: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        self.ensure_queue(&mut conn, name).await?;
        let (waiting, delayed): (u64, u64) = redis::pipe()
            .zcard(self.keys.queue_waiting(name))
            .zcard(self.keys.queue_delayed(name))
            .query_async(&mut conn)
            .await?;
        Ok(waiting + delayed)
    }

    async fn enqueue(
        &self,
        queue: &str,
        req: &EnqueueRequest,
        original_queue: Option<&str>,
    ) -> Result<JobRecord> {
        let settings = self.queue_settings(queue).await?;
        let mut conn = self.conn().await?;

        let job_id: u64 = conn.incr(self.keys.job_id(), 1u64).await?;
        let now = DateTime::now();
        let priority = req.priority.unwrap_or(0);
        let record = JobRecord {
            id: job_id,
            queue: queue.to_owned(),
            name: req.name.clone(),
            payload: req.payload.clone(),
            attempts_made: 0,
            max_attempts: req.max_attempts.unwrap_or(settings.max_attempts),
            state: State::Waiting,
            created_at: now,
            available_at: match req.delay {
                Some(delay) => now.plus(delay),
                None => now,
            },
            priority,
            started_at: None,
            processed_at: None,
            failed_reason: None,
            original_queue: original_queue.map(str::to_owned),
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.job(job_id), serde_json::to_string(&record)?)
            .ignore()
            .incr(self.keys.stat(keys::STAT_CREATED), 1u64)
            .ignore();
        if record.available_at > now {
            pipe.zadd(
                self.keys.queue_delayed(queue),
                job_id,
                record.available_at.timestamp_millis(),
            )
            .ignore();
        } else {
            pipe.zadd(
                self.keys.queue_waiting(queue),
                job_id,
                claim_score(priority, job_id),
            )
            .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(record)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        self.ensure_queue(&mut conn, queue).await?;
        self.promote_delayed(&mut conn, queue).await?;

        let waiting_key = self.keys.queue_waiting(queue);
        loop {
            watch(&mut conn, &waiting_key).await?;
            let head: Vec<u64> = conn.zrange(&waiting_key, 0, 0).await?;
            let job_id = match head.first() {
                Some(&job_id) => job_id,
                None => {
                    unwatch(&mut conn).await?;
                    return Ok(None);
                }
            };

            let job_key = self.keys.job(job_id);
            let raw: Option<String> = conn.get(&job_key).await?;
            let mut record: JobRecord = match raw.as_deref().map(serde_json::from_str) {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    unwatch(&mut conn).await?;
                    return Err(err.into());
                }
                None => {
                    warn!("Dropping orphaned waiting entry for job {}", job_id);
                    let _: Option<()> = redis::pipe()
                        .atomic()
                        .zrem(&waiting_key, job_id)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    continue;
                }
            };

            record.state = State::Active;
            record.started_at = Some(DateTime::now());
            let exec: Option<()> = redis::pipe()
                .atomic()
                .zrem(&waiting_key, job_id)
                .ignore()
                .set(&job_key, serde_json::to_string(&record)?)
                .ignore()
                .sadd(self.keys.active(), job_id)
                .ignore()
                .query_async(&mut conn)
                .await?;
            if exec.is_some() {
                return Ok(Some(record));
            }
            // lost the claim race, retry against fresh state
        }
    }

    async fn complete(&self, job_id: u64) -> Result<JobRecord> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(job_id);
        loop {
            watch(&mut conn, &job_key).await?;
            let mut record = self.watched_job(&mut conn, job_id, State::Active).await?;
            record.state = State::Completed;
            record.processed_at = Some(DateTime::now());

            let exec: Option<()> = redis::pipe()
                .atomic()
                .set(&job_key, serde_json::to_string(&record)?)
                .ignore()
                .srem(self.keys.active(), job_id)
                .ignore()
                .sadd(self.keys.terminal(), job_id)
                .ignore()
                .incr(self.keys.stat(keys::STAT_COMPLETED), 1u64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            if exec.is_some() {
                return Ok(record);
            }
        }
    }

    async fn retry(&self, job_id: u64, delay: Duration, reason: &str) -> Result<JobRecord> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(job_id);
        loop {
            watch(&mut conn, &job_key).await?;
            let mut record = self.watched_job(&mut conn, job_id, State::Active).await?;
            let now = DateTime::now();
            record.attempts_made += 1;
            record.state = State::Waiting;
            record.available_at = now.plus(delay);
            record.started_at = None;
            record.failed_reason = Some(reason.to_owned());

            let mut pipe = redis::pipe();
            pipe.atomic()
                .set(&job_key, serde_json::to_string(&record)?)
                .ignore()
                .srem(self.keys.active(), job_id)
                .ignore()
                .incr(self.keys.stat(keys::STAT_RETRIED), 1u64)
                .ignore();
            if delay.is_zero() {
                pipe.zadd(
                    self.keys.queue_waiting(&record.queue),
                    job_id,
                    claim_score(record.priority, job_id),
                )
                .ignore();
            } else {
                pipe.zadd(
                    self.keys.queue_delayed(&record.queue),
                    job_id,
                    record.available_at.timestamp_millis(),
                )
                .ignore();
            }
            let exec: Option<()> = pipe.query_async(&mut conn).await?;
            if exec.is_some() {
                return Ok(record);
            }
        }
    }

    async fn fail(&self, job_id: u64, reason: &str) -> Result<JobRecord> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(job_id);
        loop {
            watch(&mut conn, &job_key).await?;
            let mut record = self.watched_job(&mut conn, job_id, State::Active).await?;
            record.attempts_made += 1;
            record.state = State::Failed;
            record.processed_at = Some(DateTime::now());
            record.failed_reason = Some(reason.to_owned());

            let exec: Option<()> = redis::pipe()
                .atomic()
                .set(&job_key, serde_json::to_string(&record)?)
                .ignore()
                .srem(self.keys.active(), job_id)
                .ignore()
                .sadd(self.keys.terminal(), job_id)
                .ignore()
                .incr(self.keys.stat(keys::STAT_FAILED), 1u64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            if exec.is_some() {
                return Ok(record);
            }
        }
    }

    async fn mark_dead_lettered(&self, job_id: u64) -> Result<JobRecord> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(job_id);
        loop {
            watch(&mut conn, &job_key).await?;
            let mut record = self.watched_job(&mut conn, job_id, State::Failed).await?;
            record.state = State::DeadLettered;

            let exec: Option<()> = redis::pipe()
                .atomic()
                .set(&job_key, serde_json::to_string(&record)?)
                .ignore()
                .incr(self.keys.stat(keys::STAT_DEAD_LETTERED), 1u64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            if exec.is_some() {
                return Ok(record);
            }
        }
    }

    async fn job(&self, job_id: u64) -> Result<JobRecord> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.keys.job(job_id)).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(Error::NoSuchJob(job_id)),
        }
    }

    async fn queue_job_ids(&self, queue: &str) -> Result<HashMap<State, Vec<u64>>> {
        let mut conn = self.conn().await?;
        self.ensure_queue(&mut conn, queue).await?;

        let mut by_state: HashMap<State, Vec<u64>> = HashMap::new();
        let (mut waiting, delayed): (Vec<u64>, Vec<u64>) = redis::pipe()
            .zrange(self.keys.queue_waiting(queue), 0, -1)
            .zrange(self.keys.queue_delayed(queue), 0, -1)
            .query_async(&mut conn)
            .await?;
        waiting.extend(delayed);
        if !waiting.is_empty() {
            by_state.insert(State::Waiting, waiting);
        }

        let active: Vec<u64> = conn.smembers(self.keys.active()).await?;
        let terminal: Vec<u64> = conn.smembers(self.keys.terminal()).await?;
        let mut others = active;
        others.extend(terminal);
        for record in self.jobs_by_ids(&mut conn, &others).await? {
            if record.queue == queue {
                by_state.entry(record.state).or_default().push(record.id);
            }
        }

        for ids in by_state.values_mut() {
            ids.sort_unstable();
        }
        Ok(by_state)
    }

    async fn sweep_stalled(&self) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn().await?;
        let settings = self.settings_by_queue(&mut conn).await?;
        let active: Vec<u64> = conn.smembers(self.keys.active()).await?;
        let candidates = self.jobs_by_ids(&mut conn, &active).await?;

        let now = DateTime::now();
        let mut swept = Vec::new();
        'candidates: for candidate in candidates {
            let stall_timeout = match settings.get(&candidate.queue) {
                Some(settings) => settings.stall_timeout,
                None => continue,
            };
            let started = match candidate.started_at {
                Some(started) => started,
                None => continue,
            };
            let elapsed = now.timestamp_millis() - started.timestamp_millis();
            if elapsed < stall_timeout.as_millis() as i64 {
                continue;
            }

            let job_id = candidate.id;
            let job_key = self.keys.job(job_id);
            loop {
                watch(&mut conn, &job_key).await?;
                let mut record = match self.watched_job(&mut conn, job_id, State::Active).await {
                    Ok(record) => record,
                    // another sweeper or the worker itself got there first
                    Err(Error::Conflict(_)) | Err(Error::NoSuchJob(_)) => continue 'candidates,
                    Err(err) => return Err(err),
                };
                record.attempts_made += 1;
                record.failed_reason = Some("stalled".to_owned());

                let mut pipe = redis::pipe();
                pipe.atomic()
                    .srem(self.keys.active(), job_id)
                    .ignore()
                    .incr(self.keys.stat(keys::STAT_STALLED), 1u64)
                    .ignore();
                if record.attempts_exhausted() {
                    record.state = State::Failed;
                    record.processed_at = Some(now);
                    pipe.sadd(self.keys.terminal(), job_id).ignore();
                } else {
                    record.state = State::Waiting;
                    record.available_at = now;
                    record.started_at = None;
                    pipe.zadd(
                        self.keys.queue_waiting(&record.queue),
                        job_id,
                        claim_score(record.priority, job_id),
                    )
                    .ignore();
                }
                pipe.set(&job_key, serde_json::to_string(&record)?).ignore();

                let exec: Option<()> = pipe.query_async(&mut conn).await?;
                if exec.is_some() {
                    swept.push(record);
                    break;
                }
            }
        }
        Ok(swept)
    }

    async fn sweep_expired(&self) -> Result<Vec<u64>> {
        let mut conn = self.conn().await?;
        let settings = self.settings_by_queue(&mut conn).await?;
        let terminal: Vec<u64> = conn.smembers(self.keys.terminal()).await?;
        let candidates = self.jobs_by_ids(&mut conn, &terminal).await?;

        let now = DateTime::now();
        let mut evicted = Vec::new();
        for candidate in candidates {
            let retention = match settings.get(&candidate.queue) {
                Some(settings) => settings.retention,
                None => continue,
            };
            let age_limit = match candidate.state {
                State::Completed => retention.completed,
                State::Failed | State::DeadLettered => retention.failed,
                _ => continue,
            };
            let processed = match candidate.processed_at {
                Some(processed) => processed,
                None => continue,
            };
            if now.timestamp_millis() - processed.timestamp_millis() < age_limit.as_millis() as i64
            {
                continue;
            }

            redis::pipe()
                .atomic()
                .del(self.keys.job(candidate.id))
                .ignore()
                .srem(self.keys.terminal(), candidate.id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            evicted.push(candidate.id);
        }
        Ok(evicted)
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = conn.smembers(self.keys.queues()).await?;

        let mut queues: HashMap<String, QueueInfo> = HashMap::with_capacity(names.len());
        for name in &names {
            let (waiting, delayed): (u64, u64) = redis::pipe()
                .zcard(self.keys.queue_waiting(name))
                .zcard(self.keys.queue_delayed(name))
                .query_async(&mut conn)
                .await?;
            queues.insert(
                name.clone(),
                QueueInfo {
                    waiting: waiting + delayed,
                    ..Default::default()
                },
            );
        }

        let active: Vec<u64> = conn.smembers(self.keys.active()).await?;
        let terminal: Vec<u64> = conn.smembers(self.keys.terminal()).await?;
        let mut others = active;
        others.extend(terminal);
        for record in self.jobs_by_ids(&mut conn, &others).await? {
            if let Some(info) = queues.get_mut(&record.queue) {
                info.incr_state_count(&record.state);
            }
        }

        let (created, completed, retried, failed, stalled, dead_lettered): (
            Option<u64>,
            Option<u64>,
            Option<u64>,
            Option<u64>,
            Option<u64>,
            Option<u64>,
        ) = redis::pipe()
            .get(self.keys.stat(keys::STAT_CREATED))
            .get(self.keys.stat(keys::STAT_COMPLETED))
            .get(self.keys.stat(keys::STAT_RETRIED))
            .get(self.keys.stat(keys::STAT_FAILED))
            .get(self.keys.stat(keys::STAT_STALLED))
            .get(self.keys.stat(keys::STAT_DEAD_LETTERED))
            .query_async(&mut conn)
            .await?;

        Ok(ServerInfo {
            queues,
            statistics: JobStats {
                total_jobs_created: created.unwrap_or(0),
                total_jobs_completed: completed.unwrap_or(0),
                total_jobs_retried: retried.unwrap_or(0),
                total_jobs_failed: failed.unwrap_or(0),
                total_jobs_stalled: stalled.unwrap_or(0),
                total_jobs_dead_lettered: dead_lettered.unwrap_or(0),
            },
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
