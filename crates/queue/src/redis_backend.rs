//! Redis queue backend.
//!
//! Layout per stream (prefix `mp:q:{stream}`):
//!   `:ready`    ZSET  job_id scored by rank*STRIDE + enqueued_ms
//!   `:delayed`  ZSET  job_id scored by not_before epoch ms
//!   `:leased`   ZSET  job_id scored by lease deadline epoch ms
//!   `:jobs`     HASH  job_id -> job JSON
//!   `:scores`   HASH  job_id -> ready score (for delayed/lease recovery)
//!   `:aged`     HASH  job_id -> last promotion epoch ms
//!   `:paused`   STRING flag
//! Shared:
//!   `mp:q:dls`        LIST of job JSON
//!   `mp:q:idem:{key}` STRING with TTL for enqueue dedup
//!
//! Lease-pop, delayed promotion, and lease recovery run as Lua scripts so a
//! crashed worker can never observe a half-moved job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use mailpipe_core::job::{Job, Phase};

use crate::backend::{ready_score, EnqueueOutcome, QueueBackend, StreamDepth};
use crate::error::QueueError;

const KEY_PREFIX: &str = "mp:q";
const BATCH: usize = 100;

/// SET NX + insert into jobs/scores and ready or delayed, atomically.
/// KEYS: idem, jobs, scores, ready, delayed
/// ARGV: job_id, json, ready_score, not_before_ms, now_ms, idem_ttl_secs
const ENQUEUE_LUA: &str = r#"
local ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', tonumber(ARGV[6]))
if not ok then
  return 0
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
if tonumber(ARGV[4]) > tonumber(ARGV[5]) then
  redis.call('ZADD', KEYS[5], tonumber(ARGV[4]), ARGV[1])
else
  redis.call('ZADD', KEYS[4], tonumber(ARGV[3]), ARGV[1])
end
return 1
"#;

/// Pop the lowest-scored ready job and move it to the leased set.
/// KEYS: ready, leased, jobs
/// ARGV: lease_deadline_ms
const POP_LUA: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local id = popped[1]
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]), id)
return redis.call('HGET', KEYS[3], id)
"#;

/// Move members of a source zset scored at or below a cutoff back into the
/// ready set at their stored ready score. Used for both delayed promotion
/// (source = delayed) and lease recovery (source = leased).
/// KEYS: source, ready, scores
/// ARGV: cutoff_ms, batch
const MOVE_DUE_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(due) do
  local score = redis.call('HGET', KEYS[3], id)
  if score then
    redis.call('ZADD', KEYS[2], tonumber(score), id)
  end
  redis.call('ZREM', KEYS[1], id)
end
return #due
"#;

pub struct RedisQueue {
    conn: MultiplexedConnection,
    enqueue_script: Script,
    pop_script: Script,
    move_due_script: Script,
}

impl RedisQueue {
    /// Connect to the queue backend. The multiplexed connection reconnects
    /// internally; callers hold one `RedisQueue` for the process lifetime.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::from)?;
        info!("queue backend connected");
        Ok(Self {
            conn,
            enqueue_script: Script::new(ENQUEUE_LUA),
            pop_script: Script::new(POP_LUA),
            move_due_script: Script::new(MOVE_DUE_LUA),
        })
    }

    fn key(stream: Phase, part: &str) -> String {
        format!("{}:{}:{}", KEY_PREFIX, stream.stream(), part)
    }

    fn idem_key(key: &str) -> String {
        format!("{}:idem:{}", KEY_PREFIX, key)
    }

    fn dls_key() -> String {
        format!("{}:dls", KEY_PREFIX)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, job: &Job, idem_ttl: Duration) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let score = ready_score(job.priority.rank(), job.enqueued_at.timestamp_millis());

        let inserted: i64 = self
            .enqueue_script
            .key(Self::idem_key(&job.idempotency_key))
            .key(Self::key(job.phase, "jobs"))
            .key(Self::key(job.phase, "scores"))
            .key(Self::key(job.phase, "ready"))
            .key(Self::key(job.phase, "delayed"))
            .arg(&job.job_id)
            .arg(json)
            .arg(score)
            .arg(job.not_before.timestamp_millis())
            .arg(Self::now_ms())
            .arg(idem_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        if inserted == 1 {
            debug!(job_id = %job.job_id, stream = %job.phase, "job enqueued");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            Ok(EnqueueOutcome::Deduplicated)
        }
    }

    async fn lease(&self, stream: Phase, visibility: Duration) -> Result<Option<Job>, QueueError> {
        if self.is_paused(stream).await? {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let deadline = Self::now_ms() + visibility.as_millis() as i64;
        let raw: Option<String> = self
            .pop_script
            .key(Self::key(stream, "ready"))
            .key(Self::key(stream, "leased"))
            .key(Self::key(stream, "jobs"))
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, stream: Phase, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(Self::key(stream, "leased"), job_id)
            .ignore()
            .zrem(Self::key(stream, "delayed"), job_id)
            .ignore()
            .hdel(Self::key(stream, "jobs"), job_id)
            .ignore()
            .hdel(Self::key(stream, "scores"), job_id)
            .ignore()
            .hdel(Self::key(stream, "aged"), job_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let score = ready_score(job.priority.rank(), job.enqueued_at.timestamp_millis());
        let _: () = redis::pipe()
            .atomic()
            .zrem(Self::key(job.phase, "leased"), &job.job_id)
            .ignore()
            .hset(Self::key(job.phase, "jobs"), &job.job_id, json)
            .ignore()
            .hset(Self::key(job.phase, "scores"), &job.job_id, score)
            .ignore()
            .zadd(
                Self::key(job.phase, "delayed"),
                &job.job_id,
                job.not_before.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(Self::key(job.phase, "leased"), &job.job_id)
            .ignore()
            .zrem(Self::key(job.phase, "delayed"), &job.job_id)
            .ignore()
            .hdel(Self::key(job.phase, "jobs"), &job.job_id)
            .ignore()
            .hdel(Self::key(job.phase, "scores"), &job.job_id)
            .ignore()
            .hdel(Self::key(job.phase, "aged"), &job.job_id)
            .ignore()
            .rpush(Self::dls_key(), json)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self, stream: Phase) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let moved: u64 = self
            .move_due_script
            .key(Self::key(stream, "delayed"))
            .key(Self::key(stream, "ready"))
            .key(Self::key(stream, "scores"))
            .arg(Self::now_ms())
            .arg(BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn recover_expired(&self, stream: Phase) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let recovered: u64 = self
            .move_due_script
            .key(Self::key(stream, "leased"))
            .key(Self::key(stream, "ready"))
            .key(Self::key(stream, "scores"))
            .arg(Self::now_ms())
            .arg(BATCH)
            .invoke_async(&mut conn)
            .await?;
        if recovered > 0 {
            info!(stream = %stream, recovered, "expired leases made visible again");
        }
        Ok(recovered)
    }

    async fn promote_aged(&self, stream: Phase, threshold: Duration) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let now = Self::now_ms();
        let threshold_ms = threshold.as_millis() as i64;

        let entries: Vec<(String, i64)> = conn
            .zrange_withscores(Self::key(stream, "ready"), 0, BATCH as isize - 1)
            .await?;

        let mut promoted = 0u64;
        for (id, score) in entries {
            let rank = (score / crate::backend::RANK_STRIDE) as u8;
            let enqueued_ms = score % crate::backend::RANK_STRIDE;
            if rank <= 1 {
                continue;
            }
            let last_promoted: Option<i64> = conn
                .hget(Self::key(stream, "aged"), &id)
                .await?;
            let since = last_promoted.unwrap_or(enqueued_ms);
            if now - since < threshold_ms {
                continue;
            }

            let raw: Option<String> = conn.hget(Self::key(stream, "jobs"), &id).await?;
            let Some(raw) = raw else { continue };
            let mut job: Job = serde_json::from_str(&raw)?;
            job.priority = mailpipe_core::analysis::Priority::from_rank(rank - 1);
            let new_score = ready_score(rank - 1, enqueued_ms);

            // XX keeps the promotion from resurrecting a job a worker leased
            // between our read and this write.
            let updated: i64 = redis::cmd("ZADD")
                .arg(Self::key(stream, "ready"))
                .arg("XX")
                .arg("CH")
                .arg(new_score)
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            if updated == 1 {
                let _: () = redis::pipe()
                    .hset(
                        Self::key(stream, "jobs"),
                        &id,
                        serde_json::to_string(&job)?,
                    )
                    .ignore()
                    .hset(Self::key(stream, "scores"), &id, new_score)
                    .ignore()
                    .hset(Self::key(stream, "aged"), &id, now)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(stream = %stream, promoted, "aged jobs promoted");
        }
        Ok(promoted)
    }

    async fn depth(&self, stream: Phase) -> Result<StreamDepth, QueueError> {
        let mut conn = self.conn.clone();
        let ready: u64 = conn.zcard(Self::key(stream, "ready")).await?;
        let delayed: u64 = conn.zcard(Self::key(stream, "delayed")).await?;
        let leased: u64 = conn.zcard(Self::key(stream, "leased")).await?;
        Ok(StreamDepth { ready, delayed, leased })
    }

    async fn dls_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(Self::dls_key()).await?;
        Ok(depth)
    }

    async fn dls_peek(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(Self::dls_key(), 0, limit as isize - 1)
            .await?;
        raw.iter()
            .map(|j| serde_json::from_str(j).map_err(QueueError::from))
            .collect()
    }

    async fn dls_requeue(&self, limit: usize) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0u64;
        for _ in 0..limit {
            let raw: Option<String> = conn.lpop(Self::dls_key(), None).await?;
            let Some(raw) = raw else { break };
            let mut job: Job = serde_json::from_str(&raw)?;
            job.attempts = 0;
            job.not_before = Utc::now();
            let json = serde_json::to_string(&job)?;
            let score = ready_score(job.priority.rank(), job.enqueued_at.timestamp_millis());
            let _: () = redis::pipe()
                .atomic()
                .hset(Self::key(job.phase, "jobs"), &job.job_id, json)
                .ignore()
                .hset(Self::key(job.phase, "scores"), &job.job_id, score)
                .ignore()
                .zadd(Self::key(job.phase, "ready"), &job.job_id, score)
                .ignore()
                .query_async(&mut conn)
                .await?;
            moved += 1;
        }
        Ok(moved)
    }

    async fn peek(&self, stream: Phase, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(Self::key(stream, "ready"), 0, limit as isize - 1)
            .await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.hget(Self::key(stream, "jobs"), &id).await?;
            if let Some(raw) = raw {
                jobs.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(jobs)
    }

    async fn drain(&self, stream: Phase) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let ready: u64 = conn.zcard(Self::key(stream, "ready")).await?;
        let delayed: u64 = conn.zcard(Self::key(stream, "delayed")).await?;
        let ids: Vec<String> = conn.zrange(Self::key(stream, "ready"), 0, -1).await?;
        let delayed_ids: Vec<String> = conn.zrange(Self::key(stream, "delayed"), 0, -1).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in ids.iter().chain(delayed_ids.iter()) {
            pipe.hdel(Self::key(stream, "jobs"), id).ignore();
            pipe.hdel(Self::key(stream, "scores"), id).ignore();
            pipe.hdel(Self::key(stream, "aged"), id).ignore();
        }
        pipe.del(Self::key(stream, "ready")).ignore();
        pipe.del(Self::key(stream, "delayed")).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(ready + delayed)
    }

    async fn set_paused(&self, stream: Phase, paused: bool) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if paused {
            let _: () = conn.set(Self::key(stream, "paused"), 1).await?;
        } else {
            let _: () = conn.del(Self::key(stream, "paused")).await?;
        }
        Ok(())
    }

    async fn is_paused(&self, stream: Phase) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let flag: Option<i64> = conn.get(Self::key(stream, "paused")).await?;
        Ok(flag.is_some())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
