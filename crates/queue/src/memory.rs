//! In-memory queue backend.
//!
//! Implements the full backend contract without persistence; used by unit
//! tests and local development without Redis.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use mailpipe_core::job::{Job, Phase};

use crate::backend::{EnqueueOutcome, QueueBackend, StreamDepth};
use crate::error::QueueError;

/// Ordering key in the ready set: (priority rank, enqueued ms, tiebreak seq).
type ReadyKey = (u8, i64, u64);

#[derive(Default)]
struct StreamState {
    ready: BTreeMap<ReadyKey, String>,
    ready_key_of: HashMap<String, ReadyKey>,
    /// job_id -> visible-at epoch ms.
    delayed: HashMap<String, i64>,
    /// job_id -> lease deadline epoch ms.
    leased: HashMap<String, i64>,
    jobs: HashMap<String, Job>,
    /// job_id -> last promotion epoch ms.
    promoted: HashMap<String, i64>,
    paused: bool,
}

#[derive(Default)]
struct State {
    streams: HashMap<Phase, StreamState>,
    dls: Vec<Job>,
    /// idempotency key -> expiry epoch ms.
    idem: HashMap<String, i64>,
    seq: u64,
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

fn insert_ready(s: &mut StreamState, seq: u64, job: &Job) {
    let key = (job.priority.rank(), job.enqueued_at.timestamp_millis(), seq);
    s.ready.insert(key, job.job_id.clone());
    s.ready_key_of.insert(job.job_id.clone(), key);
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, job: &Job, idem_ttl: Duration) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let now = Self::now_ms();

        match state.idem.get(&job.idempotency_key) {
            Some(&expires) if expires > now => return Ok(EnqueueOutcome::Deduplicated),
            _ => {}
        }
        state
            .idem
            .insert(job.idempotency_key.clone(), now + idem_ttl.as_millis() as i64);

        state.seq += 1;
        let seq = state.seq;
        let s = state.streams.entry(job.phase).or_default();
        s.jobs.insert(job.job_id.clone(), job.clone());
        if job.not_before.timestamp_millis() > now {
            s.delayed
                .insert(job.job_id.clone(), job.not_before.timestamp_millis());
        } else {
            insert_ready(s, seq, job);
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn lease(&self, stream: Phase, visibility: Duration) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let now = Self::now_ms();
        let mut seq = state.seq;
        let s = state.streams.entry(stream).or_default();
        if s.paused {
            return Ok(None);
        }

        // Promote due delayed jobs inline so tests see them immediately.
        let due: Vec<String> = s
            .delayed
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            s.delayed.remove(&id);
            if let Some(job) = s.jobs.get(&id).cloned() {
                seq += 1;
                insert_ready(s, seq, &job);
            }
        }

        let first = s.ready.iter().next().map(|(&key, id)| (key, id.clone()));
        let leased = match first {
            Some((key, id)) => {
                s.ready.remove(&key);
                s.ready_key_of.remove(&id);
                s.leased.insert(id.clone(), now + visibility.as_millis() as i64);
                s.jobs.get(&id).cloned()
            }
            None => None,
        };
        state.seq = seq;
        Ok(leased)
    }

    async fn ack(&self, stream: Phase, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let s = state.streams.entry(stream).or_default();
        s.leased.remove(job_id);
        s.delayed.remove(job_id);
        s.jobs.remove(job_id);
        s.promoted.remove(job_id);
        Ok(())
    }

    async fn retry(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let s = state.streams.entry(job.phase).or_default();
        s.leased.remove(&job.job_id);
        s.jobs.insert(job.job_id.clone(), job.clone());
        s.delayed
            .insert(job.job_id.clone(), job.not_before.timestamp_millis());
        Ok(())
    }

    async fn dead_letter(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let s = state.streams.entry(job.phase).or_default();
        s.leased.remove(&job.job_id);
        s.delayed.remove(&job.job_id);
        s.jobs.remove(&job.job_id);
        s.promoted.remove(&job.job_id);
        state.dls.push(job.clone());
        Ok(())
    }

    async fn promote_due(&self, stream: Phase) -> Result<u64, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let now = Self::now_ms();
        let mut seq = state.seq;
        let s = state.streams.entry(stream).or_default();
        let due: Vec<String> = s
            .delayed
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let moved = due.len() as u64;
        for id in due {
            s.delayed.remove(&id);
            if let Some(job) = s.jobs.get(&id).cloned() {
                seq += 1;
                insert_ready(s, seq, &job);
            }
        }
        state.seq = seq;
        Ok(moved)
    }

    async fn recover_expired(&self, stream: Phase) -> Result<u64, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let now = Self::now_ms();
        let mut seq = state.seq;
        let s = state.streams.entry(stream).or_default();
        let expired: Vec<String> = s
            .leased
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let recovered = expired.len() as u64;
        for id in expired {
            s.leased.remove(&id);
            if let Some(job) = s.jobs.get(&id).cloned() {
                seq += 1;
                insert_ready(s, seq, &job);
            }
        }
        state.seq = seq;
        Ok(recovered)
    }

    async fn promote_aged(&self, stream: Phase, threshold: Duration) -> Result<u64, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let now = Self::now_ms();
        let s = state.streams.entry(stream).or_default();
        let threshold_ms = threshold.as_millis() as i64;

        let eligible: Vec<(ReadyKey, String)> = s
            .ready
            .iter()
            .filter(|(&(rank, enqueued_ms, _), id)| {
                let since = s.promoted.get(*id).copied().unwrap_or(enqueued_ms);
                rank > 1 && now - since >= threshold_ms
            })
            .map(|(&k, id)| (k, id.clone()))
            .collect();

        let promoted = eligible.len() as u64;
        for ((rank, enqueued_ms, seq), id) in eligible {
            s.ready.remove(&(rank, enqueued_ms, seq));
            let new_key = (rank - 1, enqueued_ms, seq);
            s.ready.insert(new_key, id.clone());
            s.ready_key_of.insert(id.clone(), new_key);
            s.promoted.insert(id.clone(), now);
            if let Some(job) = s.jobs.get_mut(&id) {
                job.priority = mailpipe_core::analysis::Priority::from_rank(rank - 1);
            }
        }
        Ok(promoted)
    }

    async fn depth(&self, stream: Phase) -> Result<StreamDepth, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let s = state.streams.entry(stream).or_default();
        Ok(StreamDepth {
            ready: s.ready.len() as u64,
            delayed: s.delayed.len() as u64,
            leased: s.leased.len() as u64,
        })
    }

    async fn dls_depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().expect("queue state").dls.len() as u64)
    }

    async fn dls_peek(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().expect("queue state");
        Ok(state.dls.iter().take(limit).cloned().collect())
    }

    async fn dls_requeue(&self, limit: usize) -> Result<u64, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let take = state.dls.len().min(limit);
        let jobs: Vec<Job> = state.dls.drain(..take).collect();
        let moved = jobs.len() as u64;
        for mut job in jobs {
            job.attempts = 0;
            job.not_before = Utc::now();
            state.seq += 1;
            let seq = state.seq;
            let s = state.streams.entry(job.phase).or_default();
            s.jobs.insert(job.job_id.clone(), job.clone());
            insert_ready(s, seq, &job);
        }
        Ok(moved)
    }

    async fn peek(&self, stream: Phase, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let s = state.streams.entry(stream).or_default();
        Ok(s.ready
            .values()
            .take(limit)
            .filter_map(|id| s.jobs.get(id).cloned())
            .collect())
    }

    async fn drain(&self, stream: Phase) -> Result<u64, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        let s = state.streams.entry(stream).or_default();
        let dropped = (s.ready.len() + s.delayed.len()) as u64;
        for id in s.ready_key_of.keys().chain(s.delayed.keys()) {
            s.jobs.remove(id);
        }
        s.ready.clear();
        s.ready_key_of.clear();
        s.delayed.clear();
        Ok(dropped)
    }

    async fn set_paused(&self, stream: Phase, paused: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state");
        state.streams.entry(stream).or_default().paused = paused;
        Ok(())
    }

    async fn is_paused(&self, stream: Phase) -> Result<bool, QueueError> {
        let mut state = self.state.lock().expect("queue state");
        Ok(state.streams.entry(stream).or_default().paused)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
