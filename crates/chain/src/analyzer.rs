//! Chain assignment and reassessment against the store.
//!
//! Counter mutation for one chain is serialized through a per-chain async
//! lock; workers touching different chains interleave freely. The derived
//! assessment is cached per chain and invalidated whenever a member is added
//! or its analysis changes.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use mailpipe_core::chain::Chain;
use mailpipe_core::config::ThresholdConfig;
use mailpipe_core::OpCtx;

use crate::scoring::{assess, grouping_key, ChainAssessment, ChainMemberView};

const CACHE_CAPACITY: usize = 10_000;
/// Upper bound on per-chain serialization locks kept around. Idle locks are
/// pruned once the bound is reached; a held lock is never evicted while the
/// prune can avoid it.
const LOCK_CAPACITY: usize = 4_096;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain store error: {0}")]
    Store(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// The store operations the analyzer needs. Implemented by the persistent
/// store; tests use an in-memory double.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Find the chain for a grouping key, creating it on first observation.
    async fn find_or_create_chain(&self, group_key: &str) -> Result<Chain, ChainError>;

    /// Point the email at the chain and bump the chain's counter. Returns
    /// false when the email was already attached (replay).
    async fn attach_email(&self, email_id: Uuid, chain_id: Uuid) -> Result<bool, ChainError>;

    /// Member views ordered by received time.
    async fn chain_members(&self, chain_id: Uuid) -> Result<Vec<ChainMemberView>, ChainError>;

    /// Persist the derived assessment onto the chain row and the member
    /// emails' completeness/recommended-phase fields.
    async fn save_assessment(
        &self,
        chain_id: Uuid,
        assessment: &ChainAssessment,
    ) -> Result<(), ChainError>;
}

pub struct ChainAnalyzer {
    store: Arc<dyn ChainStore>,
    thresholds: ThresholdConfig,
    cache: Mutex<LruCache<Uuid, ChainAssessment>>,
    locks: Mutex<LruCache<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChainAnalyzer {
    pub fn new(store: Arc<dyn ChainStore>, thresholds: ThresholdConfig) -> Self {
        Self {
            store,
            thresholds,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            locks: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOCK_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    /// Assign an email to its chain (creating the chain on first observation)
    /// and return the refreshed assessment. Idempotent under replay.
    pub async fn assign(
        &self,
        ctx: &OpCtx,
        email_id: Uuid,
        conversation_id: Option<&str>,
        subject: &str,
        sender_address: &str,
    ) -> Result<(Uuid, ChainAssessment), ChainError> {
        if ctx.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        let key = grouping_key(conversation_id, subject, sender_address);
        let chain = self.store.find_or_create_chain(&key).await?;

        let guard = self.chain_lock(chain.id);
        let _held = guard.lock().await;

        let attached = self.store.attach_email(email_id, chain.id).await?;
        if attached {
            debug!(request_id = %ctx.request_id, chain_id = %chain.id, email_id = %email_id, "email attached to chain");
        }
        self.invalidate(chain.id);
        let assessment = self.refresh_locked(chain.id).await?;
        Ok((chain.id, assessment))
    }

    /// Recompute a chain after one of its emails' analyses changed.
    pub async fn reassess(&self, ctx: &OpCtx, chain_id: Uuid) -> Result<ChainAssessment, ChainError> {
        if ctx.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        let guard = self.chain_lock(chain_id);
        let _held = guard.lock().await;
        self.invalidate(chain_id);
        self.refresh_locked(chain_id).await
    }

    /// Cached assessment, if the chain has not been invalidated since.
    pub fn cached(&self, chain_id: Uuid) -> Option<ChainAssessment> {
        self.cache.lock().expect("cache lock").get(&chain_id).cloned()
    }

    /// Drop the cached assessment for a chain.
    pub fn invalidate(&self, chain_id: Uuid) {
        self.cache.lock().expect("cache lock").pop(&chain_id);
    }

    async fn refresh_locked(&self, chain_id: Uuid) -> Result<ChainAssessment, ChainError> {
        let members = self.store.chain_members(chain_id).await?;
        let assessment = assess(&members, &self.thresholds);
        self.store.save_assessment(chain_id, &assessment).await?;
        self.cache
            .lock()
            .expect("cache lock")
            .put(chain_id, assessment.clone());
        Ok(assessment)
    }

    fn chain_lock(&self, chain_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("locks map");
        if let Some(existing) = locks.get(&chain_id) {
            return existing.clone();
        }
        // At the bound, drop idle locks first (strong count 1 means only the
        // map holds them; a lock some task still owns survives the prune).
        if locks.len() >= LOCK_CAPACITY {
            let idle: Vec<Uuid> = locks
                .iter()
                .filter(|(_, lock)| Arc::strong_count(lock) == 1)
                .map(|(id, _)| *id)
                .collect();
            for id in idle {
                locks.pop(&id);
            }
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.put(chain_id, lock.clone());
        lock
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().expect("locks map").len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailpipe_core::chain::ChainType;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// In-memory chain store double.
    #[derive(Default)]
    struct MemChainStore {
        chains: StdMutex<HashMap<String, Chain>>,
        members: StdMutex<HashMap<Uuid, Vec<ChainMemberView>>>,
        saved: StdMutex<Vec<(Uuid, ChainAssessment)>>,
    }

    #[async_trait]
    impl ChainStore for MemChainStore {
        async fn find_or_create_chain(&self, group_key: &str) -> Result<Chain, ChainError> {
            let mut chains = self.chains.lock().unwrap();
            let chain = chains.entry(group_key.to_string()).or_insert_with(|| Chain {
                id: Uuid::new_v4(),
                group_key: group_key.to_string(),
                chain_type: ChainType::General,
                completeness_score: 0.0,
                structural_score: 0.0,
                semantic_score: 0.0,
                email_count: 0,
                first_email_at: None,
                last_email_at: None,
                primary_workflow: None,
                recommended_phase: 1,
            });
            Ok(chain.clone())
        }

        async fn attach_email(&self, email_id: Uuid, chain_id: Uuid) -> Result<bool, ChainError> {
            let mut members = self.members.lock().unwrap();
            let list = members.entry(chain_id).or_default();
            if list.iter().any(|m| m.email_id == email_id) {
                return Ok(false);
            }
            list.push(ChainMemberView {
                email_id,
                subject: "Re: order".to_string(),
                body_preview: String::new(),
                received_at: Utc::now(),
                signals: None,
                workflow_category: None,
            });
            Ok(true)
        }

        async fn chain_members(&self, chain_id: Uuid) -> Result<Vec<ChainMemberView>, ChainError> {
            Ok(self.members.lock().unwrap().get(&chain_id).cloned().unwrap_or_default())
        }

        async fn save_assessment(
            &self,
            chain_id: Uuid,
            assessment: &ChainAssessment,
        ) -> Result<(), ChainError> {
            self.saved.lock().unwrap().push((chain_id, assessment.clone()));
            Ok(())
        }
    }

    fn analyzer(store: Arc<MemChainStore>) -> ChainAnalyzer {
        ChainAnalyzer::new(store, ThresholdConfig { mid: 0.40, high: 0.70 })
    }

    #[tokio::test]
    async fn assign_creates_chain_and_counts_once_on_replay() {
        let store = Arc::new(MemChainStore::default());
        let a = analyzer(store.clone());
        let ctx = OpCtx::new();
        let email = Uuid::new_v4();

        let (chain_id, first) = a
            .assign(&ctx, email, Some("conv-1"), "Order", "x@y.com")
            .await
            .unwrap();
        assert_eq!(first.email_count, 1);

        // Replay of the same email does not double-count.
        let (chain_id2, second) = a
            .assign(&ctx, email, Some("conv-1"), "Order", "x@y.com")
            .await
            .unwrap();
        assert_eq!(chain_id, chain_id2);
        assert_eq!(second.email_count, 1);
    }

    #[tokio::test]
    async fn cache_invalidated_when_member_added() {
        let store = Arc::new(MemChainStore::default());
        let a = analyzer(store.clone());
        let ctx = OpCtx::new();

        let (chain_id, _) = a
            .assign(&ctx, Uuid::new_v4(), Some("conv-2"), "Order", "x@y.com")
            .await
            .unwrap();
        assert_eq!(a.cached(chain_id).unwrap().email_count, 1);

        a.assign(&ctx, Uuid::new_v4(), Some("conv-2"), "Re: Order", "z@y.com")
            .await
            .unwrap();
        assert_eq!(a.cached(chain_id).unwrap().email_count, 2);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let store = Arc::new(MemChainStore::default());
        let a = analyzer(store.clone());
        let ctx = OpCtx::new();
        ctx.cancel.cancel();
        let err = a
            .assign(&ctx, Uuid::new_v4(), None, "subject", "x@y.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Cancelled));
    }

    #[tokio::test]
    async fn idle_chain_locks_are_pruned_at_the_bound() {
        let store = Arc::new(MemChainStore::default());
        let a = analyzer(store.clone());
        let ctx = OpCtx::new();
        // Touch more distinct chains than the lock bound allows; nothing
        // holds the locks between calls, so the prune keeps the map bounded.
        for i in 0..(LOCK_CAPACITY + 64) {
            a.assign(&ctx, Uuid::new_v4(), Some(&format!("conv-prune-{}", i)), "s", "x@y.com")
                .await
                .unwrap();
        }
        assert!(a.lock_count() <= LOCK_CAPACITY);
    }

    #[tokio::test]
    async fn reassess_persists_fresh_assessment() {
        let store = Arc::new(MemChainStore::default());
        let a = analyzer(store.clone());
        let ctx = OpCtx::new();
        let (chain_id, _) = a
            .assign(&ctx, Uuid::new_v4(), Some("conv-3"), "Order", "x@y.com")
            .await
            .unwrap();

        let before = store.saved.lock().unwrap().len();
        a.reassess(&ctx, chain_id).await.unwrap();
        assert_eq!(store.saved.lock().unwrap().len(), before + 1);
    }
}
