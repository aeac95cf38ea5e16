//! In-process sorted-set store. Nothing survives a restart.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::RwLock;

use super::{MemberStream, ScoredMember, SortedSetStore, StoreError};

/// `BTreeSet<(score, member)>` per key, behind a tokio `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    sets: RwLock<HashMap<String, BTreeSet<(u64, String)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members stored under `key`.
    pub async fn len(&self, key: &str) -> usize {
        self.sets.read().await.get(key).map_or(0, BTreeSet::len)
    }
}

#[async_trait]
impl SortedSetStore for MemoryStore {
    async fn append(&self, key: &str, member: &str, score: u64) -> Result<(), StoreError> {
        let mut sets = self.sets.write().await;
        sets.entry(key.to_string())
            .or_default()
            .insert((score, member.to_string()));
        Ok(())
    }

    async fn range_by_score(
        &self,
        key: &str,
        min_exclusive: u64,
    ) -> Result<MemberStream, StoreError> {
        let Some(start) = min_exclusive.checked_add(1) else {
            return Ok(stream::empty().boxed());
        };

        // Point-in-time copy; later appends are not visible to this stream.
        let members: Vec<Result<ScoredMember, StoreError>> = {
            let sets = self.sets.read().await;
            match sets.get(key) {
                Some(set) => set
                    .range((Bound::Included((start, String::new())), Bound::Unbounded))
                    .map(|(score, member)| Ok(ScoredMember::new(*score, member.clone())))
                    .collect(),
                None => Vec::new(),
            }
        };

        Ok(stream::iter(members).boxed())
    }

    async fn max_score(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .and_then(|set| set.iter().next_back())
            .map(|(score, _)| *score))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
