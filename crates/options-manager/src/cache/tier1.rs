use algo_trade_core::{PnlSnapshot, PnlTier1Store};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// In-process Tier 1, for paper sessions and tests.
#[derive(Debug, Default)]
pub struct InMemoryTier1 {
    entries: DashMap<i64, PnlSnapshot>,
}

impl InMemoryTier1 {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PnlTier1Store for InMemoryTier1 {
    async fn put(&self, snapshot: &PnlSnapshot) -> Result<()> {
        self.entries.insert(snapshot.position_id, snapshot.clone());
        Ok(())
    }

    async fn get(&self, position_id: i64) -> Result<Option<PnlSnapshot>> {
        Ok(self.entries.get(&position_id).map(|e| e.value().clone()))
    }

    async fn remove(&self, position_id: i64) -> Result<()> {
        self.entries.remove(&position_id);
        Ok(())
    }

    async fn position_ids(&self) -> Result<Vec<i64>> {
        Ok(self.entries.iter().map(|e| *e.key()).collect())
    }
}
