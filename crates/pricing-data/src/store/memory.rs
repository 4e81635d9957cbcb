//! 인메모리 가격 저장소.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricing_core::{HistoryQuery, PriceCacheEntry, PriceHistoryRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::PriceStore;
use crate::error::Result;

/// 저장소 작업 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub cache_upserts: u64,
    pub history_appends: u64,
}

/// 프로세스 메모리에 보관하는 `PriceStore`.
///
/// 재시작 시 내용이 사라지므로 임베딩/테스트 용도입니다.
#[derive(Default)]
pub struct InMemoryPriceStore {
    cache: RwLock<HashMap<String, PriceCacheEntry>>,
    history: RwLock<HashMap<String, Vec<PriceHistoryRecord>>>,
    cache_upserts: AtomicU64,
    history_appends: AtomicU64,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            cache_upserts: self.cache_upserts.load(Ordering::Relaxed),
            history_appends: self.history_appends.load(Ordering::Relaxed),
        }
    }

    /// 캐시된 심볼 수.
    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// 전체 이력 레코드 수.
    pub async fn history_len(&self) -> usize {
        self.history.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn get_cached(&self, symbol: &str) -> Result<Option<PriceCacheEntry>> {
        Ok(self.cache.read().await.get(symbol).cloned())
    }

    async fn upsert_cache(&self, entry: &PriceCacheEntry) -> Result<()> {
        self.cache
            .write()
            .await
            .insert(entry.symbol.clone(), entry.clone());
        self.cache_upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn append_history(&self, record: &PriceHistoryRecord) -> Result<()> {
        let mut history = self.history.write().await;
        let records = history.entry(record.symbol.clone()).or_default();

        // 시간순 유지 (대부분 끝에 추가됨)
        let position = records.partition_point(|r| r.timestamp <= record.timestamp);
        records.insert(position, record.clone());

        self.history_appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn query_history(
        &self,
        symbol: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<PriceHistoryRecord>> {
        let history = self.history.read().await;
        let Some(records) = history.get(symbol) else {
            return Ok(Vec::new());
        };

        let matched = records
            .iter()
            .rev()
            .filter(|record| query.matches(record))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(matched)
    }

    async fn delete_history_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut history = self.history.write().await;
        let mut deleted = 0u64;

        for records in history.values_mut() {
            let before = records.len();
            records.retain(|r| r.timestamp >= cutoff);
            deleted += (before - records.len()) as u64;
        }
        history.retain(|_, records| !records.is_empty());

        debug!(deleted, cutoff = %cutoff, "오래된 가격 이력 삭제");
        Ok(deleted)
    }

    async fn cached_entries(&self) -> Result<Vec<PriceCacheEntry>> {
        Ok(self.cache.read().await.values().cloned().collect())
    }
}
