//! 가격 저장소.
//!
//! 심볼당 하나의 현재가 캐시와 추가 전용 가격 이력을 다룹니다.
//! 저장 기술은 이 트레이트 뒤에 숨겨지며, 엔진은 읽기/쓰기 인터페이스만 사용합니다.

mod memory;

pub use memory::{InMemoryPriceStore, StoreStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricing_core::{HistoryQuery, PriceCacheEntry, PriceHistoryRecord};

use crate::error::Result;

/// 가격 캐시 + 이력 저장소.
///
/// 여러 호출자(백그라운드/실시간 갱신)가 동시에 쓸 수 있으며,
/// 심볼 키 기준 upsert이므로 마지막 쓰기가 유지됩니다.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// 심볼의 현재가 캐시를 조회합니다.
    async fn get_cached(&self, symbol: &str) -> Result<Option<PriceCacheEntry>>;

    /// 현재가 캐시를 삽입하거나 덮어씁니다.
    async fn upsert_cache(&self, entry: &PriceCacheEntry) -> Result<()>;

    /// 가격 이력 레코드를 추가합니다. 기존 레코드는 수정되지 않습니다.
    async fn append_history(&self, record: &PriceHistoryRecord) -> Result<()>;

    /// 심볼의 가격 이력을 최신순으로 조회합니다.
    async fn query_history(
        &self,
        symbol: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<PriceHistoryRecord>>;

    /// `cutoff` 이전의 이력을 삭제하고 삭제된 건수를 반환합니다.
    async fn delete_history_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// 캐시된 모든 항목 (헬스 체크용).
    async fn cached_entries(&self) -> Result<Vec<PriceCacheEntry>>;
}
