//! 캐시 경과 시간 기반 폴백 처리.
//!
//! 한 심볼의 캐시 가격을 다음 순서로 평가합니다:
//!
//! ```text
//! 캐시 없음 ─────────────────────────────┐
//! age ≤ fresh  ──> none / high            │
//! age ≤ stale  ──> stale / medium + 경고  │
//! age > stale  ──> 없는 것으로 취급 ──────┤
//!                                         ↓
//!                    최근 N개 이력 평균 ──> historical / low + 경고
//!                    이력 없음         ──> NoPriceAvailable
//! ```

use chrono::{DateTime, Utc};
use pricing_core::{
    mean_price, round_price, FallbackConfig, FallbackDecision, Freshness, HistoryQuery,
    PriceCacheEntry, PriceError, PriceResult,
};
use pricing_data::PriceStore;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// 이력 평균의 표시 정밀도
const AVERAGE_DECIMALS: u32 = 6;

/// 오래된 데이터 폴백 처리기.
pub struct StaleDataFallbackHandler {
    store: Arc<dyn PriceStore>,
    config: FallbackConfig,
}

impl StaleDataFallbackHandler {
    pub fn new(store: Arc<dyn PriceStore>, config: FallbackConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// 캐시 항목의 경과 시간 단계.
    pub fn classify(&self, entry: &PriceCacheEntry, now: DateTime<Utc>) -> Freshness {
        Freshness::classify(
            entry.age_at(now),
            self.config.fresh_max_age(),
            self.config.stale_max_age(),
        )
    }

    /// 캐시 항목만으로 결정할 수 있으면 결정을 반환합니다. 만료된 항목이면 None.
    pub fn decide_from_cache(
        &self,
        entry: &PriceCacheEntry,
        now: DateTime<Utc>,
    ) -> Option<FallbackDecision> {
        match self.classify(entry, now) {
            Freshness::Fresh => Some(FallbackDecision::live(entry)),
            Freshness::Stale => Some(FallbackDecision::stale(entry, entry.age_at(now))),
            Freshness::Expired => None,
        }
    }

    /// 현재 시각 기준으로 심볼의 가격을 결정합니다.
    ///
    /// `live_error`는 실시간 조회가 실패한 원인으로, 저하된 결과의 경고에 포함됩니다.
    pub async fn resolve(
        &self,
        symbol: &str,
        live_error: Option<&PriceError>,
    ) -> PriceResult<FallbackDecision> {
        self.resolve_at(symbol, live_error, Utc::now()).await
    }

    #[instrument(skip(self, live_error), fields(symbol = %symbol))]
    pub async fn resolve_at(
        &self,
        symbol: &str,
        live_error: Option<&PriceError>,
        now: DateTime<Utc>,
    ) -> PriceResult<FallbackDecision> {
        let cached = match self.store.get_cached(symbol).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "캐시 조회 실패, 캐시 없음으로 처리");
                None
            }
        };

        if let Some(entry) = &cached {
            if let Some(decision) = self.decide_from_cache(entry, now) {
                if decision.is_degraded() {
                    warn!(
                        age_minutes = entry.age_at(now).num_minutes(),
                        "stale 캐시 가격 사용"
                    );
                    return Ok(with_live_error(decision, live_error));
                }
                debug!("fresh 캐시 가격 사용");
                return Ok(decision);
            }
            debug!(
                age_hours = entry.age_at(now).num_hours(),
                "캐시 가격 만료"
            );
        }

        match self.historical_average(symbol).await? {
            Some(decision) => {
                warn!(
                    price = %decision.price,
                    "이력 평균 가격 사용"
                );
                Ok(with_live_error(decision, live_error))
            }
            None => {
                let reason = match live_error {
                    Some(err) => format!("live fetch failed ({err}) and no cached or historical data"),
                    None => "no cached or historical data".to_string(),
                };
                warn!(%reason, "사용 가능한 가격 없음");
                Err(PriceError::NoPriceAvailable {
                    symbol: symbol.to_string(),
                    reason,
                })
            }
        }
    }

    /// 최근 `history_lookback`개 이력의 산술 평균. 이력이 없으면 None.
    pub async fn historical_average(
        &self,
        symbol: &str,
    ) -> PriceResult<Option<FallbackDecision>> {
        let records = self
            .store
            .query_history(symbol, &HistoryQuery::latest(self.config.history_lookback))
            .await
            .map_err(|err| PriceError::NoPriceAvailable {
                symbol: symbol.to_string(),
                reason: format!("history unavailable: {err}"),
            })?;

        let prices: Vec<_> = records.iter().map(|r| r.price).collect();
        let Some(average) = mean_price(&prices) else {
            return Ok(None);
        };

        let latest = records.iter().map(|r| r.timestamp).max();
        Ok(Some(FallbackDecision::historical(
            symbol,
            round_price(average, AVERAGE_DECIMALS),
            records.len(),
            latest,
        )))
    }
}

fn with_live_error(decision: FallbackDecision, live_error: Option<&PriceError>) -> FallbackDecision {
    match live_error {
        Some(err) => decision.with_warning(format!("live price service unavailable: {err}")),
        None => decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pricing_core::{Confidence, FallbackLevel, PriceHistoryRecord, PriceSource};
    use pricing_data::InMemoryPriceStore;
    use rust_decimal_macros::dec;

    async fn handler_with_entry(
        age: Duration,
        history: &[rust_decimal::Decimal],
    ) -> (StaleDataFallbackHandler, DateTime<Utc>) {
        let store = Arc::new(InMemoryPriceStore::new());
        let now = Utc::now();

        let mut entry = PriceCacheEntry::new("AAPL", dec!(190), PriceSource::Primary);
        entry.last_updated = now - age;
        store.upsert_cache(&entry).await.unwrap();

        for (i, price) in history.iter().enumerate() {
            let mut record = PriceHistoryRecord::new("AAPL", *price, PriceSource::Primary);
            record.timestamp = now - Duration::days(2 + i as i64);
            store.append_history(&record).await.unwrap();
        }

        (
            StaleDataFallbackHandler::new(store, FallbackConfig::default()),
            now,
        )
    }

    #[tokio::test]
    async fn test_59_minutes_is_fresh() {
        let (handler, now) = handler_with_entry(Duration::minutes(59), &[]).await;
        let decision = handler.resolve_at("AAPL", None, now).await.unwrap();

        assert_eq!(decision.fallback_level, FallbackLevel::None);
        assert_eq!(decision.confidence, Confidence::High);
        assert_eq!(decision.price, dec!(190));
        assert!(decision.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_61_minutes_is_stale_with_warning() {
        let (handler, now) = handler_with_entry(Duration::minutes(61), &[]).await;
        let decision = handler.resolve_at("AAPL", None, now).await.unwrap();

        assert_eq!(decision.fallback_level, FallbackLevel::Stale);
        assert_eq!(decision.confidence, Confidence::Medium);
        assert_eq!(decision.source, PriceSource::Primary);
        assert_eq!(decision.warnings, vec!["data is 1 hour old".to_string()]);
    }

    #[tokio::test]
    async fn test_25_hours_with_history_is_historical() {
        let (handler, now) =
            handler_with_entry(Duration::hours(25), &[dec!(100), dec!(102), dec!(104)]).await;
        let decision = handler
            .resolve_at("AAPL", Some(&PriceError::transient("503", "down")), now)
            .await
            .unwrap();

        assert_eq!(decision.fallback_level, FallbackLevel::Historical);
        assert_eq!(decision.confidence, Confidence::Low);
        assert_eq!(decision.source, PriceSource::HistoricalAverage);
        assert_eq!(decision.price, dec!(102));
        assert_eq!(decision.warnings.len(), 2);
        assert!(decision.warnings[1].starts_with("live price service unavailable"));
    }

    #[tokio::test]
    async fn test_25_hours_without_history_is_hard_failure() {
        let (handler, now) = handler_with_entry(Duration::hours(25), &[]).await;
        let err = handler.resolve_at("AAPL", None, now).await.unwrap_err();

        assert!(matches!(err, PriceError::NoPriceAvailable { ref symbol, .. } if symbol == "AAPL"));
    }

    #[tokio::test]
    async fn test_absent_entry_uses_history_lookback() {
        let store = Arc::new(InMemoryPriceStore::new());
        let now = Utc::now();
        for (hours_ago, price) in [(1, dec!(10)), (2, dec!(20)), (3, dec!(90))] {
            let mut record = PriceHistoryRecord::new("MSFT", price, PriceSource::Secondary);
            record.timestamp = now - Duration::hours(hours_ago);
            store.append_history(&record).await.unwrap();
        }

        let config = FallbackConfig {
            history_lookback: 2,
            ..Default::default()
        };
        let handler = StaleDataFallbackHandler::new(store, config);
        let decision = handler.resolve_at("MSFT", None, now).await.unwrap();

        // 가장 최근 2개만 평균
        assert_eq!(decision.price, dec!(15));
        assert_eq!(decision.as_of, Some(now - Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_boundaries_are_inclusive() {
        let (handler, now) = handler_with_entry(Duration::hours(1), &[]).await;
        let decision = handler.resolve_at("AAPL", None, now).await.unwrap();
        assert_eq!(decision.fallback_level, FallbackLevel::None);

        let (handler, now) = handler_with_entry(Duration::hours(24), &[]).await;
        let decision = handler.resolve_at("AAPL", None, now).await.unwrap();
        assert_eq!(decision.fallback_level, FallbackLevel::Stale);
    }
}
