//! 폴백 결정 값 객체.
//!
//! 호출자는 항상 받은 가격의 신뢰도를 알 수 있어야 합니다.
//! 오래된 가격을 최신 가격처럼 반환하면 평가 금액 계산이 오염됩니다.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::price::{PriceCacheEntry, PriceSource};
use crate::types::Price;

/// 캐시 가격의 경과 시간 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// fresh 임계치 이하
    Fresh,
    /// fresh 임계치 초과, stale 임계치 이하
    Stale,
    /// stale 임계치 초과 (없는 것으로 취급)
    Expired,
}

impl Freshness {
    /// 경과 시간을 단계로 분류합니다. 경계값은 낮은 단계에 포함됩니다.
    pub fn classify(age: Duration, fresh_max: Duration, stale_max: Duration) -> Self {
        if age <= fresh_max {
            Freshness::Fresh
        } else if age <= stale_max {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// 가격 요청을 만족시킨 폴백 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackLevel {
    None,
    Stale,
    Historical,
}

/// 반환된 가격의 신뢰도.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// 호출자에게 반환되는 가격 결정. 저장되지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackDecision {
    pub symbol: String,
    pub price: Price,
    pub source: PriceSource,
    pub fallback_level: FallbackLevel,
    pub confidence: Confidence,
    /// 사람이 읽을 수 있는 경고 (저하된 경우에만)
    pub warnings: Vec<String>,
    /// 가격이 관측된 시각 (이력 평균이면 가장 최근 레코드 시각)
    pub as_of: Option<DateTime<Utc>>,
}

impl FallbackDecision {
    /// 실시간으로 조회했거나 fresh 캐시에서 가져온 가격.
    pub fn live(entry: &PriceCacheEntry) -> Self {
        Self {
            symbol: entry.symbol.clone(),
            price: entry.price,
            source: entry.source,
            fallback_level: FallbackLevel::None,
            confidence: Confidence::High,
            warnings: Vec::new(),
            as_of: Some(entry.last_updated),
        }
    }

    /// stale 캐시 가격. 경과 시간 경고가 포함됩니다.
    pub fn stale(entry: &PriceCacheEntry, age: Duration) -> Self {
        Self {
            symbol: entry.symbol.clone(),
            price: entry.price,
            source: entry.source,
            fallback_level: FallbackLevel::Stale,
            confidence: Confidence::Medium,
            warnings: vec![format!("data is {} old", describe_age(age))],
            as_of: Some(entry.last_updated),
        }
    }

    /// 가격 이력 평균.
    pub fn historical(
        symbol: impl Into<String>,
        average: Price,
        sample_size: usize,
        latest: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price: average,
            source: PriceSource::HistoricalAverage,
            fallback_level: FallbackLevel::Historical,
            confidence: Confidence::Low,
            warnings: vec![format!(
                "using historical average of {} records, live price unavailable",
                sample_size
            )],
            as_of: latest,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// 저하된(degraded) 결과인지 확인합니다.
    pub fn is_degraded(&self) -> bool {
        self.fallback_level != FallbackLevel::None
    }
}

/// 경과 시간을 "N minutes" / "N hours" 형태로 표현합니다.
pub fn describe_age(age: Duration) -> String {
    let minutes = age.num_minutes();
    if minutes < 60 {
        return plural(minutes, "minute");
    }
    plural(age.num_hours(), "hour")
}

fn plural(value: i64, unit: &str) -> String {
    if value == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", value, unit)
    }
}
