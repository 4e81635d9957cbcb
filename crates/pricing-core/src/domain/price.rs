//! 가격 캐시 및 이력 도메인 타입.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::Price;

/// 가격 데이터의 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// 1순위 외부 시세 소스
    Primary,
    /// 2순위 외부 시세 소스 (Primary 실패 시 사용)
    Secondary,
    /// 가격 이력의 산술 평균 (실시간 가격 없음)
    HistoricalAverage,
}

impl PriceSource {
    /// 외부에서 실시간으로 조회하는 소스 목록 (우선순위 순).
    pub const LIVE: [PriceSource; 2] = [PriceSource::Primary, PriceSource::Secondary];

    pub const fn as_str(self) -> &'static str {
        match self {
            PriceSource::Primary => "primary",
            PriceSource::Secondary => "secondary",
            PriceSource::HistoricalAverage => "historical_average",
        }
    }

    /// 외부 API에서 실시간으로 가져온 가격인지 확인합니다.
    pub fn is_live(self) -> bool {
        !matches!(self, PriceSource::HistoricalAverage)
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "historical_average" => Ok(Self::HistoricalAverage),
            _ => Err(format!("Unknown price source: {}", s)),
        }
    }
}

/// 심볼당 하나만 존재하는 현재가 캐시 항목.
///
/// upsert 시맨틱을 따르며 가장 마지막 쓰기가 유지됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceCacheEntry {
    pub symbol: String,
    pub price: Price,
    pub source: PriceSource,
    pub last_updated: DateTime<Utc>,
}

impl PriceCacheEntry {
    /// 현재 시각 기준의 새 캐시 항목을 생성합니다.
    pub fn new(symbol: impl Into<String>, price: Price, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            source,
            last_updated: Utc::now(),
        }
    }

    /// `now` 기준 항목의 경과 시간. 미래 시각이면 0으로 취급합니다.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_updated).max(Duration::zero())
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }
}

/// 추가 전용(append-only) 가격 이력 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryRecord {
    pub symbol: String,
    pub price: Price,
    pub source: PriceSource,
    pub timestamp: DateTime<Utc>,
}

impl PriceHistoryRecord {
    pub fn new(symbol: impl Into<String>, price: Price, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            source,
            timestamp: Utc::now(),
        }
    }
}

impl From<&PriceCacheEntry> for PriceHistoryRecord {
    fn from(entry: &PriceCacheEntry) -> Self {
        Self {
            symbol: entry.symbol.clone(),
            price: entry.price,
            source: entry.source,
            timestamp: entry.last_updated,
        }
    }
}

/// 가격 이력 조회 조건.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    /// 시작 시각 (포함)
    pub from: Option<DateTime<Utc>>,
    /// 종료 시각 (포함)
    pub to: Option<DateTime<Utc>>,
    /// 최대 레코드 수 (최신순)
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// 최근 `limit`개 레코드 조회.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            limit: None,
        }
    }

    /// 레코드가 시간 범위 조건을 만족하는지 확인합니다.
    pub fn matches(&self, record: &PriceHistoryRecord) -> bool {
        self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
    }
}
