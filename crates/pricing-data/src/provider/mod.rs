//! 외부 시세 소스 인터페이스.
//!
//! 각 소스는 단일 심볼 조회를 구현하며, 여러 심볼을 한 번에 조회할 수 있는
//! 소스는 `supports_batch`와 `fetch_prices_batch`를 재정의합니다.

use async_trait::async_trait;
use futures::future::join_all;
use pricing_core::{Price, PriceError, PriceResult, PriceSource};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 배치 응답의 심볼별 항목.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuote {
    pub symbol: String,
    pub price: Option<Price>,
    pub error: Option<PriceError>,
}

impl SourceQuote {
    pub fn ok(symbol: impl Into<String>, price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            price: Some(price),
            error: None,
        }
    }

    pub fn err(symbol: impl Into<String>, error: PriceError) -> Self {
        Self {
            symbol: symbol.into(),
            price: None,
            error: Some(error),
        }
    }

    /// `Result`로 변환합니다. 가격과 에러가 모두 없으면 NotFound로 취급합니다.
    pub fn into_result(self) -> PriceResult<Price> {
        match (self.price, self.error) {
            (Some(price), None) => Ok(price),
            (_, Some(err)) => Err(err),
            (None, None) => Err(PriceError::not_found(self.symbol)),
        }
    }
}

/// 외부 가격 소스.
///
/// 구현체는 재시도/타임아웃/요청 한도를 직접 처리하지 않습니다.
/// 모든 에러는 `PriceError`로 분류하여 반환해야 합니다.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// 이 provider가 어떤 소스인지.
    fn source(&self) -> PriceSource;

    /// 여러 심볼을 한 번의 요청으로 조회할 수 있는지 여부.
    fn supports_batch(&self) -> bool {
        false
    }

    /// 단일 심볼의 현재가를 조회합니다.
    async fn fetch_price(&self, symbol: &str) -> PriceResult<Price>;

    /// 여러 심볼의 현재가를 조회합니다.
    ///
    /// 요청 자체가 실패하면 `Err`, 일부 심볼만 실패하면 해당 `SourceQuote`에 에러가 담깁니다.
    /// 기본 구현은 `fetch_price`를 동시에 호출합니다.
    async fn fetch_prices_batch(&self, symbols: &[String]) -> PriceResult<Vec<SourceQuote>> {
        let quotes = join_all(symbols.iter().map(|symbol| async move {
            match self.fetch_price(symbol).await {
                Ok(price) => SourceQuote::ok(symbol.clone(), price),
                Err(err) => SourceQuote::err(symbol.clone(), err),
            }
        }))
        .await;

        Ok(quotes)
    }
}

/// 추적 중인 심볼 목록 제공자 (예: 보유 종목 테이블).
#[async_trait]
pub trait TrackedSymbolRegistry: Send + Sync {
    /// 중복 없는 추적 심볼 목록.
    async fn all_tracked_symbols(&self) -> PriceResult<Vec<String>>;
}

/// 고정된 심볼 목록을 제공하는 레지스트리.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbolRegistry {
    symbols: Arc<RwLock<Vec<String>>>,
}

impl StaticSymbolRegistry {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: Arc::new(RwLock::new(dedup(symbols.into_iter().map(Into::into)))),
        }
    }

    /// 심볼 목록을 교체합니다.
    pub async fn set_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.symbols.write().await = dedup(symbols.into_iter().map(Into::into));
    }
}

fn dedup(symbols: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    symbols.filter(|s| seen.insert(s.clone())).collect()
}

#[async_trait]
impl TrackedSymbolRegistry for StaticSymbolRegistry {
    async fn all_tracked_symbols(&self) -> PriceResult<Vec<String>> {
        Ok(self.symbols.read().await.clone())
    }
}
