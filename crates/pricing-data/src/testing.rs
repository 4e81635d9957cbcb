//! 테스트용 provider/store 구현.
//!
//! `test-util` feature 또는 단위 테스트에서만 컴파일됩니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricing_core::{
    HistoryQuery, Price, PriceCacheEntry, PriceError, PriceHistoryRecord, PriceResult,
    PriceSource,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::provider::{PriceProvider, SourceQuote};
use crate::store::{InMemoryPriceStore, PriceStore};

#[derive(Default)]
struct Script {
    prices: HashMap<String, Price>,
    failures: HashMap<String, PriceError>,
    fail_times: HashMap<String, (u32, PriceError)>,
    batch_failures: VecDeque<PriceError>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    outage: Option<PriceError>,
    calls: HashMap<String, u32>,
}

/// 응답을 미리 정해둘 수 있는 가짜 시세 소스.
pub struct ScriptedPriceProvider {
    source: PriceSource,
    batch: bool,
    script: Mutex<Script>,
    fetch_calls: AtomicU32,
    batch_calls: AtomicU32,
}

impl ScriptedPriceProvider {
    pub fn new(source: PriceSource) -> Self {
        Self {
            source,
            batch: false,
            script: Mutex::new(Script::default()),
            fetch_calls: AtomicU32::new(0),
            batch_calls: AtomicU32::new(0),
        }
    }

    /// 네이티브 배치 조회를 지원하는 소스로 설정.
    pub fn with_batch_support(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn with_price(self, symbol: &str, price: Price) -> Self {
        self.set_price(symbol, price);
        self
    }

    /// 해당 심볼은 항상 `error`로 실패.
    pub fn with_failure(self, symbol: &str, error: PriceError) -> Self {
        self.lock().failures.insert(symbol.to_string(), error);
        self
    }

    /// 처음 `times`번은 `error`로 실패한 뒤 정상 응답.
    pub fn failing_times(self, symbol: &str, times: u32, error: PriceError) -> Self {
        self.lock()
            .fail_times
            .insert(symbol.to_string(), (times, error));
        self
    }

    /// 다음 배치 요청들을 순서대로 실패시킴.
    pub fn with_batch_failures(self, errors: impl IntoIterator<Item = PriceError>) -> Self {
        self.lock().batch_failures.extend(errors);
        self
    }

    pub fn with_delay(self, symbol: &str, delay: Duration) -> Self {
        self.lock().delays.insert(symbol.to_string(), delay);
        self
    }

    pub fn with_default_delay(self, delay: Duration) -> Self {
        self.lock().default_delay = Some(delay);
        self
    }

    pub fn set_price(&self, symbol: &str, price: Price) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    /// 소스 전체 장애를 설정하거나 해제합니다.
    pub fn set_outage(&self, error: Option<PriceError>) {
        self.lock().outage = error;
    }

    /// `fetch_price` 호출 횟수 (배치 내부 호출 포함).
    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> u32 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// 심볼별 조회 횟수.
    pub fn calls_for(&self, symbol: &str) -> u32 {
        self.lock().calls.get(symbol).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delay_for(&self, symbol: &str) -> Option<Duration> {
        let script = self.lock();
        script.delays.get(symbol).copied().or(script.default_delay)
    }

    fn respond(&self, symbol: &str) -> PriceResult<Price> {
        let mut script = self.lock();
        *script.calls.entry(symbol.to_string()).or_default() += 1;

        if let Some(err) = &script.outage {
            return Err(err.clone());
        }
        if let Some((remaining, err)) = script.fail_times.get_mut(symbol) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        if let Some(err) = script.failures.get(symbol) {
            return Err(err.clone());
        }
        script
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| PriceError::not_found(symbol))
    }
}

#[async_trait]
impl PriceProvider for ScriptedPriceProvider {
    fn source(&self) -> PriceSource {
        self.source
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn fetch_price(&self, symbol: &str) -> PriceResult<Price> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay_for(symbol) {
            tokio::time::sleep(delay).await;
        }
        self.respond(symbol)
    }

    async fn fetch_prices_batch(&self, symbols: &[String]) -> PriceResult<Vec<SourceQuote>> {
        if !self.batch {
            let quotes = futures::future::join_all(symbols.iter().map(|symbol| async move {
                match self.fetch_price(symbol).await {
                    Ok(price) => SourceQuote::ok(symbol.clone(), price),
                    Err(err) => SourceQuote::err(symbol.clone(), err),
                }
            }))
            .await;
            return Ok(quotes);
        }

        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = symbols.iter().filter_map(|s| self.delay_for(s)).max();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut script = self.lock();
            if let Some(err) = &script.outage {
                return Err(err.clone());
            }
            if let Some(err) = script.batch_failures.pop_front() {
                return Err(err);
            }
        }

        Ok(symbols
            .iter()
            .map(|symbol| match self.respond(symbol) {
                Ok(price) => SourceQuote::ok(symbol.clone(), price),
                Err(err) => SourceQuote::err(symbol.clone(), err),
            })
            .collect())
    }
}

/// 쓰기/읽기 실패를 주입할 수 있는 저장소.
#[derive(Default)]
pub struct FlakyPriceStore {
    inner: InMemoryPriceStore,
    fail_cache_writes: AtomicBool,
    fail_history_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FlakyPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryPriceStore {
        &self.inner
    }

    pub fn fail_cache_writes(&self, fail: bool) {
        self.fail_cache_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_history_writes(&self, fail: bool) {
        self.fail_history_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PriceStore for FlakyPriceStore {
    async fn get_cached(&self, symbol: &str) -> Result<Option<PriceCacheEntry>> {
        self.check_read()?;
        self.inner.get_cached(symbol).await
    }

    async fn upsert_cache(&self, entry: &PriceCacheEntry) -> Result<()> {
        if self.fail_cache_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("injected cache write failure".to_string()));
        }
        self.inner.upsert_cache(entry).await
    }

    async fn append_history(&self, record: &PriceHistoryRecord) -> Result<()> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed(
                "injected history write failure".to_string(),
            ));
        }
        self.inner.append_history(record).await
    }

    async fn query_history(
        &self,
        symbol: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<PriceHistoryRecord>> {
        self.check_read()?;
        self.inner.query_history(symbol, query).await
    }

    async fn delete_history_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_history_older_than(cutoff).await
    }

    async fn cached_entries(&self) -> Result<Vec<PriceCacheEntry>> {
        self.check_read()?;
        self.inner.cached_entries().await
    }
}
