//! 청크 단위 배치 가격 조회.
//!
//! 심볼 목록을 고정 크기 청크로 나누어 제출 순서대로 처리합니다.
//! 각 청크는 요청 한도 확인, 타임아웃, 재시도를 거쳐 조회되며,
//! 성공한 심볼은 결과를 반환하기 전에 캐시와 이력에 기록됩니다.
//!
//! 결과 목록의 길이와 순서는 항상 입력과 같습니다.

use futures::future::join_all;
use pricing_core::{
    price_span, BatchConfig, PerSymbolResult, Price, PriceCacheEntry, PriceError,
    PriceHistoryRecord, PriceResult, PriceSource, PricingConfig,
};
use pricing_data::{PriceProvider, PriceStore, SourceQuote};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::timeout::TimeoutGuard;

/// 청크 하나가 끝날 때마다 전달되는 진행 상황.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    /// 0부터 시작하는 청크 번호
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// 지금까지 처리된 심볼 수
    pub completed: usize,
    pub total: usize,
    /// 이번 청크의 결과
    pub results: Vec<PerSymbolResult>,
}

impl ChunkProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

/// 배치 가격 조회기.
pub struct BatchPriceFetcher {
    /// 우선순위 순
    providers: Vec<Arc<dyn PriceProvider>>,
    store: Arc<dyn PriceStore>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    timeout: TimeoutGuard,
    config: BatchConfig,
}

impl BatchPriceFetcher {
    /// 새 조회기 생성. provider가 하나도 없으면 에러.
    pub fn new(
        providers: Vec<Arc<dyn PriceProvider>>,
        store: Arc<dyn PriceStore>,
        rate_limiter: Arc<RateLimiter>,
        config: &PricingConfig,
    ) -> PriceResult<Self> {
        if providers.is_empty() {
            return Err(PriceError::Config(
                "at least one price provider is required".to_string(),
            ));
        }

        Ok(Self {
            providers,
            store,
            rate_limiter,
            retry: RetryExecutor::new(RetryPolicy::from(&config.retry)),
            timeout: TimeoutGuard::new(config.timeout.request_timeout()),
            config: config.batch.clone(),
        })
    }

    /// 우선순위 순 소스 목록.
    pub fn sources(&self) -> Vec<PriceSource> {
        self.providers.iter().map(|p| p.source()).collect()
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// 단일 심볼 조회. 배치와 같은 한도/재시도/기록 경로를 사용합니다.
    pub async fn fetch_symbol(&self, symbol: &str) -> PerSymbolResult {
        let chunk = [symbol.to_string()];
        self.fetch_chunk(&chunk)
            .await
            .pop()
            .unwrap_or_else(|| PerSymbolResult::failure(symbol, PriceError::Cancelled))
    }

    /// 심볼 목록을 조회합니다. 개별 심볼의 실패는 결과에 담기며 에러로 반환되지 않습니다.
    pub async fn batch_fetch(&self, symbols: &[String]) -> Vec<PerSymbolResult> {
        self.batch_fetch_with_progress(symbols, &CancellationToken::new(), |_| async {})
            .await
    }

    /// 진행 상황 보고와 협조적 취소를 지원하는 배치 조회.
    ///
    /// 취소는 청크 경계에서만 확인합니다. 진행 중인 청크는 끝까지 처리되고,
    /// 건너뛴 청크의 심볼은 `PriceError::Cancelled` 결과로 채워집니다.
    #[instrument(skip_all, fields(symbols = symbols.len()))]
    pub async fn batch_fetch_with_progress<F, Fut>(
        &self,
        symbols: &[String],
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Vec<PerSymbolResult>
    where
        F: FnMut(ChunkProgress) -> Fut,
        Fut: Future<Output = ()>,
    {
        let started = tokio::time::Instant::now();
        let total = symbols.len();
        let chunks: Vec<&[String]> = symbols.chunks(self.config.chunk_size.max(1)).collect();
        let total_chunks = chunks.len();
        let mut results: Vec<PerSymbolResult> = Vec::with_capacity(total);

        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            if chunk_index > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.inter_batch_delay()) => {}
                }
            }
            if cancel.is_cancelled() {
                info!(
                    skipped = total - results.len(),
                    chunk = chunk_index,
                    "배치 조회 취소됨"
                );
                break;
            }

            debug!(chunk = chunk_index, size = chunk.len(), "청크 조회 시작");
            let chunk_results = self.fetch_chunk(chunk).await;
            results.extend(chunk_results.iter().cloned());

            on_chunk(ChunkProgress {
                chunk_index,
                total_chunks,
                completed: results.len(),
                total,
                results: chunk_results,
            })
            .await;
        }

        let processed = results.len();
        results.extend(
            symbols[processed..]
                .iter()
                .map(|symbol| PerSymbolResult::failure(symbol.as_str(), PriceError::Cancelled)),
        );

        let success = results.iter().filter(|r| r.is_success()).count();
        info!(
            total,
            success,
            failed = total - success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "배치 조회 완료"
        );

        results
    }

    /// 한 청크를 우선순위 순으로 provider에 요청합니다.
    ///
    /// 실패한 심볼만 다음 provider로 넘어가며, 마지막 provider의 에러가 보고됩니다.
    async fn fetch_chunk(&self, chunk: &[String]) -> Vec<PerSymbolResult> {
        let mut slots: Vec<Slot> = chunk.iter().map(|_| Slot::Pending(None)).collect();

        for (rank, provider) in self.providers.iter().enumerate() {
            let pending: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| matches!(slot, Slot::Pending(_)))
                .map(|(index, _)| index)
                .collect();
            if pending.is_empty() {
                break;
            }
            if rank > 0 {
                debug!(
                    source = %provider.source(),
                    symbols = pending.len(),
                    "다음 소스로 전환"
                );
            }

            let symbols: Vec<String> = pending.iter().map(|&i| chunk[i].clone()).collect();
            let outcomes = self.fetch_from_provider(provider, &symbols).await;

            for (index, outcome) in pending.into_iter().zip(outcomes) {
                slots[index] = match outcome {
                    Ok(price) => Slot::Done(
                        self.write_through(&chunk[index], price, provider.source())
                            .instrument(price_span!(chunk[index], provider.source()))
                            .await,
                    ),
                    Err(err) => Slot::Pending(Some(err)),
                };
            }
        }

        chunk
            .iter()
            .zip(slots)
            .map(|(symbol, slot)| match slot {
                Slot::Done(result) => result,
                Slot::Pending(Some(err)) => {
                    debug!(symbol = %symbol, error = %err, "심볼 조회 실패");
                    PerSymbolResult::failure(symbol.as_str(), err)
                }
                Slot::Pending(None) => PerSymbolResult::failure(
                    symbol.as_str(),
                    PriceError::NoPriceAvailable {
                        symbol: symbol.clone(),
                        reason: "no source attempted".to_string(),
                    },
                ),
            })
            .collect()
    }

    /// 한 provider에 대해 재시도를 포함한 조회. 결과는 `symbols` 순서입니다.
    async fn fetch_from_provider(
        &self,
        provider: &Arc<dyn PriceProvider>,
        symbols: &[String],
    ) -> Vec<PriceResult<Price>> {
        let provider = provider.as_ref();
        self.retry
            .execute_each("fetch_chunk", symbols, move |batch: Vec<String>| {
                self.fetch_attempt(provider, batch)
            })
            .await
    }

    /// 외부 요청 한 번. 요청 자체가 실패하면 `Err`로 청크 전체 실패를 나타냅니다.
    async fn fetch_attempt(
        &self,
        provider: &dyn PriceProvider,
        symbols: Vec<String>,
    ) -> PriceResult<Vec<PriceResult<Price>>> {
        let source = provider.source();

        if provider.supports_batch() {
            self.rate_limiter.check_rate_limit(source).await?;
            let quotes = self
                .timeout
                .run("fetch_prices_batch", provider.fetch_prices_batch(&symbols))
                .await?;
            return Ok(align_quotes(&symbols, quotes));
        }

        // 단일 조회 fan-out: 허용된 만큼만 보내고 나머지는 한도 에러로 남김
        let permits = self
            .rate_limiter
            .acquire_up_to(source, symbols.len() as u32)
            .await?;
        let granted = (permits.granted as usize).min(symbols.len());
        let (allowed, throttled) = symbols.split_at(granted);

        let mut outcomes = join_all(allowed.iter().map(|symbol| {
            self.timeout
                .run("fetch_price", provider.fetch_price(symbol))
                .instrument(price_span!(symbol, source))
        }))
        .await;

        if let Some(denied) = permits.denied {
            outcomes.extend(throttled.iter().map(|_| Err(denied.clone())));
        }

        if !outcomes.is_empty() && outcomes.iter().all(|o| o.is_err()) {
            if let Some(Err(first)) = outcomes.first() {
                // 모든 심볼이 같은 재시도 가능 에러면 청크 전체 장애로 취급
                if first.is_retryable()
                    && outcomes.iter().all(|o| o.as_ref().err() == Some(first))
                {
                    return Err(first.clone());
                }
            }
        }

        Ok(outcomes)
    }

    /// 조회 성공 결과를 캐시와 이력에 기록합니다.
    ///
    /// 기록 실패는 경고로만 남기며 성공 결과는 유지됩니다.
    async fn write_through(
        &self,
        symbol: &str,
        price: Price,
        source: PriceSource,
    ) -> PerSymbolResult {
        let entry = PriceCacheEntry::new(symbol, price, source);
        let mut result = PerSymbolResult::success(symbol, price, source);

        if let Err(err) = self.store.upsert_cache(&entry).await {
            let err = PriceError::from(err);
            warn!(symbol, error = %err, "캐시 기록 실패");
            result.warnings.push(err.to_string());
        }
        if let Err(err) = self
            .store
            .append_history(&PriceHistoryRecord::from(&entry))
            .await
        {
            let err = PriceError::from(err);
            warn!(symbol, error = %err, "가격 이력 기록 실패");
            result.warnings.push(err.to_string());
        }

        debug!(symbol, price = %price, source = %source, "가격 갱신됨");
        result
    }
}

enum Slot {
    /// 아직 성공하지 못함 (마지막 에러)
    Pending(Option<PriceError>),
    Done(PerSymbolResult),
}

/// 배치 응답을 요청 순서에 맞춥니다. 응답에 없는 심볼은 NotFound.
fn align_quotes(symbols: &[String], quotes: Vec<SourceQuote>) -> Vec<PriceResult<Price>> {
    let by_symbol: HashMap<String, SourceQuote> = quotes
        .into_iter()
        .map(|quote| (quote.symbol.clone(), quote))
        .collect();

    symbols
        .iter()
        .map(|symbol| match by_symbol.get(symbol) {
            Some(quote) => quote.clone().into_result(),
            None => Err(PriceError::not_found(symbol.as_str())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricing_core::{ErrorKind, RateLimitConfig, RateLimitsConfig};
    use pricing_data::testing::{FlakyPriceStore, ScriptedPriceProvider};
    use pricing_data::InMemoryPriceStore;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::time::Instant;

    fn test_config() -> PricingConfig {
        let mut config = PricingConfig::default();
        config.batch.chunk_size = 2;
        config.batch.inter_batch_delay_ms = 1000;
        config.retry.base_delay_ms = 100;
        config.timeout.request_timeout_ms = 500;

        let mut limits = HashMap::new();
        for source in PriceSource::LIVE {
            limits.insert(source, RateLimitConfig::new(100, 1000, 10_000));
        }
        config.rate_limits = RateLimitsConfig(limits);
        config
    }

    fn fetcher(
        providers: Vec<Arc<ScriptedPriceProvider>>,
        store: Arc<dyn PriceStore>,
        config: &PricingConfig,
    ) -> BatchPriceFetcher {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn PriceProvider>)
            .collect();
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        BatchPriceFetcher::new(providers, store, limiter, config).unwrap()
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_keeps_all_results() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(10))
                .with_price("C", dec!(30))
                .with_failure("B", PriceError::permanent("500", "upstream exploded")),
        );
        let store = Arc::new(InMemoryPriceStore::new());
        let fetcher = fetcher(vec![provider], store.clone(), &test_config());

        let results = fetcher.batch_fetch(&symbols(&["A", "B", "C"])).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.error.is_some()).count(), 1);
        assert_eq!(results[0].price, Some(dec!(10)));
        assert_eq!(results[1].symbol, "B");
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Upstream));
        assert_eq!(results[2].price, Some(dec!(30)));
        assert_eq!(store.stats().cache_upserts, 2);
        assert_eq!(store.stats().history_appends, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_run_in_order_with_delay() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(1))
                .with_price("B", dec!(2))
                .with_price("C", dec!(3))
                .with_price("D", dec!(4))
                .with_price("E", dec!(5)),
        );
        let fetcher = fetcher(
            vec![provider],
            Arc::new(InMemoryPriceStore::new()),
            &test_config(),
        );

        let started = Instant::now();
        let mut seen = Vec::new();
        let results = fetcher
            .batch_fetch_with_progress(
                &symbols(&["A", "B", "C", "D", "E"]),
                &CancellationToken::new(),
                |progress| {
                    seen.push((progress.chunk_index, progress.completed, progress.total_chunks));
                    async {}
                },
            )
            .await;

        assert!(results.iter().all(PerSymbolResult::is_success));
        assert_eq!(seen, vec![(0, 2, 3), (1, 4, 3), (2, 5, 3)]);
        // 청크 사이 지연 두 번
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_outage_is_retried_once_per_chunk() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_batch_support()
                .with_price("A", dec!(1))
                .with_price("B", dec!(2)),
        );
        provider.set_outage(Some(PriceError::transient("network", "connection refused")));

        let fetcher = fetcher(
            vec![provider.clone()],
            Arc::new(InMemoryPriceStore::new()),
            &test_config(),
        );
        let results = fetcher.batch_fetch(&symbols(&["A", "B"])).await;

        // 심볼 수가 아니라 시도 횟수만큼만 요청
        assert_eq!(provider.batch_calls(), 3);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error, results[1].error);
        assert!(matches!(
            results[0].error,
            Some(PriceError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_outage_fails_whole_chunk() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary).with_price("A", dec!(1)),
        );
        provider.set_outage(Some(PriceError::transient("network", "connection refused")));

        let fetcher = fetcher(
            vec![provider.clone()],
            Arc::new(InMemoryPriceStore::new()),
            &test_config(),
        );
        let results = fetcher.batch_fetch(&symbols(&["A", "B"])).await;

        assert_eq!(provider.calls_for("A"), 3);
        assert_eq!(provider.calls_for("B"), 3);
        assert_eq!(results[0].error, results[1].error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_symbol_recovers_on_retry() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(1))
                .with_price("B", dec!(2))
                .failing_times("B", 1, PriceError::transient("503", "busy")),
        );
        let fetcher = fetcher(
            vec![provider.clone()],
            Arc::new(InMemoryPriceStore::new()),
            &test_config(),
        );

        let results = fetcher.batch_fetch(&symbols(&["A", "B"])).await;

        assert!(results.iter().all(PerSymbolResult::is_success));
        assert_eq!(provider.calls_for("A"), 1);
        assert_eq!(provider.calls_for("B"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_symbol_times_out_alone() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(1))
                .with_price("B", dec!(2))
                .with_delay("B", Duration::from_secs(60)),
        );
        let mut config = test_config();
        config.retry.max_retries = 1;
        let fetcher = fetcher(vec![provider], Arc::new(InMemoryPriceStore::new()), &config);

        let results = fetcher.batch_fetch(&symbols(&["A", "B"])).await;

        assert!(results[0].is_success());
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_to_secondary() {
        let primary = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(1))
                .with_failure("B", PriceError::not_found("B")),
        );
        let secondary = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Secondary).with_price("B", dec!(2.5)),
        );
        let store = Arc::new(InMemoryPriceStore::new());
        let fetcher = fetcher(
            vec![primary, secondary.clone()],
            store.clone(),
            &test_config(),
        );

        let results = fetcher.batch_fetch(&symbols(&["A", "B"])).await;

        assert_eq!(results[0].source, Some(PriceSource::Primary));
        assert_eq!(results[1].source, Some(PriceSource::Secondary));
        assert_eq!(secondary.calls_for("A"), 0);
        let cached = store.get_cached("B").await.unwrap().unwrap();
        assert_eq!(cached.source, PriceSource::Secondary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_write_failure_is_warning() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary).with_price("A", dec!(1)),
        );
        let store = Arc::new(FlakyPriceStore::new());
        store.fail_cache_writes(true);
        let fetcher = fetcher(vec![provider], store.clone(), &test_config());

        let result = fetcher.fetch_symbol("A").await;

        assert!(result.is_success());
        assert_eq!(result.price, Some(dec!(1)));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("Cache write failed"));
        // 이력은 기록됨
        assert_eq!(store.inner().history_len().await, 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_symbol_events_carry_price_span() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary).with_price("AAPL", dec!(190)),
        );
        let store = Arc::new(FlakyPriceStore::new());
        store.fail_cache_writes(true);
        let fetcher = fetcher(vec![provider], store, &test_config());

        assert!(fetcher.fetch_symbol("AAPL").await.is_success());

        let output = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        let cache_warning = output
            .lines()
            .find(|line| line.contains("캐시 기록 실패"))
            .unwrap_or_else(|| panic!("no cache warning in:\n{output}"));
        assert!(cache_warning.contains("price{symbol=AAPL source=primary}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_remaining_chunks() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(1))
                .with_price("B", dec!(2))
                .with_price("C", dec!(3)),
        );
        let fetcher = fetcher(
            vec![provider.clone()],
            Arc::new(InMemoryPriceStore::new()),
            &test_config(),
        );

        let cancel = CancellationToken::new();
        let results = fetcher
            .batch_fetch_with_progress(&symbols(&["A", "B", "C"]), &cancel, |_| {
                cancel.cancel();
                async {}
            })
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert!(results[1].is_success());
        assert_eq!(results[2].error, Some(PriceError::Cancelled));
        assert_eq!(provider.calls_for("C"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_respects_burst_limit() {
        let provider = Arc::new(
            ScriptedPriceProvider::new(PriceSource::Primary)
                .with_price("A", dec!(1))
                .with_price("B", dec!(2))
                .with_price("C", dec!(3)),
        );
        let mut config = test_config();
        config.batch.chunk_size = 3;
        let mut limits = HashMap::new();
        limits.insert(PriceSource::Primary, RateLimitConfig::new(2, 30, 500));
        config.rate_limits = RateLimitsConfig(limits);
        let fetcher = fetcher(
            vec![provider.clone()],
            Arc::new(InMemoryPriceStore::new()),
            &config,
        );

        let started = Instant::now();
        let results = fetcher.batch_fetch(&symbols(&["A", "B", "C"])).await;

        assert!(results.iter().all(PerSymbolResult::is_success));
        // C는 버스트 윈도우 리셋을 기다린 뒤 조회
        assert_eq!(provider.calls_for("C"), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_requires_provider() {
        let config = PricingConfig::default();
        let result = BatchPriceFetcher::new(
            Vec::new(),
            Arc::new(InMemoryPriceStore::new()),
            Arc::new(RateLimiter::new(&config.rate_limits)),
            &config,
        );
        assert!(matches!(result, Err(PriceError::Config(_))));
    }
}
