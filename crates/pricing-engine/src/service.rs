//! 애플리케이션에 노출되는 가격 서비스 파사드.
//!
//! 요청 한도, 재시도, 폴백, 갱신 서비스를 하나로 묶어 다음을 제공합니다:
//! - 폴백을 포함한 단일 심볼 가격 조회
//! - 배치 가격 조회
//! - 실시간 갱신 작업 시작/조회/취소
//! - 가격 이력 조회
//! - 상태 점검

use chrono::Utc;
use pricing_core::{
    init_logging, FallbackDecision, Freshness, HistoryQuery, PerSymbolResult, PriceCacheEntry, PriceError,
    PriceHistoryRecord, PriceResult, PriceSource, PricingConfig,
};
use pricing_data::{PriceProvider, PriceStore, TrackedSymbolRegistry};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch::BatchPriceFetcher;
use crate::fallback::StaleDataFallbackHandler;
use crate::rate_limiter::{RateLimitStatus, RateLimiter};
use crate::refresh::{
    BackgroundRefreshService, RealTimeRefreshService, RefreshJob, RefreshOptions, ServiceHealth,
};

/// 전체 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// 소스별 상태.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: PriceSource,
    /// 요청 한도가 남아 있는지
    pub available: bool,
    pub rate_limit: Option<RateLimitStatus>,
}

/// `check_pricing_service_health` 결과.
#[derive(Debug, Clone, Serialize)]
pub struct PricingHealth {
    pub status: HealthStatus,
    pub per_source: Vec<SourceHealth>,
    pub rate_limits: Vec<RateLimitStatus>,
    pub background: ServiceHealth,
    pub issues: Vec<String>,
}

struct Maintenance {
    shutdown: CancellationToken,
    cleanup: JoinHandle<()>,
}

/// 가격 서비스.
pub struct PricingService {
    config: PricingConfig,
    store: Arc<dyn PriceStore>,
    rate_limiter: Arc<RateLimiter>,
    fetcher: Arc<BatchPriceFetcher>,
    fallback: StaleDataFallbackHandler,
    background: BackgroundRefreshService,
    realtime: Arc<RealTimeRefreshService>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl PricingService {
    /// 서비스 구성. 설정이 유효하지 않거나 provider가 없으면 에러.
    ///
    /// `providers`는 우선순위 순서입니다.
    pub fn new(
        config: PricingConfig,
        providers: Vec<Arc<dyn PriceProvider>>,
        store: Arc<dyn PriceStore>,
        registry: Arc<dyn TrackedSymbolRegistry>,
    ) -> PriceResult<Self> {
        config.validate()?;

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let fetcher = Arc::new(BatchPriceFetcher::new(
            providers,
            store.clone(),
            rate_limiter.clone(),
            &config,
        )?);
        let fallback = StaleDataFallbackHandler::new(store.clone(), config.fallback.clone());
        let background = BackgroundRefreshService::new(fetcher.clone(), registry.clone(), &config);
        let realtime = Arc::new(RealTimeRefreshService::new(
            fetcher.clone(),
            registry,
            &config,
        ));

        info!(sources = ?fetcher.sources(), "가격 서비스 초기화 완료");

        Ok(Self {
            config,
            store,
            rate_limiter,
            fetcher,
            fallback,
            background,
            realtime,
            maintenance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    pub fn background(&self) -> &BackgroundRefreshService {
        &self.background
    }

    pub fn realtime(&self) -> &Arc<RealTimeRefreshService> {
        &self.realtime
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// 백그라운드 갱신과 작업 정리 태스크를 시작합니다.
    ///
    /// 전역 subscriber가 없으면 설정의 `logging` 섹션으로 설치합니다.
    pub async fn start(&self) -> PriceResult<()> {
        if !init_logging(&self.config.logging)? {
            debug!("기존 로깅 subscriber 사용");
        }
        self.background.start_default().await?;

        let mut maintenance = self.maintenance.lock().await;
        if maintenance.is_none() {
            let shutdown = CancellationToken::new();
            let cleanup = self.realtime.spawn_cleanup_loop(shutdown.clone());
            *maintenance = Some(Maintenance { shutdown, cleanup });
        }
        Ok(())
    }

    /// 실행 중인 태스크를 모두 중단합니다.
    pub async fn stop(&self) {
        self.background.stop().await;

        if let Some(maintenance) = self.maintenance.lock().await.take() {
            maintenance.shutdown.cancel();
            if let Err(e) = maintenance.cleanup.await {
                warn!(error = %e, "작업 정리 태스크 종료 실패");
            }
        }
        info!("가격 서비스 중지됨");
    }

    /// 폴백을 포함한 단일 심볼 가격.
    ///
    /// `force_refresh`가 false이고 캐시가 fresh면 소스를 호출하지 않습니다.
    /// 실시간 조회가 실패하면 stale 캐시, 이력 평균 순으로 대체하며,
    /// 그것도 없을 때만 에러를 반환합니다.
    #[instrument(skip(self))]
    pub async fn get_price_with_fallback(
        &self,
        symbol: &str,
        force_refresh: bool,
    ) -> PriceResult<FallbackDecision> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(PriceError::InvalidInput("symbol must not be empty".to_string()));
        }

        if !force_refresh {
            match self.store.get_cached(symbol).await {
                Ok(Some(entry))
                    if self.fallback.classify(&entry, Utc::now()) == Freshness::Fresh =>
                {
                    debug!("fresh 캐시 적중");
                    return Ok(FallbackDecision::live(&entry));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "캐시 조회 실패, 실시간 조회로 진행"),
            }
        }

        let result = self.fetcher.fetch_symbol(symbol).await;
        match (result.price, result.source) {
            (Some(price), Some(source)) if result.error.is_none() => {
                let entry = PriceCacheEntry::new(symbol, price, source);
                Ok(result
                    .warnings
                    .into_iter()
                    .fold(FallbackDecision::live(&entry), |decision, warning| {
                        decision.with_warning(warning)
                    }))
            }
            _ => {
                let live_error = result
                    .error
                    .unwrap_or_else(|| PriceError::not_found(symbol));
                warn!(error = %live_error, "실시간 가격 조회 실패, 폴백 결정");
                self.fallback.resolve(symbol, Some(&live_error)).await
            }
        }
    }

    /// 배치 가격 조회. 결과는 입력과 같은 길이와 순서입니다.
    pub async fn batch_get_prices(&self, symbols: &[String]) -> Vec<PerSymbolResult> {
        self.fetcher.batch_fetch(symbols).await
    }

    pub async fn start_refresh(&self, options: RefreshOptions) -> String {
        self.realtime.start_refresh(options).await
    }

    pub async fn get_refresh_status(&self, request_id: &str) -> Option<RefreshJob> {
        self.realtime.get_refresh_status(request_id).await
    }

    pub async fn cancel_refresh(&self, request_id: &str) -> bool {
        self.realtime.cancel_refresh(request_id).await
    }

    pub async fn quick_refresh(&self, symbols: Vec<String>) -> PriceResult<RefreshJob> {
        self.realtime.quick_refresh(symbols).await
    }

    /// 가격 이력 (최신순).
    pub async fn get_price_history(
        &self,
        symbol: &str,
        query: &HistoryQuery,
    ) -> PriceResult<Vec<PriceHistoryRecord>> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(PriceError::InvalidInput(format!(
                    "history range start {from} is after end {to}"
                )));
            }
        }
        Ok(self.store.query_history(symbol, query).await?)
    }

    /// 서비스 상태 점검.
    ///
    /// - Unhealthy: 캐시가 비었거나 모든 소스의 요청 한도가 소진됨
    /// - Degraded: 백그라운드 갱신이 멈췄거나, stale 캐시가 있거나, 일부 소스의 한도가 소진됨
    pub async fn check_pricing_service_health(&self) -> PricingHealth {
        let background = self.background.health_check().await;

        let mut per_source = Vec::new();
        for source in self.fetcher.sources() {
            let rate_limit = self.rate_limiter.rate_limit_status(source).await;
            let available = !rate_limit.as_ref().is_some_and(RateLimitStatus::is_exhausted);
            per_source.push(SourceHealth {
                source,
                available,
                rate_limit,
            });
        }
        let rate_limits = self.rate_limiter.rate_limit_statuses().await;
        let exhausted = per_source.iter().filter(|s| !s.available).count();

        let mut issues = Vec::new();
        let mut status = HealthStatus::Healthy;

        if background.cached_symbols == 0 {
            status = HealthStatus::Unhealthy;
            issues.push("price cache is empty".to_string());
        }
        if exhausted == per_source.len() {
            status = HealthStatus::Unhealthy;
            issues.push("all price sources are rate limited".to_string());
        } else if exhausted > 0 {
            issues.push(format!("{exhausted} price source(s) rate limited"));
        }
        if !background.running {
            issues.push("background refresh is not running".to_string());
        }
        if background.stale_symbols > 0 {
            issues.push(format!(
                "{} of {} cached prices are stale",
                background.stale_symbols, background.cached_symbols
            ));
        }
        if status == HealthStatus::Healthy && !issues.is_empty() {
            status = HealthStatus::Degraded;
        }

        PricingHealth {
            status,
            per_source,
            rate_limits,
            background,
            issues,
        }
    }
}
