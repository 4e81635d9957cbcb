//! 백그라운드 가격 갱신.
//!
//! 추적 중인 모든 심볼의 캐시를 주기적으로 갱신합니다.
//! - 시작 시 한 번 즉시 실행하고 이후 고정 주기로 실행
//! - 한 번에 하나의 갱신 주기만 실행 (겹치는 tick은 대기열에 넣지 않고 건너뜀)
//! - 매 주기 보관 기간이 지난 가격 이력 정리

use chrono::{DateTime, Utc};
use pricing_core::{
    BackgroundRefreshConfig, ErrorKind, FallbackConfig, Freshness, PerSymbolResult, PriceError,
    PriceResult, PricingConfig,
};
use pricing_data::TrackedSymbolRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchPriceFetcher;

/// 갱신 주기 한 번의 요약.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    /// 대상 심볼 수
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// 취소되어 조회하지 않은 심볼 수
    pub skipped: usize,
    /// 정리된 이력 레코드 수
    pub pruned_history: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    /// 주기 자체가 실패한 경우 (예: 심볼 목록 조회 실패)
    pub error: Option<String>,
}

impl RefreshSummary {
    fn from_results(results: &[PerSymbolResult]) -> Self {
        let success = results.iter().filter(|r| r.is_success()).count();
        let skipped = results
            .iter()
            .filter(|r| r.error_kind() == Some(ErrorKind::Cancelled))
            .count();

        Self {
            total: results.len(),
            success,
            failed: results.len() - success - skipped,
            skipped,
            ..Default::default()
        }
    }

    /// 성공률 (%)
    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.success as f64 / self.total as f64) * 100.0
        }
    }

    /// 요약 로그 출력
    fn log_summary(&self, operation: &str) {
        info!(
            operation = operation,
            total = self.total,
            success = self.success,
            failed = self.failed,
            skipped = self.skipped,
            pruned_history = self.pruned_history,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.duration.as_secs_f64()),
            "가격 갱신 완료"
        );
    }
}

/// 백그라운드 갱신 상태 점검 결과.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub running: bool,
    pub is_refreshing: bool,
    pub cached_symbols: usize,
    /// fresh 임계치를 넘은 캐시 항목 수
    pub stale_symbols: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub issues: Vec<String>,
}

struct RunningTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// 주기 실행 상태. 스폰된 태스크와 공유됩니다.
struct RefreshCore {
    fetcher: Arc<BatchPriceFetcher>,
    registry: Arc<dyn TrackedSymbolRegistry>,
    config: BackgroundRefreshConfig,
    fallback: FallbackConfig,
    is_refreshing: AtomicBool,
    skipped_cycles: AtomicU64,
    last_summary: RwLock<Option<RefreshSummary>>,
}

/// `is_refreshing` 플래그를 drop 시 해제합니다.
struct RefreshingFlag<'a>(&'a AtomicBool);

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshCore {
    /// 갱신 주기 한 번. 이미 실행 중이면 건너뛰고 None을 반환합니다.
    async fn run_cycle(&self, cancel: &CancellationToken) -> Option<RefreshSummary> {
        if self
            .is_refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            warn!("이전 가격 갱신이 아직 실행 중, 이번 주기 건너뜀");
            return None;
        }
        let _flag = RefreshingFlag(&self.is_refreshing);

        let started_at = Utc::now();
        let started = Instant::now();

        let mut summary = match self.registry.all_tracked_symbols().await {
            Ok(symbols) if symbols.is_empty() => {
                debug!("추적 중인 심볼 없음");
                RefreshSummary::default()
            }
            Ok(symbols) => {
                info!(count = symbols.len(), "가격 갱신 시작");
                let results = self
                    .fetcher
                    .batch_fetch_with_progress(&symbols, cancel, |_| async {})
                    .await;
                RefreshSummary::from_results(&results)
            }
            Err(e) => {
                error!(error = %e, "추적 심볼 목록 조회 실패");
                RefreshSummary {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        summary.pruned_history = self.prune_history().await;
        summary.started_at = Some(started_at);
        summary.duration = started.elapsed();
        summary.log_summary("background_refresh");

        *self.last_summary.write().await = Some(summary.clone());
        Some(summary)
    }

    async fn prune_history(&self) -> u64 {
        if self.config.history_retention_days <= 0 {
            return 0;
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.config.history_retention_days);
        match self.fetcher.store().delete_history_older_than(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, cutoff = %cutoff, "오래된 가격 이력 정리");
                }
                deleted
            }
            Err(e) => {
                warn!(error = %e, "가격 이력 정리 실패");
                0
            }
        }
    }
}

/// 백그라운드 가격 갱신 서비스.
///
/// 프로세스 부트스트랩에서 하나만 생성하여 `start`/`stop`으로 수명을 관리합니다.
pub struct BackgroundRefreshService {
    core: Arc<RefreshCore>,
    task: Mutex<Option<RunningTask>>,
}

impl BackgroundRefreshService {
    pub fn new(
        fetcher: Arc<BatchPriceFetcher>,
        registry: Arc<dyn TrackedSymbolRegistry>,
        config: &PricingConfig,
    ) -> Self {
        Self {
            core: Arc::new(RefreshCore {
                fetcher,
                registry,
                config: config.background.clone(),
                fallback: config.fallback.clone(),
                is_refreshing: AtomicBool::new(false),
                skipped_cycles: AtomicU64::new(0),
                last_summary: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// 설정된 주기로 시작합니다.
    pub async fn start_default(&self) -> PriceResult<()> {
        self.start(self.core.config.interval()).await
    }

    /// 즉시 한 번 갱신한 뒤 `period`마다 갱신합니다.
    ///
    /// 이미 실행 중이면 아무것도 하지 않습니다.
    pub async fn start(&self, period: Duration) -> PriceResult<()> {
        if period.is_zero() {
            return Err(PriceError::InvalidInput(
                "refresh interval must be greater than zero".to_string(),
            ));
        }

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            warn!("백그라운드 가격 갱신이 이미 실행 중");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(refresh_loop(
            self.core.clone(),
            period,
            shutdown.clone(),
        ));
        *task = Some(RunningTask { shutdown, handle });
        Ok(())
    }

    /// 주기 실행을 중단합니다.
    ///
    /// 진행 중인 주기는 다음 청크 경계에서 멈춥니다.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };

        task.shutdown.cancel();
        if let Err(e) = task.handle.await {
            error!(error = %e, "백그라운드 갱신 태스크 종료 실패");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn is_refreshing(&self) -> bool {
        self.core.is_refreshing.load(Ordering::Acquire)
    }

    /// 겹쳐서 건너뛴 주기 수.
    pub fn skipped_cycles(&self) -> u64 {
        self.core.skipped_cycles.load(Ordering::Relaxed)
    }

    /// 주기를 기다리지 않고 즉시 갱신합니다. 이미 갱신 중이면 None.
    pub async fn refresh_now(&self) -> Option<RefreshSummary> {
        self.core.run_cycle(&CancellationToken::new()).await
    }

    pub async fn last_summary(&self) -> Option<RefreshSummary> {
        self.core.last_summary.read().await.clone()
    }

    /// 상태 점검.
    ///
    /// 서비스가 실행 중이 아니거나, 캐시가 비었거나, 모든 캐시 항목이 stale이면 비정상입니다.
    pub async fn health_check(&self) -> ServiceHealth {
        let running = self.is_running().await;
        let mut issues = Vec::new();
        if !running {
            issues.push("background refresh is not running".to_string());
        }

        let now = Utc::now();
        let (cached_symbols, stale_symbols) =
            match self.core.fetcher.store().cached_entries().await {
                Ok(entries) => {
                    let stale = entries
                        .iter()
                        .filter(|entry| {
                            Freshness::classify(
                                entry.age_at(now),
                                self.core.fallback.fresh_max_age(),
                                self.core.fallback.stale_max_age(),
                            ) != Freshness::Fresh
                        })
                        .count();
                    (entries.len(), stale)
                }
                Err(e) => {
                    issues.push(format!("price cache unavailable: {e}"));
                    (0, 0)
                }
            };

        if cached_symbols == 0 {
            issues.push("price cache is empty".to_string());
        } else if stale_symbols == cached_symbols {
            issues.push("all cached prices are stale".to_string());
        }

        let last_refresh = self
            .core
            .last_summary
            .read()
            .await
            .as_ref()
            .and_then(|s| s.started_at);

        ServiceHealth {
            healthy: issues.is_empty(),
            running,
            is_refreshing: self.is_refreshing(),
            cached_symbols,
            stale_symbols,
            last_refresh,
            issues,
        }
    }
}

async fn refresh_loop(core: Arc<RefreshCore>, period: Duration, shutdown: CancellationToken) {
    info!(interval_secs = period.as_secs(), "백그라운드 가격 갱신 시작");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // 첫 tick은 즉시 완료됨
            _ = ticker.tick() => {
                let core = core.clone();
                let cancel = shutdown.child_token();
                tokio::spawn(async move {
                    core.run_cycle(&cancel).await;
                });
            }
            _ = shutdown.cancelled() => {
                info!("백그라운드 가격 갱신: 종료 시그널 수신");
                break;
            }
        }
    }

    info!("백그라운드 가격 갱신 종료됨");
}
