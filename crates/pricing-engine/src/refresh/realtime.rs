//! 요청 단위 실시간 가격 갱신 작업.
//!
//! `start_refresh`는 작업 ID를 즉시 반환하고 실제 조회는 별도 태스크에서 진행됩니다.
//! 진행 상황은 청크가 끝날 때마다 갱신되며, 취소는 청크 경계에서만 반영됩니다.
//! 종료된 작업은 보관 기간이 지나면 `cleanup_old_refreshes`로 제거됩니다.

use chrono::{DateTime, Utc};
use pricing_core::{
    ErrorKind, PerSymbolResult, PriceError, PriceResult, PricingConfig, RealtimeRefreshConfig,
    SymbolRefreshDetail,
};
use pricing_data::TrackedSymbolRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchPriceFetcher, ChunkProgress};

/// 갱신 작업 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    /// 대상 심볼 목록을 얻지 못함
    Failed,
}

impl RefreshStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RefreshStatus::Completed | RefreshStatus::Cancelled | RefreshStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshResults {
    pub success: usize,
    pub failed: usize,
    /// 취소로 조회하지 않은 심볼 수
    pub skipped: usize,
    pub details: Vec<SymbolRefreshDetail>,
}

impl RefreshResults {
    fn tally(results: &[PerSymbolResult]) -> Self {
        let mut tally = Self::default();
        for result in results {
            tally.push(result.detail());
        }
        tally
    }

    fn push(&mut self, detail: SymbolRefreshDetail) {
        if detail.success {
            self.success += 1;
        } else if detail.error_kind == Some(ErrorKind::Cancelled) {
            self.skipped += 1;
        } else {
            self.failed += 1;
        }
        self.details.push(detail);
    }
}

/// 갱신 작업 스냅샷.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshJob {
    pub request_id: String,
    pub status: RefreshStatus,
    pub progress: RefreshProgress,
    pub results: RefreshResults,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RefreshJob {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            status: RefreshStatus::Pending,
            progress: RefreshProgress::default(),
            results: RefreshResults::default(),
            error: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    fn finish(&mut self, status: RefreshStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

/// 갱신 요청 옵션.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshOptions {
    /// 대상 심볼. None이면 추적 중인 전체 심볼
    pub symbols: Option<Vec<String>>,
}

impl RefreshOptions {
    pub fn symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: Some(symbols.into_iter().map(Into::into).collect()),
        }
    }

    pub fn all_tracked() -> Self {
        Self::default()
    }
}

struct JobEntry {
    job: RefreshJob,
    cancel: CancellationToken,
}

type JobTable = Arc<RwLock<HashMap<String, JobEntry>>>;

/// 실시간 갱신 서비스.
pub struct RealTimeRefreshService {
    fetcher: Arc<BatchPriceFetcher>,
    registry: Arc<dyn TrackedSymbolRegistry>,
    config: RealtimeRefreshConfig,
    jobs: JobTable,
}

impl RealTimeRefreshService {
    pub fn new(
        fetcher: Arc<BatchPriceFetcher>,
        registry: Arc<dyn TrackedSymbolRegistry>,
        config: &PricingConfig,
    ) -> Self {
        Self {
            fetcher,
            registry,
            config: config.realtime.clone(),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 갱신 작업을 시작하고 작업 ID를 즉시 반환합니다.
    pub async fn start_refresh(&self, options: RefreshOptions) -> String {
        let request_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        self.jobs.write().await.insert(
            request_id.clone(),
            JobEntry {
                job: RefreshJob::new(request_id.clone()),
                cancel: cancel.clone(),
            },
        );
        info!(request_id = %request_id, "실시간 가격 갱신 요청 접수");

        tokio::spawn(run_job(
            self.fetcher.clone(),
            self.registry.clone(),
            self.jobs.clone(),
            request_id.clone(),
            options.symbols,
            cancel,
        ));

        request_id
    }

    /// 작업 스냅샷. 알 수 없거나 정리된 작업이면 None.
    pub async fn get_refresh_status(&self, request_id: &str) -> Option<RefreshJob> {
        self.jobs
            .read()
            .await
            .get(request_id)
            .map(|entry| entry.job.clone())
    }

    /// 작업 취소를 요청합니다.
    ///
    /// 진행 중인 청크는 끝까지 처리되고 이후 청크는 건너뜁니다.
    /// 작업이 없거나 이미 종료되었으면 false.
    pub async fn cancel_refresh(&self, request_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(request_id) {
            Some(entry) if !entry.job.status.is_terminal() => {
                entry.cancel.cancel();
                info!(request_id = %request_id, "실시간 가격 갱신 취소 요청");
                true
            }
            _ => false,
        }
    }

    /// 시작 시각 역순의 전체 작업 목록.
    pub async fn list_refreshes(&self) -> Vec<RefreshJob> {
        let mut jobs: Vec<RefreshJob> = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs
    }

    /// 보관 기간이 지난 종료 작업을 제거하고 제거 수를 반환합니다.
    pub async fn cleanup_old_refreshes(&self) -> usize {
        self.cleanup_finished_before(Utc::now() - self.config.job_retention())
            .await
    }

    /// `cutoff` 이전에 종료된 작업을 제거합니다. 실행 중인 작업은 유지됩니다.
    pub async fn cleanup_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| entry.job.end_time.map_or(true, |end| end >= cutoff));

        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, remaining = jobs.len(), "오래된 갱신 작업 정리");
        }
        removed
    }

    /// 주기적으로 `cleanup_old_refreshes`를 실행하는 태스크를 시작합니다.
    pub fn spawn_cleanup_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = self.config.cleanup_interval();

        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "갱신 작업 정리 태스크 시작");

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.cleanup_old_refreshes().await;
                    }
                    _ = shutdown.cancelled() => {
                        info!("갱신 작업 정리 태스크: 종료 시그널 수신");
                        break;
                    }
                }
            }

            info!("갱신 작업 정리 태스크 종료됨");
        })
    }

    /// 갱신을 시작하고 끝날 때까지 기다려 최종 결과를 반환합니다.
    ///
    /// 제한 시간 안에 끝나지 않으면 작업을 취소하고, 아직 처리되지 않은 심볼을
    /// `Timeout` 실패로 집계한 스냅샷을 반환합니다.
    pub async fn quick_refresh(&self, symbols: Vec<String>) -> PriceResult<RefreshJob> {
        let timeout = self.config.quick_refresh_timeout();
        let deadline = Instant::now() + timeout;
        let request_id = self
            .start_refresh(RefreshOptions {
                symbols: Some(symbols.clone()),
            })
            .await;

        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let job = self.snapshot(&request_id).await?;
                    if job.status.is_terminal() {
                        return Ok(job);
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }

        warn!(
            request_id = %request_id,
            timeout_ms = timeout.as_millis() as u64,
            "빠른 갱신 제한 시간 초과"
        );
        self.cancel_refresh(&request_id).await;

        // 제한 시간 시점의 집계를 작업의 최종 결과로 확정.
        // 이후 끝나는 청크는 종료된 작업을 바꾸지 않음
        let mut finalized = None;
        update_job(&self.jobs, &request_id, |job| {
            // 청크는 순서대로 처리되므로 완료된 결과는 항상 입력의 앞부분
            let done = job.results.details.len().min(symbols.len());
            for symbol in &symbols[done..] {
                let error = PriceError::Timeout {
                    operation: "quick_refresh".to_string(),
                    timeout,
                };
                job.results
                    .push(PerSymbolResult::failure(symbol.as_str(), error).detail());
            }
            job.error = Some(format!("quick refresh timed out after {timeout:?}"));
            job.finish(RefreshStatus::Cancelled);
            finalized = Some(job.clone());
        })
        .await;

        match finalized {
            Some(job) => Ok(job),
            None => self.snapshot(&request_id).await,
        }
    }

    async fn snapshot(&self, request_id: &str) -> PriceResult<RefreshJob> {
        self.get_refresh_status(request_id).await.ok_or_else(|| {
            PriceError::InvalidInput(format!("refresh job {request_id} no longer exists"))
        })
    }
}

/// 진행 중인 작업만 갱신합니다. 이미 종료된 작업은 그대로 둡니다.
async fn update_job(jobs: &JobTable, request_id: &str, update: impl FnOnce(&mut RefreshJob)) {
    if let Some(entry) = jobs.write().await.get_mut(request_id) {
        if !entry.job.status.is_terminal() {
            update(&mut entry.job);
        }
    }
}

async fn run_job(
    fetcher: Arc<BatchPriceFetcher>,
    registry: Arc<dyn TrackedSymbolRegistry>,
    jobs: JobTable,
    request_id: String,
    symbols: Option<Vec<String>>,
    cancel: CancellationToken,
) {
    let symbols = match symbols {
        Some(symbols) => symbols,
        None => match registry.all_tracked_symbols().await {
            Ok(symbols) => symbols,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "추적 심볼 목록 조회 실패");
                update_job(&jobs, &request_id, |job| {
                    job.error = Some(e.to_string());
                    job.finish(RefreshStatus::Failed);
                })
                .await;
                return;
            }
        },
    };

    let total = symbols.len();
    update_job(&jobs, &request_id, |job| {
        job.status = RefreshStatus::InProgress;
        job.progress.total = total;
    })
    .await;
    debug!(request_id = %request_id, total, "실시간 가격 갱신 시작");

    let results = fetcher
        .batch_fetch_with_progress(&symbols, &cancel, |progress: ChunkProgress| {
            let jobs = jobs.clone();
            let request_id = request_id.clone();
            async move {
                update_job(&jobs, &request_id, |job| {
                    job.progress = RefreshProgress {
                        completed: progress.completed,
                        total: progress.total,
                        percentage: progress.percentage(),
                    };
                    for result in &progress.results {
                        job.results.push(result.detail());
                    }
                })
                .await;
            }
        })
        .await;

    let status = if cancel.is_cancelled() {
        RefreshStatus::Cancelled
    } else {
        RefreshStatus::Completed
    };
    let tally = RefreshResults::tally(&results);

    info!(
        request_id = %request_id,
        status = ?status,
        success = tally.success,
        failed = tally.failed,
        skipped = tally.skipped,
        "실시간 가격 갱신 종료"
    );

    update_job(&jobs, &request_id, |job| {
        if total == 0 {
            job.progress.percentage = 100.0;
        }
        job.results = tally;
        job.finish(status);
    })
    .await;
}
