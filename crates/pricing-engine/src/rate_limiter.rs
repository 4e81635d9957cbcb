//! 소스별 요청 한도 관리.
//!
//! 각 소스에는 버스트, 분, 시간 세 개의 고정 윈도우가 동시에 적용됩니다.
//!
//! 윈도우는 벽시계 경계(매 분 0초, 매 시 0분)에 맞춰 리셋되지 않습니다.
//! 리셋 이후 첫 요청 시점에 시작해 윈도우 길이가 지나면 리셋됩니다.
//! 예를 들어 12:00:45에 첫 요청이 들어오면 분 윈도우는 12:01:45에 리셋됩니다.
//! 슬라이딩 윈도우가 아니므로 리셋 직전과 직후에 요청이 몰리면
//! 명목 한도보다 짧은 간격의 버스트가 허용될 수 있습니다.

use chrono::Utc;
use pricing_core::{PriceError, PriceResult, PriceSource, RateLimitConfig, RateLimitsConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// 윈도우 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Burst,
    Minute,
    Hour,
}

/// 단일 고정 윈도우 카운터.
#[derive(Debug, Clone, Copy, Default)]
struct FixedWindow {
    count: u32,
    /// 윈도우가 시작되지 않았으면 None
    reset_at: Option<Instant>,
}

impl FixedWindow {
    fn roll(&mut self, now: Instant) {
        if matches!(self.reset_at, Some(reset_at) if now >= reset_at) {
            *self = Self::default();
        }
    }

    fn remaining(&self, ceiling: u32) -> u32 {
        ceiling.saturating_sub(self.count)
    }

    fn resets_in(&self, now: Instant, length: Duration) -> Duration {
        self.reset_at
            .map(|reset_at| reset_at.saturating_duration_since(now))
            .unwrap_or(length)
    }

    fn record(&mut self, n: u32, length: Duration, now: Instant) {
        if self.reset_at.is_none() {
            self.reset_at = Some(now + length);
        }
        self.count += n;
    }
}

/// 한 소스의 세 윈도우 상태.
#[derive(Debug, Clone, Default)]
struct SourceWindows {
    burst: FixedWindow,
    minute: FixedWindow,
    hour: FixedWindow,
}

impl SourceWindows {
    fn slots<'a>(
        &'a mut self,
        limits: &RateLimitConfig,
    ) -> [(WindowKind, &'a mut FixedWindow, u32, Duration); 3] {
        [
            (
                WindowKind::Burst,
                &mut self.burst,
                limits.burst_limit,
                limits.burst_window(),
            ),
            (WindowKind::Minute, &mut self.minute, limits.per_minute, MINUTE),
            (WindowKind::Hour, &mut self.hour, limits.per_hour, HOUR),
        ]
    }

    /// `n`개 요청을 모든 윈도우에 한꺼번에 기록합니다.
    ///
    /// 하나라도 한도를 넘으면 아무 카운터도 바꾸지 않고,
    /// 위반한 윈도우 중 가장 빠른 리셋까지의 대기 시간을 반환합니다.
    fn try_acquire(
        &mut self,
        limits: &RateLimitConfig,
        n: u32,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut slots = self.slots(limits);
        for (_, window, _, _) in slots.iter_mut() {
            window.roll(now);
        }

        let retry_after = slots
            .iter()
            .filter(|(_, window, ceiling, _)| window.count.saturating_add(n) > *ceiling)
            .map(|(_, window, _, length)| window.resets_in(now, *length))
            .min();

        if let Some(retry_after) = retry_after {
            return Err(retry_after);
        }

        for (_, window, _, length) in slots.iter_mut() {
            window.record(n, *length, now);
        }
        Ok(())
    }

    /// 지금 당장 모든 윈도우에 동시에 기록할 수 있는 최대 요청 수.
    fn capacity(&mut self, limits: &RateLimitConfig, now: Instant) -> u32 {
        let mut slots = self.slots(limits);
        let capacity = slots
            .iter_mut()
            .map(|(_, window, ceiling, _)| {
                window.roll(now);
                window.remaining(*ceiling)
            })
            .min();
        capacity.unwrap_or(0)
    }

    fn status(
        &mut self,
        source: PriceSource,
        limits: &RateLimitConfig,
        now: Instant,
    ) -> RateLimitStatus {
        let mut slots = self.slots(limits);
        let mut windows = Vec::with_capacity(slots.len());
        for (kind, window, ceiling, length) in slots.iter_mut() {
            window.roll(now);
            windows.push(WindowStatus {
                window: *kind,
                limit: *ceiling,
                used: window.count,
                remaining: window.remaining(*ceiling),
                resets_in: window.resets_in(now, *length),
            });
        }
        RateLimitStatus { source, windows }
    }
}

/// 윈도우별 잔여 한도.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub window: WindowKind,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    /// 윈도우 리셋까지 남은 시간 (시작 전이면 윈도우 길이)
    pub resets_in: Duration,
}

/// 소스의 요청 한도 현황.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub source: PriceSource,
    pub windows: Vec<WindowStatus>,
}

impl RateLimitStatus {
    pub fn window(&self, kind: WindowKind) -> Option<&WindowStatus> {
        self.windows.iter().find(|w| w.window == kind)
    }

    /// 어느 한 윈도우라도 한도를 모두 소진했는지.
    pub fn is_exhausted(&self) -> bool {
        self.windows.iter().any(|w| w.remaining == 0)
    }
}

/// `acquire_up_to`의 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct Permits {
    /// 허용된 요청 수
    pub granted: u32,
    /// 허용되지 않은 나머지 요청의 에러
    pub denied: Option<PriceError>,
}

impl Permits {
    fn all(granted: u32) -> Self {
        Self {
            granted,
            denied: None,
        }
    }
}

/// 소스별 요청 한도 관리자.
///
/// 설정에 없는 소스는 제한하지 않습니다.
#[derive(Debug)]
pub struct RateLimiter {
    limits: HashMap<PriceSource, RateLimitConfig>,
    windows: Mutex<HashMap<PriceSource, SourceWindows>>,
}

impl RateLimiter {
    pub fn new(limits: &RateLimitsConfig) -> Self {
        Self {
            limits: limits.0.clone(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 요청 1건을 기록합니다. 한도 초과 시 `RateLimited`를 반환합니다.
    pub async fn check_rate_limit(&self, source: PriceSource) -> PriceResult<()> {
        self.check_rate_limit_n(source, 1).await
    }

    /// 요청 `n`건을 한꺼번에 기록합니다 (전부 아니면 전무).
    pub async fn check_rate_limit_n(&self, source: PriceSource, n: u32) -> PriceResult<()> {
        let Some(limits) = self.limits.get(&source) else {
            return Ok(());
        };
        if n == 0 {
            return Ok(());
        }

        let mut windows = self.windows.lock().await;
        let state = windows.entry(source).or_default();

        match state.try_acquire(limits, n, Instant::now()) {
            Ok(()) => {
                debug!(source = %source, requests = n, "요청 한도 허용");
                Ok(())
            }
            Err(retry_after) => {
                warn!(
                    source = %source,
                    requests = n,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "요청 한도 초과"
                );
                Err(rate_limited(source, retry_after))
            }
        }
    }

    /// 최대 `n`건까지 가능한 만큼 기록합니다.
    ///
    /// 한 건도 허용되지 않으면 `RateLimited`를 반환합니다. 일부만 허용되면
    /// 나머지 요청에 적용할 `RateLimited` 에러가 `Permits::denied`에 담깁니다.
    pub async fn acquire_up_to(&self, source: PriceSource, n: u32) -> PriceResult<Permits> {
        let Some(limits) = self.limits.get(&source) else {
            return Ok(Permits::all(n));
        };
        if n == 0 {
            return Ok(Permits::all(0));
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let state = windows.entry(source).or_default();

        let granted = state.capacity(limits, now).min(n);
        if granted > 0 {
            if let Err(retry_after) = state.try_acquire(limits, granted, now) {
                return Err(rate_limited(source, retry_after));
            }
            if granted == n {
                return Ok(Permits::all(n));
            }
        }

        // 남은 요청에 대한 대기 시간 (카운터는 바뀌지 않음)
        let retry_after = match state.try_acquire(limits, 1, now) {
            Err(retry_after) => retry_after,
            Ok(()) => return Ok(Permits::all(granted + 1)),
        };
        let denied = rate_limited(source, retry_after);

        if granted == 0 {
            warn!(
                source = %source,
                requests = n,
                retry_after_ms = retry_after.as_millis() as u64,
                "요청 한도 초과"
            );
            return Err(denied);
        }

        debug!(source = %source, requested = n, granted, "요청 한도 일부만 허용");
        Ok(Permits {
            granted,
            denied: Some(denied),
        })
    }

    /// 소스의 잔여 한도. 설정에 없는 소스면 None.
    pub async fn rate_limit_status(&self, source: PriceSource) -> Option<RateLimitStatus> {
        let limits = self.limits.get(&source)?;
        let mut windows = self.windows.lock().await;
        Some(
            windows
                .entry(source)
                .or_default()
                .status(source, limits, Instant::now()),
        )
    }

    /// 설정된 모든 소스의 잔여 한도 (소스 순).
    pub async fn rate_limit_statuses(&self) -> Vec<RateLimitStatus> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let mut sources: Vec<_> = self.limits.keys().copied().collect();
        sources.sort();

        sources
            .into_iter()
            .filter_map(|source| {
                let limits = self.limits.get(&source)?;
                Some(windows.entry(source).or_default().status(source, limits, now))
            })
            .collect()
    }
}

fn rate_limited(source: PriceSource, retry_after: Duration) -> PriceError {
    let reset_at = Utc::now()
        + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());
    PriceError::RateLimited {
        provider: source,
        retry_after,
        reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(burst: u32, per_minute: u32, per_hour: u32) -> RateLimiter {
        let mut limits = HashMap::new();
        limits.insert(
            PriceSource::Primary,
            RateLimitConfig::new(burst, per_minute, per_hour),
        );
        RateLimiter::new(&RateLimitsConfig(limits))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_plus_one_is_rejected() {
        let limiter = limiter(5, 30, 500);

        for _ in 0..5 {
            limiter.check_rate_limit(PriceSource::Primary).await.unwrap();
        }

        let err = limiter
            .check_rate_limit(PriceSource::Primary)
            .await
            .unwrap_err();
        match err {
            PriceError::RateLimited {
                provider,
                retry_after,
                ..
            } => {
                assert_eq!(provider, PriceSource::Primary);
                assert_eq!(retry_after, Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 거부된 요청은 카운터를 바꾸지 않음
        let status = limiter.rate_limit_status(PriceSource::Primary).await.unwrap();
        assert_eq!(status.window(WindowKind::Burst).unwrap().used, 5);
        assert_eq!(status.window(WindowKind::Minute).unwrap().used, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_window_elapses() {
        let limiter = limiter(2, 30, 500);
        limiter.check_rate_limit(PriceSource::Primary).await.unwrap();
        limiter.check_rate_limit(PriceSource::Primary).await.unwrap();
        assert!(limiter.check_rate_limit(PriceSource::Primary).await.is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.check_rate_limit(PriceSource::Primary).await.is_ok());

        let status = limiter.rate_limit_status(PriceSource::Primary).await.unwrap();
        assert_eq!(status.window(WindowKind::Burst).unwrap().used, 1);
        assert_eq!(status.window(WindowKind::Minute).unwrap().used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_starts_at_first_request() {
        let limiter = limiter(100, 2, 500);

        // 분 경계와 무관한 시점에 첫 요청
        tokio::time::advance(Duration::from_secs(45)).await;
        limiter.check_rate_limit(PriceSource::Primary).await.unwrap();
        limiter.check_rate_limit(PriceSource::Primary).await.unwrap();

        let err = limiter
            .check_rate_limit(PriceSource::Primary)
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

        // 생성 후 60초가 지나도 윈도우는 유지됨
        tokio::time::advance(Duration::from_secs(30)).await;
        let err = limiter
            .check_rate_limit(PriceSource::Primary)
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        // 첫 요청 후 60초가 지나야 리셋
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check_rate_limit(PriceSource::Primary).await.is_ok());
        let status = limiter.rate_limit_status(PriceSource::Primary).await.unwrap();
        assert_eq!(status.window(WindowKind::Minute).unwrap().used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soonest_reset_among_violated_windows() {
        let limiter = limiter(5, 5, 500);
        for _ in 0..5 {
            limiter.check_rate_limit(PriceSource::Primary).await.unwrap();
        }

        // 버스트는 리셋되었지만 분 한도는 아직 소진 상태
        tokio::time::advance(Duration::from_secs(15)).await;
        let err = limiter
            .check_rate_limit(PriceSource::Primary)
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(45)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_n_is_all_or_nothing() {
        let limiter = limiter(5, 30, 500);
        limiter.check_rate_limit_n(PriceSource::Primary, 3).await.unwrap();
        assert!(limiter.check_rate_limit_n(PriceSource::Primary, 3).await.is_err());

        let status = limiter.rate_limit_status(PriceSource::Primary).await.unwrap();
        assert_eq!(status.window(WindowKind::Burst).unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_up_to_grants_partial() {
        let limiter = limiter(4, 30, 500);
        let permits = limiter.acquire_up_to(PriceSource::Primary, 10).await.unwrap();
        assert_eq!(permits.granted, 4);
        assert_eq!(
            permits.denied.and_then(|err| err.retry_after()),
            Some(Duration::from_secs(10))
        );
        assert!(limiter.acquire_up_to(PriceSource::Primary, 10).await.is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        let permits = limiter.acquire_up_to(PriceSource::Primary, 3).await.unwrap();
        assert_eq!(permits, Permits::all(3));
    }

    #[tokio::test]
    async fn test_unconfigured_source_is_unthrottled() {
        let limiter = limiter(1, 1, 1);
        for _ in 0..100 {
            limiter
                .check_rate_limit(PriceSource::Secondary)
                .await
                .unwrap();
        }
        assert!(limiter.rate_limit_status(PriceSource::Secondary).await.is_none());
        assert_eq!(limiter.rate_limit_statuses().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_exhaustion() {
        let limiter = limiter(1, 30, 500);
        assert!(!limiter
            .rate_limit_status(PriceSource::Primary)
            .await
            .unwrap()
            .is_exhausted());

        limiter.check_rate_limit(PriceSource::Primary).await.unwrap();
        let status = limiter.rate_limit_status(PriceSource::Primary).await.unwrap();
        assert!(status.is_exhausted());
        assert_eq!(
            status.window(WindowKind::Burst).unwrap().resets_in,
            Duration::from_secs(10)
        );
    }

    proptest! {
        #[test]
        fn prop_counters_never_exceed_ceiling(
            steps in prop::collection::vec((1u32..8, 0u64..20_000), 1..200),
            burst in 1u32..10,
            per_minute in 1u32..40,
        ) {
            let limits = RateLimitConfig::new(burst, per_minute, 200);
            let mut state = SourceWindows::default();
            let mut now = Instant::now();

            for (n, advance_ms) in steps {
                now += Duration::from_millis(advance_ms);
                let before = (state.burst.count, state.minute.count, state.hour.count);

                match state.try_acquire(&limits, n, now) {
                    Ok(()) => {}
                    Err(retry_after) => {
                        prop_assert!(retry_after <= HOUR);
                        // 거부 시 리셋 외에는 카운터가 증가하지 않음
                        prop_assert!(state.burst.count <= before.0);
                        prop_assert!(state.minute.count <= before.1);
                        prop_assert!(state.hour.count <= before.2);
                    }
                }

                prop_assert!(state.burst.count <= burst);
                prop_assert!(state.minute.count <= per_minute);
                prop_assert!(state.hour.count <= 200);
            }
        }
    }
}
