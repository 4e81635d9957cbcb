//! 설정 관리.
//!
//! 가격 서브시스템의 설정을 정의하고 관리합니다.
//! 모든 필드에 기본값이 있으므로 설정 파일 없이도 동작합니다.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::PriceSource;
use crate::error::PriceError;
use crate::logging::{parse_filter, LogFormat};

/// 가격 서브시스템 전체 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PricingConfig {
    /// 소스별 요청 한도
    pub rate_limits: RateLimitsConfig,
    /// 재시도 설정
    pub retry: RetryConfig,
    /// 타임아웃 설정
    pub timeout: TimeoutConfig,
    /// 폴백 설정
    pub fallback: FallbackConfig,
    /// 배치 조회 설정
    pub batch: BatchConfig,
    /// 백그라운드 갱신 설정
    pub background: BackgroundRefreshConfig,
    /// 실시간 갱신 설정
    pub realtime: RealtimeRefreshConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
}

/// 소스별 요청 한도 목록.
///
/// 설정 파일/환경 변수의 값은 기본 한도 위에 필드 단위로 덮어씁니다.
/// 언급하지 않은 소스와 필드는 기본 한도를 유지합니다.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct RateLimitsConfig(pub HashMap<PriceSource, RateLimitConfig>);

impl Default for RateLimitsConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        for source in PriceSource::LIVE {
            limits.insert(source, RateLimitConfig::default_for(source));
        }
        Self(limits)
    }
}

/// 한 소스에 대한 부분 덮어쓰기.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RateLimitOverride {
    burst_limit: Option<u32>,
    burst_window_secs: Option<u64>,
    per_minute: Option<u32>,
    per_hour: Option<u32>,
}

impl<'de> Deserialize<'de> for RateLimitsConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let overrides = HashMap::<PriceSource, RateLimitOverride>::deserialize(deserializer)?;

        let mut config = Self::default();
        for (source, over) in overrides {
            let limit = config
                .0
                .entry(source)
                .or_insert_with(|| RateLimitConfig::default_for(source));
            if let Some(value) = over.burst_limit {
                limit.burst_limit = value;
            }
            if let Some(value) = over.burst_window_secs {
                limit.burst_window_secs = value;
            }
            if let Some(value) = over.per_minute {
                limit.per_minute = value;
            }
            if let Some(value) = over.per_hour {
                limit.per_hour = value;
            }
        }
        Ok(config)
    }
}

impl RateLimitsConfig {
    pub fn get(&self, source: PriceSource) -> Option<&RateLimitConfig> {
        self.0.get(&source)
    }
}

/// 단일 소스의 요청 한도.
///
/// 세 개의 윈도우(버스트, 분, 시간)가 동시에 적용됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 버스트 윈도우당 최대 요청 수
    pub burst_limit: u32,
    /// 버스트 윈도우 길이 (초)
    pub burst_window_secs: u64,
    /// 분당 최대 요청 수
    pub per_minute: u32,
    /// 시간당 최대 요청 수
    pub per_hour: u32,
}

fn default_burst_window_secs() -> u64 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_limit: 5,
            burst_window_secs: default_burst_window_secs(),
            per_minute: 30,
            per_hour: 500,
        }
    }
}

impl RateLimitConfig {
    /// 소스별 기본 한도. 보조 소스는 주 소스보다 한도가 넉넉합니다.
    pub fn default_for(source: PriceSource) -> Self {
        match source {
            PriceSource::Secondary => Self {
                burst_limit: 10,
                burst_window_secs: default_burst_window_secs(),
                per_minute: 60,
                per_hour: 2000,
            },
            _ => Self::default(),
        }
    }

    pub fn new(burst_limit: u32, per_minute: u32, per_hour: u32) -> Self {
        Self {
            burst_limit,
            per_minute,
            per_hour,
            ..Default::default()
        }
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }
}

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 총 시도 횟수 (1이면 재시도 없음)
    pub max_retries: u32,
    /// 첫 재시도 전 대기 시간 (밀리초)
    pub base_delay_ms: u64,
    /// 지수 백오프 배수
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// 타임아웃 설정.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 외부 요청 1건의 최대 대기 시간 (밀리초)
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 폴백 설정.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// fresh로 취급하는 최대 경과 시간 (초, 기본: 1시간)
    pub fresh_max_age_secs: i64,
    /// stale로 취급하는 최대 경과 시간 (초, 기본: 24시간)
    pub stale_max_age_secs: i64,
    /// 이력 평균 계산에 사용할 최근 레코드 수
    pub history_lookback: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            fresh_max_age_secs: 60 * 60,
            stale_max_age_secs: 24 * 60 * 60,
            history_lookback: 30,
        }
    }
}

impl FallbackConfig {
    pub fn fresh_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.fresh_max_age_secs)
    }

    pub fn stale_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_max_age_secs)
    }
}

/// 배치 조회 설정.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// 청크당 심볼 수
    pub chunk_size: usize,
    /// 청크 간 대기 시간 (밀리초)
    pub inter_batch_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            inter_batch_delay_ms: 2000,
        }
    }
}

impl BatchConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

/// 백그라운드 갱신 설정.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackgroundRefreshConfig {
    /// 갱신 주기 (초, 기본: 15분)
    pub interval_secs: u64,
    /// 가격 이력 보관 일수 (0이면 정리하지 않음)
    pub history_retention_days: i64,
}

impl Default for BackgroundRefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            history_retention_days: 365,
        }
    }
}

impl BackgroundRefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// 실시간 갱신 설정.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RealtimeRefreshConfig {
    /// 완료된 작업 보관 시간 (초, 기본: 1시간)
    pub job_retention_secs: i64,
    /// quick refresh 최대 대기 시간 (밀리초)
    pub quick_refresh_timeout_ms: u64,
    /// quick refresh 상태 확인 간격 (밀리초)
    pub poll_interval_ms: u64,
    /// 오래된 작업 정리 주기 (초)
    pub cleanup_interval_secs: u64,
}

impl Default for RealtimeRefreshConfig {
    fn default() -> Self {
        Self {
            job_retention_secs: 60 * 60,
            quick_refresh_timeout_ms: 30_000,
            poll_interval_ms: 250,
            cleanup_interval_secs: 10 * 60,
        }
    }
}

impl RealtimeRefreshConfig {
    pub fn job_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_retention_secs)
    }

    pub fn quick_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.quick_refresh_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl PricingConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 환경 변수는 `PRICING__BATCH__CHUNK_SIZE` 형식으로 파일 값을 덮어씁니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PriceError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("PRICING")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `.env` 파일과 환경 변수만으로 설정을 로드합니다.
    pub fn from_env() -> Result<Self, PriceError> {
        dotenvy::dotenv().ok();

        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PRICING")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 설정 값의 일관성을 검증합니다.
    pub fn validate(&self) -> Result<(), PriceError> {
        for (source, limit) in &self.rate_limits.0 {
            if limit.burst_limit == 0 || limit.per_minute == 0 || limit.per_hour == 0 {
                return Err(PriceError::Config(format!(
                    "rate limits for {} must be greater than zero",
                    source
                )));
            }
            if limit.burst_window_secs == 0 {
                return Err(PriceError::Config(format!(
                    "burst window for {} must be greater than zero",
                    source
                )));
            }
        }

        if self.retry.max_retries == 0 {
            return Err(PriceError::Config(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(PriceError::Config(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.timeout.request_timeout_ms == 0 {
            return Err(PriceError::Config(
                "timeout.request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.fallback.fresh_max_age_secs <= 0
            || self.fallback.stale_max_age_secs <= self.fallback.fresh_max_age_secs
        {
            return Err(PriceError::Config(
                "fallback thresholds must satisfy 0 < fresh < stale".to_string(),
            ));
        }
        if self.fallback.history_lookback == 0 {
            return Err(PriceError::Config(
                "fallback.history_lookback must be at least 1".to_string(),
            ));
        }
        if self.batch.chunk_size == 0 {
            return Err(PriceError::Config(
                "batch.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.background.interval_secs == 0 {
            return Err(PriceError::Config(
                "background.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.realtime.poll_interval_ms == 0 {
            return Err(PriceError::Config(
                "realtime.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        parse_filter(&self.logging.level)?;

        Ok(())
    }
}
