//! 가격 엔진 로깅 초기화.
//!
//! `PricingConfig`의 `logging` 섹션으로 전역 tracing subscriber를 설치합니다.
//! `RUST_LOG`가 설정되어 있으면 설정 파일의 레벨보다 우선합니다.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::PriceError;

/// 로그 출력 형식.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// 개발용 여러 줄 형식
    #[default]
    Pretty,
    /// 로그 수집기용
    Json,
    Compact,
}

/// 레벨 지시자(`info`, `pricing_engine=debug,warn` 등)를 필터로 변환합니다.
pub fn parse_filter(level: &str) -> Result<EnvFilter, PriceError> {
    EnvFilter::try_new(level)
        .map_err(|e| PriceError::Config(format!("invalid log level '{level}': {e}")))
}

/// 전역 subscriber를 설치합니다.
///
/// 이미 다른 subscriber가 설치되어 있으면 기존 것을 유지하고 `Ok(false)`를 반환합니다.
/// 레벨 지시자가 잘못된 경우에만 에러입니다.
pub fn init_logging(config: &LoggingConfig) -> Result<bool, PriceError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init().is_ok(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .is_ok(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init().is_ok(),
    };

    if installed {
        tracing::info!(format = ?config.format, level = %config.level, "로깅 초기화 완료");
    }
    Ok(installed)
}

/// 심볼 단위 조회 span. 소스를 함께 넘기면 `source` 필드가 추가됩니다.
///
/// ```ignore
/// let quote = provider.fetch_price(symbol).instrument(price_span!(symbol, source)).await;
/// ```
#[macro_export]
macro_rules! price_span {
    ($symbol:expr) => {
        tracing::debug_span!("price", symbol = %$symbol)
    };
    ($symbol:expr, $source:expr) => {
        tracing::debug_span!("price", symbol = %$symbol, source = %$source)
    };
}
