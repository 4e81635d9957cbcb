//! 가격 서브시스템의 에러 타입.
//!
//! 모든 에러는 생성 시점에 종류(`ErrorKind`)와 재시도 가능 여부가 결정됩니다.
//! 에러 메시지 문자열로 재시도 여부를 판단하지 않습니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::PriceSource;

/// 에러 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 요청 한도 초과
    RateLimit,
    /// 응답 지연
    Timeout,
    /// 일시적인 외부 소스 장애
    Transient,
    /// 외부 소스 영구 오류 (재시도해도 결과가 같음)
    Upstream,
    /// 소스가 모르는 심볼
    NotFound,
    /// 캐시 쓰기 실패 (치명적이지 않음)
    CacheWrite,
    /// 폴백까지 실패하여 제공할 가격이 없음
    NoPrice,
    /// 협조적 취소
    Cancelled,
    Config,
    InvalidInput,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Upstream => "upstream",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CacheWrite => "cache_write",
            ErrorKind::NoPrice => "no_price",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// 가격 조회 관련 에러.
///
/// 한 청크의 실패를 심볼별로 동일하게 전파하기 위해 `Clone`을 구현합니다.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PriceError {
    /// 요청 한도 초과
    #[error("Rate limit exceeded for {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: PriceSource,
        retry_after: Duration,
        reset_at: DateTime<Utc>,
    },

    /// 타임아웃
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// 외부 소스 에러. 재시도 여부는 소스가 명시합니다.
    #[error("Source error [{code}]: {message}")]
    Source {
        code: String,
        message: String,
        retryable: bool,
    },

    /// 소스가 모르는 심볼
    #[error("Symbol not found: {symbol}")]
    NotFound { symbol: String },

    /// 캐시 쓰기 실패
    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    /// 실시간 조회와 폴백 모두 실패
    #[error("No price available for {symbol}: {reason}")]
    NoPriceAvailable { symbol: String, reason: String },

    /// 재시도 예산 소진
    #[error("Gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<PriceError>,
    },

    /// 취소된 작업
    #[error("Operation cancelled")]
    Cancelled,

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 잘못된 입력
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 저장소 에러
    #[error("Storage error: {0}")]
    Store(String),
}

/// 가격 작업을 위한 Result 타입.
pub type PriceResult<T> = Result<T, PriceError>;

impl PriceError {
    /// 재시도 가능한 일시적 소스 에러.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        PriceError::Source {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// 재시도해도 결과가 같은 소스 에러.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        PriceError::Source {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn not_found(symbol: impl Into<String>) -> Self {
        PriceError::NotFound {
            symbol: symbol.into(),
        }
    }

    /// 에러 분류를 반환합니다. 재시도 소진 에러는 마지막 에러의 분류를 따릅니다.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PriceError::RateLimited { .. } => ErrorKind::RateLimit,
            PriceError::Timeout { .. } => ErrorKind::Timeout,
            PriceError::Source { retryable: true, .. } => ErrorKind::Transient,
            PriceError::Source { retryable: false, .. } => ErrorKind::Upstream,
            PriceError::NotFound { .. } => ErrorKind::NotFound,
            PriceError::CacheWrite(_) => ErrorKind::CacheWrite,
            PriceError::NoPriceAvailable { .. } => ErrorKind::NoPrice,
            PriceError::RetriesExhausted { last, .. } => last.kind(),
            PriceError::Cancelled => ErrorKind::Cancelled,
            PriceError::Config(_) => ErrorKind::Config,
            PriceError::InvalidInput(_) => ErrorKind::InvalidInput,
            PriceError::Store(_) => ErrorKind::Storage,
        }
    }

    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        match self {
            PriceError::RateLimited { .. } | PriceError::Timeout { .. } => true,
            PriceError::Source { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// 재시도 래퍼를 벗겨낸 원인 에러.
    pub fn root(&self) -> &PriceError {
        match self {
            PriceError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// 권장 재시도 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            PriceError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for PriceError {
    fn from(err: config::ConfigError) -> Self {
        PriceError::Config(err.to_string())
    }
}
