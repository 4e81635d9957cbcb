//! 저장소 오류 타입.

use pricing_core::PriceError;
use thiserror::Error;

/// 가격 저장소 관련 오류.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 저장소 연결 불가
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// 쓰기 실패
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// 조회 실패
    #[error("Query error: {0}")]
    QueryError(String),
}

impl From<StoreError> for PriceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriteFailed(msg) => PriceError::CacheWrite(msg),
            other => PriceError::Store(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
