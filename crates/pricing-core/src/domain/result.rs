//! 심볼별 조회 결과.

use serde::{Deserialize, Serialize};

use crate::domain::PriceSource;
use crate::error::{ErrorKind, PriceError};
use crate::types::Price;

/// 배치 조회의 심볼별 결과.
///
/// 가격 또는 에러 중 정확히 하나가 채워집니다.
#[derive(Debug, Clone, PartialEq)]
pub struct PerSymbolResult {
    pub symbol: String,
    pub price: Option<Price>,
    pub source: Option<PriceSource>,
    pub error: Option<PriceError>,
    /// 성공했지만 주의가 필요한 사항 (예: 캐시 쓰기 실패)
    pub warnings: Vec<String>,
}

impl PerSymbolResult {
    pub fn success(symbol: impl Into<String>, price: Price, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price: Some(price),
            source: Some(source),
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn failure(symbol: impl Into<String>, error: PriceError) -> Self {
        Self {
            symbol: symbol.into(),
            price: None,
            source: None,
            error: Some(error),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.price.is_some() && self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(PriceError::kind)
    }

    /// 직렬화 가능한 요약으로 변환합니다.
    pub fn detail(&self) -> SymbolRefreshDetail {
        SymbolRefreshDetail {
            symbol: self.symbol.clone(),
            success: self.is_success(),
            price: self.price,
            source: self.source,
            error: self.error.as_ref().map(ToString::to_string),
            error_kind: self.error_kind(),
        }
    }
}

/// 갱신 작업에 기록되는 심볼별 상세.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRefreshDetail {
    pub symbol: String,
    pub success: bool,
    pub price: Option<Price>,
    pub source: Option<PriceSource>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}
