//! # Pricing Core
//!
//! 가격 데이터 복원력 엔진의 핵심 도메인 모델 및 타입을 제공합니다.
//!
//! 이 크레이트는 가격 서브시스템 전반에서 사용되는 기본 타입을 제공합니다:
//! - 가격 캐시 항목 및 가격 이력 레코드
//! - 폴백 결정 (신뢰도, 폴백 단계, 경고)
//! - 심볼별 조회 결과
//! - 재시도 가능 여부가 명시된 에러 분류
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod types;

pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use types::*;
