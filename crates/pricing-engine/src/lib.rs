//! 가격 데이터 복원력 엔진.
//!
//! 이 crate는 다음 기능을 제공합니다:
//! - 소스별 요청 한도 관리 (burst/분/시간 고정 윈도우)
//! - 재시도 가능한 에러에 대한 지수 백오프 재시도
//! - 작업 단위 타임아웃
//! - 캐시 경과 시간 기반 폴백 (stale 캐시, 이력 평균)
//! - 청크 단위 배치 조회와 캐시 write-through
//! - 주기적 백그라운드 갱신과 취소 가능한 실시간 갱신 작업
//!
//! # 예제
//!
//! ```rust,ignore
//! use pricing_engine::PricingService;
//!
//! let service = PricingService::new(config, providers, store, registry)?;
//! service.start().await?;
//!
//! let decision = service.get_price_with_fallback("AAPL", false).await?;
//! if decision.is_degraded() {
//!     // decision.warnings 표시
//! }
//! ```

pub mod batch;
pub mod fallback;
pub mod rate_limiter;
pub mod refresh;
pub mod retry;
pub mod service;
pub mod timeout;

// 주요 타입 재내보내기
pub use batch::{BatchPriceFetcher, ChunkProgress};
pub use fallback::StaleDataFallbackHandler;
pub use rate_limiter::{Permits, RateLimitStatus, RateLimiter, WindowKind, WindowStatus};
pub use refresh::{
    BackgroundRefreshService, RealTimeRefreshService, RefreshJob, RefreshOptions,
    RefreshProgress, RefreshResults, RefreshStatus, RefreshSummary, ServiceHealth,
};
pub use retry::{RetryExecutor, RetryPolicy};
pub use service::{HealthStatus, PricingHealth, PricingService, SourceHealth};
pub use timeout::{execute_with_timeout, TimeoutGuard};
