//! 가격 갱신 진입점.
//!
//! - [`BackgroundRefreshService`]: 추적 심볼 전체를 주기적으로 갱신
//! - [`RealTimeRefreshService`]: 요청 단위로 취소 가능한 갱신 작업
//!
//! 둘 다 같은 [`BatchPriceFetcher`](crate::batch::BatchPriceFetcher)를 사용합니다.

pub mod background;
pub mod realtime;

pub use background::{BackgroundRefreshService, RefreshSummary, ServiceHealth};
pub use realtime::{
    RealTimeRefreshService, RefreshJob, RefreshOptions, RefreshProgress, RefreshResults,
    RefreshStatus,
};
