//! 가격 데이터 협력자 인터페이스.
//!
//! 이 crate는 다음을 제공합니다:
//! - 현재가 캐시와 추가 전용 가격 이력을 위한 `PriceStore` 트레이트
//! - 인메모리 `PriceStore` 구현
//! - 외부 시세 소스를 위한 `PriceProvider` 트레이트
//! - 추적 중인 심볼 목록을 제공하는 `TrackedSymbolRegistry`

pub mod error;
pub mod provider;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{Result, StoreError};
pub use provider::{PriceProvider, SourceQuote, StaticSymbolRegistry, TrackedSymbolRegistry};
pub use store::{InMemoryPriceStore, PriceStore, StoreStats};
