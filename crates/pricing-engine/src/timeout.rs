//! 작업 지연 상한.

use pricing_core::{PriceError, PriceResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// `timeout` 안에 끝나지 않으면 `PriceError::Timeout`을 반환합니다.
///
/// 타이머가 먼저 만료되면 원래 future는 다음 대기 지점에서 drop됩니다.
/// 이미 외부로 전송된 요청이나 future가 spawn한 작업은 계속 진행될 수 있으므로,
/// 호출자는 그 결과를 멱등하게 처리해야 합니다.
pub async fn execute_with_timeout<T, Fut>(
    fut: Fut,
    timeout: Duration,
    operation: &str,
) -> PriceResult<T>
where
    Fut: Future<Output = PriceResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "작업 시간 초과");
            Err(PriceError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
        }
    }
}

/// 고정된 제한 시간을 가진 가드.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    timeout: Duration,
}

impl TimeoutGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> PriceResult<T>
    where
        Fut: Future<Output = PriceResult<T>>,
    {
        execute_with_timeout(fut, self.timeout, operation).await
    }
}
