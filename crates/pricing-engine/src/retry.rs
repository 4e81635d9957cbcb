//! 분류 기반 재시도 실행기.
//!
//! 재시도 가능한 에러(요청 한도, 타임아웃, 일시적 소스 장애)만 재시도하며,
//! 시도 사이에는 지수 백오프만큼 대기합니다.

use pricing_core::{PriceError, PriceResult, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 재시도 정책.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 총 시도 횟수 (1이면 재시도 없음)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.base_delay(),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// 재시도 없이 한 번만 시도.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// `attempt`번째 시도(1부터)가 실패한 뒤의 백오프: `base * multiplier^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// 에러가 권장하는 대기 시간과 백오프 중 더 긴 쪽.
    pub fn backoff_after(&self, attempt: u32, error: &PriceError) -> Duration {
        self.delay_for(attempt)
            .max(error.retry_after().unwrap_or_default())
    }

    /// 더 시도할 수 있는지.
    pub fn should_retry(&self, attempt: u32, error: &PriceError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }
}

/// 재시도 실행기.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 작업을 재시도 정책에 따라 실행합니다.
    ///
    /// 재시도 불가능한 에러는 즉시 반환되고, 재시도 예산이 소진되면
    /// 마지막 에러를 `RetriesExhausted`로 감싸 반환합니다.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> PriceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PriceResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "재시도 후 성공");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if !self.policy.should_retry(attempt, &err) => {
                    warn!(operation, attempts = attempt, error = %err, "재시도 횟수 소진");
                    return Err(PriceError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.policy.backoff_after(attempt, &err);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "백오프 후 재시도"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// 여러 키를 한 번에 처리하는 작업을 재시도합니다.
    ///
    /// `op`는 남은 키 목록을 받아 키 순서대로 결과를 반환합니다. 작업 전체가 실패하면
    /// 같은 에러가 모든 키에 적용되며, 재시도는 키별이 아니라 남은 키 묶음 단위로 한 번씩 수행됩니다.
    /// 반환값은 `keys`와 같은 순서, 같은 길이입니다.
    pub async fn execute_each<K, T, F, Fut>(
        &self,
        operation: &str,
        keys: &[K],
        mut op: F,
    ) -> Vec<PriceResult<T>>
    where
        K: Clone,
        F: FnMut(Vec<K>) -> Fut,
        Fut: Future<Output = PriceResult<Vec<PriceResult<T>>>>,
    {
        let mut finished: Vec<(usize, PriceResult<T>)> = Vec::with_capacity(keys.len());
        let mut pending: Vec<usize> = (0..keys.len()).collect();
        let mut attempt = 1;

        while !pending.is_empty() {
            let batch: Vec<K> = pending.iter().map(|&i| keys[i].clone()).collect();
            let outcomes: Vec<PriceResult<T>> = match op(batch).await {
                Ok(outcomes) if outcomes.len() == pending.len() => outcomes,
                Ok(outcomes) => {
                    let err = PriceError::permanent(
                        "batch_mismatch",
                        format!("expected {} results, got {}", pending.len(), outcomes.len()),
                    );
                    pending.iter().map(|_| Err(err.clone())).collect()
                }
                Err(err) => {
                    debug!(operation, attempt, keys = pending.len(), error = %err, "배치 전체 실패");
                    pending.iter().map(|_| Err(err.clone())).collect()
                }
            };

            let mut retry = Vec::new();
            let mut delay = Duration::ZERO;
            for (index, outcome) in pending.iter().copied().zip(outcomes) {
                match outcome {
                    Err(err) if self.policy.should_retry(attempt, &err) => {
                        delay = delay.max(self.policy.backoff_after(attempt, &err));
                        retry.push(index);
                    }
                    Err(err) if err.is_retryable() => finished.push((
                        index,
                        Err(PriceError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        }),
                    )),
                    other => finished.push((index, other)),
                }
            }

            if retry.is_empty() {
                break;
            }

            debug!(
                operation,
                attempt,
                retrying = retry.len(),
                delay_ms = delay.as_millis() as u64,
                "남은 키 백오프 후 재시도"
            );
            tokio::time::sleep(delay).await;
            pending = retry;
            attempt += 1;
        }

        finished.sort_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricing_core::PriceSource;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(max_attempts, Duration::from_millis(100), 2.0))
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_honors_rate_limit_reset() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0);
        let err = PriceError::RateLimited {
            provider: PriceSource::Primary,
            retry_after: Duration::from_secs(8),
            reset_at: chrono::Utc::now(),
        };
        assert_eq!(policy.backoff_after(1, &err), Duration::from_secs(8));

        let transient = PriceError::transient("503", "unavailable");
        assert_eq!(policy.backoff_after(2, &transient), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_k_times_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result = executor(4)
            .execute("fetch_price", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err(PriceError::transient("503", "unavailable"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_invoked_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: PriceResult<()> = executor(5)
            .execute("fetch_price", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PriceError::not_found("ZZZZ"))
            })
            .await;

        assert_eq!(result, Err(PriceError::not_found("ZZZZ")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: PriceResult<()> = executor(3)
            .execute("fetch_price", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(PriceError::transient("503", format!("attempt {n}")))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(PriceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, PriceError::transient("503", "attempt 3"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_each_retries_only_retryable_keys() {
        let calls = Mutex::new(Vec::new());
        let seen = &calls;
        let keys = vec!["A", "B", "C"];

        let results = executor(3)
            .execute_each("fetch_chunk", &keys, move |batch: Vec<&str>| async move {
                let round = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(batch.clone());
                    seen.len()
                };
                Ok(batch
                    .iter()
                    .map(|key| match (*key, round) {
                        ("B", 1) => Err(PriceError::transient("503", "unavailable")),
                        ("C", _) => Err(PriceError::not_found("C")),
                        _ => Ok(key.to_lowercase()),
                    })
                    .collect())
            })
            .await;

        assert_eq!(
            results,
            vec![
                Ok("a".to_string()),
                Ok("b".to_string()),
                Err(PriceError::not_found("C")),
            ]
        );
        assert_eq!(*calls.lock().unwrap(), vec![vec!["A", "B", "C"], vec!["B"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_each_fans_out_whole_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let keys = vec![1, 2, 3];

        let results: Vec<PriceResult<u32>> = executor(2)
            .execute_each("fetch_chunk", &keys, move |_batch: Vec<i32>| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PriceError::transient("network", "connection reset"))
            })
            .await;

        // 키 수와 관계없이 묶음 단위로 두 번만 호출
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 3);
        let first = results[0].clone().unwrap_err();
        assert!(matches!(first, PriceError::RetriesExhausted { attempts: 2, .. }));
        assert!(results.iter().all(|r| r.as_ref().unwrap_err() == &first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: PriceResult<()> = executor(1)
            .execute("fetch_price", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PriceError::transient("503", "unavailable"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(PriceError::RetriesExhausted { attempts: 1, .. })
        ));
    }
}
