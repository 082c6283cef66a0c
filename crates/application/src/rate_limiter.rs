use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use domain::{Timestamp, UserId};

use crate::clock::Clock;

/// 单个用户的令牌桶
#[derive(Debug, Clone)]
pub struct RateBucket {
    /// 当前可用令牌，最多为桶容量
    pub permits: f64,
    /// 上次补充令牌的时间
    pub last_refill: Timestamp,
}

impl RateBucket {
    fn full(capacity: f64, now: Timestamp) -> Self {
        Self {
            permits: capacity,
            last_refill: now,
        }
    }

    /// 按流逝时间补充令牌，不超过容量
    fn refill(&mut self, capacity: f64, refill_per_second: f64, now: Timestamp) {
        let elapsed = (now - self.last_refill).num_microseconds().unwrap_or(i64::MAX);
        if elapsed <= 0 {
            return;
        }
        let earned = elapsed as f64 / 1_000_000.0 * refill_per_second;
        self.permits = (self.permits + earned).min(capacity);
        self.last_refill = now;
    }
}

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {capacity} messages burst, {refill_per_second}/s sustained")]
    RateLimitExceeded {
        capacity: u32,
        refill_per_second: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// 桶容量（突发上限）
    pub capacity: u32,
    /// 每秒补充的令牌数
    pub refill_per_second: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 10.0,
        }
    }
}

/// 按用户隔离的令牌桶限流器
/// 不同用户的桶互不争用；同一用户的补充与扣减在分片锁内原子完成
pub struct TokenBucketRateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<UserId, RateBucket>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketRateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock,
        }
    }

    /// 尝试为一次发送取得一个令牌
    pub fn try_acquire(&self, user_id: UserId) -> Result<(), RateLimitError> {
        let capacity = f64::from(self.config.capacity);
        let now = self.clock.now();

        let mut bucket = self
            .buckets
            .entry(user_id)
            .or_insert_with(|| RateBucket::full(capacity, now));
        bucket.refill(capacity, self.config.refill_per_second, now);

        if bucket.permits >= 1.0 {
            bucket.permits -= 1.0;
            Ok(())
        } else {
            tracing::debug!(user_id = %user_id, permits = bucket.permits, "rate limit exceeded");
            Err(RateLimitError::RateLimitExceeded {
                capacity: self.config.capacity,
                refill_per_second: self.config.refill_per_second,
            })
        }
    }

    /// 清理长时间未使用的桶，返回清理数量
    pub fn cleanup_idle(&self, idle: Duration) -> usize {
        let cutoff = self.clock.now() - idle;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_refill > cutoff);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            tracing::debug!(removed, "evicted idle rate buckets");
        }
        removed
    }

    /// 当前跟踪的桶数量
    pub fn tracked_subjects(&self) -> usize {
        self.buckets.len()
    }

    /// 用户当前剩余令牌（未补充前的快照）
    pub fn available_permits(&self, user_id: UserId) -> Option<f64> {
        self.buckets.get(&user_id).map(|bucket| bucket.permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(capacity: u32, refill_per_second: f64) -> (TokenBucketRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = TokenBucketRateLimiter::new(
            RateLimiterConfig {
                capacity,
                refill_per_second,
            },
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let (limiter, _clock) = limiter(5, 1.0);
        let user_id = UserId::random();

        for i in 0..5 {
            assert!(limiter.try_acquire(user_id).is_ok(), "send {} should pass", i + 1);
        }
        assert!(matches!(
            limiter.try_acquire(user_id),
            Err(RateLimitError::RateLimitExceeded { capacity: 5, .. })
        ));
    }

    #[test]
    fn test_refill_is_proportional_to_elapsed_time() {
        let (limiter, clock) = limiter(2, 4.0);
        let user_id = UserId::random();

        assert!(limiter.try_acquire(user_id).is_ok());
        assert!(limiter.try_acquire(user_id).is_ok());
        assert!(limiter.try_acquire(user_id).is_err());

        // 250ms 补充 1 个令牌
        clock.advance(Duration::milliseconds(250));
        assert!(limiter.try_acquire(user_id).is_ok());
        assert!(limiter.try_acquire(user_id).is_err());
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let (limiter, clock) = limiter(3, 10.0);
        let user_id = UserId::random();

        assert!(limiter.try_acquire(user_id).is_ok());
        clock.advance(Duration::seconds(60));

        let granted = (0..10).filter(|_| limiter.try_acquire(user_id).is_ok()).count();
        assert_eq!(granted, 3);
    }

    #[test]
    fn test_sustained_throughput_never_exceeds_rate() {
        let (limiter, clock) = limiter(5, 2.0);
        let user_id = UserId::random();
        let mut granted = 0u32;

        // 10 秒内每 100ms 尝试 3 次
        for _ in 0..100 {
            for _ in 0..3 {
                if limiter.try_acquire(user_id).is_ok() {
                    granted += 1;
                }
            }
            clock.advance(Duration::milliseconds(100));
        }

        let bound = (5.0_f64 + 2.0 * 10.0).ceil() as u32;
        assert!(granted <= bound, "granted {granted} > bound {bound}");
        assert!(granted >= 20);
    }

    #[test]
    fn test_subjects_are_isolated() {
        let (limiter, _clock) = limiter(1, 0.1);
        let alice = UserId::random();
        let bob = UserId::random();

        assert!(limiter.try_acquire(alice).is_ok());
        assert!(limiter.try_acquire(alice).is_err());
        assert!(limiter.try_acquire(bob).is_ok());
    }

    #[test]
    fn test_cleanup_evicts_idle_buckets_only() {
        let (limiter, clock) = limiter(5, 1.0);
        let idle_user = UserId::random();
        let active_user = UserId::random();

        limiter.try_acquire(idle_user).unwrap();
        clock.advance(Duration::seconds(300));
        limiter.try_acquire(active_user).unwrap();
        clock.advance(Duration::seconds(10));

        assert_eq!(limiter.cleanup_idle(Duration::seconds(120)), 1);
        assert_eq!(limiter.tracked_subjects(), 1);
        assert!(limiter.available_permits(active_user).is_some());
        assert!(limiter.available_permits(idle_user).is_none());
    }
}
