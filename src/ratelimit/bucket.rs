//! Token bucket state and refill arithmetic.

/// Refill parameters shared by every bucket of one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum tokens a bucket can hold
    pub capacity: f64,
}

impl BucketLimits {
    /// Create limits from a rate (tokens/second) and a capacity (burst).
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity: capacity as f64,
        }
    }
}

/// The budget tracked for one partition key.
///
/// `tokens` and `last_update_ms` only ever change together, through
/// [`BucketState::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    tokens: f64,
    last_update_ms: u64,
}

impl BucketState {
    /// A fully charged bucket observed at `now_ms`.
    pub fn full(limits: &BucketLimits, now_ms: u64) -> Self {
        Self {
            tokens: limits.capacity,
            last_update_ms: now_ms,
        }
    }

    /// Tokens currently held (as of the last transition).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Timestamp of the last transition, in milliseconds since the epoch.
    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms
    }

    /// Refill for the time elapsed since the last transition, then try to
    /// take one token.
    ///
    /// Returns `true` if a token was consumed. The timestamp advances on both
    /// outcomes so fractional refill restarts from `now_ms`. A `now_ms` older
    /// than the recorded timestamp counts as zero elapsed time.
    pub fn try_consume(&mut self, limits: &BucketLimits, now_ms: u64) -> bool {
        self.tokens = self.refilled_tokens(limits, now_ms);
        self.last_update_ms = self.last_update_ms.max(now_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens the bucket would hold at `now_ms`, without changing it.
    pub fn refilled_tokens(&self, limits: &BucketLimits, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(self.last_update_ms);
        let refill = elapsed_ms as f64 * limits.rate / 1000.0;
        (self.tokens + refill).min(limits.capacity)
    }

    /// Whether the bucket has refilled to capacity by `now_ms`, making it
    /// indistinguishable from a freshly created one.
    pub fn is_full_at(&self, limits: &BucketLimits, now_ms: u64) -> bool {
        self.refilled_tokens(limits, now_ms) >= limits.capacity
    }

    /// Milliseconds since the last transition, as seen at `now_ms`.
    pub fn idle_for_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_update_ms)
    }
}
