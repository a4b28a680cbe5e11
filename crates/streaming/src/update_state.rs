use foundation::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Retry ceiling and backoff curve for tile/layer updates.
///
/// The pause after the n-th consecutive error is
/// `min(base_delay_s * 2^(n-1), max_delay_s)`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Errors tolerated before the failure becomes definitive.
    pub max_retries: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_s: 1.0,
            max_delay_s: 60.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_s(&self, error_count: u32) -> f64 {
        if error_count == 0 {
            return 0.0;
        }
        let exp = (error_count - 1).min(31) as i32;
        (self.base_delay_s * 2f64.powi(exp)).min(self.max_delay_s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Idle,
    Pending,
    Error,
    DefinitiveError,
}

/// Provider-specific hints carried across failed attempts.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FailureParams {
    /// Lowest zoom level that has failed so far.
    pub lowest_level_error: Option<u8>,
}

impl FailureParams {
    pub fn at_level(level: u8) -> Self {
        Self {
            lowest_level_error: Some(level),
        }
    }

    fn merge(&mut self, other: FailureParams) {
        self.lowest_level_error = match (self.lowest_level_error, other.lowest_level_error) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Retry bookkeeping for one (tile, layer) pair.
///
/// `DefinitiveError` is terminal: nothing moves the state out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerUpdateState {
    status: UpdateStatus,
    error_count: u32,
    last_try: Option<Timestamp>,
    last_error: Option<Timestamp>,
    failure_params: FailureParams,
    policy: RetryPolicy,
}

impl Default for LayerUpdateState {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl LayerUpdateState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            status: UpdateStatus::Idle,
            error_count: 0,
            last_try: None,
            last_error: None,
            failure_params: FailureParams::default(),
            policy,
        }
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_try(&self) -> Option<Timestamp> {
        self.last_try
    }

    pub fn last_error(&self) -> Option<Timestamp> {
        self.last_error
    }

    pub fn failure_params(&self) -> &FailureParams {
        &self.failure_params
    }

    pub fn has_finished(&self) -> bool {
        self.status == UpdateStatus::DefinitiveError
    }

    pub fn in_error(&self) -> bool {
        matches!(
            self.status,
            UpdateStatus::Error | UpdateStatus::DefinitiveError
        )
    }

    pub fn can_try_update(&self, now: Timestamp) -> bool {
        match self.status {
            UpdateStatus::Idle => true,
            UpdateStatus::Pending | UpdateStatus::DefinitiveError => false,
            UpdateStatus::Error => match self.next_try_at() {
                Some(at) => now >= at,
                None => true,
            },
        }
    }

    /// Backoff still owed after the last error; zero unless in `Error`.
    pub fn seconds_until_next_try(&self) -> f64 {
        if self.status != UpdateStatus::Error {
            return 0.0;
        }
        self.policy.delay_s(self.error_count)
    }

    pub fn next_try_at(&self) -> Option<Timestamp> {
        let last_error = self.last_error?;
        Some(last_error.add_secs_f64(self.seconds_until_next_try()))
    }

    pub fn new_try(&mut self, now: Timestamp, params: Option<FailureParams>) {
        if self.has_finished() {
            return;
        }
        if let Some(params) = params {
            self.failure_params.merge(params);
        }
        self.last_try = Some(now);
        self.status = UpdateStatus::Pending;
    }

    pub fn success(&mut self) {
        if self.has_finished() {
            return;
        }
        self.error_count = 0;
        self.last_error = None;
        self.failure_params = FailureParams::default();
        self.status = UpdateStatus::Idle;
    }

    /// Records a failed attempt. Returns `true` if the pair is now terminal.
    pub fn failure(&mut self, now: Timestamp, definitive: bool, params: Option<FailureParams>) -> bool {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(now);
        if let Some(params) = params {
            self.failure_params.merge(params);
        }
        if self.has_finished() || definitive || self.error_count > self.policy.max_retries {
            self.status = UpdateStatus::DefinitiveError;
        } else {
            self.status = UpdateStatus::Error;
        }
        self.has_finished()
    }

    /// The source can never serve this pair (outside coverage, unsupported).
    pub fn no_more_update_possible(&mut self) {
        self.status = UpdateStatus::DefinitiveError;
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureParams, LayerUpdateState, RetryPolicy, UpdateStatus};
    use foundation::time::Timestamp;

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        let delays: Vec<f64> = (0..9).map(|n| p.delay_s(n)).collect();
        assert_eq!(delays, vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 60.0, 60.0]);
    }

    #[test]
    fn pending_blocks_until_settled() {
        let mut s = LayerUpdateState::default();
        assert!(s.can_try_update(Timestamp(0)));
        s.new_try(Timestamp(0), None);
        assert_eq!(s.status(), UpdateStatus::Pending);
        assert!(!s.can_try_update(Timestamp(1_000_000)));
        s.success();
        assert!(s.can_try_update(Timestamp(1)));
    }

    #[test]
    fn transient_failures_recover_after_backoff() {
        let mut s = LayerUpdateState::default();
        let mut t = Timestamp(0);
        for n in 1..=3u32 {
            s.new_try(t, None);
            assert!(!s.failure(t, false, None));
            assert_eq!(s.error_count(), n);
            assert!(!s.can_try_update(t));

            let wait = s.seconds_until_next_try();
            assert_eq!(wait, RetryPolicy::default().delay_s(n));
            t = t.add_secs_f64(wait);
            assert!(s.can_try_update(t));
        }

        s.new_try(t, None);
        assert!(s.failure(t, true, None));
        for at in [0, 60_000, u64::MAX] {
            assert!(!s.can_try_update(Timestamp(at)));
        }
    }

    #[test]
    fn exceeding_retry_ceiling_is_definitive() {
        let mut s = LayerUpdateState::new(RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        });
        assert!(!s.failure(Timestamp(0), false, None));
        assert!(!s.failure(Timestamp(0), false, None));
        assert!(s.failure(Timestamp(0), false, None));
        assert!(s.has_finished());
    }

    #[test]
    fn terminal_is_one_way() {
        let mut s = LayerUpdateState::default();
        s.no_more_update_possible();
        s.success();
        s.new_try(Timestamp(5), None);
        assert_eq!(s.status(), UpdateStatus::DefinitiveError);
        assert!(!s.can_try_update(Timestamp(u64::MAX)));
        assert!(s.in_error());
    }

    #[test]
    fn success_clears_backoff() {
        let mut s = LayerUpdateState::default();
        s.failure(Timestamp(0), false, Some(FailureParams::at_level(12)));
        s.failure(Timestamp(0), false, Some(FailureParams::at_level(9)));
        assert_eq!(s.failure_params().lowest_level_error, Some(9));

        s.new_try(Timestamp(10_000), None);
        s.success();
        assert_eq!(s.error_count(), 0);
        assert_eq!(s.seconds_until_next_try(), 0.0);
        assert_eq!(s.failure_params(), &FailureParams::default());
        assert!(s.can_try_update(Timestamp(10_000)));
    }
}
