//! Reconnection policy: endpoint rotation, backoff, attempt accounting
//!
//! The engine consults a [`ReconnectState`] whenever an established
//! connection fails or a connect attempt does not succeed. Classification of
//! the failure itself lives on [`Error::is_recoverable`]
//! (`crate::error::Error`).

use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub(crate) enabled: bool,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) backoff_multiplier: f64,
    pub(crate) use_backoff: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: None,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_backoff: true,
        }
    }
}

impl ReconnectOptions {
    /// Enables reconnection with the default policy
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Maximum reconnect attempts before giving up; `None` retries forever
    pub fn max_attempts(mut self, attempts: impl Into<Option<u32>>) -> Self {
        self.max_attempts = attempts.into();
        self
    }

    /// Delay before the first reconnect attempt
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Upper bound on the backoff delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Multiplier applied to the delay after each failed attempt
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Disables exponential backoff, retrying at the initial delay
    pub fn use_backoff(mut self, use_backoff: bool) -> Self {
        self.use_backoff = use_backoff;
        self
    }
}

/// Mutable reconnect state carried by the engine
#[derive(Debug)]
pub(crate) struct ReconnectState {
    options: ReconnectOptions,
    endpoints: Vec<(String, u16)>,
    next_endpoint: usize,
    attempts: u32,
}

impl ReconnectState {
    pub(crate) fn new(
        options: ReconnectOptions,
        primary: (String, u16),
        alternates: Vec<(String, u16)>,
    ) -> Self {
        let mut endpoints = Vec::with_capacity(1 + alternates.len());
        endpoints.push(primary);
        endpoints.extend(alternates);
        Self {
            options,
            endpoints,
            next_endpoint: 0,
            attempts: 0,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// Next endpoint in round-robin order
    pub(crate) fn next_endpoint(&mut self) -> (String, u16) {
        let endpoint = self.endpoints[self.next_endpoint % self.endpoints.len()].clone();
        self.next_endpoint = (self.next_endpoint + 1) % self.endpoints.len();
        endpoint
    }

    /// Records a failed attempt; `false` means the attempt budget is spent
    pub(crate) fn attempt_allowed(&mut self) -> bool {
        self.attempts += 1;
        match self.options.max_attempts {
            Some(max) => self.attempts <= max,
            None => true,
        }
    }

    /// Resets the attempt counter after a successful open
    pub(crate) fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the upcoming attempt. The very first connect (attempt 0)
    /// is not delayed at all.
    pub(crate) fn delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        if !self.options.use_backoff {
            return self.options.initial_delay;
        }
        let exponent = (self.attempts - 1).min(32);
        let factor = self.options.backoff_multiplier.powi(exponent as i32);
        let delay = self.options.initial_delay.mul_f64(factor);
        delay.min(self.options.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(options: ReconnectOptions) -> ReconnectState {
        ReconnectState::new(
            options,
            ("a".to_string(), 5672),
            vec![("b".to_string(), 5672), ("c".to_string(), 5672)],
        )
    }

    #[test]
    fn endpoints_rotate_round_robin() {
        let mut state = state(ReconnectOptions::enabled());
        let hosts: Vec<String> = (0..4).map(|_| state.next_endpoint().0).collect();
        assert_eq!(hosts, ["a", "b", "c", "a"]);
    }

    #[test]
    fn first_connect_has_no_delay() {
        let state = state(ReconnectOptions::enabled());
        assert_eq!(state.delay(), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut state = state(
            ReconnectOptions::enabled()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_millis(450))
                .backoff_multiplier(2.0),
        );
        assert!(state.attempt_allowed());
        assert_eq!(state.delay(), Duration::from_millis(100));
        assert!(state.attempt_allowed());
        assert_eq!(state.delay(), Duration::from_millis(200));
        assert!(state.attempt_allowed());
        assert_eq!(state.delay(), Duration::from_millis(400));
        assert!(state.attempt_allowed());
        assert_eq!(state.delay(), Duration::from_millis(450));
    }

    #[test]
    fn flat_delay_without_backoff() {
        let mut state = state(
            ReconnectOptions::enabled()
                .initial_delay(Duration::from_millis(75))
                .use_backoff(false),
        );
        for _ in 0..3 {
            assert!(state.attempt_allowed());
            assert_eq!(state.delay(), Duration::from_millis(75));
        }
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut state = state(ReconnectOptions::enabled().max_attempts(2));
        assert!(state.attempt_allowed());
        assert!(state.attempt_allowed());
        assert!(!state.attempt_allowed());
    }
}
