// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Broker session supervision with bounded exponential backoff

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::error::ConnectivityError;

/// Backoff schedule: `first * rate^(n-1)`, capped, for at most `max_attempts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first_delay: Duration,
    pub rate: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            first_delay: Duration::from_secs(config.first_delay_secs),
            rate: config.rate.max(1),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay to wait before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.rate.checked_pow(exponent).unwrap_or(u32::MAX);
        self.first_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Set by the shutdown path only; suppresses every reconnect
#[derive(Debug, Clone, Default)]
pub struct DisconnectFlag(Arc<AtomicBool>);

impl DisconnectFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session established yet
    Idle,
    Connected,
    /// Waiting for / performing reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    ShuttingDown,
    Exhausted,
}

/// What the transport should do after a connection error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then perform attempt `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Shutdown was requested; do not reconnect
    Stop,
    /// Budget spent; the caller must terminate the process
    Exhausted(ConnectivityError),
}

/// Session lifecycle state machine driven by transport events
#[derive(Debug)]
pub struct ConnectionSupervisor {
    policy: RetryPolicy,
    flag: DisconnectFlag,
    state: LinkState,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy, flag: DisconnectFlag) -> Self {
        Self {
            policy,
            flag,
            state: LinkState::Idle,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Session (re)established. Returns the attempt that succeeded, if
    /// this was a reconnect.
    pub fn on_connected(&mut self) -> Option<u32> {
        let attempt = match self.state {
            LinkState::Reconnecting { attempt } => Some(attempt),
            _ => None,
        };

        match attempt {
            Some(n) => info!("Reconnected successfully after {} attempt(s)", n),
            None => info!("Connected to MQTT broker"),
        }

        self.state = LinkState::Connected;
        attempt
    }

    /// Connection error or unexpected disconnect
    pub fn on_failure(&mut self, cause: &str) -> RetryDecision {
        if self.flag.is_requested() {
            info!("Intentional disconnection, no reconnection attempted");
            self.state = LinkState::ShuttingDown;
            return RetryDecision::Stop;
        }

        let failed = match self.state {
            LinkState::ShuttingDown => return RetryDecision::Stop,
            LinkState::Exhausted => {
                return RetryDecision::Exhausted(ConnectivityError::Exhausted {
                    attempts: self.policy.max_attempts,
                })
            }
            LinkState::Reconnecting { attempt } => {
                error!("Reconnect failed: {}", cause);
                attempt
            }
            LinkState::Idle | LinkState::Connected => {
                warn!("{}", ConnectivityError::Lost(cause.to_string()));
                0
            }
        };

        if failed >= self.policy.max_attempts {
            error!("Reconnect failed after {} attempts", failed);
            self.state = LinkState::Exhausted;
            return RetryDecision::Exhausted(ConnectivityError::Exhausted { attempts: failed });
        }

        let attempt = failed + 1;
        let delay = self.policy.delay_for(attempt);
        info!(
            "Reconnecting in {} seconds... (attempt {}/{})",
            delay.as_secs(),
            attempt,
            self.policy.max_attempts
        );
        self.state = LinkState::Reconnecting { attempt };
        RetryDecision::Retry { attempt, delay }
    }

    /// Shutdown path: raise the flag so nothing reconnects
    pub fn shutdown(&mut self) {
        self.flag.request();
        self.state = LinkState::ShuttingDown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (ConnectionSupervisor, DisconnectFlag) {
        let flag = DisconnectFlag::new();
        (ConnectionSupervisor::new(RetryPolicy::default(), flag.clone()), flag)
    }

    fn delay_of(decision: RetryDecision) -> u64 {
        match decision {
            RetryDecision::Retry { delay, .. } => delay.as_secs(),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=9).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(policy.delay_for(40).as_secs(), 60);
    }

    #[test]
    fn test_first_three_reconnects() {
        let (mut s, _) = supervisor();
        s.on_connected();

        // lost, then two failed attempts
        assert_eq!(delay_of(s.on_failure("eof")), 1);
        assert_eq!(delay_of(s.on_failure("refused")), 2);
        assert_eq!(delay_of(s.on_failure("refused")), 4);
        assert_eq!(s.state(), LinkState::Reconnecting { attempt: 3 });
    }

    #[test]
    fn test_exhausted_after_twelfth_failure() {
        let (mut s, _) = supervisor();
        s.on_connected();

        assert!(matches!(s.on_failure("eof"), RetryDecision::Retry { attempt: 1, .. }));
        for n in 1..12 {
            match s.on_failure("refused") {
                RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, n + 1),
                other => panic!("attempt {} gave {:?}", n, other),
            }
        }

        assert_eq!(
            s.on_failure("refused"),
            RetryDecision::Exhausted(ConnectivityError::Exhausted { attempts: 12 })
        );
        assert_eq!(s.state(), LinkState::Exhausted);
    }

    #[test]
    fn test_success_resets_budget() {
        let (mut s, _) = supervisor();
        s.on_failure("eof");
        s.on_failure("refused");
        assert_eq!(s.on_connected(), Some(2));
        assert!(s.is_connected());

        assert_eq!(delay_of(s.on_failure("eof")), 1);
    }

    #[test]
    fn test_intentional_disconnect_suppresses_reconnect() {
        let (mut s, flag) = supervisor();
        s.on_connected();

        flag.request();
        assert_eq!(s.on_failure("disconnect"), RetryDecision::Stop);
        assert_eq!(s.state(), LinkState::ShuttingDown);
        assert_eq!(s.on_failure("disconnect"), RetryDecision::Stop);
    }

    #[test]
    fn test_shutdown_sets_flag() {
        let (mut s, flag) = supervisor();
        s.shutdown();
        assert!(flag.is_requested());
        assert_eq!(s.on_failure("closed"), RetryDecision::Stop);
    }
}
