//! Connection lifecycle of a reconnecting channel, without any I/O or timers.
//!
//! ```text
//! Idle -> Connecting -> Open -> (abnormal close) -> Backoff(n) -> Connecting ...
//!                          \-> (normal close / shutdown) -> Closed
//! Backoff(n) with n == max_attempts -> Exhausted
//! ```

use std::time::Duration;

/// WebSocket close code for an intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Connection attempts allowed since the last successful open.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^failures_before, max)`.
    pub fn delay_for(&self, failures_before: u32) -> Duration {
        let factor = 2u32.checked_pow(failures_before).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Backoff { attempt: u32 },
    Exhausted,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    Abnormal,
}

impl CloseKind {
    /// Anything but an explicit normal closure (including no close frame at
    /// all) counts as abnormal.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(NORMAL_CLOSURE) => CloseKind::Normal,
            _ => CloseKind::Abnormal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Reconnect { attempt: u32, delay: Duration },
    Stop,
    GiveUp,
}

#[derive(Debug)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: ChannelState,
    failures: u32,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ChannelState::Idle,
            failures: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Claim the right to open a connection. Refused while one is in flight
    /// or open, after shutdown, and once the retry budget is spent.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ChannelState::Idle | ChannelState::Backoff { .. } => {
                self.state = ChannelState::Connecting;
                true
            }
            ChannelState::Connecting
            | ChannelState::Open
            | ChannelState::Exhausted
            | ChannelState::Closed => false,
        }
    }

    pub fn on_open(&mut self) {
        if self.state == ChannelState::Connecting {
            self.state = ChannelState::Open;
            self.failures = 0;
        }
    }

    /// The connection ended, or never opened.
    pub fn on_close(&mut self, kind: CloseKind) -> Decision {
        if self.state == ChannelState::Closed {
            return Decision::Stop;
        }

        if kind == CloseKind::Normal {
            self.state = ChannelState::Closed;
            return Decision::Stop;
        }

        let failures_before = self.failures;
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.state = ChannelState::Exhausted;
            return Decision::GiveUp;
        }

        self.state = ChannelState::Backoff {
            attempt: self.failures,
        };
        Decision::Reconnect {
            attempt: self.failures,
            delay: self.policy.delay_for(failures_before),
        }
    }

    /// Intentional shutdown: no further connections from this machine.
    pub fn shutdown(&mut self) {
        self.state = ChannelState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..6).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays, [ms(1000), ms(2000), ms(4000), ms(8000), ms(10000), ms(10000)]);
        assert_eq!(policy.delay_for(200), ms(10000));
    }

    #[test]
    fn abnormal_closes_back_off_then_give_up() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        let mut decisions = Vec::new();
        for _ in 0..5 {
            assert!(machine.begin_connect());
            decisions.push(machine.on_close(CloseKind::Abnormal));
        }

        assert_eq!(
            decisions,
            [
                Decision::Reconnect { attempt: 1, delay: ms(1000) },
                Decision::Reconnect { attempt: 2, delay: ms(2000) },
                Decision::Reconnect { attempt: 3, delay: ms(4000) },
                Decision::Reconnect { attempt: 4, delay: ms(8000) },
                Decision::GiveUp,
            ]
        );
        assert_eq!(machine.state(), ChannelState::Exhausted);
        assert!(!machine.begin_connect());
    }

    #[test]
    fn successful_open_resets_the_counter() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        machine.begin_connect();
        machine.on_close(CloseKind::Abnormal);
        machine.begin_connect();
        machine.on_close(CloseKind::Abnormal);
        assert_eq!(machine.failures(), 2);

        machine.begin_connect();
        machine.on_open();
        assert_eq!(machine.failures(), 0);
        assert_eq!(
            machine.on_close(CloseKind::Abnormal),
            Decision::Reconnect { attempt: 1, delay: ms(1000) }
        );
    }

    #[test]
    fn normal_close_does_not_reconnect() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        machine.begin_connect();
        machine.on_open();
        assert_eq!(machine.on_close(CloseKind::Normal), Decision::Stop);
        assert_eq!(machine.state(), ChannelState::Closed);
        assert!(!machine.begin_connect());
    }

    #[test]
    fn guard_refuses_concurrent_attempts() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        assert!(machine.begin_connect());
        assert!(!machine.begin_connect());
        machine.on_open();
        assert!(!machine.begin_connect());
    }

    #[test]
    fn shutdown_wins_over_a_late_abnormal_close() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        machine.begin_connect();
        machine.on_open();
        machine.shutdown();
        assert_eq!(machine.on_close(CloseKind::Abnormal), Decision::Stop);
        assert_eq!(machine.state(), ChannelState::Closed);
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseKind::from_code(Some(1000)), CloseKind::Normal);
        assert_eq!(CloseKind::from_code(Some(1001)), CloseKind::Abnormal);
        assert_eq!(CloseKind::from_code(Some(1006)), CloseKind::Abnormal);
        assert_eq!(CloseKind::from_code(None), CloseKind::Abnormal);
    }
}
