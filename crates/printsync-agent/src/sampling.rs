//! Adaptive sampling rate.
//!
//! The interval between telemetry sends is a pure function of three inputs:
//! whether a remote user is watching, whether a job is running, and when a
//! camera stream was last requested. [`SharedSampling`] holds those inputs
//! behind a mutex so the frame handler and the periodic task can both update
//! them without interleaving.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    pub fast: Duration,
    pub idle: Duration,
    /// Used while a stream is live; slower than `fast` to leave bandwidth for video.
    pub streaming: Duration,
    pub stream_window: Duration,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(1250),
            idle: Duration::from_secs(30),
            streaming: Duration::from_millis(2500),
            stream_window: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingState {
    pub user_online: bool,
    pub job_active: bool,
    pub last_stream_request: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    Streaming,
    Printing,
    Online,
    Idle,
}

impl SamplingPolicy {
    /// First matching rule wins: stream, online with job, online, idle.
    pub fn classify(&self, state: &SamplingState, now: Instant) -> Rate {
        let streaming = state
            .last_stream_request
            .is_some_and(|at| now.saturating_duration_since(at) < self.stream_window);
        if streaming {
            Rate::Streaming
        } else if state.user_online && state.job_active {
            Rate::Printing
        } else if state.user_online {
            Rate::Online
        } else {
            Rate::Idle
        }
    }

    pub fn interval(&self, state: &SamplingState, now: Instant) -> Duration {
        match self.classify(state, now) {
            Rate::Streaming => self.streaming,
            Rate::Printing | Rate::Online => self.fast,
            Rate::Idle => self.idle,
        }
    }

    /// Cadence for job telemetry rows and frames. Captures keep the fast
    /// rate whether or not anyone is watching, and back off only while a
    /// stream is live.
    pub fn capture_interval(&self, state: &SamplingState, now: Instant) -> Duration {
        match self.classify(state, now) {
            Rate::Streaming => self.streaming,
            _ => self.fast,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedSampling {
    policy: SamplingPolicy,
    state: Arc<Mutex<SamplingState>>,
}

impl SharedSampling {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(SamplingState::default())),
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    fn modify(&self, f: impl FnOnce(&mut SamplingState)) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    pub fn snapshot(&self) -> SamplingState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_user_online(&self, online: bool) {
        self.modify(|s| s.user_online = online);
    }

    pub fn set_job_active(&self, active: bool) {
        self.modify(|s| s.job_active = active);
    }

    pub fn mark_stream_request(&self, at: Instant) {
        self.modify(|s| s.last_stream_request = Some(at));
    }

    pub fn interval(&self, now: Instant) -> Duration {
        self.policy.interval(&self.snapshot(), now)
    }

    pub fn capture_interval(&self, now: Instant) -> Duration {
        self.policy.capture_interval(&self.snapshot(), now)
    }
}

/// Fires at a fixed interval, carrying any overshoot into the next period so
/// the long-run rate matches the interval even with a coarse tick.
#[derive(Debug, Clone, Default)]
pub struct Cadence {
    last: Option<Instant>,
    carry: Duration,
}

impl Cadence {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first call is always due.
    pub fn due(&mut self, now: Instant, interval: Duration) -> bool {
        let Some(last) = self.last else {
            self.last = Some(now);
            return true;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed < interval.saturating_sub(self.carry) {
            return false;
        }
        self.carry = elapsed.saturating_sub(interval).min(interval);
        self.last = Some(now);
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(online: bool, job: bool, stream_ago: Option<u64>, now: Instant) -> SamplingState {
        SamplingState {
            user_online: online,
            job_active: job,
            last_stream_request: stream_ago.map(|s| now - Duration::from_secs(s)),
        }
    }

    #[test]
    fn precedence_table() {
        let policy = SamplingPolicy::default();
        let now = Instant::now() + Duration::from_secs(60);

        let cases = [
            (state(false, false, Some(3), now), Rate::Streaming),
            (state(true, true, Some(14), now), Rate::Streaming),
            (state(true, true, Some(20), now), Rate::Printing),
            (state(true, true, None, now), Rate::Printing),
            (state(true, false, None, now), Rate::Online),
            (state(false, true, None, now), Rate::Idle),
            (state(false, false, Some(16), now), Rate::Idle),
        ];
        for (input, expected) in cases {
            assert_eq!(policy.classify(&input, now), expected, "{input:?}");
        }

        assert_eq!(policy.interval(&cases[3].0, now), Duration::from_millis(1250));
        assert_eq!(policy.interval(&cases[4].0, now), Duration::from_millis(1250));
        assert_eq!(policy.interval(&cases[5].0, now), Duration::from_secs(30));
        assert_eq!(policy.interval(&cases[0].0, now), Duration::from_millis(2500));
    }

    #[test]
    fn same_inputs_same_output() {
        let policy = SamplingPolicy::default();
        let now = Instant::now() + Duration::from_secs(60);
        let input = state(true, false, Some(5), now);
        let first = policy.interval(&input, now);
        for _ in 0..10 {
            assert_eq!(policy.interval(&input, now), first);
        }
    }

    #[test]
    fn captures_ignore_presence() {
        let policy = SamplingPolicy::default();
        let now = Instant::now() + Duration::from_secs(60);
        assert_eq!(
            policy.capture_interval(&state(false, true, None, now), now),
            policy.fast
        );
        assert_eq!(
            policy.capture_interval(&state(false, true, Some(1), now), now),
            policy.streaming
        );
    }

    #[test]
    fn shared_state_updates_are_visible() {
        let shared = SharedSampling::new(SamplingPolicy::default());
        let now = Instant::now();
        assert_eq!(shared.interval(now), Duration::from_secs(30));
        shared.set_user_online(true);
        assert_eq!(shared.interval(now), Duration::from_millis(1250));
        shared.mark_stream_request(now);
        assert_eq!(shared.interval(now), Duration::from_millis(2500));
        assert!(shared.snapshot().user_online);
    }

    #[test]
    fn cadence_carries_overshoot() {
        let interval = Duration::from_millis(1000);
        let start = Instant::now();
        let mut cadence = Cadence::new();
        assert!(cadence.due(start, interval));
        assert!(!cadence.due(start + Duration::from_millis(900), interval));
        // Fires 200ms late; the next period is shortened by that much.
        assert!(cadence.due(start + Duration::from_millis(1200), interval));
        assert!(!cadence.due(start + Duration::from_millis(1900), interval));
        assert!(cadence.due(start + Duration::from_millis(2000), interval));
    }
}
