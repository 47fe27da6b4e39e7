//! LEDBAT Congestion Control (RFC 6817)
//!
//! This module turns round-trip delay samples into pacing verdicts for a
//! request/response transfer. It knows nothing about windows or blocks:
//! sessions translate the [`Verdict`] into a window adjustment.
//!
//! Two decision policies are supported. The deterministic policy follows the
//! sign of the off-target ratio directly and ages its base delay once a
//! minute. The probabilistic policy, suited to a pull model where only the
//! requester reacts, draws against the off-target ratio and ages its base
//! delay once a second.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Number of base-delay rounds and current-delay samples kept
pub const HISTORY_SIZE: usize = 20;

/// Target queuing delay
pub const TARGET_DELAY: Duration = Duration::from_millis(100);

/// Base history round for the deterministic (push) policy
pub const PUSH_ROUND_TIME: Duration = Duration::from_secs(60);

/// Base history round for the probabilistic (pull) policy
pub const PULL_ROUND_TIME: Duration = Duration::from_secs(1);

/// Pacing decision for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    SpeedUp,
    SlowDown,
    Maintain,
    /// A request went unanswered; stronger than `SlowDown`
    Timeout,
}

/// Which decision policy the controller applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedbatMode {
    /// Follow the sign of the off-target ratio
    Deterministic,
    /// Draw against the off-target ratio
    #[default]
    Probabilistic,
}

impl LedbatMode {
    /// Default base-delay round length for this policy
    pub fn default_round_time(self) -> Duration {
        match self {
            Self::Deterministic => PUSH_ROUND_TIME,
            Self::Probabilistic => PULL_ROUND_TIME,
        }
    }
}

impl std::fmt::Display for LedbatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deterministic => write!(f, "deterministic"),
            Self::Probabilistic => write!(f, "probabilistic"),
        }
    }
}

/// Delay history for one connection.
///
/// `base` holds one minimum per round, newest first; `None` means no sample
/// arrived in that round. `current` holds the most recent raw samples,
/// newest first, with a running mean maintained incrementally.
#[derive(Debug, Clone)]
pub struct DelayHistory {
    base: VecDeque<Option<Duration>>,
    current: VecDeque<Duration>,
    current_mean_us: f64,
    size: usize,
}

impl DelayHistory {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut base = VecDeque::with_capacity(size);
        base.push_front(None);
        Self {
            base,
            current: VecDeque::with_capacity(size),
            current_mean_us: 0.0,
            size,
        }
    }

    /// Record one delay sample in both histories
    pub fn add_sample(&mut self, delay: Duration) {
        if let Some(slot) = self.base.front_mut() {
            *slot = Some(match *slot {
                Some(min) => min.min(delay),
                None => delay,
            });
        }

        let x = delay.as_micros() as f64;
        if self.current.len() < self.size {
            self.current.push_front(delay);
            let n = self.current.len() as f64;
            self.current_mean_us += (x - self.current_mean_us) / n;
        } else if let Some(oldest) = self.current.pop_back() {
            self.current.push_front(delay);
            let old = oldest.as_micros() as f64;
            self.current_mean_us += (x - old) / self.size as f64;
        }
    }

    /// Start a new base-delay round, evicting the oldest
    pub fn new_round(&mut self) {
        self.base.push_front(None);
        while self.base.len() > self.size {
            self.base.pop_back();
        }
    }

    /// Minimum over all base rounds; `None` if no round saw a sample
    pub fn base_delay(&self) -> Option<Duration> {
        self.base.iter().flatten().min().copied()
    }

    /// Running mean of the current samples
    pub fn current_delay(&self) -> Option<Duration> {
        if self.current.is_empty() {
            return None;
        }
        Some(Duration::from_micros(self.current_mean_us.max(0.0).round() as u64))
    }

    pub fn rounds(&self) -> usize {
        self.base.len()
    }

    pub fn samples(&self) -> usize {
        self.current.len()
    }
}

/// LEDBAT verdict generator for one connection
#[derive(Debug)]
pub struct CongestionController {
    mode: LedbatMode,
    target: Duration,
    round_time: Duration,
    gain: f64,
    history: DelayHistory,
    rng: StdRng,
}

impl CongestionController {
    /// Create a controller with the default history size and target
    pub fn new(mode: LedbatMode) -> Self {
        Self::with_params(mode, HISTORY_SIZE, TARGET_DELAY, mode.default_round_time())
    }

    /// Create a controller with explicit parameters
    pub fn with_params(
        mode: LedbatMode,
        history_size: usize,
        target: Duration,
        round_time: Duration,
    ) -> Self {
        Self {
            mode,
            target,
            round_time,
            gain: 1.0,
            history: DelayHistory::new(history_size),
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Replace the random source (deterministic tests)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Scale the off-target ratio; 1.0 is `GAIN = 1/TARGET`
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn mode(&self) -> LedbatMode {
        self.mode
    }

    /// How often [`advance_round`](Self::advance_round) should be called
    pub fn round_time(&self) -> Duration {
        self.round_time
    }

    pub fn history(&self) -> &DelayHistory {
        &self.history
    }

    /// Record a round trip measured on the requester's clock
    pub fn on_sample(&mut self, sent_at: Instant, now: Instant) {
        self.on_delay(now.saturating_duration_since(sent_at));
    }

    /// Record a delay already computed by the caller
    pub fn on_delay(&mut self, delay: Duration) {
        self.history.add_sample(delay);
    }

    /// `mean(current) - min(base)`, `None` until a sample arrives
    pub fn queuing_delay(&self) -> Option<Duration> {
        let base = self.history.base_delay()?;
        let current = self.history.current_delay()?;
        Some(current.saturating_sub(base))
    }

    /// `gain * (TARGET - queuing_delay) / TARGET`
    pub fn off_target(&self) -> Option<f64> {
        let queuing = self.queuing_delay()?;
        let target = self.target.as_secs_f64();
        if target <= 0.0 {
            return Some(-1.0);
        }
        Some(self.gain * (target - queuing.as_secs_f64()) / target)
    }

    /// Probability that [`decide`](Self::decide) returns `SpeedUp`
    pub fn speed_up_probability(&self) -> f64 {
        let Some(off_target) = self.off_target() else {
            return 1.0;
        };
        match self.mode {
            LedbatMode::Deterministic => {
                if off_target >= 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            LedbatMode::Probabilistic => off_target.clamp(0.0, 1.0),
        }
    }

    /// Produce a pacing verdict from the current history
    pub fn decide(&mut self) -> Verdict {
        let Some(off_target) = self.off_target() else {
            // no base delay yet
            return Verdict::SpeedUp;
        };

        match self.mode {
            LedbatMode::Deterministic => {
                if off_target >= 0.0 {
                    Verdict::SpeedUp
                } else {
                    Verdict::SlowDown
                }
            }
            LedbatMode::Probabilistic => {
                let draw: f64 = self.rng.random();
                if off_target >= 0.0 {
                    if draw < off_target {
                        Verdict::SpeedUp
                    } else {
                        Verdict::Maintain
                    }
                } else if draw < -off_target {
                    Verdict::SlowDown
                } else {
                    Verdict::Maintain
                }
            }
        }
    }

    /// A request timed out
    pub fn on_timeout(&mut self) -> Verdict {
        Verdict::Timeout
    }

    /// Start a new base-delay round. Driven by a free-running timer.
    pub fn advance_round(&mut self) {
        self.history.new_round();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_no_samples_speeds_up() {
        let mut ctrl = CongestionController::new(LedbatMode::Deterministic);
        assert_eq!(ctrl.decide(), Verdict::SpeedUp);
        assert_eq!(ctrl.queuing_delay(), None);
    }

    #[test]
    fn test_empty_base_always_speeds_up() {
        let mut ctrl = CongestionController::new(LedbatMode::Probabilistic).with_seed(7);
        ctrl.on_delay(ms(500));
        // age every round out so only empty slots remain
        for _ in 0..HISTORY_SIZE {
            ctrl.advance_round();
        }
        assert_eq!(ctrl.history().base_delay(), None);
        assert!(ctrl.history().current_delay().is_some());
        for _ in 0..100 {
            assert_eq!(ctrl.decide(), Verdict::SpeedUp);
        }
    }

    #[test]
    fn test_queuing_delay_uses_mean_minus_base() {
        let mut ctrl = CongestionController::new(LedbatMode::Deterministic);
        ctrl.on_delay(ms(10));
        ctrl.on_delay(ms(30));
        // mean 20ms, base 10ms
        assert_eq!(ctrl.queuing_delay(), Some(ms(10)));
    }

    #[test]
    fn test_deterministic_verdicts() {
        let mut ctrl = CongestionController::new(LedbatMode::Deterministic);
        ctrl.on_delay(ms(10));
        assert_eq!(ctrl.decide(), Verdict::SpeedUp);

        for _ in 0..HISTORY_SIZE {
            ctrl.on_delay(ms(400));
        }
        assert_eq!(ctrl.decide(), Verdict::SlowDown);
    }

    #[test]
    fn test_probabilistic_at_zero_queuing_always_speeds_up() {
        let mut ctrl = CongestionController::new(LedbatMode::Probabilistic).with_seed(1);
        ctrl.on_delay(ms(50));
        for _ in 0..50 {
            assert_eq!(ctrl.decide(), Verdict::SpeedUp);
        }
    }

    #[test]
    fn test_probabilistic_far_over_target_slows_down() {
        let mut ctrl = CongestionController::new(LedbatMode::Probabilistic).with_seed(3);
        ctrl.on_delay(ms(10));
        for _ in 0..HISTORY_SIZE {
            ctrl.on_delay(ms(1_000));
        }
        // off target is far below -1, so the draw always lands
        for _ in 0..50 {
            assert_eq!(ctrl.decide(), Verdict::SlowDown);
        }
    }

    #[test]
    fn test_probabilistic_never_slows_down_under_target() {
        let mut ctrl = CongestionController::new(LedbatMode::Probabilistic).with_seed(11);
        ctrl.on_delay(ms(10));
        ctrl.on_delay(ms(110));
        // queuing 50ms, off target 0.5
        let mut speed_ups = 0;
        for _ in 0..1_000 {
            match ctrl.decide() {
                Verdict::SpeedUp => speed_ups += 1,
                Verdict::Maintain => {}
                other => panic!("unexpected verdict {:?}", other),
            }
        }
        assert!(speed_ups > 350 && speed_ups < 650, "speed_ups = {}", speed_ups);
    }

    fn slow_down_rate(mut ctrl: CongestionController, draws: u32) -> f64 {
        let mut slow_downs = 0;
        for _ in 0..draws {
            match ctrl.decide() {
                Verdict::SlowDown => slow_downs += 1,
                Verdict::Maintain => {}
                other => panic!("unexpected verdict {:?}", other),
            }
        }
        slow_downs as f64 / draws as f64
    }

    #[test]
    fn test_probabilistic_slow_down_rate_tracks_off_target() {
        // base sample 10ms; queuing delay is the mean of both samples minus 10ms
        for (seed, second, expected) in [(5u64, 260u64, 0.25), (6, 310, 0.5), (7, 360, 0.75)] {
            let mut ctrl = CongestionController::new(LedbatMode::Probabilistic).with_seed(seed);
            ctrl.on_delay(ms(10));
            ctrl.on_delay(ms(second));
            let off_target = ctrl.off_target().unwrap();
            assert!((off_target + expected).abs() < 1e-9, "off_target = {}", off_target);

            let rate = slow_down_rate(ctrl, 4_000);
            assert!(
                (rate - expected).abs() < 0.05,
                "rate {} for off target {}",
                rate,
                off_target
            );
        }
    }

    #[test]
    fn test_gain_scales_off_target() {
        let mut ctrl = CongestionController::new(LedbatMode::Probabilistic)
            .with_seed(21)
            .with_gain(2.0);
        ctrl.on_delay(ms(10));
        ctrl.on_delay(ms(260));
        // queuing 125ms: -0.25 at unit gain, -0.5 here
        assert!((ctrl.off_target().unwrap() + 0.5).abs() < 1e-9);
        let rate = slow_down_rate(ctrl, 4_000);
        assert!((rate - 0.5).abs() < 0.05, "rate = {}", rate);
    }

    #[test]
    fn test_speed_up_probability_is_monotonic() {
        let mut last = f64::INFINITY;
        for current in [10u64, 40, 80, 120, 200, 400] {
            let mut ctrl = CongestionController::new(LedbatMode::Probabilistic);
            ctrl.on_delay(ms(10));
            ctrl.on_delay(ms(10 + 2 * current));
            let p = ctrl.speed_up_probability();
            assert!(p <= last, "probability rose as delay grew");
            last = p;
        }
    }

    #[test]
    fn test_timeout_verdict() {
        let mut ctrl = CongestionController::new(LedbatMode::Deterministic);
        assert_eq!(ctrl.on_timeout(), Verdict::Timeout);
    }

    #[test]
    fn test_base_history_is_bounded() {
        let mut history = DelayHistory::new(HISTORY_SIZE);
        for i in 0..100 {
            history.add_sample(ms(i + 1));
            history.new_round();
        }
        assert_eq!(history.rounds(), HISTORY_SIZE);
        assert_eq!(history.samples(), HISTORY_SIZE);
        // the last 19 filled rounds saw samples 82..=100
        assert_eq!(history.base_delay(), Some(ms(82)));
    }

    #[test]
    fn test_running_mean_tracks_window() {
        let mut history = DelayHistory::new(4);
        for v in [10, 20, 30, 40, 50, 60] {
            history.add_sample(ms(v));
        }
        // window holds 30, 40, 50, 60
        assert_eq!(history.current_delay(), Some(ms(45)));
    }

    #[test]
    fn test_round_time_defaults() {
        assert_eq!(
            CongestionController::new(LedbatMode::Deterministic).round_time(),
            PUSH_ROUND_TIME
        );
        assert_eq!(
            CongestionController::new(LedbatMode::Probabilistic).round_time(),
            PULL_ROUND_TIME
        );
    }
}
