//! Congestion window
//!
//! Translates congestion verdicts into window adjustments and keeps the
//! window within its configured bounds.

use crate::congestion::Verdict;

/// Outstanding block request budget of one leecher session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWindow {
    cwnd: u32,
    min: u32,
    max: u32,
}

impl RequestWindow {
    pub fn new(initial: u32, min: u32, max: u32) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            cwnd: initial.clamp(min, max),
            min,
            max,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Window delta for a verdict at the current window size
    ///
    /// A timeout halves the window, a slow-down takes a quarter.
    pub fn adjustment(&self, verdict: Verdict) -> i64 {
        let cwnd = self.cwnd as i64;
        match verdict {
            Verdict::SpeedUp => 1,
            Verdict::Maintain => 0,
            Verdict::SlowDown => -(cwnd / 4).max(1),
            Verdict::Timeout => -(cwnd / 2).max(1),
        }
    }

    /// Apply a delta, clamped to the window bounds
    pub fn apply(&mut self, delta: i64) -> u32 {
        let next = (self.cwnd as i64 + delta).clamp(self.min as i64, self.max as i64);
        self.cwnd = next as u32;
        self.cwnd
    }

    /// Apply the adjustment for `verdict`, returning the delta used
    pub fn on_verdict(&mut self, verdict: Verdict) -> i64 {
        let delta = self.adjustment(verdict);
        self.apply(delta);
        delta
    }

    /// Requests that still fit with `in_flight` outstanding
    pub fn available(&self, in_flight: usize) -> usize {
        (self.cwnd as usize).saturating_sub(in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_up_grows_by_one() {
        let mut window = RequestWindow::new(4, 1, 256);
        window.on_verdict(Verdict::SpeedUp);
        assert_eq!(window.cwnd(), 5);
        window.on_verdict(Verdict::Maintain);
        assert_eq!(window.cwnd(), 5);
    }

    #[test]
    fn test_timeout_dominates_slow_down() {
        for cwnd in 1..=256 {
            let window = RequestWindow::new(cwnd, 1, 256);
            let slow = window.adjustment(Verdict::SlowDown);
            let timeout = window.adjustment(Verdict::Timeout);
            assert!(timeout <= slow, "cwnd {}: {} > {}", cwnd, timeout, slow);
            assert!(slow < 0);
        }
    }

    #[test]
    fn test_bounds() {
        let mut window = RequestWindow::new(2, 2, 3);
        window.on_verdict(Verdict::Timeout);
        assert_eq!(window.cwnd(), 2);
        window.apply(100);
        assert_eq!(window.cwnd(), 3);
    }

    #[test]
    fn test_initial_is_clamped() {
        assert_eq!(RequestWindow::new(0, 1, 8).cwnd(), 1);
        assert_eq!(RequestWindow::new(50, 1, 8).cwnd(), 8);
    }

    #[test]
    fn test_available() {
        let window = RequestWindow::new(4, 1, 8);
        assert_eq!(window.available(1), 3);
        assert_eq!(window.available(9), 0);
    }
}
