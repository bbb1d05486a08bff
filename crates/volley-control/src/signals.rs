//! Host signal sampling and trend scoring for the adaptive controller.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use sysinfo::System;

/// One host sample: 1-minute load average and free/total memory ratio.
#[derive(Clone, Copy, Debug)]
pub struct HostSample {
    pub cpu_load: f64,
    pub mem_free_ratio: f64,
}

/// Source of host samples. The production probe reads the OS; tests feed
/// synthetic values.
pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostSample;
}

/// `sysinfo`-backed probe.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> HostSample {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total = system.total_memory();
        let free = system.free_memory();
        let mem_free_ratio = if total == 0 {
            1.0
        } else {
            free as f64 / total as f64
        };
        HostSample {
            cpu_load: System::load_average().one,
            mem_free_ratio,
        }
    }
}

/// Bounded sample window with a running mean.
#[derive(Clone, Debug)]
pub struct MovingWindow {
    values: VecDeque<f64>,
    cap: usize,
}

impl MovingWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        if self.values.len() > self.cap {
            self.values.pop_front();
        }
    }

    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// The sample before the latest one.
    pub fn previous(&self) -> Option<f64> {
        if self.values.len() < 2 {
            return None;
        }
        self.values.get(self.values.len() - 2).copied()
    }
}

/// Per-sample trend: +1 above a 10% rise, -1 below a 10% fall, else 0.
pub fn trend(latest: f64, previous: f64) -> i8 {
    if latest > previous * 1.1 {
        1
    } else if latest < previous * 0.9 {
        -1
    } else {
        0
    }
}

/// Mean of the last few per-sample trends, in [-1, 1].
#[derive(Clone, Debug)]
pub struct TrendWindow {
    samples: VecDeque<i8>,
    cap: usize,
}

impl TrendWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Records the trend between the window's two newest samples; windows
    /// with fewer than two samples record a flat trend.
    pub fn observe(&mut self, window: &MovingWindow) {
        let sample = match (window.latest(), window.previous()) {
            (Some(latest), Some(previous)) => trend(latest, previous),
            _ => 0,
        };
        self.samples.push_back(sample);
        if self.samples.len() > self.cap {
            self.samples.pop_front();
        }
    }

    pub fn score(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| *s as f64).sum::<f64>() / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_uses_ten_percent_bands() {
        assert_eq!(trend(1.2, 1.0), 1);
        assert_eq!(trend(0.8, 1.0), -1);
        assert_eq!(trend(1.05, 1.0), 0);
        assert_eq!(trend(0.95, 1.0), 0);
    }

    #[test]
    fn moving_window_caps_and_averages() {
        let mut window = MovingWindow::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            window.push(value);
        }
        assert_eq!(window.latest(), Some(4.0));
        assert_eq!(window.previous(), Some(3.0));
        assert!((window.average() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trend_window_scores_mean_of_samples() {
        let mut window = MovingWindow::new(5);
        let mut trends = TrendWindow::new(3);
        for value in [1.0, 1.5, 2.25, 2.2] {
            window.push(value);
            trends.observe(&window);
        }
        // Trends observed: 0 (single sample), +1, +1, 0 -> last three are +1, +1, 0.
        assert!((trends.score() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn sysinfo_probe_returns_sane_ratios() {
        let probe = SysinfoProbe::new();
        let sample = probe.sample();
        assert!(sample.mem_free_ratio >= 0.0 && sample.mem_free_ratio <= 1.0);
        assert!(sample.cpu_load >= 0.0);
    }
}
