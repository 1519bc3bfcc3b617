use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    at: Instant,
}

/// Measures transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window`: time span speed is averaged over (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
                window: window.unwrap_or(DEFAULT_WINDOW),
            }),
        }
    }

    /// Records that `bytes` were moved just now.
    pub fn record(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push_back(SpeedSample { bytes, at: now });

        let cutoff = now.checked_sub(s.window);
        while let Some(front) = s.samples.front() {
            let expired = cutoff.is_some_and(|c| front.at < c);
            if expired || s.samples.len() > s.max_samples {
                s.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average speed in bytes/second across the window.
    ///
    /// The first sample only marks the start of the window, so fewer than
    /// two samples yield 0.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        let (Some(first), Some(last)) = (s.samples.front(), s.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }

        let moved: u64 = s.samples.iter().skip(1).map(|sample| sample.bytes).sum();
        moved as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining` more bytes at the current speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// Clears all samples, e.g. after a pause.
    pub fn reset(&self) {
        self.inner.lock().unwrap().samples.clear();
    }
}
