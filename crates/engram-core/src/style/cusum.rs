//! CUSUM Change-Point Detection
//!
//! Cumulative-sum control chart over rolling style vectors. Each update
//! measures the Euclidean deviation of the current vector from the mean of
//! the recent window and accumulates it into two one-sided sums; a sustained
//! shift drives one of the sums past the threshold and declares a change
//! point. Both sums reset on detection so the next stable update reads clean.

use std::collections::VecDeque;

/// Number of tracked style dimensions
pub const STYLE_DIMENSIONS: usize = 5;

/// Dimension names, index-aligned with [`StyleVector`]
pub const DIMENSION_NAMES: [&str; STYLE_DIMENSIONS] = [
    "formality",
    "verbosity",
    "emoji_density",
    "warmth",
    "expressiveness",
];

/// A point in style space
pub type StyleVector = [f64; STYLE_DIMENSIONS];

/// Default rolling window length
pub const DEFAULT_WINDOW: usize = 20;

/// Default slack parameter k
pub const DEFAULT_K: f64 = 0.5;

/// Default decision threshold
pub const DEFAULT_THRESHOLD: f64 = 3.0;

/// Outcome of one detector update
#[derive(Debug, Clone)]
pub struct CusumUpdate {
    /// A change point was declared on this update
    pub change_detected: bool,
    /// Euclidean deviation of the current vector from the window baseline
    pub deviation: f64,
    /// Per-dimension delta from the baseline, index-aligned with
    /// [`DIMENSION_NAMES`]. Meaningful mainly when a change was detected.
    pub dimension_deltas: StyleVector,
    /// Positive cumulative sum after the update (0 after a detection reset)
    pub cusum_pos: f64,
    /// Negative cumulative sum after the update (0 after a detection reset)
    pub cusum_neg: f64,
}

/// CUSUM detector state
#[derive(Debug, Clone)]
pub struct CusumDetector {
    window: VecDeque<StyleVector>,
    window_size: usize,
    k: f64,
    threshold: f64,
    cusum_pos: f64,
    cusum_neg: f64,
}

impl Default for CusumDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_K, DEFAULT_THRESHOLD)
    }
}

impl CusumDetector {
    /// Create a detector with explicit parameters
    pub fn new(window_size: usize, k: f64, threshold: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
            k,
            threshold,
            cusum_pos: 0.0,
            cusum_neg: 0.0,
        }
    }

    /// Mean of the rolling window; the zero vector while empty
    fn baseline(&self) -> StyleVector {
        let mut mean = [0.0; STYLE_DIMENSIONS];
        if self.window.is_empty() {
            return mean;
        }
        for vector in &self.window {
            for (m, v) in mean.iter_mut().zip(vector.iter()) {
                *m += v;
            }
        }
        for m in mean.iter_mut() {
            *m /= self.window.len() as f64;
        }
        mean
    }

    /// Feed the next style vector
    pub fn update(&mut self, current: StyleVector) -> CusumUpdate {
        let baseline = self.baseline();

        let mut dimension_deltas = [0.0; STYLE_DIMENSIONS];
        let mut squared = 0.0;
        for i in 0..STYLE_DIMENSIONS {
            let delta = current[i] - baseline[i];
            dimension_deltas[i] = delta;
            squared += delta * delta;
        }
        let deviation = squared.sqrt();

        self.cusum_pos = (self.cusum_pos + deviation - self.k).max(0.0);
        self.cusum_neg = (self.cusum_neg - deviation + self.k).max(0.0);

        let change_detected = self.cusum_pos > self.threshold || self.cusum_neg > self.threshold;
        if change_detected {
            self.cusum_pos = 0.0;
            self.cusum_neg = 0.0;
        }

        self.window.push_back(current);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        CusumUpdate {
            change_detected,
            deviation,
            dimension_deltas,
            cusum_pos: self.cusum_pos,
            cusum_neg: self.cusum_neg,
        }
    }

    /// Current positive sum
    pub fn cusum_pos(&self) -> f64 {
        self.cusum_pos
    }

    /// Current negative sum
    pub fn cusum_neg(&self) -> f64 {
        self.cusum_neg
    }
}

// ============================================================================
// TESTS
// ============================================================================
