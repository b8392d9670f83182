//! Debounced threshold detection for noisy readings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reading-versus-threshold test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// reading < threshold
    #[serde(alias = "<")]
    Lt,
    /// reading <= threshold
    #[serde(alias = "<=")]
    Le,
    /// reading > threshold
    #[serde(alias = ">")]
    Gt,
    /// reading >= threshold
    #[serde(alias = ">=")]
    Ge,
}

impl Comparison {
    /// Apply the test.
    pub fn holds(self, reading: f64, threshold: f64) -> bool {
        match self {
            Comparison::Lt => reading < threshold,
            Comparison::Le => reading <= threshold,
            Comparison::Gt => reading > threshold,
            Comparison::Ge => reading >= threshold,
        }
    }

    /// The opposite direction, boundary included on the other side.
    pub fn inverted(self) -> Self {
        match self {
            Comparison::Lt => Comparison::Ge,
            Comparison::Le => Comparison::Gt,
            Comparison::Gt => Comparison::Le,
            Comparison::Ge => Comparison::Lt,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        })
    }
}

/// Waits for `n` consecutive readings that pass a [`Comparison`].
///
/// Any failing reading, or a missing one, restarts the count.
#[derive(Debug, Clone)]
pub struct ThresholdLastNValues {
    n: usize,
    comparison: Comparison,
    threshold: f64,
    consecutive: usize,
}

impl ThresholdLastNValues {
    /// `n` is clamped to at least 1.
    pub fn new(n: usize, comparison: Comparison, threshold: f64) -> Self {
        Self {
            n: n.max(1),
            comparison,
            threshold,
            consecutive: 0,
        }
    }

    /// Feed one reading. Returns `true` while the caller should keep waiting.
    pub fn update_evaluate(&mut self, reading: Option<f64>) -> bool {
        match reading {
            Some(r) if self.comparison.holds(r, self.threshold) => {
                self.consecutive = (self.consecutive + 1).min(self.n);
            }
            _ => self.consecutive = 0,
        }
        self.consecutive < self.n
    }

    /// Passing readings in the current run.
    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    /// Threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Comparison.
    pub fn comparison(&self) -> Comparison {
        self.comparison
    }
}
