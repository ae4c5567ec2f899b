use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::telemetry::ActivityVector;

/// Steepness of the logistic decay
const STEEPNESS: f64 = 0.8;

/// Coarse engagement class of a tab, derived from its interaction counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Fingerprint {
    /// No interaction at all
    #[default]
    Ghost,
    /// Some clicking around
    Browser,
    /// Long scrolling sessions
    Reader,
    /// Typing or heavy clicking
    Creator,
}

impl Fingerprint {
    /// Multiplier applied to the baseline decay window
    pub fn window_multiplier(self) -> f64 {
        match self {
            Fingerprint::Creator => 2.0,
            Fingerprint::Reader => 1.5,
            Fingerprint::Browser | Fingerprint::Ghost => 1.0,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Fingerprint::Ghost => "Ghost",
            Fingerprint::Browser => "Browser",
            Fingerprint::Reader => "Reader",
            Fingerprint::Creator => "Creator",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceResult {
    /// Estimated continued interest, always in `[0, 1]`
    pub confidence: f64,
    pub fingerprint: Fingerprint,
}

/// Scores how likely it is that a human still wants a tab.
pub struct ConfidenceEngine;

impl ConfidenceEngine {
    /// Classify a vector. First match wins: Creator > Reader > Browser > Ghost.
    pub fn fingerprint(vector: &ActivityVector) -> Fingerprint {
        if vector.keys > 20 || vector.clicks > 10 {
            Fingerprint::Creator
        } else if vector.scrolls > 50 {
            Fingerprint::Reader
        } else if vector.clicks > 0 {
            Fingerprint::Browser
        } else {
            Fingerprint::Ghost
        }
    }

    /// Idle minutes at which confidence crosses 0.5
    pub fn decay_window(fingerprint: Fingerprint, baseline_minutes: f64) -> f64 {
        baseline_minutes * fingerprint.window_multiplier()
    }

    /// Logistic decay `1 / (1 + e^(k * (idle - window)))`, clamped to `[0, 1]`.
    ///
    /// An exponent too large to represent yields `0.0`.
    pub fn decay(idle_minutes: f64, window_minutes: f64) -> f64 {
        let exp = (STEEPNESS * (idle_minutes - window_minutes)).exp();
        if !exp.is_finite() {
            return 0.0;
        }
        let confidence = 1.0 / (1.0 + exp);
        if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        }
    }

    pub fn score(vector: &ActivityVector, idle_seconds: f64, config: &Config) -> ConfidenceResult {
        let fingerprint = Self::fingerprint(vector);
        let window = Self::decay_window(fingerprint, config.inactive_threshold_minutes);
        ConfidenceResult {
            confidence: Self::decay(idle_seconds / 60.0, window),
            fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(clicks: u64, keys: u64, scrolls: u64) -> ActivityVector {
        ActivityVector {
            clicks,
            keys,
            scrolls,
            ..ActivityVector::default()
        }
    }

    #[test]
    fn test_fingerprint_priority() {
        assert_eq!(ConfidenceEngine::fingerprint(&vector(0, 25, 100)), Fingerprint::Creator);
        assert_eq!(ConfidenceEngine::fingerprint(&vector(11, 0, 0)), Fingerprint::Creator);
        assert_eq!(ConfidenceEngine::fingerprint(&vector(5, 20, 51)), Fingerprint::Reader);
        assert_eq!(ConfidenceEngine::fingerprint(&vector(10, 20, 50)), Fingerprint::Browser);
        assert_eq!(ConfidenceEngine::fingerprint(&vector(0, 20, 50)), Fingerprint::Ghost);
    }

    #[test]
    fn test_window_scaling() {
        let base = 30.0;
        assert_eq!(ConfidenceEngine::decay_window(Fingerprint::Creator, base), 60.0);
        assert_eq!(ConfidenceEngine::decay_window(Fingerprint::Reader, base), 45.0);
        assert_eq!(ConfidenceEngine::decay_window(Fingerprint::Browser, base), 30.0);
        assert_eq!(ConfidenceEngine::decay_window(Fingerprint::Ghost, base), 30.0);
    }

    #[test]
    fn test_midpoint_is_half() {
        assert!((ConfidenceEngine::decay(30.0, 30.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fresh_tab_is_confident() {
        let result = ConfidenceEngine::score(&vector(0, 0, 0), 0.0, &Config::default());
        assert!(result.confidence > 0.5);
        assert_eq!(result.fingerprint, Fingerprint::Ghost);
    }

    #[test]
    fn test_monotonic_decrease() {
        let mut previous = ConfidenceEngine::decay(0.0, 30.0);
        for minute in 1..=60 {
            let current = ConfidenceEngine::decay(minute as f64, 30.0);
            assert!(current < previous, "not decreasing at {minute} min");
            previous = current;
        }
    }

    #[test]
    fn test_huge_idle_clamps_to_zero() {
        assert_eq!(ConfidenceEngine::decay(1e6, 30.0), 0.0);
        assert_eq!(ConfidenceEngine::decay(f64::INFINITY, 30.0), 0.0);
        assert_eq!(ConfidenceEngine::decay(f64::NAN, 30.0), 0.0);

        let result = ConfidenceEngine::score(&vector(0, 0, 0), f64::MAX, &Config::default());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_confidence_stays_in_unit_range() {
        for idle in [-1e9, -10.0, 0.0, 29.9, 30.0, 45.0, 1e3, 1e9] {
            let c = ConfidenceEngine::decay(idle, 30.0);
            assert!((0.0..=1.0).contains(&c), "{c} out of range for idle {idle}");
        }
    }

    #[test]
    fn test_creator_outlasts_ghost() {
        let config = Config::default();
        let idle = 40.0 * 60.0;
        let ghost = ConfidenceEngine::score(&vector(0, 0, 0), idle, &config);
        let creator = ConfidenceEngine::score(&vector(0, 30, 0), idle, &config);
        assert!(ghost.confidence < 0.05);
        assert!(creator.confidence > 0.5);
    }

    #[test]
    fn test_fingerprint_display() {
        assert_eq!(Fingerprint::Reader.to_string(), "Reader");
    }
}
