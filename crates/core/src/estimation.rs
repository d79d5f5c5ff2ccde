//! Processing-timeout estimation from a job's config payload.
//!
//! The local backend's runtime grows with the number of expensive
//! operations in the preset it is asked to apply. The estimator scans the
//! config text for cost markers and sizes the request timeout from a base
//! value plus a per-marker increment, capped per cost class. It is a
//! heuristic for the HTTP timeout only.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Markers
// ---------------------------------------------------------------------------

/// Section marker that enables the mask cost class.
pub const MASK_SECTION_MARKER: &str = "MaskGroupBasedCorrections";

/// One occurrence per actual mask inside the mask section.
pub const MASK_UNIT_MARKER: &str = "What = \"Mask/Image\"";

/// Local-adjustment operations, each counted once if present.
pub const COMPLEX_MARKERS: [&str; 4] = [
    "LocalizedCorrections",
    "CircularGradientBasedCorrections",
    "GradientBasedCorrections",
    "RetouchAreas",
];

// ---------------------------------------------------------------------------
// Cost classes
// ---------------------------------------------------------------------------

/// How a cost class counts its units in the config text.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerRule {
    /// Count every occurrence of one marker.
    Occurrences(String),
    /// Count how many of the listed markers appear at least once.
    Distinct(Vec<String>),
}

impl MarkerRule {
    fn count(&self, content: &str) -> u32 {
        match self {
            Self::Occurrences(marker) => content.matches(marker.as_str()).count() as u32,
            Self::Distinct(markers) => markers
                .iter()
                .filter(|m| content.contains(m.as_str()))
                .count() as u32,
        }
    }
}

/// One class of expensive operation with its own increment and ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct CostClass {
    pub name: String,
    /// When set, the class applies only if this marker is present, and then
    /// applies even with zero counted units.
    pub gate: Option<String>,
    pub rule: MarkerRule,
    pub increment: Duration,
    pub ceiling: Duration,
}

impl CostClass {
    /// Per-mask cost class.
    pub fn mask(increment: Duration, ceiling: Duration) -> Self {
        Self {
            name: "mask".to_string(),
            gate: Some(MASK_SECTION_MARKER.to_string()),
            rule: MarkerRule::Occurrences(MASK_UNIT_MARKER.to_string()),
            increment,
            ceiling,
        }
    }

    /// Miscellaneous local-adjustment cost class.
    pub fn complex(increment: Duration, ceiling: Duration) -> Self {
        Self {
            name: "complex".to_string(),
            gate: None,
            rule: MarkerRule::Distinct(COMPLEX_MARKERS.iter().map(|m| m.to_string()).collect()),
            increment,
            ceiling,
        }
    }
}

/// Result of an estimate, kept for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutEstimate {
    pub timeout: Duration,
    /// Name of the class that decided the timeout, `None` for the base.
    pub class: Option<String>,
    pub units: u32,
}

/// Estimates a processing timeout from config content.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutEstimator {
    pub base: Duration,
    /// Evaluated in order; the first applicable class wins.
    pub classes: Vec<CostClass>,
    /// Used when the config cannot be read at all.
    pub fallback: Duration,
}

impl Default for TimeoutEstimator {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            classes: vec![
                CostClass::mask(Duration::from_secs(5), Duration::from_secs(120)),
                CostClass::complex(Duration::from_secs(3), Duration::from_secs(60)),
            ],
            fallback: Duration::from_secs(30),
        }
    }
}

impl TimeoutEstimator {
    /// Estimate the timeout for a config payload.
    ///
    /// `min(base + units * increment, ceiling)` for the first applicable
    /// class, or `base` when no class applies.
    pub fn estimate(&self, content: &str) -> TimeoutEstimate {
        for class in &self.classes {
            let units = class.rule.count(content);
            let applies = match &class.gate {
                Some(gate) => content.contains(gate.as_str()),
                None => units > 0,
            };
            if !applies {
                continue;
            }

            let timeout = (self.base + class.increment * units).min(class.ceiling);
            return TimeoutEstimate {
                timeout,
                class: Some(class.name.clone()),
                units,
            };
        }

        TimeoutEstimate {
            timeout: self.base,
            class: None,
            units: 0,
        }
    }
}
