//! Pipeline configuration.
//!
//! Constructed once by the caller and passed down to each stage. Every field
//! has a default, so a partial JSON document only overrides what it names.

use serde::{Deserialize, Serialize};

use crate::types::Severity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum similarity (0–100) for a name to join an existing vendor.
    pub fuzzy_threshold: f64,
    pub robust: RobustConfig,
    pub ml: MlConfig,
    pub evidence: EvidenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 85.0,
            robust: RobustConfig::default(),
            ml: MlConfig::default(),
            evidence: EvidenceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a (possibly partial) JSON document over the defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Modified z-score detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustConfig {
    /// A month is flagged when |z| exceeds this.
    pub z_threshold: f64,
    /// Vendors with fewer months are skipped.
    pub min_months: usize,
    pub severity: ZSeverityBreakpoints,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.5,
            min_months: 3,
            severity: ZSeverityBreakpoints::default(),
        }
    }
}

/// Severity cut-offs on |z|, independent of the detection threshold.
///
/// With the default threshold of 3.5 nothing below `high` can be flagged, so
/// `low` is unreachable unless the threshold is lowered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZSeverityBreakpoints {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for ZSeverityBreakpoints {
    fn default() -> Self {
        Self {
            critical: 4.0,
            high: 3.5,
            medium: 3.0,
        }
    }
}

impl ZSeverityBreakpoints {
    /// Band for an absolute z-score; strict `>` at every breakpoint.
    pub fn classify(&self, abs_z: f64) -> Severity {
        if abs_z > self.critical {
            Severity::Critical
        } else if abs_z > self.high {
            Severity::High
        } else if abs_z > self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Isolation-forest detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Expected anomaly rate; sets the decision boundary.
    pub contamination: f64,
    pub n_estimators: usize,
    /// Per-tree subsample cap.
    pub max_samples: usize,
    /// Training fails below this many feature rows.
    pub min_samples: usize,
    pub seed: u64,
    pub severity: ScoreSeverityBands,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            n_estimators: 200,
            max_samples: 256,
            min_samples: 10,
            seed: 42,
            severity: ScoreSeverityBands::default(),
        }
    }
}

/// Severity cut-offs on the ensemble score (more negative = worse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreSeverityBands {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for ScoreSeverityBands {
    fn default() -> Self {
        Self {
            critical: -0.5,
            high: -0.3,
            medium: -0.1,
        }
    }
}

impl ScoreSeverityBands {
    /// Band for an ensemble score; strict `<` at every breakpoint.
    pub fn classify(&self, score: f64) -> Severity {
        if score < self.critical {
            Severity::Critical
        } else if score < self.high {
            Severity::High
        } else if score < self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Contributing awards listed per anomaly.
    pub top_n: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self { top_n: 5 }
    }
}
