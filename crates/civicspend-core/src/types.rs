//! Plain records shared by every pipeline stage.
//!
//! Every record carries the run identifier it belongs to (directly or via
//! the query that produced it); the store never mixes runs.

use serde::{Deserialize, Serialize};

use crate::month::YearMonth;

/// Lifecycle of one ingestion batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One ingestion/analysis batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    /// RFC 3339 timestamp string.
    pub created_at: String,
    pub row_count_raw: u64,
}

/// One contracting transaction as ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAward {
    pub run_id: String,
    pub award_id: String,
    pub recipient_name: String,
    /// Tax/registration identifier (DUNS/UEI); short-circuits fuzzy matching.
    pub recipient_strong_id: Option<String>,
    pub awarding_agency: Option<String>,
    /// ISO date string as received; may be missing or malformed.
    pub action_date: Option<String>,
    /// Signed: negative values are de-obligations.
    pub obligation_amount: f64,
    pub place_of_performance: Option<String>,
}

impl RawAward {
    /// Month the award falls in, if its action date parses.
    pub fn month(&self) -> Option<YearMonth> {
        self.action_date
            .as_deref()
            .and_then(YearMonth::from_action_date)
    }
}

/// A resolved, canonical vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorEntity {
    pub vendor_id: String,
    /// The first raw name seen for this vendor, unnormalised.
    pub canonical_name: String,
    /// Strong identifier that created the entity, if any.
    pub strong_id: Option<String>,
}

/// One (run, vendor, month) aggregate, before feature engineering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    pub run_id: String,
    pub vendor_id: String,
    pub year_month: YearMonth,
    pub obligation_sum: f64,
    pub award_count: u32,
    pub avg_award_size: f64,
    pub rolling_3m_mean: f64,
    pub rolling_3m_mad: f64,
}

/// Which detector produced an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Statistical,
    Ml,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Statistical => "statistical",
            Self::Ml => "ml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "statistical" => Some(Self::Statistical),
            "ml" => Some(Self::Ml),
            _ => None,
        }
    }
}

/// Severity band of a flagged month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A flagged (run, vendor, month) from one detector.
///
/// The two detectors are independent views: the same month may be flagged
/// by both, and nothing deduplicates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub run_id: String,
    pub vendor_id: String,
    pub vendor_name: Option<String>,
    pub year_month: YearMonth,
    pub detector: DetectorKind,
    pub severity: Severity,
    /// Signed modified z-score (statistical) or ensemble score (ml, more
    /// negative = more anomalous).
    pub score: f64,
    /// Observed obligation sum for the month.
    pub value: f64,
    pub award_count: u32,
}

/// One contributing award behind an anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub award_id: String,
    pub recipient_name: String,
    pub agency: Option<String>,
    pub action_date: Option<String>,
    pub amount: f64,
    /// Share of the whole vendor-month total, 0–100.
    pub pct_of_month: f64,
}

/// Historical summary of one vendor within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorContext {
    pub vendor_id: String,
    pub name: String,
    pub months_active: u32,
    pub avg_monthly: f64,
    pub min_monthly: f64,
    pub max_monthly: f64,
    pub total_spend: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_roundtrip() {
        for s in [RunStatus::Pending, RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        for k in [DetectorKind::Statistical, DetectorKind::Ml] {
            assert_eq!(DetectorKind::parse(k.as_str()), Some(k));
        }
        for sev in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(Severity::parse(sev.as_str()), Some(sev));
        }
        assert_eq!(Severity::parse("severe"), None);
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn award_month_excludes_bad_dates() {
        let mut award = RawAward {
            run_id: "r1".into(),
            award_id: "A1".into(),
            recipient_name: "Acme".into(),
            recipient_strong_id: None,
            awarding_agency: None,
            action_date: Some("2024-05-17".into()),
            obligation_amount: -250.0,
            place_of_performance: None,
        };
        assert_eq!(award.month(), YearMonth::new(2024, 5));
        award.action_date = Some("not a date".into());
        assert_eq!(award.month(), None);
        award.action_date = None;
        assert_eq!(award.month(), None);
    }

    #[test]
    fn anomaly_json_shape() {
        let a = Anomaly {
            run_id: "r1".into(),
            vendor_id: "V000001".into(),
            vendor_name: Some("Acme".into()),
            year_month: YearMonth::new(2024, 6).unwrap(),
            detector: DetectorKind::Statistical,
            severity: Severity::Critical,
            score: 12.5,
            value: 1_000_000.0,
            award_count: 3,
        };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["year_month"], "2024-06");
        assert_eq!(json["detector"], "statistical");
        assert_eq!(json["severity"], "critical");
    }
}
