//! Evidence assembly for flagged vendor-months.
//!
//! Reconstructs the contributing awards, the vendor's historical context and
//! a fixed-template narrative. Nothing here is generated free-form.

use civicspend_core::{Anomaly, EvidenceItem, VendorContext, YearMonth};
use civicspend_store::DuckStore;
use serde::Serialize;
use tracing::debug;

use crate::EngineError;

/// Sentence appended to every narrative.
pub const DISCLAIMER: &str = "A deviation from past spending is not evidence of wrongdoing; \
     it marks a month that may merit review by someone with context on the contracts involved.";

/// Anomaly with everything needed to explain it.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub anomaly: Anomaly,
    pub evidence: Vec<EvidenceItem>,
    pub context: Option<VendorContext>,
    pub narrative: Option<String>,
}

pub struct EvidenceAssembler<'a> {
    store: &'a DuckStore,
}

impl<'a> EvidenceAssembler<'a> {
    pub fn new(store: &'a DuckStore) -> Self {
        Self { store }
    }

    /// The `top_n` largest awards for a vendor-month, each with its share of
    /// the whole month's obligation (not just of the returned items).
    pub fn build_evidence(
        &self,
        run_id: &str,
        vendor_id: &str,
        month: YearMonth,
        top_n: usize,
    ) -> Result<Vec<EvidenceItem>, EngineError> {
        let mut awards: Vec<_> = self
            .store
            .vendor_awards(run_id, vendor_id)?
            .into_iter()
            .filter(|a| a.month() == Some(month))
            .collect();
        let total: f64 = awards.iter().map(|a| a.obligation_amount).sum();

        awards.sort_by(|a, b| {
            b.obligation_amount
                .total_cmp(&a.obligation_amount)
                .then_with(|| a.award_id.cmp(&b.award_id))
        });

        let items: Vec<EvidenceItem> = awards
            .into_iter()
            .take(top_n)
            .map(|a| EvidenceItem {
                pct_of_month: share_pct(a.obligation_amount, total),
                award_id: a.award_id,
                recipient_name: a.recipient_name,
                agency: a.awarding_agency,
                action_date: a.action_date,
                amount: a.obligation_amount,
            })
            .collect();
        debug!(run_id, vendor_id, month = %month, items = items.len(), "built evidence");
        Ok(items)
    }

    /// Historical summary of the vendor within the run, absent when the
    /// vendor has no monthly rows there.
    pub fn get_vendor_context(
        &self,
        run_id: &str,
        vendor_id: &str,
    ) -> Result<Option<VendorContext>, EngineError> {
        Ok(self.store.vendor_context(run_id, vendor_id)?)
    }

    /// Evidence, context and narrative for one anomaly.
    pub fn explain(&self, anomaly: &Anomaly, top_n: usize) -> Result<AnomalyReport, EngineError> {
        let evidence = self.build_evidence(
            &anomaly.run_id,
            &anomaly.vendor_id,
            anomaly.year_month,
            top_n,
        )?;
        let context = self.get_vendor_context(&anomaly.run_id, &anomaly.vendor_id)?;
        let narrative = context
            .as_ref()
            .map(|ctx| generate_narrative(anomaly, &evidence, ctx));
        Ok(AnomalyReport {
            anomaly: anomaly.clone(),
            evidence,
            context,
            narrative,
        })
    }
}

/// Percentage share, clamped to 0–100; zero when the total is not positive.
fn share_pct(amount: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (amount / total * 100.0).clamp(0.0, 100.0)
}

/// Fixed-template prose for an anomaly.
pub fn generate_narrative(
    anomaly: &Anomaly,
    evidence: &[EvidenceItem],
    context: &VendorContext,
) -> String {
    let mut lines = vec![
        format!(
            "{} showed a {} spending anomaly in {}.",
            context.name,
            anomaly.severity.as_str(),
            anomaly.year_month
        ),
        String::new(),
    ];

    if context.avg_monthly != 0.0 {
        let pct_change = (anomaly.value - context.avg_monthly) / context.avg_monthly.abs() * 100.0;
        let direction = if pct_change >= 0.0 { "increased" } else { "decreased" };
        lines.push(format!(
            "Monthly spending {direction} to {} from a typical {} ({:.1}% change).",
            money(anomaly.value),
            money(context.avg_monthly),
            pct_change.abs()
        ));
    } else {
        lines.push(format!(
            "Monthly spending was {} against a typical month of {}.",
            money(anomaly.value),
            money(context.avg_monthly)
        ));
    }

    lines.push(String::new());
    lines.push("Key facts:".to_string());
    lines.push(format!("- Total awards this month: {}", anomaly.award_count));
    lines.push(format!(
        "- Historical range: {} - {}",
        money(context.min_monthly),
        money(context.max_monthly)
    ));
    lines.push(format!("- Months active: {}", context.months_active));

    if !evidence.is_empty() {
        lines.push(String::new());
        lines.push("Top contributing awards:".to_string());
        lines.extend(evidence.iter().take(3).enumerate().map(|(i, item)| {
            format!(
                "{}. {} from {} ({:.1}% of month)",
                i + 1,
                money(item.amount),
                item.agency.as_deref().unwrap_or("an unknown agency"),
                item.pct_of_month
            )
        }));
    }

    lines.push(String::new());
    lines.push(DISCLAIMER.to_string());
    lines.join("\n")
}

/// `$1,234,567.89` style formatting; negatives as `-$12.00`.
pub fn money(value: f64) -> String {
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}${grouped}.{:02}", cents % 100)
}
