//! Terminal rendering for anomalies, reports and the feature table.

use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use civicspend_core::{Anomaly, Run};
use civicspend_engine::evidence::money;
use civicspend_engine::{AnomalyReport, RunSummary};

// ── Tables ──

/// One line per anomaly, most severe first.
pub fn print_anomaly_table(anomalies: &[Anomaly]) {
    if anomalies.is_empty() {
        println!("No anomalies.");
        return;
    }
    println!(
        "{:<9} {:<12} {:<28} {:<8} {:>10} {:>18} {:>7}",
        "SEVERITY", "DETECTOR", "VENDOR", "MONTH", "SCORE", "VALUE", "AWARDS"
    );
    for a in anomalies {
        let name = a.vendor_name.as_deref().unwrap_or(&a.vendor_id);
        println!(
            "{:<9} {:<12} {:<28} {:<8} {:>10.3} {:>18} {:>7}",
            a.severity.as_str(),
            a.detector.as_str(),
            truncate(name, 28),
            a.year_month.to_string(),
            a.score,
            money(a.value),
            a.award_count
        );
    }
}

/// First `limit` rows of an Arrow batch as a bordered table.
pub fn print_batch(batch: &RecordBatch, limit: usize) -> anyhow::Result<()> {
    let shown = batch.slice(0, limit.min(batch.num_rows()));
    println!("{}", pretty_format_batches(&[shown])?);
    if batch.num_rows() > limit {
        println!("... and {} more rows", batch.num_rows() - limit);
    }
    Ok(())
}

// ── Cards ──

pub fn print_report_card(report: &AnomalyReport) {
    let a = &report.anomaly;
    let name = report
        .context
        .as_ref()
        .map(|c| c.name.as_str())
        .or(a.vendor_name.as_deref())
        .unwrap_or(&a.vendor_id);

    println!("=== {} · {} ===", name, a.year_month);
    println!(
        "  {:<14} {} ({}, score {:.3})",
        "severity",
        a.severity.as_str(),
        a.detector.as_str(),
        a.score
    );
    println!("  {:<14} {}", "vendor_id", a.vendor_id);
    println!("  {:<14} {}", "month total", money(a.value));
    println!("  {:<14} {}", "awards", a.award_count);

    if let Some(ctx) = &report.context {
        println!();
        println!("History");
        println!("  {:<14} {}", "months active", ctx.months_active);
        println!("  {:<14} {}", "average", money(ctx.avg_monthly));
        println!(
            "  {:<14} {} - {}",
            "range",
            money(ctx.min_monthly),
            money(ctx.max_monthly)
        );
        println!("  {:<14} {}", "total", money(ctx.total_spend));
    }

    if !report.evidence.is_empty() {
        println!();
        println!("Evidence");
        for item in &report.evidence {
            println!(
                "  {:<22} {:>16} {:>6.1}%  {}  {}",
                item.award_id,
                money(item.amount),
                item.pct_of_month,
                item.action_date.as_deref().unwrap_or("-"),
                item.agency.as_deref().unwrap_or("-")
            );
        }
    }

    if let Some(text) = &report.narrative {
        println!();
        for line in text.lines() {
            println!("  {line}");
        }
    }
    println!();
}

// ── Summaries ──

pub fn print_run_summary(summary: &RunSummary) {
    println!("Run {}", summary.run_id);
    println!("  {:<24} {}", "raw awards", summary.raw_awards);
    println!("  {:<24} {}", "vendors", summary.vendors);
    println!("  {:<24} {}", "vendor-months", summary.monthly_rows);
    println!(
        "  {:<24} {}",
        "statistical anomalies", summary.statistical_anomalies
    );
    match summary.ml_anomalies {
        Some(n) => println!("  {:<24} {}", "ml anomalies", n),
        None => println!("  {:<24} skipped", "ml anomalies"),
    }
}

pub fn print_run(run: &Run) {
    println!(
        "Run {}  status={}  raw_awards={}  created={}",
        run.run_id,
        run.status.as_str(),
        run.row_count_raw,
        run.created_at
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
