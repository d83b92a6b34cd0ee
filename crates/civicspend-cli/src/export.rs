//! Report export: JSON with full evidence, or the anomaly list as CSV.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use civicspend_engine::Pipeline;
use civicspend_store::DuckStore;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Serialize)]
struct JsonReport<'a, T: Serialize> {
    run_id: &'a str,
    generated_at: String,
    anomalies: T,
}

/// Write the run's stored anomalies to `output`. Returns the anomaly count.
pub fn export_run(
    store: &DuckStore,
    pipeline: &Pipeline<'_>,
    run_id: &str,
    format: ExportFormat,
    output: &Path,
) -> anyhow::Result<usize> {
    match format {
        ExportFormat::Csv => store
            .export_anomalies_csv(run_id, output)
            .with_context(|| format!("writing {}", output.display())),
        ExportFormat::Json => {
            let reports = pipeline.reports(run_id)?;
            let file = File::create(output)
                .with_context(|| format!("creating {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(
                &mut writer,
                &JsonReport {
                    run_id,
                    generated_at: chrono::Utc::now().to_rfc3339(),
                    anomalies: &reports,
                },
            )?;
            writer.flush()?;
            Ok(reports.len())
        }
    }
}
