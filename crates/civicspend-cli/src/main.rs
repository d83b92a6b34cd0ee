//! `civicspend`: vendor spending anomaly detection over contract awards.

mod demo;
mod display;
mod export;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use civicspend_core::{PipelineConfig, RunStatus, YearMonth};
use civicspend_engine::{DetectMethod, FeatureEngineer, Pipeline};
use civicspend_store::DuckStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::export::ExportFormat;

#[derive(Parser)]
#[command(name = "civicspend", version)]
#[command(about = "Flag unusual monthly vendor spending in public contract awards", long_about = None)]
struct Cli {
    /// DuckDB database file
    #[arg(long, global = true, env = "CIVICSPEND_DB", default_value = "civicspend.duckdb")]
    db: PathBuf,

    /// JSON file overriding default pipeline settings
    #[arg(long, global = true, env = "CIVICSPEND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database tables
    Init,

    /// Load seeded synthetic awards into a run
    Demo {
        #[arg(long)]
        run_id: Option<String>,
        /// Number of base awards (the spike adds three more)
        #[arg(long, default_value_t = 200)]
        awards: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// First month covered, YYYY-MM
        #[arg(long, default_value = "2024-01")]
        start: YearMonth,
        #[arg(long, default_value_t = 12)]
        months: u32,
        /// Leave out the injected spending spike
        #[arg(long)]
        no_spike: bool,
    },

    /// Import raw awards from a CSV or Parquet file
    Import {
        #[arg(long)]
        run_id: Option<String>,
        file: PathBuf,
    },

    /// Resolve recipient names to vendor entities
    Resolve {
        #[arg(long)]
        run_id: String,
        /// Similarity threshold, 0-100
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Build monthly vendor aggregates
    Aggregate {
        #[arg(long)]
        run_id: String,
    },

    /// Show the engineered feature table
    Features {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Run anomaly detectors and store their findings
    Detect {
        #[arg(long)]
        run_id: String,
        #[arg(long, value_enum, default_value_t = Method::Statistical)]
        method: Method,
        /// |z| above which a month is flagged
        #[arg(long)]
        threshold: Option<f64>,
        /// Run whose saved model scores this run (defaults to the same run)
        #[arg(long)]
        model_run: Option<String>,
    },

    /// Train and save the outlier model on a run
    Train {
        #[arg(long)]
        run_id: String,
        /// Expected anomaly rate
        #[arg(long)]
        contamination: Option<f64>,
    },

    /// Explain stored anomalies with evidence and narrative
    Explain {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        vendor: Option<String>,
        #[arg(long)]
        month: Option<YearMonth>,
        #[arg(long)]
        top_n: Option<usize>,
    },

    /// Export stored anomalies
    Export {
        #[arg(long)]
        run_id: String,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        #[arg(long)]
        output: PathBuf,
    },

    /// Resolve, aggregate and detect in one pass
    Run {
        #[arg(long)]
        run_id: String,
        #[arg(long, value_enum, default_value_t = Method::Both)]
        method: Method,
    },

    /// Show a run's manifest entry
    Status {
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Method {
    Statistical,
    Ml,
    Both,
}

impl From<Method> for DetectMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Statistical => DetectMethod::Statistical,
            Method::Ml => DetectMethod::Ml,
            Method::Both => DetectMethod::Both,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    let store = DuckStore::open_persistent(&cli.db)
        .with_context(|| format!("opening {}", cli.db.display()))?;
    info!(db = %cli.db.display(), "civicspend v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Init => {
            println!("Database ready at {}", cli.db.display());
        }

        Command::Demo {
            run_id,
            awards,
            seed,
            start,
            months,
            no_spike,
        } => {
            let run_id = run_id.unwrap_or_else(new_run_id);
            let opts = demo::DemoOptions {
                awards,
                seed,
                start,
                months,
                spike: !no_spike,
            };
            if store.run(&run_id)?.is_some() {
                bail!("run {run_id} already exists; pick another --run-id");
            }
            let generated = demo::generate(&run_id, &opts);
            store.create_run(&run_id)?;
            for award in &generated {
                store.insert_raw_award(award)?;
            }
            store.set_run_status(&run_id, RunStatus::Pending, Some(generated.len() as u64))?;
            println!("Loaded {} synthetic awards into run {run_id}", generated.len());
            if opts.spike {
                println!(
                    "  spike: {} in {}",
                    demo::SPIKE_VENDOR,
                    demo::spike_month(&opts)
                );
            }
        }

        Command::Import { run_id, file } => {
            let run_id = run_id.unwrap_or_else(new_run_id);
            if store.run(&run_id)?.is_none() {
                store.create_run(&run_id)?;
            }
            let n = store
                .import_raw_awards(&run_id, &file)
                .with_context(|| format!("importing {}", file.display()))?;
            let total = store.raw_award_count(&run_id)?;
            store.set_run_status(&run_id, RunStatus::Pending, Some(total as u64))?;
            println!("Imported {n} awards into run {run_id}");
        }

        Command::Resolve { run_id, threshold } => {
            if let Some(t) = threshold {
                config.fuzzy_threshold = t;
            }
            let vendors = Pipeline::new(&store, config).resolve(&run_id)?;
            println!("Run {run_id}: awards map to {vendors} vendors");
        }

        Command::Aggregate { run_id } => {
            let rows = Pipeline::new(&store, config).aggregate(&run_id)?;
            println!("Run {run_id}: {rows} vendor-month rows");
        }

        Command::Features { run_id, limit } => {
            let table = FeatureEngineer::new(&store).engineer_features(&run_id)?;
            if table.is_empty() {
                println!("Run {run_id} has no monthly rows; run `aggregate` first.");
            } else {
                display::print_batch(&table.to_record_batch()?, limit)?;
            }
        }

        Command::Detect {
            run_id,
            method,
            threshold,
            model_run,
        } => {
            if let Some(t) = threshold {
                config.robust.z_threshold = t;
            }
            let mut anomalies = Pipeline::new(&store, config).detect(
                &run_id,
                method.into(),
                model_run.as_deref(),
            )?;
            anomalies.sort_by(|a, b| b.severity.cmp(&a.severity));
            display::print_anomaly_table(&anomalies);
        }

        Command::Train {
            run_id,
            contamination,
        } => {
            if let Some(c) = contamination {
                config.ml.contamination = c;
            }
            let samples = Pipeline::new(&store, config).train(&run_id)?;
            println!("Trained on {samples} vendor-months; model saved for run {run_id}");
        }

        Command::Explain {
            run_id,
            vendor,
            month,
            top_n,
        } => {
            if let Some(n) = top_n {
                config.evidence.top_n = n;
            }
            let reports: Vec<_> = Pipeline::new(&store, config)
                .reports(&run_id)?
                .into_iter()
                .filter(|r| vendor.as_deref().is_none_or(|v| r.anomaly.vendor_id == v))
                .filter(|r| month.is_none_or(|m| r.anomaly.year_month == m))
                .collect();
            if reports.is_empty() {
                println!("No stored anomalies match; run `detect` first.");
            }
            for report in &reports {
                display::print_report_card(report);
            }
        }

        Command::Export {
            run_id,
            format,
            output,
        } => {
            let pipeline = Pipeline::new(&store, config);
            let n = export::export_run(&store, &pipeline, &run_id, format, &output)?;
            println!("Exported {n} anomalies to {}", output.display());
        }

        Command::Run { run_id, method } => {
            let summary = Pipeline::new(&store, config).run(&run_id, method.into())?;
            display::print_run_summary(&summary);
        }

        Command::Status { run_id } => match store.run(&run_id)? {
            Some(run) => display::print_run(&run),
            None => bail!("unknown run {run_id}"),
        },
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    PipelineConfig::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn new_run_id() -> String {
    chrono::Utc::now().format("run_%Y%m%d_%H%M%S").to_string()
}
