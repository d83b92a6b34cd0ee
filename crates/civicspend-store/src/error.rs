use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("import file not found: {0}")]
    FileNotFound(std::path::PathBuf),

    #[error("award {award_id} already ingested for run {run_id}")]
    DuplicateAward { run_id: String, award_id: String },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run {run_id} is already {status} and cannot change")]
    RunFinalized { run_id: String, status: &'static str },

    #[error("no results for query")]
    NoResults,

    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}
