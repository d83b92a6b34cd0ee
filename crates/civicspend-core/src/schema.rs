/// Arrow schema definitions for the engineered feature table.
pub mod features {
    use arrow::datatypes::{DataType, Field, Schema};

    /// Columns both detectors read, in matrix order.
    pub const FEATURE_COLUMNS: [&str; 16] = [
        "log_obligation",
        "log_award_count",
        "log_avg_size",
        "log_rolling_3m_mean",
        "log_rolling_3m_mad",
        "mom_pct_change",
        "month_sin",
        "month_cos",
        "vendor_tenure",
        "deviation_from_median",
        "cv",
        "size_concentration",
        "rolling_trend",
        "volatility",
        "percentile_rank",
        "z_score_vendor",
    ];

    /// Identity and base-aggregate columns that precede the features.
    pub const KEY_COLUMNS: [&str; 8] = [
        "vendor_id",
        "vendor_name",
        "year_month",
        "obligation_sum",
        "award_count",
        "avg_award_size",
        "rolling_3m_mean",
        "rolling_3m_mad",
    ];

    /// Schema for one row per (vendor, month) with the full feature vector.
    pub fn feature_table_schema() -> Schema {
        let mut fields = vec![
            Field::new("vendor_id", DataType::Utf8, false),
            Field::new("vendor_name", DataType::Utf8, false),
            Field::new("year_month", DataType::Utf8, false),
            Field::new("obligation_sum", DataType::Float64, false),
            Field::new("award_count", DataType::UInt32, false),
            Field::new("avg_award_size", DataType::Float64, false),
            Field::new("rolling_3m_mean", DataType::Float64, false),
            Field::new("rolling_3m_mad", DataType::Float64, false),
        ];
        fields.extend(
            FEATURE_COLUMNS
                .iter()
                .map(|name| Field::new(*name, DataType::Float64, false)),
        );
        Schema::new(fields)
    }
}
