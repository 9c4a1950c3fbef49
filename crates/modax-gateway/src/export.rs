//! Aggregate export
//!
//! Flattens recorded aggregates into the fixed export row shape. Channels
//! the device does not publish stay empty (CSV) or null (JSON). Rows are
//! sorted ascending by timestamp.

use serde::Serialize;

use modax_core::model::Aggregate;

/// CSV header, fixed by the export contract.
pub const CSV_HEADER: &str =
    "timestamp,device_id,current_a,current_b,current_c,vibration,temperature,rpm,power_kw";

/// Longest export range in hours (7 days).
pub const MAX_EXPORT_HOURS: f64 = 168.0;

/// One export row. `rpm` and `power_kw` are part of the contract but no
/// current device publishes them.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub timestamp: f64,
    pub device_id: String,
    pub current_a: Option<f64>,
    pub current_b: Option<f64>,
    pub current_c: Option<f64>,
    pub vibration: Option<f64>,
    pub temperature: Option<f64>,
    pub rpm: Option<f64>,
    pub power_kw: Option<f64>,
}

impl ExportRow {
    pub fn from_aggregate(device_id: &str, agg: &Aggregate) -> Self {
        Self {
            timestamp: agg.time_window_end,
            device_id: device_id.to_string(),
            current_a: agg.current_mean.first().copied(),
            current_b: agg.current_mean.get(1).copied(),
            current_c: agg.current_mean.get(2).copied(),
            vibration: Some(agg.vibration_mean.magnitude),
            temperature: agg.temperature_mean.first().copied(),
            rpm: None,
            power_kw: None,
        }
    }
}

/// Aggregates → rows, ascending by timestamp.
pub fn rows(device_id: &str, aggregates: &[Aggregate]) -> Vec<ExportRow> {
    let mut rows: Vec<ExportRow> = aggregates
        .iter()
        .map(|a| ExportRow::from_aggregate(device_id, a))
        .collect();
    rows.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    rows
}

fn field(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.6}")).unwrap_or_default()
}

/// Render rows as CSV with the fixed header.
pub fn to_csv(rows: &[ExportRow]) -> String {
    let mut out = String::with_capacity(64 * (rows.len() + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!(
            "{:.3},{},{},{},{},{},{},{},{}\n",
            row.timestamp,
            row.device_id,
            field(row.current_a),
            field(row.current_b),
            field(row.current_c),
            field(row.vibration),
            field(row.temperature),
            field(row.rpm),
            field(row.power_kw),
        ));
    }
    out
}
