//! # Output Writers
//!
//! Serializes the aggregated run into the configured sinks: a single JSON
//! document `{summary, results[]}` and/or a CSV table with a fixed header.
//! A sink with no configured path is skipped silently.

use crate::controller::aggregate::{AggregatedResult, Summary};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

const CSV_HEADER: &str = "test_id,source_node,dest_node,status,start_time,end_time,\
                          duration_seconds,throughput_bps,throughput_mbps,throughput_gbps,\
                          retransmits,error_message";

/// The complete JSON output document
#[derive(Debug, Serialize)]
pub struct OutputData<'a> {
    pub summary: &'a Summary,
    pub results: &'a [AggregatedResult],
}

/// Writes results into the configured files
pub struct OutputWriter {
    json_file: Option<PathBuf>,
    csv_file: Option<PathBuf>,
}

impl OutputWriter {
    /// Empty paths disable the corresponding sink
    pub fn new(json_file: &str, csv_file: &str) -> Self {
        let path = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(PathBuf::from(s))
            }
        };
        Self {
            json_file: path(json_file),
            csv_file: path(csv_file),
        }
    }

    pub fn write_all(&self, summary: &Summary, results: &[AggregatedResult]) -> Result<()> {
        self.write_json(summary, results)?;
        self.write_csv(results)?;
        Ok(())
    }

    fn write_json(&self, summary: &Summary, results: &[AggregatedResult]) -> Result<()> {
        let Some(path) = &self.json_file else {
            return Ok(());
        };

        let data = OutputData { summary, results };
        let file = File::create(path)
            .with_context(|| format!("failed to create JSON file {}", path.display()))?;
        serde_json::to_writer_pretty(&file, &data).context("failed to encode JSON")?;
        info!("JSON output: {}", path.display());
        Ok(())
    }

    fn write_csv(&self, results: &[AggregatedResult]) -> Result<()> {
        let Some(path) = &self.csv_file else {
            return Ok(());
        };

        let mut file = File::create(path)
            .with_context(|| format!("failed to create CSV file {}", path.display()))?;
        writeln!(file, "{CSV_HEADER}").context("failed to write CSV header")?;

        for result in results {
            let bps = result.throughput_bps.unwrap_or(0.0);
            writeln!(
                file,
                "{},{},{},{},{},{},{},{:.0},{:.2},{:.4},{},{}",
                csv_escape(&result.test_id),
                csv_escape(&result.source_node),
                csv_escape(&result.dest_node),
                csv_escape(&result.status),
                result.start_time,
                result.end_time,
                result.duration,
                bps,
                bps / 1e6,
                bps / 1e9,
                result.retransmits,
                csv_escape(&result.error_message),
            )
            .context("failed to write CSV row")?;
        }

        file.flush()?;
        info!("CSV output: {}", path.display());
        Ok(())
    }
}

/// Quote a field when it contains separators or quotes
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
