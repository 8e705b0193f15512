//! Scrape targets, extracted rows and per-target run results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// One contracting authority on the portal, as listed in the config file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeTarget {
    /// Stable short id, used in file names and `--only`
    pub key: String,
    #[serde(rename = "name")]
    pub display_name: String,
    /// The portal's own id for the authority
    #[serde(rename = "id")]
    pub external_id: String,
    #[serde(rename = "url")]
    pub source_url: String,
}

/// Cells of one accepted table row, in column order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub target: Arc<ScrapeTarget>,
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn new(target: Arc<ScrapeTarget>, cells: Vec<String>) -> Self {
        Self { target, cells }
    }
}

/// Outcome class of one target's scrape loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScrapeStatus {
    Completed,
    Empty,
    NoData,
    Failed,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Completed => "completed",
            ScrapeStatus::Empty => "empty",
            ScrapeStatus::NoData => "no_data",
            ScrapeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of one target's scrape. Built once at the end of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeResult {
    pub target_key: String,
    pub target_name: String,
    pub pages_visited: u32,
    pub rows_extracted: usize,
    /// Rows discarded because their cell count did not match the header
    pub rows_dropped: usize,
    pub status: ScrapeStatus,
    pub error_detail: Option<String>,
    /// Data file for this target, if at least one batch reached disk
    pub output_file: Option<PathBuf>,
}

impl ScrapeResult {
    pub fn new(target: &ScrapeTarget, status: ScrapeStatus) -> Self {
        Self {
            target_key: target.key.clone(),
            target_name: target.display_name.clone(),
            pages_visited: 0,
            rows_extracted: 0,
            rows_dropped: 0,
            status,
            error_detail: None,
            output_file: None,
        }
    }

    pub fn failed(target: &ScrapeTarget, detail: impl Into<String>) -> Self {
        let mut result = Self::new(target, ScrapeStatus::Failed);
        result.error_detail = Some(detail.into());
        result
    }
}

/// One line of the summary sidecar file
#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    subsidiary: &'a str,
    pages_scraped: u32,
    contracts_found: usize,
    status: &'a str,
    error: &'a str,
}

/// Run-level aggregate over all finished targets, in configured order
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<ScrapeResult>,
}

impl RunSummary {
    pub fn push(&mut self, result: ScrapeResult) {
        self.results.push(result);
    }

    pub fn total_targets(&self) -> usize {
        self.results.len()
    }

    pub fn total_rows(&self) -> usize {
        self.results.iter().map(|r| r.rows_extracted).sum()
    }

    pub fn total_dropped(&self) -> usize {
        self.results.iter().map(|r| r.rows_dropped).sum()
    }

    pub fn count_by_status(&self) -> BTreeMap<ScrapeStatus, usize> {
        let mut counts = BTreeMap::new();
        for result in &self.results {
            *counts.entry(result.status).or_insert(0) += 1;
        }
        counts
    }

    /// Write `subsidiary, pages_scraped, contracts_found, status, error`
    pub fn write_csv(&self, path: &std::path::Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for result in &self.results {
            writer.serialize(SummaryRow {
                subsidiary: &result.target_name,
                pages_scraped: result.pages_visited,
                contracts_found: result.rows_extracted,
                status: result.status.as_str(),
                error: result.error_detail.as_deref().unwrap_or(""),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}
