//! Typed view over persisted award records
//!
//! Derived fields are recomputed on every load and never written back, so a
//! change to the competitor list or a parse rule applies to all history.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::batch::IDENTITY_COLUMNS;

static MONEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.?\d*").expect("valid money pattern"));
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid digits pattern"));
static LEADING_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\s*").expect("valid category pattern"));

/// How many non-empty amounts are sampled when validating a dataset
const AMOUNT_SAMPLE: usize = 10;

/// Portal column names the normalizer reads
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnNames {
    pub description: String,
    pub supplier: String,
    pub category: String,
    pub bidders: String,
    pub amount: String,
    pub updated: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            description: "Bezeichnung".to_string(),
            supplier: "Lieferant".to_string(),
            category: "Kategorie (CPV Hauptteil)".to_string(),
            bidders: "Bieter".to_string(),
            amount: "Summe".to_string(),
            updated: "Aktualisiert".to_string(),
        }
    }
}

impl ColumnNames {
    pub fn required(&self) -> [&str; 6] {
        [
            self.description.as_str(),
            self.supplier.as_str(),
            self.category.as_str(),
            self.bidders.as_str(),
            self.amount.as_str(),
            self.updated.as_str(),
        ]
    }
}

/// Parse an amount like `1.234.567,89` (`.` thousands, `,` decimals)
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned = raw.replace('.', "").replace(',', ".");
    MONEY.find(&cleaned)?.as_str().parse().ok()
}

/// Parse a `day.month.year` date
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%d.%m.%Y").ok()
}

/// Split `"45000000 Bauarbeiten"` into its numeric code and label
pub fn split_category(raw: &str) -> (Option<u32>, String) {
    let code = DIGITS.find(raw).and_then(|m| m.as_str().parse().ok());
    let label = LEADING_CODE.replace(raw.trim(), "").trim().to_string();
    (code, label)
}

pub fn parse_bidders(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

/// Known competitor names, matched case-insensitively as substrings
#[derive(Debug, Clone, Default)]
pub struct Competitors {
    names: Vec<(String, String)>,
}

impl Competitors {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| !n.trim().is_empty())
            .map(|n| (n.to_lowercase(), n))
            .collect();
        Self { names }
    }

    /// The first listed name contained in `supplier`
    pub fn matching(&self, supplier: &str) -> Option<&str> {
        let supplier = supplier.to_lowercase();
        self.names
            .iter()
            .find(|(lowered, _)| supplier.contains(lowered.as_str()))
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub subsidiary: Option<String>,
    pub description: String,
    pub supplier: String,
    pub category_code: Option<u32>,
    pub category_label: String,
    pub bidders: Option<u32>,
    pub amount: Option<f64>,
    pub updated: Option<NaiveDate>,
    pub is_competitor: bool,
    pub competitor: Option<String>,
}

/// One persisted row keyed by column name
pub type RawRecord = HashMap<String, String>;

pub struct Normalizer {
    columns: ColumnNames,
    competitors: Competitors,
}

impl Normalizer {
    pub fn new(columns: ColumnNames, competitors: Competitors) -> Self {
        Self {
            columns,
            competitors,
        }
    }

    pub fn normalize(&self, row: &RawRecord) -> NormalizedRecord {
        let field = |name: &str| row.get(name).map(String::as_str).unwrap_or("");

        let supplier = field(&self.columns.supplier).trim().to_string();
        let (category_code, category_label) = split_category(field(&self.columns.category));
        let competitor = self.competitors.matching(&supplier).map(str::to_string);

        NormalizedRecord {
            subsidiary: row
                .get(IDENTITY_COLUMNS[0])
                .filter(|s| !s.is_empty())
                .cloned(),
            description: field(&self.columns.description).trim().to_string(),
            category_code,
            category_label,
            bidders: parse_bidders(field(&self.columns.bidders)),
            amount: parse_amount(field(&self.columns.amount)),
            updated: parse_date(field(&self.columns.updated)),
            is_competitor: competitor.is_some(),
            competitor,
            supplier,
        }
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{} not found, run `tender-scrape scrape` first", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to read dataset: {0}")]
    Read(#[from] csv::Error),
    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("Required columns have no values: {}", .0.join(", "))]
    EmptyColumns(Vec<String>),
    #[error("Dataset has no records")]
    Empty,
    #[error("'{0}' column doesn't appear to contain monetary values")]
    InvalidAmounts(String),
}

/// Persisted records as loaded from one CSV
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub rows: Vec<RawRecord>,
}

impl Dataset {
    /// Load and validate a CSV in the persisted schema
    pub fn load(path: &Path, columns: &ColumnNames) -> Result<Self, DatasetError> {
        if !path.exists() {
            return Err(DatasetError::NotFound(path.to_path_buf()));
        }
        let reader = csv::Reader::from_path(path)?;
        Self::from_csv(reader, columns)
    }

    /// Load every file that passes validation, skipping the rest with a
    /// warning. Fails with the first error only if none could be used.
    pub fn load_all(paths: &[PathBuf], columns: &ColumnNames) -> Result<Vec<Self>, DatasetError> {
        let mut datasets = Vec::new();
        let mut first_error = None;
        for path in paths {
            match Self::load(path, columns) {
                Ok(dataset) => {
                    info!(file = %path.display(), records = dataset.len(), "Loaded dataset");
                    datasets.push(dataset);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping dataset");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if datasets.is_empty() => Err(e),
            _ => Ok(datasets),
        }
    }

    pub fn from_reader<R: io::Read>(reader: R, columns: &ColumnNames) -> Result<Self, DatasetError> {
        Self::from_csv(csv::Reader::from_reader(reader), columns)
    }

    fn from_csv<R: io::Read>(
        mut reader: csv::Reader<R>,
        columns: &ColumnNames,
    ) -> Result<Self, DatasetError> {
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let missing: Vec<String> = columns
            .required()
            .iter()
            .filter(|c| !headers.iter().any(|h| h == *c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(DatasetError::MissingColumns(missing));
        }

        let rows = reader
            .deserialize::<RawRecord>()
            .collect::<Result<Vec<_>, _>>()?;

        let dataset = Self { rows };
        dataset.validate(columns)?;
        Ok(dataset)
    }

    fn values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.rows
            .iter()
            .filter_map(move |row| row.get(column))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn validate(&self, columns: &ColumnNames) -> Result<(), DatasetError> {
        if self.rows.is_empty() {
            return Err(DatasetError::Empty);
        }

        let empty: Vec<String> = columns
            .required()
            .iter()
            .filter(|c| self.values(c).next().is_none())
            .map(|c| c.to_string())
            .collect();
        if !empty.is_empty() {
            return Err(DatasetError::EmptyColumns(empty));
        }

        let looks_numeric = |v: &str| {
            let digits: String = v.chars().filter(|c| !matches!(c, '.' | ',' | ' ')).collect();
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        };
        if !self
            .values(&columns.amount)
            .take(AMOUNT_SAMPLE)
            .any(looks_numeric)
        {
            return Err(DatasetError::InvalidAmounts(columns.amount.clone()));
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn normalize(&self, normalizer: &Normalizer) -> Vec<NormalizedRecord> {
        self.rows.iter().map(|row| normalizer.normalize(row)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierTotal {
    pub name: String,
    pub contracts: usize,
    pub value: f64,
    pub is_competitor: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    pub label: String,
    pub contracts: usize,
    pub value: f64,
}

/// Market aggregates over normalized records. Missing amounts and dates
/// are skipped, never counted as zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSummary {
    pub records: usize,
    pub valued_records: usize,
    pub total_value: f64,
    pub mean_value: Option<f64>,
    pub competitor_records: usize,
    pub competitor_value: f64,
    /// Percent of records
    pub competitor_count_share: f64,
    /// Percent of total value
    pub competitor_value_share: f64,
    pub competitors: Vec<SupplierTotal>,
    pub top_suppliers: Vec<SupplierTotal>,
    pub top_categories: Vec<CategoryTotal>,
    pub first_update: Option<NaiveDate>,
    pub last_update: Option<NaiveDate>,
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

impl MarketSummary {
    pub fn from_records(records: &[NormalizedRecord], top_n: usize) -> Self {
        let amounts: Vec<f64> = records.iter().filter_map(|r| r.amount).collect();
        let total_value: f64 = amounts.iter().sum();
        let mean_value = (!amounts.is_empty()).then(|| total_value / amounts.len() as f64);

        let competitor_rows: Vec<&NormalizedRecord> =
            records.iter().filter(|r| r.is_competitor).collect();
        let competitor_value: f64 = competitor_rows.iter().filter_map(|r| r.amount).sum();

        let mut suppliers: BTreeMap<&str, SupplierTotal> = BTreeMap::new();
        let mut by_competitor: BTreeMap<&str, SupplierTotal> = BTreeMap::new();
        let mut categories: BTreeMap<&str, CategoryTotal> = BTreeMap::new();

        for record in records {
            let value = record.amount.unwrap_or(0.0);
            if !record.supplier.is_empty() {
                let entry = suppliers
                    .entry(record.supplier.as_str())
                    .or_insert_with(|| SupplierTotal {
                        name: record.supplier.clone(),
                        contracts: 0,
                        value: 0.0,
                        is_competitor: record.is_competitor,
                    });
                entry.contracts += 1;
                entry.value += value;
            }
            if let Some(name) = &record.competitor {
                let entry = by_competitor
                    .entry(name.as_str())
                    .or_insert_with(|| SupplierTotal {
                        name: name.clone(),
                        contracts: 0,
                        value: 0.0,
                        is_competitor: true,
                    });
                entry.contracts += 1;
                entry.value += value;
            }
            if !record.category_label.is_empty() {
                let entry = categories
                    .entry(record.category_label.as_str())
                    .or_insert_with(|| CategoryTotal {
                        label: record.category_label.clone(),
                        contracts: 0,
                        value: 0.0,
                    });
                entry.contracts += 1;
                entry.value += value;
            }
        }

        let by_value = |a: &SupplierTotal, b: &SupplierTotal| {
            b.value.total_cmp(&a.value).then_with(|| a.name.cmp(&b.name))
        };
        let mut top_suppliers: Vec<SupplierTotal> = suppliers.into_values().collect();
        top_suppliers.sort_by(by_value);
        top_suppliers.truncate(top_n);

        let mut competitors: Vec<SupplierTotal> = by_competitor.into_values().collect();
        competitors.sort_by(by_value);

        let mut top_categories: Vec<CategoryTotal> = categories.into_values().collect();
        top_categories.sort_by(|a, b| b.contracts.cmp(&a.contracts).then_with(|| a.label.cmp(&b.label)));
        top_categories.truncate(top_n);

        Self {
            records: records.len(),
            valued_records: amounts.len(),
            total_value,
            mean_value,
            competitor_records: competitor_rows.len(),
            competitor_value,
            competitor_count_share: percent(competitor_rows.len() as f64, records.len() as f64),
            competitor_value_share: percent(competitor_value, total_value),
            competitors,
            top_suppliers,
            top_categories,
            first_update: records.iter().filter_map(|r| r.updated).min(),
            last_update: records.iter().filter_map(|r| r.updated).max(),
        }
    }
}
