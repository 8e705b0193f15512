//! Runs every configured target in order with per-target isolation
//!
//! Each target gets a fresh fetcher session and its own data file. A target
//! that errors out is recorded as failed and the run moves on. After every
//! group of targets a summary snapshot is written, so a crashed run still
//! leaves a status table up to the last finished group.

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchWriter, CsvFileSink};
use crate::config::Config;
use crate::extract::{ExtractError, RowArity, TableExtractor};
use crate::fetcher::{FetcherFactory, PageFetcher};
use crate::paginate::{PageController, PaginationSettings};
use crate::types::{RunSummary, ScrapeResult, ScrapeStatus, ScrapeTarget};
use crate::utils::{osc8_file_link, osc8_link};

/// Run `scrape` over `targets` in groups of `group_size`, sleeping `between`
/// before every target but the first. An `Err` from `scrape` becomes a
/// failed result for that target. `on_group` sees the summary so far after
/// each group, numbered from 1.
pub fn run_isolated<F, G>(
    targets: &[Arc<ScrapeTarget>],
    group_size: usize,
    between: Duration,
    mut scrape: F,
    mut on_group: G,
) -> RunSummary
where
    F: FnMut(usize, &Arc<ScrapeTarget>) -> Result<ScrapeResult>,
    G: FnMut(usize, &RunSummary),
{
    let mut summary = RunSummary::default();

    for (group, chunk) in targets.chunks(group_size.max(1)).enumerate() {
        for target in chunk {
            let index = summary.total_targets();
            if index > 0 && !between.is_zero() {
                std::thread::sleep(between);
            }
            let result = scrape(index, target).unwrap_or_else(|e| {
                error!(subsidiary = %target.key, error = %format!("{:#}", e), "Target failed");
                ScrapeResult::failed(target, format!("{:#}", e))
            });
            summary.push(result);
        }
        on_group(group + 1, &summary);
    }

    summary
}

/// Files and results of one finished run
#[derive(Debug)]
pub struct RunReport {
    /// Shared by every file the run wrote
    pub stamp: String,
    pub summary: RunSummary,
    pub summary_file: PathBuf,
    pub snapshots: Vec<PathBuf>,
}

pub fn extractor_for(config: &Config) -> Result<TableExtractor, ExtractError> {
    let arity = match &config.source_column {
        Some(column) => RowArity::SourceColumn(column.clone()),
        None => RowArity::Exact,
    };
    TableExtractor::new(&config.table_selector, arity)
}

pub struct Orchestrator<'a> {
    config: &'a Config,
    factory: &'a dyn FetcherFactory,
    quiet: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, factory: &'a dyn FetcherFactory) -> Self {
        Self {
            config,
            factory,
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Scrape all configured targets. Only setup problems are returned as
    /// errors; per-target failures end up in the summary.
    pub fn run(&self) -> Result<RunReport> {
        let config = self.config;
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                config.output_dir.display()
            )
        })?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let extractor = extractor_for(config)?;
        let settings = PaginationSettings::from_config(config);
        let targets: Vec<Arc<ScrapeTarget>> =
            config.targets.iter().cloned().map(Arc::new).collect();
        let total = targets.len();

        info!(
            targets = total,
            batch_size = config.batch_size,
            strategy = %config.strategy,
            output = %config.output_dir.display(),
            "Starting run {}", stamp
        );
        if !self.quiet {
            println!("Scraping {} subsidiaries...\n", total);
        }

        let mut snapshots = Vec::new();
        let summary = run_isolated(
            &targets,
            config.group_size,
            config.target_delay,
            |index, target| {
                self.print_start(index, total, target);
                let result = self.scrape_target(target, &extractor, &settings, &stamp)?;
                self.print_result(&result);
                Ok(result)
            },
            |group, summary| {
                // The last group's snapshot would duplicate the final summary
                if summary.total_targets() == total {
                    return;
                }
                let path = config
                    .output_dir
                    .join(format!("run_{}_group_{}_summary.csv", stamp, group));
                match summary.write_csv(&path) {
                    Ok(()) => {
                        info!(group, path = %path.display(), "Saved group snapshot");
                        snapshots.push(path);
                    }
                    Err(e) => warn!(group, error = %e, "Failed to save group snapshot"),
                }
            },
        );

        let summary_file = config.output_dir.join(format!("run_{}_summary.csv", stamp));
        summary
            .write_csv(&summary_file)
            .with_context(|| format!("Failed to write summary {}", summary_file.display()))?;

        info!(
            targets = summary.total_targets(),
            rows = summary.total_rows(),
            dropped = summary.total_dropped(),
            "Run complete"
        );

        Ok(RunReport {
            stamp,
            summary,
            summary_file,
            snapshots,
        })
    }

    fn scrape_target(
        &self,
        target: &Arc<ScrapeTarget>,
        extractor: &TableExtractor,
        settings: &PaginationSettings,
        stamp: &str,
    ) -> Result<ScrapeResult> {
        let mut fetcher = self
            .factory
            .open(target)
            .with_context(|| format!("Failed to open session for {}", target.key))?;

        let path = self
            .config
            .output_dir
            .join(format!("{}_{}.csv", target.key, stamp));
        let mut writer = BatchWriter::new(
            Arc::clone(target),
            CsvFileSink::new(&path),
            self.config.batch_size,
        );

        let mut result =
            PageController::new(fetcher.as_mut(), extractor, settings).run(target, &mut writer);

        let unwritten = writer.flush_remaining();
        drop(fetcher);
        debug!(
            subsidiary = %target.key,
            flushes = writer.flushes(),
            rows = writer.rows_written(),
            "Closed session"
        );

        if unwritten > 0 {
            error!(
                subsidiary = %target.key,
                rows = unwritten,
                failed_flushes = writer.failed_flushes(),
                "Rows could not be saved"
            );
            result.status = ScrapeStatus::Failed;
            result.error_detail = Some(format!("{} rows could not be saved", unwritten));
        }
        if writer.rows_written() > 0 {
            result.output_file = Some(path);
        }
        Ok(result)
    }

    fn print_start(&self, index: usize, total: usize, target: &ScrapeTarget) {
        if self.quiet {
            return;
        }
        print!(
            "[{:02}/{:02}] Scraping: {} ... ",
            index + 1,
            total,
            osc8_link(&target.source_url, &target.display_name)
        );
        let _ = io::stdout().flush();
    }

    fn print_result(&self, result: &ScrapeResult) {
        if self.quiet {
            return;
        }
        match &result.output_file {
            Some(path) => println!(
                "{} ({} pages, {} contracts) {}",
                result.status,
                result.pages_visited,
                result.rows_extracted,
                osc8_file_link(&path.to_string_lossy(), "csv")
            ),
            None => println!(
                "{} ({} pages, {} contracts)",
                result.status, result.pages_visited, result.rows_extracted
            ),
        }
    }
}

/// What page one of a target looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Rows(usize),
    EmptyTable,
    NoTable,
    Unreachable(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Rows(n) => write!(f, "{} rows on first page", n),
            ProbeOutcome::EmptyTable => f.write_str("table without rows"),
            ProbeOutcome::NoTable => f.write_str("no table"),
            ProbeOutcome::Unreachable(e) => write!(f, "unreachable: {}", e),
        }
    }
}

pub fn probe_target(
    fetcher: &mut dyn PageFetcher,
    extractor: &TableExtractor,
    target: &ScrapeTarget,
    timeout: Duration,
) -> ProbeOutcome {
    if let Err(e) = fetcher.navigate(&target.source_url) {
        return ProbeOutcome::Unreachable(e.to_string());
    }
    match fetcher.wait_for_element(extractor.table_selector(), timeout) {
        Ok(true) => {}
        Ok(false) => return ProbeOutcome::NoTable,
        Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
    }
    match extractor.extract(&fetcher.current_markup(), None) {
        Ok(table) if table.rows.is_empty() => ProbeOutcome::EmptyTable,
        Ok(table) => ProbeOutcome::Rows(table.rows.len()),
        Err(_) => ProbeOutcome::NoTable,
    }
}

/// Check page one of every target without writing anything
pub fn probe_targets(
    config: &Config,
    factory: &dyn FetcherFactory,
    mut on_result: impl FnMut(&ScrapeTarget, &ProbeOutcome),
) -> Result<Vec<(String, ProbeOutcome)>> {
    let extractor = extractor_for(config)?;
    let mut outcomes = Vec::with_capacity(config.targets.len());

    for (i, target) in config.targets.iter().enumerate() {
        if i > 0 && !config.target_delay.is_zero() {
            std::thread::sleep(config.target_delay);
        }
        let outcome = match factory.open(target) {
            Ok(mut fetcher) => {
                probe_target(fetcher.as_mut(), &extractor, target, config.page_timeout)
            }
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        };
        info!(subsidiary = %target.key, outcome = %outcome, "Probed");
        on_result(target, &outcome);
        outcomes.push((target.key.clone(), outcome));
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::paginate::page_url;
    use crate::testing::{table_page, ScriptedFactory};
    use std::path::Path;

    const CONL: &str = "\
batch_size = 2
group_size = 2
request_delay_ms = 0
target_delay_ms = 0
settle_delay_ms = 0
targets
  =
    key = a
    name = Alpha AG
    id = 1
    url = https://example.org/auftraggeber/1
  =
    key = b
    name = Beta AG
    id = 2
    url = https://example.org/auftraggeber/2
  =
    key = c
    name = Gamma AG
    id = 3
    url = https://example.org/auftraggeber/3
";

    fn config(dir: &Path) -> Config {
        Config::parse(CONL)
            .unwrap()
            .with_overrides(&Overrides {
                output_dir: Some(dir.to_path_buf()),
                ..Default::default()
            })
            .unwrap()
    }

    fn page(config: &Config, index: usize, page: u32) -> String {
        page_url(&config.targets[index].source_url, "page", page).unwrap()
    }

    fn record_count(path: &Path) -> usize {
        csv::Reader::from_path(path).unwrap().records().count()
    }

    #[test]
    fn test_run_isolated_keeps_going_after_errors() {
        let targets: Vec<Arc<ScrapeTarget>> = ["a", "b", "c"]
            .iter()
            .map(|k| {
                Arc::new(ScrapeTarget {
                    key: k.to_string(),
                    display_name: k.to_uppercase(),
                    external_id: "0".into(),
                    source_url: "https://example.org".into(),
                })
            })
            .collect();

        let mut groups = Vec::new();
        let summary = run_isolated(
            &targets,
            2,
            Duration::ZERO,
            |index, target| {
                if index == 1 {
                    anyhow::bail!("browser crashed");
                }
                let mut result = ScrapeResult::new(target, ScrapeStatus::Completed);
                result.rows_extracted = 10;
                Ok(result)
            },
            |group, summary| groups.push((group, summary.total_targets())),
        );

        let statuses: Vec<ScrapeStatus> = summary.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ScrapeStatus::Completed, ScrapeStatus::Failed, ScrapeStatus::Completed]
        );
        assert_eq!(summary.results[1].error_detail.as_deref(), Some("browser crashed"));
        assert_eq!(summary.total_rows(), 20);
        assert_eq!(groups, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_failing_target_does_not_abort_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut factory = ScriptedFactory::default();
        factory.fetcher.add_page(&page(&config, 0, 1), &table_page(1, 3, None));
        factory.fetcher.add_page(&page(&config, 0, 2), &table_page(2, 0, None));
        factory.fetcher.fail_url(&page(&config, 1, 1));
        factory.fetcher.add_page(&page(&config, 2, 1), &table_page(1, 0, None));

        let report = Orchestrator::new(&config, &factory).quiet(true).run().unwrap();
        let results = &report.summary.results;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, ScrapeStatus::Completed);
        assert_eq!(results[0].rows_extracted, 3);
        assert_eq!(results[1].status, ScrapeStatus::Failed);
        assert!(results[1].error_detail.is_some());
        assert_eq!(results[2].status, ScrapeStatus::Empty);

        // batch size 2: one full batch plus the remainder at the end
        let data = results[0].output_file.as_ref().unwrap();
        assert_eq!(record_count(data), 3);
        assert!(results[1].output_file.is_none());

        assert_eq!(*factory.opened.borrow(), vec!["a", "b", "c"]);
        assert_eq!(record_count(&report.summary_file), 3);
        assert_eq!(report.snapshots.len(), 1);
        assert_eq!(record_count(&report.snapshots[0]), 2);
    }

    #[test]
    fn test_rows_are_saved_when_a_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.batch_size = 1000;
        config.targets.truncate(1);

        let mut factory = ScriptedFactory::default();
        factory.fetcher.add_page(&page(&config, 0, 1), &table_page(1, 7, None));
        factory.fetcher.fail_url(&page(&config, 0, 2));

        let report = Orchestrator::new(&config, &factory).quiet(true).run().unwrap();
        let result = &report.summary.results[0];

        assert_eq!(result.status, ScrapeStatus::Failed);
        assert_eq!(result.rows_extracted, 7);
        assert_eq!(record_count(result.output_file.as_ref().unwrap()), 7);
        assert_eq!(
            result.output_file.as_deref(),
            Some(dir.path().join(format!("a_{}.csv", report.stamp)).as_path())
        );
    }

    #[test]
    fn test_session_open_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut factory = ScriptedFactory::default();
        factory.unreachable.insert("a".to_string());
        factory.fetcher.add_page(&page(&config, 1, 1), &table_page(1, 0, None));
        factory.fetcher.add_page(&page(&config, 2, 1), &table_page(1, 0, None));

        let report = Orchestrator::new(&config, &factory).quiet(true).run().unwrap();
        let results = &report.summary.results;
        assert_eq!(results[0].status, ScrapeStatus::Failed);
        assert!(results[0]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("refused the session"));
        assert_eq!(results[1].status, ScrapeStatus::Empty);
        assert_eq!(results[2].status, ScrapeStatus::Empty);
    }

    #[test]
    fn test_probe() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut factory = ScriptedFactory::default();
        factory
            .fetcher
            .add_page(&config.targets[0].source_url, &table_page(1, 4, None));
        factory
            .fetcher
            .add_page(&config.targets[1].source_url, "<p>Keine Daten</p>");
        factory.unreachable.insert("c".to_string());

        let mut seen = 0;
        let outcomes = probe_targets(&config, &factory, |_, _| seen += 1).unwrap();
        assert_eq!(seen, 3);
        assert_eq!(outcomes[0].1, ProbeOutcome::Rows(4));
        assert_eq!(outcomes[1].1, ProbeOutcome::NoTable);
        assert!(matches!(outcomes[2].1, ProbeOutcome::Unreachable(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
