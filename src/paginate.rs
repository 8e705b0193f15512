//! Per-target pagination loop
//!
//! Walks one target's result pages, feeding accepted rows into the batch
//! writer, until the data ends, a cap is hit, or the failure budget runs
//! out. Every path through the loop either advances a cursor (page number
//! or click count) or stops, and content seen before ends the walk, so the
//! loop always terminates.

use reqwest::Url;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::batch::{BatchWriter, RowSink};
use crate::config::Config;
use crate::controls::ControlHeuristic;
use crate::extract::{ExtractError, ExtractedTable, RowArity, TableExtractor};
use crate::fetcher::PageFetcher;
use crate::types::{RawRow, ScrapeResult, ScrapeStatus, ScrapeTarget};

/// How the controller moves from one page to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceStrategy {
    /// Rewrite a page-number query parameter and fetch again
    UrlParameter,
    /// Find and click the page's "next" control
    ControlDiscovery,
}

impl FromStr for AdvanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "url" | "url-parameter" => Ok(AdvanceStrategy::UrlParameter),
            "click" | "control" => Ok(AdvanceStrategy::ControlDiscovery),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

impl fmt::Display for AdvanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdvanceStrategy::UrlParameter => "url",
            AdvanceStrategy::ControlDiscovery => "click",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PaginationSettings {
    pub strategy: AdvanceStrategy,
    pub page_param: String,
    pub max_pages: Option<u32>,
    pub max_consecutive_failures: u32,
    pub page_timeout: Duration,
    pub request_delay: Duration,
    pub next_controls: Vec<ControlHeuristic>,
}

impl PaginationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            strategy: config.strategy,
            page_param: config.page_param.clone(),
            max_pages: config.max_pages,
            max_consecutive_failures: config.max_consecutive_failures,
            page_timeout: config.page_timeout,
            request_delay: config.request_delay,
            next_controls: config.next_controls.clone(),
        }
    }
}

/// `base` with its page parameter set to `page`; other query pairs are kept
pub fn page_url(base: &str, param: &str, page: u32) -> Result<String, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid URL '{}': {}", base, e))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, &page.to_string());
    Ok(url.to_string())
}

/// What one attempt to read a page produced
enum PageRead {
    Table(ExtractedTable),
    NoTable,
    Failed { detail: String, transient: bool },
}

/// Outcome of the deciding step
enum Decision {
    Advance,
    Retry,
    Stop(ScrapeStatus, Option<String>),
}

fn fingerprint<T: Hash + ?Sized>(content: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

pub struct PageController<'a> {
    fetcher: &'a mut dyn PageFetcher,
    extractor: &'a TableExtractor,
    settings: &'a PaginationSettings,
    header: Option<Vec<String>>,
    pages_visited: u32,
    rows_extracted: usize,
    rows_dropped: usize,
    consecutive_failures: u32,
}

impl<'a> PageController<'a> {
    pub fn new(
        fetcher: &'a mut dyn PageFetcher,
        extractor: &'a TableExtractor,
        settings: &'a PaginationSettings,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            settings,
            header: None,
            pages_visited: 0,
            rows_extracted: 0,
            rows_dropped: 0,
            consecutive_failures: 0,
        }
    }

    /// Scrape every page of `target` into `writer`. The caller still owns
    /// the final `flush_remaining`.
    pub fn run<S: RowSink>(
        mut self,
        target: &Arc<ScrapeTarget>,
        writer: &mut BatchWriter<S>,
    ) -> ScrapeResult {
        info!(
            subsidiary = %target.key,
            strategy = %self.settings.strategy,
            "Starting to scrape {}", target.display_name
        );

        let (status, detail) = match self.settings.strategy {
            AdvanceStrategy::UrlParameter => self.walk_by_url(target, writer),
            AdvanceStrategy::ControlDiscovery => self.walk_by_control(target, writer),
        };

        info!(
            subsidiary = %target.key,
            pages = self.pages_visited,
            rows = self.rows_extracted,
            dropped = self.rows_dropped,
            status = %status,
            "Finished {}", target.display_name
        );

        let mut result = ScrapeResult::new(target, status);
        result.pages_visited = self.pages_visited;
        result.rows_extracted = self.rows_extracted;
        result.rows_dropped = self.rows_dropped;
        result.error_detail = detail;
        result
    }

    fn cap_reached(&self) -> bool {
        self.settings
            .max_pages
            .is_some_and(|max| self.pages_visited >= max)
    }

    fn end_status(&self) -> ScrapeStatus {
        if self.rows_extracted > 0 {
            ScrapeStatus::Completed
        } else {
            ScrapeStatus::Empty
        }
    }

    fn read_page(&mut self, url: Option<&str>) -> PageRead {
        if let Some(url) = url {
            if let Err(e) = self.fetcher.navigate(url) {
                return PageRead::Failed {
                    detail: e.to_string(),
                    transient: e.is_transient(),
                };
            }
        }

        match self
            .fetcher
            .wait_for_element(self.extractor.table_selector(), self.settings.page_timeout)
        {
            Ok(true) => {}
            Ok(false) => return PageRead::NoTable,
            Err(e) => {
                return PageRead::Failed {
                    detail: e.to_string(),
                    transient: e.is_transient(),
                }
            }
        }

        let markup = self.fetcher.current_markup();
        match self.extractor.extract(&markup, self.header.as_deref()) {
            Ok(table) => PageRead::Table(table),
            Err(ExtractError::NoTableFound(_)) => PageRead::NoTable,
            Err(e) => PageRead::Failed {
                detail: e.to_string(),
                transient: false,
            },
        }
    }

    /// Hand a page's rows to the writer; returns how many were accepted
    fn accept<S: RowSink>(
        &mut self,
        target: &Arc<ScrapeTarget>,
        table: ExtractedTable,
        writer: &mut BatchWriter<S>,
    ) -> usize {
        if self.header.is_none() && !table.headers.is_empty() {
            debug!(subsidiary = %target.key, headers = ?table.headers, "Header established");
            writer.set_header(table.headers.clone());
            self.header = Some(table.headers);
        }

        if table.dropped > 0 {
            warn!(
                subsidiary = %target.key,
                page = self.pages_visited,
                dropped = table.dropped,
                "Dropped rows with unexpected cell count"
            );
            self.rows_dropped += table.dropped;
        }

        let append_source = matches!(self.extractor.arity(), RowArity::SourceColumn(_));
        let accepted = table.rows.len();
        writer.append(table.rows.into_iter().map(|mut cells| {
            if append_source {
                cells.push(target.display_name.clone());
            }
            RawRow::new(Arc::clone(target), cells)
        }));

        self.rows_extracted += accepted;
        accepted
    }

    /// Count a failed page; stop once the budget is spent
    fn record_failure(&mut self, target: &ScrapeTarget, detail: &str) -> Decision {
        self.consecutive_failures += 1;
        warn!(
            subsidiary = %target.key,
            page = self.pages_visited,
            failures = self.consecutive_failures,
            error = detail,
            "Failed to extract data"
        );
        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            Decision::Stop(
                ScrapeStatus::Failed,
                Some(format!(
                    "{} consecutive failures, last: {}",
                    self.consecutive_failures, detail
                )),
            )
        } else {
            Decision::Retry
        }
    }

    fn walk_by_url<S: RowSink>(
        &mut self,
        target: &Arc<ScrapeTarget>,
        writer: &mut BatchWriter<S>,
    ) -> (ScrapeStatus, Option<String>) {
        let mut page: u32 = 1;
        let mut seen = HashSet::new();

        loop {
            if self.cap_reached() {
                info!(subsidiary = %target.key, pages = self.pages_visited, "Reached page cap");
                return (self.end_status(), None);
            }

            let url = match page_url(&target.source_url, &self.settings.page_param, page) {
                Ok(url) => url,
                Err(detail) => return (ScrapeStatus::Failed, Some(detail)),
            };
            debug!(subsidiary = %target.key, page, url = %url, "Fetching page");

            let decision = match self.read_page(Some(&url)) {
                PageRead::Table(table) if table.body_rows() == 0 => {
                    self.pages_visited += 1;
                    info!(subsidiary = %target.key, page, "Empty page, end of data");
                    Decision::Stop(self.end_status(), None)
                }
                PageRead::Table(table)
                    if !table.rows.is_empty() && !seen.insert(fingerprint(&table.rows)) =>
                {
                    info!(subsidiary = %target.key, page, "Page repeats earlier rows, end of data");
                    Decision::Stop(self.end_status(), None)
                }
                PageRead::Table(table) => {
                    self.pages_visited += 1;
                    self.consecutive_failures = 0;
                    let accepted = self.accept(target, table, writer);
                    info!(subsidiary = %target.key, page, rows = accepted, "Extracted rows");
                    if page == 1 && accepted == 0 {
                        Decision::Stop(
                            ScrapeStatus::NoData,
                            Some("No extractable rows on first page".to_string()),
                        )
                    } else {
                        Decision::Advance
                    }
                }
                PageRead::NoTable if page == 1 => {
                    self.pages_visited += 1;
                    Decision::Stop(ScrapeStatus::NoData, Some("No table found".to_string()))
                }
                // Could be a slow load, so retry; a table that never shows
                // up marks the end of the data
                PageRead::NoTable => match self.record_failure(target, "no table") {
                    Decision::Stop(..) => {
                        info!(subsidiary = %target.key, page, "No table, end of data");
                        Decision::Stop(self.end_status(), None)
                    }
                    decision => decision,
                },
                PageRead::Failed { detail, transient } => {
                    if transient {
                        self.record_failure(target, &detail)
                    } else {
                        Decision::Stop(ScrapeStatus::Failed, Some(detail))
                    }
                }
            };

            match decision {
                Decision::Advance => page += 1,
                Decision::Retry => {}
                Decision::Stop(status, detail) => return (status, detail),
            }
            pause(self.settings.request_delay);
        }
    }

    fn walk_by_control<S: RowSink>(
        &mut self,
        target: &Arc<ScrapeTarget>,
        writer: &mut BatchWriter<S>,
    ) -> (ScrapeStatus, Option<String>) {
        let mut seen = HashSet::new();
        let mut first = Some(target.source_url.as_str());

        loop {
            let page = self.pages_visited + 1;
            let read = self.read_page(first.take());
            if let PageRead::Failed { detail, .. } = &read {
                if page == 1 {
                    return (ScrapeStatus::Failed, Some(detail.clone()));
                }
            }
            self.pages_visited = page;
            seen.insert(fingerprint(&self.fetcher.current_markup()));

            let decision = match read {
                PageRead::Table(table) if page == 1 && table.body_rows() == 0 => Decision::Stop(
                    ScrapeStatus::Empty,
                    Some("No contract data".to_string()),
                ),
                PageRead::NoTable if page == 1 => {
                    Decision::Stop(ScrapeStatus::NoData, Some("No table found".to_string()))
                }
                PageRead::Table(table) => {
                    let accepted = self.accept(target, table, writer);
                    if accepted > 0 {
                        self.consecutive_failures = 0;
                        info!(subsidiary = %target.key, page, rows = accepted, "Extracted rows");
                        Decision::Advance
                    } else if page == 1 {
                        Decision::Stop(
                            ScrapeStatus::NoData,
                            Some("No extractable rows on first page".to_string()),
                        )
                    } else {
                        self.record_failure(target, "no rows accepted")
                    }
                }
                PageRead::NoTable => self.record_failure(target, "no table"),
                PageRead::Failed { detail, .. } => self.record_failure(target, &detail),
            };

            if let Decision::Stop(status, detail) = decision {
                return (status, detail);
            }

            if self.cap_reached() {
                info!(subsidiary = %target.key, pages = self.pages_visited, "Reached page cap");
                return (self.end_status(), None);
            }

            let Some(control) = self.fetcher.find_control(&self.settings.next_controls) else {
                info!(subsidiary = %target.key, page, "No next-page control, end of data");
                return (self.end_status(), None);
            };
            debug!(
                subsidiary = %target.key,
                page,
                control = %control.label,
                matched_by = %control.matched_by,
                "Clicking next"
            );

            if let Err(e) = self.fetcher.click(&control) {
                info!(subsidiary = %target.key, page, error = %e, "Could not follow next-page control");
                return (self.end_status(), None);
            }
            // A failed wait shows up as a missing table on the next read
            let _ = self
                .fetcher
                .wait_for_element(self.extractor.table_selector(), self.settings.page_timeout);

            if seen.contains(&fingerprint(&self.fetcher.current_markup())) {
                info!(subsidiary = %target.key, page, "Content unchanged after click, end of data");
                return (self.end_status(), None);
            }

            pause(self.settings.request_delay);
        }
    }
}
