//! Scripted fetchers for exercising the scrape loop without a network

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use crate::controls::ControlHandle;
use crate::fetcher::{markup_has, FetchError, FetcherFactory, PageFetcher};
use crate::types::ScrapeTarget;

/// Serves canned markup per URL and records every navigation
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    pages: HashMap<String, String>,
    fallback: Option<String>,
    failing: HashSet<String>,
    slow: HashMap<String, u32>,
    table_hidden: bool,
    markup: String,
    visits: Rc<RefCell<Vec<String>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, url: &str, markup: &str) {
        self.pages.insert(url.to_string(), markup.to_string());
    }

    /// Markup for every URL without a page of its own
    pub fn serve_any(&mut self, markup: &str) {
        self.fallback = Some(markup.to_string());
    }

    /// Every navigation to `url` fails with a transient error
    pub fn fail_url(&mut self, url: &str) {
        self.failing.insert(url.to_string());
    }

    /// The first `times` loads of `url` never show the table in time
    pub fn slow_url(&mut self, url: &str, times: u32) {
        self.slow.insert(url.to_string(), times);
    }

    pub fn visits(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.visits)
    }
}

impl PageFetcher for ScriptedFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        self.visits.borrow_mut().push(url.to_string());
        if self.failing.contains(url) {
            return Err(FetchError::Http("connection reset".to_string()));
        }
        self.table_hidden = match self.slow.get_mut(url) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        match self.pages.get(url).or(self.fallback.as_ref()) {
            Some(markup) => {
                self.markup = markup.clone();
                Ok(())
            }
            None => Err(FetchError::Status {
                status: 404,
                url: url.to_string(),
            }),
        }
    }

    fn current_markup(&self) -> String {
        self.markup.clone()
    }

    fn wait_for_element(&mut self, selector: &str, _timeout: Duration) -> Result<bool, FetchError> {
        if self.table_hidden {
            return Ok(false);
        }
        markup_has(&self.markup, selector)
    }

    fn click(&mut self, handle: &ControlHandle) -> Result<(), FetchError> {
        let href = handle.href.clone().ok_or(FetchError::NoControl)?;
        self.navigate(&href)
    }
}

/// Hands out clones of one scripted fetcher, or fails for chosen targets
#[derive(Default)]
pub struct ScriptedFactory {
    pub fetcher: ScriptedFetcher,
    pub unreachable: HashSet<String>,
    pub opened: RefCell<Vec<String>>,
}

impl FetcherFactory for ScriptedFactory {
    fn open(&self, target: &ScrapeTarget) -> Result<Box<dyn PageFetcher>, FetchError> {
        self.opened.borrow_mut().push(target.key.clone());
        if self.unreachable.contains(&target.key) {
            return Err(FetchError::Http(format!("{} refused the session", target.key)));
        }
        Ok(Box::new(self.fetcher.clone()))
    }
}

/// A result page with a three-column table of `rows` rows, and a `rel=next`
/// link when `next` is given
pub fn table_page(page: u32, rows: usize, next: Option<&str>) -> String {
    let body: String = (0..rows)
        .map(|i| {
            format!(
                "<tr><td>Auftrag {}-{}</td><td>Lieferant {}</td><td>{}.000,00</td></tr>",
                page,
                i,
                i % 4,
                i + 1
            )
        })
        .collect();
    let link = next
        .map(|href| format!("<ul class=\"pagination\"><li><a rel=\"next\" href=\"{}\">»</a></li></ul>", href))
        .unwrap_or_default();
    format!(
        "<html><body><h1>Seite {}</h1><table>\
         <thead><tr><th>Bezeichnung</th><th>Lieferant</th><th>Summe</th></tr></thead>\
         <tbody>{}</tbody></table>{}</body></html>",
        page, body, link
    )
}
