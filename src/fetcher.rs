//! Page fetching sessions
//!
//! The scrape loop only talks to a [`PageFetcher`]. [`HttpFetcher`] is the
//! built-in implementation for server-rendered pages; a browser driver can
//! be plugged in by implementing the same trait.

use reqwest::Url;
use scraper::{Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::controls::{ControlHandle, ControlHeuristic, PageStructure};
use crate::types::ScrapeTarget;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("invalid selector '{0}'")]
    Selector(String),
    #[error("control has no target")]
    NoControl,
}

impl FetchError {
    /// Errors worth another attempt on the next loop iteration
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Http(_))
            || matches!(self, FetchError::Status { status, .. } if *status >= 500 || *status == 429)
    }
}

/// A browsing session over one target's pages
pub trait PageFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError>;

    fn current_markup(&self) -> String;

    /// Block until `selector` matches the current page or `timeout` passes
    fn wait_for_element(&mut self, selector: &str, timeout: Duration)
        -> Result<bool, FetchError>;

    fn find_control(&self, heuristics: &[ControlHeuristic]) -> Option<ControlHandle> {
        PageStructure::parse(&self.current_markup()).find(heuristics)
    }

    fn click(&mut self, handle: &ControlHandle) -> Result<(), FetchError>;
}

/// Opens a fresh session per target
pub trait FetcherFactory {
    fn open(&self, target: &ScrapeTarget) -> Result<Box<dyn PageFetcher>, FetchError>;
}

/// True if `selector` matches anything in `markup`
pub fn markup_has(markup: &str, selector: &str) -> Result<bool, FetchError> {
    let selector =
        Selector::parse(selector).map_err(|_| FetchError::Selector(selector.to_string()))?;
    Ok(Html::parse_document(markup).select(&selector).next().is_some())
}

/// Session settings shared by every [`HttpFetcher`] a factory opens
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
    /// Pause after each navigation before the markup is read
    pub settle_delay: Duration,
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    timeout: Duration,
    settle_delay: Duration,
    current_url: Option<Url>,
    markup: String,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.timeout)
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self {
            client,
            timeout: settings.timeout,
            settle_delay: settings.settle_delay,
            current_url: None,
            markup: String::new(),
        })
    }

    fn load(&mut self, url: Url) -> Result<(), FetchError> {
        debug!(url = %url, "GET");
        let response = self.client.get(url.clone()).send().map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        self.markup = response.text().map_err(|e| FetchError::Http(e.to_string()))?;
        self.current_url = Some(url);
        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }
        Ok(())
    }
}

impl PageFetcher for HttpFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        let url = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        self.load(url)
    }

    fn current_markup(&self) -> String {
        self.markup.clone()
    }

    // Server-rendered markup is complete once the response body is read, so
    // there is nothing to poll for.
    fn wait_for_element(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, FetchError> {
        markup_has(&self.markup, selector)
    }

    fn click(&mut self, handle: &ControlHandle) -> Result<(), FetchError> {
        let href = handle.href.as_deref().ok_or(FetchError::NoControl)?;
        debug!(index = handle.index, href, "Following control");
        let next = match &self.current_url {
            Some(base) => base.join(href),
            None => Url::parse(href),
        }
        .map_err(|_| FetchError::InvalidUrl(href.to_string()))?;
        self.load(next)
    }
}

pub struct HttpFetcherFactory {
    settings: HttpSettings,
}

impl HttpFetcherFactory {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn open(&self, _target: &ScrapeTarget) -> Result<Box<dyn PageFetcher>, FetchError> {
        Ok(Box::new(HttpFetcher::new(&self.settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markup_has() {
        assert!(markup_has("<table><tr><td>1</td></tr></table>", "table").unwrap());
        assert!(!markup_has("<p>nothing</p>", "table").unwrap());
        assert!(matches!(
            markup_has("<p></p>", "[["),
            Err(FetchError::Selector(_))
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(FetchError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(FetchError::Status { status: 503, url: "u".into() }.is_transient());
        assert!(!FetchError::Status { status: 404, url: "u".into() }.is_transient());
        assert!(!FetchError::InvalidUrl("x".into()).is_transient());
    }

    #[test]
    fn test_click_without_href() {
        let settings = HttpSettings {
            user_agent: "test".into(),
            timeout: Duration::from_secs(1),
            settle_delay: Duration::ZERO,
        };
        let mut fetcher = HttpFetcher::new(&settings).unwrap();
        let handle = ControlHandle {
            index: 0,
            href: None,
            label: "»".into(),
            matched_by: "text:»".into(),
        };
        assert!(matches!(fetcher.click(&handle), Err(FetchError::NoControl)));
    }

    #[test]
    fn test_navigate_rejects_bad_url() {
        let settings = HttpSettings {
            user_agent: "test".into(),
            timeout: Duration::from_secs(1),
            settle_delay: Duration::ZERO,
        };
        let mut fetcher = HttpFetcher::new(&settings).unwrap();
        assert!(matches!(
            fetcher.navigate("not a url"),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
