//! Discovery of the "next page" control in rendered markup
//!
//! The page is reduced to a flat list of clickable elements with the
//! attributes the heuristics look at. Heuristics are tried in order and the
//! first one that matches an enabled control wins.

use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One rule for recognising a pagination control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlHeuristic {
    /// `class` attribute contains the text
    Class(String),
    /// `aria-label` contains the text, ignoring case
    AriaLabel(String),
    /// `rel` attribute lists the token
    Rel(String),
    /// Visible text contains the text
    Text(String),
    /// Parent element's `class` contains the text
    ParentClass(String),
    /// Last link inside the first container whose `class` contains the text
    LastIn(String),
}

impl FromStr for ControlHeuristic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("expected '<kind>:<value>', got '{}'", s))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("empty value in '{}'", s));
        }
        let value = value.to_string();
        match kind.trim() {
            "class" => Ok(ControlHeuristic::Class(value)),
            "aria" => Ok(ControlHeuristic::AriaLabel(value)),
            "rel" => Ok(ControlHeuristic::Rel(value)),
            "text" => Ok(ControlHeuristic::Text(value)),
            "parent-class" => Ok(ControlHeuristic::ParentClass(value)),
            "last-in" => Ok(ControlHeuristic::LastIn(value)),
            other => Err(format!("unknown control heuristic kind '{}'", other)),
        }
    }
}

impl fmt::Display for ControlHeuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlHeuristic::Class(v) => write!(f, "class:{}", v),
            ControlHeuristic::AriaLabel(v) => write!(f, "aria:{}", v),
            ControlHeuristic::Rel(v) => write!(f, "rel:{}", v),
            ControlHeuristic::Text(v) => write!(f, "text:{}", v),
            ControlHeuristic::ParentClass(v) => write!(f, "parent-class:{}", v),
            ControlHeuristic::LastIn(v) => write!(f, "last-in:{}", v),
        }
    }
}

/// Ordered list used when the config does not name one
pub fn default_heuristics() -> Vec<ControlHeuristic> {
    use ControlHeuristic::*;
    vec![
        Class("next".into()),
        AriaLabel("next".into()),
        Rel("next".into()),
        ParentClass("next".into()),
        Text("»".into()),
        Text(">".into()),
        LastIn("pagination".into()),
    ]
}

/// A clickable element as seen by the heuristics
#[derive(Debug, Clone, Default)]
pub struct Control {
    /// Position among all clickable elements in document order
    pub index: usize,
    pub tag: String,
    pub class: String,
    pub parent_class: String,
    pub aria_label: Option<String>,
    pub rel: Option<String>,
    pub text: String,
    pub href: Option<String>,
    pub disabled: bool,
    /// `(container id, class attribute)` for every classed ancestor,
    /// innermost first
    ancestors: Vec<(usize, String)>,
}

impl Control {
    fn matches(&self, heuristic: &ControlHeuristic) -> bool {
        match heuristic {
            ControlHeuristic::Class(v) => self.class.contains(v.as_str()),
            ControlHeuristic::AriaLabel(v) => self
                .aria_label
                .as_ref()
                .is_some_and(|l| l.to_lowercase().contains(&v.to_lowercase())),
            ControlHeuristic::Rel(v) => self
                .rel
                .as_ref()
                .is_some_and(|r| r.split_whitespace().any(|t| t == v)),
            ControlHeuristic::Text(v) => self.text.contains(v.as_str()),
            ControlHeuristic::ParentClass(v) => self.parent_class.contains(v.as_str()),
            // Needs the whole page; handled in PageStructure::find
            ControlHeuristic::LastIn(_) => false,
        }
    }

    fn container_matching(&self, class: &str) -> Option<usize> {
        self.ancestors
            .iter()
            .find(|(_, c)| c.contains(class))
            .map(|(id, _)| *id)
    }
}

/// Something a fetcher can act on to move to the next page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHandle {
    pub index: usize,
    pub href: Option<String>,
    pub label: String,
    /// The heuristic that found it, for logging
    pub matched_by: String,
}

/// Clickable elements of one page
#[derive(Debug, Clone, Default)]
pub struct PageStructure {
    pub controls: Vec<Control>,
}

fn is_disabled(element: &ElementRef, class: &str, parent_class: &str) -> bool {
    let attrs = element.value();
    attrs.attr("disabled").is_some()
        || attrs.attr("aria-disabled") == Some("true")
        || class.contains("disabled")
        || parent_class.contains("disabled")
}

impl PageStructure {
    pub fn parse(markup: &str) -> Self {
        let document = Html::parse_document(markup);
        let selector = match Selector::parse("a, button") {
            Ok(s) => s,
            Err(_) => return Self::default(),
        };

        let mut container_ids = HashMap::new();
        let mut controls = Vec::new();

        for (index, element) in document.select(&selector).enumerate() {
            let value = element.value();
            let class = value.attr("class").unwrap_or("").to_string();
            let parent = element.parent().and_then(ElementRef::wrap);
            let parent_class = parent
                .and_then(|p| p.value().attr("class"))
                .unwrap_or("")
                .to_string();

            let mut ancestors = Vec::new();
            for ancestor in element.ancestors().filter_map(ElementRef::wrap) {
                if let Some(c) = ancestor.value().attr("class") {
                    let next_id = container_ids.len();
                    let id = *container_ids.entry(ancestor.id()).or_insert(next_id);
                    ancestors.push((id, c.to_string()));
                }
            }

            let text = element
                .text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            controls.push(Control {
                index,
                tag: value.name().to_string(),
                disabled: is_disabled(&element, &class, &parent_class),
                class,
                parent_class,
                aria_label: value.attr("aria-label").map(str::to_string),
                rel: value.attr("rel").map(str::to_string),
                text,
                href: value.attr("href").map(str::to_string),
                ancestors,
            });
        }

        Self { controls }
    }

    /// First enabled control matched by the earliest heuristic
    pub fn find(&self, heuristics: &[ControlHeuristic]) -> Option<ControlHandle> {
        heuristics.iter().find_map(|heuristic| {
            let found = match heuristic {
                ControlHeuristic::LastIn(class) => self.last_in(class),
                _ => self
                    .controls
                    .iter()
                    .find(|c| !c.disabled && c.matches(heuristic)),
            };
            found.map(|c| ControlHandle {
                index: c.index,
                href: c.href.clone(),
                label: c.text.clone(),
                matched_by: heuristic.to_string(),
            })
        })
    }

    fn last_in(&self, class: &str) -> Option<&Control> {
        let container = self
            .controls
            .iter()
            .find_map(|c| c.container_matching(class))?;
        self.controls
            .iter()
            .filter(|c| c.tag == "a" && c.container_matching(class) == Some(container))
            .last()
            .filter(|c| !c.disabled)
    }
}
