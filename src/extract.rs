//! Result-table extraction from rendered page markup

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no table matching '{0}' on page")]
    NoTableFound(String),
    #[error("invalid selector '{0}'")]
    Selector(String),
}

/// How many cells a body row must have to be accepted
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RowArity {
    /// One cell per header column
    #[default]
    Exact,
    /// The header carries an extra trailing column that is filled in later
    /// with the target name, so rows have one cell fewer than the header.
    SourceColumn(String),
}

impl RowArity {
    pub fn expected_cells(&self, header_width: usize) -> usize {
        match self {
            RowArity::Exact => header_width,
            RowArity::SourceColumn(_) => header_width.saturating_sub(1),
        }
    }

    pub fn accepts(&self, header_width: usize, cells: usize) -> bool {
        header_width > 0 && cells == self.expected_cells(header_width)
    }
}

/// Parsed content of one page's table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedTable {
    /// Column names found on this page, with the source column appended
    /// when the arity rule asks for one
    pub headers: Vec<String>,
    /// Rows whose width matched
    pub rows: Vec<Vec<String>>,
    /// Non-empty rows rejected for a width mismatch
    pub dropped: usize,
}

impl ExtractedTable {
    /// Body rows seen on the page before the width check
    pub fn body_rows(&self) -> usize {
        self.rows.len() + self.dropped
    }
}

pub struct TableExtractor {
    table_selector: String,
    table: Selector,
    rows: Selector,
    cells: Selector,
    arity: RowArity,
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::Selector(selector.to_string()))
}

/// Text of an element with each text node trimmed, joined by single spaces
fn cell_text(element: ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parent_name<'a>(element: &ElementRef<'a>) -> Option<&'a str> {
    element
        .parent()
        .and_then(ElementRef::wrap)
        .map(|p| p.value().name())
}

impl TableExtractor {
    pub fn new(table_selector: &str, arity: RowArity) -> Result<Self, ExtractError> {
        Ok(Self {
            table_selector: table_selector.to_string(),
            table: parse_selector(table_selector)?,
            rows: parse_selector("tr")?,
            cells: parse_selector("th, td")?,
            arity,
        })
    }

    pub fn arity(&self) -> &RowArity {
        &self.arity
    }

    pub fn table_selector(&self) -> &str {
        &self.table_selector
    }

    /// Parse the first matching table into headers and width-checked rows.
    ///
    /// `established` is the header fixed by an earlier page of the same
    /// target; when given, row widths are checked against it instead of
    /// this page's header. A table without body rows yields an empty row
    /// list, not an error.
    pub fn extract(
        &self,
        markup: &str,
        established: Option<&[String]>,
    ) -> Result<ExtractedTable, ExtractError> {
        let document = Html::parse_document(markup);
        let table = document
            .select(&self.table)
            .next()
            .ok_or_else(|| ExtractError::NoTableFound(self.table_selector.clone()))?;

        let all_rows: Vec<ElementRef> = table.select(&self.rows).collect();
        let head_row = all_rows
            .iter()
            .position(|row| parent_name(row) == Some("thead"));

        // Without a <thead> the first row doubles as the header
        let (header_index, body): (Option<usize>, Vec<&ElementRef>) = match head_row {
            Some(i) => (
                Some(i),
                all_rows
                    .iter()
                    .filter(|row| !matches!(parent_name(row), Some("thead") | Some("tfoot")))
                    .collect(),
            ),
            None if !all_rows.is_empty() => (Some(0), all_rows.iter().skip(1).collect()),
            None => (None, Vec::new()),
        };

        let mut headers: Vec<String> = header_index
            .map(|i| all_rows[i].select(&self.cells).map(cell_text).collect())
            .unwrap_or_default();
        if let RowArity::SourceColumn(column) = &self.arity {
            if !headers.is_empty() && !headers.contains(column) {
                headers.push(column.clone());
            }
        }

        let width = established.map_or(headers.len(), <[String]>::len);
        let mut table_out = ExtractedTable {
            headers,
            ..Default::default()
        };

        for row in body {
            let cells: Vec<String> = row.select(&self.cells).map(cell_text).collect();
            if cells.is_empty() {
                continue;
            }
            if self.arity.accepts(width, cells.len()) {
                table_out.rows.push(cells);
            } else {
                table_out.dropped += 1;
            }
        }

        Ok(table_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table class="table">
          <thead><tr><th>Bezeichnung</th><th>Lieferant</th><th>Summe</th></tr></thead>
          <tbody>
            <tr><td>Gleisbau Los 3</td><td> Stadtbau AG </td><td>1.234,00</td></tr>
            <tr><td>Beratung</td><td>Accenture GmbH</td><td>99.000,50</td></tr>
            <tr><td colspan="3">Keine weiteren Daten</td></tr>
          </tbody>
        </table>
        </body></html>"#;

    fn extractor() -> TableExtractor {
        TableExtractor::new("table", RowArity::Exact).unwrap()
    }

    #[test]
    fn test_thead_and_tbody() {
        let table = extractor().extract(PAGE, None).unwrap();
        assert_eq!(table.headers, vec!["Bezeichnung", "Lieferant", "Summe"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0], vec!["Gleisbau Los 3", "Stadtbau AG", "1.234,00"]);
        assert_eq!(table.dropped, 1);
        assert_eq!(table.body_rows(), 3);
    }

    #[test]
    fn test_first_row_is_header_without_thead() {
        let markup = "<table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table>";
        let table = extractor().extract(markup, None).unwrap();
        assert_eq!(table.headers, vec!["A", "B"]);
        assert_eq!(table.rows, vec![vec!["1".to_string(), "2".to_string()]]);
    }

    #[test]
    fn test_missing_table() {
        let err = extractor().extract("<div>Keine Treffer</div>", None).unwrap_err();
        assert_eq!(err, ExtractError::NoTableFound("table".to_string()));
    }

    #[test]
    fn test_empty_body_is_not_an_error() {
        let markup = "<table><thead><tr><th>A</th></tr></thead><tbody></tbody></table>";
        let table = extractor().extract(markup, None).unwrap();
        assert_eq!(table.headers, vec!["A"]);
        assert!(table.rows.is_empty());
        assert_eq!(table.body_rows(), 0);
    }

    #[test]
    fn test_established_header_wins() {
        let header: Vec<String> = vec!["A".into(), "B".into()];
        let markup = "<table><thead><tr><th>X</th><th>Y</th><th>Z</th></tr></thead>\
                      <tbody><tr><td>1</td><td>2</td></tr><tr><td>1</td><td>2</td><td>3</td></tr></tbody></table>";
        let table = extractor().extract(markup, Some(&header)).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.dropped, 1);
    }

    #[test]
    fn test_source_column_arity() {
        let extractor =
            TableExtractor::new("table", RowArity::SourceColumn("Subsidiary".into())).unwrap();
        let table = extractor.extract(PAGE, None).unwrap();
        assert_eq!(table.headers.last().map(String::as_str), Some("Subsidiary"));
        assert_eq!(table.headers.len(), 4);
        // rows still carry three cells; the fourth is appended by the caller
        assert!(table.rows.iter().all(|r| r.len() == 3));
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_every_accepted_row_matches_header_width() {
        let table = extractor().extract(PAGE, None).unwrap();
        assert!(table.rows.iter().all(|r| r.len() == table.headers.len()));
    }

    #[test]
    fn test_bad_selector() {
        assert!(matches!(
            TableExtractor::new("table[", RowArity::Exact),
            Err(ExtractError::Selector(_))
        ));
    }
}
