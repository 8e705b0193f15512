//! Buffered, batch-wise persistence of extracted rows
//!
//! Rows are held in memory until a full batch is available and then written
//! to the target's sink with the subsidiary columns prepended. A crash can
//! lose at most the rows of the batch being filled.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::types::{RawRow, ScrapeTarget};

/// Identity columns written in front of the portal's own columns
pub const IDENTITY_COLUMNS: [&str; 2] = ["subsidiary_name", "subsidiary_id"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable destination for one target's records
pub trait RowSink {
    fn write_header(&mut self, header: &[String]) -> Result<(), SinkError>;
    fn write_records(&mut self, records: &[Vec<String>]) -> Result<(), SinkError>;
}

/// CSV file sink. The file is created on the first write, so targets that
/// never produce a row leave nothing behind.
///
/// Each call is encoded in memory first and reaches the file in one write,
/// so a batch that fails to encode leaves no partial rows on disk.
pub struct CsvFileSink {
    path: PathBuf,
    file: Option<File>,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn encode<R: AsRef<[String]>>(records: &[R]) -> Result<Vec<u8>, SinkError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in records {
            writer.write_record(record.as_ref())?;
        }
        writer.into_inner().map_err(|e| SinkError::Io(e.into_error()))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => File::create(&self.path)?,
        };
        let file = self.file.insert(file);
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }
}

impl RowSink for CsvFileSink {
    fn write_header(&mut self, header: &[String]) -> Result<(), SinkError> {
        let bytes = Self::encode(&[header])?;
        self.write_bytes(&bytes)
    }

    fn write_records(&mut self, records: &[Vec<String>]) -> Result<(), SinkError> {
        let bytes = Self::encode(records)?;
        self.write_bytes(&bytes)
    }
}

pub struct BatchWriter<S: RowSink> {
    target: Arc<ScrapeTarget>,
    sink: S,
    threshold: usize,
    header: Option<Vec<String>>,
    header_written: bool,
    buffer: Vec<RawRow>,
    flushes: usize,
    failed_flushes: usize,
    rows_written: usize,
}

impl<S: RowSink> BatchWriter<S> {
    pub fn new(target: Arc<ScrapeTarget>, sink: S, threshold: usize) -> Self {
        Self {
            target,
            sink,
            threshold: threshold.max(1),
            header: None,
            header_written: false,
            buffer: Vec::new(),
            flushes: 0,
            failed_flushes: 0,
            rows_written: 0,
        }
    }

    /// Fix the portal header for this target. Later calls are ignored.
    pub fn set_header(&mut self, header: Vec<String>) {
        if self.header.is_none() {
            self.header = Some(header);
        }
    }

    /// Buffer rows, writing out every batch that fills up along the way
    pub fn append(&mut self, rows: impl IntoIterator<Item = RawRow>) {
        for row in rows {
            self.buffer.push(row);
            self.flush_if_full();
        }
    }

    /// Write full batches while the buffer holds a threshold's worth.
    /// Returns true if anything was written.
    pub fn flush_if_full(&mut self) -> bool {
        let mut flushed = false;
        while self.buffer.len() >= self.threshold {
            if !self.flush_batch(self.threshold) {
                break;
            }
            flushed = true;
        }
        flushed
    }

    /// Write whatever is buffered. Must run at the end of every target loop.
    /// Returns the number of rows still unwritten afterwards.
    pub fn flush_remaining(&mut self) -> usize {
        if !self.buffer.is_empty() {
            self.flush_batch(self.buffer.len());
        }
        self.buffer.len()
    }

    fn tagged(&self, row: &RawRow) -> Vec<String> {
        let mut record = Vec::with_capacity(row.cells.len() + IDENTITY_COLUMNS.len());
        record.push(row.target.display_name.clone());
        record.push(row.target.external_id.clone());
        record.extend(row.cells.iter().cloned());
        record
    }

    /// Write the first `count` buffered rows. On failure the rows stay
    /// buffered for the next attempt.
    fn flush_batch(&mut self, count: usize) -> bool {
        let records: Vec<Vec<String>> =
            self.buffer[..count].iter().map(|row| self.tagged(row)).collect();

        let result = self.write_out(&records);

        match result {
            Ok(()) => {
                self.buffer.drain(..count);
                self.flushes += 1;
                self.rows_written += count;
                info!(
                    subsidiary = %self.target.key,
                    rows = count,
                    total = self.rows_written,
                    "Saved batch"
                );
                true
            }
            Err(e) => {
                self.failed_flushes += 1;
                error!(
                    subsidiary = %self.target.key,
                    rows = count,
                    error = %e,
                    "Failed to save batch, keeping rows buffered"
                );
                false
            }
        }
    }

    fn write_out(&mut self, records: &[Vec<String>]) -> Result<(), SinkError> {
        if !self.header_written {
            let mut header: Vec<String> =
                IDENTITY_COLUMNS.iter().map(|c| c.to_string()).collect();
            header.extend(self.header.iter().flatten().cloned());
            self.sink.write_header(&header)?;
            self.header_written = true;
        }
        self.sink.write_records(records)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn failed_flushes(&self) -> usize {
        self.failed_flushes
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records batch sizes instead of writing anywhere
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub header: Option<Vec<String>>,
        pub batches: Vec<Vec<Vec<String>>>,
        pub fail_next: usize,
    }

    impl RowSink for MemorySink {
        fn write_header(&mut self, header: &[String]) -> Result<(), SinkError> {
            self.header = Some(header.to_vec());
            Ok(())
        }

        fn write_records(&mut self, records: &[Vec<String>]) -> Result<(), SinkError> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(SinkError::Io(std::io::Error::other("disk full")));
            }
            self.batches.push(records.to_vec());
            Ok(())
        }
    }

    pub(crate) fn target() -> Arc<ScrapeTarget> {
        Arc::new(ScrapeTarget {
            key: "obb_business".into(),
            display_name: "ÖBB-Business Competence Center".into(),
            external_id: "8550".into(),
            source_url: "https://offenevergaben.at/auftraggeber/8550".into(),
        })
    }

    fn rows(n: usize) -> Vec<RawRow> {
        let target = target();
        (0..n)
            .map(|i| RawRow::new(target.clone(), vec![format!("item {}", i), "1,00".into()]))
            .collect()
    }

    #[test]
    fn test_flush_sizes() {
        let mut writer = BatchWriter::new(target(), MemorySink::default(), 1000);
        writer.set_header(vec!["Bezeichnung".into(), "Summe".into()]);
        writer.append(rows(2500));

        assert_eq!(writer.flushes(), 2);
        assert_eq!(writer.buffered(), 500);

        assert_eq!(writer.flush_remaining(), 0);
        let sizes: Vec<usize> = writer.sink().batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(writer.rows_written(), 2500);
    }

    #[test]
    fn test_header_written_once_with_identity() {
        let mut writer = BatchWriter::new(target(), MemorySink::default(), 2);
        writer.set_header(vec!["Bezeichnung".into(), "Summe".into()]);
        writer.set_header(vec!["ignored".into()]);
        writer.append(rows(5));
        writer.flush_remaining();

        let header = writer.sink().header.clone().unwrap();
        assert_eq!(
            header,
            vec!["subsidiary_name", "subsidiary_id", "Bezeichnung", "Summe"]
        );
        let first = &writer.sink().batches[0][0];
        assert_eq!(first[0], "ÖBB-Business Competence Center");
        assert_eq!(first[1], "8550");
        assert_eq!(first[2], "item 0");
    }

    #[test]
    fn test_failed_flush_keeps_rows() {
        let sink = MemorySink {
            fail_next: 1,
            ..Default::default()
        };
        let mut writer = BatchWriter::new(target(), sink, 3);
        writer.set_header(vec!["Bezeichnung".into(), "Summe".into()]);
        writer.append(rows(3));
        assert_eq!(writer.failed_flushes(), 1);
        assert_eq!(writer.buffered(), 3);

        writer.append(rows(1));
        assert_eq!(writer.flush_remaining(), 0);
        let total: usize = writer.sink().batches.iter().map(Vec::len).sum();
        assert_eq!(total, 4);
        assert!(writer.sink().header.is_some());
    }

    #[test]
    fn test_flush_remaining_on_empty_buffer() {
        let mut writer = BatchWriter::new(target(), MemorySink::default(), 10);
        assert_eq!(writer.flush_remaining(), 0);
        assert_eq!(writer.flushes(), 0);
        assert!(writer.sink().header.is_none());
    }

    #[test]
    fn test_csv_sink_failed_batch_leaves_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obb_business.csv");
        let mut sink = CsvFileSink::new(&path);
        sink.write_header(&["Bezeichnung".to_string(), "Summe".to_string()])
            .unwrap();

        // the second record is short, so the batch fails after the first
        let broken = vec![
            vec!["Gleisbau".to_string(), "1,00".to_string()],
            vec!["kaputt".to_string()],
        ];
        assert!(sink.write_records(&broken).is_err());
        sink.write_records(&broken[..1]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Bezeichnung,Summe\nGleisbau,\"1,00\"\n");
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obb_business.csv");
        let mut writer = BatchWriter::new(target(), CsvFileSink::new(&path), 2);
        writer.set_header(vec!["Bezeichnung".into(), "Summe".into()]);
        let original: Vec<Vec<String>> = vec![
            vec!["Gleisbau, Los 3".into(), "1.234,00".into()],
            vec!["Reinigung \"Nord\"".into(), "".into()],
            vec!["Beratung".into(), "99.000,50".into()],
        ];
        let target = target();
        writer.append(original.iter().map(|c| RawRow::new(target.clone(), c.clone())));
        writer.flush_remaining();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers[2..], ["Bezeichnung", "Summe"]);
        let read: Vec<Vec<String>> = reader
            .records()
            .map(|r| r.unwrap().iter().skip(2).map(String::from).collect())
            .collect();
        assert_eq!(read, original);
    }
}
