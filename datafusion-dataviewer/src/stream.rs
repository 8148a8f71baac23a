//! Lazy, projected, windowed batch stream over a source dataset.

use datafusion::arrow::csv::reader::Format as CsvFormat;
use datafusion::arrow::csv::ReaderBuilder as CsvReaderBuilder;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::json::reader::infer_json_schema;
use datafusion::arrow::json::ReaderBuilder as JsonReaderBuilder;
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchReader};
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::parquet::arrow::ProjectionMask;
use globset::Glob;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::dataset::{
    has_glob, location_path, location_scheme, ColumnProjection, DatasetDescriptor, DatasetFormat,
    RowWindow,
};
use crate::error::{Error, Result};
use crate::schema::{normalize_batch, normalize_schema};

/// Records read when inferring CSV and JSON schemas
pub const SCHEMA_INFER_MAX_RECORDS: usize = 1000;

/// Expand a location into the local files it names.
///
/// `file://` locations are treated as local paths. A glob in the final
/// segment matches files in the parent directory, returned in name order.
/// Object storage locations must be staged locally first, see
/// [`crate::remote`].
pub fn resolve_sources(location: &str) -> Result<Vec<PathBuf>> {
    let path = match location_scheme(location) {
        None => location,
        Some("file") => location_path(location),
        Some(_) => return Err(Error::UnsupportedLocation(location.to_string())),
    };

    let path = Path::new(path);
    let pattern = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if !has_glob(pattern) {
        return Ok(vec![path.to_path_buf()]);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let matcher = Glob::new(pattern)
        .map_err(|e| Error::UnsupportedLocation(format!("{}: {}", location, e)))?
        .compile_matcher();

    let mut files = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && matcher.is_match(entry.file_name()) {
            files.push(entry.path());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no files match {}", location),
        )));
    }
    Ok(files)
}

struct SourceReader {
    reader: Box<dyn RecordBatchReader + Send>,
    /// Column order fix-up applied to each batch after reading
    reorder: Option<Vec<usize>>,
}

pub struct DatasetStream {
    format: DatasetFormat,
    delimiter: u8,
    source_schema: SchemaRef,
    projection: Vec<usize>,
    schema: SchemaRef,
    pending: VecDeque<PathBuf>,
    current: Option<SourceReader>,
    batch_size: usize,
    skip: usize,
    remaining: Option<usize>,
    rows_emitted: u64,
    progress: Option<ProgressBar>,
    done: bool,
}

impl DatasetStream {
    /// Open a stream over a CSV/TSV, JSON lines, or Parquet dataset.
    ///
    /// Nothing beyond schema metadata is read until the first batch is
    /// requested.
    pub fn open(
        descriptor: &DatasetDescriptor,
        window: RowWindow,
        projection: &ColumnProjection,
        batch_size: usize,
        show_progress: bool,
    ) -> Result<Self> {
        if descriptor.format == DatasetFormat::Columnar {
            return Err(Error::UnsupportedFormat(descriptor.location.clone()));
        }
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }

        let sources = resolve_sources(&descriptor.location)?;
        let delimiter = descriptor.delimiter();
        let source_schema = infer_schema(descriptor.format, &sources[0], delimiter)?;

        let all_columns: Vec<String> = source_schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let selected = projection.select(&all_columns)?;
        let indices = selected
            .iter()
            .map(|name| source_schema.index_of(name))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let schema = normalize_schema(&source_schema.project(&indices)?);

        let total_rows = match descriptor.format {
            DatasetFormat::Parquet => Some(parquet_row_count(&sources)?),
            _ => None,
        };
        let progress = show_progress.then(|| progress_bar(total_rows, window));

        debug!(
            location = %descriptor.location,
            files = sources.len(),
            columns = indices.len(),
            "opened dataset stream"
        );

        Ok(Self {
            format: descriptor.format,
            delimiter,
            source_schema,
            projection: indices,
            schema,
            pending: sources.into(),
            current: None,
            batch_size,
            skip: window.skip(),
            remaining: window.take(),
            rows_emitted: 0,
            progress,
            done: false,
        })
    }

    /// Normalized schema of emitted batches
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    fn open_source(&self, path: &Path) -> Result<SourceReader> {
        debug!(path = %path.display(), "reading source file");
        match self.format {
            DatasetFormat::Csv => {
                let format = CsvFormat::default()
                    .with_header(true)
                    .with_delimiter(self.delimiter);
                let reader = CsvReaderBuilder::new(self.source_schema.clone())
                    .with_format(format)
                    .with_batch_size(self.batch_size)
                    .with_projection(self.projection.clone())
                    .build(File::open(path)?)?;
                Ok(SourceReader {
                    reader: Box::new(reader),
                    reorder: None,
                })
            }
            DatasetFormat::Jsonl => {
                let reader = JsonReaderBuilder::new(self.source_schema.clone())
                    .with_batch_size(self.batch_size)
                    .build(BufReader::new(File::open(path)?))?;
                Ok(SourceReader {
                    reader: Box::new(reader),
                    reorder: Some(self.projection.clone()),
                })
            }
            DatasetFormat::Parquet => {
                let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
                let file_columns: Vec<&String> =
                    builder.schema().fields().iter().map(|f| f.name()).collect();
                let expected: Vec<&String> =
                    self.source_schema.fields().iter().map(|f| f.name()).collect();
                if file_columns != expected {
                    return Err(Error::SchemaCast(format!(
                        "{} does not share the schema of the first file",
                        path.display()
                    )));
                }

                // The reader emits projected columns in file order
                let mut sorted = self.projection.clone();
                sorted.sort_unstable();
                let reorder = self
                    .projection
                    .iter()
                    .filter_map(|idx| sorted.iter().position(|s| s == idx))
                    .collect();

                let mask = ProjectionMask::roots(builder.parquet_schema(), sorted);
                let reader = builder
                    .with_projection(mask)
                    .with_batch_size(self.batch_size)
                    .build()?;
                Ok(SourceReader {
                    reader: Box::new(reader),
                    reorder: Some(reorder),
                })
            }
            DatasetFormat::Columnar => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if self.remaining == Some(0) {
                return Ok(None);
            }

            if self.current.is_none() {
                match self.pending.pop_front() {
                    Some(path) => self.current = Some(self.open_source(&path)?),
                    None => return Ok(None),
                }
            }
            let Some(current) = self.current.as_mut() else {
                continue;
            };

            let mut batch = match current.reader.next() {
                Some(batch) => batch?,
                None => {
                    self.current = None;
                    continue;
                }
            };
            if let Some(reorder) = &current.reorder {
                batch = batch.project(reorder)?;
            }

            if self.skip > 0 {
                if self.skip >= batch.num_rows() {
                    self.skip -= batch.num_rows();
                    continue;
                }
                batch = batch.slice(self.skip, batch.num_rows() - self.skip);
                self.skip = 0;
            }
            if let Some(remaining) = self.remaining.as_mut() {
                if batch.num_rows() > *remaining {
                    batch = batch.slice(0, *remaining);
                }
                *remaining -= batch.num_rows();
            }
            if batch.num_rows() == 0 {
                continue;
            }

            let batch = normalize_batch(&batch, &self.schema)?;
            self.rows_emitted += batch.num_rows() as u64;
            if let Some(pb) = &self.progress {
                pb.set_position(self.rows_emitted);
                pb.set_message(format!("{} rows", self.rows_emitted));
            }
            return Ok(Some(batch));
        }
    }

    fn finish_progress(&self) {
        if let Some(pb) = &self.progress {
            pb.finish_with_message(format!("{} rows streamed", self.rows_emitted));
        }
    }
}

impl Iterator for DatasetStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                self.finish_progress();
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn infer_schema(format: DatasetFormat, path: &Path, delimiter: u8) -> Result<SchemaRef> {
    match format {
        DatasetFormat::Csv => {
            let mut file = File::open(path)?;
            let (schema, _) = CsvFormat::default()
                .with_header(true)
                .with_delimiter(delimiter)
                .infer_schema(&mut file, Some(SCHEMA_INFER_MAX_RECORDS))?;
            file.rewind()?;
            Ok(Arc::new(schema))
        }
        DatasetFormat::Jsonl => {
            let mut reader = BufReader::new(File::open(path)?);
            let (schema, _) = infer_json_schema(&mut reader, Some(SCHEMA_INFER_MAX_RECORDS))?;
            Ok(Arc::new(schema))
        }
        DatasetFormat::Parquet => {
            let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
            Ok(builder.schema().clone())
        }
        DatasetFormat::Columnar => Err(Error::UnsupportedFormat(path.display().to_string())),
    }
}

fn parquet_row_count(sources: &[PathBuf]) -> Result<u64> {
    let mut total = 0u64;
    for path in sources {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        total += builder.metadata().file_metadata().num_rows().max(0) as u64;
    }
    Ok(total)
}

fn progress_bar(total_rows: Option<u64>, window: RowWindow) -> ProgressBar {
    let bounded = total_rows.map(|total| {
        let total = total.saturating_sub(window.skip() as u64);
        match window.take() {
            Some(take) => total.min(take as u64),
            None => total,
        }
    });

    match bounded {
        Some(len) => {
            let pb = ProgressBar::new(len);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40}] {pos}/{len} rows ({per_sec})",
            ) {
                pb.set_style(style);
            }
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg} ({per_sec})")
            {
                pb.set_style(style.tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "));
            }
            pb.set_message("Streaming rows...");
            pb
        }
    }
}
