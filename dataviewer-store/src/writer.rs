use crate::error::{Error, Result};
use crate::manifest::{FragmentMeta, TableManifest};
use crate::table::StoreTable;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::{debug, info};

/// Rows per fragment file before the writer rolls over to a new one
pub const MAX_ROWS_PER_FRAGMENT: usize = 1_048_576;

struct OpenFragment {
    writer: FileWriter<BufWriter<File>>,
    meta: FragmentMeta,
}

/// Streams record batches into a sequence of Arrow IPC fragment files.
///
/// Only the batch currently being written is held in memory.
pub struct FragmentWriter {
    dir: PathBuf,
    schema: SchemaRef,
    max_rows_per_fragment: usize,
    current: Option<OpenFragment>,
    finished: Vec<FragmentMeta>,
}

impl FragmentWriter {
    pub fn new(dir: impl Into<PathBuf>, schema: SchemaRef, max_rows_per_fragment: usize) -> Self {
        Self {
            dir: dir.into(),
            schema,
            max_rows_per_fragment: max_rows_per_fragment.max(1),
            current: None,
            finished: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if !same_columns(batch.schema().as_ref(), self.schema.as_ref()) {
            return Err(Error::SchemaMismatch(format!(
                "batch columns {:?} do not match table columns {:?}",
                batch.schema().fields(),
                self.schema.fields()
            )));
        }

        // Re-attach the table schema so nullability and metadata agree on disk
        let batch = RecordBatch::try_new(self.schema.clone(), batch.columns().to_vec())?;

        let max_rows = self.max_rows_per_fragment;
        let mut offset = 0;
        while offset < batch.num_rows() {
            let fragment = self.current_fragment()?;
            let capacity = max_rows - fragment.meta.num_rows as usize;
            let len = capacity.min(batch.num_rows() - offset);

            fragment.writer.write(&batch.slice(offset, len))?;
            fragment.meta.num_rows += len as u64;
            fragment.meta.batch_rows.push(len as u64);
            offset += len;

            if fragment.meta.num_rows as usize >= max_rows {
                self.close_current()?;
            }
        }

        Ok(())
    }

    /// Close the open fragment and return every fragment written.
    ///
    /// A writer that saw no rows still produces one empty fragment so the
    /// schema survives on disk.
    pub fn finish(mut self) -> Result<Vec<FragmentMeta>> {
        self.close_current()?;
        if self.finished.is_empty() {
            self.current_fragment()?;
            self.close_current()?;
        }
        Ok(self.finished)
    }

    fn current_fragment(&mut self) -> Result<&mut OpenFragment> {
        let fragment = match self.current.take() {
            Some(fragment) => fragment,
            None => self.open_fragment()?,
        };
        Ok(self.current.insert(fragment))
    }

    fn open_fragment(&self) -> Result<OpenFragment> {
        let file_name = format!("part-{}.arrow", self.finished.len());
        let file = File::create(self.dir.join(&file_name))?;
        let writer = FileWriter::try_new(BufWriter::new(file), &self.schema)?;

        Ok(OpenFragment {
            writer,
            meta: FragmentMeta {
                file: file_name,
                num_rows: 0,
                batch_rows: Vec::new(),
            },
        })
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(mut fragment) = self.current.take() {
            fragment.writer.finish()?;
            debug!(
                file = %fragment.meta.file,
                rows = fragment.meta.num_rows,
                "closed fragment"
            );
            self.finished.push(fragment.meta);
        }
        Ok(())
    }
}

fn same_columns(left: &Schema, right: &Schema) -> bool {
    left.fields().len() == right.fields().len()
        && left
            .fields()
            .iter()
            .zip(right.fields().iter())
            .all(|(l, r)| l.name() == r.name() && l.data_type() == r.data_type())
}

/// An uncommitted table version.
///
/// Nothing becomes visible to readers until [`TableWriter::commit`] swaps
/// the manifest. A writer dropped before commit leaves an orphaned version
/// directory behind, which the next optimize removes.
pub struct TableWriter {
    name: String,
    table_dir: PathBuf,
    version: u64,
    fragments: FragmentWriter,
    rows_written: u64,
}

impl TableWriter {
    pub(crate) fn new(
        name: &str,
        table_dir: PathBuf,
        version: u64,
        schema: SchemaRef,
        max_rows_per_fragment: usize,
    ) -> Result<Self> {
        let version_dir = table_dir.join(TableManifest::version_dir_name(version));
        fs::create_dir_all(&version_dir)?;

        Ok(Self {
            name: name.to_string(),
            table_dir,
            version,
            fragments: FragmentWriter::new(version_dir, schema, max_rows_per_fragment),
            rows_written: 0,
        })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.fragments.write(batch)?;
        self.rows_written += batch.num_rows() as u64;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn schema(&self) -> &SchemaRef {
        self.fragments.schema()
    }

    /// Publish the version by replacing the table manifest
    pub fn commit(self) -> Result<StoreTable> {
        let fragments = self.fragments.finish()?;
        let manifest = TableManifest::new(self.version, fragments);
        manifest.write_atomic(&self.table_dir)?;

        info!(
            table = %self.name,
            version = self.version,
            rows = self.rows_written,
            fragments = manifest.fragments.len(),
            "committed table version"
        );

        StoreTable::open(&self.table_dir, &self.name)
    }
}
