use crate::error::{Error, Result};
use crate::index::ScalarIndex;
use crate::manifest::{IndexMeta, TableManifest, MANIFEST_FILE};
use arrow::array::{ArrayRef, UInt64Array};
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::FileReader;
use arrow::record_batch::RecordBatch;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Lazy batch reader over one fragment file
pub type FragmentReader = FileReader<BufReader<File>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub removed_versions: usize,
    pub removed_files: usize,
}

/// A committed version of a table
#[derive(Debug, Clone)]
pub struct StoreTable {
    name: String,
    dir: PathBuf,
    manifest: TableManifest,
    schema: SchemaRef,
}

impl StoreTable {
    /// Open the version named by the table manifest
    pub(crate) fn open(table_dir: &Path, name: &str) -> Result<Self> {
        if !table_dir.join(MANIFEST_FILE).is_file() {
            return Err(Error::TableNotFound(name.to_string()));
        }

        let manifest = TableManifest::from_dir(table_dir)?;
        let first = manifest.fragments.first().ok_or_else(|| {
            Error::Manifest(format!("Table {} has no fragments", name))
        })?;

        let version_dir = table_dir.join(TableManifest::version_dir_name(manifest.version));
        let reader = FileReader::try_new(
            BufReader::new(File::open(version_dir.join(&first.file))?),
            None,
        )?;

        Ok(Self {
            name: name.to_string(),
            dir: table_dir.to_path_buf(),
            schema: reader.schema(),
            manifest,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn version(&self) -> u64 {
        self.manifest.version
    }

    pub fn manifest(&self) -> &TableManifest {
        &self.manifest
    }

    pub fn num_rows(&self) -> u64 {
        self.manifest.num_rows()
    }

    pub fn num_fragments(&self) -> usize {
        self.manifest.fragments.len()
    }

    pub fn version_dir(&self) -> PathBuf {
        self.dir
            .join(TableManifest::version_dir_name(self.manifest.version))
    }

    /// Open a lazy reader over one fragment, optionally projecting columns
    pub fn read_fragment(
        &self,
        fragment: usize,
        projection: Option<Vec<usize>>,
    ) -> Result<FragmentReader> {
        let meta = self.manifest.fragments.get(fragment).ok_or_else(|| {
            Error::Manifest(format!(
                "Fragment {} out of range (table {} has {})",
                fragment,
                self.name,
                self.num_fragments()
            ))
        })?;

        let file = File::open(self.version_dir().join(&meta.file))?;
        Ok(FileReader::try_new(BufReader::new(file), projection)?)
    }

    /// Fetch a single row as a one-row batch.
    ///
    /// Only the IPC batch holding the row is decoded.
    pub fn take_row(&self, row_id: u64) -> Result<RecordBatch> {
        let (fragment, batch_idx, offset) =
            self.manifest
                .locate_row(row_id)
                .ok_or(Error::RowOutOfRange {
                    row: row_id,
                    num_rows: self.num_rows(),
                })?;

        let mut reader = self.read_fragment(fragment, None)?;
        reader.set_index(batch_idx)?;
        let batch = reader.next().transpose()?.ok_or_else(|| {
            Error::Manifest(format!(
                "Fragment {} of table {} is missing batch {}",
                fragment, self.name, batch_idx
            ))
        })?;

        Ok(batch.slice(offset, 1))
    }

    /// Build (or rebuild) the scalar index on `column` and record it in the
    /// manifest
    pub fn create_scalar_index(&mut self, column: &str) -> Result<()> {
        let col_idx = self
            .schema
            .index_of(column)
            .map_err(|_| Error::ColumnNotFound(column.to_string()))?;
        let data_type = self.schema.field(col_idx).data_type().clone();

        let mut values: Vec<ArrayRef> = Vec::new();
        let mut row_ids: Vec<ArrayRef> = Vec::new();
        let mut next_row = 0u64;

        for fragment in 0..self.num_fragments() {
            for batch in self.read_fragment(fragment, Some(vec![col_idx]))? {
                let batch = batch?;
                let rows = batch.num_rows() as u64;
                values.push(batch.column(0).clone());
                row_ids.push(Arc::new(UInt64Array::from_iter_values(
                    next_row..next_row + rows,
                )));
                next_row += rows;
            }
        }

        let index = ScalarIndex::build(column, &data_type, &values, &row_ids)?;
        let file = format!("index-{}.arrow", col_idx);
        index.write(&self.version_dir().join(&file))?;

        self.manifest.indices.retain(|idx| idx.column != column);
        self.manifest.indices.push(IndexMeta {
            column: column.to_string(),
            file,
        });
        self.manifest.write_atomic(&self.dir)?;

        info!(
            table = %self.name,
            column = %column,
            entries = index.len(),
            "built scalar index"
        );
        Ok(())
    }

    pub fn has_scalar_index(&self, column: &str) -> bool {
        self.manifest.index_for(column).is_some()
    }

    pub fn scalar_index(&self, column: &str) -> Result<ScalarIndex> {
        let meta = self
            .manifest
            .index_for(column)
            .ok_or_else(|| Error::IndexNotFound(column.to_string()))?;
        ScalarIndex::load(column, &self.version_dir().join(&meta.file))
    }

    /// Reclaim space right away: every version other than the current one,
    /// leftover temp files, and files the current manifest does not list.
    pub fn optimize(&self) -> Result<OptimizeStats> {
        let current = TableManifest::version_dir_name(self.manifest.version);
        let mut stats = OptimizeStats::default();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if path.is_dir() {
                if TableManifest::parse_version_dir(&name).is_some() && name != current {
                    fs::remove_dir_all(&path)?;
                    stats.removed_versions += 1;
                    debug!(table = %self.name, version = %name, "removed stale version");
                }
            } else if name != MANIFEST_FILE {
                fs::remove_file(&path)?;
                stats.removed_files += 1;
            }
        }

        let referenced: HashSet<&str> = self
            .manifest
            .fragments
            .iter()
            .map(|f| f.file.as_str())
            .chain(self.manifest.indices.iter().map(|i| i.file.as_str()))
            .collect();

        for entry in fs::read_dir(self.version_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if referenced.contains(name.as_str()) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            stats.removed_files += 1;
        }

        info!(
            table = %self.name,
            version = self.manifest.version,
            removed_versions = stats.removed_versions,
            removed_files = stats.removed_files,
            "optimized table"
        );
        Ok(stats)
    }
}
