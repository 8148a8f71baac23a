use crate::error::{Error, Result};
use crate::lock::TableLock;
use crate::manifest::{FragmentMeta, TableManifest, MANIFEST_FILE};
use crate::table::StoreTable;
use crate::writer::{TableWriter, MAX_ROWS_PER_FRAGMENT};
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::FileReader;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail if the table already exists
    Create,
    /// Replace the table with a new version
    Overwrite,
}

/// A directory of tables, one sub-directory per table name
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    max_rows_per_fragment: usize,
}

impl CacheStore {
    /// Open the store at `root`, creating the directory if needed
    pub fn connect<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "connected to cache store");

        Ok(Self {
            root,
            max_rows_per_fragment: MAX_ROWS_PER_FRAGMENT,
        })
    }

    pub fn with_max_rows_per_fragment(mut self, max_rows: usize) -> Self {
        self.max_rows_per_fragment = max_rows.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.ends_with(LOCK_SUFFIX);
        if !valid {
            return Err(Error::Manifest(format!("Invalid table name: {:?}", name)));
        }
        Ok(self.root.join(name))
    }

    /// Names of all committed tables, sorted
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(MANIFEST_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.table_dir(name)
            .map(|dir| dir.join(MANIFEST_FILE).is_file())
            .unwrap_or(false)
    }

    pub fn open_table(&self, name: &str) -> Result<StoreTable> {
        StoreTable::open(&self.table_dir(name)?, name)
    }

    /// Start writing a new version of `name`
    pub fn begin_write(
        &self,
        name: &str,
        schema: SchemaRef,
        mode: WriteMode,
    ) -> Result<TableWriter> {
        let table_dir = self.prepare_table_dir(name, mode)?;
        let version = next_version(&table_dir)?;
        debug!(table = %name, version, "starting table write");

        TableWriter::new(
            name,
            table_dir,
            version,
            schema,
            self.max_rows_per_fragment,
        )
    }

    /// Copy an Arrow IPC file verbatim into a new version of `name`
    pub fn copy_ipc_file(&self, name: &str, source: &Path, mode: WriteMode) -> Result<StoreTable> {
        let table_dir = self.prepare_table_dir(name, mode)?;
        let version = next_version(&table_dir)?;
        let version_dir = table_dir.join(TableManifest::version_dir_name(version));
        fs::create_dir_all(&version_dir)?;

        let file_name = "part-0.arrow".to_string();
        let target = version_dir.join(&file_name);
        fs::copy(source, &target)?;

        // Record per-batch row counts so point reads can seek straight to a batch
        let reader = FileReader::try_new(BufReader::new(File::open(&target)?), None)?;
        let mut batch_rows = Vec::with_capacity(reader.num_batches());
        for batch in reader {
            batch_rows.push(batch?.num_rows() as u64);
        }

        let fragment = FragmentMeta {
            file: file_name,
            num_rows: batch_rows.iter().sum(),
            batch_rows,
        };
        let manifest = TableManifest::new(version, vec![fragment]);
        manifest.write_atomic(&table_dir)?;

        info!(
            table = %name,
            version,
            rows = manifest.num_rows(),
            source = %source.display(),
            "copied ipc file into store"
        );
        StoreTable::open(&table_dir, name)
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table_dir = self.table_dir(name)?;
        if !table_dir.exists() {
            return Err(Error::TableNotFound(name.to_string()));
        }
        fs::remove_dir_all(&table_dir)?;
        info!(table = %name, "dropped table");
        Ok(())
    }

    /// Take the exclusive lock for `name`, waiting up to `timeout`
    pub fn lock(&self, name: &str, timeout: Duration) -> Result<TableLock> {
        // Validate the name before touching the filesystem
        self.table_dir(name)?;
        let path = self.root.join(format!("{}{}", name, LOCK_SUFFIX));
        TableLock::acquire(&path, name, timeout)
    }

    fn prepare_table_dir(&self, name: &str, mode: WriteMode) -> Result<PathBuf> {
        let table_dir = self.table_dir(name)?;
        if mode == WriteMode::Create && table_dir.join(MANIFEST_FILE).is_file() {
            return Err(Error::TableExists(name.to_string()));
        }
        fs::create_dir_all(&table_dir)?;
        Ok(table_dir)
    }
}

/// One past the highest version seen on disk, committed or not
fn next_version(table_dir: &Path) -> Result<u64> {
    let mut highest = 0;
    for entry in fs::read_dir(table_dir)? {
        let entry = entry?;
        if let Some(version) = TableManifest::parse_version_dir(&entry.file_name().to_string_lossy()) {
            highest = highest.max(version);
        }
    }
    Ok(highest + 1)
}
