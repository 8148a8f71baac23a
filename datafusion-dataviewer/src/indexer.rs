use datafusion::arrow::datatypes::Schema;
use datafusion::arrow::ipc::reader::FileReader;
use dataviewer_store::{CacheStore, StoreTable, WriteMode};
use object_store::ObjectStore;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{default_cache_path, DEFAULT_BATCH_SIZE};
use crate::dataset::{CacheKey, ColumnProjection, DatasetDescriptor, DatasetFormat, RowWindow};
use crate::error::{ColumnListKind, Error, Result};
use crate::remote::{is_remote, stage_from_store, RemoteLocation};
use crate::stream::{resolve_sources, DatasetStream};

/// How long a second indexer waits for the lock on the same key
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub cache_path: PathBuf,
    pub window: RowWindow,
    pub projection: ColumnProjection,
    pub id_column: Option<String>,
    pub batch_size: usize,
    pub force_reindex: bool,
    pub show_progress: bool,
    pub lock_timeout: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            window: RowWindow::All,
            projection: ColumnProjection::default(),
            id_column: None,
            batch_size: DEFAULT_BATCH_SIZE,
            force_reindex: false,
            show_progress: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Materializes a dataset into the local cache store
pub struct CacheIndexer;

impl CacheIndexer {
    /// Make sure the cache holds `descriptor` and return its key.
    ///
    /// An existing table for the key is reused unless `force_reindex` is set.
    pub fn build(descriptor: &DatasetDescriptor, options: &IndexOptions) -> Result<CacheKey> {
        let key = descriptor.cache_key();
        let store = CacheStore::connect(&options.cache_path)?;

        if !options.force_reindex && store.table_exists(key.as_str()) {
            info!(key = %key, dataset = %descriptor.name, "cache hit, skipping indexing");
            return Ok(key);
        }

        let _lock = store.lock(key.as_str(), options.lock_timeout)?;

        // Another indexer may have finished while we waited
        if !options.force_reindex && store.table_exists(key.as_str()) {
            info!(key = %key, "cache filled by a concurrent indexer");
            return Ok(key);
        }

        info!(
            key = %key,
            location = %descriptor.location,
            format = %descriptor.format,
            "indexing dataset"
        );

        let mut table = match descriptor.format {
            DatasetFormat::Columnar => Self::copy_columnar(&store, descriptor, &key, options)?,
            _ => Self::ingest_stream(&store, descriptor, &key, options)?,
        };

        // A committed table without its index would be taken as a cache hit
        if let Err(e) = Self::finish(&mut table, options) {
            warn!(key = %key, error = %e, "indexing failed after commit, dropping table");
            store.drop_table(key.as_str())?;
            return Err(e);
        }

        info!(key = %key, rows = table.num_rows(), "dataset indexed");
        Ok(key)
    }

    /// [`CacheIndexer::build`] for async callers; object storage locations
    /// are staged under the cache directory first.
    pub async fn build_async(descriptor: DatasetDescriptor, options: IndexOptions) -> Result<CacheKey> {
        if !is_remote(&descriptor.location) {
            return run_blocking(move || Self::build(&descriptor, &options)).await;
        }

        let location = RemoteLocation::parse(&descriptor.location)?;
        let store = location.build_store()?;
        Self::build_remote(store.as_ref(), location.key(), descriptor, options).await
    }

    /// Index the object `key` (or glob) of `store` under the cache key of
    /// `descriptor`
    pub async fn build_remote(
        store: &dyn ObjectStore,
        key: &str,
        descriptor: DatasetDescriptor,
        options: IndexOptions,
    ) -> Result<CacheKey> {
        let cache_key = descriptor.cache_key();
        let cache = CacheStore::connect(&options.cache_path)?;
        if !options.force_reindex && cache.table_exists(cache_key.as_str()) {
            info!(key = %cache_key, dataset = %descriptor.name, "cache hit, skipping download");
            return Ok(cache_key);
        }

        let staged = stage_from_store(store, key, &options.cache_path).await?;
        // Same name and format, so the same cache key
        let local = DatasetDescriptor {
            location: staged.location(),
            ..descriptor
        };
        let built = run_blocking(move || Self::build(&local, &options)).await;
        drop(staged);
        built
    }

    fn finish(table: &mut StoreTable, options: &IndexOptions) -> Result<()> {
        if let Some(id_column) = &options.id_column {
            check_id_column(&table.schema(), id_column)?;
            table.create_scalar_index(id_column)?;
        }
        table.optimize()?;
        Ok(())
    }

    fn ingest_stream(
        store: &CacheStore,
        descriptor: &DatasetDescriptor,
        key: &CacheKey,
        options: &IndexOptions,
    ) -> Result<StoreTable> {
        let mut stream = DatasetStream::open(
            descriptor,
            options.window,
            &options.projection,
            options.batch_size,
            options.show_progress,
        )?;
        if let Some(id_column) = &options.id_column {
            check_id_column(&stream.schema(), id_column)?;
        }

        let mut writer = store.begin_write(key.as_str(), stream.schema(), WriteMode::Overwrite)?;
        for batch in stream.by_ref() {
            writer.write(&batch?)?;
        }
        info!(key = %key, rows = stream.rows_emitted(), "streamed dataset into cache");

        Ok(writer.commit()?)
    }

    /// Columnar sources are copied as-is: row window and column selection do
    /// not apply to them.
    fn copy_columnar(
        store: &CacheStore,
        descriptor: &DatasetDescriptor,
        key: &CacheKey,
        options: &IndexOptions,
    ) -> Result<StoreTable> {
        let sources = resolve_sources(&descriptor.location)?;
        let [source] = sources.as_slice() else {
            return Err(Error::UnsupportedLocation(format!(
                "{} matches {} columnar files, expected one",
                descriptor.location,
                sources.len()
            )));
        };

        if options.window != RowWindow::All || options.projection != ColumnProjection::default() {
            warn!(
                location = %descriptor.location,
                "row window and column selection are ignored for columnar sources"
            );
        }

        if let Some(id_column) = &options.id_column {
            let reader = FileReader::try_new(BufReader::new(File::open(source)?), None)?;
            check_id_column(&reader.schema(), id_column)?;
        }

        Ok(store.copy_ipc_file(key.as_str(), source, WriteMode::Overwrite)?)
    }
}

async fn run_blocking<F>(build: F) -> Result<CacheKey>
where
    F: FnOnce() -> Result<CacheKey> + Send + 'static,
{
    tokio::task::spawn_blocking(build)
        .await
        .map_err(|e| Error::Internal(format!("indexing task failed: {}", e)))?
}

fn check_id_column(schema: &Schema, id_column: &str) -> Result<()> {
    if schema.index_of(id_column).is_err() {
        return Err(Error::InvalidColumns {
            kind: ColumnListKind::Id,
            names: vec![id_column.to_string()],
        });
    }
    Ok(())
}
