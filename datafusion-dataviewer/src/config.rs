use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::{ColumnProjection, DatasetDescriptor, RowWindow};
use crate::error::{Error, Result};
use crate::indexer::{IndexOptions, DEFAULT_LOCK_TIMEOUT};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_PORT: u16 = 8000;

/// `$HOME/.cache/dataviewer`, or a relative `.cache/dataviewer` when no home
/// directory is known
pub fn default_cache_path() -> PathBuf {
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(".cache").join("dataviewer"),
        None => PathBuf::from(".cache").join("dataviewer"),
    }
}

/// Viewer settings, loaded from a JSON file and/or command line flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Dataset location (local path, `file://` URL, or glob)
    pub dataset_path: Option<String>,

    // Column selection
    pub exclude_columns: Option<Vec<String>>,
    pub include_columns: Option<Vec<String>>,
    /// Hidden by default in the UI
    pub hidden_columns: Option<Vec<String>>,
    /// Columns that get precomputed facets
    pub facet_columns: Option<Vec<String>>,

    // Special columns
    pub id_column: Option<String>,
    pub image_columns: Option<Vec<String>>,
    pub embed_image_columns: Option<Vec<String>>,
    pub embed_text_columns: Option<Vec<String>>,

    // Row window
    pub row_start: Option<usize>,
    pub row_end: Option<usize>,
    pub limit: Option<usize>,

    pub port: Option<u16>,
    pub cache_path: Option<PathBuf>,
    /// Cache key of an already indexed dataset; skips indexing when set
    pub table_hash: Option<String>,
    pub batch_size: Option<usize>,

    /// Row visualizer plugin id
    pub plugin: Option<String>,
    pub reload_plugin: bool,
}

impl ViewConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win
    pub fn merge(self, overrides: ViewConfig) -> ViewConfig {
        ViewConfig {
            dataset_path: overrides.dataset_path.or(self.dataset_path),
            exclude_columns: overrides.exclude_columns.or(self.exclude_columns),
            include_columns: overrides.include_columns.or(self.include_columns),
            hidden_columns: overrides.hidden_columns.or(self.hidden_columns),
            facet_columns: overrides.facet_columns.or(self.facet_columns),
            id_column: overrides.id_column.or(self.id_column),
            image_columns: overrides.image_columns.or(self.image_columns),
            embed_image_columns: overrides.embed_image_columns.or(self.embed_image_columns),
            embed_text_columns: overrides.embed_text_columns.or(self.embed_text_columns),
            row_start: overrides.row_start.or(self.row_start),
            row_end: overrides.row_end.or(self.row_end),
            limit: overrides.limit.or(self.limit),
            port: overrides.port.or(self.port),
            cache_path: overrides.cache_path.or(self.cache_path),
            table_hash: overrides.table_hash.or(self.table_hash),
            batch_size: overrides.batch_size.or(self.batch_size),
            plugin: overrides.plugin.or(self.plugin),
            reload_plugin: overrides.reload_plugin || self.reload_plugin,
        }
    }

    /// The configuration written by `generate-config`
    pub fn example() -> Self {
        let names = |cols: &[&str]| -> Option<Vec<String>> {
            Some(cols.iter().map(|c| c.to_string()).collect())
        };
        ViewConfig {
            dataset_path: Some("data.csv".to_string()),
            exclude_columns: names(&["column1", "column2"]),
            include_columns: names(&["column3", "column4"]),
            hidden_columns: names(&["column5"]),
            facet_columns: names(&["column6"]),
            row_start: Some(0),
            row_end: Some(100),
            port: Some(DEFAULT_PORT),
            ..Default::default()
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(default_cache_path)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn facet_columns(&self) -> &[String] {
        self.facet_columns.as_deref().unwrap_or(&[])
    }

    pub fn descriptor(&self) -> Result<DatasetDescriptor> {
        let location = self
            .dataset_path
            .as_deref()
            .ok_or_else(|| Error::ConfigMissing("dataset_path".to_string()))?;
        DatasetDescriptor::from_location(location)
    }

    pub fn window(&self) -> Result<RowWindow> {
        RowWindow::from_options(self.limit, self.row_start, self.row_end)
    }

    pub fn projection(&self) -> ColumnProjection {
        ColumnProjection {
            include: self.include_columns.clone(),
            exclude: self.exclude_columns.clone(),
        }
    }

    pub fn index_options(&self, force_reindex: bool, show_progress: bool) -> Result<IndexOptions> {
        let batch_size = self.batch_size();
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        Ok(IndexOptions {
            cache_path: self.cache_path(),
            window: self.window()?,
            projection: self.projection(),
            id_column: self.id_column.clone(),
            batch_size,
            force_reindex,
            show_progress,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }
}
