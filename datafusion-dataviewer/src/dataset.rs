//! Dataset identity: location parsing, format detection, cache keys, and the
//! column/row selection applied during ingestion.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ColumnListKind, Error, Result};

const GLOB_CHARS: [char; 4] = ['*', '?', '[', ']'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    Csv,
    Jsonl,
    Parquet,
    /// Arrow IPC file, copied into the cache without streaming
    Columnar,
}

impl DatasetFormat {
    /// Stable name used when deriving cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetFormat::Csv => "csv",
            DatasetFormat::Jsonl => "jsonl",
            DatasetFormat::Parquet => "parquet",
            DatasetFormat::Columnar => "arrow",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "csv" | "tsv" => Some(DatasetFormat::Csv),
            "json" | "jsonl" => Some(DatasetFormat::Jsonl),
            "parquet" => Some(DatasetFormat::Parquet),
            "arrow" | "ipc" | "feather" => Some(DatasetFormat::Columnar),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `scheme://authority/path` and return the path part.
/// Plain filesystem paths come back unchanged.
pub fn location_path(location: &str) -> &str {
    match split_scheme(location) {
        Some((_, rest)) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        },
        None => location,
    }
}

/// URL scheme of the location, if it has one
pub fn location_scheme(location: &str) -> Option<&str> {
    split_scheme(location).map(|(scheme, _)| scheme)
}

fn split_scheme(location: &str) -> Option<(&str, &str)> {
    let idx = location.find("://")?;
    let scheme = &location[..idx];
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then(|| (scheme, &location[idx + 3..]))
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

/// Extension of a file name without the dot; dotfiles and trailing dots
/// have none
fn extension(name: &str) -> Option<&str> {
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(&name[idx + 1..])
}

pub fn has_glob(segment: &str) -> bool {
    segment.contains(GLOB_CHARS)
}

/// Human readable dataset name.
///
/// `s3://bucket/path/data.csv` gives `data`; a wildcard in the last segment
/// falls back to the directory, so `/path/to/*.parquet` gives `to`.
pub fn dataset_name(location: &str) -> String {
    let mut path = location_path(location);
    if has_glob(file_name(path)) {
        path = parent(path);
    }

    let name = file_name(path);
    match extension(name) {
        Some(ext) => name[..name.len() - ext.len() - 1].to_string(),
        None => name.to_string(),
    }
}

/// Format from the extension of the final path segment
pub fn infer_format(location: &str) -> Result<DatasetFormat> {
    extension(file_name(location_path(location)))
        .and_then(DatasetFormat::from_extension)
        .ok_or_else(|| Error::UnsupportedFormat(location.to_string()))
}

/// Deterministic cache table name for a dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hex MD5 of `"{name}_{format}"`
    pub fn new(name: &str, format: DatasetFormat) -> Self {
        let digest = Md5::digest(format!("{}_{}", name, format.as_str()).as_bytes());
        CacheKey(format!("{:x}", digest))
    }

    /// Wrap a key that was computed earlier, e.g. one read from config
    pub fn from_raw(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub location: String,
    pub format: DatasetFormat,
    pub name: String,
}

impl DatasetDescriptor {
    pub fn from_location(location: impl Into<String>) -> Result<Self> {
        let location = location.into();
        let format = infer_format(&location)?;
        let name = dataset_name(&location);
        Ok(Self {
            location,
            format,
            name,
        })
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.name, self.format)
    }

    /// Field delimiter for delimited text sources
    pub fn delimiter(&self) -> u8 {
        match extension(file_name(location_path(&self.location))) {
            Some("tsv") => b'\t',
            _ => b',',
        }
    }
}

/// Include/exclude column lists applied at ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnProjection {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
}

impl ColumnProjection {
    pub fn select(&self, all_columns: &[String]) -> Result<Vec<String>> {
        select_columns(
            all_columns,
            self.include.as_deref(),
            self.exclude.as_deref(),
        )
    }
}

/// Compute the projected column list.
///
/// `include` is applied before `exclude`; any name that is not available at
/// its step fails the whole call, listing every unknown name.
pub fn select_columns(
    all_columns: &[String],
    include: Option<&[String]>,
    exclude: Option<&[String]>,
) -> Result<Vec<String>> {
    let mut columns = match include {
        Some(include) => {
            let missing = missing_from(include, all_columns);
            if !missing.is_empty() {
                return Err(Error::InvalidColumns {
                    kind: ColumnListKind::Include,
                    names: missing,
                });
            }
            include.to_vec()
        }
        None => all_columns.to_vec(),
    };

    if let Some(exclude) = exclude {
        let missing = missing_from(exclude, &columns);
        if !missing.is_empty() {
            return Err(Error::InvalidColumns {
                kind: ColumnListKind::Exclude,
                names: missing,
            });
        }
        columns.retain(|c| !exclude.contains(c));
    }

    Ok(columns)
}

fn missing_from(requested: &[String], available: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|name| !available.contains(name))
        .cloned()
        .collect()
}

/// Which rows are materialized into the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowWindow {
    #[default]
    All,
    Limit(usize),
    /// `start..end`, end exclusive; an open end runs to the last row
    Range { start: usize, end: Option<usize> },
}

impl RowWindow {
    /// Build a window from the optional settings, rejecting a limit combined
    /// with a range
    pub fn from_options(
        limit: Option<usize>,
        row_start: Option<usize>,
        row_end: Option<usize>,
    ) -> Result<Self> {
        match (limit, row_start, row_end) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(Error::ConflictingWindow(
                "a row limit cannot be combined with row_start/row_end".to_string(),
            )),
            (Some(limit), None, None) => Ok(RowWindow::Limit(limit)),
            (None, None, None) => Ok(RowWindow::All),
            (None, start, end) => {
                let start = start.unwrap_or(0);
                if let Some(end) = end {
                    if start > end {
                        return Err(Error::ConflictingWindow(format!(
                            "row_start {} is after row_end {}",
                            start, end
                        )));
                    }
                }
                Ok(RowWindow::Range { start, end })
            }
        }
    }

    /// Rows to skip before the window starts
    pub fn skip(&self) -> usize {
        match self {
            RowWindow::Range { start, .. } => *start,
            _ => 0,
        }
    }

    /// Maximum rows inside the window, `None` when unbounded
    pub fn take(&self) -> Option<usize> {
        match self {
            RowWindow::All => None,
            RowWindow::Limit(limit) => Some(*limit),
            RowWindow::Range { start, end } => end.map(|end| end.saturating_sub(*start)),
        }
    }
}
