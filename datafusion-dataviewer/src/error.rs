use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use datafusion::parquet::errors::ParquetError;
use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

/// Which column list named the offending columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnListKind {
    Include,
    Exclude,
    Id,
    Facet,
}

impl fmt::Display for ColumnListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnListKind::Include => write!(f, "Included"),
            ColumnListKind::Exclude => write!(f, "Excluded"),
            ColumnListKind::Id => write!(f, "Id"),
            ColumnListKind::Facet => write!(f, "Facet"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported dataset format for path: {0}")]
    UnsupportedFormat(String),

    #[error("Unsupported dataset location: {0}")]
    UnsupportedLocation(String),

    #[error("{kind} columns not found in dataset: {}", .names.join(", "))]
    InvalidColumns {
        kind: ColumnListKind,
        names: Vec<String>,
    },

    #[error("Conflicting row window: {0}")]
    ConflictingWindow(String),

    #[error("Schema cast error: {0}")]
    SchemaCast(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing configuration: {0} is not configured")]
    ConfigMissing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache store error: {0}")]
    Store(#[from] dataviewer_store::Error),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Error class name reported to callers; engine errors keep their own
    /// class so failures stay diagnosable
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedFormat(_) => "UnsupportedFormat",
            Error::UnsupportedLocation(_) => "UnsupportedLocation",
            Error::InvalidColumns { .. } => "InvalidColumns",
            Error::ConflictingWindow(_) => "ConflictingWindow",
            Error::SchemaCast(_) => "SchemaCastError",
            Error::InvalidFilter(_) => "InvalidFilter",
            Error::NotFound(_) => "NotFound",
            Error::ConfigMissing(_) => "ConfigMissing",
            Error::Config(_) => "ConfigError",
            Error::Store(_) => "StoreError",
            Error::DataFusion(e) => match e.find_root() {
                DataFusionError::Plan(_) => "PlanError",
                DataFusionError::SQL(..) => "SqlError",
                DataFusionError::SchemaError(..) => "SchemaError",
                DataFusionError::NotImplemented(_) => "NotImplemented",
                DataFusionError::Execution(_) => "ExecutionError",
                _ => "DataFusionError",
            },
            Error::Arrow(_) => "ArrowError",
            Error::Parquet(_) => "ParquetError",
            Error::Json(_) => "JsonError",
            Error::Io(_) => "IoError",
            Error::ObjectStore(_) => "ObjectStoreError",
            Error::Internal(_) => "InternalError",
        }
    }

    /// HTTP-style status for the request boundary
    pub fn status(&self) -> u16 {
        match self {
            Error::UnsupportedFormat(_)
            | Error::UnsupportedLocation(_)
            | Error::InvalidColumns { .. }
            | Error::ConflictingWindow(_)
            | Error::InvalidFilter(_)
            | Error::ConfigMissing(_)
            | Error::Config(_) => 400,
            Error::NotFound(_) | Error::ObjectStore(object_store::Error::NotFound { .. }) => 404,
            // A raw query that does not plan is the caller's mistake
            Error::DataFusion(e) => match e.find_root() {
                DataFusionError::Plan(_)
                | DataFusionError::SQL(..)
                | DataFusionError::SchemaError(..) => 400,
                _ => 500,
            },
            _ => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_columns_lists_every_name() {
        let err = Error::InvalidColumns {
            kind: ColumnListKind::Include,
            names: vec!["missing".to_string(), "other".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Included columns not found in dataset: missing, other"
        );
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NotFound("row 7".into()).status(), 404);
        assert_eq!(Error::ConfigMissing("id_column".into()).status(), 400);
        assert_eq!(Error::SchemaCast("bad".into()).status(), 500);
        assert!(Error::InvalidFilter("x".into()).is_client_error());
        assert!(!Error::Internal("x".into()).is_client_error());
    }

    #[test]
    fn test_engine_errors_keep_their_class() {
        let plan = Error::DataFusion(DataFusionError::Plan("no such table".into()));
        assert_eq!(plan.kind(), "PlanError");
        assert_eq!(plan.status(), 400);

        let exec = Error::DataFusion(DataFusionError::Execution("boom".into()));
        assert_eq!(exec.kind(), "ExecutionError");
        assert_eq!(exec.status(), 500);
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let err = Error::ObjectStore(object_store::Error::NotFound {
            path: "data/x.csv".into(),
            source: "gone".into(),
        });
        assert_eq!(err.kind(), "ObjectStoreError");
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_unsupported_format_message() {
        let err = Error::UnsupportedFormat("/data/file.xyz".into());
        assert_eq!(
            err.to_string(),
            "Unsupported dataset format for path: /data/file.xyz"
        );
    }
}
