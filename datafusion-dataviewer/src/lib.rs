// Browse large datasets through a local columnar cache and DataFusion

pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod exec;
pub mod facets;
pub mod filter;
pub mod indexer;
pub mod plugin;
pub mod query;
pub mod remote;
pub mod response;
pub mod schema;
pub mod stream;
pub mod table;

pub use config::ViewConfig;
pub use context::{StartOptions, ViewerContext};
pub use dataset::{
    dataset_name, infer_format, select_columns, CacheKey, ColumnProjection, DatasetDescriptor,
    DatasetFormat, RowWindow,
};
pub use error::{ColumnListKind, Error, Result};
pub use facets::{Facet, FacetComputer, FacetValue};
pub use filter::{Filter, FilterOp, SearchRequest, Sort, Translation};
pub use indexer::{CacheIndexer, IndexOptions};
pub use plugin::{ActivePlugin, PluginRegistry, RowVisualizer};
pub use query::{EngineOptions, QueryEngine, SearchResult, TABLE_NAME};
pub use remote::{RemoteLocation, StagedDataset};
pub use response::{ErrorResponse, FacetResponse, SearchResponse};
pub use stream::DatasetStream;
pub use table::CacheTableProvider;
