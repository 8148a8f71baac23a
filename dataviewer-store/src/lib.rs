//! Local table store backing the dataviewer cache.
//!
//! Every table lives in its own directory under the store root and is made of
//! versioned Arrow IPC fragments described by a JSON manifest. A write always
//! produces a new version; the manifest swap is the commit point, and
//! [`StoreTable::optimize`] reclaims everything the current version does not
//! reference.

pub mod error;
pub mod index;
pub mod lock;
pub mod manifest;
pub mod store;
pub mod table;
pub mod writer;

pub use error::{Error, Result};
pub use index::ScalarIndex;
pub use lock::TableLock;
pub use manifest::{FragmentMeta, IndexMeta, TableManifest};
pub use store::{CacheStore, WriteMode};
pub use table::{FragmentReader, OptimizeStats, StoreTable};
pub use writer::{FragmentWriter, TableWriter};
