use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::Session;
use datafusion::datasource::TableProvider;
use datafusion::error::Result as DataFusionResult;
use datafusion::logical_expr::{Expr, TableType};
use datafusion::physical_plan::ExecutionPlan;
use dataviewer_store::{CacheStore, StoreTable};
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::exec::CacheExec;

/// TableProvider over one cached table (one partition per fragment)
#[derive(Debug)]
pub struct CacheTableProvider {
    table: Arc<StoreTable>,
    schema: SchemaRef,
    preserve_order: bool,
}

impl CacheTableProvider {
    pub fn new(table: StoreTable) -> Self {
        Self::from_shared(Arc::new(table))
    }

    pub fn from_shared(table: Arc<StoreTable>) -> Self {
        let schema = table.schema();
        Self {
            table,
            schema,
            preserve_order: false,
        }
    }

    /// Scan with a single partition so rows keep their table order
    pub fn with_preserved_order(mut self) -> Self {
        self.preserve_order = true;
        self
    }

    /// Open the table stored under `key` in the cache at `cache_path`
    pub fn open<P: AsRef<Path>>(cache_path: P, key: &str) -> Result<Self> {
        let store = CacheStore::connect(cache_path)?;
        Ok(Self::new(store.open_table(key)?))
    }

    pub fn table(&self) -> &Arc<StoreTable> {
        &self.table
    }

    pub fn num_fragments(&self) -> usize {
        self.table.num_fragments()
    }

    pub fn total_rows(&self) -> u64 {
        self.table.num_rows()
    }
}

#[async_trait]
impl TableProvider for CacheTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        let exec = CacheExec::try_new(self.table.clone(), projection.cloned(), limit)?;
        if self.preserve_order {
            return Ok(Arc::new(exec.into_single_partition()));
        }
        Ok(Arc::new(exec))
    }
}
