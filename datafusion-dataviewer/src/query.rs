use datafusion::arrow::array::StringArray;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::dataframe::DataFrame;
use datafusion::prelude::{SessionConfig, SessionContext};
use dataviewer_store::{ScalarIndex, StoreTable};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::dataset::CacheKey;
use crate::error::{ColumnListKind, Error, Result};
use crate::filter::{translate, translate_filter, Filter, FilterOp, SearchRequest, Translation};
use crate::response::row_to_json;
use crate::schema::{describe_schema, ColumnInfo};
use crate::table::CacheTableProvider;

/// Name the cached table is registered under
pub const TABLE_NAME: &str = "dataset";

/// Fixed worker count for query execution
pub const DEFAULT_TARGET_PARTITIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub target_partitions: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            target_partitions: DEFAULT_TARGET_PARTITIONS,
        }
    }
}

/// Rows of one search plus the unpaginated match count
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub batches: Vec<RecordBatch>,
    pub schema: SchemaRef,
    pub total_rows: u64,
    pub execution_time_ms: f64,
}

impl SearchResult {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Read-only query access to one cached table through DataFusion
pub struct QueryEngine {
    ctx: SessionContext,
    /// Single-partition session for unsorted pages, which must follow table order
    ordered: SessionContext,
    key: CacheKey,
    table: Arc<StoreTable>,
    schema: SchemaRef,
    indices: HashMap<String, ScalarIndex>,
}

impl QueryEngine {
    /// Open the cached table `key` and register it as [`TABLE_NAME`]
    pub fn open<P: AsRef<Path>>(cache_path: P, key: &CacheKey, options: EngineOptions) -> Result<Self> {
        let provider = CacheTableProvider::open(cache_path, key.as_str())?;
        let table = provider.table().clone();
        let schema = table.schema();

        let mut indices = HashMap::new();
        for meta in &table.manifest().indices {
            indices.insert(meta.column.clone(), table.scalar_index(&meta.column)?);
        }

        let config = SessionConfig::new().with_target_partitions(options.target_partitions.max(1));
        let ctx = SessionContext::new_with_config(config);
        ctx.register_table(TABLE_NAME, Arc::new(provider))?;

        let ordered = SessionContext::new_with_config(SessionConfig::new().with_target_partitions(1));
        ordered.register_table(
            TABLE_NAME,
            Arc::new(CacheTableProvider::from_shared(table.clone()).with_preserved_order()),
        )?;

        debug!(
            key = %key,
            rows = table.num_rows(),
            fragments = table.num_fragments(),
            indices = indices.len(),
            "query engine ready"
        );

        Ok(Self {
            ctx,
            ordered,
            key: key.clone(),
            table,
            schema,
            indices,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn num_rows(&self) -> u64 {
        self.table.num_rows()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// The registered table as a fresh DataFrame
    pub async fn dataset(&self) -> Result<DataFrame> {
        Ok(self.ctx.table(TABLE_NAME).await?)
    }

    pub fn schema_description(&self) -> Vec<ColumnInfo> {
        describe_schema(&self.schema)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResult> {
        let started = Instant::now();

        let (df, total_rows) = match translate(request, &self.schema)? {
            Translation::Raw(sql) => {
                debug!(sql = %sql, "running raw query");
                (self.ctx.sql(&sql).await?, None)
            }
            Translation::Structured(plan) => {
                let mut df = if plan.sorts.is_empty() {
                    self.ordered.table(TABLE_NAME).await?
                } else {
                    self.dataset().await?
                };
                if let Some(predicate) = plan.predicate {
                    df = df.filter(predicate)?;
                }
                let total_rows = df.clone().count().await? as u64;
                if !plan.sorts.is_empty() {
                    df = df.sort(plan.sorts)?;
                }
                (df.limit(plan.offset, Some(plan.limit))?, Some(total_rows))
            }
        };

        let schema = df.schema().inner().clone();
        let batches = df.collect().await?;
        let returned: usize = batches.iter().map(|b| b.num_rows()).sum();

        Ok(SearchResult {
            batches,
            schema,
            total_rows: total_rows.unwrap_or(returned as u64),
            execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Fetch one row by identifier.
    ///
    /// Uses the scalar index on `id_column` when the table has one and falls
    /// back to a filtered scan otherwise.
    pub async fn get_row(&self, id_column: Option<&str>, id: &str) -> Result<Map<String, Value>> {
        let id_column = id_column.ok_or_else(|| Error::ConfigMissing("id_column".to_string()))?;
        if self.schema.index_of(id_column).is_err() {
            return Err(Error::InvalidColumns {
                kind: ColumnListKind::Id,
                names: vec![id_column.to_string()],
            });
        }

        let batch = match self.indices.get(id_column) {
            Some(index) => self.lookup_indexed(index, id)?,
            None => self.lookup_scan(id_column, id).await?,
        };

        match batch {
            Some(batch) => row_to_json(&batch, 0),
            None => Err(Error::NotFound(format!("no row with {} = {}", id_column, id))),
        }
    }

    fn lookup_indexed(&self, index: &ScalarIndex, id: &str) -> Result<Option<RecordBatch>> {
        let key = StringArray::from(vec![id]);
        let rows = index.lookup(&key)?;
        debug!(column = %index.column(), matches = rows.len(), "index lookup");
        match rows.first() {
            Some(&row) => Ok(Some(self.table.take_row(row)?)),
            None => Ok(None),
        }
    }

    async fn lookup_scan(&self, id_column: &str, id: &str) -> Result<Option<RecordBatch>> {
        let filter = Filter::new(id_column, FilterOp::Eq, id);
        let predicate = translate_filter(&filter, &self.schema, true)?;
        let batches = self
            .dataset()
            .await?
            .filter(predicate)?
            .limit(0, Some(1))?
            .collect()
            .await?;
        Ok(batches.into_iter().find(|b| b.num_rows() > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use dataviewer_store::{CacheStore, WriteMode};

    fn build_cache(dir: &Path, with_index: bool) -> CacheKey {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let store = CacheStore::connect(dir).unwrap();
        let mut writer = store
            .begin_write("k", schema.clone(), WriteMode::Create)
            .unwrap();
        let names: Vec<String> = (0..30).map(|i| format!("n{}", i)).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from_iter_values(100..130)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap();
        writer.write(&batch).unwrap();
        let mut table = writer.commit().unwrap();
        if with_index {
            table.create_scalar_index("id").unwrap();
        }
        CacheKey::from_raw("k")
    }

    #[tokio::test]
    async fn test_search_paginates_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let key = build_cache(dir.path(), false);
        let engine = QueryEngine::open(dir.path(), &key, EngineOptions::default()).unwrap();

        let request = SearchRequest {
            page: 1,
            page_size: 10,
            ..Default::default()
        };
        let result = engine.search(&request).await.unwrap();
        assert_eq!(result.total_rows, 30);
        assert_eq!(result.num_rows(), 10);
        assert!(result.execution_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_unsorted_pages_follow_fragment_order() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let store = CacheStore::connect(dir.path())
            .unwrap()
            .with_max_rows_per_fragment(7);
        let mut writer = store
            .begin_write("frag", schema.clone(), WriteMode::Create)
            .unwrap();
        for start in [0i64, 13, 22] {
            let end = (start + 13).min(30);
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(Int64Array::from_iter_values(start..end))],
            )
            .unwrap();
            writer.write(&batch).unwrap();
        }
        let table = writer.commit().unwrap();
        assert!(table.num_fragments() > 1);

        let engine = QueryEngine::open(
            dir.path(),
            &CacheKey::from_raw("frag"),
            EngineOptions::default(),
        )
        .unwrap();

        for page in 0..3 {
            let request = SearchRequest {
                page,
                page_size: 10,
                ..Default::default()
            };
            let result = engine.search(&request).await.unwrap();
            assert_eq!(result.total_rows, 30);

            let ids: Vec<i64> = result
                .batches
                .iter()
                .flat_map(|b| {
                    b.column(0)
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .unwrap()
                        .values()
                        .to_vec()
                })
                .collect();
            let first = page as i64 * 10;
            assert_eq!(ids, (first..first + 10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_raw_query_counts_returned_rows() {
        let dir = tempfile::tempdir().unwrap();
        let key = build_cache(dir.path(), false);
        let engine = QueryEngine::open(dir.path(), &key, EngineOptions::default()).unwrap();

        let request = SearchRequest {
            raw_query: Some("SELECT id FROM dataset WHERE id >= 125".to_string()),
            ..Default::default()
        };
        let result = engine.search(&request).await.unwrap();
        assert_eq!(result.total_rows, 5);
        assert_eq!(result.schema.fields().len(), 1);
    }

    #[tokio::test]
    async fn test_get_row_with_and_without_index() {
        for with_index in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let key = build_cache(dir.path(), with_index);
            let engine = QueryEngine::open(dir.path(), &key, EngineOptions::default()).unwrap();

            let row = engine.get_row(Some("id"), "117").await.unwrap();
            assert_eq!(row["name"], "n17");
            assert_eq!(row["id"], 117);

            assert!(matches!(
                engine.get_row(Some("id"), "999").await,
                Err(Error::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_get_row_requires_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let key = build_cache(dir.path(), false);
        let engine = QueryEngine::open(dir.path(), &key, EngineOptions::default()).unwrap();

        let err = engine.get_row(None, "1").await.unwrap_err();
        assert!(matches!(err, Error::ConfigMissing(ref c) if c == "id_column"));
        assert!(matches!(
            engine.get_row(Some("uuid"), "1").await,
            Err(Error::InvalidColumns { .. })
        ));
    }
}
