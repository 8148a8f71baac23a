use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::error::{DataFusionError, Result as DataFusionResult};
use datafusion::execution::{RecordBatchStream, SendableRecordBatchStream, TaskContext};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
};
use dataviewer_store::{FragmentReader, StoreTable};
use futures::stream::Stream;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

use crate::schema::create_projected_schema;

/// Execution plan scanning a cached table.
///
/// By default every fragment is its own partition. A single-partition plan
/// reads the fragments one after another, so rows come out in table order.
#[derive(Debug)]
pub struct CacheExec {
    table: Arc<StoreTable>,
    schema: SchemaRef,
    projection: Option<Vec<usize>>,
    limit: Option<usize>,
    /// Fragment indices read by each partition
    partitions: Vec<Vec<usize>>,
    plan_properties: PlanProperties,
}

impl CacheExec {
    pub fn try_new(
        table: Arc<StoreTable>,
        projection: Option<Vec<usize>>,
        limit: Option<usize>,
    ) -> DataFusionResult<Self> {
        let projected_schema = match &projection {
            Some(proj) => create_projected_schema(table.schema().as_ref(), proj)
                .map_err(|e| DataFusionError::External(Box::new(e)))?,
            None => table.schema(),
        };

        let partitions: Vec<Vec<usize>> = (0..table.num_fragments()).map(|i| vec![i]).collect();
        let plan_properties = Self::compute_properties(projected_schema.clone(), partitions.len());

        Ok(Self {
            table,
            schema: projected_schema,
            projection,
            limit,
            partitions,
            plan_properties,
        })
    }

    /// Read every fragment, in order, from one partition
    pub fn into_single_partition(mut self) -> Self {
        self.partitions = vec![(0..self.table.num_fragments()).collect()];
        self.plan_properties = Self::compute_properties(self.schema.clone(), 1);
        self
    }

    fn compute_properties(schema: SchemaRef, partitions: usize) -> PlanProperties {
        PlanProperties::new(
            EquivalenceProperties::new(schema),
            Partitioning::UnknownPartitioning(partitions),
            EmissionType::Incremental,
            Boundedness::Bounded,
        )
    }
}

impl DisplayAs for CacheExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CacheExec: table={}, version={}, fragments={}, partitions={}",
            self.table.name(),
            self.table.version(),
            self.table.num_fragments(),
            self.partitions.len()
        )?;
        if let Some(limit) = self.limit {
            write!(f, ", limit={}", limit)?;
        }
        Ok(())
    }
}

impl ExecutionPlan for CacheExec {
    fn name(&self) -> &str {
        "CacheExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn properties(&self) -> &PlanProperties {
        &self.plan_properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DataFusionResult<SendableRecordBatchStream> {
        let fragments = self.partitions.get(partition).ok_or_else(|| {
            DataFusionError::Execution(format!(
                "Partition {} out of range (have {} partitions)",
                partition,
                self.partitions.len()
            ))
        })?;

        debug!(
            table = %self.table.name(),
            partition,
            fragments = fragments.len(),
            "scanning partition"
        );

        Ok(Box::pin(CacheStream {
            table: self.table.clone(),
            schema: self.schema.clone(),
            projection: self.projection.clone(),
            pending: fragments.iter().copied().collect(),
            current: None,
            remaining: self.limit,
        }))
    }
}

enum BatchSource {
    Fragment(FragmentReader),
    RowCounts(std::vec::IntoIter<u64>),
}

/// Stream of RecordBatches from a partition's fragments, read lazily
struct CacheStream {
    table: Arc<StoreTable>,
    schema: SchemaRef,
    projection: Option<Vec<usize>>,
    pending: VecDeque<usize>,
    current: Option<BatchSource>,
    remaining: Option<usize>,
}

impl CacheStream {
    fn open_fragment(&self, fragment: usize) -> DataFusionResult<BatchSource> {
        match &self.projection {
            // COUNT(*) style scans need row counts only, which the manifest has
            Some(proj) if proj.is_empty() => {
                let rows = self
                    .table
                    .manifest()
                    .fragments
                    .get(fragment)
                    .map(|f| f.batch_rows.clone())
                    .unwrap_or_default();
                Ok(BatchSource::RowCounts(rows.into_iter()))
            }
            _ => self
                .table
                .read_fragment(fragment, self.projection.clone())
                .map(BatchSource::Fragment)
                .map_err(|e| DataFusionError::External(Box::new(e))),
        }
    }

    fn next_batch(&mut self) -> Option<DataFusionResult<RecordBatch>> {
        loop {
            if self.current.is_none() {
                let fragment = self.pending.pop_front()?;
                match self.open_fragment(fragment) {
                    Ok(source) => self.current = Some(source),
                    Err(e) => return Some(Err(e)),
                }
            }

            let schema = self.schema.clone();
            let next = match self.current.as_mut() {
                Some(BatchSource::Fragment(reader)) => reader
                    .next()
                    .map(|batch| batch.map_err(|e| DataFusionError::ArrowError(e, None))),
                Some(BatchSource::RowCounts(counts)) => counts.next().map(|rows| {
                    let options = RecordBatchOptions::new().with_row_count(Some(rows as usize));
                    RecordBatch::try_new_with_options(schema, vec![], &options)
                        .map_err(|e| DataFusionError::ArrowError(e, None))
                }),
                None => None,
            };
            match next {
                Some(batch) => return Some(batch),
                None => self.current = None,
            }
        }
    }
}

impl Stream for CacheStream {
    type Item = DataFusionResult<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.remaining == Some(0) {
            return Poll::Ready(None);
        }

        let batch = match self.next_batch() {
            Some(Ok(batch)) => batch,
            other => return Poll::Ready(other),
        };

        let batch = match self.remaining.as_mut() {
            Some(remaining) => {
                let batch = batch.slice(0, batch.num_rows().min(*remaining));
                *remaining -= batch.num_rows();
                batch
            }
            None => batch,
        };
        Poll::Ready(Some(Ok(batch)))
    }
}

impl RecordBatchStream for CacheStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}
