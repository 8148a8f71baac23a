use datafusion::arrow::array::{Array, AsArray};
use datafusion::arrow::datatypes::Int64Type;
use datafusion::functions_aggregate::expr_fn::count;
use datafusion::prelude::{ident, lit};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{ColumnListKind, Error, Result};
use crate::query::QueryEngine;
use crate::response::value_at;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetValue {
    pub value: Value,
    pub count: u64,
}

/// Distinct values of one column with their row counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Facet {
    pub column: String,
    pub values: Vec<FacetValue>,
}

/// Computes facets once and hands out the same result afterwards
#[derive(Debug, Default)]
pub struct FacetComputer {
    cell: OnceCell<Arc<Vec<Facet>>>,
}

impl FacetComputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Facets for `columns`, computed on the first call only.
    ///
    /// Later calls return the memoized value even when `columns` or the
    /// underlying table changed. A failed computation is not memoized.
    pub async fn get_facets(
        &self,
        engine: &QueryEngine,
        columns: &[String],
    ) -> Result<Arc<Vec<Facet>>> {
        self.cell
            .get_or_try_init(|| async { compute_facets(engine, columns).await.map(Arc::new) })
            .await
            .cloned()
    }

    pub fn is_computed(&self) -> bool {
        self.cell.initialized()
    }
}

pub async fn compute_facets(engine: &QueryEngine, columns: &[String]) -> Result<Vec<Facet>> {
    let schema = engine.schema();
    let missing: Vec<String> = columns
        .iter()
        .filter(|c| schema.index_of(c).is_err())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Error::InvalidColumns {
            kind: ColumnListKind::Facet,
            names: missing,
        });
    }

    let mut facets = Vec::with_capacity(columns.len());
    for column in columns {
        facets.push(facet_for(engine, column).await?);
    }
    Ok(facets)
}

async fn facet_for(engine: &QueryEngine, column: &str) -> Result<Facet> {
    let batches = engine
        .dataset()
        .await?
        .aggregate(vec![ident(column)], vec![count(lit(1)).alias("count")])?
        .collect()
        .await?;

    let mut values = Vec::new();
    for batch in &batches {
        let counts = batch.column(1).as_primitive::<Int64Type>();
        for row in 0..batch.num_rows() {
            values.push(FacetValue {
                value: value_at(batch.column(0).as_ref(), row)?,
                count: if counts.is_null(row) { 0 } else { counts.value(row).max(0) as u64 },
            });
        }
    }
    values.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| compare_text(&a.value, &b.value))
    });

    debug!(column = %column, distinct = values.len(), "computed facet");
    Ok(Facet {
        column: column.to_string(),
        values,
    })
}

fn compare_text(a: &Value, b: &Value) -> Ordering {
    fn text(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    text(a).cmp(&text(b))
}
