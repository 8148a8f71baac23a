use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Narrow wide and view encodings to their standard-width equivalents.
///
/// Recurses into list elements and struct children; every other type is
/// returned unchanged.
pub fn normalize_type(data_type: &DataType) -> DataType {
    match data_type {
        DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        DataType::LargeBinary | DataType::BinaryView => DataType::Binary,
        DataType::List(field) | DataType::LargeList(field) => {
            DataType::List(Arc::new(normalize_field(field)))
        }
        DataType::FixedSizeList(field, size) => {
            DataType::FixedSizeList(Arc::new(normalize_field(field)), *size)
        }
        DataType::Struct(fields) => {
            DataType::Struct(fields.iter().map(|f| normalize_field(f)).collect())
        }
        other => other.clone(),
    }
}

fn normalize_field(field: &Field) -> Field {
    field
        .clone()
        .with_data_type(normalize_type(field.data_type()))
}

pub fn normalize_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<Field> = schema.fields().iter().map(|f| normalize_field(f)).collect();
    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

/// Cast a batch to `target`, which must be the normalized form of the
/// batch's own schema
pub fn normalize_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema().fields() == target.fields() {
        return Ok(batch.clone());
    }

    let columns = batch
        .columns()
        .iter()
        .zip(target.fields().iter())
        .map(|(column, field)| {
            cast(column, field.data_type()).map_err(|e| {
                Error::SchemaCast(format!(
                    "column {} from {} to {}: {}",
                    field.name(),
                    column.data_type(),
                    field.data_type(),
                    e
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    RecordBatch::try_new_with_options(target.clone(), columns, &options)
        .map_err(|e| Error::SchemaCast(e.to_string()))
}

/// Create projected Arrow schema from column indices
pub fn create_projected_schema(schema: &Schema, projection: &[usize]) -> Result<SchemaRef> {
    Ok(Arc::new(schema.project(projection)?))
}

/// One column as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

pub fn describe_schema(schema: &Schema) -> Vec<ColumnInfo> {
    schema
        .fields()
        .iter()
        .map(|f| ColumnInfo {
            name: f.name().clone(),
            data_type: f.data_type().to_string(),
            nullable: f.is_nullable(),
        })
        .collect()
}
