//! JSON shapes returned to callers and the value rules behind them.
//!
//! Non-finite floats become `null`, binary values are base64 encoded,
//! temporal and decimal values are rendered as ISO-8601 / exact strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use datafusion::arrow::array::{Array, AsArray};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::facets::Facet;
use crate::query::SearchResult;
use crate::schema::{describe_schema, ColumnInfo};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub data: Vec<Map<String, Value>>,
    pub schema: Vec<ColumnInfo>,
    pub total_rows: u64,
    pub execution_time_ms: f64,
}

impl SearchResponse {
    pub fn from_result(result: &SearchResult) -> Result<Self> {
        let mut data = Vec::with_capacity(result.num_rows());
        for batch in &result.batches {
            data.extend(batch_to_rows(batch)?);
        }
        Ok(Self {
            data,
            schema: describe_schema(&result.schema),
            total_rows: result.total_rows,
            execution_time_ms: result.execution_time_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetResponse<'a> {
    pub facets: &'a [Facet],
}

/// Error body at the request boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error_type: String,
    pub message: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            status: err.status(),
            error_type: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Map<String, Value>>> {
    (0..batch.num_rows())
        .map(|row| row_to_json(batch, row))
        .collect()
}

pub fn row_to_json(batch: &RecordBatch, row: usize) -> Result<Map<String, Value>> {
    let schema = batch.schema();
    let mut object = Map::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        object.insert(field.name().clone(), value_at(column.as_ref(), row)?);
    }
    Ok(object)
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// One array slot as JSON
pub fn value_at(array: &dyn Array, row: usize) -> Result<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    let value = match array.data_type() {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => Value::from(array.as_primitive::<Int8Type>().value(row)),
        DataType::Int16 => Value::from(array.as_primitive::<Int16Type>().value(row)),
        DataType::Int32 => Value::from(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::from(array.as_primitive::<UInt8Type>().value(row)),
        DataType::UInt16 => Value::from(array.as_primitive::<UInt16Type>().value(row)),
        DataType::UInt32 => Value::from(array.as_primitive::<UInt32Type>().value(row)),
        DataType::UInt64 => Value::from(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 => float(array.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Float16 => {
            let widened = cast(&array.slice(row, 1), &DataType::Float64)?;
            float(widened.as_primitive::<Float64Type>().value(0))
        }
        DataType::Utf8 => Value::from(array.as_string::<i32>().value(row)),
        DataType::LargeUtf8 => Value::from(array.as_string::<i64>().value(row)),
        DataType::Utf8View => Value::from(array.as_string_view().value(row)),
        DataType::Binary => encode(array.as_binary::<i32>().value(row)),
        DataType::LargeBinary => encode(array.as_binary::<i64>().value(row)),
        DataType::BinaryView => encode(array.as_binary_view().value(row)),
        DataType::FixedSizeBinary(_) => encode(array.as_fixed_size_binary().value(row)),
        DataType::List(_) => list_value(array.as_list::<i32>().value(row).as_ref())?,
        DataType::LargeList(_) => list_value(array.as_list::<i64>().value(row).as_ref())?,
        DataType::FixedSizeList(..) => {
            list_value(array.as_fixed_size_list().value(row).as_ref())?
        }
        DataType::Struct(fields) => {
            let array = array.as_struct();
            let mut object = Map::with_capacity(fields.len());
            for (field, child) in fields.iter().zip(array.columns()) {
                object.insert(field.name().clone(), value_at(child.as_ref(), row)?);
            }
            Value::Object(object)
        }
        DataType::Dictionary(_, value_type) => {
            let decoded = cast(&array.slice(row, 1), value_type)?;
            value_at(decoded.as_ref(), 0)?
        }
        // Temporal, decimal, interval and anything else: Arrow's own
        // rendering, which is ISO-8601 for dates and timestamps
        _ => {
            let formatter = ArrayFormatter::try_new(array, &FormatOptions::default())?;
            Value::String(formatter.value(row).to_string())
        }
    };
    Ok(value)
}

fn encode(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

fn list_value(values: &dyn Array) -> Result<Value> {
    (0..values.len())
        .map(|i| value_at(values, i))
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{
        ArrayRef, BinaryArray, Date32Array, Decimal128Array, Float64Array, Int32Array,
        LargeBinaryArray, ListArray, StringArray, StructArray, TimestampMillisecondArray,
    };
    use datafusion::arrow::datatypes::{Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    fn single(array: ArrayRef) -> Value {
        value_at(array.as_ref(), 0).unwrap()
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        let array = Float64Array::from(vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.5]);
        assert_eq!(value_at(&array, 0).unwrap(), Value::Null);
        assert_eq!(value_at(&array, 1).unwrap(), Value::Null);
        assert_eq!(value_at(&array, 2).unwrap(), Value::Null);
        assert_eq!(value_at(&array, 3).unwrap(), json!(1.5));
    }

    #[test]
    fn test_binary_is_base64_and_round_trips() {
        let bytes: &[u8] = &[0, 159, 146, 150, 255];
        let value = single(Arc::new(BinaryArray::from(vec![bytes])));
        let Value::String(text) = &value else {
            panic!("expected string, got {:?}", value);
        };
        assert_eq!(STANDARD.decode(text).unwrap(), bytes);

        let large = single(Arc::new(LargeBinaryArray::from(vec![b"hi".as_ref()])));
        assert_eq!(large, json!("aGk="));
    }

    #[test]
    fn test_temporal_and_decimal_render_as_strings() {
        assert_eq!(single(Arc::new(Date32Array::from(vec![19723]))), json!("2024-01-01"));
        assert_eq!(
            single(Arc::new(TimestampMillisecondArray::from(vec![1_704_067_200_000]))),
            json!("2024-01-01T00:00:00")
        );

        let decimal = Decimal128Array::from(vec![12345])
            .with_precision_and_scale(10, 2)
            .unwrap();
        assert_eq!(single(Arc::new(decimal)), json!("123.45"));
    }

    #[test]
    fn test_nested_values() {
        let list = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![Some(vec![
            Some(1),
            None,
            Some(3),
        ])]);
        assert_eq!(single(Arc::new(list)), json!([1, null, 3]));

        let strukt = StructArray::from(vec![
            (
                Arc::new(Field::new("a", DataType::Int32, false)),
                Arc::new(Int32Array::from(vec![7])) as ArrayRef,
            ),
            (
                Arc::new(Field::new("b", DataType::Utf8, true)),
                Arc::new(StringArray::from(vec![Some("x")])) as ArrayRef,
            ),
        ]);
        assert_eq!(single(Arc::new(strukt)), json!({"a": 7, "b": "x"}));
    }

    #[test]
    fn test_row_to_json_and_nulls() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap();

        let rows = batch_to_rows(&batch).unwrap();
        assert_eq!(Value::Object(rows[0].clone()), json!({"id": 1, "name": "a"}));
        assert_eq!(Value::Object(rows[1].clone()), json!({"id": 2, "name": null}));
    }

    #[test]
    fn test_error_response() {
        let err = Error::InvalidFilter("between needs 2 values".into());
        let body = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(
            body,
            json!({
                "status": 400,
                "error_type": "InvalidFilter",
                "message": "Invalid filter: between needs 2 values"
            })
        );
    }
}
