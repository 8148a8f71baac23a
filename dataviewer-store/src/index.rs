//! Sorted scalar index for point lookups on one column.
//!
//! The index holds `(value, row_id)` pairs ordered by value in Arrow's
//! row format, so a lookup is a binary search over comparable byte rows no
//! matter the column type. Nulls are not indexed.

use crate::error::{Error, Result};
use arrow::array::{new_empty_array, Array, ArrayRef, UInt32Array, UInt64Array};
use arrow::compute::{cast, concat, filter, is_not_null, take};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

const VALUE_FIELD: &str = "value";
const ROW_ID_FIELD: &str = "row_id";

pub struct ScalarIndex {
    column: String,
    values: ArrayRef,
    row_ids: UInt64Array,
    converter: RowConverter,
    rows: Rows,
}

impl fmt::Debug for ScalarIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarIndex")
            .field("column", &self.column)
            .field("value_type", self.values.data_type())
            .field("len", &self.values.len())
            .finish()
    }
}

impl ScalarIndex {
    /// Build an index from column chunks and the matching row id chunks
    pub fn build(
        column: &str,
        data_type: &DataType,
        values: &[ArrayRef],
        row_ids: &[ArrayRef],
    ) -> Result<Self> {
        let values = concat_or_empty(values, data_type)?;
        let row_ids = concat_or_empty(row_ids, &DataType::UInt64)?;

        if values.len() != row_ids.len() {
            return Err(Error::SchemaMismatch(format!(
                "index on {} has {} values but {} row ids",
                column,
                values.len(),
                row_ids.len()
            )));
        }

        let mask = is_not_null(values.as_ref())?;
        let values = filter(values.as_ref(), &mask)?;
        let row_ids = filter(row_ids.as_ref(), &mask)?;

        let converter = RowConverter::new(vec![SortField::new(data_type.clone())])?;
        let rows = converter.convert_columns(&[values.clone()])?;

        // Stable sort keeps equal keys in row id order
        let mut order: Vec<u32> = (0..rows.num_rows() as u32).collect();
        order.sort_by(|&a, &b| rows.row(a as usize).cmp(&rows.row(b as usize)));
        let order = UInt32Array::from(order);

        let values = take(values.as_ref(), &order, None)?;
        let row_ids = take(row_ids.as_ref(), &order, None)?;

        Self::from_sorted(column, values, row_ids)
    }

    fn from_sorted(column: &str, values: ArrayRef, row_ids: ArrayRef) -> Result<Self> {
        let row_ids = row_ids
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "row ids of index on {} are {}, expected UInt64",
                    column,
                    row_ids.data_type()
                ))
            })?
            .clone();

        let converter = RowConverter::new(vec![SortField::new(values.data_type().clone())])?;
        let rows = converter.convert_columns(&[values.clone()])?;

        Ok(Self {
            column: column.to_string(),
            values,
            row_ids,
            converter,
            rows,
        })
    }

    /// Persist the index as a two-column Arrow IPC file
    pub fn write(&self, path: &Path) -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new(VALUE_FIELD, self.values.data_type().clone(), false),
            Field::new(ROW_ID_FIELD, DataType::UInt64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![self.values.clone(), Arc::new(self.row_ids.clone())],
        )?;

        let file = File::create(path)?;
        let mut writer = FileWriter::try_new(BufWriter::new(file), &schema)?;
        writer.write(&batch)?;
        writer.finish()?;
        Ok(())
    }

    pub fn load(column: &str, path: &Path) -> Result<Self> {
        let reader = FileReader::try_new(BufReader::new(File::open(path)?), None)?;
        let schema = reader.schema();

        let mut values = Vec::new();
        let mut row_ids = Vec::new();
        for batch in reader {
            let batch = batch?;
            values.push(batch.column(0).clone());
            row_ids.push(batch.column(1).clone());
        }

        let value_type = schema.field(0).data_type().clone();
        let values = concat_or_empty(&values, &value_type)?;
        let row_ids = concat_or_empty(&row_ids, &DataType::UInt64)?;
        Self::from_sorted(column, values, row_ids)
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn value_type(&self) -> &DataType {
        self.values.data_type()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Row ids whose value equals the single element of `key`.
    ///
    /// The key is cast to the indexed type first; a key that does not cast
    /// (or is null) matches nothing.
    pub fn lookup(&self, key: &dyn Array) -> Result<Vec<u64>> {
        if key.len() != 1 {
            return Err(Error::SchemaMismatch(format!(
                "lookup key must hold exactly one value, got {}",
                key.len()
            )));
        }

        let key = cast(key, self.values.data_type())?;
        if key.is_null(0) {
            return Ok(Vec::new());
        }

        let key_rows = self.converter.convert_columns(&[key])?;
        let target = key_rows.row(0);

        let (mut lo, mut hi) = (0, self.rows.num_rows());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.rows.row(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut matches = Vec::new();
        let mut idx = lo;
        while idx < self.rows.num_rows() && self.rows.row(idx) == target {
            matches.push(self.row_ids.value(idx));
            idx += 1;
        }

        Ok(matches)
    }
}

fn concat_or_empty(chunks: &[ArrayRef], data_type: &DataType) -> Result<ArrayRef> {
    if chunks.is_empty() {
        return Ok(new_empty_array(data_type));
    }
    let refs: Vec<&dyn Array> = chunks.iter().map(|a| a.as_ref()).collect();
    Ok(concat(&refs)?)
}
