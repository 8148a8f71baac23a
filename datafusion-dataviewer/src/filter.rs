//! Structured search requests and their translation into DataFusion
//! expressions.

use datafusion::arrow::datatypes::{DataType, Schema};
use datafusion::logical_expr::{Expr, SortExpr};
use datafusion::prelude::{ident, lit};
use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "between")]
    Between,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Eq => "==",
            FilterOp::NotEq => "!=",
            FilterOp::GtEq => ">=",
            FilterOp::LtEq => "<=",
            FilterOp::In => "in",
            FilterOp::NotIn => "not_in",
            FilterOp::Between => "between",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOp,
    pub value: Value,
    /// `value` names other column(s) instead of holding literals
    #[serde(default, alias = "isColumnReference")]
    pub is_column_reference: bool,
}

impl Filter {
    pub fn new(column: impl Into<String>, operator: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
            is_column_reference: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size", alias = "pageSize")]
    pub page_size: usize,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sorts: Vec<Sort>,
    #[serde(default, alias = "rawQuery")]
    pub raw_query: Option<String>,
    #[serde(default = "default_coerce_types", alias = "coerceTypes")]
    pub coerce_types: bool,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_coerce_types() -> bool {
    true
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            filters: Vec::new(),
            sorts: Vec::new(),
            raw_query: None,
            coerce_types: true,
        }
    }
}

/// A structured request lowered to expressions over the `dataset` table
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub predicate: Option<Expr>,
    pub sorts: Vec<SortExpr>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Structured(QueryPlan),
    /// Executed verbatim; pagination and filters do not apply
    Raw(String),
}

pub fn translate(request: &SearchRequest, schema: &Schema) -> Result<Translation> {
    if let Some(raw) = &request.raw_query {
        return Ok(Translation::Raw(raw.clone()));
    }

    if request.page_size == 0 {
        return Err(Error::InvalidFilter("page_size must be positive".to_string()));
    }
    let offset = request
        .page
        .checked_mul(request.page_size)
        .ok_or_else(|| Error::InvalidFilter(format!("page {} is out of range", request.page)))?;

    let predicate = request
        .filters
        .iter()
        .map(|f| translate_filter(f, schema, request.coerce_types))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .reduce(Expr::and);

    let sorts = request
        .sorts
        .iter()
        .map(|s| {
            require_column(schema, &s.column)?;
            Ok(ident(&s.column).sort(!s.descending, false))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Translation::Structured(QueryPlan {
        predicate,
        sorts,
        offset,
        limit: request.page_size,
    }))
}

pub fn translate_filter(filter: &Filter, schema: &Schema, coerce_types: bool) -> Result<Expr> {
    let target = require_column(schema, &filter.column)?;
    let column = ident(&filter.column);
    let resolve = |value: &Value| resolve_operand(value, filter, target, schema, coerce_types);

    let scalar = || match &filter.value {
        Value::Array(_) => Err(Error::InvalidFilter(format!(
            "operator {} on {} takes a single value, got a list",
            filter.operator, filter.column
        ))),
        value => resolve(value),
    };
    let list = || match &filter.value {
        Value::Array(items) => items.iter().map(resolve).collect::<Result<Vec<_>>>(),
        _ => Err(Error::InvalidFilter(format!(
            "operator {} on {} takes a list value",
            filter.operator, filter.column
        ))),
    };

    let expr = match filter.operator {
        FilterOp::Gt => column.gt(scalar()?),
        FilterOp::Lt => column.lt(scalar()?),
        FilterOp::Eq => column.eq(scalar()?),
        FilterOp::NotEq => column.not_eq(scalar()?),
        FilterOp::GtEq => column.gt_eq(scalar()?),
        FilterOp::LtEq => column.lt_eq(scalar()?),
        FilterOp::In => column.in_list(list()?, false),
        FilterOp::NotIn => column.in_list(list()?, true),
        FilterOp::Between => {
            let bounds = list()?;
            let [low, high]: [Expr; 2] = bounds.try_into().map_err(|b: Vec<Expr>| {
                Error::InvalidFilter(format!(
                    "between on {} needs exactly 2 values, got {}",
                    filter.column,
                    b.len()
                ))
            })?;
            column.between(low, high)
        }
    };
    Ok(expr)
}

fn require_column<'a>(schema: &'a Schema, name: &str) -> Result<&'a DataType> {
    schema
        .field_with_name(name)
        .map(|f| f.data_type())
        .map_err(|_| Error::InvalidFilter(format!("unknown column: {}", name)))
}

fn resolve_operand(
    value: &Value,
    filter: &Filter,
    target: &DataType,
    schema: &Schema,
    coerce_types: bool,
) -> Result<Expr> {
    if filter.is_column_reference {
        let Value::String(name) = value else {
            return Err(Error::InvalidFilter(format!(
                "column reference in filter on {} must be a column name",
                filter.column
            )));
        };
        require_column(schema, name)?;
        return Ok(ident(name));
    }

    match value {
        Value::Null => Ok(lit(ScalarValue::try_from(target)?)),
        Value::Array(_) | Value::Object(_) => Err(Error::InvalidFilter(format!(
            "nested value in filter on {}",
            filter.column
        ))),
        _ if coerce_types => coerce_literal(&literal_text(value), target, &filter.column),
        Value::Bool(b) => Ok(lit(*b)),
        Value::Number(n) => Ok(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => lit(i),
            (None, Some(u), _) => lit(u),
            (None, None, Some(f)) => lit(f),
            _ => lit(n.to_string()),
        }),
        Value::String(s) => Ok(lit(s.as_str())),
    }
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse `text` according to the column type the literal is compared with
fn coerce_literal(text: &str, target: &DataType, column: &str) -> Result<Expr> {
    let invalid = |kind: &str| {
        Error::InvalidFilter(format!(
            "cannot coerce {:?} to {} for column {}",
            text, kind, column
        ))
    };

    match target {
        DataType::Boolean => Ok(lit(matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ))),
        t if t.is_integer() => text
            .trim()
            .parse::<i64>()
            .map(lit)
            .map_err(|_| invalid("integer")),
        t if t.is_floating() || matches!(t, DataType::Decimal128(..) | DataType::Decimal256(..)) => {
            text.trim()
                .parse::<f64>()
                .map(lit)
                .map_err(|_| invalid("float"))
        }
        _ => Ok(lit(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::datatypes::Field;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("age", DataType::Int32, true),
            Field::new("score", DataType::Float64, true),
            Field::new("active", DataType::Boolean, true),
            Field::new("name", DataType::Utf8, true),
            Field::new("min_age", DataType::Int32, true),
        ])
    }

    fn request(value: serde_json::Value) -> SearchRequest {
        serde_json::from_value(value).unwrap()
    }

    fn structured(request: &SearchRequest) -> QueryPlan {
        match translate(request, &schema()).unwrap() {
            Translation::Structured(plan) => plan,
            Translation::Raw(q) => panic!("unexpected raw query {}", q),
        }
    }

    #[test]
    fn test_request_defaults() {
        let req = request(json!({}));
        assert_eq!(req, SearchRequest::default());
        assert_eq!(req.page_size, 50);
        assert!(req.coerce_types);

        let req = request(json!({"pageSize": 10, "rawQuery": null, "extra": 1}));
        assert_eq!(req.page_size, 10);
    }

    #[test]
    fn test_operator_spellings() {
        let ops: Vec<FilterOp> =
            serde_json::from_value(json!([">", "<", "==", "=", "!=", ">=", "<=", "in", "not_in", "between"]))
                .unwrap();
        assert_eq!(ops[2], FilterOp::Eq);
        assert_eq!(ops[3], FilterOp::Eq);
        assert_eq!(ops[9], FilterOp::Between);
        assert!(serde_json::from_value::<FilterOp>(json!("like")).is_err());
        assert_eq!(serde_json::to_value(FilterOp::NotIn).unwrap(), json!("not_in"));
    }

    #[test]
    fn test_comparison_is_coerced() {
        let req = request(json!({
            "filters": [{"column": "age", "operator": ">=", "value": "21"}]
        }));
        let plan = structured(&req);
        assert_eq!(plan.predicate, Some(ident("age").gt_eq(lit(21i64))));
        assert_eq!((plan.offset, plan.limit), (0, 50));
    }

    #[test]
    fn test_boolean_coercion() {
        for (text, expected) in [
            ("TRUE", true),
            ("1", true),
            ("yes", true),
            (" true ", true),
            ("1\n", true),
            ("no", false),
            ("0", false),
        ] {
            let filter = Filter::new("active", FilterOp::Eq, text);
            let expr = translate_filter(&filter, &schema(), true).unwrap();
            assert_eq!(expr, ident("active").eq(lit(expected)), "text {}", text);
        }
    }

    #[test]
    fn test_float_and_text_coercion() {
        let filter = Filter::new("score", FilterOp::Lt, "2.5");
        assert_eq!(
            translate_filter(&filter, &schema(), true).unwrap(),
            ident("score").lt(lit(2.5f64))
        );

        let filter = Filter::new("name", FilterOp::Eq, 42);
        assert_eq!(
            translate_filter(&filter, &schema(), true).unwrap(),
            ident("name").eq(lit("42"))
        );
    }

    #[test]
    fn test_unparseable_number_is_invalid() {
        let filter = Filter::new("age", FilterOp::Gt, "twenty");
        assert!(matches!(
            translate_filter(&filter, &schema(), true),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_without_coercion_json_types_are_kept() {
        let filter = Filter::new("name", FilterOp::Eq, 42);
        assert_eq!(
            translate_filter(&filter, &schema(), false).unwrap(),
            ident("name").eq(lit(42i64))
        );
    }

    #[test]
    fn test_between_is_inclusive_range() {
        let filter = Filter::new("age", FilterOp::Between, json!([10, 20]));
        assert_eq!(
            translate_filter(&filter, &schema(), true).unwrap(),
            ident("age").between(lit(10i64), lit(20i64))
        );
    }

    #[test]
    fn test_between_needs_two_values() {
        let filter = Filter::new("age", FilterOp::Between, json!([1, 2, 3]));
        let err = translate_filter(&filter, &schema(), true).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_arity_mismatch() {
        let list_for_scalar = Filter::new("age", FilterOp::Gt, json!([1, 2]));
        assert!(translate_filter(&list_for_scalar, &schema(), true).is_err());

        let scalar_for_list = Filter::new("age", FilterOp::In, 3);
        assert!(translate_filter(&scalar_for_list, &schema(), true).is_err());
    }

    #[test]
    fn test_in_and_not_in() {
        let filter = Filter::new("name", FilterOp::In, json!(["a", "b"]));
        assert_eq!(
            translate_filter(&filter, &schema(), true).unwrap(),
            ident("name").in_list(vec![lit("a"), lit("b")], false)
        );

        let filter = Filter::new("id", FilterOp::NotIn, json!([1]));
        assert_eq!(
            translate_filter(&filter, &schema(), true).unwrap(),
            ident("id").in_list(vec![lit(1i64)], true)
        );
    }

    #[test]
    fn test_column_reference() {
        let mut filter = Filter::new("age", FilterOp::GtEq, "min_age");
        filter.is_column_reference = true;
        assert_eq!(
            translate_filter(&filter, &schema(), true).unwrap(),
            ident("age").gt_eq(ident("min_age"))
        );

        filter.value = json!("nope");
        assert!(translate_filter(&filter, &schema(), true).is_err());
    }

    #[test]
    fn test_unknown_filter_column() {
        let filter = Filter::new("missing", FilterOp::Eq, 1);
        assert!(matches!(
            translate_filter(&filter, &schema(), true),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_filters_combine_with_and_and_sorts_keep_order() {
        let req = request(json!({
            "page": 2,
            "page_size": 10,
            "filters": [
                {"column": "age", "operator": ">", "value": 1},
                {"column": "name", "operator": "!=", "value": "x"}
            ],
            "sorts": [
                {"column": "score", "descending": true},
                {"column": "id"}
            ]
        }));
        let plan = structured(&req);
        assert_eq!(
            plan.predicate,
            Some(ident("age").gt(lit(1i64)).and(ident("name").not_eq(lit("x"))))
        );
        assert_eq!(
            plan.sorts,
            vec![ident("score").sort(false, false), ident("id").sort(true, false)]
        );
        assert_eq!((plan.offset, plan.limit), (20, 10));
    }

    #[test]
    fn test_zero_page_size() {
        let req = SearchRequest {
            page_size: 0,
            ..Default::default()
        };
        assert!(matches!(translate(&req, &schema()), Err(Error::InvalidFilter(_))));
    }

    #[test]
    fn test_raw_query_replaces_structured_path() {
        let req = SearchRequest {
            page_size: 0,
            filters: vec![Filter::new("missing", FilterOp::Eq, 1)],
            raw_query: Some("SELECT 1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            translate(&req, &schema()).unwrap(),
            Translation::Raw("SELECT 1".to_string())
        );
    }
}
