use datafusion_dataviewer::{Filter, FilterOp, SearchRequest, ViewConfig, ViewerContext, TABLE_NAME};

/// Example: index a local dataset and query the cached table
///
/// This demonstrates how to:
/// 1. Build the cache for a CSV/JSONL/Parquet/Arrow file
/// 2. Run a structured search with a filter
/// 3. Use the underlying DataFusion session directly for SQL
///
/// Usage:
///   DATASET=/path/to/data.csv cargo run --example query_cache
///   DATASET=data.csv FILTER_COLUMN=city FILTER_VALUE=paris cargo run --example query_cache
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dataset = std::env::var("DATASET").unwrap_or_else(|_| "data.csv".to_string());
    let filter = std::env::var("FILTER_COLUMN")
        .ok()
        .zip(std::env::var("FILTER_VALUE").ok());

    println!("Indexing {}", dataset);
    let config = ViewConfig {
        dataset_path: Some(dataset),
        ..Default::default()
    };
    let viewer = ViewerContext::start(config).await?;
    println!("Cache key: {}", viewer.key());
    println!("Rows: {}\n", viewer.engine().num_rows());

    println!("Columns:");
    for column in viewer.schema_description() {
        println!("  - {} ({})", column.name, column.data_type);
    }
    println!();

    // Structured search: first page, optionally filtered on one column
    let mut request = SearchRequest {
        page_size: 5,
        ..Default::default()
    };
    if let Some((column, value)) = filter {
        println!("Filter: {} == {}", column, value);
        request.filters.push(Filter::new(column, FilterOp::Eq, value));
    }
    let response = viewer.search(&request).await?;
    println!(
        "Search matched {} rows in {:.1} ms",
        response.total_rows, response.execution_time_ms
    );
    println!("{}\n", serde_json::to_string_pretty(&response.data)?);

    // The same table is registered with DataFusion for ad-hoc SQL
    let sql = format!("SELECT COUNT(*) AS rows FROM {}", TABLE_NAME);
    println!("SQL: {}", sql);
    let df = viewer.engine().context().sql(&sql).await?;
    df.show().await?;

    let df = viewer.engine().dataset().await?.limit(0, Some(3))?;
    df.show().await?;

    Ok(())
}
