use base64::Engine;
use datafusion::arrow::array::{BinaryArray, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::ipc::writer::FileWriter;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion_dataviewer::response::ErrorResponse;
use datafusion_dataviewer::{
    Error, FacetComputer, Filter, FilterOp, SearchRequest, Sort, StartOptions, ViewConfig,
    ViewerContext,
};
use dataviewer_store::CacheStore;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

const PEOPLE: &str = "id,name,age,city
1,ann,18,paris
2,bob,19,rome
3,cid,20,paris
4,dee,21,oslo
5,eve,22,paris
6,fay,23,rome
7,gus,24,oslo
8,hal,25,paris
9,ivy,26,rome
10,jon,27,paris
";

fn people_config(dir: &Path) -> ViewConfig {
    let path = dir.join("people.csv");
    fs::write(&path, PEOPLE).expect("Failed to write csv");
    ViewConfig {
        dataset_path: Some(path.display().to_string()),
        cache_path: Some(dir.join("cache")),
        id_column: Some("id".to_string()),
        facet_columns: Some(vec!["city".to_string()]),
        ..Default::default()
    }
}

fn ids(data: &[serde_json::Map<String, Value>]) -> Vec<i64> {
    data.iter().map(|row| row["id"].as_i64().unwrap()).collect()
}

fn by_id() -> Vec<Sort> {
    vec![Sort {
        column: "id".to_string(),
        descending: false,
    }]
}

fn table_version(config: &ViewConfig, viewer: &ViewerContext) -> u64 {
    CacheStore::connect(config.cache_path())
        .and_then(|store| store.open_table(viewer.key().as_str()))
        .expect("Failed to open cached table")
        .version()
}

#[tokio::test]
async fn test_index_once_then_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let config = people_config(dir.path());

    let first = ViewerContext::start(config.clone()).await.expect("Failed to start");
    let version = table_version(&config, &first);
    assert_eq!(first.engine().num_rows(), 10);

    let second = ViewerContext::start(config.clone()).await.expect("Failed to restart");
    assert_eq!(second.key(), first.key());
    assert_eq!(table_version(&config, &second), version);

    let options = StartOptions {
        force_reindex: true,
        ..Default::default()
    };
    let registry = Arc::new(datafusion_dataviewer::PluginRegistry::with_builtins());
    let forced = ViewerContext::start_with(config.clone(), options, registry)
        .await
        .expect("Failed to reindex");
    assert_eq!(forced.key(), first.key());
    assert!(table_version(&config, &forced) > version);
}

#[tokio::test]
async fn test_table_hash_skips_indexing() {
    let dir = tempfile::tempdir().unwrap();
    let config = people_config(dir.path());
    let indexed = ViewerContext::start(config.clone()).await.unwrap();

    let config = ViewConfig {
        table_hash: Some(indexed.key().to_string()),
        cache_path: config.cache_path.clone(),
        ..Default::default()
    };
    let viewer = ViewerContext::start(config).await.expect("Failed to open by hash");
    assert_eq!(viewer.engine().num_rows(), 10);
    assert_eq!(viewer.schema_description().len(), 4);
}

#[tokio::test]
async fn test_filter_coerces_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let viewer = ViewerContext::start(people_config(dir.path())).await.unwrap();

    let request = SearchRequest {
        filters: vec![Filter::new("age", FilterOp::GtEq, "21")],
        sorts: by_id(),
        ..Default::default()
    };
    let response = viewer.search(&request).await.expect("Failed to search");
    assert_eq!(response.total_rows, 7);
    assert_eq!(ids(&response.data), vec![4, 5, 6, 7, 8, 9, 10]);
}

#[tokio::test]
async fn test_between_is_inclusive() {
    let dir = tempfile::tempdir().unwrap();
    let viewer = ViewerContext::start(people_config(dir.path())).await.unwrap();

    let request = SearchRequest {
        filters: vec![Filter::new("age", FilterOp::Between, json!([20, 22]))],
        sorts: by_id(),
        ..Default::default()
    };
    let response = viewer.search(&request).await.unwrap();
    assert_eq!(ids(&response.data), vec![3, 4, 5]);

    let request = SearchRequest {
        filters: vec![Filter::new("age", FilterOp::Between, json!([20, 22, 24]))],
        ..Default::default()
    };
    let err = viewer.search(&request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidFilter(_)));
    assert_eq!(ErrorResponse::from(&err).status, 400);
}

#[tokio::test]
async fn test_pages_share_total() {
    let dir = tempfile::tempdir().unwrap();
    let viewer = ViewerContext::start(people_config(dir.path())).await.unwrap();

    let mut pages = Vec::new();
    for page in 0..3 {
        let request = SearchRequest {
            page,
            page_size: 4,
            sorts: by_id(),
            ..Default::default()
        };
        let response = viewer.search(&request).await.unwrap();
        assert_eq!(response.total_rows, 10);
        pages.push(ids(&response.data));
    }
    assert_eq!(pages[0], vec![1, 2, 3, 4]);
    assert_eq!(pages[1], vec![5, 6, 7, 8]);
    assert_eq!(pages[2], vec![9, 10]);
}

#[tokio::test]
async fn test_descending_sort_and_json_request() {
    let dir = tempfile::tempdir().unwrap();
    let viewer = ViewerContext::start(people_config(dir.path())).await.unwrap();

    let request: SearchRequest = serde_json::from_value(json!({
        "pageSize": 2,
        "filters": [{ "column": "city", "operator": "=", "value": "rome" }],
        "sorts": [{ "column": "age", "descending": true }]
    }))
    .unwrap();
    let response = viewer.search(&request).await.unwrap();
    assert_eq!(response.total_rows, 3);
    assert_eq!(ids(&response.data), vec![9, 6]);
}

#[tokio::test]
async fn test_raw_query() {
    let dir = tempfile::tempdir().unwrap();
    let viewer = ViewerContext::start(people_config(dir.path())).await.unwrap();

    let request = SearchRequest {
        raw_query: Some(
            "SELECT city, COUNT(*) AS n FROM dataset GROUP BY city ORDER BY n DESC, city".to_string(),
        ),
        ..Default::default()
    };
    let response = viewer.search(&request).await.unwrap();
    assert_eq!(response.total_rows, 3);
    assert_eq!(response.data[0]["city"], json!("paris"));
    assert_eq!(response.data[0]["n"], json!(5));

    let bad = SearchRequest {
        raw_query: Some("SELECT nope FROM dataset".to_string()),
        ..Default::default()
    };
    let err = viewer.search(&bad).await.unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_get_row_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let viewer = ViewerContext::start(people_config(dir.path())).await.unwrap();

    let row = viewer.get_row("4").await.expect("Failed to fetch row");
    assert_eq!(row["name"], json!("dee"));
    assert_eq!(row["age"], json!(21));

    let err = viewer.get_row("999").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(ErrorResponse::from(&err).status, 404);
}

#[tokio::test]
async fn test_facets_are_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let config = people_config(dir.path());
    let viewer = ViewerContext::start(config.clone()).await.unwrap();

    let facets = viewer.facets().await.expect("Failed to compute facets");
    assert_eq!(facets.len(), 1);
    assert_eq!(facets[0].column, "city");
    let counts: Vec<(Value, u64)> = facets[0]
        .values
        .iter()
        .map(|v| (v.value.clone(), v.count))
        .collect();
    assert_eq!(
        counts,
        vec![(json!("paris"), 5), (json!("rome"), 3), (json!("oslo"), 2)]
    );

    // New data behind the same key does not change facets already computed
    let path = dir.path().join("people.csv");
    fs::write(&path, format!("{}11,kim,28,oslo\n12,lou,29,oslo\n", PEOPLE)).unwrap();
    let options = StartOptions {
        force_reindex: true,
        ..Default::default()
    };
    let registry = Arc::new(datafusion_dataviewer::PluginRegistry::with_builtins());
    let reindexed = ViewerContext::start_with(config, options, registry).await.unwrap();

    let again = viewer.facets().await.unwrap();
    assert!(Arc::ptr_eq(&facets, &again));

    let fresh = reindexed.facets().await.unwrap();
    assert_eq!(fresh[0].values.len(), 3);
    assert!(fresh[0].values.iter().any(|v| v.value == json!("oslo") && v.count == 4));
}

#[tokio::test]
async fn test_empty_facet_columns_are_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = people_config(dir.path());
    config.facet_columns = None;
    let viewer = ViewerContext::start(config.clone()).await.unwrap();

    let facets = viewer.facets().await.expect("Failed to compute facets");
    assert!(facets.is_empty());

    // Reindex with more rows behind the same key
    let path = dir.path().join("people.csv");
    fs::write(&path, format!("{}11,kim,28,oslo\n", PEOPLE)).unwrap();
    let options = StartOptions {
        force_reindex: true,
        ..Default::default()
    };
    let registry = Arc::new(datafusion_dataviewer::PluginRegistry::with_builtins());
    ViewerContext::start_with(config, options, registry).await.unwrap();

    let again = viewer.facets().await.unwrap();
    assert!(again.is_empty());
    assert!(Arc::ptr_eq(&facets, &again));

    // Asking for other columns later still returns the memoized empty list
    let computer = FacetComputer::new();
    let empty = computer.get_facets(viewer.engine(), &[]).await.unwrap();
    assert!(empty.is_empty());
    let later = computer
        .get_facets(viewer.engine(), &["city".to_string()])
        .await
        .unwrap();
    assert!(later.is_empty());
    assert!(Arc::ptr_eq(&empty, &later));
}

#[tokio::test]
async fn test_unknown_facet_column() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = people_config(dir.path());
    config.facet_columns = Some(vec!["city".to_string(), "planet".to_string()]);
    let viewer = ViewerContext::start(config).await.unwrap();

    let err = viewer.facets().await.unwrap_err();
    assert!(err.to_string().contains("planet"));
}

#[tokio::test]
async fn test_row_window_and_projection() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = people_config(dir.path());
    config.row_start = Some(2);
    config.row_end = Some(5);
    config.exclude_columns = Some(vec!["city".to_string()]);
    let viewer = ViewerContext::start(config).await.unwrap();

    let response = viewer
        .search(&SearchRequest {
            sorts: by_id(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&response.data), vec![3, 4, 5]);
    let columns: Vec<&str> = response.schema.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["id", "name", "age"]);
}

#[tokio::test]
async fn test_render_row_with_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = people_config(dir.path());
    let viewer = ViewerContext::start(config.clone()).await.unwrap();
    assert!(matches!(
        viewer.render_row("1").await,
        Err(Error::ConfigMissing(_))
    ));

    config.plugin = Some("greeting".to_string());
    let viewer = ViewerContext::start(config.clone()).await.unwrap();
    let rendered = viewer.render_row("1").await.expect("Failed to render");
    assert_eq!(
        rendered.html,
        format!("<div>hello world - {} </div>", config.dataset_path.unwrap())
    );
}

#[tokio::test]
async fn test_jsonl_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    fs::write(
        &path,
        "{\"id\": 1, \"kind\": \"open\"}\n{\"id\": 2, \"kind\": \"close\"}\n{\"id\": 3}\n",
    )
    .unwrap();
    let config = ViewConfig {
        dataset_path: Some(path.display().to_string()),
        cache_path: Some(dir.path().join("cache")),
        id_column: Some("id".to_string()),
        ..Default::default()
    };
    let viewer = ViewerContext::start(config).await.unwrap();

    assert_eq!(viewer.get_row("2").await.unwrap()["kind"], json!("close"));
    assert_eq!(viewer.get_row("3").await.unwrap()["kind"], Value::Null);
}

#[tokio::test]
async fn test_parquet_binary_round_trips_as_base64() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("payload", DataType::Binary, true),
    ]));
    let payloads: Vec<&[u8]> = vec![&b"\x00\x01\xff"[..], &b"plain"[..]];
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(BinaryArray::from(payloads.clone())),
        ],
    )
    .unwrap();
    let path = dir.path().join("blobs.parquet");
    let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let config = ViewConfig {
        dataset_path: Some(path.display().to_string()),
        cache_path: Some(dir.path().join("cache")),
        ..Default::default()
    };
    let viewer = ViewerContext::start(config).await.unwrap();
    let response = viewer
        .search(&SearchRequest {
            sorts: by_id(),
            ..Default::default()
        })
        .await
        .unwrap();

    for (row, expected) in response.data.iter().zip(payloads) {
        let encoded = row["payload"].as_str().expect("binary renders as text");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, expected);
    }

    // Serialized responses carry the same text
    let body = serde_json::to_value(&response).unwrap();
    assert_eq!(body["data"][1]["payload"], json!("cGxhaW4="));
}

#[tokio::test]
async fn test_columnar_file_is_copied() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("label", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])),
            Arc::new(StringArray::from(vec!["a", "b", "c", "d", "e"])),
        ],
    )
    .unwrap();
    let path = dir.path().join("table.arrow");
    let mut writer = FileWriter::try_new(File::create(&path).unwrap(), &schema).unwrap();
    writer.write(&batch).unwrap();
    writer.finish().unwrap();

    let config = ViewConfig {
        dataset_path: Some(path.display().to_string()),
        cache_path: Some(dir.path().join("cache")),
        id_column: Some("id".to_string()),
        // Ignored for columnar sources
        limit: Some(2),
        exclude_columns: Some(vec!["label".to_string()]),
        ..Default::default()
    };
    let viewer = ViewerContext::start(config).await.unwrap();

    assert_eq!(viewer.engine().num_rows(), 5);
    assert_eq!(viewer.get_row("5").await.unwrap()["label"], json!("e"));
}

#[tokio::test]
async fn test_glob_reads_every_match() {
    let dir = tempfile::tempdir().unwrap();
    let parts = dir.path().join("parts");
    fs::create_dir_all(&parts).unwrap();
    fs::write(parts.join("part-1.csv"), "id,v\n1,a\n2,b\n").unwrap();
    fs::write(parts.join("part-2.csv"), "id,v\n3,c\n4,d\n5,e\n").unwrap();
    fs::write(parts.join("notes.txt"), "not data").unwrap();

    let config = ViewConfig {
        dataset_path: Some(format!("{}/part-*.csv", parts.display())),
        cache_path: Some(dir.path().join("cache")),
        ..Default::default()
    };
    let viewer = ViewerContext::start(config).await.unwrap();
    let response = viewer.search(&SearchRequest::default()).await.unwrap();
    assert_eq!(response.total_rows, 5);
}

#[tokio::test]
async fn test_invalid_columns_fail_indexing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = people_config(dir.path());
    config.include_columns = Some(vec!["id".to_string(), "height".to_string(), "weight".to_string()]);

    let err = ViewerContext::start(config).await.err().expect("indexing should fail");
    let message = err.to_string();
    assert!(message.contains("height") && message.contains("weight"));
    assert_eq!(ErrorResponse::from(&err).error_type, "InvalidColumns");
}
