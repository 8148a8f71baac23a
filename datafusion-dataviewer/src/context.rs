use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::config::ViewConfig;
use crate::dataset::CacheKey;
use crate::error::{Error, Result};
use crate::facets::{Facet, FacetComputer};
use crate::filter::SearchRequest;
use crate::indexer::CacheIndexer;
use crate::plugin::{ActivePlugin, PluginRegistry, VisualizationResponse};
use crate::query::{EngineOptions, QueryEngine};
use crate::response::SearchResponse;
use crate::schema::ColumnInfo;

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub force_reindex: bool,
    pub show_progress: bool,
    pub engine: EngineOptions,
}

/// Everything one viewer instance needs, built once at startup and shared by
/// reference with every request
pub struct ViewerContext {
    config: Arc<ViewConfig>,
    engine: Arc<QueryEngine>,
    facets: FacetComputer,
    plugin: Option<ActivePlugin>,
}

impl ViewerContext {
    /// Index the configured dataset (unless cached) and open it for queries
    pub async fn start(config: ViewConfig) -> Result<Self> {
        Self::start_with(
            config,
            StartOptions::default(),
            Arc::new(PluginRegistry::with_builtins()),
        )
        .await
    }

    pub async fn start_with(
        config: ViewConfig,
        options: StartOptions,
        registry: Arc<PluginRegistry>,
    ) -> Result<Self> {
        let key = match &config.table_hash {
            Some(hash) => CacheKey::from_raw(hash.as_str()),
            None => {
                let descriptor = config.descriptor()?;
                let index_options = config.index_options(options.force_reindex, options.show_progress)?;
                CacheIndexer::build_async(descriptor, index_options).await?
            }
        };

        let engine = QueryEngine::open(config.cache_path(), &key, options.engine)?;
        let plugin = config
            .plugin
            .as_deref()
            .map(|id| ActivePlugin::new(registry, id, config.reload_plugin))
            .transpose()?;

        info!(
            key = %key,
            rows = engine.num_rows(),
            plugin = config.plugin.as_deref().unwrap_or("none"),
            "viewer context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            facets: FacetComputer::new(),
            plugin,
        })
    }

    pub fn config(&self) -> &Arc<ViewConfig> {
        &self.config
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn key(&self) -> &CacheKey {
        self.engine.key()
    }

    pub fn schema_description(&self) -> Vec<ColumnInfo> {
        self.engine.schema_description()
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let result = self.engine.search(request).await?;
        SearchResponse::from_result(&result)
    }

    pub async fn get_row(&self, id: &str) -> Result<Map<String, Value>> {
        self.engine
            .get_row(self.config.id_column.as_deref(), id)
            .await
    }

    /// Facets for the configured facet columns, computed once per context
    pub async fn facets(&self) -> Result<Arc<Vec<Facet>>> {
        self.facets
            .get_facets(&self.engine, self.config.facet_columns())
            .await
    }

    pub async fn render_row(&self, id: &str) -> Result<VisualizationResponse> {
        let plugin = self
            .plugin
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing("plugin".to_string()))?;
        let row = self.get_row(id).await?;
        Ok(VisualizationResponse {
            html: plugin.render_row(&row, &self.config)?,
        })
    }
}
