//! Row visualizer plugins.
//!
//! Plugins are registered under an id as factories; the active plugin is
//! built from its factory at startup and, with reload enabled, rebuilt from
//! the registry on every render so a re-registered factory takes effect
//! without a restart.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::ViewConfig;
use crate::error::{Error, Result};

/// Renders one row as an HTML fragment
pub trait RowVisualizer: Send + Sync {
    /// Plugin settings, passed back to [`RowVisualizer::render_row`]
    fn settings(&self) -> Value;

    fn render_row(&self, row: &Map<String, Value>, settings: &Value, config: &ViewConfig) -> String;
}

pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn RowVisualizer> + Send + Sync>;

/// Id of the built-in greeting plugin
pub const GREETING_PLUGIN: &str = "greeting";

#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in plugins
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(GREETING_PLUGIN, || {
            Arc::new(GreetingPlugin) as Arc<dyn RowVisualizer>
        });
        registry
    }

    /// Register `factory` under `id`, replacing any previous factory
    pub fn register<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn RowVisualizer> + Send + Sync + 'static,
    {
        let id = id.into();
        debug!(plugin = %id, "registered row visualizer");
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.insert(id, Arc::new(factory));
    }

    /// Build a fresh instance of the plugin registered under `id`
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn RowVisualizer>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConfigMissing(format!("plugin {}", id)))?;
        Ok(factory())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// The plugin selected by configuration
pub struct ActivePlugin {
    id: String,
    registry: Arc<PluginRegistry>,
    instance: RwLock<Arc<dyn RowVisualizer>>,
    reload: bool,
}

impl fmt::Debug for ActivePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePlugin")
            .field("id", &self.id)
            .field("reload", &self.reload)
            .finish()
    }
}

impl ActivePlugin {
    pub fn new(registry: Arc<PluginRegistry>, id: &str, reload: bool) -> Result<Self> {
        let instance = registry.resolve(id)?;
        Ok(Self {
            id: id.to_string(),
            registry,
            instance: RwLock::new(instance),
            reload,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The instance to use for the next call, rebuilt first when reloading
    pub fn current(&self) -> Result<Arc<dyn RowVisualizer>> {
        if self.reload {
            let fresh = self.registry.resolve(&self.id)?;
            debug!(plugin = %self.id, "reloaded row visualizer");
            *self
                .instance
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh.clone();
            return Ok(fresh);
        }
        Ok(self
            .instance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    pub fn settings(&self) -> Result<Value> {
        Ok(self.current()?.settings())
    }

    pub fn render_row(&self, row: &Map<String, Value>, config: &ViewConfig) -> Result<String> {
        let plugin = self.current()?;
        let settings = plugin.settings();
        Ok(plugin.render_row(row, &settings, config))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisualizationResponse {
    pub html: String,
}

/// Greets with its configured text and the dataset path
#[derive(Debug, Clone, Copy, Default)]
pub struct GreetingPlugin;

impl RowVisualizer for GreetingPlugin {
    fn settings(&self) -> Value {
        json!({ "greeting": "hello world" })
    }

    fn render_row(&self, _row: &Map<String, Value>, settings: &Value, config: &ViewConfig) -> String {
        let greeting = settings
            .get("greeting")
            .and_then(Value::as_str)
            .unwrap_or("Hello world");
        format!(
            "<div>{} - {} </div>",
            greeting,
            config.dataset_path.as_deref().unwrap_or("")
        )
    }
}
