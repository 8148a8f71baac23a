//! dataviewer CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use datafusion_dataviewer::plugin::PluginRegistry;
use datafusion_dataviewer::response::{ErrorResponse, FacetResponse};
use datafusion_dataviewer::{Error, SearchRequest, StartOptions, ViewConfig, ViewerContext};

/// Browse a large dataset through a local columnar cache.
#[derive(Parser, Debug)]
#[command(name = "dataviewer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; command line flags override its fields
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,

    /// Show progress bars while indexing
    #[arg(long, global = true)]
    progress: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Default)]
struct ConfigArgs {
    /// Dataset location: local path, file:// or s3/gs/az URL, optionally ending in a glob
    #[arg(short = 'd', long = "dataset", value_name = "PATH", global = true)]
    dataset_path: Option<String>,

    /// Columns to keep (comma separated)
    #[arg(long, value_delimiter = ',', global = true)]
    include_columns: Option<Vec<String>>,

    /// Columns to drop (comma separated)
    #[arg(long, value_delimiter = ',', global = true)]
    exclude_columns: Option<Vec<String>>,

    /// Columns with precomputed facets (comma separated)
    #[arg(long, value_delimiter = ',', global = true)]
    facet_columns: Option<Vec<String>>,

    #[arg(long, global = true)]
    id_column: Option<String>,

    #[arg(long, global = true)]
    row_start: Option<usize>,

    #[arg(long, global = true)]
    row_end: Option<usize>,

    #[arg(long, global = true)]
    limit: Option<usize>,

    #[arg(long, value_name = "DIR", global = true)]
    cache_path: Option<PathBuf>,

    /// Use an already indexed table instead of indexing the dataset
    #[arg(long, value_name = "KEY", global = true)]
    table_hash: Option<String>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Row visualizer plugin id
    #[arg(long, global = true)]
    plugin: Option<String>,

    /// Rebuild the plugin before every render
    #[arg(long, global = true)]
    reload_plugin: bool,
}

impl ConfigArgs {
    fn into_config(self) -> ViewConfig {
        ViewConfig {
            dataset_path: self.dataset_path,
            include_columns: self.include_columns,
            exclude_columns: self.exclude_columns,
            facet_columns: self.facet_columns,
            id_column: self.id_column,
            row_start: self.row_start,
            row_end: self.row_end,
            limit: self.limit,
            cache_path: self.cache_path,
            table_hash: self.table_hash,
            batch_size: self.batch_size,
            plugin: self.plugin,
            reload_plugin: self.reload_plugin,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build (or reuse) the cache for the dataset and print its key
    Index {
        /// Rebuild even when a cached table exists
        #[arg(long)]
        force: bool,
    },
    /// Run a search request and print one page of rows
    Search {
        /// Search request as JSON
        #[arg(short = 'r', long, value_name = "JSON", conflicts_with = "request_file")]
        request: Option<String>,

        /// Read the search request from a JSON file
        #[arg(long, value_name = "FILE")]
        request_file: Option<PathBuf>,

        /// SQL against the `dataset` table; replaces structured filters
        #[arg(long, value_name = "SQL")]
        sql: Option<String>,

        #[arg(long)]
        page: Option<usize>,

        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Print the row whose id column equals ID
    Row { id: String },
    /// Render the row whose id column equals ID with the configured plugin
    Render { id: String },
    /// Print value counts for the facet columns
    Facets,
    /// Print the cached table's columns and types
    Schema,
    /// List registered row visualizer plugins
    Plugins,
    /// Write an example configuration file
    GenerateConfig {
        #[arg(value_name = "OUTPUT", default_value = "example_config.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match run(args).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Library errors get the same JSON body a request boundary would send
            if let Some(error) = err.downcast_ref::<Error>() {
                eprintln!("{}", serde_json::to_string_pretty(&ErrorResponse::from(error))?);
            }
            Err(err)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let registry = Arc::new(PluginRegistry::with_builtins());

    if let Command::GenerateConfig { output } = &args.command {
        let json = ViewConfig::example().to_json_pretty()?;
        std::fs::write(output, json)
            .with_context(|| format!("Failed to write config: {}", output.display()))?;
        eprintln!("Wrote example configuration to {}", output.display());
        return Ok(());
    }
    if let Command::Plugins = &args.command {
        return print_json(&registry.ids());
    }

    let config = load_config(args.config.as_ref(), args.overrides)?;
    let options = StartOptions {
        force_reindex: matches!(args.command, Command::Index { force: true }),
        show_progress: args.progress,
        ..Default::default()
    };
    let viewer = ViewerContext::start_with(config, options, registry).await?;

    match args.command {
        Command::Index { .. } => {
            println!("{}", viewer.key());
            Ok(())
        }
        Command::Search {
            request,
            request_file,
            sql,
            page,
            page_size,
        } => {
            let mut request = match (request, request_file) {
                (Some(json), _) => serde_json::from_str(&json).context("Invalid search request")?,
                (None, Some(path)) => {
                    let json = std::fs::read_to_string(&path).with_context(|| {
                        format!("Failed to read search request: {}", path.display())
                    })?;
                    serde_json::from_str(&json).context("Invalid search request")?
                }
                (None, None) => SearchRequest::default(),
            };
            if sql.is_some() {
                request.raw_query = sql;
            }
            if let Some(page) = page {
                request.page = page;
            }
            if let Some(page_size) = page_size {
                request.page_size = page_size;
            }
            print_json(&viewer.search(&request).await?)
        }
        Command::Row { id } => print_json(&viewer.get_row(&id).await?),
        Command::Render { id } => print_json(&viewer.render_row(&id).await?),
        Command::Facets => {
            let facets = viewer.facets().await?;
            print_json(&FacetResponse { facets: &facets })
        }
        Command::Schema => print_json(&viewer.schema_description()),
        Command::Plugins | Command::GenerateConfig { .. } => Ok(()),
    }
}

fn load_config(path: Option<&PathBuf>, overrides: ConfigArgs) -> Result<ViewConfig> {
    let base = match path {
        Some(path) => ViewConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => ViewConfig::default(),
    };
    Ok(base.merge(overrides.into_config()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
