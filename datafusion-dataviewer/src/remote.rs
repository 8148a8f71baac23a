//! Datasets in object storage.
//!
//! `s3://bucket/key`, `gs://bucket/key` and `az://container/blob` locations
//! are downloaded into a scratch directory under the cache root and ingested
//! from there like local files. A glob in the final key segment selects every
//! matching object under the parent prefix.
//!
//! Credentials and endpoints come from the provider's usual environment
//! variables (`AWS_*`, `GOOGLE_*`, `AZURE_*`).

use futures::StreamExt;
use globset::Glob;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::dataset::{has_glob, location_scheme};
use crate::error::{Error, Result};

pub const REMOTE_SCHEMES: [&str; 4] = ["s3", "gs", "az", "azure"];

/// Scratch directories are hidden so they never look like cached tables
const STAGING_PREFIX: &str = ".staging-";

pub fn is_remote(location: &str) -> bool {
    location_scheme(location).is_some_and(|scheme| REMOTE_SCHEMES.contains(&scheme))
}

/// Parsed object storage location
#[derive(Debug, Clone)]
pub struct RemoteLocation {
    url: Url,
}

impl RemoteLocation {
    pub fn parse(location: &str) -> Result<Self> {
        let url = Url::parse(location)
            .map_err(|e| Error::UnsupportedLocation(format!("{}: {}", location, e)))?;

        if !REMOTE_SCHEMES.contains(&url.scheme()) {
            return Err(Error::UnsupportedLocation(location.to_string()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::UnsupportedLocation(format!(
                "{}: missing bucket or container",
                location
            )));
        }
        if url.path().trim_start_matches('/').is_empty() {
            return Err(Error::UnsupportedLocation(format!(
                "{}: missing object key",
                location
            )));
        }

        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Bucket or container name
    pub fn bucket(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Object key (or key pattern) inside the bucket, still URL-encoded
    pub fn key(&self) -> &str {
        self.url.path().trim_start_matches('/')
    }

    /// Build a store for the bucket from environment credentials
    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match self.scheme() {
            #[cfg(feature = "s3")]
            "s3" => {
                use object_store::aws::AmazonS3Builder;
                let store = AmazonS3Builder::from_env()
                    .with_bucket_name(self.bucket())
                    .build()?;
                Ok(Arc::new(store))
            }
            #[cfg(feature = "gcs")]
            "gs" => {
                use object_store::gcp::GoogleCloudStorageBuilder;
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(self.bucket())
                    .build()?;
                Ok(Arc::new(store))
            }
            #[cfg(feature = "azure")]
            "az" | "azure" => {
                use object_store::azure::MicrosoftAzureBuilder;
                let store = MicrosoftAzureBuilder::from_env()
                    .with_container_name(self.bucket())
                    .build()?;
                Ok(Arc::new(store))
            }
            scheme => Err(Error::UnsupportedLocation(format!(
                "{}: support for {}:// is not compiled in",
                self.url, scheme
            ))),
        }
    }
}

/// Local copies of remote objects, deleted on drop
#[derive(Debug)]
pub struct StagedDataset {
    dir: TempDir,
    files: Vec<PathBuf>,
    pattern: Option<String>,
}

impl StagedDataset {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Local location to ingest from: the single staged file, or a glob over
    /// the staging directory that keeps the original extension
    pub fn location(&self) -> String {
        match (&self.pattern, self.files.as_slice()) {
            (None, [file]) => file.display().to_string(),
            (pattern, _) => {
                let suffix = pattern
                    .as_deref()
                    .and_then(|p| Path::new(p).extension())
                    .and_then(|ext| ext.to_str())
                    .map(|ext| format!("*.{}", ext))
                    .unwrap_or_else(|| "*".to_string());
                self.dir.path().join(suffix).display().to_string()
            }
        }
    }
}

/// Download `location` into a new scratch directory under `staging_root`
pub async fn stage(location: &str, staging_root: &Path) -> Result<StagedDataset> {
    let remote = RemoteLocation::parse(location)?;
    let store = remote.build_store()?;
    stage_from_store(store.as_ref(), remote.key(), staging_root).await
}

/// Download the object `key` (or every object matching a glob in its last
/// segment) from `store`. Matches are staged in key order.
pub async fn stage_from_store(
    store: &dyn ObjectStore,
    key: &str,
    staging_root: &Path,
) -> Result<StagedDataset> {
    let (parent, last) = key.rsplit_once('/').unwrap_or(("", key));

    let (objects, pattern) = if has_glob(last) {
        let objects = list_matching(store, parent, last).await?;
        if objects.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no objects match {}", key),
            )));
        }
        (objects, Some(last.to_string()))
    } else {
        (vec![object_path(key)?], None)
    };

    tokio::fs::create_dir_all(staging_root).await?;
    let dir = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(staging_root)?;

    let mut files = Vec::with_capacity(objects.len());
    let mut bytes = 0u64;
    for (i, object) in objects.iter().enumerate() {
        let name = object.filename().unwrap_or("object");
        let target = dir.path().join(format!("{:05}-{}", i, name));
        bytes += download(store, object, &target).await?;
        files.push(target);
    }

    info!(
        key = %key,
        objects = files.len(),
        bytes,
        dir = %dir.path().display(),
        "staged remote dataset"
    );

    Ok(StagedDataset {
        dir,
        files,
        pattern,
    })
}

fn object_path(encoded: &str) -> Result<ObjectPath> {
    ObjectPath::from_url_path(encoded)
        .map_err(|e| Error::UnsupportedLocation(format!("{}: {}", encoded, e)))
}

async fn list_matching(store: &dyn ObjectStore, parent: &str, pattern: &str) -> Result<Vec<ObjectPath>> {
    let matcher = Glob::new(pattern)
        .map_err(|e| Error::UnsupportedLocation(format!("{}: {}", pattern, e)))?
        .compile_matcher();

    let prefix = if parent.is_empty() {
        None
    } else {
        Some(object_path(parent)?)
    };
    let listing = store.list_with_delimiter(prefix.as_ref()).await?;

    let mut objects: Vec<ObjectPath> = listing
        .objects
        .into_iter()
        .map(|meta| meta.location)
        .filter(|path| path.filename().is_some_and(|name| matcher.is_match(name)))
        .collect();
    objects.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
    Ok(objects)
}

async fn download(store: &dyn ObjectStore, object: &ObjectPath, target: &Path) -> Result<u64> {
    let mut chunks = store.get(object).await?.into_stream();
    let mut file = tokio::fs::File::create(target).await?;

    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(object = %object, bytes = written, "downloaded object");
    Ok(written)
}
