use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Manifest layout understood by this crate
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "_manifest.json";
const MANIFEST_TMP_FILE: &str = "_manifest.json.tmp";

/// One Arrow IPC file of a table version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentMeta {
    /// File name relative to the version directory
    pub file: String,
    pub num_rows: u64,
    /// Row count of every IPC record batch in the file, in order
    pub batch_rows: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub column: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableManifest {
    pub format_version: u32,
    pub version: u64,
    pub fragments: Vec<FragmentMeta>,
    #[serde(default)]
    pub indices: Vec<IndexMeta>,
}

impl TableManifest {
    pub fn new(version: u64, fragments: Vec<FragmentMeta>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            version,
            fragments,
            indices: Vec::new(),
        }
    }

    /// Read `_manifest.json` from a table directory
    pub fn from_dir(table_dir: &Path) -> Result<Self> {
        let content = fs::read_to_string(table_dir.join(MANIFEST_FILE))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let manifest: TableManifest = serde_json::from_str(content)?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::Manifest(format!(
                "Unsupported manifest format version {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }

        for fragment in &manifest.fragments {
            let batch_total: u64 = fragment.batch_rows.iter().sum();
            if batch_total != fragment.num_rows {
                return Err(Error::Manifest(format!(
                    "Fragment {} declares {} rows but its batches hold {}",
                    fragment.file, fragment.num_rows, batch_total
                )));
            }
        }

        Ok(manifest)
    }

    /// Commit this manifest into `table_dir`.
    ///
    /// The file is written next to the live manifest and renamed over it, so
    /// readers observe either the old or the new version.
    pub fn write_atomic(&self, table_dir: &Path) -> Result<()> {
        let tmp_path = table_dir.join(MANIFEST_TMP_FILE);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, table_dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    pub fn version_dir_name(version: u64) -> String {
        format!("v{}", version)
    }

    /// Parse a version number back out of a directory name like `v3`
    pub fn parse_version_dir(name: &str) -> Option<u64> {
        name.strip_prefix('v').and_then(|n| n.parse::<u64>().ok())
    }

    pub fn num_rows(&self) -> u64 {
        self.fragments.iter().map(|f| f.num_rows).sum()
    }

    pub fn index_for(&self, column: &str) -> Option<&IndexMeta> {
        self.indices.iter().find(|idx| idx.column == column)
    }

    /// Map a table-wide row id to (fragment, batch, row within batch)
    pub fn locate_row(&self, row_id: u64) -> Option<(usize, usize, usize)> {
        let mut remaining = row_id;
        for (fragment_idx, fragment) in self.fragments.iter().enumerate() {
            if remaining >= fragment.num_rows {
                remaining -= fragment.num_rows;
                continue;
            }
            for (batch_idx, &rows) in fragment.batch_rows.iter().enumerate() {
                if remaining < rows {
                    return Some((fragment_idx, batch_idx, remaining as usize));
                }
                remaining -= rows;
            }
        }
        None
    }
}
