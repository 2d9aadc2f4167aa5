use serde::{Deserialize, Serialize};

/// The only manifest layout we read. Anything else is skipped, never migrated.
pub const MANIFEST_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestColumn {
    pub name: String,
}

/// Column list of one virtual table stored over the shared physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualTableManifest {
    pub version: String,
    #[serde(default)]
    pub stored_at: String,
    pub columns: Vec<ManifestColumn>,
}

impl VirtualTableManifest {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: MANIFEST_VERSION.to_string(),
            stored_at: chrono::Utc::now().to_rfc3339(),
            columns: columns.into_iter().map(|name| ManifestColumn { name: name.into() }).collect(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.version == MANIFEST_VERSION
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}
