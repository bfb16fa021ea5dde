use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::http_resolver::check_schema_content;
use crate::source::{RefreshOutcome, SchemaSource, SourceResolver};

/// Local, durable resolver serving `file:` URIs below one directory
pub struct FileSchemaResolver {
    root: PathBuf,
    served: Mutex<HashMap<String, Arc<str>>>,
}

impl FileSchemaResolver {
    pub const ID: &'static str = "file";

    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root)
            .map_err(|e| SchemaError::io(root.display().to_string(), e.to_string()))?;
        Ok(Self {
            root,
            served: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `file:` URI of a path relative to the root
    pub fn uri_for(&self, relative: impl AsRef<Path>) -> Result<String> {
        let path = self.root.join(relative);
        Url::from_file_path(&path)
            .map(|url| url.to_string())
            .map_err(|_| SchemaError::io(path.display().to_string(), "not an absolute path"))
    }

    /// Path on disk for `uri`, or None when the URI is not a file URL
    async fn locate(&self, uri: &str) -> Result<Option<PathBuf>> {
        let Some(path) = Url::parse(uri)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
        else {
            return Ok(None);
        };

        let path = match fs::canonicalize(&path).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SchemaError::io(uri, e.to_string())),
        };
        if !path.starts_with(&self.root) {
            return Err(SchemaError::io(uri, "path escapes the schema root directory"));
        }
        Ok(Some(path))
    }

    async fn read(&self, uri: &str) -> Result<Option<Arc<str>>> {
        let Some(path) = self.locate(uri).await? else {
            return Ok(None);
        };
        let data = fs::read(&path)
            .await
            .map_err(|e| SchemaError::io(uri, e.to_string()))?;
        let text = check_schema_content(&data, uri)?;
        Ok(Some(Arc::from(text)))
    }
}

#[async_trait]
impl SourceResolver for FileSchemaResolver {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn get_by_uri(&self, uri: &str) -> Result<Option<SchemaSource>> {
        let Some(text) = self.read(uri).await? else {
            return Ok(None);
        };
        debug!(uri = %uri, "Read schema from file");
        self.served.lock().insert(uri.to_string(), text.clone());
        Ok(Some(SchemaSource::new(uri, text, Self::ID)))
    }

    async fn refresh(&self, uri: &str) -> Result<RefreshOutcome> {
        let Some(text) = self.read(uri).await? else {
            self.served.lock().remove(uri);
            return Ok(RefreshOutcome::Gone);
        };
        let previous = self.served.lock().insert(uri.to_string(), text.clone());
        match previous {
            Some(previous) if previous == text => Ok(RefreshOutcome::Unchanged),
            _ => Ok(RefreshOutcome::Changed),
        }
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn is_transient(&self) -> bool {
        false
    }
}
