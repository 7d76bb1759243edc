//! Node schemas and the fetchers that resolve them.
//!
//! A node type's schema lists its parameters in declaration order together
//! with a `[type_tag, options]` definition per parameter. The remote fetcher
//! asks the backend's `object_info` route and memoizes results for the life of
//! the process; the local fetcher pre-loads a directory of schema dumps.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Parameter definition: `[type_tag, options?]` where `type_tag` is a type
/// name string or a choice array, and `options` may carry `default` and
/// `image_upload`.
pub type InputDef = Vec<Value>;

/// Input schema of a node type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInput {
    #[serde(default)]
    pub required: HashMap<String, InputDef>,
    #[serde(default)]
    pub optional: HashMap<String, InputDef>,
}

/// Declaration order of the input parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputOrder {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

/// Schema of one node type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub input: NodeInput,
    #[serde(default)]
    pub input_order: InputOrder,
    #[serde(default)]
    pub display_name: String,
}

/// Resolves a node type to its input schema.
#[async_trait]
pub trait NodeInfoFetcher: Send + Sync {
    async fn fetch_node_info(&self, node_type: &str) -> Result<Arc<NodeInfo>>;
}

/// Remote fetcher backed by `GET <base>/api/object_info/<type>`, with an
/// in-memory cache. Entries are immutable once inserted.
pub struct HttpNodeInfoFetcher {
    base_url: Url,
    client: reqwest::Client,
    cache: RwLock<HashMap<String, Arc<NodeInfo>>>,
}

impl HttpNodeInfoFetcher {
    pub fn new(base_url: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl NodeInfoFetcher for HttpNodeInfoFetcher {
    async fn fetch_node_info(&self, node_type: &str) -> Result<Arc<NodeInfo>> {
        if let Some(info) = self.cache.read().await.get(node_type) {
            return Ok(info.clone());
        }

        let mut url = self.base_url.clone();
        url.set_path(&format!("/api/object_info/{node_type}"));
        debug!(%url, "fetching node info");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Validation(format!(
                "fetch node info for {node_type:?}: status {}",
                response.status()
            )));
        }

        // The body is a mapping whose sole key is the requested type.
        let mut infos: HashMap<String, NodeInfo> = response.json().await?;
        let info = infos
            .remove(node_type)
            .map(Arc::new)
            .ok_or_else(|| Error::Validation(format!("node info for {node_type:?} not found")))?;

        self.cache
            .write()
            .await
            .entry(node_type.to_string())
            .or_insert_with(|| info.clone());
        Ok(info)
    }
}

/// Local fetcher that pre-loads every `*.json` schema dump under a directory
/// at construction. Each file holds one or more node-type mappings; later
/// files win on duplicate types.
pub struct DirNodeInfoFetcher {
    cache: HashMap<String, Arc<NodeInfo>>,
}

impl DirNodeInfoFetcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let mut cache = HashMap::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let infos: HashMap<String, NodeInfo> = serde_json::from_str(&content)?;
            for (node_type, info) in infos {
                cache.insert(node_type, Arc::new(info));
            }
        }
        Ok(Self { cache })
    }
}

#[async_trait]
impl NodeInfoFetcher for DirNodeInfoFetcher {
    async fn fetch_node_info(&self, node_type: &str) -> Result<Arc<NodeInfo>> {
        self.cache
            .get(node_type)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("node info for {node_type:?} not found")))
    }
}
