use super::error::ClientError;
use crate::client::ClientConfig;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

pub const AGENT_NAME: &str = "rust";

/// The descriptor of the reporting service, prefixed once to every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub service: ServiceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub labels: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub agent: AgentInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<NamedVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<NamedVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedVersion {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub architecture: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<Value>,
}

/// Late-arriving environment details merged in before the first request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataExtension {
    pub cloud: Option<Value>,
    pub container: Option<Value>,
    pub kubernetes: Option<Value>,
}

/// Asynchronous cloud/container enrichment, e.g. an instance-metadata probe.
#[cfg_attr(test, automock)]
pub trait CloudMetadataFetcher: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Option<MetadataExtension>>;
}

/// User hook applied to the metadata document before it is encoded.
pub type MetadataFilter = Arc<dyn Fn(&mut Metadata) + Send + Sync>;

impl Metadata {
    pub fn new(service: ServiceInfo) -> Self {
        Self {
            service,
            process: None,
            system: None,
            cloud: None,
            labels: Map::new(),
        }
    }

    /// Builds the document for a configured client, detecting host identity.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut service = ServiceInfo::new(config.service_name.clone(), crate::VERSION);
        service.version = config.service_version.clone();
        service.environment = config.environment.clone();
        Self::detect(service)
    }

    /// Detects process and host identity for the given service.
    pub fn detect(service: ServiceInfo) -> Self {
        let argv: Vec<String> = std::env::args().collect();
        let title = argv.first().cloned();
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());

        Self {
            process: Some(ProcessInfo {
                pid: std::process::id(),
                title,
                argv,
            }),
            system: Some(SystemInfo {
                hostname,
                architecture: std::env::consts::ARCH.to_string(),
                platform: std::env::consts::OS.to_string(),
                container: None,
                kubernetes: None,
            }),
            ..Self::new(service)
        }
    }

    pub fn apply_extension(&mut self, extension: MetadataExtension) {
        if extension.cloud.is_some() {
            self.cloud = extension.cloud;
        }
        if let Some(system) = self.system.as_mut() {
            if extension.container.is_some() {
                system.container = extension.container;
            }
            if extension.kubernetes.is_some() {
                system.kubernetes = extension.kubernetes;
            }
        }
    }
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, agent_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            environment: None,
            agent: AgentInfo {
                name: AGENT_NAME.to_string(),
                version: agent_version.into(),
            },
            language: Some(NamedVersion {
                name: "rust".to_string(),
                version: None,
            }),
            runtime: Some(NamedVersion {
                name: "rust".to_string(),
                version: Some(env!("RASK_APM_RUSTC_VERSION").to_string()),
            }),
        }
    }
}

/// The metadata document plus its filters and cached encoded line.
pub struct MetadataDocument {
    base: Metadata,
    filters: Vec<MetadataFilter>,
    encoded: Option<Bytes>,
}

impl MetadataDocument {
    pub fn new(base: Metadata) -> Self {
        Self {
            base,
            filters: Vec::new(),
            encoded: None,
        }
    }

    pub fn base(&self) -> &Metadata {
        &self.base
    }

    pub fn extend(&mut self, extension: MetadataExtension) {
        self.base.apply_extension(extension);
        self.encoded = None;
    }

    pub fn add_filter(&mut self, filter: MetadataFilter) {
        self.filters.push(filter);
        self.encoded = None;
    }

    /// The filtered document, filters run in registration order.
    pub fn filtered(&self) -> Metadata {
        let mut metadata = self.base.clone();
        for filter in &self.filters {
            filter(&mut metadata);
        }
        metadata
    }

    /// The `{"metadata":{...}}` line, encoded once and reused per request.
    pub fn line(&mut self) -> Result<Bytes, ClientError> {
        if let Some(line) = &self.encoded {
            return Ok(line.clone());
        }

        let mut buffer = Vec::with_capacity(512);
        buffer.extend_from_slice(b"{\"metadata\":");
        serde_json::to_writer(&mut buffer, &self.filtered())
            .map_err(|e| ClientError::Encoding(format!("metadata: {e}")))?;
        buffer.extend_from_slice(b"}\n");

        let line = Bytes::from(buffer);
        self.encoded = Some(line.clone());
        Ok(line)
    }
}

impl std::fmt::Debug for MetadataDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDocument")
            .field("base", &self.base)
            .field("filters", &self.filters.len())
            .field("encoded", &self.encoded.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> MetadataDocument {
        let mut service = ServiceInfo::new("checkout", "0.1.0");
        service.environment = Some("staging".to_string());
        MetadataDocument::new(Metadata::detect(service))
    }

    #[test]
    fn test_line_is_single_metadata_envelope() {
        let mut doc = document();
        let line = doc.line().unwrap();

        assert!(line.ends_with(b"\n"));
        let value: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["metadata"]["service"]["name"], "checkout");
        assert_eq!(value["metadata"]["service"]["environment"], "staging");
        assert_eq!(value["metadata"]["service"]["agent"]["name"], AGENT_NAME);
        assert_eq!(
            value["metadata"]["process"]["pid"],
            json!(std::process::id())
        );
    }

    #[test]
    fn test_filters_apply_in_order_and_invalidate_cache() {
        let mut doc = document();
        let before = doc.line().unwrap();

        doc.add_filter(Arc::new(|m: &mut Metadata| {
            m.labels.insert("team".to_string(), json!("payments"));
        }));
        doc.add_filter(Arc::new(|m: &mut Metadata| {
            m.labels.insert("team".to_string(), json!("platform"));
            m.process = None;
        }));

        let after = doc.line().unwrap();
        assert_ne!(before, after);

        let value: Value = serde_json::from_slice(&after).unwrap();
        assert_eq!(value["metadata"]["labels"]["team"], "platform");
        assert!(value["metadata"].get("process").is_none());
    }

    #[test]
    fn test_extension_merges_cloud_and_container() {
        let mut doc = document();
        doc.extend(MetadataExtension {
            cloud: Some(json!({"provider": "aws", "region": "eu-west-1"})),
            container: Some(json!({"id": "abc123"})),
            kubernetes: None,
        });

        let metadata = doc.filtered();
        assert_eq!(metadata.cloud.unwrap()["provider"], "aws");
        assert_eq!(
            metadata.system.unwrap().container.unwrap()["id"],
            "abc123"
        );
    }

    #[tokio::test]
    async fn test_mock_fetcher_feeds_extension() {
        let mut fetcher = MockCloudMetadataFetcher::new();
        fetcher.expect_fetch().times(1).returning(|| {
            Box::pin(async {
                Some(MetadataExtension {
                    cloud: Some(json!({"provider": "gcp"})),
                    ..Default::default()
                })
            })
        });

        let mut doc = document();
        if let Some(extension) = fetcher.fetch().await {
            doc.extend(extension);
        }
        assert_eq!(doc.base().cloud.as_ref().unwrap()["provider"], "gcp");
    }
}
