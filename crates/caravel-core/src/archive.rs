//! Interface to the host archive that owns the instances.
//!
//! The engine never interprets instance bytes; it only needs to read
//! them whole, hand reassembled ones back, and expand patient/study/
//! series handles into instance lists. [`RestArchive`] talks to a
//! co-located archive over its REST API; [`MemoryArchive`] backs tests
//! and embedded wiring.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use caravel_types::instance::content_md5;
use caravel_types::{CaravelError, Result};

/// Granularity of a resource handle submitted for transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceLevel {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceLevel {
    /// Path segment of the archive REST API listing a container's
    /// instances.
    fn route(&self) -> Result<&'static str> {
        match self {
            ResourceLevel::Patient => Ok("patients"),
            ResourceLevel::Study => Ok("studies"),
            ResourceLevel::Series => Ok("series"),
            ResourceLevel::Instance => Err(CaravelError::ParameterOutOfRange(
                "an instance is not a container resource".into(),
            )),
        }
    }
}

/// One resource handle of a transfer query:
/// `{"Level": "Study", "ID": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "Level")]
    pub level: ResourceLevel,
    #[serde(rename = "ID")]
    pub id: String,
}

/// The host archive, as seen by the transfer engine.
pub trait Archive: Send + Sync {
    /// Read the full content of one instance. Unknown ids fail with
    /// *unknown resource*.
    fn read_instance(&self, id: &str) -> Result<Vec<u8>>;

    /// Store a reassembled instance, returning the identifier the
    /// archive assigned to it.
    fn ingest_instance(&self, content: &[u8]) -> Result<String>;

    /// Expand a patient/study/series into the ids of its instances.
    fn expand_resource(&self, level: ResourceLevel, id: &str) -> Result<Vec<String>>;
}

/// Archive access over the host's REST API.
pub struct RestArchive {
    base_url: String,
    agent: ureq::Agent,
}

impl RestArchive {
    pub fn new(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, uri: &str) -> String {
        format!("{}{uri}", self.base_url)
    }

    fn read_body(response: ureq::Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(CaravelError::Io)?;
        Ok(body)
    }
}

impl Archive for RestArchive {
    fn read_instance(&self, id: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("/instances/{id}/file"));
        match self.agent.get(&url).call() {
            Ok(response) => Self::read_body(response),
            Err(ureq::Error::Status(404, _)) => Err(CaravelError::UnknownResource(format!(
                "no such instance in the archive: {id}"
            ))),
            Err(e) => Err(CaravelError::NetworkProtocol(format!(
                "archive GET {url}: {e}"
            ))),
        }
    }

    fn ingest_instance(&self, content: &[u8]) -> Result<String> {
        let url = self.url("/instances");
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(content)
            .map_err(|e| CaravelError::NetworkProtocol(format!("archive POST {url}: {e}")))?;

        let body = Self::read_body(response)?;
        let answer: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| CaravelError::NetworkProtocol(format!("archive ingest answer: {e}")))?;

        answer
            .get("ID")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CaravelError::NetworkProtocol("archive ingest answer carries no ID".into())
            })
    }

    fn expand_resource(&self, level: ResourceLevel, id: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("/{}/{id}/instances", level.route()?));
        let body = match self.agent.get(&url).call() {
            Ok(response) => Self::read_body(response)?,
            Err(ureq::Error::Status(404, _)) => {
                return Err(CaravelError::UnknownResource(format!(
                    "missing {:?} resource: {id}",
                    level
                )))
            }
            Err(e) => {
                return Err(CaravelError::NetworkProtocol(format!(
                    "archive GET {url}: {e}"
                )))
            }
        };

        let listing: Vec<serde_json::Value> = serde_json::from_slice(&body)
            .map_err(|e| CaravelError::NetworkProtocol(format!("archive listing: {e}")))?;

        listing
            .iter()
            .map(|item| {
                item.get("ID")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CaravelError::NetworkProtocol(
                            "archive listing entry carries no ID".into(),
                        )
                    })
            })
            .collect()
    }
}

/// In-memory archive used by tests and embedded deployments.
///
/// Ingested instances are content-addressed by their MD5 digest, which
/// keeps test assertions deterministic.
#[derive(Default)]
pub struct MemoryArchive {
    inner: Mutex<MemoryArchiveInner>,
}

#[derive(Default)]
struct MemoryArchiveInner {
    instances: BTreeMap<String, Vec<u8>>,
    containers: BTreeMap<(ResourceLevel, String), Vec<String>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under a fixed identifier.
    pub fn add_instance(&self, id: &str, content: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(id.to_string(), content.to_vec());
    }

    /// Declare a container resource holding the given instances.
    pub fn add_container(&self, level: ResourceLevel, id: &str, instances: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.insert(
            (level, id.to_string()),
            instances.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }

    pub fn instance_content(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().instances.get(id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().instances.keys().cloned().collect()
    }
}

impl Archive for MemoryArchive {
    fn read_instance(&self, id: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| {
                CaravelError::UnknownResource(format!("no such instance in the archive: {id}"))
            })
    }

    fn ingest_instance(&self, content: &[u8]) -> Result<String> {
        let id = content_md5(content);
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(id.clone(), content.to_vec());
        Ok(id)
    }

    fn expand_resource(&self, level: ResourceLevel, id: &str) -> Result<Vec<String>> {
        level.route()?;
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(&(level, id.to_string()))
            .cloned()
            .ok_or_else(|| CaravelError::UnknownResource(format!("missing {level:?}: {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_spec_wire_shape() {
        let spec: ResourceSpec =
            serde_json::from_str(r#"{"Level":"Study","ID":"abc"}"#).unwrap();
        assert_eq!(spec.level, ResourceLevel::Study);
        assert_eq!(spec.id, "abc");

        assert!(serde_json::from_str::<ResourceSpec>(r#"{"Level":"study","ID":"abc"}"#).is_err());
    }

    #[test]
    fn memory_archive_round_trip() {
        let archive = MemoryArchive::new();
        archive.add_instance("i1", b"one");
        archive.add_container(ResourceLevel::Series, "s1", &["i1"]);

        assert_eq!(archive.read_instance("i1").unwrap(), b"one");
        assert_eq!(
            archive.expand_resource(ResourceLevel::Series, "s1").unwrap(),
            vec!["i1".to_string()]
        );
        assert!(matches!(
            archive.read_instance("nope"),
            Err(CaravelError::UnknownResource(_))
        ));
        assert!(matches!(
            archive.expand_resource(ResourceLevel::Series, "nope"),
            Err(CaravelError::UnknownResource(_))
        ));
    }

    #[test]
    fn ingest_is_content_addressed() {
        let archive = MemoryArchive::new();
        let id = archive.ingest_instance(b"Hello").unwrap();
        assert_eq!(id, "8b1a9953c4611296a827abf8c47804d7");
        assert_eq!(archive.read_instance(&id).unwrap(), b"Hello");
    }

    #[test]
    fn instances_are_not_containers() {
        let archive = MemoryArchive::new();
        assert!(matches!(
            archive.expand_resource(ResourceLevel::Instance, "i1"),
            Err(CaravelError::ParameterOutOfRange(_))
        ));
    }
}
