use serde::{Deserialize, Serialize};

use caravel_types::{BucketCompression, CaravelError, Result};

use crate::archive::ResourceSpec;

/// Input of a transfer job: which resources to move, to or from which
/// peer, and how. This is also the persisted form of a job.
///
/// `Originator` is the node identifier of the transfer initiator, used
/// to detect cross-talk in pull-initiated sends. Peers that are not
/// configured with `RemoteSelf` never send one, and such pulls are
/// accepted without originator validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferQuery {
    #[serde(rename = "Peer")]
    peer: String,

    #[serde(rename = "Resources")]
    resources: Vec<ResourceSpec>,

    #[serde(rename = "Compression")]
    compression: BucketCompression,

    #[serde(rename = "Originator", default, skip_serializing_if = "Option::is_none")]
    originator: Option<String>,

    // Job priority is consumed at submission time and not persisted.
    #[serde(rename = "Priority", default, skip_serializing)]
    priority: i32,
}

impl TransferQuery {
    pub fn new(
        peer: impl Into<String>,
        resources: Vec<ResourceSpec>,
        compression: BucketCompression,
    ) -> Self {
        Self {
            peer: peer.into(),
            resources,
            compression,
            originator: None,
            priority: 0,
        }
    }

    /// Parse a query from a JSON body.
    pub fn parse(body: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(body.clone())
            .map_err(|e| CaravelError::BadFileFormat(format!("invalid transfer query: {e}")))
    }

    pub fn serialized(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("a transfer query always serialises")
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }

    pub fn resources_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.resources).expect("resource specs always serialise")
    }

    pub fn compression(&self) -> BucketCompression {
        self.compression
    }

    pub fn originator(&self) -> Option<&str> {
        self.originator.as_deref()
    }

    pub fn with_originator(mut self, originator: impl Into<String>) -> Self {
        self.originator = Some(originator.into());
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}
