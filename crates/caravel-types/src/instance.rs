use serde::{Deserialize, Serialize};

use crate::wire;

/// Compute the lowercase hex MD5 digest of a byte buffer.
pub fn content_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Immutable descriptor of one archived instance: opaque identifier,
/// byte length, and MD5 digest over the full content.
///
/// Wire shape: `{"ID": "...", "Size": "<decimal>", "MD5": "<32 hex>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    #[serde(rename = "ID")]
    id: String,

    #[serde(rename = "Size", with = "wire::u64_string")]
    size: u64,

    #[serde(rename = "MD5")]
    md5: String,
}

impl InstanceInfo {
    pub fn new(id: impl Into<String>, size: u64, md5: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            size,
            md5: md5.into(),
        }
    }

    /// Build a descriptor for freshly loaded content, digesting it.
    pub fn from_content(id: impl Into<String>, content: &[u8]) -> Self {
        Self {
            id: id.into(),
            size: content.len() as u64,
            md5: content_md5(content),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }
}
