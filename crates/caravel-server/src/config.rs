use std::collections::BTreeMap;

use serde::Deserialize;

use caravel_core::{PeerConfig, TransfersConfig};

fn default_listen() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Top-level TOML configuration of a caravel node.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub archive: ArchiveSection,

    #[serde(default)]
    pub transfers: TransfersConfig,

    /// Known peers: `[peers.<name>]` tables with `Url` and an optional
    /// `RemoteSelf`.
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_format: default_log_format(),
        }
    }
}

/// Where the host archive lives. Without a URL the node runs on a
/// private in-memory archive, which is only useful for testing.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSection {
    pub url: Option<String>,
}
