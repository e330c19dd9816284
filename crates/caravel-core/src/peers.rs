//! Directory of remote peers and the synchronous HTTP client used by
//! the transfer workers.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use caravel_types::{CaravelError, Result};

/// One configured peer. `RemoteSelf` is the name under which the peer
/// knows *this* node; configuring it enables pull-initiated sends and
/// originator validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PeerConfig {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_self: Option<String>,
}

/// Symbolic peer names resolving to base URLs.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<String, PeerConfig>,
}

impl PeerDirectory {
    pub fn new(peers: BTreeMap<String, PeerConfig>) -> Self {
        Self { peers }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PeerConfig> {
        self.peers.get(name)
    }

    /// Base URL of a peer, without a trailing slash.
    pub fn url(&self, name: &str) -> Result<String> {
        self.peers
            .get(name)
            .map(|peer| peer.url.trim_end_matches('/').to_string())
            .ok_or_else(|| CaravelError::UnknownResource(format!("unknown peer: {name}")))
    }

    /// The name under which `name` knows this node, if configured.
    pub fn remote_self(&self, name: &str) -> Option<&str> {
        self.peers.get(name).and_then(|p| p.remote_self.as_deref())
    }
}

/// Synchronous HTTP client over the peer directory. Cheap to clone;
/// the underlying agent pools connections across worker threads.
#[derive(Clone)]
pub struct Peers {
    inner: Arc<PeersInner>,
}

struct PeersInner {
    agent: ureq::Agent,
    directory: PeerDirectory,
}

impl Peers {
    pub fn new(directory: PeerDirectory) -> Self {
        Self::with_timeouts(directory, Duration::from_secs(30), Duration::from_secs(300))
    }

    /// Client with tight timeouts, for liveness probes.
    pub fn with_timeouts(directory: PeerDirectory, connect: Duration, exchange: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(exchange)
            .timeout_write(exchange)
            .build();

        Self {
            inner: Arc::new(PeersInner { agent, directory }),
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.inner.directory
    }

    fn request_url(&self, peer: &str, uri: &str) -> Result<String> {
        Ok(format!("{}{uri}", self.inner.directory.url(peer)?))
    }

    fn read_body(response: ureq::Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(CaravelError::Io)?;
        Ok(body)
    }

    fn http_error(peer: &str, uri: &str, error: ureq::Error) -> CaravelError {
        CaravelError::NetworkProtocol(format!("peer '{peer}' on {uri}: {error}"))
    }

    pub fn do_get(&self, peer: &str, uri: &str) -> Result<Vec<u8>> {
        let url = self.request_url(peer, uri)?;
        let response = self
            .inner
            .agent
            .get(&url)
            .call()
            .map_err(|e| Self::http_error(peer, uri, e))?;
        Self::read_body(response)
    }

    pub fn do_post(&self, peer: &str, uri: &str, body: &[u8]) -> Result<Vec<u8>> {
        let url = self.request_url(peer, uri)?;
        let response = self
            .inner
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_bytes(body)
            .map_err(|e| Self::http_error(peer, uri, e))?;
        Self::read_body(response)
    }

    pub fn do_put(&self, peer: &str, uri: &str, body: &[u8]) -> Result<()> {
        let url = self.request_url(peer, uri)?;
        self.inner
            .agent
            .put(&url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(body)
            .map_err(|e| Self::http_error(peer, uri, e))?;
        Ok(())
    }

    pub fn do_delete(&self, peer: &str, uri: &str) -> Result<()> {
        let url = self.request_url(peer, uri)?;
        self.inner
            .agent
            .delete(&url)
            .call()
            .map_err(|e| Self::http_error(peer, uri, e))?;
        Ok(())
    }
}

/// Delay between attempts of the coarse-grained retry helpers below and
/// of the work queue.
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(1);

/// POST to a peer, retrying transient failures, and parse the JSON
/// answer. Returns `None` once the retry budget is exhausted.
pub fn post_peer_with_retry(
    peers: &Peers,
    peer: &str,
    uri: &str,
    body: &[u8],
    max_retries: u32,
) -> Option<serde_json::Value> {
    let mut attempt = 0;
    loop {
        match peers.do_post(peer, uri, body) {
            Ok(answer) => match serde_json::from_slice(&answer) {
                Ok(value) => return Some(value),
                Err(e) => warn!(peer, uri, "peer answered malformed JSON: {e}"),
            },
            Err(e) => warn!(peer, uri, "HTTP query to peer failed: {e}"),
        }

        if attempt >= max_retries {
            return None;
        }
        attempt += 1;
        std::thread::sleep(RETRY_DELAY);
    }
}

/// DELETE on a peer, retrying transient failures.
pub fn delete_peer_with_retry(peers: &Peers, peer: &str, uri: &str, max_retries: u32) -> bool {
    let mut attempt = 0;
    loop {
        match peers.do_delete(peer, uri) {
            Ok(()) => return true,
            Err(e) => warn!(peer, uri, "HTTP DELETE to peer failed: {e}"),
        }

        if attempt >= max_retries {
            return false;
        }
        attempt += 1;
        std::thread::sleep(RETRY_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> PeerDirectory {
        let mut peers = BTreeMap::new();
        peers.insert(
            "alice".to_string(),
            PeerConfig {
                url: "http://alice.example:8042/".to_string(),
                remote_self: Some("bob".to_string()),
            },
        );
        peers.insert(
            "carol".to_string(),
            PeerConfig {
                url: "http://carol.example".to_string(),
                remote_self: None,
            },
        );
        PeerDirectory::new(peers)
    }

    #[test]
    fn urls_are_normalised() {
        let directory = directory();
        assert_eq!(directory.url("alice").unwrap(), "http://alice.example:8042");
        assert_eq!(directory.url("carol").unwrap(), "http://carol.example");
        assert!(matches!(
            directory.url("mallory"),
            Err(CaravelError::UnknownResource(_))
        ));
    }

    #[test]
    fn remote_self_is_optional() {
        let directory = directory();
        assert_eq!(directory.remote_self("alice"), Some("bob"));
        assert_eq!(directory.remote_self("carol"), None);
    }

    #[test]
    fn peer_config_uses_wire_key_names() {
        let peer: PeerConfig = serde_json::from_str(
            r#"{"Url": "http://n1.example", "RemoteSelf": "me"}"#,
        )
        .unwrap();
        assert_eq!(peer.url, "http://n1.example");
        assert_eq!(peer.remote_self.as_deref(), Some("me"));

        assert!(serde_json::from_str::<PeerConfig>(r#"{"url": "http://n1.example"}"#).is_err());
    }
}
