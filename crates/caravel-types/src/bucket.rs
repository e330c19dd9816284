use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::compression::BucketCompression;
use crate::error::{CaravelError, Result};
use crate::instance::InstanceInfo;
use crate::{wire, URI_CHUNKS};

/// A contiguous byte range within one instance.
///
/// Wire shape: `{"ID": "...", "Offset": "<decimal>", "Size": "<decimal>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(rename = "ID")]
    pub instance_id: String,

    #[serde(rename = "Offset", with = "wire::u64_string")]
    pub offset: u64,

    #[serde(rename = "Size", with = "wire::u64_string")]
    pub size: u64,
}

/// An ordered, non-empty set of chunks transferred as a single HTTP
/// request.
///
/// Invariants maintained by [`TransferBucket::add_chunk`]:
/// only the first chunk may start at a non-zero offset, and once a
/// non-first chunk covers less than its whole instance the bucket is
/// sealed against further additions. This keeps the bucket expressible
/// as one contiguous byte walk on the sending side.
#[derive(Debug, Clone)]
pub struct TransferBucket {
    chunks: Vec<Chunk>,
    total_size: u64,
    extensible: bool,
}

impl Default for TransferBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferBucket {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            total_size: 0,
            extensible: true,
        }
    }

    /// Rebuild a bucket from deserialised chunks. The bucket is sealed.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        let total_size = chunks.iter().map(|c| c.size).sum();
        Self {
            chunks,
            total_size,
            extensible: false,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> Result<&Chunk> {
        self.chunks.get(index).ok_or_else(|| {
            CaravelError::ParameterOutOfRange(format!(
                "no chunk {index} in a bucket of {}",
                self.chunks.len()
            ))
        })
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_size = 0;
        self.extensible = true;
    }

    /// Append a byte range of `instance` to the bucket.
    ///
    /// Empty chunks are ignored. Out-of-bounds ranges and a non-zero
    /// offset on a non-first chunk are rejected; adding to a sealed
    /// bucket is a sequence error.
    pub fn add_chunk(&mut self, instance: &InstanceInfo, offset: u64, size: u64) -> Result<()> {
        if offset.checked_add(size).map_or(true, |end| end > instance.size()) {
            return Err(CaravelError::ParameterOutOfRange(format!(
                "chunk {offset}+{size} exceeds instance {} of size {}",
                instance.id(),
                instance.size()
            )));
        }

        if !self.extensible {
            return Err(CaravelError::BadSequenceOfCalls(
                "cannot add a new chunk after a truncated instance".into(),
            ));
        }

        if !self.chunks.is_empty() && offset != 0 {
            return Err(CaravelError::ParameterOutOfRange(
                "only the first chunk of a bucket can have a non-zero offset".into(),
            ));
        }

        if size == 0 {
            return Ok(());
        }

        if !self.chunks.is_empty() && size != instance.size() {
            // An incomplete instance must be the last chunk
            self.extensible = false;
        }

        self.chunks.push(Chunk {
            instance_id: instance.id().to_string(),
            offset,
            size,
        });
        self.total_size += size;

        Ok(())
    }

    /// Format the GET URI fetching this bucket from a peer:
    /// `/transfers/chunks/<id1>.<id2>...?offset=<o>&size=<s>&compression=<c>`.
    pub fn pull_uri(&self, compression: BucketCompression) -> Result<String> {
        let first = self
            .chunks
            .first()
            .ok_or_else(|| CaravelError::Internal("pull URI of an empty bucket".into()))?;

        debug_assert!(self.chunks[1..].iter().all(|c| c.offset == 0));

        let ids = self
            .chunks
            .iter()
            .map(|c| c.instance_id.as_str())
            .collect::<Vec<_>>()
            .join(".");

        Ok(format!(
            "{URI_CHUNKS}/{ids}?offset={}&size={}&compression={compression}",
            first.offset, self.total_size
        ))
    }
}

impl Serialize for TransferBucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.chunks.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransferBucket {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_chunks(Vec::<Chunk>::deserialize(deserializer)?))
    }
}
