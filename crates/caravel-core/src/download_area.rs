//! Staging area reassembling instances from incoming buckets.
//!
//! Each expected instance owns a pre-sized sparse temporary file.
//! Workers scatter bucket payloads into the files from any thread; on
//! commit every file is digest-checked against its descriptor and
//! handed to the host archive. Nothing reaches the archive before its
//! digest matches.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;
use tracing::{error, info};

use caravel_types::instance::content_md5;
use caravel_types::{BucketCompression, CaravelError, InstanceInfo, Result, TransferBucket};

use crate::archive::Archive;
use crate::compress::gzip_decompress;

struct InstanceSlot {
    info: InstanceInfo,
    file: File,
}

impl InstanceSlot {
    fn create(dir: &TempDir, info: InstanceInfo) -> Result<Self> {
        let file = tempfile::tempfile_in(dir.path())
            .map_err(|e| CaravelError::CannotWriteFile(format!("staging file: {e}")))?;

        // Pre-size a sparse, zero-initialised file so concurrent chunk
        // writes never grow it.
        file.set_len(info.size())
            .map_err(|e| CaravelError::CannotWriteFile(format!("staging file: {e}")))?;

        Ok(Self { info, file })
    }

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset
            .checked_add(data.len() as u64)
            .map_or(true, |end| end > self.info.size())
        {
            return Err(CaravelError::ParameterOutOfRange(format!(
                "chunk write out of bounds for instance {}",
                self.info.id()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_back(&mut self) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(self.info.size() as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut content)?;

        if content.len() as u64 != self.info.size() {
            return Err(CaravelError::Internal(format!(
                "staging file for {} has {} bytes, expected {}",
                self.info.id(),
                content.len(),
                self.info.size()
            )));
        }

        Ok(content)
    }

    /// Read the slot back and verify its digest. Returns the content
    /// for ingestion.
    fn verified_content(&mut self) -> Result<Vec<u8>> {
        let content = self.read_back()?;
        if content_md5(&content) != self.info.md5() {
            error!(instance = %self.info.id(), "bad MD5 sum in a transferred instance");
            return Err(CaravelError::CorruptedFile(format!(
                "bad MD5 sum in transferred instance {}",
                self.info.id()
            )));
        }
        Ok(content)
    }
}

/// Mapping `instance id → staging slot`, shared by the download workers.
pub struct DownloadArea {
    // Owns the backing directory for the slot files.
    _dir: TempDir,
    slots: Mutex<BTreeMap<String, InstanceSlot>>,
    total_size: u64,
}

impl DownloadArea {
    pub fn new(instances: &[InstanceInfo]) -> Result<Self> {
        let dir = TempDir::new()
            .map_err(|e| CaravelError::CannotWriteFile(format!("staging directory: {e}")))?;

        let mut slots = BTreeMap::new();
        let mut total_size = 0;

        for info in instances {
            total_size += info.size();
            slots.insert(info.id().to_string(), InstanceSlot::create(&dir, info.clone())?);
        }

        Ok(Self {
            _dir: dir,
            slots: Mutex::new(slots),
            total_size,
        })
    }

    /// Total number of bytes expected by this area.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Scatter one bucket payload across its instance slots,
    /// decompressing it first if needed.
    pub fn write_bucket(
        &self,
        bucket: &TransferBucket,
        payload: &[u8],
        compression: BucketCompression,
    ) -> Result<()> {
        let mut slots = self.lock();

        match compression {
            BucketCompression::None => Self::write_uncompressed(&mut slots, bucket, payload),
            BucketCompression::Gzip => {
                let inflated = gzip_decompress(payload, bucket.total_size())?;
                Self::write_uncompressed(&mut slots, bucket, &inflated)
            }
        }
    }

    fn write_uncompressed(
        slots: &mut BTreeMap<String, InstanceSlot>,
        bucket: &TransferBucket,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() as u64 != bucket.total_size() {
            return Err(CaravelError::NetworkProtocol(format!(
                "bucket payload of {} bytes does not match the announced {}",
                payload.len(),
                bucket.total_size()
            )));
        }

        let mut position = 0usize;

        for chunk in bucket.chunks() {
            let end = position
                .checked_add(chunk.size as usize)
                .filter(|end| *end <= payload.len())
                .ok_or_else(|| {
                    CaravelError::Internal("bucket chunks exceed the payload".into())
                })?;

            let slot = slots.get_mut(&chunk.instance_id).ok_or_else(|| {
                CaravelError::UnknownResource(format!(
                    "bucket references unknown instance {}",
                    chunk.instance_id
                ))
            })?;
            slot.write_chunk(chunk.offset, &payload[position..end])?;

            position = end;
        }

        Ok(())
    }

    /// Write one whole instance, verifying its size and digest against
    /// the descriptor first.
    pub fn write_instance(&self, instance_id: &str, content: &[u8]) -> Result<()> {
        let md5 = content_md5(content);

        let mut slots = self.lock();
        let slot = slots.get_mut(instance_id).ok_or_else(|| {
            CaravelError::CorruptedFile(format!("unexpected instance {instance_id}"))
        })?;

        if slot.info.size() != content.len() as u64 || slot.info.md5() != md5 {
            return Err(CaravelError::CorruptedFile(format!(
                "instance {instance_id} does not match its descriptor"
            )));
        }

        slot.write_chunk(0, content)
    }

    /// Verify every slot against its descriptor without touching the
    /// host archive. Slots are left in place.
    pub fn check_md5(&self) -> Result<()> {
        info!("checking MD5 sums of the download area without committing");

        let mut slots = self.lock();
        for slot in slots.values_mut() {
            slot.verified_content()?;
        }
        Ok(())
    }

    /// Digest-check every slot and hand it to the host archive.
    ///
    /// Slots are removed as they are ingested, so a committed area is
    /// empty and committing it again is a no-op. A digest or archive
    /// failure aborts the commit with the remaining slots intact.
    pub fn commit(&self, archive: &dyn Archive) -> Result<()> {
        info!("importing transferred instances from the download area into the archive");

        let mut slots = self.lock();
        while let Some(id) = slots.keys().next().cloned() {
            let slot = slots.get_mut(&id).expect("key just listed");
            let content = slot.verified_content()?;

            archive.ingest_instance(&content).map_err(|e| {
                error!(instance = %id, "cannot import a transferred instance: {e}");
                CaravelError::CorruptedFile(format!(
                    "cannot import transferred instance {id}: {e}"
                ))
            })?;

            slots.remove(&id);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, InstanceSlot>> {
        self.slots.lock().unwrap()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Any partition of an instance into disjoint single-chunk
        /// buckets, written concurrently in arbitrary order, reassembles
        /// the exact content.
        #[test]
        fn concurrent_bucket_writes_reassemble(
            cuts in proptest::collection::btree_set(1u64..2047, 0..12),
            seed in any::<u64>(),
        ) {
            let content: Vec<u8> = (0..2048u64)
                .map(|i| (i.wrapping_mul(seed) >> 3) as u8)
                .collect();
            let info = InstanceInfo::from_content("x", &content);
            let area = Arc::new(DownloadArea::new(std::slice::from_ref(&info)).unwrap());

            let mut bounds: Vec<u64> = Vec::new();
            bounds.push(0);
            bounds.extend(cuts.iter().copied());
            bounds.push(2048);

            let handles: Vec<_> = bounds
                .windows(2)
                .map(|range| {
                    let (start, end) = (range[0], range[1]);
                    let area = Arc::clone(&area);
                    let info = info.clone();
                    let piece = content[start as usize..end as usize].to_vec();
                    std::thread::spawn(move || {
                        let mut bucket = TransferBucket::new();
                        bucket.add_chunk(&info, start, end - start).unwrap();
                        area.write_bucket(&bucket, &piece, BucketCompression::None)
                            .unwrap();
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            area.check_md5().unwrap();
        }
    }
}
