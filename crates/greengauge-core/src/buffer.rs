//! Session-scoped sample buffer.
//!
//! Samples are kept in one partition per open session, keyed by
//! [`SessionKey`]. Closing one device's session never touches another
//! partition, so concurrent sessions on different devices cannot corrupt
//! each other's averages.
//!
//! A partition moves through three states:
//! 1. open: [`SampleBuffer::append`] succeeds.
//! 2. sealed: appends are rejected, [`SampleBuffer::drain`] still reads.
//! 3. cleared: the partition no longer exists.
//!
//! The pipeline seals before it drains, so a poll that lands after close
//! starts is rejected rather than silently lost or double counted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{PipelineError, Result};
use crate::ids::{DeviceId, SessionKey};
use crate::sample::Sample;

#[derive(Debug)]
struct Partition {
    device_id: DeviceId,
    samples: Vec<Sample>,
    sealed: bool,
}

/// Thread-safe store of raw samples for every open session.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    partitions: Mutex<HashMap<SessionKey, Partition>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Partition>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the partition for `key`. Re-opening an existing partition for
    /// the same device is a no-op.
    pub fn open(&self, key: SessionKey, device_id: DeviceId) -> Result<()> {
        let mut partitions = self.lock();
        match partitions.get(&key) {
            Some(p) if p.device_id != device_id => Err(PipelineError::validation(
                "device_id",
                format!("session {key} belongs to {}", p.device_id),
            )),
            Some(_) => Ok(()),
            None => {
                partitions.insert(
                    key,
                    Partition {
                        device_id,
                        samples: Vec::new(),
                        sealed: false,
                    },
                );
                Ok(())
            }
        }
    }

    /// Append one sample to an open partition.
    pub fn append(&self, key: SessionKey, sample: Sample) -> Result<()> {
        let mut partitions = self.lock();
        let partition = partitions
            .get_mut(&key)
            .filter(|p| !p.sealed)
            .ok_or(PipelineError::SessionNotOpen(key))?;
        if partition.device_id != sample.device_id {
            return Err(PipelineError::validation(
                "device_id",
                format!(
                    "sample from {} cannot join session of {}",
                    sample.device_id, partition.device_id
                ),
            ));
        }
        partition.samples.push(sample);
        Ok(())
    }

    /// Stop accepting samples for `key`. Idempotent.
    pub fn seal(&self, key: SessionKey) -> Result<()> {
        let mut partitions = self.lock();
        let partition = partitions
            .get_mut(&key)
            .ok_or(PipelineError::SessionNotOpen(key))?;
        partition.sealed = true;
        Ok(())
    }

    /// All samples of `key`, ordered by capture time. Equal timestamps keep
    /// insertion order. The partition is left in place.
    pub fn drain(&self, key: SessionKey) -> Result<Vec<Sample>> {
        let partitions = self.lock();
        let partition = partitions
            .get(&key)
            .ok_or(PipelineError::SessionNotOpen(key))?;
        let mut samples = partition.samples.clone();
        samples.sort_by_key(|s| s.captured_at_ms);
        Ok(samples)
    }

    /// Remove the partition for `key`. Returns how many samples it held.
    pub fn clear(&self, key: SessionKey) -> usize {
        self.lock()
            .remove(&key)
            .map_or(0, |p| p.samples.len())
    }

    /// Drop the samples of an open partition and keep it open.
    pub fn truncate(&self, key: SessionKey) -> Result<usize> {
        let mut partitions = self.lock();
        let partition = partitions
            .get_mut(&key)
            .filter(|p| !p.sealed)
            .ok_or(PipelineError::SessionNotOpen(key))?;
        let removed = partition.samples.len();
        partition.samples.clear();
        Ok(removed)
    }

    /// Remove every partition belonging to `device_id`.
    pub fn clear_device(&self, device_id: DeviceId) -> usize {
        let mut removed = 0;
        self.lock().retain(|_, p| {
            if p.device_id == device_id {
                removed += p.samples.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every partition. This is the unscoped legacy clear; the
    /// pipeline never calls it.
    pub fn clear_all(&self) -> usize {
        let mut partitions = self.lock();
        let removed = partitions.values().map(|p| p.samples.len()).sum();
        partitions.clear();
        removed
    }

    /// Samples currently held for `key` (0 if unknown).
    pub fn len(&self, key: SessionKey) -> usize {
        self.lock().get(&key).map_or(0, |p| p.samples.len())
    }

    /// Whether `key` exists and still accepts samples.
    pub fn is_open(&self, key: SessionKey) -> bool {
        self.lock().get(&key).is_some_and(|p| !p.sealed)
    }

    /// Number of live partitions.
    pub fn partition_count(&self) -> usize {
        self.lock().len()
    }
}
