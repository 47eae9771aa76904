//! Persistence for users, devices, session aggregates and emission records.
//!
//! The pipeline talks to storage only through [`SessionStore`]. Two backends
//! ship with the crate:
//! - [`MemoryStore`]: a mutex-guarded snapshot, for tests and short runs.
//! - [`FileStore`]: the same snapshot, mirrored to a JSON file after every
//!   mutation and reloaded on open.
//!
//! The store is where session ids are minted and where the emission
//! correlation rules are enforced, so both backends share one
//! [`StoreSnapshot`] implementation of those rules.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::aggregate::{NewAggregate, SessionAggregate, SessionStatus};
use crate::emissions::{EmissionRecord, ManufacturingEmissionProfile, UsageEstimate};
use crate::error::StoreError;
use crate::ids::{DeviceId, SessionId, UserId};
use crate::sample::now_ms;

type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDevice {
    pub user_id: UserId,
    pub kind: String,
    pub manufacturer: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub kind: String,
    pub manufacturer: String,
    pub model: String,
    #[serde(default)]
    pub manufacturing: Option<ManufacturingEmissionProfile>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage backend for the session pipeline.
///
/// Methods are synchronous and short; callers on an async runtime may call
/// them directly.
pub trait SessionStore: Send + Sync {
    fn insert_user(&self, username: &str) -> StoreResult<UserId>;
    fn users(&self) -> StoreResult<Vec<User>>;

    fn insert_device(&self, device: NewDevice) -> StoreResult<DeviceId>;
    fn device(&self, id: DeviceId) -> StoreResult<Option<Device>>;
    fn devices_for_user(&self, user: UserId) -> StoreResult<Vec<Device>>;
    fn devices(&self) -> StoreResult<Vec<Device>>;
    fn set_manufacturing(&self, profile: ManufacturingEmissionProfile) -> StoreResult<()>;

    /// Persist a new aggregate as [`SessionStatus::Pending`] and return the
    /// id assigned to it.
    fn insert_aggregate(&self, aggregate: NewAggregate) -> StoreResult<SessionId>;
    fn aggregate(&self, id: SessionId) -> StoreResult<Option<SessionAggregate>>;
    /// Most recently created aggregate, ties broken by the higher id.
    fn latest_aggregate(&self) -> StoreResult<Option<SessionAggregate>>;
    /// Every aggregate, ascending by creation time then id.
    fn aggregates(&self) -> StoreResult<Vec<SessionAggregate>>;
    /// Aggregates of one user's device, ascending by creation time then id.
    fn aggregates_for(&self, user: UserId, device: DeviceId) -> StoreResult<Vec<SessionAggregate>>;
    fn pending_aggregates(&self) -> StoreResult<Vec<SessionAggregate>>;
    fn mark_complete(&self, id: SessionId) -> StoreResult<()>;

    /// Attach an emission record to its aggregate.
    ///
    /// Fails with [`StoreError::NotFound`] if the aggregate does not exist,
    /// and with [`StoreError::Conflict`] if the device or user disagree with
    /// the aggregate, or the session already has an emission record.
    fn insert_emission(&self, record: EmissionRecord) -> StoreResult<()>;
    fn emission_for(&self, id: SessionId) -> StoreResult<Option<EmissionRecord>>;

    fn insert_usage_estimate(&self, estimate: UsageEstimate) -> StoreResult<()>;
    fn usage_estimates(&self) -> StoreResult<Vec<UsageEstimate>>;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Full store contents. This is also the on-disk format of [`FileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    aggregates: Vec<SessionAggregate>,
    #[serde(default)]
    emissions: Vec<EmissionRecord>,
    #[serde(default)]
    usage_estimates: Vec<UsageEstimate>,
    #[serde(default)]
    next_user: u64,
    #[serde(default)]
    next_device: u64,
    #[serde(default)]
    next_session: u64,
}

fn next_id(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn by_creation(a: &SessionAggregate, b: &SessionAggregate) -> std::cmp::Ordering {
    (a.created_at_ms, a.session_id).cmp(&(b.created_at_ms, b.session_id))
}

impl StoreSnapshot {
    fn insert_user(&mut self, username: &str) -> StoreResult<UserId> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::Conflict("username must not be empty".into()));
        }
        if self.users.iter().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!("username '{username}' is taken")));
        }
        let user_id = UserId(next_id(&mut self.next_user));
        self.users.push(User {
            user_id,
            username: username.to_string(),
        });
        Ok(user_id)
    }

    fn insert_device(&mut self, device: NewDevice) -> StoreResult<DeviceId> {
        if !self.users.iter().any(|u| u.user_id == device.user_id) {
            return Err(StoreError::NotFound(device.user_id.to_string()));
        }
        let device_id = DeviceId(next_id(&mut self.next_device));
        self.devices.push(Device {
            device_id,
            user_id: device.user_id,
            kind: device.kind,
            manufacturer: device.manufacturer,
            model: device.model.trim().to_string(),
            manufacturing: None,
        });
        Ok(device_id)
    }

    fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_id == id)
    }

    fn set_manufacturing(&mut self, profile: ManufacturingEmissionProfile) -> StoreResult<()> {
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.device_id == profile.device_id)
            .ok_or_else(|| StoreError::NotFound(profile.device_id.to_string()))?;
        device.manufacturing = Some(profile);
        Ok(())
    }

    fn insert_aggregate(&mut self, aggregate: NewAggregate) -> StoreResult<SessionId> {
        let session_id = SessionId(next_id(&mut self.next_session));
        // Creation time never runs backwards relative to the previous row.
        let floor = self.aggregates.last().map_or(0, |a| a.created_at_ms);
        self.aggregates.push(SessionAggregate {
            session_id,
            device_id: aggregate.device_id,
            user_id: aggregate.user_id,
            avg_current: aggregate.avg_current,
            avg_voltage: aggregate.avg_voltage,
            avg_power: aggregate.avg_power,
            avg_energy: aggregate.avg_energy,
            elapsed_seconds: aggregate.elapsed_seconds,
            created_at_ms: now_ms().max(floor),
            status: SessionStatus::Pending,
        });
        Ok(session_id)
    }

    fn aggregate(&self, id: SessionId) -> Option<&SessionAggregate> {
        self.aggregates.iter().find(|a| a.session_id == id)
    }

    fn sorted_aggregates(&self, keep: impl Fn(&SessionAggregate) -> bool) -> Vec<SessionAggregate> {
        let mut out: Vec<SessionAggregate> =
            self.aggregates.iter().filter(|a| keep(a)).cloned().collect();
        out.sort_by(by_creation);
        out
    }

    fn mark_complete(&mut self, id: SessionId) -> StoreResult<()> {
        let aggregate = self
            .aggregates
            .iter_mut()
            .find(|a| a.session_id == id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        aggregate.status = SessionStatus::Complete;
        Ok(())
    }

    fn insert_emission(&mut self, record: EmissionRecord) -> StoreResult<()> {
        let aggregate = self
            .aggregate(record.session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", record.session_id)))?;
        if aggregate.device_id != record.device_id || aggregate.user_id != record.user_id {
            return Err(StoreError::Conflict(format!(
                "session {} belongs to {} of {}",
                record.session_id, aggregate.device_id, aggregate.user_id
            )));
        }
        if self.emissions.iter().any(|e| e.session_id == record.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} already has an emission record",
                record.session_id
            )));
        }
        self.emissions.push(record);
        Ok(())
    }

    fn emission_for(&self, id: SessionId) -> Option<&EmissionRecord> {
        self.emissions.iter().find(|e| e.session_id == id)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        lock(&self.state).clone()
    }
}

fn lock(state: &Mutex<StoreSnapshot>) -> MutexGuard<'_, StoreSnapshot> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Implements the read half of [`SessionStore`] over a snapshot accessor.
macro_rules! snapshot_reads {
    () => {
        fn users(&self) -> StoreResult<Vec<User>> {
            Ok(self.read().users.clone())
        }

        fn device(&self, id: DeviceId) -> StoreResult<Option<Device>> {
            Ok(self.read().device(id).cloned())
        }

        fn devices_for_user(&self, user: UserId) -> StoreResult<Vec<Device>> {
            Ok(self
                .read()
                .devices
                .iter()
                .filter(|d| d.user_id == user)
                .cloned()
                .collect())
        }

        fn devices(&self) -> StoreResult<Vec<Device>> {
            Ok(self.read().devices.clone())
        }

        fn aggregate(&self, id: SessionId) -> StoreResult<Option<SessionAggregate>> {
            Ok(self.read().aggregate(id).cloned())
        }

        fn latest_aggregate(&self) -> StoreResult<Option<SessionAggregate>> {
            Ok(self.read().aggregates.iter().max_by(|a, b| by_creation(a, b)).cloned())
        }

        fn aggregates(&self) -> StoreResult<Vec<SessionAggregate>> {
            Ok(self.read().sorted_aggregates(|_| true))
        }

        fn aggregates_for(
            &self,
            user: UserId,
            device: DeviceId,
        ) -> StoreResult<Vec<SessionAggregate>> {
            Ok(self
                .read()
                .sorted_aggregates(|a| a.user_id == user && a.device_id == device))
        }

        fn pending_aggregates(&self) -> StoreResult<Vec<SessionAggregate>> {
            Ok(self
                .read()
                .sorted_aggregates(|a| a.status == SessionStatus::Pending))
        }

        fn emission_for(&self, id: SessionId) -> StoreResult<Option<EmissionRecord>> {
            Ok(self.read().emission_for(id).cloned())
        }

        fn usage_estimates(&self) -> StoreResult<Vec<UsageEstimate>> {
            Ok(self.read().usage_estimates.clone())
        }
    };
}

impl MemoryStore {
    fn read(&self) -> MutexGuard<'_, StoreSnapshot> {
        lock(&self.state)
    }
}

impl SessionStore for MemoryStore {
    snapshot_reads!();

    fn insert_user(&self, username: &str) -> StoreResult<UserId> {
        lock(&self.state).insert_user(username)
    }

    fn insert_device(&self, device: NewDevice) -> StoreResult<DeviceId> {
        lock(&self.state).insert_device(device)
    }

    fn set_manufacturing(&self, profile: ManufacturingEmissionProfile) -> StoreResult<()> {
        lock(&self.state).set_manufacturing(profile)
    }

    fn insert_aggregate(&self, aggregate: NewAggregate) -> StoreResult<SessionId> {
        lock(&self.state).insert_aggregate(aggregate)
    }

    fn mark_complete(&self, id: SessionId) -> StoreResult<()> {
        lock(&self.state).mark_complete(id)
    }

    fn insert_emission(&self, record: EmissionRecord) -> StoreResult<()> {
        lock(&self.state).insert_emission(record)
    }

    fn insert_usage_estimate(&self, estimate: UsageEstimate) -> StoreResult<()> {
        lock(&self.state).usage_estimates.push(estimate);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// JSON-file backed store.
///
/// Every mutation is applied to a copy of the snapshot, the copy is written
/// to disk, and only then does it replace the in-memory state. A failed write
/// therefore leaves both the file and memory as they were before the call.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreSnapshot>,
}

impl FileStore {
    /// Open `path`, loading it if it exists. A missing file starts empty and
    /// is created on the first mutation.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            StoreSnapshot::default()
        };
        log::debug!("opened store at {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> MutexGuard<'_, StoreSnapshot> {
        lock(&self.state)
    }

    fn commit<T>(&self, op: impl FnOnce(&mut StoreSnapshot) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = lock(&self.state);
        let mut next = state.clone();
        let out = op(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    snapshot_reads!();

    fn insert_user(&self, username: &str) -> StoreResult<UserId> {
        self.commit(|s| s.insert_user(username))
    }

    fn insert_device(&self, device: NewDevice) -> StoreResult<DeviceId> {
        self.commit(|s| s.insert_device(device))
    }

    fn set_manufacturing(&self, profile: ManufacturingEmissionProfile) -> StoreResult<()> {
        self.commit(|s| s.set_manufacturing(profile))
    }

    fn insert_aggregate(&self, aggregate: NewAggregate) -> StoreResult<SessionId> {
        self.commit(|s| s.insert_aggregate(aggregate))
    }

    fn mark_complete(&self, id: SessionId) -> StoreResult<()> {
        self.commit(|s| s.mark_complete(id))
    }

    fn insert_emission(&self, record: EmissionRecord) -> StoreResult<()> {
        self.commit(|s| s.insert_emission(record))
    }

    fn insert_usage_estimate(&self, estimate: UsageEstimate) -> StoreResult<()> {
        self.commit(|s| {
            s.usage_estimates.push(estimate);
            Ok(())
        })
    }
}
