//! Session orchestration: open, poll, close, resume.
//!
//! Lifecycle of one monitoring session:
//! 1. [`SessionPipeline::open_session`] mints a [`SessionKey`], opens a buffer
//!    partition and records the wall-clock start. A device has at most one
//!    open session at a time.
//! 2. Samples arrive through [`SessionPipeline::record_sample`] or from a poll
//!    task started by [`SessionPipeline::open_polled_session`].
//! 3. [`SessionPipeline::close_session`] stops the poller, seals and drains
//!    the partition, persists the aggregate, then records its emission under
//!    the session id the store just assigned.
//!
//! Persisting the aggregate and recording its emission are two writes. The
//! aggregate is written `Pending` and only marked `Complete` once the emission
//! exists. If the second write fails the caller gets
//! [`PipelineError::Incomplete`] carrying the session id, and
//! [`SessionPipeline::resume_session`] finishes the job later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{NewAggregate, SessionAggregate, SessionStatus, round_to, summarize};
use crate::buffer::SampleBuffer;
use crate::config::PipelineConfig;
use crate::correlate::attach_emission;
use crate::emissions::{EmissionFactor, EmissionRecord, usage_emission};
use crate::error::{PipelineError, Result};
use crate::ids::{DeviceId, SessionId, SessionKey, UserId};
use crate::sample::{Readings, Sample, now_ms};
use crate::source::{PollStatus, TelemetrySource};
use crate::store::SessionStore;

// ---------------------------------------------------------------------------
// Public records
// ---------------------------------------------------------------------------

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub avg_current: f64,
    pub avg_voltage: f64,
    pub avg_power: f64,
    pub avg_energy: f64,
    pub elapsed_seconds: f64,
    /// Known only when the summary comes from a live close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<usize>,
    pub emission_value: f64,
}

impl SessionSummary {
    fn from_aggregate(aggregate: &SessionAggregate, emission_value: f64) -> Self {
        Self {
            session_id: aggregate.session_id,
            device_id: aggregate.device_id,
            user_id: aggregate.user_id,
            avg_current: aggregate.avg_current,
            avg_voltage: aggregate.avg_voltage,
            avg_power: aggregate.avg_power,
            avg_energy: aggregate.avg_energy,
            elapsed_seconds: aggregate.elapsed_seconds,
            sample_count: None,
            emission_value,
        }
    }
}

/// Snapshot of an open session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSession {
    pub session_key: SessionKey,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub started_at_ms: u64,
    pub polled: bool,
    pub closing: bool,
    pub buffered: usize,
}

// ---------------------------------------------------------------------------
// Active session bookkeeping
// ---------------------------------------------------------------------------

struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Poller {
    async fn stop(self, key: SessionKey) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            log::warn!("poll task of session {key} ended abnormally: {e}");
        }
    }
}

struct ActiveSession {
    device_id: DeviceId,
    user_id: UserId,
    started_at_ms: u64,
    /// Set by the first close attempt and reused by every retry.
    stopped_at_ms: Option<u64>,
    /// A close is in flight.
    closing: bool,
    poller: Option<Poller>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SessionPipeline {
    store: Arc<dyn SessionStore>,
    buffer: Arc<SampleBuffer>,
    config: PipelineConfig,
    active: Mutex<HashMap<SessionKey, ActiveSession>>,
}

impl SessionPipeline {
    pub fn new(store: Arc<dyn SessionStore>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            buffer: Arc::new(SampleBuffer::new()),
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, HashMap<SessionKey, ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- opening -----------------------------------------------------------

    /// Open a manually fed session for `device_id`.
    pub fn open_session(&self, device_id: DeviceId, user_id: UserId) -> Result<SessionKey> {
        let key = self.register(device_id, user_id, |_| None)?;
        log::info!("session {key} opened for {device_id} of {user_id}");
        Ok(key)
    }

    /// Open a session and poll `source` every `poll_interval` until it closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_polled_session<S: TelemetrySource>(
        &self,
        source: S,
        user_id: UserId,
    ) -> Result<SessionKey> {
        let device_id = source.device_id();
        let interval = self.config.poll_interval();
        let buffer = Arc::clone(&self.buffer);
        let key = self.register(device_id, user_id, move |key| {
            let token = CancellationToken::new();
            let handle = tokio::spawn(poll_loop(source, key, buffer, interval, token.clone()));
            Some(Poller { token, handle })
        })?;
        log::info!("session {key} opened for {device_id} of {user_id}, polling every {interval:?}");
        Ok(key)
    }

    /// Insert the session and start its poller under one lock, so a close
    /// can never observe the session without its poller.
    fn register(
        &self,
        device_id: DeviceId,
        user_id: UserId,
        start: impl FnOnce(SessionKey) -> Option<Poller>,
    ) -> Result<SessionKey> {
        let mut active = self.active();
        if active.values().any(|s| s.device_id == device_id) {
            return Err(PipelineError::SessionAlreadyOpen(device_id));
        }
        let key = SessionKey::new();
        self.buffer.open(key, device_id)?;
        active.insert(
            key,
            ActiveSession {
                device_id,
                user_id,
                started_at_ms: now_ms(),
                stopped_at_ms: None,
                closing: false,
                poller: start(key),
            },
        );
        Ok(key)
    }

    // -- sampling ----------------------------------------------------------

    /// Validate `readings`, stamp them with the current time and buffer them.
    pub fn record_sample(&self, key: SessionKey, readings: Readings) -> Result<Sample> {
        readings.validate()?;
        let device_id = self
            .active()
            .get(&key)
            .map(|s| s.device_id)
            .ok_or(PipelineError::SessionNotOpen(key))?;
        let sample = Sample::new(device_id, readings, now_ms());
        self.buffer.append(key, sample.clone())?;
        Ok(sample)
    }

    /// Buffered samples of an open session, ordered by capture time.
    pub fn buffered(&self, key: SessionKey) -> Result<Vec<Sample>> {
        if !self.active().contains_key(&key) {
            return Err(PipelineError::SessionNotOpen(key));
        }
        self.buffer.drain(key)
    }

    /// Drop the buffered samples of one session; the session stays open.
    ///
    /// A session that is closing is left alone.
    pub fn discard_samples(&self, key: SessionKey) -> Result<usize> {
        // Held across the truncate: a close marks the session closing under
        // this lock before it seals.
        let active = self.active();
        if active.get(&key).is_none_or(|s| s.closing) {
            return Err(PipelineError::SessionNotOpen(key));
        }
        self.buffer.truncate(key)
    }

    /// Drop buffered samples of every open session of `device_id`, or of
    /// every open session when `device_id` is `None`. Closing sessions are
    /// skipped.
    pub fn discard_all_samples(&self, device_id: Option<DeviceId>) -> usize {
        let active = self.active();
        active
            .iter()
            .filter(|(_, s)| !s.closing && device_id.is_none_or(|d| s.device_id == d))
            .filter_map(|(k, _)| self.buffer.truncate(*k).ok())
            .sum()
    }

    // -- closing -----------------------------------------------------------

    /// Close `key`, persist its aggregate and record its usage emission.
    ///
    /// Returns the summary with the session id created for this session.
    pub async fn close_session(
        &self,
        key: SessionKey,
        factor: EmissionFactor,
    ) -> Result<SessionSummary> {
        let (device_id, user_id, started_at_ms, stopped_at_ms, poller) = {
            let mut active = self.active();
            let session = active
                .get_mut(&key)
                .filter(|s| !s.closing)
                .ok_or(PipelineError::SessionNotOpen(key))?;
            session.closing = true;
            let stopped = *session.stopped_at_ms.get_or_insert_with(now_ms);
            (
                session.device_id,
                session.user_id,
                session.started_at_ms,
                stopped,
                session.poller.take(),
            )
        };

        if let Some(poller) = poller {
            poller.stop(key).await;
        }
        self.buffer.seal(key)?;
        let samples = self.buffer.drain(key)?;
        log::info!("session {key} sealed with {} samples", samples.len());

        let stats = match summarize(
            key,
            &samples,
            started_at_ms,
            stopped_at_ms,
            self.config.precision,
        ) {
            Ok(stats) => stats,
            Err(e) => {
                self.buffer.clear(key);
                self.active().remove(&key);
                log::info!("session {key} closed with no data");
                return Err(e);
            }
        };

        let session_id = match self
            .store
            .insert_aggregate(NewAggregate::from_stats(device_id, user_id, &stats))
        {
            Ok(id) => id,
            Err(e) => {
                if let Some(session) = self.active().get_mut(&key) {
                    session.closing = false;
                }
                log::warn!("session {key} could not be persisted, it stays sealed: {e}");
                return Err(e.into());
            }
        };
        self.buffer.clear(key);
        self.active().remove(&key);
        log::info!("session {key} aggregated as session {session_id}");

        let emission_value = self
            .complete(session_id, device_id, user_id, stats.avg_power, stats.elapsed_seconds, factor)
            .map_err(|e| {
                log::warn!("session {session_id} left pending: {e}");
                PipelineError::Incomplete {
                    session_id,
                    source: Box::new(e),
                }
            })?;
        log::info!("session {session_id} completed, emission {emission_value}");

        Ok(SessionSummary {
            session_id,
            device_id,
            user_id,
            avg_current: stats.avg_current,
            avg_voltage: stats.avg_voltage,
            avg_power: stats.avg_power,
            avg_energy: stats.avg_energy,
            elapsed_seconds: stats.elapsed_seconds,
            sample_count: Some(stats.sample_count),
            emission_value,
        })
    }

    fn complete(
        &self,
        session_id: SessionId,
        device_id: DeviceId,
        user_id: UserId,
        avg_power: f64,
        elapsed_seconds: f64,
        factor: EmissionFactor,
    ) -> Result<f64> {
        let emission_value = round_to(
            usage_emission(avg_power, elapsed_seconds, factor),
            self.config.precision,
        );
        attach_emission(
            self.store.as_ref(),
            EmissionRecord {
                session_id,
                device_id,
                user_id,
                emission_value,
            },
        )?;
        self.store.mark_complete(session_id)?;
        Ok(emission_value)
    }

    /// Finish a session whose aggregate was persisted but whose emission was
    /// not. A session that is already complete is returned unchanged.
    pub fn resume_session(
        &self,
        session_id: SessionId,
        factor: EmissionFactor,
    ) -> Result<SessionSummary> {
        let aggregate = self
            .store
            .aggregate(session_id)?
            .ok_or(PipelineError::Correlation(session_id))?;

        if let Some(existing) = self.store.emission_for(session_id)? {
            if aggregate.status == SessionStatus::Pending {
                self.store.mark_complete(session_id)?;
                log::info!("session {session_id} completed on resume");
            }
            return Ok(SessionSummary::from_aggregate(&aggregate, existing.emission_value));
        }

        let emission_value = self.complete(
            session_id,
            aggregate.device_id,
            aggregate.user_id,
            aggregate.avg_power,
            aggregate.elapsed_seconds,
            factor,
        )?;
        log::info!("session {session_id} completed on resume, emission {emission_value}");
        Ok(SessionSummary::from_aggregate(&aggregate, emission_value))
    }

    /// Record an externally computed aggregate. It stays pending until an
    /// emission is recorded for it.
    pub fn submit_aggregate(&self, aggregate: NewAggregate) -> Result<SessionId> {
        aggregate.validate()?;
        let session_id = self.store.insert_aggregate(aggregate)?;
        log::info!("external aggregate stored as session {session_id}");
        Ok(session_id)
    }

    /// Record an externally computed emission and complete its session.
    pub fn record_emission(&self, record: EmissionRecord) -> Result<()> {
        let session_id = record.session_id;
        attach_emission(self.store.as_ref(), record)?;
        self.store.mark_complete(session_id)?;
        Ok(())
    }

    /// Stop a session without writing anything. Returns how many buffered
    /// samples were dropped.
    pub async fn abort_session(&self, key: SessionKey) -> Result<usize> {
        let session = {
            let mut active = self.active();
            if active.get(&key).is_none_or(|s| s.closing) {
                return Err(PipelineError::SessionNotOpen(key));
            }
            active.remove(&key)
        };
        if let Some(poller) = session.and_then(|s| s.poller) {
            poller.stop(key).await;
        }
        let dropped = self.buffer.clear(key);
        log::info!("session {key} aborted, {dropped} samples dropped");
        Ok(dropped)
    }

    // -- inspection ----------------------------------------------------------

    pub fn pending_sessions(&self) -> Result<Vec<SessionAggregate>> {
        Ok(self.store.pending_aggregates()?)
    }

    /// Whether `key` is open and accepting samples.
    pub fn is_open(&self, key: SessionKey) -> bool {
        self.active().get(&key).is_some_and(|s| !s.closing) && self.buffer.is_open(key)
    }

    pub fn open_sessions(&self) -> Vec<OpenSession> {
        let mut sessions: Vec<OpenSession> = self
            .active()
            .iter()
            .map(|(key, s)| OpenSession {
                session_key: *key,
                device_id: s.device_id,
                user_id: s.user_id,
                started_at_ms: s.started_at_ms,
                polled: s.poller.is_some(),
                closing: s.closing,
                buffered: self.buffer.len(*key),
            })
            .collect();
        sessions.sort_by_key(|s| (s.started_at_ms, s.device_id));
        sessions
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

async fn poll_loop<S: TelemetrySource>(
    source: S,
    key: SessionKey,
    buffer: Arc<SampleBuffer>,
    interval: Duration,
    token: CancellationToken,
) {
    let device_id = source.device_id();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A read still in flight when the session closes is dropped.
        let status = tokio::select! {
            _ = token.cancelled() => break,
            status = source.read() => status,
        };
        match status {
            PollStatus::Connected { data } => {
                if let Err(e) = data.validate() {
                    log::warn!("{device_id} reported out-of-range readings: {e}");
                    continue;
                }
                match buffer.append(key, Sample::new(device_id, data, now_ms())) {
                    Ok(()) => log::debug!("{device_id}: {:.3} W", data.power),
                    Err(e) => log::warn!("{device_id} sample rejected by session {key}: {e}"),
                }
            }
            PollStatus::Error { message } => {
                log::warn!("poll of {device_id} failed: {message}");
            }
        }
    }
    log::debug!("poll task of session {key} stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::emissions::{ManufacturingEmissionProfile, UsageEstimate};
    use crate::error::StoreError;
    use crate::sources::ScriptedSource;
    use crate::store::{Device, MemoryStore, NewDevice, User};

    type StoreResult<T> = std::result::Result<T, StoreError>;

    fn readings(power: f64) -> Readings {
        Readings {
            voltage: 230.0,
            current: power / 230.0,
            power,
            energy: 0.01,
        }
    }

    fn factor(v: f64) -> EmissionFactor {
        EmissionFactor::new(v).unwrap()
    }

    fn pipeline() -> SessionPipeline {
        SessionPipeline::new(Arc::new(MemoryStore::new()), PipelineConfig::default()).unwrap()
    }

    /// Memory store whose aggregate or emission writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_aggregate: AtomicBool,
        fail_emission: AtomicBool,
    }

    impl SessionStore for FlakyStore {
        fn insert_user(&self, username: &str) -> StoreResult<UserId> {
            self.inner.insert_user(username)
        }
        fn users(&self) -> StoreResult<Vec<User>> {
            self.inner.users()
        }
        fn insert_device(&self, device: NewDevice) -> StoreResult<DeviceId> {
            self.inner.insert_device(device)
        }
        fn device(&self, id: DeviceId) -> StoreResult<Option<Device>> {
            self.inner.device(id)
        }
        fn devices_for_user(&self, user: UserId) -> StoreResult<Vec<Device>> {
            self.inner.devices_for_user(user)
        }
        fn devices(&self) -> StoreResult<Vec<Device>> {
            self.inner.devices()
        }
        fn set_manufacturing(&self, profile: ManufacturingEmissionProfile) -> StoreResult<()> {
            self.inner.set_manufacturing(profile)
        }
        fn insert_aggregate(&self, aggregate: NewAggregate) -> StoreResult<SessionId> {
            if self.fail_aggregate.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("aggregate table locked".into()));
            }
            self.inner.insert_aggregate(aggregate)
        }
        fn aggregate(&self, id: SessionId) -> StoreResult<Option<SessionAggregate>> {
            self.inner.aggregate(id)
        }
        fn latest_aggregate(&self) -> StoreResult<Option<SessionAggregate>> {
            self.inner.latest_aggregate()
        }
        fn aggregates(&self) -> StoreResult<Vec<SessionAggregate>> {
            self.inner.aggregates()
        }
        fn aggregates_for(
            &self,
            user: UserId,
            device: DeviceId,
        ) -> StoreResult<Vec<SessionAggregate>> {
            self.inner.aggregates_for(user, device)
        }
        fn pending_aggregates(&self) -> StoreResult<Vec<SessionAggregate>> {
            self.inner.pending_aggregates()
        }
        fn mark_complete(&self, id: SessionId) -> StoreResult<()> {
            self.inner.mark_complete(id)
        }
        fn insert_emission(&self, record: EmissionRecord) -> StoreResult<()> {
            if self.fail_emission.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("emission table locked".into()));
            }
            self.inner.insert_emission(record)
        }
        fn emission_for(&self, id: SessionId) -> StoreResult<Option<EmissionRecord>> {
            self.inner.emission_for(id)
        }
        fn insert_usage_estimate(&self, estimate: UsageEstimate) -> StoreResult<()> {
            self.inner.insert_usage_estimate(estimate)
        }
        fn usage_estimates(&self) -> StoreResult<Vec<UsageEstimate>> {
            self.inner.usage_estimates()
        }
    }

    /// Connected source whose reads take `delay` and report 1000 W.
    struct SlowSource {
        device_id: DeviceId,
        delay: Duration,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl SlowSource {
        fn new(device_id: DeviceId, delay: Duration) -> Self {
            Self {
                device_id,
                delay,
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        fn finished(&self) -> usize {
            self.finished.load(Ordering::SeqCst)
        }
    }

    impl TelemetrySource for SlowSource {
        fn device_id(&self) -> DeviceId {
            self.device_id
        }

        async fn read(&self) -> PollStatus {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            PollStatus::connected(readings(1000.0))
        }
    }

    fn flaky() -> (Arc<FlakyStore>, SessionPipeline) {
        let store = Arc::new(FlakyStore::default());
        let pipeline = SessionPipeline::new(store.clone(), PipelineConfig::default()).unwrap();
        (store, pipeline)
    }

    // -----------------------------------------------------------------------
    // opening
    // -----------------------------------------------------------------------

    #[test]
    fn test_one_open_session_per_device() {
        let p = pipeline();
        p.open_session(DeviceId(1), UserId(1)).unwrap();
        assert!(matches!(
            p.open_session(DeviceId(1), UserId(1)),
            Err(PipelineError::SessionAlreadyOpen(DeviceId(1)))
        ));
        assert!(p.open_session(DeviceId(2), UserId(1)).is_ok());
        assert_eq!(p.open_sessions().len(), 2);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = PipelineConfig {
            poll_interval_ms: 0,
            ..PipelineConfig::default()
        };
        assert!(SessionPipeline::new(Arc::new(MemoryStore::new()), config).is_err());
    }

    // -----------------------------------------------------------------------
    // sampling
    // -----------------------------------------------------------------------

    #[test]
    fn test_record_sample_validates() {
        let p = pipeline();
        let key = p.open_session(DeviceId(1), UserId(1)).unwrap();
        let mut bad = readings(10.0);
        bad.power = -1.0;
        assert!(matches!(
            p.record_sample(key, bad),
            Err(PipelineError::Validation { field: "power", .. })
        ));
        assert!(p.buffered(key).unwrap().is_empty());
    }

    #[test]
    fn test_record_sample_unknown_session() {
        let p = pipeline();
        let key = SessionKey::new();
        assert!(matches!(
            p.record_sample(key, readings(1.0)),
            Err(PipelineError::SessionNotOpen(_))
        ));
    }

    #[test]
    fn test_discard_samples_keeps_session_open() {
        let p = pipeline();
        let key = p.open_session(DeviceId(1), UserId(1)).unwrap();
        p.record_sample(key, readings(1.0)).unwrap();
        assert_eq!(p.discard_samples(key).unwrap(), 1);
        assert!(p.is_open(key));
        p.record_sample(key, readings(2.0)).unwrap();
        assert_eq!(p.buffered(key).unwrap().len(), 1);
    }

    #[test]
    fn test_discard_all_samples_scoped_to_device() {
        let p = pipeline();
        let a = p.open_session(DeviceId(1), UserId(1)).unwrap();
        let b = p.open_session(DeviceId(2), UserId(1)).unwrap();
        p.record_sample(a, readings(1.0)).unwrap();
        p.record_sample(b, readings(2.0)).unwrap();
        assert_eq!(p.discard_all_samples(Some(DeviceId(1))), 1);
        assert_eq!(p.buffered(b).unwrap().len(), 1);
        assert_eq!(p.discard_all_samples(None), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_leaves_closing_session_alone() {
        let config = PipelineConfig {
            poll_interval_ms: 100,
            ..PipelineConfig::default()
        };
        let p = Arc::new(SessionPipeline::new(Arc::new(MemoryStore::new()), config).unwrap());
        let source = SlowSource::new(DeviceId(4), Duration::from_millis(500));
        let key = p.open_polled_session(source, UserId(1)).unwrap();
        p.record_sample(key, readings(10.0)).unwrap();
        p.record_sample(key, readings(20.0)).unwrap();
        // The first read is still in flight, so the close waits on the poller.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closer = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.close_session(key, factor(1.0)).await })
        };
        while p.open_sessions().first().is_some_and(|s| !s.closing) {
            tokio::task::yield_now().await;
        }

        assert_eq!(p.discard_all_samples(None), 0);
        assert_eq!(p.discard_all_samples(Some(DeviceId(4))), 0);
        assert!(matches!(
            p.discard_samples(key),
            Err(PipelineError::SessionNotOpen(_))
        ));

        let summary = closer.await.unwrap().unwrap();
        assert_eq!(summary.sample_count, Some(2));
        assert_eq!(summary.avg_power, 15.0);
    }

    // -----------------------------------------------------------------------
    // closing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_close_persists_aggregate_and_emission() {
        let p = pipeline();
        let key = p.open_session(DeviceId(1), UserId(7)).unwrap();
        for power in [100.0, 150.0, 200.0] {
            p.record_sample(key, readings(power)).unwrap();
        }
        let summary = p.close_session(key, factor(0.5)).await.unwrap();

        assert_eq!(summary.avg_power, 150.0);
        assert_eq!(summary.sample_count, Some(3));
        let expected = round_to(150.0 * summary.elapsed_seconds * 0.5 * 0.001, 3);
        assert_eq!(summary.emission_value, expected);

        let stored = p.store().aggregate(summary.session_id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Complete);
        assert_eq!(stored.user_id, UserId(7));
        let emission = p.store().emission_for(summary.session_id).unwrap().unwrap();
        assert_eq!(emission.emission_value, summary.emission_value);
        assert!(!p.is_open(key));
        assert!(p.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_close_empty_session_is_no_data() {
        let p = pipeline();
        let key = p.open_session(DeviceId(1), UserId(1)).unwrap();
        assert!(matches!(
            p.close_session(key, factor(0.5)).await,
            Err(PipelineError::NoData(k)) if k == key
        ));
        assert!(p.store().aggregates().unwrap().is_empty());
        // The device is free again.
        assert!(p.open_session(DeviceId(1), UserId(1)).is_ok());
    }

    #[tokio::test]
    async fn test_close_twice_is_not_open() {
        let p = pipeline();
        let key = p.open_session(DeviceId(1), UserId(1)).unwrap();
        p.record_sample(key, readings(1.0)).unwrap();
        p.close_session(key, factor(0.5)).await.unwrap();
        assert!(matches!(
            p.close_session(key, factor(0.5)).await,
            Err(PipelineError::SessionNotOpen(_))
        ));
        assert_eq!(p.store().aggregates().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_devices_keep_separate_averages() {
        let p = pipeline();
        let a = p.open_session(DeviceId(1), UserId(1)).unwrap();
        let b = p.open_session(DeviceId(2), UserId(2)).unwrap();
        p.record_sample(a, readings(10.0)).unwrap();
        p.record_sample(b, readings(1000.0)).unwrap();
        p.record_sample(a, readings(20.0)).unwrap();

        let (sa, sb) = tokio::join!(
            p.close_session(a, factor(1.0)),
            p.close_session(b, factor(1.0))
        );
        let (sa, sb) = (sa.unwrap(), sb.unwrap());
        assert_eq!(sa.avg_power, 15.0);
        assert_eq!(sb.avg_power, 1000.0);
        assert_ne!(sa.session_id, sb.session_id);
        assert_eq!(
            p.store().emission_for(sa.session_id).unwrap().unwrap().device_id,
            DeviceId(1)
        );
        assert_eq!(
            p.store().emission_for(sb.session_id).unwrap().unwrap().device_id,
            DeviceId(2)
        );
    }

    #[tokio::test]
    async fn test_failed_aggregate_write_keeps_session_sealed_and_retryable() {
        let (store, p) = flaky();
        let key = p.open_session(DeviceId(1), UserId(1)).unwrap();
        p.record_sample(key, readings(40.0)).unwrap();
        store.fail_aggregate.store(true, Ordering::SeqCst);

        let err = p.close_session(key, factor(1.0)).await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert!(!p.is_open(key));
        assert!(p.record_sample(key, readings(99.0)).is_err());
        assert!(store.aggregates().unwrap().is_empty());

        store.fail_aggregate.store(false, Ordering::SeqCst);
        let summary = p.close_session(key, factor(1.0)).await.unwrap();
        assert_eq!(summary.avg_power, 40.0);
        assert_eq!(summary.sample_count, Some(1));
    }

    #[tokio::test]
    async fn test_failed_emission_write_is_incomplete_then_resumable() {
        let (store, p) = flaky();
        let key = p.open_session(DeviceId(3), UserId(1)).unwrap();
        p.record_sample(key, readings(80.0)).unwrap();
        store.fail_emission.store(true, Ordering::SeqCst);

        let session_id = match p.close_session(key, factor(2.0)).await {
            Err(PipelineError::Incomplete { session_id, source }) => {
                assert_eq!(source.kind(), "persistence");
                session_id
            }
            other => panic!("expected incomplete, got {other:?}"),
        };
        let pending = p.pending_sessions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, session_id);
        // The device is free even though the session is still pending.
        assert!(p.open_session(DeviceId(3), UserId(1)).is_ok());

        store.fail_emission.store(false, Ordering::SeqCst);
        let summary = p.resume_session(session_id, factor(2.0)).unwrap();
        assert_eq!(summary.session_id, session_id);
        assert!(p.pending_sessions().unwrap().is_empty());

        // Resuming again is a no-op.
        let again = p.resume_session(session_id, factor(9.0)).unwrap();
        assert_eq!(again.emission_value, summary.emission_value);
    }

    #[test]
    fn test_resume_unknown_session_is_correlation_error() {
        let p = pipeline();
        assert!(matches!(
            p.resume_session(SessionId(42), factor(1.0)),
            Err(PipelineError::Correlation(SessionId(42)))
        ));
    }

    #[test]
    fn test_external_aggregate_completes_on_emission() {
        let p = pipeline();
        let id = p
            .submit_aggregate(NewAggregate {
                device_id: DeviceId(1),
                user_id: UserId(1),
                avg_current: 0.5,
                avg_voltage: 230.0,
                avg_power: 115.0,
                avg_energy: 0.02,
                elapsed_seconds: 30.0,
            })
            .unwrap();
        assert_eq!(p.pending_sessions().unwrap().len(), 1);
        p.record_emission(EmissionRecord {
            session_id: id,
            device_id: DeviceId(1),
            user_id: UserId(1),
            emission_value: 0.9,
        })
        .unwrap();
        assert!(p.pending_sessions().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // abort
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_abort_writes_nothing() {
        let p = pipeline();
        let key = p.open_session(DeviceId(1), UserId(1)).unwrap();
        p.record_sample(key, readings(5.0)).unwrap();
        assert_eq!(p.abort_session(key).await.unwrap(), 1);
        assert!(p.store().aggregates().unwrap().is_empty());
        assert!(matches!(
            p.abort_session(key).await,
            Err(PipelineError::SessionNotOpen(_))
        ));
    }

    // -----------------------------------------------------------------------
    // polling
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_polled_session_buffers_connected_reads_only() {
        let config = PipelineConfig {
            poll_interval_ms: 100,
            ..PipelineConfig::default()
        };
        let p = SessionPipeline::new(Arc::new(MemoryStore::new()), config).unwrap();
        let source = Arc::new(ScriptedSource::new(
            DeviceId(9),
            vec![
                PollStatus::connected(readings(10.0)),
                PollStatus::error("connection refused"),
                PollStatus::connected(readings(30.0)),
            ],
        ));
        let key = p.open_polled_session(source.clone(), UserId(1)).unwrap();
        assert!(p.open_sessions()[0].polled);

        // Ticks at 0, 100, 200 and 300 ms.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(source.reads(), 4);
        assert_eq!(p.buffered(key).unwrap().len(), 3);

        let summary = p.close_session(key, factor(1.0)).await.unwrap();
        assert_eq!(summary.sample_count, Some(3));
        assert_eq!(summary.avg_power, round_to((10.0 + 30.0 + 30.0) / 3.0, 3));

        let reads_at_close = source.reads();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(source.reads(), reads_at_close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_in_flight_at_close_is_dropped() {
        let config = PipelineConfig {
            poll_interval_ms: 100,
            ..PipelineConfig::default()
        };
        let p = SessionPipeline::new(Arc::new(MemoryStore::new()), config).unwrap();
        let source = Arc::new(SlowSource::new(DeviceId(5), Duration::from_millis(500)));
        let key = p.open_polled_session(source.clone(), UserId(1)).unwrap();
        p.record_sample(key, readings(9.0)).unwrap();

        // First read runs 0..500 ms; the next tick starts one at 600 ms that
        // would finish at 1100 ms.
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(source.started(), 2);
        assert_eq!(source.finished(), 1);

        let summary = p.close_session(key, factor(1.0)).await.unwrap();
        assert_eq!(summary.sample_count, Some(2));
        assert_eq!(summary.avg_power, round_to((9.0 + 1000.0) / 2.0, 3));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.started(), 2);
        assert_eq!(source.finished(), 1);
        assert!(p.buffered(key).is_err());
        let stored = p.store().aggregate(summary.session_id).unwrap().unwrap();
        assert_eq!(stored.avg_power, summary.avg_power);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_poller() {
        let config = PipelineConfig {
            poll_interval_ms: 50,
            ..PipelineConfig::default()
        };
        let p = SessionPipeline::new(Arc::new(MemoryStore::new()), config).unwrap();
        let source = Arc::new(ScriptedSource::new(
            DeviceId(2),
            vec![PollStatus::connected(readings(1.0))],
        ));
        let key = p.open_polled_session(source.clone(), UserId(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        p.abort_session(key).await.unwrap();
        let reads = source.reads();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.reads(), reads);
        assert!(p.open_sessions().is_empty());
    }
}
