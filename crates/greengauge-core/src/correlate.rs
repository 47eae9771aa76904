//! Joining aggregates with their emission records.
//!
//! The pipeline never has to guess which aggregate an emission belongs to:
//! [`SessionPipeline::close_session`](crate::pipeline::SessionPipeline::close_session)
//! hands back the id it created. What is left here is the read side (the
//! correlated series) and the write path for emissions recorded by clients.

use serde::{Deserialize, Serialize};

use crate::emissions::EmissionRecord;
use crate::error::{PipelineError, Result, StoreError};
use crate::ids::{DeviceId, SessionId, UserId};
use crate::store::SessionStore;

/// One point of a device's history: a session and its usage emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub session_id: SessionId,
    pub avg_power: f64,
    pub elapsed_seconds: f64,
    pub emission_value: f64,
    pub created_at_ms: u64,
}

/// Id of the most recently created aggregate, across all devices.
///
/// This is a global lookup: if two sessions close concurrently it may
/// return the other device's session. Prefer the id returned by close.
pub fn latest_session(store: &dyn SessionStore) -> Result<Option<SessionId>> {
    Ok(store.latest_aggregate()?.map(|a| a.session_id))
}

/// Aggregates of `user`'s `device` joined with their emissions, ascending by
/// creation time then id. Aggregates with no emission record are left out.
pub fn correlated_series(
    store: &dyn SessionStore,
    user: UserId,
    device: DeviceId,
) -> Result<Vec<SeriesPoint>> {
    let mut points = Vec::new();
    for aggregate in store.aggregates_for(user, device)? {
        let Some(emission) = store.emission_for(aggregate.session_id)? else {
            continue;
        };
        points.push(SeriesPoint {
            session_id: aggregate.session_id,
            avg_power: aggregate.avg_power,
            elapsed_seconds: aggregate.elapsed_seconds,
            emission_value: emission.emission_value,
            created_at_ms: aggregate.created_at_ms,
        });
    }
    Ok(points)
}

/// Store an emission for an existing aggregate.
///
/// A session id with no aggregate is [`PipelineError::Correlation`].
pub fn attach_emission(store: &dyn SessionStore, record: EmissionRecord) -> Result<()> {
    record.validate()?;
    let session_id = record.session_id;
    match store.insert_emission(record) {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound(_)) => Err(PipelineError::Correlation(session_id)),
        Err(e) => Err(e.into()),
    }
}
