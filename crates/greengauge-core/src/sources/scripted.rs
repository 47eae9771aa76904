//! Replays a fixed sequence of poll outcomes.
//!
//! Useful for demos and for driving the pipeline without hardware. Once the
//! script is exhausted the last outcome repeats; an empty script always
//! reports an error.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ids::DeviceId;
use crate::source::{PollStatus, TelemetrySource};

pub struct ScriptedSource {
    device_id: DeviceId,
    script: Vec<PollStatus>,
    cursor: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(device_id: DeviceId, script: Vec<PollStatus>) -> Self {
        Self {
            device_id,
            script,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of reads performed so far.
    pub fn reads(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst) as u64
    }

    fn next(&self) -> PollStatus {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst);
        match self.script.get(i).or_else(|| self.script.last()) {
            Some(status) => status.clone(),
            None => PollStatus::error("script is empty"),
        }
    }
}

impl TelemetrySource for ScriptedSource {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    async fn read(&self) -> PollStatus {
        self.next()
    }
}
