//! What the driver needs from the rest of the miner.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::icarus::job::Job;
use crate::tracing::prelude::*;

/// Receives everything a session reports.
#[async_trait]
pub trait WorkHost: Send {
    /// A nonce that verified against `job`.
    async fn submit_candidate(&mut self, job: &Arc<Job>, nonce: u32);

    /// A nonce that matched neither job in flight.
    async fn report_hardware_error(&mut self, job: Option<&Arc<Job>>, nonce: u32);

    /// Hashes done during one cycle, measured or estimated.
    async fn report_hashes_done(&mut self, hashes: u64);

    /// The link failed or could not be reopened.
    async fn report_comms_error(&mut self, reason: &str);
}

/// Supplies jobs, one per cycle.
#[async_trait]
pub trait JobSource: Send {
    /// Next job, or `None` once the source is exhausted.
    async fn next_job(&mut self) -> Option<Arc<Job>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    Candidate {
        device: String,
        job_id: u64,
        nonce: u32,
    },
    HardwareError {
        device: String,
        job_id: Option<u64>,
        nonce: u32,
    },
    HashesDone {
        device: String,
        hashes: u64,
    },
    CommsError {
        device: String,
        reason: String,
    },
}

/// Host over tokio channels: jobs come in on one, events go out on another.
pub struct ChannelHost {
    device: String,
    jobs: mpsc::Receiver<Arc<Job>>,
    events: mpsc::Sender<DeviceEvent>,
}

impl ChannelHost {
    pub fn new(
        device: impl Into<String>,
        jobs: mpsc::Receiver<Arc<Job>>,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            device: device.into(),
            jobs,
            events,
        }
    }

    async fn emit(&mut self, event: DeviceEvent) {
        if self.events.send(event).await.is_err() {
            trace!(device = %self.device, "Event receiver gone.");
        }
    }
}

#[async_trait]
impl WorkHost for ChannelHost {
    async fn submit_candidate(&mut self, job: &Arc<Job>, nonce: u32) {
        let event = DeviceEvent::Candidate {
            device: self.device.clone(),
            job_id: job.id,
            nonce,
        };
        self.emit(event).await;
    }

    async fn report_hardware_error(&mut self, job: Option<&Arc<Job>>, nonce: u32) {
        let event = DeviceEvent::HardwareError {
            device: self.device.clone(),
            job_id: job.map(|j| j.id),
            nonce,
        };
        self.emit(event).await;
    }

    async fn report_hashes_done(&mut self, hashes: u64) {
        let event = DeviceEvent::HashesDone {
            device: self.device.clone(),
            hashes,
        };
        self.emit(event).await;
    }

    async fn report_comms_error(&mut self, reason: &str) {
        let event = DeviceEvent::CommsError {
            device: self.device.clone(),
            reason: reason.to_string(),
        };
        self.emit(event).await;
    }
}

#[async_trait]
impl JobSource for ChannelHost {
    async fn next_job(&mut self) -> Option<Arc<Job>> {
        self.jobs.recv().await
    }
}
