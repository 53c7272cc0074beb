//! One worker task per device.
//!
//! The [`IcarusThread`] owns the [`Session`] and is the only code that ever
//! touches it. Everything else goes through a cloneable [`ThreadHandle`]:
//! commands are queued and applied between cycles, status is read from a
//! snapshot the worker republishes after each cycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{Applied, ConfigError};
use crate::host::{JobSource, WorkHost};
use crate::icarus::reply::RestartSignal;
use crate::icarus::session::{Session, SessionError, SessionSnapshot};
use crate::tracing::prelude::*;

/// Pause after a failed reopen before the next attempt.
pub const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

const COMMAND_QUEUE: usize = 16;

#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("device thread has stopped")]
    Disconnected,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub enum ThreadCommand {
    SetOption {
        name: String,
        value: String,
        respond: oneshot::Sender<Result<Applied, ConfigError>>,
    },
    Identify,
    SetEnabled(bool),
}

pub struct IcarusThread<H> {
    session: Session,
    host: H,
    commands: mpsc::Receiver<ThreadCommand>,
    restart: RestartSignal,
    status: Arc<RwLock<SessionSnapshot>>,
    running: CancellationToken,
}

impl<H> IcarusThread<H>
where
    H: WorkHost + JobSource,
{
    /// Wrap a prepared session. Cancelling `running` stops the worker after
    /// closing the link.
    pub fn new(session: Session, host: H, running: CancellationToken) -> (Self, ThreadHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let restart = RestartSignal::new();
        let status = Arc::new(RwLock::new(session.snapshot()));
        let handle = ThreadHandle {
            name: session.name().to_string(),
            commands: tx,
            status: status.clone(),
            restart: restart.clone(),
        };
        let thread = Self {
            session,
            host,
            commands: rx,
            restart,
            status,
            running,
        };
        (thread, handle)
    }

    pub async fn run(mut self) {
        debug!(device = %self.session.name(), "Device thread started.");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.running.cancelled() => break,
                Some(command) = self.commands.recv() => {
                    self.handle(command);
                    self.publish();
                    continue;
                }
                job = self.host.next_job() => match job {
                    Some(job) => job,
                    None => {
                        info!(device = %self.session.name(), "Job source closed.");
                        break;
                    }
                },
            };

            // Work changed before this job even started; nothing to abandon.
            self.restart.clear();

            let result = tokio::select! {
                biased;
                _ = self.running.cancelled() => break,
                result = self.session.scan_cycle(job, &mut self.host, &self.restart) => result,
            };
            self.publish();

            match result {
                Ok(report) => trace!(
                    device = %self.session.name(),
                    outcome = ?report.outcome,
                    hashes = report.hashes,
                    "Cycle done."
                ),
                Err(SessionError::ReopenFailed(e)) => {
                    warn!(
                        device = %self.session.name(),
                        error = %e,
                        "Device unavailable, retrying in {REOPEN_BACKOFF:?}."
                    );
                    tokio::select! {
                        _ = self.running.cancelled() => break,
                        _ = time::sleep(REOPEN_BACKOFF) => {}
                    }
                }
                Err(e) => error!(device = %self.session.name(), error = %e, "Cycle failed."),
            }
        }

        self.session.close();
        self.publish();
        debug!(device = %self.session.name(), "Device thread stopped.");
    }

    fn handle(&mut self, command: ThreadCommand) {
        match command {
            ThreadCommand::SetOption {
                name,
                value,
                respond,
            } => {
                let result = self.session.apply_option(&name, &value);
                match &result {
                    Ok(applied) => debug!(
                        device = %self.session.name(),
                        option = %name,
                        %value,
                        changed = applied.changed,
                        "Option applied."
                    ),
                    Err(e) => warn!(device = %self.session.name(), error = %e, "Option rejected."),
                }
                let _ = respond.send(result);
            }
            ThreadCommand::Identify => self.session.request_identify(),
            ThreadCommand::SetEnabled(enabled) => {
                info!(device = %self.session.name(), enabled, "Device enable changed.");
                self.session.set_enabled(enabled);
            }
        }
    }

    fn publish(&self) {
        *self.status.write() = self.session.snapshot();
    }
}

/// Cloneable control surface for one device thread.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    name: String,
    commands: mpsc::Sender<ThreadCommand>,
    status: Arc<RwLock<SessionSnapshot>>,
    restart: RestartSignal,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply an option at the next cycle boundary and wait for the verdict.
    pub async fn set_option(&self, name: &str, value: &str) -> Result<Applied, ThreadError> {
        let (respond, response) = oneshot::channel();
        self.commands
            .send(ThreadCommand::SetOption {
                name: name.to_string(),
                value: value.to_string(),
                respond,
            })
            .await
            .map_err(|_| ThreadError::Disconnected)?;
        let applied = response.await.map_err(|_| ThreadError::Disconnected)??;
        Ok(applied)
    }

    pub async fn identify(&self) -> Result<(), ThreadError> {
        self.send(ThreadCommand::Identify).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ThreadError> {
        self.send(ThreadCommand::SetEnabled(enabled)).await
    }

    async fn send(&self, command: ThreadCommand) -> Result<(), ThreadError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ThreadError::Disconnected)
    }

    /// Snapshot as of the last completed cycle or command.
    pub fn status(&self) -> SessionSnapshot {
        self.status.read().clone()
    }

    /// Tell the device thread that the job it is waiting on is stale.
    pub fn restart(&self) {
        self.restart.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DeviceVariant};
    use crate::host::{ChannelHost, DeviceEvent};
    use crate::icarus::job::tests::{genesis_job, unsolved_job, GENESIS_NONCE};
    use crate::icarus::session::Phase;
    use crate::serial::testing::QueueOpener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn hashes_done(hashes: u64) -> DeviceEvent {
        DeviceEvent::HashesDone {
            device: "dev".into(),
            hashes,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drives_jobs_and_takes_commands() {
        let opener = QueueOpener::default();
        let mut device = opener.push_duplex();
        let config = DeviceConfig::new(DeviceVariant::Icarus);
        let mut session = Session::new("dev", config, Arc::new(opener.clone()));
        session.prepare().await.unwrap();

        let (job_tx, job_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let running = CancellationToken::new();
        let (thread, handle) =
            IcarusThread::new(session, ChannelHost::new("dev", job_rx, event_tx), running.clone());
        let task = tokio::spawn(thread.run());

        job_tx.send(Arc::new(genesis_job(1))).await.unwrap();
        assert_eq!(event_rx.recv().await, Some(hashes_done(0)));
        let mut frame = [0u8; 64];
        device.read_exact(&mut frame).await.unwrap();

        device.write_all(&GENESIS_NONCE.to_be_bytes()).await.unwrap();
        job_tx.send(Arc::new(unsolved_job(2))).await.unwrap();
        assert_eq!(
            event_rx.recv().await,
            Some(DeviceEvent::Candidate {
                device: "dev".into(),
                job_id: 1,
                nonce: GENESIS_NONCE,
            })
        );
        assert!(matches!(
            event_rx.recv().await,
            Some(DeviceEvent::HashesDone { .. })
        ));

        assert!(matches!(
            handle.set_option("baud", "1").await,
            Err(ThreadError::Config(_))
        ));
        let applied = handle.set_option("timing", "short").await.unwrap();
        assert!(applied.changed);
        assert_eq!(handle.status().timing_mode, "short");
        assert_eq!(handle.status().counters.solutions, 1);

        running.cancel();
        task.await.unwrap();
        assert_eq!(handle.status().phase, Phase::Closed);
        assert!(matches!(
            handle.identify().await,
            Err(ThreadError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_backs_off() {
        let opener = QueueOpener::default();
        let session = Session::new(
            "dev",
            DeviceConfig::new(DeviceVariant::DualSha256),
            Arc::new(opener.clone()),
        );
        let (job_tx, job_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let running = CancellationToken::new();
        let (thread, _handle) =
            IcarusThread::new(session, ChannelHost::new("dev", job_rx, event_tx), running.clone());
        let task = tokio::spawn(thread.run());

        let job = Arc::new(crate::icarus::job::Job::from_header(7, [0; 80], [0; 32]));
        job_tx.send(job.clone()).await.unwrap();
        assert!(matches!(
            event_rx.recv().await,
            Some(DeviceEvent::CommsError { .. })
        ));

        let start = time::Instant::now();
        job_tx.send(job).await.unwrap();
        assert!(matches!(
            event_rx.recv().await,
            Some(DeviceEvent::CommsError { .. })
        ));
        assert!(time::Instant::now() - start >= REOPEN_BACKOFF);
        assert_eq!(opener.opens(), 2);

        drop(job_tx);
        task.await.unwrap();
    }
}
