//! The per-device polling state machine.
//!
//! One call to [`Session::scan_cycle`] is one cycle: wait for the reply to the
//! job already running, classify it, account for the work done, write the
//! caller's job, and reopen the link if policy says so. The session owns the
//! link outright; nothing else reads or writes it while a cycle runs.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::{self, Instant};

use super::codec::{CodecError, JobCodec};
use super::job::{Job, JobSlots};
use super::probe::{self, ProbeError};
use super::recovery::{AutoClassifier, RecoveryPolicy, ReopenReason, Verdict};
use super::reply::{ReadOutcome, ReplyReader, RestartSignal};
use super::timing::{
    estimate_hashes, read_count_for, HashCountMode, LinearFit, Sample, TimingCalibrator,
};
use super::validate::{validate, DeviceTrust, NonceVerifier, Sha256dVerifier, Validation};
use crate::config::{
    Applied, ConfigError, DeviceConfig, DeviceVariant, ReopenPolicy, Timing, READ_COUNT_TIMING,
    TICK,
};
use crate::host::WorkHost;
use crate::serial::{Link, LinkOpener};
use crate::tracing::prelude::*;
use crate::types::HashRate;

/// Idle time after an identify hold, before work resumes.
pub const IDENTIFY_SETTLE: Duration = Duration::from_secs(3);

// The identify hold ends this long before the search space would run out.
const IDENTIFY_MARGIN: f64 = 0.1;

const NONCE_SPACE: f64 = 4_294_967_296.0;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not reopen link: {0}")]
    ReopenFailed(io::Error),

    #[error("job rejected: {0}")]
    Job(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No job in flight.
    Bootstrapping,
    AwaitingReply,
    Deciding,
    Submitting,
    /// Holding off new work while the device identifies itself.
    Identifying,
    Closed,
}

/// How a cycle's wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was in flight; the job was simply started.
    Started,
    Solution { job_id: u64, nonce: u32 },
    HardwareMismatch { nonce: u32 },
    Timeout,
    LinkError,
    /// The wait was cut short; the next cycle replays without waiting.
    Restarted,
    /// This cycle skipped the wait because the previous one was restarted.
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Hashes reported to the host for this cycle.
    pub hashes: u64,
    /// Candidates submitted during the cycle, stragglers included.
    pub solutions: u32,
    /// The caller's job was written to the device.
    pub job_started: bool,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Counters {
    pub hardware_errors: u64,
    pub solutions: u64,
    pub comms_errors: u64,
    pub reopens: u64,
}

/// Read-only view of a session, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub name: String,
    pub variant: DeviceVariant,
    pub phase: Phase,
    pub enabled: bool,
    pub identify_pending: bool,
    pub baud: u32,
    pub work_division: u32,
    pub fpga_count: u32,
    pub timing_mode: &'static str,
    pub is_timing: bool,
    pub read_count: u32,
    pub read_count_limit: u32,
    pub fullnonce: f64,
    pub hashrate: HashRate,
    pub hs: Option<f64>,
    pub w: Option<f64>,
    /// Closed history entries in the last fit.
    pub count: usize,
    pub total_values: u32,
    pub range: u64,
    pub history_count: u64,
    pub history_time_ms: u64,
    pub min_data_count: u32,
    /// Samples in the history entry still open.
    pub timing_values: u32,
    #[serde(flatten)]
    pub counters: Counters,
}

// How the reply wait ended, before any accounting.
enum WaitEnd {
    Solution {
        job: Arc<Job>,
        nonce: u32,
        at: Instant,
    },
    Mismatch {
        nonce: u32,
        at: Instant,
    },
    Timeout {
        at: Instant,
    },
    LinkError(io::Error),
    Restarted {
        at: Instant,
    },
}

pub struct Session {
    name: String,
    config: DeviceConfig,
    opener: Arc<dyn LinkOpener>,
    link: Option<Link>,
    reader: ReplyReader,
    codec: JobCodec,
    verifier: Box<dyn NonceVerifier>,
    slots: JobSlots,
    phase: Phase,
    first_run: bool,
    change_work: bool,
    enabled: bool,
    identify_pending: bool,
    job_started_at: Option<Instant>,
    aborted_at: Option<Instant>,
    read_count: u32,
    /// Nominal until measured.
    hashrate: HashRate,
    fullnonce: f64,
    fit: Option<LinearFit>,
    calibrator: TimingCalibrator,
    classifier: AutoClassifier,
    recovery: RecoveryPolicy,
    counters: Counters,
}

impl Session {
    pub fn new(name: impl Into<String>, config: DeviceConfig, opener: Arc<dyn LinkOpener>) -> Self {
        let verifier: Box<dyn NonceVerifier> = match config.variant {
            DeviceVariant::DualScrypt => Box::new(DeviceTrust),
            _ => Box::new(Sha256dVerifier),
        };
        Self {
            name: name.into(),
            codec: JobCodec::new(config.variant.frame_layout()),
            read_count: config.initial_read_count(),
            hashrate: HashRate::from_hash_time(config.hash_time()),
            fullnonce: config.hash_time() * NONCE_SPACE,
            calibrator: TimingCalibrator::new(&config.timing),
            classifier: AutoClassifier::new(config.auto_classify()),
            config,
            opener,
            link: None,
            reader: ReplyReader::new(),
            verifier,
            slots: JobSlots::default(),
            phase: Phase::Bootstrapping,
            first_run: true,
            change_work: false,
            enabled: true,
            identify_pending: false,
            job_started_at: None,
            aborted_at: None,
            fit: None,
            recovery: RecoveryPolicy::new(),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn slots(&self) -> &JobSlots {
        &self.slots
    }

    pub fn change_work(&self) -> bool {
        self.change_work
    }

    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Open the link and, if configured, ask the device for its work
    /// division.
    pub async fn prepare(&mut self) -> Result<(), SessionError> {
        let mut link = self
            .opener
            .open(self.config.baud)
            .await
            .map_err(SessionError::ReopenFailed)?;

        if self.config.autodetect_work_division {
            let division = probe::probe_work_division(link.as_mut(), self.config.reply_size).await;
            match self.config.apply_option("work_division", &division.to_string()) {
                Ok(applied) if applied.retime => self.retime(),
                Ok(_) => {}
                Err(e) => warn!(device = %self.name, error = %e, "Detected work division rejected."),
            }
        }

        info!(
            device = %self.name,
            link = %self.opener.describe(),
            variant = %self.config.variant,
            baud = self.config.baud,
            work_division = %self.config.work_division,
            fpga_count = self.config.fpga_count,
            read_count = self.read_count,
            timing = %self.config.timing,
            "Session ready."
        );

        self.link = Some(link);
        self.reader.reset();
        self.first_run = true;
        self.phase = Phase::Bootstrapping;
        Ok(())
    }

    /// Build, prepare and detect in one go, for callers that want a session
    /// known to be talking to the right hardware.
    pub async fn open(
        name: impl Into<String>,
        config: DeviceConfig,
        opener: Arc<dyn LinkOpener>,
    ) -> crate::error::Result<Self> {
        let mut session = Self::new(name, config, opener);
        session.prepare().await?;
        session.detect().await?;
        info!(device = %session.name, variant = %session.config.variant, "Device detected.");
        Ok(session)
    }

    /// Run the golden-nonce test on the open link.
    pub async fn detect(&mut self) -> Result<(), ProbeError> {
        let link = self.link.as_mut().ok_or_else(|| {
            ProbeError::Io(io::Error::new(io::ErrorKind::NotConnected, "link not open"))
        })?;
        probe::detect(link.as_mut(), &self.config).await
    }

    /// Apply one runtime option; see [`DeviceConfig::apply_option`].
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<Applied, ConfigError> {
        let applied = self.config.apply_option(name, value)?;
        self.applied(applied);
        Ok(applied)
    }

    /// Apply a positional `baud:work_division:fpga_count:reopen` string.
    pub fn apply_option_list(&mut self, list: &str) -> Result<Applied, ConfigError> {
        let applied = self.config.apply_option_list(list)?;
        self.applied(applied);
        Ok(applied)
    }

    fn applied(&mut self, applied: Applied) {
        if applied.reopen_now {
            self.recovery.request_reopen();
        }
        if applied.retime {
            self.retime();
        }
        if applied.changed {
            debug!(device = %self.name, "Configuration changed.");
        }
    }

    // Throw away everything learned about the device's speed.
    fn retime(&mut self) {
        self.read_count = self.config.initial_read_count();
        self.hashrate = HashRate::from_hash_time(self.config.hash_time());
        self.fullnonce = self.config.hash_time() * NONCE_SPACE;
        self.fit = None;
        self.calibrator = TimingCalibrator::new(&self.config.timing);
        self.classifier = AutoClassifier::new(self.config.auto_classify());
    }

    /// Stop or resume starting jobs. A disabled session finishes the cycle it
    /// is in and then idles in `Bootstrapping`.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Hold new work at the next cycle so the device can identify itself.
    pub fn request_identify(&mut self) {
        self.identify_pending = true;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let estimate = self.calibrator.last_estimate();
        SessionSnapshot {
            name: self.name.clone(),
            variant: self.config.variant,
            phase: self.phase,
            enabled: self.enabled,
            identify_pending: self.identify_pending,
            baud: self.config.baud,
            work_division: self.config.work_division.get(),
            fpga_count: self.config.fpga_count,
            timing_mode: self.config.timing.mode_name(),
            is_timing: self.calibrator.is_enabled(),
            read_count: self.read_count,
            read_count_limit: self.calibrator.limit(),
            fullnonce: self.fullnonce,
            hashrate: self.hashrate,
            hs: self.fit.map(|f| f.hs),
            w: self.fit.map(|f| f.w),
            count: estimate.map_or(0, |e| e.count),
            total_values: estimate.map_or(0, |e| e.values),
            range: estimate.map_or(0, |e| e.range),
            history_count: self.calibrator.history_count(),
            history_time_ms: self.calibrator.history_time().as_millis() as u64,
            min_data_count: self.calibrator.min_data_count(),
            timing_values: self.calibrator.open_values(),
            counters: self.counters,
        }
    }

    /// Close the link and forget the jobs in flight.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(device = %self.name, "Link closed.");
        }
        self.reader.reset();
        self.slots.clear();
        self.job_started_at = None;
        self.phase = Phase::Closed;
    }

    /// Drive one cycle, ending with `job` running on the device.
    ///
    /// Returns `Err` only when the job is malformed or the link could not be
    /// reacquired; the session is then back in `Bootstrapping` and the next
    /// call starts afresh.
    pub async fn scan_cycle<H>(
        &mut self,
        job: Arc<Job>,
        host: &mut H,
        restart: &RestartSignal,
    ) -> Result<CycleReport, SessionError>
    where
        H: WorkHost + ?Sized,
    {
        let frame = self.codec.frame(&job)?;

        if self.link.is_none() {
            self.first_run = true;
            self.recover(ReopenReason::LinkError, host).await?;
        }

        let solutions_before = self.counters.solutions;
        let started_at = self.job_started_at;

        let (outcome, hashes) = if self.first_run {
            self.change_work = false;
            (CycleOutcome::Started, 0)
        } else if self.change_work {
            self.change_work = false;
            let elapsed = elapsed_between(started_at, self.aborted_at.take());
            (CycleOutcome::Replayed, estimate_hashes(elapsed, self.hashrate.as_per_second()))
        } else {
            self.phase = Phase::AwaitingReply;
            let end = self.wait_for_reply(host, restart).await;
            self.phase = Phase::Deciding;
            match end {
                WaitEnd::Restarted { at } => {
                    debug!(device = %self.name, "Work restart, abandoning wait.");
                    self.change_work = true;
                    self.aborted_at = Some(at);
                    host.report_hashes_done(0).await;
                    return Ok(CycleReport {
                        outcome: CycleOutcome::Restarted,
                        hashes: 0,
                        solutions: (self.counters.solutions - solutions_before) as u32,
                        job_started: false,
                    });
                }
                WaitEnd::Solution { job, nonce, at } => {
                    let elapsed = elapsed_between(started_at, Some(at));
                    let hashes = self.account_solution(nonce, elapsed, started_at);
                    (
                        CycleOutcome::Solution {
                            job_id: job.id,
                            nonce,
                        },
                        hashes,
                    )
                }
                WaitEnd::Mismatch { nonce, at } => {
                    let elapsed = elapsed_between(started_at, Some(at));
                    (
                        CycleOutcome::HardwareMismatch { nonce },
                        estimate_hashes(elapsed, self.hashrate.as_per_second()),
                    )
                }
                WaitEnd::Timeout { at } => {
                    let elapsed = elapsed_between(started_at, Some(at));
                    let hashes = estimate_hashes(elapsed, self.hashrate.as_per_second());
                    self.sample_timeout(hashes, elapsed, started_at);
                    (CycleOutcome::Timeout, hashes)
                }
                WaitEnd::LinkError(e) => {
                    warn!(device = %self.name, error = %e, "Link error while waiting for reply.");
                    self.counters.comms_errors += 1;
                    host.report_comms_error(&e.to_string()).await;
                    let elapsed = elapsed_between(started_at, Some(Instant::now()));
                    (CycleOutcome::LinkError, estimate_hashes(elapsed, self.hashrate.as_per_second()))
                }
            }
        };

        host.report_hashes_done(hashes).await;

        match outcome {
            CycleOutcome::LinkError => self.recover(ReopenReason::LinkError, host).await?,
            CycleOutcome::Timeout if RecoveryPolicy::reopen_on_timeout(self.config.reopen) => {
                self.recover(ReopenReason::Timeout, host).await?
            }
            _ => {}
        }
        if self.config.reopen != ReopenPolicy::Cycle {
            if let Some(reason) = self.recovery.take_request() {
                self.recover(reason, host).await?;
            }
        }

        let job_started = if self.identify_pending {
            self.hold_for_identify(job, frame, host, restart).await
        } else if !self.enabled {
            self.first_run = true;
            self.phase = Phase::Bootstrapping;
            false
        } else {
            self.start_job(job, &frame, host).await
        };

        if self.config.reopen == ReopenPolicy::Cycle {
            self.recovery.take_request();
            self.recover(ReopenReason::Cycle, host).await?;
        }

        Ok(CycleReport {
            outcome,
            hashes,
            solutions: (self.counters.solutions - solutions_before) as u32,
            job_started,
        })
    }

    // Read replies until the wait ends, submitting stragglers as they come.
    async fn wait_for_reply<H>(&mut self, host: &mut H, restart: &RestartSignal) -> WaitEnd
    where
        H: WorkHost + ?Sized,
    {
        let window_end = Instant::now() + TICK * self.read_count;
        loop {
            let Some(link) = self.link.as_mut() else {
                return WaitEnd::LinkError(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "link not open",
                ));
            };

            let outcome = self
                .reader
                .read_until(&mut **link, self.config.reply_size, window_end, Some(restart))
                .await;
            let (frame, at) = match outcome {
                ReadOutcome::Reply {
                    frame,
                    first_byte_at,
                } => (frame, first_byte_at),
                ReadOutcome::Timeout { at } => return WaitEnd::Timeout { at },
                ReadOutcome::LinkError(e) => return WaitEnd::LinkError(e),
                ReadOutcome::Restarted { at } => return WaitEnd::Restarted { at },
            };

            match self.take_reply(&frame, host).await {
                Some((nonce, Validation::Current(job))) if !self.config.continue_search => {
                    return WaitEnd::Solution { job, nonce, at };
                }
                Some((nonce, Validation::Mismatch)) => return WaitEnd::Mismatch { nonce, at },
                // A straggler for the previous job, or more from the current
                // one: keep listening for the rest of the window.
                _ => continue,
            }
        }
    }

    // Validate one reply and pass it on to the host.
    async fn take_reply<H>(&mut self, frame: &[u8], host: &mut H) -> Option<(u32, Validation)>
    where
        H: WorkHost + ?Sized,
    {
        let Some(nonce) = self.config.variant.nonce_order().decode(frame) else {
            warn!(device = %self.name, len = frame.len(), "Reply too short for a nonce.");
            return None;
        };

        let validation = validate(&self.slots, nonce, self.verifier.as_ref());
        match &validation {
            Validation::Current(job) | Validation::Previous(job) => {
                debug!(
                    device = %self.name,
                    job = job.id,
                    nonce = %format_args!("{nonce:08x}"),
                    previous = matches!(validation, Validation::Previous(_)),
                    "Nonce found."
                );
                self.counters.solutions += 1;
                host.submit_candidate(job, nonce).await;
            }
            Validation::Mismatch => {
                self.counters.hardware_errors += 1;
                host.report_hardware_error(self.slots.current(), nonce).await;
                if self.recovery.note_hardware_error(self.config.hw_error_reopen) {
                    debug!(device = %self.name, "Hardware error threshold reached.");
                }
                warn!(
                    device = %self.name,
                    nonce = %format_args!("{nonce:08x}"),
                    "Nonce matches no job in flight."
                );
            }
        }
        Some((nonce, validation))
    }

    // Hashes for a solution, plus the timing and speed-check side effects.
    fn account_solution(&mut self, nonce: u32, elapsed: Duration, started_at: Option<Instant>) -> u64 {
        let mode = self.config.hash_count_mode();
        let hashes = mode.hashes_for(nonce);

        if let HashCountMode::UnitRatio { .. } = mode {
            if !elapsed.is_zero() {
                self.hashrate = HashRate::from_hashes(hashes, elapsed);
            }
        }

        if let Some(started_at) = started_at {
            let sample = Sample {
                started_at,
                elapsed,
                hashes,
                position: nonce & self.config.nonce_mask(),
            };
            self.record_sample(sample, self.config.transfer_time());
        }

        if let Some(verdict) = self.classifier.observe(hashes, elapsed) {
            self.apply_verdict(verdict);
        }
        hashes
    }

    fn sample_timeout(&mut self, hashes: u64, elapsed: Duration, started_at: Option<Instant>) {
        let Some(started_at) = started_at else {
            return;
        };
        let mask = self.config.nonce_mask();
        let sample = Sample {
            started_at,
            elapsed,
            hashes,
            position: self.config.hash_count_mode().position_for(hashes, mask),
        };
        self.record_sample(sample, Duration::ZERO);
    }

    fn record_sample(&mut self, sample: Sample, transfer: Duration) {
        let Some(estimate) = self.calibrator.record(sample, self.config.nonce_mask(), transfer)
        else {
            return;
        };
        self.read_count = estimate.read_count;
        self.fullnonce = estimate.fullnonce;
        self.fit = Some(estimate.fit);
        if let HashCountMode::NonceMask { .. } = self.config.hash_count_mode() {
            self.hashrate = HashRate::from_hash_time(estimate.fit.hs);
        }
        info!(
            device = %self.name,
            read_count = self.read_count,
            fullnonce = %format_args!("{:.3}s", self.fullnonce),
            rate = %self.hashrate,
            "Poll window re-estimated."
        );
    }

    fn apply_verdict(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Unrecognized { mhs, too_fast } => {
                warn!(
                    device = %self.name,
                    mhs,
                    too_fast,
                    "Speed outside the Icarus envelope, switching to short timing."
                );
                self.config.timing = Timing::Short { limit: 0 };
                self.calibrator.enable_short();
                self.read_count = READ_COUNT_TIMING;
            }
            Verdict::Nominal { last: false, .. } => {}
            Verdict::Nominal { mhs, last: true } => {
                self.read_count = read_count_for(self.fullnonce);
                info!(
                    device = %self.name,
                    mhs,
                    read_count = self.read_count,
                    "Icarus speed confirmed."
                );
            }
            Verdict::Cairnsmore { mhs } => {
                self.config.variant = DeviceVariant::Cairnsmore;
                self.hashrate = HashRate::from_hash_time(self.config.hash_time());
                self.fullnonce = self.config.hash_time() * NONCE_SPACE;
                self.read_count = read_count_for(self.fullnonce);
                info!(
                    device = %self.name,
                    mhs,
                    read_count = self.read_count,
                    "Detected Cairnsmore1 speed, relabelling device."
                );
            }
        }
    }

    // Write the job and rotate it into the slots.
    async fn start_job<H>(&mut self, job: Arc<Job>, frame: &Bytes, host: &mut H) -> bool
    where
        H: WorkHost + ?Sized,
    {
        self.phase = Phase::Submitting;
        let result = match self.link.as_mut() {
            Some(link) => write_frame(link, frame).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "link not open")),
        };

        match result {
            Ok(()) => {
                trace!(device = %self.name, job = job.id, frame = %hex::encode(frame), "Job sent.");
                let now = Instant::now();
                self.job_started_at = Some(now);
                self.reader.job_started(now);
                self.slots.rotate(job);
                self.first_run = false;
                self.phase = Phase::AwaitingReply;
                true
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, "Failed to send job.");
                self.link = None;
                self.first_run = true;
                self.phase = Phase::Bootstrapping;
                self.counters.comms_errors += 1;
                host.report_comms_error(&e.to_string()).await;
                false
            }
        }
    }

    // Let the running job use up its whole search window, reporting what it
    // finds, then idle before starting the next one.
    async fn hold_for_identify<H>(
        &mut self,
        job: Arc<Job>,
        frame: Bytes,
        host: &mut H,
        restart: &RestartSignal,
    ) -> bool
    where
        H: WorkHost + ?Sized,
    {
        self.phase = Phase::Identifying;
        info!(device = %self.name, "Identify requested, holding work.");

        if let Some(started_at) = self.job_started_at.filter(|_| !self.first_run) {
            let hold = (self.fullnonce - IDENTIFY_MARGIN).max(0.0);
            let window_end = started_at + Duration::from_secs_f64(hold);
            loop {
                let left = window_end.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                let Some(link) = self.link.as_mut() else {
                    break;
                };
                match self
                    .reader
                    .read_until(&mut **link, self.config.reply_size, window_end, None)
                    .await
                {
                    ReadOutcome::Reply { frame, .. } => {
                        self.take_reply(&frame, host).await;
                    }
                    ReadOutcome::LinkError(e) => {
                        warn!(device = %self.name, error = %e, "Link error during identify hold.");
                        break;
                    }
                    ReadOutcome::Timeout { .. } | ReadOutcome::Restarted { .. } => break,
                }
            }
        }

        let restarted = tokio::select! {
            _ = time::sleep(IDENTIFY_SETTLE) => false,
            _ = restart.notified() => true,
        };
        self.identify_pending = false;

        if restarted {
            debug!(device = %self.name, "Work restarted during identify, dropping job.");
            self.first_run = true;
            self.phase = Phase::Bootstrapping;
            false
        } else if !self.enabled {
            self.first_run = true;
            self.phase = Phase::Bootstrapping;
            false
        } else {
            self.start_job(job, &frame, host).await
        }
    }

    // Close and reopen the link. On failure the session falls back to
    // bootstrapping and the host hears about it.
    async fn recover<H>(&mut self, reason: ReopenReason, host: &mut H) -> Result<(), SessionError>
    where
        H: WorkHost + ?Sized,
    {
        self.link = None;
        self.reader.reset();
        self.counters.reopens += 1;
        debug!(device = %self.name, %reason, "Reopening link.");

        match self.opener.open(self.config.baud).await {
            Ok(link) => {
                self.link = Some(link);
                self.recovery.reopened();
                Ok(())
            }
            Err(e) => {
                error!(device = %self.name, %reason, error = %e, "Failed to reopen link.");
                self.first_run = true;
                self.phase = Phase::Bootstrapping;
                self.counters.comms_errors += 1;
                host.report_comms_error(&format!("reopen failed: {e}")).await;
                Err(SessionError::ReopenFailed(e))
            }
        }
    }
}

async fn write_frame(link: &mut Link, frame: &[u8]) -> io::Result<()> {
    link.write_all(frame).await?;
    link.flush().await
}

fn elapsed_between(start: Option<Instant>, end: Option<Instant>) -> Duration {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BAUD;
    use crate::host::testing::RecordingHost;
    use crate::icarus::job::tests::{genesis_job, unsolved_job, GENESIS_NONCE};
    use crate::serial::testing::QueueOpener;

    fn session(variant: DeviceVariant, opener: &QueueOpener) -> Session {
        Session::new("test", DeviceConfig::new(variant), Arc::new(opener.clone()))
    }

    #[test]
    fn verifier_follows_variant() {
        let opener = QueueOpener::default();
        let job = unsolved_job(1);
        let scrypt = session(DeviceVariant::DualScrypt, &opener);
        assert!(scrypt.verifier.verify(&job, 1));
        let icarus = session(DeviceVariant::Icarus, &opener);
        assert!(!icarus.verifier.verify(&job, 1));
    }

    #[test]
    fn options_request_reopen_only_on_change() {
        let opener = QueueOpener::default();
        let mut session = session(DeviceVariant::Icarus, &opener);

        session.apply_option("baud", &DEFAULT_BAUD.to_string()).unwrap();
        assert!(!session.recovery.is_requested());

        session.apply_option("baud", "57600").unwrap();
        assert!(session.recovery.is_requested());
        assert!(session.apply_option("baud", "1234").is_err());
        assert_eq!(session.config().baud, 57600);
    }

    #[test]
    fn timing_change_resets_calibration() {
        let opener = QueueOpener::default();
        let mut session = session(DeviceVariant::Icarus, &opener);
        session.read_count = 7;
        session.fit = Some(LinearFit { hs: 1e-9, w: 0.0 });

        session.apply_option("timing", "long=60").unwrap();
        assert_eq!(session.read_count(), READ_COUNT_TIMING);
        let snapshot = session.snapshot();
        assert!(snapshot.is_timing);
        assert_eq!(snapshot.timing_mode, "long");
        assert_eq!(snapshot.read_count_limit, 60);
        assert_eq!(snapshot.hs, None);
    }

    #[test]
    fn cairnsmore_verdict_relabels() {
        let opener = QueueOpener::default();
        let mut session = session(DeviceVariant::Icarus, &opener);
        session.apply_verdict(Verdict::Cairnsmore { mhs: 400.0 });
        assert_eq!(session.config().variant, DeviceVariant::Cairnsmore);
        assert_eq!(session.read_count(), 112);
    }

    #[test]
    fn unrecognized_verdict_starts_calibrating() {
        let opener = QueueOpener::default();
        let mut session = session(DeviceVariant::Icarus, &opener);
        assert!(!session.calibrator.is_enabled());
        session.apply_verdict(Verdict::Unrecognized {
            mhs: 900.0,
            too_fast: true,
        });
        assert!(session.calibrator.is_enabled());
        assert_eq!(session.snapshot().timing_mode, "short");
    }

    #[test]
    fn snapshot_serializes() {
        let opener = QueueOpener::default();
        let session = session(DeviceVariant::DualSha256, &opener);
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["variant"], "dual-sha256");
        assert_eq!(json["phase"], "bootstrapping");
        assert_eq!(json["read_count"], 16);
        assert_eq!(json["hardware_errors"], 0);
    }


    #[tokio::test(start_paused = true)]
    async fn open_runs_the_golden_test() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let opener = QueueOpener::default();
        let mut device = opener.push_duplex();
        tokio::spawn(async move {
            let mut frame = [0u8; 64];
            device.read_exact(&mut frame).await.unwrap();
            device.write_all(&0x0001_87a2u32.to_be_bytes()).await.unwrap();
            time::sleep(Duration::from_secs(1)).await;
        });
        let config = DeviceConfig::new(DeviceVariant::Icarus);
        let session = Session::open("test", config.clone(), Arc::new(opener.clone()))
            .await
            .unwrap();
        assert_eq!(session.phase(), Phase::Bootstrapping);

        let silent = opener.push_duplex();
        let err = Session::open("test", config, Arc::new(opener)).await.err();
        assert!(matches!(
            err,
            Some(crate::error::Error::Probe(ProbeError::NoReply))
        ));
        drop(silent);
    }

    // Wall-clock tests: `Instant::now()` moves between calls here, which a
    // paused clock would hide.
    async fn running_session(opener: &QueueOpener) -> (Session, RecordingHost) {
        let mut session = session(DeviceVariant::Icarus, opener);
        session.prepare().await.unwrap();
        let mut host = RecordingHost::default();
        session
            .scan_cycle(Arc::new(genesis_job(1)), &mut host, &RestartSignal::new())
            .await
            .unwrap();
        host.take();
        (session, host)
    }

    #[tokio::test]
    async fn one_tick_window_reads_waiting_solution() {
        let opener = QueueOpener::default();
        let mut device = opener.push_duplex();
        let (mut session, mut host) = running_session(&opener).await;

        device.write_all(&GENESIS_NONCE.to_be_bytes()).await.unwrap();
        session.read_count = 1;
        let report = session
            .scan_cycle(Arc::new(unsolved_job(2)), &mut host, &RestartSignal::new())
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            CycleOutcome::Solution {
                job_id: 1,
                nonce: GENESIS_NONCE
            }
        );
    }

    #[tokio::test]
    async fn window_runs_its_full_length() {
        let opener = QueueOpener::default();
        let device = opener.push_duplex();
        let _replacement = opener.push_duplex();
        let (mut session, mut host) = running_session(&opener).await;

        // Answer late in the third tick.
        tokio::spawn(async move {
            let mut device = device;
            time::sleep(Duration::from_millis(250)).await;
            device.write_all(&GENESIS_NONCE.to_be_bytes()).await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
        });
        session.read_count = 3;
        let report = session
            .scan_cycle(Arc::new(unsolved_job(2)), &mut host, &RestartSignal::new())
            .await
            .unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Solution { job_id: 1, .. }));

        session.read_count = 3;
        let t0 = Instant::now();
        let report = session
            .scan_cycle(Arc::new(unsolved_job(3)), &mut host, &RestartSignal::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Timeout);
        assert!(Instant::now() - t0 >= TICK * 3, "waited {:?}", Instant::now() - t0);
    }

    #[tokio::test]
    async fn close_forgets_jobs() {
        let opener = QueueOpener::default();
        let _device = opener.push_duplex();
        let mut session = session(DeviceVariant::Icarus, &opener);
        session.prepare().await.unwrap();
        session.slots.rotate(Arc::new(genesis_job(1)));

        session.close();
        assert_eq!(session.phase(), Phase::Closed);
        assert!(session.slots().current().is_none());
        assert!(session.link.is_none());
    }
}
