//! Whole-cycle behavior against scripted links.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{self, Instant};

use super::job::tests::{genesis_job, unsolved_job, GENESIS_NONCE};
use super::job::Job;
use super::reply::RestartSignal;
use super::session::{CycleOutcome, CycleReport, Phase, Session, SessionError, IDENTIFY_SETTLE};
use crate::config::{DeviceConfig, DeviceVariant, READ_COUNT_TIMING, TICK};
use crate::host::testing::{HostCall, RecordingHost};
use crate::serial::testing::{BrokenLink, QueueOpener};

struct Rig {
    opener: QueueOpener,
    session: Session,
    host: RecordingHost,
    restart: RestartSignal,
}

impl Rig {
    fn icarus(opener: QueueOpener, options: &[(&str, &str)]) -> Self {
        let mut config = DeviceConfig::new(DeviceVariant::Icarus);
        for (name, value) in options {
            config.apply_option(name, value).unwrap();
        }
        Self {
            session: Session::new("rig", config, Arc::new(opener.clone())),
            opener,
            host: RecordingHost::default(),
            restart: RestartSignal::new(),
        }
    }

    async fn cycle(&mut self, job: Job) -> Result<CycleReport, SessionError> {
        self.session
            .scan_cycle(Arc::new(job), &mut self.host, &self.restart)
            .await
    }

    fn current_id(&self) -> Option<u64> {
        self.session.slots().current().map(|j| j.id)
    }

    fn previous_id(&self) -> Option<u64> {
        self.session.slots().previous().map(|j| j.id)
    }
}

async fn read_job(device: &mut DuplexStream) -> Vec<u8> {
    let mut frame = vec![0u8; 64];
    device.read_exact(&mut frame).await.unwrap();
    frame
}

async fn send_nonce(device: &mut DuplexStream, nonce: u32) {
    device.write_all(&nonce.to_be_bytes()).await.unwrap();
}

fn genesis_hashes() -> u64 {
    ((GENESIS_NONCE & 0x7fff_ffff) as u64 + 1) * 2
}

#[tokio::test(start_paused = true)]
async fn timeout_then_straggling_solution() {
    let opener = QueueOpener::default();
    let mut first = opener.push_duplex();
    let mut second = opener.push_duplex();
    let _third = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[("work_division", "2")]);
    rig.session.prepare().await.unwrap();

    let report = rig.cycle(genesis_job(1)).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Started);
    assert!(report.job_started);
    assert_eq!(rig.host.take(), vec![HostCall::HashesDone(0)]);
    assert_eq!(read_job(&mut first).await.len(), 64);

    // Nothing comes back: the window runs out and the work is estimated.
    let t0 = Instant::now();
    let report = rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Timeout);
    assert_eq!(Instant::now() - t0, TICK * READ_COUNT_TIMING);
    match rig.host.take().as_slice() {
        [HostCall::HashesDone(hashes)] => assert!(*hashes > 1_000_000_000, "{hashes}"),
        other => panic!("unexpected calls {other:?}"),
    }
    assert_eq!(rig.current_id(), Some(2));
    assert_eq!(rig.previous_id(), Some(1));
    assert_eq!(rig.opener.opens(), 2, "timeout policy reopens");
    read_job(&mut second).await;

    // The first job's answer turns up while the second is running.
    send_nonce(&mut second, GENESIS_NONCE).await;
    let t1 = Instant::now();
    let report = rig.cycle(unsolved_job(3)).await.unwrap();
    assert_eq!(report.solutions, 1);
    assert_eq!(report.outcome, CycleOutcome::Timeout);
    assert_eq!(Instant::now() - t1, TICK * READ_COUNT_TIMING);
    let calls = rig.host.take();
    assert_eq!(
        calls[0],
        HostCall::Candidate {
            job_id: 1,
            nonce: GENESIS_NONCE
        }
    );
    assert!(matches!(calls[1..], [HostCall::HashesDone(_)]));
    assert_eq!(rig.current_id(), Some(3));
    assert_eq!(rig.previous_id(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn solution_counts_nonce_position() {
    let opener = QueueOpener::default();
    let mut device = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[]);
    rig.session.prepare().await.unwrap();

    rig.cycle(genesis_job(1)).await.unwrap();
    rig.host.take();
    read_job(&mut device).await;

    send_nonce(&mut device, GENESIS_NONCE).await;
    let report = rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(
        report.outcome,
        CycleOutcome::Solution {
            job_id: 1,
            nonce: GENESIS_NONCE
        }
    );
    assert_eq!(report.hashes, genesis_hashes());
    assert_eq!(
        rig.host.take(),
        vec![
            HostCall::Candidate {
                job_id: 1,
                nonce: GENESIS_NONCE
            },
            HostCall::HashesDone(genesis_hashes()),
        ]
    );
    assert_eq!(rig.opener.opens(), 1);
    assert_eq!(rig.session.counters().solutions, 1);
}

#[tokio::test(start_paused = true)]
async fn restart_skips_the_next_wait() {
    let opener = QueueOpener::default();
    let mut device = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[]);
    rig.session.prepare().await.unwrap();

    rig.cycle(genesis_job(1)).await.unwrap();
    rig.host.take();
    read_job(&mut device).await;

    let raiser = rig.restart.clone();
    tokio::spawn(async move {
        time::sleep(Duration::from_secs(1)).await;
        raiser.raise();
    });
    let report = rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Restarted);
    assert_eq!(report.hashes, 0);
    assert!(!report.job_started);
    assert_eq!(rig.host.take(), vec![HostCall::HashesDone(0)]);
    assert!(rig.session.change_work());
    assert_eq!(rig.current_id(), Some(1));

    let t0 = Instant::now();
    let report = rig.cycle(unsolved_job(3)).await.unwrap();
    assert_eq!(Instant::now(), t0, "replay must not wait");
    assert_eq!(report.outcome, CycleOutcome::Replayed);
    assert!(report.hashes > 0);
    assert!(!rig.session.change_work());
    assert_eq!(rig.current_id(), Some(3));
    assert_eq!(rig.previous_id(), Some(1));

    // The aborted job was never sent.
    let frame = read_job(&mut device).await;
    let expected = super::codec::JobCodec::new(super::codec::FrameLayout::Icarus64)
        .frame(&unsolved_job(3))
        .unwrap();
    assert_eq!(frame, expected.to_vec());
}

#[tokio::test(start_paused = true)]
async fn every_link_error_reopens_once() {
    let opener = QueueOpener::default();
    for _ in 0..11 {
        opener.push(Box::new(BrokenLink));
    }
    let mut rig = Rig::icarus(opener, &[]);
    rig.session.prepare().await.unwrap();
    rig.cycle(genesis_job(0)).await.unwrap();
    rig.host.take();

    for i in 1..=10 {
        let report = rig.cycle(genesis_job(i)).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::LinkError);
        assert!(report.job_started);
        assert_eq!(rig.opener.opens(), 1 + i as usize);
        let calls = rig.host.take();
        assert_eq!(calls[0], HostCall::CommsError);
        assert!(matches!(calls[1..], [HostCall::HashesDone(_)]));
    }

    // Out of links: the reopen fails and the session starts over.
    let err = rig.cycle(genesis_job(11)).await.unwrap_err();
    assert!(matches!(err, SessionError::ReopenFailed(_)));
    assert_eq!(rig.session.phase(), Phase::Bootstrapping);
    assert_eq!(rig.opener.opens(), 12);

    let err = rig.cycle(genesis_job(12)).await.unwrap_err();
    assert!(matches!(err, SessionError::ReopenFailed(_)));
    assert_eq!(rig.opener.opens(), 13);
    assert!(rig.host.take().contains(&HostCall::CommsError));
}

#[tokio::test(start_paused = true)]
async fn mismatch_is_never_submitted() {
    let opener = QueueOpener::default();
    let mut device = opener.push_duplex();
    let _replacement = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[]);
    rig.session.prepare().await.unwrap();

    rig.cycle(unsolved_job(1)).await.unwrap();
    rig.host.take();
    read_job(&mut device).await;

    send_nonce(&mut device, GENESIS_NONCE).await;
    let report = rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(
        report.outcome,
        CycleOutcome::HardwareMismatch {
            nonce: GENESIS_NONCE
        }
    );
    let calls = rig.host.take();
    assert_eq!(
        calls[0],
        HostCall::HardwareError {
            nonce: GENESIS_NONCE
        }
    );
    assert!(!calls
        .iter()
        .any(|c| matches!(c, HostCall::Candidate { .. })));
    assert_eq!(rig.session.counters().hardware_errors, 1);
    assert_eq!(rig.opener.opens(), 2, "one hardware error reopens by default");
}

#[tokio::test(start_paused = true)]
async fn continue_search_listens_out_the_window() {
    let opener = QueueOpener::default();
    let mut device = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[("continue_search", "true"), ("reopen", "never")]);
    rig.session.prepare().await.unwrap();

    rig.cycle(genesis_job(1)).await.unwrap();
    rig.host.take();
    read_job(&mut device).await;

    send_nonce(&mut device, GENESIS_NONCE).await;
    let t0 = Instant::now();
    let report = rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Timeout);
    assert_eq!(report.solutions, 1);
    assert_eq!(Instant::now() - t0, TICK * READ_COUNT_TIMING);
}

#[tokio::test(start_paused = true)]
async fn identify_holds_new_work() {
    let opener = QueueOpener::default();
    let device = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[("reopen", "never")]);
    rig.session.prepare().await.unwrap();

    let t0 = Instant::now();
    rig.cycle(genesis_job(1)).await.unwrap();
    rig.host.take();

    // A late answer for the running job, well inside its search window.
    tokio::spawn(async move {
        let mut device = device;
        read_job(&mut device).await;
        time::sleep(Duration::from_secs(8)).await;
        send_nonce(&mut device, GENESIS_NONCE).await;
        time::sleep(Duration::from_secs(3_600)).await;
    });

    rig.session.request_identify();
    let report = rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Timeout);
    assert!(report.job_started);

    let fullnonce = rig.session.snapshot().fullnonce;
    let held = Instant::now() - t0;
    assert!(
        held >= Duration::from_secs_f64(fullnonce - 0.3) + IDENTIFY_SETTLE,
        "held only {held:?}"
    );
    let calls = rig.host.take();
    assert!(matches!(calls[0], HostCall::HashesDone(_)));
    assert_eq!(
        calls[1],
        HostCall::Candidate {
            job_id: 1,
            nonce: GENESIS_NONCE
        }
    );
    assert!(!rig.session.snapshot().identify_pending);
    assert_eq!(rig.current_id(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn only_a_changed_baud_reopens() {
    let opener = QueueOpener::default();
    let _first = opener.push_duplex();
    let _second = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[("reopen", "never")]);
    rig.session.prepare().await.unwrap();
    rig.cycle(genesis_job(1)).await.unwrap();

    rig.session.apply_option("baud", "57600").unwrap();
    rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(rig.opener.opens(), 2);

    rig.session.apply_option("baud", "57600").unwrap();
    rig.cycle(unsolved_job(3)).await.unwrap();
    assert_eq!(rig.opener.opens(), 2);
    assert_eq!(rig.session.counters().reopens, 1);
}

#[tokio::test(start_paused = true)]
async fn cycle_policy_reopens_after_every_start() {
    let opener = QueueOpener::default();
    let _links: Vec<_> = (0..3).map(|_| opener.push_duplex()).collect();
    let mut rig = Rig::icarus(opener, &[("reopen", "cycle")]);
    rig.session.prepare().await.unwrap();

    rig.cycle(genesis_job(1)).await.unwrap();
    assert_eq!(rig.opener.opens(), 2);
    rig.cycle(unsolved_job(2)).await.unwrap();
    assert_eq!(rig.opener.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn disabled_session_idles() {
    let opener = QueueOpener::default();
    let _device = opener.push_duplex();
    let mut rig = Rig::icarus(opener, &[]);
    rig.session.prepare().await.unwrap();

    rig.session.set_enabled(false);
    let report = rig.cycle(genesis_job(1)).await.unwrap();
    assert!(!report.job_started);
    assert_eq!(rig.session.phase(), Phase::Bootstrapping);
    assert_eq!(rig.current_id(), None);

    rig.session.set_enabled(true);
    let t0 = Instant::now();
    let report = rig.cycle(genesis_job(2)).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Started);
    assert_eq!(Instant::now(), t0);
    assert_eq!(rig.current_id(), Some(2));
}
